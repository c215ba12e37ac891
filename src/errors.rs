//! Typed error hierarchy for the quill generator.
//!
//! Four enums cover the failure surfaces of a run:
//! - `BackendError`: transport-level failures inside a generation backend
//! - `GenerationFailure`: structural failures of a single stage invocation
//! - `ContextError`: narrative context invariant violations
//! - `AbortReason`: why a run stopped early (rendered into the run status)

use crate::model::StageKind;
use std::time::Duration;
use thiserror::Error;

/// Errors reported by a `GenerationBackend` implementation.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Request to backend failed: {0}")]
    Request(String),

    #[error("Backend returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Backend response could not be decoded: {0}")]
    Decode(String),

    #[error("Backend is not configured: {0}")]
    NotConfigured(String),

    #[error("Backend has no response scripted for stage {0}")]
    Exhausted(String),
}

/// Structural failure of one stage invocation.
///
/// These are distinct from quality rejections: the stage produced nothing
/// usable, as opposed to producing text the reviewer disliked.
#[derive(Debug, Error)]
pub enum GenerationFailure {
    #[error("{stage} backend call failed: {source}")]
    Backend {
        stage: StageKind,
        #[source]
        source: BackendError,
    },

    #[error("{stage} backend call timed out after {}ms", .timeout.as_millis())]
    Timeout { stage: StageKind, timeout: Duration },

    #[error("{stage} returned empty output")]
    Empty { stage: StageKind },

    #[error("{stage} returned malformed output: {reason}")]
    Malformed { stage: StageKind, reason: String },
}

impl GenerationFailure {
    /// The stage that failed.
    pub fn stage(&self) -> StageKind {
        match self {
            Self::Backend { stage, .. }
            | Self::Timeout { stage, .. }
            | Self::Empty { stage }
            | Self::Malformed { stage, .. } => *stage,
        }
    }

    /// Short machine-readable label for the failure kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Backend { .. } => "backend",
            Self::Timeout { .. } => "timeout",
            Self::Empty { .. } => "empty",
            Self::Malformed { .. } => "malformed",
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub(crate) fn malformed(stage: StageKind, reason: impl Into<String>) -> Self {
        Self::Malformed {
            stage,
            reason: reason.into(),
        }
    }
}

/// Errors from the narrative context.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContextError {
    #[error("Out-of-order commit: expected chapter {expected}, got {got}")]
    OutOfOrderCommit { expected: u32, got: u32 },
}

/// Why a run terminated before finishing its outline or reaching its target.
///
/// The `Display` form is the suffix of the `aborted:<reason>` run status.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AbortReason {
    #[error("planning_failed")]
    PlanningFailed { detail: String },

    #[error("outlining_failed")]
    OutliningFailed { detail: String },

    #[error("quality_exhausted")]
    QualityExhausted { chapter: u32 },

    #[error("invariant_violation")]
    InvariantViolation(ContextError),

    #[error("cancelled")]
    Cancelled,
}

impl AbortReason {
    /// Human-readable cause behind the status suffix, when there is one.
    pub fn detail(&self) -> Option<String> {
        match self {
            Self::PlanningFailed { detail } | Self::OutliningFailed { detail } => Some(detail.clone()),
            Self::QualityExhausted { chapter } => Some(format!("chapter {} spent its retry budget", chapter)),
            Self::InvariantViolation(e) => Some(e.to_string()),
            Self::Cancelled => None,
        }
    }
}
