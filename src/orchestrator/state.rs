//! Run and chapter state machines, and the progress snapshot published
//! after every transition.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Top-level run state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Planning,
    Outlining,
    ChapterIterating,
    Finalizing,
    Done,
    Aborted,
}

impl RunPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Aborted)
    }

    /// Legal transitions. Any non-terminal state may abort.
    pub fn can_transition_to(&self, next: RunPhase) -> bool {
        use RunPhase::*;
        match (self, next) {
            (from, Aborted) => !from.is_terminal(),
            (Planning, Outlining)
            | (Outlining, ChapterIterating)
            | (ChapterIterating, Finalizing)
            | (Finalizing, Done) => true,
            _ => false,
        }
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Planning => "planning",
            Self::Outlining => "outlining",
            Self::ChapterIterating => "chapter_iterating",
            Self::Finalizing => "finalizing",
            Self::Done => "done",
            Self::Aborted => "aborted",
        };
        write!(f, "{}", s)
    }
}

/// Per-chapter state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChapterPhase {
    Drafting,
    Reviewing,
    Accepted,
    Retrying,
    Editing,
    /// A stage failed on every attempt; an empty chapter follows.
    Failed,
    Committed,
}

impl ChapterPhase {
    pub fn can_transition_to(&self, next: ChapterPhase) -> bool {
        use ChapterPhase::*;
        matches!(
            (self, next),
            (Drafting, Reviewing)
                | (Drafting, Retrying)
                | (Reviewing, Accepted)
                | (Reviewing, Retrying)
                | (Retrying, Drafting)
                | (Accepted, Editing)
                | (Editing, Committed)
                | (Drafting, Failed)
                | (Reviewing, Failed)
                | (Editing, Failed)
                | (Failed, Committed)
        )
    }
}

impl fmt::Display for ChapterPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Drafting => "drafting",
            Self::Reviewing => "reviewing",
            Self::Accepted => "accepted",
            Self::Retrying => "retrying",
            Self::Editing => "editing",
            Self::Failed => "failed",
            Self::Committed => "committed",
        };
        write!(f, "{}", s)
    }
}

/// Point-in-time view of a run, cheap to clone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub run_id: String,
    pub phase: RunPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chapter_index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chapter_phase: Option<ChapterPhase>,
    /// 1-based attempt within the current chapter.
    pub attempt: u32,
    pub chapters_planned: u32,
    pub chapters_committed: u32,
    pub words: u64,
    pub target_words: u64,
    pub degraded: u32,
    pub updated_at: DateTime<Utc>,
}

impl ProgressSnapshot {
    pub fn new(run_id: &str, target_words: u64) -> Self {
        Self {
            run_id: run_id.to_string(),
            phase: RunPhase::Planning,
            chapter_index: None,
            chapter_phase: None,
            attempt: 0,
            chapters_planned: 0,
            chapters_committed: 0,
            words: 0,
            target_words,
            degraded: 0,
            updated_at: Utc::now(),
        }
    }

    /// Fraction of the word target reached, clamped to [0,1].
    pub fn fraction(&self) -> f64 {
        if self.target_words == 0 {
            return 1.0;
        }
        (self.words as f64 / self.target_words as f64).min(1.0)
    }

    /// One-line description for progress displays.
    pub fn describe(&self) -> String {
        match (self.chapter_index, self.chapter_phase) {
            (Some(chapter), Some(phase)) if self.phase == RunPhase::ChapterIterating => format!(
                "chapter {}/{} {} (attempt {})",
                chapter, self.chapters_planned, phase, self.attempt
            ),
            _ => self.phase.to_string(),
        }
    }
}
