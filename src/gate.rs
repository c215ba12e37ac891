//! Quality gate: turns a reviewer verdict into a decision for the loop.
//!
//! ## Decision Rules
//!
//! - **Accept**: both scores meet their thresholds and the reviewer passed the draft
//! - **Retry**: rejected, and retries used is still below `max_retries`
//! - **AcceptDegraded**: rejected with the budget spent, under the `degrade` policy
//! - **Abort**: rejected with the budget spent, under the `abort` policy
//!
//! ## Configuration
//!
//! ```toml
//! [quality]
//! min_consistency = 0.7
//! min_coherence = 0.7
//! max_retries = 2
//! on_exhaustion = "degrade"   # or "abort"
//! ```

use crate::model::QualityVerdict;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Default minimum score for both consistency and coherence.
pub const DEFAULT_MIN_SCORE: f64 = 0.7;

/// Default number of rewrites allowed per chapter.
pub const DEFAULT_MAX_RETRIES: u32 = 2;

/// What to do when a chapter is still rejected after its last retry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustionPolicy {
    /// Commit the last draft flagged as degraded.
    #[default]
    Degrade,
    /// Stop the run, keeping chapters already committed.
    Abort,
}

impl fmt::Display for ExhaustionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Degrade => write!(f, "degrade"),
            Self::Abort => write!(f, "abort"),
        }
    }
}

impl std::str::FromStr for ExhaustionPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "degrade" => Ok(Self::Degrade),
            "abort" => Ok(Self::Abort),
            _ => anyhow::bail!("Invalid exhaustion policy '{}'. Valid values: degrade, abort", s),
        }
    }
}

/// Thresholds and retry budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatePolicy {
    #[serde(default = "default_min_score")]
    pub min_consistency: f64,
    #[serde(default = "default_min_score")]
    pub min_coherence: f64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub on_exhaustion: ExhaustionPolicy,
}

fn default_min_score() -> f64 {
    DEFAULT_MIN_SCORE
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

impl Default for GatePolicy {
    fn default() -> Self {
        Self {
            min_consistency: DEFAULT_MIN_SCORE,
            min_coherence: DEFAULT_MIN_SCORE,
            max_retries: DEFAULT_MAX_RETRIES,
            on_exhaustion: ExhaustionPolicy::default(),
        }
    }
}

impl GatePolicy {
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_thresholds(mut self, min_consistency: f64, min_coherence: f64) -> Self {
        self.min_consistency = min_consistency;
        self.min_coherence = min_coherence;
        self
    }

    pub fn with_on_exhaustion(mut self, policy: ExhaustionPolicy) -> Self {
        self.on_exhaustion = policy;
        self
    }

    /// Total attempts a chapter may take: the first draft plus every retry.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }
}

/// Outcome of evaluating one verdict.
#[derive(Debug, Clone, PartialEq)]
pub enum GateDecision {
    Accept,
    /// Rewrite with this feedback forwarded to the writer.
    Retry { feedback: String },
    AcceptDegraded,
    Abort,
}

impl GateDecision {
    pub fn is_accept(&self) -> bool {
        matches!(self, Self::Accept | Self::AcceptDegraded)
    }
}

/// Stateless evaluator; the loop tracks retries per chapter.
#[derive(Debug, Clone, Default)]
pub struct QualityGate {
    policy: GatePolicy,
}

impl QualityGate {
    pub fn new(policy: GatePolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &GatePolicy {
        &self.policy
    }

    /// True iff the verdict clears every threshold.
    pub fn passes(&self, verdict: &QualityVerdict) -> bool {
        verdict.pass
            && verdict.consistency >= self.policy.min_consistency
            && verdict.coherence >= self.policy.min_coherence
    }

    /// Whether another attempt is allowed after `retries_used` rewrites.
    pub fn can_retry(&self, retries_used: u32) -> bool {
        retries_used < self.policy.max_retries
    }

    /// Decide what happens after a verdict, given retries already used.
    pub fn evaluate(&self, verdict: &QualityVerdict, retries_used: u32) -> GateDecision {
        if self.passes(verdict) {
            return GateDecision::Accept;
        }
        if self.can_retry(retries_used) {
            return GateDecision::Retry {
                feedback: retry_feedback(verdict, &self.policy),
            };
        }
        self.exhausted()
    }

    /// Decision once the retry budget is spent.
    pub fn exhausted(&self) -> GateDecision {
        match self.policy.on_exhaustion {
            ExhaustionPolicy::Degrade => GateDecision::AcceptDegraded,
            ExhaustionPolicy::Abort => GateDecision::Abort,
        }
    }
}

/// Reviewer feedback, or a score summary when the reviewer gave none.
fn retry_feedback(verdict: &QualityVerdict, policy: &GatePolicy) -> String {
    if !verdict.feedback.trim().is_empty() {
        return verdict.feedback.trim().to_string();
    }
    let mut issues = Vec::new();
    if verdict.consistency < policy.min_consistency {
        issues.push(format!(
            "consistency {:.2} is below {:.2}",
            verdict.consistency, policy.min_consistency
        ));
    }
    if verdict.coherence < policy.min_coherence {
        issues.push(format!(
            "coherence {:.2} is below {:.2}",
            verdict.coherence, policy.min_coherence
        ));
    }
    if issues.is_empty() {
        "The reviewer rejected the draft; tighten continuity with earlier chapters.".to_string()
    } else {
        format!("Revise the chapter: {}.", issues.join("; "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verdict(consistency: f64, coherence: f64, pass: bool) -> QualityVerdict {
        QualityVerdict::new(1, consistency, coherence, pass)
    }

    #[test]
    fn test_accept_requires_all_three() {
        let gate = QualityGate::default();
        assert_eq!(gate.evaluate(&verdict(0.7, 0.7, true), 0), GateDecision::Accept);
        assert_ne!(gate.evaluate(&verdict(0.69, 0.9, true), 0), GateDecision::Accept);
        assert_ne!(gate.evaluate(&verdict(0.9, 0.69, true), 0), GateDecision::Accept);
        assert_ne!(gate.evaluate(&verdict(0.9, 0.9, false), 0), GateDecision::Accept);
    }

    #[test]
    fn test_retry_forwards_feedback() {
        let gate = QualityGate::default();
        let v = verdict(0.4, 0.9, false).with_feedback("Mara cannot swim yet");
        assert_eq!(
            gate.evaluate(&v, 0),
            GateDecision::Retry {
                feedback: "Mara cannot swim yet".to_string()
            }
        );
    }

    #[test]
    fn test_retry_synthesizes_feedback_from_scores() {
        let gate = QualityGate::default();
        match gate.evaluate(&verdict(0.4, 0.5, false), 1) {
            GateDecision::Retry { feedback } => {
                assert!(feedback.contains("consistency 0.40"));
                assert!(feedback.contains("coherence 0.50"));
            }
            other => panic!("Expected Retry, got {:?}", other),
        }
    }

    #[test]
    fn test_exhaustion_degrades_by_default() {
        let gate = QualityGate::default();
        let bad = verdict(0.1, 0.1, false);
        assert!(matches!(gate.evaluate(&bad, 0), GateDecision::Retry { .. }));
        assert!(matches!(gate.evaluate(&bad, 1), GateDecision::Retry { .. }));
        assert_eq!(gate.evaluate(&bad, 2), GateDecision::AcceptDegraded);
    }

    #[test]
    fn test_exhaustion_abort_policy() {
        let gate = QualityGate::new(
            GatePolicy::default()
                .with_max_retries(0)
                .with_on_exhaustion(ExhaustionPolicy::Abort),
        );
        assert_eq!(gate.evaluate(&verdict(0.1, 0.1, false), 0), GateDecision::Abort);
        // a passing verdict is still accepted with no retries left
        assert_eq!(gate.evaluate(&verdict(0.9, 0.9, true), 0), GateDecision::Accept);
    }

    #[test]
    fn test_policy_from_toml() {
        let policy: GatePolicy =
            toml::from_str("min_coherence = 0.5\non_exhaustion = \"abort\"").unwrap();
        assert_eq!(policy.min_consistency, DEFAULT_MIN_SCORE);
        assert_eq!(policy.min_coherence, 0.5);
        assert_eq!(policy.max_retries, 2);
        assert_eq!(policy.on_exhaustion, ExhaustionPolicy::Abort);
        assert_eq!(policy.max_attempts(), 3);
    }

    #[test]
    fn test_exhaustion_policy_parse() {
        assert_eq!("Degrade".parse::<ExhaustionPolicy>().unwrap(), ExhaustionPolicy::Degrade);
        assert!("retry".parse::<ExhaustionPolicy>().is_err());
        assert_eq!(ExhaustionPolicy::Abort.to_string(), "abort");
    }
}
