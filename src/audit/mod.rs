//! Run snapshots and the audit trail.
//!
//! While a run is live its record is rewritten to `current-run.json` after
//! every commit; when it finishes the record moves to
//! `runs/<timestamp>_<id8>.json`.

use crate::model::{QualityVerdict, StageKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Maximum characters of the premise kept verbatim in the record.
const PREMISE_PREVIEW_CHARS: usize = 200;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRun {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    /// SHA-256 of the premise, hex encoded.
    pub premise_sha256: String,
    pub premise_preview: String,
    pub config: RunConfig,
    /// Run status: a phase name while live, the final status once finished.
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub chapters_planned: u32,
    pub chapters: Vec<ChapterAudit>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub compaction_events: Vec<CompactionEvent>,
    pub totals: AuditTotals,
}

impl AuditRun {
    pub fn new(run_id: Uuid, premise: &str, config: RunConfig) -> Self {
        Self {
            run_id,
            started_at: Utc::now(),
            ended_at: None,
            premise_sha256: fingerprint(premise),
            premise_preview: premise.trim().chars().take(PREMISE_PREVIEW_CHARS).collect(),
            config,
            status: "planning".to_string(),
            title: None,
            chapters_planned: 0,
            chapters: Vec::new(),
            compaction_events: Vec::new(),
            totals: AuditTotals::default(),
        }
    }

    pub fn finish(&mut self, status: &str) {
        self.ended_at = Some(Utc::now());
        self.status = status.to_string();
    }

    /// Verdicts of chapters committed without passing the gate.
    pub fn degraded_verdicts(&self) -> impl Iterator<Item = (u32, &QualityVerdict)> {
        self.chapters
            .iter()
            .filter(|c| c.degraded)
            .filter_map(|c| c.final_verdict.as_ref().map(|v| (c.index, v)))
    }
}

/// Run settings recorded alongside the result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub target_words: u64,
    pub chapters_min: u32,
    pub chapters_max: u32,
    pub window: usize,
    pub max_retries: u32,
    pub min_consistency: f64,
    pub min_coherence: f64,
    pub on_exhaustion: String,
    pub call_timeout_ms: u64,
    pub backend: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChapterAudit {
    pub index: u32,
    pub title: String,
    pub word_count: u32,
    pub degraded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_stage: Option<StageKind>,
    pub attempts: u32,
    #[serde(default)]
    pub edit_attempts: u32,
    /// Kept for every chapter; for degraded ones it is the unresolved verdict.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_verdict: Option<QualityVerdict>,
    pub committed_at: DateTime<Utc>,
}

/// A summary leaving the rolling window for the digest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompactionEvent {
    pub timestamp: DateTime<Utc>,
    /// Chapter whose commit caused the eviction.
    pub committed_chapter: u32,
    pub evicted_chapter: u32,
    pub digest_chars: usize,
    pub digest_lines_dropped: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuditTotals {
    pub words: u64,
    pub chapters: u32,
    pub retries: u32,
    pub degraded: u32,
    pub failed: u32,
    pub structural_failures: u32,
    pub quality_rejections: u32,
}

/// Hex-encoded SHA-256 of `text`.
pub fn fingerprint(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

pub mod logger;
pub use logger::AuditLogger;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audit_run_new() {
        let run = AuditRun::new(Uuid::new_v4(), "  A lighthouse keeper's daughter  ", RunConfig::default());
        assert!(run.ended_at.is_none());
        assert_eq!(run.status, "planning");
        assert_eq!(run.premise_preview, "A lighthouse keeper's daughter");
        assert_eq!(run.premise_sha256.len(), 64);
    }

    #[test]
    fn test_fingerprint_known_value() {
        assert_eq!(
            fingerprint("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_premise_preview_is_capped() {
        let premise = "x".repeat(1000);
        let run = AuditRun::new(Uuid::new_v4(), &premise, RunConfig::default());
        assert_eq!(run.premise_preview.chars().count(), PREMISE_PREVIEW_CHARS);
    }

    #[test]
    fn test_degraded_verdicts() {
        let mut run = AuditRun::new(Uuid::new_v4(), "p", RunConfig::default());
        for (index, degraded) in [(1, false), (2, true)] {
            run.chapters.push(ChapterAudit {
                index,
                title: format!("C{}", index),
                word_count: 10,
                degraded,
                failed_stage: None,
                attempts: if degraded { 3 } else { 1 },
                edit_attempts: 1,
                final_verdict: Some(QualityVerdict::new(index, 0.5, 0.5, !degraded)),
                committed_at: Utc::now(),
            });
        }
        let degraded: Vec<u32> = run.degraded_verdicts().map(|(i, _)| i).collect();
        assert_eq!(degraded, vec![2]);
    }

    #[test]
    fn test_audit_run_roundtrip() {
        let mut run = AuditRun::new(Uuid::new_v4(), "premise", RunConfig::default());
        run.finish("completed");
        let json = serde_json::to_string(&run).unwrap();
        let back: AuditRun = serde_json::from_str(&json).unwrap();
        assert_eq!(back.run_id, run.run_id);
        assert_eq!(back.status, "completed");
        assert!(back.ended_at.is_some());
    }
}
