//! What a run hands back: committed chapters, status and statistics.

use crate::errors::AbortReason;
use crate::model::{Character, ChapterSpec, QualityVerdict, StageKind, StorySetting};
use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Final status of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    /// The word target was reached.
    Completed,
    /// The outline ran out before the word target.
    TargetUnmet,
    Aborted(AbortReason),
}

impl RunStatus {
    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted(_))
    }

    pub fn abort_reason(&self) -> Option<&AbortReason> {
        match self {
            Self::Aborted(reason) => Some(reason),
            _ => None,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::TargetUnmet => write!(f, "target_unmet"),
            Self::Aborted(reason) => write!(f, "aborted:{}", reason),
        }
    }
}

impl Serialize for RunStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

/// A chapter as it ended up in the manuscript.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommittedChapter {
    pub index: u32,
    pub title: String,
    /// Final text; empty when a stage failed structurally on every attempt.
    pub text: String,
    pub word_count: u32,
    /// Committed without passing the quality gate.
    pub degraded: bool,
    /// Stage whose structural failures exhausted the budget, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_stage: Option<StageKind>,
    /// Writer attempts spent on the chapter.
    pub attempts: u32,
    /// Editor attempts; 0 when the chapter never reached the editor.
    pub edit_attempts: u32,
    /// Revision number of the committed text (0 if none).
    pub revision: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_verdict: Option<QualityVerdict>,
}

impl CommittedChapter {
    /// Writer and editor calls beyond the first of each.
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1) + self.edit_attempts.saturating_sub(1)
    }
}

/// Call count and cumulative time for one stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StageStats {
    pub calls: u32,
    pub failures: u32,
    #[serde(serialize_with = "serialize_millis")]
    pub total_time: Duration,
}

/// Aggregate numbers for a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunStatistics {
    pub total_words: u64,
    pub chapters: u32,
    /// Writer and editor retries across all chapters.
    pub retries: u32,
    pub degraded: u32,
    pub failed: u32,
    pub structural_failures: u32,
    pub timeouts: u32,
    pub quality_rejections: u32,
    /// Summaries folded out of the rolling window into the digest.
    pub evictions: u32,
    /// Writer attempts per committed chapter, in chapter order.
    pub attempts_per_chapter: Vec<u32>,
    pub stages: BTreeMap<StageKind, StageStats>,
    #[serde(serialize_with = "serialize_millis")]
    pub elapsed: Duration,
}

impl RunStatistics {
    pub(crate) fn record_call(&mut self, stage: StageKind, elapsed: Duration, failed: bool) {
        let stats = self.stages.entry(stage).or_default();
        stats.calls += 1;
        stats.total_time += elapsed;
        if failed {
            stats.failures += 1;
        }
    }

    pub(crate) fn record_chapter(&mut self, chapter: &CommittedChapter) {
        self.total_words += u64::from(chapter.word_count);
        self.chapters += 1;
        self.retries += chapter.retries();
        self.attempts_per_chapter.push(chapter.attempts);
        if chapter.degraded {
            self.degraded += 1;
        }
        if chapter.failed_stage.is_some() {
            self.failed += 1;
        }
    }

    pub fn calls(&self, stage: StageKind) -> u32 {
        self.stages.get(&stage).map(|s| s.calls).unwrap_or(0)
    }
}

fn serialize_millis<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(duration.as_millis() as u64)
}

/// Everything a run produced. Always returned, even for aborted runs.
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub run_id: String,
    pub status: RunStatus,
    /// Cause of an abort, beyond the status suffix.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub abort_detail: Option<String>,
    pub target_words: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub setting: Option<StorySetting>,
    /// Character registry as of the last commit.
    pub characters: Vec<Character>,
    pub outline: Vec<ChapterSpec>,
    pub chapters: Vec<CommittedChapter>,
    pub stats: RunStatistics,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunResult {
    pub fn total_words(&self) -> u64 {
        self.stats.total_words
    }

    pub fn degraded_chapters(&self) -> impl Iterator<Item = &CommittedChapter> {
        self.chapters.iter().filter(|c| c.degraded)
    }

    /// The manuscript as markdown-ish plain text, one section per chapter.
    pub fn manuscript(&self) -> String {
        let mut sections = Vec::with_capacity(self.chapters.len() + 1);
        if let Some(setting) = &self.setting {
            sections.push(format!("# {}", setting.title));
        }
        for chapter in &self.chapters {
            let body = if chapter.text.trim().is_empty() {
                match chapter.failed_stage {
                    Some(stage) => format!("[This chapter could not be generated: the {} stage failed.]", stage),
                    None => "[This chapter is empty.]".to_string(),
                }
            } else {
                chapter.text.clone()
            };
            sections.push(format!("## Chapter {}: {}\n\n{}", chapter.index, chapter.title, body));
        }
        let mut out = sections.join("\n\n");
        out.push('\n');
        out
    }
}
