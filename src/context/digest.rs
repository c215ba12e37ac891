//! Story-so-far digest for chapters that have left the rolling window.

use super::summary::{ChapterSummary, truncate_chars};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Bounded, lossy record of evicted chapter summaries.
///
/// Each evicted summary becomes one line. When the digest grows past its
/// character budget the oldest lines are dropped and counted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoryDigest {
    lines: VecDeque<String>,
    /// Character budget for all lines together.
    max_chars: usize,
    /// Running character total of `lines`.
    chars: usize,
    /// Chapters folded in, including ones whose line was later dropped.
    chapters_folded: u32,
    /// Lines dropped to stay within budget.
    lines_dropped: u32,
    /// Index of the most recent chapter folded in.
    last_folded: Option<u32>,
}

impl StoryDigest {
    pub fn new(max_chars: usize) -> Self {
        Self {
            max_chars,
            ..Default::default()
        }
    }

    /// Fold an evicted summary into the digest.
    ///
    /// A chapter is only ever folded once; repeated folds of the same or an
    /// older index are ignored and return false.
    pub fn fold(&mut self, summary: &ChapterSummary) -> bool {
        if self
            .last_folded
            .is_some_and(|last| summary.chapter_index <= last)
        {
            return false;
        }

        let line = truncate_chars(&summary.digest_line(), self.max_chars);
        self.chars += line.chars().count();
        self.lines.push_back(line);
        self.chapters_folded += 1;
        self.last_folded = Some(summary.chapter_index);

        while self.chars > self.max_chars {
            match self.lines.pop_front() {
                Some(dropped) => {
                    self.chars -= dropped.chars().count();
                    self.lines_dropped += 1;
                }
                None => break,
            }
        }
        true
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty() && self.chapters_folded == 0
    }

    pub fn chapters_folded(&self) -> u32 {
        self.chapters_folded
    }

    pub fn lines_dropped(&self) -> u32 {
        self.lines_dropped
    }

    pub fn char_count(&self) -> usize {
        self.chars
    }

    /// Render the digest for prompt injection.
    pub fn render(&self) -> String {
        let mut out = String::new();
        if self.lines_dropped > 0 {
            out.push_str(&format!(
                "(… {} earlier chapters condensed away)\n",
                self.lines_dropped
            ));
        }
        for line in &self.lines {
            out.push_str(line);
            out.push('\n');
        }
        out
    }
}
