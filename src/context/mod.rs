//! Narrative Context
//!
//! Owns everything the stages need to know about the story so far, in a form
//! that stays bounded no matter how many chapters have been written.
//!
//! ## Features
//!
//! - **Rolling window**: the `window` most recent chapter summaries
//! - **Digest**: older summaries folded into a character-capped story-so-far
//! - **Character registry**: planner-created characters with states updated on commit
//! - **Word accounting**: cumulative committed words, O(1) to read
//!
//! ## Configuration
//!
//! ```toml
//! [context]
//! window = 3            # summaries kept verbatim
//! summary_chars = 600   # cap per chapter summary
//! digest_chars = 12000  # cap for the story-so-far digest
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! let mut ctx = NarrativeContext::new(setting, characters, ContextSettings::default());
//! let view = ctx.snapshot_for(1);
//! // ... generate chapter 1 against `view` ...
//! ctx.commit(1, &draft, &updates)?;
//! ```

mod digest;
mod summary;

pub use digest::StoryDigest;
pub use summary::ChapterSummary;

use crate::errors::ContextError;
use crate::model::{Character, CharacterUpdate, ChapterDraft, StorySetting};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

/// Default number of chapter summaries kept in the rolling window.
pub const DEFAULT_WINDOW: usize = 3;

/// Default cap on a single chapter summary, in characters.
pub const DEFAULT_SUMMARY_CHARS: usize = 600;

/// Default cap on the digest: ~4k tokens at ~3 characters per token.
pub const DEFAULT_DIGEST_CHARS: usize = 4_000 * 3;

/// Sizing of the narrative context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSettings {
    /// Maximum summaries kept verbatim in the rolling window.
    #[serde(default = "default_window")]
    pub window: usize,
    /// Character cap for one chapter summary.
    #[serde(default = "default_summary_chars")]
    pub summary_chars: usize,
    /// Character cap for the digest of evicted chapters.
    #[serde(default = "default_digest_chars")]
    pub digest_chars: usize,
}

fn default_window() -> usize {
    DEFAULT_WINDOW
}

fn default_summary_chars() -> usize {
    DEFAULT_SUMMARY_CHARS
}

fn default_digest_chars() -> usize {
    DEFAULT_DIGEST_CHARS
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            window: default_window(),
            summary_chars: default_summary_chars(),
            digest_chars: default_digest_chars(),
        }
    }
}

/// Read-only view of the context handed to a stage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextView {
    /// Chapter the view was taken for.
    pub chapter_index: u32,
    pub setting: StorySetting,
    /// Characters ordered by id.
    pub characters: Vec<Character>,
    /// At most `window` summaries, oldest first.
    pub recent: Vec<ChapterSummary>,
    /// Rendered digest of chapters older than the window (empty if none).
    pub digest: String,
    pub words_so_far: u64,
}

impl ContextView {
    /// Render the story-so-far block used in prompts.
    pub fn story_so_far(&self) -> String {
        let mut out = String::new();
        if !self.digest.is_empty() {
            out.push_str("### Earlier chapters\n");
            out.push_str(&self.digest);
            out.push('\n');
        }
        if !self.recent.is_empty() {
            out.push_str("### Recent chapters\n");
            for summary in &self.recent {
                out.push_str(&summary.text);
                out.push('\n');
            }
        }
        if out.is_empty() {
            out.push_str("(This is the opening of the story.)\n");
        }
        out
    }
}

/// What happened to the context during a commit.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitReceipt {
    pub chapter_index: u32,
    pub word_count: u64,
    /// Chapter whose summary left the window and was folded into the digest.
    pub evicted: Option<u32>,
    /// Updates that named an unknown character and were ignored.
    pub ignored_updates: Vec<String>,
}

/// The evolving state of one story.
///
/// Each run owns exactly one; it is never shared across runs.
#[derive(Debug, Clone)]
pub struct NarrativeContext {
    settings: ContextSettings,
    setting: StorySetting,
    characters: BTreeMap<String, Character>,
    window: VecDeque<ChapterSummary>,
    digest: StoryDigest,
    /// Index of the last committed chapter; 0 before the first commit.
    current_chapter: u32,
    word_count: u64,
}

impl NarrativeContext {
    /// Create a context from the planner's output.
    ///
    /// A window size of zero is treated as one.
    pub fn new(setting: StorySetting, characters: Vec<Character>, settings: ContextSettings) -> Self {
        let settings = ContextSettings {
            window: settings.window.max(1),
            ..settings
        };
        let digest = StoryDigest::new(settings.digest_chars);
        Self {
            window: VecDeque::with_capacity(settings.window + 1),
            settings,
            setting,
            characters: characters.into_iter().map(|c| (c.id.clone(), c)).collect(),
            digest,
            current_chapter: 0,
            word_count: 0,
        }
    }

    /// View of the context relevant to generating or reviewing a chapter.
    ///
    /// Never carries more than `window` summaries, and is a pure function of
    /// the committed state.
    pub fn snapshot_for(&self, chapter_index: u32) -> ContextView {
        ContextView {
            chapter_index,
            setting: self.setting.clone(),
            characters: self.characters.values().cloned().collect(),
            recent: self.window.iter().cloned().collect(),
            digest: self.digest.render(),
            words_so_far: self.word_count,
        }
    }

    /// Commit a chapter: compress it into the window and merge character updates.
    ///
    /// `chapter_index` must be exactly one past the last committed chapter.
    /// On error the context is left unchanged.
    pub fn commit(
        &mut self,
        chapter_index: u32,
        draft: &ChapterDraft,
        updates: &[CharacterUpdate],
    ) -> Result<CommitReceipt, ContextError> {
        let expected = self.current_chapter + 1;
        if chapter_index != expected {
            return Err(ContextError::OutOfOrderCommit {
                expected,
                got: chapter_index,
            });
        }

        let present: Vec<&Character> = self.characters.values().collect();
        let mut summary = ChapterSummary::from_draft(draft, &present, self.settings.summary_chars);
        summary.chapter_index = chapter_index;

        let mut ignored_updates = Vec::new();
        for update in updates {
            match self.characters.get_mut(&update.id) {
                Some(character) => character.state = update.state.clone(),
                None => {
                    tracing::warn!(
                        chapter = chapter_index,
                        character = %update.id,
                        "Ignoring update for unknown character"
                    );
                    ignored_updates.push(update.id.clone());
                }
            }
        }

        self.window.push_back(summary);
        let mut evicted = None;
        while self.window.len() > self.settings.window {
            if let Some(oldest) = self.window.pop_front() {
                self.digest.fold(&oldest);
                evicted = Some(oldest.chapter_index);
            }
        }

        self.current_chapter = chapter_index;
        self.word_count += u64::from(draft.word_count);

        Ok(CommitReceipt {
            chapter_index,
            word_count: self.word_count,
            evicted,
            ignored_updates,
        })
    }

    /// Cumulative words over all committed chapters.
    pub fn current_word_count(&self) -> u64 {
        self.word_count
    }

    /// Index of the last committed chapter (0 if none).
    pub fn current_chapter(&self) -> u32 {
        self.current_chapter
    }

    pub fn window_len(&self) -> usize {
        self.window.len()
    }

    pub fn window_capacity(&self) -> usize {
        self.settings.window
    }

    pub fn setting(&self) -> &StorySetting {
        &self.setting
    }

    pub fn character(&self, id: &str) -> Option<&Character> {
        self.characters.get(id)
    }

    pub fn characters(&self) -> impl Iterator<Item = &Character> {
        self.characters.values()
    }

    pub fn digest(&self) -> &StoryDigest {
        &self.digest
    }
}
