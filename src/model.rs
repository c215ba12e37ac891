//! Narrative data model shared by the stages, the context and the loop.
//!
//! - [`StorySetting`] and [`Character`] come out of the planner
//! - [`ChapterSpec`] comes out of the outliner
//! - [`ChapterDraft`] is produced by the writer and superseded by the editor
//! - [`QualityVerdict`] is produced by the reviewer and consumed by the gate

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// The five generation stages, in pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    Planner,
    Outliner,
    Writer,
    Reviewer,
    Editor,
}

impl StageKind {
    pub const ALL: [StageKind; 5] = [
        StageKind::Planner,
        StageKind::Outliner,
        StageKind::Writer,
        StageKind::Reviewer,
        StageKind::Editor,
    ];

    /// Lowercase name used in config sections, prompts and events.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planner => "planner",
            Self::Outliner => "outliner",
            Self::Writer => "writer",
            Self::Reviewer => "reviewer",
            Self::Editor => "editor",
        }
    }

    /// Stages that run once per chapter attempt.
    pub fn is_per_chapter(&self) -> bool {
        matches!(self, Self::Writer | Self::Reviewer | Self::Editor)
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for StageKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "planner" => Ok(Self::Planner),
            "outliner" => Ok(Self::Outliner),
            "writer" => Ok(Self::Writer),
            "reviewer" => Ok(Self::Reviewer),
            "editor" => Ok(Self::Editor),
            _ => anyhow::bail!(
                "Invalid stage '{}'. Valid values: planner, outliner, writer, reviewer, editor",
                s
            ),
        }
    }
}

/// Inclusive word-count range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WordRange {
    pub min: u32,
    pub max: u32,
}

impl WordRange {
    pub fn new(min: u32, max: u32) -> Self {
        Self { min, max }
    }

    /// Range centred on `target` with a ±20% spread.
    pub fn around(target: u32) -> Self {
        let spread = target / 5;
        Self {
            min: target.saturating_sub(spread),
            max: target.saturating_add(spread),
        }
    }

    pub fn midpoint(&self) -> u32 {
        self.min + (self.max.saturating_sub(self.min)) / 2
    }

    pub fn contains(&self, words: u32) -> bool {
        words >= self.min && words <= self.max
    }
}

impl fmt::Display for WordRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.min, self.max)
    }
}

/// Inclusive chapter-count range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChapterRange {
    pub min: u32,
    pub max: u32,
}

impl ChapterRange {
    pub fn new(min: u32, max: u32) -> Self {
        Self { min, max }
    }
}

/// Story-wide setting produced once by the planner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorySetting {
    pub title: String,
    pub theme: String,
    pub genre: String,
    /// World rules, ordered by key so prompts are stable.
    pub world_rules: BTreeMap<String, String>,
    pub target_words: u64,
    pub chapter_range: ChapterRange,
}

/// A member of the character registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Character {
    /// Stable slug, unique within a run.
    pub id: String,
    pub name: String,
    pub role: String,
    pub traits: BTreeSet<String>,
    /// Where the character stands after the latest committed chapter.
    pub state: String,
}

impl Character {
    pub fn new(id: &str, name: &str, role: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            role: role.to_string(),
            traits: BTreeSet::new(),
            state: String::new(),
        }
    }

    pub fn with_traits<I, S>(mut self, traits: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.traits.extend(traits.into_iter().map(Into::into));
        self
    }

    pub fn with_state(mut self, state: &str) -> Self {
        self.state = state.to_string();
        self
    }
}

/// A change to one character's state, emitted by the editor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacterUpdate {
    pub id: String,
    pub state: String,
}

impl CharacterUpdate {
    pub fn new(id: &str, state: &str) -> Self {
        Self {
            id: id.to_string(),
            state: state.to_string(),
        }
    }
}

/// One entry of the outline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChapterSpec {
    /// 1-based position in the outline.
    pub index: u32,
    pub title: String,
    /// What should happen in the chapter.
    pub beat: String,
    pub target_words: WordRange,
}

impl ChapterSpec {
    pub fn new(index: u32, title: &str, beat: &str, target_words: WordRange) -> Self {
        Self {
            index,
            title: title.to_string(),
            beat: beat.to_string(),
            target_words,
        }
    }
}

/// One revision of a chapter's text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChapterDraft {
    pub chapter_index: u32,
    pub title: String,
    pub text: String,
    pub word_count: u32,
    /// Stage that produced this revision.
    pub provenance: StageKind,
    /// 1-based position in the chapter's revision chain.
    pub revision: u32,
    /// Plot-critical events flagged by the editor.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub key_events: Vec<String>,
}

impl ChapterDraft {
    pub fn new(spec: &ChapterSpec, text: String, provenance: StageKind, revision: u32) -> Self {
        let word_count = count_words(&text);
        Self {
            chapter_index: spec.index,
            title: spec.title.clone(),
            text,
            word_count,
            provenance,
            revision,
            key_events: Vec::new(),
        }
    }

    /// Build the next revision in the chain from new text.
    pub fn supersede(&self, text: String, provenance: StageKind) -> Self {
        let word_count = count_words(&text);
        Self {
            chapter_index: self.chapter_index,
            title: self.title.clone(),
            text,
            word_count,
            provenance,
            revision: self.revision + 1,
            key_events: Vec::new(),
        }
    }

    pub fn with_key_events(mut self, events: Vec<String>) -> Self {
        self.key_events = events;
        self
    }
}

/// Reviewer output for one draft.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityVerdict {
    pub chapter_index: u32,
    /// Agreement with the setting, characters and earlier chapters, in [0,1].
    pub consistency: f64,
    /// Internal flow and readability, in [0,1].
    pub coherence: f64,
    pub pass: bool,
    #[serde(default)]
    pub feedback: String,
}

impl QualityVerdict {
    pub fn new(chapter_index: u32, consistency: f64, coherence: f64, pass: bool) -> Self {
        Self {
            chapter_index,
            consistency,
            coherence,
            pass,
            feedback: String::new(),
        }
    }

    pub fn with_feedback(mut self, feedback: &str) -> Self {
        self.feedback = feedback.to_string();
        self
    }
}

/// Count words in prose.
///
/// Every CJK ideograph, kana or hangul syllable counts as one word; any other
/// run of non-whitespace characters counts as one word.
pub fn count_words(text: &str) -> u32 {
    let mut count = 0u32;
    let mut in_word = false;

    for ch in text.chars() {
        if is_cjk(ch) {
            count += 1;
            in_word = false;
        } else if ch.is_whitespace() || is_cjk_punctuation(ch) {
            in_word = false;
        } else if !in_word {
            count += 1;
            in_word = true;
        }
    }

    count
}

fn is_cjk(ch: char) -> bool {
    matches!(ch,
        '\u{4E00}'..='\u{9FFF}'   // CJK unified ideographs
        | '\u{3400}'..='\u{4DBF}' // extension A
        | '\u{F900}'..='\u{FAFF}' // compatibility ideographs
        | '\u{3040}'..='\u{30FF}' // hiragana + katakana
        | '\u{AC00}'..='\u{D7AF}' // hangul syllables
    )
}

fn is_cjk_punctuation(ch: char) -> bool {
    matches!(ch, '\u{3000}'..='\u{303F}' | '\u{FF00}'..='\u{FF0F}' | '\u{FF1A}'..='\u{FF20}')
}
