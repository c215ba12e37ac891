//! Chapter summaries: the lossy form a committed chapter takes in context.

use crate::model::{Character, ChapterDraft};
use serde::{Deserialize, Serialize};
use std::fmt::Write;

/// Maximum characters kept for a single key event.
const MAX_EVENT_CHARS: usize = 160;

/// Maximum key events kept per chapter.
const MAX_EVENTS: usize = 4;

/// Compressed record of one committed chapter.
///
/// Replaces the raw chapter text in the rolling window; only the salient
/// facts survive (who was present, what happened).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChapterSummary {
    pub chapter_index: u32,
    pub title: String,
    /// Ids of characters that appear in the chapter.
    pub characters_present: Vec<String>,
    /// Plot-critical events, oldest first.
    pub key_events: Vec<String>,
    pub word_count: u32,
    /// Rendered summary text for prompt injection.
    pub text: String,
}

impl ChapterSummary {
    /// Compress a draft into a summary of at most `max_chars` characters.
    ///
    /// Key events come from the editor when it supplied them; otherwise the
    /// first and last sentences of the text stand in.
    pub fn from_draft(draft: &ChapterDraft, characters: &[&Character], max_chars: usize) -> Self {
        let characters_present: Vec<String> = characters
            .iter()
            .filter(|&&c| mentions(&draft.text, c))
            .map(|c| c.id.clone())
            .collect();

        let mut key_events: Vec<String> = if draft.key_events.is_empty() {
            bookend_sentences(&draft.text)
        } else {
            draft.key_events.clone()
        };
        key_events.truncate(MAX_EVENTS);
        for event in &mut key_events {
            *event = truncate_chars(event.trim(), MAX_EVENT_CHARS);
        }

        let mut summary = Self {
            chapter_index: draft.chapter_index,
            title: draft.title.clone(),
            characters_present,
            key_events,
            word_count: draft.word_count,
            text: String::new(),
        };
        summary.text = truncate_chars(&summary.render(), max_chars);
        summary
    }

    /// One-line form used when the summary is folded into the digest.
    pub fn digest_line(&self) -> String {
        let events = if self.key_events.is_empty() {
            "(no recorded events)".to_string()
        } else {
            self.key_events.join("; ")
        };
        format!("Ch {} «{}»: {}", self.chapter_index, self.title, events)
    }

    fn render(&self) -> String {
        let mut out = format!("Chapter {}: {}\n", self.chapter_index, self.title);
        if !self.characters_present.is_empty() {
            let _ = writeln!(out, "Present: {}", self.characters_present.join(", "));
        }
        for event in &self.key_events {
            let _ = writeln!(out, "- {}", event);
        }
        out
    }
}

fn mentions(text: &str, character: &Character) -> bool {
    (!character.name.is_empty() && text.contains(&character.name))
        || (!character.id.is_empty() && text.contains(&character.id))
        || character
            .name
            .split_whitespace()
            .next()
            .is_some_and(|first| first.chars().count() > 2 && text.contains(first))
}

/// First and last sentence of the text (one entry if they coincide).
fn bookend_sentences(text: &str) -> Vec<String> {
    let sentences: Vec<&str> = text
        .split_inclusive(|c: char| matches!(c, '.' | '!' | '?' | '。' | '！' | '？'))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();

    match sentences.as_slice() {
        [] => Vec::new(),
        [only] => vec![only.to_string()],
        [first, .., last] => vec![first.to_string(), last.to_string()],
    }
}

/// Truncate to at most `max` characters, marking the cut with an ellipsis.
pub(crate) fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    if max == 0 {
        return String::new();
    }
    let mut out: String = s.chars().take(max.saturating_sub(1)).collect();
    out.push('…');
    out
}
