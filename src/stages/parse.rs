//! Parsing of raw stage output into the narrative model.
//!
//! Structured stages (planner, outliner, reviewer) answer in JSON that may be
//! wrapped in prose or code fences; the editor answers in prose carrying
//! `<character>` and `<event>` tags.

use crate::errors::GenerationFailure;
use crate::model::{
    Character, CharacterUpdate, ChapterRange, ChapterSpec, QualityVerdict, StageKind,
    StorySetting, WordRange,
};
use regex::Regex;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

static CHARACTER_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)<character\s+id\s*=\s*"([^"]+)"\s*>(.*?)</character>"#).unwrap()
});

static EVENT_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<event>(.*?)</event>").unwrap());

static BLANK_RUNS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n{3,}").unwrap());

/// Extract the first balanced `{...}` block, ignoring braces inside strings.
pub fn extract_json_object(text: &str) -> Option<&str> {
    extract_balanced(text, '{', '}')
}

/// Extract the first balanced `[...]` block, ignoring brackets inside strings.
pub fn extract_json_array(text: &str) -> Option<&str> {
    extract_balanced(text, '[', ']')
}

fn extract_balanced(text: &str, open: char, close: char) -> Option<&str> {
    balanced_at(text, text.find(open)?, open, close)
}

/// Every balanced `{...}` or `[...]` block, in order of where it starts.
fn json_candidates(text: &str) -> impl Iterator<Item = &str> {
    text.char_indices().filter_map(move |(i, ch)| match ch {
        '{' => balanced_at(text, i, '{', '}'),
        '[' => balanced_at(text, i, '[', ']'),
        _ => None,
    })
}

/// The balanced block opening at byte `start`.
fn balanced_at(text: &str, start: usize, open: char, close: char) -> Option<&str> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            c if c == open => depth += 1,
            c if c == close => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + i + ch.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}

#[derive(Debug, Deserialize)]
struct RawPlan {
    #[serde(default)]
    title: String,
    #[serde(default)]
    theme: String,
    #[serde(default)]
    genre: String,
    #[serde(default)]
    world_rules: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    characters: Vec<RawCharacter>,
}

#[derive(Debug, Deserialize)]
struct RawCharacter {
    #[serde(default)]
    id: Option<String>,
    name: String,
    #[serde(default)]
    role: String,
    #[serde(default)]
    traits: Vec<String>,
    #[serde(default)]
    state: String,
}

/// Parse planner output. Target values come from the run, not the model.
pub fn parse_plan(
    text: &str,
    target_words: u64,
    chapter_range: ChapterRange,
) -> Result<(StorySetting, Vec<Character>), GenerationFailure> {
    let stage = StageKind::Planner;
    let json = extract_json_object(text)
        .ok_or_else(|| GenerationFailure::malformed(stage, "no JSON object in output"))?;
    let raw: RawPlan = serde_json::from_str(json)
        .map_err(|e| GenerationFailure::malformed(stage, format!("invalid plan JSON: {}", e)))?;

    if raw.title.trim().is_empty() {
        return Err(GenerationFailure::malformed(stage, "plan has no title"));
    }
    if raw.theme.trim().is_empty() {
        return Err(GenerationFailure::malformed(stage, "plan has no theme"));
    }
    if raw.characters.is_empty() {
        return Err(GenerationFailure::malformed(stage, "plan has no characters"));
    }

    let world_rules = raw
        .world_rules
        .into_iter()
        .map(|(key, value)| {
            let description = match value {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            };
            (key, description)
        })
        .collect();

    let setting = StorySetting {
        title: raw.title.trim().to_string(),
        theme: raw.theme.trim().to_string(),
        genre: raw.genre.trim().to_string(),
        world_rules,
        target_words,
        chapter_range,
    };

    let mut seen = BTreeSet::new();
    let mut characters = Vec::with_capacity(raw.characters.len());
    for raw_character in raw.characters {
        let name = raw_character.name.trim();
        if name.is_empty() {
            continue;
        }
        let base = raw_character
            .id
            .as_deref()
            .map(slugify)
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| slugify(name));
        let mut id = base.clone();
        let mut n = 2;
        while !seen.insert(id.clone()) {
            id = format!("{}-{}", base, n);
            n += 1;
        }
        characters.push(
            Character::new(&id, name, raw_character.role.trim())
                .with_traits(raw_character.traits)
                .with_state(raw_character.state.trim()),
        );
    }
    if characters.is_empty() {
        return Err(GenerationFailure::malformed(stage, "plan has no named characters"));
    }

    Ok((setting, characters))
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawOutline {
    Wrapped { chapters: Vec<RawChapter> },
    Bare(Vec<RawChapter>),
}

impl RawOutline {
    fn into_chapters(self) -> Vec<RawChapter> {
        match self {
            Self::Wrapped { chapters } | Self::Bare(chapters) => chapters,
        }
    }

    fn has_chapters(&self) -> bool {
        let chapters = match self {
            Self::Wrapped { chapters } | Self::Bare(chapters) => chapters,
        };
        chapters.iter().any(|c| !c.title.trim().is_empty() || !c.summary.trim().is_empty())
    }
}

#[derive(Debug, Deserialize)]
struct RawChapter {
    #[serde(default)]
    title: String,
    #[serde(default, alias = "describe", alias = "beat")]
    summary: String,
    #[serde(default)]
    target_words: Option<u32>,
}

/// Parse outliner output into specs re-indexed from 1.
///
/// Fewer than `range.min` chapters is malformed; more than `range.max` are
/// truncated. Chapters without a word target share `target_words` evenly.
pub fn parse_outline(
    text: &str,
    range: ChapterRange,
    target_words: u64,
) -> Result<Vec<ChapterSpec>, GenerationFailure> {
    let stage = StageKind::Outliner;
    // Bracketed prose can precede the outline; the first block with chapters wins.
    let mut fallback = None;
    let mut last_error = None;
    let mut found = None;
    for candidate in json_candidates(text) {
        match serde_json::from_str::<RawOutline>(candidate) {
            Ok(raw) if raw.has_chapters() => {
                found = Some(raw);
                break;
            }
            Ok(raw) => {
                fallback.get_or_insert(raw);
            }
            Err(e) => last_error = Some(e),
        }
    }
    let raw = match (found.or(fallback), last_error) {
        (Some(raw), _) => raw,
        (None, Some(e)) => {
            return Err(GenerationFailure::malformed(stage, format!("invalid outline JSON: {}", e)));
        }
        (None, None) => {
            return Err(GenerationFailure::malformed(stage, "no JSON in outline output"));
        }
    };
    let mut chapters = raw.into_chapters();
    chapters.retain(|c| !c.title.trim().is_empty() || !c.summary.trim().is_empty());

    let count = chapters.len() as u32;
    if count == 0 || count < range.min {
        return Err(GenerationFailure::malformed(
            stage,
            format!("outline has {} chapters, need at least {}", count, range.min.max(1)),
        ));
    }
    if count > range.max {
        tracing::warn!(
            chapters = count,
            max = range.max,
            "Outline exceeds chapter range, truncating"
        );
        chapters.truncate(range.max as usize);
    }

    let per_chapter = target_words.div_ceil(chapters.len() as u64).min(u32::MAX as u64) as u32;

    Ok(chapters
        .into_iter()
        .enumerate()
        .map(|(i, raw)| {
            let index = i as u32 + 1;
            let title = match raw.title.trim() {
                "" => format!("Chapter {}", index),
                t => t.to_string(),
            };
            let words = raw.target_words.filter(|w| *w > 0).unwrap_or(per_chapter);
            ChapterSpec::new(index, &title, raw.summary.trim(), WordRange::around(words))
        })
        .collect())
}

#[derive(Debug, Deserialize)]
struct RawVerdict {
    consistency: Option<f64>,
    coherence: Option<f64>,
    pass: Option<bool>,
    #[serde(default)]
    feedback: String,
}

/// Parse reviewer output. Missing or out-of-range scores are malformed.
pub fn parse_verdict(text: &str, chapter_index: u32) -> Result<QualityVerdict, GenerationFailure> {
    let stage = StageKind::Reviewer;
    let json = extract_json_object(text)
        .ok_or_else(|| GenerationFailure::malformed(stage, "no JSON object in review output"))?;
    let raw: RawVerdict = serde_json::from_str(json)
        .map_err(|e| GenerationFailure::malformed(stage, format!("invalid review JSON: {}", e)))?;

    let score = |name: &str, value: Option<f64>| -> Result<f64, GenerationFailure> {
        match value {
            Some(v) if (0.0..=1.0).contains(&v) => Ok(v),
            Some(v) => Err(GenerationFailure::malformed(
                stage,
                format!("{} score {} outside [0,1]", name, v),
            )),
            None => Err(GenerationFailure::malformed(
                stage,
                format!("missing {} score", name),
            )),
        }
    };

    let consistency = score("consistency", raw.consistency)?;
    let coherence = score("coherence", raw.coherence)?;
    let pass = raw
        .pass
        .ok_or_else(|| GenerationFailure::malformed(stage, "missing pass flag"))?;

    Ok(QualityVerdict::new(chapter_index, consistency, coherence, pass)
        .with_feedback(raw.feedback.trim()))
}

/// Editor output after tag extraction.
#[derive(Debug, Clone, PartialEq)]
pub struct EditedText {
    pub text: String,
    pub updates: Vec<CharacterUpdate>,
    pub events: Vec<String>,
}

/// Split editor output into prose, character updates and key events.
pub fn parse_edit(text: &str) -> EditedText {
    let updates = CHARACTER_TAG
        .captures_iter(text)
        .filter_map(|cap| {
            let id = cap[1].trim();
            let state = cap[2].trim();
            (!id.is_empty() && !state.is_empty()).then(|| CharacterUpdate::new(id, state))
        })
        .collect();

    let events = EVENT_TAG
        .captures_iter(text)
        .map(|cap| cap[1].trim().to_string())
        .filter(|e| !e.is_empty())
        .collect();

    let stripped = CHARACTER_TAG.replace_all(text, "");
    let stripped = EVENT_TAG.replace_all(&stripped, "");
    let stripped = BLANK_RUNS.replace_all(stripped.trim(), "\n\n");

    EditedText {
        text: stripped.into_owned(),
        updates,
        events,
    }
}

/// Lowercase ASCII slug: alphanumerics kept, everything else collapsed to `-`.
pub fn slugify(s: &str) -> String {
    let mut out = String::new();
    for ch in s.trim().chars() {
        if ch.is_alphanumeric() {
            out.extend(ch.to_lowercase());
        } else if !out.ends_with('-') && !out.is_empty() {
            out.push('-');
        }
    }
    out.trim_end_matches('-').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_json_object_with_prose() {
        let text = "Here is the plan:\n```json\n{\"a\": {\"b\": 1}}\n```\nDone.";
        assert_eq!(extract_json_object(text), Some("{\"a\": {\"b\": 1}}"));
    }

    #[test]
    fn test_extract_json_ignores_braces_in_strings() {
        let text = r#"{"feedback": "the } brace \" and { more", "pass": true} trailing"#;
        let json = extract_json_object(text).unwrap();
        assert!(json.ends_with("true}"));
        assert!(serde_json::from_str::<serde_json::Value>(json).is_ok());
    }

    #[test]
    fn test_extract_unbalanced_is_none() {
        assert_eq!(extract_json_object("{\"a\": 1"), None);
        assert_eq!(extract_json_array("no json"), None);
    }

    #[test]
    fn test_parse_plan() {
        let text = r#"{"title":"Salt","theme":"memory","genre":"fantasy",
            "world_rules":{"tides":"obey bells","count":3},
            "characters":[{"name":"Mara Quell","role":"hero","traits":["brave"]},
                          {"id":"Oren","name":"Oren","role":"rival","state":"angry"}]}"#;
        let (setting, characters) = parse_plan(text, 50_000, ChapterRange::new(10, 30)).unwrap();
        assert_eq!(setting.title, "Salt");
        assert_eq!(setting.target_words, 50_000);
        assert_eq!(setting.world_rules["count"], "3");
        assert_eq!(characters[0].id, "mara-quell");
        assert_eq!(characters[1].id, "oren");
        assert_eq!(characters[1].state, "angry");
    }

    #[test]
    fn test_parse_plan_duplicate_ids_are_suffixed() {
        let text = r#"{"title":"T","theme":"t","characters":[{"name":"Ana"},{"name":"Ana"}]}"#;
        let (_, characters) = parse_plan(text, 1000, ChapterRange::new(1, 5)).unwrap();
        assert_eq!(characters[0].id, "ana");
        assert_eq!(characters[1].id, "ana-2");
    }

    #[test]
    fn test_parse_plan_requires_title_and_characters() {
        let range = ChapterRange::new(1, 5);
        assert!(parse_plan(r#"{"theme":"x","characters":[{"name":"A"}]}"#, 1, range).is_err());
        assert!(parse_plan(r#"{"title":"x","theme":"y","characters":[]}"#, 1, range).is_err());
        assert!(parse_plan("not json", 1, range).is_err());
    }

    #[test]
    fn test_parse_outline_wrapped_and_bare() {
        let range = ChapterRange::new(2, 10);
        let wrapped = r#"{"chapters":[{"title":"A","summary":"a"},{"title":"B","summary":"b","target_words":800}]}"#;
        let specs = parse_outline(wrapped, range, 3000).unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].index, 1);
        assert_eq!(specs[0].target_words, WordRange::around(1500));
        assert_eq!(specs[1].target_words, WordRange::around(800));

        let bare = r#"[{"title":"A","describe":"first"},{"title":"B","describe":"second"}]"#;
        let specs = parse_outline(bare, range, 2000).unwrap();
        assert_eq!(specs[1].index, 2);
        assert_eq!(specs[1].beat, "second");
    }

    #[test]
    fn test_parse_outline_skips_bracketed_preamble() {
        let range = ChapterRange::new(1, 10);
        let text = "Here is the outline [draft 1]:\n{\"chapters\":[{\"title\":\"A\",\"summary\":\"a\"},{\"title\":\"B\",\"summary\":\"b\"}]}";
        let specs = parse_outline(text, range, 2000).unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].title, "A");

        let text = "Notes {revised}: [{\"title\":\"A\",\"describe\":\"a\"}]";
        let specs = parse_outline(text, range, 1000).unwrap();
        assert_eq!(specs[0].beat, "a");

        let err = parse_outline("Outline [draft 1] {pending}", range, 1000).unwrap_err();
        assert!(err.to_string().contains("invalid outline JSON"));
    }

    #[test]
    fn test_parse_outline_too_few_is_malformed() {
        let err = parse_outline("[]", ChapterRange::new(1, 10), 1000).unwrap_err();
        assert_eq!(err.kind(), "malformed");
        let one = r#"[{"title":"A","describe":"a"}]"#;
        assert!(parse_outline(one, ChapterRange::new(3, 10), 1000).is_err());
    }

    #[test]
    fn test_parse_outline_truncates_to_max() {
        let many: Vec<String> = (0..8)
            .map(|i| format!(r#"{{"title":"C{}","summary":"s"}}"#, i))
            .collect();
        let text = format!("[{}]", many.join(","));
        let specs = parse_outline(&text, ChapterRange::new(1, 5), 5000).unwrap();
        assert_eq!(specs.len(), 5);
        assert_eq!(specs[4].index, 5);
    }

    #[test]
    fn test_parse_verdict() {
        let v = parse_verdict(
            r#"{"consistency":0.8,"coherence":0.75,"pass":true,"feedback":" ok "}"#,
            4,
        )
        .unwrap();
        assert_eq!(v.chapter_index, 4);
        assert_eq!(v.consistency, 0.8);
        assert!(v.pass);
        assert_eq!(v.feedback, "ok");
    }

    #[test]
    fn test_parse_verdict_rejects_bad_scores() {
        assert!(parse_verdict(r#"{"consistency":1.4,"coherence":0.5,"pass":true}"#, 1).is_err());
        assert!(parse_verdict(r#"{"coherence":0.5,"pass":true}"#, 1).is_err());
        assert!(parse_verdict(r#"{"consistency":0.5,"coherence":0.5}"#, 1).is_err());
    }

    #[test]
    fn test_parse_edit_strips_tags() {
        let raw = "Mara rang the bell.\n\n<character id=\"mara\">\n  exhausted\n</character>\n\n\n<event>The bell cracks</event>\nThe sea went still.";
        let edited = parse_edit(raw);
        assert_eq!(edited.updates, vec![CharacterUpdate::new("mara", "exhausted")]);
        assert_eq!(edited.events, vec!["The bell cracks".to_string()]);
        assert!(!edited.text.contains("<character"));
        assert!(!edited.text.contains("<event>"));
        assert!(edited.text.starts_with("Mara rang the bell."));
        assert!(edited.text.ends_with("The sea went still."));
        assert!(!edited.text.contains("\n\n\n"));
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Mara Quell"), "mara-quell");
        assert_eq!(slugify("  Dr. O'Neil  "), "dr-o-neil");
        assert_eq!(slugify("---"), "");
    }
}
