//! Deterministic backend for dry runs and tests.
//!
//! Responses are served per stage: queued replies first, then the synthetic
//! story generator (if one is configured). The stage is read from the
//! `## ROLE:` header every pipeline prompt starts with.

use super::{GenerationBackend, GenerationConstraints};
use crate::errors::BackendError;
use crate::model::StageKind;
use async_trait::async_trait;
use regex::Regex;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{LazyLock, Mutex, MutexGuard};
use std::time::Duration;

static ROLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^## ROLE: ([A-Z]+)\s*$").expect("valid regex"));

static CHAPTER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^## CHAPTER: (\d+)\s*$").expect("valid regex"));

const VOCABULARY: &[&str] = &[
    "the", "tide", "pulled", "at", "harbor", "stones", "while", "lanterns", "swayed", "above",
    "quiet", "water", "and", "old", "ropes", "creaked", "against", "salt", "stained", "posts",
];

/// Stage named by the prompt's `## ROLE:` header.
pub fn detect_stage(prompt: &str) -> Option<StageKind> {
    ROLE_RE
        .captures(prompt)
        .and_then(|caps| caps[1].parse::<StageKind>().ok())
}

fn detect_chapter(prompt: &str) -> Option<u32> {
    CHAPTER_RE
        .captures(prompt)
        .and_then(|caps| caps[1].parse().ok())
}

/// One prompt the backend received.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedPrompt {
    pub stage: Option<StageKind>,
    pub chapter: Option<u32>,
    pub prompt: String,
}

#[derive(Debug, Clone)]
enum Reply {
    Text(String),
    Fail(String),
}

/// Generator producing valid output for every stage.
#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticStory {
    pub title: String,
    pub chapters: u32,
    pub words_per_chapter: u32,
    /// Chapters the reviewer rejects on every attempt.
    pub reject_chapters: BTreeSet<u32>,
}

impl Default for SyntheticStory {
    fn default() -> Self {
        Self {
            title: "The Tide Bell".to_string(),
            chapters: 25,
            words_per_chapter: 2000,
            reject_chapters: BTreeSet::new(),
        }
    }
}

impl SyntheticStory {
    pub fn new(chapters: u32, words_per_chapter: u32) -> Self {
        Self {
            chapters,
            words_per_chapter,
            ..Self::default()
        }
    }

    pub fn rejecting(mut self, chapter: u32) -> Self {
        self.reject_chapters.insert(chapter);
        self
    }

    fn reply(&self, stage: StageKind, chapter: Option<u32>) -> String {
        let chapter = chapter.unwrap_or(1);
        match stage {
            StageKind::Planner => serde_json::json!({
                "title": self.title,
                "theme": "what the sea keeps",
                "genre": "maritime fantasy",
                "world_rules": {
                    "bells": "A rung tide bell turns the water for one night",
                    "salt": "Salt marks binding oaths"
                },
                "characters": [
                    {"id": "mara", "name": "Mara Quell", "role": "protagonist",
                     "traits": ["stubborn", "curious"], "state": "Keeper's apprentice"},
                    {"id": "oren", "name": "Oren Vale", "role": "rival",
                     "traits": ["proud"], "state": "Harbor master's son"}
                ]
            })
            .to_string(),
            StageKind::Outliner => {
                let chapters: Vec<_> = (1..=self.chapters)
                    .map(|i| {
                        serde_json::json!({
                            "title": format!("Tide {}", i),
                            "summary": format!("Mara faces the tide for the {} time", ordinal(i)),
                            "target_words": self.words_per_chapter,
                        })
                    })
                    .collect();
                serde_json::json!({ "chapters": chapters }).to_string()
            }
            StageKind::Writer => prose(chapter, self.words_per_chapter),
            StageKind::Reviewer => {
                if self.reject_chapters.contains(&chapter) {
                    serde_json::json!({
                        "consistency": 0.3,
                        "coherence": 0.4,
                        "pass": false,
                        "feedback": format!("Chapter {} contradicts the established tide rules", chapter),
                    })
                    .to_string()
                } else {
                    serde_json::json!({
                        "consistency": 0.92,
                        "coherence": 0.88,
                        "pass": true,
                        "feedback": "",
                    })
                    .to_string()
                }
            }
            StageKind::Editor => format!(
                "{}\n<character id=\"mara\">Changed by tide {}</character>\n<event>The bell rings for tide {}</event>",
                prose(chapter, self.words_per_chapter),
                chapter,
                chapter
            ),
        }
    }
}

fn ordinal(n: u32) -> String {
    let suffix = match (n % 10, n % 100) {
        (_, 11..=13) => "th",
        (1, _) => "st",
        (2, _) => "nd",
        (3, _) => "rd",
        _ => "th",
    };
    format!("{}{}", n, suffix)
}

/// Deterministic prose of exactly `words` words, in sentences of twelve.
fn prose(chapter: u32, words: u32) -> String {
    let mut out = String::new();
    for i in 0..words as usize {
        let word = if i == 0 {
            "Mara"
        } else {
            VOCABULARY[(i + chapter as usize) % VOCABULARY.len()]
        };
        if i > 0 {
            out.push(' ');
        }
        out.push_str(word);
        if i % 12 == 11 || i + 1 == words as usize {
            out.push('.');
        }
    }
    out
}

#[derive(Debug, Default)]
struct ScriptState {
    queues: HashMap<StageKind, VecDeque<Reply>>,
    prompts: Vec<RecordedPrompt>,
    calls: HashMap<StageKind, usize>,
}

/// Backend that replays scripted replies and synthesises the rest.
#[derive(Debug, Default)]
pub struct ScriptedBackend {
    state: Mutex<ScriptState>,
    synthetic: Option<SyntheticStory>,
    delays: HashMap<StageKind, Duration>,
}

impl ScriptedBackend {
    /// Backend with no synthetic fallback: unscripted calls fail.
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend that falls back to `story` when a stage has nothing queued.
    pub fn synthetic(story: SyntheticStory) -> Self {
        Self {
            synthetic: Some(story),
            ..Self::default()
        }
    }

    /// Queue a reply for the next call of `stage`.
    pub fn push(&self, stage: StageKind, text: impl Into<String>) -> &Self {
        self.lock()
            .queues
            .entry(stage)
            .or_default()
            .push_back(Reply::Text(text.into()));
        self
    }

    /// Queue a transport failure for the next call of `stage`.
    pub fn push_failure(&self, stage: StageKind, message: impl Into<String>) -> &Self {
        self.lock()
            .queues
            .entry(stage)
            .or_default()
            .push_back(Reply::Fail(message.into()));
        self
    }

    /// Sleep before answering any call of `stage`.
    pub fn with_delay(mut self, stage: StageKind, delay: Duration) -> Self {
        self.delays.insert(stage, delay);
        self
    }

    pub fn prompts(&self) -> Vec<RecordedPrompt> {
        self.lock().prompts.clone()
    }

    pub fn calls(&self, stage: StageKind) -> usize {
        self.lock().calls.get(&stage).copied().unwrap_or(0)
    }

    fn lock(&self) -> MutexGuard<'_, ScriptState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl GenerationBackend for ScriptedBackend {
    async fn generate(
        &self,
        prompt: &str,
        _constraints: &GenerationConstraints,
    ) -> Result<String, BackendError> {
        let stage = detect_stage(prompt);
        let chapter = detect_chapter(prompt);

        let queued = {
            let mut state = self.lock();
            state.prompts.push(RecordedPrompt {
                stage,
                chapter,
                prompt: prompt.to_string(),
            });
            match stage {
                Some(stage) => {
                    *state.calls.entry(stage).or_default() += 1;
                    state.queues.get_mut(&stage).and_then(VecDeque::pop_front)
                }
                None => None,
            }
        };

        let Some(stage) = stage else {
            return Err(BackendError::Request(
                "prompt carries no ## ROLE: header".to_string(),
            ));
        };

        if let Some(delay) = self.delays.get(&stage) {
            tokio::time::sleep(*delay).await;
        }

        match queued {
            Some(Reply::Text(text)) => Ok(text),
            Some(Reply::Fail(message)) => Err(BackendError::Request(message)),
            None => match &self.synthetic {
                Some(story) => Ok(story.reply(stage, chapter)),
                None => Err(BackendError::Exhausted(stage.to_string())),
            },
        }
    }

    fn name(&self) -> &str {
        "scripted"
    }
}
