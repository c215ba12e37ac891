//! The five generation stages.
//!
//! Each stage builds its prompt, makes exactly one backend call under the
//! per-call timeout and parses the reply. Stages keep no state between calls.

pub mod parse;
pub mod prompts;

use crate::backend::{GenerationBackend, GenerationConstraints};
use crate::context::ContextView;
use crate::errors::GenerationFailure;
use crate::model::{
    Character, CharacterUpdate, ChapterDraft, ChapterRange, ChapterSpec, QualityVerdict,
    StageKind, StorySetting, count_words,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::Instrument;

/// Default per-call timeout.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(300);

/// Default floor below which a draft counts as near-empty.
pub const DEFAULT_MIN_DRAFT_WORDS: u32 = 100;

/// Timeouts, thresholds and per-stage constraints shared by every call.
#[derive(Debug, Clone, PartialEq)]
pub struct StageSettings {
    pub call_timeout: Duration,
    pub min_draft_words: u32,
    pub constraints: HashMap<StageKind, GenerationConstraints>,
}

impl Default for StageSettings {
    fn default() -> Self {
        Self {
            call_timeout: DEFAULT_CALL_TIMEOUT,
            min_draft_words: DEFAULT_MIN_DRAFT_WORDS,
            constraints: HashMap::new(),
        }
    }
}

impl StageSettings {
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_min_draft_words(mut self, words: u32) -> Self {
        self.min_draft_words = words;
        self
    }

    /// Constraints for a stage, falling back to its built-in defaults.
    pub fn constraints_for(&self, stage: StageKind) -> GenerationConstraints {
        self.constraints
            .get(&stage)
            .cloned()
            .unwrap_or_else(|| default_constraints(stage))
    }
}

/// Built-in constraints: structured stages run cooler and shorter.
pub fn default_constraints(stage: StageKind) -> GenerationConstraints {
    match stage {
        StageKind::Planner | StageKind::Outliner => GenerationConstraints {
            max_tokens: 4096,
            temperature: 0.7,
            stop: Vec::new(),
        },
        StageKind::Reviewer => GenerationConstraints {
            max_tokens: 1024,
            temperature: 0.2,
            stop: Vec::new(),
        },
        StageKind::Writer | StageKind::Editor => GenerationConstraints::default(),
    }
}

/// Editor result: the final revision plus the character updates it reported.
#[derive(Debug, Clone, PartialEq)]
pub struct EditOutcome {
    pub draft: ChapterDraft,
    pub updates: Vec<CharacterUpdate>,
}

/// Runs stage invocations against a shared backend.
#[derive(Clone)]
pub struct StagePipeline {
    backend: Arc<dyn GenerationBackend>,
    settings: StageSettings,
}

impl std::fmt::Debug for StagePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StagePipeline")
            .field("backend", &self.backend.name())
            .field("settings", &self.settings)
            .finish()
    }
}

impl StagePipeline {
    pub fn new(backend: Arc<dyn GenerationBackend>, settings: StageSettings) -> Self {
        Self { backend, settings }
    }

    pub fn settings(&self) -> &StageSettings {
        &self.settings
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// One backend call: timeout, transport errors and empty output mapped
    /// onto `GenerationFailure`.
    async fn call(
        &self,
        stage: StageKind,
        chapter: Option<u32>,
        prompt: String,
    ) -> Result<String, GenerationFailure> {
        let constraints = self.settings.constraints_for(stage);
        let timeout = self.settings.call_timeout;
        let span = tracing::info_span!("stage", stage = %stage, chapter = chapter.unwrap_or(0));

        async move {
            tracing::debug!(prompt_chars = prompt.len(), "Calling backend");
            let reply = tokio::time::timeout(timeout, self.backend.generate(&prompt, &constraints))
                .await
                .map_err(|_| GenerationFailure::Timeout { stage, timeout })?
                .map_err(|source| GenerationFailure::Backend { stage, source })?;

            if reply.trim().is_empty() {
                return Err(GenerationFailure::Empty { stage });
            }
            tracing::debug!(reply_chars = reply.len(), "Backend replied");
            Ok(reply)
        }
        .instrument(span)
        .await
    }

    /// Planner: premise to setting and character registry.
    pub async fn plan(
        &self,
        premise: &str,
        target_words: u64,
        chapters: ChapterRange,
    ) -> Result<(StorySetting, Vec<Character>), GenerationFailure> {
        let prompt = prompts::planner(premise, target_words, chapters);
        let reply = self.call(StageKind::Planner, None, prompt).await?;
        parse::parse_plan(&reply, target_words, chapters)
    }

    /// Outliner: setting to an ordered chapter list.
    pub async fn outline(
        &self,
        view: &ContextView,
        chapters: ChapterRange,
    ) -> Result<Vec<ChapterSpec>, GenerationFailure> {
        let prompt = prompts::outliner(view, chapters);
        let reply = self.call(StageKind::Outliner, None, prompt).await?;
        parse::parse_outline(&reply, chapters, view.setting.target_words)
    }

    /// Writer: a fresh draft; `attempt` is 1-based and becomes the revision.
    pub async fn write(
        &self,
        view: &ContextView,
        spec: &ChapterSpec,
        feedback: Option<&str>,
        attempt: u32,
    ) -> Result<ChapterDraft, GenerationFailure> {
        let prompt = prompts::writer(view, spec, feedback, attempt);
        let reply = self.call(StageKind::Writer, Some(spec.index), prompt).await?;
        let text = reply.trim().to_string();
        self.check_length(StageKind::Writer, &text)?;
        Ok(ChapterDraft::new(spec, text, StageKind::Writer, attempt))
    }

    /// Reviewer: score a draft.
    pub async fn review(
        &self,
        view: &ContextView,
        spec: &ChapterSpec,
        draft: &ChapterDraft,
    ) -> Result<QualityVerdict, GenerationFailure> {
        let prompt = prompts::reviewer(view, spec, draft);
        let reply = self.call(StageKind::Reviewer, Some(spec.index), prompt).await?;
        parse::parse_verdict(&reply, spec.index)
    }

    /// Editor: polish an accepted draft into the final revision.
    pub async fn edit(
        &self,
        view: &ContextView,
        spec: &ChapterSpec,
        draft: &ChapterDraft,
        verdict: &QualityVerdict,
    ) -> Result<EditOutcome, GenerationFailure> {
        let prompt = prompts::editor(view, spec, draft, verdict);
        let reply = self.call(StageKind::Editor, Some(spec.index), prompt).await?;
        let edited = parse::parse_edit(&reply);
        self.check_length(StageKind::Editor, &edited.text)?;
        Ok(EditOutcome {
            draft: draft
                .supersede(edited.text, StageKind::Editor)
                .with_key_events(edited.events),
            updates: edited.updates,
        })
    }

    fn check_length(&self, stage: StageKind, text: &str) -> Result<(), GenerationFailure> {
        let words = count_words(text);
        if words == 0 {
            return Err(GenerationFailure::Empty { stage });
        }
        if words < self.settings.min_draft_words {
            return Err(GenerationFailure::malformed(
                stage,
                format!(
                    "{} words is below the minimum of {}",
                    words, self.settings.min_draft_words
                ),
            ));
        }
        Ok(())
    }
}
