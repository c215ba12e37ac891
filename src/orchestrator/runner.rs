use super::events::{EventLevel, EventSink, RunEvent, TracingSink};
use super::result::{CommittedChapter, RunResult, RunStatistics, RunStatus};
use super::state::{ChapterPhase, ProgressSnapshot, RunPhase};
use crate::audit::{AuditLogger, AuditRun, AuditTotals, ChapterAudit, CompactionEvent, RunConfig};
use crate::backend::GenerationBackend;
use crate::context::{ContextSettings, NarrativeContext};
use crate::errors::{AbortReason, GenerationFailure};
use crate::gate::{ExhaustionPolicy, GateDecision, GatePolicy, QualityGate};
use crate::model::{
    CharacterUpdate, ChapterDraft, ChapterRange, ChapterSpec, QualityVerdict, StageKind,
};
use crate::stages::{StagePipeline, StageSettings};
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Default word target for a run.
pub const DEFAULT_TARGET_WORDS: u64 = 50_000;

/// Everything the loop needs to know about one run.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopConfig {
    pub target_words: u64,
    pub chapters: ChapterRange,
    pub context: ContextSettings,
    pub gate: GatePolicy,
    pub stages: StageSettings,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            target_words: DEFAULT_TARGET_WORDS,
            chapters: ChapterRange::new(20, 30),
            context: ContextSettings::default(),
            gate: GatePolicy::default(),
            stages: StageSettings::default(),
        }
    }
}

impl LoopConfig {
    pub fn with_target_words(mut self, words: u64) -> Self {
        self.target_words = words;
        self
    }

    pub fn with_chapters(mut self, min: u32, max: u32) -> Self {
        self.chapters = ChapterRange::new(min, max);
        self
    }

    pub fn with_window(mut self, window: usize) -> Self {
        self.context.window = window;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.gate.max_retries = max_retries;
        self
    }

    pub fn with_on_exhaustion(mut self, policy: ExhaustionPolicy) -> Self {
        self.gate.on_exhaustion = policy;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.stages.call_timeout = timeout;
        self
    }

    pub fn with_min_draft_words(mut self, words: u32) -> Self {
        self.stages.min_draft_words = words;
        self
    }
}

/// Drives one story from premise to manuscript.
///
/// A loop publishes progress for the run it is executing; use one loop per
/// concurrent run. Loops may share a backend.
pub struct ChapterLoop {
    pipeline: StagePipeline,
    gate: QualityGate,
    config: LoopConfig,
    sink: Arc<dyn EventSink>,
    cancel: CancellationToken,
    progress_tx: watch::Sender<ProgressSnapshot>,
}

impl ChapterLoop {
    pub fn new(backend: Arc<dyn GenerationBackend>, config: LoopConfig) -> Self {
        let (progress_tx, _) = watch::channel(ProgressSnapshot::new("", config.target_words));
        Self {
            pipeline: StagePipeline::new(backend, config.stages.clone()),
            gate: QualityGate::new(config.gate.clone()),
            config,
            sink: Arc::new(TracingSink),
            cancel: CancellationToken::new(),
            progress_tx,
        }
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Subscribe to progress snapshots.
    pub fn progress(&self) -> watch::Receiver<ProgressSnapshot> {
        self.progress_tx.subscribe()
    }

    pub fn config(&self) -> &LoopConfig {
        &self.config
    }

    /// Generate a story from `premise`. Never fails: problems surface in the
    /// returned status.
    pub async fn run(&self, premise: &str) -> RunResult {
        RunDriver::new(self, None).execute(premise).await
    }

    /// Like [`run`](Self::run), also keeping a snapshot and audit record.
    /// Audit write failures are logged and do not affect the run.
    pub async fn run_audited(&self, premise: &str, audit: &mut AuditLogger) -> RunResult {
        RunDriver::new(self, Some(audit)).execute(premise).await
    }

    fn audit_config(&self) -> RunConfig {
        RunConfig {
            target_words: self.config.target_words,
            chapters_min: self.config.chapters.min,
            chapters_max: self.config.chapters.max,
            window: self.config.context.window,
            max_retries: self.config.gate.max_retries,
            min_consistency: self.config.gate.min_consistency,
            min_coherence: self.config.gate.min_coherence,
            on_exhaustion: self.config.gate.on_exhaustion.to_string(),
            call_timeout_ms: self.config.stages.call_timeout.as_millis() as u64,
            backend: self.pipeline.backend_name().to_string(),
        }
    }
}

/// How a chapter ended before commit.
struct ChapterOutcome {
    draft: ChapterDraft,
    updates: Vec<CharacterUpdate>,
    verdict: Option<QualityVerdict>,
    degraded: bool,
    failed_stage: Option<StageKind>,
    attempts: u32,
    edit_attempts: u32,
}

/// Mutable state of a single run.
struct RunDriver<'a> {
    owner: &'a ChapterLoop,
    audit: Option<&'a mut AuditLogger>,
    run_id: Uuid,
    started: Instant,
    started_at: DateTime<Utc>,
    phase: RunPhase,
    snapshot: ProgressSnapshot,
    stats: RunStatistics,
    chapters: Vec<CommittedChapter>,
}

impl<'a> RunDriver<'a> {
    fn new(owner: &'a ChapterLoop, audit: Option<&'a mut AuditLogger>) -> Self {
        let run_id = Uuid::new_v4();
        Self {
            owner,
            audit,
            run_id,
            started: Instant::now(),
            started_at: Utc::now(),
            phase: RunPhase::Planning,
            snapshot: ProgressSnapshot::new(&run_id.to_string(), owner.config.target_words),
            stats: RunStatistics::default(),
            chapters: Vec::new(),
        }
    }

    async fn execute(mut self, premise: &str) -> RunResult {
        let owner = self.owner;
        let config = &owner.config;
        tracing::info!(run_id = %self.run_id, target_words = config.target_words, backend = owner.pipeline.backend_name(), "Starting run");

        let audit_run = AuditRun::new(self.run_id, premise, owner.audit_config());
        self.audit(|audit| audit.start_run(audit_run));
        self.publish();
        self.event(EventLevel::Info, Some(StageKind::Planner), None, "Planning story");

        // Planning
        let planning = self
            .staged(
                StageKind::Planner,
                None,
                owner.pipeline.plan(premise, config.target_words, config.chapters),
            )
            .await;
        let plan = match planning {
            Err(reason) => return self.abort(reason, None, Vec::new()),
            Ok(Err(failure)) => {
                let reason = AbortReason::PlanningFailed {
                    detail: failure.to_string(),
                };
                return self.abort(reason, None, Vec::new());
            }
            Ok(Ok(plan)) => plan,
        };
        let (setting, characters) = plan;
        let title = setting.title.clone();
        let mut context = NarrativeContext::new(setting, characters, config.context.clone());

        // Outlining
        self.enter(RunPhase::Outlining);
        self.event(EventLevel::Info, Some(StageKind::Outliner), None, &format!("Outlining \"{}\"", title));
        let view = context.snapshot_for(1);
        let outlined = self
            .staged(
                StageKind::Outliner,
                None,
                owner.pipeline.outline(&view, config.chapters),
            )
            .await;
        let outline = match outlined {
            Err(reason) => return self.abort(reason, Some(&context), Vec::new()),
            Ok(Err(failure)) => {
                let reason = AbortReason::OutliningFailed {
                    detail: failure.to_string(),
                };
                return self.abort(reason, Some(&context), Vec::new());
            }
            Ok(Ok(outline)) if outline.is_empty() => {
                let reason = AbortReason::OutliningFailed {
                    detail: "outline is empty".to_string(),
                };
                return self.abort(reason, Some(&context), Vec::new());
            }
            Ok(Ok(outline)) => outline,
        };

        let planned = outline.len() as u32;
        self.snapshot.chapters_planned = planned;
        self.audit(|audit| {
            audit.update(|run| {
                run.title = Some(title.clone());
                run.chapters_planned = planned;
                run.status = RunPhase::ChapterIterating.to_string();
            })
        });

        // Chapters
        self.enter(RunPhase::ChapterIterating);
        for spec in &outline {
            if context.current_word_count() >= config.target_words {
                break;
            }
            let outcome = match self.run_chapter(&context, spec).await {
                Ok(outcome) => outcome,
                Err(reason) => return self.abort(reason, Some(&context), outline.clone()),
            };
            if let Err(reason) = self.commit(&mut context, spec, outcome) {
                return self.abort(reason, Some(&context), outline.clone());
            }
            if context.current_word_count() >= config.target_words {
                tracing::info!(words = context.current_word_count(), "Word target reached");
                break;
            }
        }

        // Finalizing
        self.enter(RunPhase::Finalizing);
        let status = if context.current_word_count() >= config.target_words {
            RunStatus::Completed
        } else {
            self.event(
                EventLevel::Warn,
                None,
                None,
                &format!(
                    "Outline exhausted at {} of {} words",
                    context.current_word_count(),
                    config.target_words
                ),
            );
            RunStatus::TargetUnmet
        };
        self.enter(RunPhase::Done);
        self.finish(status, Some(&context), outline)
    }

    /// Draft and review until the gate accepts or the budget runs out, then edit.
    async fn run_chapter(
        &mut self,
        context: &NarrativeContext,
        spec: &ChapterSpec,
    ) -> Result<ChapterOutcome, AbortReason> {
        let owner = self.owner;
        let gate = &owner.gate;
        let view = context.snapshot_for(spec.index);
        let mut feedback: Option<String> = None;
        let mut attempt = 0u32;

        let (draft, verdict, degraded) = loop {
            attempt += 1;
            let retries_used = attempt - 1;
            self.chapter_phase(spec.index, ChapterPhase::Drafting, attempt);

            let written = self
                .staged(
                    StageKind::Writer,
                    Some(spec.index),
                    owner.pipeline.write(&view, spec, feedback.as_deref(), attempt),
                )
                .await?;
            let draft = match written {
                Ok(draft) => draft,
                Err(_) if gate.can_retry(retries_used) => {
                    self.chapter_phase(spec.index, ChapterPhase::Retrying, attempt);
                    continue;
                }
                Err(_) => return Ok(self.structurally_exhausted(spec, StageKind::Writer, attempt)),
            };

            self.chapter_phase(spec.index, ChapterPhase::Reviewing, attempt);
            let reviewed = self
                .staged(
                    StageKind::Reviewer,
                    Some(spec.index),
                    owner.pipeline.review(&view, spec, &draft),
                )
                .await?;
            let verdict = match reviewed {
                Ok(verdict) => verdict,
                Err(_) if gate.can_retry(retries_used) => {
                    self.chapter_phase(spec.index, ChapterPhase::Retrying, attempt);
                    continue;
                }
                Err(_) => return Ok(self.structurally_exhausted(spec, StageKind::Reviewer, attempt)),
            };

            match gate.evaluate(&verdict, retries_used) {
                GateDecision::Accept => break (draft, verdict, false),
                GateDecision::Retry { feedback: next } => {
                    self.stats.quality_rejections += 1;
                    self.event(
                        EventLevel::Warn,
                        Some(StageKind::Reviewer),
                        Some(spec.index),
                        &format!(
                            "Draft rejected (consistency {:.2}, coherence {:.2}), retrying",
                            verdict.consistency, verdict.coherence
                        ),
                    );
                    self.chapter_phase(spec.index, ChapterPhase::Retrying, attempt);
                    feedback = Some(next);
                }
                GateDecision::AcceptDegraded => {
                    self.stats.quality_rejections += 1;
                    self.event(
                        EventLevel::Warn,
                        Some(StageKind::Reviewer),
                        Some(spec.index),
                        &format!("Retry budget spent after {} attempts, accepting degraded draft", attempt),
                    );
                    break (draft, verdict, true);
                }
                GateDecision::Abort => {
                    self.stats.quality_rejections += 1;
                    self.event(
                        EventLevel::Error,
                        Some(StageKind::Reviewer),
                        Some(spec.index),
                        "Retry budget spent, aborting run",
                    );
                    return Err(AbortReason::QualityExhausted { chapter: spec.index });
                }
            }
        };

        self.chapter_phase(spec.index, ChapterPhase::Accepted, attempt);
        self.chapter_phase(spec.index, ChapterPhase::Editing, attempt);
        let edit_budget = gate.policy().max_retries + 1;
        for edit_attempts in 1..=edit_budget {
            let edited = self
                .staged(
                    StageKind::Editor,
                    Some(spec.index),
                    owner.pipeline.edit(&view, spec, &draft, &verdict),
                )
                .await?;
            match edited {
                Ok(edited) => {
                    return Ok(ChapterOutcome {
                        draft: edited.draft,
                        updates: edited.updates,
                        verdict: Some(verdict),
                        degraded,
                        failed_stage: None,
                        attempts: attempt,
                        edit_attempts,
                    });
                }
                Err(_) => tracing::debug!(chapter = spec.index, edit_attempts, "Editor attempt failed"),
            }
        }

        let mut outcome = self.structurally_exhausted(spec, StageKind::Editor, attempt);
        outcome.verdict = Some(verdict);
        outcome.edit_attempts = edit_budget;
        Ok(outcome)
    }

    /// A stage failed on its last allowed attempt: the chapter is committed
    /// empty whatever the exhaustion policy says.
    fn structurally_exhausted(
        &mut self,
        spec: &ChapterSpec,
        stage: StageKind,
        attempts: u32,
    ) -> ChapterOutcome {
        self.event(
            EventLevel::Error,
            Some(stage),
            Some(spec.index),
            "Stage failed on every attempt, committing empty chapter",
        );
        self.chapter_phase(spec.index, ChapterPhase::Failed, attempts);
        ChapterOutcome {
            draft: ChapterDraft::new(spec, String::new(), stage, 0),
            updates: Vec::new(),
            verdict: None,
            degraded: true,
            failed_stage: Some(stage),
            attempts,
            edit_attempts: 0,
        }
    }

    fn commit(
        &mut self,
        context: &mut NarrativeContext,
        spec: &ChapterSpec,
        outcome: ChapterOutcome,
    ) -> Result<(), AbortReason> {
        let receipt = context
            .commit(spec.index, &outcome.draft, &outcome.updates)
            .map_err(|e| {
                tracing::error!(error = %e, "Commit rejected");
                AbortReason::InvariantViolation(e)
            })?;

        let chapter = CommittedChapter {
            index: spec.index,
            title: spec.title.clone(),
            text: outcome.draft.text,
            word_count: outcome.draft.word_count,
            degraded: outcome.degraded,
            failed_stage: outcome.failed_stage,
            attempts: outcome.attempts,
            edit_attempts: outcome.edit_attempts,
            revision: outcome.draft.revision,
            final_verdict: outcome.verdict,
        };
        self.stats.record_chapter(&chapter);
        self.chapter_phase(spec.index, ChapterPhase::Committed, chapter.attempts);
        self.snapshot.chapters_committed += 1;
        self.snapshot.words = receipt.word_count;
        if chapter.degraded {
            self.snapshot.degraded += 1;
        }
        self.publish();

        self.event(
            EventLevel::Info,
            None,
            Some(spec.index),
            &format!(
                "Committed chapter {} \"{}\" ({} words{})",
                spec.index,
                spec.title,
                chapter.word_count,
                if chapter.degraded { ", degraded" } else { "" }
            ),
        );

        if let Some(evicted) = receipt.evicted {
            self.stats.evictions += 1;
            let digest = context.digest();
            let event = CompactionEvent {
                timestamp: Utc::now(),
                committed_chapter: spec.index,
                evicted_chapter: evicted,
                digest_chars: digest.char_count(),
                digest_lines_dropped: digest.lines_dropped(),
            };
            self.event(
                EventLevel::Debug,
                None,
                Some(spec.index),
                &format!("Chapter {} summary folded into digest", evicted),
            );
            self.audit(|audit| audit.record_compaction(event));
        }

        let audit_chapter = ChapterAudit {
            index: chapter.index,
            title: chapter.title.clone(),
            word_count: chapter.word_count,
            degraded: chapter.degraded,
            failed_stage: chapter.failed_stage,
            attempts: chapter.attempts,
            edit_attempts: chapter.edit_attempts,
            final_verdict: chapter.final_verdict.clone(),
            committed_at: Utc::now(),
        };
        let totals = self.totals();
        self.audit(|audit| audit.record_chapter(audit_chapter, totals));
        self.chapters.push(chapter);
        Ok(())
    }

    /// Run one stage call, racing it against cancellation and recording its
    /// cost. The outer error is cancellation; the inner one a stage failure.
    async fn staged<T, F>(
        &mut self,
        stage: StageKind,
        chapter: Option<u32>,
        call: F,
    ) -> Result<Result<T, GenerationFailure>, AbortReason>
    where
        F: Future<Output = Result<T, GenerationFailure>>,
    {
        if self.owner.cancel.is_cancelled() {
            return Err(AbortReason::Cancelled);
        }
        let started = Instant::now();
        let outcome = tokio::select! {
            biased;
            _ = self.owner.cancel.cancelled() => return Err(AbortReason::Cancelled),
            outcome = call => outcome,
        };
        self.stats.record_call(stage, started.elapsed(), outcome.is_err());

        if let Err(failure) = &outcome {
            self.stats.structural_failures += 1;
            if failure.is_timeout() {
                self.stats.timeouts += 1;
            }
            self.event(EventLevel::Warn, Some(stage), chapter, &failure.to_string());
        }
        Ok(outcome)
    }

    fn enter(&mut self, next: RunPhase) {
        if !self.phase.can_transition_to(next) {
            tracing::error!(from = %self.phase, to = %next, "Unexpected run state transition");
        }
        tracing::info!(from = %self.phase, to = %next, "Run state");
        self.phase = next;
        self.snapshot.phase = next;
        if next != RunPhase::ChapterIterating {
            self.snapshot.chapter_index = None;
            self.snapshot.chapter_phase = None;
        }
        self.publish();
    }

    fn chapter_phase(&mut self, chapter: u32, phase: ChapterPhase, attempt: u32) {
        if self.snapshot.chapter_index == Some(chapter)
            && let Some(current) = self.snapshot.chapter_phase
            && current != phase
            && !current.can_transition_to(phase)
        {
            tracing::error!(chapter, from = %current, to = %phase, "Unexpected chapter state transition");
        }
        tracing::debug!(chapter, phase = %phase, attempt, "Chapter state");
        self.snapshot.chapter_index = Some(chapter);
        self.snapshot.chapter_phase = Some(phase);
        self.snapshot.attempt = attempt;
        self.publish();
    }

    fn publish(&mut self) {
        self.snapshot.updated_at = Utc::now();
        self.owner.progress_tx.send_replace(self.snapshot.clone());
    }

    fn event(&self, level: EventLevel, stage: Option<StageKind>, chapter: Option<u32>, message: &str) {
        let mut event = RunEvent::new(level, message).with_word_count(self.stats.total_words);
        event.stage = stage;
        event.chapter_index = chapter;
        self.owner.sink.emit(event);
    }

    fn audit<F>(&mut self, f: F)
    where
        F: FnOnce(&mut AuditLogger) -> Result<()>,
    {
        if let Some(audit) = self.audit.as_deref_mut()
            && let Err(e) = f(audit)
        {
            tracing::warn!(error = %e, "Failed to write run snapshot");
        }
    }

    fn totals(&self) -> AuditTotals {
        AuditTotals {
            words: self.stats.total_words,
            chapters: self.stats.chapters,
            retries: self.stats.retries,
            degraded: self.stats.degraded,
            failed: self.stats.failed,
            structural_failures: self.stats.structural_failures,
            quality_rejections: self.stats.quality_rejections,
        }
    }

    fn abort(
        mut self,
        reason: AbortReason,
        context: Option<&NarrativeContext>,
        outline: Vec<ChapterSpec>,
    ) -> RunResult {
        let message = match reason.detail() {
            Some(detail) => format!("Run aborted: {} ({})", reason, detail),
            None => format!("Run aborted: {}", reason),
        };
        self.event(EventLevel::Error, None, None, &message);
        self.enter(RunPhase::Aborted);
        self.finish(RunStatus::Aborted(reason), context, outline)
    }

    fn finish(
        mut self,
        status: RunStatus,
        context: Option<&NarrativeContext>,
        outline: Vec<ChapterSpec>,
    ) -> RunResult {
        self.stats.elapsed = self.started.elapsed();
        let totals = self.totals();
        let status_text = status.to_string();
        self.audit(|audit| audit.finish_run(&status_text, totals).map(|_| ()));

        let level = if status.is_aborted() { EventLevel::Error } else { EventLevel::Info };
        self.event(
            level,
            None,
            None,
            &format!(
                "Run finished: {} ({} chapters, {} words)",
                status, self.stats.chapters, self.stats.total_words
            ),
        );

        RunResult {
            run_id: self.run_id.to_string(),
            abort_detail: status.abort_reason().and_then(AbortReason::detail),
            status,
            target_words: self.owner.config.target_words,
            setting: context.map(|c| c.setting().clone()),
            characters: context
                .map(|c| c.characters().cloned().collect())
                .unwrap_or_default(),
            outline,
            chapters: self.chapters,
            stats: self.stats,
            started_at: self.started_at,
            finished_at: Utc::now(),
        }
    }
}
