//! End-to-end scenarios for the chapter loop, driven by the scripted backend.

use quill::backend::{ScriptedBackend, SyntheticStory};
use quill::context::{ContextSettings, NarrativeContext};
use quill::errors::AbortReason;
use quill::gate::ExhaustionPolicy;
use quill::model::{
    Character, CharacterUpdate, ChapterDraft, ChapterRange, ChapterSpec, StageKind, StorySetting,
    WordRange,
};
use quill::orchestrator::{ChapterLoop, LoopConfig, RunResult, RunStatus};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Loop config sized for small synthetic stories.
fn small_config(target_words: u64) -> LoopConfig {
    LoopConfig::default()
        .with_target_words(target_words)
        .with_chapters(1, 40)
        .with_min_draft_words(5)
}

fn assert_well_formed(result: &RunResult) {
    let sum: u64 = result.chapters.iter().map(|c| u64::from(c.word_count)).sum();
    assert_eq!(result.total_words(), sum);
    assert_eq!(result.stats.total_words, sum);
    for (i, chapter) in result.chapters.iter().enumerate() {
        assert_eq!(chapter.index, i as u32 + 1, "chapter indices must be contiguous from 1");
    }
}

// =============================================================================
// Full runs
// =============================================================================

mod full_runs {
    use super::*;

    #[tokio::test]
    async fn test_fifty_thousand_word_story() {
        let backend = Arc::new(ScriptedBackend::synthetic(SyntheticStory::default()));
        let chapter_loop = ChapterLoop::new(backend.clone(), LoopConfig::default());
        let result = chapter_loop
            .run("A lighthouse keeper's apprentice learns the tide bell can turn the sea")
            .await;

        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.chapters.len(), 25);
        assert_eq!(result.stats.degraded, 0);
        assert_eq!(result.stats.retries, 0);
        assert_eq!(result.total_words(), 50_000);
        assert_well_formed(&result);
        assert!(result.chapters.iter().all(|c| c.attempts == 1 && !c.degraded));
        assert_eq!(backend.calls(StageKind::Planner), 1);
        assert_eq!(backend.calls(StageKind::Outliner), 1);
    }

    #[tokio::test]
    async fn test_stops_once_target_is_reached() {
        let backend = Arc::new(ScriptedBackend::synthetic(SyntheticStory::new(10, 300)));
        let chapter_loop = ChapterLoop::new(backend.clone(), small_config(1000));
        let result = chapter_loop.run("premise").await;

        // ceil(1000 / 300) = 4
        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.chapters.len(), 4);
        assert_eq!(result.total_words(), 1200);
        assert_eq!(backend.calls(StageKind::Writer), 4);
        assert_well_formed(&result);
    }

    #[tokio::test]
    async fn test_outline_exhausted_is_target_unmet() {
        let backend = Arc::new(ScriptedBackend::synthetic(SyntheticStory::new(3, 100)));
        let chapter_loop = ChapterLoop::new(backend, small_config(5000));
        let result = chapter_loop.run("premise").await;

        assert_eq!(result.status, RunStatus::TargetUnmet);
        assert_eq!(result.status.to_string(), "target_unmet");
        assert_eq!(result.chapters.len(), 3);
        assert_eq!(result.outline.len(), 3);
        assert_well_formed(&result);
    }

    #[tokio::test]
    async fn test_manuscript_contains_every_chapter() {
        let backend = Arc::new(ScriptedBackend::synthetic(SyntheticStory::new(2, 40)));
        let chapter_loop = ChapterLoop::new(backend, small_config(80));
        let result = chapter_loop.run("premise").await;

        let manuscript = result.manuscript();
        assert!(manuscript.starts_with("# The Tide Bell"));
        assert!(manuscript.contains("## Chapter 1: Tide 1"));
        assert!(manuscript.contains("## Chapter 2: Tide 2"));
        assert!(!manuscript.contains("<character"));
        assert!(!manuscript.contains("<event>"));
    }

    #[tokio::test]
    async fn test_character_updates_reach_result() {
        let backend = Arc::new(ScriptedBackend::synthetic(SyntheticStory::new(2, 40)));
        let chapter_loop = ChapterLoop::new(backend, small_config(80));
        let result = chapter_loop.run("premise").await;

        let mara = result.characters.iter().find(|c| c.id == "mara").unwrap();
        assert_eq!(mara.state, "Changed by tide 2");
    }

    #[tokio::test]
    async fn test_concurrent_runs_are_independent() {
        let backend = Arc::new(ScriptedBackend::synthetic(SyntheticStory::new(4, 50)));
        let first = ChapterLoop::new(backend.clone(), small_config(200));
        let second = ChapterLoop::new(backend.clone(), small_config(100).with_window(1));

        let (a, b) = tokio::join!(first.run("first premise"), second.run("second premise"));

        assert_eq!(a.status, RunStatus::Completed);
        assert_eq!(b.status, RunStatus::Completed);
        assert_ne!(a.run_id, b.run_id);
        assert_eq!(a.chapters.len(), 4);
        assert_eq!(b.chapters.len(), 2);
        assert_well_formed(&a);
        assert_well_formed(&b);
        assert_eq!(backend.calls(StageKind::Planner), 2);
    }
}

// =============================================================================
// Quality gate
// =============================================================================

mod quality {
    use super::*;

    #[tokio::test]
    async fn test_chapter_seven_degrades_after_retries() {
        let story = SyntheticStory::new(10, 100).rejecting(7);
        let backend = Arc::new(ScriptedBackend::synthetic(story));
        let chapter_loop = ChapterLoop::new(backend.clone(), small_config(1000).with_max_retries(2));
        let result = chapter_loop.run("premise").await;

        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.chapters.len(), 10);
        assert_well_formed(&result);

        let seventh = &result.chapters[6];
        assert!(seventh.degraded);
        assert_eq!(seventh.attempts, 3);
        assert_eq!(seventh.retries(), 2);
        assert!(seventh.failed_stage.is_none());
        assert!(!seventh.final_verdict.as_ref().unwrap().pass);
        assert_eq!(result.stats.attempts_per_chapter[6], 3);
        assert_eq!(result.stats.degraded, 1);
        assert_eq!(result.stats.quality_rejections, 3);

        let first = &result.chapters[0];
        assert!(!first.degraded);
        assert_eq!(first.retries(), 0);
    }

    #[tokio::test]
    async fn test_feedback_reaches_the_rewrite() {
        let story = SyntheticStory::new(2, 60).rejecting(1);
        let backend = Arc::new(ScriptedBackend::synthetic(story));
        let chapter_loop = ChapterLoop::new(backend.clone(), small_config(120).with_max_retries(1));
        chapter_loop.run("premise").await;

        let writer_prompts: Vec<_> = backend
            .prompts()
            .into_iter()
            .filter(|p| p.stage == Some(StageKind::Writer) && p.chapter == Some(1))
            .collect();
        assert_eq!(writer_prompts.len(), 2);
        assert!(!writer_prompts[0].prompt.contains("REVIEWER FEEDBACK"));
        assert!(writer_prompts[1].prompt.contains("REVIEWER FEEDBACK"));
        assert!(writer_prompts[1]
            .prompt
            .contains("Chapter 1 contradicts the established tide rules"));
    }

    #[tokio::test]
    async fn test_degraded_chapter_is_still_edited() {
        let story = SyntheticStory::new(1, 60).rejecting(1);
        let backend = Arc::new(ScriptedBackend::synthetic(story));
        let chapter_loop = ChapterLoop::new(backend.clone(), small_config(60).with_max_retries(0));
        let result = chapter_loop.run("premise").await;

        let first = &result.chapters[0];
        assert!(first.degraded);
        assert!(first.failed_stage.is_none());
        assert_eq!(first.word_count, 60);
        assert_eq!(first.edit_attempts, 1);
        assert!(backend.calls(StageKind::Editor) > 0);
        let mara = result.characters.iter().find(|c| c.id == "mara").unwrap();
        assert_eq!(mara.state, "Changed by tide 1");
    }

    #[tokio::test]
    async fn test_abort_policy_stops_the_run() {
        let story = SyntheticStory::new(5, 100).rejecting(2);
        let backend = Arc::new(ScriptedBackend::synthetic(story));
        let config = small_config(500)
            .with_max_retries(1)
            .with_on_exhaustion(ExhaustionPolicy::Abort);
        let chapter_loop = ChapterLoop::new(backend, config);
        let result = chapter_loop.run("premise").await;

        assert_eq!(
            result.status,
            RunStatus::Aborted(AbortReason::QualityExhausted { chapter: 2 })
        );
        assert_eq!(result.chapters.len(), 1);
        assert_well_formed(&result);
    }
}

// =============================================================================
// Structural failures
// =============================================================================

mod failures {
    use super::*;

    #[tokio::test]
    async fn test_empty_outline_aborts() {
        let backend = Arc::new(ScriptedBackend::synthetic(SyntheticStory::new(5, 100)));
        backend.push(StageKind::Outliner, r#"{"chapters": []}"#);
        let chapter_loop = ChapterLoop::new(backend.clone(), small_config(500));
        let result = chapter_loop.run("premise").await;

        assert_eq!(result.status.to_string(), "aborted:outlining_failed");
        assert!(result.abort_detail.as_deref().unwrap().contains("outline has 0 chapters"));
        assert!(result.chapters.is_empty());
        assert!(result.setting.is_some());
        assert_eq!(backend.calls(StageKind::Writer), 0);
    }

    #[tokio::test]
    async fn test_unusable_plan_aborts() {
        let backend = Arc::new(ScriptedBackend::synthetic(SyntheticStory::new(5, 100)));
        backend.push(StageKind::Planner, "I would love to help with your story!");
        let chapter_loop = ChapterLoop::new(backend.clone(), small_config(500));
        let result = chapter_loop.run("premise").await;

        assert_eq!(result.status.to_string(), "aborted:planning_failed");
        let detail = result.abort_detail.as_deref().unwrap();
        assert!(detail.contains("malformed"), "detail was {:?}", detail);
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["abort_detail"], detail);
        assert!(result.chapters.is_empty());
        assert!(result.setting.is_none());
        assert_eq!(backend.calls(StageKind::Outliner), 0);
    }

    #[tokio::test]
    async fn test_writer_failure_is_retried() {
        let backend = Arc::new(ScriptedBackend::synthetic(SyntheticStory::new(2, 50)));
        backend.push_failure(StageKind::Writer, "connection reset");
        let chapter_loop = ChapterLoop::new(backend.clone(), small_config(100));
        let result = chapter_loop.run("premise").await;

        assert_eq!(result.status, RunStatus::Completed);
        let first = &result.chapters[0];
        assert_eq!(first.attempts, 2);
        assert!(!first.degraded);
        assert!(first.failed_stage.is_none());
        assert_eq!(result.stats.structural_failures, 1);
        assert_eq!(result.stats.quality_rejections, 0);
    }

    #[tokio::test]
    async fn test_near_empty_draft_is_structural() {
        let backend = Arc::new(ScriptedBackend::synthetic(SyntheticStory::new(1, 50)));
        backend.push(StageKind::Writer, "Mara.");
        let chapter_loop = ChapterLoop::new(backend.clone(), small_config(50));
        let result = chapter_loop.run("premise").await;

        assert_eq!(result.chapters[0].attempts, 2);
        assert_eq!(result.chapters[0].word_count, 50);
        assert_eq!(result.stats.structural_failures, 1);
    }

    #[tokio::test]
    async fn test_writer_exhaustion_commits_placeholder() {
        let backend = Arc::new(ScriptedBackend::synthetic(SyntheticStory::new(3, 50)));
        for _ in 0..3 {
            backend.push_failure(StageKind::Writer, "model overloaded");
        }
        let chapter_loop = ChapterLoop::new(backend, small_config(100).with_max_retries(2));
        let result = chapter_loop.run("premise").await;

        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.chapters.len(), 3);
        assert_well_formed(&result);

        let first = &result.chapters[0];
        assert_eq!(first.failed_stage, Some(StageKind::Writer));
        assert!(first.degraded);
        assert_eq!(first.word_count, 0);
        assert!(first.text.is_empty());
        assert_eq!(result.stats.failed, 1);
        assert!(result
            .manuscript()
            .contains("[This chapter could not be generated: the writer stage failed.]"));
    }

    #[tokio::test]
    async fn test_editor_exhaustion_commits_placeholder() {
        let backend = Arc::new(ScriptedBackend::synthetic(SyntheticStory::new(2, 50)));
        for _ in 0..2 {
            backend.push_failure(StageKind::Editor, "bad gateway");
        }
        let chapter_loop = ChapterLoop::new(backend.clone(), small_config(100).with_max_retries(1));
        let result = chapter_loop.run("premise").await;

        let first = &result.chapters[0];
        assert_eq!(first.failed_stage, Some(StageKind::Editor));
        assert!(first.degraded);
        assert_eq!(first.word_count, 0);
        assert_eq!(first.attempts, 1);

        let second = &result.chapters[1];
        assert!(second.failed_stage.is_none());
        assert_eq!(second.word_count, 50);
        assert_eq!(backend.calls(StageKind::Editor), 3);
        assert_eq!(first.edit_attempts, 2);
        assert_eq!(second.edit_attempts, 1);
        assert_eq!(result.stats.retries, 1);
        assert_eq!(result.status, RunStatus::TargetUnmet);
    }

    #[tokio::test]
    async fn test_reviewer_exhaustion_commits_placeholder() {
        let backend = Arc::new(ScriptedBackend::synthetic(SyntheticStory::new(2, 50)));
        let max_retries = 2;
        for _ in 0..=max_retries {
            backend.push(StageKind::Reviewer, "not json");
        }
        let config = small_config(100).with_max_retries(max_retries);
        let chapter_loop = ChapterLoop::new(backend.clone(), config);
        let result = chapter_loop.run("premise").await;

        assert_eq!(result.status, RunStatus::TargetUnmet);
        assert_eq!(result.chapters.len(), 2);
        assert_well_formed(&result);

        let first = &result.chapters[0];
        assert_eq!(first.failed_stage, Some(StageKind::Reviewer));
        assert!(first.degraded);
        assert_eq!(first.word_count, 0);
        assert_eq!(first.attempts, max_retries + 1);
        assert_eq!(first.edit_attempts, 0);

        let second = &result.chapters[1];
        assert!(second.failed_stage.is_none());
        assert_eq!(second.word_count, 50);
        assert_eq!(backend.calls(StageKind::Editor), 1);
        assert_eq!(result.stats.structural_failures, max_retries + 1);
        assert_eq!(result.stats.quality_rejections, 0);
    }

    #[tokio::test]
    async fn test_structural_exhaustion_ignores_abort_policy() {
        let backend = Arc::new(ScriptedBackend::synthetic(SyntheticStory::new(2, 50)));
        for _ in 0..2 {
            backend.push_failure(StageKind::Writer, "model overloaded");
        }
        let config = small_config(100)
            .with_max_retries(1)
            .with_on_exhaustion(ExhaustionPolicy::Abort);
        let chapter_loop = ChapterLoop::new(backend, config);
        let result = chapter_loop.run("premise").await;

        assert!(!result.status.is_aborted());
        assert_eq!(result.chapters.len(), 2);
        assert_eq!(result.chapters[0].failed_stage, Some(StageKind::Writer));
        assert_eq!(result.chapters[0].word_count, 0);
        assert_eq!(result.chapters[1].word_count, 50);
        assert_eq!(result.stats.failed, 1);
    }

    #[tokio::test]
    async fn test_timeouts_are_retried_then_degrade() {
        let backend = Arc::new(
            ScriptedBackend::synthetic(SyntheticStory::new(2, 50))
                .with_delay(StageKind::Writer, Duration::from_millis(200)),
        );
        let config = small_config(100)
            .with_max_retries(1)
            .with_call_timeout(Duration::from_millis(20));
        let chapter_loop = ChapterLoop::new(backend.clone(), config);
        let result = chapter_loop.run("premise").await;

        assert_eq!(result.status, RunStatus::TargetUnmet);
        assert_eq!(result.chapters.len(), 2);
        assert!(result
            .chapters
            .iter()
            .all(|c| c.failed_stage == Some(StageKind::Writer) && c.attempts == 2));
        assert_eq!(result.stats.timeouts, 4);
        assert_eq!(backend.calls(StageKind::Reviewer), 0);
    }
}

// =============================================================================
// Cancellation and progress
// =============================================================================

mod control {
    use super::*;

    #[tokio::test]
    async fn test_cancel_mid_run_keeps_committed_chapters() {
        let backend = Arc::new(
            ScriptedBackend::synthetic(SyntheticStory::new(10, 50))
                .with_delay(StageKind::Writer, Duration::from_millis(30)),
        );
        let chapter_loop = ChapterLoop::new(backend, small_config(500));
        let token = chapter_loop.cancellation_token();
        let mut rx = chapter_loop.progress();

        let canceller = async move {
            loop {
                if rx.borrow_and_update().chapters_committed >= 1 {
                    token.cancel();
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        };
        let (result, ()) = tokio::join!(chapter_loop.run("premise"), canceller);

        assert_eq!(result.status, RunStatus::Aborted(AbortReason::Cancelled));
        assert!(!result.chapters.is_empty());
        assert!(result.chapters.len() < 10);
        assert_well_formed(&result);
    }

    #[tokio::test]
    async fn test_progress_is_observable_during_run() {
        let backend = Arc::new(
            ScriptedBackend::synthetic(SyntheticStory::new(3, 50))
                .with_delay(StageKind::Reviewer, Duration::from_millis(5)),
        );
        let chapter_loop = ChapterLoop::new(backend, small_config(150));
        let mut rx = chapter_loop.progress();

        let watcher = async move {
            let mut seen = Vec::new();
            while rx.changed().await.is_ok() {
                let snapshot = rx.borrow_and_update().clone();
                seen.push(snapshot.words);
                if snapshot.phase.is_terminal() {
                    break;
                }
            }
            seen
        };
        let (result, seen) = tokio::join!(chapter_loop.run("premise"), watcher);

        assert_eq!(result.status, RunStatus::Completed);
        assert!(seen.windows(2).all(|w| w[0] <= w[1]), "word count never goes back");
        assert_eq!(seen.last().copied(), Some(150));
    }
}

// =============================================================================
// Narrative context
// =============================================================================

mod context {
    use super::*;

    fn setting() -> StorySetting {
        StorySetting {
            title: "The Tide Bell".to_string(),
            theme: "what the sea keeps".to_string(),
            genre: "maritime fantasy".to_string(),
            world_rules: BTreeMap::new(),
            target_words: 10_000,
            chapter_range: ChapterRange::new(1, 20),
        }
    }

    fn spec(index: u32) -> ChapterSpec {
        ChapterSpec::new(index, &format!("Tide {}", index), "Mara rings the bell", WordRange::new(80, 120))
    }

    #[test]
    fn test_window_never_exceeds_capacity() {
        for window in 1..=4 {
            let settings = ContextSettings {
                window,
                ..ContextSettings::default()
            };
            let mut context = NarrativeContext::new(
                setting(),
                vec![Character::new("mara", "Mara Quell", "protagonist")],
                settings,
            );
            for index in 1..=12 {
                let draft = ChapterDraft::new(
                    &spec(index),
                    format!("Mara walked the harbor wall on night {}.", index),
                    StageKind::Editor,
                    0,
                );
                let updates = [CharacterUpdate::new("mara", &format!("After tide {}", index))];
                context.commit(index, &draft, &updates).unwrap();
                assert!(context.window_len() <= window);
                assert!(context.snapshot_for(index + 1).recent.len() <= window);
            }
            assert_eq!(context.current_chapter(), 12);
        }
    }

    #[test]
    fn test_snapshot_is_idempotent() {
        let mut context = NarrativeContext::new(setting(), Vec::new(), ContextSettings::default());
        let draft = ChapterDraft::new(&spec(1), "The bell rang once.".to_string(), StageKind::Editor, 0);
        context.commit(1, &draft, &[]).unwrap();

        assert_eq!(context.snapshot_for(2), context.snapshot_for(2));
    }

    #[test]
    fn test_out_of_order_commit_is_rejected() {
        let mut context = NarrativeContext::new(setting(), Vec::new(), ContextSettings::default());
        let draft = ChapterDraft::new(&spec(2), "Too early.".to_string(), StageKind::Editor, 0);

        assert!(context.commit(2, &draft, &[]).is_err());
        assert_eq!(context.current_word_count(), 0);
        assert_eq!(context.current_chapter(), 0);
    }
}
