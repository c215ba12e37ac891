//! Story generation: `quill run`.

use anyhow::{Context, Result};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use quill::audit::AuditLogger;
use quill::backend::{GenerationBackend, OpenAiBackend, ScriptedBackend, SyntheticStory};
use quill::config::QuillConfig;
use quill::gate::ExhaustionPolicy;
use quill::model::ChapterRange;
use quill::orchestrator::{ChapterLoop, ProgressSnapshot, RunResult, RunStatus};
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;

use super::super::{Cli, RunArgs};
use super::{AUDIT_SUBDIR, load_config};

pub const MANUSCRIPT_FILE: &str = "manuscript.md";
pub const RESULT_FILE: &str = "result.json";

/// Words per chapter the dry-run backend aims for.
const DRY_RUN_WORDS_PER_CHAPTER: u64 = 2000;

pub async fn cmd_run(cli: &Cli, args: &RunArgs) -> Result<()> {
    let (mut config, source) = load_config(cli)?;
    apply_overrides(&mut config, args)?;

    let errors = config.validate();
    if !errors.is_empty() {
        anyhow::bail!("Invalid configuration:\n  - {}", errors.join("\n  - "));
    }
    for warning in config.warnings() {
        eprintln!("{} {}", style("warning:").yellow().bold(), warning);
    }
    if let Some(path) = &source {
        tracing::info!(config = %path.display(), "loaded configuration");
    }

    let premise = read_premise(args)?;
    let backend = build_backend(&config, args.dry_run)?;

    let output_dir = args
        .output
        .clone()
        .unwrap_or_else(|| config.output.dir.clone());
    std::fs::create_dir_all(&output_dir)
        .with_context(|| format!("Failed to create output directory: {}", output_dir.display()))?;

    let chapter_loop = ChapterLoop::new(backend, config.loop_config());

    let cancel = chapter_loop.cancellation_token();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nInterrupt received, stopping after the current stage...");
            cancel.cancel();
        }
    });

    let bar = progress_bar(config.run.target_words);
    let watcher = tokio::spawn(follow_progress(chapter_loop.progress(), bar.clone()));

    let mut audit = AuditLogger::new(&output_dir.join(AUDIT_SUBDIR));
    let result = chapter_loop.run_audited(&premise, &mut audit).await;

    ctrl_c.abort();
    watcher.abort();
    bar.finish_and_clear();

    let manuscript_path = write_outputs(&output_dir, &result)?;
    print_summary(&result, manuscript_path.as_deref());

    if let RunStatus::Aborted(reason) = &result.status {
        anyhow::bail!("Run aborted: {}", reason);
    }
    Ok(())
}

fn apply_overrides(config: &mut QuillConfig, args: &RunArgs) -> Result<()> {
    if let Some(words) = args.target_words {
        config.run.target_words = words;
    }
    if args.min_chapters.is_some() || args.max_chapters.is_some() {
        let min = args.min_chapters.unwrap_or(config.run.chapters.min);
        let max = args.max_chapters.unwrap_or(config.run.chapters.max);
        config.run.chapters = ChapterRange::new(min, max);
    }
    if let Some(window) = args.window {
        config.context.window = window;
    }
    if let Some(retries) = args.max_retries {
        config.quality.max_retries = retries;
    }
    if let Some(policy) = &args.on_exhaustion {
        config.quality.on_exhaustion = policy.parse::<ExhaustionPolicy>()?;
    }
    if let Some(secs) = args.timeout_secs {
        config.run.call_timeout_secs = secs;
    }
    Ok(())
}

fn read_premise(args: &RunArgs) -> Result<String> {
    let premise = if let Some(premise) = &args.premise {
        premise.clone()
    } else if let Some(path) = &args.premise_file {
        std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read premise file: {}", path.display()))?
    } else if std::io::stdin().is_terminal() {
        dialoguer::Input::<String>::new()
            .with_prompt("Story premise")
            .interact_text()
            .context("Failed to read premise")?
    } else {
        anyhow::bail!("No premise given. Use --premise or --premise-file.");
    };

    let premise = premise.trim().to_string();
    if premise.is_empty() {
        anyhow::bail!("Premise is empty");
    }
    Ok(premise)
}

/// Chapter count and length for the synthetic backend, sized to the target.
fn dry_run_story(config: &QuillConfig) -> SyntheticStory {
    let range = config.run.chapters;
    let wanted = config.run.target_words.div_ceil(DRY_RUN_WORDS_PER_CHAPTER);
    let chapters = (wanted.clamp(u64::from(range.min), u64::from(range.max)) as u32).max(1);
    let words = config.run.target_words.div_ceil(u64::from(chapters)).max(1);
    SyntheticStory::new(chapters, words.min(u64::from(u32::MAX)) as u32)
}

fn build_backend(config: &QuillConfig, dry_run: bool) -> Result<Arc<dyn GenerationBackend>> {
    if dry_run {
        return Ok(Arc::new(ScriptedBackend::synthetic(dry_run_story(config))));
    }
    let backend = OpenAiBackend::from_env(config.backend.clone()).with_context(|| {
        format!(
            "Set {} or use --dry-run to try quill without a model",
            config.backend.api_key_env
        )
    })?;
    Ok(Arc::new(backend))
}

fn progress_bar(target_words: u64) -> ProgressBar {
    let bar = ProgressBar::new(target_words);
    if let Ok(bar_style) = ProgressStyle::default_bar()
        .template("{prefix:.bold.dim} [{bar:40.cyan/blue}] {pos}/{len} words {msg}")
    {
        bar.set_style(bar_style.progress_chars("█▓▒░"));
    }
    bar.set_prefix("Story");
    bar
}

async fn follow_progress(mut rx: watch::Receiver<ProgressSnapshot>, bar: ProgressBar) {
    while rx.changed().await.is_ok() {
        let snapshot = rx.borrow_and_update().clone();
        bar.set_length(snapshot.target_words.max(snapshot.words));
        bar.set_position(snapshot.words);
        bar.set_message(snapshot.describe());
    }
}

/// Write the manuscript and result record. Returns the manuscript path when
/// one was written.
fn write_outputs(output_dir: &Path, result: &RunResult) -> Result<Option<PathBuf>> {
    let json = serde_json::to_string_pretty(result).context("Failed to serialize run result")?;
    let result_path = output_dir.join(RESULT_FILE);
    std::fs::write(&result_path, json)
        .with_context(|| format!("Failed to write {}", result_path.display()))?;

    if result.chapters.is_empty() {
        return Ok(None);
    }
    let manuscript_path = output_dir.join(MANUSCRIPT_FILE);
    std::fs::write(&manuscript_path, result.manuscript())
        .with_context(|| format!("Failed to write {}", manuscript_path.display()))?;
    Ok(Some(manuscript_path))
}

fn print_summary(result: &RunResult, manuscript: Option<&Path>) {
    let status = match &result.status {
        RunStatus::Completed => style(result.status.to_string()).green().bold(),
        RunStatus::TargetUnmet => style(result.status.to_string()).yellow().bold(),
        RunStatus::Aborted(_) => style(result.status.to_string()).red().bold(),
    };
    let stats = &result.stats;

    println!();
    if let Some(setting) = &result.setting {
        println!("{}", style(&setting.title).bold());
    }
    println!("Status:    {}", status);
    if let Some(detail) = &result.abort_detail {
        println!("Cause:     {}", style(detail).dim());
    }
    println!(
        "Words:     {} / {}",
        result.total_words(),
        result.target_words
    );
    println!("Chapters:  {}", stats.chapters);
    println!(
        "Retries:   {}  Degraded: {}  Failed: {}",
        stats.retries, stats.degraded, stats.failed
    );
    println!("Elapsed:   {:.1}s", stats.elapsed.as_secs_f64());

    let degraded: Vec<String> = result
        .degraded_chapters()
        .map(|c| c.index.to_string())
        .collect();
    if !degraded.is_empty() {
        println!(
            "{}",
            style(format!("Degraded chapters: {}", degraded.join(", "))).dim()
        );
    }
    if let Some(path) = manuscript {
        println!("Manuscript: {}", path.display());
    }
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dry_run_story_sizing() {
        let mut config = QuillConfig::default();
        let story = dry_run_story(&config);
        assert_eq!(story.chapters, 25);
        assert_eq!(story.words_per_chapter, 2000);

        config.run.target_words = 3000;
        config.run.chapters = ChapterRange::new(3, 5);
        let story = dry_run_story(&config);
        assert_eq!(story.chapters, 3);
        assert_eq!(story.words_per_chapter, 1000);
    }

    #[test]
    fn test_apply_overrides() {
        let mut config = QuillConfig::default();
        let args = RunArgs {
            target_words: Some(9000),
            max_chapters: Some(8),
            window: Some(5),
            on_exhaustion: Some("abort".to_string()),
            ..RunArgs::default()
        };
        apply_overrides(&mut config, &args).unwrap();
        assert_eq!(config.run.target_words, 9000);
        assert_eq!(config.run.chapters, ChapterRange::new(20, 8));
        assert_eq!(config.context.window, 5);
        assert_eq!(config.quality.on_exhaustion, ExhaustionPolicy::Abort);
        // min > max is reported by validation
        assert!(!config.validate().is_empty());
    }

    #[test]
    fn test_apply_overrides_rejects_bad_policy() {
        let mut config = QuillConfig::default();
        let args = RunArgs {
            on_exhaustion: Some("shrug".to_string()),
            ..RunArgs::default()
        };
        assert!(apply_overrides(&mut config, &args).is_err());
    }

    #[test]
    fn test_read_premise_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("premise.txt");
        std::fs::write(&path, "  A bell that rings the tide.\n").unwrap();
        let args = RunArgs {
            premise_file: Some(path),
            ..RunArgs::default()
        };
        assert_eq!(read_premise(&args).unwrap(), "A bell that rings the tide.");
    }

    #[test]
    fn test_read_premise_rejects_blank() {
        let args = RunArgs {
            premise: Some("   ".to_string()),
            ..RunArgs::default()
        };
        assert!(read_premise(&args).is_err());
    }
}
