use super::{AuditRun, AuditTotals, ChapterAudit, CompactionEvent};
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

pub const CURRENT_RUN_FILE: &str = "current-run.json";
pub const RUNS_DIR: &str = "runs";

pub struct AuditLogger {
    audit_dir: PathBuf,
    current_run: Option<AuditRun>,
    current_run_file: PathBuf,
}

impl AuditLogger {
    pub fn new(audit_dir: &Path) -> Self {
        let current_run_file = audit_dir.join(CURRENT_RUN_FILE);
        Self {
            audit_dir: audit_dir.to_path_buf(),
            current_run: None,
            current_run_file,
        }
    }

    pub fn audit_dir(&self) -> &Path {
        &self.audit_dir
    }

    pub fn start_run(&mut self, run: AuditRun) -> Result<()> {
        fs::create_dir_all(self.audit_dir.join(RUNS_DIR))
            .with_context(|| format!("Failed to create {}", self.audit_dir.display()))?;
        self.current_run = Some(run);
        self.save_current()
    }

    /// Apply a mutation to the current run and persist the snapshot.
    ///
    /// Errors if no run is active.
    pub fn update<F>(&mut self, f: F) -> Result<()>
    where
        F: FnOnce(&mut AuditRun),
    {
        let run = self
            .current_run
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("update called with no active run"))?;
        f(run);
        self.save_current()
    }

    /// Record a committed chapter with the totals after it.
    pub fn record_chapter(&mut self, chapter: ChapterAudit, totals: AuditTotals) -> Result<()> {
        self.update(|run| {
            run.status = "chapter_iterating".to_string();
            run.chapters.push(chapter);
            run.totals = totals;
        })
    }

    /// Record a summary moving from the window into the digest.
    ///
    /// Buffered in memory; written with the next snapshot.
    pub fn record_compaction(&mut self, event: CompactionEvent) -> Result<()> {
        let run = self
            .current_run
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("record_compaction called with no active run"))?;
        run.compaction_events.push(event);
        Ok(())
    }

    pub fn finish_run(&mut self, status: &str, totals: AuditTotals) -> Result<PathBuf> {
        let run = self
            .current_run
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("No current run to finish"))?;

        run.finish(status);
        run.totals = totals;

        let filename = format!(
            "{}_{}.json",
            run.started_at.format("%Y-%m-%dT%H-%M-%S"),
            &run.run_id.to_string()[..8]
        );
        let run_file = self.audit_dir.join(RUNS_DIR).join(&filename);

        let json = serde_json::to_string_pretty(&run).context("Failed to serialize audit run")?;
        fs::write(&run_file, json).context("Failed to write audit run file")?;

        if self.current_run_file.exists() {
            fs::remove_file(&self.current_run_file)
                .context("Failed to remove current-run.json after finishing run")?;
        }

        self.current_run = None;
        Ok(run_file)
    }

    pub fn save_current(&self) -> Result<()> {
        if let Some(ref run) = self.current_run {
            let json =
                serde_json::to_string_pretty(&run).context("Failed to serialize current run")?;
            fs::write(&self.current_run_file, json).context("Failed to write current run file")?;
        }
        Ok(())
    }

    /// Load a snapshot left behind by a live (or interrupted) run.
    pub fn load_current(&mut self) -> Result<bool> {
        if self.current_run_file.exists() {
            let content = fs::read_to_string(&self.current_run_file)
                .context("Failed to read current run file")?;
            let run: AuditRun =
                serde_json::from_str(&content).context("Failed to parse current run file")?;
            self.current_run = Some(run);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    pub fn current_run(&self) -> Option<&AuditRun> {
        self.current_run.as_ref()
    }

    /// Finished run records, most recent first.
    pub fn list_runs(&self) -> Result<Vec<PathBuf>> {
        let runs_dir = self.audit_dir.join(RUNS_DIR);
        if !runs_dir.exists() {
            return Ok(Vec::new());
        }

        let mut runs: Vec<PathBuf> = fs::read_dir(&runs_dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().map(|e| e == "json").unwrap_or(false))
            .collect();

        runs.sort();
        runs.reverse();
        Ok(runs)
    }

    pub fn load_run(&self, path: &Path) -> Result<AuditRun> {
        let content = fs::read_to_string(path).context("Failed to read audit run file")?;
        let run: AuditRun =
            serde_json::from_str(&content).context("Failed to parse audit run file")?;
        Ok(run)
    }
}
