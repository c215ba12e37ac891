//! Configuration for quill, read from `quill.toml`.
//!
//! Layering is file → environment → CLI flags. Every field has a default, so
//! an empty file (or no file at all) is a valid configuration.
//!
//! # Configuration File Format
//!
//! ```toml
//! [run]
//! target_words = 50000
//! min_draft_words = 100
//! call_timeout_secs = 300
//!
//! [run.chapters]
//! min = 20
//! max = 30
//!
//! [context]
//! window = 3
//! summary_chars = 600
//! digest_chars = 12000
//!
//! [quality]
//! min_consistency = 0.7
//! min_coherence = 0.7
//! max_retries = 2
//! on_exhaustion = "degrade"
//!
//! [stages.writer]
//! max_tokens = 6000
//! temperature = 0.9
//!
//! [backend]
//! base_url = "https://api.openai.com/v1/"
//! model = "gpt-4.1"
//! api_key_env = "QUILL_API_KEY"
//!
//! [output]
//! dir = "quill-out"
//! ```

use crate::backend::{GenerationConstraints, OpenAiSettings};
use crate::context::ContextSettings;
use crate::gate::GatePolicy;
use crate::model::{ChapterRange, StageKind};
use crate::orchestrator::{DEFAULT_TARGET_WORDS, LoopConfig};
use crate::stages::{DEFAULT_MIN_DRAFT_WORDS, StageSettings};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE_NAME: &str = "quill.toml";

/// Run-level settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSection {
    #[serde(default = "default_target_words")]
    pub target_words: u64,
    #[serde(default = "default_chapters")]
    pub chapters: ChapterRange,
    /// Drafts shorter than this are treated as structural failures.
    #[serde(default = "default_min_draft_words")]
    pub min_draft_words: u32,
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
}

fn default_target_words() -> u64 {
    DEFAULT_TARGET_WORDS
}

fn default_chapters() -> ChapterRange {
    ChapterRange::new(20, 30)
}

fn default_min_draft_words() -> u32 {
    DEFAULT_MIN_DRAFT_WORDS
}

fn default_call_timeout_secs() -> u64 {
    300
}

impl Default for RunSection {
    fn default() -> Self {
        Self {
            target_words: default_target_words(),
            chapters: default_chapters(),
            min_draft_words: default_min_draft_words(),
            call_timeout_secs: default_call_timeout_secs(),
        }
    }
}

/// Where run artifacts go.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputSection {
    #[serde(default = "default_output_dir")]
    pub dir: PathBuf,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("quill-out")
}

impl Default for OutputSection {
    fn default() -> Self {
        Self {
            dir: default_output_dir(),
        }
    }
}

/// Complete `quill.toml` contents.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuillConfig {
    #[serde(default)]
    pub run: RunSection,
    #[serde(default)]
    pub context: ContextSettings,
    #[serde(default)]
    pub quality: GatePolicy,
    /// Per-stage generation constraints keyed by stage name.
    #[serde(default)]
    pub stages: BTreeMap<String, GenerationConstraints>,
    #[serde(default)]
    pub backend: OpenAiSettings,
    #[serde(default)]
    pub output: OutputSection,
}

impl QuillConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
            .with_context(|| format!("Invalid config file: {}", path.display()))
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse quill.toml")
    }

    /// Find and load the configuration file.
    ///
    /// Order: `explicit`, `./quill.toml`, `<config dir>/quill/quill.toml`,
    /// then defaults. Returns the file used, if any.
    pub fn discover(explicit: Option<&Path>) -> Result<(Self, Option<PathBuf>)> {
        if let Some(path) = explicit {
            return Ok((Self::load(path)?, Some(path.to_path_buf())));
        }
        for candidate in Self::search_paths() {
            if candidate.is_file() {
                let config = Self::load(&candidate)?;
                return Ok((config, Some(candidate)));
            }
        }
        Ok((Self::default(), None))
    }

    /// Candidate locations, most specific first.
    pub fn search_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from(CONFIG_FILE_NAME)];
        if let Some(dir) = dirs::config_dir() {
            paths.push(dir.join("quill").join(CONFIG_FILE_NAME));
        }
        paths
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = self.to_toml()?;
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize quill.toml")
    }

    /// Apply `QUILL_*` environment overrides.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary variable lookup.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = read("QUILL_TARGET_WORDS") {
            self.run.target_words = v
                .trim()
                .parse()
                .with_context(|| format!("QUILL_TARGET_WORDS is not a number: {}", v))?;
        }
        if let Some(v) = read("QUILL_MAX_RETRIES") {
            self.quality.max_retries = v
                .trim()
                .parse()
                .with_context(|| format!("QUILL_MAX_RETRIES is not a number: {}", v))?;
        }
        if let Some(v) = read("QUILL_TIMEOUT_SECS") {
            self.run.call_timeout_secs = v
                .trim()
                .parse()
                .with_context(|| format!("QUILL_TIMEOUT_SECS is not a number: {}", v))?;
        }
        if let Some(v) = read("QUILL_BASE_URL") {
            self.backend.base_url = v.trim().to_string();
        }
        if let Some(v) = read("QUILL_MODEL") {
            self.backend.model = v.trim().to_string();
        }
        Ok(())
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.run.call_timeout_secs)
    }

    /// Problems that make the configuration unusable.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.run.target_words == 0 {
            errors.push("run.target_words must be greater than 0".to_string());
        }
        if self.run.chapters.min == 0 {
            errors.push("run.chapters.min must be at least 1".to_string());
        }
        if self.run.chapters.min > self.run.chapters.max {
            errors.push(format!(
                "run.chapters.min ({}) is greater than run.chapters.max ({})",
                self.run.chapters.min, self.run.chapters.max
            ));
        }
        if self.run.call_timeout_secs == 0 {
            errors.push("run.call_timeout_secs must be greater than 0".to_string());
        }
        if self.context.window == 0 {
            errors.push("context.window must be at least 1".to_string());
        }
        for (name, value) in [
            ("quality.min_consistency", self.quality.min_consistency),
            ("quality.min_coherence", self.quality.min_coherence),
        ] {
            if !(0.0..=1.0).contains(&value) {
                errors.push(format!("{} must be within [0, 1], got {}", name, value));
            }
        }
        for (name, constraints) in &self.stages {
            if name.parse::<StageKind>().is_err() {
                errors.push(format!(
                    "Unknown stage '{}' in [stages]. Valid values: planner, outliner, writer, reviewer, editor",
                    name
                ));
            }
            if constraints.max_tokens == 0 {
                errors.push(format!("stages.{}.max_tokens must be greater than 0", name));
            }
        }

        errors
    }

    /// Settings that work but are probably not what was intended.
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        let max_reachable = u64::from(self.run.chapters.max) * 4000;
        if self.run.target_words > max_reachable {
            warnings.push(format!(
                "target_words {} needs more than 4000 words per chapter across {} chapters",
                self.run.target_words, self.run.chapters.max
            ));
        }
        if self.context.summary_chars < 100 {
            warnings.push(format!(
                "context.summary_chars {} leaves little room for key events",
                self.context.summary_chars
            ));
        }
        if self.context.digest_chars < self.context.summary_chars {
            warnings.push("context.digest_chars is smaller than context.summary_chars".to_string());
        }
        if self.quality.max_retries > 5 {
            warnings.push(format!(
                "quality.max_retries {} may multiply backend cost per chapter",
                self.quality.max_retries
            ));
        }
        for (name, constraints) in &self.stages {
            if !(0.0..=2.0).contains(&constraints.temperature) {
                warnings.push(format!(
                    "stages.{}.temperature {} is outside the usual [0, 2] range",
                    name, constraints.temperature
                ));
            }
        }

        warnings
    }

    /// Stage settings with per-stage constraints resolved.
    pub fn stage_settings(&self) -> StageSettings {
        let constraints = self
            .stages
            .iter()
            .filter_map(|(name, c)| name.parse::<StageKind>().ok().map(|stage| (stage, c.clone())))
            .collect();
        StageSettings {
            call_timeout: self.call_timeout(),
            min_draft_words: self.run.min_draft_words,
            constraints,
        }
    }

    /// Everything the chapter loop needs.
    pub fn loop_config(&self) -> LoopConfig {
        LoopConfig {
            target_words: self.run.target_words,
            chapters: self.run.chapters,
            context: self.context.clone(),
            gate: self.quality.clone(),
            stages: self.stage_settings(),
        }
    }
}
