//! Text-generation backends.
//!
//! The pipeline only ever sees [`GenerationBackend`]. Vendor configuration
//! (endpoints, keys, model names) lives inside the implementations.

mod openai;
mod scripted;

pub use openai::{OpenAiBackend, OpenAiSettings};
pub use scripted::{RecordedPrompt, ScriptedBackend, SyntheticStory, detect_stage};

use crate::errors::BackendError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Per-call generation limits passed through to the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationConstraints {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub stop: Vec<String>,
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_temperature() -> f32 {
    0.8
}

impl Default for GenerationConstraints {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            stop: Vec::new(),
        }
    }
}

/// Stateless request/response text generator.
///
/// Implementations must be safe to share between concurrent runs.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Generate a completion for `prompt`.
    async fn generate(
        &self,
        prompt: &str,
        constraints: &GenerationConstraints,
    ) -> Result<String, BackendError>;

    /// Short name for logs and run records.
    fn name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constraints_defaults_from_empty_toml() {
        let constraints: GenerationConstraints = toml::from_str("").unwrap();
        assert_eq!(constraints, GenerationConstraints::default());
        assert_eq!(constraints.max_tokens, 4096);
        assert!(constraints.stop.is_empty());
    }

    #[test]
    fn test_constraints_partial_override() {
        let constraints: GenerationConstraints =
            toml::from_str("temperature = 0.2\nstop = [\"###\"]").unwrap();
        assert_eq!(constraints.temperature, 0.2);
        assert_eq!(constraints.stop, vec!["###".to_string()]);
        assert_eq!(constraints.max_tokens, 4096);
    }
}
