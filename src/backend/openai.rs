//! OpenAI-compatible chat-completions backend.

use super::{GenerationBackend, GenerationConstraints};
use crate::errors::BackendError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::instrument;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1/";
pub const DEFAULT_MODEL: &str = "gpt-4.1";
pub const DEFAULT_API_KEY_ENV: &str = "QUILL_API_KEY";

/// Connection settings for an OpenAI-compatible endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenAiSettings {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// Name of the environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_api_key_env() -> String {
    DEFAULT_API_KEY_ENV.to_string()
}

impl Default for OpenAiSettings {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_model(),
            api_key_env: default_api_key_env(),
        }
    }
}

impl OpenAiSettings {
    /// Full chat-completions URL, tolerant of a missing trailing slash.
    pub fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    stop: &'a [String],
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Backend talking to any OpenAI-compatible `/chat/completions` endpoint.
#[derive(Debug, Clone)]
pub struct OpenAiBackend {
    settings: OpenAiSettings,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAiBackend {
    /// Build a backend, reading the API key from `settings.api_key_env`.
    pub fn from_env(settings: OpenAiSettings) -> Result<Self, BackendError> {
        let api_key = std::env::var(&settings.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| {
                BackendError::NotConfigured(format!(
                    "environment variable {} is not set",
                    settings.api_key_env
                ))
            })?;
        Ok(Self::new(settings, api_key))
    }

    pub fn new(settings: OpenAiSettings, api_key: String) -> Self {
        tracing::debug!(base_url = %settings.base_url, model = %settings.model, "Creating chat-completions backend");
        Self {
            settings,
            api_key,
            client: reqwest::Client::new(),
        }
    }

    pub fn settings(&self) -> &OpenAiSettings {
        &self.settings
    }
}

#[async_trait]
impl GenerationBackend for OpenAiBackend {
    #[instrument(skip(self, prompt, constraints), fields(model = %self.settings.model, prompt_chars = prompt.len()))]
    async fn generate(
        &self,
        prompt: &str,
        constraints: &GenerationConstraints,
    ) -> Result<String, BackendError> {
        let request = ChatRequest {
            model: &self.settings.model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            max_tokens: constraints.max_tokens,
            temperature: constraints.temperature,
            stop: &constraints.stop,
        };

        let response = self
            .client
            .post(self.settings.completions_url())
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| BackendError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(status = status.as_u16(), "Chat completion returned an error status");
            return Err(BackendError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Decode(e.to_string()))?;

        extract_content(parsed)
    }

    fn name(&self) -> &str {
        &self.settings.model
    }
}

fn extract_content(response: ChatResponse) -> Result<String, BackendError> {
    response
        .choices
        .into_iter()
        .next()
        .map(|choice| choice.message.content.unwrap_or_default())
        .ok_or_else(|| BackendError::Decode("response contained no choices".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completions_url_handles_trailing_slash() {
        let mut settings = OpenAiSettings::default();
        assert_eq!(
            settings.completions_url(),
            "https://api.openai.com/v1/chat/completions"
        );
        settings.base_url = "http://localhost:8080/v1".to_string();
        assert_eq!(
            settings.completions_url(),
            "http://localhost:8080/v1/chat/completions"
        );
    }

    #[test]
    fn test_request_serialization_omits_empty_stop() {
        let request = ChatRequest {
            model: "gpt-4.1",
            messages: vec![ChatMessage {
                role: "user",
                content: "hi",
            }],
            max_tokens: 100,
            temperature: 0.5,
            stop: &[],
        };
        let json = serde_json::to_value(&request).unwrap();
        assert!(json.get("stop").is_none());
        assert_eq!(json["messages"][0]["content"], "hi");
    }

    #[test]
    fn test_extract_content_first_choice() {
        let response: ChatResponse = serde_json::from_str(
            r#"{"choices":[{"message":{"role":"assistant","content":"Once upon"}}]}"#,
        )
        .unwrap();
        assert_eq!(extract_content(response).unwrap(), "Once upon");
    }

    #[test]
    fn test_extract_content_no_choices_is_decode_error() {
        let response: ChatResponse = serde_json::from_str(r#"{"choices":[]}"#).unwrap();
        assert!(matches!(
            extract_content(response),
            Err(BackendError::Decode(_))
        ));
    }

    #[test]
    fn test_from_env_missing_key() {
        let settings = OpenAiSettings {
            api_key_env: "QUILL_TEST_KEY_THAT_IS_NEVER_SET".to_string(),
            ..OpenAiSettings::default()
        };
        let err = OpenAiBackend::from_env(settings).unwrap_err();
        assert!(err.to_string().contains("QUILL_TEST_KEY_THAT_IS_NEVER_SET"));
    }
}
