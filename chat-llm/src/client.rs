use crate::error::{LlmError, Result};
use crate::openai::OpenAiClient;
use crate::types::{Message, StreamChunk, ToolDefinition};
use async_trait::async_trait;
use futures_util::Stream;
use std::pin::Pin;
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk>> + Send>>;

/// Everything the model needs for one round-trip.
#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub system_prompt: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
}

/// Model boundary: one call per round-trip, streamed.
#[async_trait]
pub trait ModelClient: Send + Sync {
    fn model(&self) -> &str;

    async fn stream(&self, request: &ModelRequest) -> Result<ChunkStream>;
}

#[derive(Clone)]
pub struct LlmClient {
    base_url: String,
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl LlmClient {
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn new(base_url: Option<&str>, api_key: &str, model: &str, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(%e, "reqwest client build failed; falling back to default client");
                reqwest::Client::new()
            });
        Self {
            base_url: base_url
                .unwrap_or(DEFAULT_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            client,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn has_credentials(&self) -> bool {
        !self.api_key.trim().is_empty()
    }
}

#[async_trait]
impl ModelClient for LlmClient {
    fn model(&self) -> &str {
        &self.model
    }

    #[tracing::instrument(level = "info", skip_all, fields(model = %self.model))]
    async fn stream(&self, request: &ModelRequest) -> Result<ChunkStream> {
        if !self.has_credentials() {
            return Err(LlmError::NotConfigured("api key is empty".to_string()));
        }
        for t in &request.tools {
            validate_tool_name(&t.name)?;
        }
        let c = OpenAiClient::new(
            self.client.clone(),
            &self.base_url,
            &self.api_key,
            &self.model,
        );
        c.chat_stream(&request.system_prompt, &request.messages, &request.tools)
            .await
    }
}

/// Tool names must match `^[a-zA-Z0-9_-]{1,64}$` to be accepted by
/// OpenAI-compatible endpoints.
pub fn validate_tool_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 64 {
        return Err(LlmError::InvalidInput(format!(
            "tool name must be 1..=64 chars, got {}",
            name.len()
        )));
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-'))
    {
        return Err(LlmError::InvalidInput(format!(
            "tool name {name:?} contains invalid character {bad:?}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_names_are_validated() {
        assert!(validate_tool_name("getWeatherInformation").is_ok());
        assert!(validate_tool_name("cancel_scheduled-task").is_ok());
        assert!(validate_tool_name("").is_err());
        assert!(validate_tool_name("shell.execute").is_err());
        assert!(validate_tool_name(&"a".repeat(65)).is_err());
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let c = LlmClient::new(
            Some("https://example.test/v1/"),
            "k",
            "m",
            Duration::from_secs(5),
        );
        assert_eq!(c.base_url(), "https://example.test/v1");
        assert!(c.has_credentials());
    }

    #[tokio::test]
    async fn stream_without_api_key_is_not_configured() {
        let c = LlmClient::new(None, "  ", "m", Duration::from_secs(5));
        let req = ModelRequest {
            system_prompt: String::new(),
            messages: Vec::new(),
            tools: Vec::new(),
        };
        let err = c.stream(&req).await.err().expect("must fail");
        assert!(matches!(err, LlmError::NotConfigured(_)));
    }
}
