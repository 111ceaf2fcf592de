use crate::error::{MarketContextError, Result};
use crate::llm::generator::TextGenerator;
use crate::llm::types::*;
use async_trait::async_trait;
use log::debug;
use reqwest::Client;

pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4";

/// Chat-completions client for OpenAI and compatible endpoints.
///
/// Makes exactly one HTTP request per call; retries and rate limiting belong
/// to [`crate::llm::GuardedGenerator`].
#[derive(Clone)]
pub struct OpenAiClient {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    max_tokens: Option<u32>,
}

impl OpenAiClient {
    pub fn new(api_key: String) -> Self {
        Self {
            client: Client::new(),
            api_key,
            base_url: OPENAI_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            max_tokens: None,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn chat_request(&self, request: &GenerationRequest) -> ChatRequest {
        ChatRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage::system(request.system_prompt.clone()),
                ChatMessage::user(request.user_prompt.clone()),
            ],
            temperature: request.temperature,
            max_tokens: self.max_tokens,
        }
    }
}

#[async_trait]
impl TextGenerator for OpenAiClient {
    async fn generate(&self, request: &GenerationRequest) -> Result<String> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.chat_request(request);

        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = res.status();
        if !status.is_success() {
            let error_text = res.text().await.unwrap_or_default();
            return Err(MarketContextError::ApiStatus {
                status: status.as_u16(),
                body: error_text,
            });
        }

        let response: ChatResponse = res.json().await?;
        if let Some(usage) = &response.usage {
            debug!(
                "{} used {} prompt + {} completion tokens",
                self.model, usage.prompt_tokens, usage.completion_tokens
            );
        }

        let choice = response.choices.into_iter().next().ok_or_else(|| {
            MarketContextError::Transport("completion response contained no choices".to_string())
        })?;
        if choice.finish_reason.as_deref() == Some("length") {
            debug!("Completion was truncated at the max token limit");
        }

        Ok(choice.message.content.unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_request_uses_configured_model() {
        let client = OpenAiClient::new("key".to_string())
            .with_model("gpt-4o-mini")
            .with_max_tokens(2000)
            .with_base_url("http://localhost:9999/v1/");

        let body = client.chat_request(&GenerationRequest::new("sys", "user"));
        assert_eq!(body.model, "gpt-4o-mini");
        assert_eq!(body.max_tokens, Some(2000));
        assert_eq!(body.temperature, 0.0);
        assert_eq!(body.messages[0].role, "system");
        assert_eq!(client.base_url, "http://localhost:9999/v1");
    }

    #[tokio::test]
    #[ignore] // Requires OPENAI_API_KEY and network access
    async fn test_live_completion() {
        let key = std::env::var("OPENAI_API_KEY").expect("OPENAI_API_KEY not set");
        let client = OpenAiClient::new(key);
        let text = client
            .generate(&GenerationRequest::new(
                "Reply with the JSON object {\"ok\": true} and nothing else.",
                "Go.",
            ))
            .await
            .unwrap();
        assert!(text.contains("ok"));
    }
}
