// src/llm/client.rs
use crate::llm::models::{ChatMessage, ChatRequest, ChatResponse, ResponseFormat};
use crate::utils::error::LlmError;
use std::time::Duration;

const REQUEST_TIMEOUT_SECS: u64 = 180;
// Spacing between consecutive completions.
const REQUEST_DELAY_MS: u64 = 250;

/// Settings for the chat-completions endpoint.
#[derive(Debug, Clone)]
pub struct LlmSettings {
    pub api_base: String,
    pub api_key: String,
    pub model: String,
}

/// Minimal client for an OpenAI-compatible chat-completions API that always
/// asks for a JSON object back.
pub struct OpenAiClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
}

impl OpenAiClient {
    pub fn new(settings: LlmSettings) -> Result<Self, LlmError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            http,
            endpoint: format!("{}/chat/completions", settings.api_base.trim_end_matches('/')),
            api_key: settings.api_key,
            model: settings.model,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Sends one user message and parses the reply content as JSON.
    pub async fn complete_json(
        &self,
        message: ChatMessage,
        max_tokens: u32,
    ) -> Result<serde_json::Value, LlmError> {
        let request = ChatRequest {
            model: &self.model,
            messages: vec![message],
            response_format: ResponseFormat::json_object(),
            temperature: 0.0,
            max_tokens,
        };

        tokio::time::sleep(Duration::from_millis(REQUEST_DELAY_MS)).await;
        tracing::debug!("POST {} (model {}, max_tokens {})", self.endpoint, self.model, max_tokens);

        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!("LLM API error status: {}", status);
            return Err(LlmError::Http { status: status.as_u16(), body });
        }

        let completion: ChatResponse = response.json().await?;
        let choice = completion
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::Empty("no choices".to_string()))?;

        match choice.message.content {
            Some(content) if !content.trim().is_empty() => Ok(serde_json::from_str(&content)?),
            _ => Err(LlmError::Empty(choice.finish_reason.unwrap_or_else(|| "unknown".to_string()))),
        }
    }
}
