//! ============================================================================
//! Completion Client - Candidate generation via chat completions
//! ============================================================================
//! Sends the conversation window to an OpenAI-compatible
//! `/chat/completions` endpoint at a caller-chosen sampling temperature.
//! ============================================================================

use anyhow::anyhow;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::ProviderConfig;
use crate::types::{ConverseError, Message, Result};

/// Turns a conversation history into generated text
#[async_trait]
pub trait CompletionClient: Send + Sync {
    /// Generate the next assistant message. Fails with
    /// `CompletionUnavailable` on network / timeout / upstream errors.
    async fn generate(&self, history: &[Message], temperature: f32) -> Result<String>;

    /// Probe reachability of the service
    async fn health_check(&self) -> Result<()>;
}

/// Completion client for OpenAI-compatible APIs
pub struct HttpCompletionClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    max_tokens: u32,
    system_prompt: Option<String>,
}

impl HttpCompletionClient {
    pub fn new(api_key: String, base_url: String, model: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            max_tokens: 512,
            system_prompt: None,
        }
    }

    pub fn from_config(config: &ProviderConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| ConverseError::InvalidInput("no API key configured for completions".to_string()))?;
        Ok(Self::new(
            api_key,
            config.completion_base_url.clone(),
            config.completion_model.clone(),
        )
        .with_max_tokens(config.max_tokens))
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Prepend a system message to every request
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn build_request(&self, history: &[Message], temperature: f32) -> ChatRequest {
        let mut messages = Vec::with_capacity(history.len() + 1);
        if let Some(system) = &self.system_prompt {
            messages.push(ChatMessage {
                role: "system".to_string(),
                content: system.clone(),
            });
        }
        messages.extend(history.iter().map(|m| ChatMessage {
            role: m.role.as_str().to_string(),
            content: m.text.clone(),
        }));

        ChatRequest {
            model: self.model.clone(),
            messages,
            temperature: Some(temperature),
            max_tokens: Some(self.max_tokens),
        }
    }

    async fn call_api(&self, request: &ChatRequest) -> anyhow::Result<String> {
        debug!(
            "Calling completion API with {} messages (temperature {:?})",
            request.messages.len(),
            request.temperature
        );

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(request)
            .send()
            .await
            .map_err(|e| anyhow!("Failed to call completion API: {}", e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("Completion API error {}: {}", status, body));
        }

        let chat_response: ChatResponse = response
            .json()
            .await
            .map_err(|e| anyhow!("Failed to parse API response: {}", e))?;

        chat_response
            .choices
            .first()
            .map(|c| c.message.content.trim().to_string())
            .filter(|text| !text.is_empty())
            .ok_or_else(|| anyhow!("No response from API"))
    }
}

#[async_trait]
impl CompletionClient for HttpCompletionClient {
    async fn generate(&self, history: &[Message], temperature: f32) -> Result<String> {
        let request = self.build_request(history, temperature);
        self.call_api(&request)
            .await
            .map_err(|e| ConverseError::CompletionUnavailable(e.to_string()))
    }

    async fn health_check(&self) -> Result<()> {
        let response = self
            .client
            .get(format!("{}/models", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .send()
            .await
            .map_err(|e| ConverseError::CompletionUnavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ConverseError::CompletionUnavailable(format!(
                "health probe returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

// ============================================================================
// API Types
// ============================================================================

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}
