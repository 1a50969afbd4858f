//! ============================================================================
//! Embedding Client - Vector embeddings for candidate scoring
//! ============================================================================
//! Generates text embeddings through an OpenAI-compatible `/embeddings`
//! endpoint. v3 embedding models honour the requested `dimensions`, so the
//! service returns vectors of exactly the configured width.
//! ============================================================================

use anyhow::anyhow;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::ProviderConfig;
use crate::types::{validate_embedding, ConverseError, Embedding, Result};

/// Turns text into a fixed-dimension vector
#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    /// Embed one piece of text. Fails with `EmbeddingUnavailable` on
    /// network / timeout / upstream errors.
    async fn embed(&self, text: &str) -> Result<Embedding>;

    /// Width of every vector this client returns
    fn dimension(&self) -> usize;

    /// Probe reachability of the service
    async fn health_check(&self) -> Result<()>;
}

/// Embedding client for OpenAI-compatible APIs
pub struct HttpEmbeddingClient {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    dimension: usize,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest {
    model: String,
    input: Vec<String>,
    dimensions: usize,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
    model: String,
    usage: Option<EmbeddingUsage>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

#[derive(Debug, Deserialize)]
#[allow(dead_code)]
struct EmbeddingUsage {
    prompt_tokens: u32,
    total_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
#[allow(dead_code)]
struct ErrorDetail {
    message: String,
    #[serde(rename = "type")]
    error_type: Option<String>,
}

impl HttpEmbeddingClient {
    /// Create with explicit endpoint settings
    pub fn new(api_key: String, base_url: String, model: String, dimension: usize) -> Self {
        Self {
            client: Client::new(),
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            dimension,
        }
    }

    /// Create from provider configuration
    pub fn from_config(config: &ProviderConfig, dimension: usize) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| ConverseError::InvalidInput("no API key configured for embeddings".to_string()))?;
        Ok(Self::new(
            api_key,
            config.embedding_base_url.clone(),
            config.embedding_model.clone(),
            dimension,
        ))
    }

    /// Generate embeddings for multiple texts, in input order
    pub async fn embed_many(&self, texts: Vec<String>) -> anyhow::Result<Vec<Embedding>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        debug!("Generating embeddings for {} texts", texts.len());

        let request = EmbeddingRequest {
            model: self.model.clone(),
            input: texts,
            dimensions: self.dimension,
        };

        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| anyhow!("Failed to send embedding request: {}", e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| anyhow!("Failed to read response body: {}", e))?;

        if !status.is_success() {
            if let Ok(error) = serde_json::from_str::<ErrorResponse>(&body) {
                return Err(anyhow!(
                    "Embedding API error ({}): {}",
                    status,
                    error.error.message
                ));
            }
            return Err(anyhow!("Embedding API error ({}): {}", status, body));
        }

        let embedding_response: EmbeddingResponse = serde_json::from_str(&body)
            .map_err(|e| anyhow!("Failed to parse embedding response: {} - body: {}", e, body))?;

        if let Some(usage) = &embedding_response.usage {
            debug!(
                "Embedding tokens used: {} (model: {})",
                usage.total_tokens, embedding_response.model
            );
        }

        let mut embeddings: Vec<(usize, Embedding)> = embedding_response
            .data
            .into_iter()
            .map(|d| (d.index, d.embedding))
            .collect();
        embeddings.sort_by_key(|(idx, _)| *idx);

        Ok(embeddings.into_iter().map(|(_, e)| e).collect())
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl EmbeddingClient for HttpEmbeddingClient {
    async fn embed(&self, text: &str) -> Result<Embedding> {
        let embedding = self
            .embed_many(vec![text.to_string()])
            .await
            .map_err(|e| ConverseError::EmbeddingUnavailable(e.to_string()))?
            .into_iter()
            .next()
            .ok_or_else(|| ConverseError::EmbeddingUnavailable("No embedding returned".to_string()))?;

        // A malformed vector from upstream is an upstream fault, not ours
        validate_embedding(&embedding, self.dimension)
            .map_err(|e| ConverseError::EmbeddingUnavailable(e.to_string()))?;
        Ok(embedding)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn health_check(&self) -> Result<()> {
        let response = self
            .client
            .get(format!("{}/models", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .send()
            .await
            .map_err(|e| ConverseError::EmbeddingUnavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ConverseError::EmbeddingUnavailable(format!(
                "health probe returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation() {
        let client = HttpEmbeddingClient::new(
            "test-key".to_string(),
            "https://api.openai.com/v1/".to_string(),
            "text-embedding-3-small".to_string(),
            384,
        );
        assert_eq!(client.base_url(), "https://api.openai.com/v1");
        assert_eq!(client.model(), "text-embedding-3-small");
        assert_eq!(client.dimension(), 384);
    }

    #[test]
    fn test_from_config_requires_key() {
        let config = ProviderConfig::default();
        assert!(HttpEmbeddingClient::from_config(&config, 384).is_err());

        let config = ProviderConfig {
            api_key: Some("k".to_string()),
            ..ProviderConfig::default()
        };
        assert!(HttpEmbeddingClient::from_config(&config, 384).is_ok());
    }

    #[tokio::test]
    async fn test_empty_input() {
        let client = HttpEmbeddingClient::new(
            "test-key".to_string(),
            "http://127.0.0.1:9".to_string(),
            "m".to_string(),
            8,
        );
        let result = client.embed_many(vec![]).await;
        assert!(result.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_service_is_embedding_unavailable() {
        let client = HttpEmbeddingClient::new(
            "test-key".to_string(),
            "http://127.0.0.1:9".to_string(),
            "m".to_string(),
            8,
        );
        let err = client.embed("hello").await.unwrap_err();
        assert!(matches!(err, ConverseError::EmbeddingUnavailable(_)));
        assert!(client.health_check().await.is_err());
    }
}
