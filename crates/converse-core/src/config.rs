//! ============================================================================
//! Configuration - Recognized options for Converse
//! ============================================================================
//! Defaults cover every option; `from_env` overlays `CONVERSE_*` variables
//! (after loading `.env`), and `validate` rejects nonsensical values.
//! ============================================================================

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

use crate::retry::RetryConfig;
use crate::types::{ConverseError, Result, DEFAULT_EMBEDDING_DIM};

/// Conversation history limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Messages kept per conversation (oldest dropped first)
    pub max_history: usize,
    /// Idle time after which a conversation is swept
    pub session_ttl_secs: u64,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_history: 20,
            session_ttl_secs: 3600,
        }
    }
}

impl ContextConfig {
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }
}

/// Shape and training of the per-user reranker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RankingConfig {
    pub embedding_dim: usize,
    pub hidden_units: usize,
    pub learning_rate: f32,
    /// Passes over the sample set in a batch training run
    pub batch_epochs: usize,
    /// Models untouched this long are persisted and dropped from memory
    pub idle_model_eviction_secs: u64,
}

impl Default for RankingConfig {
    fn default() -> Self {
        Self {
            embedding_dim: DEFAULT_EMBEDDING_DIM,
            hidden_units: 32,
            learning_rate: 0.001,
            batch_epochs: 5,
            idle_model_eviction_secs: 1800,
        }
    }
}

impl RankingConfig {
    pub fn idle_model_eviction(&self) -> Duration {
        Duration::from_secs(self.idle_model_eviction_secs)
    }
}

/// Candidate generation for a single turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub candidate_count: usize,
    /// Temperature of the coolest candidate
    pub min_temperature: f32,
    /// Temperature of the hottest candidate
    pub max_temperature: f32,
    /// Temperature of the single no-ranking fallback call
    pub fallback_temperature: f32,
    /// Reply used when even the fallback call fails
    pub apology_text: String,
    pub retry: RetryConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            candidate_count: 3,
            min_temperature: 0.3,
            max_temperature: 0.9,
            fallback_temperature: 0.2,
            apology_text: "Sorry, I can't come up with a good answer right now. Please try again in a moment."
                .to_string(),
            retry: RetryConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Distinct, ascending sampling temperatures, one per candidate
    pub fn temperatures(&self) -> Vec<f32> {
        let n = self.candidate_count.max(1);
        if n == 1 {
            return vec![self.min_temperature];
        }
        let step = (self.max_temperature - self.min_temperature) / (n - 1) as f32;
        (0..n)
            .map(|i| {
                let t = self.min_temperature + step * i as f32;
                // Keep 0.3/0.6/0.9 exact instead of 0.90000004
                (t * 1000.0).round() / 1000.0
            })
            .collect()
    }
}

/// OpenAI-compatible endpoints for the two external services
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub api_key: Option<String>,
    pub completion_base_url: String,
    pub completion_model: String,
    pub embedding_base_url: String,
    pub embedding_model: String,
    pub max_tokens: u32,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            completion_base_url: "https://api.openai.com/v1".to_string(),
            completion_model: "gpt-4o-mini".to_string(),
            embedding_base_url: "https://api.openai.com/v1".to_string(),
            embedding_model: "text-embedding-3-small".to_string(),
            max_tokens: 512,
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConverseConfig {
    pub context: ContextConfig,
    pub ranking: RankingConfig,
    pub orchestrator: OrchestratorConfig,
    pub providers: ProviderConfig,
    /// redb file for model state; `None` means the default location
    pub db_path: Option<String>,
    /// Period of the background sweep task
    pub maintenance_interval_secs: u64,
}

impl Default for ConverseConfig {
    fn default() -> Self {
        Self {
            context: ContextConfig::default(),
            ranking: RankingConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            providers: ProviderConfig::default(),
            db_path: None,
            maintenance_interval_secs: 60,
        }
    }
}

impl ConverseConfig {
    /// Defaults overlaid with `CONVERSE_*` environment variables
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            debug!("No .env file loaded: {}", e);
        }

        let mut config = Self::default();

        overlay(&mut config.context.max_history, "CONVERSE_MAX_HISTORY")?;
        overlay(&mut config.context.session_ttl_secs, "CONVERSE_SESSION_TTL_SECS")?;
        overlay(&mut config.ranking.embedding_dim, "CONVERSE_EMBEDDING_DIM")?;
        overlay(&mut config.ranking.hidden_units, "CONVERSE_HIDDEN_UNITS")?;
        overlay(&mut config.ranking.learning_rate, "CONVERSE_LEARNING_RATE")?;
        overlay(&mut config.ranking.batch_epochs, "CONVERSE_BATCH_EPOCHS")?;
        overlay(
            &mut config.ranking.idle_model_eviction_secs,
            "CONVERSE_IDLE_MODEL_EVICTION_SECS",
        )?;
        overlay(&mut config.orchestrator.candidate_count, "CONVERSE_CANDIDATE_COUNT")?;
        overlay(&mut config.orchestrator.retry.max_attempts, "CONVERSE_RETRY_ATTEMPTS")?;
        overlay(
            &mut config.orchestrator.retry.attempt_timeout_ms,
            "CONVERSE_CALL_TIMEOUT_MS",
        )?;
        overlay(&mut config.maintenance_interval_secs, "CONVERSE_MAINTENANCE_INTERVAL_SECS")?;

        config.providers.api_key = std::env::var("CONVERSE_API_KEY")
            .or_else(|_| std::env::var("OPENAI_API_KEY"))
            .ok()
            .filter(|k| !k.is_empty());
        overlay_string(&mut config.providers.completion_base_url, "CONVERSE_COMPLETION_URL");
        overlay_string(&mut config.providers.completion_model, "CONVERSE_COMPLETION_MODEL");
        overlay_string(&mut config.providers.embedding_base_url, "CONVERSE_EMBEDDING_URL");
        overlay_string(&mut config.providers.embedding_model, "CONVERSE_EMBEDDING_MODEL");
        config.db_path = std::env::var("CONVERSE_DB_PATH").ok();

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the components cannot run with
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(ConverseError::InvalidInput(msg.to_string()));

        if self.context.max_history == 0 {
            return invalid("max_history must be at least 1");
        }
        if self.context.session_ttl_secs == 0 {
            return invalid("session_ttl_secs must be positive");
        }
        if self.ranking.embedding_dim == 0 || self.ranking.hidden_units == 0 {
            return invalid("embedding_dim and hidden_units must be positive");
        }
        if !(self.ranking.learning_rate.is_finite() && self.ranking.learning_rate > 0.0) {
            return invalid("learning_rate must be a positive number");
        }
        if self.ranking.batch_epochs == 0 {
            return invalid("batch_epochs must be at least 1");
        }
        if self.orchestrator.candidate_count == 0 {
            return invalid("candidate_count must be at least 1");
        }
        if self.orchestrator.min_temperature > self.orchestrator.max_temperature {
            return invalid("min_temperature must not exceed max_temperature");
        }
        if self.maintenance_interval_secs == 0 {
            return invalid("maintenance_interval_secs must be positive");
        }
        if self.orchestrator.retry.max_attempts == 0 {
            return invalid("retry.max_attempts must be at least 1");
        }
        Ok(())
    }
}

fn overlay<T: FromStr>(target: &mut T, key: &str) -> Result<()> {
    if let Ok(raw) = std::env::var(key) {
        match raw.trim().parse() {
            Ok(value) => *target = value,
            Err(_) => {
                warn!("Unparsable value {}={}", key, raw);
                return Err(ConverseError::InvalidInput(format!("{} has invalid value '{}'", key, raw)));
            }
        }
    }
    Ok(())
}

fn overlay_string(target: &mut String, key: &str) {
    if let Ok(value) = std::env::var(key) {
        if !value.is_empty() {
            *target = value;
        }
    }
}
