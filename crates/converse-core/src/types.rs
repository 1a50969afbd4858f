//! ============================================================================
//! Core Types - Shared data structures for Converse
//! ============================================================================
//! Messages, embeddings, turn/feedback results and the error taxonomy that
//! every component boundary speaks.
//! ============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Messages
// ============================================================================

/// Who authored a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    /// Wire name used by chat-completion APIs
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single message in a conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self::at(Role::User, text, Utc::now())
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::at(Role::Assistant, text, Utc::now())
    }

    /// Message with an explicit timestamp
    pub fn at(role: Role, text: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            role,
            text: text.into(),
            created_at,
        }
    }
}

// ============================================================================
// Embeddings
// ============================================================================

/// Default embedding width
pub const DEFAULT_EMBEDDING_DIM: usize = 384;

/// Fixed-length vector representation of a piece of text
pub type Embedding = Vec<f32>;

/// Reject vectors of the wrong width or carrying NaN/inf
pub fn validate_embedding(embedding: &[f32], dim: usize) -> Result<()> {
    if embedding.len() != dim {
        return Err(ConverseError::InvalidInput(format!(
            "embedding has {} dimensions, expected {}",
            embedding.len(),
            dim
        )));
    }
    if let Some(pos) = embedding.iter().position(|v| !v.is_finite()) {
        return Err(ConverseError::InvalidInput(format!(
            "embedding contains a non-finite value at index {}",
            pos
        )));
    }
    Ok(())
}

/// Reject empty or whitespace-only identifiers
pub fn validate_id(kind: &str, id: &str) -> Result<()> {
    if id.trim().is_empty() {
        return Err(ConverseError::InvalidInput(format!("{} must not be empty", kind)));
    }
    Ok(())
}

// ============================================================================
// Interactions & Feedback
// ============================================================================

/// What was scored and delivered for one turn, kept until feedback arrives
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InteractionRecord {
    pub user_id: String,
    pub conversation_id: String,
    /// Embedding of the user's message (best-effort)
    pub prompt_embedding: Option<Embedding>,
    /// Embedding of the delivered candidate, exactly as scored
    pub candidate_embedding: Embedding,
    pub generated_text: String,
    pub created_at: DateTime<Utc>,
}

/// One (embedding, label) pair used for training
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingSample {
    pub embedding: Embedding,
    pub label: f32,
    pub recorded_at: i64,
}

impl TrainingSample {
    pub fn new(embedding: Embedding, label: f32) -> Self {
        Self {
            embedding,
            label,
            recorded_at: Utc::now().timestamp(),
        }
    }
}

/// Historical text sample submitted for bulk retraining
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextSample {
    pub text: String,
    pub label: f32,
}

/// Clamp a feedback label into [0, 1]; NaN is not a label
pub fn clamp_label(label: f32) -> Result<f32> {
    if label.is_nan() {
        return Err(ConverseError::InvalidInput("label is NaN".to_string()));
    }
    Ok(label.clamp(0.0, 1.0))
}

// ============================================================================
// Turn / Feedback / Training Results
// ============================================================================

/// How a turn's reply was chosen
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TurnOutcome {
    /// Highest-scoring candidate out of `considered`
    Ranked { score: f32, considered: usize },
    /// Unranked reply after an upstream failure
    Degraded { reason: DegradeReason },
}

impl TurnOutcome {
    pub fn is_degraded(&self) -> bool {
        matches!(self, TurnOutcome::Degraded { .. })
    }
}

/// Why a turn fell back to an unranked reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradeReason {
    /// Every candidate failed; a single low-temperature fallback was used
    CandidatesFailed,
    /// The fallback failed too; a canned reply was used
    CompletionUnavailable,
    /// No candidate could be embedded; the first survivor was used
    EmbeddingFailed,
}

/// Reply to a chat turn
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnResponse {
    pub response_text: String,
    pub response_id: Uuid,
    pub outcome: TurnOutcome,
}

/// Acknowledgement of a feedback submission
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeedbackAck {
    /// False when the response id was unknown or already expired
    pub accepted: bool,
    /// Loss of the training step, when one ran
    pub loss: Option<f32>,
}

impl FeedbackAck {
    pub fn stale() -> Self {
        Self {
            accepted: false,
            loss: None,
        }
    }
}

/// Result of a bulk training run
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BatchTrainSummary {
    pub trained: usize,
    pub avg_loss: f32,
}

// ============================================================================
// Errors
// ============================================================================

/// Error types for Converse
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
pub enum ConverseError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Completion service unavailable: {0}")]
    CompletionUnavailable(String),

    #[error("Embedding service unavailable: {0}")]
    EmbeddingUnavailable(String),

    #[error("Persistence unavailable: {0}")]
    PersistenceUnavailable(String),

    #[error("Stale feedback: no interaction for response {0}")]
    StaleFeedback(Uuid),
}

impl ConverseError {
    /// Upstream failures are worth retrying; caller mistakes are not
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ConverseError::CompletionUnavailable(_)
                | ConverseError::EmbeddingUnavailable(_)
                | ConverseError::PersistenceUnavailable(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ConverseError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_embedding_dimension() {
        assert!(validate_embedding(&[0.1, 0.2, 0.3], 3).is_ok());
        let err = validate_embedding(&[0.1, 0.2], 3).unwrap_err();
        assert!(matches!(err, ConverseError::InvalidInput(_)));
    }

    #[test]
    fn test_validate_embedding_non_finite() {
        assert!(validate_embedding(&[0.1, f32::NAN, 0.3], 3).is_err());
        assert!(validate_embedding(&[f32::INFINITY, 0.0, 0.3], 3).is_err());
    }

    #[test]
    fn test_clamp_label() {
        assert_eq!(clamp_label(1.7).unwrap(), 1.0);
        assert_eq!(clamp_label(-0.2).unwrap(), 0.0);
        assert_eq!(clamp_label(0.4).unwrap(), 0.4);
        assert!(clamp_label(f32::NAN).is_err());
    }

    #[test]
    fn test_validate_id() {
        assert!(validate_id("conversation id", "c1").is_ok());
        assert!(validate_id("conversation id", "").is_err());
        assert!(validate_id("conversation id", "   ").is_err());
    }

    #[test]
    fn test_retryable_classification() {
        assert!(ConverseError::CompletionUnavailable("timeout".into()).is_retryable());
        assert!(ConverseError::EmbeddingUnavailable("502".into()).is_retryable());
        assert!(!ConverseError::InvalidInput("bad".into()).is_retryable());
    }

    #[test]
    fn test_outcome_serialization() {
        let outcome = TurnOutcome::Degraded {
            reason: DegradeReason::CandidatesFailed,
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["kind"], "degraded");
        assert_eq!(json["reason"], "candidates_failed");
    }
}
