//! ============================================================================
//! Response Orchestrator - One chat turn, end to end
//! ============================================================================
//! ```text
//! CollectingContext → GeneratingCandidates → Embedding → Ranking → Selected → Delivered
//!                            │                   │
//!                            └──── failures ─────┴──→ DegradedDelivered
//! ```
//! Candidates are generated concurrently at ascending temperatures, embedded,
//! scored by the user's ranking model and the best one is returned. Upstream
//! failures degrade the reply; they never fail the turn.
//!
//! Every external call runs on its own spawned task. If the caller drops the
//! turn, in-flight calls finish in the background and their results are
//! discarded.
//! ============================================================================

use chrono::Utc;
use futures_util::future::join_all;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::context::{ConversationStore, InteractionCache};
use crate::providers::{CompletionClient, EmbeddingClient};
use crate::ranking::ModelRegistry;
use crate::retry::{retry_with_backoff, RetryConfig, Upstream};
use crate::types::{
    validate_embedding, validate_id, ConverseError, DegradeReason, Embedding, InteractionRecord,
    Message, Result, TurnOutcome, TurnResponse,
};

/// Stages of a turn, logged as the turn progresses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    CollectingContext,
    GeneratingCandidates,
    Embedding,
    Ranking,
    Selected,
    Delivered,
    DegradedDelivered,
}

/// A generated reply and the temperature it was sampled at
#[derive(Debug, Clone)]
struct Candidate {
    temperature: f32,
    text: String,
}

/// A candidate that survived embedding
struct EmbeddedCandidate {
    candidate: Candidate,
    embedding: Embedding,
}

/// Picked reply, before it is appended and recorded
struct Selection {
    text: String,
    embedding: Option<Embedding>,
    outcome: TurnOutcome,
}

/// Coordinates context, generation, embedding and ranking for each turn
pub struct ResponseOrchestrator {
    conversations: Arc<ConversationStore>,
    interactions: Arc<InteractionCache>,
    registry: Arc<ModelRegistry>,
    completion: Arc<dyn CompletionClient>,
    embeddings: Arc<dyn EmbeddingClient>,
    config: OrchestratorConfig,
}

impl ResponseOrchestrator {
    pub fn new(
        conversations: Arc<ConversationStore>,
        interactions: Arc<InteractionCache>,
        registry: Arc<ModelRegistry>,
        completion: Arc<dyn CompletionClient>,
        embeddings: Arc<dyn EmbeddingClient>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            conversations,
            interactions,
            registry,
            completion,
            embeddings,
            config,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Run one chat turn. Only caller mistakes (`InvalidInput`) are errors;
    /// upstream failures produce a degraded reply instead.
    pub async fn turn(&self, user_id: &str, conversation_id: &str, user_text: &str) -> Result<TurnResponse> {
        validate_id("user id", user_id)?;
        validate_id("conversation id", conversation_id)?;
        if user_text.trim().is_empty() {
            return Err(ConverseError::InvalidInput("message text must not be empty".to_string()));
        }
        self.enter(conversation_id, TurnState::CollectingContext);
        // Rejects conversations owned by another user
        self.conversations
            .append(conversation_id, user_id, Message::user(user_text))
            .await?;
        let window = Arc::new(
            self.conversations
                .get_window(conversation_id, self.conversations.max_history())
                .await,
        );

        self.enter(conversation_id, TurnState::GeneratingCandidates);
        let candidates = self.generate_candidates(&window).await;

        let (selection, prompt_embedding) = if candidates.is_empty() {
            warn!(
                "Conversation {}: all {} candidates failed, falling back",
                conversation_id, self.config.candidate_count
            );
            (self.fallback(&window).await, None)
        } else {
            self.enter(conversation_id, TurnState::Embedding);
            let (embedded, prompt_embedding) = self.embed_candidates(&candidates, user_text).await;

            if embedded.is_empty() {
                warn!(
                    "Conversation {}: no candidate could be embedded, delivering unranked",
                    conversation_id
                );
                let selection = Selection {
                    text: candidates[0].text.clone(),
                    embedding: None,
                    outcome: TurnOutcome::Degraded {
                        reason: DegradeReason::EmbeddingFailed,
                    },
                };
                (selection, None)
            } else {
                self.enter(conversation_id, TurnState::Ranking);
                (self.rank(user_id, embedded).await?, prompt_embedding)
            }
        };

        self.deliver(user_id, conversation_id, selection, prompt_embedding)
            .await
    }

    fn enter(&self, conversation_id: &str, state: TurnState) {
        debug!("Conversation {}: {:?}", conversation_id, state);
    }

    /// Generate `candidate_count` replies concurrently; survivors keep
    /// ascending temperature order
    async fn generate_candidates(&self, window: &Arc<Vec<Message>>) -> Vec<Candidate> {
        let tasks: Vec<_> = self
            .config
            .temperatures()
            .into_iter()
            .map(|temperature| {
                let completion = self.completion.clone();
                let window = window.clone();
                let retry = self.config.retry.clone();
                let task = tokio::spawn(async move {
                    retry_with_backoff(&retry, Upstream::Completion, "generate candidate", |_| {
                        let completion = completion.clone();
                        let window = window.clone();
                        async move { completion.generate(&window, temperature).await }
                    })
                    .await
                });
                (temperature, task)
            })
            .collect();

        let (temperatures, handles): (Vec<f32>, Vec<_>) = tasks.into_iter().unzip();
        let results = join_all(handles).await;

        let mut candidates = Vec::new();
        for (temperature, result) in temperatures.into_iter().zip(results) {
            match result {
                Ok(Ok(text)) => candidates.push(Candidate { temperature, text }),
                Ok(Err(e)) => warn!("Candidate at temperature {} failed: {}", temperature, e),
                Err(e) => warn!("Candidate task at temperature {} aborted: {}", temperature, e),
            }
        }
        candidates
    }

    /// Single low-temperature attempt after every candidate failed, then the
    /// canned apology
    async fn fallback(&self, window: &Arc<Vec<Message>>) -> Selection {
        let completion = self.completion.clone();
        let history = window.clone();
        let temperature = self.config.fallback_temperature;
        let retry = RetryConfig {
            max_attempts: 1,
            ..self.config.retry.clone()
        };

        let result = tokio::spawn(async move {
            retry_with_backoff(&retry, Upstream::Completion, "fallback completion", |_| {
                let completion = completion.clone();
                let history = history.clone();
                async move { completion.generate(&history, temperature).await }
            })
            .await
        })
        .await;

        match result {
            Ok(Ok(text)) => {
                // Best-effort embedding so feedback on the fallback still trains
                let embedding = self.embed_one(text.clone()).await.ok();
                Selection {
                    text,
                    embedding,
                    outcome: TurnOutcome::Degraded {
                        reason: DegradeReason::CandidatesFailed,
                    },
                }
            }
            Ok(Err(e)) => {
                warn!("Fallback completion failed, sending apology: {}", e);
                self.apology()
            }
            Err(e) => {
                warn!("Fallback completion task aborted, sending apology: {}", e);
                self.apology()
            }
        }
    }

    fn apology(&self) -> Selection {
        Selection {
            text: self.config.apology_text.clone(),
            embedding: None,
            outcome: TurnOutcome::Degraded {
                reason: DegradeReason::CompletionUnavailable,
            },
        }
    }

    /// Embed every candidate and, best-effort, the user prompt. Candidates
    /// whose embedding fails or is malformed are dropped.
    async fn embed_candidates(
        &self,
        candidates: &[Candidate],
        prompt: &str,
    ) -> (Vec<EmbeddedCandidate>, Option<Embedding>) {
        let prompt_task = self.spawn_embed(prompt.to_string());
        let candidate_tasks: Vec<_> = candidates
            .iter()
            .map(|c| self.spawn_embed(c.text.clone()))
            .collect();

        let (prompt_result, candidate_results) = tokio::join!(prompt_task, join_all(candidate_tasks));

        let prompt_embedding = match prompt_result {
            Ok(Ok(embedding)) => Some(embedding),
            Ok(Err(e)) => {
                debug!("Prompt embedding unavailable: {}", e);
                None
            }
            Err(e) => {
                debug!("Prompt embedding task aborted: {}", e);
                None
            }
        };

        let mut embedded = Vec::new();
        for (candidate, result) in candidates.iter().zip(candidate_results) {
            match result {
                Ok(Ok(embedding)) => embedded.push(EmbeddedCandidate {
                    candidate: candidate.clone(),
                    embedding,
                }),
                Ok(Err(e)) => warn!(
                    "Dropping candidate at temperature {}: {}",
                    candidate.temperature, e
                ),
                Err(e) => warn!(
                    "Embedding task for temperature {} aborted: {}",
                    candidate.temperature, e
                ),
            }
        }
        (embedded, prompt_embedding)
    }

    async fn embed_one(&self, text: String) -> Result<Embedding> {
        self.spawn_embed(text)
            .await
            .map_err(|e| ConverseError::EmbeddingUnavailable(format!("embedding task aborted: {}", e)))?
    }

    fn spawn_embed(&self, text: String) -> tokio::task::JoinHandle<Result<Embedding>> {
        let embeddings = self.embeddings.clone();
        let retry = self.config.retry.clone();
        let dim = self.registry.config().embedding_dim;
        tokio::spawn(async move {
            let embedding = retry_with_backoff(&retry, Upstream::Embedding, "embed text", |_| {
                let embeddings = embeddings.clone();
                let text = text.clone();
                async move { embeddings.embed(&text).await }
            })
            .await?;
            validate_embedding(&embedding, dim).map_err(|e| ConverseError::EmbeddingUnavailable(e.to_string()))?;
            Ok(embedding)
        })
    }

    /// Score embedded candidates with the user's model
    async fn rank(&self, user_id: &str, embedded: Vec<EmbeddedCandidate>) -> Result<Selection> {
        let model = self.registry.get(user_id).await?;

        let mut scored = Vec::with_capacity(embedded.len());
        for candidate in embedded {
            let score = model.score(&candidate.embedding).await;
            match &score {
                Ok(score) => debug!(
                    "Candidate at temperature {} scored {:.4}",
                    candidate.candidate.temperature, score
                ),
                Err(e) => warn!(
                    "Could not score candidate at temperature {}: {}",
                    candidate.candidate.temperature, e
                ),
            }
            scored.push((candidate, score));
        }
        Ok(select_best(scored))
    }

    /// Append the reply to the conversation and record what was delivered
    async fn deliver(
        &self,
        user_id: &str,
        conversation_id: &str,
        selection: Selection,
        prompt_embedding: Option<Embedding>,
    ) -> Result<TurnResponse> {
        let final_state = if selection.outcome.is_degraded() {
            TurnState::DegradedDelivered
        } else {
            self.enter(conversation_id, TurnState::Selected);
            TurnState::Delivered
        };

        self.conversations
            .append(conversation_id, user_id, Message::assistant(selection.text.clone()))
            .await?;

        let response_id = match selection.embedding {
            Some(candidate_embedding) => {
                self.interactions
                    .insert(InteractionRecord {
                        user_id: user_id.to_string(),
                        conversation_id: conversation_id.to_string(),
                        prompt_embedding,
                        candidate_embedding,
                        generated_text: selection.text.clone(),
                        created_at: Utc::now(),
                    })
                    .await
            }
            None => Uuid::new_v4(),
        };

        self.enter(conversation_id, final_state);
        match &selection.outcome {
            TurnOutcome::Ranked { score, considered } => info!(
                "Conversation {}: delivered {} (score {:.4} of {} candidates)",
                conversation_id, response_id, score, considered
            ),
            TurnOutcome::Degraded { reason } => warn!(
                "Conversation {}: delivered degraded reply {} ({:?})",
                conversation_id, response_id, reason
            ),
        }

        Ok(TurnResponse {
            response_text: selection.text,
            response_id,
            outcome: selection.outcome,
        })
    }
}

/// Highest-scoring candidate. Strictly-greater comparison over ascending
/// temperatures breaks ties toward the lowest. When nothing could be scored
/// the lowest-temperature candidate is delivered unranked.
fn select_best(scored: Vec<(EmbeddedCandidate, Result<f32>)>) -> Selection {
    let considered = scored.len();
    let mut first: Option<String> = None;
    let mut best: Option<(f32, EmbeddedCandidate)> = None;

    for (candidate, score) in scored {
        if first.is_none() {
            first = Some(candidate.candidate.text.clone());
        }
        let score = match score {
            Ok(score) => score,
            Err(_) => continue,
        };
        let better = match &best {
            Some((best_score, _)) => score > *best_score,
            None => true,
        };
        if better {
            best = Some((score, candidate));
        }
    }

    match best {
        Some((score, chosen)) => Selection {
            text: chosen.candidate.text,
            embedding: Some(chosen.embedding),
            outcome: TurnOutcome::Ranked { score, considered },
        },
        None => Selection {
            text: first.unwrap_or_default(),
            embedding: None,
            outcome: TurnOutcome::Degraded {
                reason: DegradeReason::EmbeddingFailed,
            },
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn embedded(temperature: f32, text: &str) -> EmbeddedCandidate {
        EmbeddedCandidate {
            candidate: Candidate {
                temperature,
                text: text.to_string(),
            },
            embedding: vec![temperature; 4],
        }
    }

    fn unscorable() -> Result<f32> {
        Err(ConverseError::InvalidInput("embedding dimension mismatch".to_string()))
    }

    #[test]
    fn test_select_best_prefers_highest_score() {
        let selection = select_best(vec![
            (embedded(0.2, "low"), Ok(0.3)),
            (embedded(0.6, "mid"), Ok(0.9)),
            (embedded(1.0, "high"), Ok(0.4)),
        ]);
        assert_eq!(selection.text, "mid");
        assert_eq!(selection.embedding, Some(vec![0.6; 4]));
        assert_eq!(selection.outcome, TurnOutcome::Ranked { score: 0.9, considered: 3 });
    }

    #[test]
    fn test_select_best_ties_go_to_lowest_temperature() {
        let selection = select_best(vec![
            (embedded(0.2, "low"), Ok(0.5)),
            (embedded(0.6, "mid"), Ok(0.5)),
        ]);
        assert_eq!(selection.text, "low");
    }

    #[test]
    fn test_select_best_skips_unscorable_candidates() {
        let selection = select_best(vec![
            (embedded(0.2, "low"), unscorable()),
            (embedded(0.6, "mid"), Ok(0.1)),
        ]);
        assert_eq!(selection.text, "mid");
        assert_eq!(selection.outcome, TurnOutcome::Ranked { score: 0.1, considered: 2 });
    }

    #[test]
    fn test_select_best_delivers_first_candidate_when_none_scored() {
        let selection = select_best(vec![
            (embedded(0.2, "low"), unscorable()),
            (embedded(0.6, "mid"), unscorable()),
        ]);
        assert_eq!(selection.text, "low");
        assert!(selection.embedding.is_none());
        assert_eq!(
            selection.outcome,
            TurnOutcome::Degraded {
                reason: DegradeReason::EmbeddingFailed
            }
        );
    }
}
