//! ============================================================================
//! Feedback Ingestor - Ratings into training steps
//! ============================================================================
//! A rating for a delivered response trains the owning user's model on the
//! exact embedding that was scored for it. Bulk historical samples are
//! embedded and trained in one multi-epoch pass.
//!
//! Persistence after a rating runs on a tracked background task so the
//! caller gets the acknowledgement without waiting on the store; `flush()`
//! waits for all of them.
//! ============================================================================

use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::context::InteractionCache;
use crate::db::TrainingLog;
use crate::providers::EmbeddingClient;
use crate::ranking::{ModelHandle, ModelRegistry};
use crate::retry::{retry_with_backoff, RetryConfig, Upstream};
use crate::types::{
    clamp_label, validate_embedding, validate_id, BatchTrainSummary, ConverseError, FeedbackAck, Result,
    TextSample, TrainingSample,
};

/// Concurrent embedding calls during a bulk training run
const BATCH_EMBED_CONCURRENCY: usize = 8;

/// Applies user feedback to per-user ranking models
pub struct FeedbackIngestor {
    interactions: Arc<InteractionCache>,
    registry: Arc<ModelRegistry>,
    log: Arc<dyn TrainingLog>,
    embeddings: Arc<dyn EmbeddingClient>,
    retry: RetryConfig,
    pending: Mutex<Vec<JoinHandle<()>>>,
}

impl FeedbackIngestor {
    pub fn new(
        interactions: Arc<InteractionCache>,
        registry: Arc<ModelRegistry>,
        log: Arc<dyn TrainingLog>,
        embeddings: Arc<dyn EmbeddingClient>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            interactions,
            registry,
            log,
            embeddings,
            retry,
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Apply a rating to the response it refers to. Unknown or expired
    /// response ids are acknowledged with `accepted: false` and touch nothing.
    pub async fn submit(&self, response_id: Uuid, label: f32) -> Result<FeedbackAck> {
        let label = clamp_label(label)?;

        let record = match self.interactions.take(&response_id, Utc::now()).await {
            Some(record) => record,
            None => {
                debug!("{}", ConverseError::StaleFeedback(response_id));
                return Ok(FeedbackAck::stale());
            }
        };

        let model = self.registry.get(&record.user_id).await?;
        let loss = model.train_one(&record.candidate_embedding, label).await?;
        debug!(
            "Feedback {} for {}: label {:.2}, loss {:.4}",
            response_id, record.user_id, label, loss
        );

        let sample = TrainingSample::new(record.candidate_embedding, label);
        if let Err(e) = self.log.append(&record.user_id, &sample).await {
            warn!("Failed to log training sample for {}: {}", record.user_id, e);
        }

        self.schedule_persist(record.user_id).await;

        Ok(FeedbackAck {
            accepted: true,
            loss: Some(loss),
        })
    }

    async fn schedule_persist(&self, user_id: String) {
        let registry = self.registry.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = registry.persist(&user_id).await {
                warn!("Model for {} kept in memory only: {}", user_id, e);
            }
        });

        let mut pending = self.pending.lock().await;
        pending.retain(|handle| !handle.is_finished());
        pending.push(task);
    }

    /// Embed historical `(text, label)` samples and train on them. Samples
    /// whose text cannot be embedded are skipped; interaction records are
    /// left untouched.
    pub async fn batch_train(&self, user_id: &str, samples: Vec<TextSample>) -> Result<BatchTrainSummary> {
        validate_id("user id", user_id)?;
        if samples.is_empty() {
            return Ok(BatchTrainSummary {
                trained: 0,
                avg_loss: 0.0,
            });
        }

        let labelled = samples
            .into_iter()
            .map(|s| clamp_label(s.label).map(|label| (s.text, label)))
            .collect::<Result<Vec<_>>>()?;
        let requested = labelled.len();

        let dim = self.registry.config().embedding_dim;
        let embedded: Vec<Option<TrainingSample>> = stream::iter(labelled)
            .map(|(text, label)| {
                let embeddings = self.embeddings.clone();
                let retry = self.retry.clone();
                async move {
                    let result = retry_with_backoff(&retry, Upstream::Embedding, "embed sample", |_| {
                        let embeddings = embeddings.clone();
                        let text = text.clone();
                        async move { embeddings.embed(&text).await }
                    })
                    .await
                    .and_then(|embedding| validate_embedding(&embedding, dim).map(|_| embedding));

                    match result {
                        Ok(embedding) => Some(TrainingSample::new(embedding, label)),
                        Err(e) => {
                            warn!("Skipping sample that could not be embedded: {}", e);
                            None
                        }
                    }
                }
            })
            .buffered(BATCH_EMBED_CONCURRENCY)
            .collect()
            .await;

        let training: Vec<TrainingSample> = embedded.into_iter().flatten().collect();
        if training.is_empty() {
            return Err(ConverseError::EmbeddingUnavailable(format!(
                "none of {} samples could be embedded",
                requested
            )));
        }

        let model = self.registry.get(user_id).await?;
        for sample in &training {
            if let Err(e) = self.log.append(user_id, sample).await {
                warn!("Failed to log training sample for {}: {}", user_id, e);
                break;
            }
        }

        let summary = self.train_and_persist(user_id, &model, &training).await?;
        info!(
            "Batch trained {} on {}/{} samples (avg loss {:.4})",
            user_id, summary.trained, requested, summary.avg_loss
        );
        Ok(summary)
    }

    /// Retrain the user's model on every sample in their training log
    pub async fn retrain_from_log(&self, user_id: &str) -> Result<BatchTrainSummary> {
        validate_id("user id", user_id)?;
        let samples = self.log.samples(user_id).await?;
        if samples.is_empty() {
            return Ok(BatchTrainSummary {
                trained: 0,
                avg_loss: 0.0,
            });
        }

        let model = self.registry.get(user_id).await?;
        let summary = self.train_and_persist(user_id, &model, &samples).await?;
        info!(
            "Retrained {} from {} logged samples (avg loss {:.4})",
            user_id, summary.trained, summary.avg_loss
        );
        Ok(summary)
    }

    async fn train_and_persist(
        &self,
        user_id: &str,
        model: &ModelHandle,
        samples: &[TrainingSample],
    ) -> Result<BatchTrainSummary> {
        let epochs = self.registry.config().batch_epochs;
        let avg_loss = model.train_batch(samples, epochs).await?;

        if let Err(e) = self.registry.persist(user_id).await {
            warn!("Model for {} kept in memory only: {}", user_id, e);
        }

        Ok(BatchTrainSummary {
            trained: samples.len(),
            avg_loss,
        })
    }

    /// Wait for every scheduled persistence task
    pub async fn flush(&self) {
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.pending.lock().await);
        let count = handles.len();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Persistence task failed: {}", e);
            }
        }
        if count > 0 {
            debug!("Flushed {} persistence task(s)", count);
        }
    }

    pub async fn pending_count(&self) -> usize {
        let mut pending = self.pending.lock().await;
        pending.retain(|handle| !handle.is_finished());
        pending.len()
    }
}
