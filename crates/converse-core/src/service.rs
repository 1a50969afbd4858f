//! ============================================================================
//! Converse Service - Wiring and public entry points
//! ============================================================================
//! Builds every component from one `ConverseConfig` and exposes the turn,
//! feedback and training operations, health probes, user-data deletion and
//! the periodic maintenance sweep.
//! ============================================================================

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ConverseConfig;
use crate::context::{ConversationStore, InteractionCache};
use crate::db::{ConverseDb, ModelStore, TrainingLog};
use crate::feedback::FeedbackIngestor;
use crate::health::{HealthReport, ServiceStatus};
use crate::orchestrator::ResponseOrchestrator;
use crate::providers::{CompletionClient, EmbeddingClient, HttpCompletionClient, HttpEmbeddingClient};
use crate::ranking::ModelRegistry;
use crate::types::{BatchTrainSummary, ConverseError, FeedbackAck, Result, TextSample, TurnResponse};

/// Conversational context manager with per-user response reranking
pub struct ConverseService {
    conversations: Arc<ConversationStore>,
    interactions: Arc<InteractionCache>,
    registry: Arc<ModelRegistry>,
    log: Arc<dyn TrainingLog>,
    completion: Arc<dyn CompletionClient>,
    embeddings: Arc<dyn EmbeddingClient>,
    orchestrator: ResponseOrchestrator,
    feedback: FeedbackIngestor,
    maintenance_interval: Duration,
}

impl ConverseService {
    /// Assemble the service from injected collaborators
    pub fn new(
        config: &ConverseConfig,
        completion: Arc<dyn CompletionClient>,
        embeddings: Arc<dyn EmbeddingClient>,
        store: Arc<dyn ModelStore>,
        log: Arc<dyn TrainingLog>,
    ) -> Result<Self> {
        config.validate()?;
        if embeddings.dimension() != config.ranking.embedding_dim {
            return Err(ConverseError::InvalidInput(format!(
                "embedding client returns {}-dim vectors but models expect {}",
                embeddings.dimension(),
                config.ranking.embedding_dim
            )));
        }

        let retry = config.orchestrator.retry.clone();
        let conversations = Arc::new(ConversationStore::new(&config.context));
        let interactions = Arc::new(InteractionCache::new(config.context.session_ttl()));
        let registry = Arc::new(ModelRegistry::new(store, config.ranking.clone()).with_retry(retry.clone()));

        let orchestrator = ResponseOrchestrator::new(
            conversations.clone(),
            interactions.clone(),
            registry.clone(),
            completion.clone(),
            embeddings.clone(),
            config.orchestrator.clone(),
        );
        let feedback = FeedbackIngestor::new(
            interactions.clone(),
            registry.clone(),
            log.clone(),
            embeddings.clone(),
            retry,
        );

        Ok(Self {
            conversations,
            interactions,
            registry,
            log,
            completion,
            embeddings,
            orchestrator,
            feedback,
            maintenance_interval: Duration::from_secs(config.maintenance_interval_secs),
        })
    }

    /// HTTP clients from `config.providers`, model state in `db`
    pub fn from_config(config: &ConverseConfig, db: ConverseDb) -> Result<Self> {
        let completion = HttpCompletionClient::from_config(&config.providers)?;
        let embeddings = HttpEmbeddingClient::from_config(&config.providers, config.ranking.embedding_dim)?;
        let db = Arc::new(db);

        info!(
            "Converse service using {} for completions and {} for embeddings",
            completion.model(),
            embeddings.model()
        );

        Self::new(config, Arc::new(completion), Arc::new(embeddings), db.clone(), db)
    }

    // ========================================================================
    // Operations
    // ========================================================================

    /// Handle one user message and return the chosen reply
    pub async fn turn(&self, user_id: &str, conversation_id: &str, user_text: &str) -> Result<TurnResponse> {
        self.orchestrator.turn(user_id, conversation_id, user_text).await
    }

    /// Rate a previously delivered response; `label` is clamped to [0, 1]
    pub async fn feedback(&self, response_id: Uuid, label: f32) -> Result<FeedbackAck> {
        self.feedback.submit(response_id, label).await
    }

    /// Train a user's model on historical `(text, label)` samples
    pub async fn batch_train(&self, user_id: &str, samples: Vec<TextSample>) -> Result<BatchTrainSummary> {
        self.feedback.batch_train(user_id, samples).await
    }

    /// Replay the user's logged feedback through a batch training pass
    pub async fn retrain_from_log(&self, user_id: &str) -> Result<BatchTrainSummary> {
        self.feedback.retrain_from_log(user_id).await
    }

    /// Drop everything learned about a user: model, training log and
    /// pending interactions. Returns whether a model existed.
    pub async fn delete_user(&self, user_id: &str) -> Result<bool> {
        self.feedback.flush().await;
        let pending = self.interactions.remove_user(user_id).await;
        let samples = self.log.clear(user_id).await?;
        let existed = self.registry.delete_user(user_id).await?;
        info!(
            "Deleted data for {}: model={}, {} logged samples, {} pending interactions",
            user_id, existed, samples, pending
        );
        Ok(existed)
    }

    /// Probe every collaborator
    pub async fn health(&self) -> HealthReport {
        let (completion, embedding, model_store) = tokio::join!(
            self.completion.health_check(),
            self.embeddings.health_check(),
            self.registry.health_check(),
        );

        HealthReport {
            completion: ServiceStatus::from(completion),
            embedding: ServiceStatus::from(embedding),
            model_store: ServiceStatus::from(model_store),
            cached_models: self.registry.cached_count().await,
            active_conversations: self.conversations.len().await,
            pending_interactions: self.interactions.len().await,
        }
    }

    pub fn conversations(&self) -> &Arc<ConversationStore> {
        &self.conversations
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// One maintenance pass: expired conversations, expired interactions,
    /// idle models
    pub async fn run_maintenance(&self) {
        run_sweep(&self.conversations, &self.interactions, &self.registry).await;
    }

    /// Start the periodic maintenance task
    pub fn spawn_maintenance(&self) -> MaintenanceHandle {
        MaintenanceHandle::spawn(
            self.conversations.clone(),
            self.interactions.clone(),
            self.registry.clone(),
            self.maintenance_interval,
        )
    }

    /// Wait for pending persistence, then write every dirty model
    pub async fn shutdown(&self) {
        self.feedback.flush().await;
        let written = self.registry.persist_all().await;
        info!("Converse service shut down ({} models persisted)", written);
    }
}

async fn run_sweep(conversations: &ConversationStore, interactions: &InteractionCache, registry: &ModelRegistry) {
    let now = Utc::now();
    let sessions = conversations.sweep_expired(now).await;
    let records = interactions.sweep_expired(now).await;
    let models = registry.evict_idle(now).await;
    debug!(
        "Maintenance: {} conversations, {} interactions, {} models removed",
        sessions, records, models
    );
}

/// Handle for controlling the background maintenance task
pub struct MaintenanceHandle {
    shutdown_tx: watch::Sender<bool>,
    task_handle: Option<JoinHandle<()>>,
}

impl MaintenanceHandle {
    fn spawn(
        conversations: Arc<ConversationStore>,
        interactions: Arc<InteractionCache>,
        registry: Arc<ModelRegistry>,
        period: Duration,
    ) -> Self {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let task_handle = tokio::spawn(async move {
            let mut timer = interval(period);
            info!("Starting maintenance task with {:?} interval", period);

            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        run_sweep(&conversations, &interactions, &registry).await;
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            info!("Maintenance task received shutdown signal");
                            break;
                        }
                    }
                }
            }
        });

        Self {
            shutdown_tx,
            task_handle: Some(task_handle),
        }
    }

    /// Signal shutdown and wait for the task to finish
    pub async fn stop(mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.task_handle.take() {
            if let Err(e) = handle.await {
                warn!("Maintenance task ended abnormally: {}", e);
            }
        }
    }
}
