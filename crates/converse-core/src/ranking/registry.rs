//! ============================================================================
//! Model Registry - Lifecycle of per-user ranking models
//! ============================================================================
//! Lazily creates or loads one `RankingModel` per user, keeps it resident
//! while it is being used, persists it after training and evicts it once idle.
//!
//! Each model sits behind its own `RwLock`; the registry map lock is only
//! held to look up or insert a slot, never across model work or I/O.
//! Persists of one slot are serialized so the store never goes backwards,
//! and loading and deleting the same user are serialized by a per-user
//! lifecycle lock.
//! ============================================================================

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::model::RankingModel;
use crate::config::RankingConfig;
use crate::db::{decode_snapshot, encode_snapshot, ModelStore};
use crate::retry::{retry_with_backoff, RetryConfig, Upstream};
use crate::types::{validate_id, Result, TrainingSample};

struct ModelSlot {
    model: RwLock<RankingModel>,
    /// Unix millis of the last score/train
    last_used: AtomicI64,
    /// Trained since the last successful persist
    dirty: AtomicBool,
    /// Held from snapshot to save
    persist_lock: Mutex<()>,
    /// Set once the user is deleted; later persists are dropped
    deleted: AtomicBool,
}

impl ModelSlot {
    fn new(model: RankingModel, now: DateTime<Utc>) -> Self {
        Self {
            model: RwLock::new(model),
            last_used: AtomicI64::new(now.timestamp_millis()),
            dirty: AtomicBool::new(false),
            persist_lock: Mutex::new(()),
            deleted: AtomicBool::new(false),
        }
    }

    fn touch(&self) {
        self.last_used
            .fetch_max(Utc::now().timestamp_millis(), Ordering::SeqCst);
    }
}

/// Borrowed access to one user's model. Holding a handle keeps the model
/// resident: eviction skips models with outstanding handles.
#[derive(Clone)]
pub struct ModelHandle {
    user_id: String,
    slot: Arc<ModelSlot>,
}

impl ModelHandle {
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Score a candidate embedding (shared lock)
    pub async fn score(&self, embedding: &[f32]) -> Result<f32> {
        self.slot.touch();
        self.slot.model.read().await.score(embedding)
    }

    /// One training step (exclusive lock); returns the step's loss
    pub async fn train_one(&self, embedding: &[f32], label: f32) -> Result<f32> {
        self.slot.touch();
        let mut model = self.slot.model.write().await;
        let loss = model.train_one(embedding, label)?;
        self.slot.dirty.store(true, Ordering::SeqCst);
        Ok(loss)
    }

    /// Multi-epoch training (exclusive lock); returns the final-epoch mean loss
    pub async fn train_batch(&self, samples: &[TrainingSample], epochs: usize) -> Result<f32> {
        self.slot.touch();
        let mut model = self.slot.model.write().await;
        let loss = model.train_batch(samples, epochs)?;
        if !samples.is_empty() {
            self.slot.dirty.store(true, Ordering::SeqCst);
        }
        Ok(loss)
    }

    pub async fn train_steps(&self) -> u64 {
        self.slot.model.read().await.train_steps()
    }

    pub fn is_dirty(&self) -> bool {
        self.slot.dirty.load(Ordering::SeqCst)
    }
}

/// Owns every resident per-user ranking model
pub struct ModelRegistry {
    store: Arc<dyn ModelStore>,
    config: RankingConfig,
    retry: RetryConfig,
    models: RwLock<HashMap<String, Arc<ModelSlot>>>,
    /// Per-user locks shared by cold loads and deletion
    lifecycle: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ModelRegistry {
    pub fn new(store: Arc<dyn ModelStore>, config: RankingConfig) -> Self {
        Self {
            store,
            config,
            retry: RetryConfig::default(),
            models: RwLock::new(HashMap::new()),
            lifecycle: Mutex::new(HashMap::new()),
        }
    }

    /// Retry policy for store calls
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn config(&self) -> &RankingConfig {
        &self.config
    }

    /// Get the user's model, loading or creating it on first use
    pub async fn get(&self, user_id: &str) -> Result<ModelHandle> {
        validate_id("user id", user_id)?;

        if let Some(slot) = self.models.read().await.get(user_id) {
            return Ok(ModelHandle {
                user_id: user_id.to_string(),
                slot: slot.clone(),
            });
        }

        let lifecycle = self.lifecycle_lock(user_id).await;
        let slot = {
            let _guard = lifecycle.lock().await;
            let existing = self.models.read().await.get(user_id).cloned();
            match existing {
                Some(slot) => slot,
                None => {
                    // Load outside the map lock; deletion waits on the lifecycle lock
                    let model = self.load_or_create(user_id).await;
                    let slot = Arc::new(ModelSlot::new(model, Utc::now()));
                    self.models
                        .write()
                        .await
                        .insert(user_id.to_string(), slot.clone());
                    slot
                }
            }
        };
        self.release_lifecycle_lock(user_id, lifecycle).await;

        Ok(ModelHandle {
            user_id: user_id.to_string(),
            slot,
        })
    }

    async fn lifecycle_lock(&self, user_id: &str) -> Arc<Mutex<()>> {
        self.lifecycle
            .lock()
            .await
            .entry(user_id.to_string())
            .or_default()
            .clone()
    }

    async fn release_lifecycle_lock(&self, user_id: &str, lock: Arc<Mutex<()>>) {
        drop(lock);
        let mut locks = self.lifecycle.lock().await;
        if locks.get(user_id).map_or(false, |l| Arc::strong_count(l) == 1) {
            locks.remove(user_id);
        }
    }

    async fn load_or_create(&self, user_id: &str) -> RankingModel {
        let store = self.store.clone();
        let loaded = retry_with_backoff(&self.retry, Upstream::Persistence, "load model", |_| {
            let store = store.clone();
            let user_id = user_id.to_string();
            async move { store.load(&user_id).await }
        })
        .await;

        match loaded {
            Ok(Some(bytes)) => {
                match decode_snapshot(&bytes).and_then(|s| RankingModel::from_snapshot(s, &self.config)) {
                    Ok(model) => {
                        info!(
                            "Loaded ranking model for {} ({} training steps)",
                            user_id,
                            model.train_steps()
                        );
                        return model;
                    }
                    Err(e) => warn!("Discarding unreadable model for {}: {}", user_id, e),
                }
            }
            Ok(None) => debug!("No stored model for {}", user_id),
            Err(e) => warn!("Could not load model for {}, starting fresh: {}", user_id, e),
        }

        info!("Created ranking model for {}", user_id);
        RankingModel::new(&self.config)
    }

    /// Write the user's resident model to the store. No-op when the model
    /// is not resident.
    pub async fn persist(&self, user_id: &str) -> Result<()> {
        let slot = self.models.read().await.get(user_id).cloned();
        match slot {
            Some(slot) => self.persist_slot(user_id, &slot).await,
            None => Ok(()),
        }
    }

    async fn persist_slot(&self, user_id: &str, slot: &ModelSlot) -> Result<()> {
        // Serialized per slot: a snapshot taken later is always saved later
        let _persisting = slot.persist_lock.lock().await;
        if slot.deleted.load(Ordering::SeqCst) {
            debug!("Skipping persist for deleted user {}", user_id);
            return Ok(());
        }

        let bytes = {
            let model = slot.model.read().await;
            // Cleared under the lock so a concurrent train re-marks it
            slot.dirty.store(false, Ordering::SeqCst);
            encode_snapshot(&model.snapshot())
        };
        let bytes = match bytes {
            Ok(bytes) => bytes,
            Err(e) => {
                slot.dirty.store(true, Ordering::SeqCst);
                return Err(e);
            }
        };

        let store = self.store.clone();
        let saved = retry_with_backoff(&self.retry, Upstream::Persistence, "persist model", |_| {
            let store = store.clone();
            let user_id = user_id.to_string();
            let bytes = bytes.clone();
            async move { store.save(&user_id, &bytes).await }
        })
        .await;

        match saved {
            Ok(()) => {
                debug!("Persisted model for {} ({} bytes)", user_id, bytes.len());
                Ok(())
            }
            Err(e) => {
                slot.dirty.store(true, Ordering::SeqCst);
                warn!("Failed to persist model for {}: {}", user_id, e);
                Err(e)
            }
        }
    }

    /// Persist (if dirty) and drop models idle longer than the configured
    /// interval. Models in use or whose persist fails stay resident.
    pub async fn evict_idle(&self, now: DateTime<Utc>) -> usize {
        let idle_ms = self.config.idle_model_eviction().as_millis() as i64;
        let cutoff = now.timestamp_millis() - idle_ms;

        let candidates: Vec<(String, Arc<ModelSlot>)> = self
            .models
            .read()
            .await
            .iter()
            .filter(|(_, slot)| slot.last_used.load(Ordering::SeqCst) < cutoff)
            .map(|(user_id, slot)| (user_id.clone(), slot.clone()))
            .collect();

        let mut persisted = Vec::new();
        for (user_id, slot) in candidates {
            if slot.dirty.load(Ordering::SeqCst) && self.persist_slot(&user_id, &slot).await.is_err() {
                continue;
            }
            persisted.push(user_id);
        }

        let mut evicted = 0;
        let mut models = self.models.write().await;
        for user_id in persisted {
            let evictable = models.get(&user_id).map_or(false, |slot| {
                // Only the map and our dropped candidate list referenced it
                Arc::strong_count(slot) == 1
                    && !slot.dirty.load(Ordering::SeqCst)
                    && slot.last_used.load(Ordering::SeqCst) < cutoff
            });
            if evictable {
                models.remove(&user_id);
                evicted += 1;
            }
        }

        if evicted > 0 {
            info!("Evicted {} idle ranking models", evicted);
        }
        evicted
    }

    /// Drop the user's model from memory and from the store
    pub async fn delete_user(&self, user_id: &str) -> Result<bool> {
        let lifecycle = self.lifecycle_lock(user_id).await;
        let result = {
            let _guard = lifecycle.lock().await;
            let removed = self.models.write().await.remove(user_id);
            let was_resident = removed.is_some();
            if let Some(slot) = removed {
                // Wait out any in-flight persist, then fence off later ones
                let _persisting = slot.persist_lock.lock().await;
                slot.deleted.store(true, Ordering::SeqCst);
            }

            let store = self.store.clone();
            retry_with_backoff(&self.retry, Upstream::Persistence, "delete model", |_| {
                let store = store.clone();
                let user_id = user_id.to_string();
                async move { store.delete(&user_id).await }
            })
            .await
            .map(|was_stored| was_resident || was_stored)
        };
        self.release_lifecycle_lock(user_id, lifecycle).await;

        let existed = result?;
        info!("Deleted ranking model for {}", user_id);
        Ok(existed)
    }

    /// Persist every dirty model; returns how many were written
    pub async fn persist_all(&self) -> usize {
        let slots: Vec<(String, Arc<ModelSlot>)> = self
            .models
            .read()
            .await
            .iter()
            .map(|(user_id, slot)| (user_id.clone(), slot.clone()))
            .collect();

        let mut written = 0;
        for (user_id, slot) in slots {
            if slot.dirty.load(Ordering::SeqCst) && self.persist_slot(&user_id, &slot).await.is_ok() {
                written += 1;
            }
        }
        written
    }

    pub async fn cached_count(&self) -> usize {
        self.models.read().await.len()
    }

    pub async fn is_resident(&self, user_id: &str) -> bool {
        self.models.read().await.contains_key(user_id)
    }

    pub async fn health_check(&self) -> Result<()> {
        self.store.health_check().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryModelStore;
    use crate::types::ConverseError;
    use chrono::Duration as ChronoDuration;

    fn small_config() -> RankingConfig {
        RankingConfig {
            embedding_dim: 8,
            hidden_units: 4,
            learning_rate: 0.01,
            idle_model_eviction_secs: 60,
            ..RankingConfig::default()
        }
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 2,
            base_delay_ms: 1,
            max_delay_ms: 2,
            attempt_timeout_ms: 100,
            jitter: false,
        }
    }

    fn registry(store: Arc<MemoryModelStore>) -> ModelRegistry {
        ModelRegistry::new(store, small_config()).with_retry(fast_retry())
    }

    /// Memory store whose first load and first save stall
    struct StallingStore {
        inner: MemoryModelStore,
        delay: std::time::Duration,
        load_stalled: AtomicBool,
        save_stalled: AtomicBool,
    }

    impl StallingStore {
        fn new(delay_ms: u64) -> Self {
            Self {
                inner: MemoryModelStore::new(),
                delay: std::time::Duration::from_millis(delay_ms),
                load_stalled: AtomicBool::new(false),
                save_stalled: AtomicBool::new(false),
            }
        }
    }

    #[async_trait::async_trait]
    impl ModelStore for StallingStore {
        async fn load(&self, user_id: &str) -> Result<Option<Vec<u8>>> {
            if !self.load_stalled.swap(true, Ordering::SeqCst) {
                tokio::time::sleep(self.delay).await;
            }
            self.inner.load(user_id).await
        }

        async fn save(&self, user_id: &str, state: &[u8]) -> Result<()> {
            if !self.save_stalled.swap(true, Ordering::SeqCst) {
                tokio::time::sleep(self.delay).await;
            }
            self.inner.save(user_id, state).await
        }

        async fn delete(&self, user_id: &str) -> Result<bool> {
            self.inner.delete(user_id).await
        }

        async fn health_check(&self) -> Result<()> {
            self.inner.health_check().await
        }
    }

    fn patient_registry(store: Arc<StallingStore>) -> ModelRegistry {
        ModelRegistry::new(store, small_config()).with_retry(RetryConfig {
            attempt_timeout_ms: 2_000,
            ..fast_retry()
        })
    }

    #[tokio::test]
    async fn test_get_creates_cold_model() {
        let store = Arc::new(MemoryModelStore::new());
        let registry = registry(store.clone());

        let handle = registry.get("alice").await.unwrap();
        assert_eq!(handle.score(&[0.5; 8]).await.unwrap(), 0.5);
        assert_eq!(registry.cached_count().await, 1);
        // Nothing is written until the model is trained and persisted
        assert_eq!(store.model_count().await, 0);
    }

    #[tokio::test]
    async fn test_single_instance_per_user() {
        let store = Arc::new(MemoryModelStore::new());
        let registry = Arc::new(registry(store));

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move { registry.get("alice").await.unwrap() }));
        }
        let handles: Vec<ModelHandle> = futures_util::future::join_all(tasks)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        handles[0].train_one(&[1.0; 8], 1.0).await.unwrap();
        for handle in &handles {
            assert_eq!(handle.train_steps().await, 1);
        }
        assert_eq!(registry.cached_count().await, 1);
    }

    #[tokio::test]
    async fn test_persist_and_reload() {
        let store = Arc::new(MemoryModelStore::new());
        let embedding = [0.3f32; 8];

        let trained_score = {
            let registry = registry(store.clone());
            let handle = registry.get("alice").await.unwrap();
            for _ in 0..20 {
                handle.train_one(&embedding, 1.0).await.unwrap();
            }
            registry.persist("alice").await.unwrap();
            assert!(!handle.is_dirty());
            handle.score(&embedding).await.unwrap()
        };

        let registry = registry(store);
        let handle = registry.get("alice").await.unwrap();
        assert_eq!(handle.train_steps().await, 20);
        assert_eq!(handle.score(&embedding).await.unwrap(), trained_score);
    }

    #[tokio::test]
    async fn test_corrupt_state_starts_fresh() {
        let store = Arc::new(MemoryModelStore::new());
        store.save("alice", b"garbage").await.unwrap();

        let registry = registry(store);
        let handle = registry.get("alice").await.unwrap();
        assert_eq!(handle.train_steps().await, 0);
        assert_eq!(handle.score(&[1.0; 8]).await.unwrap(), 0.5);
    }

    #[tokio::test]
    async fn test_dimension_mismatch_starts_fresh() {
        let store = Arc::new(MemoryModelStore::new());
        let other = RankingConfig {
            embedding_dim: 16,
            hidden_units: 4,
            ..RankingConfig::default()
        };
        let mut model = RankingModel::with_seed(&other, 1);
        model.train_one(&[1.0; 16], 1.0).unwrap();
        store
            .save("alice", &encode_snapshot(&model.snapshot()).unwrap())
            .await
            .unwrap();

        let registry = registry(store);
        let handle = registry.get("alice").await.unwrap();
        assert_eq!(handle.train_steps().await, 0);
    }

    #[tokio::test]
    async fn test_evict_idle_persists_dirty_models() {
        let store = Arc::new(MemoryModelStore::new());
        let registry = registry(store.clone());

        {
            let handle = registry.get("alice").await.unwrap();
            handle.train_one(&[1.0; 8], 1.0).await.unwrap();
        }

        // Not idle yet
        assert_eq!(registry.evict_idle(Utc::now()).await, 0);

        let later = Utc::now() + ChronoDuration::seconds(61);
        assert_eq!(registry.evict_idle(later).await, 1);
        assert_eq!(registry.cached_count().await, 0);
        assert_eq!(store.model_count().await, 1);
    }

    #[tokio::test]
    async fn test_evict_skips_models_in_use() {
        let store = Arc::new(MemoryModelStore::new());
        let registry = registry(store);

        let handle = registry.get("alice").await.unwrap();
        let later = Utc::now() + ChronoDuration::seconds(61);
        assert_eq!(registry.evict_idle(later).await, 0);
        assert!(registry.is_resident("alice").await);

        drop(handle);
        assert_eq!(registry.evict_idle(later).await, 1);
    }

    #[tokio::test]
    async fn test_failed_persist_keeps_model_resident() {
        let store = Arc::new(MemoryModelStore::new());
        let registry = registry(store.clone());

        {
            let handle = registry.get("alice").await.unwrap();
            handle.train_one(&[1.0; 8], 1.0).await.unwrap();
        }

        store.set_offline(true);
        let later = Utc::now() + ChronoDuration::seconds(61);
        assert_eq!(registry.evict_idle(later).await, 0);
        assert!(registry.is_resident("alice").await);
        assert!(matches!(
            registry.persist("alice").await,
            Err(ConverseError::PersistenceUnavailable(_))
        ));

        store.set_offline(false);
        assert_eq!(registry.evict_idle(later).await, 1);
        assert_eq!(store.model_count().await, 1);
    }

    #[tokio::test]
    async fn test_delete_user() {
        let store = Arc::new(MemoryModelStore::new());
        let registry = registry(store.clone());

        let handle = registry.get("alice").await.unwrap();
        handle.train_one(&[1.0; 8], 1.0).await.unwrap();
        drop(handle);
        registry.persist("alice").await.unwrap();

        assert!(registry.delete_user("alice").await.unwrap());
        assert_eq!(registry.cached_count().await, 0);
        assert_eq!(store.model_count().await, 0);
        assert!(!registry.delete_user("alice").await.unwrap());
    }

    #[tokio::test]
    async fn test_persist_all_writes_only_dirty() {
        let store = Arc::new(MemoryModelStore::new());
        let registry = registry(store.clone());

        registry.get("idle").await.unwrap();
        let busy = registry.get("busy").await.unwrap();
        busy.train_one(&[1.0; 8], 0.0).await.unwrap();

        assert_eq!(registry.persist_all().await, 1);
        assert_eq!(registry.persist_all().await, 0);
        assert_eq!(store.model_count().await, 1);
    }

    #[tokio::test]
    async fn test_empty_user_id_rejected() {
        let registry = registry(Arc::new(MemoryModelStore::new()));
        assert!(matches!(
            registry.get("").await,
            Err(ConverseError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_overlapping_persists_keep_latest_state() {
        let store = Arc::new(StallingStore::new(150));
        let registry = Arc::new(patient_registry(store.clone()));

        let handle = registry.get("alice").await.unwrap();
        handle.train_one(&[1.0; 8], 1.0).await.unwrap();

        // First save stalls while the model keeps training
        let slow = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.persist("alice").await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        handle.train_one(&[1.0; 8], 1.0).await.unwrap();
        registry.persist("alice").await.unwrap();
        slow.await.unwrap().unwrap();
        assert!(!handle.is_dirty());
        drop(handle);

        let later = Utc::now() + ChronoDuration::seconds(61);
        assert_eq!(registry.evict_idle(later).await, 1);
        let reloaded = registry.get("alice").await.unwrap();
        assert_eq!(reloaded.train_steps().await, 2);
    }

    #[tokio::test]
    async fn test_delete_during_cold_load_is_not_undone() {
        let store = Arc::new(StallingStore::new(150));
        let mut model = RankingModel::with_seed(&small_config(), 1);
        model.train_one(&[1.0; 8], 1.0).unwrap();
        store
            .inner
            .save("alice", &encode_snapshot(&model.snapshot()).unwrap())
            .await
            .unwrap();
        let registry = Arc::new(patient_registry(store.clone()));

        let loading = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.get("alice").await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(registry.delete_user("alice").await.unwrap());

        // The loader finished first, but its model is gone with the user
        let stale = loading.await.unwrap().unwrap();
        stale.train_one(&[1.0; 8], 1.0).await.unwrap();
        assert_eq!(registry.persist_all().await, 0);
        assert!(!registry.is_resident("alice").await);
        assert_eq!(store.inner.model_count().await, 0);

        let fresh = registry.get("alice").await.unwrap();
        assert_eq!(fresh.train_steps().await, 0);
    }
}
