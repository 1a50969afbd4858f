//! In-process model store and training log, for tests and ephemeral runs

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

use super::{ModelStore, TrainingLog};
use crate::types::{ConverseError, Result, TrainingSample};

/// Volatile `ModelStore` + `TrainingLog`. Can be switched offline to
/// exercise the persistence-failure paths.
#[derive(Default)]
pub struct MemoryModelStore {
    models: RwLock<HashMap<String, Vec<u8>>>,
    log: RwLock<HashMap<String, Vec<TrainingSample>>>,
    offline: AtomicBool,
}

impl MemoryModelStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// While offline every call fails with `PersistenceUnavailable`
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub async fn model_count(&self) -> usize {
        self.models.read().await.len()
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(ConverseError::PersistenceUnavailable("store is offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ModelStore for MemoryModelStore {
    async fn load(&self, user_id: &str) -> Result<Option<Vec<u8>>> {
        self.check_online()?;
        Ok(self.models.read().await.get(user_id).cloned())
    }

    async fn save(&self, user_id: &str, state: &[u8]) -> Result<()> {
        self.check_online()?;
        self.models
            .write()
            .await
            .insert(user_id.to_string(), state.to_vec());
        Ok(())
    }

    async fn delete(&self, user_id: &str) -> Result<bool> {
        self.check_online()?;
        Ok(self.models.write().await.remove(user_id).is_some())
    }

    async fn health_check(&self) -> Result<()> {
        self.check_online()
    }
}

#[async_trait]
impl TrainingLog for MemoryModelStore {
    async fn append(&self, user_id: &str, sample: &TrainingSample) -> Result<()> {
        self.check_online()?;
        self.log
            .write()
            .await
            .entry(user_id.to_string())
            .or_default()
            .push(sample.clone());
        Ok(())
    }

    async fn samples(&self, user_id: &str) -> Result<Vec<TrainingSample>> {
        self.check_online()?;
        Ok(self.log.read().await.get(user_id).cloned().unwrap_or_default())
    }

    async fn clear(&self, user_id: &str) -> Result<usize> {
        self.check_online()?;
        Ok(self
            .log
            .write()
            .await
            .remove(user_id)
            .map_or(0, |samples| samples.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_offline_store_fails_every_call() {
        let store = MemoryModelStore::new();
        store.save("alice", b"x").await.unwrap();

        store.set_offline(true);
        assert!(matches!(
            store.load("alice").await,
            Err(ConverseError::PersistenceUnavailable(_))
        ));
        assert!(store.health_check().await.is_err());
        assert!(store.append("alice", &TrainingSample::new(vec![0.0], 1.0)).await.is_err());

        store.set_offline(false);
        assert_eq!(store.load("alice").await.unwrap(), Some(b"x".to_vec()));
    }

    #[tokio::test]
    async fn test_log_clear_counts() {
        let store = MemoryModelStore::new();
        for _ in 0..3 {
            store.append("bob", &TrainingSample::new(vec![1.0], 0.5)).await.unwrap();
        }
        assert_eq!(store.samples("bob").await.unwrap().len(), 3);
        assert_eq!(store.clear("bob").await.unwrap(), 3);
        assert_eq!(store.clear("bob").await.unwrap(), 0);
    }
}
