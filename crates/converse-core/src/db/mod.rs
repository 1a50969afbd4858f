// ============================================================================
// ConverseDb - Embedded Database (redb)
// ============================================================================
// Durable storage for per-user ranking models and the feedback training log.
// Default path: ~/.converse/converse.redb (override via CONVERSE_DB_PATH)
// ============================================================================

mod memory;
pub mod types;

pub use memory::MemoryModelStore;
pub use types::{DbStats, StoredModelInfo};

use anyhow::{anyhow, Result as AnyResult};
use async_trait::async_trait;
use redb::{Database, ReadableTable, TableDefinition};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use crate::ranking::ModelSnapshot;
use crate::types::{ConverseError, Result, TrainingSample};

// Table definitions
const MODELS: TableDefinition<&str, &[u8]> = TableDefinition::new("models");
const TRAINING_LOG: TableDefinition<(&str, u64), &[u8]> = TableDefinition::new("training_log");

/// Durable key-value storage for serialized ranking models, keyed by user id
#[async_trait]
pub trait ModelStore: Send + Sync {
    /// Encoded model state for `user_id`, if one was ever saved
    async fn load(&self, user_id: &str) -> Result<Option<Vec<u8>>>;

    /// Replace the stored state for `user_id`
    async fn save(&self, user_id: &str, state: &[u8]) -> Result<()>;

    /// Remove the stored state; returns whether anything was removed
    async fn delete(&self, user_id: &str) -> Result<bool>;

    async fn health_check(&self) -> Result<()>;
}

/// Append-only log of applied feedback, replayed by batch retraining
#[async_trait]
pub trait TrainingLog: Send + Sync {
    async fn append(&self, user_id: &str, sample: &TrainingSample) -> Result<()>;

    /// All samples for `user_id` in the order they were appended
    async fn samples(&self, user_id: &str) -> Result<Vec<TrainingSample>>;

    /// Drop the user's log; returns how many samples were removed
    async fn clear(&self, user_id: &str) -> Result<usize>;
}

/// Encode a model snapshot for storage
pub fn encode_snapshot(snapshot: &ModelSnapshot) -> Result<Vec<u8>> {
    bincode::serialize(snapshot)
        .map_err(|e| ConverseError::PersistenceUnavailable(format!("Failed to serialize model: {}", e)))
}

/// Decode stored model bytes. Corruption is reported as `InvalidInput`
/// so callers can tell it apart from an unreachable store.
pub fn decode_snapshot(bytes: &[u8]) -> Result<ModelSnapshot> {
    bincode::deserialize(bytes)
        .map_err(|e| ConverseError::InvalidInput(format!("Failed to deserialize model: {}", e)))
}

/// Embedded database for Converse
#[derive(Clone)]
pub struct ConverseDb {
    db: Arc<Database>,
    path: PathBuf,
}

impl ConverseDb {
    /// Open (or create) the database at the given path.
    /// If `path` is None, uses CONVERSE_DB_PATH env var or ~/.converse/converse.redb
    pub fn open(path: Option<&str>) -> AnyResult<Self> {
        let db_path = if let Some(p) = path {
            PathBuf::from(p)
        } else if let Ok(env_path) = std::env::var("CONVERSE_DB_PATH") {
            PathBuf::from(env_path)
        } else {
            let home = dirs::home_dir().ok_or_else(|| anyhow!("Cannot determine home directory"))?;
            let converse_dir = home.join(".converse");
            std::fs::create_dir_all(&converse_dir)
                .map_err(|e| anyhow!("Failed to create .converse directory: {}", e))?;
            converse_dir.join("converse.redb")
        };

        info!("Opening database at: {}", db_path.display());

        let db = Database::create(&db_path).map_err(|e| anyhow!("Failed to open database: {}", e))?;

        let write_txn = db
            .begin_write()
            .map_err(|e| anyhow!("Failed to begin write: {}", e))?;
        {
            let _ = write_txn
                .open_table(MODELS)
                .map_err(|e| anyhow!("Failed to create models table: {}", e))?;
            let _ = write_txn
                .open_table(TRAINING_LOG)
                .map_err(|e| anyhow!("Failed to create training_log table: {}", e))?;
        }
        write_txn.commit().map_err(|e| anyhow!("Failed to commit init: {}", e))?;

        info!("Database ready");

        Ok(Self {
            db: Arc::new(db),
            path: db_path,
        })
    }

    /// Get the database file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    // ========================================================================
    // Model Operations
    // ========================================================================

    pub fn store_model(&self, user_id: &str, state: &[u8]) -> AnyResult<()> {
        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| anyhow!("Failed to begin write: {}", e))?;
        {
            let mut table = write_txn
                .open_table(MODELS)
                .map_err(|e| anyhow!("Failed to open models table: {}", e))?;
            table
                .insert(user_id, state)
                .map_err(|e| anyhow!("Failed to insert model: {}", e))?;
        }
        write_txn.commit().map_err(|e| anyhow!("Failed to commit: {}", e))?;

        debug!("Stored model for {} ({} bytes)", user_id, state.len());
        Ok(())
    }

    pub fn get_model(&self, user_id: &str) -> AnyResult<Option<Vec<u8>>> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| anyhow!("Failed to begin read: {}", e))?;
        let table = read_txn
            .open_table(MODELS)
            .map_err(|e| anyhow!("Failed to open models table: {}", e))?;

        let value = table
            .get(user_id)
            .map_err(|e| anyhow!("Failed to get model: {}", e))?;
        Ok(value.map(|v| v.value().to_vec()))
    }

    pub fn delete_model(&self, user_id: &str) -> AnyResult<bool> {
        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| anyhow!("Failed to begin write: {}", e))?;
        let removed;
        {
            let mut table = write_txn
                .open_table(MODELS)
                .map_err(|e| anyhow!("Failed to open models table: {}", e))?;
            removed = table
                .remove(user_id)
                .map_err(|e| anyhow!("Failed to delete model: {}", e))?
                .is_some();
        }
        write_txn.commit().map_err(|e| anyhow!("Failed to commit: {}", e))?;

        if removed {
            debug!("Deleted model for {}", user_id);
        }
        Ok(removed)
    }

    /// Every stored model with whatever its snapshot header reveals
    pub fn list_models(&self) -> AnyResult<Vec<StoredModelInfo>> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| anyhow!("Failed to begin read: {}", e))?;
        let table = read_txn
            .open_table(MODELS)
            .map_err(|e| anyhow!("Failed to open models table: {}", e))?;

        let mut models = Vec::new();
        for entry in table
            .range::<&str>(..)
            .map_err(|e| anyhow!("Failed to iterate models: {}", e))?
        {
            let (key, value) = entry.map_err(|e| anyhow!("Failed to read model entry: {}", e))?;
            let bytes = value.value();
            let snapshot = decode_snapshot(bytes).ok();
            models.push(StoredModelInfo {
                user_id: key.value().to_string(),
                bytes: bytes.len(),
                train_steps: snapshot.as_ref().map(|s| s.train_steps),
                dim: snapshot.as_ref().map(|s| s.dim),
            });
        }
        Ok(models)
    }

    // ========================================================================
    // Training Log Operations
    // ========================================================================

    pub fn append_sample(&self, user_id: &str, sample: &TrainingSample) -> AnyResult<u64> {
        let value = bincode::serialize(sample).map_err(|e| anyhow!("Failed to serialize sample: {}", e))?;

        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| anyhow!("Failed to begin write: {}", e))?;
        let seq;
        {
            let mut table = write_txn
                .open_table(TRAINING_LOG)
                .map_err(|e| anyhow!("Failed to open training_log table: {}", e))?;
            let last = {
                let mut range = table
                    .range((user_id, 0u64)..=(user_id, u64::MAX))
                    .map_err(|e| anyhow!("Failed to iterate training_log: {}", e))?;
                match range.next_back() {
                    Some(entry) => {
                        let (key, _) = entry.map_err(|e| anyhow!("Failed to read log entry: {}", e))?;
                        Some(key.value().1)
                    }
                    None => None,
                }
            };
            seq = last.map_or(0, |s| s + 1);
            table
                .insert((user_id, seq), value.as_slice())
                .map_err(|e| anyhow!("Failed to insert sample: {}", e))?;
        }
        write_txn.commit().map_err(|e| anyhow!("Failed to commit: {}", e))?;

        debug!("Logged training sample {} for {}", seq, user_id);
        Ok(seq)
    }

    pub fn list_samples(&self, user_id: &str) -> AnyResult<Vec<TrainingSample>> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| anyhow!("Failed to begin read: {}", e))?;
        let table = read_txn
            .open_table(TRAINING_LOG)
            .map_err(|e| anyhow!("Failed to open training_log table: {}", e))?;

        let mut samples = Vec::new();
        for entry in table
            .range((user_id, 0u64)..=(user_id, u64::MAX))
            .map_err(|e| anyhow!("Failed to iterate training_log: {}", e))?
        {
            let (_, value) = entry.map_err(|e| anyhow!("Failed to read log entry: {}", e))?;
            let sample: TrainingSample = bincode::deserialize(value.value())
                .map_err(|e| anyhow!("Failed to deserialize sample: {}", e))?;
            samples.push(sample);
        }
        Ok(samples)
    }

    pub fn clear_samples(&self, user_id: &str) -> AnyResult<usize> {
        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| anyhow!("Failed to begin write: {}", e))?;
        let removed;
        {
            let mut table = write_txn
                .open_table(TRAINING_LOG)
                .map_err(|e| anyhow!("Failed to open training_log table: {}", e))?;
            let mut seqs = Vec::new();
            for entry in table
                .range((user_id, 0u64)..=(user_id, u64::MAX))
                .map_err(|e| anyhow!("Failed to iterate training_log: {}", e))?
            {
                let (key, _) = entry.map_err(|e| anyhow!("Failed to read log entry: {}", e))?;
                seqs.push(key.value().1);
            }
            for seq in &seqs {
                table
                    .remove((user_id, *seq))
                    .map_err(|e| anyhow!("Failed to delete sample: {}", e))?;
            }
            removed = seqs.len();
        }
        write_txn.commit().map_err(|e| anyhow!("Failed to commit: {}", e))?;

        debug!("Cleared {} training samples for {}", removed, user_id);
        Ok(removed)
    }

    // ========================================================================
    // Stats
    // ========================================================================

    pub fn stats(&self) -> AnyResult<DbStats> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| anyhow!("Failed to begin read: {}", e))?;

        let models = read_txn
            .open_table(MODELS)
            .map_err(|e| anyhow!("Failed to open models table: {}", e))?;
        let total_models = models
            .range::<&str>(..)
            .map_err(|e| anyhow!("Failed to iterate models: {}", e))?
            .count();

        let log = read_txn
            .open_table(TRAINING_LOG)
            .map_err(|e| anyhow!("Failed to open training_log table: {}", e))?;
        let mut total_samples = 0usize;
        let mut users = HashSet::new();
        for entry in log
            .range::<(&str, u64)>(..)
            .map_err(|e| anyhow!("Failed to iterate training_log: {}", e))?
        {
            let (key, _) = entry.map_err(|e| anyhow!("Failed to read log entry: {}", e))?;
            total_samples += 1;
            users.insert(key.value().0.to_string());
        }

        Ok(DbStats {
            total_models,
            total_samples,
            users_with_samples: users.len(),
        })
    }

    /// Run a blocking database call off the async runtime
    async fn blocking<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(ConverseDb) -> AnyResult<T> + Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || op(db))
            .await
            .map_err(|e| ConverseError::PersistenceUnavailable(format!("Database task failed: {}", e)))?
            .map_err(|e| ConverseError::PersistenceUnavailable(e.to_string()))
    }
}

#[async_trait]
impl ModelStore for ConverseDb {
    async fn load(&self, user_id: &str) -> Result<Option<Vec<u8>>> {
        let user_id = user_id.to_string();
        self.blocking(move |db| db.get_model(&user_id)).await
    }

    async fn save(&self, user_id: &str, state: &[u8]) -> Result<()> {
        let user_id = user_id.to_string();
        let state = state.to_vec();
        self.blocking(move |db| db.store_model(&user_id, &state)).await
    }

    async fn delete(&self, user_id: &str) -> Result<bool> {
        let user_id = user_id.to_string();
        self.blocking(move |db| db.delete_model(&user_id)).await
    }

    async fn health_check(&self) -> Result<()> {
        self.blocking(|db| {
            db.db
                .begin_read()
                .map_err(|e| anyhow!("Failed to begin read: {}", e))?
                .open_table(MODELS)
                .map_err(|e| anyhow!("Failed to open models table: {}", e))?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl TrainingLog for ConverseDb {
    async fn append(&self, user_id: &str, sample: &TrainingSample) -> Result<()> {
        let user_id = user_id.to_string();
        let sample = sample.clone();
        self.blocking(move |db| db.append_sample(&user_id, &sample).map(|_| ()))
            .await
    }

    async fn samples(&self, user_id: &str) -> Result<Vec<TrainingSample>> {
        let user_id = user_id.to_string();
        self.blocking(move |db| db.list_samples(&user_id)).await
    }

    async fn clear(&self, user_id: &str) -> Result<usize> {
        let user_id = user_id.to_string();
        self.blocking(move |db| db.clear_samples(&user_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RankingConfig;
    use crate::ranking::RankingModel;
    use tempfile::TempDir;

    fn open_temp() -> (TempDir, ConverseDb) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.redb");
        let db = ConverseDb::open(Some(path.to_str().unwrap())).unwrap();
        (dir, db)
    }

    #[test]
    fn test_model_crud() {
        let (_dir, db) = open_temp();

        assert!(db.get_model("alice").unwrap().is_none());
        db.store_model("alice", b"state-1").unwrap();
        db.store_model("alice", b"state-2").unwrap();
        assert_eq!(db.get_model("alice").unwrap().unwrap(), b"state-2".to_vec());

        assert!(db.delete_model("alice").unwrap());
        assert!(!db.delete_model("alice").unwrap());
        assert!(db.get_model("alice").unwrap().is_none());
    }

    #[test]
    fn test_training_log_is_ordered_and_per_user() {
        let (_dir, db) = open_temp();

        for i in 0..5 {
            let seq = db
                .append_sample("alice", &TrainingSample::new(vec![i as f32; 4], 1.0))
                .unwrap();
            assert_eq!(seq, i);
        }
        db.append_sample("bob", &TrainingSample::new(vec![9.0; 4], 0.0)).unwrap();

        let samples = db.list_samples("alice").unwrap();
        assert_eq!(samples.len(), 5);
        for (i, sample) in samples.iter().enumerate() {
            assert_eq!(sample.embedding[0], i as f32);
        }
        assert_eq!(db.list_samples("bob").unwrap().len(), 1);

        assert_eq!(db.clear_samples("alice").unwrap(), 5);
        assert!(db.list_samples("alice").unwrap().is_empty());
        assert_eq!(db.list_samples("bob").unwrap().len(), 1);

        // Sequence restarts cleanly after a clear
        assert_eq!(
            db.append_sample("alice", &TrainingSample::new(vec![0.0; 4], 1.0)).unwrap(),
            0
        );
    }

    #[test]
    fn test_stats_and_listing() {
        let (_dir, db) = open_temp();
        let config = RankingConfig {
            embedding_dim: 8,
            hidden_units: 4,
            ..RankingConfig::default()
        };
        let model = RankingModel::with_seed(&config, 7);
        let bytes = encode_snapshot(&model.snapshot()).unwrap();

        db.store_model("alice", &bytes).unwrap();
        db.store_model("mallory", b"not a model").unwrap();
        db.append_sample("alice", &TrainingSample::new(vec![0.0; 8], 1.0)).unwrap();
        db.append_sample("alice", &TrainingSample::new(vec![0.0; 8], 0.0)).unwrap();
        db.append_sample("bob", &TrainingSample::new(vec![0.0; 8], 1.0)).unwrap();

        let stats = db.stats().unwrap();
        assert_eq!(stats.total_models, 2);
        assert_eq!(stats.total_samples, 3);
        assert_eq!(stats.users_with_samples, 2);

        let models = db.list_models().unwrap();
        let alice = models.iter().find(|m| m.user_id == "alice").unwrap();
        assert_eq!(alice.dim, Some(8));
        assert_eq!(alice.train_steps, Some(0));
        let mallory = models.iter().find(|m| m.user_id == "mallory").unwrap();
        assert_eq!(mallory.train_steps, None);
    }

    #[tokio::test]
    async fn test_async_store_roundtrip() {
        let (_dir, db) = open_temp();
        let store: Arc<dyn ModelStore> = Arc::new(db.clone());

        store.save("carol", b"abc").await.unwrap();
        assert_eq!(store.load("carol").await.unwrap(), Some(b"abc".to_vec()));
        assert!(store.delete("carol").await.unwrap());
        assert_eq!(store.load("carol").await.unwrap(), None);
        store.health_check().await.unwrap();
    }

    #[test]
    fn test_reopen_preserves_data() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("persist.redb");
        {
            let db = ConverseDb::open(Some(path.to_str().unwrap())).unwrap();
            db.store_model("alice", b"kept").unwrap();
        }
        let db = ConverseDb::open(Some(path.to_str().unwrap())).unwrap();
        assert_eq!(db.get_model("alice").unwrap(), Some(b"kept".to_vec()));
    }
}
