//! ============================================================================
//! Interaction Cache - Delivered responses awaiting feedback
//! ============================================================================
//! Maps a response id to the exact embedding that was scored, so feedback
//! trains on what the model saw without re-embedding. Entries expire on the
//! session TTL or are consumed by the first feedback for them.
//! ============================================================================

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::types::InteractionRecord;

/// Short-lived store of `InteractionRecord`s keyed by response id
pub struct InteractionCache {
    records: RwLock<HashMap<Uuid, InteractionRecord>>,
    ttl: Duration,
}

impl InteractionCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Record a delivered response under a fresh id
    pub async fn insert(&self, record: InteractionRecord) -> Uuid {
        let response_id = Uuid::new_v4();
        self.records.write().await.insert(response_id, record);
        debug!("Recorded interaction {}", response_id);
        response_id
    }

    /// Remove and return a live record. Expired records count as absent.
    pub async fn take(&self, response_id: &Uuid, now: DateTime<Utc>) -> Option<InteractionRecord> {
        let record = self.records.write().await.remove(response_id)?;
        if self.is_expired(&record, now) {
            debug!("Interaction {} expired before feedback arrived", response_id);
            return None;
        }
        Some(record)
    }

    /// Peek without consuming
    pub async fn get(&self, response_id: &Uuid) -> Option<InteractionRecord> {
        self.records.read().await.get(response_id).cloned()
    }

    /// Drop expired records; returns how many
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> usize {
        let mut records = self.records.write().await;
        let before = records.len();
        let ttl = self.ttl;
        records.retain(|_, record| !expired(record, now, ttl));
        let removed = before - records.len();
        if removed > 0 {
            info!("Swept {} expired interaction(s)", removed);
        }
        removed
    }

    /// Drop every record belonging to a user; returns how many
    pub async fn remove_user(&self, user_id: &str) -> usize {
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|_, record| record.user_id != user_id);
        before - records.len()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    fn is_expired(&self, record: &InteractionRecord, now: DateTime<Utc>) -> bool {
        expired(record, now, self.ttl)
    }
}

fn expired(record: &InteractionRecord, now: DateTime<Utc>, ttl: Duration) -> bool {
    match chrono::Duration::from_std(ttl) {
        Ok(ttl) => now - record.created_at > ttl,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(user_id: &str, created_at: DateTime<Utc>) -> InteractionRecord {
        InteractionRecord {
            user_id: user_id.to_string(),
            conversation_id: "c1".to_string(),
            prompt_embedding: None,
            candidate_embedding: vec![0.5; 4],
            generated_text: "hi there".to_string(),
            created_at,
        }
    }

    #[tokio::test]
    async fn test_take_consumes() {
        let cache = InteractionCache::new(Duration::from_secs(60));
        let now = Utc::now();
        let id = cache.insert(record("u1", now)).await;

        assert!(cache.get(&id).await.is_some());
        assert!(cache.take(&id, now).await.is_some());
        assert!(cache.take(&id, now).await.is_none());
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test]
    async fn test_expired_record_is_absent() {
        let cache = InteractionCache::new(Duration::from_secs(60));
        let now = Utc::now();
        let id = cache.insert(record("u1", now)).await;
        assert!(cache.take(&id, now + chrono::Duration::seconds(61)).await.is_none());
    }

    #[tokio::test]
    async fn test_sweep_and_remove_user() {
        let cache = InteractionCache::new(Duration::from_secs(60));
        let now = Utc::now();
        cache.insert(record("u1", now - chrono::Duration::seconds(120))).await;
        cache.insert(record("u1", now)).await;
        cache.insert(record("u2", now)).await;

        assert_eq!(cache.sweep_expired(now).await, 1);
        assert_eq!(cache.remove_user("u1").await, 1);
        assert_eq!(cache.len().await, 1);
    }
}
