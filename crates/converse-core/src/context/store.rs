//! ============================================================================
//! Conversation Store - Bounded, expiring message histories
//! ============================================================================
//! Holds one `ConversationSession` per conversation id.
//!
//! Locking: every session sits behind its own mutex, so appends to the same
//! conversation are serialized while different conversations proceed in
//! parallel. Appends hold the map lock shared; sweeps and deletes hold it
//! exclusively, which means a sweep can never observe (or drop) a session
//! in the middle of an append.
//! ============================================================================

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use super::types::ConversationSession;
use crate::config::ContextConfig;
use crate::types::{validate_id, ConverseError, Message, Result};

type SessionSlot = Arc<Mutex<ConversationSession>>;

/// In-memory conversation histories keyed by conversation id
pub struct ConversationStore {
    sessions: RwLock<HashMap<String, SessionSlot>>,
    max_history: usize,
    session_ttl: Duration,
}

impl ConversationStore {
    pub fn new(config: &ContextConfig) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_history: config.max_history.max(1),
            session_ttl: config.session_ttl(),
        }
    }

    pub fn max_history(&self) -> usize {
        self.max_history
    }

    /// Append a message, creating the conversation on first use. Fails with
    /// `InvalidInput` when the conversation belongs to another owner.
    pub async fn append(&self, conversation_id: &str, owner_id: &str, message: Message) -> Result<()> {
        validate_id("conversation id", conversation_id)?;
        validate_id("owner id", owner_id)?;

        // Fast path: existing session, shared map lock
        {
            let sessions = self.sessions.read().await;
            if let Some(slot) = sessions.get(conversation_id) {
                let mut session = slot.lock().await;
                check_owner(&session, owner_id)?;
                let dropped = session.push(message, self.max_history);
                if dropped > 0 {
                    debug!(
                        "Conversation {}: dropped {} oldest message(s)",
                        conversation_id, dropped
                    );
                }
                return Ok(());
            }
        }

        // Slow path: may need to create it
        let mut sessions = self.sessions.write().await;
        let slot = sessions
            .entry(conversation_id.to_string())
            .or_insert_with(|| {
                debug!("Creating conversation {} for {}", conversation_id, owner_id);
                Arc::new(Mutex::new(ConversationSession::new(
                    conversation_id.to_string(),
                    owner_id.to_string(),
                    message.created_at,
                )))
            })
            .clone();
        let mut session = slot.lock().await;
        // Another appender may have created it first
        check_owner(&session, owner_id)?;
        session.push(message, self.max_history);
        Ok(())
    }

    /// Most recent `limit` messages in chronological order; empty for unknown ids
    pub async fn get_window(&self, conversation_id: &str, limit: usize) -> Vec<Message> {
        let sessions = self.sessions.read().await;
        match sessions.get(conversation_id) {
            Some(slot) => slot.lock().await.window(limit),
            None => Vec::new(),
        }
    }

    /// Snapshot of a whole session
    pub async fn session(&self, conversation_id: &str) -> Option<ConversationSession> {
        let sessions = self.sessions.read().await;
        match sessions.get(conversation_id) {
            Some(slot) => Some(slot.lock().await.clone()),
            None => None,
        }
    }

    /// Owner of a conversation, if it exists
    pub async fn owner(&self, conversation_id: &str) -> Option<String> {
        let sessions = self.sessions.read().await;
        match sessions.get(conversation_id) {
            Some(slot) => Some(slot.lock().await.owner_id.clone()),
            None => None,
        }
    }

    /// Remove sessions idle for longer than the TTL; returns how many
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> usize {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();

        let mut expired = Vec::new();
        for (id, slot) in sessions.iter() {
            if slot.lock().await.is_expired(now, self.session_ttl) {
                expired.push(id.clone());
            }
        }
        for id in &expired {
            sessions.remove(id);
        }

        if !expired.is_empty() {
            info!(
                "Swept {} expired conversation(s), {} remaining",
                expired.len(),
                before - expired.len()
            );
        }
        expired.len()
    }

    /// Drop a conversation; returns whether it existed
    pub async fn delete(&self, conversation_id: &str) -> bool {
        let removed = self.sessions.write().await.remove(conversation_id).is_some();
        if removed {
            debug!("Deleted conversation {}", conversation_id);
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

fn check_owner(session: &ConversationSession, owner_id: &str) -> Result<()> {
    if session.owner_id != owner_id {
        return Err(ConverseError::InvalidInput(format!(
            "conversation {} belongs to another user",
            session.id
        )));
    }
    Ok(())
}
