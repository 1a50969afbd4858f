//! ============================================================================
//! Context Types - Conversation sessions
//! ============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;

use crate::types::Message;

/// Bounded message history of one conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSession {
    pub id: String,
    pub owner_id: String,
    /// Oldest first; never longer than the store's `max_history`
    pub messages: VecDeque<Message>,
    pub created_at: DateTime<Utc>,
    /// Never moves backwards
    pub last_active_at: DateTime<Utc>,
}

impl ConversationSession {
    pub fn new(id: String, owner_id: String, now: DateTime<Utc>) -> Self {
        Self {
            id,
            owner_id,
            messages: VecDeque::new(),
            created_at: now,
            last_active_at: now,
        }
    }

    /// Append and drop from the head until `max_history` holds.
    /// Returns how many messages were dropped.
    pub fn push(&mut self, message: Message, max_history: usize) -> usize {
        if message.created_at > self.last_active_at {
            self.last_active_at = message.created_at;
        }
        self.messages.push_back(message);

        let mut dropped = 0;
        while self.messages.len() > max_history {
            self.messages.pop_front();
            dropped += 1;
        }
        dropped
    }

    /// The most recent `limit` messages, in chronological order
    pub fn window(&self, limit: usize) -> Vec<Message> {
        let skip = self.messages.len().saturating_sub(limit);
        self.messages.iter().skip(skip).cloned().collect()
    }

    /// Idle for strictly longer than `ttl` at `now`
    pub fn is_expired(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        match chrono::Duration::from_std(ttl) {
            Ok(ttl) => now - self.last_active_at > ttl,
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Role;

    #[test]
    fn test_push_truncates_head() {
        let now = Utc::now();
        let mut session = ConversationSession::new("c1".into(), "u1".into(), now);
        for i in 0..5 {
            session.push(Message::at(Role::User, format!("m{}", i), now), 3);
        }
        let texts: Vec<_> = session.messages.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["m2", "m3", "m4"]);
    }

    #[test]
    fn test_last_active_never_moves_backwards() {
        let now = Utc::now();
        let mut session = ConversationSession::new("c1".into(), "u1".into(), now);
        let earlier = now - chrono::Duration::seconds(30);
        session.push(Message::at(Role::User, "late arrival", earlier), 10);
        assert_eq!(session.last_active_at, now);
    }

    #[test]
    fn test_expiry_is_strict() {
        let now = Utc::now();
        let session = ConversationSession::new("c1".into(), "u1".into(), now);
        let ttl = Duration::from_secs(60);
        assert!(!session.is_expired(now + chrono::Duration::seconds(60), ttl));
        assert!(session.is_expired(now + chrono::Duration::seconds(61), ttl));
    }
}
