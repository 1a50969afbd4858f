//! ============================================================================
//! Context Module - Conversation retention for Converse
//! ============================================================================
//! Bounded, expiring conversation histories plus the short-lived record of
//! what was delivered on each turn.
//!
//! ## Lifecycle
//! ```text
//! first turn → session created → every turn appends (head-truncated)
//!                                      ↓
//!                  idle > session TTL → removed by sweep_expired
//! ```
//! ============================================================================

mod interactions;
mod store;
mod types;

pub use interactions::InteractionCache;
pub use store::ConversationStore;
pub use types::ConversationSession;
