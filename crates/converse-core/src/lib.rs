//! ============================================================================
//! CONVERSE-CORE: Context manager + per-user response reranker
//! ============================================================================
//! This crate handles all backend logic for Converse:
//! - Bounded, expiring conversation histories
//! - Multi-candidate generation against a completion API
//! - Per-user ranking models trained online from feedback
//! - redb persistence of model state and the training log
//! ============================================================================

pub mod config;
pub mod context;
pub mod db;
pub mod feedback;
pub mod health;
pub mod orchestrator;
pub mod providers;
pub mod ranking;
pub mod retry;
pub mod service;
pub mod types;

// Re-export main types for convenience
pub use types::*;
pub use config::ConverseConfig;
pub use db::{ConverseDb, MemoryModelStore, ModelStore, TrainingLog};
pub use health::{HealthReport, ServiceStatus};
pub use orchestrator::{ResponseOrchestrator, TurnState};
pub use providers::{CompletionClient, EmbeddingClient};
pub use service::{ConverseService, MaintenanceHandle};
