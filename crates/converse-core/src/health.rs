//! Health reporting for the service and its collaborators

use serde::{Deserialize, Serialize};

use crate::types::Result;

/// Reachability of one collaborator, from a live probe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum ServiceStatus {
    Operational,
    Unavailable(String),
}

impl ServiceStatus {
    pub fn is_operational(&self) -> bool {
        matches!(self, ServiceStatus::Operational)
    }
}

impl From<Result<()>> for ServiceStatus {
    fn from(probe: Result<()>) -> Self {
        match probe {
            Ok(()) => ServiceStatus::Operational,
            Err(e) => ServiceStatus::Unavailable(e.to_string()),
        }
    }
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceStatus::Operational => write!(f, "operational"),
            ServiceStatus::Unavailable(reason) => write!(f, "unavailable ({})", reason),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub completion: ServiceStatus,
    pub embedding: ServiceStatus,
    pub model_store: ServiceStatus,
    pub cached_models: usize,
    pub active_conversations: usize,
    pub pending_interactions: usize,
}

impl HealthReport {
    /// Turns still succeed (degraded) without upstreams; this reports
    /// whether everything is reachable
    pub fn is_healthy(&self) -> bool {
        self.completion.is_operational() && self.embedding.is_operational() && self.model_store.is_operational()
    }
}
