//! ============================================================================
//! Database Types - Serializable records for redb storage
//! ============================================================================

use serde::{Deserialize, Serialize};

/// Summary of one persisted ranking model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredModelInfo {
    pub user_id: String,
    /// Encoded size on disk
    pub bytes: usize,
    /// Training steps recorded in the snapshot; `None` if it failed to decode
    pub train_steps: Option<u64>,
    pub dim: Option<usize>,
}

/// Database statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbStats {
    pub total_models: usize,
    pub total_samples: usize,
    pub users_with_samples: usize,
}
