//! ============================================================================
//! Ranking Module - Per-user learned response reranker
//! ============================================================================
//! - `RankingModel`: shallow scorer over candidate embeddings
//! - `ModelRegistry`: lazy load/create, persistence and idle eviction
//! ============================================================================

mod model;
mod registry;

pub use model::{ModelSnapshot, Moments, RankingModel, SNAPSHOT_VERSION};
pub use registry::{ModelHandle, ModelRegistry};
