//! ============================================================================
//! Providers Module - Narrow wrappers over the external services
//! ============================================================================
//! - `CompletionClient`: history + temperature → generated text
//! - `EmbeddingClient`: text → fixed-length vector
//!
//! Both are traits so the orchestrator can be driven by scripted fakes in
//! tests; the HTTP implementations speak the OpenAI-compatible wire format.
//! ============================================================================

mod completion;
mod embeddings;

pub use completion::{CompletionClient, HttpCompletionClient};
pub use embeddings::{EmbeddingClient, HttpEmbeddingClient};
