// Embedding functionality module
// Handles content chunking and embedding generation via the provider API

pub mod chunking;
pub mod client;

pub use chunking::{ChunkerConfig, chunk_text, estimate_tokens};
pub use client::{EmbeddingClient, ProviderError};
