//! Embedding collaborators
//!
//! The substrate never computes embeddings itself. Callers either pass an
//! embedding explicitly or hand the memory index an [`Embedder`].

use async_trait::async_trait;

use crate::error::Result;

#[cfg(feature = "fastembed")]
mod fast;

#[cfg(feature = "fastembed")]
pub use fast::{EMBEDDING_DIMENSION, FastEmbedder};

/// Text embedding provider
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a single text
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Number of components in every returned vector
    fn dimension(&self) -> usize;
}
