//! Test utilities for the substrate - deterministic embedders and fixtures
//!
//! Mock implementations for fast tests that don't need a real model.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use async_trait::async_trait;

use crate::embedding::Embedder;
use crate::error::Result;

/// Dimension used by the mock embedder unless configured otherwise
pub const MOCK_DIMENSION: usize = 384;

/// Mock embedding model for tests that don't need real ML.
/// Produces deterministic vectors based on input text hash.
#[derive(Debug, Clone)]
pub struct MockEmbedder {
    dimension: usize,
}

impl Default for MockEmbedder {
    fn default() -> Self {
        Self::new()
    }
}

impl MockEmbedder {
    pub fn new() -> Self {
        Self {
            dimension: MOCK_DIMENSION,
        }
    }

    pub fn with_dimension(dimension: usize) -> Self {
        Self { dimension }
    }

    /// Generate a deterministic "embedding" from text using hashing.
    /// Values are in range [-1, 1].
    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut hasher = DefaultHasher::new();
        text.hash(&mut hasher);
        seeded_vector(hasher.finish(), self.dimension)
    }
}

#[async_trait]
impl Embedder for MockEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embed_text(text))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Pseudo-random but deterministic vector for a seed.
/// Distinct seeds give nearly orthogonal vectors in high dimensions.
pub fn seeded_vector(seed: u64, dimension: usize) -> Vec<f32> {
    let mut state = seed ^ 0x9e3779b97f4a7c15;
    (0..dimension)
        .map(|_| {
            // splitmix64
            state = state.wrapping_add(0x9e3779b97f4a7c15);
            let mut z = state;
            z = (z ^ (z >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
            z = (z ^ (z >> 27)).wrapping_mul(0x94d049bb133111eb);
            z ^= z >> 31;
            let normalized = (z as f64 / u64::MAX as f64) as f32;
            (normalized * 2.0) - 1.0
        })
        .collect()
}

/// Unit vector along `axis`
pub fn unit_vector(dimension: usize, axis: usize) -> Vec<f32> {
    let mut v = vec![0.0; dimension];
    v[axis % dimension] = 1.0;
    v
}
