use std::sync::Arc;

use async_trait::async_trait;
use fastembed::{EmbeddingModel as FastEmbedModel, InitOptions, TextEmbedding};
use parking_lot::Mutex;

use crate::embedding::Embedder;
use crate::error::{Result, SubstrateError};

pub const EMBEDDING_DIMENSION: usize = 384;

/// Local embedding model (multilingual-e5-small) via fastembed
pub struct FastEmbedder {
    model: Arc<Mutex<TextEmbedding>>,
}

impl FastEmbedder {
    pub fn new() -> Result<Self> {
        let model = TextEmbedding::try_new(InitOptions::new(FastEmbedModel::MultilingualE5Small))
            .map_err(|e| SubstrateError::Embedding(e.to_string()))?;
        Ok(Self {
            model: Arc::new(Mutex::new(model)),
        })
    }
}

#[async_trait]
impl Embedder for FastEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let model = Arc::clone(&self.model);
        let text = text.to_string();

        let embeddings = tokio::task::spawn_blocking(move || {
            let mut model = model.lock();
            model.embed(vec![text], None)
        })
        .await
        .map_err(|e| SubstrateError::Embedding(e.to_string()))?
        .map_err(|e| SubstrateError::Embedding(e.to_string()))?;

        embeddings
            .into_iter()
            .next()
            .ok_or_else(|| SubstrateError::Embedding("No embedding returned".to_string()))
    }

    fn dimension(&self) -> usize {
        EMBEDDING_DIMENSION
    }
}
