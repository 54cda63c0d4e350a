//! Process-local blob store backed by a concurrent map

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::Result;
use crate::storage::{BlobStore, Datum};
use crate::types::DatumId;

/// Blob store that keeps every datum in memory
#[derive(Debug, Default)]
pub struct InMemoryBlobStore {
    data: DashMap<DatumId, Datum>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn put(&self, datum: Datum) -> Result<DatumId> {
        let id = DatumId::new();
        self.data.insert(id, datum);
        Ok(id)
    }

    async fn get(&self, id: &DatumId) -> Result<Option<Datum>> {
        Ok(self.data.get(id).map(|entry| entry.value().clone()))
    }

    async fn delete(&self, id: &DatumId) -> Result<bool> {
        Ok(self.data.remove(id).is_some())
    }
}
