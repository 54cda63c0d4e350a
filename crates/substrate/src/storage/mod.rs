//! Blob store collaborators
//!
//! Raw memory content never lives in the substrate itself. An
//! [`AssociativeMemory`](crate::memory::AssociativeMemory) writes content to a
//! [`BlobStore`] and keeps only the returned id in its index.

pub mod fs;
pub mod memory;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::DatumId;

pub use fs::FsBlobStore;
pub use memory::InMemoryBlobStore;

/// A unit of raw content held by a blob store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Datum {
    /// Raw content bytes
    pub content: Vec<u8>,
    /// Free-form string metadata
    pub metadata: BTreeMap<String, String>,
    /// When the datum was created
    pub created_at: DateTime<Utc>,
}

impl Datum {
    pub fn new(content: Vec<u8>) -> Self {
        Self {
            content,
            metadata: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_metadata(mut self, metadata: BTreeMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Content store consumed by the memory index
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store a datum and return its id
    async fn put(&self, datum: Datum) -> Result<DatumId>;

    /// Fetch a datum, `None` if it does not exist
    async fn get(&self, id: &DatumId) -> Result<Option<Datum>>;

    /// Delete a datum. Returns false if it did not exist.
    async fn delete(&self, id: &DatumId) -> Result<bool>;
}
