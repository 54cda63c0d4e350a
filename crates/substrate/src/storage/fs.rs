//! Filesystem blob store
//!
//! Stores each datum as `<root>/<datum-id>.json`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::{Result, SubstrateError};
use crate::storage::{BlobStore, Datum};
use crate::types::DatumId;

/// Blob store that writes one JSON file per datum
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    /// Open a store rooted at `root`, creating the directory if needed
    pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root).await.map_err(|e| {
            SubstrateError::Storage(format!(
                "Failed to create blob directory {}: {}",
                root.display(),
                e
            ))
        })?;
        tracing::debug!("Opened blob store at {}", root.display());
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, id: &DatumId) -> PathBuf {
        self.root.join(format!("{id}.json"))
    }

    /// Ids of all data currently on disk
    pub async fn ids(&self) -> Result<Vec<DatumId>> {
        let mut ids = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if let Ok(uuid) = Uuid::parse_str(stem) {
                ids.push(DatumId::from_uuid(uuid));
            }
        }
        ids.sort();
        Ok(ids)
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, datum: Datum) -> Result<DatumId> {
        let id = DatumId::new();
        let bytes = serde_json::to_vec(&datum)
            .map_err(|e| SubstrateError::Serialization(e.to_string()))?;
        tokio::fs::write(self.path_for(&id), bytes)
            .await
            .map_err(|e| SubstrateError::Storage(format!("Failed to write datum {id}: {e}")))?;
        Ok(id)
    }

    async fn get(&self, id: &DatumId) -> Result<Option<Datum>> {
        let bytes = match tokio::fs::read(self.path_for(id)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(SubstrateError::Storage(format!(
                    "Failed to read datum {id}: {e}"
                )));
            }
        };
        let datum = serde_json::from_slice(&bytes)
            .map_err(|e| SubstrateError::Serialization(e.to_string()))?;
        Ok(Some(datum))
    }

    async fn delete(&self, id: &DatumId) -> Result<bool> {
        match tokio::fs::remove_file(self.path_for(id)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(SubstrateError::Storage(format!(
                "Failed to delete datum {id}: {e}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn test_roundtrip_on_disk() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::open(temp_dir.path().join("blobs")).await.unwrap();

        let mut metadata = BTreeMap::new();
        metadata.insert("source".to_string(), "test".to_string());
        let datum = Datum::new(b"persisted".to_vec()).with_metadata(metadata);

        let id = store.put(datum.clone()).await.unwrap();
        let loaded = store.get(&id).await.unwrap().unwrap();
        assert_eq!(loaded, datum);
        assert_eq!(store.ids().await.unwrap(), vec![id]);
    }

    #[tokio::test]
    async fn test_missing_datum() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::open(temp_dir.path()).await.unwrap();

        let id = DatumId::new();
        assert!(store.get(&id).await.unwrap().is_none());
        assert!(!store.delete(&id).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_removes_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::open(temp_dir.path()).await.unwrap();

        let id = store.put(Datum::new(b"gone".to_vec())).await.unwrap();
        assert!(store.delete(&id).await.unwrap());
        assert!(store.ids().await.unwrap().is_empty());
    }
}
