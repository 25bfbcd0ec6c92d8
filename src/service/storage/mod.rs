// =============================================================================
// Matrixon Sync - Storage Providers
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Key-value persistence for the sync cursor, the registered filter and the
//   windowed list state. The in-memory provider backs tests and throwaway
//   clients; the file provider keeps everything in one JSON document.
//
// =============================================================================

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use matrixon_sync_core::{Error, Result, StorageProvider, StoredFilter};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Everything a provider persists
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct StorageDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cursor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    filter: Option<StoredFilter>,
    #[serde(default)]
    values: BTreeMap<String, String>,
}

/// Non-persistent storage
#[derive(Debug, Clone, Default)]
pub struct MemoryStorageProvider {
    document: Arc<RwLock<StorageDocument>>,
}

impl MemoryStorageProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageProvider for MemoryStorageProvider {
    async fn get_cursor(&self) -> Result<Option<String>> {
        Ok(self.document.read().await.cursor.clone())
    }

    async fn set_cursor(&self, cursor: Option<String>) -> Result<()> {
        self.document.write().await.cursor = cursor;
        Ok(())
    }

    async fn get_filter(&self) -> Result<Option<StoredFilter>> {
        Ok(self.document.read().await.filter.clone())
    }

    async fn set_filter(&self, filter: Option<StoredFilter>) -> Result<()> {
        self.document.write().await.filter = filter;
        Ok(())
    }

    async fn read_value(&self, key: &str) -> Result<Option<String>> {
        Ok(self.document.read().await.values.get(key).cloned())
    }

    async fn store_value(&self, key: &str, value: String) -> Result<()> {
        self.document.write().await.values.insert(key.to_owned(), value);
        Ok(())
    }
}

/// Storage backed by a single JSON file.
///
/// Every write rewrites the whole document through a temporary file and a
/// rename, so a crash never leaves a half-written cursor behind.
#[derive(Debug, Clone)]
pub struct FileStorageProvider {
    path: PathBuf,
    document: Arc<RwLock<StorageDocument>>,
}

impl FileStorageProvider {
    /// Open (or create on first write) the document at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if an existing file cannot be parsed, or
    /// [`Error::Io`] if it cannot be read.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let document = match tokio::fs::read_to_string(&path).await {
            Ok(text) => serde_json::from_str(&text).map_err(|e| {
                Error::Storage(format!("corrupt storage file {}: {e}", path.display()))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "📁 Starting with empty sync storage");
                StorageDocument::default()
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            document: Arc::new(RwLock::new(document)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn flush(&self, document: &StorageDocument) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let text = serde_json::to_string_pretty(document)?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, text).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!(path = %self.path.display(), "Sync storage flushed");
        Ok(())
    }

    async fn update<F>(&self, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut StorageDocument) + Send,
    {
        let mut document = self.document.write().await;
        mutate(&mut document);
        self.flush(&document).await
    }
}

#[async_trait]
impl StorageProvider for FileStorageProvider {
    async fn get_cursor(&self) -> Result<Option<String>> {
        Ok(self.document.read().await.cursor.clone())
    }

    async fn set_cursor(&self, cursor: Option<String>) -> Result<()> {
        self.update(|doc| doc.cursor = cursor).await
    }

    async fn get_filter(&self) -> Result<Option<StoredFilter>> {
        Ok(self.document.read().await.filter.clone())
    }

    async fn set_filter(&self, filter: Option<StoredFilter>) -> Result<()> {
        self.update(|doc| doc.filter = filter).await
    }

    async fn read_value(&self, key: &str) -> Result<Option<String>> {
        Ok(self.document.read().await.values.get(key).cloned())
    }

    async fn store_value(&self, key: &str, value: String) -> Result<()> {
        let key = key.to_owned();
        self.update(|doc| {
            doc.values.insert(key, value);
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_memory_provider() {
        let storage = MemoryStorageProvider::new();
        assert_eq!(storage.get_cursor().await.unwrap(), None);
        storage.set_cursor(Some("s1".to_string())).await.unwrap();
        storage.store_value("sync_v3", "{}".to_string()).await.unwrap();

        assert_eq!(storage.get_cursor().await.unwrap().as_deref(), Some("s1"));
        assert_eq!(storage.read_value("sync_v3").await.unwrap().as_deref(), Some("{}"));
        assert_eq!(storage.read_value("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_file_provider_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state").join("sync.json");

        let storage = FileStorageProvider::open(&path).await.unwrap();
        storage.set_cursor(Some("s42".to_string())).await.unwrap();
        storage
            .set_filter(Some(StoredFilter {
                id: "3".to_string(),
                filter: json!({ "presence": { "types": [] } }),
            }))
            .await
            .unwrap();
        storage.store_value("sync_v3", "{\"pos\":\"7\"}".to_string()).await.unwrap();

        let reopened = FileStorageProvider::open(&path).await.unwrap();
        assert_eq!(reopened.get_cursor().await.unwrap().as_deref(), Some("s42"));
        assert_eq!(reopened.get_filter().await.unwrap().unwrap().id, "3");
        assert_eq!(
            reopened.read_value("sync_v3").await.unwrap().as_deref(),
            Some("{\"pos\":\"7\"}")
        );
    }

    #[tokio::test]
    async fn test_corrupt_file_is_a_storage_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sync.json");
        tokio::fs::write(&path, "not json").await.unwrap();

        let err = FileStorageProvider::open(&path).await.unwrap_err();
        assert_eq!(err.kind(), "storage");
    }
}
