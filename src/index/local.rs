//! File-backed index for offline runs and end-to-end tests.
//!
//! Wraps an [`InMemoryIndex`] and persists its [`IndexSnapshot`] as JSON
//! after every write. The snapshot is replaced atomically (write to a
//! sibling temp file, then rename), so a crash mid-write leaves the previous
//! state intact.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::Mutex;
use vector_sync_core::error::RemoteError;
use vector_sync_core::index::memory::{InMemoryIndex, IndexSnapshot};
use vector_sync_core::index::VectorIndex;
use vector_sync_core::models::{IndexStats, ListPage, RemoteItem, UpsertItem};

pub struct LocalIndex {
    path: PathBuf,
    inner: InMemoryIndex,
    // Serializes mutate-then-save so snapshots are never interleaved.
    write_lock: Mutex<()>,
}

impl LocalIndex {
    /// Open the snapshot at `path`, starting empty if it does not exist.
    pub fn open(path: &Path) -> Result<Self> {
        let snapshot = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read index snapshot: {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse index snapshot: {}", path.display()))?
        } else {
            IndexSnapshot::default()
        };

        Ok(Self {
            path: path.to_path_buf(),
            inner: InMemoryIndex::from_snapshot(snapshot),
            write_lock: Mutex::new(()),
        })
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<RemoteItem> {
        self.inner.get(id)
    }

    async fn save(&self) -> Result<(), RemoteError> {
        let json = serde_json::to_vec_pretty(&self.inner.snapshot())
            .map_err(|e| RemoteError::Rejected(format!("cannot encode snapshot: {}", e)))?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(io_error)?;
            }
        }
        let mut tmp = self.path.as_os_str().to_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, json).await.map_err(io_error)?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(io_error)?;
        Ok(())
    }
}

fn io_error(e: std::io::Error) -> RemoteError {
    RemoteError::Transient(format!("index snapshot write failed: {}", e))
}

#[async_trait]
impl VectorIndex for LocalIndex {
    async fn fetch(&self, ids: &[String]) -> Result<HashMap<String, RemoteItem>, RemoteError> {
        self.inner.fetch(ids).await
    }

    async fn describe_stats(&self) -> Result<IndexStats, RemoteError> {
        self.inner.describe_stats().await
    }

    async fn query(&self, vector: &[f32], top_k: usize) -> Result<Vec<String>, RemoteError> {
        self.inner.query(vector, top_k).await
    }

    async fn list(
        &self,
        pagination_token: Option<&str>,
        limit: usize,
    ) -> Result<ListPage, RemoteError> {
        self.inner.list(pagination_token, limit).await
    }

    async fn upsert(&self, items: &[UpsertItem]) -> Result<(), RemoteError> {
        let _guard = self.write_lock.lock().await;
        self.inner.upsert(items).await?;
        self.save().await
    }

    async fn delete(&self, ids: &[String]) -> Result<(), RemoteError> {
        let _guard = self.write_lock.lock().await;
        self.inner.delete(ids).await?;
        self.save().await
    }
}
