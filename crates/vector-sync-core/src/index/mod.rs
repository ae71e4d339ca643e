//! Remote vector index abstraction.
//!
//! The [`VectorIndex`] trait is the port through which detection reads and
//! application writes the remote index. Backends (a hosted index over HTTP,
//! a file snapshot, the in-memory double) implement it; the engine never
//! knows which one it is talking to.
//!
//! Implementations must be `Send + Sync` so a single instance can be shared
//! across concurrent batches.

pub mod memory;

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::RemoteError;
use crate::models::{IndexStats, ListPage, RemoteItem, UpsertItem};

/// Abstract remote vector index.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`fetch`](VectorIndex::fetch) | Batch read by id; missing ids are simply absent |
/// | [`describe_stats`](VectorIndex::describe_stats) | Total item count |
/// | [`query`](VectorIndex::query) | Top-k similarity query, returns ids |
/// | [`list`](VectorIndex::list) | Paginated id listing, when offered |
/// | [`upsert`](VectorIndex::upsert) | Overwrite-by-id write |
/// | [`delete`](VectorIndex::delete) | Remove-if-present |
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Fetch the items stored under `ids`.
    async fn fetch(&self, ids: &[String]) -> Result<HashMap<String, RemoteItem>, RemoteError>;

    /// Index-wide statistics.
    async fn describe_stats(&self) -> Result<IndexStats, RemoteError>;

    /// Ids of the `top_k` items nearest to `vector`.
    async fn query(&self, vector: &[f32], top_k: usize) -> Result<Vec<String>, RemoteError>;

    /// One page of a true id listing.
    ///
    /// The default reports the operation as unsupported, which is the case
    /// for indexes that only expose similarity queries.
    async fn list(
        &self,
        _pagination_token: Option<&str>,
        _limit: usize,
    ) -> Result<ListPage, RemoteError> {
        Err(RemoteError::Unsupported(
            "this index does not offer paginated listing".to_string(),
        ))
    }

    /// Insert or overwrite items by id.
    async fn upsert(&self, items: &[UpsertItem]) -> Result<(), RemoteError>;

    /// Delete items by id. Absent ids are not an error.
    async fn delete(&self, ids: &[String]) -> Result<(), RemoteError>;
}
