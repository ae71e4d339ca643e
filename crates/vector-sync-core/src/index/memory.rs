//! In-memory [`VectorIndex`] implementation for tests and offline runs.
//!
//! Uses a `BTreeMap` behind `std::sync::RwLock`. Similarity queries are
//! brute-force cosine similarity over all stored vectors, ties broken by id.
//! Listing pages through ids in sorted order using the last id of a page as
//! the continuation token.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::embedding::cosine_similarity;
use crate::error::RemoteError;
use crate::models::{IndexStats, ListPage, RemoteItem, UpsertItem};

use super::VectorIndex;

/// Serializable contents of an [`InMemoryIndex`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexSnapshot {
    pub items: BTreeMap<String, RemoteItem>,
}

/// In-memory index.
pub struct InMemoryIndex {
    items: RwLock<BTreeMap<String, RemoteItem>>,
    supports_list: bool,
    max_top_k: Option<usize>,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self {
            items: RwLock::new(BTreeMap::new()),
            supports_list: true,
            max_top_k: None,
        }
    }

    pub fn from_snapshot(snapshot: IndexSnapshot) -> Self {
        Self {
            items: RwLock::new(snapshot.items),
            ..Self::new()
        }
    }

    /// Behave like a query-only index: [`VectorIndex::list`] is unsupported.
    pub fn without_listing(mut self) -> Self {
        self.supports_list = false;
        self
    }

    /// Cap the number of matches a single query returns, as hosted indexes do.
    pub fn with_max_top_k(mut self, max: usize) -> Self {
        self.max_top_k = Some(max);
        self
    }

    /// Store an item directly, bypassing the upsert path.
    pub fn insert(&self, id: impl Into<String>, item: RemoteItem) {
        self.items.write().unwrap().insert(id.into(), item);
    }

    pub fn get(&self, id: &str) -> Option<RemoteItem> {
        self.items.read().unwrap().get(id).cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        self.items.read().unwrap().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.items.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> IndexSnapshot {
        IndexSnapshot {
            items: self.items.read().unwrap().clone(),
        }
    }
}

impl Default for InMemoryIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VectorIndex for InMemoryIndex {
    async fn fetch(&self, ids: &[String]) -> Result<HashMap<String, RemoteItem>, RemoteError> {
        let items = self.items.read().unwrap();
        Ok(ids
            .iter()
            .filter_map(|id| items.get(id).map(|item| (id.clone(), item.clone())))
            .collect())
    }

    async fn describe_stats(&self) -> Result<IndexStats, RemoteError> {
        Ok(IndexStats {
            total_count: self.len() as u64,
        })
    }

    async fn query(&self, vector: &[f32], top_k: usize) -> Result<Vec<String>, RemoteError> {
        let k = match self.max_top_k {
            Some(max) => top_k.min(max),
            None => top_k,
        };
        let items = self.items.read().unwrap();
        let mut scored: Vec<(f32, &String)> = items
            .iter()
            .map(|(id, item)| {
                let sim = item
                    .vector
                    .as_deref()
                    .map(|v| cosine_similarity(vector, v))
                    .unwrap_or(0.0);
                (sim, id)
            })
            .collect();
        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.1.cmp(b.1))
        });
        Ok(scored.into_iter().take(k).map(|(_, id)| id.clone()).collect())
    }

    async fn list(
        &self,
        pagination_token: Option<&str>,
        limit: usize,
    ) -> Result<ListPage, RemoteError> {
        if !self.supports_list {
            return Err(RemoteError::Unsupported(
                "in-memory index configured without listing".to_string(),
            ));
        }
        let items = self.items.read().unwrap();
        let lower = match pagination_token {
            Some(token) => Bound::Excluded(token.to_string()),
            None => Bound::Unbounded,
        };
        let mut ids: Vec<String> = items
            .range((lower, Bound::Unbounded))
            .take(limit.max(1) + 1)
            .map(|(id, _)| id.clone())
            .collect();
        let next_token = if ids.len() > limit.max(1) {
            ids.pop();
            ids.last().cloned()
        } else {
            None
        };
        Ok(ListPage { ids, next_token })
    }

    async fn upsert(&self, items: &[UpsertItem]) -> Result<(), RemoteError> {
        let mut stored = self.items.write().unwrap();
        for item in items {
            stored.insert(
                item.id.clone(),
                RemoteItem {
                    metadata: item.metadata.clone(),
                    vector: Some(item.vector.clone()),
                },
            );
        }
        Ok(())
    }

    async fn delete(&self, ids: &[String]) -> Result<(), RemoteError> {
        let mut stored = self.items.write().unwrap();
        for id in ids {
            stored.remove(id);
        }
        Ok(())
    }
}
