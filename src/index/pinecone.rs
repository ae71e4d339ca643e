//! Pinecone data-plane adapter.
//!
//! Talks to an index host (`https://<index>-<project>.svc.<env>.pinecone.io`)
//! with the `Api-Key` header. The key is read from the environment variable
//! named by `index.api_key_env` (default `PINECONE_API_KEY`).
//!
//! | Operation | Endpoint |
//! |-----------|----------|
//! | fetch | `GET /vectors/fetch?ids=..&ids=..` |
//! | describe_stats | `POST /describe_index_stats` |
//! | query | `POST /query` |
//! | list | `GET /vectors/list` (serverless indexes only) |
//! | upsert | `POST /vectors/upsert` |
//! | delete | `POST /vectors/delete` |
//!
//! Metadata values come back as arbitrary JSON; they are stringified the same
//! way dataset fields are, so comparison happens on equal terms.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use reqwest::RequestBuilder;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use vector_sync_core::error::RemoteError;
use vector_sync_core::index::VectorIndex;
use vector_sync_core::models::{stringify_lossy, IndexStats, ListPage, RemoteItem, UpsertItem};

use crate::config::IndexConfig;
use crate::http;

const SERVICE: &str = "Pinecone";
const API_VERSION: &str = "2024-07";

pub struct PineconeIndex {
    host: String,
    api_key: String,
    namespace: Option<String>,
    client: reqwest::Client,
}

impl PineconeIndex {
    /// # Errors
    ///
    /// Returns an error if `index.host` is missing or the API key variable
    /// is not set.
    pub fn new(config: &IndexConfig) -> Result<Self> {
        let host = match config.host.as_deref() {
            Some(h) if !h.is_empty() => h,
            _ => bail!("index.host required for Pinecone index"),
        };
        let api_key = match std::env::var(&config.api_key_env) {
            Ok(key) if !key.is_empty() => key,
            _ => bail!("{} environment variable not set", config.api_key_env),
        };
        Self::with_key(
            host,
            api_key,
            config.namespace.clone(),
            Duration::from_secs(config.timeout_secs),
        )
    }

    /// Build an adapter with an explicit key.
    pub fn with_key(
        host: &str,
        api_key: String,
        namespace: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let host = if host.starts_with("http://") || host.starts_with("https://") {
            host.to_string()
        } else {
            format!("https://{}", host)
        };
        Ok(Self {
            host: host.trim_end_matches('/').to_string(),
            api_key,
            namespace,
            client: http::client(timeout)?,
        })
    }

    fn get(&self, path: &str) -> RequestBuilder {
        self.authorized(self.client.get(format!("{}{}", self.host, path)))
    }

    fn post(&self, path: &str) -> RequestBuilder {
        self.authorized(self.client.post(format!("{}{}", self.host, path)))
    }

    fn authorized(&self, req: RequestBuilder) -> RequestBuilder {
        req.header("Api-Key", &self.api_key)
            .header("X-Pinecone-API-Version", API_VERSION)
    }

    async fn send(&self, req: RequestBuilder) -> Result<reqwest::Response, RemoteError> {
        req.send()
            .await
            .map_err(|e| http::map_reqwest_error(SERVICE, e))
    }
}

// ── wire types ──────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct FetchResponse {
    #[serde(default)]
    vectors: HashMap<String, WireVector>,
}

#[derive(Debug, Deserialize)]
struct WireVector {
    #[serde(default)]
    values: Option<Vec<f32>>,
    #[serde(default)]
    metadata: Option<BTreeMap<String, Value>>,
}

impl WireVector {
    fn into_item(self) -> RemoteItem {
        RemoteItem {
            metadata: self
                .metadata
                .unwrap_or_default()
                .into_iter()
                .map(|(k, v)| (k, stringify_lossy(&v)))
                .collect(),
            vector: self.values.filter(|v| !v.is_empty()),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatsResponse {
    #[serde(default)]
    namespaces: HashMap<String, NamespaceStats>,
    #[serde(default)]
    total_vector_count: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NamespaceStats {
    #[serde(default)]
    vector_count: u64,
}

impl StatsResponse {
    fn count_for(&self, namespace: Option<&str>) -> u64 {
        match namespace {
            Some(ns) => self.namespaces.get(ns).map(|s| s.vector_count).unwrap_or(0),
            None => self.total_vector_count,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryRequest<'a> {
    vector: &'a [f32],
    top_k: usize,
    include_values: bool,
    include_metadata: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    namespace: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    matches: Vec<IdOnly>,
}

#[derive(Debug, Deserialize)]
struct IdOnly {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(default)]
    vectors: Vec<IdOnly>,
    #[serde(default)]
    pagination: Option<Pagination>,
}

#[derive(Debug, Deserialize)]
struct Pagination {
    #[serde(default)]
    next: Option<String>,
}

#[derive(Debug, Serialize)]
struct UpsertRequest<'a> {
    vectors: Vec<WireUpsert<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    namespace: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct WireUpsert<'a> {
    id: &'a str,
    values: &'a [f32],
    metadata: &'a BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
struct DeleteRequest<'a> {
    ids: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    namespace: Option<&'a str>,
}

#[async_trait]
impl VectorIndex for PineconeIndex {
    async fn fetch(&self, ids: &[String]) -> Result<HashMap<String, RemoteItem>, RemoteError> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let mut params: Vec<(&str, &str)> = ids.iter().map(|id| ("ids", id.as_str())).collect();
        if let Some(ns) = self.namespace.as_deref() {
            params.push(("namespace", ns));
        }
        let response = self.send(self.get("/vectors/fetch").query(&params)).await?;
        let body: FetchResponse = http::read_json(SERVICE, response).await?;
        Ok(body
            .vectors
            .into_iter()
            .map(|(id, v)| (id, v.into_item()))
            .collect())
    }

    async fn describe_stats(&self) -> Result<IndexStats, RemoteError> {
        let response = self
            .send(self.post("/describe_index_stats").json(&serde_json::json!({})))
            .await?;
        let body: StatsResponse = http::read_json(SERVICE, response).await?;
        Ok(IndexStats {
            total_count: body.count_for(self.namespace.as_deref()),
        })
    }

    async fn query(&self, vector: &[f32], top_k: usize) -> Result<Vec<String>, RemoteError> {
        let request = QueryRequest {
            vector,
            top_k,
            include_values: false,
            include_metadata: false,
            namespace: self.namespace.as_deref(),
        };
        let response = self.send(self.post("/query").json(&request)).await?;
        let body: QueryResponse = http::read_json(SERVICE, response).await?;
        Ok(body.matches.into_iter().map(|m| m.id).collect())
    }

    async fn list(
        &self,
        pagination_token: Option<&str>,
        limit: usize,
    ) -> Result<ListPage, RemoteError> {
        let limit = limit.to_string();
        let mut params: Vec<(&str, &str)> = vec![("limit", limit.as_str())];
        if let Some(token) = pagination_token {
            params.push(("paginationToken", token));
        }
        if let Some(ns) = self.namespace.as_deref() {
            params.push(("namespace", ns));
        }
        let response = self.send(self.get("/vectors/list").query(&params)).await?;

        // Pod-based indexes answer list with a 4xx.
        let body: ListResponse = match http::read_json(SERVICE, response).await {
            Err(RemoteError::Rejected(message)) => return Err(RemoteError::Unsupported(message)),
            other => other?,
        };
        Ok(ListPage {
            ids: body.vectors.into_iter().map(|v| v.id).collect(),
            next_token: body.pagination.and_then(|p| p.next),
        })
    }

    async fn upsert(&self, items: &[UpsertItem]) -> Result<(), RemoteError> {
        let request = UpsertRequest {
            vectors: items
                .iter()
                .map(|item| WireUpsert {
                    id: &item.id,
                    values: &item.vector,
                    metadata: &item.metadata,
                })
                .collect(),
            namespace: self.namespace.as_deref(),
        };
        let response = self.send(self.post("/vectors/upsert").json(&request)).await?;
        http::expect_success(SERVICE, response).await
    }

    async fn delete(&self, ids: &[String]) -> Result<(), RemoteError> {
        let request = DeleteRequest {
            ids,
            namespace: self.namespace.as_deref(),
        };
        let response = self.send(self.post("/vectors/delete").json(&request)).await?;
        http::expect_success(SERVICE, response).await
    }
}
