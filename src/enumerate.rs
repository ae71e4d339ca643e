//! Remote id enumeration.
//!
//! Detection needs every id the remote index holds in order to find
//! deletions. Two strategies:
//!
//! - **list**: follow the index's paginated id listing until it runs out.
//!   Exhaustive; preferred whenever the index offers it.
//! - **query**: for indexes that only answer similarity queries. Issue top-k
//!   queries with a sequence of probe vectors and accumulate the returned ids
//!   until they cover the count reported by `describe_stats`. This is an
//!   approximation: a single top-k window is capped by the service, and
//!   nothing guarantees that the probes reach every item. The result says
//!   whether coverage was reached, and an incomplete enumeration is logged
//!   and marks the ledger partial.
//!
//! Probe 0 is the all-zero vector. Probe `k >= 1` is the signed basis vector
//! `±e_j` with `j = (k-1)/2 mod dim`, alternating sign, so successive probes
//! pull back different neighbourhoods.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use tracing::{info, warn};
use vector_sync_core::error::RemoteError;
use vector_sync_core::index::VectorIndex;
use vector_sync_core::ledger::EnumerationInfo;

use crate::progress::{SyncProgressEvent, SyncProgressReporter};
use crate::retry::{with_retry, RetryPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnumerationStrategy {
    List,
    Query,
}

impl EnumerationStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnumerationStrategy::List => "list",
            EnumerationStrategy::Query => "query",
        }
    }
}

impl fmt::Display for EnumerationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EnumerationStrategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "list" => Ok(EnumerationStrategy::List),
            "query" => Ok(EnumerationStrategy::Query),
            other => anyhow::bail!("Unknown enumeration strategy: '{}'", other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EnumerationOptions {
    pub strategy: EnumerationStrategy,
    pub list_page_size: usize,
    pub query_top_k: usize,
    pub max_probes: usize,
    pub stall_rounds: usize,
    /// Vector dimension of the index, for building probe vectors.
    pub dimension: usize,
}

impl Default for EnumerationOptions {
    fn default() -> Self {
        Self {
            strategy: EnumerationStrategy::List,
            list_page_size: 100,
            query_top_k: 10_000,
            max_probes: 64,
            stall_rounds: 3,
            dimension: 256,
        }
    }
}

/// Ids found in the remote index.
#[derive(Debug, Clone)]
pub struct Enumeration {
    pub strategy: EnumerationStrategy,
    pub ids: HashSet<String>,
    /// Item count reported by the index, when it was consulted.
    pub total: Option<u64>,
    /// Whether `ids` is known to be every id in the index.
    pub complete: bool,
}

impl Enumeration {
    pub fn info(&self) -> EnumerationInfo {
        EnumerationInfo {
            strategy: self.strategy.to_string(),
            seen: self.ids.len() as u64,
            total: self.total,
            complete: self.complete,
        }
    }
}

/// Collect remote ids with the configured strategy.
pub async fn enumerate_remote_ids(
    index: &dyn VectorIndex,
    opts: &EnumerationOptions,
    retry: &RetryPolicy,
    progress: &dyn SyncProgressReporter,
) -> Result<Enumeration, RemoteError> {
    let result = match opts.strategy {
        EnumerationStrategy::List => enumerate_by_listing(index, opts, retry, progress).await?,
        EnumerationStrategy::Query => enumerate_by_query(index, opts, retry, progress).await?,
    };

    if result.complete {
        info!(
            strategy = %result.strategy,
            ids = result.ids.len(),
            "enumerated remote ids"
        );
    } else {
        warn!(
            strategy = %result.strategy,
            seen = result.ids.len(),
            total = ?result.total,
            "remote id enumeration is incomplete; deletions may be missed"
        );
    }
    Ok(result)
}

async fn enumerate_by_listing(
    index: &dyn VectorIndex,
    opts: &EnumerationOptions,
    retry: &RetryPolicy,
    progress: &dyn SyncProgressReporter,
) -> Result<Enumeration, RemoteError> {
    let mut ids = HashSet::new();
    let mut token: Option<String> = None;
    let mut seen_tokens: HashSet<String> = HashSet::new();
    let mut complete = true;

    loop {
        let page = with_retry(retry, "list ids", || {
            index.list(token.as_deref(), opts.list_page_size)
        })
        .await?;
        ids.extend(page.ids);
        progress.report(SyncProgressEvent::Enumerating {
            strategy: "list".to_string(),
            seen: ids.len() as u64,
            total: None,
        });

        match page.next_token {
            Some(next) if !seen_tokens.insert(next.clone()) => {
                warn!(token = %next, "listing repeated a pagination token; stopping");
                complete = false;
                break;
            }
            Some(next) => token = Some(next),
            None => break,
        }
    }

    Ok(Enumeration {
        strategy: EnumerationStrategy::List,
        ids,
        total: None,
        complete,
    })
}

async fn enumerate_by_query(
    index: &dyn VectorIndex,
    opts: &EnumerationOptions,
    retry: &RetryPolicy,
    progress: &dyn SyncProgressReporter,
) -> Result<Enumeration, RemoteError> {
    let stats = with_retry(retry, "describe index stats", || index.describe_stats()).await?;
    let total = stats.total_count;
    let mut ids: HashSet<String> = HashSet::new();
    let mut stalled = 0usize;

    for probe in 0..opts.max_probes {
        if ids.len() as u64 >= total {
            break;
        }
        let vector = probe_vector(probe, opts.dimension);
        let matches = with_retry(retry, "enumeration query", || {
            index.query(&vector, opts.query_top_k)
        })
        .await?;

        let before = ids.len();
        ids.extend(matches);
        progress.report(SyncProgressEvent::Enumerating {
            strategy: "query".to_string(),
            seen: ids.len() as u64,
            total: Some(total),
        });

        if ids.len() == before {
            stalled += 1;
            if stalled >= opts.stall_rounds.max(1) {
                break;
            }
        } else {
            stalled = 0;
        }
    }

    let complete = ids.len() as u64 >= total;
    Ok(Enumeration {
        strategy: EnumerationStrategy::Query,
        ids,
        total: Some(total),
        complete,
    })
}

/// The `k`-th probe vector of dimension `dim`.
pub fn probe_vector(k: usize, dim: usize) -> Vec<f32> {
    let dim = dim.max(1);
    let mut v = vec![0.0f32; dim];
    if k > 0 {
        let j = ((k - 1) / 2) % dim;
        v[j] = if (k - 1) % 2 == 0 { 1.0 } else { -1.0 };
    }
    v
}
