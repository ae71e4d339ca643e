//! Reconciliation: apply a change ledger to the remote index.
//!
//! Ledger entries (optionally only the first `limit`) are split into upsert
//! candidates (`add`/`update` with a local record) and delete candidates,
//! then cut into batches of `batch_size`:
//!
//! - **upsert batch**: canonical text per record → one embedding call → one
//!   upsert call carrying `{id, vector, metadata}` for every record.
//! - **delete batch**: one delete call. Deleting an absent id is a no-op.
//!
//! Batches run on the bounded pool, each call wrapped in the retry policy.
//! A batch that still fails is recorded and the others carry on; an
//! authentication failure stops scheduling and marks the run aborted. The
//! entries of failed and never-started batches are kept in
//! [`ApplySummary::unfinished`] so the caller can write a retry ledger.

use std::ops::ControlFlow;
use std::sync::Arc;

use anyhow::{bail, Result};
use serde::Serialize;
use tracing::{debug, info, warn};
use vector_sync_core::embedding::EmbeddingProvider;
use vector_sync_core::error::RemoteError;
use vector_sync_core::index::VectorIndex;
use vector_sync_core::models::{Action, ChangeEntry, UpsertItem};

use crate::dataset::Dataset;
use crate::pool::{run_bounded, StopFlag};
use crate::progress::{SyncProgressEvent, SyncProgressReporter};
use crate::retry::{with_retry, RetryPolicy};

#[derive(Debug, Clone)]
pub struct ApplyOptions {
    pub batch_size: usize,
    /// Only consider the first `limit` ledger entries.
    pub limit: Option<usize>,
    pub max_in_flight: usize,
    pub retry: RetryPolicy,
    /// Plan batches without calling either service.
    pub dry_run: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchKind {
    Upsert,
    Delete,
}

#[derive(Debug, Clone)]
struct Batch {
    kind: BatchKind,
    number: usize,
    entries: Vec<ChangeEntry>,
}

impl Batch {
    fn ids(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.id.clone()).collect()
    }
}

/// A batch that failed after retries.
#[derive(Debug, Clone, Serialize)]
pub struct FailedBatch {
    pub kind: BatchKind,
    pub batch: usize,
    pub ids: Vec<String>,
    pub error: String,
}

/// Outcome of one apply run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ApplySummary {
    pub run_id: String,
    pub considered: usize,
    pub upsert_candidates: usize,
    pub delete_candidates: usize,
    pub upserted: usize,
    pub deleted: usize,
    /// Upsert entries with no local record.
    pub skipped: usize,
    pub upsert_batches: usize,
    pub delete_batches: usize,
    pub failed_batches: Vec<FailedBatch>,
    pub cancelled: bool,
    pub dry_run: bool,
    /// Set when a fatal error stopped the run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aborted: Option<String>,
    /// Entries of failed and unstarted batches, upserts before deletes.
    #[serde(skip)]
    pub unfinished: Vec<ChangeEntry>,
}

/// Apply `entries` to `index`.
#[allow(clippy::too_many_arguments)]
pub async fn apply(
    run_id: &str,
    entries: Vec<ChangeEntry>,
    dataset: Arc<Dataset>,
    index: Arc<dyn VectorIndex>,
    embedder: Arc<dyn EmbeddingProvider>,
    opts: &ApplyOptions,
    stop: &StopFlag,
    progress: &dyn SyncProgressReporter,
) -> Result<ApplySummary> {
    let mut summary = ApplySummary {
        run_id: run_id.to_string(),
        dry_run: opts.dry_run,
        ..ApplySummary::default()
    };

    let considered: Vec<ChangeEntry> = match opts.limit {
        Some(limit) => entries.into_iter().take(limit).collect(),
        None => entries,
    };
    summary.considered = considered.len();

    let mut upserts = Vec::new();
    let mut deletes = Vec::new();
    for entry in considered {
        match entry.action {
            Action::Add | Action::Update if dataset.contains(&entry.id) => upserts.push(entry),
            Action::Add | Action::Update => {
                debug!(id = %entry.id, action = %entry.action, "no local record; skipping");
                summary.skipped += 1;
            }
            Action::Delete => deletes.push(entry),
        }
    }
    if summary.skipped > 0 {
        warn!(
            entries = summary.skipped,
            "ledger entries without a local record were skipped"
        );
    }
    summary.upsert_candidates = upserts.len();
    summary.delete_candidates = deletes.len();

    let batch_size = opts.batch_size.max(1);
    let mut batches = make_batches(BatchKind::Upsert, upserts, batch_size);
    summary.upsert_batches = batches.len();
    let delete_batches = make_batches(BatchKind::Delete, deletes, batch_size);
    summary.delete_batches = delete_batches.len();
    batches.extend(delete_batches);

    if opts.dry_run {
        info!(
            upsert_batches = summary.upsert_batches,
            delete_batches = summary.delete_batches,
            "dry run; no changes sent"
        );
        return Ok(summary);
    }

    if summary.upsert_batches > 0 && embedder.dims() == 0 {
        bail!(
            "Embedding provider '{}' cannot produce vectors; configure [embedding] to apply upserts",
            embedder.model_name()
        );
    }

    let total = batches.len() as u64;
    let mut done = 0u64;
    let mut failed: Vec<Batch> = Vec::new();
    let retry = opts.retry;

    let unstarted = run_bounded(
        batches,
        opts.max_in_flight,
        stop,
        |batch: Batch| {
            let dataset = dataset.clone();
            let index = index.clone();
            let embedder = embedder.clone();
            async move {
                let result = run_batch(&batch, &dataset, index.as_ref(), embedder.as_ref(), &retry).await;
                (batch, result)
            }
        },
        |(batch, result): (Batch, Result<usize, RemoteError>)| {
            done += 1;
            progress.report(SyncProgressEvent::Applying { n: done, total });
            match result {
                Ok(n) => {
                    match batch.kind {
                        BatchKind::Upsert => summary.upserted += n,
                        BatchKind::Delete => summary.deleted += n,
                    }
                    ControlFlow::Continue(())
                }
                Err(e) => {
                    warn!(
                        kind = ?batch.kind,
                        batch = batch.number,
                        ids = batch.entries.len(),
                        error = %e,
                        "batch failed"
                    );
                    summary.failed_batches.push(FailedBatch {
                        kind: batch.kind,
                        batch: batch.number,
                        ids: batch.ids(),
                        error: e.to_string(),
                    });
                    let fatal = e.is_fatal();
                    if fatal {
                        summary.aborted = Some(e.to_string());
                    }
                    failed.push(batch);
                    if fatal {
                        ControlFlow::Break(())
                    } else {
                        ControlFlow::Continue(())
                    }
                }
            }
        },
    )
    .await;

    if !unstarted.is_empty() && summary.aborted.is_none() {
        warn!(batches = unstarted.len(), "apply stopped before all batches were sent");
        summary.cancelled = true;
    }

    failed.extend(unstarted);
    failed.sort_by_key(|b| (b.kind == BatchKind::Delete, b.number));
    summary.unfinished = failed.into_iter().flat_map(|b| b.entries).collect();
    summary
        .failed_batches
        .sort_by_key(|b| (b.kind == BatchKind::Delete, b.batch));

    info!(
        run_id,
        upserted = summary.upserted,
        deleted = summary.deleted,
        failed_batches = summary.failed_batches.len(),
        "apply finished"
    );
    Ok(summary)
}

fn make_batches(kind: BatchKind, entries: Vec<ChangeEntry>, size: usize) -> Vec<Batch> {
    entries
        .chunks(size)
        .enumerate()
        .map(|(i, chunk)| Batch {
            kind,
            number: i + 1,
            entries: chunk.to_vec(),
        })
        .collect()
}

async fn run_batch(
    batch: &Batch,
    dataset: &Dataset,
    index: &dyn VectorIndex,
    embedder: &dyn EmbeddingProvider,
    retry: &RetryPolicy,
) -> Result<usize, RemoteError> {
    match batch.kind {
        BatchKind::Upsert => {
            let records: Vec<_> = batch
                .entries
                .iter()
                .filter_map(|e| dataset.get(&e.id))
                .collect();
            let texts: Vec<String> = records.iter().map(|r| r.canonical_text()).collect();

            let what = format!("embed batch {}", batch.number);
            let vectors = with_retry(retry, &what, || embedder.embed(&texts)).await?;
            check_vectors(&vectors, texts.len(), embedder.dims())?;

            let items: Vec<UpsertItem> = records
                .iter()
                .zip(vectors)
                .map(|(record, vector)| UpsertItem {
                    id: record.id.clone(),
                    vector,
                    metadata: record.metadata(),
                })
                .collect();

            let what = format!("upsert batch {}", batch.number);
            with_retry(retry, &what, || index.upsert(&items)).await?;
            Ok(items.len())
        }
        BatchKind::Delete => {
            let ids = batch.ids();
            let what = format!("delete batch {}", batch.number);
            with_retry(retry, &what, || index.delete(&ids)).await?;
            Ok(ids.len())
        }
    }
}

/// One vector per text, each of the configured dimension.
fn check_vectors(vectors: &[Vec<f32>], expected: usize, dims: usize) -> Result<(), RemoteError> {
    if vectors.len() != expected {
        return Err(RemoteError::Rejected(format!(
            "embedding returned {} vectors for {} texts",
            vectors.len(),
            expected
        )));
    }
    if let Some(bad) = vectors.iter().find(|v| v.len() != dims) {
        return Err(RemoteError::Rejected(format!(
            "embedding has {} dimensions, expected {}",
            bad.len(),
            dims
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NoProgress;
    use serde_json::json;
    use vector_sync_core::embedding::HashEmbedder;
    use vector_sync_core::index::memory::InMemoryIndex;
    use vector_sync_core::models::{Record, RecordSchema, RemoteItem};

    fn record(id: &str) -> Record {
        Record::from_value(
            &json!({"id": id, "path": format!("p/{}", id), "description": "d", "cpa": 1.5}),
            &RecordSchema::default(),
        )
        .unwrap()
    }

    fn opts(batch_size: usize) -> ApplyOptions {
        ApplyOptions {
            batch_size,
            limit: None,
            max_in_flight: 2,
            retry: RetryPolicy::none(),
            dry_run: false,
        }
    }

    async fn run(
        entries: Vec<ChangeEntry>,
        dataset: Dataset,
        index: Arc<InMemoryIndex>,
        embedder: Arc<dyn EmbeddingProvider>,
        opts: &ApplyOptions,
    ) -> ApplySummary {
        apply(
            "test-run",
            entries,
            Arc::new(dataset),
            index,
            embedder,
            opts,
            &StopFlag::new(),
            &NoProgress,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn upserts_and_deletes() {
        let index = Arc::new(InMemoryIndex::new());
        index.insert("old", RemoteItem::default());
        let entries = vec![
            ChangeEntry::new("A", Action::Add),
            ChangeEntry::new("B", Action::Update),
            ChangeEntry::new("old", Action::Delete),
        ];
        let dataset = Dataset::from_records([record("A"), record("B")]);
        let summary = run(entries, dataset, index.clone(), Arc::new(HashEmbedder::new(8)), &opts(1)).await;

        assert_eq!((summary.upserted, summary.deleted), (2, 1));
        assert_eq!((summary.upsert_batches, summary.delete_batches), (2, 1));
        assert!(summary.failed_batches.is_empty());
        assert!(summary.unfinished.is_empty());

        let a = index.get("A").unwrap();
        assert_eq!(a.raw_string(), "Full Path: p/A, Description: d");
        assert_eq!(a.metadata["cpa"], "1.5");
        assert_eq!(a.vector.unwrap().len(), 8);
        assert!(index.get("old").is_none());
    }

    #[tokio::test]
    async fn limit_and_missing_records() {
        let index = Arc::new(InMemoryIndex::new());
        let entries = vec![
            ChangeEntry::new("ghost", Action::Add),
            ChangeEntry::new("A", Action::Add),
            ChangeEntry::new("B", Action::Add),
        ];
        let dataset = Dataset::from_records([record("A"), record("B")]);
        let mut o = opts(10);
        o.limit = Some(2);
        let summary = run(entries, dataset, index.clone(), Arc::new(HashEmbedder::new(4)), &o).await;

        assert_eq!(summary.considered, 2);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.upserted, 1);
        assert!(index.get("B").is_none());
    }

    #[tokio::test]
    async fn dry_run_sends_nothing() {
        let index = Arc::new(InMemoryIndex::new());
        index.insert("old", RemoteItem::default());
        let mut o = opts(2);
        o.dry_run = true;
        let summary = run(
            vec![
                ChangeEntry::new("A", Action::Add),
                ChangeEntry::new("old", Action::Delete),
            ],
            Dataset::from_records([record("A")]),
            index.clone(),
            Arc::new(HashEmbedder::new(4)),
            &o,
        )
        .await;
        assert!(summary.dry_run);
        assert_eq!((summary.upsert_batches, summary.delete_batches), (1, 1));
        assert_eq!(summary.upserted + summary.deleted, 0);
        assert_eq!(index.len(), 1);
    }

    struct WrongDims;

    #[async_trait::async_trait]
    impl EmbeddingProvider for WrongDims {
        fn model_name(&self) -> &str {
            "wrong"
        }
        fn dims(&self) -> usize {
            4
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RemoteError> {
            Ok(texts.iter().map(|_| vec![0.0; 3]).collect())
        }
    }

    #[tokio::test]
    async fn wrong_dimension_fails_the_batch() {
        let index = Arc::new(InMemoryIndex::new());
        let summary = run(
            vec![ChangeEntry::new("A", Action::Add)],
            Dataset::from_records([record("A")]),
            index.clone(),
            Arc::new(WrongDims),
            &opts(5),
        )
        .await;
        assert_eq!(summary.upserted, 0);
        assert_eq!(summary.failed_batches.len(), 1);
        assert!(summary.failed_batches[0].error.contains("dimensions"));
        assert_eq!(summary.unfinished, vec![ChangeEntry::new("A", Action::Add)]);
        assert!(index.is_empty());
    }

    #[test]
    fn vector_checks() {
        assert!(check_vectors(&[vec![0.0; 2]], 1, 2).is_ok());
        assert!(check_vectors(&[vec![0.0; 2]], 2, 2).is_err());
        assert!(check_vectors(&[vec![0.0; 3]], 1, 2).is_err());
    }
}
