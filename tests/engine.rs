//! Integration tests for the detect → apply engine.
//!
//! The index and embedding service are injected through the
//! `VectorIndex` and `EmbeddingProvider` ports, so these tests drive the real
//! engine against in-memory doubles that record calls and inject failures.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use vector_sync::apply::{apply, ApplyOptions, ApplySummary, BatchKind};
use vector_sync::dataset::Dataset;
use vector_sync::detect::{detect, DetectOptions, DetectSummary};
use vector_sync::enumerate::EnumerationOptions;
use vector_sync::pool::StopFlag;
use vector_sync::progress::NoProgress;
use vector_sync::retry::RetryPolicy;
use vector_sync_core::embedding::{EmbeddingProvider, HashEmbedder};
use vector_sync_core::error::RemoteError;
use vector_sync_core::index::memory::InMemoryIndex;
use vector_sync_core::index::VectorIndex;
use vector_sync_core::ledger::{read_ledger, LedgerWriter};
use vector_sync_core::models::{
    Action, ChangeEntry, IndexStats, ListPage, Record, RecordSchema, RemoteItem, UpsertItem,
};

// ─── Test Index ─────────────────────────────────────────────────────

/// Wraps an [`InMemoryIndex`], recording call sizes and failing on demand.
#[derive(Default)]
struct RecordingIndex {
    inner: InMemoryIndex,
    upsert_calls: Mutex<Vec<Vec<String>>>,
    delete_calls: Mutex<Vec<Vec<String>>>,
    /// Upserts containing this id fail with the given error.
    poison: Option<(String, RemoteError)>,
    /// The first `n` fetches fail with `Transient`.
    failing_fetches: AtomicUsize,
    /// The first `n` upserts fail with `RateLimited`.
    rate_limited_upserts: AtomicUsize,
}

impl RecordingIndex {
    fn new(inner: InMemoryIndex) -> Self {
        Self {
            inner,
            ..Self::default()
        }
    }

    fn poisoned(mut self, id: &str, err: RemoteError) -> Self {
        self.poison = Some((id.to_string(), err));
        self
    }

    fn upserts(&self) -> Vec<Vec<String>> {
        self.upsert_calls.lock().unwrap().clone()
    }

    fn deletes(&self) -> Vec<Vec<String>> {
        self.delete_calls.lock().unwrap().clone()
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl VectorIndex for RecordingIndex {
    async fn fetch(&self, ids: &[String]) -> Result<HashMap<String, RemoteItem>, RemoteError> {
        if take_one(&self.failing_fetches) {
            return Err(RemoteError::Transient("connection reset".to_string()));
        }
        self.inner.fetch(ids).await
    }

    async fn describe_stats(&self) -> Result<IndexStats, RemoteError> {
        self.inner.describe_stats().await
    }

    async fn query(&self, vector: &[f32], top_k: usize) -> Result<Vec<String>, RemoteError> {
        self.inner.query(vector, top_k).await
    }

    async fn list(&self, token: Option<&str>, limit: usize) -> Result<ListPage, RemoteError> {
        self.inner.list(token, limit).await
    }

    async fn upsert(&self, items: &[UpsertItem]) -> Result<(), RemoteError> {
        let ids: Vec<String> = items.iter().map(|i| i.id.clone()).collect();
        self.upsert_calls.lock().unwrap().push(ids.clone());
        if take_one(&self.rate_limited_upserts) {
            return Err(RemoteError::RateLimited {
                retry_after: Some(Duration::from_millis(1)),
                message: "slow down".to_string(),
            });
        }
        if let Some((id, err)) = &self.poison {
            if ids.contains(id) {
                return Err(err.clone());
            }
        }
        self.inner.upsert(items).await
    }

    async fn delete(&self, ids: &[String]) -> Result<(), RemoteError> {
        self.delete_calls.lock().unwrap().push(ids.to_vec());
        self.inner.delete(ids).await
    }
}

// ─── Helpers ────────────────────────────────────────────────────────

fn record(id: &str, path: &str, description: &str) -> Record {
    Record::from_value(
        &json!({"id": id, "path": path, "description": description, "segment": "s1"}),
        &RecordSchema::default(),
    )
    .unwrap()
}

fn stored(record: &Record) -> RemoteItem {
    RemoteItem {
        metadata: record.metadata(),
        vector: None,
    }
}

fn detect_options() -> DetectOptions {
    DetectOptions {
        fetch_page_size: 2,
        max_in_flight: 3,
        retry: RetryPolicy::none(),
        enumeration: EnumerationOptions {
            list_page_size: 3,
            ..EnumerationOptions::default()
        },
    }
}

fn apply_options(batch_size: usize) -> ApplyOptions {
    ApplyOptions {
        batch_size,
        limit: None,
        max_in_flight: 3,
        retry: RetryPolicy::none(),
        dry_run: false,
    }
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_retries: 3,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
    }
}

async fn run_detect_with(
    dataset: &Arc<Dataset>,
    index: Arc<dyn VectorIndex>,
    opts: &DetectOptions,
) -> (DetectSummary, Vec<ChangeEntry>) {
    let mut ledger = LedgerWriter::new(Vec::new()).unwrap();
    let summary = detect(
        "test-detect",
        dataset.clone(),
        index,
        opts,
        &mut ledger,
        &StopFlag::new(),
        &NoProgress,
    )
    .await
    .unwrap();
    let bytes = ledger.into_inner().unwrap();
    let mut entries = read_ledger(bytes.as_slice()).unwrap().entries;
    entries.sort_by(|a, b| a.id.cmp(&b.id));
    (summary, entries)
}

async fn run_detect(
    dataset: &Arc<Dataset>,
    index: Arc<dyn VectorIndex>,
) -> (DetectSummary, Vec<ChangeEntry>) {
    run_detect_with(dataset, index, &detect_options()).await
}

async fn run_apply(
    entries: Vec<ChangeEntry>,
    dataset: &Arc<Dataset>,
    index: Arc<dyn VectorIndex>,
    opts: &ApplyOptions,
) -> ApplySummary {
    apply(
        "test-apply",
        entries,
        dataset.clone(),
        index,
        Arc::new(HashEmbedder::new(16)),
        opts,
        &StopFlag::new(),
        &NoProgress,
    )
    .await
    .unwrap()
}

fn dataset_of(records: impl IntoIterator<Item = Record>) -> Arc<Dataset> {
    Arc::new(Dataset::from_records(records))
}

// ─── Scenarios ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_new_record_is_added_with_one_upsert() {
    let dataset = dataset_of([record("A", "a/b", "d1")]);
    let index = Arc::new(RecordingIndex::new(InMemoryIndex::new()));

    let (_, entries) = run_detect(&dataset, index.clone()).await;
    assert_eq!(entries, vec![ChangeEntry::new("A", Action::Add)]);

    let summary = run_apply(entries, &dataset, index.clone(), &apply_options(10)).await;
    assert_eq!(summary.upserted, 1);
    assert_eq!(index.upserts(), vec![vec!["A".to_string()]]);
    assert!(index.deletes().is_empty());
}

#[tokio::test]
async fn test_matching_record_yields_empty_ledger() {
    let a = record("A", "a/b", "d1");
    let remote = InMemoryIndex::new();
    remote.insert("A", stored(&a));

    let (summary, entries) = run_detect(&dataset_of([a]), Arc::new(remote)).await;
    assert!(entries.is_empty());
    assert_eq!(summary.total_changes(), 0);
    assert!(summary.is_complete());
}

#[tokio::test]
async fn test_remote_only_id_is_deleted() {
    let a = record("A", "a/b", "d1");
    let remote = InMemoryIndex::new();
    remote.insert("A", stored(&a));
    remote.insert("B", stored(&record("B", "x", "y")));

    let (_, entries) = run_detect(&dataset_of([a]), Arc::new(remote)).await;
    assert_eq!(entries, vec![ChangeEntry::new("B", Action::Delete)]);
}

#[tokio::test]
async fn test_changed_description_is_an_update() {
    let remote = InMemoryIndex::new();
    remote.insert("A", stored(&record("A", "a/b", "d1")));

    let (_, entries) =
        run_detect(&dataset_of([record("A", "a/b", "d2")]), Arc::new(remote)).await;
    assert_eq!(entries, vec![ChangeEntry::new("A", Action::Update)]);
}

#[tokio::test]
async fn test_extra_remote_metadata_is_not_a_change() {
    let a = record("A", "a/b", "d1");
    let mut item = stored(&a);
    item.metadata
        .insert("legacy".to_string(), "kept".to_string());
    let remote = InMemoryIndex::new();
    remote.insert("A", item);

    let (_, entries) = run_detect(&dataset_of([a]), Arc::new(remote)).await;
    assert!(entries.is_empty());
}

// ─── Properties ─────────────────────────────────────────────────────

#[tokio::test]
async fn test_detect_apply_detect_converges() {
    let remote = InMemoryIndex::new();
    remote.insert("stale", stored(&record("stale", "s", "s")));
    remote.insert("B", stored(&record("B", "b", "old")));
    let index = Arc::new(RecordingIndex::new(remote));

    let dataset = dataset_of((0..7).map(|i| record(&format!("r{}", i), "p", "d")).chain([
        record("B", "b", "new"),
    ]));

    let (first, entries) = run_detect(&dataset, index.clone()).await;
    assert_eq!((first.adds, first.updates, first.deletes), (7, 1, 1));

    let applied = run_apply(entries, &dataset, index.clone(), &apply_options(3)).await;
    assert!(applied.failed_batches.is_empty());
    assert_eq!((applied.upserted, applied.deleted), (8, 1));

    let (second, entries) = run_detect(&dataset, index.clone()).await;
    assert!(entries.is_empty(), "unexpected changes: {:?}", entries);
    assert_eq!(second.total_changes(), 0);

    let (third, _) = run_detect(&dataset, index).await;
    assert_eq!(third.total_changes(), 0);
}

#[tokio::test]
async fn test_reapplying_a_ledger_is_idempotent() {
    let remote = InMemoryIndex::new();
    remote.insert("gone", RemoteItem::default());
    let index = Arc::new(RecordingIndex::new(remote));
    let dataset = dataset_of([record("A", "a", "d"), record("B", "b", "d")]);
    let entries = vec![
        ChangeEntry::new("A", Action::Add),
        ChangeEntry::new("B", Action::Update),
        ChangeEntry::new("gone", Action::Delete),
    ];

    let first = run_apply(entries.clone(), &dataset, index.clone(), &apply_options(2)).await;
    let after_first = index.inner.snapshot();
    let second = run_apply(entries, &dataset, index.clone(), &apply_options(2)).await;

    assert!(first.failed_batches.is_empty());
    assert!(second.failed_batches.is_empty());
    assert_eq!(index.inner.snapshot().items, after_first.items);
    assert_eq!(index.inner.len(), 2);
}

#[tokio::test]
async fn test_batches_never_exceed_batch_size() {
    let index = Arc::new(RecordingIndex::new(InMemoryIndex::new()));
    for i in 0..11 {
        index
            .inner
            .insert(format!("old{:02}", i), RemoteItem::default());
    }
    let dataset = dataset_of((0..23).map(|i| record(&format!("new{:02}", i), "p", "d")));

    let (_, entries) = run_detect(&dataset, index.clone()).await;
    assert_eq!(entries.len(), 34);

    let summary = run_apply(entries, &dataset, index.clone(), &apply_options(4)).await;
    assert_eq!((summary.upsert_batches, summary.delete_batches), (6, 3));
    assert!(index.upserts().iter().all(|call| call.len() <= 4));
    assert!(index.deletes().iter().all(|call| call.len() <= 4));
    assert_eq!(index.upserts().iter().map(Vec::len).sum::<usize>(), 23);
    assert_eq!(index.deletes().iter().map(Vec::len).sum::<usize>(), 11);
}

#[tokio::test]
async fn test_deleting_absent_id_is_a_noop() {
    let index = Arc::new(RecordingIndex::new(InMemoryIndex::new()));
    let summary = run_apply(
        vec![ChangeEntry::new("never-there", Action::Delete)],
        &Arc::new(Dataset::default()),
        index.clone(),
        &apply_options(10),
    )
    .await;
    assert_eq!(summary.deleted, 1);
    assert!(summary.failed_batches.is_empty());
    assert_eq!(index.deletes(), vec![vec!["never-there".to_string()]]);
}

// ─── Failure handling ───────────────────────────────────────────────

#[tokio::test]
async fn test_failed_batch_is_isolated() {
    let index = Arc::new(
        RecordingIndex::new(InMemoryIndex::new())
            .poisoned("r3", RemoteError::Rejected("bad vector".to_string())),
    );
    let dataset = dataset_of((0..6).map(|i| record(&format!("r{}", i), "p", "d")));
    let entries: Vec<ChangeEntry> = dataset
        .ids()
        .map(|id| ChangeEntry::new(id.as_str(), Action::Add))
        .collect();

    let summary = run_apply(entries, &dataset, index.clone(), &apply_options(2)).await;

    assert_eq!(summary.upserted, 4);
    assert_eq!(summary.failed_batches.len(), 1);
    let failed = &summary.failed_batches[0];
    assert_eq!(failed.kind, BatchKind::Upsert);
    assert_eq!(failed.ids, vec!["r2".to_string(), "r3".to_string()]);
    assert!(summary.aborted.is_none());
    assert_eq!(
        summary.unfinished,
        vec![
            ChangeEntry::new("r2", Action::Add),
            ChangeEntry::new("r3", Action::Add),
        ]
    );
    assert!(index.inner.get("r2").is_none());
    assert!(index.inner.get("r5").is_some());
}

#[tokio::test]
async fn test_authentication_failure_aborts_run() {
    let index = Arc::new(
        RecordingIndex::new(InMemoryIndex::new())
            .poisoned("r0", RemoteError::Authentication("invalid key".to_string())),
    );
    let dataset = dataset_of((0..8).map(|i| record(&format!("r{}", i), "p", "d")));
    let entries: Vec<ChangeEntry> = dataset
        .ids()
        .map(|id| ChangeEntry::new(id.as_str(), Action::Add))
        .collect();
    let opts = ApplyOptions {
        max_in_flight: 1,
        ..apply_options(2)
    };

    let summary = run_apply(entries, &dataset, index.clone(), &opts).await;

    assert!(summary.aborted.as_deref().unwrap().contains("invalid key"));
    assert_eq!(summary.upserted, 0);
    assert_eq!(index.upserts().len(), 1);
    assert_eq!(summary.unfinished.len(), 8);
}

#[tokio::test]
async fn test_rate_limit_is_retried() {
    let index = Arc::new(RecordingIndex::new(InMemoryIndex::new()));
    index.rate_limited_upserts.store(2, Ordering::SeqCst);
    let dataset = dataset_of([record("A", "a", "d")]);
    let opts = ApplyOptions {
        retry: fast_retry(),
        ..apply_options(10)
    };

    let summary = run_apply(
        vec![ChangeEntry::new("A", Action::Add)],
        &dataset,
        index.clone(),
        &opts,
    )
    .await;

    assert_eq!(summary.upserted, 1);
    assert!(summary.failed_batches.is_empty());
    assert_eq!(index.upserts().len(), 3);
}

#[tokio::test]
async fn test_failed_fetch_page_makes_ledger_partial() {
    let index = Arc::new(RecordingIndex::new(InMemoryIndex::new()));
    index.failing_fetches.store(1, Ordering::SeqCst);
    let dataset = dataset_of((0..6).map(|i| record(&format!("r{}", i), "p", "d")));
    let opts = DetectOptions {
        max_in_flight: 1,
        ..detect_options()
    };

    let (summary, entries) = run_detect_with(&dataset, index, &opts).await;

    assert_eq!(summary.failed_pages.len(), 1);
    assert_eq!(summary.failed_pages[0].ids.len(), 2);
    assert!(!summary.is_complete());
    assert_eq!(entries.len(), 4);
}

#[tokio::test]
async fn test_transient_fetch_failure_is_retried() {
    let index = Arc::new(RecordingIndex::new(InMemoryIndex::new()));
    index.failing_fetches.store(1, Ordering::SeqCst);
    let dataset = dataset_of((0..6).map(|i| record(&format!("r{}", i), "p", "d")));
    let opts = DetectOptions {
        retry: fast_retry(),
        ..detect_options()
    };

    let (summary, entries) = run_detect_with(&dataset, index, &opts).await;

    assert!(summary.failed_pages.is_empty());
    assert!(summary.is_complete());
    assert_eq!(entries.len(), 6);
}

// ─── Limits and cancellation ────────────────────────────────────────

#[tokio::test]
async fn test_limit_takes_ledger_prefix() {
    let index = Arc::new(RecordingIndex::new(InMemoryIndex::new()));
    let dataset = dataset_of((0..5).map(|i| record(&format!("r{}", i), "p", "d")));
    let entries: Vec<ChangeEntry> = dataset
        .ids()
        .map(|id| ChangeEntry::new(id.as_str(), Action::Add))
        .collect();
    let opts = ApplyOptions {
        limit: Some(2),
        ..apply_options(10)
    };

    let summary = run_apply(entries, &dataset, index.clone(), &opts).await;

    assert_eq!((summary.considered, summary.upserted), (2, 2));
    assert_eq!(
        index.upserts(),
        vec![vec!["r0".to_string(), "r1".to_string()]]
    );
}

#[tokio::test]
async fn test_stopped_apply_leaves_everything_unfinished() {
    let index = Arc::new(RecordingIndex::new(InMemoryIndex::new()));
    let dataset = dataset_of((0..4).map(|i| record(&format!("r{}", i), "p", "d")));
    let entries: Vec<ChangeEntry> = dataset
        .ids()
        .map(|id| ChangeEntry::new(id.as_str(), Action::Add))
        .collect();
    let stop = StopFlag::new();
    stop.stop();

    let summary = apply(
        "test-apply",
        entries.clone(),
        dataset,
        index.clone(),
        Arc::new(HashEmbedder::new(16)) as Arc<dyn EmbeddingProvider>,
        &apply_options(2),
        &stop,
        &NoProgress,
    )
    .await
    .unwrap();

    assert!(summary.cancelled);
    assert_eq!(summary.upserted, 0);
    assert_eq!(summary.unfinished, entries);
    assert!(index.upserts().is_empty());
}

#[tokio::test]
async fn test_query_enumeration_finds_deletes_without_listing() {
    let dims = 16;
    let embedder = HashEmbedder::new(dims);
    let remote = InMemoryIndex::new().without_listing();
    for id in ["keep", "gone1", "gone2"] {
        let r = record(id, "p", id);
        remote.insert(
            id,
            RemoteItem {
                metadata: r.metadata(),
                vector: Some(embedder.embed_one(&r.canonical_text())),
            },
        );
    }
    let dataset = dataset_of([record("keep", "p", "keep")]);
    let opts = DetectOptions {
        enumeration: EnumerationOptions {
            strategy: "query".parse().unwrap(),
            dimension: dims,
            ..EnumerationOptions::default()
        },
        ..detect_options()
    };

    let (summary, entries) = run_detect_with(&dataset, Arc::new(remote), &opts).await;

    assert!(summary.enumeration_complete);
    assert_eq!(
        entries,
        vec![
            ChangeEntry::new("gone1", Action::Delete),
            ChangeEntry::new("gone2", Action::Delete),
        ]
    );
}
