//! Change detection.
//!
//! Compares the local dataset with the remote index and streams a change
//! ledger:
//!
//! 1. Enumerate remote ids ([`crate::enumerate`]).
//! 2. Page the sorted local ids by `fetch_page_size` and fetch each page in
//!    one round trip, at most `max_in_flight` pages at a time.
//! 3. Classify every record of a fetched page; write its `add`/`update`
//!    entries as soon as the page completes.
//! 4. Write a `delete` entry for every enumerated remote id with no local
//!    record, in sorted order.
//!
//! Detection never writes to the dataset or the index. A page whose fetch
//! still fails after retries is recorded in [`DetectSummary::failed_pages`]
//! and skipped; the other pages carry on. Authentication failures and an
//! unusable enumeration strategy abort the run.

use std::collections::{BTreeSet, HashMap};
use std::io::Write;
use std::ops::ControlFlow;
use std::sync::Arc;

use anyhow::{bail, Result};
use serde::Serialize;
use tracing::{info, warn};
use vector_sync_core::classify::classify_page;
use vector_sync_core::error::{LedgerError, RemoteError};
use vector_sync_core::index::VectorIndex;
use vector_sync_core::ledger::{EnumerationInfo, LedgerWriter};
use vector_sync_core::models::{Action, ChangeEntry, RemoteItem};

use crate::dataset::Dataset;
use crate::enumerate::{enumerate_remote_ids, Enumeration, EnumerationOptions, EnumerationStrategy};
use crate::pool::{run_bounded, StopFlag};
use crate::progress::{SyncProgressEvent, SyncProgressReporter};
use crate::retry::{with_retry, RetryPolicy};

#[derive(Debug, Clone)]
pub struct DetectOptions {
    pub fetch_page_size: usize,
    pub max_in_flight: usize,
    pub retry: RetryPolicy,
    pub enumeration: EnumerationOptions,
}

/// A page of local ids whose fetch failed.
#[derive(Debug, Clone, Serialize)]
pub struct FailedPage {
    pub page: usize,
    pub ids: Vec<String>,
    pub error: String,
}

/// Outcome of one detection run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DetectSummary {
    pub run_id: String,
    pub local_records: usize,
    pub skipped_records: usize,
    pub remote_ids_seen: u64,
    pub remote_total: Option<u64>,
    pub enumeration_complete: bool,
    #[serde(skip)]
    pub enumeration: Option<EnumerationInfo>,
    pub adds: u64,
    pub updates: u64,
    pub deletes: u64,
    pub failed_pages: Vec<FailedPage>,
    pub cancelled: bool,
}

impl DetectSummary {
    /// Whether the ledger covers every local record and every remote id.
    pub fn is_complete(&self) -> bool {
        self.enumeration_complete && self.failed_pages.is_empty() && !self.cancelled
    }

    pub fn total_changes(&self) -> u64 {
        self.adds + self.updates + self.deletes
    }
}

type PageResult = (usize, Vec<String>, Result<HashMap<String, RemoteItem>, RemoteError>);

/// Run detection, appending entries to `ledger`.
///
/// The ledger is flushed before returning, including on error, so the
/// caller can describe what was written in a partial manifest.
pub async fn detect<W: Write>(
    run_id: &str,
    dataset: Arc<Dataset>,
    index: Arc<dyn VectorIndex>,
    opts: &DetectOptions,
    ledger: &mut LedgerWriter<W>,
    stop: &StopFlag,
    progress: &dyn SyncProgressReporter,
) -> Result<DetectSummary> {
    let mut summary = DetectSummary {
        run_id: run_id.to_string(),
        local_records: dataset.len(),
        skipped_records: dataset.rejected(),
        ..DetectSummary::default()
    };

    let enumeration = match enumerate_remote_ids(
        index.as_ref(),
        &opts.enumeration,
        &opts.retry,
        progress,
    )
    .await
    {
        Ok(e) => Some(e),
        Err(RemoteError::Unsupported(message))
            if opts.enumeration.strategy == EnumerationStrategy::List =>
        {
            bail!(
                "Remote index cannot list ids ({}). Set index.enumeration = \"query\" to use the query-based approximation.",
                message
            );
        }
        Err(e) if e.is_fatal() => bail!("Remote id enumeration failed: {}", e),
        Err(e) => {
            warn!(error = %e, "remote id enumeration failed; no deletions will be detected");
            None
        }
    };
    if let Some(e) = &enumeration {
        summary.remote_ids_seen = e.ids.len() as u64;
        summary.remote_total = e.total;
        summary.enumeration_complete = e.complete;
        summary.enumeration = Some(e.info());
    }

    let mut result =
        compare_pages(&dataset, &index, opts, ledger, stop, progress, &mut summary).await;
    // Deletes depend only on the enumeration and the dataset, so a cancelled
    // comparison still reports them.
    if result.is_ok() {
        if let Some(e) = &enumeration {
            result = write_deletes(&dataset, e, ledger, &summary);
        }
    }
    ledger.flush()?;
    result?;

    let counts = ledger.counts();
    summary.adds = counts.add;
    summary.updates = counts.update;
    summary.deletes = counts.delete;

    info!(
        run_id,
        adds = summary.adds,
        updates = summary.updates,
        deletes = summary.deletes,
        failed_pages = summary.failed_pages.len(),
        complete = summary.is_complete(),
        "detection finished"
    );
    Ok(summary)
}

async fn compare_pages<W: Write>(
    dataset: &Arc<Dataset>,
    index: &Arc<dyn VectorIndex>,
    opts: &DetectOptions,
    ledger: &mut LedgerWriter<W>,
    stop: &StopFlag,
    progress: &dyn SyncProgressReporter,
    summary: &mut DetectSummary,
) -> Result<()> {
    let ids: Vec<String> = dataset.ids().cloned().collect();
    let pages: Vec<(usize, Vec<String>)> = ids
        .chunks(opts.fetch_page_size.max(1))
        .enumerate()
        .map(|(i, chunk)| (i + 1, chunk.to_vec()))
        .collect();
    let total_pages = pages.len() as u64;
    let mut done = 0u64;
    let mut fatal: Option<RemoteError> = None;
    let mut write_error: Option<LedgerError> = None;

    let retry = opts.retry;
    let unstarted = run_bounded(
        pages,
        opts.max_in_flight,
        stop,
        |(page, ids)| {
            let index = index.clone();
            async move {
                let what = format!("fetch page {}", page);
                let fetched = with_retry(&retry, &what, || index.fetch(&ids)).await;
                (page, ids, fetched)
            }
        },
        |(page, ids, fetched): PageResult| {
            done += 1;
            progress.report(SyncProgressEvent::Comparing {
                n: done,
                total: total_pages,
            });
            match fetched {
                Ok(items) => {
                    let entries = classify_page(ids.iter().filter_map(|id| dataset.get(id)), &items);
                    if let Err(e) = ledger.append_all(&entries) {
                        write_error = Some(e);
                        return ControlFlow::Break(());
                    }
                    ControlFlow::Continue(())
                }
                Err(e) if e.is_fatal() => {
                    fatal = Some(e);
                    ControlFlow::Break(())
                }
                Err(e) => {
                    warn!(page, ids = ids.len(), error = %e, "page fetch failed; skipping page");
                    summary.failed_pages.push(FailedPage {
                        page,
                        ids,
                        error: e.to_string(),
                    });
                    ControlFlow::Continue(())
                }
            }
        },
    )
    .await;

    if let Some(e) = write_error {
        return Err(anyhow::Error::new(e).context("Failed to write ledger"));
    }
    if let Some(e) = fatal {
        bail!("Detection aborted: {}", e);
    }
    if !unstarted.is_empty() {
        warn!(pages = unstarted.len(), "detection stopped before all pages were compared");
        summary.cancelled = true;
    }
    summary.failed_pages.sort_by_key(|p| p.page);
    Ok(())
}

fn write_deletes<W: Write>(
    dataset: &Dataset,
    enumeration: &Enumeration,
    ledger: &mut LedgerWriter<W>,
    summary: &DetectSummary,
) -> Result<()> {
    let mut protected = 0usize;
    let deletes: BTreeSet<&String> = enumeration
        .ids
        .iter()
        .filter(|id| !dataset.contains(id))
        .filter(|id| {
            let skip = dataset.is_skipped(id);
            if skip {
                protected += 1;
            }
            !skip
        })
        .collect();

    if protected > 0 {
        warn!(
            run_id = %summary.run_id,
            ids = protected,
            "remote ids whose local record was rejected are not deleted"
        );
    }

    for id in deletes {
        ledger.append(&ChangeEntry::new(id.as_str(), Action::Delete))?;
    }
    Ok(())
}
