//! `vsync detect`, `vsync apply`, and `vsync sync`.
//!
//! Wires config, dataset, adapters, and the engine together; writes the
//! ledger manifest; prints the run summary on stdout (human text, or JSON
//! with `--json`).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;
use vector_sync_core::ledger::{
    read_ledger_file, ActionCounts, EnumerationInfo, LedgerManifest, LedgerStatus, LedgerWriter,
    SCHEMA_VERSION,
};
use vector_sync_core::models::ChangeEntry;

use crate::apply::{apply, ApplyOptions, ApplySummary};
use crate::config::Config;
use crate::dataset::{load_dataset, Dataset};
use crate::detect::{detect, DetectOptions, DetectSummary};
use crate::embedding::create_provider;
use crate::enumerate::EnumerationOptions;
use crate::index::create_index;
use crate::pool::StopFlag;
use crate::progress::ProgressMode;

/// Number of ledger entries echoed after detection.
const SAMPLE_SIZE: usize = 10;

/// Output switches shared by every command.
#[derive(Debug, Clone, Copy)]
pub struct Output {
    pub progress: ProgressMode,
    pub json: bool,
}

/// Command-line overrides for `apply`.
#[derive(Debug, Clone, Default)]
pub struct ApplyOverrides {
    pub ledger: Option<PathBuf>,
    pub limit: Option<usize>,
    pub batch_size: Option<usize>,
    pub dry_run: bool,
    pub failed_out: Option<PathBuf>,
}

fn load_local(config: &Config) -> Result<Arc<Dataset>> {
    Ok(Arc::new(load_dataset(
        &config.dataset.path,
        &config.dataset.schema(),
    )?))
}

fn detect_options(config: &Config) -> Result<DetectOptions> {
    Ok(DetectOptions {
        fetch_page_size: config.sync.fetch_page_size,
        max_in_flight: config.sync.max_in_flight,
        retry: config.retry.policy(),
        enumeration: EnumerationOptions {
            strategy: config.index.enumeration.parse()?,
            list_page_size: config.index.list_page_size,
            query_top_k: config.index.query_top_k,
            max_probes: config.index.max_probes,
            stall_rounds: config.index.stall_rounds,
            dimension: config.embedding.dims,
        },
    })
}

/// Outcome of detection plus where its ledger went.
struct Detected {
    summary: DetectSummary,
    ledger_path: PathBuf,
    status: LedgerStatus,
}

/// Run detection and write the ledger plus its manifest.
pub async fn run_detect(
    config: &Config,
    ledger_override: Option<&Path>,
    out: Output,
    stop: &StopFlag,
) -> Result<DetectSummary> {
    let detected = detect_to_ledger(config, ledger_override, out, stop).await?;
    if out.json {
        println!("{}", serde_json::to_string_pretty(&detected.summary)?);
    } else {
        print_detect_summary(&detected);
    }
    Ok(detected.summary)
}

async fn detect_to_ledger(
    config: &Config,
    ledger_override: Option<&Path>,
    out: Output,
    stop: &StopFlag,
) -> Result<Detected> {
    let ledger_path = ledger_override
        .unwrap_or(config.ledger.path.as_path())
        .to_path_buf();
    let dataset = load_local(config)?;
    let index = create_index(&config.index)?;
    let opts = detect_options(config)?;
    let run_id = Uuid::new_v4().to_string();

    let mut writer = LedgerWriter::create(&ledger_path)
        .with_context(|| format!("Failed to create ledger: {}", ledger_path.display()))?;
    let reporter = out.progress.reporter();

    let result = detect(
        &run_id,
        dataset.clone(),
        index,
        &opts,
        &mut writer,
        stop,
        reporter.as_ref(),
    )
    .await;

    // The manifest is written even for a failed run so the ledger is never
    // mistaken for a complete one.
    let (status, enumeration) = match &result {
        Ok(summary) if summary.is_complete() => {
            (LedgerStatus::Complete, summary.enumeration.clone())
        }
        Ok(summary) => (LedgerStatus::Partial, summary.enumeration.clone()),
        Err(_) => (LedgerStatus::Partial, None),
    };
    let counts = writer.counts();
    drop(writer);
    write_manifest(&ledger_path, &run_id, &dataset, status, counts, enumeration)?;

    let summary = result?;
    if status == LedgerStatus::Partial {
        warn!(ledger = %ledger_path.display(), "ledger is partial");
    }
    Ok(Detected {
        summary,
        ledger_path,
        status,
    })
}

fn write_manifest(
    ledger_path: &Path,
    run_id: &str,
    dataset: &Dataset,
    status: LedgerStatus,
    counts: ActionCounts,
    enumeration: Option<EnumerationInfo>,
) -> Result<()> {
    let manifest = LedgerManifest {
        schema_version: SCHEMA_VERSION,
        run_id: run_id.to_string(),
        created_at: Utc::now(),
        dataset_path: dataset.path.display().to_string(),
        dataset_digest: dataset.digest.clone(),
        status,
        counts,
        enumeration,
    };
    manifest
        .write(ledger_path)
        .with_context(|| format!("Failed to write manifest for {}", ledger_path.display()))
}

fn print_detect_summary(detected: &Detected) {
    let summary = &detected.summary;
    let ledger_path = &detected.ledger_path;
    println!("detect");
    println!("  run: {}", summary.run_id);
    println!(
        "  local records: {} ({} skipped)",
        summary.local_records, summary.skipped_records
    );
    match summary.remote_total {
        Some(total) => println!(
            "  remote ids seen: {} / {}{}",
            summary.remote_ids_seen,
            total,
            if summary.enumeration_complete { "" } else { " (incomplete)" }
        ),
        None => println!("  remote ids seen: {}", summary.remote_ids_seen),
    }
    println!("  add: {}", summary.adds);
    println!("  update: {}", summary.updates);
    println!("  delete: {}", summary.deletes);
    if !summary.failed_pages.is_empty() {
        println!("  failed pages: {}", summary.failed_pages.len());
    }
    if summary.cancelled {
        println!("  cancelled: yes");
    }
    let status = match detected.status {
        LedgerStatus::Complete => "complete",
        LedgerStatus::Partial => "partial",
    };
    println!("  ledger: {} ({})", ledger_path.display(), status);

    if summary.total_changes() > 0 {
        if let Ok(read) = read_ledger_file(ledger_path) {
            println!();
            println!("  first changes:");
            for entry in read.entries.iter().take(SAMPLE_SIZE) {
                println!("    {:<8} {}", entry.action.as_str(), entry.id);
            }
        }
    }
}

/// Apply a ledger to the remote index.
pub async fn run_apply(
    config: &Config,
    overrides: &ApplyOverrides,
    out: Output,
    stop: &StopFlag,
) -> Result<ApplySummary> {
    let summary = apply_ledger(config, overrides, out, stop).await?;
    if out.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_apply_summary(&summary, overrides.failed_out.as_deref());
    }
    finish_apply(summary)
}

fn finish_apply(summary: ApplySummary) -> Result<ApplySummary> {
    if let Some(reason) = &summary.aborted {
        bail!("Apply aborted: {}", reason);
    }
    Ok(summary)
}

async fn apply_ledger(
    config: &Config,
    overrides: &ApplyOverrides,
    out: Output,
    stop: &StopFlag,
) -> Result<ApplySummary> {
    let ledger_path = overrides
        .ledger
        .clone()
        .unwrap_or_else(|| config.ledger.path.clone());

    let read = read_ledger_file(&ledger_path)
        .with_context(|| format!("Failed to read ledger: {}", ledger_path.display()))?;
    for rejected in &read.rejected {
        warn!(ledger = %ledger_path.display(), error = %rejected, "skipping ledger row");
    }

    let dataset = load_local(config)?;
    check_manifest(&ledger_path, &dataset)?;

    let opts = ApplyOptions {
        batch_size: overrides.batch_size.unwrap_or(config.sync.batch_size),
        limit: overrides.limit,
        max_in_flight: config.sync.max_in_flight,
        retry: config.retry.policy(),
        dry_run: overrides.dry_run,
    };
    if opts.batch_size == 0 {
        bail!("--batch-size must be > 0");
    }
    let index = create_index(&config.index)?;
    let embedder = create_provider(&config.embedding)?;

    let run_id = Uuid::new_v4().to_string();
    let reporter = out.progress.reporter();
    let summary = apply(
        &run_id,
        read.entries,
        dataset.clone(),
        index,
        embedder,
        &opts,
        stop,
        reporter.as_ref(),
    )
    .await?;

    if let Some(path) = &overrides.failed_out {
        if !opts.dry_run {
            write_retry_ledger(path, &run_id, &dataset, &summary.unfinished)?;
        }
    }
    Ok(summary)
}

fn check_manifest(ledger_path: &Path, dataset: &Dataset) -> Result<()> {
    let manifest = LedgerManifest::load(ledger_path)
        .with_context(|| format!("Failed to read manifest for {}", ledger_path.display()))?;
    match manifest {
        Some(m) => {
            if m.dataset_digest != dataset.digest {
                warn!(
                    ledger_run = %m.run_id,
                    "dataset changed since the ledger was detected; re-run detect to pick up the drift"
                );
            }
            if m.status == LedgerStatus::Partial {
                warn!(ledger_run = %m.run_id, "applying a partial ledger");
            }
        }
        None => debug!(ledger = %ledger_path.display(), "ledger has no manifest"),
    }
    Ok(())
}

fn write_retry_ledger(
    path: &Path,
    run_id: &str,
    dataset: &Dataset,
    entries: &[ChangeEntry],
) -> Result<()> {
    let mut writer = LedgerWriter::create(path)
        .with_context(|| format!("Failed to create retry ledger: {}", path.display()))?;
    writer.append_all(entries)?;
    writer.flush()?;
    let counts = writer.counts();
    drop(writer);
    write_manifest(path, run_id, dataset, LedgerStatus::Partial, counts, None)?;
    info!(path = %path.display(), entries = entries.len(), "wrote retry ledger");
    Ok(())
}

fn print_apply_summary(summary: &ApplySummary, failed_out: Option<&Path>) {
    if summary.dry_run {
        println!("apply (dry-run)");
    } else {
        println!("apply");
    }
    println!("  run: {}", summary.run_id);
    println!("  considered: {}", summary.considered);
    println!(
        "  upsert candidates: {} in {} batches",
        summary.upsert_candidates, summary.upsert_batches
    );
    println!(
        "  delete candidates: {} in {} batches",
        summary.delete_candidates, summary.delete_batches
    );
    if summary.skipped > 0 {
        println!("  skipped (no local record): {}", summary.skipped);
    }
    if summary.dry_run {
        return;
    }
    println!("  upserted: {}", summary.upserted);
    println!("  deleted: {}", summary.deleted);
    println!("  failed batches: {}", summary.failed_batches.len());
    for failed in &summary.failed_batches {
        println!(
            "    {:?} batch {} ({} ids): {}",
            failed.kind,
            failed.batch,
            failed.ids.len(),
            failed.error
        );
    }
    if summary.cancelled {
        println!("  cancelled: yes");
    }
    if let Some(path) = failed_out {
        println!(
            "  retry ledger: {} ({} entries)",
            path.display(),
            summary.unfinished.len()
        );
    }
}

/// Detect, then apply the ledger just written.
pub async fn run_sync(
    config: &Config,
    overrides: &ApplyOverrides,
    out: Output,
    stop: &StopFlag,
) -> Result<(DetectSummary, ApplySummary)> {
    let detected = detect_to_ledger(config, overrides.ledger.as_deref(), out, stop).await?;
    if !out.json {
        print_detect_summary(&detected);
        println!();
    }
    if detected.summary.cancelled || stop.is_stopped() {
        bail!("Sync cancelled after detection; ledger kept for a later apply");
    }
    if detected.status == LedgerStatus::Partial {
        warn!("applying a partial ledger; re-run sync to finish");
    }

    let overrides = ApplyOverrides {
        ledger: Some(detected.ledger_path.clone()),
        ..overrides.clone()
    };
    let applied = apply_ledger(config, &overrides, out, stop).await?;
    if out.json {
        let combined = serde_json::json!({
            "detect": &detected.summary,
            "apply": &applied,
        });
        println!("{}", serde_json::to_string_pretty(&combined)?);
    } else {
        print_apply_summary(&applied, overrides.failed_out.as_deref());
    }
    let applied = finish_apply(applied)?;
    Ok((detected.summary, applied))
}
