//! Dataset and index overview.
//!
//! A quick check before or after a sync: how many records the dataset holds,
//! how many items the remote index reports, and the gap between them. Used by
//! `vsync stats`.

use anyhow::{Context, Result};
use serde::Serialize;

use crate::config::Config;
use crate::dataset::load_dataset;
use crate::index::create_index;
use crate::retry::with_retry;

#[derive(Debug, Clone, Serialize)]
pub struct SyncStats {
    pub dataset_path: String,
    pub local_records: usize,
    pub skipped_records: usize,
    pub remote_total: u64,
    /// `(remote - local) / local` in percent; `None` for an empty dataset.
    pub delta_percent: Option<f64>,
}

pub fn delta_percent(local: usize, remote: u64) -> Option<f64> {
    if local == 0 {
        return None;
    }
    Some((remote as f64 - local as f64) * 100.0 / local as f64)
}

/// Run the stats command and print a summary.
pub async fn run_stats(config: &Config, json: bool) -> Result<SyncStats> {
    let dataset = load_dataset(&config.dataset.path, &config.dataset.schema())?;
    let index = create_index(&config.index)?;
    let remote = with_retry(&config.retry.policy(), "describe index stats", || {
        index.describe_stats()
    })
    .await
    .context("Failed to read remote index stats")?;

    let stats = SyncStats {
        dataset_path: dataset.path.display().to_string(),
        local_records: dataset.len(),
        skipped_records: dataset.rejected(),
        remote_total: remote.total_count,
        delta_percent: delta_percent(dataset.len(), remote.total_count),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(stats);
    }

    println!("Vector Sync Stats");
    println!("=================");
    println!();
    println!("  Dataset:        {}", stats.dataset_path);
    println!("  Local records:  {}", stats.local_records);
    if stats.skipped_records > 0 {
        println!("  Skipped lines:  {}", stats.skipped_records);
    }
    println!("  Index:          {}", config.index.provider);
    println!("  Remote items:   {}", stats.remote_total);
    match stats.delta_percent {
        Some(d) => println!("  Delta:          {:+.2}%", d),
        None => println!("  Delta:          n/a"),
    }

    Ok(stats)
}
