//! # Vector Sync CLI (`vsync`)
//!
//! Keeps a remote vector index in step with a local NDJSON dataset.
//!
//! ## Usage
//!
//! ```bash
//! vsync --config ./config/vsync.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `vsync detect` | Compare dataset and index, write the change ledger |
//! | `vsync apply` | Embed and upsert/delete what the ledger says |
//! | `vsync sync` | `detect` followed by `apply` |
//! | `vsync stats` | Local record count, remote item count, delta |
//!
//! ## Examples
//!
//! ```bash
//! # Write ./data/changes.csv and its manifest
//! vsync detect
//!
//! # Try the first 100 changes, keeping whatever fails for later
//! vsync apply --limit 100 --failed-out ./data/retry.csv
//!
//! # Re-run only what failed
//! vsync apply --ledger ./data/retry.csv
//! ```
//!
//! Logs go to stderr (`RUST_LOG`, default `info`); summaries go to stdout.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use vector_sync::config;
use vector_sync::pool::StopFlag;
use vector_sync::progress::ProgressMode;
use vector_sync::stats;
use vector_sync::sync_cmd::{self, ApplyOverrides, Output};

/// Vector Sync CLI: incremental synchronization of a record dataset with a
/// remote vector index.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/vsync.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "vsync",
    about = "Vector Sync: keep a remote vector index in step with a local dataset",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/vsync.toml")]
    config: PathBuf,

    /// Progress on stderr. Defaults to `human` on a terminal, `off` otherwise.
    #[arg(long, global = true, value_enum)]
    progress: Option<ProgressMode>,

    /// Print the run summary as JSON on stdout.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args, Clone, Default)]
struct ApplyArgs {
    /// Only consider the first N ledger entries.
    #[arg(long)]
    limit: Option<usize>,

    /// Items per embedding/upsert/delete call (overrides `sync.batch_size`).
    #[arg(long)]
    batch_size: Option<usize>,

    /// Plan batches without calling the embedding service or the index.
    #[arg(long)]
    dry_run: bool,

    /// Write the entries of failed and unstarted batches to this ledger.
    #[arg(long)]
    failed_out: Option<PathBuf>,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Compare the dataset with the index and write the change ledger.
    ///
    /// Read-only on both sides. Writes `<ledger>` and
    /// `<ledger>.manifest.json`.
    Detect {
        /// Ledger path (overrides `ledger.path`).
        #[arg(long)]
        ledger: Option<PathBuf>,
    },

    /// Apply a change ledger to the index.
    ///
    /// Every operation is idempotent, so a ledger can be applied again
    /// after a partial failure.
    Apply {
        /// Ledger path (overrides `ledger.path`).
        #[arg(long)]
        ledger: Option<PathBuf>,

        #[command(flatten)]
        args: ApplyArgs,
    },

    /// Detect, then apply the fresh ledger.
    Sync {
        /// Ledger path (overrides `ledger.path`).
        #[arg(long)]
        ledger: Option<PathBuf>,

        #[command(flatten)]
        args: ApplyArgs,
    },

    /// Show local and remote counts.
    Stats,
}

fn overrides(ledger: Option<PathBuf>, args: ApplyArgs) -> ApplyOverrides {
    ApplyOverrides {
        ledger,
        limit: args.limit,
        batch_size: args.batch_size,
        dry_run: args.dry_run,
        failed_out: args.failed_out,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cfg = config::load_config(&cli.config)?;
    let out = Output {
        progress: cli.progress.unwrap_or_else(ProgressMode::default_for_tty),
        json: cli.json,
    };

    let stop = StopFlag::new();
    stop.stop_on_ctrl_c();

    match cli.command {
        Commands::Detect { ledger } => {
            sync_cmd::run_detect(&cfg, ledger.as_deref(), out, &stop).await?;
        }
        Commands::Apply { ledger, args } => {
            sync_cmd::run_apply(&cfg, &overrides(ledger, args), out, &stop).await?;
        }
        Commands::Sync { ledger, args } => {
            sync_cmd::run_sync(&cfg, &overrides(ledger, args), out, &stop).await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg, cli.json).await?;
        }
    }

    Ok(())
}
