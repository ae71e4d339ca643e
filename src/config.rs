//! TOML configuration.
//!
//! ```toml
//! [dataset]
//! path = "./data/records.jsonl"
//! id_field = "ThirdPartyDataId"
//! path_field = "FullPath"
//! description_field = "Description"
//!
//! [ledger]
//! path = "./data/changes.csv"
//!
//! [index]
//! provider = "pinecone"            # or "local"
//! host = "https://segments-abc123.svc.us-east-1.pinecone.io"
//! enumeration = "list"             # or "query" for query-only indexes
//!
//! [embedding]
//! provider = "openai"              # "ollama", "hash", or "disabled"
//! model = "text-embedding-3-large"
//! dims = 256
//!
//! [sync]
//! batch_size = 200
//! max_in_flight = 4
//!
//! [retry]
//! max_retries = 5
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use vector_sync_core::models::RecordSchema;

use crate::retry::RetryPolicy;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub dataset: DatasetConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    pub index: IndexConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub retry: RetryConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatasetConfig {
    pub path: PathBuf,
    #[serde(default = "default_id_field")]
    pub id_field: String,
    #[serde(default = "default_path_field")]
    pub path_field: String,
    #[serde(default = "default_description_field")]
    pub description_field: String,
}

fn default_id_field() -> String {
    "id".to_string()
}
fn default_path_field() -> String {
    "path".to_string()
}
fn default_description_field() -> String {
    "description".to_string()
}

impl DatasetConfig {
    pub fn schema(&self) -> RecordSchema {
        RecordSchema {
            id_field: self.id_field.clone(),
            path_field: self.path_field.clone(),
            description_field: self.description_field.clone(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LedgerConfig {
    #[serde(default = "default_ledger_path")]
    pub path: PathBuf,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            path: default_ledger_path(),
        }
    }
}

fn default_ledger_path() -> PathBuf {
    PathBuf::from("./data/changes.csv")
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    pub provider: String,
    /// Data-plane host of a hosted index.
    #[serde(default)]
    pub host: Option<String>,
    /// Snapshot file of the `local` index.
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_enumeration")]
    pub enumeration: String,
    #[serde(default = "default_list_page_size")]
    pub list_page_size: usize,
    #[serde(default = "default_query_top_k")]
    pub query_top_k: usize,
    #[serde(default = "default_max_probes")]
    pub max_probes: usize,
    #[serde(default = "default_stall_rounds")]
    pub stall_rounds: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_api_key_env() -> String {
    "PINECONE_API_KEY".to_string()
}
fn default_enumeration() -> String {
    "list".to_string()
}
fn default_list_page_size() -> usize {
    100
}
fn default_query_top_k() -> usize {
    10_000
}
fn default_max_probes() -> usize {
    64
}
fn default_stall_rounds() -> usize {
    3
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_dims")]
    pub dims: usize,
    /// Base URL override (OpenAI-compatible gateway or Ollama).
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: default_dims(),
            url: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_dims() -> usize {
    256
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    /// Items per upsert/delete call and per embedding request.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Ids per fetch during detection.
    #[serde(default = "default_batch_size")]
    pub fetch_page_size: usize,
    /// Concurrent batches in flight.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            fetch_page_size: default_batch_size(),
            max_in_flight: default_max_in_flight(),
        }
    }
}

fn default_batch_size() -> usize {
    200
}
fn default_max_in_flight() -> usize {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

fn default_max_retries() -> u32 {
    5
}
fn default_base_delay_ms() -> u64 {
    1_000
}
fn default_max_delay_ms() -> u64 {
    32_000
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    // Validate sync
    if config.sync.batch_size == 0 {
        bail!("sync.batch_size must be > 0");
    }
    if config.sync.fetch_page_size == 0 {
        bail!("sync.fetch_page_size must be > 0");
    }
    if config.sync.max_in_flight == 0 {
        bail!("sync.max_in_flight must be > 0");
    }

    // Validate index
    match config.index.provider.as_str() {
        "pinecone" => {
            if config.index.host.as_deref().unwrap_or("").is_empty() {
                bail!("index.host must be set when provider is 'pinecone'");
            }
        }
        "local" => {
            if config.index.path.is_none() {
                bail!("index.path must be set when provider is 'local'");
            }
        }
        other => bail!(
            "Unknown index provider: '{}'. Must be pinecone or local.",
            other
        ),
    }
    match config.index.enumeration.as_str() {
        "list" | "query" => {}
        other => bail!(
            "Unknown index.enumeration: '{}'. Must be list or query.",
            other
        ),
    }
    if config.index.list_page_size == 0 || config.index.query_top_k == 0 {
        bail!("index.list_page_size and index.query_top_k must be > 0");
    }

    // Validate embedding
    if config.embedding.dims == 0 {
        bail!("embedding.dims must be > 0");
    }
    match config.embedding.provider.as_str() {
        "disabled" | "hash" => {}
        "openai" | "ollama" => {
            if config.embedding.model.is_none() {
                bail!(
                    "embedding.model must be specified when provider is '{}'",
                    config.embedding.provider
                );
            }
        }
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, ollama, or hash.",
            other
        ),
    }

    Ok(())
}
