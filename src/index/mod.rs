//! Vector index backends.
//!
//! | Provider | Backend |
//! |----------|---------|
//! | `"pinecone"` | [`pinecone::PineconeIndex`], the hosted data-plane REST API |
//! | `"local"` | [`local::LocalIndex`], a JSON snapshot file on disk |

pub mod local;
pub mod pinecone;

use std::sync::Arc;

use anyhow::{bail, Result};
use vector_sync_core::index::VectorIndex;

use crate::config::IndexConfig;

/// Create the [`VectorIndex`] named by `index.provider`.
pub fn create_index(config: &IndexConfig) -> Result<Arc<dyn VectorIndex>> {
    match config.provider.as_str() {
        "pinecone" => Ok(Arc::new(pinecone::PineconeIndex::new(config)?)),
        "local" => {
            let path = config
                .path
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("index.path required for local index"))?;
            Ok(Arc::new(local::LocalIndex::open(path)?))
        }
        other => bail!("Unknown index provider: {}", other),
    }
}
