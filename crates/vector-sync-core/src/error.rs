//! Error taxonomy shared by the detector, the applier, and the adapters.
//!
//! - [`RemoteError`]: outcome of a single call to the vector index or the
//!   embedding service. Drives the retry policy.
//! - [`IntegrityError`]: one bad dataset record or ledger row. Always local
//!   to that record/row.
//! - [`LedgerError`]: the ledger file itself cannot be read or written.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Failure of one remote call.
#[derive(Debug, Clone, Error)]
pub enum RemoteError {
    /// Connection failure, timeout, or 5xx. Retried with backoff.
    #[error("transient error: {0}")]
    Transient(String),

    /// HTTP 429 or equivalent. `retry_after` carries the server hint.
    #[error("rate limited: {message}")]
    RateLimited {
        retry_after: Option<Duration>,
        message: String,
    },

    /// Invalid or expired credentials. Aborts the run.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Non-retryable client error or a malformed response.
    #[error("request rejected: {0}")]
    Rejected(String),

    /// The service does not offer this operation (e.g. paginated listing).
    #[error("operation not supported: {0}")]
    Unsupported(String),
}

impl RemoteError {
    /// Whether the call may succeed if simply resubmitted.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RemoteError::Transient(_) | RemoteError::RateLimited { .. }
        )
    }

    /// Whether the whole run must stop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RemoteError::Authentication(_))
    }

    /// Server-supplied delay before the next attempt, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            RemoteError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// A single dataset record or ledger row that cannot be used.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IntegrityError {
    #[error("record is not a JSON object")]
    NotAnObject,

    #[error("record has no usable '{field}' identifier")]
    MissingId { field: String },

    #[error("record '{id}' is missing required field '{field}'")]
    MissingField { id: String, field: String },

    #[error("record '{id}' field '{field}' is not a scalar value")]
    NonScalarField { id: String, field: String },

    #[error("record '{id}' uses reserved field name '{field}'")]
    ReservedField { id: String, field: String },

    #[error("duplicate identifier '{id}'")]
    DuplicateId { id: String },

    #[error("row {row}: unrecognized action '{action}' for '{id}'")]
    UnknownAction {
        row: usize,
        id: String,
        action: String,
    },

    #[error("row {row}: {detail}")]
    MalformedRow { row: usize, detail: String },
}

/// The ledger or its manifest cannot be read or written.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("ledger csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("ledger header must be 'ID,Action', found '{0}'")]
    BadHeader(String),

    #[error("ledger manifest error: {0}")]
    Manifest(#[from] serde_json::Error),

    #[error("unsupported ledger schema version {0}")]
    UnsupportedSchema(u32),
}
