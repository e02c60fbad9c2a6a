//! Error types for metadata store operations.
//!
//! Every backend failure is translated into a [`MetaError`] at the client or
//! transaction boundary. Callers never match on driver error types.

use std::sync::Arc;
use thiserror::Error;

/// Opaque backend error kept for diagnostics.
pub type BackendError = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur during metadata store operations.
#[derive(Debug, Clone, Error)]
pub enum MetaError {
    /// Construction-time misuse (closed pool, bad table name).
    #[error("invalid params: {0}")]
    ParamsInvalid(String),

    /// Conflicting or malformed operation options.
    #[error("invalid op options: {0}")]
    OptionInvalid(String),

    /// Exact-key get found no row.
    #[error("key not found: {0}")]
    NotFound(String),

    /// Backend-level failure: connectivity, constraint violation, internal state.
    #[error("meta operation failed: {message}")]
    OpFail {
        message: String,
        #[source]
        source: Option<BackendError>,
    },

    /// `do_ops` or `commit` on a transaction that was already committed.
    #[error("txn had been committed")]
    CommittedTxn,

    /// A transaction contains a nested transaction operation.
    #[error("unsupported nested txn")]
    NestedTxn,

    /// The request context was cancelled.
    #[error("context cancelled")]
    Cancelled,

    /// The request context deadline passed before the operation finished.
    #[error("context deadline exceeded")]
    DeadlineExceeded,

    /// Store configuration could not be parsed or is inconsistent.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Value could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Result type alias for metadata store operations.
pub type Result<T> = std::result::Result<T, MetaError>;

impl MetaError {
    /// Creates an `OpFail` with no underlying backend error.
    pub fn op_fail(message: impl Into<String>) -> Self {
        MetaError::OpFail {
            message: message.into(),
            source: None,
        }
    }

    /// Returns true if the caller may reasonably retry the operation.
    ///
    /// The store itself never retries.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MetaError::OpFail { .. } | MetaError::Cancelled | MetaError::DeadlineExceeded
        )
    }

    /// Returns true for [`MetaError::NotFound`].
    pub fn is_not_found(&self) -> bool {
        matches!(self, MetaError::NotFound(_))
    }
}

impl From<sqlx::Error> for MetaError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => MetaError::NotFound("no matching row".to_string()),
            other => MetaError::OpFail {
                message: other.to_string(),
                source: Some(Arc::new(other)),
            },
        }
    }
}

impl From<serde_json::Error> for MetaError {
    fn from(err: serde_json::Error) -> Self {
        MetaError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for MetaError {
    fn from(err: toml::de::Error) -> Self {
        MetaError::InvalidConfig(err.to_string())
    }
}
