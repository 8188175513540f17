//! Error taxonomy for the pipeline

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ArborError {
    /// A raw change notification could not be normalized.
    #[error("malformed change event: {0}")]
    Ingestion(String),

    /// The candidate snapshot could not be built from a batch.
    #[error("diff conflict on {path}: {reason}")]
    DiffConflict { path: String, reason: String },

    /// An internal invariant was violated; the commit is aborted.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("analyzer {name} failed: {message}")]
    AnalyzerFailure { name: String, message: String },

    #[error("analyzer {name} timed out after {timeout_ms}ms")]
    AnalyzerTimeout { name: String, timeout_ms: u64 },

    #[error("ingress channel disconnected: {0}")]
    ChannelDisconnect(String),

    #[error("configuration error: {0}")]
    Config(String),
}

pub type ArborResult<T> = std::result::Result<T, ArborError>;
