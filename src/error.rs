//! Crate-wide error type for the dispatcher core.
//!
//! Mirrors the shape of the client-facing error enums elsewhere in this
//! codebase: a flat `thiserror` enum with an `is_recoverable` helper that
//! retry policies consult to decide whether an exception path should be
//! retried at all (`Cancelled` and `DuplicateRunId` never are).

use thiserror::Error;

/// Result alias used throughout the dispatcher core.
pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("run id already active: {run_id}")]
    DuplicateRunId { run_id: String },

    #[error("unknown run id: {run_id}")]
    UnknownRunId { run_id: String },

    #[error("handler raised an exception: {0}")]
    HandlerException(String),

    #[error("handler reported semantic failure: {0}")]
    HandlerFailureResult(String),

    #[error("command was cancelled")]
    Cancelled,

    #[error("model does not support tool calling: {model}")]
    ModelToolUnsupported { model: String },

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// Whether this error kind is worth retrying per the policy layer.
    ///
    /// `DuplicateRunId`, `UnknownRunId` and `Cancelled` are terminal by
    /// construction; everything the handler itself produced is a retry
    /// candidate subject to the resolved `CommandPolicy`.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            CoreError::HandlerException(_) | CoreError::HandlerFailureResult(_)
        )
    }
}
