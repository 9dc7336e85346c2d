//! Runtime client errors

use thiserror::Error;

/// Errors that can occur when talking to the VM runtime
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The runtime did not answer in time
    #[error("Runtime call timed out: {0}")]
    Timeout(String),

    /// The runtime could not be reached
    #[error("Runtime unreachable: {0}")]
    Unreachable(String),

    /// The runtime rejected or failed the power operation
    #[error("Operation failed: {0}")]
    OperationFailed(String),

    /// The runtime has no VM with this identity
    #[error("Not found: {0}")]
    NotFound(String),

    /// Server-side or throttled answer from the runtime API
    #[error("Runtime API error: {0}")]
    Api(String),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RuntimeError {
    /// Whether the VM may or may not have changed state after this error.
    ///
    /// Timeouts and transport failures leave the operation outcome unknown;
    /// an explicit rejection means nothing happened.
    #[must_use]
    pub fn is_indeterminate(&self) -> bool {
        matches!(
            self,
            RuntimeError::Http(_) | RuntimeError::Timeout(_) | RuntimeError::Unreachable(_) | RuntimeError::Api(_)
        )
    }
}
