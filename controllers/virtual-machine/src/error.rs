//! Controller-specific error types.
//!
//! Every error is local to one resource's reconciliation pass. The worker
//! turns it into a retry decision via [`ControllerError::retry_policy`].

use crate::store::StoreError;
use thiserror::Error;
use vm_runtime_client::RuntimeError;

/// Errors that can occur in the VirtualMachine Controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Resource store error (includes optimistic-concurrency conflicts)
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Runtime call failed without a known outcome
    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    /// Runtime call exceeded the controller deadline
    #[error("{operation} timed out after {seconds}s")]
    DriverTimeout {
        operation: String,
        seconds: u64,
    },

    /// Runtime reported that the power operation failed
    #[error("{operation} failed: {message}")]
    OperationFailed {
        operation: String,
        message: String,
    },

    /// Runtime reported a state outside the known set
    #[error("Unknown runtime state: {0}")]
    UnknownState(String),

    /// Resource is missing required metadata
    #[error("Invalid resource: {0}")]
    InvalidResource(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),

    /// Metrics registry error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Health/metrics server failed
    #[error("Server error: {0}")]
    Server(#[from] std::io::Error),
}

/// How the work queue should retry a failed pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Expected contention, run again right away
    Immediate,
    /// Exponential backoff per resource
    Backoff,
    /// Straight to the backoff cap
    MaxBackoff,
}

impl ControllerError {
    /// Retry decision for this error.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        match self {
            ControllerError::Store(StoreError::Conflict(_)) => RetryPolicy::Immediate,
            ControllerError::UnknownState(_) | ControllerError::InvalidResource(_) => RetryPolicy::MaxBackoff,
            _ => RetryPolicy::Backoff,
        }
    }

    /// Short label used in metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            ControllerError::Store(StoreError::Conflict(_)) => "conflict",
            ControllerError::Kube(_) | ControllerError::Store(_) => "store",
            ControllerError::Runtime(_) => "runtime",
            ControllerError::DriverTimeout { .. } => "driver_timeout",
            ControllerError::OperationFailed { .. } => "operation_failed",
            ControllerError::UnknownState(_) => "unknown_state",
            ControllerError::InvalidResource(_) => "invalid_resource",
            ControllerError::InvalidConfig(_) => "invalid_config",
            ControllerError::Watch(_) => "watch",
            ControllerError::Metrics(_) => "metrics",
            ControllerError::Server(_) => "server",
        }
    }
}
