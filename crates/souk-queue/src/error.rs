//! Error types

/// Result alias used across the queue API
pub type QueueResult<T> = Result<T, QueueError>;

/// Errors surfaced to callers of the queue and returned by store backends
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The backing store could not be reached (connection, IO, timeout)
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),
    /// The store answered, but with an error
    #[error("Store error: {0}")]
    Store(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    /// A worker task could not be joined during shutdown
    #[error("Worker join error: {0}")]
    Join(String),
}

impl QueueError {
    /// True when the error indicates the store itself is unreachable
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_))
    }
}

/// Why a dispatched job did not complete.
///
/// Every variant counts against the job's attempt budget; the rendered
/// message is what ends up in `Job::error`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("No processor registered for job type '{job_type}' on queue '{queue}'")]
    ProcessorNotRegistered { queue: String, job_type: String },
    #[error("{0}")]
    Processing(String),
    #[error("Processor panicked: {0}")]
    Panicked(String),
}
