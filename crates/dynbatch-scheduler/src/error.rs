//! Error types for the batching scheduler.

use std::time::Duration;

use thiserror::Error;

/// Result type alias for scheduler operations.
pub type Result<T> = std::result::Result<T, SchedulerError>;

/// Terminal failure of a single request.
///
/// Errors are `Clone` because one admission or shutdown failure is fanned
/// out to every request of the affected payload.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    /// The queue for this priority level is at its policy limit.
    #[error("queue for priority level {level} is full (limit {limit})")]
    QueueFull { level: u32, limit: usize },

    /// The request was the oldest entry at its level and was evicted to
    /// make room for a newer arrival.
    #[error("request evicted from priority level {level} by a newer arrival")]
    Evicted { level: u32 },

    /// The request waited longer than its queue policy allows.
    #[error("request timed out after {waited:?} in queue")]
    Timeout { waited: Duration },

    /// The request alone exceeds the maximum batch size.
    #[error("request batch size {size} exceeds max batch size {max}")]
    Oversize { size: usize, max: usize },

    /// The scheduler is stopping and no longer accepts or admits work.
    #[error("scheduler is shutting down")]
    Shutdown,

    /// The admission controller refused to grant a ticket.
    #[error("admission failed: {0}")]
    Admission(String),

    /// The execution backend reported a failure for this request.
    #[error("execution failed: {0}")]
    Execution(String),

    /// The response sink was dropped before a response was delivered.
    #[error("response channel closed before a response was delivered")]
    ResponseDropped,
}

impl SchedulerError {
    /// Whether the failure is a capacity error (queue overflow, eviction, or oversize).
    pub fn is_capacity(&self) -> bool {
        matches!(self, Self::QueueFull { .. } | Self::Evicted { .. } | Self::Oversize { .. })
    }
}

/// Failure to obtain an execution ticket.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    /// No ticket became available within the requested wait.
    #[error("no execution ticket available within {0:?}")]
    Timeout(Duration),

    /// The controller has been closed.
    #[error("admission controller closed")]
    Closed,
}

impl From<AdmissionError> for SchedulerError {
    fn from(err: AdmissionError) -> Self {
        match err {
            AdmissionError::Closed => SchedulerError::Shutdown,
            other => SchedulerError::Admission(other.to_string()),
        }
    }
}
