//! Edge job errors.

use outpost_core::db::DatabaseError;

use crate::registry::{EndpointId, JobId, LogsStatus};

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Not found: {0}")]
    NotFound(String),

    /// No collected log exists for the task.
    #[error("Logs not available for job {job} on endpoint {endpoint}")]
    LogNotAvailable { job: JobId, endpoint: EndpointId },

    #[error("Job {job} on endpoint {endpoint}: cannot move logs from {from} to {to}")]
    InvalidTransition {
        job: JobId,
        endpoint: EndpointId,
        from: LogsStatus,
        to: LogsStatus,
    },

    #[error("Storage error: {0}")]
    Storage(#[from] DatabaseError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
