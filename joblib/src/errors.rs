use std::path::PathBuf;
use std::{io, result};

use thiserror::Error;

use crate::config::ConfigError;
use crate::events::JobStatus;
use crate::types::JobId;

/// Structural errors returned to callers of the orchestrator.
///
/// Failures of the external tools never show up here: they are recorded on the job itself.
#[derive(Error, Debug)]
pub enum JobError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("job {0} not found")]
    NotFound(JobId),
    #[error("job {0} already reached a terminal state")]
    AlreadyTerminal(JobId),
    #[error("job {0} has not reached a terminal state")]
    JobNotTerminal(JobId),
    #[error("wait queue is full ({capacity} jobs)")]
    QueueFull { capacity: usize },
    #[error("job {job_id}: illegal transition from {from} ({detail})")]
    IllegalTransition {
        job_id: JobId,
        from: JobStatus,
        detail: String,
    },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("{} is owned by another orchestrator", .0.display())]
    OutputRootLocked(PathBuf),
    #[error("orchestrator is shutting down")]
    ShuttingDown,
    #[error("could not persist job record: {0}")]
    Persist(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = result::Result<T, JobError>;
