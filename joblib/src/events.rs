use std::fmt;

use serde::{Deserialize, Serialize};

use crate::stage::Stage;
use crate::types::OutputBlob;

/// Lifecycle of a job. `Succeeded`, `Failed` and `Cancelled` are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Succeeded => write!(f, "succeeded"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

/// A chunk of output captured from a tool process.
#[derive(Clone, Debug)]
pub enum Output {
    Stdout(OutputBlob),
    Stderr(OutputBlob),
}

impl Output {
    pub fn blob(&self) -> &OutputBlob {
        match self {
            Output::Stdout(blob) | Output::Stderr(blob) => blob,
        }
    }
}

/// Output tagged with the stage that produced it.
#[derive(Clone, Debug)]
pub struct LogChunk {
    pub stage: Stage,
    pub output: Output,
}
