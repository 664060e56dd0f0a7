use crate::errors;
use crate::events::LogChunk;
use crate::job::{Job, JobFilter, JobSummary, Update};
use crate::types::JobId;
use tokio::sync::{mpsc, oneshot};

#[derive(Debug)]
pub enum StoreMessage {
    Insert {
        job: Job,
        response: oneshot::Sender<errors::Result<()>>,
    },
    Restore {
        job: Job,
        response: oneshot::Sender<errors::Result<()>>,
    },
    Get {
        job_id: JobId,
        response: oneshot::Sender<errors::Result<Job>>,
    },
    List {
        filter: JobFilter,
        response: oneshot::Sender<Vec<JobSummary>>,
    },
    Update {
        job_id: JobId,
        update: Update,
        response: oneshot::Sender<errors::Result<Job>>,
    },
    AppendLog {
        job_id: JobId,
        chunk: LogChunk,
    },
    StreamLogs {
        job_id: JobId,
        response: oneshot::Sender<errors::Result<mpsc::UnboundedReceiver<LogChunk>>>,
    },
    Wait {
        job_id: JobId,
        response: oneshot::Sender<errors::Result<Job>>,
    },
    Remove {
        job_id: JobId,
        response: oneshot::Sender<errors::Result<Job>>,
    },
    Discard {
        job_id: JobId,
        response: oneshot::Sender<errors::Result<Job>>,
    },
}
