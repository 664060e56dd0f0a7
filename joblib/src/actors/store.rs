mod actor;
mod messages;

use self::{actor::ResultStore, messages::StoreMessage};
use crate::errors::{self, JobError};
use crate::events::LogChunk;
use crate::job::{Job, JobFilter, JobSummary, Update};
use crate::types::JobId;
use tokio::sync::{mpsc, oneshot};

/// Handle to the result store: the single owner of every job record.
///
/// The actor applies one message at a time, so a reader never sees half of a transition. Every
/// mutation is written to the job's `job.json` before it becomes visible.
#[derive(Clone)]
pub struct StoreHandle {
    sender: mpsc::UnboundedSender<StoreMessage>,
}

impl StoreHandle {
    /// Spawn a new store. `log_buffer_bytes` bounds the replayable output kept per job.
    pub fn spawn(log_buffer_bytes: usize) -> Self {
        let (sender, inbox) = mpsc::unbounded_channel();
        ResultStore::spawn(inbox, log_buffer_bytes);
        Self { sender }
    }

    async fn request<T>(
        &self,
        message: impl FnOnce(oneshot::Sender<errors::Result<T>>) -> StoreMessage,
    ) -> errors::Result<T> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(message(tx))
            .map_err(|_| JobError::ShuttingDown)?;
        rx.await.map_err(|_| JobError::ShuttingDown)?
    }

    pub async fn insert(&self, job: Job) -> errors::Result<()> {
        self.request(|response| StoreMessage::Insert { job, response })
            .await
    }

    /// Put back a record taken out by `remove`, leaving `job.json` as it is on disk.
    pub async fn restore(&self, job: Job) -> errors::Result<()> {
        self.request(|response| StoreMessage::Restore { job, response })
            .await
    }

    pub async fn get(&self, job_id: JobId) -> errors::Result<Job> {
        self.request(|response| StoreMessage::Get { job_id, response })
            .await
    }

    pub async fn list(&self, filter: JobFilter) -> errors::Result<Vec<JobSummary>> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(StoreMessage::List {
                filter,
                response: tx,
            })
            .map_err(|_| JobError::ShuttingDown)?;
        rx.await.map_err(|_| JobError::ShuttingDown)
    }

    pub async fn update(&self, job_id: JobId, update: Update) -> errors::Result<Job> {
        self.request(|response| StoreMessage::Update {
            job_id,
            update,
            response,
        })
        .await
    }

    /// Record captured output. Output for unknown or finished jobs is dropped.
    pub fn append_log(&self, job_id: JobId, chunk: LogChunk) {
        let _ = self.sender.send(StoreMessage::AppendLog { job_id, chunk });
    }

    /// Replay the buffered output of the current attempt, then follow it until the attempt ends.
    pub async fn stream_logs(
        &self,
        job_id: JobId,
    ) -> errors::Result<mpsc::UnboundedReceiver<LogChunk>> {
        self.request(|response| StoreMessage::StreamLogs { job_id, response })
            .await
    }

    /// Resolve once the job reaches a terminal status.
    pub async fn wait(&self, job_id: JobId) -> errors::Result<Job> {
        self.request(|response| StoreMessage::Wait { job_id, response })
            .await
    }

    /// Forget a terminal job.
    pub async fn remove(&self, job_id: JobId) -> errors::Result<Job> {
        self.request(|response| StoreMessage::Remove { job_id, response })
            .await
    }

    /// Forget a job that was created but never started.
    pub async fn discard(&self, job_id: JobId) -> errors::Result<Job> {
        self.request(|response| StoreMessage::Discard { job_id, response })
            .await
    }
}
