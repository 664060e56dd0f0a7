mod actor;
mod messages;

pub use self::messages::SchedulerStats;

use self::{actor::JobScheduler, messages::SchedulerMessage};
use crate::errors::{self, JobError};
use crate::executor::ExecutorContext;
use crate::types::JobId;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Handle to the job scheduler: a fixed pool of `workers` executor slots fed from a FIFO queue.
///
/// Like the store, the real work happens in the actor spawned by [`SchedulerHandle::spawn`]; the
/// handle can be cloned freely.
#[derive(Clone)]
pub struct SchedulerHandle {
    sender: mpsc::Sender<SchedulerMessage>,
}

impl SchedulerHandle {
    /// Spawn a new scheduler.
    ///
    /// `message_capacity` limits the build-up of inbound messages, `queue_capacity` the number of
    /// jobs waiting for a worker.
    pub(crate) fn spawn(
        ctx: Arc<ExecutorContext>,
        workers: usize,
        queue_capacity: usize,
        message_capacity: usize,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(message_capacity);
        JobScheduler::spawn(receiver, ctx, workers, queue_capacity);
        Self { sender }
    }

    async fn request<T>(
        &self,
        message: impl FnOnce(oneshot::Sender<T>) -> SchedulerMessage,
    ) -> errors::Result<T> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(message(tx))
            .await
            .map_err(|_| JobError::ShuttingDown)?;
        rx.await.map_err(|_| JobError::ShuttingDown)
    }

    /// Queue a job for execution. Fails fast with `QueueFull` when the wait queue is at capacity.
    pub async fn submit(&self, job_id: JobId) -> errors::Result<()> {
        self.request(|response| SchedulerMessage::Submit { job_id, response })
            .await?
    }

    /// Cancel a queued or running job. A running job ends once its executor notices.
    pub async fn cancel(&self, job_id: JobId) -> errors::Result<()> {
        self.request(|response| SchedulerMessage::Cancel { job_id, response })
            .await?
    }

    pub async fn stats(&self) -> errors::Result<SchedulerStats> {
        self.request(|response| SchedulerMessage::Stats { response })
            .await
    }

    /// Stop admitting jobs, cancel everything queued or running and wait for the executors.
    pub async fn shutdown(&self) -> errors::Result<()> {
        self.request(|response| SchedulerMessage::Shutdown { response })
            .await
    }
}
