use super::messages::{SchedulerMessage, SchedulerStats};
use crate::errors::{self, JobError};
use crate::events::JobStatus;
use crate::executor::{self, ExecutorContext};
use crate::job::Update;
use crate::types::JobId;

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use log::{debug, error, info, warn};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

pub struct JobScheduler {
    inbox: mpsc::Receiver<SchedulerMessage>,
    ctx: Arc<ExecutorContext>,
    workers: usize,
    queue_capacity: usize,
    /// submitted jobs waiting for a worker, oldest first
    waiting: VecDeque<JobId>,
    running: HashMap<JobId, CancellationToken>,
    /// resolve with the job id once an executor returns
    executors: FuturesUnordered<BoxFuture<'static, JobId>>,
    accepting: bool,
    shutdown_waiters: Vec<oneshot::Sender<()>>,
}

impl JobScheduler {
    pub fn spawn(
        inbox: mpsc::Receiver<SchedulerMessage>,
        ctx: Arc<ExecutorContext>,
        workers: usize,
        queue_capacity: usize,
    ) {
        let actor = Self {
            inbox,
            ctx,
            workers,
            queue_capacity,
            waiting: VecDeque::new(),
            running: HashMap::new(),
            executors: FuturesUnordered::new(),
            accepting: true,
            shutdown_waiters: Vec::new(),
        };
        tokio::spawn(async move { actor.run().await });
    }

    async fn run(mut self) {
        let mut inbox_open = true;
        loop {
            tokio::select! {
                msg = self.inbox.recv(), if inbox_open => match msg {
                    Some(msg) => self.handle(msg).await,
                    None => {
                        debug!("All scheduler handles dropped, stopping");
                        inbox_open = false;
                        self.stop().await;
                    }
                },
                Some(job_id) = self.executors.next(), if !self.executors.is_empty() => {
                    self.running.remove(&job_id);
                    debug!("job {job_id}: executor returned");
                    self.dispatch();
                }
                else => break,
            }

            if !self.accepting && self.executors.is_empty() {
                for waiter in self.shutdown_waiters.drain(..) {
                    let _ = waiter.send(());
                }
                if !inbox_open {
                    break;
                }
            }
        }
    }

    async fn handle(&mut self, msg: SchedulerMessage) {
        match msg {
            SchedulerMessage::Submit { job_id, response } => {
                let _ = response.send(self.submit(job_id).await);
            }
            SchedulerMessage::Cancel { job_id, response } => {
                let _ = response.send(self.cancel(job_id).await);
            }
            SchedulerMessage::Stats { response } => {
                let _ = response.send(SchedulerStats {
                    workers: self.workers,
                    queue_capacity: self.queue_capacity,
                    waiting: self.waiting.len(),
                    running: self.running.len(),
                });
            }
            SchedulerMessage::Shutdown { response } => {
                self.stop().await;
                self.shutdown_waiters.push(response);
            }
        }
    }

    async fn submit(&mut self, job_id: JobId) -> errors::Result<()> {
        if !self.accepting {
            return Err(JobError::ShuttingDown);
        }
        if self.waiting.contains(&job_id) || self.running.contains_key(&job_id) {
            return Err(JobError::IllegalTransition {
                job_id,
                from: JobStatus::Queued,
                detail: "job was already submitted".into(),
            });
        }
        let job = self.ctx.store.get(job_id).await?;
        match job.status {
            JobStatus::Queued => {}
            status if status.is_terminal() => return Err(JobError::AlreadyTerminal(job_id)),
            status => {
                return Err(JobError::IllegalTransition {
                    job_id,
                    from: status,
                    detail: "job is already running".into(),
                })
            }
        }
        // only jobs that would have to wait count against the queue
        if self.running.len() >= self.workers && self.waiting.len() >= self.queue_capacity {
            return Err(JobError::QueueFull {
                capacity: self.queue_capacity,
            });
        }

        self.waiting.push_back(job_id);
        debug!(
            "job {job_id}: submitted ({} waiting, {} running)",
            self.waiting.len(),
            self.running.len()
        );
        self.dispatch();
        Ok(())
    }

    async fn cancel(&mut self, job_id: JobId) -> errors::Result<()> {
        if let Some(position) = self.waiting.iter().position(|id| *id == job_id) {
            self.waiting.remove(position);
            self.ctx.store.update(job_id, Update::Cancel).await?;
            info!("job {job_id}: cancelled while queued");
            return Ok(());
        }

        let job = self.ctx.store.get(job_id).await?;
        if job.is_terminal() {
            return Err(JobError::AlreadyTerminal(job_id));
        }
        if let Some(token) = self.running.get(&job_id) {
            info!("job {job_id}: cancelling");
            token.cancel();
            return Ok(());
        }
        match job.status {
            // created but never submitted, or a rerun that was turned away
            JobStatus::Queued => {
                self.ctx.store.update(job_id, Update::Cancel).await?;
                Ok(())
            }
            status => Err(JobError::IllegalTransition {
                job_id,
                from: status,
                detail: "no executor owns this job".into(),
            }),
        }
    }

    /// Start waiting jobs while workers are free.
    fn dispatch(&mut self) {
        while self.running.len() < self.workers {
            let Some(job_id) = self.waiting.pop_front() else {
                break;
            };
            let cancel = CancellationToken::new();
            self.running.insert(job_id, cancel.clone());

            let handle = tokio::spawn(executor::run(job_id, self.ctx.clone(), cancel));
            self.executors.push(
                async move {
                    if let Err(err) = handle.await {
                        error!("job {job_id}: executor panicked: {err}");
                    }
                    job_id
                }
                .boxed(),
            );
            debug!("job {job_id}: dispatched");
        }
    }

    /// Stop admitting jobs, cancel the waiting ones and signal the running ones.
    async fn stop(&mut self) {
        if !self.accepting {
            return;
        }
        self.accepting = false;
        let waiting: Vec<JobId> = self.waiting.drain(..).collect();
        info!(
            "Scheduler stopping: cancelling {} waiting and {} running jobs",
            waiting.len(),
            self.running.len()
        );
        for job_id in waiting {
            if let Err(err) = self.ctx.store.update(job_id, Update::Cancel).await {
                warn!("job {job_id}: can't cancel: {err}");
            }
        }
        for token in self.running.values() {
            token.cancel();
        }
    }
}
