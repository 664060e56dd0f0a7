use super::messages::StoreMessage;
use crate::errors::{self, JobError};
use crate::events::{JobStatus, LogChunk};
use crate::job::{Job, JobFilter, JobSummary, Update};
use crate::types::JobId;
use crate::workspace::Workspace;

use chrono::Utc;
use log::{debug, warn};
use std::collections::{HashMap, VecDeque};
use tokio::{
    fs,
    sync::{mpsc, oneshot},
};

pub struct ResultStore {
    inbox: mpsc::UnboundedReceiver<StoreMessage>,
    jobs: HashMap<JobId, Job>,
    /// job ids in submission order
    order: Vec<JobId>,
    logs: HashMap<JobId, LogBuffer>,
    waiters: HashMap<JobId, Vec<oneshot::Sender<errors::Result<Job>>>>,
    log_buffer_bytes: usize,
}

impl ResultStore {
    pub fn spawn(inbox: mpsc::UnboundedReceiver<StoreMessage>, log_buffer_bytes: usize) {
        let actor = Self {
            inbox,
            jobs: HashMap::new(),
            order: Vec::new(),
            logs: HashMap::new(),
            waiters: HashMap::new(),
            log_buffer_bytes,
        };
        tokio::spawn(async move { actor.run().await });
    }

    async fn run(mut self) {
        while let Some(msg) = self.inbox.recv().await {
            match msg {
                StoreMessage::Insert { job, response } => {
                    let _ = response.send(self.insert(job).await);
                }
                StoreMessage::Restore { job, response } => {
                    let _ = response.send(self.restore(job));
                }
                StoreMessage::Get { job_id, response } => {
                    let _ = response.send(self.job(job_id).cloned());
                }
                StoreMessage::List { filter, response } => {
                    let _ = response.send(self.list(&filter));
                }
                StoreMessage::Update {
                    job_id,
                    update,
                    response,
                } => {
                    let _ = response.send(self.update(job_id, update).await);
                }
                StoreMessage::AppendLog { job_id, chunk } => {
                    if let Some(buffer) = self.logs.get_mut(&job_id) {
                        buffer.push(chunk, self.log_buffer_bytes);
                    }
                }
                StoreMessage::StreamLogs { job_id, response } => {
                    let _ = response.send(self.stream_logs(job_id));
                }
                StoreMessage::Wait { job_id, response } => self.wait(job_id, response),
                StoreMessage::Remove { job_id, response } => {
                    let _ = response.send(self.remove(job_id));
                }
                StoreMessage::Discard { job_id, response } => {
                    let _ = response.send(self.discard(job_id));
                }
            }
        }
    }

    fn job(&self, job_id: JobId) -> errors::Result<&Job> {
        self.jobs.get(&job_id).ok_or(JobError::NotFound(job_id))
    }

    async fn insert(&mut self, job: Job) -> errors::Result<()> {
        self.ensure_unknown(&job)?;
        persist(&job).await?;
        self.track(job);
        Ok(())
    }

    fn restore(&mut self, job: Job) -> errors::Result<()> {
        self.ensure_unknown(&job)?;
        debug!("job {}: restored", job.id);
        self.track(job);
        Ok(())
    }

    fn ensure_unknown(&self, job: &Job) -> errors::Result<()> {
        if self.jobs.contains_key(&job.id) {
            return Err(JobError::IllegalTransition {
                job_id: job.id,
                from: job.status,
                detail: "job is already recorded".into(),
            });
        }
        Ok(())
    }

    fn track(&mut self, job: Job) {
        // recovered jobs arrive in any order, keep the listing sorted by submission time
        let position = self
            .order
            .partition_point(|id| self.jobs[id].submitted_at <= job.submitted_at);
        self.order.insert(position, job.id);
        let mut buffer = LogBuffer::new();
        if job.is_terminal() {
            buffer.close();
        }
        self.logs.insert(job.id, buffer);
        self.jobs.insert(job.id, job);
    }

    async fn update(&mut self, job_id: JobId, update: Update) -> errors::Result<Job> {
        let is_rerun = matches!(update, Update::Rerun);
        let mut job = self.job(job_id)?.clone();
        job.apply(update, Utc::now())?;
        // a failed write leaves the previous state in place
        persist(&job).await?;
        debug!(
            "job {job_id}: {} (stage {:?})",
            job.status, job.current_stage
        );

        if is_rerun {
            self.logs.insert(job_id, LogBuffer::new());
        }
        if job.is_terminal() {
            if let Some(buffer) = self.logs.get_mut(&job_id) {
                buffer.close();
            }
            for waiter in self.waiters.remove(&job_id).unwrap_or_default() {
                let _ = waiter.send(Ok(job.clone()));
            }
        }
        self.jobs.insert(job_id, job.clone());
        Ok(job)
    }

    fn list(&self, filter: &JobFilter) -> Vec<JobSummary> {
        self.order
            .iter()
            .filter_map(|id| self.jobs.get(id))
            .filter(|job| filter.matches(job))
            .take(filter.limit.unwrap_or(usize::MAX))
            .map(Job::summary)
            .collect()
    }

    fn stream_logs(&mut self, job_id: JobId) -> errors::Result<mpsc::UnboundedReceiver<LogChunk>> {
        self.job(job_id)?;
        Ok(self.logs.entry(job_id).or_insert_with(LogBuffer::new).subscribe())
    }

    fn wait(&mut self, job_id: JobId, response: oneshot::Sender<errors::Result<Job>>) {
        let finished = self
            .job(job_id)
            .map(|job| job.is_terminal().then(|| job.clone()));
        match finished {
            Ok(Some(job)) => {
                let _ = response.send(Ok(job));
            }
            Ok(None) => self.waiters.entry(job_id).or_default().push(response),
            Err(err) => {
                let _ = response.send(Err(err));
            }
        }
    }

    fn remove(&mut self, job_id: JobId) -> errors::Result<Job> {
        if !self.job(job_id)?.is_terminal() {
            return Err(JobError::JobNotTerminal(job_id));
        }
        self.forget(job_id)
    }

    fn discard(&mut self, job_id: JobId) -> errors::Result<Job> {
        let job = self.job(job_id)?;
        if job.status != JobStatus::Queued || !job.stages.is_empty() || !job.history.is_empty() {
            return Err(JobError::IllegalTransition {
                job_id,
                from: job.status,
                detail: "only a job that never started can be discarded".into(),
            });
        }
        let job = self.forget(job_id)?;
        for waiter in self.waiters.remove(&job_id).unwrap_or_default() {
            let _ = waiter.send(Err(JobError::NotFound(job_id)));
        }
        Ok(job)
    }

    fn forget(&mut self, job_id: JobId) -> errors::Result<Job> {
        self.order.retain(|id| *id != job_id);
        self.logs.remove(&job_id);
        self.jobs.remove(&job_id).ok_or(JobError::NotFound(job_id))
    }
}

/// Write `job.json` through a temporary file so a reader never sees a partial record.
async fn persist(job: &Job) -> errors::Result<()> {
    let path = Workspace::at(&job.workspace).record_path();
    let tmp = path.with_extension("json.tmp");
    let bytes = serde_json::to_vec_pretty(job)?;
    fs::write(&tmp, bytes).await?;
    fs::rename(&tmp, &path).await.map_err(|err| {
        warn!("Can't persist job {}: {err}", job.id);
        JobError::Io(err)
    })
}

/// Output of the current attempt, replayed to late subscribers.
struct LogBuffer {
    chunks: VecDeque<LogChunk>,
    bytes: usize,
    subscribers: Vec<mpsc::UnboundedSender<LogChunk>>,
    open: bool,
}

impl LogBuffer {
    fn new() -> Self {
        Self {
            chunks: VecDeque::new(),
            bytes: 0,
            subscribers: Vec::new(),
            open: true,
        }
    }

    fn push(&mut self, chunk: LogChunk, limit: usize) {
        if !self.open {
            return;
        }
        self.subscribers.retain(|sub| {
            // only retain subscribers who have not dropped
            sub.send(chunk.clone()).is_ok()
        });
        self.bytes += chunk.output.blob().len();
        self.chunks.push_back(chunk);
        while self.bytes > limit {
            match self.chunks.pop_front() {
                Some(dropped) => self.bytes -= dropped.output.blob().len(),
                None => break,
            }
        }
    }

    fn subscribe(&mut self) -> mpsc::UnboundedReceiver<LogChunk> {
        let (tx, rx) = mpsc::unbounded_channel();
        for chunk in &self.chunks {
            let _ = tx.send(chunk.clone());
        }
        if self.open {
            self.subscribers.push(tx);
        }
        rx
    }

    /// The attempt is over: end every subscription.
    fn close(&mut self) {
        self.open = false;
        self.subscribers.clear();
    }
}
