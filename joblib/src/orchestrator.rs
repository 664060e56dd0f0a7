//! The process-wide entry point tying the store, scheduler and executors together.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use log::{debug, info, warn};
use tokio::{fs, sync::mpsc};

use crate::actors::scheduler::{SchedulerHandle, SchedulerStats};
use crate::actors::store::StoreHandle;
use crate::config::OrchestratorConfig;
use crate::definition;
use crate::errors::{JobError, Result};
use crate::events::LogChunk;
use crate::executor::ExecutorContext;
use crate::job::{Job, JobFilter, JobRequest, JobSummary, Update};
use crate::lock::RootLock;
use crate::types::JobId;
use crate::workspace::{Workspace, RECORD_FILE};

/// Limits the build-up of messages for the scheduler.
const SCHEDULER_MESSAGE_CAPACITY: usize = 256;

const INTERRUPTED: &str = "interrupted: the orchestrator stopped while the job was active";

/// Owns every job of one output root.
///
/// Create one with [`Orchestrator::start`]. It holds an exclusive lock on the output root, so
/// at most one orchestrator, in any process, owns a root at a time. The orchestrator can be
/// cloned; all clones talk to the same store and scheduler, and the lock is released when the
/// last clone is dropped.
#[derive(Clone)]
pub struct Orchestrator {
    config: Arc<OrchestratorConfig>,
    store: StoreHandle,
    scheduler: SchedulerHandle,
    _lock: Arc<RootLock>,
}

impl Orchestrator {
    /// Validate `config`, lock the output root, spawn the store and scheduler and reload the jobs
    /// found under the root.
    ///
    /// Fails with `OutputRootLocked` while another orchestrator owns the root.
    pub async fn start(config: OrchestratorConfig) -> Result<Self> {
        config.validate()?;
        fs::create_dir_all(&config.output_root).await?;
        let lock = RootLock::acquire(&config.output_root)?;

        let store = StoreHandle::spawn(config.log_buffer_bytes);
        let ctx = ExecutorContext {
            store: store.clone(),
            output_root: config.output_root.clone(),
            tools: config.tools.clone(),
            timeouts: config.timeouts.clone(),
            tail_lines: config.log_tail_lines,
        };
        let scheduler = SchedulerHandle::spawn(
            Arc::new(ctx),
            config.workers,
            config.queue_capacity,
            SCHEDULER_MESSAGE_CAPACITY,
        );
        info!(
            "Orchestrator started: {} workers, queue capacity {}, output root {}",
            config.workers,
            config.queue_capacity,
            config.output_root.display()
        );

        let orchestrator = Self {
            config: Arc::new(config),
            store,
            scheduler,
            _lock: Arc::new(lock),
        };
        orchestrator.recover().await?;
        Ok(orchestrator)
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Reload every job recorded under the output root.
    ///
    /// A job that was still queued or running when its record was last written can't be resumed;
    /// it is marked failed so it can be re-run.
    async fn recover(&self) -> Result<Vec<JobId>> {
        let mut recovered = Vec::new();
        for job in load_jobs(&self.config.output_root).await? {
            let job_id = job.id;
            let active = !job.is_terminal();
            self.store.insert(job).await?;
            if active {
                warn!("job {job_id}: was active at shutdown, marking it failed");
                let abort = Update::Abort {
                    reason: INTERRUPTED.into(),
                };
                self.store.update(job_id, abort).await?;
            }
            recovered.push(job_id);
        }
        if !recovered.is_empty() {
            info!("Recovered {} jobs", recovered.len());
        }
        Ok(recovered)
    }

    /// Validate a request, create its workspace and record a queued job. The job is not
    /// submitted.
    pub async fn create_job(&self, request: JobRequest) -> Result<Job> {
        definition::create_job(request, &self.config.output_root, &self.store).await
    }

    /// Hand a queued job to the scheduler.
    ///
    /// When the wait queue is full, a job that never ran is discarded together with its
    /// workspace and `QueueFull` is returned.
    pub async fn submit(&self, job_id: JobId) -> Result<()> {
        match self.scheduler.submit(job_id).await {
            Err(err @ JobError::QueueFull { .. }) => {
                self.discard(job_id).await;
                Err(err)
            }
            other => other,
        }
    }

    /// `create_job` followed by `submit`.
    pub async fn enqueue(&self, request: JobRequest) -> Result<Job> {
        let job = self.create_job(request).await?;
        self.submit(job.id).await?;
        Ok(job)
    }

    async fn discard(&self, job_id: JobId) {
        match self.store.discard(job_id).await {
            Ok(job) => {
                if let Err(err) = Workspace::at(&job.workspace).remove().await {
                    warn!("job {job_id}: can't remove rejected workspace: {err}");
                }
            }
            // a re-run keeps its record and stays queued
            Err(err) => debug!("job {job_id}: kept after rejection: {err}"),
        }
    }

    pub async fn get(&self, job_id: JobId) -> Result<Job> {
        self.store.get(job_id).await
    }

    pub async fn list(&self, filter: JobFilter) -> Result<Vec<JobSummary>> {
        self.store.list(filter).await
    }

    pub async fn cancel(&self, job_id: JobId) -> Result<()> {
        self.scheduler.cancel(job_id).await
    }

    /// Start a new attempt of a terminal job from the inputs already in its workspace.
    ///
    /// The store checks and moves the job back to queued in one step, so of two concurrent
    /// re-runs only one gets past it and prepares the workspace.
    pub async fn rerun(&self, job_id: JobId) -> Result<Job> {
        let job = self.store.update(job_id, Update::Rerun).await?;
        if let Err(err) = Workspace::at(&job.workspace)
            .prepare_attempt(job.attempt)
            .await
        {
            warn!("job {job_id}: can't prepare attempt {}: {err}", job.attempt);
            let abort = Update::Abort {
                reason: format!("can't prepare attempt {}: {err}", job.attempt),
            };
            self.store.update(job_id, abort).await?;
            return Err(err.into());
        }
        info!("job {job_id}: attempt {} queued", job.attempt);
        self.submit(job_id).await?;
        Ok(job)
    }

    /// Delete a terminal job and its workspace.
    ///
    /// When the workspace can't be removed the record is put back, so the job stays listed
    /// instead of reappearing after a restart.
    pub async fn cleanup(&self, job_id: JobId) -> Result<()> {
        let job = self.store.remove(job_id).await?;
        if let Err(err) = Workspace::at(&job.workspace).remove().await {
            warn!("job {job_id}: can't remove workspace: {err}");
            if let Err(restore_err) = self.store.restore(job).await {
                warn!("job {job_id}: can't restore record: {restore_err}");
            }
            return Err(err.into());
        }
        info!("job {job_id}: cleaned up");
        Ok(())
    }

    /// Clean up every terminal job that finished more than `older_than` ago.
    pub async fn expire(&self, older_than: chrono::Duration) -> Result<Vec<JobId>> {
        let filter = JobFilter {
            finished_before: Some(Utc::now() - older_than),
            ..JobFilter::terminal()
        };
        let mut expired = Vec::new();
        for summary in self.store.list(filter).await? {
            match self.cleanup(summary.id).await {
                Ok(()) => expired.push(summary.id),
                // removed by someone else in the meantime
                Err(JobError::NotFound(_)) => {}
                Err(err) => return Err(err),
            }
        }
        info!("Expired {} jobs", expired.len());
        Ok(expired)
    }

    /// Resolve once the job reaches a terminal status.
    pub async fn wait(&self, job_id: JobId) -> Result<Job> {
        self.store.wait(job_id).await
    }

    /// Output of the current attempt: everything buffered so far, then live output until the
    /// attempt ends.
    pub async fn stream_logs(&self, job_id: JobId) -> Result<mpsc::UnboundedReceiver<LogChunk>> {
        self.store.stream_logs(job_id).await
    }

    pub async fn stats(&self) -> Result<SchedulerStats> {
        self.scheduler.stats().await
    }

    /// Stop admitting jobs, cancel queued and running ones and wait for every executor to
    /// return.
    pub async fn shutdown(self) -> Result<()> {
        info!("Shutting down");
        self.scheduler.shutdown().await
    }
}

/// Read every `job.json` under `output_root`, oldest submission first.
///
/// This only reads: it is safe to call while another process owns the output root.
pub async fn load_jobs(output_root: &Path) -> Result<Vec<Job>> {
    let mut jobs = Vec::new();
    let mut entries = fs::read_dir(output_root).await?;
    while let Some(entry) = entries.next_entry().await? {
        let record = entry.path().join(RECORD_FILE);
        let bytes = match fs::read(&record).await {
            Ok(bytes) => bytes,
            Err(err) => {
                debug!("Skipping {}: {err}", entry.path().display());
                continue;
            }
        };
        match serde_json::from_slice::<Job>(&bytes) {
            Ok(job) => jobs.push(job),
            Err(err) => warn!("Ignoring unreadable record {}: {err}", record.display()),
        }
    }
    jobs.sort_by_key(|job| job.submitted_at);
    Ok(jobs)
}
