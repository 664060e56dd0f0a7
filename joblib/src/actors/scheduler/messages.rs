use crate::errors;
use crate::types::JobId;
use tokio::sync::oneshot;

/// Occupancy of the worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerStats {
    pub workers: usize,
    pub queue_capacity: usize,
    pub waiting: usize,
    pub running: usize,
}

#[derive(Debug)]
pub enum SchedulerMessage {
    Submit {
        job_id: JobId,
        response: oneshot::Sender<errors::Result<()>>,
    },
    Cancel {
        job_id: JobId,
        response: oneshot::Sender<errors::Result<()>>,
    },
    Stats {
        response: oneshot::Sender<SchedulerStats>,
    },
    Shutdown {
        response: oneshot::Sender<()>,
    },
}
