//! Job records and the stage state machine they follow.
//!
//! A [`Job`] only changes through the transition methods below, which refuse anything that would
//! break the fixed stage order or revisit a terminal status. The result store applies them on
//! behalf of the single executor driving the job.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::discovery::SampleMetadata;
use crate::errors::{JobError, Result};
use crate::events::{JobStatus, StageStatus};
use crate::results::EditingSummary;
use crate::stage::{Artifacts, Stage};
use crate::tool::{Tool, ToolError};
use crate::types::{Args, JobId};

/// Parameters handed to the quantifier (and partly to the other tools).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisParams {
    pub amplicon: String,
    pub guide: String,
    pub coding_seq: Option<String>,
    pub min_aln_score: u32,
    pub plot_window_size: u32,
    /// Threads given to each tool of a single job
    pub threads: u32,
}

impl Default for AnalysisParams {
    fn default() -> Self {
        Self {
            amplicon: String::new(),
            guide: String::new(),
            coding_seq: None,
            min_aln_score: 60,
            plot_window_size: 20,
            threads: 4,
        }
    }
}

/// A request to analyse one sample. Nothing is created until it passes validation.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub name: Option<String>,
    pub r1: PathBuf,
    pub r2: Option<PathBuf>,
    pub params: AnalysisParams,
    /// Extra arguments per tool identifier, appended to that tool's command line
    pub extra_args: BTreeMap<String, Args>,
    /// Replicate and treatment; taken from the R1 file name when not given
    pub metadata: Option<SampleMetadata>,
}

impl JobRequest {
    pub fn new(r1: impl Into<PathBuf>, params: AnalysisParams) -> Self {
        Self {
            name: None,
            r1: r1.into(),
            r2: None,
            params,
            extra_args: BTreeMap::new(),
            metadata: None,
        }
    }

    pub fn with_r2(mut self, r2: impl Into<PathBuf>) -> Self {
        self.r2 = Some(r2.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_extra_args(mut self, tool: impl Into<String>, args: Args) -> Self {
        self.extra_args.insert(tool.into(), args);
        self
    }

    pub fn with_metadata(mut self, metadata: SampleMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Inputs as staged inside the workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inputs {
    pub r1: PathBuf,
    pub r2: Option<PathBuf>,
    pub amplicon: PathBuf,
    /// Where the reads were copied from
    pub sources: Vec<PathBuf>,
}

impl Inputs {
    pub fn reads(&self) -> Vec<PathBuf> {
        std::iter::once(self.r1.clone())
            .chain(self.r2.clone())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: Stage,
    pub status: StageStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub duration_ms: Option<u64>,
    pub stdout: PathBuf,
    pub stderr: PathBuf,
}

/// What went wrong in a failed stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageFailure {
    pub stage: Stage,
    pub exit_code: Option<i32>,
    pub message: String,
    pub log_tail: Vec<String>,
}

impl StageFailure {
    pub fn from_tool_error(stage: Stage, err: &ToolError) -> Self {
        Self {
            stage,
            exit_code: err.exit_code(),
            message: err.to_string(),
            log_tail: err.log_tail().to_vec(),
        }
    }
}

/// A finished attempt, archived when the job is re-run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attempt {
    pub number: u32,
    pub status: JobStatus,
    pub stages: Vec<StageRecord>,
    pub failure: Option<StageFailure>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Sample name, also used to name the quantifier report
    pub name: String,
    pub submitted_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Option<SampleMetadata>,
    pub workspace: PathBuf,
    pub inputs: Inputs,
    pub params: AnalysisParams,
    pub extra_args: BTreeMap<Tool, Args>,
    pub attempt: u32,
    pub status: JobStatus,
    pub current_stage: Option<Stage>,
    pub stages: Vec<StageRecord>,
    pub artifacts: Artifacts,
    pub failure: Option<StageFailure>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Editing metrics of the current attempt's quantifier report
    #[serde(default)]
    pub results: Option<EditingSummary>,
    #[serde(default)]
    pub history: Vec<Attempt>,
}

/// A mutation of a job record. Only the result store applies these.
#[derive(Debug, Clone)]
pub enum Update {
    BeginStage {
        stage: Stage,
        stdout: PathBuf,
        stderr: PathBuf,
    },
    FinishStage {
        stage: Stage,
        exit_code: i32,
        duration: Duration,
        artifacts: Vec<PathBuf>,
    },
    /// Metrics read from the report of the running quantify stage.
    RecordResults(EditingSummary),
    Fail(StageFailure),
    Cancel,
    /// End an active job for a reason outside of its tools, such as a restart of the process.
    Abort { reason: String },
    /// Archive the terminal attempt and queue the job again.
    Rerun,
}

/// Short form of a job for listings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobSummary {
    pub id: JobId,
    pub name: String,
    pub submitted_at: DateTime<Utc>,
    pub status: JobStatus,
    pub attempt: u32,
    pub current_stage: Option<Stage>,
    pub failed_stage: Option<Stage>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub statuses: Option<Vec<JobStatus>>,
    pub submitted_after: Option<DateTime<Utc>>,
    pub finished_before: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl JobFilter {
    pub fn with_status(status: JobStatus) -> Self {
        Self {
            statuses: Some(vec![status]),
            ..Self::default()
        }
    }

    pub fn terminal() -> Self {
        Self {
            statuses: Some(vec![
                JobStatus::Succeeded,
                JobStatus::Failed,
                JobStatus::Cancelled,
            ]),
            ..Self::default()
        }
    }

    pub fn matches(&self, job: &Job) -> bool {
        if let Some(statuses) = &self.statuses {
            if !statuses.contains(&job.status) {
                return false;
            }
        }
        if let Some(after) = self.submitted_after {
            if job.submitted_at <= after {
                return false;
            }
        }
        if let Some(before) = self.finished_before {
            match job.finished_at {
                Some(finished_at) if finished_at < before => {}
                _ => return false,
            }
        }
        true
    }
}

impl Job {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn summary(&self) -> JobSummary {
        JobSummary {
            id: self.id,
            name: self.name.clone(),
            submitted_at: self.submitted_at,
            status: self.status,
            attempt: self.attempt,
            current_stage: self.current_stage,
            failed_stage: self.failure.as_ref().map(|failure| failure.stage),
            finished_at: self.finished_at,
        }
    }

    pub fn stage_record(&self, stage: Stage) -> Option<&StageRecord> {
        self.stages.iter().find(|record| record.stage == stage)
    }

    /// The quantifier report, once the job succeeded.
    pub fn report(&self) -> Option<&PathBuf> {
        self.artifacts
            .get(&Stage::Quantify)
            .and_then(|paths| paths.first())
    }

    /// The stage allowed to start next, if any.
    pub fn next_stage(&self) -> Option<Stage> {
        match self.status {
            JobStatus::Queued if self.stages.is_empty() => Some(Stage::first()),
            JobStatus::Running => match self.stages.last() {
                Some(last) if last.status == StageStatus::Succeeded => last.stage.next(),
                _ => None,
            },
            _ => None,
        }
    }

    /// Apply an update at `now`.
    pub fn apply(&mut self, update: Update, now: DateTime<Utc>) -> Result<()> {
        match update {
            Update::BeginStage {
                stage,
                stdout,
                stderr,
            } => {
                self.guard_active()?;
                if self.next_stage() != Some(stage) {
                    return Err(self.illegal(format!("{stage} can't start now")));
                }
                self.status = JobStatus::Running;
                self.current_stage = Some(stage);
                self.stages.push(StageRecord {
                    stage,
                    status: StageStatus::Running,
                    started_at: now,
                    finished_at: None,
                    exit_code: None,
                    duration_ms: None,
                    stdout,
                    stderr,
                });
            }
            Update::FinishStage {
                stage,
                exit_code,
                duration,
                artifacts,
            } => {
                self.guard_active()?;
                let record = self.running_record(stage)?;
                record.status = StageStatus::Succeeded;
                record.exit_code = Some(exit_code);
                record.finished_at = Some(now);
                record.duration_ms = Some(duration.as_millis() as u64);
                self.artifacts.insert(stage, artifacts);
                if stage.next().is_none() {
                    self.finish(JobStatus::Succeeded, now);
                }
            }
            Update::RecordResults(results) => {
                self.guard_active()?;
                self.running_record(Stage::Quantify)?;
                self.results = Some(results);
            }
            Update::Fail(failure) => {
                self.guard_active()?;
                let record = self.running_record(failure.stage)?;
                record.status = StageStatus::Failed;
                record.exit_code = failure.exit_code;
                record.finished_at = Some(now);
                record.duration_ms = Some(millis_since(record.started_at, now));
                self.failure = Some(failure);
                self.finish(JobStatus::Failed, now);
            }
            Update::Cancel => {
                self.guard_active()?;
                self.close_running_stage(StageStatus::Cancelled, now);
                self.finish(JobStatus::Cancelled, now);
            }
            Update::Abort { reason } => {
                self.guard_active()?;
                let stage = self.current_stage.unwrap_or_else(Stage::first);
                self.close_running_stage(StageStatus::Failed, now);
                self.failure = Some(StageFailure {
                    stage,
                    exit_code: None,
                    message: reason,
                    log_tail: Vec::new(),
                });
                self.finish(JobStatus::Failed, now);
            }
            Update::Rerun => {
                if !self.is_terminal() {
                    return Err(JobError::JobNotTerminal(self.id));
                }
                self.history.push(Attempt {
                    number: self.attempt,
                    status: self.status,
                    stages: std::mem::take(&mut self.stages),
                    failure: self.failure.take(),
                    finished_at: self.finished_at.take(),
                });
                self.attempt += 1;
                self.status = JobStatus::Queued;
                self.current_stage = None;
                self.artifacts.clear();
                self.results = None;
            }
        }
        Ok(())
    }

    fn guard_active(&self) -> Result<()> {
        if self.is_terminal() {
            Err(JobError::AlreadyTerminal(self.id))
        } else {
            Ok(())
        }
    }

    fn running_record(&mut self, stage: Stage) -> Result<&mut StageRecord> {
        let from = self.status;
        let job_id = self.id;
        match self.stages.last_mut() {
            Some(record) if record.stage == stage && record.status == StageStatus::Running => {
                Ok(record)
            }
            _ => Err(JobError::IllegalTransition {
                job_id,
                from,
                detail: format!("{stage} is not running"),
            }),
        }
    }

    fn close_running_stage(&mut self, status: StageStatus, now: DateTime<Utc>) {
        if let Some(record) = self.stages.last_mut() {
            if record.status == StageStatus::Running {
                record.status = status;
                record.finished_at = Some(now);
                record.duration_ms = Some(millis_since(record.started_at, now));
            }
        }
    }

    fn finish(&mut self, status: JobStatus, now: DateTime<Utc>) {
        self.status = status;
        self.finished_at = Some(now);
    }

    fn illegal(&self, detail: String) -> JobError {
        JobError::IllegalTransition {
            job_id: self.id,
            from: self.status,
            detail,
        }
    }
}

fn millis_since(start: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    (now - start).num_milliseconds().max(0) as u64
}
