use std::collections::VecDeque;
use std::path::Path;

use anyhow::{bail, Context};
use editjobs::discovery::pair_fastqs;
use editjobs::{
    load_jobs, result_rows, AnalysisParams, Job, JobError, JobStatus, Orchestrator,
    OrchestratorConfig,
};
use log::{info, warn};
use uuid::Uuid;

use crate::arg_parser::{ExtraArgs, OutputType};

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const TSV_HEADER: &str = "replicate\ttreatment\tsample\tjob\ttotal_reads\t\
    unmodified_pct\tindel_pct\tframeshift_pct\tinframe_pct\treport";

/// Front end for the job orchestrator.
///
/// Commands that change jobs start an orchestrator for the output root; reading commands only
/// look at the persisted records.
pub struct JobsCli {
    config: OrchestratorConfig,
}

impl JobsCli {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self { config }
    }

    async fn orchestrator(&self) -> anyhow::Result<Orchestrator> {
        Orchestrator::start(self.config.clone())
            .await
            .with_context(|| format!("starting on {}", self.config.output_root.display()))
    }

    async fn job(&self, job_id: Uuid) -> anyhow::Result<Job> {
        load_jobs(&self.config.output_root)
            .await?
            .into_iter()
            .find(|job| job.id == job_id)
            .ok_or_else(|| JobError::NotFound(job_id).into())
    }

    /// Submit one job per sample under `input_dir`, wait for all of them and print a summary.
    pub async fn run_batch(
        &self,
        input_dir: &Path,
        params: AnalysisParams,
        extra: &[ExtraArgs],
    ) -> anyhow::Result<()> {
        let samples = pair_fastqs(input_dir)
            .with_context(|| format!("searching {}", input_dir.display()))?;
        if samples.is_empty() {
            bail!("no FASTQ files found under {}", input_dir.display());
        }

        let orchestrator = self.orchestrator().await?;
        let batch = async {
            let mut pending = VecDeque::new();
            let mut finished = Vec::new();
            for sample in samples {
                let name = sample.name.clone();
                let mut request = sample.into_request(params.clone());
                for ExtraArgs { tool, args } in extra {
                    request = request.with_extra_args(tool.clone(), args.clone());
                }
                loop {
                    match orchestrator.enqueue(request.clone()).await {
                        Ok(job) => {
                            println!("Queued {name} as job {}", job.id);
                            pending.push_back(job.id);
                            break;
                        }
                        // wait for room in the queue
                        Err(JobError::QueueFull { .. }) if !pending.is_empty() => {
                            if let Some(job_id) = pending.pop_front() {
                                finished.push(orchestrator.wait(job_id).await?);
                            }
                        }
                        Err(err) => {
                            warn!("Skipping sample {name}: {err}");
                            println!("Skipped {name}: {err}");
                            break;
                        }
                    }
                }
            }
            for job_id in pending {
                finished.push(orchestrator.wait(job_id).await?);
            }
            Ok::<_, JobError>(finished)
        };

        let finished = tokio::select! {
            finished = batch => finished?,
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, cancelling jobs");
                orchestrator.shutdown().await?;
                bail!("interrupted");
            }
        };
        orchestrator.shutdown().await?;

        println!();
        print_table(&finished);
        let failed = finished
            .iter()
            .filter(|job| job.status != JobStatus::Succeeded)
            .count();
        if failed > 0 {
            bail!("{failed} of {} jobs did not succeed", finished.len());
        }
        Ok(())
    }

    pub async fn list(&self, statuses: &[JobStatus]) -> anyhow::Result<()> {
        let jobs: Vec<Job> = load_jobs(&self.config.output_root)
            .await?
            .into_iter()
            .filter(|job| statuses.is_empty() || statuses.contains(&job.status))
            .collect();
        print_table(&jobs);
        Ok(())
    }

    pub async fn show(&self, job_id: Uuid, json: bool) -> anyhow::Result<()> {
        let job = self.job(job_id).await?;
        if json {
            println!("{}", serde_json::to_string_pretty(&job)?);
            return Ok(());
        }

        println!("Job:        {}", job.id);
        println!("Sample:     {}", job.name);
        if let Some(metadata) = &job.metadata {
            println!("Replicate:  {}", metadata.replicate);
            println!("Treatment:  {}", metadata.treatment);
        }
        println!("Status:     {}", job.status);
        println!("Attempt:    {}", job.attempt);
        println!("Submitted:  {}", job.submitted_at.format(TIME_FORMAT));
        if let Some(finished_at) = job.finished_at {
            println!("Finished:   {}", finished_at.format(TIME_FORMAT));
        }
        println!("Workspace:  {}", job.workspace.display());
        for record in &job.stages {
            let exit_code = record
                .exit_code
                .map(|code| code.to_string())
                .unwrap_or_else(|| "-".into());
            let duration = record
                .duration_ms
                .map(|ms| format!("{:.1}s", ms as f64 / 1000.0))
                .unwrap_or_else(|| "-".into());
            let status = format!("{:?}", record.status).to_lowercase();
            println!(
                "  {:<12} {:<10} exit {:<4} {}",
                record.stage.name(),
                status,
                exit_code,
                duration
            );
        }
        if let Some(report) = job.report() {
            println!("Report:     {}", report.display());
        }
        if let Some(results) = &job.results {
            println!("Reads:      {} aligned", results.total_reads);
            println!(
                "Editing:    {:.2}% unmodified, {:.2}% modified",
                results.unmodified_percent, results.indel_percent
            );
            if let Some(frameshift) = &results.frameshift {
                println!(
                    "Frames:     {:.2}% frameshift, {:.2}% in-frame",
                    frameshift.frameshift_percent, frameshift.inframe_percent
                );
            }
            if let Some(html) = &results.report_html {
                println!("HTML:       {}", html.display());
            }
        }
        if let Some(failure) = &job.failure {
            println!("Failed in {}: {}", failure.stage, failure.message);
            for line in &failure.log_tail {
                println!("  | {line}");
            }
        }
        Ok(())
    }

    /// Print the metrics of every succeeded job, one line per sample.
    pub async fn results(&self, tsv: bool) -> anyhow::Result<()> {
        let jobs = load_jobs(&self.config.output_root).await?;
        let rows = result_rows(&jobs);
        if tsv {
            println!("{TSV_HEADER}");
        } else {
            println!(
                "{:<16}  {:<20}  {:<20}  {:>10}  {:>11}  {:>7}  {:>11}  {:>9}",
                "REPLICATE",
                "TREATMENT",
                "SAMPLE",
                "READS",
                "UNMODIFIED%",
                "INDEL%",
                "FRAMESHIFT%",
                "IN-FRAME%"
            );
        }
        for row in rows {
            let summary = &row.summary;
            let (frameshift, inframe) = match &summary.frameshift {
                Some(frames) => (
                    format!("{:.2}", frames.frameshift_percent),
                    format!("{:.2}", frames.inframe_percent),
                ),
                None => ("-".to_string(), "-".to_string()),
            };
            if tsv {
                let report = summary
                    .report_html
                    .as_ref()
                    .map(|path| path.display().to_string())
                    .unwrap_or_default();
                println!(
                    "{}\t{}\t{}\t{}\t{}\t{:.2}\t{:.2}\t{}\t{}\t{}",
                    row.replicate,
                    row.treatment,
                    row.sample,
                    row.job_id,
                    summary.total_reads,
                    summary.unmodified_percent,
                    summary.indel_percent,
                    frameshift,
                    inframe,
                    report
                );
            } else {
                println!(
                    "{:<16}  {:<20}  {:<20}  {:>10}  {:>11.2}  {:>7.2}  {:>11}  {:>9}",
                    row.replicate,
                    row.treatment,
                    row.sample,
                    summary.total_reads,
                    summary.unmodified_percent,
                    summary.indel_percent,
                    frameshift,
                    inframe
                );
            }
        }
        Ok(())
    }

    /// Print the captured output of every stage of the current attempt.
    pub async fn logs(&self, job_id: Uuid, output_type: OutputType) -> anyhow::Result<()> {
        let job = self.job(job_id).await?;
        for record in &job.stages {
            let files = match output_type {
                OutputType::Stdout => vec![("stdout", &record.stdout)],
                OutputType::Stderr => vec![("stderr", &record.stderr)],
                OutputType::All => vec![("stdout", &record.stdout), ("stderr", &record.stderr)],
            };
            for (label, path) in files {
                let bytes = tokio::fs::read(path)
                    .await
                    .with_context(|| format!("reading {}", path.display()))?;
                println!("==> {} {label} <==", record.stage);
                print!("{}", String::from_utf8_lossy(&bytes));
            }
        }
        Ok(())
    }

    pub async fn rerun(&self, job_ids: &[Uuid]) -> anyhow::Result<()> {
        let orchestrator = self.orchestrator().await?;
        let mut finished = Vec::new();
        for job_id in job_ids {
            let job = orchestrator.rerun(*job_id).await?;
            println!("Re-running job {} (attempt {})", job.id, job.attempt);
        }
        for job_id in job_ids {
            finished.push(orchestrator.wait(*job_id).await?);
        }
        orchestrator.shutdown().await?;
        print_table(&finished);
        Ok(())
    }

    pub async fn cleanup(&self, job_ids: &[Uuid]) -> anyhow::Result<()> {
        let orchestrator = self.orchestrator().await?;
        for job_id in job_ids {
            match orchestrator.cleanup(*job_id).await {
                Ok(()) => println!("Removed job {job_id}"),
                Err(err) => println!("Kept job {job_id}: {err}"),
            }
        }
        orchestrator.shutdown().await?;
        Ok(())
    }

    pub async fn expire(&self, older_than_hours: i64) -> anyhow::Result<()> {
        let orchestrator = self.orchestrator().await?;
        let expired = orchestrator
            .expire(chrono::Duration::hours(older_than_hours))
            .await?;
        orchestrator.shutdown().await?;
        println!("Removed {} jobs", expired.len());
        Ok(())
    }
}

fn print_table(jobs: &[Job]) {
    println!(
        "{:<36}  {:<20}  {:<9}  {:<19}  DETAIL",
        "JOB", "SAMPLE", "STATUS", "SUBMITTED"
    );
    for job in jobs {
        let detail = match (&job.failure, job.report(), job.current_stage) {
            (Some(failure), _, _) => format!("{}: {}", failure.stage, failure.message),
            (None, Some(report), _) => report.display().to_string(),
            (None, None, Some(stage)) if !job.is_terminal() => format!("at {stage}"),
            _ => String::new(),
        };
        println!(
            "{:<36}  {:<20}  {:<9}  {:<19}  {}",
            job.id,
            job.name,
            job.status.to_string(),
            job.submitted_at.format(TIME_FORMAT).to_string(),
            detail
        );
    }
}
