//! Drives one job through the stage sequence.
//!
//! The executor is the only writer of a running job. It checks the cancellation token between
//! stages and hands it to the tool adapter so an in-flight tool is killed as well.

use std::path::PathBuf;
use std::sync::Arc;

use log::{error, info, warn};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::actors::store::StoreHandle;
use crate::config::{StageTimeouts, ToolCommands};
use crate::errors::{JobError, Result};
use crate::events::{JobStatus, LogChunk};
use crate::job::{Job, StageFailure, Update};
use crate::results;
use crate::stage::{Artifacts, Stage};
use crate::tool::{self, ToolError, ToolRun};
use crate::types::JobId;
use crate::workspace::Workspace;

/// Shared, read-only settings for every executor.
pub(crate) struct ExecutorContext {
    pub store: StoreHandle,
    pub output_root: PathBuf,
    pub tools: ToolCommands,
    pub timeouts: StageTimeouts,
    pub tail_lines: usize,
}

/// Run `job_id` to a terminal status.
pub(crate) async fn run(job_id: JobId, ctx: Arc<ExecutorContext>, cancel: CancellationToken) {
    let job = match ctx.store.get(job_id).await {
        Ok(job) => job,
        Err(err) => {
            warn!("job {job_id}: can't load record: {err}");
            return;
        }
    };
    if job.status != JobStatus::Queued {
        warn!("job {job_id}: expected a queued job, found {}", job.status);
        return;
    }
    match drive(&job, &ctx, &cancel).await {
        Ok(status) => info!("job {job_id} ({}): {status}", job.name),
        Err(err) => {
            error!("job {job_id}: {err}");
            // keep the job from staying active forever
            let abort = Update::Abort {
                reason: err.to_string(),
            };
            if let Err(err) = ctx.store.update(job_id, abort).await {
                error!("job {job_id}: can't record failure: {err}");
            }
        }
    }
}

async fn drive(job: &Job, ctx: &ExecutorContext, cancel: &CancellationToken) -> Result<JobStatus> {
    if !job.workspace.starts_with(&ctx.output_root) {
        return Err(JobError::InvalidInput(format!(
            "workspace {} is outside of {}",
            job.workspace.display(),
            ctx.output_root.display()
        )));
    }
    let workspace = Workspace::at(&job.workspace);
    let mut artifacts = Artifacts::new();

    for stage in Stage::ALL {
        if cancel.is_cancelled() {
            info!("job {}: cancelled before {stage}", job.id);
            return Ok(ctx.store.update(job.id, Update::Cancel).await?.status);
        }

        let invocation = stage.plan(job, &workspace, &artifacts);
        let logs = workspace.log_paths(job.attempt, stage);
        ctx.store
            .update(
                job.id,
                Update::BeginStage {
                    stage,
                    stdout: logs.stdout.clone(),
                    stderr: logs.stderr.clone(),
                },
            )
            .await?;
        info!("job {}: {stage} started", job.id);

        let tool_run = ToolRun {
            tool: invocation.tool,
            command: ctx.tools.command(invocation.tool),
            args: invocation.args,
            workdir: workspace.root().to_path_buf(),
            timeout: ctx.timeouts.for_stage(stage),
            logs,
            inputs: invocation.inputs,
            outputs: invocation.outputs.clone(),
            tail_lines: ctx.tail_lines,
        };
        let (output_tx, output_rx) = mpsc::unbounded_channel();
        let forwarder = forward_logs(ctx.store.clone(), job.id, stage, output_rx);
        let result = tool::run(&tool_run, output_tx, cancel).await;
        let _ = forwarder.await;

        match result {
            Ok(output) => {
                if stage == Stage::Quantify {
                    record_results(ctx, job.id, &invocation.outputs).await?;
                }
                ctx.store
                    .update(
                        job.id,
                        Update::FinishStage {
                            stage,
                            exit_code: output.exit_code,
                            duration: output.duration,
                            artifacts: invocation.outputs,
                        },
                    )
                    .await?;
                artifacts.insert(stage, tool_run.outputs);
            }
            Err(ToolError::Cancelled { .. }) => {
                info!("job {}: cancelled during {stage}", job.id);
                return Ok(ctx.store.update(job.id, Update::Cancel).await?.status);
            }
            Err(err) => {
                warn!("job {}: {stage} failed: {err}", job.id);
                let failure = StageFailure::from_tool_error(stage, &err);
                return Ok(ctx.store.update(job.id, Update::Fail(failure)).await?.status);
            }
        }
    }
    Ok(JobStatus::Succeeded)
}

/// Attach the metrics of the quantifier report. A report that can't be read doesn't fail the
/// job; it only has no metrics.
async fn record_results(
    ctx: &ExecutorContext,
    job_id: JobId,
    outputs: &[PathBuf],
) -> Result<()> {
    let Some(report) = outputs.first() else {
        return Ok(());
    };
    match results::summarize(report).await {
        Ok(summary) => {
            info!(
                "job {job_id}: {} reads, {:.2}% modified",
                summary.total_reads, summary.indel_percent
            );
            ctx.store
                .update(job_id, Update::RecordResults(summary))
                .await?;
        }
        Err(err) => warn!("job {job_id}: no editing metrics: {err}"),
    }
    Ok(())
}

/// Forward tool output to the result store until the tool's pipes close.
fn forward_logs(
    store: StoreHandle,
    job_id: JobId,
    stage: Stage,
    mut output_rx: mpsc::UnboundedReceiver<crate::events::Output>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(output) = output_rx.recv().await {
            store.append_log(job_id, LogChunk { stage, output });
        }
    })
}
