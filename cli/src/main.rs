mod arg_parser;
mod jobs_cli;

use arg_parser::{ArgParser, SubCommand};
use editjobs::{AnalysisParams, JobStatus, OrchestratorConfig};
use jobs_cli::JobsCli;

use clap::Parser;
use env_logger::Env;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let args = ArgParser::parse();

    let mut config = match &args.config {
        Some(path) => OrchestratorConfig::from_toml_file(path)?,
        None => OrchestratorConfig::default(),
    };
    if let Some(output_root) = args.output_root {
        config.output_root = output_root;
    }
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    if let Some(queue_capacity) = args.queue_capacity {
        config.queue_capacity = queue_capacity;
    }
    config.validate()?;
    let cli = JobsCli::new(config);

    match args.sub_command {
        SubCommand::Run {
            input_dir,
            amplicon,
            guide,
            coding_seq,
            min_aln_score,
            plot_window_size,
            threads,
            extra,
        } => {
            let params = AnalysisParams {
                amplicon,
                guide,
                coding_seq,
                min_aln_score,
                plot_window_size,
                threads,
            };
            cli.run_batch(&input_dir, params, &extra).await?;
        }
        SubCommand::List { status } => {
            let statuses: Vec<JobStatus> = status.into_iter().map(JobStatus::from).collect();
            cli.list(&statuses).await?;
        }
        SubCommand::Show { json, job_id } => {
            cli.show(job_id, json).await?;
        }
        SubCommand::Results { tsv } => {
            cli.results(tsv).await?;
        }
        SubCommand::Logs {
            output_type,
            job_id,
        } => {
            cli.logs(job_id, output_type).await?;
        }
        SubCommand::Rerun { job_ids } => {
            cli.rerun(&job_ids).await?;
        }
        SubCommand::Cleanup { job_ids } => {
            cli.cleanup(&job_ids).await?;
        }
        SubCommand::Expire { older_than_hours } => {
            cli.expire(older_than_hours).await?;
        }
    }

    Ok(())
}
