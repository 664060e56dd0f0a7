use std::path::PathBuf;

use clap::{ArgEnum, Parser, Subcommand};
use editjobs::JobStatus;
use uuid::Uuid;

/// Run and manage CRISPR editing analysis jobs
#[derive(Debug, Parser)]
pub struct ArgParser {
    /// TOML configuration file; flags below override it
    #[clap(short = 'c', long, env = "EDITJOBS_CONFIG")]
    pub config: Option<PathBuf>,
    /// Directory holding one workspace per job
    #[clap(short = 'o', long, env = "EDITJOBS_OUTPUT_ROOT")]
    pub output_root: Option<PathBuf>,
    /// Maximum number of jobs running at once
    #[clap(long, env = "EDITJOBS_WORKERS")]
    pub workers: Option<usize>,
    /// Maximum number of jobs waiting for a worker
    #[clap(long, env = "EDITJOBS_QUEUE_CAPACITY")]
    pub queue_capacity: Option<usize>,
    /// The sub-command to use
    #[clap(subcommand)]
    pub sub_command: SubCommand,
}

#[derive(Clone, Debug, PartialEq, Eq, Subcommand)]
pub enum SubCommand {
    /// analyse every sample found under a directory and wait for the results
    Run {
        /// directory searched recursively for R1/R2 FASTQ files
        input_dir: PathBuf,

        #[clap(short = 'a', long)]
        /// amplicon sequence
        amplicon: String,

        #[clap(short = 'g', long)]
        /// guide sequence, without PAM
        guide: String,

        #[clap(long)]
        /// coding sequence inside the amplicon
        coding_seq: Option<String>,

        #[clap(long, default_value_t = 60)]
        /// minimum alignment score for the quantifier
        min_aln_score: u32,

        #[clap(long, default_value_t = 20)]
        /// plot window around the cut site
        plot_window_size: u32,

        #[clap(short = 't', long, default_value_t = 4)]
        /// threads per sample
        threads: u32,

        #[clap(long, multiple_occurrences = true, parse(try_from_str = tool_eq_args))]
        /// extra arguments for a tool, e.g. --extra "crispresso=--quantification_window_size 10"
        extra: Vec<ExtraArgs>,
    },
    /// list recorded jobs
    List {
        /// only show jobs with this status
        #[clap(short = 's', long, arg_enum, multiple_occurrences = true)]
        status: Vec<StatusFilter>,
    },
    /// show one job
    Show {
        /// print the full record as JSON
        #[clap(long)]
        json: bool,

        /// Uuid v4 string
        job_id: Uuid,
    },
    /// print the editing metrics of succeeded jobs, grouped by replicate
    Results {
        /// print tab separated values
        #[clap(long)]
        tsv: bool,
    },
    /// print a job's captured tool output
    Logs {
        /// type of output to print
        #[clap(arg_enum)]
        output_type: OutputType,

        /// Uuid v4 string
        job_id: Uuid,
    },
    /// run finished jobs again from their staged inputs
    Rerun {
        /// Uuid v4 strings
        #[clap(required = true)]
        job_ids: Vec<Uuid>,
    },
    /// delete finished jobs and their workspaces
    Cleanup {
        /// Uuid v4 strings
        #[clap(required = true)]
        job_ids: Vec<Uuid>,
    },
    /// delete every finished job older than the given age
    Expire {
        /// age in hours
        #[clap(long, default_value_t = 24 * 7)]
        older_than_hours: i64,
    },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, ArgEnum)]
pub enum OutputType {
    /// print stdout
    Stdout,
    /// print stderr
    Stderr,
    /// print stdout and stderr
    All,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ArgEnum)]
pub enum StatusFilter {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl From<StatusFilter> for JobStatus {
    fn from(status: StatusFilter) -> Self {
        match status {
            StatusFilter::Queued => JobStatus::Queued,
            StatusFilter::Running => JobStatus::Running,
            StatusFilter::Succeeded => JobStatus::Succeeded,
            StatusFilter::Failed => JobStatus::Failed,
            StatusFilter::Cancelled => JobStatus::Cancelled,
        }
    }
}

/// Extra command line arguments for one tool.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtraArgs {
    pub tool: String,
    pub args: Vec<String>,
}

/// try_from_str parse function for per-tool extra arguments
fn tool_eq_args(s: &str) -> Result<ExtraArgs, String> {
    match s.split_once('=') {
        Some((tool, args)) if !tool.trim().is_empty() => Ok(ExtraArgs {
            tool: tool.trim().to_string(),
            args: args.split_whitespace().map(str::to_string).collect(),
        }),
        _ => Err("Required format is TOOL=ARGS".to_string()),
    }
}
