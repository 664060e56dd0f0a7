mod actors;
pub mod config;
mod definition;
pub mod discovery;
pub mod errors;
mod events;
mod executor;
pub mod job;
mod lock;
mod orchestrator;
pub mod results;
pub mod stage;
pub mod tool;
pub mod types;
pub mod workspace;

pub use actors::scheduler::SchedulerStats;
pub use config::{ConfigError, OrchestratorConfig, StageTimeouts, ToolCommand, ToolCommands};
pub use definition::clean_sequence;
pub use discovery::SampleMetadata;
pub use errors::JobError;
pub use events::{JobStatus, LogChunk, Output, StageStatus};
pub use job::{AnalysisParams, Job, JobFilter, JobRequest, JobSummary, StageFailure};
pub use orchestrator::{load_jobs, Orchestrator};
pub use results::{result_rows, EditingSummary, ResultRow};
pub use stage::Stage;
pub use tool::{Tool, ToolError};
