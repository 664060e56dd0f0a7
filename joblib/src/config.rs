//! Orchestrator configuration.
//!
//! Every field has a default so an empty TOML document is a valid configuration:
//!
//! ```toml
//! output_root = "/outputs"
//! workers = 4
//! queue_capacity = 64
//!
//! [timeouts]
//! quantify = 7200
//!
//! [tools.crispresso]
//! program = "conda"
//! args = ["run", "-n", "crispresso2", "CRISPResso"]
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::stage::Stage;
use crate::tool::{Tool, UnknownTool};
use crate::types::{Args, Program};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("can't read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("can't parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Directory holding one workspace per job
    pub output_root: PathBuf,
    /// Maximum number of jobs running at once
    pub workers: usize,
    /// Maximum number of jobs waiting for a worker
    pub queue_capacity: usize,
    /// Lines of captured output attached to a failed stage
    pub log_tail_lines: usize,
    /// In-memory log replay buffer per job, in bytes
    pub log_buffer_bytes: usize,
    pub timeouts: StageTimeouts,
    pub tools: ToolCommands,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            output_root: PathBuf::from("/outputs"),
            workers: 4,
            queue_capacity: 64,
            log_tail_lines: 20,
            log_buffer_bytes: 1 << 20,
            timeouts: StageTimeouts::default(),
            tools: ToolCommands::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be at least 1".into()));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "queue_capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Per-stage deadlines in seconds. A missing entry means the stage may run indefinitely.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StageTimeouts {
    pub qc: Option<u64>,
    pub align: Option<u64>,
    pub postprocess: Option<u64>,
    pub quantify: Option<u64>,
}

impl StageTimeouts {
    pub fn uniform(secs: u64) -> Self {
        Self {
            qc: Some(secs),
            align: Some(secs),
            postprocess: Some(secs),
            quantify: Some(secs),
        }
    }

    pub fn for_stage(&self, stage: Stage) -> Option<Duration> {
        let secs = match stage {
            Stage::Qc => self.qc,
            Stage::Align => self.align,
            Stage::Postprocess => self.postprocess,
            Stage::Quantify => self.quantify,
        };
        secs.map(Duration::from_secs)
    }
}

/// The command line prefix used to start a tool: `program args... <stage args>`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ToolCommand {
    pub program: Program,
    #[serde(default)]
    pub args: Args,
}

impl ToolCommand {
    pub fn new(program: impl Into<Program>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

/// Configured commands keyed by tool. Unknown tool identifiers are rejected while parsing.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(try_from = "BTreeMap<String, ToolCommand>")]
pub struct ToolCommands(BTreeMap<Tool, ToolCommand>);

impl ToolCommands {
    pub fn set(&mut self, tool: Tool, command: ToolCommand) {
        self.0.insert(tool, command);
    }

    pub fn command(&self, tool: Tool) -> ToolCommand {
        self.0
            .get(&tool)
            .cloned()
            .unwrap_or_else(|| ToolCommand::new(tool.default_program()))
    }
}

impl TryFrom<BTreeMap<String, ToolCommand>> for ToolCommands {
    type Error = UnknownTool;

    fn try_from(map: BTreeMap<String, ToolCommand>) -> Result<Self, Self::Error> {
        map.into_iter()
            .map(|(id, command)| Ok((id.parse::<Tool>()?, command)))
            .collect::<Result<BTreeMap<_, _>, _>>()
            .map(ToolCommands)
    }
}
