//! The fixed set of external programs the pipeline drives.
//!
//! Every program is a variant of [`Tool`]; nothing else can be executed. A variant knows its
//! identifier, its default executable name and how to read its exit code. The process supervision
//! lives in [`adapter`].

mod adapter;

pub use adapter::{run, LogPaths, ToolOutput, ToolRun};

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::Program;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Tool {
    /// Read quality control
    Fastqc,
    /// Short-read aligner
    Minimap2,
    /// Alignment file utility
    Samtools,
    /// Editing outcome quantifier
    Crispresso,
}

/// How a tool's exit code should be read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitKind {
    Success,
    /// The process could not locate or execute the real program.
    NotFound,
    Failure,
}

impl Tool {
    pub const ALL: [Tool; 4] = [Tool::Fastqc, Tool::Minimap2, Tool::Samtools, Tool::Crispresso];

    pub fn id(self) -> &'static str {
        match self {
            Tool::Fastqc => "fastqc",
            Tool::Minimap2 => "minimap2",
            Tool::Samtools => "samtools",
            Tool::Crispresso => "crispresso",
        }
    }

    /// Executable looked up on `PATH` when no command is configured.
    pub fn default_program(self) -> &'static str {
        match self {
            Tool::Fastqc => "fastqc",
            Tool::Minimap2 => "minimap2",
            Tool::Samtools => "samtools",
            Tool::Crispresso => "CRISPResso",
        }
    }

    pub fn exit_kind(self, code: i32) -> ExitKind {
        match (self, code) {
            (_, 0) => ExitKind::Success,
            // a shell or environment wrapper reports a missing program this way
            (_, 126 | 127) => ExitKind::NotFound,
            _ => ExitKind::Failure,
        }
    }
}

impl fmt::Display for Tool {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.id())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown tool '{0}', expected one of fastqc, minimap2, samtools, crispresso")]
pub struct UnknownTool(pub String);

impl FromStr for Tool {
    type Err = UnknownTool;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Tool::ALL
            .into_iter()
            .find(|tool| tool.id().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownTool(s.to_string()))
    }
}

impl TryFrom<String> for Tool {
    type Error = UnknownTool;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Tool> for String {
    fn from(tool: Tool) -> Self {
        tool.id().to_string()
    }
}

/// Why a single tool invocation did not succeed.
#[derive(Error, Debug)]
pub enum ToolError {
    #[error("{tool}: program {program:?} not found")]
    ToolNotFound { tool: Tool, program: Program },
    #[error("{tool}: timed out after {timeout:?}")]
    ToolTimeout {
        tool: Tool,
        timeout: Duration,
        log_tail: Vec<String>,
    },
    #[error("{tool}: exited with code {code}")]
    ToolNonZeroExit {
        tool: Tool,
        code: i32,
        log_tail: Vec<String>,
    },
    #[error("{tool}: killed by signal {signal}")]
    Killed {
        tool: Tool,
        signal: i32,
        log_tail: Vec<String>,
    },
    #[error("{tool}: cancelled")]
    Cancelled { tool: Tool },
    #[error("{tool}: expected artifact {path:?} is missing")]
    MissingArtifact { tool: Tool, path: PathBuf },
    #[error("{tool}: {source}")]
    Io {
        tool: Tool,
        #[source]
        source: std::io::Error,
    },
}

impl ToolError {
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            ToolError::ToolNonZeroExit { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn log_tail(&self) -> &[String] {
        match self {
            ToolError::ToolTimeout { log_tail, .. }
            | ToolError::ToolNonZeroExit { log_tail, .. }
            | ToolError::Killed { log_tail, .. } => log_tail,
            _ => &[],
        }
    }
}
