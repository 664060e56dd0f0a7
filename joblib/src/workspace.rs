//! Per-job directories under the output root.
//!
//! ```text
//! <output_root>/<job id>/
//!     job.json                  persisted job record
//!     inputs/                   staged reads and amplicon.fa
//!     logs/attempt-<n>/         <stage>.stdout, <stage>.stderr
//!     qc/ align/ postprocess/ quantify/
//! ```

use std::io;
use std::path::{Path, PathBuf};

use log::{info, warn};
use tokio::fs;

use crate::job::Inputs;
use crate::stage::Stage;
use crate::tool::LogPaths;
use crate::types::JobId;

pub const RECORD_FILE: &str = "job.json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn for_job(output_root: &Path, job_id: JobId) -> Self {
        Self::at(output_root.join(job_id.to_string()))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn record_path(&self) -> PathBuf {
        self.root.join(RECORD_FILE)
    }

    pub fn inputs_dir(&self) -> PathBuf {
        self.root.join("inputs")
    }

    pub fn stage_dir(&self, stage: Stage) -> PathBuf {
        self.root.join(stage.name())
    }

    pub fn logs_dir(&self, attempt: u32) -> PathBuf {
        self.root.join("logs").join(format!("attempt-{attempt}"))
    }

    pub fn log_paths(&self, attempt: u32, stage: Stage) -> LogPaths {
        let dir = self.logs_dir(attempt);
        LogPaths {
            stdout: dir.join(format!("{stage}.stdout")),
            stderr: dir.join(format!("{stage}.stderr")),
        }
    }

    /// Create the directory tree. Fails if the workspace already exists.
    pub(crate) async fn create(output_root: &Path, job_id: JobId) -> io::Result<Self> {
        let workspace = Self::for_job(output_root, job_id);
        info!(
            "Creating workspace for job {} in {}",
            job_id,
            workspace.root.display()
        );
        // create_dir (not create_dir_all) so an existing workspace is never shared
        fs::create_dir(&workspace.root).await?;
        fs::create_dir(workspace.inputs_dir()).await?;
        workspace.prepare_attempt(1).await?;
        Ok(workspace)
    }

    /// Copy the reads in and write the amplicon reference.
    pub(crate) async fn stage_inputs(
        &self,
        r1: &Path,
        r2: Option<&Path>,
        amplicon: &str,
    ) -> io::Result<Inputs> {
        let staged_r1 = self.copy_read(r1, "R1").await?;
        let staged_r2 = match r2 {
            Some(r2) => Some(self.copy_read(r2, "R2").await?),
            None => None,
        };
        let amplicon_path = self.inputs_dir().join("amplicon.fa");
        fs::write(&amplicon_path, format!(">amplicon\n{amplicon}\n")).await?;

        Ok(Inputs {
            r1: staged_r1,
            r2: staged_r2,
            amplicon: amplicon_path,
            sources: std::iter::once(r1.to_path_buf())
                .chain(r2.map(Path::to_path_buf))
                .collect(),
        })
    }

    async fn copy_read(&self, source: &Path, mate: &str) -> io::Result<PathBuf> {
        let extension = crate::definition::fastq_extension(source).unwrap_or(".fastq");
        let dest = self.inputs_dir().join(format!("{mate}{extension}"));
        let bytes = fs::copy(source, &dest).await?;
        info!("Staged {} ({bytes} bytes) as {}", source.display(), dest.display());
        Ok(dest)
    }

    /// Make empty stage directories and the log directory for an attempt.
    ///
    /// Artifacts of a previous attempt are removed; inputs and older logs are left alone.
    pub(crate) async fn prepare_attempt(&self, attempt: u32) -> io::Result<()> {
        for stage in Stage::ALL {
            let dir = self.stage_dir(stage);
            match fs::remove_dir_all(&dir).await {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err),
            }
            fs::create_dir_all(&dir).await?;
        }
        fs::create_dir_all(self.logs_dir(attempt)).await
    }

    pub(crate) async fn remove(&self) -> io::Result<()> {
        info!("Removing workspace {}", self.root.display());
        match fs::remove_dir_all(&self.root).await {
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                warn!("Workspace {} already gone", self.root.display());
                Ok(())
            }
            other => other,
        }
    }
}
