//! Turning a [`JobRequest`] into a persisted, queued [`Job`].

use std::collections::BTreeMap;
use std::path::Path;

use chrono::Utc;
use log::{info, warn};

use crate::actors::store::StoreHandle;
use crate::discovery::{self, SampleMetadata};
use crate::errors::{JobError, Result};
use crate::events::JobStatus;
use crate::job::{AnalysisParams, Job, JobRequest};
use crate::stage::Artifacts;
use crate::tool::Tool;
use crate::types::Args;
use crate::workspace::Workspace;

const FASTQ_EXTENSIONS: [&str; 4] = [".fastq.gz", ".fq.gz", ".fastq", ".fq"];

/// The FASTQ extension of `path`, if it has one.
pub fn fastq_extension(path: &Path) -> Option<&'static str> {
    let name = path.file_name()?.to_str()?.to_ascii_lowercase();
    FASTQ_EXTENSIONS
        .into_iter()
        .find(|extension| name.ends_with(extension))
}

/// Strip whitespace and upper-case a pasted sequence.
pub fn clean_sequence(seq: &str) -> String {
    seq.chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_ascii_uppercase()
}

fn is_valid_sequence(seq: &str) -> bool {
    !seq.is_empty() && seq.chars().all(|c| matches!(c, 'A' | 'C' | 'G' | 'T' | 'N'))
}

/// Make a name safe to use as a path component.
fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            'A'..='Z' | 'a'..='z' | '0'..='9' | '.' | '_' | '-' => c,
            _ => '_',
        })
        .collect()
}

/// A request that passed every check.
#[derive(Debug)]
pub(crate) struct ValidRequest {
    pub name: String,
    pub metadata: Option<SampleMetadata>,
    pub request: JobRequest,
    pub params: AnalysisParams,
    pub extra_args: BTreeMap<Tool, Args>,
}

pub(crate) fn validate(request: JobRequest) -> Result<ValidRequest> {
    for read in std::iter::once(&request.r1).chain(request.r2.as_ref()) {
        check_read(read)?;
    }
    if request.r2.as_ref() == Some(&request.r1) {
        return Err(JobError::InvalidInput("R1 and R2 are the same file".into()));
    }

    let mut params = request.params.clone();
    params.amplicon = clean_sequence(&params.amplicon);
    params.guide = clean_sequence(&params.guide);
    params.coding_seq = params
        .coding_seq
        .as_deref()
        .map(clean_sequence)
        .filter(|seq| !seq.is_empty());
    for (label, seq) in [("amplicon", &params.amplicon), ("guide", &params.guide)] {
        if !is_valid_sequence(seq) {
            return Err(JobError::InvalidInput(format!(
                "{label} sequence must be non-empty and contain only A, C, G, T, N"
            )));
        }
    }
    if let Some(coding_seq) = &params.coding_seq {
        if !is_valid_sequence(coding_seq) {
            return Err(JobError::InvalidInput(
                "coding sequence must contain only A, C, G, T, N".into(),
            ));
        }
    }
    if params.threads == 0 {
        return Err(JobError::InvalidInput("threads must be at least 1".into()));
    }

    let extra_args = request
        .extra_args
        .iter()
        .map(|(id, args)| {
            id.parse::<Tool>()
                .map(|tool| (tool, args.clone()))
                .map_err(|err| JobError::InvalidInput(err.to_string()))
        })
        .collect::<Result<BTreeMap<_, _>>>()?;

    let name = match &request.name {
        Some(name) => sanitize_name(name.trim()),
        None => sanitize_name(&discovery::sample_name(&request.r1)),
    };
    if name.is_empty() {
        return Err(JobError::InvalidInput("sample name is empty".into()));
    }
    let metadata = request
        .metadata
        .clone()
        .or_else(|| discovery::sample_metadata(&request.r1));

    Ok(ValidRequest {
        name,
        metadata,
        request,
        params,
        extra_args,
    })
}

fn check_read(path: &Path) -> Result<()> {
    let invalid = |reason: &str| JobError::InvalidInput(format!("{}: {reason}", path.display()));
    if fastq_extension(path).is_none() {
        return Err(invalid("expected a .fastq, .fq, .fastq.gz or .fq.gz file"));
    }
    let metadata = std::fs::metadata(path).map_err(|err| invalid(&err.to_string()))?;
    if !metadata.is_file() {
        return Err(invalid("not a regular file"));
    }
    if metadata.len() == 0 {
        return Err(invalid("file is empty"));
    }
    Ok(())
}

/// Validate the request, create the workspace, stage the inputs and record a queued job.
///
/// On any failure the partially created workspace is removed, so no job exists afterwards.
pub(crate) async fn create_job(
    request: JobRequest,
    output_root: &Path,
    store: &StoreHandle,
) -> Result<Job> {
    let valid = validate(request)?;
    let job_id = uuid::Uuid::new_v4();
    let workspace = Workspace::create(output_root, job_id).await?;

    let staged = async {
        let inputs = workspace
            .stage_inputs(
                &valid.request.r1,
                valid.request.r2.as_deref(),
                &valid.params.amplicon,
            )
            .await?;
        let job = Job {
            id: job_id,
            name: valid.name,
            submitted_at: Utc::now(),
            metadata: valid.metadata,
            workspace: workspace.root().to_path_buf(),
            inputs,
            params: valid.params,
            extra_args: valid.extra_args,
            attempt: 1,
            status: JobStatus::Queued,
            current_stage: None,
            stages: Vec::new(),
            artifacts: Artifacts::new(),
            failure: None,
            finished_at: None,
            results: None,
            history: Vec::new(),
        };
        store.insert(job.clone()).await?;
        Ok::<_, JobError>(job)
    };

    match staged.await {
        Ok(job) => {
            info!("Created job {} for sample {}", job.id, job.name);
            Ok(job)
        }
        Err(err) => {
            warn!("Creating job {job_id} failed: {err}");
            if let Err(remove_err) = workspace.remove().await {
                warn!("Can't remove workspace of {job_id}: {remove_err}");
            }
            Err(err)
        }
    }
}
