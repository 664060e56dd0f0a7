//! Find paired-end FASTQ files under a directory.
//!
//! Files are paired by directory and base name: `S1_R1.fastq.gz` goes with `S1_R2.fastq.gz`,
//! `S1_1.fq.gz` with `S1_2.fq.gz`, and a trailing run chunk (`S1_R1_001.fastq.gz`) is ignored.
//!
//! Read files named after the time-course layout, `Day<d>_[<line>_]<variant>_<treatment>_<rep>`,
//! also carry the replicate and treatment the sample belongs to.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use log::{debug, info};
use once_cell::sync::Lazy;
use regex::Regex;

use serde::{Deserialize, Serialize};

use crate::job::{AnalysisParams, JobRequest};

static READ_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(?P<base>.+?)_R?(?P<read>[12])(?:[_-]?\d+)?\.(?:fastq|fq)(?:\.gz)?$")
        .expect("read name pattern")
});

static TIME_COURSE_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^Day(?P<day>\d+)_(?:(?P<line>[^_]+)_)?(?P<variant>[^_]+)_(?P<treat>[^_]+)_(?P<rep>\d+)(?P<rerun>_rerun)?.*\.fastq(?:\.gz)?$",
    )
    .expect("time course pattern")
});

/// Where a sample sits in the experiment.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SampleMetadata {
    /// `Replica-<n>`
    pub replicate: String,
    /// `Day<d>_<treatment>`, with a `_rerun` suffix for sequencing reruns
    pub treatment: String,
}

/// Replicate and treatment encoded in a read file name, if it follows the time-course layout.
pub fn sample_metadata(path: &Path) -> Option<SampleMetadata> {
    let file_name = path.file_name()?.to_str()?;
    let captures = TIME_COURSE_NAME.captures(file_name)?;
    let mut treatment = format!(
        "Day{}_{}",
        &captures["day"],
        captures["treat"].to_lowercase()
    );
    if captures.name("rerun").is_some() {
        treatment.push_str("_rerun");
    }
    Some(SampleMetadata {
        replicate: format!("Replica-{}", &captures["rep"]),
        treatment,
    })
}

/// One sample: a forward read file and, for paired-end data, its mate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SamplePair {
    pub name: String,
    pub r1: PathBuf,
    pub r2: Option<PathBuf>,
}

impl SamplePair {
    pub fn into_request(self, params: AnalysisParams) -> JobRequest {
        let request = JobRequest::new(self.r1, params).with_name(self.name);
        match self.r2 {
            Some(r2) => request.with_r2(r2),
            None => request,
        }
    }
}

/// Sample name for a read file: the base name without mate marker and extension.
pub fn sample_name(path: &Path) -> String {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    if let Some(captures) = READ_NAME.captures(&file_name) {
        return captures["base"].to_string();
    }
    let lower = file_name.to_ascii_lowercase();
    [".fastq.gz", ".fq.gz", ".fastq", ".fq"]
        .into_iter()
        .find(|extension| lower.ends_with(extension))
        .map(|extension| file_name[..file_name.len() - extension.len()].to_string())
        .unwrap_or(file_name)
}

/// Recursively pair the FASTQ files under `root`.
///
/// Files that don't look like R1/R2 reads are skipped. For a repeated key the first file in
/// path order wins. Samples without an R2 file are returned as single-end.
pub fn pair_fastqs(root: &Path) -> io::Result<Vec<SamplePair>> {
    let mut files = Vec::new();
    collect_files(root, &mut files)?;
    files.sort();

    let mut r1s: BTreeMap<(PathBuf, String), PathBuf> = BTreeMap::new();
    let mut r2s: BTreeMap<(PathBuf, String), PathBuf> = BTreeMap::new();
    for path in files {
        let file_name = match path.file_name().and_then(|name| name.to_str()) {
            Some(name) => name.to_string(),
            None => continue,
        };
        let Some(captures) = READ_NAME.captures(&file_name) else {
            debug!("Skipping {}", path.display());
            continue;
        };
        let dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        let key = (dir, captures["base"].to_string());
        let reads = if &captures["read"] == "1" {
            &mut r1s
        } else {
            &mut r2s
        };
        reads.entry(key).or_insert(path);
    }

    let pairs: Vec<SamplePair> = r1s
        .into_iter()
        .map(|(key, r1)| SamplePair {
            r2: r2s.remove(&key),
            name: key.1,
            r1,
        })
        .collect();
    info!("Found {} samples under {}", pairs.len(), root.display());
    Ok(pairs)
}

fn collect_files(dir: &Path, files: &mut Vec<PathBuf>) -> io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        // file_type doesn't follow symlinks, so a linked directory is never entered
        if entry.file_type()?.is_dir() {
            collect_files(&path, files)?;
        } else {
            files.push(path);
        }
    }
    Ok(())
}
