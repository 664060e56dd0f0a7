//! Editing metrics read back from a finished quantifier report.
//!
//! The quantifier writes a directory of tab separated tables. Three of them are summarised:
//!
//! ```text
//! CRISPResso_mapping_statistics.txt                     reads in input, aligned, ...
//! CRISPResso_quantification_of_editing_frequency.txt    unmodified / modified reads per amplicon
//! Frameshift_analysis.txt                               only written when a coding sequence is given
//! ```
//!
//! Percentages are relative to the aligned reads.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;

use crate::discovery::SampleMetadata;
use crate::events::JobStatus;
use crate::job::Job;
use crate::types::JobId;

pub const MAPPING_STATISTICS: &str = "CRISPResso_mapping_statistics.txt";
pub const EDITING_FREQUENCY: &str = "CRISPResso_quantification_of_editing_frequency.txt";
pub const FRAMESHIFT_ANALYSIS: &str = "Frameshift_analysis.txt";

const REPORT_PREFIX: &str = "CRISPResso_on_";

static FRAMESHIFT_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^\s*(?P<kind>Noncoding|In-frame|Frameshift) mutation:\s*(?P<reads>\d+) reads")
        .expect("frameshift pattern")
});

#[derive(Error, Debug)]
pub enum ResultsError {
    #[error("no quantifier report under {0}")]
    NoReport(PathBuf),
    #[error("can't read {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("{file}: {detail}")]
    Malformed { file: &'static str, detail: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameshiftSummary {
    pub noncoding_reads: u64,
    pub inframe_reads: u64,
    pub frameshift_reads: u64,
    pub inframe_percent: f64,
    pub frameshift_percent: f64,
}

/// Key numbers of one sample's editing outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditingSummary {
    pub total_reads: u64,
    pub unmodified_reads: u64,
    pub modified_reads: u64,
    pub unmodified_percent: f64,
    pub indel_percent: f64,
    pub frameshift: Option<FrameshiftSummary>,
    /// The quantifier's HTML report, when it wrote one
    pub report_html: Option<PathBuf>,
}

/// Read the metrics of the report at `report`.
///
/// `report` is the quantifier's output directory, or a directory directly above it.
pub async fn summarize(report: &Path) -> Result<EditingSummary, ResultsError> {
    let dir = locate(report).await?;
    let mapping = read(&dir, MAPPING_STATISTICS).await?;
    let editing = read(&dir, EDITING_FREQUENCY).await?;
    let frameshift = match fs::read_to_string(dir.join(FRAMESHIFT_ANALYSIS)).await {
        Ok(text) => Some(text),
        Err(err) if err.kind() == io::ErrorKind::NotFound => None,
        Err(source) => {
            return Err(ResultsError::Io {
                path: dir.join(FRAMESHIFT_ANALYSIS),
                source,
            })
        }
    };

    let total_reads = aligned_reads(&mapping)?;
    let (unmodified_reads, modified_reads) = modification_counts(&editing)?;
    let frameshift = frameshift
        .map(|text| frameshift_counts(&text, total_reads))
        .transpose()?;

    Ok(EditingSummary {
        total_reads,
        unmodified_reads,
        modified_reads,
        unmodified_percent: percent(unmodified_reads, total_reads),
        indel_percent: percent(modified_reads, total_reads),
        frameshift,
        report_html: report_html(&dir).await,
    })
}

/// The directory holding the tables: `report` itself or one of its subdirectories.
async fn locate(report: &Path) -> Result<PathBuf, ResultsError> {
    if fs::metadata(report.join(MAPPING_STATISTICS)).await.is_ok() {
        return Ok(report.to_path_buf());
    }
    let io_err = |source| ResultsError::Io {
        path: report.to_path_buf(),
        source,
    };
    let mut entries = fs::read_dir(report).await.map_err(io_err)?;
    let mut candidates = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
        let path = entry.path();
        if fs::metadata(path.join(MAPPING_STATISTICS)).await.is_ok() {
            candidates.push(path);
        }
    }
    candidates.sort();
    candidates
        .into_iter()
        .next()
        .ok_or_else(|| ResultsError::NoReport(report.to_path_buf()))
}

async fn read(dir: &Path, file: &'static str) -> Result<String, ResultsError> {
    let path = dir.join(file);
    fs::read_to_string(&path)
        .await
        .map_err(|source| ResultsError::Io { path, source })
}

/// `CRISPResso_on_<name>.html` next to the report directory, or inside it.
async fn report_html(dir: &Path) -> Option<PathBuf> {
    let name = dir.file_name()?.to_str()?;
    if name.starts_with(REPORT_PREFIX) {
        let sibling = dir.with_file_name(format!("{name}.html"));
        if fs::metadata(&sibling).await.is_ok() {
            return Some(sibling);
        }
    }
    let mut entries = fs::read_dir(dir).await.ok()?;
    let mut pages = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        let file_name = entry.file_name().to_string_lossy().into_owned();
        if file_name.starts_with(REPORT_PREFIX) && file_name.ends_with(".html") {
            pages.push(entry.path());
        }
    }
    pages.sort();
    pages.into_iter().next()
}

/// Rows of a tab separated table with a header line, keyed by column name.
fn table(text: &str, file: &'static str) -> Result<Vec<BTreeMap<String, String>>, ResultsError> {
    let mut lines = text.lines().filter(|line| !line.trim().is_empty());
    let header: Vec<&str> = match lines.next() {
        Some(line) => line.split('\t').map(str::trim).collect(),
        None => {
            return Err(ResultsError::Malformed {
                file,
                detail: "empty table".into(),
            })
        }
    };
    let rows: Vec<BTreeMap<String, String>> = lines
        .map(|line| {
            header
                .iter()
                .zip(line.split('\t'))
                .map(|(column, value)| (column.to_string(), value.trim().to_string()))
                .collect()
        })
        .collect();
    if rows.is_empty() {
        return Err(ResultsError::Malformed {
            file,
            detail: "no data rows".into(),
        });
    }
    Ok(rows)
}

fn count(
    row: &BTreeMap<String, String>,
    column: &str,
    file: &'static str,
) -> Result<u64, ResultsError> {
    let value = row.get(column).ok_or_else(|| ResultsError::Malformed {
        file,
        detail: format!("missing column {column}"),
    })?;
    // counts are sometimes written as floats
    value
        .parse::<u64>()
        .or_else(|_| value.parse::<f64>().map(|float| float.round() as u64))
        .map_err(|_| ResultsError::Malformed {
            file,
            detail: format!("{column} is not a number: {value:?}"),
        })
}

fn aligned_reads(text: &str) -> Result<u64, ResultsError> {
    let rows = table(text, MAPPING_STATISTICS)?;
    count(&rows[0], "READS ALIGNED", MAPPING_STATISTICS)
}

/// Unmodified and modified reads summed over every amplicon.
fn modification_counts(text: &str) -> Result<(u64, u64), ResultsError> {
    let mut unmodified = 0;
    let mut modified = 0;
    for row in table(text, EDITING_FREQUENCY)? {
        unmodified += count(&row, "Unmodified", EDITING_FREQUENCY)?;
        modified += count(&row, "Modified", EDITING_FREQUENCY)?;
    }
    Ok((unmodified, modified))
}

fn frameshift_counts(text: &str, total_reads: u64) -> Result<FrameshiftSummary, ResultsError> {
    let mut counts = BTreeMap::new();
    for captures in FRAMESHIFT_LINE.captures_iter(text) {
        let reads = captures["reads"].parse::<u64>().unwrap_or_default();
        counts.insert(captures["kind"].to_string(), reads);
    }
    let get = |kind: &str| {
        counts
            .get(kind)
            .copied()
            .ok_or_else(|| ResultsError::Malformed {
                file: FRAMESHIFT_ANALYSIS,
                detail: format!("no {kind} mutation line"),
            })
    };
    let inframe_reads = get("In-frame")?;
    let frameshift_reads = get("Frameshift")?;
    Ok(FrameshiftSummary {
        noncoding_reads: get("Noncoding")?,
        inframe_reads,
        frameshift_reads,
        inframe_percent: percent(inframe_reads, total_reads),
        frameshift_percent: percent(frameshift_reads, total_reads),
    })
}

fn percent(reads: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let value = reads as f64 * 100.0 / total as f64;
    (value * 100.0).round() / 100.0
}

/// One line of the per-replicate results table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultRow {
    pub replicate: String,
    pub treatment: String,
    pub sample: String,
    pub job_id: JobId,
    pub summary: EditingSummary,
}

/// Results of the succeeded jobs, grouped by replicate and ordered by treatment.
///
/// Samples without time-course metadata are grouped under `Replica-unknown`.
pub fn result_rows(jobs: &[Job]) -> Vec<ResultRow> {
    let mut rows: Vec<ResultRow> = jobs
        .iter()
        .filter(|job| job.status == JobStatus::Succeeded)
        .filter_map(|job| {
            let summary = job.results.clone()?;
            let SampleMetadata {
                replicate,
                treatment,
            } = job.metadata.clone().unwrap_or_else(|| SampleMetadata {
                replicate: "Replica-unknown".into(),
                treatment: job.name.clone(),
            });
            Some(ResultRow {
                replicate,
                treatment,
                sample: job.name.clone(),
                job_id: job.id,
                summary,
            })
        })
        .collect();
    rows.sort_by(|a, b| {
        (&a.replicate, &a.treatment, &a.sample).cmp(&(&b.replicate, &b.treatment, &b.sample))
    });
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::tests::sample_job;

    const MAPPING: &str = "READS IN INPUTS\tREADS AFTER PREPROCESSING\tREADS ALIGNED\tN_COMPUTED_ALN\tN_CACHED_ALN\tN_COMPUTED_NOTALN\tN_CACHED_NOTALN\n\
        1000\t990\t800\t700\t100\t150\t40\n";
    const EDITING: &str = "Amplicon\tUnmodified%\tModified%\tReads_in_input\tReads_aligned_all_amplicons\tReads_aligned\tUnmodified\tModified\tDiscarded\n\
        Reference\t75.0\t25.0\t1000\t800\t800\t600\t200\t0\n";
    const FRAMESHIFT: &str = "Frameshift analysis:\n\
        \tNoncoding mutation:10 reads\n\
        \tIn-frame mutation:40 reads\n\
        \tFrameshift mutation:150 reads\n";

    /// Write a quantifier report for `name` under `dir`, returning the report directory.
    fn write_report(dir: &Path, name: &str, frameshift: bool) -> PathBuf {
        let report = dir.join(format!("{REPORT_PREFIX}{name}"));
        std::fs::create_dir_all(&report).unwrap();
        std::fs::write(report.join(MAPPING_STATISTICS), MAPPING).unwrap();
        std::fs::write(report.join(EDITING_FREQUENCY), EDITING).unwrap();
        if frameshift {
            std::fs::write(report.join(FRAMESHIFT_ANALYSIS), FRAMESHIFT).unwrap();
        }
        std::fs::write(dir.join(format!("{REPORT_PREFIX}{name}.html")), "<html/>").unwrap();
        report
    }

    #[tokio::test]
    async fn summarizes_a_report() {
        let dir = tempfile::tempdir().unwrap();
        let report = write_report(dir.path(), "S1", true);

        let summary = summarize(&report).await.unwrap();
        assert_eq!(summary.total_reads, 800);
        assert_eq!(summary.unmodified_reads, 600);
        assert_eq!(summary.modified_reads, 200);
        assert_eq!(summary.unmodified_percent, 75.0);
        assert_eq!(summary.indel_percent, 25.0);
        let frameshift = summary.frameshift.unwrap();
        assert_eq!(frameshift.frameshift_reads, 150);
        assert_eq!(frameshift.inframe_reads, 40);
        assert_eq!(frameshift.frameshift_percent, 18.75);
        assert_eq!(frameshift.inframe_percent, 5.0);
        assert_eq!(summary.report_html, Some(dir.path().join("CRISPResso_on_S1.html")));
    }

    #[tokio::test]
    async fn finds_the_report_below_the_stage_directory() {
        let dir = tempfile::tempdir().unwrap();
        write_report(dir.path(), "S1", false);

        let summary = summarize(dir.path()).await.unwrap();
        assert_eq!(summary.total_reads, 800);
        assert_eq!(summary.frameshift, None);
    }

    #[tokio::test]
    async fn missing_tables_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let report = dir.path().join("CRISPResso_on_S1");
        std::fs::create_dir_all(&report).unwrap();
        assert!(matches!(
            summarize(&report).await.unwrap_err(),
            ResultsError::NoReport(_)
        ));

        std::fs::write(report.join(MAPPING_STATISTICS), MAPPING).unwrap();
        assert!(matches!(
            summarize(&report).await.unwrap_err(),
            ResultsError::Io { .. }
        ));
    }

    #[test]
    fn malformed_tables() {
        assert!(aligned_reads("").is_err());
        assert!(aligned_reads("READS IN INPUTS\n1000\n").is_err());
        assert!(modification_counts("Amplicon\tUnmodified\tModified\nReference\tmany\t1\n").is_err());
        assert!(frameshift_counts("Frameshift analysis:\n\tIn-frame mutation:1 reads\n", 10).is_err());
        assert_eq!(percent(1, 0), 0.0);
        assert_eq!(percent(1, 3), 33.33);
    }

    #[test]
    fn rows_are_grouped_by_replicate() {
        let summary = EditingSummary {
            total_reads: 10,
            unmodified_reads: 5,
            modified_reads: 5,
            unmodified_percent: 50.0,
            indel_percent: 50.0,
            frameshift: None,
            report_html: None,
        };
        let job = |name: &str, replicate: &str, treatment: &str| {
            let mut job = sample_job();
            job.id = uuid::Uuid::new_v4();
            job.name = name.into();
            job.status = JobStatus::Succeeded;
            job.metadata = Some(SampleMetadata {
                replicate: replicate.into(),
                treatment: treatment.into(),
            });
            job.results = Some(summary.clone());
            job
        };
        let mut failed = job("F", "Replica-1", "Day1_dox");
        failed.status = JobStatus::Failed;
        let mut plain = job("plain", "", "");
        plain.metadata = None;

        let jobs = vec![
            job("b", "Replica-2", "Day1_dox"),
            job("c", "Replica-1", "Day3_dox"),
            failed,
            plain,
            job("a", "Replica-1", "Day1_dox"),
        ];
        let order: Vec<(String, String)> = result_rows(&jobs)
            .into_iter()
            .map(|row| (row.replicate, row.sample))
            .collect();
        assert_eq!(
            order,
            vec![
                ("Replica-1".to_string(), "a".to_string()),
                ("Replica-1".to_string(), "c".to_string()),
                ("Replica-2".to_string(), "b".to_string()),
                ("Replica-unknown".to_string(), "plain".to_string()),
            ]
        );
    }
}
