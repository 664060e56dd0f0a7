use std::path::{Path, PathBuf};
use std::time::Duration;

use editjobs::{
    result_rows, AnalysisParams, JobError, JobFilter, JobRequest, JobStatus, Orchestrator,
    OrchestratorConfig, Stage, StageStatus, StageTimeouts, Tool, ToolCommand, ToolCommands,
};
use tempfile::TempDir;

/// Scratch space for one test: input reads, fake tools and the output root.
struct Fixture {
    dir: TempDir,
}

impl Fixture {
    fn new() -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let fixture = Self {
            dir: tempfile::tempdir().unwrap(),
        };
        std::fs::create_dir_all(fixture.path("reads")).unwrap();
        fixture
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn output_root(&self) -> PathBuf {
        self.path("outputs")
    }

    /// Job workspaces under the output root.
    fn workspaces(&self) -> usize {
        std::fs::read_dir(self.output_root())
            .unwrap()
            .filter(|entry| entry.as_ref().unwrap().file_type().unwrap().is_dir())
            .count()
    }

    /// Every tool invocation appends `<tool> <workdir> <args>` here.
    fn invocations(&self) -> Vec<String> {
        std::fs::read_to_string(self.path("invocations.log"))
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    fn invocations_in(&self, workspace: &Path) -> Vec<String> {
        let marker = format!(" {} ", workspace.display());
        self.invocations()
            .into_iter()
            .filter(|line| line.contains(&marker))
            .collect()
    }

    /// Tools backed by one shell script. It records the call, runs `behaviour` and then creates
    /// the outputs a real tool would.
    fn tools(&self, behaviour: &str) -> ToolCommands {
        let script = self.path("fake-tool.sh");
        let contents = format!(
            r#"tool="$1"
shift
echo "$tool $PWD $*" >> "{log}"
out=""
name=""
while [ $# -gt 0 ]; do
  case "$1" in
    -o) out="$2"; shift ;;
    --name) name="$2"; shift ;;
  esac
  shift
done
{behaviour}
echo "$tool finished"
echo "$tool progress" >&2
case "$tool" in
  fastqc) touch "$out/R1_fastqc.html" ;;
  crispresso) mkdir -p "$out/CRISPResso_on_$name" ;;
  *) touch "$out" ;;
esac
"#,
            log = self.path("invocations.log").display(),
        );
        std::fs::write(&script, contents).unwrap();

        let mut tools = ToolCommands::default();
        for tool in Tool::ALL {
            let command = ToolCommand::new("/bin/sh")
                .with_args([script.to_string_lossy().into_owned(), tool.id().to_string()]);
            tools.set(tool, command);
        }
        tools
    }

    fn config(
        &self,
        tools: ToolCommands,
        workers: usize,
        queue_capacity: usize,
    ) -> OrchestratorConfig {
        OrchestratorConfig {
            output_root: self.output_root(),
            workers,
            queue_capacity,
            log_tail_lines: 10,
            tools,
            ..OrchestratorConfig::default()
        }
    }

    fn request(&self, sample: &str) -> JobRequest {
        let r1 = self.path(&format!("reads/{sample}_R1.fastq"));
        let r2 = self.path(&format!("reads/{sample}_R2.fastq"));
        std::fs::write(&r1, b"@read1\nACGTACGTAC\n+\nIIIIIIIIII\n").unwrap();
        std::fs::write(&r2, b"@read1\nGTACGTACGT\n+\nIIIIIIIIII\n").unwrap();
        let params = AnalysisParams {
            amplicon: "ACGTACGTACGTACGTACGT".into(),
            guide: "ACGTACGTAC".into(),
            ..AnalysisParams::default()
        };
        JobRequest::new(r1, params).with_r2(r2)
    }
}

/// Keep the first stage busy until it is killed.
const BLOCK_QC: &str = r#"if [ "$tool" = "fastqc" ]; then exec sleep 30; fi"#;

async fn wait_for_status(orchestrator: &Orchestrator, job_id: uuid::Uuid, status: JobStatus) {
    for _ in 0..200 {
        if orchestrator.get(job_id).await.unwrap().status == status {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("job {job_id} never became {status}");
}

#[tokio::test]
async fn successful_job_runs_every_stage() {
    let fixture = Fixture::new();
    let orchestrator = Orchestrator::start(fixture.config(fixture.tools(""), 2, 4))
        .await
        .unwrap();

    let job = orchestrator.enqueue(fixture.request("S1")).await.unwrap();
    assert_eq!(job.status, JobStatus::Queued);
    let job = orchestrator.wait(job.id).await.unwrap();

    assert_eq!(job.status, JobStatus::Succeeded);
    assert!(job.failure.is_none());
    let stages: Vec<Stage> = job.stages.iter().map(|record| record.stage).collect();
    assert_eq!(stages, Stage::ALL.to_vec());
    for record in &job.stages {
        assert_eq!(record.status, StageStatus::Succeeded);
        assert_eq!(record.exit_code, Some(0));
        assert!(record.stdout.is_file(), "{}", record.stdout.display());
        assert!(record.stderr.is_file(), "{}", record.stderr.display());
    }
    let stdout = std::fs::read_to_string(&job.stages[1].stdout).unwrap();
    assert_eq!(stdout, "minimap2 finished\n");

    let report = job.workspace.join("quantify").join("CRISPResso_on_S1");
    assert_eq!(job.artifacts.get(&Stage::Quantify), Some(&vec![report.clone()]));
    assert!(report.is_dir());

    let record: editjobs::Job =
        serde_json::from_slice(&std::fs::read(job.workspace.join("job.json")).unwrap()).unwrap();
    assert_eq!(record, job);

    orchestrator.shutdown().await.unwrap();
}

#[tokio::test]
async fn aligner_failure_stops_the_pipeline() {
    let fixture = Fixture::new();
    let behaviour =
        r#"if [ "$tool" = "minimap2" ]; then echo "fatal: broken index" >&2; exit 3; fi"#;
    let orchestrator = Orchestrator::start(fixture.config(fixture.tools(behaviour), 1, 4))
        .await
        .unwrap();

    let job = orchestrator.enqueue(fixture.request("S1")).await.unwrap();
    let job = orchestrator.wait(job.id).await.unwrap();

    assert_eq!(job.status, JobStatus::Failed);
    let failure = job.failure.clone().unwrap();
    assert_eq!(failure.stage, Stage::Align);
    assert_eq!(failure.exit_code, Some(3));
    assert!(failure.log_tail.iter().any(|line| line.contains("fatal: broken index")));
    assert_eq!(job.stages.len(), 2);
    assert_eq!(job.stages[1].status, StageStatus::Failed);

    let logs = job.workspace.join("logs").join("attempt-1");
    for stage in [Stage::Postprocess, Stage::Quantify] {
        assert!(!logs.join(format!("{stage}.stdout")).exists());
    }
    let tools: Vec<String> = fixture
        .invocations_in(&job.workspace)
        .iter()
        .map(|line| line.split(' ').next().unwrap().to_string())
        .collect();
    assert_eq!(tools, vec!["fastqc", "minimap2"]);

    orchestrator.shutdown().await.unwrap();
}

#[tokio::test]
async fn full_queue_rejects_and_discards() {
    let fixture = Fixture::new();
    let orchestrator = Orchestrator::start(fixture.config(fixture.tools(BLOCK_QC), 1, 1))
        .await
        .unwrap();

    let running = orchestrator.enqueue(fixture.request("S1")).await.unwrap();
    let waiting = orchestrator.enqueue(fixture.request("S2")).await.unwrap();
    let err = orchestrator.enqueue(fixture.request("S3")).await.unwrap_err();
    assert!(matches!(err, JobError::QueueFull { capacity: 1 }), "{err}");

    let ids: Vec<_> = orchestrator
        .list(JobFilter::default())
        .await
        .unwrap()
        .into_iter()
        .map(|summary| summary.id)
        .collect();
    assert_eq!(ids, vec![running.id, waiting.id]);
    assert_eq!(fixture.workspaces(), 2);

    orchestrator.shutdown().await.unwrap();
}

#[tokio::test]
async fn cancelled_queued_job_never_runs_a_tool() {
    let fixture = Fixture::new();
    let orchestrator = Orchestrator::start(fixture.config(fixture.tools(BLOCK_QC), 1, 4))
        .await
        .unwrap();

    let first = orchestrator.enqueue(fixture.request("S1")).await.unwrap();
    let second = orchestrator.enqueue(fixture.request("S2")).await.unwrap();
    wait_for_status(&orchestrator, first.id, JobStatus::Running).await;

    orchestrator.cancel(second.id).await.unwrap();
    let cancelled = orchestrator.wait(second.id).await.unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);
    assert!(cancelled.stages.is_empty());
    assert!(cancelled.failure.is_none());
    assert!(fixture.invocations_in(&second.workspace).is_empty());

    orchestrator.cancel(first.id).await.unwrap();
    let cancelled = orchestrator.wait(first.id).await.unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);
    assert!(cancelled.failure.is_none());
    assert_eq!(cancelled.stages[0].status, StageStatus::Cancelled);
    assert!(matches!(
        orchestrator.cancel(first.id).await.unwrap_err(),
        JobError::AlreadyTerminal(_)
    ));

    orchestrator.shutdown().await.unwrap();
}

#[tokio::test]
async fn concurrency_never_exceeds_the_worker_count() {
    let fixture = Fixture::new();
    let active = fixture.path("active");
    let peaks = fixture.path("peaks.log");
    std::fs::create_dir_all(&active).unwrap();
    let behaviour = format!(
        "mkdir \"{active}/$$\"\nls \"{active}\" | wc -l >> \"{peaks}\"\nsleep 0.1\nrmdir \"{active}/$$\"",
        active = active.display(),
        peaks = peaks.display(),
    );
    let orchestrator = Orchestrator::start(fixture.config(fixture.tools(&behaviour), 2, 16))
        .await
        .unwrap();

    let mut jobs = Vec::new();
    for sample in ["A", "B", "C", "D", "E", "F"] {
        jobs.push(orchestrator.enqueue(fixture.request(sample)).await.unwrap());
    }
    for job in &jobs {
        let job = orchestrator.wait(job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Succeeded);
    }

    let peak = std::fs::read_to_string(&peaks)
        .unwrap()
        .lines()
        .map(|line| line.trim().parse::<usize>().unwrap())
        .max()
        .unwrap();
    assert!(peak <= 2, "{peak} tools ran at once");

    orchestrator.shutdown().await.unwrap();
}

#[tokio::test]
async fn jobs_start_in_submission_order() {
    let fixture = Fixture::new();
    let orchestrator = Orchestrator::start(fixture.config(fixture.tools(""), 1, 8))
        .await
        .unwrap();

    let mut jobs = Vec::new();
    for sample in ["A", "B", "C", "D"] {
        jobs.push(orchestrator.enqueue(fixture.request(sample)).await.unwrap());
    }
    for job in &jobs {
        orchestrator.wait(job.id).await.unwrap();
    }

    let started: Vec<String> = fixture
        .invocations()
        .into_iter()
        .filter(|line| line.starts_with("fastqc "))
        .map(|line| line.split(' ').nth(1).unwrap().to_string())
        .collect();
    let expected: Vec<String> = jobs
        .iter()
        .map(|job| job.workspace.display().to_string())
        .collect();
    assert_eq!(started, expected);

    orchestrator.shutdown().await.unwrap();
}

#[tokio::test]
async fn rerun_replays_the_same_commands() {
    let fixture = Fixture::new();
    let orchestrator = Orchestrator::start(fixture.config(fixture.tools(""), 1, 4))
        .await
        .unwrap();

    let job = orchestrator.enqueue(fixture.request("S1")).await.unwrap();
    let first = orchestrator.wait(job.id).await.unwrap();
    let r1_before = std::fs::read(&first.inputs.r1).unwrap();

    let queued = orchestrator.rerun(job.id).await.unwrap();
    assert_eq!(queued.attempt, 2);
    let second = orchestrator.wait(job.id).await.unwrap();

    assert_eq!(second.status, JobStatus::Succeeded);
    assert_eq!(second.history.len(), 1);
    assert_eq!(second.history[0].status, JobStatus::Succeeded);
    assert_eq!(second.history[0].stages, first.stages);
    assert_eq!(std::fs::read(&second.inputs.r1).unwrap(), r1_before);
    assert!(second.stages[0]
        .stdout
        .starts_with(job.workspace.join("logs").join("attempt-2")));

    let calls = fixture.invocations_in(&job.workspace);
    assert_eq!(calls.len(), 8);
    assert_eq!(calls[..4], calls[4..]);

    orchestrator.shutdown().await.unwrap();
}

#[tokio::test]
async fn cleanup_refuses_active_jobs() {
    let fixture = Fixture::new();
    let orchestrator = Orchestrator::start(fixture.config(fixture.tools(BLOCK_QC), 1, 4))
        .await
        .unwrap();

    let job = orchestrator.enqueue(fixture.request("S1")).await.unwrap();
    wait_for_status(&orchestrator, job.id, JobStatus::Running).await;
    assert!(matches!(
        orchestrator.cleanup(job.id).await.unwrap_err(),
        JobError::JobNotTerminal(_)
    ));
    assert!(matches!(
        orchestrator.rerun(job.id).await.unwrap_err(),
        JobError::JobNotTerminal(_)
    ));
    assert!(job.workspace.is_dir());

    orchestrator.cancel(job.id).await.unwrap();
    orchestrator.wait(job.id).await.unwrap();
    orchestrator.cleanup(job.id).await.unwrap();
    assert!(!job.workspace.exists());
    assert!(matches!(
        orchestrator.get(job.id).await.unwrap_err(),
        JobError::NotFound(_)
    ));

    orchestrator.shutdown().await.unwrap();
}

#[tokio::test]
async fn stage_timeout_fails_the_job() {
    let fixture = Fixture::new();
    let mut config = fixture.config(fixture.tools(BLOCK_QC), 1, 4);
    config.timeouts = StageTimeouts {
        qc: Some(1),
        ..StageTimeouts::default()
    };
    let orchestrator = Orchestrator::start(config).await.unwrap();

    let job = orchestrator.enqueue(fixture.request("S1")).await.unwrap();
    let job = orchestrator.wait(job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    let failure = job.failure.unwrap();
    assert_eq!(failure.stage, Stage::Qc);
    assert_eq!(failure.exit_code, None);
    assert!(failure.message.contains("timed out"), "{}", failure.message);

    orchestrator.shutdown().await.unwrap();
}

#[tokio::test]
async fn invalid_request_leaves_nothing_behind() {
    let fixture = Fixture::new();
    let orchestrator = Orchestrator::start(fixture.config(fixture.tools(""), 1, 4))
        .await
        .unwrap();

    let missing = fixture.path("reads/missing_R1.fastq");
    let request = JobRequest::new(missing, AnalysisParams::default());
    let err = orchestrator.enqueue(request).await.unwrap_err();
    assert!(matches!(err, JobError::InvalidInput(_)), "{err}");
    assert_eq!(fixture.workspaces(), 0);
    assert!(orchestrator.list(JobFilter::default()).await.unwrap().is_empty());

    orchestrator.shutdown().await.unwrap();
}

#[tokio::test]
async fn logs_are_replayed_after_the_job_ends() {
    let fixture = Fixture::new();
    let orchestrator = Orchestrator::start(fixture.config(fixture.tools(""), 1, 4))
        .await
        .unwrap();

    let job = orchestrator.enqueue(fixture.request("S1")).await.unwrap();
    orchestrator.wait(job.id).await.unwrap();

    let mut logs = orchestrator.stream_logs(job.id).await.unwrap();
    let mut stdout = String::new();
    while let Some(chunk) = logs.recv().await {
        if let editjobs::Output::Stdout(blob) = &chunk.output {
            stdout.push_str(&String::from_utf8_lossy(blob));
        }
    }
    assert_eq!(
        stdout,
        "fastqc finished\nminimap2 finished\nsamtools finished\ncrispresso finished\n"
    );

    orchestrator.shutdown().await.unwrap();
}

#[tokio::test]
async fn restart_marks_unfinished_jobs_interrupted() {
    let fixture = Fixture::new();
    let orchestrator = Orchestrator::start(fixture.config(fixture.tools(""), 1, 4))
        .await
        .unwrap();
    let finished = orchestrator.enqueue(fixture.request("S1")).await.unwrap();
    orchestrator.wait(finished.id).await.unwrap();
    // recorded as queued, never handed to the scheduler
    let pending = orchestrator.create_job(fixture.request("S2")).await.unwrap();
    orchestrator.shutdown().await.unwrap();

    let orchestrator = Orchestrator::start(fixture.config(fixture.tools(""), 1, 4))
        .await
        .unwrap();
    let summaries = orchestrator.list(JobFilter::default()).await.unwrap();
    assert_eq!(summaries.len(), 2);
    assert_eq!(
        orchestrator.get(finished.id).await.unwrap().status,
        JobStatus::Succeeded
    );
    let interrupted = orchestrator.get(pending.id).await.unwrap();
    assert_eq!(interrupted.status, JobStatus::Failed);
    assert!(interrupted.failure.unwrap().message.contains("interrupted"));

    orchestrator.rerun(pending.id).await.unwrap();
    let job = orchestrator.wait(pending.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Succeeded);

    let expired = orchestrator.expire(chrono::Duration::zero()).await.unwrap();
    assert_eq!(expired.len(), 2);
    assert_eq!(fixture.workspaces(), 0);

    orchestrator.shutdown().await.unwrap();
}

#[tokio::test]
async fn output_root_has_a_single_owner() {
    let fixture = Fixture::new();
    let first = Orchestrator::start(fixture.config(fixture.tools(BLOCK_QC), 1, 4))
        .await
        .unwrap();
    let job = first.enqueue(fixture.request("S1")).await.unwrap();
    wait_for_status(&first, job.id, JobStatus::Running).await;

    let err = Orchestrator::start(fixture.config(fixture.tools(""), 1, 4))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, JobError::OutputRootLocked(_)), "{err}");
    assert_eq!(first.get(job.id).await.unwrap().status, JobStatus::Running);
    assert!(job.workspace.is_dir());

    first.cancel(job.id).await.unwrap();
    first.wait(job.id).await.unwrap();
    first.shutdown().await.unwrap();

    let second = Orchestrator::start(fixture.config(fixture.tools(""), 1, 4))
        .await
        .unwrap();
    assert_eq!(
        second.get(job.id).await.unwrap().status,
        JobStatus::Cancelled
    );
    second.shutdown().await.unwrap();
}

#[tokio::test]
async fn concurrent_reruns_start_one_attempt() {
    let fixture = Fixture::new();
    let orchestrator = Orchestrator::start(fixture.config(fixture.tools(""), 1, 4))
        .await
        .unwrap();
    let job = orchestrator.enqueue(fixture.request("S1")).await.unwrap();
    orchestrator.wait(job.id).await.unwrap();

    let (a, b) = tokio::join!(orchestrator.rerun(job.id), orchestrator.rerun(job.id));
    let refused = [&a, &b]
        .into_iter()
        .filter(|result| matches!(result, Err(JobError::JobNotTerminal(_))))
        .count();
    assert!(a.is_ok() || b.is_ok());
    assert_eq!(refused, 1);

    let job = orchestrator.wait(job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Succeeded);
    assert_eq!(job.attempt, 2);
    assert_eq!(job.history.len(), 1);
    assert_eq!(fixture.invocations_in(&job.workspace).len(), 8);

    orchestrator.shutdown().await.unwrap();
}

#[tokio::test]
async fn failed_cleanup_keeps_the_record() {
    let fixture = Fixture::new();
    let orchestrator = Orchestrator::start(fixture.config(fixture.tools(""), 1, 4))
        .await
        .unwrap();
    let job = orchestrator.enqueue(fixture.request("S1")).await.unwrap();
    orchestrator.wait(job.id).await.unwrap();

    // a plain file where the workspace directory was can't be removed as a directory
    std::fs::remove_dir_all(&job.workspace).unwrap();
    std::fs::write(&job.workspace, b"not a directory").unwrap();

    let err = orchestrator.cleanup(job.id).await.unwrap_err();
    assert!(matches!(err, JobError::Io(_)), "{err}");
    assert_eq!(
        orchestrator.get(job.id).await.unwrap().status,
        JobStatus::Succeeded
    );
    let listed = orchestrator.list(JobFilter::default()).await.unwrap();
    assert_eq!(listed.len(), 1);

    orchestrator.shutdown().await.unwrap();
}

#[tokio::test]
async fn editing_metrics_are_recorded() {
    let fixture = Fixture::new();
    let behaviour = r#"if [ "$tool" = "crispresso" ]; then
  report="$out/CRISPResso_on_$name"
  mkdir -p "$report"
  printf 'READS IN INPUTS\tREADS AFTER PREPROCESSING\tREADS ALIGNED\n1000\t990\t800\n' > "$report/CRISPResso_mapping_statistics.txt"
  printf 'Amplicon\tUnmodified\tModified\nReference\t600\t200\n' > "$report/CRISPResso_quantification_of_editing_frequency.txt"
  printf 'Frameshift analysis:\n\tNoncoding mutation:0 reads\n\tIn-frame mutation:40 reads\n\tFrameshift mutation:160 reads\n' > "$report/Frameshift_analysis.txt"
  touch "$report.html"
fi"#;
    let orchestrator = Orchestrator::start(fixture.config(fixture.tools(behaviour), 1, 4))
        .await
        .unwrap();

    let job = orchestrator
        .enqueue(fixture.request("Day2_sgA_dox_3"))
        .await
        .unwrap();
    let job = orchestrator.wait(job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Succeeded);

    let metadata = job.metadata.clone().unwrap();
    assert_eq!(metadata.replicate, "Replica-3");
    assert_eq!(metadata.treatment, "Day2_dox");

    let results = job.results.clone().unwrap();
    assert_eq!(results.total_reads, 800);
    assert_eq!(results.unmodified_percent, 75.0);
    assert_eq!(results.indel_percent, 25.0);
    assert_eq!(results.frameshift.as_ref().unwrap().frameshift_percent, 20.0);
    assert_eq!(
        results.report_html,
        Some(
            job.workspace
                .join("quantify")
                .join("CRISPResso_on_Day2_sgA_dox_3.html")
        )
    );

    let rows = result_rows(std::slice::from_ref(&job));
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].replicate, "Replica-3");
    assert_eq!(rows[0].sample, "Day2_sgA_dox_3");

    orchestrator.shutdown().await.unwrap();
}
