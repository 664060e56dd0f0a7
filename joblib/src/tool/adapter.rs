use super::{ExitKind, Tool, ToolError};
use crate::config::ToolCommand;
use crate::events::Output;
use crate::types::{Args, OutputBlob};

use bytes::BytesMut;
use log::{debug, info, warn};
use std::io::SeekFrom;
use std::os::unix::process::ExitStatusExt;
use std::path::{Component, Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::{
    fs::File,
    io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
    process, select,
    sync::mpsc,
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

/// How long to keep draining output after the child was killed.
///
/// Grandchildren can inherit the pipes and keep them open after the child is gone.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Only this much of a log file is scanned when collecting its tail.
const TAIL_WINDOW: u64 = 64 * 1024;

/// Where a tool's captured output is written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogPaths {
    pub stdout: PathBuf,
    pub stderr: PathBuf,
}

/// A single invocation of an external tool.
#[derive(Debug, Clone)]
pub struct ToolRun {
    pub tool: Tool,
    pub command: ToolCommand,
    pub args: Args,
    /// Working directory of the child; log files and outputs must live below it.
    pub workdir: PathBuf,
    pub timeout: Option<Duration>,
    pub logs: LogPaths,
    /// Files that must exist before the tool starts.
    pub inputs: Vec<PathBuf>,
    /// Files the tool must have produced when it exits successfully.
    pub outputs: Vec<PathBuf>,
    pub tail_lines: usize,
}

#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub exit_code: i32,
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
    pub duration: Duration,
}

enum Exit {
    Status(ExitStatus),
    TimedOut(Duration),
    Cancelled,
}

/// Run a tool to completion.
///
/// Output is written to the log files as it arrives and every chunk is also sent on `output_tx`.
/// The child is killed when the timeout elapses or `cancel` fires; whatever it wrote up to that
/// point stays in the log files.
pub async fn run(
    run: &ToolRun,
    output_tx: mpsc::UnboundedSender<Output>,
    cancel: &CancellationToken,
) -> Result<ToolOutput, ToolError> {
    let tool = run.tool;
    let io_err = |source| ToolError::Io { tool, source };

    for path in [&run.logs.stdout, &run.logs.stderr]
        .into_iter()
        .chain(&run.outputs)
    {
        let escapes = path
            .components()
            .any(|component| component == Component::ParentDir);
        if escapes || !path.starts_with(&run.workdir) {
            return Err(io_err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{} is outside of {}", path.display(), run.workdir.display()),
            )));
        }
    }
    if let Some(missing) = run.inputs.iter().find(|path| !path.exists()) {
        return Err(ToolError::MissingArtifact {
            tool,
            path: missing.clone(),
        });
    }

    let stdout_file = File::create(&run.logs.stdout).await.map_err(io_err)?;
    let stderr_file = File::create(&run.logs.stderr).await.map_err(io_err)?;

    let mut command = process::Command::new(&run.command.program);
    command
        .args(&run.command.args)
        .args(&run.args)
        .current_dir(&run.workdir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        // own process group, so a kill reaches everything the tool started
        .process_group(0)
        .kill_on_drop(true);
    debug!("{tool}: {:?}", command);

    let started = Instant::now();
    let mut child = command.spawn().map_err(|err| match err.kind() {
        std::io::ErrorKind::NotFound => ToolError::ToolNotFound {
            tool,
            program: run.command.program.clone(),
        },
        _ => io_err(err),
    })?;
    info!("{tool}: started pid {:?}", child.id());

    let mut pumps = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        pumps.push(tokio::spawn(pump(
            stdout,
            stdout_file,
            output_tx.clone(),
            Output::Stdout,
        )));
    }
    if let Some(stderr) = child.stderr.take() {
        pumps.push(tokio::spawn(pump(
            stderr,
            stderr_file,
            output_tx,
            Output::Stderr,
        )));
    }

    let deadline = async {
        match run.timeout {
            Some(timeout) => tokio::time::sleep(timeout).await,
            None => std::future::pending().await,
        }
    };

    let exit = select! {
        status = child.wait() => Exit::Status(status.map_err(io_err)?),
        _ = deadline => {
            warn!("{tool}: deadline exceeded, killing child");
            kill_group(&mut child).await;
            Exit::TimedOut(run.timeout.unwrap_or_default())
        }
        _ = cancel.cancelled() => {
            info!("{tool}: cancelled, killing child");
            kill_group(&mut child).await;
            Exit::Cancelled
        }
    };
    let duration = started.elapsed();
    let grace = match exit {
        Exit::Status(_) => None,
        _ => Some(DRAIN_GRACE),
    };
    drain(pumps, grace).await;

    match exit {
        Exit::Status(status) => match status.code() {
            Some(code) => match tool.exit_kind(code) {
                ExitKind::Success => {
                    if let Some(missing) = run.outputs.iter().find(|path| !path.exists()) {
                        return Err(ToolError::MissingArtifact {
                            tool,
                            path: missing.clone(),
                        });
                    }
                    info!("{tool}: finished in {:?}", duration);
                    Ok(ToolOutput {
                        exit_code: code,
                        stdout_path: run.logs.stdout.clone(),
                        stderr_path: run.logs.stderr.clone(),
                        duration,
                    })
                }
                ExitKind::NotFound => Err(ToolError::ToolNotFound {
                    tool,
                    program: run.command.program.clone(),
                }),
                ExitKind::Failure => Err(ToolError::ToolNonZeroExit {
                    tool,
                    code,
                    log_tail: log_tail(&run.logs, run.tail_lines).await,
                }),
            },
            None => Err(ToolError::Killed {
                tool,
                signal: status.signal().unwrap_or_default(),
                log_tail: log_tail(&run.logs, run.tail_lines).await,
            }),
        },
        Exit::TimedOut(timeout) => Err(ToolError::ToolTimeout {
            tool,
            timeout,
            log_tail: log_tail(&run.logs, run.tail_lines).await,
        }),
        Exit::Cancelled => Err(ToolError::Cancelled { tool }),
    }
}

/// Kill the child's process group, then reap the child.
async fn kill_group(child: &mut process::Child) {
    // id() is None once the child has been reaped; the group id is the child's pid
    if let Some(pid) = child.id() {
        // SAFETY: killpg has no memory effects, the worst case is a signal to a vanished group
        if unsafe { libc::killpg(pid as libc::pid_t, libc::SIGKILL) } != 0 {
            debug!("killpg {pid}: {}", std::io::Error::last_os_error());
        }
    }
    let _ = child.kill().await;
}

/// Copy a child pipe into its log file, forwarding every chunk.
async fn pump<R>(
    mut reader: R,
    mut file: File,
    output_tx: mpsc::UnboundedSender<Output>,
    wrap: fn(OutputBlob) -> Output,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(4096);
    loop {
        buf.reserve(4096);
        match reader.read_buf(&mut buf).await {
            Ok(n) if n > 0 => {
                // move the bytes out of buf and into a message
                let blob = buf.split().freeze();
                file.write_all(&blob).await?;
                let _ = output_tx.send(wrap(blob));
            }
            Ok(_) => break,
            Err(err) => {
                file.flush().await?;
                return Err(err);
            }
        }
    }
    file.flush().await
}

async fn drain(pumps: Vec<JoinHandle<std::io::Result<()>>>, grace: Option<Duration>) {
    for mut pump in pumps {
        let result = match grace {
            Some(grace) => match tokio::time::timeout(grace, &mut pump).await {
                Ok(result) => result,
                Err(_) => {
                    pump.abort();
                    continue;
                }
            },
            None => pump.await,
        };
        if let Ok(Err(err)) = result {
            warn!("failed to capture tool output: {err}");
        }
    }
}

/// Last lines of stderr, or of stdout when stderr is empty.
pub(crate) async fn log_tail(logs: &LogPaths, lines: usize) -> Vec<String> {
    let stderr = tail_file(&logs.stderr, lines).await;
    if !stderr.is_empty() {
        return stderr;
    }
    tail_file(&logs.stdout, lines).await
}

async fn tail_file(path: &Path, lines: usize) -> Vec<String> {
    let read = async {
        let mut file = File::open(path).await?;
        let len = file.metadata().await?.len();
        file.seek(SeekFrom::Start(len.saturating_sub(TAIL_WINDOW)))
            .await?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes).await?;
        Ok::<_, std::io::Error>(bytes)
    };
    match read.await {
        Ok(bytes) => {
            let text = String::from_utf8_lossy(&bytes);
            let mut tail: Vec<String> = text
                .lines()
                .rev()
                .filter(|line| !line.trim().is_empty())
                .take(lines)
                .map(str::to_string)
                .collect();
            tail.reverse();
            tail
        }
        Err(_) => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn sh(script: &str) -> ToolCommand {
        ToolCommand::new("/bin/sh").with_args(["-c", script, "tool"])
    }

    fn tool_run(dir: &Path, command: ToolCommand) -> ToolRun {
        ToolRun {
            tool: Tool::Samtools,
            command,
            args: vec![],
            workdir: dir.to_path_buf(),
            timeout: None,
            logs: LogPaths {
                stdout: dir.join("out.log"),
                stderr: dir.join("err.log"),
            },
            inputs: vec![],
            outputs: vec![],
            tail_lines: 2,
        }
    }

    #[tokio::test]
    async fn captures_output_to_files_and_channel() {
        let dir = tempfile::tempdir().unwrap();
        let run = tool_run(dir.path(), sh("printf 'hello'; printf 'oops' >&2"));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let output = super::run(&run, tx, &CancellationToken::new())
            .await
            .expect("tool run");
        assert_eq!(output.exit_code, 0);
        assert_eq!(fs::read_to_string(&output.stdout_path).unwrap(), "hello");
        assert_eq!(fs::read_to_string(&output.stderr_path).unwrap(), "oops");

        let mut stdout = vec![];
        while let Some(chunk) = rx.recv().await {
            if let Output::Stdout(blob) = chunk {
                stdout.extend_from_slice(&blob);
            }
        }
        assert_eq!(String::from_utf8_lossy(&stdout), "hello");
    }

    #[tokio::test]
    async fn non_zero_exit_reports_log_tail() {
        let dir = tempfile::tempdir().unwrap();
        let run = tool_run(
            dir.path(),
            sh("echo one >&2; echo two >&2; echo three >&2; exit 3"),
        );
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = super::run(&run, tx, &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            ToolError::ToolNonZeroExit { code, log_tail, .. } => {
                assert_eq!(code, 3);
                assert_eq!(log_tail, vec!["two".to_string(), "three".to_string()]);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_program() {
        let dir = tempfile::tempdir().unwrap();
        let run = tool_run(dir.path(), ToolCommand::new("/nonexistent/samtools"));
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = super::run(&run, tx, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::ToolNotFound { .. }));
    }

    #[tokio::test]
    async fn timeout_kills_the_child_and_keeps_logs() {
        let dir = tempfile::tempdir().unwrap();
        let mut run = tool_run(dir.path(), sh("echo started; exec sleep 30"));
        run.timeout = Some(Duration::from_millis(300));
        let (tx, _rx) = mpsc::unbounded_channel();
        let started = Instant::now();
        let err = super::run(&run, tx, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(10));
        match err {
            ToolError::ToolTimeout { log_tail, .. } => {
                assert_eq!(log_tail, vec!["started".to_string()]);
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(run.logs.stdout.exists());
    }

    #[tokio::test]
    async fn cancellation_kills_the_child() {
        let dir = tempfile::tempdir().unwrap();
        let run = tool_run(dir.path(), sh("exec sleep 30"));
        let (tx, _rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });
        let err = super::run(&run, tx, &cancel).await.unwrap_err();
        assert!(matches!(err, ToolError::Cancelled { .. }));
    }

    #[tokio::test]
    async fn timeout_kills_background_children() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("marker");
        let script = format!("(sleep 1; touch '{}') & wait", marker.display());
        let mut run = tool_run(dir.path(), sh(&script));
        run.timeout = Some(Duration::from_millis(200));
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = super::run(&run, tx, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::ToolTimeout { .. }), "{err:?}");

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists(), "a child of the tool outlived the kill");
    }

    #[tokio::test]
    async fn cancellation_kills_background_children() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("marker");
        let script = format!("(sleep 1; touch '{}') & wait", marker.display());
        let run = tool_run(dir.path(), sh(&script));
        let (tx, _rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });
        let err = super::run(&run, tx, &cancel).await.unwrap_err();
        assert!(matches!(err, ToolError::Cancelled { .. }));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists(), "a child of the tool outlived the kill");
    }

    #[tokio::test]
    async fn paths_may_not_climb_out_of_the_workdir() {
        let dir = tempfile::tempdir().unwrap();
        let mut run = tool_run(dir.path(), sh("true"));
        run.outputs = vec![dir.path().join("..").join("elsewhere")];
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = super::run(&run, tx, &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            ToolError::Io { source, .. } => {
                assert_eq!(source.kind(), std::io::ErrorKind::InvalidInput)
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(!run.logs.stdout.exists());
    }

    #[tokio::test]
    async fn success_without_declared_output_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut run = tool_run(dir.path(), sh("true"));
        run.outputs = vec![dir.path().join("aligned.sam")];
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = super::run(&run, tx, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::MissingArtifact { .. }));
    }
}
