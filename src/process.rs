#![forbid(unsafe_code)]

//! Subprocess execution for heavyweight external tools.
//!
//! stdout and stderr are drained by two tasks while the parent waits for the
//! exit status, so a chatty child can never block on a full pipe. A child that
//! outlives its timeout is stopped through [`KillStage`] escalation, applied
//! to its whole process group on unix.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

const TERMINATE_GRACE: Duration = Duration::from_secs(5);
const KILL_GRACE: Duration = Duration::from_secs(5);
/// How long to wait for the stream readers once the child is gone. Helpers
/// spawned by the child (ffmpeg for yt-dlp) may keep the pipes open.
const READER_GRACE: Duration = Duration::from_secs(2);

/// Escalation steps used to stop a child that exceeded its timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillStage {
    /// Polite request (SIGTERM on unix).
    Terminate,
    /// Forced kill.
    Kill,
    /// Stop waiting; the child may linger.
    Abandon,
}

impl KillStage {
    pub fn next(self) -> Option<Self> {
        match self {
            KillStage::Terminate => Some(KillStage::Kill),
            KillStage::Kill => Some(KillStage::Abandon),
            KillStage::Abandon => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProcessOutput {
    /// `None` when the child had to be abandoned.
    pub status: Option<ExitStatus>,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
    pub timed_out: bool,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.status.is_some_and(|status| status.success())
    }

    /// Last non-empty stderr line, handy for one-line failure reports.
    pub fn last_error_line(&self) -> Option<&str> {
        self.stderr
            .iter()
            .rev()
            .map(|line| line.trim())
            .find(|line| !line.is_empty())
    }
}

/// Spawns `command`, captures both streams line by line, and waits at most
/// `timeout` for it to exit. Only spawn failures are returned as errors.
pub async fn run_captured(
    mut command: Command,
    timeout: Duration,
) -> std::io::Result<ProcessOutput> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    // Own process group, so helpers such as ffmpeg are signalled too.
    #[cfg(unix)]
    command.process_group(0);

    let mut child = command.spawn()?;
    let stdout_task = tokio::spawn(drain_lines(child.stdout.take()));
    let stderr_task = tokio::spawn(drain_lines(child.stderr.take()));

    let (status, timed_out) = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(status) => (Some(status?), false),
        Err(_) => {
            tracing::warn!(timeout_secs = timeout.as_secs(), "child process timed out");
            (terminate(&mut child).await, true)
        }
    };

    let stdout = join_reader(stdout_task).await;
    let stderr = join_reader(stderr_task).await;

    Ok(ProcessOutput {
        status,
        stdout,
        stderr,
        timed_out,
    })
}

async fn drain_lines<R>(reader: Option<R>) -> Vec<String>
where
    R: AsyncRead + Unpin,
{
    let Some(reader) = reader else {
        return Vec::new();
    };
    let mut reader = BufReader::new(reader);
    let mut lines = Vec::new();
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                lines.push(line.trim_end_matches(['\n', '\r']).to_string());
            }
        }
    }
    lines
}

async fn join_reader(mut task: JoinHandle<Vec<String>>) -> Vec<String> {
    match tokio::time::timeout(READER_GRACE, &mut task).await {
        Ok(Ok(lines)) => lines,
        Ok(Err(err)) => {
            tracing::warn!(error = %err, "output reader failed");
            Vec::new()
        }
        Err(_) => {
            task.abort();
            Vec::new()
        }
    }
}

async fn terminate(child: &mut Child) -> Option<ExitStatus> {
    let mut stage = KillStage::Terminate;
    loop {
        match stage {
            KillStage::Terminate => {
                if signal_group(child, GroupSignal::Terminate)
                    && let Ok(Ok(status)) = tokio::time::timeout(TERMINATE_GRACE, child.wait()).await
                {
                    return Some(status);
                }
            }
            KillStage::Kill => {
                let sent = signal_group(child, GroupSignal::Kill) || child.start_kill().is_ok();
                if sent && let Ok(Ok(status)) = tokio::time::timeout(KILL_GRACE, child.wait()).await
                {
                    return Some(status);
                }
            }
            KillStage::Abandon => {
                tracing::warn!(pid = ?child.id(), "giving up on unresponsive child process");
                return None;
            }
        }
        stage = stage.next()?;
    }
}

#[derive(Debug, Clone, Copy)]
enum GroupSignal {
    Terminate,
    Kill,
}

/// Signals the child's whole process group. The child leads its own group,
/// so the group id equals its pid.
#[cfg(unix)]
fn signal_group(child: &Child, signal: GroupSignal) -> bool {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return false;
    };
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    let signal = match signal {
        GroupSignal::Terminate => Signal::SIGTERM,
        GroupSignal::Kill => Signal::SIGKILL,
    };
    killpg(Pid::from_raw(raw), signal).is_ok()
}

#[cfg(not(unix))]
fn signal_group(_child: &Child, _signal: GroupSignal) -> bool {
    false
}
