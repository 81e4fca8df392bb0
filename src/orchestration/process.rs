//! Shell subprocess execution with a time budget and cancellation.
//!
//! Every external command wavefront runs (the coding agent and the gate
//! commands) goes through [`ShellCommand`]: `sh -c <command>` in a worktree,
//! optional text on stdin, captured stdout/stderr. On timeout or cancellation
//! the process and its descendants are killed and reaped.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::util::blocking;
use crate::Result;

/// How long to wait for pipe readers after a kill. Orphaned grandchildren
/// may keep the pipes open.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// How a subprocess ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessExit {
    /// Exited on its own. `None` when terminated by a signal.
    Exited(Option<i32>),
    /// Killed after exceeding its time budget.
    TimedOut,
    /// Killed because the run was cancelled.
    Cancelled,
}

impl std::fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessExit::Exited(Some(code)) => write!(f, "exit code {}", code),
            ProcessExit::Exited(None) => write!(f, "killed by signal"),
            ProcessExit::TimedOut => write!(f, "timed out"),
            ProcessExit::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Captured result of one subprocess run.
#[derive(Debug, Clone)]
pub struct ProcessOutcome {
    pub exit: ProcessExit,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
}

impl ProcessOutcome {
    pub fn is_success(&self) -> bool {
        self.exit == ProcessExit::Exited(Some(0))
    }

    pub fn is_cancelled(&self) -> bool {
        self.exit == ProcessExit::Cancelled
    }

    /// Diagnostic text for a failed run: stderr, then stdout.
    pub fn failure_text(&self) -> String {
        let mut text = format!("{}", self.exit);
        for stream in [&self.stderr, &self.stdout] {
            let trimmed = stream.trim();
            if !trimmed.is_empty() {
                text.push('\n');
                text.push_str(trimmed);
            }
        }
        text
    }
}

/// A `sh -c` invocation.
#[derive(Debug, Clone)]
pub struct ShellCommand {
    command: String,
    cwd: PathBuf,
    env: Vec<(String, String)>,
    stdin: Option<String>,
    timeout: Duration,
}

impl ShellCommand {
    pub fn new(command: &str, cwd: &Path) -> Self {
        Self {
            command: command.to_string(),
            cwd: cwd.to_path_buf(),
            env: Vec::new(),
            stdin: None,
            timeout: Duration::from_secs(600),
        }
    }

    pub fn env(mut self, key: &str, value: impl Into<String>) -> Self {
        self.env.push((key.to_string(), value.into()));
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// Run to completion, timeout or cancellation.
    ///
    /// Only spawn failures are errors; non-zero exits, timeouts and
    /// cancellation are reported in the outcome.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<ProcessOutcome> {
        let started = Instant::now();
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&self.command)
            .current_dir(&self.cwd)
            .stdin(if self.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &self.env {
            cmd.env(key, value);
        }

        tracing::debug!(command = %self.command, cwd = %self.cwd.display(), "spawning subprocess");
        let mut child = cmd.spawn()?;

        if let (Some(input), Some(mut pipe)) = (self.stdin.clone(), child.stdin.take()) {
            tokio::spawn(async move {
                // The child may exit without reading; a broken pipe is fine.
                let _ = pipe.write_all(input.as_bytes()).await;
                let _ = pipe.shutdown().await;
            });
        }
        let mut stdout_task = tokio::spawn(read_all(child.stdout.take()));
        let mut stderr_task = tokio::spawn(read_all(child.stderr.take()));

        enum Waited {
            Exited(std::io::Result<std::process::ExitStatus>),
            TimedOut,
            Cancelled,
        }

        let waited = tokio::select! {
            status = child.wait() => Waited::Exited(status),
            _ = tokio::time::sleep(self.timeout) => Waited::TimedOut,
            _ = cancel.cancelled() => Waited::Cancelled,
        };

        let exit = match waited {
            Waited::Exited(status) => ProcessExit::Exited(status?.code()),
            Waited::TimedOut => {
                tracing::warn!(command = %self.command, timeout = ?self.timeout, "subprocess timed out, killing");
                kill_tree(&mut child).await;
                ProcessExit::TimedOut
            }
            Waited::Cancelled => {
                tracing::debug!(command = %self.command, "subprocess cancelled, killing");
                kill_tree(&mut child).await;
                ProcessExit::Cancelled
            }
        };

        let (stdout, stderr) = if matches!(exit, ProcessExit::Exited(_)) {
            (
                join_output(&mut stdout_task, None).await,
                join_output(&mut stderr_task, None).await,
            )
        } else {
            (
                join_output(&mut stdout_task, Some(DRAIN_GRACE)).await,
                join_output(&mut stderr_task, Some(DRAIN_GRACE)).await,
            )
        };

        let outcome = ProcessOutcome {
            exit,
            stdout,
            stderr,
            elapsed: started.elapsed(),
        };
        tracing::debug!(command = %self.command, exit = %outcome.exit, elapsed = ?outcome.elapsed, "subprocess finished");
        Ok(outcome)
    }
}

async fn read_all<R: AsyncRead + Unpin>(reader: Option<R>) -> String {
    let Some(mut reader) = reader else {
        return String::new();
    };
    let mut buf = Vec::new();
    let _ = reader.read_to_end(&mut buf).await;
    String::from_utf8_lossy(&buf).into_owned()
}

async fn join_output(task: &mut JoinHandle<String>, grace: Option<Duration>) -> String {
    match grace {
        None => task.await.unwrap_or_default(),
        Some(grace) => match tokio::time::timeout(grace, &mut *task).await {
            Ok(joined) => joined.unwrap_or_default(),
            Err(_) => {
                task.abort();
                String::new()
            }
        },
    }
}

/// Kill the child and every descendant, then reap the child.
async fn kill_tree(child: &mut Child) {
    if let Some(pid) = child.id() {
        let killed = blocking(move || Ok(kill_descendants(pid))).await.unwrap_or(0);
        if killed > 0 {
            tracing::debug!(pid, killed, "killed descendant processes");
        }
    }
    let _ = child.start_kill();
    let _ = child.wait().await;
}

/// Kill all descendants of `root`, deepest first. Returns how many were signalled.
fn kill_descendants(root: u32) -> usize {
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);

    let mut frontier = vec![Pid::from_u32(root)];
    let mut descendants = Vec::new();
    while let Some(parent) = frontier.pop() {
        for (pid, process) in system.processes() {
            if process.parent() == Some(parent) && !descendants.contains(pid) {
                descendants.push(*pid);
                frontier.push(*pid);
            }
        }
    }

    descendants
        .iter()
        .rev()
        .filter_map(|pid| system.process(*pid))
        .filter(|process| process.kill())
        .count()
}
