//! Agent process lifecycle management.
//!
//! Spawns agent binaries for a connection with:
//! - `kill_on_drop(true)` so processes are cleaned up automatically.
//! - `env_clear()` + the caller-supplied sanitized environment map, so the
//!   child sees exactly what the spawn descriptor says and nothing else.
//! - stderr captured line-by-line and re-emitted as log events — never
//!   parsed as protocol data.
//!
//! Termination escalates: on Unix a SIGTERM followed, after a grace
//! period, by a forceful kill of the handle; on Windows a single-step
//! `taskkill /T /F` of the process tree, falling back to a forceful kill
//! of the handle alone if taskkill cannot be launched.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::driver::{AgentEvent, LogStream};
use crate::{AppError, Result};

/// Upper bound on waiting for exit confirmation after a forceful kill.
const FORCE_WAIT: Duration = Duration::from_secs(5);

// ── Spawn descriptor ─────────────────────────────────────────────────────────

/// Fully-formed description of an agent process to launch.
///
/// Supplied by the agent catalog (`crate::config`); this module never
/// decides *what* to spawn, only *how* to run and talk to it. The
/// environment map is expected to be sanitized already.
#[derive(Debug, Clone)]
pub struct SpawnDescriptor {
    /// Agent executable (e.g., `claude`, `codex`).
    pub command: String,
    /// Arguments passed to the executable.
    pub args: Vec<String>,
    /// Working directory the child starts in.
    pub working_dir: PathBuf,
    /// Complete environment for the child; everything else is stripped.
    pub env: HashMap<String, String>,
}

// ── Spawned process ──────────────────────────────────────────────────────────

/// A freshly spawned agent process with its stdio handles captured.
#[derive(Debug)]
pub struct SpawnedAgent {
    /// OS process id, used for polite termination signals.
    pub pid: u32,
    /// Agent's stdin — outbound protocol frames.
    pub stdin: ChildStdin,
    /// Agent's stdout — inbound protocol frames.
    pub stdout: ChildStdout,
    /// Agent's stderr — diagnostic output only.
    pub stderr: ChildStderr,
    /// Child handle, to be passed to [`monitor_exit`].
    pub child: Child,
}

/// Spawn an agent process described by `descriptor`.
///
/// The inherited environment is cleared and replaced by the descriptor's
/// map. All three stdio streams are piped; `kill_on_drop` backstops
/// cleanup if the handle is dropped without an orderly teardown.
///
/// # Errors
///
/// Returns [`AppError::Spawn`] when the executable is missing or unusable,
/// or when a stdio handle cannot be captured.
pub async fn spawn_agent(descriptor: &SpawnDescriptor) -> Result<SpawnedAgent> {
    let mut cmd = Command::new(&descriptor.command);
    cmd.args(&descriptor.args);

    cmd.env_clear();
    cmd.envs(&descriptor.env);

    cmd.current_dir(&descriptor.working_dir)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|err| {
        AppError::Spawn(format!("failed to spawn '{}': {err}", descriptor.command))
    })?;

    let pid = child
        .id()
        .ok_or_else(|| AppError::Spawn("process exited before its pid could be read".into()))?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| AppError::Spawn("failed to capture agent stdin".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AppError::Spawn("failed to capture agent stdout".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| AppError::Spawn("failed to capture agent stderr".into()))?;

    debug!(pid, command = descriptor.command.as_str(), "agent process spawned");

    Ok(SpawnedAgent {
        pid,
        stdin,
        stdout,
        stderr,
        child,
    })
}

// ── Exit info ────────────────────────────────────────────────────────────────

/// How an agent process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessExit {
    /// Exit code, when the process exited normally.
    pub code: Option<i32>,
    /// Terminating signal number, when killed by a signal (Unix only).
    pub signal: Option<i32>,
    /// Human-readable summary of the exit.
    pub description: String,
}

fn exit_info(status: std::process::ExitStatus) -> ProcessExit {
    let code = status.code();

    #[cfg(unix)]
    let signal = std::os::unix::process::ExitStatusExt::signal(&status);
    #[cfg(not(unix))]
    let signal: Option<i32> = None;

    let description = match (code, signal) {
        (Some(c), _) => format!("process exited with code {c}"),
        (None, Some(s)) => format!("process terminated by signal {s}"),
        (None, None) => "process terminated".to_owned(),
    };

    ProcessExit {
        code,
        signal,
        description,
    }
}

// ── Process handle + exit monitor ────────────────────────────────────────────

/// Live handle to a monitored agent process.
///
/// Cheaply cloneable. The underlying [`Child`] is owned by the monitor
/// task; this handle observes exit through a watch channel and requests a
/// forceful kill through an mpsc channel, so no lock is ever held across a
/// `wait`.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    /// OS process id.
    pub pid: u32,
    exit_rx: watch::Receiver<Option<ProcessExit>>,
    kill_tx: mpsc::Sender<()>,
}

/// Take ownership of `child` and watch it until exit.
///
/// The monitor task runs until the process ends (for any reason) and then
/// publishes the [`ProcessExit`] on the handle's watch channel. A kill
/// request delivered through the handle forcefully kills the child and
/// keeps waiting for the exit to be observed.
#[must_use]
pub fn monitor_exit(pid: u32, mut child: Child) -> ProcessHandle {
    let (exit_tx, exit_rx) = watch::channel(None);
    let (kill_tx, mut kill_rx) = mpsc::channel::<()>(1);

    tokio::spawn(async move {
        loop {
            tokio::select! {
                result = child.wait() => {
                    let exit = match result {
                        Ok(status) => exit_info(status),
                        Err(err) => {
                            warn!(pid, %err, "error waiting for agent process");
                            ProcessExit {
                                code: None,
                                signal: None,
                                description: format!("wait error: {err}"),
                            }
                        }
                    };
                    debug!(pid, description = exit.description.as_str(), "agent process exited");
                    let _ = exit_tx.send(Some(exit));
                    break;
                }
                Some(()) = kill_rx.recv() => {
                    if let Err(err) = child.start_kill() {
                        // Usually a benign race with the process exiting.
                        debug!(pid, %err, "forceful kill request failed");
                    }
                }
            }
        }
    });

    ProcessHandle {
        pid,
        exit_rx,
        kill_tx,
    }
}

impl ProcessHandle {
    /// Exit status, if the process has already ended.
    #[must_use]
    pub fn exit_status(&self) -> Option<ProcessExit> {
        self.exit_rx.borrow().clone()
    }

    /// Suspend until the process has exited.
    pub async fn wait_exited(&self) -> ProcessExit {
        let mut rx = self.exit_rx.clone();
        loop {
            let current = rx.borrow().clone();
            if let Some(exit) = current {
                return exit;
            }
            if rx.changed().await.is_err() {
                // Monitor task is gone without publishing — treat as ended.
                return ProcessExit {
                    code: None,
                    signal: None,
                    description: "exit monitor dropped".to_owned(),
                };
            }
        }
    }

    /// Terminate the process through the escalating shutdown sequence.
    ///
    /// Unix: SIGTERM, then a forceful kill if the process has not exited
    /// within `grace`. The grace timer is effectively cancelled by an
    /// earlier exit. Windows: `taskkill /T /F` on the process tree in a
    /// single step, falling back to a forceful kill of the handle alone if
    /// taskkill cannot be launched.
    ///
    /// Returns once the exit has been observed (bounded by a short safety
    /// window after the forceful kill).
    pub async fn terminate(&self, grace: Duration) {
        if self.exit_status().is_some() {
            return;
        }

        #[cfg(unix)]
        {
            self.send_sigterm();
            if tokio::time::timeout(grace, self.wait_exited()).await.is_ok() {
                return;
            }
            debug!(pid = self.pid, ?grace, "grace period elapsed, killing agent process");
            self.force_kill().await;
        }

        #[cfg(not(unix))]
        {
            let _ = grace;
            let killed = Command::new("taskkill")
                .args(["/PID", &self.pid.to_string(), "/T", "/F"])
                .output()
                .await;
            if let Err(err) = killed {
                warn!(pid = self.pid, %err, "taskkill unavailable, killing handle directly");
                self.force_kill().await;
            }
        }

        if tokio::time::timeout(FORCE_WAIT, self.wait_exited()).await.is_err() {
            warn!(pid = self.pid, "agent process did not confirm exit after forceful kill");
        }
    }

    /// Ask the monitor task to forcefully kill the child handle.
    async fn force_kill(&self) {
        let _ = self.kill_tx.send(()).await;
    }

    #[cfg(unix)]
    fn send_sigterm(&self) {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let Ok(raw) = i32::try_from(self.pid) else {
            return;
        };
        if let Err(err) = kill(Pid::from_raw(raw), Signal::SIGTERM) {
            // Process may already be gone; escalation handles the rest.
            debug!(pid = self.pid, %err, "SIGTERM delivery failed");
        }
    }
}

// ── Stderr capture ───────────────────────────────────────────────────────────

/// Stderr capture task — re-emits each diagnostic line as a log event.
///
/// Runs until EOF (process exit) or cancellation. Lines are never parsed
/// as protocol data.
pub async fn run_stderr_logger(
    stderr: ChildStderr,
    event_tx: mpsc::Sender<AgentEvent>,
    cancel: CancellationToken,
) {
    let mut lines = BufReader::new(stderr).lines();

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!("stderr logger: cancellation received, stopping");
                break;
            }

            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        debug!(agent_stderr = line.as_str(), "agent diagnostic output");
                        if event_tx
                            .send(AgentEvent::ProcessLog {
                                stream: LogStream::Stderr,
                                line,
                            })
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        debug!(%err, "stderr logger: read failed, stopping");
                        break;
                    }
                }
            }
        }
    }
}
