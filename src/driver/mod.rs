//! Protocol adapters and the typed event surface they share.
//!
//! The two dialect adapters decouple the host-facing client from the wire
//! protocol spoken by the agent process:
//! - `acp`: session dialect — initialize / new-session / prompt, streamed
//!   session updates, permission and file-I/O callbacks.
//! - `mcp`: tool dialect — initialize / list-tools / call-tool, elicitation
//!   (approval) callbacks, and the out-of-order event reconciliation.
//!
//! Both emit [`AgentEvent`]s into a single per-connection mpsc channel.
//! Emitting with no receiver is a no-op, never an error — the host decides
//! what it listens to.

pub mod acp;
pub mod approvals;
pub mod mcp;
pub mod updates;

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::debug;

use crate::rpc::channel::{RpcChannel, DEFAULT_REQUEST_TIMEOUT, HANDSHAKE_TIMEOUT};
use crate::spawn::{ProcessExit, ProcessHandle};
use crate::{AppError, Result};

// ── Connection state ─────────────────────────────────────────────────────────

/// Lifecycle state of one agent connection.
///
/// Transitions run one-directionally through
/// `disconnected → connecting → connected → initializing → ready`, then to
/// `closed` when the process ends. `error` is reachable from any live
/// state, and `disconnected` from every state via explicit teardown.
/// `ready` is the only state in which application-level requests are
/// accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No process, no session.
    Disconnected,
    /// Process spawn in progress.
    Connecting,
    /// Process is up; protocol handshake not yet started.
    Connected,
    /// Handshake (initialize / new-session / tool catalog) in flight.
    Initializing,
    /// Handshake complete; application-level requests accepted.
    Ready,
    /// Agent process exited.
    Closed,
    /// Spawn or handshake failed; connection unusable.
    Error,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Closed => "closed",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

impl ConnectionState {
    /// Position in the forward chain; terminal states are not ranked.
    fn rank(self) -> Option<u8> {
        match self {
            Self::Disconnected => Some(0),
            Self::Connecting => Some(1),
            Self::Connected => Some(2),
            Self::Initializing => Some(3),
            Self::Ready => Some(4),
            Self::Closed | Self::Error => None,
        }
    }

    /// Whether a transition from `self` to `to` is legal.
    #[must_use]
    pub fn may_transition(self, to: Self) -> bool {
        if self == to {
            return false;
        }
        match to {
            // Explicit teardown is always allowed.
            Self::Disconnected => true,
            Self::Error => !matches!(self, Self::Error | Self::Disconnected),
            // The process can die under any live state.
            Self::Closed => !matches!(self, Self::Closed | Self::Error | Self::Disconnected),
            _ => match (self.rank(), to.rank()) {
                (Some(from), Some(target)) => target == from + 1,
                _ => false,
            },
        }
    }
}

/// Shared, observable connection state.
///
/// Every accepted transition is published on a watch channel and re-emitted
/// as [`AgentEvent::StateChanged`]. Illegal transitions (e.g. a late exit
/// notification after explicit teardown) are silently ignored.
#[derive(Debug, Clone)]
pub struct StateCell {
    tx: std::sync::Arc<watch::Sender<ConnectionState>>,
    event_tx: mpsc::Sender<AgentEvent>,
}

impl StateCell {
    /// Create a cell starting in [`ConnectionState::Disconnected`].
    #[must_use]
    pub fn new(event_tx: mpsc::Sender<AgentEvent>) -> Self {
        let (tx, _rx) = watch::channel(ConnectionState::Disconnected);
        Self {
            tx: std::sync::Arc::new(tx),
            event_tx,
        }
    }

    /// Current state.
    #[must_use]
    pub fn current(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    /// Apply `next` if the transition is legal; returns whether it was.
    pub async fn set(&self, next: ConnectionState) -> bool {
        let applied = self.tx.send_if_modified(|state| {
            if state.may_transition(next) {
                *state = next;
                true
            } else {
                false
            }
        });
        if applied {
            debug!(state = %next, "connection state changed");
            let _ = self.event_tx.send(AgentEvent::StateChanged(next)).await;
        }
        applied
    }

    /// Subscribe to state changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }
}

// ── Connection options ───────────────────────────────────────────────────────

/// Deadlines applied across one connection.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    /// General application-level request deadline.
    pub request: Duration,
    /// Initialize / new-session handshake deadline.
    pub handshake: Duration,
    /// Grace period between polite and forceful termination.
    pub terminate_grace: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            request: DEFAULT_REQUEST_TIMEOUT,
            handshake: HANDSHAKE_TIMEOUT,
            terminate_grace: Duration::from_secs(3),
        }
    }
}

/// How remote-initiated permission and approval requests are decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalPolicy {
    /// Every request is surfaced to the host for an asynchronous decision.
    Interactive,
    /// Approval-eligible requests are answered affirmatively at once.
    Automatic,
    /// Like `Automatic`, for hosts running without any operator present.
    Unsupervised,
}

impl ApprovalPolicy {
    /// Whether this policy answers approval requests without the host.
    #[must_use]
    pub fn is_automatic(self) -> bool {
        matches!(self, Self::Automatic | Self::Unsupervised)
    }
}

// ── Events ───────────────────────────────────────────────────────────────────

/// Which diagnostic stream a process log line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    /// Non-JSON line on the data stream (startup banner, stray print).
    Stdout,
    /// Ordinary diagnostic stream output.
    Stderr,
}

/// One entry of an agent's published plan.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanEntry {
    /// What the agent intends to do.
    pub content: String,
    /// Execution status (`pending`, `in_progress`, `completed`, …).
    pub status: String,
    /// Relative priority, when the agent reports one.
    #[serde(default)]
    pub priority: Option<String>,
}

/// Events emitted by a connection into the host's event channel.
#[derive(Debug)]
pub enum AgentEvent {
    /// The connection state advanced.
    StateChanged(ConnectionState),
    /// A chunk of the agent's streamed reply text.
    MessageChunk {
        /// Text fragment.
        text: String,
    },
    /// A chunk of the agent's streamed internal reasoning.
    ThoughtChunk {
        /// Text fragment.
        text: String,
    },
    /// The agent started a tool call.
    ToolCallStarted {
        /// Agent-assigned tool-call identifier.
        tool_call_id: String,
        /// Human-readable description of the call.
        title: String,
        /// Tool category hint (`read`, `edit`, `execute`, …).
        kind: Option<String>,
    },
    /// Status or content of a running tool call changed.
    ToolCallUpdated {
        /// Agent-assigned tool-call identifier.
        tool_call_id: String,
        /// New status, when reported.
        status: Option<String>,
        /// Updated title, when reported.
        title: Option<String>,
    },
    /// The agent published or revised its plan.
    PlanUpdated {
        /// Plan entries, newest snapshot.
        entries: Vec<PlanEntry>,
    },
    /// The agent asks the host to authorize a tool call (session dialect).
    PermissionRequested(PermissionRequest),
    /// The agent asks the host to read a text file on its behalf.
    FsReadRequested(FsReadRequest),
    /// The agent asks the host to write a text file on its behalf.
    FsWriteRequested(FsWriteRequest),
    /// The agent asks the host to approve an action (tool dialect).
    ApprovalRequested(ApprovalRequest),
    /// The tool catalog was replaced after a change notification.
    ToolsChanged {
        /// Full replacement catalog.
        tools: Vec<mcp::ToolDescriptor>,
    },
    /// Diagnostic output from the agent process.
    ProcessLog {
        /// Originating stream.
        stream: LogStream,
        /// Raw line content.
        line: String,
    },
    /// A notification this adapter does not recognize, re-emitted so
    /// future protocol extensions remain observable.
    UnknownNotification {
        /// Notification method name.
        method: String,
        /// Raw parameters.
        params: Value,
    },
    /// A failure that happened off any caller's call stack.
    Fault {
        /// Human-readable description.
        message: String,
    },
    /// The agent process ended.
    ProcessExited(ProcessExit),
}

// ── Host-resolved requests ───────────────────────────────────────────────────

/// One selectable option of a permission request.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PermissionOption {
    /// Identifier echoed back in the decision.
    #[serde(rename = "optionId")]
    pub option_id: String,
    /// Human-readable label.
    pub name: String,
    /// Option kind hint (`allow_once`, `reject_always`, …).
    #[serde(default)]
    pub kind: Option<String>,
}

/// Host decision for a permission request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermissionDecision {
    /// The host chose one of the offered options.
    Selected {
        /// Identifier of the chosen option.
        option_id: String,
    },
    /// The prompt was abandoned without a selection.
    Cancelled,
}

/// A permission request surfaced to the host, paired with its resolver.
///
/// Dropping the request without calling [`resolve`](Self::resolve) answers
/// the agent with a cancellation; after a disconnect the answer is
/// discarded entirely.
#[derive(Debug)]
pub struct PermissionRequest {
    /// Session the request belongs to.
    pub session_id: String,
    /// Human-readable description of the tool call needing authorization.
    pub title: String,
    /// Options offered by the agent.
    pub options: Vec<PermissionOption>,
    tx: oneshot::Sender<PermissionDecision>,
}

impl PermissionRequest {
    pub(crate) fn new(
        session_id: String,
        title: String,
        options: Vec<PermissionOption>,
    ) -> (Self, oneshot::Receiver<PermissionDecision>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                session_id,
                title,
                options,
                tx,
            },
            rx,
        )
    }

    /// Deliver the host's decision to the agent.
    pub fn resolve(self, decision: PermissionDecision) {
        let _ = self.tx.send(decision);
    }
}

/// A file-read request surfaced to the host, paired with its resolver.
#[derive(Debug)]
pub struct FsReadRequest {
    /// Absolute path the agent wants read.
    pub path: PathBuf,
    /// Optional 1-based starting line.
    pub line: Option<u64>,
    /// Optional maximum number of lines.
    pub limit: Option<u64>,
    tx: oneshot::Sender<Result<String>>,
}

impl FsReadRequest {
    pub(crate) fn new(
        path: PathBuf,
        line: Option<u64>,
        limit: Option<u64>,
    ) -> (Self, oneshot::Receiver<Result<String>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                path,
                line,
                limit,
                tx,
            },
            rx,
        )
    }

    /// Deliver the file content (or the host-side failure) to the agent.
    pub fn resolve(self, outcome: Result<String>) {
        let _ = self.tx.send(outcome);
    }
}

/// A file-write request surfaced to the host, paired with its resolver.
#[derive(Debug)]
pub struct FsWriteRequest {
    /// Absolute path the agent wants written.
    pub path: PathBuf,
    /// Full replacement content.
    pub content: String,
    tx: oneshot::Sender<Result<()>>,
}

impl FsWriteRequest {
    pub(crate) fn new(path: PathBuf, content: String) -> (Self, oneshot::Receiver<Result<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self { path, content, tx }, rx)
    }

    /// Report the write outcome to the agent.
    pub fn resolve(self, outcome: Result<()>) {
        let _ = self.tx.send(outcome);
    }
}

/// Host decision for a tool-dialect approval (elicitation) request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalDecision {
    /// Approve this action.
    Approved,
    /// Approve this action and everything else for the session's remainder.
    ApprovedForSession,
    /// Deny this action.
    Denied,
    /// Deny and abort the surrounding task.
    Abort,
}

/// An approval request surfaced to the host, paired with its resolver.
#[derive(Debug)]
pub struct ApprovalRequest {
    /// Remote-assigned call identifier.
    pub call_id: String,
    /// Human-readable description of the action awaiting approval.
    pub message: String,
    tx: oneshot::Sender<ApprovalDecision>,
}

impl ApprovalRequest {
    pub(crate) fn new(
        call_id: String,
        message: String,
    ) -> (Self, oneshot::Receiver<ApprovalDecision>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                call_id,
                message,
                tx,
            },
            rx,
        )
    }

    /// Deliver the host's decision to the agent.
    pub fn resolve(self, decision: ApprovalDecision) {
        let _ = self.tx.send(decision);
    }
}

// ── Shared plumbing ──────────────────────────────────────────────────────────

/// Watch for process exit and broadcast the failure to all pending work.
///
/// Spawned by both adapters next to the exit monitor: when the process
/// ends for any reason, every pending request fails with a
/// "process terminated" error, the state moves to `closed`, and a
/// [`AgentEvent::ProcessExited`] event is emitted.
pub(crate) fn watch_process_exit(
    process: ProcessHandle,
    channel: RpcChannel,
    state: StateCell,
    event_tx: mpsc::Sender<AgentEvent>,
) {
    tokio::spawn(async move {
        let exit = process.wait_exited().await;
        channel
            .fail_all(|method| {
                AppError::ProcessTerminated(format!(
                    "agent exited with '{method}' outstanding: {}",
                    exit.description
                ))
            })
            .await;
        state.set(ConnectionState::Closed).await;
        let _ = event_tx.send(AgentEvent::ProcessExited(exit)).await;
    });
}
