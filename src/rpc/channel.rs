//! Outbound request correlation and the stdin writer task.
//!
//! [`RpcChannel`] owns the per-connection pending-request table and the
//! monotonically increasing request-id counter. Sending a request registers
//! a [`PendingRequest`] keyed by its id, serializes the frame to the writer
//! task, and suspends the caller until a matching response arrives, the
//! deadline fires, or the connection is torn down — whichever comes first.
//!
//! The writer task ([`run_writer`]) is the single owner of the agent's
//! stdin: it receives [`serde_json::Value`] frames from an mpsc channel,
//! serializes each to a compact single line, and appends the `\n`
//! delimiter. When the task exits (cancellation or stdin failure) the
//! channel's senders observe closure and outbound calls fail fast.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::rpc::{notification_frame, request_frame, RpcErrorObject};
use crate::{AppError, Result};

/// Default deadline for general application-level requests.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(600);

/// Default deadline for the initialize / new-session handshake class.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(60);

/// One in-flight outbound call, keyed by request id in the pending table.
///
/// Destroyed when a matching response arrives, the deadline fires, or the
/// connection closes — whichever happens first.
#[derive(Debug)]
struct PendingRequest {
    /// Method name, kept for diagnostics and failure messages.
    method: String,
    /// Resolution channel back to the suspended caller.
    tx: oneshot::Sender<Result<Value>>,
}

/// Correlated outbound side of one agent connection.
///
/// Cheaply cloneable; all clones share the pending table and the id
/// counter. Requests may be issued from any task — the table is behind an
/// async mutex and ids come from an atomic counter, so no caller ordering
/// is assumed.
#[derive(Debug, Clone)]
pub struct RpcChannel {
    outbound_tx: mpsc::Sender<Value>,
    pending: Arc<Mutex<HashMap<u64, PendingRequest>>>,
    next_id: Arc<AtomicU64>,
}

impl RpcChannel {
    /// Create a channel whose frames are delivered to `outbound_tx`
    /// (consumed by [`run_writer`]).
    #[must_use]
    pub fn new(outbound_tx: mpsc::Sender<Value>) -> Self {
        Self {
            outbound_tx,
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Send a request and suspend until its response, deadline, or closure.
    ///
    /// Allocates the next sequential id (ids are never reused for the
    /// lifetime of the connection), records the pending entry, then writes
    /// the frame. On deadline expiry the entry is removed so a late
    /// response for that id is silently discarded by the router.
    ///
    /// # Errors
    ///
    /// - [`AppError::Rpc`] — the peer answered with a structured error.
    /// - [`AppError::Timeout`] — no response within `deadline`.
    /// - [`AppError::ConnectionClosed`] / [`AppError::ProcessTerminated`] —
    ///   the connection was torn down while the call was outstanding.
    pub async fn request(&self, method: &str, params: Value, deadline: Duration) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        self.pending.lock().await.insert(
            id,
            PendingRequest {
                method: method.to_owned(),
                tx,
            },
        );

        debug!(id, method, "rpc: sending request");

        if self
            .outbound_tx
            .send(request_frame(id, method, params))
            .await
            .is_err()
        {
            self.pending.lock().await.remove(&id);
            return Err(AppError::ConnectionClosed);
        }

        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(outcome)) => outcome,
            // Pending entry dropped without resolution — teardown raced the
            // response delivery.
            Ok(Err(_)) => Err(AppError::ConnectionClosed),
            Err(_elapsed) => {
                // Remove the entry so the router drops any late response.
                self.pending.lock().await.remove(&id);
                warn!(id, method, ?deadline, "rpc: request deadline fired");
                Err(AppError::Timeout {
                    method: method.to_owned(),
                    deadline,
                })
            }
        }
    }

    /// Send a notification — no id, no response expected.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::ConnectionClosed`] if the writer task is gone.
    pub async fn notify(&self, method: &str, params: Value) -> Result<()> {
        debug!(method, "rpc: sending notification");
        self.outbound_tx
            .send(notification_frame(method, params))
            .await
            .map_err(|_| AppError::ConnectionClosed)
    }

    /// Send a pre-built response frame to a peer-initiated request.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::ConnectionClosed`] if the writer task is gone.
    pub async fn send_raw(&self, frame: Value) -> Result<()> {
        self.outbound_tx
            .send(frame)
            .await
            .map_err(|_| AppError::ConnectionClosed)
    }

    /// Resolve the pending request with `id`, if one exists.
    ///
    /// Returns `true` when an entry was found and resolved. A `false`
    /// return means no request is pending under that id — either it never
    /// existed or its deadline already fired — and the caller should drop
    /// the message.
    pub async fn resolve(&self, id: u64, outcome: Result<Value>) -> bool {
        let entry = self.pending.lock().await.remove(&id);
        match entry {
            Some(pending) => {
                debug!(id, method = pending.method.as_str(), "rpc: response matched");
                // The caller may have given up in the same instant; a failed
                // send only means nobody is listening any more.
                let _ = pending.tx.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Fail every pending request with an error built by `make_error`.
    ///
    /// Used on process exit ("process terminated") and on explicit
    /// disconnect ("connection closed"). Idempotent — a second call finds
    /// an empty table.
    pub async fn fail_all<F>(&self, make_error: F)
    where
        F: Fn(&str) -> AppError,
    {
        let drained: Vec<(u64, PendingRequest)> =
            self.pending.lock().await.drain().collect();
        for (id, pending) in drained {
            debug!(id, method = pending.method.as_str(), "rpc: failing pending request");
            let _ = pending.tx.send(Err(make_error(&pending.method)));
        }
    }

    /// Number of requests currently awaiting a response.
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Convert a decoded response body into a pending-request outcome.
    ///
    /// A structured `error` member becomes [`AppError::Rpc`]; otherwise the
    /// `result` member (defaulting to `null`) is the success value.
    #[must_use]
    pub fn outcome_of(message: &Value) -> Result<Value> {
        if let Some(err) = message.get("error") {
            let parsed: RpcErrorObject = serde_json::from_value(err.clone()).unwrap_or_else(|_| {
                RpcErrorObject {
                    code: crate::rpc::INTERNAL_ERROR,
                    message: err.to_string(),
                    data: None,
                }
            });
            return Err(AppError::Rpc {
                code: parsed.code,
                message: parsed.message,
                data: parsed.data,
            });
        }
        Ok(message.get("result").cloned().unwrap_or(Value::Null))
    }
}

/// Stdin writer task — serializes outbound frames as NDJSON lines.
///
/// Receives [`serde_json::Value`] frames from `msg_rx`, serializes each to
/// a compact single-line JSON string, appends `\n`, and writes the bytes to
/// the agent process's stdin.
///
/// The task exits cleanly when `cancel` fires or when all senders are
/// dropped. A write failure (agent exited, pipe closed) ends the task; the
/// exit monitor owns the resulting cleanup.
///
/// # Errors
///
/// - [`AppError::Protocol`] if serialization fails (should not occur for
///   `Value`).
/// - [`AppError::Io`] if the write to stdin fails.
pub async fn run_writer<W>(
    mut stdin: W,
    mut msg_rx: mpsc::Receiver<Value>,
    cancel: CancellationToken,
) -> Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!("rpc writer: cancellation received, stopping");
                break;
            }

            msg = msg_rx.recv() => {
                match msg {
                    None => {
                        debug!("rpc writer: message channel closed, stopping");
                        break;
                    }
                    Some(value) => {
                        let mut bytes = serde_json::to_vec(&value).map_err(|e| {
                            AppError::Protocol(format!("failed to serialize outbound frame: {e}"))
                        })?;

                        // NDJSON: append the newline delimiter.
                        bytes.push(b'\n');

                        stdin.write_all(&bytes).await.map_err(|e| {
                            warn!(error = %e, "rpc writer: write to stdin failed");
                            AppError::Io(format!("write failed: {e}"))
                        })?;
                    }
                }
            }
        }
    }

    Ok(())
}
