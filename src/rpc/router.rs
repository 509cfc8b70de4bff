//! Bidirectional request router — inbound classification and dispatch.
//!
//! Reads newline-delimited JSON from the agent's stdout and classifies
//! every decoded message, in order:
//!
//! 1. An `id` matching a pending outbound request → response; resolve it.
//! 2. An `id` with no matching pending entry, plus a `method` → a request
//!    *from* the peer; handed to the adapter with a [`Responder`] so it is
//!    always answered, possibly much later.
//! 3. A `method` and no `id` → notification; handed to the adapter.
//!
//! A line that fails to parse as JSON is not an error — it is forwarded as
//! a diagnostic log event (agents emit startup banners on stdout before
//! protocol traffic begins). Dispatch is strictly in byte-delivery order;
//! there is no parallel decoding within one connection.

use std::future::Future;
use std::pin::Pin;

use futures_util::StreamExt;
use serde_json::Value;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::driver::{AgentEvent, LogStream};
use crate::rpc::channel::RpcChannel;
use crate::rpc::codec::NdjsonCodec;
use crate::rpc::{error_frame, response_frame};
use crate::AppError;

// ── Peer-initiated requests ───────────────────────────────────────────────────

/// Exactly-once answer handle for a peer-initiated request.
///
/// Consuming `ok` or `error` serializes the stored request id into the
/// response frame. If the connection has been torn down the frame is
/// silently discarded — a disconnect implicitly abandons any requests the
/// host was still holding.
#[derive(Debug)]
pub struct Responder {
    id: Value,
    outbound_tx: mpsc::Sender<Value>,
}

impl Responder {
    /// Build a responder for `id` answering over `outbound_tx`.
    pub(crate) fn new(id: Value, outbound_tx: mpsc::Sender<Value>) -> Self {
        Self { id, outbound_tx }
    }

    /// Answer the request with a success result.
    pub async fn ok(self, result: Value) {
        let _ = self.outbound_tx.send(response_frame(&self.id, result)).await;
    }

    /// Answer the request with a structured error.
    pub async fn error(self, code: i64, message: &str) {
        let _ = self
            .outbound_tx
            .send(error_frame(&self.id, code, message))
            .await;
    }
}

/// A decoded request from the remote peer, awaiting an answer.
#[derive(Debug)]
pub struct PeerRequest {
    /// Remote-assigned request id (string or integer), echoed in the answer.
    pub id: Value,
    /// Method name the peer invoked.
    pub method: String,
    /// Method parameters; `null` when absent.
    pub params: Value,
    /// Handle through which the adapter must eventually answer.
    pub responder: Responder,
}

/// Adapter-side sink for peer requests and notifications.
///
/// An unanswered peer request is a protocol violation the remote may block
/// on indefinitely, so implementations must answer every [`PeerRequest`]
/// they receive — unknown methods with a "method not found" error.
pub trait InboundHandler: Send + Sync + 'static {
    /// Handle a request initiated by the remote peer.
    fn on_peer_request(&self, request: PeerRequest)
        -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;

    /// Handle a notification from the remote peer.
    fn on_notification(
        &self,
        method: String,
        params: Value,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

// ── Router task ───────────────────────────────────────────────────────────────

/// Why the router loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouterExit {
    /// The agent's stdout reached EOF.
    Eof,
    /// The cancellation token fired (orderly teardown).
    Cancelled,
    /// An unrecoverable I/O error on the inbound stream.
    Io(String),
}

/// Router task — decodes stdout lines and dispatches each message.
///
/// `outbound_tx` is the writer-task channel; peer requests are given a
/// [`Responder`] over it so answers can be produced long after this task
/// has moved on. `event_tx` receives the diagnostic log events produced by
/// non-JSON lines.
///
/// Codec-level framing errors (line too long) are logged and skipped; they
/// do not terminate the router.
pub async fn run_router<R, H>(
    stdout: R,
    channel: RpcChannel,
    outbound_tx: mpsc::Sender<Value>,
    handler: std::sync::Arc<H>,
    event_tx: mpsc::Sender<AgentEvent>,
    cancel: CancellationToken,
) -> RouterExit
where
    R: AsyncRead + Unpin + Send,
    H: InboundHandler,
{
    let mut framed = FramedRead::new(stdout, NdjsonCodec::new());

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!("rpc router: cancellation received, stopping");
                return RouterExit::Cancelled;
            }

            item = framed.next() => {
                match item {
                    None => {
                        debug!("rpc router: EOF on agent stdout");
                        return RouterExit::Eof;
                    }

                    Some(Err(AppError::Protocol(msg))) => {
                        // Oversized line — drop it and keep reading.
                        warn!(error = msg.as_str(), "rpc router: framing error, skipping line");
                    }

                    Some(Err(e)) => {
                        warn!(error = %e, "rpc router: IO error, stopping");
                        return RouterExit::Io(e.to_string());
                    }

                    Some(Ok(line)) => {
                        dispatch_line(&line, &channel, &outbound_tx, &handler, &event_tx).await;
                    }
                }
            }
        }
    }
}

// ── Private helpers ───────────────────────────────────────────────────────────

/// Classify and dispatch one inbound line.
async fn dispatch_line<H>(
    line: &str,
    channel: &RpcChannel,
    outbound_tx: &mpsc::Sender<Value>,
    handler: &std::sync::Arc<H>,
    event_tx: &mpsc::Sender<AgentEvent>,
) where
    H: InboundHandler,
{
    if line.trim().is_empty() {
        return;
    }

    let Ok(message) = serde_json::from_str::<Value>(line) else {
        // Startup banner or stray print — diagnostic only, never an error.
        debug!(raw_line = line, "rpc router: non-JSON line on data stream");
        let _ = event_tx
            .send(AgentEvent::ProcessLog {
                stream: LogStream::Stdout,
                line: line.to_owned(),
            })
            .await;
        return;
    };

    // 1. A numeric id matching a pending outbound request is a response,
    //    regardless of what else the message carries.
    if let Some(id) = message.get("id").and_then(Value::as_u64) {
        let outcome = RpcChannel::outcome_of(&message);
        if channel.resolve(id, outcome).await {
            return;
        }
    }

    let method = message
        .get("method")
        .and_then(Value::as_str)
        .map(str::to_owned);
    let params = message.get("params").cloned().unwrap_or(Value::Null);

    match (method, message.get("id")) {
        // 2. Unmatched id + method: a request from the peer.
        (Some(method), Some(id)) => {
            let request = PeerRequest {
                id: id.clone(),
                method,
                params,
                responder: Responder {
                    id: id.clone(),
                    outbound_tx: outbound_tx.clone(),
                },
            };
            handler.on_peer_request(request).await;
        }

        // 3. Method without id: a notification.
        (Some(method), None) => {
            handler.on_notification(method, params).await;
        }

        // A response whose pending entry is gone — its deadline already
        // fired, or it was never ours. Silently dropped.
        (None, Some(id)) => {
            debug!(?id, "rpc router: dropping response with no pending request");
        }

        (None, None) => {
            debug!("rpc router: message with neither id nor method, dropping");
        }
    }
}
