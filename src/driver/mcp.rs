//! Tool-dialect protocol adapter.
//!
//! Drives an agent through the tool lifecycle: spawn, `initialize`, the
//! `notifications/initialized` acknowledgement, then an initial
//! `tools/list` before the connection is `ready`. Tools are invoked with
//! `tools/call`; the catalog is replaced wholesale whenever the peer sends
//! `notifications/tools/list_changed`.
//!
//! The peer announces approval-eligible actions on two independent
//! streams — a general `agent/event` notification and a formal
//! `elicitation/create` request — with no ordering guarantee. The
//! [`ApprovalLedger`] reconciles the race so exactly one decision is
//! applied per call id regardless of arrival order.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::driver::approvals::ApprovalLedger;
use crate::driver::{
    watch_process_exit, AgentEvent, ApprovalDecision, ApprovalPolicy, ApprovalRequest,
    ConnectionState, StateCell, Timeouts,
};
use crate::rpc::channel::{run_writer, RpcChannel};
use crate::rpc::router::{run_router, InboundHandler, PeerRequest, Responder, RouterExit};
use crate::rpc::{INVALID_PARAMS, METHOD_NOT_FOUND};
use crate::spawn::{monitor_exit, run_stderr_logger, spawn_agent, ProcessHandle, SpawnDescriptor};
use crate::{AppError, Result};

// ── Tool catalog ─────────────────────────────────────────────────────────────

/// One tool the agent offers for invocation.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    /// Tool name passed to `tools/call`.
    pub name: String,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
    /// JSON schema of the tool's arguments.
    #[serde(default)]
    pub input_schema: Value,
}

#[derive(Debug, Deserialize)]
struct ToolListResult {
    #[serde(default)]
    tools: Vec<ToolDescriptor>,
}

/// Result of one tool invocation.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallOutcome {
    /// Content blocks produced by the tool.
    #[serde(default)]
    pub content: Vec<Value>,
    /// Whether the tool itself reported a failure.
    #[serde(default)]
    pub is_error: bool,
}

// ── Options ──────────────────────────────────────────────────────────────────

/// Per-connection options for the tool dialect.
#[derive(Debug, Clone, Copy)]
pub struct McpOptions {
    /// How elicitation (approval) requests are decided.
    pub approval_policy: ApprovalPolicy,
    /// Deadlines for this connection.
    pub timeouts: Timeouts,
}

impl Default for McpOptions {
    fn default() -> Self {
        Self {
            approval_policy: ApprovalPolicy::Interactive,
            timeouts: Timeouts::default(),
        }
    }
}

// ── Connection ───────────────────────────────────────────────────────────────

/// Live tool-dialect connection to one agent process.
#[derive(Debug)]
pub struct McpConnection {
    channel: RpcChannel,
    state: StateCell,
    tools: Arc<Mutex<Vec<ToolDescriptor>>>,
    process: ProcessHandle,
    cancel: CancellationToken,
    timeouts: Timeouts,
}

impl McpConnection {
    /// Spawn the agent described by `descriptor` and complete the tool
    /// handshake.
    ///
    /// Performs `initialize`, sends the `notifications/initialized`
    /// acknowledgement (no response expected), then fetches the full tool
    /// catalog. The connection is `ready` only after the catalog arrives.
    ///
    /// # Errors
    ///
    /// Same failure surface as [`crate::driver::acp::AcpConnection::connect`]:
    /// spawn failures and any handshake failure tear the process down and
    /// leave the connection in `error`.
    pub async fn connect(
        descriptor: &SpawnDescriptor,
        options: McpOptions,
        event_tx: mpsc::Sender<AgentEvent>,
    ) -> Result<Self> {
        let state = StateCell::new(event_tx.clone());
        state.set(ConnectionState::Connecting).await;

        let spawned = match spawn_agent(descriptor).await {
            Ok(spawned) => spawned,
            Err(err) => {
                state.set(ConnectionState::Error).await;
                return Err(err);
            }
        };

        let cancel = CancellationToken::new();
        let (outbound_tx, outbound_rx) = mpsc::channel(64);
        let channel = RpcChannel::new(outbound_tx.clone());
        let tools = Arc::new(Mutex::new(Vec::new()));

        tokio::spawn({
            let cancel = cancel.clone();
            async move {
                if let Err(err) = run_writer(spawned.stdin, outbound_rx, cancel).await {
                    warn!(%err, "mcp: writer task failed");
                }
            }
        });

        tokio::spawn(run_stderr_logger(
            spawned.stderr,
            event_tx.clone(),
            cancel.clone(),
        ));

        let handler = Arc::new(McpHandler {
            event_tx: event_tx.clone(),
            policy: options.approval_policy,
            ledger: ApprovalLedger::new(options.timeouts.request),
            channel: channel.clone(),
            tools: Arc::clone(&tools),
            request_timeout: options.timeouts.request,
        });

        tokio::spawn({
            let channel = channel.clone();
            let state = state.clone();
            let event_tx = event_tx.clone();
            let cancel = cancel.clone();
            async move {
                let exit = run_router(
                    spawned.stdout,
                    channel.clone(),
                    outbound_tx,
                    handler,
                    event_tx,
                    cancel,
                )
                .await;
                if matches!(exit, RouterExit::Eof | RouterExit::Io(_)) {
                    channel
                        .fail_all(|method| {
                            AppError::ProcessTerminated(format!(
                                "agent stream closed with '{method}' outstanding"
                            ))
                        })
                        .await;
                    state.set(ConnectionState::Closed).await;
                }
            }
        });

        let process = monitor_exit(spawned.pid, spawned.child);
        watch_process_exit(
            process.clone(),
            channel.clone(),
            state.clone(),
            event_tx.clone(),
        );

        state.set(ConnectionState::Connected).await;

        let connection = Self {
            channel,
            state,
            tools,
            process,
            cancel,
            timeouts: options.timeouts,
        };

        if let Err(err) = connection.handshake().await {
            warn!(%err, "mcp: handshake failed, tearing down");
            connection.abort_connect().await;
            return Err(err);
        }

        connection.state.set(ConnectionState::Ready).await;
        Ok(connection)
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state.current()
    }

    /// Last-known tool catalog.
    ///
    /// Replaced wholesale whenever the peer announces a change; never
    /// partially updated.
    pub async fn list_tools(&self) -> Vec<ToolDescriptor> {
        self.tools.lock().await.clone()
    }

    /// Invoke a tool by name.
    ///
    /// # Errors
    ///
    /// [`AppError::Protocol`] when the connection is not `ready`, plus the
    /// failure modes of [`RpcChannel::request`].
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolCallOutcome> {
        self.ensure_ready()?;
        let result = self
            .channel
            .request(
                "tools/call",
                json!({ "name": name, "arguments": arguments }),
                self.timeouts.request,
            )
            .await?;

        serde_json::from_value(result)
            .map_err(|e| AppError::Protocol(format!("malformed tools/call result: {e}")))
    }

    /// Tear the connection down.
    ///
    /// Fails every pending request with a "connection closed" error,
    /// terminates the process (graceful, then forceful), and discards any
    /// elicitation requests still awaiting a host decision.
    pub async fn disconnect(&self) {
        info!(pid = self.process.pid, "mcp: disconnecting");
        self.cancel.cancel();
        self.channel.fail_all(|_| AppError::ConnectionClosed).await;
        self.process.terminate(self.timeouts.terminate_grace).await;
        self.state.set(ConnectionState::Disconnected).await;
    }

    // ── Private ──────────────────────────────────────────────────────────

    async fn handshake(&self) -> Result<()> {
        self.state.set(ConnectionState::Initializing).await;

        self.channel
            .request(
                "initialize",
                json!({
                    "protocolVersion": "2025-06-18",
                    "capabilities": { "elicitation": {} },
                    "clientInfo": {
                        "name": "agent-conduit",
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                }),
                self.timeouts.handshake,
            )
            .await?;

        self.channel
            .notify("notifications/initialized", json!({}))
            .await?;

        let tools = fetch_tools(&self.channel, self.timeouts.handshake).await?;
        debug!(count = tools.len(), "mcp: tool catalog received");
        *self.tools.lock().await = tools;
        Ok(())
    }

    fn ensure_ready(&self) -> Result<()> {
        let state = self.state.current();
        if state == ConnectionState::Ready {
            Ok(())
        } else {
            Err(AppError::Protocol(format!(
                "connection is {state}, not ready"
            )))
        }
    }

    async fn abort_connect(&self) {
        self.state.set(ConnectionState::Error).await;
        self.cancel.cancel();
        self.channel.fail_all(|_| AppError::ConnectionClosed).await;
        self.process.terminate(self.timeouts.terminate_grace).await;
    }
}

/// Fetch the full tool catalog.
async fn fetch_tools(channel: &RpcChannel, deadline: Duration) -> Result<Vec<ToolDescriptor>> {
    let result = channel.request("tools/list", json!({}), deadline).await?;
    let parsed: ToolListResult = serde_json::from_value(result)
        .map_err(|e| AppError::Protocol(format!("malformed tools/list result: {e}")))?;
    Ok(parsed.tools)
}

// ── Inbound handler ──────────────────────────────────────────────────────────

/// Dispatches peer requests and notifications for one tool connection.
struct McpHandler {
    event_tx: mpsc::Sender<AgentEvent>,
    policy: ApprovalPolicy,
    ledger: ApprovalLedger,
    channel: RpcChannel,
    tools: Arc<Mutex<Vec<ToolDescriptor>>>,
    request_timeout: Duration,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ElicitationParams {
    #[serde(default = "default_elicitation_message")]
    message: String,
    #[serde(default)]
    call_id: Option<String>,
}

fn default_elicitation_message() -> String {
    "approval requested".to_owned()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventNoticeParams {
    #[serde(default)]
    kind: String,
    #[serde(default)]
    call_id: Option<String>,
}

fn elicitation_response(decision: ApprovalDecision) -> Value {
    match decision {
        ApprovalDecision::Approved => {
            json!({ "action": "accept", "content": { "decision": "approved" } })
        }
        ApprovalDecision::ApprovedForSession => {
            json!({ "action": "accept", "content": { "decision": "approved_for_session" } })
        }
        ApprovalDecision::Denied => json!({ "action": "decline" }),
        ApprovalDecision::Abort => json!({ "action": "cancel" }),
    }
}

impl InboundHandler for McpHandler {
    fn on_peer_request(
        &self,
        request: PeerRequest,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            match request.method.as_str() {
                "elicitation/create" => {
                    self.handle_elicitation(request.params, request.responder).await;
                }
                other => {
                    warn!(method = other, "mcp: unknown peer request method");
                    request
                        .responder
                        .error(METHOD_NOT_FOUND, &format!("method not found: {other}"))
                        .await;
                }
            }
        })
    }

    fn on_notification(
        &self,
        method: String,
        params: Value,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            match method.as_str() {
                "notifications/tools/list_changed" => self.refetch_tools(),
                "agent/event" => self.handle_event_notice(params).await,
                _ => {
                    debug!(
                        method = method.as_str(),
                        "mcp: unrecognized notification, re-emitting"
                    );
                    let _ = self
                        .event_tx
                        .send(AgentEvent::UnknownNotification { method, params })
                        .await;
                }
            }
        })
    }
}

impl McpHandler {
    /// Answer `elicitation/create` through the three-step decision policy:
    /// a buffered early decision wins, then the automatic policy, then the
    /// host.
    async fn handle_elicitation(&self, params: Value, responder: Responder) {
        let params: ElicitationParams = match serde_json::from_value(params) {
            Ok(p) => p,
            Err(e) => {
                responder
                    .error(INVALID_PARAMS, &format!("malformed elicitation: {e}"))
                    .await;
                return;
            }
        };

        if let Some(call_id) = params.call_id.as_deref() {
            if let Some(decision) = self.ledger.claim(call_id).await {
                debug!(call_id, ?decision, "mcp: applying buffered early decision");
                responder.ok(elicitation_response(decision)).await;
                return;
            }
        }

        if self.policy.is_automatic() {
            debug!(call_id = ?params.call_id, "mcp: auto-approving elicitation");
            responder
                .ok(elicitation_response(ApprovalDecision::Approved))
                .await;
            return;
        }

        let (request, rx) = ApprovalRequest::new(
            params.call_id.unwrap_or_default(),
            params.message,
        );

        if self
            .event_tx
            .send(AgentEvent::ApprovalRequested(request))
            .await
            .is_err()
        {
            // Nobody is listening; answer rather than hang the agent.
            responder
                .ok(elicitation_response(ApprovalDecision::Abort))
                .await;
            return;
        }

        tokio::spawn(async move {
            let decision = rx.await.unwrap_or(ApprovalDecision::Abort);
            responder.ok(elicitation_response(decision)).await;
        });
    }

    /// Buffer an early decision when the general event stream wins the
    /// race against the formal elicitation request.
    async fn handle_event_notice(&self, params: Value) {
        let notice: EventNoticeParams = match serde_json::from_value(params) {
            Ok(p) => p,
            Err(e) => {
                debug!(%e, "mcp: malformed agent/event notification, skipping");
                return;
            }
        };

        if notice.kind != "approval_request" {
            debug!(kind = notice.kind.as_str(), "mcp: agent event without approval marker");
            return;
        }

        if !self.policy.is_automatic() {
            // Interactive hosts decide on the formal request itself.
            return;
        }

        if let Some(call_id) = notice.call_id.as_deref() {
            self.ledger.record(call_id, ApprovalDecision::Approved).await;
        }
    }

    /// Replace the catalog after a change notification.
    ///
    /// Runs off the dispatch path; a failed re-fetch surfaces as a fault
    /// event because no caller is on the stack to receive an `Err`.
    fn refetch_tools(&self) {
        let channel = self.channel.clone();
        let tools = Arc::clone(&self.tools);
        let event_tx = self.event_tx.clone();
        let deadline = self.request_timeout;

        tokio::spawn(async move {
            match fetch_tools(&channel, deadline).await {
                Ok(new_tools) => {
                    debug!(count = new_tools.len(), "mcp: tool catalog replaced");
                    *tools.lock().await = new_tools.clone();
                    let _ = event_tx
                        .send(AgentEvent::ToolsChanged { tools: new_tools })
                        .await;
                }
                Err(err) => {
                    warn!(%err, "mcp: tool catalog refresh failed");
                    let _ = event_tx
                        .send(AgentEvent::Fault {
                            message: format!("tool catalog refresh failed: {err}"),
                        })
                        .await;
                }
            }
        });
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
