//! Session-dialect protocol adapter.
//!
//! Drives an agent through the session lifecycle: spawn, `initialize`,
//! `session/new`, then prompts and configuration changes against the live
//! session. Streaming output arrives as `session/update` notifications and
//! is decoded by [`crate::driver::updates`]; the agent calls back into the
//! host for permission grants (`session/request_permission`) and file I/O
//! (`fs/read_text_file`, `fs/write_text_file`).
//!
//! Both handshake steps must succeed before the connection reaches
//! `ready`; failure of either leaves it in `error` with no usable session.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::driver::updates::parse_session_update;
use crate::driver::{
    watch_process_exit, AgentEvent, ApprovalPolicy, ConnectionState, FsReadRequest,
    FsWriteRequest, PermissionDecision, PermissionOption, PermissionRequest, StateCell, Timeouts,
};
use crate::rpc::channel::{run_writer, RpcChannel};
use crate::rpc::router::{run_router, InboundHandler, PeerRequest, RouterExit};
use crate::rpc::{INTERNAL_ERROR, INVALID_PARAMS, METHOD_NOT_FOUND};
use crate::spawn::{monitor_exit, run_stderr_logger, spawn_agent, ProcessHandle, SpawnDescriptor};
use crate::{AppError, Result};

// ── Session metadata ─────────────────────────────────────────────────────────

/// An agent mode offered by the session.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ModeInfo {
    /// Mode identifier used in `session/set_mode`.
    #[serde(rename = "id")]
    pub mode_id: String,
    /// Human-readable name.
    pub name: String,
}

/// A model offered by the session.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelInfo {
    /// Model identifier used in `session/set_model`.
    pub model_id: String,
    /// Human-readable name.
    pub name: String,
}

/// One configuration option exposed by the session.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigOption {
    /// Option identifier used in `session/set_config_option`.
    #[serde(alias = "configId")]
    pub id: String,
    /// Human-readable name, when reported.
    #[serde(default)]
    pub name: Option<String>,
    /// Value type hint (`string`, `boolean`, `select`, …).
    #[serde(rename = "type", default)]
    pub option_type: Option<String>,
    /// Current value, when reported.
    #[serde(default)]
    pub current_value: Option<Value>,
}

/// Server-assigned session created by the handshake.
///
/// Lives for the connection's lifetime; mutated by configuration-change
/// calls; never persisted.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    /// Opaque server-assigned identifier.
    pub session_id: String,
    /// Modes the agent offers.
    pub modes: Vec<ModeInfo>,
    /// Currently active mode.
    pub current_mode: Option<String>,
    /// Models the agent offers.
    pub models: Vec<ModelInfo>,
    /// Currently active model.
    pub current_model: Option<String>,
    /// Configuration options the agent exposes.
    pub config_options: Vec<ConfigOption>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModeState {
    #[serde(default)]
    current_mode_id: Option<String>,
    #[serde(default)]
    available_modes: Vec<ModeInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModelState {
    #[serde(default)]
    current_model_id: Option<String>,
    #[serde(default)]
    available_models: Vec<ModelInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NewSessionResult {
    session_id: String,
    #[serde(default)]
    modes: Option<ModeState>,
    #[serde(default)]
    models: Option<ModelState>,
    #[serde(default)]
    config_options: Vec<ConfigOption>,
}

// ── Options ──────────────────────────────────────────────────────────────────

/// Per-connection options for the session dialect.
#[derive(Debug, Clone, Copy)]
pub struct AcpOptions {
    /// How permission requests are decided.
    pub approval_policy: ApprovalPolicy,
    /// Deadlines for this connection.
    pub timeouts: Timeouts,
}

impl Default for AcpOptions {
    fn default() -> Self {
        Self {
            approval_policy: ApprovalPolicy::Interactive,
            timeouts: Timeouts::default(),
        }
    }
}

// ── Connection ───────────────────────────────────────────────────────────────

/// Live session-dialect connection to one agent process.
#[derive(Debug)]
pub struct AcpConnection {
    channel: RpcChannel,
    state: StateCell,
    session: Arc<Mutex<Option<SessionInfo>>>,
    process: ProcessHandle,
    cancel: CancellationToken,
    timeouts: Timeouts,
}

impl AcpConnection {
    /// Spawn the agent described by `descriptor` and complete the session
    /// handshake.
    ///
    /// Performs, in strict sequence and each under the handshake deadline:
    /// `initialize` (protocol version + host identity), then `session/new`
    /// scoped to the descriptor's working directory. The connection is
    /// `ready` only after both succeed.
    ///
    /// # Errors
    ///
    /// - [`AppError::Spawn`] — the executable is missing or unusable; the
    ///   connection ends in `error`.
    /// - Any handshake failure (RPC error, timeout, process exit) — the
    ///   process is torn down and the connection ends in `error`.
    pub async fn connect(
        descriptor: &SpawnDescriptor,
        options: AcpOptions,
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

        tokio::spawn({
            let cancel = cancel.clone();
            async move {
                if let Err(err) = run_writer(spawned.stdin, outbound_rx, cancel).await {
                    warn!(%err, "acp: writer task failed");
                }
            }
        });

        tokio::spawn(run_stderr_logger(
            spawned.stderr,
            event_tx.clone(),
            cancel.clone(),
        ));

        let handler = Arc::new(AcpHandler {
            event_tx: event_tx.clone(),
            auto_approve: options.approval_policy.is_automatic(),
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
            session: Arc::new(Mutex::new(None)),
            process,
            cancel,
            timeouts: options.timeouts,
        };

        if let Err(err) = connection.handshake(descriptor).await {
            warn!(%err, "acp: handshake failed, tearing down");
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

    /// Snapshot of the live session, if the handshake completed.
    pub async fn session(&self) -> Option<SessionInfo> {
        self.session.lock().await.clone()
    }

    /// Send a prompt and suspend until the turn ends.
    ///
    /// Plain text is wrapped into the protocol's content-block list.
    /// Streamed output arrives through the event channel while this call
    /// is suspended; the returned value is the peer's stop reason.
    ///
    /// # Errors
    ///
    /// [`AppError::Protocol`] when the connection is not `ready`, plus the
    /// failure modes of [`RpcChannel::request`].
    pub async fn prompt(&self, text: &str) -> Result<String> {
        let session_id = self.ready_session().await?;
        let result = self
            .channel
            .request(
                "session/prompt",
                json!({
                    "sessionId": session_id,
                    "prompt": [{ "type": "text", "text": text }],
                }),
                self.timeouts.request,
            )
            .await?;

        Ok(result
            .get("stopReason")
            .and_then(Value::as_str)
            .unwrap_or("end_turn")
            .to_owned())
    }

    /// Switch the active agent mode.
    ///
    /// # Errors
    ///
    /// Same surface as [`Self::prompt`].
    pub async fn set_mode(&self, mode_id: &str) -> Result<()> {
        let session_id = self.ready_session().await?;
        self.channel
            .request(
                "session/set_mode",
                json!({ "sessionId": session_id, "modeId": mode_id }),
                self.timeouts.request,
            )
            .await?;

        if let Some(session) = self.session.lock().await.as_mut() {
            session.current_mode = Some(mode_id.to_owned());
        }
        Ok(())
    }

    /// Switch the active model.
    ///
    /// Tries the dedicated `session/set_model` call first; when the peer
    /// rejects it with an RPC-level error (e.g. unsupported), falls back
    /// transparently to `session/set_config_option` with key `model`. This
    /// is the only built-in fallback the transport performs.
    ///
    /// # Errors
    ///
    /// Same surface as [`Self::prompt`]; an RPC rejection of the fallback
    /// call is surfaced as-is.
    pub async fn set_model(&self, model_id: &str) -> Result<()> {
        let session_id = self.ready_session().await?;
        let attempt = self
            .channel
            .request(
                "session/set_model",
                json!({ "sessionId": session_id, "modelId": model_id }),
                self.timeouts.request,
            )
            .await;

        match attempt {
            Ok(_) => {
                if let Some(session) = self.session.lock().await.as_mut() {
                    session.current_model = Some(model_id.to_owned());
                }
                Ok(())
            }
            Err(AppError::Rpc { code, message, .. }) => {
                info!(
                    code,
                    message = message.as_str(),
                    "acp: set_model rejected, falling back to config option"
                );
                self.set_config_option("model", json!(model_id)).await
            }
            Err(err) => Err(err),
        }
    }

    /// Change an arbitrary named configuration option.
    ///
    /// # Errors
    ///
    /// Same surface as [`Self::prompt`].
    pub async fn set_config_option(&self, key: &str, value: Value) -> Result<()> {
        let session_id = self.ready_session().await?;
        self.channel
            .request(
                "session/set_config_option",
                json!({ "sessionId": session_id, "configId": key, "value": value }),
                self.timeouts.request,
            )
            .await?;

        let mut session = self.session.lock().await;
        if let Some(session) = session.as_mut() {
            if key == "model" {
                session.current_model = value.as_str().map(str::to_owned);
            }
            if let Some(option) = session.config_options.iter_mut().find(|o| o.id == key) {
                option.current_value = Some(value);
            }
        }
        Ok(())
    }

    /// Ask the agent to stop its current turn (fire-and-forget).
    ///
    /// # Errors
    ///
    /// Returns [`AppError::ConnectionClosed`] if the writer task is gone.
    pub async fn cancel_turn(&self) -> Result<()> {
        let session_id = self.ready_session().await?;
        self.channel
            .notify("session/cancel", json!({ "sessionId": session_id }))
            .await
    }

    /// Tear the connection down.
    ///
    /// Fails every pending request with a "connection closed" error,
    /// terminates the process (graceful, then forceful), and discards any
    /// remote-initiated requests still awaiting a host decision — their
    /// resolvers become no-ops.
    pub async fn disconnect(&self) {
        info!(pid = self.process.pid, "acp: disconnecting");
        self.cancel.cancel();
        self.channel.fail_all(|_| AppError::ConnectionClosed).await;
        self.process.terminate(self.timeouts.terminate_grace).await;
        self.state.set(ConnectionState::Disconnected).await;
    }

    // ── Private ──────────────────────────────────────────────────────────

    async fn handshake(&self, descriptor: &SpawnDescriptor) -> Result<()> {
        self.state.set(ConnectionState::Initializing).await;

        self.channel
            .request(
                "initialize",
                json!({
                    "protocolVersion": 1,
                    "clientInfo": {
                        "name": "agent-conduit",
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                    "clientCapabilities": {
                        "fs": { "readTextFile": true, "writeTextFile": true },
                    },
                }),
                self.timeouts.handshake,
            )
            .await?;

        let result = self
            .channel
            .request(
                "session/new",
                json!({
                    "cwd": descriptor.working_dir.to_string_lossy(),
                    "mcpServers": [],
                }),
                self.timeouts.handshake,
            )
            .await?;

        let parsed: NewSessionResult = serde_json::from_value(result)
            .map_err(|e| AppError::Protocol(format!("malformed session/new result: {e}")))?;

        let modes = parsed.modes.unwrap_or(ModeState {
            current_mode_id: None,
            available_modes: Vec::new(),
        });
        let models = parsed.models.unwrap_or(ModelState {
            current_model_id: None,
            available_models: Vec::new(),
        });

        let info = SessionInfo {
            session_id: parsed.session_id,
            modes: modes.available_modes,
            current_mode: modes.current_mode_id,
            models: models.available_models,
            current_model: models.current_model_id,
            config_options: parsed.config_options,
        };

        debug!(
            session_id = info.session_id.as_str(),
            models = info.models.len(),
            "acp: session established"
        );
        *self.session.lock().await = Some(info);
        Ok(())
    }

    async fn ready_session(&self) -> Result<String> {
        let state = self.state.current();
        if state != ConnectionState::Ready {
            return Err(AppError::Protocol(format!(
                "connection is {state}, not ready"
            )));
        }
        self.session
            .lock()
            .await
            .as_ref()
            .map(|s| s.session_id.clone())
            .ok_or_else(|| AppError::Protocol("no active session".into()))
    }

    async fn abort_connect(&self) {
        self.state.set(ConnectionState::Error).await;
        self.cancel.cancel();
        self.channel.fail_all(|_| AppError::ConnectionClosed).await;
        self.process.terminate(self.timeouts.terminate_grace).await;
    }
}

// ── Inbound handler ──────────────────────────────────────────────────────────

/// Dispatches peer requests and notifications for one session connection.
struct AcpHandler {
    event_tx: mpsc::Sender<AgentEvent>,
    auto_approve: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PermissionParams {
    #[serde(default)]
    session_id: String,
    #[serde(default)]
    tool_call: Option<Value>,
    options: Vec<PermissionOption>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FsReadParams {
    path: std::path::PathBuf,
    #[serde(default)]
    line: Option<u64>,
    #[serde(default)]
    limit: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FsWriteParams {
    path: std::path::PathBuf,
    content: String,
}

fn selected_outcome(option_id: &str) -> Value {
    json!({ "outcome": { "outcome": "selected", "optionId": option_id } })
}

fn cancelled_outcome() -> Value {
    json!({ "outcome": { "outcome": "cancelled" } })
}

impl InboundHandler for AcpHandler {
    fn on_peer_request(
        &self,
        request: PeerRequest,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            match request.method.as_str() {
                "session/request_permission" => {
                    self.handle_permission(request.params, request.responder).await;
                }
                "fs/read_text_file" => {
                    self.handle_fs_read(request.params, request.responder).await;
                }
                "fs/write_text_file" => {
                    self.handle_fs_write(request.params, request.responder).await;
                }
                other => {
                    warn!(method = other, "acp: unknown peer request method");
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
            if method == "session/update" {
                match parse_session_update(&params) {
                    Ok(Some(event)) => {
                        let _ = self.event_tx.send(event).await;
                    }
                    Ok(None) => {}
                    Err(err) => {
                        warn!(%err, "acp: malformed session update, skipping");
                    }
                }
            } else {
                debug!(method = method.as_str(), "acp: unrecognized notification, re-emitting");
                let _ = self
                    .event_tx
                    .send(AgentEvent::UnknownNotification { method, params })
                    .await;
            }
        })
    }
}

impl AcpHandler {
    /// Answer `session/request_permission` per the configured policy.
    async fn handle_permission(
        &self,
        params: Value,
        responder: crate::rpc::router::Responder,
    ) {
        let params: PermissionParams = match serde_json::from_value(params) {
            Ok(p) => p,
            Err(e) => {
                responder
                    .error(INVALID_PARAMS, &format!("malformed permission request: {e}"))
                    .await;
                return;
            }
        };

        if self.auto_approve {
            if let Some(first) = params.options.first() {
                debug!(
                    option_id = first.option_id.as_str(),
                    "acp: auto-approving permission with first offered option"
                );
                responder.ok(selected_outcome(&first.option_id)).await;
                return;
            }
        }

        let title = params
            .tool_call
            .as_ref()
            .and_then(|tc| tc.get("title"))
            .and_then(Value::as_str)
            .unwrap_or("tool call")
            .to_owned();

        let (request, rx) = PermissionRequest::new(params.session_id, title, params.options);

        if self
            .event_tx
            .send(AgentEvent::PermissionRequested(request))
            .await
            .is_err()
        {
            // Nobody is listening; answer rather than hang the agent.
            responder.ok(cancelled_outcome()).await;
            return;
        }

        tokio::spawn(async move {
            let outcome = match rx.await {
                Ok(PermissionDecision::Selected { option_id }) => selected_outcome(&option_id),
                Ok(PermissionDecision::Cancelled) | Err(_) => cancelled_outcome(),
            };
            responder.ok(outcome).await;
        });
    }

    /// Surface `fs/read_text_file` to the host and relay the content back.
    async fn handle_fs_read(&self, params: Value, responder: crate::rpc::router::Responder) {
        let params: FsReadParams = match serde_json::from_value(params) {
            Ok(p) => p,
            Err(e) => {
                responder
                    .error(INVALID_PARAMS, &format!("malformed fs/read_text_file: {e}"))
                    .await;
                return;
            }
        };

        let (request, rx) = FsReadRequest::new(params.path, params.line, params.limit);

        if self
            .event_tx
            .send(AgentEvent::FsReadRequested(request))
            .await
            .is_err()
        {
            responder
                .error(INTERNAL_ERROR, "no host available for file access")
                .await;
            return;
        }

        tokio::spawn(async move {
            match rx.await {
                Ok(Ok(content)) => responder.ok(json!({ "content": content })).await,
                Ok(Err(err)) => responder.error(INTERNAL_ERROR, &err.to_string()).await,
                Err(_) => {
                    responder
                        .error(INTERNAL_ERROR, "file request abandoned by host")
                        .await;
                }
            }
        });
    }

    /// Surface `fs/write_text_file` to the host and relay the outcome back.
    async fn handle_fs_write(&self, params: Value, responder: crate::rpc::router::Responder) {
        let params: FsWriteParams = match serde_json::from_value(params) {
            Ok(p) => p,
            Err(e) => {
                responder
                    .error(INVALID_PARAMS, &format!("malformed fs/write_text_file: {e}"))
                    .await;
                return;
            }
        };

        let (request, rx) = FsWriteRequest::new(params.path, params.content);

        if self
            .event_tx
            .send(AgentEvent::FsWriteRequested(request))
            .await
            .is_err()
        {
            responder
                .error(INTERNAL_ERROR, "no host available for file access")
                .await;
            return;
        }

        tokio::spawn(async move {
            match rx.await {
                Ok(Ok(())) => responder.ok(Value::Null).await,
                Ok(Err(err)) => responder.error(INTERNAL_ERROR, &err.to_string()).await,
                Err(_) => {
                    responder
                        .error(INTERNAL_ERROR, "file request abandoned by host")
                        .await;
                }
            }
        });
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
