//! Host-facing connection façade.
//!
//! [`AgentClient`] is the only surface the host application sees. It owns
//! at most one live adapter at a time — session dialect or tool dialect —
//! and forwards the imperative call surface to whichever is active. All
//! connection events flow through the single event channel the client was
//! built with.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};

use crate::driver::acp::{AcpConnection, AcpOptions, SessionInfo};
use crate::driver::mcp::{McpConnection, McpOptions, ToolCallOutcome, ToolDescriptor};
use crate::driver::{AgentEvent, ConnectionState};
use crate::spawn::SpawnDescriptor;
use crate::{AppError, Result};

/// Which protocol dialect an agent speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    /// Session dialect: persistent session, prompts, streamed updates.
    Acp,
    /// Tool dialect: discoverable, individually invocable tools.
    Mcp,
}

#[derive(Debug)]
enum ActiveConnection {
    Acp(AcpConnection),
    Mcp(McpConnection),
}

/// Per-host agent client owning at most one live connection.
///
/// Operations clone the active connection handle out of the slot before
/// awaiting, so a long-running prompt never blocks `disconnect`.
#[derive(Debug)]
pub struct AgentClient {
    event_tx: mpsc::Sender<AgentEvent>,
    active: Mutex<Option<Arc<ActiveConnection>>>,
}

impl AgentClient {
    /// Create a client whose connections emit events into `event_tx`.
    #[must_use]
    pub fn new(event_tx: mpsc::Sender<AgentEvent>) -> Self {
        Self {
            event_tx,
            active: Mutex::new(None),
        }
    }

    /// Connect to a session-dialect agent.
    ///
    /// # Errors
    ///
    /// [`AppError::Protocol`] when a connection is already active, plus
    /// the failure surface of [`AcpConnection::connect`].
    pub async fn connect_acp(
        &self,
        descriptor: &SpawnDescriptor,
        options: AcpOptions,
    ) -> Result<()> {
        let mut active = self.active.lock().await;
        if active.is_some() {
            return Err(AppError::Protocol(
                "a connection is already active; disconnect first".into(),
            ));
        }
        let connection =
            AcpConnection::connect(descriptor, options, self.event_tx.clone()).await?;
        *active = Some(Arc::new(ActiveConnection::Acp(connection)));
        Ok(())
    }

    /// Connect to a tool-dialect agent.
    ///
    /// # Errors
    ///
    /// [`AppError::Protocol`] when a connection is already active, plus
    /// the failure surface of [`McpConnection::connect`].
    pub async fn connect_mcp(
        &self,
        descriptor: &SpawnDescriptor,
        options: McpOptions,
    ) -> Result<()> {
        let mut active = self.active.lock().await;
        if active.is_some() {
            return Err(AppError::Protocol(
                "a connection is already active; disconnect first".into(),
            ));
        }
        let connection =
            McpConnection::connect(descriptor, options, self.event_tx.clone()).await?;
        *active = Some(Arc::new(ActiveConnection::Mcp(connection)));
        Ok(())
    }

    /// State of the active connection, or `disconnected` when none exists.
    pub async fn state(&self) -> ConnectionState {
        match self.snapshot().await {
            Some(active) => match active.as_ref() {
                ActiveConnection::Acp(c) => c.state(),
                ActiveConnection::Mcp(c) => c.state(),
            },
            None => ConnectionState::Disconnected,
        }
    }

    /// Session metadata of the active session-dialect connection.
    pub async fn session(&self) -> Option<SessionInfo> {
        match self.acp().await {
            Ok(active) => {
                let ActiveConnection::Acp(c) = active.as_ref() else {
                    return None;
                };
                c.session().await
            }
            Err(_) => None,
        }
    }

    /// Send a prompt; session dialect only. Returns the stop reason.
    ///
    /// # Errors
    ///
    /// [`AppError::Protocol`] without an active session-dialect
    /// connection, plus the failure surface of [`AcpConnection::prompt`].
    pub async fn prompt(&self, text: &str) -> Result<String> {
        let active = self.acp().await?;
        let ActiveConnection::Acp(c) = active.as_ref() else {
            return Err(AppError::Protocol(
                "no active session-dialect connection".into(),
            ));
        };
        c.prompt(text).await
    }

    /// Switch the active agent mode; session dialect only.
    ///
    /// # Errors
    ///
    /// Same surface as [`Self::prompt`].
    pub async fn set_mode(&self, mode_id: &str) -> Result<()> {
        let active = self.acp().await?;
        let ActiveConnection::Acp(c) = active.as_ref() else {
            return Err(AppError::Protocol(
                "no active session-dialect connection".into(),
            ));
        };
        c.set_mode(mode_id).await
    }

    /// Switch the active model; session dialect only.
    ///
    /// # Errors
    ///
    /// Same surface as [`Self::prompt`].
    pub async fn set_model(&self, model_id: &str) -> Result<()> {
        let active = self.acp().await?;
        let ActiveConnection::Acp(c) = active.as_ref() else {
            return Err(AppError::Protocol(
                "no active session-dialect connection".into(),
            ));
        };
        c.set_model(model_id).await
    }

    /// Change a named configuration option; session dialect only.
    ///
    /// # Errors
    ///
    /// Same surface as [`Self::prompt`].
    pub async fn set_config_option(&self, key: &str, value: Value) -> Result<()> {
        let active = self.acp().await?;
        let ActiveConnection::Acp(c) = active.as_ref() else {
            return Err(AppError::Protocol(
                "no active session-dialect connection".into(),
            ));
        };
        c.set_config_option(key, value).await
    }

    /// Last-known tool catalog; tool dialect only.
    ///
    /// # Errors
    ///
    /// [`AppError::Protocol`] without an active tool-dialect connection.
    pub async fn list_tools(&self) -> Result<Vec<ToolDescriptor>> {
        let active = self.mcp().await?;
        let ActiveConnection::Mcp(c) = active.as_ref() else {
            return Err(AppError::Protocol(
                "no active tool-dialect connection".into(),
            ));
        };
        Ok(c.list_tools().await)
    }

    /// Invoke a tool; tool dialect only.
    ///
    /// # Errors
    ///
    /// [`AppError::Protocol`] without an active tool-dialect connection,
    /// plus the failure surface of [`McpConnection::call_tool`].
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolCallOutcome> {
        let active = self.mcp().await?;
        let ActiveConnection::Mcp(c) = active.as_ref() else {
            return Err(AppError::Protocol(
                "no active tool-dialect connection".into(),
            ));
        };
        c.call_tool(name, arguments).await
    }

    /// Tear down the active connection, if any. Idempotent.
    pub async fn disconnect(&self) {
        let taken = self.active.lock().await.take();
        if let Some(active) = taken {
            match active.as_ref() {
                ActiveConnection::Acp(c) => c.disconnect().await,
                ActiveConnection::Mcp(c) => c.disconnect().await,
            }
        }
    }

    // ── Private ──────────────────────────────────────────────────────────

    async fn snapshot(&self) -> Option<Arc<ActiveConnection>> {
        self.active.lock().await.clone()
    }

    async fn acp(&self) -> Result<Arc<ActiveConnection>> {
        match self.snapshot().await {
            Some(active) if matches!(active.as_ref(), ActiveConnection::Acp(_)) => Ok(active),
            _ => Err(AppError::Protocol(
                "no active session-dialect connection".into(),
            )),
        }
    }

    async fn mcp(&self) -> Result<Arc<ActiveConnection>> {
        match self.snapshot().await {
            Some(active) if matches!(active.as_ref(), ActiveConnection::Mcp(_)) => Ok(active),
            _ => Err(AppError::Protocol(
                "no active tool-dialect connection".into(),
            )),
        }
    }
}
