//! Error types shared across the application.

use std::fmt::{Display, Formatter};
use std::time::Duration;

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Agent executable could not be spawned.
    Spawn(String),
    /// Remote peer answered an outbound request with a structured error.
    Rpc {
        /// JSON-RPC error code.
        code: i64,
        /// Human-readable error message from the peer.
        message: String,
        /// Optional structured error payload.
        data: Option<serde_json::Value>,
    },
    /// No response arrived within the request deadline.
    Timeout {
        /// Method name of the request that timed out.
        method: String,
        /// Deadline that elapsed.
        deadline: Duration,
    },
    /// Agent process exited while the request was outstanding.
    ProcessTerminated(String),
    /// Connection was torn down while the request was outstanding.
    ConnectionClosed,
    /// Protocol-level decode or state failure.
    Protocol(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Spawn(msg) => write!(f, "spawn: {msg}"),
            Self::Rpc { code, message, .. } => write!(f, "rpc error {code}: {message}"),
            Self::Timeout { method, deadline } => {
                write!(f, "timeout: no response to '{method}' within {deadline:?}")
            }
            Self::ProcessTerminated(msg) => write!(f, "process terminated: {msg}"),
            Self::ConnectionClosed => write!(f, "connection closed"),
            Self::Protocol(msg) => write!(f, "protocol: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
