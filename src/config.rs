//! Agent catalog configuration parsing and validation.
//!
//! The transport core consumes fully-formed spawn descriptors; this module
//! is the collaborator that produces them. A TOML file names the installed
//! agents (command, arguments, dialect), the connection deadlines, and the
//! approval policy. Environment sanitization happens here too: the child
//! process inherits only the allowlisted variables plus the per-agent
//! extras, never the host's full environment.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::client::Dialect;
use crate::driver::{ApprovalPolicy, Timeouts};
use crate::spawn::SpawnDescriptor;
use crate::{AppError, Result};

// ── Environment allowlist ────────────────────────────────────────────────────

/// Environment variables inherited by spawned agent processes.
///
/// Everything else from the host's environment is stripped before launch,
/// so credentials and tokens living in the host process never leak into an
/// agent. Per-agent extras from the catalog are layered on top.
pub const ALLOWED_ENV_VARS: &[&str] = &[
    "PATH",
    "HOME",
    "LANG",
    "TERM",
    "RUST_LOG",
    // Windows-specific variables.
    "USERPROFILE",
    "SystemRoot",
    "TEMP",
    "TMP",
    "USERNAME",
    "APPDATA",
    "LOCALAPPDATA",
    "COMSPEC",
];

/// Build a sanitized environment map: the allowlisted variables currently
/// set in the host's environment, overlaid with `extra`.
#[must_use]
pub fn sanitized_env(extra: &HashMap<String, String>) -> HashMap<String, String> {
    let mut env = HashMap::new();
    for &key in ALLOWED_ENV_VARS {
        if let Ok(value) = std::env::var(key) {
            env.insert(key.to_owned(), value);
        }
    }
    for (key, value) in extra {
        env.insert(key.clone(), value.clone());
    }
    env
}

// ── Catalog entries ──────────────────────────────────────────────────────────

/// One installed agent the host may connect to.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct AgentEntry {
    /// Executable to spawn (e.g., `claude`, `codex`).
    pub command: String,
    /// Arguments passed before any connection-specific ones.
    #[serde(default)]
    pub args: Vec<String>,
    /// Protocol dialect this agent speaks.
    pub dialect: Dialect,
    /// Extra environment variables for this agent (API keys, flags).
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Configurable deadlines (seconds) for connections.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TimeoutConfig {
    /// General request deadline.
    #[serde(default = "default_request_seconds")]
    pub request_seconds: u64,
    /// Initialize / new-session handshake deadline.
    #[serde(default = "default_handshake_seconds")]
    pub handshake_seconds: u64,
    /// Grace period between polite and forceful termination.
    #[serde(default = "default_terminate_grace_seconds")]
    pub terminate_grace_seconds: u64,
}

fn default_request_seconds() -> u64 {
    600
}

fn default_handshake_seconds() -> u64 {
    60
}

fn default_terminate_grace_seconds() -> u64 {
    3
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            request_seconds: default_request_seconds(),
            handshake_seconds: default_handshake_seconds(),
            terminate_grace_seconds: default_terminate_grace_seconds(),
        }
    }
}

impl TimeoutConfig {
    /// Convert to the duration form the adapters consume.
    #[must_use]
    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            request: std::time::Duration::from_secs(self.request_seconds),
            handshake: std::time::Duration::from_secs(self.handshake_seconds),
            terminate_grace: std::time::Duration::from_secs(self.terminate_grace_seconds),
        }
    }
}

fn default_approval_policy() -> ApprovalPolicy {
    ApprovalPolicy::Interactive
}

/// Global configuration parsed from `conduit.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ConduitConfig {
    /// Installed agents, keyed by the name used on the command line.
    pub agents: HashMap<String, AgentEntry>,
    /// Connection deadlines.
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// How permission and approval requests are decided.
    #[serde(default = "default_approval_policy")]
    pub approval_policy: ApprovalPolicy,
}

impl ConduitConfig {
    /// Parse and validate a configuration from TOML text.
    ///
    /// # Errors
    ///
    /// [`AppError::Config`] on syntax errors or failed validation.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Look up an agent and produce its fully-formed spawn descriptor.
    ///
    /// # Errors
    ///
    /// [`AppError::Config`] when `name` is not in the catalog.
    pub fn spawn_descriptor(&self, name: &str, workspace: &Path) -> Result<(SpawnDescriptor, Dialect)> {
        let entry = self.agents.get(name).ok_or_else(|| {
            AppError::Config(format!("agent '{name}' is not in the catalog"))
        })?;

        let descriptor = SpawnDescriptor {
            command: entry.command.clone(),
            args: entry.args.clone(),
            working_dir: PathBuf::from(workspace),
            env: sanitized_env(&entry.env),
        };
        Ok((descriptor, entry.dialect))
    }

    fn validate(&self) -> Result<()> {
        if self.agents.is_empty() {
            return Err(AppError::Config(
                "catalog must name at least one agent".into(),
            ));
        }
        for (name, entry) in &self.agents {
            if entry.command.trim().is_empty() {
                return Err(AppError::Config(format!(
                    "agent '{name}' has an empty command"
                )));
            }
        }
        if self.timeouts.handshake_seconds == 0 || self.timeouts.request_seconds == 0 {
            return Err(AppError::Config("timeouts must be non-zero".into()));
        }
        Ok(())
    }
}
