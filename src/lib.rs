#![forbid(unsafe_code)]

//! `agent-conduit` — drive command-line AI agents through one abstraction.
//!
//! Each agent runs as a subprocess speaking newline-delimited JSON-RPC
//! over stdio. Two protocol dialects are supported: a session dialect
//! (initialize → new session → prompt → streamed updates, with host
//! callbacks for permissions and file I/O) and a tool dialect (tool
//! discovery → invocation, with host callbacks for approvals). The
//! [`client::AgentClient`] façade owns at most one live connection and is
//! the only surface a host application needs.

pub mod client;
pub mod config;
pub mod driver;
pub mod errors;
pub mod rpc;
pub mod spawn;

pub use client::{AgentClient, Dialect};
pub use errors::{AppError, Result};
