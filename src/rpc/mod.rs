//! JSON-RPC transport over an agent subprocess's stdio.
//!
//! Each connection owns one subprocess and speaks newline-delimited
//! JSON-RPC 2.0 over its stdin/stdout. The submodules split the transport
//! into its layers:
//! - `codec`: [`LinesCodec`](tokio_util::codec::LinesCodec)-based stream
//!   framing for NDJSON messages.
//! - `channel`: outbound request correlation — id allocation, the pending
//!   table, deadline timers, and the stdin writer task.
//! - `router`: inbound classification — response, peer-initiated request,
//!   or notification — and dispatch to the active protocol adapter.

pub mod channel;
pub mod codec;
pub mod router;

use serde_json::{json, Value};

/// Envelope marker carried by every message in both directions.
pub const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC error code for an unrecognized method.
pub const METHOD_NOT_FOUND: i64 = -32601;

/// JSON-RPC error code for malformed request parameters.
pub const INVALID_PARAMS: i64 = -32602;

/// JSON-RPC error code for a failure while handling a valid request.
pub const INTERNAL_ERROR: i64 = -32603;

/// Structured error object carried in an error response.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RpcErrorObject {
    /// Numeric error code.
    pub code: i64,
    /// Human-readable error message.
    pub message: String,
    /// Optional structured payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Build an outbound request frame.
#[must_use]
pub fn request_frame(id: u64, method: &str, params: Value) -> Value {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "method": method,
        "params": params,
    })
}

/// Build an outbound notification frame (no `id`, no response expected).
#[must_use]
pub fn notification_frame(method: &str, params: Value) -> Value {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "method": method,
        "params": params,
    })
}

/// Build a success response to a peer-initiated request.
///
/// The `id` is echoed verbatim — peers may use string or integer ids for
/// their own requests.
#[must_use]
pub fn response_frame(id: &Value, result: Value) -> Value {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "result": result,
    })
}

/// Build an error response to a peer-initiated request.
#[must_use]
pub fn error_frame(id: &Value, code: i64, message: &str) -> Value {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "error": { "code": code, "message": message },
    })
}
