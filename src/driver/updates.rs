//! Decoding of streamed `session/update` notifications.
//!
//! The session dialect multiplexes all streaming output through a single
//! notification whose payload carries a `sessionUpdate` discriminator.
//! Each known sub-variant decodes into its own typed [`AgentEvent`];
//! unrecognized sub-variants are ignored without error so new update kinds
//! never break older hosts.
//!
//! # Known sub-variants
//!
//! | `sessionUpdate`       | Maps to                           |
//! |-----------------------|-----------------------------------|
//! | `agent_message_chunk` | [`AgentEvent::MessageChunk`]      |
//! | `agent_thought_chunk` | [`AgentEvent::ThoughtChunk`]      |
//! | `tool_call`           | [`AgentEvent::ToolCallStarted`]   |
//! | `tool_call_update`    | [`AgentEvent::ToolCallUpdated`]   |
//! | `plan`                | [`AgentEvent::PlanUpdated`]       |
//! | *(any other)*         | Skipped; logged at `DEBUG`        |

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::driver::{AgentEvent, PlanEntry};
use crate::{AppError, Result};

// ── Wire types ───────────────────────────────────────────────────────────────

/// One item of streamed content. Only text blocks carry chunk events.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    /// Plain text fragment.
    Text {
        /// The fragment itself.
        text: String,
    },
    /// Any non-text block (image, resource, …) — carried but not surfaced.
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct ChunkParams {
    content: ContentBlock,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToolCallParams {
    tool_call_id: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    kind: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToolCallUpdateParams {
    tool_call_id: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    title: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PlanParams {
    entries: Vec<PlanEntry>,
}

// ── Public API ───────────────────────────────────────────────────────────────

/// Decode a `session/update` notification payload into a typed event.
///
/// # Return value
///
/// - `Ok(Some(event))` — a recognized sub-variant.
/// - `Ok(None)` — an unrecognized sub-variant (skipped, logged at `DEBUG`)
///   or a chunk whose content block carries no text.
/// - `Err(AppError::Protocol(..))` — the payload has no discriminator, or a
///   recognized sub-variant is missing a required field.
///
/// # Errors
///
/// [`AppError::Protocol`] as described above.
pub fn parse_session_update(params: &Value) -> Result<Option<AgentEvent>> {
    let update = params
        .get("update")
        .ok_or_else(|| AppError::Protocol("session/update without `update` member".into()))?;

    let Some(discriminator) = update.get("sessionUpdate").and_then(Value::as_str) else {
        return Err(AppError::Protocol(
            "session/update without `sessionUpdate` discriminator".into(),
        ));
    };

    match discriminator {
        "agent_message_chunk" => parse_chunk(update, |text| AgentEvent::MessageChunk { text }),
        "agent_thought_chunk" => parse_chunk(update, |text| AgentEvent::ThoughtChunk { text }),
        "tool_call" => parse_tool_call(update),
        "tool_call_update" => parse_tool_call_update(update),
        "plan" => parse_plan(update),
        other => {
            debug!(
                session_update = other,
                "session update: skipping unknown sub-variant"
            );
            Ok(None)
        }
    }
}

// ── Private helpers ──────────────────────────────────────────────────────────

fn parse_chunk(
    update: &Value,
    into_event: impl FnOnce(String) -> AgentEvent,
) -> Result<Option<AgentEvent>> {
    let params: ChunkParams = serde_json::from_value(update.clone())
        .map_err(|e| AppError::Protocol(format!("malformed content chunk: {e}")))?;

    match params.content {
        ContentBlock::Text { text } => Ok(Some(into_event(text))),
        ContentBlock::Other => Ok(None),
    }
}

fn parse_tool_call(update: &Value) -> Result<Option<AgentEvent>> {
    let params: ToolCallParams = serde_json::from_value(update.clone())
        .map_err(|e| AppError::Protocol(format!("malformed tool_call update: {e}")))?;

    Ok(Some(AgentEvent::ToolCallStarted {
        title: params.title.unwrap_or_else(|| params.tool_call_id.clone()),
        tool_call_id: params.tool_call_id,
        kind: params.kind,
    }))
}

fn parse_tool_call_update(update: &Value) -> Result<Option<AgentEvent>> {
    let params: ToolCallUpdateParams = serde_json::from_value(update.clone())
        .map_err(|e| AppError::Protocol(format!("malformed tool_call_update: {e}")))?;

    Ok(Some(AgentEvent::ToolCallUpdated {
        tool_call_id: params.tool_call_id,
        status: params.status,
        title: params.title,
    }))
}

fn parse_plan(update: &Value) -> Result<Option<AgentEvent>> {
    let params: PlanParams = serde_json::from_value(update.clone())
        .map_err(|e| AppError::Protocol(format!("malformed plan update: {e}")))?;

    Ok(Some(AgentEvent::PlanUpdated {
        entries: params.entries,
    }))
}
