//! End-to-end tool-dialect lifecycle against scripted agents.
//!
//! Covers:
//! - connect → initialized acknowledgement → catalog → ready
//! - tool invocation through the façade
//! - wholesale catalog replacement after a change notification
//! - the approval race, end to end, in both arrival orders

#![cfg(unix)]

use serde_json::{json, Value};
use tokio::sync::mpsc;

use agent_conduit::driver::mcp::{McpConnection, McpOptions};
use agent_conduit::driver::{AgentEvent, ApprovalPolicy, ConnectionState};
use agent_conduit::AgentClient;

use super::test_helpers::{sh_agent, test_timeouts, wait_for};

fn options(policy: ApprovalPolicy) -> McpOptions {
    McpOptions {
        approval_policy: policy,
        timeouts: test_timeouts(),
    }
}

// ── Catalog and invocation ───────────────────────────────────────────────────

#[tokio::test]
async fn facade_lists_and_calls_tools() {
    // ids: initialize 0, tools/list 1, tools/call 2. The `initialized`
    // acknowledgement is a notification and matches no arm.
    let script = r#"while IFS= read -r line; do
  case "$line" in
    *'"method":"initialize"'*)
      printf '%s\n' '{"jsonrpc":"2.0","id":0,"result":{"protocolVersion":"2025-06-18"}}'
      ;;
    *'"method":"tools/list"'*)
      printf '%s\n' '{"jsonrpc":"2.0","id":1,"result":{"tools":[{"name":"search","description":"Find things","inputSchema":{"type":"object"}}]}}'
      ;;
    *'"method":"tools/call"'*)
      printf '%s\n' '{"jsonrpc":"2.0","id":2,"result":{"content":[{"type":"text","text":"found 3 matches"}],"isError":false}}'
      ;;
  esac
done
"#;
    let descriptor = sh_agent(script);
    let (event_tx, _event_rx) = mpsc::channel(64);
    let client = AgentClient::new(event_tx);

    client
        .connect_mcp(&descriptor, options(ApprovalPolicy::Interactive))
        .await
        .expect("connect must succeed");
    assert_eq!(client.state().await, ConnectionState::Ready);

    let tools = client.list_tools().await.expect("catalog must be cached");
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].name, "search");
    assert_eq!(tools[0].description, "Find things");

    let outcome = client
        .call_tool("search", json!({ "query": "matches" }))
        .await
        .expect("tool call must succeed");
    assert!(!outcome.is_error);
    assert_eq!(
        outcome.content[0].get("text").and_then(Value::as_str),
        Some("found 3 matches")
    );

    // Session-dialect calls are rejected on a tool connection.
    assert!(client.prompt("hi").await.is_err());

    client.disconnect().await;
    assert_eq!(client.state().await, ConnectionState::Disconnected);
}

// ── Catalog replacement ──────────────────────────────────────────────────────

#[tokio::test]
async fn tools_changed_triggers_wholesale_refetch() {
    // The first tools/list (id 1) returns an empty catalog and then
    // announces a change; the re-fetch (id 2) returns the real catalog.
    let script = r#"listed=0
while IFS= read -r line; do
  case "$line" in
    *'"method":"initialize"'*)
      printf '%s\n' '{"jsonrpc":"2.0","id":0,"result":{"protocolVersion":"2025-06-18"}}'
      ;;
    *'"method":"tools/list"'*)
      if [ "$listed" = "0" ]; then
        listed=1
        printf '%s\n' '{"jsonrpc":"2.0","id":1,"result":{"tools":[]}}'
        printf '%s\n' '{"jsonrpc":"2.0","method":"notifications/tools/list_changed"}'
      else
        printf '%s\n' '{"jsonrpc":"2.0","id":2,"result":{"tools":[{"name":"alpha"},{"name":"beta"}]}}'
      fi
      ;;
  esac
done
"#;
    let descriptor = sh_agent(script);
    let (event_tx, mut event_rx) = mpsc::channel(64);

    let connection =
        McpConnection::connect(&descriptor, options(ApprovalPolicy::Interactive), event_tx)
            .await
            .expect("connect must succeed");
    assert!(
        connection.list_tools().await.is_empty(),
        "initial catalog is empty"
    );

    let event = wait_for(&mut event_rx, |e| {
        matches!(e, AgentEvent::ToolsChanged { .. })
    })
    .await;
    let AgentEvent::ToolsChanged { tools } = event else {
        unreachable!();
    };
    assert_eq!(tools.len(), 2);

    let cached = connection.list_tools().await;
    assert_eq!(cached.len(), 2, "catalog must be replaced wholesale");
    assert_eq!(cached[0].name, "alpha");
    assert_eq!(cached[1].name, "beta");

    connection.disconnect().await;
}

// ── Approval race, end to end ────────────────────────────────────────────────

/// The general event notification arrives before the formal elicitation
/// request; automatic approval must produce exactly one "approved" answer
/// to the formal request.
#[tokio::test]
async fn approval_race_event_first_yields_one_approval() {
    let script = r#"while IFS= read -r line; do
  case "$line" in
    *'"method":"initialize"'*)
      printf '%s\n' '{"jsonrpc":"2.0","id":0,"result":{"protocolVersion":"2025-06-18"}}'
      ;;
    *'"method":"tools/list"'*)
      printf '%s\n' '{"jsonrpc":"2.0","id":1,"result":{"tools":[{"name":"deploy"}]}}'
      ;;
    *'"method":"tools/call"'*)
      printf '%s\n' '{"jsonrpc":"2.0","method":"agent/event","params":{"kind":"approval_request","callId":"call-1"}}'
      printf '%s\n' '{"jsonrpc":"2.0","id":"elic-1","method":"elicitation/create","params":{"message":"deploy to prod?","callId":"call-1"}}'
      IFS= read -r resp
      case "$resp" in
        *'"decision":"approved"'*)
          printf '%s\n' '{"jsonrpc":"2.0","id":2,"result":{"content":[{"type":"text","text":"deployed"}],"isError":false}}'
          ;;
        *)
          printf '%s\n' '{"jsonrpc":"2.0","id":2,"result":{"content":[],"isError":true}}'
          ;;
      esac
      ;;
  esac
done
"#;
    let descriptor = sh_agent(script);
    let (event_tx, mut event_rx) = mpsc::channel(64);

    let connection =
        McpConnection::connect(&descriptor, options(ApprovalPolicy::Automatic), event_tx)
            .await
            .expect("connect must succeed");

    let outcome = connection
        .call_tool("deploy", json!({}))
        .await
        .expect("tool call must succeed");
    assert!(!outcome.is_error, "the elicitation must have been approved");
    assert_eq!(
        outcome.content[0].get("text").and_then(Value::as_str),
        Some("deployed")
    );

    // The decision was automatic; the host must never have been asked.
    while let Ok(event) = event_rx.try_recv() {
        assert!(
            !matches!(event, AgentEvent::ApprovalRequested(_)),
            "auto-approved elicitation must not reach the host"
        );
    }

    connection.disconnect().await;
}

/// Reverse arrival order: the formal request first, the event second.
/// The outcome is identical — one approval, no duplicate answer.
#[tokio::test]
async fn approval_race_request_first_yields_identical_outcome() {
    let script = r#"while IFS= read -r line; do
  case "$line" in
    *'"method":"initialize"'*)
      printf '%s\n' '{"jsonrpc":"2.0","id":0,"result":{"protocolVersion":"2025-06-18"}}'
      ;;
    *'"method":"tools/list"'*)
      printf '%s\n' '{"jsonrpc":"2.0","id":1,"result":{"tools":[{"name":"deploy"}]}}'
      ;;
    *'"method":"tools/call"'*)
      printf '%s\n' '{"jsonrpc":"2.0","id":"elic-1","method":"elicitation/create","params":{"message":"deploy to prod?","callId":"call-1"}}'
      printf '%s\n' '{"jsonrpc":"2.0","method":"agent/event","params":{"kind":"approval_request","callId":"call-1"}}'
      IFS= read -r resp
      case "$resp" in
        *'"decision":"approved"'*)
          printf '%s\n' '{"jsonrpc":"2.0","id":2,"result":{"content":[{"type":"text","text":"deployed"}],"isError":false}}'
          ;;
        *)
          printf '%s\n' '{"jsonrpc":"2.0","id":2,"result":{"content":[],"isError":true}}'
          ;;
      esac
      ;;
  esac
done
"#;
    let descriptor = sh_agent(script);
    let (event_tx, _event_rx) = mpsc::channel(64);

    let connection =
        McpConnection::connect(&descriptor, options(ApprovalPolicy::Automatic), event_tx)
            .await
            .expect("connect must succeed");

    let outcome = connection
        .call_tool("deploy", json!({}))
        .await
        .expect("tool call must succeed");
    assert!(!outcome.is_error);
    assert_eq!(
        outcome.content[0].get("text").and_then(Value::as_str),
        Some("deployed")
    );

    connection.disconnect().await;
}

/// Interactive policy surfaces the elicitation and relays the host's
/// denial to the agent.
#[tokio::test]
async fn interactive_denial_reaches_agent() {
    let script = r#"while IFS= read -r line; do
  case "$line" in
    *'"method":"initialize"'*)
      printf '%s\n' '{"jsonrpc":"2.0","id":0,"result":{"protocolVersion":"2025-06-18"}}'
      ;;
    *'"method":"tools/list"'*)
      printf '%s\n' '{"jsonrpc":"2.0","id":1,"result":{"tools":[{"name":"deploy"}]}}'
      ;;
    *'"method":"tools/call"'*)
      printf '%s\n' '{"jsonrpc":"2.0","id":"elic-1","method":"elicitation/create","params":{"message":"deploy to prod?","callId":"call-1"}}'
      IFS= read -r resp
      case "$resp" in
        *'"action":"decline"'*)
          printf '%s\n' '{"jsonrpc":"2.0","id":2,"result":{"content":[{"type":"text","text":"aborted"}],"isError":true}}'
          ;;
        *)
          printf '%s\n' '{"jsonrpc":"2.0","id":2,"result":{"content":[],"isError":false}}'
          ;;
      esac
      ;;
  esac
done
"#;
    let descriptor = sh_agent(script);
    let (event_tx, mut event_rx) = mpsc::channel(64);

    let connection = std::sync::Arc::new(
        McpConnection::connect(&descriptor, options(ApprovalPolicy::Interactive), event_tx)
            .await
            .expect("connect must succeed"),
    );

    let calling = tokio::spawn({
        let connection = std::sync::Arc::clone(&connection);
        async move { connection.call_tool("deploy", json!({})).await }
    });

    let event = wait_for(&mut event_rx, |e| {
        matches!(e, AgentEvent::ApprovalRequested(_))
    })
    .await;
    let AgentEvent::ApprovalRequested(request) = event else {
        unreachable!();
    };
    assert_eq!(request.call_id, "call-1");
    assert_eq!(request.message, "deploy to prod?");
    request.resolve(agent_conduit::driver::ApprovalDecision::Denied);

    let outcome = calling
        .await
        .expect("task must not panic")
        .expect("tool call must complete");
    assert!(outcome.is_error, "the agent must have seen the denial");

    connection.disconnect().await;
}
