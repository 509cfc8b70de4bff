//! End-to-end session-dialect lifecycle against scripted agents.
//!
//! Covers:
//! - connect → ready → prompt → streamed chunk → stop reason → disconnect
//! - the façade guards single-connection ownership
//! - a startup banner on stdout is a log event, never fatal
//! - a handshake rejection fails the connect attempt and ends in `error`
//! - a surfaced permission decision reaches the agent
//! - `set_model` falls back to the config-option call on rejection
//! - `fs/read_text_file` round-trips through the host's filesystem
//! - a missing executable surfaces as a spawn failure

#![cfg(unix)]

use std::io::Write;
use std::time::Duration;

use tokio::sync::mpsc;

use agent_conduit::driver::acp::{AcpConnection, AcpOptions};
use agent_conduit::driver::{
    AgentEvent, ApprovalPolicy, ConnectionState, PermissionDecision,
};
use agent_conduit::{AgentClient, AppError};

use super::test_helpers::{acp_script, sh_agent, test_timeouts, wait_for, BASIC_PROMPT_ARM};

fn options(policy: ApprovalPolicy) -> AcpOptions {
    AcpOptions {
        approval_policy: policy,
        timeouts: test_timeouts(),
    }
}

// ── Happy path ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn connect_prompt_stream_disconnect() {
    let descriptor = sh_agent(&acp_script(BASIC_PROMPT_ARM));
    let (event_tx, mut event_rx) = mpsc::channel(64);

    let connection =
        AcpConnection::connect(&descriptor, options(ApprovalPolicy::Interactive), event_tx)
            .await
            .expect("connect must succeed");

    assert_eq!(connection.state(), ConnectionState::Ready);

    let session = connection.session().await.expect("session must exist");
    assert_eq!(session.session_id, "sess-1");
    assert_eq!(session.current_model.as_deref(), Some("m1"));
    assert_eq!(session.models.len(), 2);

    let stop_reason = connection.prompt("say hello").await.expect("prompt must succeed");
    assert_eq!(stop_reason, "end_turn");

    let chunk = wait_for(&mut event_rx, |e| {
        matches!(e, AgentEvent::MessageChunk { .. })
    })
    .await;
    match chunk {
        AgentEvent::MessageChunk { text } => assert_eq!(text, "hello from agent"),
        other => panic!("expected MessageChunk, got {other:?}"),
    }

    connection.disconnect().await;
    assert_eq!(connection.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn facade_owns_a_single_connection() {
    let descriptor = sh_agent(&acp_script(BASIC_PROMPT_ARM));
    let (event_tx, _event_rx) = mpsc::channel(64);
    let client = AgentClient::new(event_tx);

    client
        .connect_acp(&descriptor, options(ApprovalPolicy::Interactive))
        .await
        .expect("first connect must succeed");
    assert_eq!(client.state().await, ConnectionState::Ready);

    // A second connection while one is active is refused.
    match client
        .connect_acp(&descriptor, options(ApprovalPolicy::Interactive))
        .await
    {
        Err(AppError::Protocol(msg)) => assert!(msg.contains("already active"), "got: {msg}"),
        other => panic!("expected Err(AppError::Protocol), got: {other:?}"),
    }

    let stop_reason = client.prompt("hi").await.expect("prompt must succeed");
    assert_eq!(stop_reason, "end_turn");

    // Tool-dialect calls are rejected on a session connection.
    assert!(matches!(
        client.list_tools().await,
        Err(AppError::Protocol(_))
    ));

    client.disconnect().await;
    assert_eq!(client.state().await, ConnectionState::Disconnected);
}

// ── Transport desync ─────────────────────────────────────────────────────────

#[tokio::test]
async fn startup_banner_is_logged_not_fatal() {
    let mut script = String::from("echo 'agent v2.1 booting...'\n");
    script.push_str(&acp_script(BASIC_PROMPT_ARM));
    let descriptor = sh_agent(&script);
    let (event_tx, mut event_rx) = mpsc::channel(64);

    let connection =
        AcpConnection::connect(&descriptor, options(ApprovalPolicy::Interactive), event_tx)
            .await
            .expect("banner must not break the handshake");

    let log = wait_for(&mut event_rx, |e| {
        matches!(e, AgentEvent::ProcessLog { .. })
    })
    .await;
    match log {
        AgentEvent::ProcessLog { line, .. } => assert!(line.contains("booting"), "got: {line}"),
        other => panic!("expected ProcessLog, got {other:?}"),
    }

    connection.disconnect().await;
}

// ── Handshake failure ────────────────────────────────────────────────────────

#[tokio::test]
async fn handshake_rejection_fails_connect() {
    let script = r#"while IFS= read -r line; do
  case "$line" in
    *'"method":"initialize"'*)
      printf '%s\n' '{"jsonrpc":"2.0","id":0,"error":{"code":-32600,"message":"unsupported protocol"}}'
      ;;
  esac
done
"#;
    let descriptor = sh_agent(script);
    let (event_tx, mut event_rx) = mpsc::channel(64);

    match AcpConnection::connect(&descriptor, options(ApprovalPolicy::Interactive), event_tx).await
    {
        Err(AppError::Rpc { code, message, .. }) => {
            assert_eq!(code, -32600);
            assert!(message.contains("unsupported"), "got: {message}");
        }
        other => panic!("expected Err(AppError::Rpc), got: {other:?}"),
    }

    wait_for(&mut event_rx, |e| {
        matches!(e, AgentEvent::StateChanged(ConnectionState::Error))
    })
    .await;
}

#[tokio::test]
async fn missing_executable_fails_with_spawn_error() {
    let descriptor = agent_conduit::spawn::SpawnDescriptor {
        command: "/definitely/not/a/real/agent".to_owned(),
        args: Vec::new(),
        working_dir: std::env::temp_dir(),
        env: std::collections::HashMap::new(),
    };
    let (event_tx, mut event_rx) = mpsc::channel(64);

    assert!(matches!(
        AcpConnection::connect(&descriptor, options(ApprovalPolicy::Interactive), event_tx).await,
        Err(AppError::Spawn(_))
    ));

    wait_for(&mut event_rx, |e| {
        matches!(e, AgentEvent::StateChanged(ConnectionState::Error))
    })
    .await;
}

// ── Permission flow ──────────────────────────────────────────────────────────

#[tokio::test]
async fn surfaced_permission_decision_reaches_agent() {
    let arm = r#"    *'"method":"session/prompt"'*)
      printf '%s\n' '{"jsonrpc":"2.0","id":"perm-1","method":"session/request_permission","params":{"sessionId":"sess-1","toolCall":{"title":"Run tests"},"options":[{"optionId":"allow","name":"Allow"},{"optionId":"deny","name":"Deny"}]}}'
      IFS= read -r resp
      case "$resp" in
        *'"optionId":"allow"'*) ack=granted ;;
        *) ack=refused ;;
      esac
      printf '%s\n' '{"jsonrpc":"2.0","method":"session/update","params":{"sessionId":"sess-1","update":{"sessionUpdate":"agent_message_chunk","content":{"type":"text","text":"'"$ack"'"}}}}'
      printf '%s\n' '{"jsonrpc":"2.0","id":2,"result":{"stopReason":"end_turn"}}'
      ;;
"#;
    let descriptor = sh_agent(&acp_script(arm));
    let (event_tx, mut event_rx) = mpsc::channel(64);

    let connection = std::sync::Arc::new(
        AcpConnection::connect(&descriptor, options(ApprovalPolicy::Interactive), event_tx)
            .await
            .expect("connect must succeed"),
    );

    let prompting = tokio::spawn({
        let connection = std::sync::Arc::clone(&connection);
        async move { connection.prompt("run the tests").await }
    });

    let event = wait_for(&mut event_rx, |e| {
        matches!(e, AgentEvent::PermissionRequested(_))
    })
    .await;
    let AgentEvent::PermissionRequested(request) = event else {
        unreachable!();
    };
    assert_eq!(request.title, "Run tests");
    assert_eq!(request.options.len(), 2);
    request.resolve(PermissionDecision::Selected {
        option_id: "allow".to_owned(),
    });

    let chunk = wait_for(&mut event_rx, |e| {
        matches!(e, AgentEvent::MessageChunk { .. })
    })
    .await;
    match chunk {
        AgentEvent::MessageChunk { text } => assert_eq!(
            text, "granted",
            "the agent must have seen the selected option"
        ),
        other => panic!("expected MessageChunk, got {other:?}"),
    }

    let stop_reason = prompting
        .await
        .expect("prompt task must not panic")
        .expect("prompt must succeed");
    assert_eq!(stop_reason, "end_turn");

    connection.disconnect().await;
}

#[tokio::test]
async fn automatic_policy_answers_permission_without_host() {
    let arm = r#"    *'"method":"session/prompt"'*)
      printf '%s\n' '{"jsonrpc":"2.0","id":"perm-1","method":"session/request_permission","params":{"sessionId":"sess-1","toolCall":{"title":"Run tests"},"options":[{"optionId":"allow","name":"Allow"}]}}'
      IFS= read -r resp
      case "$resp" in
        *'"optionId":"allow"'*)
          printf '%s\n' '{"jsonrpc":"2.0","id":2,"result":{"stopReason":"end_turn"}}'
          ;;
        *)
          printf '%s\n' '{"jsonrpc":"2.0","id":2,"result":{"stopReason":"refusal"}}'
          ;;
      esac
      ;;
"#;
    let descriptor = sh_agent(&acp_script(arm));
    let (event_tx, _event_rx) = mpsc::channel(64);

    let connection =
        AcpConnection::connect(&descriptor, options(ApprovalPolicy::Automatic), event_tx)
            .await
            .expect("connect must succeed");

    let stop_reason = connection.prompt("go").await.expect("prompt must succeed");
    assert_eq!(
        stop_reason, "end_turn",
        "the first offered option must have been selected automatically"
    );

    connection.disconnect().await;
}

// ── Turn cancellation ────────────────────────────────────────────────────────

#[tokio::test]
async fn cancel_turn_notifies_agent() {
    let arm = r#"    *'"method":"session/cancel"'*)
      printf '%s\n' '{"jsonrpc":"2.0","method":"session/update","params":{"sessionId":"sess-1","update":{"sessionUpdate":"agent_message_chunk","content":{"type":"text","text":"turn cancelled"}}}}'
      ;;
"#;
    let descriptor = sh_agent(&acp_script(arm));
    let (event_tx, mut event_rx) = mpsc::channel(64);

    let connection =
        AcpConnection::connect(&descriptor, options(ApprovalPolicy::Interactive), event_tx)
            .await
            .expect("connect must succeed");

    connection
        .cancel_turn()
        .await
        .expect("cancel notification must be written");

    let chunk = wait_for(&mut event_rx, |e| {
        matches!(e, AgentEvent::MessageChunk { .. })
    })
    .await;
    match chunk {
        AgentEvent::MessageChunk { text } => assert_eq!(text, "turn cancelled"),
        other => panic!("expected MessageChunk, got {other:?}"),
    }

    connection.disconnect().await;
}

// ── Model fallback ───────────────────────────────────────────────────────────

#[tokio::test]
async fn set_model_falls_back_to_config_option() {
    let arms = r#"    *'"method":"session/set_model"'*)
      printf '%s\n' '{"jsonrpc":"2.0","id":2,"error":{"code":-32601,"message":"set_model unsupported"}}'
      ;;
    *'"method":"session/set_config_option"'*)
      printf '%s\n' '{"jsonrpc":"2.0","id":3,"result":null}'
      ;;
"#;
    let descriptor = sh_agent(&acp_script(arms));
    let (event_tx, _event_rx) = mpsc::channel(64);

    let connection =
        AcpConnection::connect(&descriptor, options(ApprovalPolicy::Interactive), event_tx)
            .await
            .expect("connect must succeed");

    connection
        .set_model("m2")
        .await
        .expect("fallback must make set_model succeed");

    let session = connection.session().await.expect("session must exist");
    assert_eq!(session.current_model.as_deref(), Some("m2"));

    connection.disconnect().await;
}

// ── File access ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn fs_read_round_trips_through_host_filesystem() {
    let mut file = tempfile::NamedTempFile::new().expect("tempfile must be created");
    write!(file, "file-content").expect("write must succeed");
    let path = file.path().to_string_lossy().to_string();

    let arm_template = r#"    *'"method":"session/prompt"'*)
      printf '%s\n' '{"jsonrpc":"2.0","id":"fs-1","method":"fs/read_text_file","params":{"sessionId":"sess-1","path":"__FILE__"}}'
      IFS= read -r resp
      case "$resp" in
        *'"content":"file-content"'*)
          printf '%s\n' '{"jsonrpc":"2.0","id":2,"result":{"stopReason":"end_turn"}}'
          ;;
        *)
          printf '%s\n' '{"jsonrpc":"2.0","id":2,"result":{"stopReason":"refusal"}}'
          ;;
      esac
      ;;
"#;
    let arm = arm_template.replace("__FILE__", &path);
    let descriptor = sh_agent(&acp_script(&arm));
    let (event_tx, mut event_rx) = mpsc::channel(64);

    let connection = std::sync::Arc::new(
        AcpConnection::connect(&descriptor, options(ApprovalPolicy::Interactive), event_tx)
            .await
            .expect("connect must succeed"),
    );

    // Serve file-access callbacks the way a real host would.
    let file_server = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            if let AgentEvent::FsReadRequested(request) = event {
                let outcome = tokio::fs::read_to_string(&request.path)
                    .await
                    .map_err(|err| AppError::Io(err.to_string()));
                request.resolve(outcome);
            }
        }
    });

    let stop_reason = connection
        .prompt("read that file")
        .await
        .expect("prompt must succeed");
    assert_eq!(
        stop_reason, "end_turn",
        "the agent must have received the file content"
    );

    connection.disconnect().await;
    drop(connection);
    let _ = tokio::time::timeout(Duration::from_secs(2), file_server).await;
}
