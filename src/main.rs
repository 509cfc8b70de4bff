#![forbid(unsafe_code)]

//! `agent-conduit` — reference host binary.
//!
//! Loads the agent catalog, connects to one agent, runs a single prompt
//! (session dialect) or a tool call / catalog listing (tool dialect),
//! streams connection events to the terminal, and disconnects. File-access
//! callbacks are served against the real filesystem; surfaced permission
//! and approval prompts are decided by a fixed console policy (first
//! offered option / approve) — interactive review front-ends belong to
//! richer hosts built on the same library surface.

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use agent_conduit::config::ConduitConfig;
use agent_conduit::driver::acp::AcpOptions;
use agent_conduit::driver::mcp::McpOptions;
use agent_conduit::driver::{AgentEvent, PermissionDecision};
use agent_conduit::{AgentClient, AppError, Dialect, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "agent-conduit", about = "Drive a CLI agent over stdio JSON-RPC", version, long_about = None)]
struct Cli {
    /// Path to the TOML agent catalog.
    #[arg(long)]
    config: PathBuf,

    /// Catalog name of the agent to connect to.
    #[arg(long)]
    agent: String,

    /// Workspace directory for the session (defaults to the current dir).
    #[arg(long)]
    workspace: Option<PathBuf>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Tool to invoke (tool-dialect agents; omit to list the catalog).
    #[arg(long)]
    tool: Option<String>,

    /// JSON arguments for --tool.
    #[arg(long, default_value = "{}")]
    tool_args: String,

    /// Prompt text (session-dialect agents).
    prompt: Option<String>,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format);
    info!("agent-conduit starting");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load the catalog ─────────────────────────────────
    let config_text = std::fs::read_to_string(&args.config)
        .map_err(|err| AppError::Config(format!("cannot read config: {err}")))?;
    let config = ConduitConfig::from_toml_str(&config_text)?;

    let workspace = match args.workspace {
        Some(ref path) => path
            .canonicalize()
            .map_err(|err| AppError::Config(format!("invalid workspace: {err}")))?,
        None => std::env::current_dir()
            .map_err(|err| AppError::Config(format!("cannot resolve current dir: {err}")))?,
    };

    let (descriptor, dialect) = config.spawn_descriptor(&args.agent, &workspace)?;
    info!(agent = args.agent.as_str(), command = descriptor.command.as_str(), "agent resolved");

    // ── Event consumer ───────────────────────────────────
    let (event_tx, event_rx) = mpsc::channel(256);
    let consumer = tokio::spawn(consume_events(event_rx));

    let client = AgentClient::new(event_tx);
    let timeouts = config.timeouts.timeouts();

    // ── Connect and run ──────────────────────────────────
    let outcome = match dialect {
        Dialect::Acp => {
            run_session(&client, &args, &descriptor, AcpOptions {
                approval_policy: config.approval_policy,
                timeouts,
            })
            .await
        }
        Dialect::Mcp => {
            run_tools(&client, &args, &descriptor, McpOptions {
                approval_policy: config.approval_policy,
                timeouts,
            })
            .await
        }
    };

    client.disconnect().await;
    drop(client);
    let _ = tokio::time::timeout(Duration::from_secs(2), consumer).await;

    outcome
}

/// Session dialect: one prompt, streamed to the terminal.
async fn run_session(
    client: &AgentClient,
    args: &Cli,
    descriptor: &agent_conduit::spawn::SpawnDescriptor,
    options: AcpOptions,
) -> Result<()> {
    let Some(prompt) = args.prompt.as_deref() else {
        return Err(AppError::Config(
            "a prompt is required for session-dialect agents".into(),
        ));
    };

    client.connect_acp(descriptor, options).await?;

    if let Some(session) = client.session().await {
        info!(
            session_id = session.session_id.as_str(),
            models = session.models.len(),
            "session established"
        );
    }

    let stop_reason = client.prompt(prompt).await?;
    println!();
    info!(stop_reason = stop_reason.as_str(), "turn complete");
    Ok(())
}

/// Tool dialect: invoke one tool, or list the catalog.
async fn run_tools(
    client: &AgentClient,
    args: &Cli,
    descriptor: &agent_conduit::spawn::SpawnDescriptor,
    options: McpOptions,
) -> Result<()> {
    client.connect_mcp(descriptor, options).await?;

    if let Some(tool) = args.tool.as_deref() {
        let arguments: Value = serde_json::from_str(&args.tool_args)
            .map_err(|err| AppError::Config(format!("invalid --tool-args JSON: {err}")))?;

        let outcome = client.call_tool(tool, arguments).await?;
        if outcome.is_error {
            warn!(tool, "tool reported an error");
        }
        for block in outcome.content {
            match block.get("text").and_then(Value::as_str) {
                Some(text) => println!("{text}"),
                None => println!("{block}"),
            }
        }
    } else {
        for tool in client.list_tools().await? {
            println!("{}\t{}", tool.name, tool.description);
        }
    }
    Ok(())
}

/// Print connection events; serve file callbacks; apply the console policy.
async fn consume_events(mut event_rx: mpsc::Receiver<AgentEvent>) {
    while let Some(event) = event_rx.recv().await {
        match event {
            AgentEvent::StateChanged(state) => info!(%state, "connection state"),
            AgentEvent::MessageChunk { text } => {
                print!("{text}");
                let _ = std::io::stdout().flush();
            }
            AgentEvent::ThoughtChunk { text } => {
                debug!(thought = text.as_str(), "agent reasoning");
            }
            AgentEvent::ToolCallStarted { tool_call_id, title, kind } => {
                info!(tool_call_id = tool_call_id.as_str(), kind = ?kind, "tool call: {title}");
            }
            AgentEvent::ToolCallUpdated { tool_call_id, status, .. } => {
                info!(tool_call_id = tool_call_id.as_str(), status = ?status, "tool call update");
            }
            AgentEvent::PlanUpdated { entries } => {
                for entry in &entries {
                    info!(status = entry.status.as_str(), "plan: {}", entry.content);
                }
            }
            AgentEvent::PermissionRequested(request) => {
                info!(title = request.title.as_str(), "permission requested");
                // Console policy: take the first offered option.
                match request.options.first().map(|o| o.option_id.clone()) {
                    Some(option_id) => {
                        info!(option_id = option_id.as_str(), "selecting first offered option");
                        request.resolve(PermissionDecision::Selected { option_id });
                    }
                    None => request.resolve(PermissionDecision::Cancelled),
                }
            }
            AgentEvent::FsReadRequested(request) => {
                let outcome = tokio::fs::read_to_string(&request.path)
                    .await
                    .map_err(|err| AppError::Io(err.to_string()));
                request.resolve(outcome);
            }
            AgentEvent::FsWriteRequested(request) => {
                let outcome = tokio::fs::write(&request.path, request.content.as_bytes())
                    .await
                    .map_err(|err| AppError::Io(err.to_string()));
                request.resolve(outcome);
            }
            AgentEvent::ApprovalRequested(request) => {
                info!(
                    call_id = request.call_id.as_str(),
                    message = request.message.as_str(),
                    "approval requested; console policy approves"
                );
                request.resolve(agent_conduit::driver::ApprovalDecision::Approved);
            }
            AgentEvent::ToolsChanged { tools } => {
                info!(count = tools.len(), "tool catalog changed");
            }
            AgentEvent::ProcessLog { stream, line } => {
                debug!(?stream, line = line.as_str(), "agent output");
            }
            AgentEvent::UnknownNotification { method, .. } => {
                debug!(method = method.as_str(), "unrecognized notification");
            }
            AgentEvent::Fault { message } => warn!(message = message.as_str(), "fault"),
            AgentEvent::ProcessExited(exit) => {
                info!(code = ?exit.code, description = exit.description.as_str(), "agent exited");
            }
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Text => fmt().with_env_filter(filter).init(),
        LogFormat::Json => fmt().json().with_env_filter(filter).init(),
    }
}
