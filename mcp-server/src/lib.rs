//! Sandboxed shell execution exposed as an MCP server over stdio.
#![deny(clippy::print_stdout, clippy::print_stderr)]

use std::io::Result as IoResult;
use std::sync::Arc;

use mcp_types::JSONRPCMessage;
use shemcp_core::config::find_shemcp_home;
use shemcp_core::config::load_config_toml;
use shemcp_core::policy::Policy;
use shemcp_core::sandbox_root::resolve_sandbox_root;
use shemcp_core::spill::SpillStore;
use shemcp_core::worktree::WorktreeRegistry;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::io::{self};
use tokio::sync::mpsc;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod message_processor;
mod outgoing_message;
mod tool_config;
mod tool_handlers;

use crate::message_processor::MessageProcessor;
use crate::outgoing_message::OutgoingMessage;

/// Size of the bounded channels used to communicate between tasks. The value
/// is a balance between throughput and memory usage – 128 messages should be
/// plenty for an interactive agent.
const CHANNEL_CAPACITY: usize = 128;

/// Process-wide state shared by the tool handlers. The policy is read-only
/// after construction; the registry serializes its own mutations.
pub(crate) struct ServerState {
    pub policy: Policy,
    pub registry: WorktreeRegistry,
    pub spill: SpillStore,
}

pub async fn run_main() -> anyhow::Result<()> {
    let shemcp_home = find_shemcp_home()?;

    // All diagnostics go to the append-only debug log; stdout belongs to the
    // JSON-RPC transport. Users control the level with `RUST_LOG`.
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(shemcp_home.join("debug.log"))?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::sync::Mutex::new(log_file))
        .with_ansi(false)
        .init();

    // Startup failures here are fatal: without a sandbox root and a compiled
    // policy there is nothing safe to serve.
    let sandbox_root = resolve_sandbox_root()?;
    let config = load_config_toml(&shemcp_home)?;
    let policy = config
        .into_policy(sandbox_root.clone())
        .map_err(|e| anyhow::anyhow!("failed to build command policy: {e}"))?;
    info!("serving sandbox root {}", sandbox_root.display());

    let state = Arc::new(ServerState {
        policy,
        registry: WorktreeRegistry::new(),
        spill: SpillStore::new(&shemcp_home),
    });

    run_stdio_loop(state).await?;
    Ok(())
}

async fn run_stdio_loop(state: Arc<ServerState>) -> IoResult<()> {
    let (incoming_tx, mut incoming_rx) = mpsc::channel::<JSONRPCMessage>(CHANNEL_CAPACITY);
    let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<OutgoingMessage>(CHANNEL_CAPACITY);

    // Task: read from stdin, push to `incoming_tx`.
    let stdin_reader_handle = tokio::spawn({
        let incoming_tx = incoming_tx.clone();
        async move {
            let stdin = io::stdin();
            let reader = BufReader::new(stdin);
            let mut lines = reader.lines();

            while let Ok(Some(line)) = lines.next_line().await {
                match serde_json::from_str::<JSONRPCMessage>(&line) {
                    Ok(msg) => {
                        if incoming_tx.send(msg).await.is_err() {
                            // Receiver gone – nothing left to do.
                            break;
                        }
                    }
                    Err(e) => error!("failed to deserialize JSONRPCMessage: {e}"),
                }
            }

            debug!("stdin reader finished (EOF)");
        }
    });

    // Task: process incoming messages.
    let processor_handle = tokio::spawn({
        let mut processor = MessageProcessor::new(outgoing_tx.clone(), state);
        async move {
            while let Some(msg) = incoming_rx.recv().await {
                match msg {
                    JSONRPCMessage::Request(r) => processor.process_request(r),
                    JSONRPCMessage::Response(r) => processor.process_response(r),
                    JSONRPCMessage::Notification(n) => processor.process_notification(n),
                    JSONRPCMessage::Error(e) => processor.process_error(e),
                }
            }

            info!("processor task exited (channel closed)");
        }
    });

    // Task: write outgoing messages to stdout.
    let stdout_writer_handle = tokio::spawn(async move {
        let mut stdout = io::stdout();
        while let Some(msg) = outgoing_rx.recv().await {
            let msg: JSONRPCMessage = msg.into();
            match serde_json::to_string(&msg) {
                Ok(json) => {
                    if let Err(e) = stdout.write_all(json.as_bytes()).await {
                        error!("failed to write to stdout: {e}");
                        break;
                    }
                    if let Err(e) = stdout.write_all(b"\n").await {
                        error!("failed to write newline to stdout: {e}");
                        break;
                    }
                    if let Err(e) = stdout.flush().await {
                        error!("failed to flush stdout: {e}");
                        break;
                    }
                }
                Err(e) => error!("failed to serialize JSONRPCMessage: {e}"),
            }
        }

        info!("stdout writer exited (channel closed)");
    });

    // The typical exit path is the stdin reader hitting EOF which, once it
    // drops `incoming_tx`, propagates shutdown to the processor and then to
    // the stdout task.
    let _ = tokio::join!(stdin_reader_handle, processor_handle, stdout_writer_handle);

    Ok(())
}
