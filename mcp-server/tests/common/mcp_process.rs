use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;

use anyhow::Context;
use assert_cmd::cargo::CommandCargoExt;
use mcp_types::CallToolRequestParams;
use mcp_types::CallToolRequest;
use mcp_types::ClientCapabilities;
use mcp_types::Implementation;
use mcp_types::InitializeRequest;
use mcp_types::InitializeRequestParams;
use mcp_types::InitializedNotification;
use mcp_types::JSONRPC_VERSION;
use mcp_types::JSONRPCMessage;
use mcp_types::JSONRPCNotification;
use mcp_types::JSONRPCRequest;
use mcp_types::JSONRPCResponse;
use mcp_types::ModelContextProtocolNotification;
use mcp_types::ModelContextProtocolRequest;
use mcp_types::RequestId;
use std::process::Command as StdCommand;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::process::Child;
use tokio::process::ChildStdin;
use tokio::process::ChildStdout;
use tokio::process::Command;

/// A running `shemcp-mcp-server` speaking line-delimited JSON-RPC over
/// piped stdio. `SHEMCP_HOME` and the sandbox root are pointed at
/// caller-provided temp directories so every test is hermetic.
pub struct McpProcess {
    next_request_id: AtomicI64,
    /// Retain this child process until the client is dropped. The Tokio
    /// runtime will make a "best effort" to reap the process after it
    /// exits; see the `kill_on_drop` documentation for details.
    #[allow(dead_code)]
    process: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl McpProcess {
    pub async fn new(shemcp_home: &Path, sandbox_root: &Path) -> anyhow::Result<Self> {
        // Use assert_cmd to locate the binary path and then switch to
        // tokio::process::Command.
        let std_cmd = StdCommand::cargo_bin("shemcp-mcp-server")
            .context("should find binary for shemcp-mcp-server")?;
        let program = std_cmd.get_program().to_owned();

        let mut cmd = Command::new(program);
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.env("SHEMCP_HOME", shemcp_home);
        cmd.env("SHEMCP_SANDBOX_ROOT", sandbox_root);
        cmd.env("RUST_LOG", "debug");

        let mut process = cmd
            .kill_on_drop(true)
            .spawn()
            .context("shemcp-mcp-server proc should start")?;
        let stdin = process
            .stdin
            .take()
            .ok_or_else(|| anyhow::format_err!("mcp should have stdin fd"))?;
        let stdout = process
            .stdout
            .take()
            .ok_or_else(|| anyhow::format_err!("mcp should have stdout fd"))?;
        let stdout = BufReader::new(stdout);
        Ok(Self {
            next_request_id: AtomicI64::new(0),
            process,
            stdin,
            stdout,
        })
    }

    /// Performs the initialization handshake with the MCP server.
    pub async fn initialize(&mut self) -> anyhow::Result<()> {
        let params = InitializeRequestParams {
            capabilities: ClientCapabilities::default(),
            client_info: Implementation {
                name: "shemcp test client".into(),
                title: None,
                version: "0.0.0".into(),
            },
            protocol_version: mcp_types::MCP_SCHEMA_VERSION.into(),
        };
        let request_id = self
            .send_request(InitializeRequest::METHOD, Some(serde_json::to_value(params)?))
            .await?;

        let response = self
            .read_stream_until_response_message(RequestId::Integer(request_id))
            .await?;
        let server_name = response
            .result
            .pointer("/serverInfo/name")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        anyhow::ensure!(
            server_name == "shemcp-mcp-server",
            "unexpected serverInfo.name: {server_name}"
        );

        // Send notifications/initialized to ack the response.
        self.send_jsonrpc_message(JSONRPCMessage::Notification(JSONRPCNotification {
            jsonrpc: JSONRPC_VERSION.into(),
            method: InitializedNotification::METHOD.into(),
            params: None,
        }))
        .await?;

        Ok(())
    }

    /// Returns the id used to make the request so the caller can correlate
    /// the response.
    pub async fn send_tool_call(
        &mut self,
        name: &str,
        arguments: serde_json::Value,
    ) -> anyhow::Result<i64> {
        let params = CallToolRequestParams {
            name: name.to_string(),
            arguments: Some(arguments),
        };
        self.send_request(CallToolRequest::METHOD, Some(serde_json::to_value(params)?))
            .await
    }

    pub async fn send_request(
        &mut self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> anyhow::Result<i64> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);

        let message = JSONRPCMessage::Request(JSONRPCRequest {
            jsonrpc: JSONRPC_VERSION.into(),
            id: RequestId::Integer(request_id),
            method: method.to_string(),
            params,
        });
        self.send_jsonrpc_message(message).await?;
        Ok(request_id)
    }

    async fn send_jsonrpc_message(&mut self, message: JSONRPCMessage) -> anyhow::Result<()> {
        let payload = serde_json::to_string(&message)?;
        self.stdin.write_all(payload.as_bytes()).await?;
        self.stdin.write_all(b"\n").await?;
        self.stdin.flush().await?;
        Ok(())
    }

    pub async fn read_jsonrpc_message(&mut self) -> anyhow::Result<JSONRPCMessage> {
        let mut line = String::new();
        let n = self.stdout.read_line(&mut line).await?;
        anyhow::ensure!(n > 0, "server closed stdout");
        Ok(serde_json::from_str::<JSONRPCMessage>(&line)?)
    }

    pub async fn read_stream_until_response_message(
        &mut self,
        request_id: RequestId,
    ) -> anyhow::Result<JSONRPCResponse> {
        loop {
            let message = self.read_jsonrpc_message().await?;
            match message {
                JSONRPCMessage::Notification(_) => continue,
                JSONRPCMessage::Request(_) => {
                    anyhow::bail!("unexpected JSONRPCMessage::Request");
                }
                JSONRPCMessage::Error(err) => {
                    anyhow::bail!("unexpected JSONRPCMessage::Error: {err:?}");
                }
                JSONRPCMessage::Response(response) => {
                    if response.id == request_id {
                        return Ok(response);
                    }
                }
            }
        }
    }

    /// Sends a tool call and waits for its response, returning the
    /// `CallToolResult` JSON.
    pub async fn call_tool(
        &mut self,
        name: &str,
        arguments: serde_json::Value,
    ) -> anyhow::Result<serde_json::Value> {
        let request_id = self.send_tool_call(name, arguments).await?;
        let response = self
            .read_stream_until_response_message(RequestId::Integer(request_id))
            .await?;
        Ok(response.result)
    }
}

/// Extracts the text body of a `CallToolResult`.
pub fn call_tool_text(result: &serde_json::Value) -> String {
    result
        .pointer("/content/0/text")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

/// Extracts the structured body of a successful `CallToolResult`.
pub fn structured_content(result: &serde_json::Value) -> serde_json::Value {
    result
        .get("structuredContent")
        .cloned()
        .unwrap_or(serde_json::Value::Null)
}
