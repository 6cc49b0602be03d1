use std::sync::Arc;

use mcp_types::CallToolRequestParams;
use mcp_types::CallToolResult;
use mcp_types::ClientRequest;
use mcp_types::ContentBlock;
use mcp_types::JSONRPCError;
use mcp_types::JSONRPCErrorError;
use mcp_types::JSONRPCNotification;
use mcp_types::JSONRPCRequest;
use mcp_types::JSONRPCResponse;
use mcp_types::ListToolsResult;
use mcp_types::ModelContextProtocolRequest;
use mcp_types::RequestId;
use mcp_types::ServerCapabilitiesTools;
use mcp_types::TextContent;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task;

use crate::ServerState;
use crate::outgoing_message::OutgoingMessage;
use crate::outgoing_message::OutgoingMessageSender;
use crate::tool_config::create_tool_for_read_file_chunk;
use crate::tool_config::create_tool_for_shell_exec;
use crate::tool_config::create_tool_for_shell_info;
use crate::tool_handlers;

pub(crate) struct MessageProcessor {
    outgoing: OutgoingMessageSender,
    state: Arc<ServerState>,
    initialized: bool,
}

impl MessageProcessor {
    /// Create a new `MessageProcessor`, retaining a handle to the outgoing
    /// `Sender` so handlers can enqueue messages to be written to stdout.
    pub(crate) fn new(outgoing: mpsc::Sender<OutgoingMessage>, state: Arc<ServerState>) -> Self {
        Self {
            outgoing: OutgoingMessageSender::new(outgoing),
            state,
            initialized: false,
        }
    }

    pub(crate) fn process_request(&mut self, request: JSONRPCRequest) {
        // Hold on to the ID so we can respond.
        let request_id = request.id.clone();

        let client_request = match ClientRequest::try_from(request) {
            Ok(client_request) => client_request,
            Err(e) => {
                tracing::warn!("failed to convert request: {e}");
                return;
            }
        };

        match client_request {
            ClientRequest::InitializeRequest(params) => {
                self.handle_initialize(request_id, params);
            }
            ClientRequest::PingRequest(params) => {
                self.handle_ping(request_id, params);
            }
            ClientRequest::ListToolsRequest(params) => {
                self.handle_list_tools(request_id, params);
            }
            ClientRequest::CallToolRequest(params) => {
                self.handle_call_tool(request_id, params);
            }
        }
    }

    /// Handle a standalone JSON-RPC response originating from the peer.
    pub(crate) fn process_response(&mut self, response: JSONRPCResponse) {
        tracing::info!("<- response: {:?}", response);
    }

    /// Handle a fire-and-forget JSON-RPC notification.
    pub(crate) fn process_notification(&mut self, notification: JSONRPCNotification) {
        tracing::info!("<- notification: {}", notification.method);
    }

    /// Handle an error object received from the peer.
    pub(crate) fn process_error(&mut self, err: JSONRPCError) {
        tracing::error!("<- error: {:?}", err);
    }

    fn handle_initialize(
        &mut self,
        id: RequestId,
        params: <mcp_types::InitializeRequest as ModelContextProtocolRequest>::Params,
    ) {
        tracing::info!("initialize -> params: {:?}", params);

        if self.initialized {
            // Already initialized: send JSON-RPC error response.
            let error = JSONRPCErrorError {
                code: -32600, // Invalid Request
                message: "initialize called more than once".to_string(),
                data: None,
            };
            let outgoing = self.outgoing.clone();
            task::spawn(async move {
                outgoing.send_error(id, error).await;
            });
            return;
        }

        self.initialized = true;

        let result = mcp_types::InitializeResult {
            capabilities: mcp_types::ServerCapabilities {
                tools: Some(ServerCapabilitiesTools {
                    list_changed: Some(true),
                }),
            },
            instructions: None,
            protocol_version: params.protocol_version.clone(),
            server_info: mcp_types::Implementation {
                name: "shemcp-mcp-server".to_string(),
                title: None,
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        };

        self.send_response::<mcp_types::InitializeRequest>(id, result);
    }

    fn send_response<T>(&self, id: RequestId, result: T::Result)
    where
        T: ModelContextProtocolRequest,
    {
        let result = match serde_json::to_value(result) {
            Ok(result) => result,
            Err(e) => {
                tracing::error!("failed to serialize response: {e}");
                return;
            }
        };
        let outgoing = self.outgoing.clone();
        task::spawn(async move {
            outgoing.send_response(id, result).await;
        });
    }

    fn handle_ping(&self, id: RequestId, params: Option<serde_json::Value>) {
        tracing::trace!("ping -> params: {params:?}");
        self.send_response::<mcp_types::PingRequest>(id, json!({}));
    }

    fn handle_list_tools(
        &self,
        id: RequestId,
        params: <mcp_types::ListToolsRequest as ModelContextProtocolRequest>::Params,
    ) {
        tracing::trace!("tools/list -> {params:?}");
        let result = ListToolsResult {
            tools: vec![
                create_tool_for_shell_exec(),
                create_tool_for_read_file_chunk(),
                create_tool_for_shell_info(),
            ],
            next_cursor: None,
        };

        self.send_response::<mcp_types::ListToolsRequest>(id, result);
    }

    fn handle_call_tool(&self, id: RequestId, params: CallToolRequestParams) {
        tracing::info!("tools/call -> {}", params.name);
        let CallToolRequestParams { name, arguments } = params;
        let state = Arc::clone(&self.state);
        let outgoing = self.outgoing.clone();

        // Run the tool in its own task so a long-running child process never
        // blocks the message-processing loop.
        task::spawn(async move {
            let result = match name.as_str() {
                "shell_exec" => tool_handlers::shell_exec::handle(state, arguments).await,
                "read_file_chunk" => tool_handlers::read_file_chunk::handle(state, arguments).await,
                "shell_info" => tool_handlers::shell_info::handle(state, arguments).await,
                _ => unknown_tool_result(&name),
            };
            match serde_json::to_value(result) {
                Ok(result) => outgoing.send_response(id, result).await,
                Err(e) => {
                    tracing::error!("failed to serialize tool result: {e}");
                    outgoing
                        .send_error(
                            id,
                            JSONRPCErrorError {
                                code: -32603, // Internal error
                                message: format!("failed to serialize tool result: {e}"),
                                data: None,
                            },
                        )
                        .await;
                }
            }
        });
    }
}

fn unknown_tool_result(name: &str) -> CallToolResult {
    CallToolResult {
        content: vec![ContentBlock::TextContent(TextContent {
            r#type: "text".to_string(),
            text: format!("Unknown tool '{name}'"),
            annotations: None,
        })],
        is_error: Some(true),
        structured_content: None,
    }
}
