use mcp_types::JSONRPC_VERSION;
use mcp_types::JSONRPCError;
use mcp_types::JSONRPCErrorError;
use mcp_types::JSONRPCMessage;
use mcp_types::JSONRPCResponse;
use mcp_types::RequestId;
use mcp_types::Result;
use tokio::sync::mpsc;

/// Handle for enqueueing replies onto the stdout writer task. This server
/// never originates requests toward the client, so responses and errors are
/// the whole surface.
#[derive(Clone)]
pub(crate) struct OutgoingMessageSender {
    sender: mpsc::Sender<OutgoingMessage>,
}

impl OutgoingMessageSender {
    pub(crate) fn new(sender: mpsc::Sender<OutgoingMessage>) -> Self {
        Self { sender }
    }

    pub(crate) async fn send_response(&self, id: RequestId, result: Result) {
        let _ = self
            .sender
            .send(OutgoingMessage::Response(OutgoingResponse { id, result }))
            .await;
    }

    pub(crate) async fn send_error(&self, id: RequestId, error: JSONRPCErrorError) {
        let _ = self
            .sender
            .send(OutgoingMessage::Error(OutgoingError { id, error }))
            .await;
    }
}

/// Outgoing message from the server to the client.
pub(crate) enum OutgoingMessage {
    Response(OutgoingResponse),
    Error(OutgoingError),
}

impl From<OutgoingMessage> for JSONRPCMessage {
    fn from(val: OutgoingMessage) -> Self {
        match val {
            OutgoingMessage::Response(OutgoingResponse { id, result }) => {
                JSONRPCMessage::Response(JSONRPCResponse {
                    jsonrpc: JSONRPC_VERSION.into(),
                    id,
                    result,
                })
            }
            OutgoingMessage::Error(OutgoingError { id, error }) => {
                JSONRPCMessage::Error(JSONRPCError {
                    jsonrpc: JSONRPC_VERSION.into(),
                    id,
                    error,
                })
            }
        }
    }
}

pub(crate) struct OutgoingResponse {
    pub id: RequestId,
    pub result: Result,
}

pub(crate) struct OutgoingError {
    pub id: RequestId,
    pub error: JSONRPCErrorError,
}
