use std::sync::Arc;

use mcp_types::CallToolResult;
use serde_json::json;

use crate::ServerState;

use super::json_result;

/// Reports the sandbox root, server version and the active policy's rule
/// sources. No inputs.
pub(crate) async fn handle(
    state: Arc<ServerState>,
    _arguments: Option<serde_json::Value>,
) -> CallToolResult {
    let policy = &state.policy;
    json_result(json!({
        "sandbox_root": policy.sandbox_root().display().to_string(),
        "server_version": env!("CARGO_PKG_VERSION"),
        "command_policy": {
            "allow": policy.allow_sources(),
            "deny": policy.deny_sources(),
        },
    }))
}
