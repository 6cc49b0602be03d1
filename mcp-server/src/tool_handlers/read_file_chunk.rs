use std::sync::Arc;

use mcp_types::CallToolResult;
use serde_json::json;
use shemcp_core::ShemcpErr;
use shemcp_core::mime_sniff::sniff_mime;
use shemcp_core::pagination::Cursor;
use shemcp_core::pagination::validate_limit_bytes;
use shemcp_core::spill::read_range;

use crate::ServerState;
use crate::tool_config::ReadFileChunkParams;

use super::error_result;
use super::json_result;

pub(crate) async fn handle(
    state: Arc<ServerState>,
    arguments: Option<serde_json::Value>,
) -> CallToolResult {
    let Some(arguments) = arguments else {
        return error_result(
            "Missing arguments for read_file_chunk tool-call; the `uri` field is required."
                .to_string(),
        );
    };
    let params = match serde_json::from_value::<ReadFileChunkParams>(arguments) {
        Ok(params) => params,
        Err(e) => {
            return error_result(format!("Error: failed to parse read_file_chunk arguments: {e}"));
        }
    };

    match read_chunk(&state, params).await {
        Ok(value) => json_result(value),
        Err(text) => error_result(text),
    }
}

async fn read_chunk(
    state: &ServerState,
    params: ReadFileChunkParams,
) -> Result<serde_json::Value, String> {
    let path = state
        .spill
        .path_for_uri(&params.uri)
        .map_err(|e| format!("Error: {e}"))?;

    let cursor = match &params.cursor {
        Some(value) => Cursor::from_value(value).map_err(|e| format!("Error: {e}"))?,
        None => Cursor::bytes(0),
    };
    let limit_bytes = validate_limit_bytes(params.limit_bytes).map_err(|e| format!("Error: {e}"))?;

    let total_bytes = match tokio::fs::metadata(&path).await {
        Ok(metadata) => metadata.len(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(format!("Error: {}", ShemcpErr::SpillNotFound(params.uri.clone())));
        }
        Err(e) => return Err(format!("Error: {e}")),
    };

    let bytes_start = cursor.offset;
    let end = bytes_start.saturating_add(limit_bytes).min(total_bytes);
    let data = if end <= bytes_start {
        Vec::new()
    } else {
        read_range(&path, bytes_start, end)
            .await
            .map_err(|e| format!("Error: {e}"))?
    };
    let bytes_end = bytes_start + data.len() as u64;
    let data = String::from_utf8_lossy(&data).to_string();

    let next_cursor = (bytes_end < total_bytes).then(|| Cursor::bytes(bytes_end));
    if next_cursor.is_none() {
        // The caller has seen the whole file; ownership ends here.
        if let Err(e) = tokio::fs::remove_file(&path).await {
            tracing::warn!("could not remove consumed spill file {}: {e}", path.display());
        }
    }

    let mime = sniff_mime(&data);
    let mut value = json!({
        "data": data,
        "bytes_start": bytes_start,
        "bytes_end": bytes_end,
        "total_bytes": total_bytes,
        "mime": mime,
    });
    if let Some(next_cursor) = next_cursor {
        value["next_cursor"] = serde_json::to_value(next_cursor).map_err(|e| format!("Error: {e}"))?;
    }
    Ok(value)
}
