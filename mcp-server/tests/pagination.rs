#![allow(clippy::unwrap_used)]

use mcp_test_support::McpProcess;
use mcp_test_support::call_tool_text;
use mcp_test_support::structured_content;
use pretty_assertions::assert_eq;
use serde_json::json;
use tempfile::TempDir;

/// Emits exactly 100000 bytes of `x` on stdout. The command string starts
/// with `head`, which the default policy allows.
const BIG_OUTPUT_CMD: &str = "head -c 100000 /dev/zero | tr '\\0' 'x'";

fn page(offset: u64) -> serde_json::Value {
    json!({"cursor": {"cursor_type": "bytes", "offset": offset}, "limit_bytes": 40_000})
}

async fn exec_page(mcp: &mut McpProcess, offset: u64) -> serde_json::Value {
    let result = mcp
        .call_tool(
            "shell_exec",
            json!({
                "cmd": "bash",
                "args": ["-c", BIG_OUTPUT_CMD],
                "page": page(offset),
            }),
        )
        .await
        .unwrap();
    assert_eq!(result.get("isError"), None, "unexpected error: {result}");
    structured_content(&result)
}

#[tokio::test]
async fn paginates_a_large_stream_and_reads_the_spill() {
    let sandbox = TempDir::new().unwrap();
    let home = TempDir::new().unwrap();
    let mut mcp = McpProcess::new(home.path(), sandbox.path()).await.unwrap();
    mcp.initialize().await.unwrap();

    // First page: [0, 40000), more remaining, spill retained.
    let first = exec_page(&mut mcp, 0).await;
    assert_eq!(first["bytes_start"], 0);
    assert_eq!(first["bytes_end"], 40_000);
    assert_eq!(first["total_bytes"], 100_000);
    assert_eq!(first["next_cursor"]["offset"], 40_000);
    let spill_uri = first["spill_uri"].as_str().unwrap().to_string();
    assert!(spill_uri.starts_with("mcp://tmp/exec-"), "{spill_uri}");

    // Second page.
    let second = exec_page(&mut mcp, 40_000).await;
    assert_eq!(second["bytes_end"], 80_000);
    assert_eq!(second["next_cursor"]["offset"], 80_000);

    // Final page: no cursor remains, so nothing is retained.
    let third = exec_page(&mut mcp, 80_000).await;
    assert_eq!(third["bytes_end"], 100_000);
    assert_eq!(third.get("next_cursor"), None);
    assert_eq!(third.get("spill_uri"), None);

    // Spill retrieval against the first execution's file.
    let result = mcp
        .call_tool(
            "read_file_chunk",
            json!({
                "uri": spill_uri,
                "cursor": {"cursor_type": "bytes", "offset": 0},
                "limit_bytes": 32_768,
            }),
        )
        .await
        .unwrap();
    assert_eq!(result.get("isError"), None, "unexpected error: {result}");
    let body = structured_content(&result);
    assert_eq!(body["bytes_start"], 0);
    assert_eq!(body["bytes_end"], 32_768);
    assert_eq!(body["total_bytes"], 100_000);
    assert_eq!(body["next_cursor"]["offset"], 32_768);
    assert_eq!(body["mime"], "text/plain");
    assert_eq!(body["data"].as_str().unwrap().len(), 32_768);
}

#[tokio::test]
async fn reading_to_the_end_deletes_the_spill_file() {
    let sandbox = TempDir::new().unwrap();
    let home = TempDir::new().unwrap();
    let mut mcp = McpProcess::new(home.path(), sandbox.path()).await.unwrap();
    mcp.initialize().await.unwrap();

    let first = exec_page(&mut mcp, 0).await;
    let spill_uri = first["spill_uri"].as_str().unwrap().to_string();

    // Read the remainder in two chunks; the second ends the stream.
    let result = mcp
        .call_tool(
            "read_file_chunk",
            json!({
                "uri": spill_uri,
                "cursor": {"cursor_type": "bytes", "offset": 60_000},
            }),
        )
        .await
        .unwrap();
    let body = structured_content(&result);
    assert_eq!(body["bytes_end"], 100_000);
    assert_eq!(body.get("next_cursor"), None);

    // The file is gone now.
    let result = mcp
        .call_tool("read_file_chunk", json!({"uri": spill_uri}))
        .await
        .unwrap();
    assert_eq!(result["isError"], true);
    assert!(call_tool_text(&result).contains("file not found"));
}

#[tokio::test]
async fn read_file_chunk_validates_inputs() {
    let sandbox = TempDir::new().unwrap();
    let home = TempDir::new().unwrap();
    let mut mcp = McpProcess::new(home.path(), sandbox.path()).await.unwrap();
    mcp.initialize().await.unwrap();

    let result = mcp
        .call_tool("read_file_chunk", json!({"uri": "file:///etc/passwd"}))
        .await
        .unwrap();
    assert_eq!(result["isError"], true);
    assert!(call_tool_text(&result).contains("must start with mcp://tmp/"));

    let result = mcp
        .call_tool(
            "read_file_chunk",
            json!({"uri": "mcp://tmp/exec-missing.out"}),
        )
        .await
        .unwrap();
    assert_eq!(result["isError"], true);
    assert!(call_tool_text(&result).contains("file not found"));

    let result = mcp
        .call_tool(
            "read_file_chunk",
            json!({"uri": "mcp://tmp/exec-missing.out", "limit_bytes": 0}),
        )
        .await
        .unwrap();
    assert_eq!(result["isError"], true);
    assert!(call_tool_text(&result).contains("limit_bytes"));

    let result = mcp
        .call_tool(
            "read_file_chunk",
            json!({"uri": "mcp://tmp/exec-missing.out", "limit_bytes": 40_001}),
        )
        .await
        .unwrap();
    assert_eq!(result["isError"], true);
    assert!(call_tool_text(&result).contains("limit_bytes"));

    let result = mcp
        .call_tool(
            "read_file_chunk",
            json!({"uri": "mcp://tmp/exec-missing.out", "cursor": {"offset": 3}}),
        )
        .await
        .unwrap();
    assert_eq!(result["isError"], true);
    assert!(call_tool_text(&result).contains("missing cursor_type"));
}

#[tokio::test]
async fn truncate_mode_omits_the_cursor() {
    let sandbox = TempDir::new().unwrap();
    let home = TempDir::new().unwrap();
    let mut mcp = McpProcess::new(home.path(), sandbox.path()).await.unwrap();
    mcp.initialize().await.unwrap();

    let result = mcp
        .call_tool(
            "shell_exec",
            json!({
                "cmd": "bash",
                "args": ["-c", BIG_OUTPUT_CMD],
                "page": page(0),
                "on_large_output": "truncate",
            }),
        )
        .await
        .unwrap();
    assert_eq!(result.get("isError"), None, "unexpected error: {result}");
    let body = structured_content(&result);
    assert_eq!(body["truncated"], true);
    assert_eq!(body.get("next_cursor"), None);
    assert_eq!(body.get("spill_uri"), None);
}

#[tokio::test]
async fn error_mode_fails_with_totals() {
    let sandbox = TempDir::new().unwrap();
    let home = TempDir::new().unwrap();
    let mut mcp = McpProcess::new(home.path(), sandbox.path()).await.unwrap();
    mcp.initialize().await.unwrap();

    let result = mcp
        .call_tool(
            "shell_exec",
            json!({
                "cmd": "bash",
                "args": ["-c", BIG_OUTPUT_CMD],
                "page": page(0),
                "on_large_output": "error",
            }),
        )
        .await
        .unwrap();
    assert_eq!(result["isError"], true);
    let text = call_tool_text(&result);
    assert!(text.contains("Output too large: 100000 bytes"), "{text}");
    assert!(text.contains("Use pagination or spill mode"), "{text}");
}
