pub(crate) mod read_file_chunk;
pub(crate) mod shell_exec;
pub(crate) mod shell_info;

use mcp_types::CallToolResult;
use mcp_types::ContentBlock;
use mcp_types::TextContent;

pub(crate) fn error_result(text: String) -> CallToolResult {
    CallToolResult {
        content: vec![ContentBlock::TextContent(TextContent {
            r#type: "text".to_string(),
            text,
            annotations: None,
        })],
        is_error: Some(true),
        structured_content: None,
    }
}

pub(crate) fn json_result(value: serde_json::Value) -> CallToolResult {
    let text = value.to_string();
    CallToolResult {
        content: vec![ContentBlock::TextContent(TextContent {
            r#type: "text".to_string(),
            text,
            annotations: None,
        })],
        is_error: None,
        structured_content: Some(value),
    }
}
