mod mcp_process;

pub use mcp_process::McpProcess;
pub use mcp_process::call_tool_text;
pub use mcp_process::structured_content;
