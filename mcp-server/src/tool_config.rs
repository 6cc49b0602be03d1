//! Input schemas for the three tools, derived with `schemars` and converted
//! into MCP `ToolInputSchema` values.

use mcp_types::Tool;
use mcp_types::ToolInputSchema;
use schemars::JsonSchema;
use schemars::r#gen::SchemaSettings;
use serde::Deserialize;

use shemcp_core::exec::OnLargeOutput;

/// Client-supplied arguments for a `shell_exec` tool-call.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ShellExecParams {
    /// Program to execute, or the first `KEY=value` assignment of an
    /// environment prefix.
    pub cmd: String,

    /// Arguments for the program.
    #[serde(default)]
    pub args: Vec<String>,

    /// Working directory, relative to the sandbox root. Absolute paths are
    /// rejected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,

    /// Legacy timeout in milliseconds (1..300000).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<f64>,

    /// Timeout in seconds (1..300); takes precedence over `timeout_ms`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<f64>,

    /// Per-stream output ceiling in bytes (1000..10000000).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_bytes: Option<f64>,

    /// Pagination settings. Required, and `page.cursor` is required within
    /// it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<PageParam>,

    /// What to do when output exceeds the page budget (default "spill").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_large_output: Option<ShellExecOnLargeOutput>,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct PageParam {
    /// Byte cursor: `{"cursor_type": "bytes", "offset": n}`.
    pub cursor: Option<serde_json::Value>,

    /// Page size in bytes (1..40000, default 40000).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit_bytes: Option<f64>,

    /// Page size in lines (1..100000, default 2000).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit_lines: Option<f64>,
}

// Wire-level enum kept separate from the core type so the generated schema
// stays a compact string enum.
#[derive(Debug, Clone, Copy, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ShellExecOnLargeOutput {
    Spill,
    Truncate,
    Error,
}

impl From<ShellExecOnLargeOutput> for OnLargeOutput {
    fn from(value: ShellExecOnLargeOutput) -> Self {
        match value {
            ShellExecOnLargeOutput::Spill => OnLargeOutput::Spill,
            ShellExecOnLargeOutput::Truncate => OnLargeOutput::Truncate,
            ShellExecOnLargeOutput::Error => OnLargeOutput::Error,
        }
    }
}

/// Client-supplied arguments for a `read_file_chunk` tool-call.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ReadFileChunkParams {
    /// Spill URI returned by `shell_exec` (must start with `mcp://tmp/`).
    pub uri: String,

    /// Byte cursor; omitted means offset 0.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<serde_json::Value>,

    /// Chunk size in bytes (1..40000, default 40000).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit_bytes: Option<f64>,
}

/// `shell_info` takes no arguments.
#[derive(Debug, Clone, Default, Deserialize, JsonSchema)]
pub struct ShellInfoParams {}

pub(crate) fn create_tool_for_shell_exec() -> Tool {
    tool_for_schema::<ShellExecParams>(
        "shell_exec",
        "Execute a command inside the sandbox under the server's allow/deny policy, \
         with paginated output.",
    )
}

pub(crate) fn create_tool_for_read_file_chunk() -> Tool {
    tool_for_schema::<ReadFileChunkParams>(
        "read_file_chunk",
        "Read a byte range of a spill file produced by a previous shell_exec call.",
    )
}

pub(crate) fn create_tool_for_shell_info() -> Tool {
    tool_for_schema::<ShellInfoParams>(
        "shell_info",
        "Report the sandbox root, server version and the active command policy.",
    )
}

fn tool_for_schema<T: JsonSchema>(name: &str, description: &str) -> Tool {
    let schema = SchemaSettings::draft2019_09()
        .with(|s| {
            s.inline_subschemas = true;
            s.option_add_null_type = false
        })
        .into_generator()
        .into_root_schema_for::<T>();
    #[expect(clippy::expect_used)]
    let schema_value = serde_json::to_value(&schema).expect("tool schema should serialize to JSON");

    let tool_input_schema =
        serde_json::from_value::<ToolInputSchema>(schema_value).unwrap_or_else(|e| {
            panic!("failed to create Tool from schema: {e}");
        });
    Tool {
        name: name.to_string(),
        input_schema: tool_input_schema,
        description: Some(description.to_string()),
        annotations: None,
    }
}
