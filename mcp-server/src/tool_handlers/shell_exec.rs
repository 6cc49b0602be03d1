use std::path::Path;
use std::sync::Arc;

use mcp_types::CallToolResult;
use shemcp_core::cwd::resolve_requested_cwd;
use shemcp_core::cwd::validate_cwd;
use shemcp_core::exec::ExecRequest;
use shemcp_core::exec::OnLargeOutput;
use shemcp_core::exec::build_command_invocation;
use shemcp_core::exec::run_exec;
use shemcp_core::pagination::Cursor;
use shemcp_core::pagination::PageParams;
use shemcp_core::pagination::validate_limit_bytes;
use shemcp_core::pagination::validate_limit_lines;
use shemcp_core::parse_command::parse_shell_wrapper;
use shemcp_core::parse_command::reconstruct_command_line;
use shemcp_core::parse_command::strip_env_prefix;
use shemcp_core::policy::Policy;

use crate::ServerState;
use crate::tool_config::ShellExecParams;

use super::error_result;
use super::json_result;

/// Per-request timeout clamps, applied before the policy ceiling.
const TIMEOUT_SECONDS_RANGE: (f64, f64) = (1.0, 300.0);
const TIMEOUT_MS_RANGE: (f64, f64) = (1.0, 300_000.0);
const MAX_OUTPUT_BYTES_RANGE: (f64, f64) = (1_000.0, 10_000_000.0);

pub(crate) async fn handle(
    state: Arc<ServerState>,
    arguments: Option<serde_json::Value>,
) -> CallToolResult {
    let Some(arguments) = arguments else {
        return error_result(
            "Missing arguments for shell_exec tool-call; the `cmd` field is required.".to_string(),
        );
    };
    let params = match serde_json::from_value::<ShellExecParams>(arguments) {
        Ok(params) => params,
        Err(e) => return error_result(format!("Error: failed to parse shell_exec arguments: {e}")),
    };

    match run_pipeline(&state, params).await {
        Ok(value) => json_result(value),
        Err(text) => error_result(text),
    }
}

/// The full request flow: normalize, check policy, validate cwd, clamp
/// limits, execute. The error string is the complete user-visible text.
async fn run_pipeline(
    state: &ServerState,
    params: ShellExecParams,
) -> Result<serde_json::Value, String> {
    let policy = &state.policy;

    if params.cmd.trim().is_empty() {
        return Err("Error: cmd must be a non-empty string".to_string());
    }

    // Pagination is mandatory, cursor included.
    let page = params
        .page
        .as_ref()
        .ok_or_else(|| "Error: page is required".to_string())?;
    let cursor_value = page
        .cursor
        .as_ref()
        .ok_or_else(|| "Error: page.cursor is required".to_string())?;
    let cursor = Cursor::from_value(cursor_value).map_err(|e| format!("Error: {e}"))?;
    let limit_bytes = validate_limit_bytes(page.limit_bytes).map_err(|e| format!("Error: {e}"))?;
    let limit_lines = validate_limit_lines(page.limit_lines).map_err(|e| format!("Error: {e}"))?;

    // Only sandbox-relative working directories are accepted at the tool
    // level.
    if let Some(cwd) = &params.cwd
        && Path::new(cwd).is_absolute()
    {
        return Err(format!(
            "Error: cwd must be relative to the sandbox root: received {cwd} (sandbox root: {})",
            policy.sandbox_root().display()
        ));
    }

    let stripped =
        strip_env_prefix(&params.cmd, &params.args).map_err(|e| format!("Error: {e}"))?;
    let wrapper =
        parse_shell_wrapper(&stripped.cmd, &stripped.args).map_err(|e| format!("Error: {e}"))?;

    let mut cmdline = stripped.env_tokens.clone();
    cmdline.push(stripped.cmd.clone());
    cmdline.extend(stripped.args.iter().cloned());

    // Policy sees the command that will actually run: the unwrapped command
    // string for wrappers, the reconstructed tokens otherwise.
    let mut direct_tokens = vec![stripped.cmd.clone()];
    direct_tokens.extend(stripped.args.iter().cloned());
    let policy_line = match &wrapper.command_string {
        Some(command_string) => command_string.clone(),
        None => reconstruct_command_line(&direct_tokens),
    };

    let check = policy.check_command_policy(&policy_line);
    if !check.allowed {
        return Err(denial_text(&policy_line, &check, &cmdline, &wrapper.command_string));
    }

    let requested_cwd = resolve_requested_cwd(policy.sandbox_root(), params.cwd.as_deref());
    let cwd = validate_cwd(&requested_cwd, policy, &state.registry)
        .await
        .map_err(|e| format!("Error: {e}"))?;

    let timeout_ms = effective_timeout_ms(&params, policy);
    let max_output_bytes = effective_max_output_bytes(&params, policy);

    // Child environment: allowlist intersection, then the explicit prefix
    // assignments on top.
    let mut env = policy.filtered_env();
    for (key, value) in &stripped.env_vars {
        env.insert(key.clone(), value.clone());
    }

    let (program, args) = build_command_invocation(&stripped, &wrapper);

    let request = ExecRequest {
        cmdline,
        program,
        args,
        cwd,
        env,
        timeout_ms,
        max_output_bytes,
        page: PageParams {
            cursor,
            limit_bytes,
            limit_lines,
        },
        on_large_output: params
            .on_large_output
            .map(OnLargeOutput::from)
            .unwrap_or_default(),
    };

    let response = run_exec(request, &state.spill)
        .await
        .map_err(|e| format!("Error: {e}"))?;
    serde_json::to_value(&response).map_err(|e| format!("Error: {e}"))
}

/// §7 denial shape: reason, matched rule, and (for wrappers) both command
/// lines so the caller can see what was actually evaluated.
fn denial_text(
    policy_line: &str,
    check: &shemcp_core::policy::PolicyCheck,
    cmdline: &[String],
    unwrapped: &Option<String>,
) -> String {
    let mut text = format!("Denied by policy: {policy_line}\n\nReason: {}", check.reason);
    if let (Some(rule), Some(rule_type)) = (&check.matched_rule, check.rule_type) {
        let rule_type = match rule_type {
            shemcp_core::policy::RuleType::Allow => "allow",
            shemcp_core::policy::RuleType::Deny => "deny",
        };
        text.push_str(&format!("\nMatched {rule_type} rule: /{rule}/"));
    }
    if let Some(unwrapped) = unwrapped {
        text.push_str(&format!(
            "\n\nOriginal command: {}\nUnwrapped command: {unwrapped}",
            reconstruct_command_line(cmdline)
        ));
    }
    text
}

fn effective_timeout_ms(params: &ShellExecParams, policy: &Policy) -> u64 {
    if let Some(seconds) = params.timeout_seconds.filter(|v| v.is_finite()) {
        let seconds = seconds.clamp(TIMEOUT_SECONDS_RANGE.0, TIMEOUT_SECONDS_RANGE.1);
        return ((seconds * 1_000.0) as u64).min(policy.timeout_ms());
    }
    if let Some(ms) = params.timeout_ms.filter(|v| v.is_finite()) {
        let ms = ms.clamp(TIMEOUT_MS_RANGE.0, TIMEOUT_MS_RANGE.1);
        return (ms as u64).min(policy.timeout_ms());
    }
    policy.timeout_ms()
}

fn effective_max_output_bytes(params: &ShellExecParams, policy: &Policy) -> u64 {
    match params.max_output_bytes.filter(|v| v.is_finite()) {
        Some(bytes) => {
            let bytes = bytes.clamp(MAX_OUTPUT_BYTES_RANGE.0, MAX_OUTPUT_BYTES_RANGE.1);
            (bytes as u64).min(policy.max_output_bytes())
        }
        None => policy.max_output_bytes(),
    }
}
