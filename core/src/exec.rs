#[cfg(unix)]
use std::os::unix::process::ExitStatusExt;

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use std::time::Instant;

use serde::Deserialize;
use serde::Serialize;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::process::Command;
use tracing::error;
use tracing::warn;

use crate::error::Result;
use crate::error::ShemcpErr;
use crate::mime_sniff::sniff_mime;
use crate::pagination::Cursor;
use crate::pagination::PageParams;
use crate::parse_command::StrippedCommand;
use crate::parse_command::WrapperParse;
use crate::spill::SpillHandle;
use crate::spill::SpillStore;
use crate::spill::line_count;
use crate::spill::read_range;

const SIGKILL_CODE: i32 = 9;

/// What to do when a stream exceeds the page budget.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnLargeOutput {
    #[default]
    Spill,
    Truncate,
    Error,
}

/// Fully resolved execution request: policy, cwd validation and limit
/// clamping have already happened by the time this is built.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    /// Original invocation tokens, environment prefix included.
    pub cmdline: Vec<String>,
    /// Program and argv actually spawned.
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: HashMap<String, String>,
    pub timeout_ms: u64,
    pub max_output_bytes: u64,
    pub page: PageParams,
    pub on_large_output: OnLargeOutput,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecResponse {
    pub exit_code: i32,
    pub signal: Option<i32>,
    pub duration_ms: u64,
    pub stdout_chunk: String,
    pub stderr_chunk: String,
    pub bytes_start: u64,
    pub bytes_end: u64,
    pub total_bytes: u64,
    pub truncated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<Cursor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spill_uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr_spill_uri: Option<String>,
    pub mime: String,
    pub line_count: u64,
    pub stderr_count: u64,
    pub cmdline: Vec<String>,
    pub effective_cmdline: Vec<String>,
    pub cwd: String,
    pub timeout_ms: u64,
    pub max_output_bytes: u64,
}

/// Assembles the program and argv to spawn. Wrapped commands are re-rooted
/// on the absolute shell path with strict-mode flags injected ahead of the
/// command string; environment prefix tokens are prepended to the command
/// string so the shell performs the assignments for the inner command.
pub fn build_command_invocation(
    stripped: &StrippedCommand,
    wrapper: &WrapperParse,
) -> (String, Vec<String>) {
    if let (true, Some(shell)) = (wrapper.is_wrapper, wrapper.shell) {
        let mut args = wrapper.flags_before_command.clone();
        if wrapper.should_use_login {
            args.push("-l".to_string());
        }
        args.extend(shell.strict_flags().iter().map(|s| s.to_string()));
        args.push("-c".to_string());

        let mut command_string = wrapper.command_string.clone().unwrap_or_default();
        if !stripped.env_tokens.is_empty() {
            command_string = format!("{} {command_string}", stripped.env_tokens.join(" "));
        }
        args.push(command_string);

        // Trailing positional parameters ($0, $1, ...) after the command
        // string, indexed relative to the env-stripped args.
        if wrapper.args_after_command < stripped.args.len() {
            args.extend(stripped.args[wrapper.args_after_command..].iter().cloned());
        }
        (shell.program().to_string(), args)
    } else {
        (stripped.cmd.clone(), stripped.args.clone())
    }
}

/// Runs the child to completion with bounded streaming, then serves the
/// requested page out of the captured output (or the spill file).
pub async fn run_exec(request: ExecRequest, spill_store: &SpillStore) -> Result<ExecResponse> {
    let start = Instant::now();

    let spill = match request.on_large_output {
        OnLargeOutput::Spill => match spill_store.allocate() {
            Ok(handle) => Some(handle),
            Err(err) => {
                warn!("could not allocate spill files, continuing without spill: {err}");
                None
            }
        },
        _ => None,
    };

    let mut command = Command::new(&request.program);
    command
        .args(&request.args)
        .current_dir(&request.cwd)
        .env_clear()
        .envs(&request.env)
        // Never leave a dangling stdin descriptor: some tools (ripgrep,
        // pagers) block waiting for it.
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(err) => {
            error!("failed to spawn {}: {err}", request.program);
            return Ok(failure_response(&request, start.elapsed()));
        }
    };

    let Some(stdout_pipe) = child.stdout.take() else {
        error!("stdout pipe was unexpectedly not available");
        return Ok(failure_response(&request, start.elapsed()));
    };
    let Some(stderr_pipe) = child.stderr.take() else {
        error!("stderr pipe was unexpectedly not available");
        return Ok(failure_response(&request, start.elapsed()));
    };

    let window = tail_window_bytes(&request);
    let stdout_handle = tokio::spawn(read_stream(
        BufReader::new(stdout_pipe),
        window,
        spill.as_ref().map(|h| h.stdout_path.clone()),
    ));
    let stderr_handle = tokio::spawn(read_stream(
        BufReader::new(stderr_pipe),
        window,
        spill.as_ref().map(|h| h.stderr_path.clone()),
    ));

    let timeout = Duration::from_millis(request.timeout_ms);
    let (exit_code, signal) = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => (status.code().unwrap_or(-1), status_signal(&status)),
        Ok(Err(err)) => {
            error!("waiting for child failed: {err}");
            (-1, None)
        }
        Err(_) => {
            // Hard kill; no retry.
            if let Err(err) = child.start_kill() {
                error!("failed to kill timed-out child: {err}");
            }
            match child.wait().await {
                Ok(status) => (
                    status.code().unwrap_or(-1),
                    status_signal(&status).or(Some(SIGKILL_CODE)),
                ),
                Err(err) => {
                    error!("reaping timed-out child failed: {err}");
                    (-1, Some(SIGKILL_CODE))
                }
            }
        }
    };

    let stdout = stdout_handle.await?;
    let stderr = stderr_handle.await?;
    let duration = start.elapsed();

    if request.on_large_output == OnLargeOutput::Error
        && (stdout.total_bytes > request.page.limit_bytes || stdout.lines > request.page.limit_lines)
    {
        return Err(ShemcpErr::OutputTooLarge {
            bytes: stdout.total_bytes,
            lines: stdout.lines,
        });
    }

    let truncate_mode = request.on_large_output == OnLargeOutput::Truncate;
    let page = build_stdout_page(&request.page, &stdout, spill.as_ref(), truncate_mode).await;
    let truncated = truncate_mode
        && (stdout.total_bytes > request.page.limit_bytes
            || stdout.lines > request.page.limit_lines);
    let next_cursor = match request.on_large_output {
        OnLargeOutput::Truncate => None,
        _ => (page.bytes_end < stdout.total_bytes).then(|| Cursor::bytes(page.bytes_end)),
    };

    let stderr_chunk = read_stderr_chunk(&request, &stderr, spill.as_ref()).await;

    // Spill retention: a side survives only if it received bytes AND the
    // caller still holds a cursor into this execution.
    let mut spill_uri = None;
    let mut stderr_spill_uri = None;
    if let Some(handle) = &spill {
        let retain = next_cursor.is_some();
        if stdout.wrote_spill && retain {
            spill_uri = Some(handle.stdout_uri.clone());
        } else {
            remove_if_present(&handle.stdout_path).await;
        }
        if stderr.wrote_spill && retain {
            stderr_spill_uri = Some(handle.stderr_uri.clone());
        } else {
            remove_if_present(&handle.stderr_path).await;
        }
    }

    let stdout_chunk = String::from_utf8_lossy(&page.chunk).to_string();
    let stderr_chunk = String::from_utf8_lossy(&stderr_chunk).to_string();

    Ok(ExecResponse {
        exit_code,
        signal,
        duration_ms: duration.as_millis() as u64,
        mime: sniff_mime(&stdout_chunk).to_string(),
        line_count: line_count(&stdout_chunk),
        stderr_count: line_count(&stderr_chunk),
        stdout_chunk,
        stderr_chunk,
        bytes_start: page.bytes_start,
        bytes_end: page.bytes_end,
        total_bytes: stdout.total_bytes,
        truncated,
        next_cursor,
        spill_uri,
        stderr_spill_uri,
        cmdline: request.cmdline.clone(),
        effective_cmdline: effective_cmdline(&request),
        cwd: request.cwd.display().to_string(),
        timeout_ms: request.timeout_ms,
        max_output_bytes: request.max_output_bytes,
    })
}

/// In-memory retention per stream: enough to serve a page near the end of
/// the stream without holding everything. Spill mode covers the rest.
fn tail_window_bytes(request: &ExecRequest) -> usize {
    (request.page.limit_bytes.saturating_mul(2)).max(request.max_output_bytes) as usize
}

fn effective_cmdline(request: &ExecRequest) -> Vec<String> {
    let mut cmdline = Vec::with_capacity(request.args.len() + 1);
    cmdline.push(request.program.clone());
    cmdline.extend(request.args.iter().cloned());
    cmdline
}

#[cfg(unix)]
fn status_signal(status: &std::process::ExitStatus) -> Option<i32> {
    status.signal()
}

#[cfg(not(unix))]
fn status_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}

/// Spawn failures and unavailable pipes complete the call normally; the
/// caller sees the failure through `exit_code = -1`.
fn failure_response(request: &ExecRequest, duration: Duration) -> ExecResponse {
    let bytes_start = request.page.cursor.offset;
    ExecResponse {
        exit_code: -1,
        signal: None,
        duration_ms: duration.as_millis() as u64,
        stdout_chunk: String::new(),
        stderr_chunk: String::new(),
        bytes_start,
        bytes_end: bytes_start,
        total_bytes: 0,
        truncated: false,
        next_cursor: None,
        spill_uri: None,
        stderr_spill_uri: None,
        mime: "text/plain".to_string(),
        line_count: 0,
        stderr_count: 0,
        cmdline: request.cmdline.clone(),
        effective_cmdline: effective_cmdline(request),
        cwd: request.cwd.display().to_string(),
        timeout_ms: request.timeout_ms,
        max_output_bytes: request.max_output_bytes,
    }
}

struct StreamCapture {
    /// Rolling tail of the stream; older bytes are discarded once the
    /// window fills.
    tail: Vec<u8>,
    /// Stream offset of `tail[0]`.
    tail_start: u64,
    total_bytes: u64,
    lines: u64,
    wrote_spill: bool,
}

/// Drains a child stream to EOF without ever holding more than `window`
/// bytes in memory. When `spill_path` is set every byte is also appended to
/// disk; a spill write failure degrades to the no-spill path (the partial
/// file is removed so cursors can never read torn ranges).
async fn read_stream<R: AsyncRead + Unpin>(
    mut reader: R,
    window: usize,
    spill_path: Option<PathBuf>,
) -> StreamCapture {
    let mut capture = StreamCapture {
        tail: Vec::with_capacity(window.min(8 * 1024)),
        tail_start: 0,
        total_bytes: 0,
        lines: 0,
        wrote_spill: false,
    };
    let mut spill_file: Option<tokio::fs::File> = None;
    let mut spill_failed = false;
    let mut buf = [0u8; 8192];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) => {
                warn!("error reading child stream: {err}");
                break;
            }
        };
        let bytes = &buf[..n];
        capture.total_bytes += n as u64;
        capture.lines += bytes.iter().filter(|b| **b == b'\n').count() as u64;

        if let Some(path) = &spill_path
            && !spill_failed
        {
            if spill_file.is_none() {
                match tokio::fs::File::create(path).await {
                    Ok(file) => spill_file = Some(file),
                    Err(err) => {
                        warn!("could not create spill file {}: {err}", path.display());
                        spill_failed = true;
                    }
                }
            }
            if let Some(mut file) = spill_file.take() {
                if let Err(err) = file.write_all(bytes).await {
                    warn!("spill write failed for {}: {err}", path.display());
                    spill_failed = true;
                    remove_if_present(path).await;
                } else {
                    capture.wrote_spill = true;
                    spill_file = Some(file);
                }
            }
        }

        capture.tail.extend_from_slice(bytes);
        if capture.tail.len() > window {
            let excess = capture.tail.len() - window;
            capture.tail.drain(..excess);
            capture.tail_start += excess as u64;
        }
    }

    if let Some(mut file) = spill_file
        && let Err(err) = file.flush().await
    {
        warn!("spill flush failed: {err}");
    }
    if spill_failed {
        capture.wrote_spill = false;
    }
    capture
}

struct StdoutPage {
    chunk: Vec<u8>,
    bytes_start: u64,
    bytes_end: u64,
}

/// Serves `[cursor.offset, cursor.offset + limit_bytes)` clipped to the
/// stream length. Pages are byte-bounded; the line budget cuts the chunk
/// only in truncate mode, where it is part of the truncation contract. The
/// chunk comes from the spill file when one exists; otherwise from the
/// in-memory tail. A cursor pointing into discarded in-memory bytes yields
/// an empty chunk with `bytes_end = bytes_start` so the cursor is
/// re-offered unchanged.
async fn build_stdout_page(
    page: &PageParams,
    stdout: &StreamCapture,
    spill: Option<&SpillHandle>,
    clip_lines: bool,
) -> StdoutPage {
    let total = stdout.total_bytes;
    let bytes_start = page.cursor.offset;
    let bytes_end = bytes_start.saturating_add(page.limit_bytes).min(total);
    if bytes_end <= bytes_start {
        return StdoutPage {
            chunk: Vec::new(),
            bytes_start,
            bytes_end: bytes_start,
        };
    }

    let mut chunk = if let Some(handle) = spill.filter(|_| stdout.wrote_spill) {
        match read_range(&handle.stdout_path, bytes_start, bytes_end).await {
            Ok(chunk) => chunk,
            Err(err) => {
                warn!("spill read failed, falling back to memory: {err}");
                slice_tail(stdout, bytes_start, bytes_end)
            }
        }
    } else {
        slice_tail(stdout, bytes_start, bytes_end)
    };

    if clip_lines {
        clip_to_line_budget(&mut chunk, page.limit_lines);
    }
    let bytes_end = bytes_start + chunk.len() as u64;
    StdoutPage {
        chunk,
        bytes_start,
        bytes_end,
    }
}

fn slice_tail(capture: &StreamCapture, bytes_start: u64, bytes_end: u64) -> Vec<u8> {
    if bytes_start < capture.tail_start {
        // The requested range fell out of the window; spill mode is the
        // supported path for pages this deep.
        return Vec::new();
    }
    let lo = (bytes_start - capture.tail_start) as usize;
    let hi = ((bytes_end - capture.tail_start) as usize).min(capture.tail.len());
    capture.tail.get(lo..hi).map(<[u8]>::to_vec).unwrap_or_default()
}

/// Cuts the chunk after `limit_lines` LF-terminated lines.
fn clip_to_line_budget(chunk: &mut Vec<u8>, limit_lines: u64) {
    let mut seen = 0u64;
    let mut cut = None;
    for (index, byte) in chunk.iter().enumerate() {
        if *byte == b'\n' {
            seen += 1;
            if seen == limit_lines {
                cut = Some(index + 1);
                break;
            }
        }
    }
    if let Some(cut) = cut {
        chunk.truncate(cut);
    }
}

/// Stderr page is always `[0, min(effective_max_bytes, total))`.
async fn read_stderr_chunk(
    request: &ExecRequest,
    stderr: &StreamCapture,
    spill: Option<&SpillHandle>,
) -> Vec<u8> {
    let end = request.max_output_bytes.min(stderr.total_bytes);
    if end == 0 {
        return Vec::new();
    }
    if let Some(handle) = spill.filter(|_| stderr.wrote_spill) {
        match read_range(&handle.stderr_path, 0, end).await {
            Ok(chunk) => return chunk,
            Err(err) => warn!("stderr spill read failed: {err}"),
        }
    }
    if stderr.tail_start == 0 {
        let hi = (end as usize).min(stderr.tail.len());
        stderr.tail[..hi].to_vec()
    } else {
        // Head was discarded without a spill file; return the retained tail.
        stderr.tail.clone()
    }
}

async fn remove_if_present(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!("could not remove spill file {}: {err}", path.display()),
    }
}
