use std::io;
use thiserror::Error;
use tokio::task::JoinError;

pub type Result<T> = std::result::Result<T, ShemcpErr>;

#[derive(Error, Debug)]
pub enum ShemcpErr {
    /// Every leading token was a `KEY=value` assignment.
    #[error("no command found after environment variable assignments")]
    NoCommandAfterEnv,

    /// The wrapper flags never demanded a command string.
    #[error("missing -c command string")]
    MissingDashC,

    /// `-c` was seen but the argument list ended before the command string.
    #[error("missing command string after -c")]
    MissingCommandString,

    /// The `-c` argument tokenized to nothing.
    #[error("empty command string")]
    EmptyCommandString,

    #[error("{0}")]
    InvalidCursor(String),

    #[error("{0}")]
    InvalidLimit(String),

    #[error("cwd not allowed: {path} (must be within {root})")]
    CwdNotAllowed { path: String, root: String },

    #[error("cwd not accessible: {0}")]
    CwdNotAccessible(String),

    /// The lexical path was inside the boundary but its realpath escaped it.
    #[error("cwd not allowed: {0} (resolved outside sandbox root)")]
    CwdEscapesRoot(String),

    /// `on_large_output = "error"` and the stream blew the page budget.
    #[error("Output too large: {bytes} bytes, {lines} lines. Use pagination or spill mode.")]
    OutputTooLarge { bytes: u64, lines: u64 },

    #[error("{0}")]
    InvalidUri(String),

    #[error("file not found: {0}")]
    SpillNotFound(String),

    #[error("invalid policy pattern `{pattern}`: {source}")]
    PolicyPattern {
        pattern: String,
        source: regex_lite::Error,
    },

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    TokioJoin(#[from] JoinError),
}
