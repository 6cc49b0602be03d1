use serde::Deserialize;
use serde::Serialize;

use crate::error::Result;
use crate::error::ShemcpErr;

pub const DEFAULT_LIMIT_BYTES: u64 = 40_000;
pub const MAX_LIMIT_BYTES: u64 = 40_000;
pub const MIN_LIMIT_BYTES: u64 = 1;

pub const DEFAULT_LIMIT_LINES: u64 = 2_000;
pub const MAX_LIMIT_LINES: u64 = 100_000;
pub const MIN_LIMIT_LINES: u64 = 1;

/// Byte-offset marker into a single execution's stdout stream. Opaque to
/// callers but structurally visible; `bytes` is the only defined type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub cursor_type: String,
    pub offset: u64,
}

impl Cursor {
    pub fn bytes(offset: u64) -> Self {
        Self {
            cursor_type: "bytes".to_string(),
            offset,
        }
    }

    /// Strict structural validation of a caller-supplied cursor value. The
    /// offset goes through numeric coercion: any finite, non-negative JSON
    /// number with no fractional part is accepted.
    pub fn from_value(value: &serde_json::Value) -> Result<Self> {
        let Some(object) = value.as_object() else {
            return Err(ShemcpErr::InvalidCursor(
                "invalid cursor: expected an object".to_string(),
            ));
        };

        let Some(cursor_type) = object.get("cursor_type") else {
            return Err(ShemcpErr::InvalidCursor(
                "invalid cursor: missing cursor_type".to_string(),
            ));
        };
        match cursor_type.as_str() {
            Some("bytes") => {}
            Some(other) => {
                return Err(ShemcpErr::InvalidCursor(format!(
                    "invalid cursor: unsupported cursor_type {other:?}"
                )));
            }
            None => {
                return Err(ShemcpErr::InvalidCursor(
                    "invalid cursor: cursor_type must be a string".to_string(),
                ));
            }
        }

        let offset = object
            .get("offset")
            .and_then(serde_json::Value::as_f64)
            .ok_or_else(|| {
                ShemcpErr::InvalidCursor(
                    "invalid cursor: offset must be a non-negative integer".to_string(),
                )
            })?;
        if !offset.is_finite() || offset < 0.0 || offset.fract() != 0.0 {
            return Err(ShemcpErr::InvalidCursor(
                "invalid cursor: offset must be a non-negative integer".to_string(),
            ));
        }

        Ok(Cursor::bytes(offset as u64))
    }
}

/// Validated per-request pagination settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageParams {
    pub cursor: Cursor,
    pub limit_bytes: u64,
    pub limit_lines: u64,
}

/// Rejects out-of-range `limit_bytes`; values above the hard cap are an
/// error rather than a silent clamp.
pub fn validate_limit_bytes(value: Option<f64>) -> Result<u64> {
    let Some(value) = value else {
        return Ok(DEFAULT_LIMIT_BYTES);
    };
    if !value.is_finite() || value.fract() != 0.0 || value < MIN_LIMIT_BYTES as f64 {
        return Err(ShemcpErr::InvalidLimit(format!(
            "limit_bytes must be an integer between {MIN_LIMIT_BYTES} and {MAX_LIMIT_BYTES}"
        )));
    }
    if value > MAX_LIMIT_BYTES as f64 {
        return Err(ShemcpErr::InvalidLimit(format!(
            "limit_bytes must be at most {MAX_LIMIT_BYTES}"
        )));
    }
    Ok(value as u64)
}

pub fn validate_limit_lines(value: Option<f64>) -> Result<u64> {
    let Some(value) = value else {
        return Ok(DEFAULT_LIMIT_LINES);
    };
    if !value.is_finite()
        || value.fract() != 0.0
        || value < MIN_LIMIT_LINES as f64
        || value > MAX_LIMIT_LINES as f64
    {
        return Err(ShemcpErr::InvalidLimit(format!(
            "limit_lines must be an integer between {MIN_LIMIT_LINES} and {MAX_LIMIT_LINES}"
        )));
    }
    Ok(value as u64)
}
