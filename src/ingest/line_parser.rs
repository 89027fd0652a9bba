//! Storage-node log line parser
//!
//! Line format (one event per line, tab separated):
//!
//! ```text
//! 2025-10-25T12:00:00Z<TAB>INFO<TAB>piecestore<TAB>downloaded<TAB>{"Piece ID": "..."}
//! ```

use crate::pipeline::types::LogLevel;
use chrono::NaiveDateTime;
use serde_json::{Map, Value};
use thiserror::Error;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";
const TIMESTAMP_LEN: usize = 20;

/// Syntax failures; the caller routes the raw line to the unprocessed sink
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("blank line")]
    Blank,

    #[error("expected 5 tab-separated fields, found {0}")]
    FieldCount(usize),

    #[error("invalid timestamp '{0}'")]
    Timestamp(String),

    #[error("unknown level '{0}'")]
    Level(String),

    #[error("details are not a JSON object: {0}")]
    Details(String),
}

/// A syntactically valid log line
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedLine {
    /// Unix seconds (UTC)
    pub timestamp: i64,
    pub level: LogLevel,
    pub area: String,
    pub action: String,
    pub details: Map<String, Value>,
}

pub fn parse_timestamp(raw: &str) -> Result<i64, ParseError> {
    if raw.len() != TIMESTAMP_LEN {
        return Err(ParseError::Timestamp(raw.to_string()));
    }
    NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT)
        .map(|dt| dt.and_utc().timestamp())
        .map_err(|_| ParseError::Timestamp(raw.to_string()))
}

/// Parse one line (a trailing `\n` or `\r\n` is ignored)
pub fn parse_line(line: &str) -> Result<ParsedLine, ParseError> {
    let line = line.trim_end_matches(['\n', '\r']);
    if line.trim().is_empty() {
        return Err(ParseError::Blank);
    }

    let fields: Vec<&str> = line.split('\t').collect();
    let [timestamp, level, area, action, details] = fields.as_slice() else {
        return Err(ParseError::FieldCount(fields.len()));
    };

    let timestamp = parse_timestamp(timestamp)?;
    let level = LogLevel::from_str(level).ok_or_else(|| ParseError::Level(level.to_string()))?;

    let details = match serde_json::from_str::<Value>(details) {
        Ok(Value::Object(map)) => map,
        Ok(other) => return Err(ParseError::Details(format!("got {}", json_kind(&other)))),
        Err(e) => return Err(ParseError::Details(e.to_string())),
    };

    Ok(ParsedLine {
        timestamp,
        level,
        area: area.to_string(),
        action: action.to_string(),
        details,
    })
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
