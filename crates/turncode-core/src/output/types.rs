//! Types produced by the output parser.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON recovered from raw process output.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedOutput {
    /// One balanced JSON object or array found in the text.
    Single(Value),
    /// Newline-delimited JSON records (`stream-json`).
    Stream(NdjsonSequence),
}

impl ParsedOutput {
    /// All records in output order.
    ///
    /// A single top-level array is treated as a list of records, which is how
    /// `--output-format json --verbose` reports a turn.
    pub fn records(&self) -> Vec<&Value> {
        match self {
            Self::Single(Value::Array(items)) => items.iter().collect(),
            Self::Single(value) => vec![value],
            Self::Stream(seq) => seq.records.iter().collect(),
        }
    }

    /// Lines dropped while reading a stream. Always empty for `Single`.
    pub fn skipped(&self) -> &[SkippedLine] {
        match self {
            Self::Single(_) => &[],
            Self::Stream(seq) => &seq.skipped,
        }
    }
}

/// Records read from newline-delimited JSON output.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NdjsonSequence {
    pub records: Vec<Value>,
    /// Non-empty lines that were not valid JSON, kept for diagnostics.
    pub skipped: Vec<SkippedLine>,
}

/// A line of streaming output that failed to parse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedLine {
    /// 1-based line number in the raw output.
    pub line_number: usize,
    pub text: String,
    pub error: String,
}

/// No JSON could be recovered from the output.
///
/// Carries the complete raw text verbatim.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("No parseable JSON in output: {reason}")]
pub struct ParseError {
    pub raw: String,
    pub reason: String,
}

impl ParseError {
    pub(crate) fn new(raw: &str, reason: impl Into<String>) -> Self {
        Self {
            raw: raw.to_string(),
            reason: reason.into(),
        }
    }
}

/// Canonical response of one Claude Code turn.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentResponse {
    /// Final result text (may be empty for some error subtypes).
    pub result: String,
    /// Session token to resume from on the next turn.
    pub session_id: Option<String>,
    pub is_error: bool,
    pub subtype: ResultSubtype,
    pub duration_ms: u64,
    pub duration_api_ms: u64,
    pub num_turns: u32,
    pub cost_usd: Option<f64>,
    pub usage: Usage,
}

/// Result subtype reported by the CLI.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultSubtype {
    #[default]
    Success,
    ErrorMaxTurns,
    ErrorDuringExecution,
    Unknown(String),
}

impl ResultSubtype {
    pub fn from_wire(value: Option<&str>) -> Self {
        match value {
            Some("success") | None => Self::Success,
            Some("error_max_turns") => Self::ErrorMaxTurns,
            Some("error_during_execution") => Self::ErrorDuringExecution,
            Some(other) => Self::Unknown(other.to_string()),
        }
    }

    /// Name as it appears on the wire.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Success => "success",
            Self::ErrorMaxTurns => "error_max_turns",
            Self::ErrorDuringExecution => "error_during_execution",
            Self::Unknown(other) => other,
        }
    }

    pub const fn is_error(&self) -> bool {
        matches!(self, Self::ErrorMaxTurns | Self::ErrorDuringExecution)
    }
}

/// Token usage statistics.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
}
