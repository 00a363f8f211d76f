//! Failure taxonomy of one execution.

use std::path::PathBuf;

use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};

use crate::types::AgentId;

/// Why an execution did not produce a usable result.
///
/// Variants derived from process output carry the raw text verbatim.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExecutionError {
    #[error("Failed to spawn {program}: {reason}")]
    Spawn { program: String, reason: String },

    #[error("Execution timed out after {elapsed_ms} ms")]
    Timeout {
        elapsed_ms: u64,
        /// Token announced before the process was killed, if any.
        session_id: Option<String>,
        raw: String,
    },

    #[error("Could not parse CLI output: {reason}")]
    Parse {
        reason: String,
        /// Token announced before the output broke off, if any.
        session_id: Option<String>,
        raw: String,
    },

    #[error("CLI output still unparseable after {attempts} attempts: {reason}")]
    PermanentParse {
        attempts: u32,
        reason: String,
        raw: String,
    },

    #[error("Rate limited by the CLI")]
    RateLimited {
        session_id: Option<String>,
        raw: String,
    },

    #[error("CLI authentication failed")]
    Auth { raw: String },

    #[error("CLI rejected its arguments")]
    InvalidUsage { raw: String },

    #[error("Protocol mismatch: {reason}")]
    Protocol { reason: String, raw: String },

    #[error("Session {token} is unknown to the CLI")]
    SessionNotFound { token: String, raw: String },

    #[error("CLI exited with transient code {code}")]
    TransientExit {
        code: i32,
        session_id: Option<String>,
        raw: String,
    },

    #[error("CLI exited with {}", exit_label(*.code))]
    UnknownExit { code: Option<i32>, raw: String },

    #[error("CLI reported an error result ({subtype})")]
    Reported {
        subtype: String,
        message: String,
        session_id: Option<String>,
        raw: String,
    },

    #[error("Execution cancelled")]
    Cancelled { raw: String },

    #[error("Skipped: {reason}")]
    Skipped { reason: String },

    #[error("Working directory {} is bound to agent {owner}", .path.display())]
    WorkingDirectoryConflict { path: PathBuf, owner: AgentId },

    #[error("Invalid request: {message}")]
    Validation { message: String },
}

fn exit_label(code: Option<i32>) -> String {
    code.map_or_else(|| "no exit code (killed by signal)".to_string(), |c| format!("code {c}"))
}

impl ExecutionError {
    /// Stable snake_case name used in logs and serialized results.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Spawn { .. } => "spawn",
            Self::Timeout { .. } => "timeout",
            Self::Parse { .. } => "parse",
            Self::PermanentParse { .. } => "permanent_parse",
            Self::RateLimited { .. } => "rate_limited",
            Self::Auth { .. } => "auth",
            Self::InvalidUsage { .. } => "invalid_usage",
            Self::Protocol { .. } => "protocol",
            Self::SessionNotFound { .. } => "session_not_found",
            Self::TransientExit { .. } => "transient_exit",
            Self::UnknownExit { .. } => "unknown_exit",
            Self::Reported { .. } => "reported",
            Self::Cancelled { .. } => "cancelled",
            Self::Skipped { .. } => "skipped",
            Self::WorkingDirectoryConflict { .. } => "working_directory_conflict",
            Self::Validation { .. } => "validation",
        }
    }

    /// Failure classes worth another attempt when no session was committed.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. }
                | Self::Parse { .. }
                | Self::RateLimited { .. }
                | Self::TransientExit { .. }
        )
    }

    /// Session token produced by the failed attempt.
    ///
    /// An attempt with a token has already advanced the conversation on the
    /// CLI side and must not be resubmitted.
    pub fn committed_session(&self) -> Option<&str> {
        match self {
            Self::Timeout { session_id, .. }
            | Self::Parse { session_id, .. }
            | Self::RateLimited { session_id, .. }
            | Self::TransientExit { session_id, .. }
            | Self::Reported { session_id, .. } => session_id.as_deref(),
            _ => None,
        }
    }

    /// Raw process output behind this failure.
    pub fn raw(&self) -> Option<&str> {
        match self {
            Self::Timeout { raw, .. }
            | Self::Parse { raw, .. }
            | Self::PermanentParse { raw, .. }
            | Self::RateLimited { raw, .. }
            | Self::Auth { raw }
            | Self::InvalidUsage { raw }
            | Self::Protocol { raw, .. }
            | Self::SessionNotFound { raw, .. }
            | Self::TransientExit { raw, .. }
            | Self::UnknownExit { raw, .. }
            | Self::Reported { raw, .. }
            | Self::Cancelled { raw } => Some(raw),
            Self::Spawn { .. }
            | Self::Skipped { .. }
            | Self::WorkingDirectoryConflict { .. }
            | Self::Validation { .. } => None,
        }
    }
}

impl Serialize for ExecutionError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("ExecutionError", 3)?;
        state.serialize_field("kind", self.kind())?;
        state.serialize_field("message", &self.to_string())?;
        state.serialize_field("retryable", &self.is_retryable())?;
        state.end()
    }
}
