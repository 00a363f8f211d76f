//! Request, result and lifecycle types shared across the runner.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize, Serializer};
use turncode_core::AgentResponse;
use turncode_core::output::Usage;

use crate::error::ExecutionError;

/// Caller-assigned key for one conversational agent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(String);

impl AgentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Blank ids are rejected before any work is scheduled.
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AgentId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for AgentId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Per-turn behavioral overrides passed through to the CLI.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionOptions {
    /// Specialization text appended to the CLI's system prompt.
    pub system_prompt: Option<String>,
    pub allowed_tools: Vec<String>,
    pub disallowed_tools: Vec<String>,
    pub model: Option<String>,
    pub max_turns: Option<u32>,
    /// MCP configuration for this turn, replacing `executor.mcp_config`.
    pub mcp_config: Option<PathBuf>,
    /// Extra environment variables for the child process.
    pub env: BTreeMap<String, String>,
}

/// One turn for one agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub agent_id: AgentId,
    pub prompt: String,
    pub working_directory: PathBuf,
    /// Falls back to `executor.default_timeout_secs` when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub options: ExecutionOptions,
}

impl ExecutionRequest {
    pub fn new(
        agent_id: impl Into<AgentId>,
        prompt: impl Into<String>,
        working_directory: impl Into<PathBuf>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            prompt: prompt.into(),
            working_directory: working_directory.into(),
            timeout_ms: None,
            options: ExecutionOptions::default(),
        }
    }

    /// Sub-millisecond remainders round up, so a non-zero timeout stays
    /// non-zero.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        let ms = timeout.as_nanos().div_ceil(1_000_000);
        self.timeout_ms = Some(u64::try_from(ms).unwrap_or(u64::MAX));
        self
    }

    #[must_use]
    pub fn with_options(mut self, options: ExecutionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn timeout_or(&self, default: Duration) -> Duration {
        self.timeout_ms.map_or(default, Duration::from_millis)
    }
}

/// Outcome of one logical execution (the final attempt of a retry loop).
///
/// Built once through [`ExecutionResult::succeeded`] or
/// [`ExecutionResult::failed`]; never modified afterwards.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    /// Shared by every attempt of one logical execution.
    pub execution_id: String,
    pub agent_id: AgentId,
    /// 1-based; 0 when the request never reached the executor.
    pub attempt: u32,
    pub success: bool,
    pub result: String,
    /// New session token. Only present on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub usage: Usage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
    pub num_turns: u32,
    #[serde(rename = "duration_ms", serialize_with = "serialize_millis")]
    pub duration: Duration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionError>,
    /// Raw process output kept for diagnostics on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_output: Option<String>,
}

impl ExecutionResult {
    pub fn succeeded(
        execution_id: impl Into<String>,
        agent_id: AgentId,
        attempt: u32,
        response: AgentResponse,
        duration: Duration,
    ) -> Self {
        Self {
            execution_id: execution_id.into(),
            agent_id,
            attempt,
            success: true,
            result: response.result,
            session_id: response.session_id,
            usage: response.usage,
            cost_usd: response.cost_usd,
            num_turns: response.num_turns,
            duration,
            error: None,
            raw_output: None,
        }
    }

    pub fn failed(
        execution_id: impl Into<String>,
        agent_id: AgentId,
        attempt: u32,
        error: ExecutionError,
        duration: Duration,
    ) -> Self {
        Self {
            execution_id: execution_id.into(),
            agent_id,
            attempt,
            success: false,
            result: String::new(),
            session_id: None,
            usage: Usage::default(),
            cost_usd: None,
            num_turns: 0,
            duration,
            raw_output: error.raw().map(String::from),
            error: Some(error),
        }
    }

    /// A request rejected or skipped before reaching the executor.
    pub fn not_run(request: &ExecutionRequest, error: ExecutionError) -> Self {
        Self::failed(
            uuid::Uuid::new_v4().to_string(),
            request.agent_id.clone(),
            0,
            error,
            Duration::ZERO,
        )
    }

    /// Copy of this failure carrying a different error.
    #[must_use]
    pub fn with_error(&self, error: ExecutionError) -> Self {
        Self::failed(
            self.execution_id.clone(),
            self.agent_id.clone(),
            self.attempt,
            error,
            self.duration,
        )
    }
}

#[allow(clippy::cast_possible_truncation)]
fn serialize_millis<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

/// Lifecycle of one logical execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    Idle,
    Spawning,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Retrying,
    PermanentFailure,
}

impl ExecutionState {
    /// Move to `next`, rejecting transitions outside the lifecycle graph.
    pub fn advance(self, next: Self) -> Result<Self, InvalidTransition> {
        use ExecutionState::{
            Failed, Idle, PermanentFailure, Retrying, Running, Spawning, Succeeded, TimedOut,
        };
        let allowed = matches!(
            (self, next),
            (Idle | Retrying, Spawning)
                | (Spawning, Running | Failed)
                | (Running, Succeeded | Failed | TimedOut)
                | (Failed | TimedOut, Retrying | PermanentFailure)
                | (Retrying, PermanentFailure)
        );
        if allowed {
            Ok(next)
        } else {
            Err(InvalidTransition {
                from: self,
                to: next,
            })
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::PermanentFailure)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Invalid execution state transition {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub from: ExecutionState,
    pub to: ExecutionState,
}
