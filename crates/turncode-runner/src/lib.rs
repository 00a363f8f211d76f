//! turncode runner library
//!
//! Drives the Claude Code CLI one turn at a time:
//! - Process execution with timeouts and process-group cleanup
//! - Per-agent session chains for resuming conversations
//! - Retry with backoff for transient failures
//! - Concurrent, per-agent ordered batch execution

pub mod error;
pub mod orchestration;
pub mod orchestrator;
pub mod retry;
pub mod session;
pub mod subprocess;
pub mod types;

pub use error::ExecutionError;
pub use orchestration::BatchResults;
pub use orchestrator::Orchestrator;
pub use session::{SessionSnapshot, SessionTracker};
pub use types::{AgentId, ExecutionOptions, ExecutionRequest, ExecutionResult, ExecutionState};
