//! Host-facing entry point.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;
use turncode_core::Config;

use crate::orchestration::{BatchResults, ConcurrencyManager};
use crate::retry::RetryController;
use crate::session::{SessionSnapshot, SessionTracker};
use crate::subprocess::SubprocessError;
use crate::types::{AgentId, ExecutionOptions, ExecutionRequest, ExecutionResult};

/// Owns the session chains and the concurrency manager of one
/// orchestration session. Independent orchestrators share nothing.
pub struct Orchestrator {
    manager: Arc<ConcurrencyManager>,
    config: Config,
}

impl Orchestrator {
    /// Orchestrator with empty session chains.
    pub fn new(config: Config) -> Result<Self, SubprocessError> {
        Self::with_tracker(config, SessionTracker::new())
    }

    /// Orchestrator continuing from previously recorded chains.
    pub fn with_tracker(config: Config, tracker: SessionTracker) -> Result<Self, SubprocessError> {
        let controller = RetryController::from_config(&config)?;
        Ok(Self::from_parts(config, controller, tracker))
    }

    pub fn from_parts(config: Config, controller: RetryController, tracker: SessionTracker) -> Self {
        info!(
            program = %config.executor.program,
            max_parallel = config.concurrency.max_parallel,
            max_attempts = config.retry.max_attempts,
            "Orchestrator ready"
        );
        let manager = ConcurrencyManager::new(controller, Arc::new(tracker), &config.concurrency);
        Self {
            manager: Arc::new(manager),
            config,
        }
    }

    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Run one turn for `agent_id`, resuming its conversation if it has one.
    pub async fn execute(
        &self,
        agent_id: impl Into<AgentId>,
        prompt: impl Into<String>,
        working_directory: impl Into<PathBuf>,
        options: ExecutionOptions,
    ) -> ExecutionResult {
        let request =
            ExecutionRequest::new(agent_id, prompt, working_directory).with_options(options);
        self.execute_request(&request).await
    }

    pub async fn execute_request(&self, request: &ExecutionRequest) -> ExecutionResult {
        self.manager
            .execute(request, &CancellationToken::new())
            .await
    }

    pub async fn execute_batch(&self, requests: Vec<ExecutionRequest>) -> BatchResults {
        self.execute_batch_with_cancel(requests, &CancellationToken::new())
            .await
    }

    /// Like [`Self::execute_batch`]; cancelling `cancel` stops the batch and
    /// returns the results completed so far.
    pub async fn execute_batch_with_cancel(
        &self,
        requests: Vec<ExecutionRequest>,
        cancel: &CancellationToken,
    ) -> BatchResults {
        self.manager.run_batch(requests, cancel).await
    }

    /// Session tokens of `agent_id`, oldest first.
    pub async fn session_chain(&self, agent_id: &AgentId) -> Vec<String> {
        self.manager.tracker().chain(agent_id).await
    }

    /// Agents with at least one completed turn, sorted.
    pub async fn agents(&self) -> Vec<AgentId> {
        self.manager.tracker().agents().await
    }

    pub async fn session_snapshot(&self) -> SessionSnapshot {
        self.manager.tracker().snapshot().await
    }

    /// Cancel all running executions. Later requests report `Cancelled`.
    pub fn shutdown(&self) {
        self.manager.shutdown();
    }

    /// Running executions per agent.
    pub fn active_executions(&self) -> HashMap<AgentId, usize> {
        self.manager.pool().active_by_agent()
    }

    pub fn available_slots(&self) -> usize {
        self.manager.pool().available_permits()
    }
}
