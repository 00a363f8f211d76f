//! Concurrent execution of many agents' turns.
//!
//! [`ConcurrencyManager`] is the coordinator that:
//! - binds every agent to one working directory and rejects sharing
//! - runs each agent's requests one at a time, in submission order
//! - lets different agents run in parallel, bounded by [`ExecutionPool`]
//! - threads session tokens from the [`SessionTracker`] into each turn
//! - propagates cancellation to every running process

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use turncode_core::config::ConcurrencyConfig;

use super::batch::BatchResults;
use super::pool::{ActiveExecution, ExecutionPool};
use crate::error::ExecutionError;
use crate::retry::RetryController;
use crate::session::SessionTracker;
use crate::types::{AgentId, ExecutionRequest, ExecutionResult};

/// Serializes one agent's turns from token read to token update.
type TurnLock = Arc<Mutex<()>>;

#[derive(Debug, Default)]
struct Bindings {
    by_agent: HashMap<AgentId, AgentBinding>,
    by_directory: HashMap<PathBuf, AgentId>,
}

#[derive(Debug)]
struct AgentBinding {
    working_directory: PathBuf,
    turn_lock: TurnLock,
}

/// A request after admission, or the reason it was refused.
enum Queued {
    Run(ExecutionRequest, TurnLock),
    Rejected(ExecutionResult),
}

pub struct ConcurrencyManager {
    controller: RetryController,
    tracker: Arc<SessionTracker>,
    pool: ExecutionPool,
    bindings: RwLock<Bindings>,
    shutdown: CancellationToken,
    halt_agent_on_failure: bool,
}

impl ConcurrencyManager {
    pub fn new(
        controller: RetryController,
        tracker: Arc<SessionTracker>,
        config: &ConcurrencyConfig,
    ) -> Self {
        Self {
            controller,
            tracker,
            pool: ExecutionPool::new(config.max_parallel),
            bindings: RwLock::new(Bindings::default()),
            shutdown: CancellationToken::new(),
            halt_agent_on_failure: config.halt_agent_on_failure,
        }
    }

    pub const fn tracker(&self) -> &Arc<SessionTracker> {
        &self.tracker
    }

    pub const fn pool(&self) -> &ExecutionPool {
        &self.pool
    }

    /// Cancel everything in flight and refuse new work.
    pub fn shutdown(&self) {
        info!(
            active = self.pool.active_count(),
            "Shutting down, cancelling all executions"
        );
        self.shutdown.cancel();
        self.pool.close();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Working directory an agent is bound to, once it has been seen.
    pub async fn binding(&self, agent_id: &AgentId) -> Option<PathBuf> {
        self.bindings
            .read()
            .await
            .by_agent
            .get(agent_id)
            .map(|b| b.working_directory.clone())
    }

    /// Run one request. Waits behind earlier turns of the same agent.
    pub async fn execute(
        &self,
        request: &ExecutionRequest,
        cancel: &CancellationToken,
    ) -> ExecutionResult {
        let token = self.scoped_token(cancel);
        let _release = token.clone().drop_guard();

        let turn_lock = match self.admit(request).await {
            Ok(lock) => lock,
            Err(err) => return ExecutionResult::not_run(request, err),
        };
        self.run_admitted(request, turn_lock, &token)
            .await
            .unwrap_or_else(|| {
                ExecutionResult::not_run(
                    request,
                    ExecutionError::Cancelled { raw: String::new() },
                )
            })
    }

    /// Run a batch: agents in parallel, each agent's requests in order.
    ///
    /// Every request is admitted before anything is spawned, so directory
    /// conflicts are reported without side effects. Cancelling `cancel`
    /// terminates running processes and returns what completed so far.
    pub async fn run_batch(
        self: &Arc<Self>,
        requests: Vec<ExecutionRequest>,
        cancel: &CancellationToken,
    ) -> BatchResults {
        let token = self.scoped_token(cancel);
        let _release = token.clone().drop_guard();
        let started = Instant::now();
        let total = requests.len();

        let mut order: Vec<AgentId> = Vec::new();
        let mut queues: HashMap<AgentId, Vec<Queued>> = HashMap::new();
        for request in requests {
            let item = match self.admit(&request).await {
                Ok(lock) => Queued::Run(request, lock),
                Err(err) => {
                    warn!(agent_id = %request.agent_id, error = %err, "Request rejected");
                    Queued::Rejected(ExecutionResult::not_run(&request, err))
                }
            };
            let agent_id = match &item {
                Queued::Run(req, _) => req.agent_id.clone(),
                Queued::Rejected(res) => res.agent_id.clone(),
            };
            queues
                .entry(agent_id.clone())
                .or_insert_with(|| {
                    order.push(agent_id);
                    Vec::new()
                })
                .push(item);
        }

        info!(
            requests = total,
            agents = order.len(),
            max_parallel = self.pool.max_parallel(),
            "Starting batch"
        );

        let mut tasks = JoinSet::new();
        for agent_id in order {
            let queue = queues.remove(&agent_id).unwrap_or_default();
            let manager = Arc::clone(self);
            let token = token.clone();
            tasks.spawn(async move {
                let results = manager.drain_queue(&agent_id, queue, &token).await;
                (agent_id, results)
            });
        }

        let mut batch = BatchResults::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((agent_id, results)) => batch.extend(agent_id, results),
                Err(e) => error!(error = %e, "Agent queue task failed"),
            }
        }
        if token.is_cancelled() {
            batch.mark_cancelled();
        }

        info!(
            agents = batch.len(),
            results = batch.total(),
            cancelled = batch.was_cancelled(),
            duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            "Batch finished"
        );
        batch
    }

    /// Run one agent's queue front to back.
    async fn drain_queue(
        &self,
        agent_id: &AgentId,
        queue: Vec<Queued>,
        token: &CancellationToken,
    ) -> Vec<ExecutionResult> {
        let mut results = Vec::with_capacity(queue.len());
        let mut halted = false;

        for item in queue {
            if token.is_cancelled() {
                break;
            }
            let (request, turn_lock) = match item {
                Queued::Rejected(result) => {
                    halted |= self.halt_agent_on_failure;
                    results.push(result);
                    continue;
                }
                Queued::Run(request, turn_lock) => (request, turn_lock),
            };
            if halted {
                debug!(agent_id = %agent_id, "Skipping request after earlier failure");
                results.push(ExecutionResult::not_run(
                    &request,
                    ExecutionError::Skipped {
                        reason: format!("an earlier request of agent {agent_id} failed"),
                    },
                ));
                continue;
            }
            let Some(result) = self.run_admitted(&request, turn_lock, token).await else {
                break;
            };
            if !result.success {
                halted |= self.halt_agent_on_failure;
            }
            results.push(result);
        }
        results
    }

    /// Validate `request` and bind its agent to its working directory.
    async fn admit(&self, request: &ExecutionRequest) -> Result<TurnLock, ExecutionError> {
        if request.agent_id.is_blank() {
            return Err(ExecutionError::Validation {
                message: "agent id must not be empty".to_string(),
            });
        }
        if request.prompt.trim().is_empty() {
            return Err(ExecutionError::Validation {
                message: format!("prompt for agent {} is empty", request.agent_id),
            });
        }
        if request.timeout_ms == Some(0) {
            return Err(ExecutionError::Validation {
                message: format!("timeout for agent {} must be positive", request.agent_id),
            });
        }

        let directory = normalize(&request.working_directory);
        let mut bindings = self.bindings.write().await;

        if let Some(bound) = bindings.by_agent.get(&request.agent_id) {
            if bound.working_directory != directory {
                return Err(ExecutionError::Validation {
                    message: format!(
                        "agent {} is bound to {}, not {}",
                        request.agent_id,
                        bound.working_directory.display(),
                        directory.display()
                    ),
                });
            }
            return Ok(Arc::clone(&bound.turn_lock));
        }

        if let Some(owner) = bindings.by_directory.get(&directory) {
            return Err(ExecutionError::WorkingDirectoryConflict {
                path: directory,
                owner: owner.clone(),
            });
        }

        debug!(
            agent_id = %request.agent_id,
            working_dir = %directory.display(),
            "Agent bound to working directory"
        );
        let turn_lock = TurnLock::default();
        bindings
            .by_directory
            .insert(directory.clone(), request.agent_id.clone());
        bindings.by_agent.insert(
            request.agent_id.clone(),
            AgentBinding {
                working_directory: directory,
                turn_lock: Arc::clone(&turn_lock),
            },
        );
        Ok(turn_lock)
    }

    /// Returns `None` when cancelled before the request started.
    async fn run_admitted(
        &self,
        request: &ExecutionRequest,
        turn_lock: TurnLock,
        token: &CancellationToken,
    ) -> Option<ExecutionResult> {
        let agent_id = &request.agent_id;

        let _turn = tokio::select! {
            biased;
            () = token.cancelled() => return None,
            guard = turn_lock.lock_owned() => guard,
        };
        let _permit = tokio::select! {
            biased;
            () = token.cancelled() => return None,
            permit = self.pool.acquire() => permit.ok()?,
        };

        let _slot = self.pool.register(ActiveExecution {
            agent_id: agent_id.clone(),
            working_directory: request.working_directory.clone(),
            started_at: Instant::now(),
        });
        let resume = self.tracker.current_token(agent_id).await;
        let result = self.controller.attempt(request, resume.as_deref(), token).await;

        if result.success
            && let Some(session_id) = &result.session_id
        {
            self.tracker.update(agent_id, session_id.clone()).await;
        }
        Some(result)
    }

    /// Token cancelled by `external` or by [`Self::shutdown`].
    fn scoped_token(&self, external: &CancellationToken) -> CancellationToken {
        let scoped = self.shutdown.child_token();
        let watch = scoped.clone();
        let forward = external.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = forward.cancelled() => watch.cancel(),
                () = watch.cancelled() => {}
            }
        });
        scoped
    }
}

/// Key used for the directory binding table.
fn normalize(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use turncode_core::config::{ExecutorConfig, RetryConfig};

    use super::*;
    use crate::subprocess::{DirectResolver, ProcessExecutor};

    fn manager() -> Arc<ConcurrencyManager> {
        let executor = ProcessExecutor::new(Arc::new(DirectResolver), Duration::from_millis(200));
        let exec_config = ExecutorConfig {
            program: "/no/such/claude".into(),
            ..ExecutorConfig::default()
        };
        let controller = RetryController::new(executor, &exec_config, &RetryConfig::default());
        Arc::new(ConcurrencyManager::new(
            controller,
            Arc::new(SessionTracker::new()),
            &ConcurrencyConfig::default(),
        ))
    }

    #[tokio::test]
    async fn blank_agent_and_prompt_are_rejected() {
        let m = manager();
        let err = m
            .admit(&ExecutionRequest::new(" ", "hi", "/tmp"))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Validation { .. }));
        let err = m
            .admit(&ExecutionRequest::new("a", "", "/tmp"))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Validation { .. }));
    }

    #[tokio::test]
    async fn zero_timeout_is_rejected() {
        let m = manager();
        let dir = tempfile::tempdir().unwrap();
        let req = ExecutionRequest::new("a", "hi", dir.path()).with_timeout(Duration::ZERO);
        let err = m.admit(&req).await.unwrap_err();
        assert!(matches!(err, ExecutionError::Validation { .. }));
        assert!(m.binding(&AgentId::from("a")).await.is_none());

        let req = ExecutionRequest::new("a", "hi", dir.path()).with_timeout(Duration::from_millis(900));
        assert!(m.admit(&req).await.is_ok());
    }

    #[tokio::test]
    async fn directory_bound_to_one_agent() {
        let m = manager();
        let dir = tempfile::tempdir().unwrap();
        let other = tempfile::tempdir().unwrap();

        let first = m
            .admit(&ExecutionRequest::new("a", "hi", dir.path()))
            .await
            .unwrap();
        let again = m
            .admit(&ExecutionRequest::new("a", "more", dir.path()))
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&first, &again));

        let err = m
            .admit(&ExecutionRequest::new("b", "hi", dir.path()))
            .await
            .unwrap_err();
        match err {
            ExecutionError::WorkingDirectoryConflict { owner, .. } => {
                assert_eq!(owner, AgentId::from("a"));
            }
            other => panic!("unexpected {other:?}"),
        }

        let err = m
            .admit(&ExecutionRequest::new("a", "hi", other.path()))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Validation { .. }));
        assert_eq!(
            m.binding(&AgentId::from("a")).await,
            Some(dir.path().canonicalize().unwrap())
        );
    }

    #[tokio::test]
    async fn spawn_failure_halts_the_agent_queue() {
        let m = manager();
        let dir = tempfile::tempdir().unwrap();
        let batch = m
            .run_batch(
                vec![
                    ExecutionRequest::new("a", "one", dir.path()),
                    ExecutionRequest::new("a", "two", dir.path()),
                ],
                &CancellationToken::new(),
            )
            .await;
        let results = batch.all(&AgentId::from("a"));
        assert_eq!(results.len(), 2);
        assert!(matches!(results[0].error, Some(ExecutionError::Spawn { .. })));
        assert!(matches!(results[1].error, Some(ExecutionError::Skipped { .. })));
        assert!(!batch.was_cancelled());
    }

    #[tokio::test]
    async fn cancelled_before_start_yields_nothing() {
        let m = manager();
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let batch = m
            .run_batch(
                vec![ExecutionRequest::new("a", "one", dir.path())],
                &cancel,
            )
            .await;
        assert!(batch.is_empty());
        assert!(batch.was_cancelled());
    }

    #[tokio::test]
    async fn shutdown_cancels_later_requests() {
        let m = manager();
        let dir = tempfile::tempdir().unwrap();
        m.shutdown();
        assert!(m.is_shut_down());
        let res = m
            .execute(
                &ExecutionRequest::new("a", "hi", dir.path()),
                &CancellationToken::new(),
            )
            .await;
        assert!(matches!(res.error, Some(ExecutionError::Cancelled { .. })));
        assert_eq!(res.attempt, 0);
    }
}
