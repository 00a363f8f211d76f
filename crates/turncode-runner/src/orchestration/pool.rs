//! Bounded pool of execution slots.
//!
//! [`ExecutionPool`] caps how many CLI processes run at once. It hands out
//! permits through a Tokio semaphore and keeps a registry of what each slot is
//! doing so callers can see which agents are active.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info};

use crate::types::AgentId;

/// Parallelism used when the configured limit is zero.
pub const DEFAULT_MAX_PARALLEL: usize = 10;

/// Right to run one execution. Returned to the pool on drop.
#[derive(Debug)]
pub struct PoolPermit {
    _permit: OwnedSemaphorePermit,
}

/// What an occupied slot is running.
#[derive(Debug, Clone)]
pub struct ActiveExecution {
    pub agent_id: AgentId,
    pub working_directory: PathBuf,
    pub started_at: Instant,
}

#[derive(Debug)]
pub struct ExecutionPool {
    semaphore: Arc<Semaphore>,
    max_parallel: usize,
    /// Keyed by a per-run slot id. Synchronous so registrations can be
    /// released from `Drop`.
    active: Mutex<HashMap<String, ActiveExecution>>,
}

/// Registry entry of a running execution, removed when dropped.
#[derive(Debug)]
pub struct Registration<'a> {
    pool: &'a ExecutionPool,
    slot_id: String,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        debug!(slot_id = %self.slot_id, "Execution slot released");
        if let Ok(mut active) = self.pool.active.lock() {
            active.remove(&self.slot_id);
        }
    }
}

impl ExecutionPool {
    pub fn new(max_parallel: usize) -> Self {
        let limit = if max_parallel == 0 {
            DEFAULT_MAX_PARALLEL
        } else {
            max_parallel
        };
        info!(max_parallel = limit, "Execution pool created");
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            max_parallel: limit,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Wait for a free slot.
    pub async fn acquire(&self) -> Result<PoolPermit, PoolError> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| PoolError::Closed)?;
        Ok(PoolPermit { _permit: permit })
    }

    /// Stop handing out permits; waiters get [`PoolError::Closed`].
    pub fn close(&self) {
        self.semaphore.close();
    }

    /// Record `entry` as running until the returned registration drops.
    pub fn register(&self, entry: ActiveExecution) -> Registration<'_> {
        let slot_id = uuid::Uuid::new_v4().to_string();
        debug!(slot_id = %slot_id, agent_id = %entry.agent_id, "Execution slot occupied");
        if let Ok(mut active) = self.active.lock() {
            active.insert(slot_id.clone(), entry);
        }
        Registration {
            pool: self,
            slot_id,
        }
    }

    /// Running executions per agent.
    pub fn active_by_agent(&self) -> HashMap<AgentId, usize> {
        let mut counts = HashMap::new();
        for entry in self.active() {
            *counts.entry(entry.agent_id).or_insert(0) += 1;
        }
        counts
    }

    pub fn active(&self) -> Vec<ActiveExecution> {
        self.active
            .lock()
            .map(|active| active.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().map(|active| active.len()).unwrap_or(0)
    }

    pub const fn max_parallel(&self) -> usize {
        self.max_parallel
    }

    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }
}

impl Default for ExecutionPool {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PARALLEL)
    }
}

/// Errors from the execution pool.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Execution pool has been closed")]
    Closed,
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn entry(agent: &str) -> ActiveExecution {
        ActiveExecution {
            agent_id: AgentId::from(agent),
            working_directory: PathBuf::from(format!("/w/{agent}")),
            started_at: Instant::now(),
        }
    }

    #[tokio::test]
    async fn zero_uses_default() {
        let pool = ExecutionPool::new(0);
        assert_eq!(pool.max_parallel(), DEFAULT_MAX_PARALLEL);
        assert_eq!(pool.available_permits(), DEFAULT_MAX_PARALLEL);
    }

    #[tokio::test]
    async fn permits_are_bounded_and_returned() {
        let pool = ExecutionPool::new(2);
        let p1 = pool.acquire().await.unwrap();
        let _p2 = pool.acquire().await.unwrap();
        assert_eq!(pool.available_permits(), 0);
        drop(p1);
        assert_eq!(pool.available_permits(), 1);
        let _p3 = pool.acquire().await.unwrap();
        assert_eq!(pool.available_permits(), 0);
    }

    #[tokio::test]
    async fn acquire_waits_for_release() {
        let pool = Arc::new(ExecutionPool::new(1));
        let held = pool.acquire().await.unwrap();
        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire().await.map(|_| ()) })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        drop(held);
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn closed_pool_rejects_waiters() {
        let pool = ExecutionPool::new(1);
        pool.close();
        assert!(matches!(pool.acquire().await, Err(PoolError::Closed)));
    }

    #[test]
    fn registry_counts_per_agent() {
        let pool = ExecutionPool::new(4);
        let first = pool.register(entry("a"));
        let _second = pool.register(entry("a"));
        let _third = pool.register(entry("b"));
        let counts = pool.active_by_agent();
        assert_eq!(counts[&AgentId::from("a")], 2);
        assert_eq!(counts[&AgentId::from("b")], 1);

        drop(first);
        assert_eq!(pool.active_count(), 2);
        assert_eq!(pool.active_by_agent()[&AgentId::from("a")], 1);
    }
}
