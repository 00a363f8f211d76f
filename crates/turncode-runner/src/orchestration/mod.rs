//! Concurrent orchestration of agent turns.
//!
//! - [`ExecutionPool`]: semaphore-based limit on concurrent CLI processes.
//! - [`ConcurrencyManager`]: per-agent ordering, directory binding,
//!   batch execution and cancellation.
//! - [`BatchResults`]: per-agent results of a batch.

pub mod batch;
pub mod manager;
pub mod pool;

pub use batch::BatchResults;
pub use manager::ConcurrencyManager;
pub use pool::{ActiveExecution, ExecutionPool, PoolError, PoolPermit, Registration};
