//! Per-agent session token chains.

mod tracker;

pub use tracker::{ChainEntry, SessionSnapshot, SessionTracker};
