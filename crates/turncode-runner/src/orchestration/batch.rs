//! Results of a batch run.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;

use crate::types::{AgentId, ExecutionResult};

/// Every result of a batch, grouped by agent in submission order.
///
/// Requests that never started because the batch was cancelled have no
/// entry at all.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchResults {
    results: BTreeMap<AgentId, Vec<ExecutionResult>>,
    cancelled: bool,
}

impl BatchResults {
    /// Final result of `agent_id`: the outcome of its last turn in the batch.
    pub fn get(&self, agent_id: &AgentId) -> Option<&ExecutionResult> {
        self.results.get(agent_id).and_then(|list| list.last())
    }

    /// All results of `agent_id`, oldest first.
    pub fn all(&self, agent_id: &AgentId) -> &[ExecutionResult] {
        self.results.get(agent_id).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn agents(&self) -> impl Iterator<Item = &AgentId> {
        self.results.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&AgentId, &[ExecutionResult])> {
        self.results.iter().map(|(agent, list)| (agent, list.as_slice()))
    }

    /// Number of agents with at least one result.
    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Number of results across all agents.
    pub fn total(&self) -> usize {
        self.results.values().map(Vec::len).sum()
    }

    /// Whether the batch was cut short; the results are then partial.
    pub const fn was_cancelled(&self) -> bool {
        self.cancelled
    }

    pub fn all_succeeded(&self) -> bool {
        self.results.values().flatten().all(|r| r.success)
    }

    /// One final result per agent.
    pub fn into_final_map(self) -> HashMap<AgentId, ExecutionResult> {
        self.results
            .into_iter()
            .filter_map(|(agent, mut list)| list.pop().map(|last| (agent, last)))
            .collect()
    }

    pub(crate) fn extend(&mut self, agent_id: AgentId, results: Vec<ExecutionResult>) {
        if results.is_empty() {
            return;
        }
        self.results.entry(agent_id).or_default().extend(results);
    }

    pub(crate) const fn mark_cancelled(&mut self) {
        self.cancelled = true;
    }
}
