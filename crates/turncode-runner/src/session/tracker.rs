//! Append-only session chains keyed by agent.
//!
//! The last token of a chain is the one to resume from. Tokens are only ever
//! appended after a successful turn; nothing is overwritten or dropped.

use std::collections::{BTreeMap, HashMap};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::types::AgentId;

/// One completed turn in a chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainEntry {
    pub token: String,
    /// Milliseconds since the Unix epoch.
    pub completed_at_ms: u64,
}

/// Serializable copy of every chain, for carrying state across processes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    #[serde(default)]
    pub agents: BTreeMap<AgentId, Vec<ChainEntry>>,
}

/// Owner of all session chains of one orchestrator.
#[derive(Debug, Default)]
pub struct SessionTracker {
    chains: RwLock<HashMap<AgentId, Vec<ChainEntry>>>,
}

impl SessionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a tracker from a snapshot taken earlier.
    pub fn from_snapshot(snapshot: SessionSnapshot) -> Self {
        let chains = snapshot
            .agents
            .into_iter()
            .filter(|(_, entries)| !entries.is_empty())
            .collect();
        Self {
            chains: RwLock::new(chains),
        }
    }

    /// Token to present on the agent's next turn.
    pub async fn current_token(&self, agent_id: &AgentId) -> Option<String> {
        self.chains
            .read()
            .await
            .get(agent_id)
            .and_then(|chain| chain.last())
            .map(|entry| entry.token.clone())
    }

    /// Append `token` to the agent's chain.
    pub async fn update(&self, agent_id: &AgentId, token: impl Into<String>) {
        let token = token.into();
        if token.trim().is_empty() {
            warn!(agent_id = %agent_id, "Ignoring empty session token");
            return;
        }
        let entry = ChainEntry {
            token,
            completed_at_ms: now_millis(),
        };
        let mut chains = self.chains.write().await;
        let chain = chains.entry(agent_id.clone()).or_default();
        debug!(
            agent_id = %agent_id,
            token = %entry.token,
            chain_len = chain.len() + 1,
            "Session chain advanced"
        );
        chain.push(entry);
    }

    /// All tokens of the agent, oldest first.
    pub async fn chain(&self, agent_id: &AgentId) -> Vec<String> {
        self.chains
            .read()
            .await
            .get(agent_id)
            .map(|chain| chain.iter().map(|e| e.token.clone()).collect())
            .unwrap_or_default()
    }

    /// Agents with at least one completed turn.
    pub async fn agents(&self) -> Vec<AgentId> {
        let mut agents: Vec<AgentId> = self.chains.read().await.keys().cloned().collect();
        agents.sort();
        agents
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        let chains = self.chains.read().await;
        SessionSnapshot {
            agents: chains
                .iter()
                .map(|(agent, chain)| (agent.clone(), chain.clone()))
                .collect(),
        }
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn unknown_agent_has_no_token() {
        let tracker = SessionTracker::new();
        let agent = AgentId::from("nobody");
        assert_eq!(tracker.current_token(&agent).await, None);
        assert!(tracker.chain(&agent).await.is_empty());
    }

    #[tokio::test]
    async fn update_appends_and_keeps_history() {
        let tracker = SessionTracker::new();
        let agent = AgentId::from("a");
        tracker.update(&agent, "s1").await;
        assert_eq!(tracker.current_token(&agent).await.as_deref(), Some("s1"));
        tracker.update(&agent, "s2").await;
        assert_eq!(tracker.current_token(&agent).await.as_deref(), Some("s2"));
        assert_eq!(tracker.chain(&agent).await, ["s1", "s2"]);

        let snapshot = tracker.snapshot().await;
        let entries = snapshot.agents.get(&agent).unwrap();
        assert!(entries[0].completed_at_ms <= entries[1].completed_at_ms);
    }

    #[tokio::test]
    async fn empty_token_is_ignored() {
        let tracker = SessionTracker::new();
        let agent = AgentId::from("a");
        tracker.update(&agent, "").await;
        assert!(tracker.chain(&agent).await.is_empty());
        assert!(tracker.agents().await.is_empty());
    }

    #[tokio::test]
    async fn agents_are_independent() {
        let tracker = Arc::new(SessionTracker::new());
        let mut tasks = Vec::new();
        for i in 0..8 {
            let tracker = Arc::clone(&tracker);
            tasks.push(tokio::spawn(async move {
                let agent = AgentId::new(format!("agent-{i}"));
                for turn in 0..5 {
                    tracker.update(&agent, format!("{agent}-t{turn}")).await;
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(tracker.agents().await.len(), 8);
        for i in 0..8 {
            let agent = AgentId::new(format!("agent-{i}"));
            let chain = tracker.chain(&agent).await;
            assert_eq!(chain.len(), 5);
            assert!(chain.iter().all(|t| t.starts_with(&format!("{agent}-"))));
            assert_eq!(chain[4], format!("{agent}-t4"));
        }
    }

    #[tokio::test]
    async fn snapshot_restores_chains() {
        let tracker = SessionTracker::new();
        let agent = AgentId::from("a");
        tracker.update(&agent, "s1").await;
        tracker.update(&agent, "s2").await;

        let json = serde_json::to_string(&tracker.snapshot().await).unwrap();
        let restored = SessionTracker::from_snapshot(serde_json::from_str(&json).unwrap());
        assert_eq!(restored.chain(&agent).await, ["s1", "s2"]);
        assert_eq!(
            restored.current_token(&agent).await.as_deref(),
            Some("s2")
        );
    }

    #[tokio::test]
    async fn empty_snapshot_file_shape() {
        let snapshot: SessionSnapshot = serde_json::from_str("{}").unwrap();
        let tracker = SessionTracker::from_snapshot(snapshot);
        assert!(tracker.agents().await.is_empty());
    }
}
