// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! C5 — Agent Registry. Grounded on `agents/manager.py`. Tracks domain
//! agents: create, look up, destroy, and expose config-hash buckets for
//! reuse.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::info;

use sven_core::DomainAgentHandle;

use crate::config_hash::AgentConfig;
use crate::ids::{AgentId, ConfigHash};
use crate::runner_manager::AgentCleanupCallback;

/// A language-model-backed entity created from an [`AgentConfig`].
/// Exactly one runner is bound to each agent.
pub struct DomainAgent {
    pub agent_id: AgentId,
    pub config: AgentConfig,
    pub config_hash: ConfigHash,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub handle: Arc<dyn DomainAgentHandle>,
}

struct State {
    agents: HashMap<AgentId, DomainAgent>,
    by_hash: HashMap<ConfigHash, Vec<AgentId>>,
}

pub struct AgentRegistry {
    state: Mutex<State>,
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                agents: HashMap::new(),
                by_hash: HashMap::new(),
            }),
        }
    }

    pub fn generate_id(&self) -> AgentId {
        AgentId::generate("agent")
    }

    pub async fn register(&self, agent_id: AgentId, config: AgentConfig, handle: Arc<dyn DomainAgentHandle>) {
        let config_hash = config.config_hash();
        let agent = DomainAgent {
            agent_id: agent_id.clone(),
            config,
            config_hash: config_hash.clone(),
            created_at: Utc::now(),
            last_activity: Utc::now(),
            handle,
        };
        let mut state = self.state.lock().await;
        state.by_hash.entry(config_hash).or_default().push(agent_id.clone());
        state.agents.insert(agent_id.clone(), agent);
        info!(%agent_id, "agent registered");
    }

    pub async fn lookup_handle(&self, agent_id: &AgentId) -> Option<Arc<dyn DomainAgentHandle>> {
        let state = self.state.lock().await;
        state.agents.get(agent_id).map(|a| a.handle.clone())
    }

    pub async fn config_hash_of(&self, agent_id: &AgentId) -> Option<ConfigHash> {
        let state = self.state.lock().await;
        state.agents.get(agent_id).map(|a| a.config_hash.clone())
    }

    pub async fn exists(&self, agent_id: &AgentId) -> bool {
        self.state.lock().await.agents.contains_key(agent_id)
    }

    pub async fn touch(&self, agent_id: &AgentId) {
        let mut state = self.state.lock().await;
        if let Some(agent) = state.agents.get_mut(agent_id) {
            agent.last_activity = Utc::now();
        }
    }

    /// Candidates sharing `config_hash`, in registration order. Callers
    /// must prune entries whose agent/runner/mapping turns out to be
    /// missing; this call alone does not check runner capacity.
    pub async fn candidates_for_hash(&self, config_hash: &ConfigHash) -> Vec<AgentId> {
        let state = self.state.lock().await;
        state.by_hash.get(config_hash).cloned().unwrap_or_default()
    }

    /// Drops a stale candidate (its runner/mapping no longer exists) from
    /// the reuse index without destroying anything else.
    pub async fn prune_candidate(&self, config_hash: &ConfigHash, agent_id: &AgentId) {
        let mut state = self.state.lock().await;
        if let Some(list) = state.by_hash.get_mut(config_hash) {
            list.retain(|id| id != agent_id);
        }
    }

    pub async fn cleanup_agent(&self, agent_id: &AgentId) {
        let mut state = self.state.lock().await;
        if let Some(agent) = state.agents.remove(agent_id) {
            if let Some(list) = state.by_hash.get_mut(&agent.config_hash) {
                list.retain(|id| id != agent_id);
            }
            info!(%agent_id, "agent destroyed");
        }
    }

    /// Agents idle past `idle_since`. The caller (the idle sweeper) still
    /// must check each candidate has no remaining runner mapping before
    /// cleaning it up — that check lives in `RunnerManager`, which this
    /// registry does not reach into.
    pub async fn idle_agents(&self, idle_since: DateTime<Utc>) -> Vec<AgentId> {
        let state = self.state.lock().await;
        state
            .agents
            .values()
            .filter(|a| a.last_activity < idle_since)
            .map(|a| a.agent_id.clone())
            .collect()
    }

    pub async fn count(&self) -> usize {
        self.state.lock().await.agents.len()
    }
}

/// Wires `RunnerManager::cleanup_runner`'s cascade directly into this
/// registry, so destroying a runner destroys exactly the agent bound to
/// it.
#[async_trait]
impl AgentCleanupCallback for AgentRegistry {
    async fn cleanup_agent(&self, agent_id: &AgentId) {
        AgentRegistry::cleanup_agent(self, agent_id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sven_core::EchoAgentHandle;

    fn config() -> AgentConfig {
        AgentConfig {
            agent_type: "asst".into(),
            system_prompt: "P".into(),
            model_config: serde_json::json!({"model": "m1"}),
            available_tools: vec![],
            framework_config: serde_json::Value::Null,
        }
    }

    #[tokio::test]
    async fn register_then_lookup_succeeds() {
        let registry = AgentRegistry::new();
        let id = registry.generate_id();
        registry.register(id.clone(), config(), Arc::new(EchoAgentHandle::default())).await;
        assert!(registry.exists(&id).await);
        assert!(registry.lookup_handle(&id).await.is_some());
    }

    #[tokio::test]
    async fn candidates_for_hash_groups_by_config() {
        let registry = AgentRegistry::new();
        let cfg = config();
        let hash = cfg.config_hash();
        let a1 = registry.generate_id();
        let a2 = registry.generate_id();
        registry.register(a1.clone(), cfg.clone(), Arc::new(EchoAgentHandle::default())).await;
        registry.register(a2.clone(), cfg, Arc::new(EchoAgentHandle::default())).await;
        let candidates = registry.candidates_for_hash(&hash).await;
        assert_eq!(candidates, vec![a1, a2]);
    }

    #[tokio::test]
    async fn cleanup_agent_removes_from_index() {
        let registry = AgentRegistry::new();
        let cfg = config();
        let hash = cfg.config_hash();
        let id = registry.generate_id();
        registry.register(id.clone(), cfg, Arc::new(EchoAgentHandle::default())).await;
        registry.cleanup_agent(&id).await;
        assert!(!registry.exists(&id).await);
        assert!(registry.candidates_for_hash(&hash).await.is_empty());
    }
}
