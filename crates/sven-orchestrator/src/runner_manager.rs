// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! C4 — Runner Manager. Grounded on `runner_manager.py::RunnerManager`.
//! Owns the pool of runners, one runner per domain agent (1:1), each
//! holding a private store of engine sessions.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info};

use sven_core::{DomainAgentHandle, EngineSession, HistoryEntry};

use crate::error::RuntimeError;
use crate::ids::{AgentId, ConfigHash, EngineSessionId, RunnerId};

/// An execution context bound 1:1 to a domain agent, owning a set of
/// engine sessions.
pub struct Runner {
    pub runner_id: RunnerId,
    pub agent_id: AgentId,
    pub config_hash: ConfigHash,
    pub app_name: String,
    pub last_activity: DateTime<Utc>,
    pub agent: Arc<dyn DomainAgentHandle>,
    sessions: HashMap<EngineSessionId, EngineSession>,
}

impl Runner {
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

/// Invoked when a runner is destroyed; by contract the callback deletes
/// the matching agent, cascading runner cleanup into agent cleanup.
#[async_trait]
pub trait AgentCleanupCallback: Send + Sync {
    async fn cleanup_agent(&self, agent_id: &AgentId);
}

struct State {
    runners: HashMap<RunnerId, Runner>,
    session_to_runner: HashMap<EngineSessionId, RunnerId>,
    config_to_runner: HashMap<ConfigHash, RunnerId>,
    agent_to_runner: HashMap<AgentId, RunnerId>,
}

pub struct RunnerManager {
    state: Mutex<State>,
    app_name: String,
    cleanup: Mutex<Option<Arc<dyn AgentCleanupCallback>>>,
}

impl RunnerManager {
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            state: Mutex::new(State {
                runners: HashMap::new(),
                session_to_runner: HashMap::new(),
                config_to_runner: HashMap::new(),
                agent_to_runner: HashMap::new(),
            }),
            app_name: app_name.into(),
            cleanup: Mutex::new(None),
        }
    }

    /// Registered once by the adapter at startup; `cleanup_runner` invokes
    /// it to cascade into agent deletion.
    pub async fn set_cleanup_callback(&self, callback: Arc<dyn AgentCleanupCallback>) {
        *self.cleanup.lock().await = Some(callback);
    }

    /// Reuse an existing runner for `config_hash` if `allow_reuse` and it
    /// has spare capacity; otherwise bind a fresh runner to `agent`.
    ///
    /// When `engine_session_id` is `Some`, a session is also created
    /// inside the (possibly new) runner.
    #[allow(clippy::too_many_arguments)]
    pub async fn get_or_create_runner(
        &self,
        config_hash: &ConfigHash,
        agent_id: &AgentId,
        agent: Arc<dyn DomainAgentHandle>,
        engine_session_id: Option<(EngineSessionId, String)>,
        allow_reuse: bool,
        max_sessions_per_agent: usize,
    ) -> Result<RunnerId, RuntimeError> {
        let mut state = self.state.lock().await;

        if allow_reuse {
            if let Some(runner_id) = state.config_to_runner.get(config_hash).cloned() {
                if let Some(runner) = state.runners.get(&runner_id) {
                    if runner.session_count() < max_sessions_per_agent {
                        debug!(%runner_id, "reusing runner for config hash");
                        if let Some((session_id, user_id)) = engine_session_id {
                            Self::insert_session(&mut state, &runner_id, session_id, user_id)?;
                        }
                        return Ok(runner_id);
                    }
                } else {
                    // Stale index entry — prune lazily.
                    state.config_to_runner.remove(config_hash);
                }
            }
        }

        let runner_id = RunnerId::generate("runner");
        let runner = Runner {
            runner_id: runner_id.clone(),
            agent_id: agent_id.clone(),
            config_hash: config_hash.clone(),
            app_name: self.app_name.clone(),
            last_activity: Utc::now(),
            agent,
            sessions: HashMap::new(),
        };
        state.runners.insert(runner_id.clone(), runner);
        state.agent_to_runner.insert(agent_id.clone(), runner_id.clone());
        if allow_reuse {
            state.config_to_runner.insert(config_hash.clone(), runner_id.clone());
        }
        info!(%runner_id, %agent_id, "created runner");

        if let Some((session_id, user_id)) = engine_session_id {
            Self::insert_session(&mut state, &runner_id, session_id, user_id)?;
        }
        Ok(runner_id)
    }

    fn insert_session(state: &mut State, runner_id: &RunnerId, session_id: EngineSessionId, user_id: String) -> Result<(), RuntimeError> {
        let runner = state
            .runners
            .get_mut(runner_id)
            .ok_or_else(|| RuntimeError::RunnerNotFound(runner_id.clone()))?;
        runner.last_activity = Utc::now();
        runner.sessions.insert(session_id.clone(), EngineSession::new(session_id.as_str(), user_id));
        state.session_to_runner.insert(session_id, runner_id.clone());
        Ok(())
    }

    /// Creates a new session inside an existing runner (the "new session
    /// for existing agent" flow).
    pub async fn create_session_in_runner(&self, runner_id: &RunnerId, engine_session_id: EngineSessionId, user_id: impl Into<String>) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().await;
        Self::insert_session(&mut state, runner_id, engine_session_id, user_id.into())
    }

    pub async fn remove_session_from_runner(&self, runner_id: &RunnerId, engine_session_id: &EngineSessionId) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().await;
        let runner = state
            .runners
            .get_mut(runner_id)
            .ok_or_else(|| RuntimeError::RunnerNotFound(runner_id.clone()))?;
        runner.sessions.remove(engine_session_id);
        runner.last_activity = Utc::now();
        state.session_to_runner.remove(engine_session_id);
        Ok(())
    }

    /// Deletes all sessions, drops all index entries, and cascades into
    /// the agent-cleanup callback.
    pub async fn cleanup_runner(&self, runner_id: &RunnerId) -> Result<(), RuntimeError> {
        let agent_id = {
            let mut state = self.state.lock().await;
            let runner = state
                .runners
                .remove(runner_id)
                .ok_or_else(|| RuntimeError::RunnerNotFound(runner_id.clone()))?;
            for session_id in runner.sessions.keys() {
                state.session_to_runner.remove(session_id);
            }
            if state.config_to_runner.get(&runner.config_hash) == Some(runner_id) {
                state.config_to_runner.remove(&runner.config_hash);
            }
            state.agent_to_runner.remove(&runner.agent_id);
            runner.agent_id
        };
        info!(%runner_id, %agent_id, "runner destroyed; cascading to agent cleanup");
        if let Some(callback) = self.cleanup.lock().await.as_ref() {
            callback.cleanup_agent(&agent_id).await;
        }
        Ok(())
    }

    pub async fn get_runner_session_count(&self, runner_id: &RunnerId) -> Option<usize> {
        let state = self.state.lock().await;
        state.runners.get(runner_id).map(Runner::session_count)
    }

    pub async fn runner_has_agent(&self, runner_id: &RunnerId, agent_id: &AgentId) -> bool {
        let state = self.state.lock().await;
        state.runners.get(runner_id).is_some_and(|r| &r.agent_id == agent_id)
    }

    pub async fn runner_for_session(&self, engine_session_id: &EngineSessionId) -> Option<RunnerId> {
        let state = self.state.lock().await;
        state.session_to_runner.get(engine_session_id).cloned()
    }

    pub async fn runner_for_agent(&self, agent_id: &AgentId) -> Option<RunnerId> {
        let state = self.state.lock().await;
        state.agent_to_runner.get(agent_id).cloned()
    }

    pub async fn session_exists(&self, runner_id: &RunnerId, engine_session_id: &EngineSessionId) -> bool {
        let state = self.state.lock().await;
        state.runners.get(runner_id).is_some_and(|r| r.sessions.contains_key(engine_session_id))
    }

    /// Extract the ordered history of an engine session — used by the
    /// coordinator on an agent switch.
    pub async fn extract_history(&self, runner_id: &RunnerId, engine_session_id: &EngineSessionId) -> Vec<HistoryEntry> {
        let state = self.state.lock().await;
        state
            .runners
            .get(runner_id)
            .and_then(|r| r.sessions.get(engine_session_id))
            .map(|s| s.history.clone())
            .unwrap_or_default()
    }

    /// Seed a freshly created engine session's history.
    pub async fn seed_history(&self, runner_id: &RunnerId, engine_session_id: &EngineSessionId, history: Vec<HistoryEntry>) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().await;
        let runner = state.runners.get_mut(runner_id).ok_or_else(|| RuntimeError::RunnerNotFound(runner_id.clone()))?;
        let session = runner
            .sessions
            .get_mut(engine_session_id)
            .ok_or_else(|| RuntimeError::SessionNotFound(crate::ids::ChatSessionId::from(engine_session_id.as_str())))?;
        session.seed_history(history);
        Ok(())
    }

    pub async fn agent_handle(&self, runner_id: &RunnerId) -> Option<Arc<dyn DomainAgentHandle>> {
        let state = self.state.lock().await;
        state.runners.get(runner_id).map(|r| r.agent.clone())
    }

    pub async fn touch_runner(&self, runner_id: &RunnerId) {
        let mut state = self.state.lock().await;
        if let Some(runner) = state.runners.get_mut(runner_id) {
            runner.last_activity = Utc::now();
        }
    }

    /// Used by the idle sweeper: runners past `runner_idle_timeout_seconds`
    /// with zero sessions.
    pub async fn idle_empty_runners(&self, idle_since: DateTime<Utc>) -> Vec<RunnerId> {
        let state = self.state.lock().await;
        state
            .runners
            .values()
            .filter(|r| r.last_activity < idle_since && r.session_count() == 0)
            .map(|r| r.runner_id.clone())
            .collect()
    }

    pub async fn runner_count(&self) -> usize {
        self.state.lock().await.runners.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sven_core::EchoAgentHandle;

    fn handle() -> Arc<dyn DomainAgentHandle> {
        Arc::new(EchoAgentHandle::default())
    }

    #[tokio::test]
    async fn reuse_returns_same_runner_under_capacity() {
        let mgr = RunnerManager::new("app");
        let hash = ConfigHash::new("0".repeat(16));
        let r1 = mgr
            .get_or_create_runner(&hash, &AgentId::from("a1"), handle(), None, true, 2)
            .await
            .unwrap();
        let r2 = mgr
            .get_or_create_runner(&hash, &AgentId::from("a1"), handle(), None, true, 2)
            .await
            .unwrap();
        assert_eq!(r1, r2);
    }

    #[tokio::test]
    async fn overflow_creates_distinct_runner() {
        let mgr = RunnerManager::new("app");
        let hash = ConfigHash::new("1".repeat(16));
        let r1 = mgr
            .get_or_create_runner(&hash, &AgentId::from("a1"), handle(), Some((EngineSessionId::from("s1"), "u".into())), true, 1)
            .await
            .unwrap();
        let r2 = mgr
            .get_or_create_runner(&hash, &AgentId::from("a2"), handle(), None, true, 1)
            .await
            .unwrap();
        assert_ne!(r1, r2);
    }

    #[tokio::test]
    async fn cleanup_runner_cascades_to_agent_callback() {
        struct Recorder(Mutex<Vec<AgentId>>);
        #[async_trait]
        impl AgentCleanupCallback for Recorder {
            async fn cleanup_agent(&self, agent_id: &AgentId) {
                self.0.lock().await.push(agent_id.clone());
            }
        }
        let mgr = RunnerManager::new("app");
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        mgr.set_cleanup_callback(recorder.clone()).await;
        let hash = ConfigHash::new("2".repeat(16));
        let runner_id = mgr
            .get_or_create_runner(&hash, &AgentId::from("a1"), handle(), None, false, 10)
            .await
            .unwrap();
        mgr.cleanup_runner(&runner_id).await.unwrap();
        assert_eq!(recorder.0.lock().await.as_slice(), &[AgentId::from("a1")]);
        assert_eq!(mgr.runner_count().await, 0);
    }

    #[tokio::test]
    async fn session_count_never_exceeds_max() {
        let mgr = RunnerManager::new("app");
        let hash = ConfigHash::new("3".repeat(16));
        let runner_id = mgr
            .get_or_create_runner(&hash, &AgentId::from("a1"), handle(), Some((EngineSessionId::from("s1"), "u".into())), true, 1)
            .await
            .unwrap();
        assert_eq!(mgr.get_runner_session_count(&runner_id).await, Some(1));
    }
}
