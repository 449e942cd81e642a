// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! C6 — Session Coordinator. Owns business chat sessions, resolves each
//! incoming request to an (agent, runner, engine-session) triple, and
//! performs agent switches with history migration.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{info, warn};

use sven_core::HistoryEntry;

use crate::agent_registry::AgentRegistry;
use crate::error::RuntimeError;
use crate::ids::{AgentId, ChatSessionId, EngineSessionId, RunnerId};
use crate::runner_manager::RunnerManager;

/// A business/caller-facing conversation identity, stable across agent
/// switches.
#[derive(Debug, Clone)]
pub struct ChatSession {
    pub chat_session_id: ChatSessionId,
    pub user_id: String,
    pub active_agent_id: Option<AgentId>,
    pub active_engine_session_id: Option<EngineSessionId>,
    pub active_runner_id: Option<RunnerId>,
    pub history: Vec<HistoryEntry>,
    pub last_activity: DateTime<Utc>,
    pub last_switch_at: Option<DateTime<Utc>>,
}

impl ChatSession {
    fn new(chat_session_id: ChatSessionId, user_id: String) -> Self {
        Self {
            chat_session_id,
            user_id,
            active_agent_id: None,
            active_engine_session_id: None,
            active_runner_id: None,
            history: Vec::new(),
            last_activity: Utc::now(),
            last_switch_at: None,
        }
    }
}

/// Records why a chat session was evicted, blocking silent reuse until
/// `recover()` is called.
#[derive(Debug, Clone)]
pub struct Tombstone {
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// Outcome of resolving an incoming conversation request.
#[derive(Debug, Clone)]
pub struct CoordinationResult {
    pub engine_session_id: EngineSessionId,
    pub runner_id: RunnerId,
    pub switch_occurred: bool,
    pub previous_agent_id: Option<AgentId>,
    pub new_agent_id: AgentId,
}

pub struct SessionCoordinator {
    chats: Mutex<HashMap<ChatSessionId, ChatSession>>,
    tombstones: Mutex<HashMap<ChatSessionId, Tombstone>>,
    chat_locks: Mutex<HashMap<ChatSessionId, Arc<Mutex<()>>>>,
    registry: Arc<AgentRegistry>,
    runners: Arc<RunnerManager>,
    session_id_prefix: String,
}

impl SessionCoordinator {
    pub fn new(registry: Arc<AgentRegistry>, runners: Arc<RunnerManager>, session_id_prefix: impl Into<String>) -> Self {
        Self {
            chats: Mutex::new(HashMap::new()),
            tombstones: Mutex::new(HashMap::new()),
            chat_locks: Mutex::new(HashMap::new()),
            registry,
            runners,
            session_id_prefix: session_id_prefix.into(),
        }
    }

    async fn chat_lock(&self, chat_session_id: &ChatSessionId) -> Arc<Mutex<()>> {
        let mut locks = self.chat_locks.lock().await;
        locks.entry(chat_session_id.clone()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    /// Resolve `chat_session_id` + `target_agent_id` to an engine session,
    /// creating or switching as needed. Serialized per chat.
    ///
    /// `max_sessions_per_agent` mirrors the signature the adapter uses for
    /// creation-mode reuse selection; here the target agent is already
    /// fixed by the caller, so there is no alternate runner to fall back
    /// to and the cap is not enforced (see DESIGN.md).
    pub async fn coordinate(
        &self,
        chat_session_id: ChatSessionId,
        target_agent_id: AgentId,
        user_id: impl Into<String>,
        _max_sessions_per_agent: usize,
    ) -> Result<CoordinationResult, RuntimeError> {
        let lock = self.chat_lock(&chat_session_id).await;
        let _guard = lock.lock().await;

        if let Some(tombstone) = self.tombstones.lock().await.get(&chat_session_id).cloned() {
            return Err(RuntimeError::SessionCleared {
                chat_session_id,
                reason: tombstone.reason,
            });
        }

        if !self.registry.exists(&target_agent_id).await {
            return Err(RuntimeError::AgentNotFound(target_agent_id));
        }

        let user_id = user_id.into();
        let mut chat = {
            let mut chats = self.chats.lock().await;
            chats
                .entry(chat_session_id.clone())
                .or_insert_with(|| ChatSession::new(chat_session_id.clone(), user_id.clone()))
                .clone()
        };
        // The per-chat lock held above already serializes every caller of
        // `coordinate` for this chat, so mutating a local clone and
        // writing it back at the end never races another `coordinate`
        // call. Releasing the global `chats` map lock here (rather than
        // holding it across the awaits below) lets unrelated chats
        // proceed in parallel.
        chat.last_activity = Utc::now();

        let result = match chat.active_agent_id.clone() {
            // Case A — first reference to this chat with a specific target agent.
            None => {
                let runner_id = self
                    .runners
                    .runner_for_agent(&target_agent_id)
                    .await
                    .ok_or_else(|| RuntimeError::RunnerNotFound(RunnerId::from(target_agent_id.as_str())))?;
                let engine_session_id = EngineSessionId::generate(&self.session_id_prefix);
                self.runners.create_session_in_runner(&runner_id, engine_session_id.clone(), user_id).await?;
                chat.active_agent_id = Some(target_agent_id.clone());
                chat.active_engine_session_id = Some(engine_session_id.clone());
                chat.active_runner_id = Some(runner_id.clone());
                info!(%chat_session_id, %target_agent_id, "chat session bound to agent (Case A)");
                Ok(CoordinationResult {
                    engine_session_id,
                    runner_id,
                    switch_occurred: false,
                    previous_agent_id: None,
                    new_agent_id: target_agent_id,
                })
            }
            Some(active_agent_id) if active_agent_id == target_agent_id => {
                // Case B — same active agent; return the existing session.
                let engine_session_id = chat
                    .active_engine_session_id
                    .clone()
                    .ok_or_else(|| RuntimeError::SessionNotFound(chat_session_id.clone()))?;
                let runner_id = chat
                    .active_runner_id
                    .clone()
                    .ok_or_else(|| RuntimeError::RunnerNotFound(RunnerId::from("")))?;
                Ok(CoordinationResult {
                    engine_session_id,
                    runner_id,
                    switch_occurred: false,
                    previous_agent_id: None,
                    new_agent_id: target_agent_id,
                })
            }
            Some(previous_agent_id) => {
                // Case C — agent switch.
                let previous_agent_id = previous_agent_id.clone();
                let previous_runner_id = chat.active_runner_id.clone();
                let previous_engine_session_id = chat.active_engine_session_id.clone();

                let history = if let (Some(runner_id), Some(session_id)) = (&previous_runner_id, &previous_engine_session_id) {
                    self.runners.extract_history(runner_id, session_id).await
                } else {
                    warn!(%chat_session_id, "agent switch with no prior engine session; continuing with empty history");
                    Vec::new()
                };

                if let (Some(runner_id), Some(session_id)) = (&previous_runner_id, &previous_engine_session_id) {
                    self.runners.remove_session_from_runner(runner_id, session_id).await?;
                }

                let new_runner_id = self
                    .runners
                    .runner_for_agent(&target_agent_id)
                    .await
                    .ok_or_else(|| RuntimeError::RunnerNotFound(RunnerId::from(target_agent_id.as_str())))?;
                let new_engine_session_id = EngineSessionId::generate(&self.session_id_prefix);
                self.runners
                    .create_session_in_runner(&new_runner_id, new_engine_session_id.clone(), user_id)
                    .await?;
                self.runners.seed_history(&new_runner_id, &new_engine_session_id, history.clone()).await?;

                chat.active_agent_id = Some(target_agent_id.clone());
                chat.active_engine_session_id = Some(new_engine_session_id.clone());
                chat.active_runner_id = Some(new_runner_id.clone());
                chat.history = history;
                chat.last_switch_at = Some(Utc::now());

                info!(%chat_session_id, %previous_agent_id, %target_agent_id, "agent switch with history migration (Case C)");
                Ok(CoordinationResult {
                    engine_session_id: new_engine_session_id,
                    runner_id: new_runner_id,
                    switch_occurred: true,
                    previous_agent_id: Some(previous_agent_id),
                    new_agent_id: target_agent_id,
                })
            }
        };

        self.chats.lock().await.insert(chat_session_id, chat);
        result
    }

    /// Tombstones `chat_session_id`, removing it from the active map. Used
    /// both by explicit cleanup and by the idle sweeper.
    pub async fn evict(&self, chat_session_id: &ChatSessionId, reason: impl Into<String>) -> Option<ChatSession> {
        let lock = self.chat_lock(chat_session_id).await;
        let _guard = lock.lock().await;
        let removed = self.chats.lock().await.remove(chat_session_id);
        self.tombstones.lock().await.insert(
            chat_session_id.clone(),
            Tombstone { reason: reason.into(), at: Utc::now() },
        );
        removed
    }

    /// Evicts `chat_session_id` only if it is still idle once the
    /// per-chat lock is held — guards against the idle sweeper racing a
    /// concurrent request that just bumped `last_activity`.
    pub async fn evict_if_idle(&self, chat_session_id: &ChatSessionId, idle_since: DateTime<Utc>, reason: impl Into<String>) -> Option<ChatSession> {
        let lock = self.chat_lock(chat_session_id).await;
        let _guard = lock.lock().await;
        let still_idle = self
            .chats
            .lock()
            .await
            .get(chat_session_id)
            .is_some_and(|c| c.last_activity < idle_since);
        if !still_idle {
            return None;
        }
        let removed = self.chats.lock().await.remove(chat_session_id);
        self.tombstones.lock().await.insert(
            chat_session_id.clone(),
            Tombstone { reason: reason.into(), at: Utc::now() },
        );
        removed
    }

    /// Removes the tombstone so the next request creates a fresh chat
    /// session.
    pub async fn recover(&self, chat_session_id: &ChatSessionId) {
        self.tombstones.lock().await.remove(chat_session_id);
    }

    pub async fn is_cleared(&self, chat_session_id: &ChatSessionId) -> Option<Tombstone> {
        self.tombstones.lock().await.get(chat_session_id).cloned()
    }

    pub async fn snapshot(&self, chat_session_id: &ChatSessionId) -> Option<ChatSession> {
        self.chats.lock().await.get(chat_session_id).cloned()
    }

    /// Used by the idle sweeper: chats past `session_idle_timeout_seconds`.
    pub async fn idle_chats(&self, idle_since: DateTime<Utc>) -> Vec<ChatSessionId> {
        let chats = self.chats.lock().await;
        chats
            .values()
            .filter(|c| c.last_activity < idle_since)
            .map(|c| c.chat_session_id.clone())
            .collect()
    }

    pub async fn touch(&self, chat_session_id: &ChatSessionId) {
        if let Some(chat) = self.chats.lock().await.get_mut(chat_session_id) {
            chat.last_activity = Utc::now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_hash::AgentConfig;
    use sven_core::EchoAgentHandle;

    async fn setup() -> (Arc<AgentRegistry>, Arc<RunnerManager>, SessionCoordinator, AgentId) {
        let registry = Arc::new(AgentRegistry::new());
        let runners = Arc::new(RunnerManager::new("app"));
        let coordinator = SessionCoordinator::new(registry.clone(), runners.clone(), "session");

        let agent_id = registry.generate_id();
        let cfg = AgentConfig {
            agent_type: "asst".into(),
            system_prompt: "P".into(),
            model_config: serde_json::json!({"model": "m1"}),
            available_tools: vec![],
            framework_config: serde_json::Value::Null,
        };
        let hash = cfg.config_hash();
        registry.register(agent_id.clone(), cfg, Arc::new(EchoAgentHandle::default())).await;
        runners
            .get_or_create_runner(&hash, &agent_id, Arc::new(EchoAgentHandle::default()), None, true, 100)
            .await
            .unwrap();
        (registry, runners, coordinator, agent_id)
    }

    #[tokio::test]
    async fn first_reference_creates_session() {
        let (_, _, coordinator, agent_id) = setup().await;
        let chat_id = ChatSessionId::from("c1");
        let result = coordinator.coordinate(chat_id.clone(), agent_id.clone(), "u1", 100).await.unwrap();
        assert!(!result.switch_occurred);
        assert_eq!(result.new_agent_id, agent_id);
    }

    #[tokio::test]
    async fn same_agent_returns_same_session() {
        let (_, _, coordinator, agent_id) = setup().await;
        let chat_id = ChatSessionId::from("c1");
        let r1 = coordinator.coordinate(chat_id.clone(), agent_id.clone(), "u1", 100).await.unwrap();
        let r2 = coordinator.coordinate(chat_id.clone(), agent_id.clone(), "u1", 100).await.unwrap();
        assert_eq!(r1.engine_session_id, r2.engine_session_id);
        assert!(!r2.switch_occurred);
    }

    #[tokio::test]
    async fn switch_to_new_agent_migrates_history() {
        let (registry, runners, coordinator, agent_id) = setup().await;
        let chat_id = ChatSessionId::from("c1");
        let r1 = coordinator.coordinate(chat_id.clone(), agent_id.clone(), "u1", 100).await.unwrap();
        runners
            .seed_history(&r1.runner_id, &r1.engine_session_id, vec![HistoryEntry::text("user", "hello")])
            .await
            .unwrap();

        let agent2 = registry.generate_id();
        let cfg2 = AgentConfig {
            agent_type: "asst".into(),
            system_prompt: "Q".into(),
            model_config: serde_json::json!({"model": "m2"}),
            available_tools: vec![],
            framework_config: serde_json::Value::Null,
        };
        let hash2 = cfg2.config_hash();
        registry.register(agent2.clone(), cfg2, Arc::new(EchoAgentHandle::default())).await;
        runners
            .get_or_create_runner(&hash2, &agent2, Arc::new(EchoAgentHandle::default()), None, true, 100)
            .await
            .unwrap();

        let r2 = coordinator.coordinate(chat_id.clone(), agent2.clone(), "u1", 100).await.unwrap();
        assert!(r2.switch_occurred);
        assert_eq!(r2.previous_agent_id, Some(agent_id));
        let seeded = runners.extract_history(&r2.runner_id, &r2.engine_session_id).await;
        assert_eq!(seeded, vec![HistoryEntry::text("user", "hello")]);
    }

    #[tokio::test]
    async fn cleared_session_rejects_until_recovered() {
        let (_, _, coordinator, agent_id) = setup().await;
        let chat_id = ChatSessionId::from("c1");
        coordinator.coordinate(chat_id.clone(), agent_id.clone(), "u1", 100).await.unwrap();
        coordinator.evict(&chat_id, "session_idle_timeout").await;

        let err = coordinator.coordinate(chat_id.clone(), agent_id.clone(), "u1", 100).await.unwrap_err();
        assert!(matches!(err, RuntimeError::SessionCleared { .. }));

        coordinator.recover(&chat_id).await;
        assert!(coordinator.coordinate(chat_id.clone(), agent_id.clone(), "u1", 100).await.is_ok());
    }
}
