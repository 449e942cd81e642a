// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! C8 — Framework Adapter. Top-level entry point: dispatches "creation
//! mode" (new agent) vs "conversation mode" (continue), invokes C6 to
//! resolve context, and shapes results. Grounded on
//! `sven-node/agent_builder.rs`'s creation-vs-task builders and
//! `adk_adapter.py`'s mode dispatch.

use std::sync::Arc;

use async_trait::async_trait;
use sven_config::RuntimeConfig;
use sven_core::{DomainAgentHandle, HistoryEntry};
use tracing::{info, warn};

use crate::agent_registry::AgentRegistry;
use crate::coordinator::SessionCoordinator;
use crate::ids::{AgentId, ChatSessionId};
use crate::request::{Pattern, RequestTarget, TaskRequest, TaskResult};
use crate::runner_manager::RunnerManager;

/// Constructs the opaque model-call generator handle for a freshly minted
/// agent. The concrete model call stays external — callers supply this
/// factory (e.g. backed by `sven-model::from_config`).
#[async_trait]
pub trait AgentFactory: Send + Sync {
    async fn create(&self, config: &crate::config_hash::AgentConfig) -> anyhow::Result<Arc<dyn DomainAgentHandle>>;
}

pub struct FrameworkAdapter {
    registry: Arc<AgentRegistry>,
    runners: Arc<RunnerManager>,
    coordinator: Arc<SessionCoordinator>,
    config: RuntimeConfig,
    factory: Arc<dyn AgentFactory>,
}

impl FrameworkAdapter {
    pub fn new(
        registry: Arc<AgentRegistry>,
        runners: Arc<RunnerManager>,
        coordinator: Arc<SessionCoordinator>,
        config: RuntimeConfig,
        factory: Arc<dyn AgentFactory>,
    ) -> Self {
        Self { registry, runners, coordinator, config, factory }
    }

    pub async fn handle(&self, request: TaskRequest) -> TaskResult {
        let task_id = request.task_id.clone();
        let chat_session_id = request.chat_session_id.clone().unwrap_or_else(|| ChatSessionId::generate("chat"));

        match &request.target {
            None => TaskResult::error(task_id, chat_session_id, None, "REQUEST_VALIDATION", "missing agent_config or agent_id"),
            Some(RequestTarget::Creation { agent_config }) => self.handle_creation(task_id, chat_session_id, agent_config).await,
            Some(RequestTarget::Existing { agent_id }) => {
                if request.chat_session_id.is_none() {
                    return TaskResult::error(task_id, chat_session_id, Some(agent_id.clone()), "REQUEST_VALIDATION", "conversation mode requires chat_session_id");
                }
                self.handle_conversation(task_id, chat_session_id, agent_id.clone(), request).await
            }
        }
    }

    async fn handle_creation(&self, task_id: String, chat_session_id: ChatSessionId, agent_config: &crate::config_hash::AgentConfig) -> TaskResult {
        let config_hash = agent_config.config_hash();

        // Reuse selection: among candidates sharing this hash, pick the
        // first whose runner has spare capacity; lazily prune candidates
        // whose runner mapping has gone stale.
        let candidates = self.registry.candidates_for_hash(&config_hash).await;
        for candidate in candidates {
            let Some(runner_id) = self.runners.runner_for_agent(&candidate).await else {
                self.registry.prune_candidate(&config_hash, &candidate).await;
                continue;
            };
            let Some(count) = self.runners.get_runner_session_count(&runner_id).await else {
                self.registry.prune_candidate(&config_hash, &candidate).await;
                continue;
            };
            if count < self.config.max_sessions_per_agent {
                self.registry.touch(&candidate).await;
                info!(agent_id = %candidate, "reusing existing agent for config hash");
                return TaskResult::success(task_id, chat_session_id, candidate)
                    .with_metadata("framework", "sven")
                    .with_metadata("adk_session_initialized", false)
                    .with_metadata("pattern", pattern_str(Pattern::AgentCreation));
            }
        }

        let agent_id = self.registry.generate_id();
        let handle = match self.factory.create(agent_config).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!(error = %e, "agent factory failed");
                return TaskResult::error(task_id, chat_session_id, None, "FRAMEWORK_UNAVAILABLE", e.to_string());
            }
        };
        self.registry.register(agent_id.clone(), agent_config.clone(), handle.clone()).await;
        if let Err(e) = self
            .runners
            .get_or_create_runner(&config_hash, &agent_id, handle, None, true, self.config.max_sessions_per_agent)
            .await
        {
            return TaskResult::error(task_id, chat_session_id, Some(agent_id), "INTERNAL_ERROR", e.to_string());
        }

        info!(%agent_id, "created new agent+runner pair");
        TaskResult::success(task_id, chat_session_id, agent_id)
            .with_metadata("framework", "sven")
            .with_metadata("adk_session_initialized", false)
            .with_metadata("pattern", pattern_str(Pattern::AgentCreation))
    }

    async fn handle_conversation(&self, task_id: String, chat_session_id: ChatSessionId, agent_id: AgentId, request: TaskRequest) -> TaskResult {
        if !self.registry.exists(&agent_id).await {
            return TaskResult::error(task_id, chat_session_id, Some(agent_id), "AGENT_NOT_FOUND", "no such agent");
        }

        let result = self
            .coordinator
            .coordinate(chat_session_id.clone(), agent_id.clone(), request.user_context.user_id.clone(), self.config.max_sessions_per_agent)
            .await;
        let coordination = match result {
            Ok(c) => c,
            Err(e) => return TaskResult::error(task_id, chat_session_id, Some(agent_id), e.code(), e.to_string()),
        };

        let Some(handle) = self.runners.agent_handle(&coordination.runner_id).await else {
            return TaskResult::error(task_id, chat_session_id, Some(agent_id), "RUNNER_NOT_FOUND", "runner vanished mid-request");
        };

        let input = request
            .messages
            .last()
            .and_then(|m| m.content.clone())
            .map(|text| HistoryEntry::text("user", text))
            .unwrap_or_else(|| HistoryEntry::text("user", ""));

        let reply = {
            // Engine sessions live inside the runner (C4 owns all mutation);
            // round-trip through a scratch copy bound to the same id.
            let mut scratch = sven_core::EngineSession::new(coordination.engine_session_id.as_str(), request.user_context.user_id.clone());
            scratch.seed_history(self.runners.extract_history(&coordination.runner_id, &coordination.engine_session_id).await);
            match handle.respond(&mut scratch, input).await {
                Ok(reply) => {
                    if let Err(e) = self.runners.seed_history(&coordination.runner_id, &coordination.engine_session_id, scratch.history).await {
                        warn!(error = %e, "failed to persist engine session history");
                    }
                    reply
                }
                Err(e) => return TaskResult::error(task_id, chat_session_id, Some(agent_id), "INTERNAL_ERROR", e.to_string()),
            }
        };

        self.registry.touch(&agent_id).await;
        self.runners.touch_runner(&coordination.runner_id).await;

        let reply_text = reply
            .parts
            .iter()
            .filter_map(|p| match p {
                sven_core::ContentPart::Text(t) => Some(t.clone()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("");

        let mut result = TaskResult::success(task_id, chat_session_id.clone(), agent_id)
            .with_metadata("framework", "sven")
            .with_metadata("chat_session_id", chat_session_id.as_str())
            .with_metadata("adk_session_id", coordination.engine_session_id.as_str())
            .with_metadata("pattern", pattern_str(Pattern::Conversation))
            .with_metadata("execution_id", task_id_placeholder())
            .with_metadata("switch_occurred", coordination.switch_occurred);
        result.messages.push(crate::request::ReplyMessage { role: "assistant".to_string(), content: reply_text });
        result
    }
}

fn pattern_str(pattern: Pattern) -> &'static str {
    match pattern {
        Pattern::AgentCreation => "agent_creation",
        Pattern::Conversation => "conversation",
    }
}

/// A distinct per-turn execution id for the result metadata; a fresh
/// opaque id is grounded on the same `uuid::Uuid` convention used
/// throughout `sven-node/control/protocol.rs`.
fn task_id_placeholder() -> String {
    format!("exec_{}", uuid::Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_hash::AgentConfig;
    use crate::request::{InboundMessage, UserContext};
    use sven_core::EchoAgentHandle;

    struct EchoFactory;

    #[async_trait]
    impl AgentFactory for EchoFactory {
        async fn create(&self, _config: &AgentConfig) -> anyhow::Result<Arc<dyn DomainAgentHandle>> {
            Ok(Arc::new(EchoAgentHandle { prefix: "echo: ".into() }))
        }
    }

    fn adapter(max_sessions_per_agent: usize) -> FrameworkAdapter {
        let registry = Arc::new(AgentRegistry::new());
        let runners = Arc::new(RunnerManager::new("app"));
        let coordinator = Arc::new(SessionCoordinator::new(registry.clone(), runners.clone(), "session"));
        let mut config = RuntimeConfig::default();
        config.max_sessions_per_agent = max_sessions_per_agent;
        FrameworkAdapter::new(registry, runners, coordinator, config, Arc::new(EchoFactory))
    }

    fn cfg() -> AgentConfig {
        AgentConfig {
            agent_type: "asst".into(),
            system_prompt: "P".into(),
            model_config: serde_json::json!({"model": "m1"}),
            available_tools: vec![],
            framework_config: serde_json::Value::Null,
        }
    }

    fn user_context() -> UserContext {
        UserContext { user_id: "u1".into(), extra: Default::default() }
    }

    #[tokio::test]
    async fn creation_then_conversation() {
        let adapter = adapter(100);
        let creation = TaskRequest {
            task_id: "t1".into(),
            task_type: None,
            description: None,
            target: Some(RequestTarget::Creation { agent_config: cfg() }),
            chat_session_id: Some(ChatSessionId::from("C1")),
            messages: vec![],
            user_context: user_context(),
            execution_context: None,
        };
        let result = adapter.handle(creation).await;
        assert_eq!(result.status, crate::request::TaskStatus::Success);
        assert_eq!(result.session_id, ChatSessionId::from("C1"));
        assert_eq!(result.metadata.get("adk_session_initialized").unwrap(), false);
        let agent_id = result.agent_id.unwrap();

        let conversation = TaskRequest {
            task_id: "t2".into(),
            task_type: None,
            description: None,
            target: Some(RequestTarget::Existing { agent_id: agent_id.clone() }),
            chat_session_id: Some(ChatSessionId::from("C1")),
            messages: vec![InboundMessage { role: "user".into(), content: Some("hi".into()), content_parts: vec![] }],
            user_context: user_context(),
            execution_context: None,
        };
        let result = adapter.handle(conversation).await;
        assert_eq!(result.status, crate::request::TaskStatus::Success);
        assert_eq!(result.session_id, ChatSessionId::from("C1"));
        assert_eq!(result.metadata.get("pattern").unwrap(), "conversation");
        assert_eq!(result.messages[0].content, "echo: hi");
    }

    #[tokio::test]
    async fn config_reuse_then_overflow() {
        let adapter = adapter(1);
        let make_request = |task_id: &str| TaskRequest {
            task_id: task_id.into(),
            task_type: None,
            description: None,
            target: Some(RequestTarget::Creation { agent_config: cfg() }),
            chat_session_id: Some(ChatSessionId::from(task_id)),
            messages: vec![],
            user_context: user_context(),
            execution_context: None,
        };
        let r1 = adapter.handle(make_request("t1")).await;
        let r2 = adapter.handle(make_request("t2")).await;
        assert_eq!(r1.agent_id, r2.agent_id);

        // Occupy the one slot so a third creation request must mint a
        // fresh agent+runner pair.
        let agent_id = r1.agent_id.clone().unwrap();
        let conv = TaskRequest {
            task_id: "conv".into(),
            task_type: None,
            description: None,
            target: Some(RequestTarget::Existing { agent_id }),
            chat_session_id: Some(ChatSessionId::from("conv-chat")),
            messages: vec![],
            user_context: user_context(),
            execution_context: None,
        };
        adapter.handle(conv).await;

        let r3 = adapter.handle(make_request("t3")).await;
        assert_ne!(r1.agent_id, r3.agent_id);
    }

    #[tokio::test]
    async fn invalid_request_is_rejected() {
        let adapter = adapter(100);
        let request = TaskRequest {
            task_id: "t1".into(),
            task_type: None,
            description: None,
            target: None,
            chat_session_id: None,
            messages: vec![],
            user_context: user_context(),
            execution_context: None,
        };
        let result = adapter.handle(request).await;
        assert_eq!(result.status, crate::request::TaskStatus::Error);
        assert_eq!(result.error.unwrap().code, "REQUEST_VALIDATION");
    }
}
