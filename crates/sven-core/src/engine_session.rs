// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The engine session: a per-agent-activation store living inside a
//! runner. Distinct from [`crate::Session`] (the CLI's own conversation
//! buffer with token accounting) — this is the lighter-weight record the
//! orchestrator's runner manager creates and destroys per chat/agent
//! activation, and seeds from a chat session's history on an agent switch.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One multimodal part of a conversation turn. Supplemented from
/// `original_source/.../contracts/__init__.py` and
/// `adk_event_converter.py::convert_universal_message_to_adk`, which carry
/// image references and tool-call/tool-result bookkeeping alongside plain
/// text — a bare `String` would lose that on an agent switch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ContentPart {
    Text(String),
    /// Opaque image reference (e.g. a data URL). Not decoded here.
    ImageRef(String),
    ToolCall {
        id: String,
        tool_name: String,
        arguments: serde_json::Value,
    },
    ToolResult {
        id: String,
        output: serde_json::Value,
        is_error: bool,
    },
}

/// One turn in an engine session's history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryEntry {
    pub role: String,
    pub parts: Vec<ContentPart>,
}

impl HistoryEntry {
    pub fn text(role: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            parts: vec![ContentPart::Text(text.into())],
        }
    }
}

/// An engine session living inside a runner.
///
/// Created lazily: agent-creation mode does not create one; the first
/// conversation turn does.
#[derive(Debug, Clone)]
pub struct EngineSession {
    pub id: String,
    pub user_id: String,
    pub history: Vec<HistoryEntry>,
}

impl EngineSession {
    pub fn new(id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            user_id: user_id.into(),
            history: Vec::new(),
        }
    }

    /// Seed this (presumably fresh) session with history extracted from a
    /// previous engine session during an agent switch.
    pub fn seed_history(&mut self, history: Vec<HistoryEntry>) {
        self.history = history;
    }

    pub fn push(&mut self, entry: HistoryEntry) {
        self.history.push(entry);
    }
}

/// The opaque model-call generator factory bound to a domain agent.
///
/// Stands in for the real ADK/provider call: given a session and new
/// input, it yields conversation turns. The runtime's runner/coordinator
/// layers only ever see this trait object — never a concrete model
/// provider — the language-model call itself stays an external
/// collaborator.
#[async_trait]
pub trait DomainAgentHandle: Send + Sync {
    /// Append `input` to `session` and return the assistant's reply turn.
    /// Implementations may also append the reply to `session.history`.
    async fn respond(&self, session: &mut EngineSession, input: HistoryEntry) -> anyhow::Result<HistoryEntry>;
}

/// A deterministic test double for [`DomainAgentHandle`]: echoes the last
/// user text back with a fixed prefix. Used by the orchestrator's own
/// tests and by any caller wiring up an agent without a real model.
#[derive(Debug, Default)]
pub struct EchoAgentHandle {
    pub prefix: String,
}

#[async_trait]
impl DomainAgentHandle for EchoAgentHandle {
    async fn respond(&self, session: &mut EngineSession, input: HistoryEntry) -> anyhow::Result<HistoryEntry> {
        session.push(input.clone());
        let text = input
            .parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::Text(t) => Some(t.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join(" ");
        let reply = HistoryEntry::text("assistant", format!("{}{}", self.prefix, text));
        session.push(reply.clone());
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echo_handle_appends_both_turns_to_history() {
        let handle = EchoAgentHandle { prefix: "echo: ".into() };
        let mut session = EngineSession::new("s1", "u1");
        let reply = handle
            .respond(&mut session, HistoryEntry::text("user", "hi"))
            .await
            .unwrap();
        assert_eq!(reply, HistoryEntry::text("assistant", "echo: hi"));
        assert_eq!(session.history.len(), 2);
    }

    #[test]
    fn seed_history_replaces_existing_turns() {
        let mut session = EngineSession::new("s1", "u1");
        session.push(HistoryEntry::text("user", "stale"));
        session.seed_history(vec![HistoryEntry::text("user", "m1"), HistoryEntry::text("assistant", "m2")]);
        assert_eq!(session.history.len(), 2);
        assert_eq!(session.history[0].parts[0], ContentPart::Text("m1".into()));
    }
}
