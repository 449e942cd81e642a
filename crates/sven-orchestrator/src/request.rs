// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The inbound task request and outbound (non-live) task result the
//! framework adapter speaks.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config_hash::AgentConfig;
use crate::ids::{AgentId, ChatSessionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Sync,
    Streaming,
    Live,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub execution_mode: Option<ExecutionMode>,
    pub timeout_seconds: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentPart {
    #[serde(flatten)]
    pub kind: ContentPartKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPartKind {
    Text { text: String },
    ImageReference { reference: String },
    FunctionCall { id: Option<String>, tool_name: String, arguments: Value },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub role: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub content_parts: Vec<ContentPart>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserContext {
    pub user_id: String,
    #[serde(default)]
    pub extra: BTreeMap<String, Value>,
}

/// One of the two mutually-exclusive ways to address a request: creation
/// mode (mint a new agent) or conversation mode (continue one). The
/// caller's `chat_session_id` rides alongside either mode: a creation-mode
/// request already names the business chat id it will be echoed back under.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestTarget {
    Creation { agent_config: AgentConfig },
    Existing { agent_id: AgentId },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    pub task_id: String,
    #[serde(default)]
    pub task_type: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub target: Option<RequestTarget>,
    #[serde(default)]
    pub chat_session_id: Option<ChatSessionId>,
    #[serde(default)]
    pub messages: Vec<InboundMessage>,
    pub user_context: UserContext,
    #[serde(default)]
    pub execution_context: Option<ExecutionContext>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskError {
    pub code: String,
    pub details: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyMessage {
    pub role: String,
    pub content: String,
}

/// `pattern` distinguishes the two dispatch shapes in metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pattern {
    AgentCreation,
    Conversation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub status: TaskStatus,
    /// MUST equal the caller's business `chat_session_id` — never the
    /// internal engine session id.
    pub session_id: ChatSessionId,
    pub agent_id: Option<AgentId>,
    #[serde(default)]
    pub messages: Vec<ReplyMessage>,
    pub metadata: BTreeMap<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
}

impl TaskResult {
    pub fn success(task_id: impl Into<String>, session_id: ChatSessionId, agent_id: AgentId) -> Self {
        Self {
            task_id: task_id.into(),
            status: TaskStatus::Success,
            session_id,
            agent_id: Some(agent_id),
            messages: Vec::new(),
            metadata: BTreeMap::new(),
            error_message: None,
            error: None,
        }
    }

    pub fn error(task_id: impl Into<String>, session_id: ChatSessionId, agent_id: Option<AgentId>, code: &str, details: impl Into<String>) -> Self {
        let details = details.into();
        Self {
            task_id: task_id.into(),
            status: TaskStatus::Error,
            session_id,
            agent_id,
            messages: Vec::new(),
            metadata: BTreeMap::new(),
            error_message: Some(details.clone()),
            error: Some(TaskError { code: code.to_string(), details }),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}
