// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The canonical outbound streaming event.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::ids::{InteractionId, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChunkType {
    PlanDelta,
    PlanSummary,
    Progress,
    ToolProposal,
    ToolResult,
    Response,
    Complete,
    Error,
}

/// Payload of a [`StreamChunk`]. Most chunk types carry plain text; tool
/// proposals/results carry a structured object instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChunkContent {
    Text(String),
    Structured(Value),
}

impl From<String> for ChunkContent {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<Value> for ChunkContent {
    fn from(v: Value) -> Self {
        Self::Structured(v)
    }
}

/// A single event in the live output stream.
///
/// `sequence_id` is strictly monotonic and unique within one `task_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamChunk {
    pub task_id: TaskId,
    pub sequence_id: u64,
    pub chunk_type: ChunkType,
    /// Finer-grained tag, e.g. `"plan.delta"` / `"plan.summary"`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_kind: Option<String>,
    pub content: ChunkContent,
    pub is_final: bool,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interaction_id: Option<InteractionId>,
}

impl StreamChunk {
    pub fn new(
        task_id: TaskId,
        sequence_id: u64,
        chunk_type: ChunkType,
        content: impl Into<ChunkContent>,
        is_final: bool,
    ) -> Self {
        Self {
            task_id,
            sequence_id,
            chunk_type,
            chunk_kind: None,
            content: content.into(),
            is_final,
            metadata: BTreeMap::new(),
            interaction_id: None,
        }
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.chunk_kind = Some(kind.into());
        self
    }

    pub fn with_interaction_id(mut self, id: InteractionId) -> Self {
        self.interaction_id = Some(id);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Returns the `tool_name`/`arguments` pair embedded in a
    /// `TOOL_PROPOSAL`/`TOOL_RESULT` chunk's structured content, if present.
    pub fn tool_name(&self) -> Option<&str> {
        match &self.content {
            ChunkContent::Structured(v) => v.get("tool_name").and_then(Value::as_str),
            ChunkContent::Text(_) => None,
        }
    }
}

/// Monotonic per-task sequence counter. One per in-flight task.
#[derive(Debug, Default)]
pub struct SequenceCounter(std::sync::atomic::AtomicU64);

impl SequenceCounter {
    pub fn new() -> Self {
        Self(std::sync::atomic::AtomicU64::new(0))
    }

    /// Returns the next sequence id, starting at zero.
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_counter_is_strictly_increasing() {
        let counter = SequenceCounter::new();
        let a = counter.next();
        let b = counter.next();
        let c = counter.next();
        assert!(a < b && b < c);
    }

    #[test]
    fn tool_name_reads_structured_content() {
        let chunk = StreamChunk::new(
            TaskId::from("t1"),
            0,
            ChunkType::ToolProposal,
            serde_json::json!({"tool_name": "lookup", "arguments": {}}),
            false,
        );
        assert_eq!(chunk.tool_name(), Some("lookup"));
    }

    #[test]
    fn tool_name_is_none_for_text_content() {
        let chunk = StreamChunk::new(TaskId::from("t1"), 0, ChunkType::Response, "hi".to_string(), true);
        assert_eq!(chunk.tool_name(), None);
    }
}
