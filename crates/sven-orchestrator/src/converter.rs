// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! C1 — translates opaque [`SourceEvent`]s into the canonical [`StreamChunk`]
//! taxonomy. Grounded on
//! `framework/adk/adk_event_converter.py::convert_adk_event_to_chunk`.

use std::collections::{HashSet, BTreeMap};
use serde_json::{json, Value};
use tracing::warn;

use crate::chunk::{ChunkType, SequenceCounter, StreamChunk};
use crate::ids::{InteractionId, TaskId};
use crate::source_event::{SourceEvent, SourceEventKind};

/// Stateful per-task converter. Tracks which `interaction_id`s have already
/// had a `TOOL_PROPOSAL` emitted, so a `TOOL_RESULT` arriving without one can
/// synthesize it first.
pub struct EventConverter {
    task_id: TaskId,
    sequence: SequenceCounter,
    proposed: std::sync::Mutex<HashSet<InteractionId>>,
}

impl EventConverter {
    pub fn new(task_id: TaskId) -> Self {
        Self {
            task_id,
            sequence: SequenceCounter::new(),
            proposed: std::sync::Mutex::new(HashSet::new()),
        }
    }

    /// Convert one source event into zero or more chunks, in emission
    /// order. A conversion failure never aborts the stream: it is replaced
    /// by a single `ERROR` chunk.
    pub fn convert(&self, event: &SourceEvent) -> Vec<StreamChunk> {
        match self.convert_inner(event) {
            Ok(chunks) => chunks,
            Err(reason) => vec![self.error_chunk(format!("event conversion error: {reason}"))],
        }
    }

    fn convert_inner(&self, event: &SourceEvent) -> Result<Vec<StreamChunk>, String> {
        let merged = event.merged_metadata();
        let chunks = match &event.kind {
            SourceEventKind::Plan { text, is_final } => {
                let (chunk_type, kind) = if *is_final {
                    (ChunkType::PlanSummary, "plan.summary")
                } else {
                    (ChunkType::PlanDelta, "plan.delta")
                };
                vec![self.base_chunk(chunk_type, text.clone().into(), *is_final)
                    .with_kind(kind)
                    .with_metadata_map(merged)]
            }
            SourceEventKind::Text { text, partial } => {
                let is_final = !partial;
                let chunk = self
                    .base_chunk(ChunkType::Response, text.clone().into(), is_final)
                    .with_metadata_map(merged.clone());
                if *partial {
                    vec![
                        chunk,
                        self.base_chunk(ChunkType::Progress, text.clone().into(), false)
                            .with_metadata_map(merged),
                    ]
                } else {
                    vec![chunk]
                }
            }
            SourceEventKind::FunctionCall {
                id,
                tool_name,
                arguments,
                requires_approval,
            } => {
                let interaction_id = id
                    .clone()
                    .map(InteractionId::from)
                    .unwrap_or_else(|| InteractionId::generate("tool"));
                self.proposed.lock().unwrap().insert(interaction_id.clone());
                let mut metadata = merged;
                metadata.insert("stage".to_string(), json!("tool"));
                metadata.insert(
                    "requires_approval".to_string(),
                    json!(requires_approval.unwrap_or(true)),
                );
                let content = json!({
                    "tool_name": tool_name,
                    "arguments": arguments,
                    "id": id,
                });
                vec![self
                    .base_chunk(ChunkType::ToolProposal, content.into(), false)
                    .with_metadata_map(metadata)
                    .with_interaction_id(interaction_id)]
            }
            SourceEventKind::FunctionResponse {
                id,
                tool_name,
                output,
                is_error,
            } => {
                let interaction_id = id
                    .clone()
                    .map(InteractionId::from)
                    .unwrap_or_else(|| InteractionId::generate("tool"));
                let mut chunks = Vec::new();
                let already_proposed = self.proposed.lock().unwrap().contains(&interaction_id);
                if !already_proposed {
                    let mut metadata = BTreeMap::new();
                    metadata.insert("stage".to_string(), json!("tool"));
                    metadata.insert("synthesized".to_string(), json!(true));
                    let content = json!({
                        "tool_name": tool_name,
                        "arguments": Value::Null,
                    });
                    chunks.push(
                        self.base_chunk(ChunkType::ToolProposal, content.into(), false)
                            .with_metadata_map(metadata)
                            .with_interaction_id(interaction_id.clone()),
                    );
                    self.proposed.lock().unwrap().insert(interaction_id.clone());
                }
                let content = json!({ "output": output, "is_error": is_error });
                chunks.push(
                    self.base_chunk(ChunkType::ToolResult, content.into(), false)
                        .with_metadata_map(merged)
                        .with_interaction_id(interaction_id),
                );
                chunks
            }
            SourceEventKind::TurnComplete => {
                vec![self.base_chunk(ChunkType::Complete, "turn complete".to_string().into(), true)]
            }
            SourceEventKind::Error { code, message } => {
                let mut metadata = merged;
                metadata.insert("error_code".to_string(), json!(code));
                vec![self
                    .base_chunk(ChunkType::Error, message.clone().into(), true)
                    .with_metadata_map(metadata)]
            }
        }
    }

    fn base_chunk(&self, chunk_type: ChunkType, content: crate::chunk::ChunkContent, is_final: bool) -> StreamChunk {
        StreamChunk::new(self.task_id.clone(), self.sequence.next(), chunk_type, content, is_final)
    }

    fn error_chunk(&self, message: String) -> StreamChunk {
        warn!(task_id = %self.task_id, "event conversion failed, emitting error chunk");
        StreamChunk::new(
            self.task_id.clone(),
            self.sequence.next(),
            ChunkType::Error,
            message.into(),
            true,
        )
    }
}

trait WithMetadataMap {
    fn with_metadata_map(self, map: BTreeMap<String, Value>) -> Self;
}

impl WithMetadataMap for StreamChunk {
    fn with_metadata_map(mut self, map: BTreeMap<String, Value>) -> Self {
        self.metadata.extend(map);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn converter() -> EventConverter {
        EventConverter::new(TaskId::from("t1"))
    }

    #[test]
    fn plan_delta_then_summary() {
        let conv = converter();
        let delta = conv.convert(&SourceEvent::new(
            "agent",
            SourceEventKind::Plan { text: "step 1".into(), is_final: false },
        ));
        assert_eq!(delta.len(), 1);
        assert_eq!(delta[0].chunk_type, ChunkType::PlanDelta);
        assert_eq!(delta[0].chunk_kind.as_deref(), Some("plan.delta"));

        let summary = conv.convert(&SourceEvent::new(
            "agent",
            SourceEventKind::Plan { text: "full plan".into(), is_final: true },
        ));
        assert_eq!(summary[0].chunk_type, ChunkType::PlanSummary);
        assert!(summary[0].is_final);
    }

    #[test]
    fn custom_metadata_wins_on_conflict() {
        let conv = converter();
        let event = SourceEvent::new("agent", SourceEventKind::Text { text: "hi".into(), partial: false })
            .with_metadata("author", "base")
            .with_custom_metadata("author", "override");
        let chunks = conv.convert(&event);
        assert_eq!(chunks[0].metadata.get("author").unwrap(), "override");
    }

    #[test]
    fn partial_text_emits_response_and_progress() {
        let conv = converter();
        let chunks = conv.convert(&SourceEvent::new(
            "agent",
            SourceEventKind::Text { text: "partial".into(), partial: true },
        ));
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].chunk_type, ChunkType::Response);
        assert!(!chunks[0].is_final);
        assert_eq!(chunks[1].chunk_type, ChunkType::Progress);
    }

    #[test]
    fn final_text_emits_only_response() {
        let conv = converter();
        let chunks = conv.convert(&SourceEvent::new(
            "agent",
            SourceEventKind::Text { text: "done".into(), partial: false },
        ));
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].is_final);
    }

    #[test]
    fn function_call_emits_tool_proposal_with_interaction_id() {
        let conv = converter();
        let chunks = conv.convert(&SourceEvent::new(
            "agent",
            SourceEventKind::FunctionCall {
                id: Some("i1".into()),
                tool_name: "lookup".into(),
                arguments: json!({"x": 1}),
                requires_approval: Some(true),
            },
        ));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk_type, ChunkType::ToolProposal);
        assert_eq!(chunks[0].interaction_id, Some(InteractionId::from("i1")));
        assert_eq!(chunks[0].metadata.get("requires_approval").unwrap(), true);
    }

    #[test]
    fn tool_result_without_prior_proposal_synthesizes_one_first() {
        let conv = converter();
        let chunks = conv.convert(&SourceEvent::new(
            "agent",
            SourceEventKind::FunctionResponse {
                id: Some("i2".into()),
                tool_name: Some("lookup".into()),
                output: json!({"ok": true}),
                is_error: false,
            },
        ));
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].chunk_type, ChunkType::ToolProposal);
        assert_eq!(chunks[1].chunk_type, ChunkType::ToolResult);
        assert_eq!(chunks[0].interaction_id, chunks[1].interaction_id);
    }

    #[test]
    fn tool_result_with_prior_proposal_does_not_duplicate() {
        let conv = converter();
        conv.convert(&SourceEvent::new(
            "agent",
            SourceEventKind::FunctionCall {
                id: Some("i3".into()),
                tool_name: "lookup".into(),
                arguments: json!({}),
                requires_approval: Some(true),
            },
        ));
        let chunks = conv.convert(&SourceEvent::new(
            "agent",
            SourceEventKind::FunctionResponse {
                id: Some("i3".into()),
                tool_name: Some("lookup".into()),
                output: json!({"ok": true}),
                is_error: false,
            },
        ));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk_type, ChunkType::ToolResult);
    }

    #[test]
    fn turn_complete_is_final() {
        let conv = converter();
        let chunks = conv.convert(&SourceEvent::new("agent", SourceEventKind::TurnComplete));
        assert_eq!(chunks[0].chunk_type, ChunkType::Complete);
        assert!(chunks[0].is_final);
    }

    #[test]
    fn error_event_emits_error_chunk() {
        let conv = converter();
        let chunks = conv.convert(&SourceEvent::new(
            "agent",
            SourceEventKind::Error { code: "E1".into(), message: "boom".into() },
        ));
        assert_eq!(chunks[0].chunk_type, ChunkType::Error);
        assert!(chunks[0].is_final);
    }

    #[test]
    fn sequence_ids_are_monotonic_across_conversions() {
        let conv = converter();
        let a = conv.convert(&SourceEvent::new("agent", SourceEventKind::TurnComplete));
        let b = conv.convert(&SourceEvent::new("agent", SourceEventKind::TurnComplete));
        assert!(a[0].sequence_id < b[0].sequence_id);
    }
}
