// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The opaque event shape produced by the model-call generator.
//!
//! This is intentionally framework-agnostic: it restates the shape that
//! `adk_event_converter.py::convert_adk_event_to_chunk` pattern-matches on
//! (a content part that is either text, a function call, or a function
//! response; separate turn-complete and error signals; an optional plan
//! annotation) as a plain Rust enum, rather than depending on any concrete
//! model-provider crate. The generator that produces these events is out of
//! scope here — callers plug in whatever they have behind a channel of
//! `SourceEvent`.

use serde_json::Value;
use std::collections::BTreeMap;

/// A single event yielded by the (opaque) model-call generator for one task.
#[derive(Debug, Clone)]
pub struct SourceEvent {
    pub author: String,
    pub kind: SourceEventKind,
    /// Framework-native metadata; merged into the outgoing chunk's metadata.
    pub metadata: BTreeMap<String, Value>,
    /// Metadata carried on the event itself rather than its envelope; wins
    /// over `metadata` on key conflict.
    pub custom_metadata: BTreeMap<String, Value>,
}

impl SourceEvent {
    pub fn new(author: impl Into<String>, kind: SourceEventKind) -> Self {
        Self {
            author: author.into(),
            kind,
            metadata: BTreeMap::new(),
            custom_metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_custom_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.custom_metadata.insert(key.into(), value.into());
        self
    }

    /// `metadata` merged with `custom_metadata` taking priority on conflict.
    pub fn merged_metadata(&self) -> BTreeMap<String, Value> {
        let mut merged = self.metadata.clone();
        for (k, v) in &self.custom_metadata {
            merged.insert(k.clone(), v.clone());
        }
        merged
    }
}

#[derive(Debug, Clone)]
pub enum SourceEventKind {
    /// Incremental or final plan narration. `is_final=false` → PLAN_DELTA,
    /// `is_final=true` → PLAN_SUMMARY.
    Plan { text: String, is_final: bool },
    /// A streamed text fragment from the model. `partial=true` while the
    /// model is still producing the response.
    Text { text: String, partial: bool },
    /// The model requests a tool invocation.
    FunctionCall {
        id: Option<String>,
        tool_name: String,
        arguments: Value,
        requires_approval: Option<bool>,
    },
    /// A tool's result being fed back into the conversation.
    FunctionResponse {
        id: Option<String>,
        tool_name: Option<String>,
        output: Value,
        is_error: bool,
    },
    TurnComplete,
    Error { code: String, message: String },
}
