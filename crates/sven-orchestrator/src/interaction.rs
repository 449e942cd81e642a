// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The user's (or the broker's synthesized) decision on a pending tool
//! proposal.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::InteractionId;

/// Who produced an [`InteractionResponse`] / resolved a [`crate::broker::PendingApproval`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionSource {
    /// The user explicitly approved/denied via the stream session façade.
    User,
    /// The timeout fallback policy fired.
    Timeout,
    /// A `TOOL_RESULT` arrived before any user decision — implicit approval.
    ToolResult,
}

/// A decision on a pending tool proposal, submitted by the caller via
/// [`crate::communicator::LiveCommunicator::send_user_response`] or
/// synthesized by the broker on timeout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InteractionResponse {
    pub interaction_id: InteractionId,
    #[serde(default = "default_interaction_type")]
    pub interaction_type: String,
    pub approved: bool,
    #[serde(default)]
    pub user_message: Option<String>,
    #[serde(default)]
    pub response_data: Option<Value>,
    /// Present on synthesized responses so downstream observers can tell
    /// an automatic fallback from a real user decision.
    #[serde(default)]
    pub auto_timeout: bool,
}

fn default_interaction_type() -> String {
    "tool_approval".to_string()
}

impl InteractionResponse {
    pub fn approve(interaction_id: InteractionId) -> Self {
        Self {
            interaction_id,
            interaction_type: default_interaction_type(),
            approved: true,
            user_message: None,
            response_data: None,
            auto_timeout: false,
        }
    }

    pub fn deny(interaction_id: InteractionId) -> Self {
        Self {
            interaction_id,
            interaction_type: default_interaction_type(),
            approved: false,
            user_message: None,
            response_data: None,
            auto_timeout: false,
        }
    }

    pub fn synthesize(interaction_id: InteractionId, approved: bool) -> Self {
        Self {
            auto_timeout: true,
            ..if approved { Self::approve(interaction_id) } else { Self::deny(interaction_id) }
        }
    }
}

/// The outcome `wait_for_tool_approval` hands back to a tool executor.
#[derive(Debug, Clone, PartialEq)]
pub struct ApprovalOutcome {
    pub approved: bool,
    pub interaction_id: Option<InteractionId>,
    pub error: Option<String>,
}

impl ApprovalOutcome {
    pub fn approved(interaction_id: Option<InteractionId>) -> Self {
        Self { approved: true, interaction_id, error: None }
    }

    pub fn denied(interaction_id: Option<InteractionId>) -> Self {
        Self { approved: false, interaction_id, error: None }
    }
}
