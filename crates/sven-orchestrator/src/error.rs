// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The error taxonomy surfaced to callers via `TaskResult.error.code`.

use crate::ids::{AgentId, ChatSessionId, RunnerId};

/// Errors returned in-band (never by panicking) from the coordinator,
/// runner manager, agent registry, and adapter.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("request validation failed: {0}")]
    RequestValidation(String),

    #[error("framework is not available: {0}")]
    FrameworkUnavailable(String),

    #[error("chat session {chat_session_id} was cleared: {reason}")]
    SessionCleared {
        chat_session_id: ChatSessionId,
        reason: String,
    },

    #[error("agent {0} not found")]
    AgentNotFound(AgentId),

    #[error("runner {0} not found")]
    RunnerNotFound(RunnerId),

    #[error("engine session not found for chat {0}")]
    SessionNotFound(ChatSessionId),

    #[error("approval timed out for interaction {0}")]
    ApprovalTimeout(String),

    #[error("stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl RuntimeError {
    /// The wire-stable error code, per the taxonomy enumerated in the
    /// external interfaces section of the specification.
    pub fn code(&self) -> &'static str {
        match self {
            Self::RequestValidation(_) => "REQUEST_VALIDATION",
            Self::FrameworkUnavailable(_) => "FRAMEWORK_UNAVAILABLE",
            Self::SessionCleared { .. } => "SESSION_CLEARED",
            Self::AgentNotFound(_) => "AGENT_NOT_FOUND",
            Self::RunnerNotFound(_) => "RUNNER_NOT_FOUND",
            Self::SessionNotFound(_) => "SESSION_NOT_FOUND",
            Self::ApprovalTimeout(_) => "APPROVAL_TIMEOUT",
            Self::StreamInterrupted(_) => "STREAM_INTERRUPTED",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

/// Raised by [`crate::communicator::LiveCommunicator`] sink operations once
/// the communicator has been closed.
#[derive(Debug, thiserror::Error)]
#[error("communicator is closed")]
pub struct CommunicatorClosed;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_cleared_reports_its_code() {
        let err = RuntimeError::SessionCleared {
            chat_session_id: ChatSessionId::from("c1"),
            reason: "session_idle_timeout".to_string(),
        };
        assert_eq!(err.code(), "SESSION_CLEARED");
    }

    #[test]
    fn every_variant_has_a_distinct_code() {
        let codes = [
            RuntimeError::RequestValidation("x".into()).code(),
            RuntimeError::FrameworkUnavailable("x".into()).code(),
            RuntimeError::AgentNotFound(AgentId::from("a")).code(),
            RuntimeError::RunnerNotFound(RunnerId::from("r")).code(),
            RuntimeError::SessionNotFound(ChatSessionId::from("c")).code(),
            RuntimeError::ApprovalTimeout("i".into()).code(),
            RuntimeError::StreamInterrupted("x".into()).code(),
            RuntimeError::Internal("x".into()).code(),
        ];
        let unique: std::collections::HashSet<_> = codes.iter().collect();
        assert_eq!(unique.len(), codes.len());
    }
}
