// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! C3 — Live Communicator. A thin bidirectional façade: grounded on
//! `live_communicator.py` (the base protocol plus the ADK history-recording
//! decorator) and `sven-node/control/service.rs`'s `AgentHandle`.

use async_trait::async_trait;
use tracing::warn;

use crate::broker::ApprovalBroker;
use crate::error::CommunicatorClosed;
use crate::ids::InteractionId;
use crate::interaction::{InteractionResponse, ResolutionSource};

/// Mirrors user text into the engine session store best-effort. Failures
/// must not propagate to the caller.
#[async_trait]
pub trait HistoryRecorder: Send + Sync {
    async fn record_user_text(&self, text: &str) -> anyhow::Result<()>;
}

/// A recorder that records nothing — used where history is tracked some
/// other way (e.g. directly by the engine session during `respond`).
#[derive(Debug, Default)]
pub struct NoopRecorder;

#[async_trait]
impl HistoryRecorder for NoopRecorder {
    async fn record_user_text(&self, _text: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

/// What a live turn accepts from its caller. This is the sink half of the
/// bidirectional channel; the source half is the `StreamChunk` receiver
/// the caller iterates separately.
#[derive(Debug, Clone)]
pub enum LiveInbound {
    UserMessage(String),
    UserResponse(InteractionResponse),
    Cancellation(String),
}

/// Bidirectional channel wrapper for one live turn.
pub struct LiveCommunicator {
    sink: tokio::sync::mpsc::Sender<LiveInbound>,
    broker: ApprovalBroker,
    recorder: std::sync::Arc<dyn HistoryRecorder>,
    closed: std::sync::atomic::AtomicBool,
}

impl LiveCommunicator {
    pub fn new(
        sink: tokio::sync::mpsc::Sender<LiveInbound>,
        broker: ApprovalBroker,
        recorder: std::sync::Arc<dyn HistoryRecorder>,
    ) -> Self {
        Self {
            sink,
            broker,
            recorder,
            closed: std::sync::atomic::AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<(), CommunicatorClosed> {
        if self.closed.load(std::sync::atomic::Ordering::SeqCst) {
            Err(CommunicatorClosed)
        } else {
            Ok(())
        }
    }

    pub async fn send_user_message(&self, text: impl Into<String>) -> Result<(), CommunicatorClosed> {
        self.ensure_open()?;
        let text = text.into();
        if let Err(e) = self.recorder.record_user_text(&text).await {
            warn!(error = %e, "history recorder failed; continuing");
        }
        self.sink
            .send(LiveInbound::UserMessage(text))
            .await
            .map_err(|_| CommunicatorClosed)
    }

    /// Delivers the response downstream, then resolves the broker's
    /// matching pending approval with `source = user`.
    pub async fn send_user_response(&self, response: InteractionResponse) -> Result<(), CommunicatorClosed> {
        self.ensure_open()?;
        let interaction_id = response.interaction_id.clone();
        self.sink
            .send(LiveInbound::UserResponse(response.clone()))
            .await
            .map_err(|_| CommunicatorClosed)?;
        self.broker.resolve(&interaction_id, Some(response), ResolutionSource::User).await;
        Ok(())
    }

    /// Sends a cancellation into the running turn and resolves all
    /// still-pending approvals for it as denied.
    pub async fn send_cancellation(&self, reason: impl Into<String>) -> Result<(), CommunicatorClosed> {
        self.ensure_open()?;
        let reason = reason.into();
        self.sink
            .send(LiveInbound::Cancellation(reason))
            .await
            .map_err(|_| CommunicatorClosed)?;
        self.broker.deny_all().await;
        Ok(())
    }

    /// Idempotent: closes the broker (cancelling its timers) and marks
    /// this communicator closed so further sink calls fail.
    pub async fn close(&self) {
        self.closed.store(true, std::sync::atomic::Ordering::SeqCst);
        self.broker.close().await;
    }

    pub fn broker(&self) -> &ApprovalBroker {
        &self.broker
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sven_config::ApprovalTimeoutPolicy;
    use std::sync::Arc;
    use std::time::Duration;

    fn communicator() -> (LiveCommunicator, tokio::sync::mpsc::Receiver<LiveInbound>) {
        let (tx, rx) = tokio::sync::mpsc::channel(8);
        let broker = ApprovalBroker::new(
            Duration::from_secs(60),
            ApprovalTimeoutPolicy::Manual,
            Arc::new(crate::broker::NullForwarder),
        );
        (LiveCommunicator::new(tx, broker, Arc::new(NoopRecorder)), rx)
    }

    #[tokio::test]
    async fn send_after_close_fails() {
        let (comm, _rx) = communicator();
        comm.close().await;
        assert!(comm.send_user_message("hi").await.is_err());
        assert!(comm.send_cancellation("bye").await.is_err());
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (comm, _rx) = communicator();
        comm.close().await;
        comm.close().await;
    }

    #[tokio::test]
    async fn user_response_is_forwarded_and_resolves_broker() {
        let (comm, mut rx) = communicator();
        let chunk = crate::chunk::StreamChunk::new(
            crate::ids::TaskId::from("t1"),
            0,
            crate::chunk::ChunkType::ToolProposal,
            serde_json::json!({"tool_name": "lookup", "arguments": {}}),
            false,
        )
        .with_interaction_id(InteractionId::from("i1"))
        .with_metadata("requires_approval", true);
        comm.broker().observe(chunk).await;

        comm.send_user_response(InteractionResponse::approve(InteractionId::from("i1"))).await.unwrap();
        assert!(matches!(rx.recv().await, Some(LiveInbound::UserResponse(_))));
        assert!(comm.broker().list_pending().await.is_empty());
    }
}
