// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! C9 — Stream Session Façade. Caller-facing handle wrapping a live
//! stream plus communicator, inverted from `sven-node/node.rs::exec_task`
//! (the client-side loop that iterates `ControlEvent`s) into a
//! server-side façade.

use std::sync::Arc;

use tokio::sync::mpsc::Receiver;

use crate::broker::PendingApproval;
use crate::chunk::StreamChunk;
use crate::communicator::LiveCommunicator;
use crate::error::CommunicatorClosed;
use crate::ids::InteractionId;
use crate::interaction::InteractionResponse;

/// Wraps `(chunk_source, communicator)` into an iterable session object.
pub struct StreamSession {
    chunks: tokio::sync::Mutex<Receiver<StreamChunk>>,
    communicator: Arc<LiveCommunicator>,
}

impl StreamSession {
    pub fn new(chunks: Receiver<StreamChunk>, communicator: Arc<LiveCommunicator>) -> Self {
        Self {
            chunks: tokio::sync::Mutex::new(chunks),
            communicator,
        }
    }

    /// Yields the next chunk, or `None` once the source is exhausted.
    pub async fn next(&self) -> Option<StreamChunk> {
        self.chunks.lock().await.recv().await
    }

    pub async fn approve_tool(&self, interaction_id: InteractionId, approved: bool, user_message: Option<String>) -> Result<(), CommunicatorClosed> {
        let mut response = if approved {
            InteractionResponse::approve(interaction_id)
        } else {
            InteractionResponse::deny(interaction_id)
        };
        response.user_message = user_message;
        self.communicator.send_user_response(response).await
    }

    pub async fn send_user_message(&self, text: impl Into<String>) -> Result<(), CommunicatorClosed> {
        self.communicator.send_user_message(text).await
    }

    pub async fn cancel(&self, reason: impl Into<String>) -> Result<(), CommunicatorClosed> {
        self.communicator.send_cancellation(reason).await
    }

    pub async fn list_pending_interactions(&self) -> Vec<PendingApproval> {
        self.communicator.broker().list_pending().await
    }

    /// Idempotent — closing twice is a no-op.
    pub async fn close(&self) {
        self.communicator.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{ApprovalBroker, NullForwarder};
    use crate::communicator::NoopRecorder;
    use crate::ids::TaskId;
    use sven_config::ApprovalTimeoutPolicy;
    use std::time::Duration;

    fn session() -> (StreamSession, tokio::sync::mpsc::Sender<StreamChunk>, tokio::sync::mpsc::Receiver<crate::communicator::LiveInbound>) {
        let (chunk_tx, chunk_rx) = tokio::sync::mpsc::channel(8);
        let (inbound_tx, inbound_rx) = tokio::sync::mpsc::channel(8);
        let broker = ApprovalBroker::new(Duration::from_secs(60), ApprovalTimeoutPolicy::Manual, Arc::new(NullForwarder));
        let communicator = Arc::new(LiveCommunicator::new(inbound_tx, broker, Arc::new(NoopRecorder)));
        (StreamSession::new(chunk_rx, communicator), chunk_tx, inbound_rx)
    }

    #[tokio::test]
    async fn iterates_chunks_in_order() {
        let (session, chunk_tx, _inbound_rx) = session();
        chunk_tx
            .send(StreamChunk::new(TaskId::from("t1"), 0, crate::chunk::ChunkType::Complete, "done".to_string(), true))
            .await
            .unwrap();
        drop(chunk_tx);
        let chunk = session.next().await.unwrap();
        assert!(chunk.is_final);
        assert!(session.next().await.is_none());
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (session, _chunk_tx, _inbound_rx) = session();
        session.close().await;
        session.close().await;
    }

    #[tokio::test]
    async fn approve_tool_forwards_via_communicator() {
        let (session, _chunk_tx, mut inbound_rx) = session();
        let chunk = StreamChunk::new(
            TaskId::from("t1"),
            0,
            crate::chunk::ChunkType::ToolProposal,
            serde_json::json!({"tool_name": "lookup", "arguments": {}}),
            false,
        )
        .with_interaction_id(InteractionId::from("i1"))
        .with_metadata("requires_approval", true);
        session.communicator.broker().observe(chunk).await;

        session.approve_tool(InteractionId::from("i1"), true, None).await.unwrap();
        assert!(matches!(inbound_rx.recv().await, Some(crate::communicator::LiveInbound::UserResponse(_))));
        assert!(session.list_pending_interactions().await.is_empty());
    }
}
