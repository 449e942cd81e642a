// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! C2 — Approval Broker. Grounded on `approval_broker.py`: registers
//! pending tool proposals, matches user decisions by interaction id or
//! tool signature, enforces per-proposal timeouts with a configurable
//! fallback.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{oneshot, Mutex};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{info, warn};

use sven_config::ApprovalTimeoutPolicy;

use crate::chunk::{ChunkType, StreamChunk};
use crate::config_hash::canonicalize;
use crate::ids::InteractionId;
use crate::interaction::{ApprovalOutcome, InteractionResponse, ResolutionSource};

/// Receives the broker's synthesized (or user) responses so they can be
/// observed downstream — the live communicator is the production
/// implementation; tests can supply a channel-backed stub.
#[async_trait]
pub trait ResponseForwarder: Send + Sync {
    async fn forward(&self, response: InteractionResponse);
}

/// A [`ResponseForwarder`] that does nothing — used where no observer is
/// wired up (e.g. a bare tool-executor integration test).
#[derive(Debug, Default)]
pub struct NullForwarder;

#[async_trait]
impl ResponseForwarder for NullForwarder {
    async fn forward(&self, _response: InteractionResponse) {}
}

/// Snapshot of an outstanding tool proposal, as returned by `list_pending`.
#[derive(Debug, Clone)]
pub struct PendingApproval {
    pub interaction_id: InteractionId,
    pub tool_name: String,
    pub arguments: Value,
    pub signature: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

struct PendingEntry {
    info: PendingApproval,
    sender: Option<oneshot::Sender<InteractionResponse>>,
    receiver: Option<oneshot::Receiver<InteractionResponse>>,
    abort_handle: AbortHandle,
}

struct State {
    pending: HashMap<InteractionId, PendingEntry>,
    by_signature: HashMap<String, InteractionId>,
    closed: bool,
}

struct Inner {
    state: Mutex<State>,
    timeout: Duration,
    policy: ApprovalTimeoutPolicy,
    forwarder: Arc<dyn ResponseForwarder>,
    // Every spawned timeout task, so `finalize` can wait for whichever of
    // them are mid-flight (past their sleep, inside `handle_timeout`)
    // rather than racing a caller's shutdown against a forward-then-resolve
    // that hasn't landed yet.
    timers: Mutex<Vec<JoinHandle<()>>>,
}

/// `signature = hash(tool_name, canonical(arguments))`, kept as an owned
/// `String` key rather than a cryptographic digest — see `DESIGN.md` for
/// the reasoning.
fn signature_of(tool_name: &str, arguments: &Value) -> String {
    let canonical = canonicalize(arguments);
    format!("{tool_name}:{canonical}")
}

/// Cheaply cloneable handle to the shared broker state — cloned into the
/// spawned timeout tasks so they can call back into `resolve`.
#[derive(Clone)]
pub struct ApprovalBroker(Arc<Inner>);

impl ApprovalBroker {
    pub fn new(timeout: Duration, policy: ApprovalTimeoutPolicy, forwarder: Arc<dyn ResponseForwarder>) -> Self {
        Self(Arc::new(Inner {
            state: Mutex::new(State {
                pending: HashMap::new(),
                by_signature: HashMap::new(),
                closed: false,
            }),
            timeout,
            policy,
            forwarder,
            timers: Mutex::new(Vec::new()),
        }))
    }

    /// Inspect an outgoing chunk; on a `TOOL_PROPOSAL` requiring approval,
    /// register a pending approval and stamp the chunk's metadata. Returns
    /// the (possibly stamped) chunk.
    pub async fn observe(&self, mut chunk: StreamChunk) -> StreamChunk {
        if chunk.chunk_type != ChunkType::ToolProposal {
            return chunk;
        }
        let requires_approval = chunk
            .metadata
            .get("requires_approval")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if !requires_approval {
            return chunk;
        }
        let Some(interaction_id) = chunk.interaction_id.clone() else {
            return chunk;
        };
        let tool_name = chunk.tool_name().unwrap_or_default().to_string();
        let arguments = match &chunk.content {
            crate::chunk::ChunkContent::Structured(v) => v.get("arguments").cloned().unwrap_or(Value::Null),
            crate::chunk::ChunkContent::Text(_) => Value::Null,
        };
        self.register(interaction_id, tool_name, arguments).await;
        chunk
            .metadata
            .insert("interaction_timeout_seconds".to_string(), serde_json::json!(self.0.timeout.as_secs_f64()));
        chunk.metadata.insert("approval_policy".to_string(), serde_json::json!(policy_name(self.0.policy)));
        chunk
    }

    async fn register(&self, interaction_id: InteractionId, tool_name: String, arguments: Value) {
        let signature = signature_of(&tool_name, &arguments);
        let created_at = Utc::now();
        let expires_at = created_at + chrono::Duration::from_std(self.0.timeout).unwrap_or(chrono::Duration::zero());
        let (tx, rx) = oneshot::channel();

        let this = self.clone();
        let timer_id = interaction_id.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(this.0.timeout).await;
            this.handle_timeout(timer_id).await;
        });
        let abort_handle = timer.abort_handle();
        self.0.timers.lock().await.push(timer);

        let mut state = self.0.state.lock().await;
        if state.closed {
            abort_handle.abort();
            return;
        }
        state.by_signature.insert(signature.clone(), interaction_id.clone());
        state.pending.insert(
            interaction_id.clone(),
            PendingEntry {
                info: PendingApproval {
                    interaction_id,
                    tool_name,
                    arguments,
                    signature,
                    created_at,
                    expires_at,
                },
                sender: Some(tx),
                receiver: Some(rx),
                abort_handle,
            },
        );
    }

    /// Called by the tool executor before invoking the tool. If no
    /// approval is pending for this signature the tool is not gated and
    /// the call defaults to approved.
    pub async fn wait_for_tool_approval(&self, tool_name: &str, arguments: &Value) -> ApprovalOutcome {
        let signature = signature_of(tool_name, arguments);
        let receiver = {
            let mut state = self.0.state.lock().await;
            let Some(interaction_id) = state.by_signature.get(&signature).cloned() else {
                return ApprovalOutcome::approved(None);
            };
            match state.pending.get_mut(&interaction_id) {
                Some(entry) => entry.receiver.take(),
                None => None,
            }
        };
        let Some(receiver) = receiver else {
            // Already resolved (or being waited on elsewhere) — approved by
            // default, matching "tool is not gated" fallback.
            return ApprovalOutcome::approved(None);
        };
        match receiver.await {
            Ok(response) => {
                if response.approved {
                    ApprovalOutcome::approved(Some(response.interaction_id))
                } else {
                    ApprovalOutcome::denied(Some(response.interaction_id))
                }
            }
            Err(_) => ApprovalOutcome::denied(None),
        }
    }

    /// Mark a pending approval resolved; a no-op if the id is unknown or
    /// already resolved.
    pub async fn resolve(&self, interaction_id: &InteractionId, response: Option<InteractionResponse>, source: ResolutionSource) {
        let entry = {
            let mut state = self.0.state.lock().await;
            let entry = state.pending.remove(interaction_id);
            if let Some(entry) = &entry {
                state.by_signature.remove(&entry.info.signature);
            }
            entry
        };
        let Some(mut entry) = entry else {
            return;
        };
        entry.abort_handle.abort();
        let response = response.unwrap_or_else(|| InteractionResponse::deny(interaction_id.clone()));
        if let Some(sender) = entry.sender.take() {
            // Completing the future outside the state lock avoids
            // re-entrancy into the broker from the waiter.
            let _ = sender.send(response);
        }
        info!(%interaction_id, ?source, "approval resolved");
    }

    async fn handle_timeout(&self, interaction_id: InteractionId) {
        let still_pending = {
            let state = self.0.state.lock().await;
            state.pending.contains_key(&interaction_id)
        };
        if !still_pending {
            return;
        }
        match self.0.policy {
            ApprovalTimeoutPolicy::AutoApprove => {
                let response = InteractionResponse::synthesize(interaction_id.clone(), true);
                self.0.forwarder.forward(response.clone()).await;
                self.resolve(&interaction_id, Some(response), ResolutionSource::Timeout).await;
            }
            ApprovalTimeoutPolicy::AutoCancel => {
                let response = InteractionResponse::synthesize(interaction_id.clone(), false);
                self.0.forwarder.forward(response.clone()).await;
                self.resolve(&interaction_id, Some(response), ResolutionSource::Timeout).await;
            }
            ApprovalTimeoutPolicy::Manual => {
                warn!(%interaction_id, "approval timed out under manual policy; left pending");
            }
        }
    }

    /// Snapshot of all outstanding approvals.
    pub async fn list_pending(&self) -> Vec<PendingApproval> {
        let state = self.0.state.lock().await;
        state.pending.values().map(|e| e.info.clone()).collect()
    }

    /// Resolve every still-pending approval as denied, with `source =
    /// user` — used when a stream is cancelled mid-turn.
    pub async fn deny_all(&self) {
        let ids: Vec<InteractionId> = {
            let state = self.0.state.lock().await;
            state.pending.keys().cloned().collect()
        };
        for id in ids {
            let response = InteractionResponse::deny(id.clone());
            self.resolve(&id, Some(response), ResolutionSource::User).await;
        }
    }

    /// Cancels all pending timeouts and forbids new registrations.
    pub async fn close(&self) {
        let mut state = self.0.state.lock().await;
        state.closed = true;
        for (_, entry) in state.pending.drain() {
            entry.abort_handle.abort();
        }
        state.by_signature.clear();
    }

    /// Waits for every in-flight timeout task to complete. Timers for
    /// already-resolved proposals are aborted, not dropped, so this mostly
    /// blocks on timers that fired but haven't finished forwarding and
    /// resolving their synthesized response yet — e.g. at caller shutdown,
    /// so a synthesized auto-cancel isn't lost mid-flight.
    pub async fn finalize(&self) {
        let timers: Vec<JoinHandle<()>> = {
            let mut timers = self.0.timers.lock().await;
            std::mem::take(&mut *timers)
        };
        for timer in timers {
            let _ = timer.await;
        }
    }
}

fn policy_name(policy: ApprovalTimeoutPolicy) -> &'static str {
    match policy {
        ApprovalTimeoutPolicy::AutoApprove => "auto_approve",
        ApprovalTimeoutPolicy::AutoCancel => "auto_cancel",
        ApprovalTimeoutPolicy::Manual => "manual",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::TaskId;

    fn proposal_chunk(interaction_id: &str, tool: &str) -> StreamChunk {
        StreamChunk::new(
            TaskId::from("t1"),
            0,
            ChunkType::ToolProposal,
            serde_json::json!({"tool_name": tool, "arguments": {"x": 1}}),
            false,
        )
        .with_interaction_id(InteractionId::from(interaction_id))
        .with_metadata("requires_approval", true)
    }

    fn broker(policy: ApprovalTimeoutPolicy, timeout: Duration) -> ApprovalBroker {
        ApprovalBroker::new(timeout, policy, Arc::new(NullForwarder))
    }

    #[tokio::test]
    async fn happy_path_approval_resolves_wait_for_tool_approval() {
        let broker = broker(ApprovalTimeoutPolicy::Manual, Duration::from_secs(60));
        let chunk = broker.observe(proposal_chunk("i1", "lookup")).await;
        assert_eq!(chunk.metadata.get("approval_policy").unwrap(), "manual");

        let waiter = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.wait_for_tool_approval("lookup", &serde_json::json!({"x": 1})).await })
        };
        tokio::task::yield_now().await;
        broker
            .resolve(&InteractionId::from("i1"), Some(InteractionResponse::approve(InteractionId::from("i1"))), ResolutionSource::User)
            .await;
        let outcome = waiter.await.unwrap();
        assert!(outcome.approved);
        assert!(broker.list_pending().await.is_empty());
    }

    #[tokio::test]
    async fn unknown_signature_defaults_to_approved() {
        let broker = broker(ApprovalTimeoutPolicy::Manual, Duration::from_secs(60));
        let outcome = broker.wait_for_tool_approval("untracked", &serde_json::json!({})).await;
        assert!(outcome.approved);
    }

    #[tokio::test]
    async fn second_resolve_is_a_no_op() {
        let broker = broker(ApprovalTimeoutPolicy::Manual, Duration::from_secs(60));
        broker.observe(proposal_chunk("i1", "lookup")).await;
        let id = InteractionId::from("i1");
        broker.resolve(&id, Some(InteractionResponse::approve(id.clone())), ResolutionSource::User).await;
        // Must not panic, and the pending map stays empty.
        broker.resolve(&id, Some(InteractionResponse::deny(id.clone())), ResolutionSource::User).await;
        assert!(broker.list_pending().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn auto_cancel_timeout_denies_and_forwards() {
        #[derive(Default)]
        struct Capture(Mutex<Vec<InteractionResponse>>);
        #[async_trait]
        impl ResponseForwarder for Capture {
            async fn forward(&self, response: InteractionResponse) {
                self.0.lock().await.push(response);
            }
        }
        let capture = Arc::new(Capture::default());
        let broker = ApprovalBroker::new(Duration::from_millis(10), ApprovalTimeoutPolicy::AutoCancel, capture.clone());
        broker.observe(proposal_chunk("i1", "lookup")).await;
        tokio::time::advance(Duration::from_millis(50)).await;
        tokio::task::yield_now().await;
        assert!(broker.list_pending().await.is_empty());
        let forwarded = capture.0.lock().await;
        assert_eq!(forwarded.len(), 1);
        assert!(!forwarded[0].approved);
        assert!(forwarded[0].auto_timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn finalize_waits_for_inflight_timeout_task() {
        #[derive(Default)]
        struct Capture(Mutex<Vec<InteractionResponse>>);
        #[async_trait]
        impl ResponseForwarder for Capture {
            async fn forward(&self, response: InteractionResponse) {
                self.0.lock().await.push(response);
            }
        }
        let capture = Arc::new(Capture::default());
        let broker = ApprovalBroker::new(Duration::from_millis(10), ApprovalTimeoutPolicy::AutoCancel, capture.clone());
        broker.observe(proposal_chunk("i1", "lookup")).await;
        tokio::time::advance(Duration::from_millis(50)).await;
        broker.finalize().await;
        assert!(broker.list_pending().await.is_empty());
        assert_eq!(capture.0.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_drops_pending() {
        let broker = broker(ApprovalTimeoutPolicy::Manual, Duration::from_secs(60));
        broker.observe(proposal_chunk("i1", "lookup")).await;
        broker.close().await;
        broker.close().await;
        assert!(broker.list_pending().await.is_empty());
    }
}
