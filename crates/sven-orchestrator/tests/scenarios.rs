// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! End-to-end coverage that no single component's own test module
//! exercises on its own: the tool-approval pipeline running through the
//! full converter -> broker -> communicator chain, and the
//! idle-sweep/live-traffic eviction race.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use sven_config::ApprovalTimeoutPolicy;
use sven_core::EchoAgentHandle;
use sven_orchestrator::{
    AgentConfig, AgentRegistry, ApprovalBroker, ChatSessionId, EventConverter, InteractionId,
    InteractionResponse, LiveCommunicator, NoopRecorder, ResponseForwarder, RunnerManager,
    SessionCoordinator, SourceEvent, SourceEventKind, TaskId,
};

#[derive(Default)]
struct Capture(Mutex<Vec<InteractionResponse>>);

#[async_trait]
impl ResponseForwarder for Capture {
    async fn forward(&self, response: InteractionResponse) {
        self.0.lock().await.push(response);
    }
}

fn agent_config() -> AgentConfig {
    AgentConfig {
        agent_type: "asst".into(),
        system_prompt: "P".into(),
        model_config: serde_json::json!({"model": "m1"}),
        available_tools: vec!["lookup".into()],
        framework_config: serde_json::Value::Null,
    }
}

/// Tool approval happy path: the converter synthesizes a
/// TOOL_PROPOSAL, the broker gates `wait_for_tool_approval` on it, the
/// caller approves via the communicator, and the pending map empties.
#[tokio::test]
async fn tool_approval_user_accepts_before_result() {
    let broker = ApprovalBroker::new(Duration::from_secs(60), ApprovalTimeoutPolicy::Manual, Arc::new(Capture::default()));
    let (sink_tx, mut sink_rx) = tokio::sync::mpsc::channel(8);
    let communicator = LiveCommunicator::new(sink_tx, broker.clone(), Arc::new(NoopRecorder));

    let converter = EventConverter::new(TaskId::from("T1"));
    let proposal_chunks = converter.convert(&SourceEvent::new(
        "agent",
        SourceEventKind::FunctionCall {
            id: Some("i1".into()),
            tool_name: "lookup".into(),
            arguments: serde_json::json!({"x": 1}),
            requires_approval: Some(true),
        },
    ));
    assert_eq!(proposal_chunks.len(), 1);
    let stamped = broker.observe(proposal_chunks.into_iter().next().unwrap()).await;
    assert!(stamped.metadata.contains_key("interaction_timeout_seconds"));

    // The tool executor blocks on this before invoking "lookup".
    let waiter = {
        let broker = broker.clone();
        tokio::spawn(async move { broker.wait_for_tool_approval("lookup", &serde_json::json!({"x": 1})).await })
    };
    tokio::task::yield_now().await;

    communicator
        .send_user_response(InteractionResponse::approve(InteractionId::from("i1")))
        .await
        .unwrap();
    assert!(matches!(sink_rx.recv().await, Some(sven_orchestrator::LiveInbound::UserResponse(_))));

    let outcome = waiter.await.unwrap();
    assert!(outcome.approved);
    assert_eq!(outcome.interaction_id, Some(InteractionId::from("i1")));

    let result_chunks = converter.convert(&SourceEvent::new(
        "agent",
        SourceEventKind::FunctionResponse {
            id: Some("i1".into()),
            tool_name: Some("lookup".into()),
            output: serde_json::json!({"ok": true}),
            is_error: false,
        },
    ));
    // The proposal already happened, so only the result chunk follows.
    assert_eq!(result_chunks.len(), 1);
    assert_eq!(result_chunks[0].chunk_type, sven_orchestrator::ChunkType::ToolResult);
    assert!(broker.list_pending().await.is_empty());
}

/// Timeout under `auto_cancel`: the communicator's forwarder
/// observes the synthesized denial before the broker's pending map empties.
#[tokio::test(start_paused = true)]
async fn tool_approval_timeout_auto_cancels() {
    let capture = Arc::new(Capture::default());
    let broker = ApprovalBroker::new(Duration::from_millis(10), ApprovalTimeoutPolicy::AutoCancel, capture.clone());
    let (sink_tx, _sink_rx) = tokio::sync::mpsc::channel(8);
    let communicator = LiveCommunicator::new(sink_tx, broker.clone(), Arc::new(NoopRecorder));

    let converter = EventConverter::new(TaskId::from("T1"));
    let proposal_chunks = converter.convert(&SourceEvent::new(
        "agent",
        SourceEventKind::FunctionCall {
            id: Some("i1".into()),
            tool_name: "lookup".into(),
            arguments: serde_json::json!({"x": 1}),
            requires_approval: Some(true),
        },
    ));
    communicator.broker().observe(proposal_chunks.into_iter().next().unwrap()).await;

    tokio::time::advance(Duration::from_millis(50)).await;
    tokio::task::yield_now().await;

    assert!(broker.list_pending().await.is_empty());
    let forwarded = capture.0.lock().await;
    assert_eq!(forwarded.len(), 1);
    assert!(!forwarded[0].approved);
    assert!(forwarded[0].auto_timeout);

    communicator.close().await;
}

/// An idle sweep loses the race against a concurrent request that just
/// touched the chat's `last_activity`.
#[tokio::test]
async fn concurrent_activity_blocks_idle_eviction() {
    let registry = Arc::new(AgentRegistry::new());
    let runners = Arc::new(RunnerManager::new("app"));
    let coordinator = Arc::new(SessionCoordinator::new(registry.clone(), runners.clone(), "session"));

    let agent_id = registry.generate_id();
    let cfg = agent_config();
    let hash = cfg.config_hash();
    registry.register(agent_id.clone(), cfg, Arc::new(EchoAgentHandle::default())).await;
    runners
        .get_or_create_runner(&hash, &agent_id, Arc::new(EchoAgentHandle::default()), None, true, 100)
        .await
        .unwrap();

    let chat_id = ChatSessionId::from("C1");
    coordinator.coordinate(chat_id.clone(), agent_id.clone(), "u1", 100).await.unwrap();

    let idle_since = chrono::Utc::now();
    tokio::time::sleep(Duration::from_millis(5)).await;

    // A fresh request bumps last_activity after idle_since was captured,
    // simulating traffic landing between the sweep's scan and its evict.
    coordinator.coordinate(chat_id.clone(), agent_id.clone(), "u1", 100).await.unwrap();

    let evicted = coordinator.evict_if_idle(&chat_id, idle_since, "session_idle_timeout").await;
    assert!(evicted.is_none(), "concurrent activity must block the eviction");
    assert!(coordinator.snapshot(&chat_id).await.is_some());
}
