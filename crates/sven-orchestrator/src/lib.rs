// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Session/runner/agent lifecycle coordinator plus the live streaming and
//! tool-approval pipeline.
//!
//! Nine components, leaves first: [`converter`] (C1), [`broker`] (C2),
//! [`communicator`] (C3), [`runner_manager`] (C4), [`agent_registry`]
//! (C5), [`coordinator`] (C6), [`adapter`] (C8), [`stream_session`] (C9).
//! C7 (the idle sweeper) lives in `sven-scheduler`, driving this crate's
//! [`coordinator::SessionCoordinator`], [`runner_manager::RunnerManager`],
//! and [`agent_registry::AgentRegistry`] from the outside.

pub mod adapter;
pub mod agent_registry;
pub mod broker;
pub mod chunk;
pub mod communicator;
pub mod config_hash;
pub mod converter;
pub mod coordinator;
pub mod error;
pub mod ids;
pub mod interaction;
pub mod request;
pub mod runner_manager;
pub mod source_event;
pub mod stream_session;

pub use adapter::{AgentFactory, FrameworkAdapter};
pub use agent_registry::{AgentRegistry, DomainAgent};
pub use broker::{ApprovalBroker, NullForwarder, PendingApproval, ResponseForwarder};
pub use chunk::{ChunkContent, ChunkType, SequenceCounter, StreamChunk};
pub use communicator::{HistoryRecorder, LiveCommunicator, LiveInbound, NoopRecorder};
pub use config_hash::AgentConfig;
pub use converter::EventConverter;
pub use coordinator::{ChatSession, CoordinationResult, SessionCoordinator, Tombstone};
pub use error::{CommunicatorClosed, RuntimeError};
pub use ids::{AgentId, ChatSessionId, ConfigHash, EngineSessionId, InteractionId, RunnerId, TaskId};
pub use interaction::{ApprovalOutcome, InteractionResponse, ResolutionSource};
pub use request::{ExecutionContext, ExecutionMode, Pattern, RequestTarget, TaskError, TaskRequest, TaskResult, TaskStatus};
pub use runner_manager::{AgentCleanupCallback, Runner, RunnerManager};
pub use source_event::{SourceEvent, SourceEventKind};
pub use stream_session::StreamSession;
