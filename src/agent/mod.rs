//! Agent session interface consumed by the Thread Run Controller (spec §6.3).
//!
//! The agent session itself is an opaque collaborator: a long-lived,
//! streaming conversation context. This module defines the trait boundary
//! and two concrete implementations behind `Config::RunnerKind` — `pi`
//! (the real coding-agent runner, modeled here as a process-driven session)
//! and `echo` (a deterministic stand-in for tests and local development).

pub mod echo;
pub mod pi;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// One event emitted by a streaming agent session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    Queued,
    Started,
    AgentStart,
    AgentEnd,
    TurnStart,
    TurnEnd,
    MessageStart {
        role: String,
        content: String,
    },
    MessageEnd {
        role: String,
        content: String,
        provider: Option<String>,
        model: Option<String>,
        stop_reason: Option<String>,
    },
    AssistantTextDelta {
        delta: String,
    },
    AssistantThinkingDelta {
        delta: String,
    },
    ToolExecutionStart {
        tool_call_id: String,
        tool_name: String,
    },
    ToolExecutionUpdate {
        tool_call_id: String,
        detail: String,
    },
    ToolExecutionEnd {
        tool_call_id: String,
        success: bool,
    },
    Succeeded,
    Failed {
        message: String,
    },
}

impl AgentEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentEvent::Succeeded | AgentEvent::Failed { .. })
    }
}

/// Runtime, queryable/mutable metadata about a thread's agent session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThreadRuntimeState {
    pub provider: Option<String>,
    pub model: Option<String>,
    pub thinking_level: Option<String>,
    pub session_id: Option<String>,
}

/// Result of `shareThreadSession`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShareResult {
    pub gist_url: String,
    pub share_url: String,
}

/// A long-lived, streaming agent session for one thread.
///
/// Implementations must be cheaply cloneable handles (an `Arc` around
/// internal state) so the Thread Run Controller and Executor can share one
/// instance across calls without re-acquiring locks for every operation.
#[async_trait]
pub trait AgentSession: Send + Sync {
    async fn prompt(&self, text: &str) -> anyhow::Result<()>;
    async fn follow_up(&self, text: &str) -> anyhow::Result<()>;
    async fn steer(&self, text: &str) -> anyhow::Result<()>;
    async fn set_model(&self, provider: &str, model_id: &str) -> anyhow::Result<()>;
    async fn set_thinking_level(&self, level: &str) -> anyhow::Result<()>;
    async fn abort(&self) -> anyhow::Result<()>;
    async fn share(&self) -> anyhow::Result<ShareResult>;
    fn runtime_state(&self) -> ThreadRuntimeState;
    fn session_id(&self) -> String;

    /// Subscribes a fresh event receiver. The session fans every event out
    /// to all current subscribers; a session with no subscribers still runs.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<AgentEvent>;
}

/// Builds sessions for a thread. One implementation per `RunnerKind`.
#[async_trait]
pub trait AgentSessionFactory: Send + Sync {
    async fn create(&self, thread_key: &str, session_file_path: &str) -> anyhow::Result<std::sync::Arc<dyn AgentSession>>;
}
