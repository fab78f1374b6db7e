//! Core data types shared across the store, scheduler, executor, and service
//! layers (spec §3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The serialization key: an opaque string every run is dispatched under.
/// Conventionally `telegram:chat:<id>`, `telegram:chat:<id>:topic:<tid>`,
/// `cli:default`, or `api:<opaque>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ThreadKey(pub String);

impl ThreadKey {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn cli_default() -> Self {
        Self("cli:default".to_string())
    }

    pub fn api(opaque: &str) -> Self {
        Self(format!("api:{opaque}"))
    }

    /// Builds a thread key from a Telegram chat id and an optional topic id.
    /// Topic id `1` (the "General" topic) is normalized to absent, matching
    /// `normalizeTelegramMessageThreadId(1) = absent`.
    pub fn telegram(chat_id: i64, message_thread_id: Option<i32>) -> Self {
        match normalize_telegram_message_thread_id(message_thread_id) {
            Some(topic) => Self(format!("telegram:chat:{chat_id}:topic:{topic}")),
            None => Self(format!("telegram:chat:{chat_id}")),
        }
    }
}

impl std::fmt::Display for ThreadKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// `normalizeTelegramMessageThreadId(1) = absent` (general topic is not a
/// real topic as far as thread keying is concerned).
pub fn normalize_telegram_message_thread_id(id: Option<i32>) -> Option<i32> {
    match id {
        Some(1) | None => None,
        Some(other) => Some(other),
    }
}

/// A Telegram route: the (chat_id, topic) pair a thread key was derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TelegramRoute {
    pub chat_id: i64,
    pub message_thread_id: Option<i32>,
}

/// Inverse of `ThreadKey::telegram` — used by the Telegram adapter to decide
/// where to deliver a reply for a given thread.
pub fn telegram_route_from_thread_key(key: &ThreadKey) -> Option<TelegramRoute> {
    let rest = key.0.strip_prefix("telegram:chat:")?;
    let (chat_part, topic_part) = match rest.split_once(":topic:") {
        Some((chat, topic)) => (chat, Some(topic)),
        None => (rest, None),
    };
    let chat_id = chat_part.parse().ok()?;
    let message_thread_id = match topic_part {
        Some(topic) => Some(topic.parse().ok()?),
        None => None,
    };
    Some(TelegramRoute {
        chat_id,
        message_thread_id,
    })
}

/// Inverse direction: `telegramThreadKeyFromRoute(telegramRouteFromThreadKey(k)) = k`
/// post-normalization (spec §8 round-trip law).
pub fn telegram_thread_key_from_route(route: TelegramRoute) -> ThreadKey {
    ThreadKey::telegram(route.chat_id, route.message_thread_id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeliveryMode {
    Steer,
    FollowUp,
}

impl DeliveryMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryMode::Steer => "steer",
            DeliveryMode::FollowUp => "followUp",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "steer" => Some(DeliveryMode::Steer),
            "followUp" => Some(DeliveryMode::FollowUp),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "running" => Some(RunStatus::Running),
            "succeeded" => Some(RunStatus::Succeeded),
            "failed" => Some(RunStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunImage {
    pub mime_type: String,
    pub bytes: Vec<u8>,
    pub filename: Option<String>,
}

/// A unit of agent work (spec §3 "Run").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub run_id: String,
    pub source: String,
    pub thread_key: ThreadKey,
    pub user_key: Option<String>,
    pub delivery_mode: DeliveryMode,
    pub status: RunStatus,
    pub input_text: String,
    pub images: Vec<RunImage>,
    pub output: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Run {
    pub fn new_running(
        run_id: String,
        source: String,
        thread_key: ThreadKey,
        user_key: Option<String>,
        delivery_mode: DeliveryMode,
        input_text: String,
        images: Vec<RunImage>,
    ) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            source,
            thread_key,
            user_key,
            delivery_mode,
            status: RunStatus::Running,
            input_text,
            images,
            output: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// One assistant turn result, as produced by the Thread Run Controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutput {
    #[serde(rename = "type")]
    pub kind: String,
    pub text: String,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub delivery_mode: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleKind {
    Once,
    Cron,
    Rrule,
}

impl ScheduleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleKind::Once => "once",
            ScheduleKind::Cron => "cron",
            ScheduleKind::Rrule => "rrule",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "once" => Some(ScheduleKind::Once),
            "cron" => Some(ScheduleKind::Cron),
            "rrule" => Some(ScheduleKind::Rrule),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryTarget {
    pub provider: String,
    pub route: String,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub task_id: String,
    pub title: String,
    pub instructions: String,
    pub schedule_kind: ScheduleKind,
    pub once_at: Option<DateTime<Utc>>,
    pub cron_expr: Option<String>,
    pub rrule_expr: Option<String>,
    pub timezone: String,
    pub enabled: bool,
    pub next_run_at: Option<DateTime<Utc>>,
    pub creator_thread_key: ThreadKey,
    pub owner_user_key: Option<String>,
    pub delivery_target: DeliveryTarget,
    pub execution_thread_key: Option<ThreadKey>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_run_status: Option<RunStatus>,
    pub last_error_message: Option<String>,
}

impl ScheduledTask {
    /// The thread a due occurrence's run is dispatched onto: the explicit
    /// execution thread if set, otherwise the thread that created the task.
    pub fn effective_execution_thread(&self) -> ThreadKey {
        self.execution_thread_key
            .clone()
            .unwrap_or_else(|| self.creator_thread_key.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskRunStatus {
    Pending,
    Succeeded,
    Failed,
}

impl TaskRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskRunStatus::Pending => "pending",
            TaskRunStatus::Succeeded => "succeeded",
            TaskRunStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(TaskRunStatus::Pending),
            "succeeded" => Some(TaskRunStatus::Succeeded),
            "failed" => Some(TaskRunStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledTaskRun {
    pub task_run_id: String,
    pub task_id: String,
    pub scheduled_for: DateTime<Utc>,
    pub idempotency_key: String,
    pub run_id: Option<String>,
    pub status: TaskRunStatus,
    pub error_message: Option<String>,
}

/// Persisted `thread_key -> session` mapping (spec §3 "Thread Session").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadSession {
    pub thread_key: ThreadKey,
    pub session_id: String,
    pub session_file_path: String,
    pub generation: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_key_topic_round_trips() {
        let key = ThreadKey::telegram(101, Some(42));
        let route = telegram_route_from_thread_key(&key).unwrap();
        assert_eq!(telegram_thread_key_from_route(route), key);
    }

    #[test]
    fn thread_key_general_topic_normalizes_to_absent() {
        let key = ThreadKey::telegram(101, Some(1));
        assert_eq!(key, ThreadKey::new("telegram:chat:101"));
        let route = telegram_route_from_thread_key(&key).unwrap();
        assert_eq!(route.message_thread_id, None);
    }

    #[test]
    fn thread_key_no_topic_round_trips() {
        let key = ThreadKey::telegram(555, None);
        let route = telegram_route_from_thread_key(&key).unwrap();
        assert_eq!(telegram_thread_key_from_route(route), key);
    }
}
