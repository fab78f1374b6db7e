use thiserror::Error;

/// Stable error taxonomy for everything that crosses a module boundary.
///
/// HTTP handlers (`http::routes`) match on these variants to produce the
/// `{code,message}` bodies from the spec; Telegram handlers collapse them to
/// chat text. Internal plumbing keeps using `anyhow::Result` and only
/// surfaces a `CoordinatorError` at the edges that need to distinguish cases.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("invalid_message_payload: {0}")]
    InvalidMessagePayload(String),

    #[error("invalid_idempotency_key_header: {0}")]
    InvalidIdempotencyKeyHeader(String),

    #[error("idempotency_key_mismatch")]
    IdempotencyKeyMismatch,

    #[error("invalid_run_id: {0}")]
    InvalidRunId(String),

    #[error("run_not_found: {0}")]
    RunNotFound(String),

    #[error("invalid_thread_key: {0}")]
    InvalidThreadKey(String),

    #[error("invalid_model_payload: {0}")]
    InvalidModelPayload(String),

    #[error("invalid_thinking_payload: {0}")]
    InvalidThinkingPayload(String),

    #[error("thread_model_error: {0}")]
    ThreadModelError(String),

    #[error("thread_run_cancel_error: {0}")]
    ThreadRunCancelError(String),

    #[error("thread_session_reset_error: {0}")]
    ThreadSessionResetError(String),

    #[error("thread_session_share_error: {0}")]
    ThreadSessionShareError(String),

    #[error("thread_control_unavailable")]
    ThreadControlUnavailable,

    #[error("auth_unavailable")]
    AuthUnavailable,

    #[error("scheduler is stopped, cannot enqueue run {0}")]
    SchedulerStopped(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("telegram API error: {0}")]
    Telegram(#[from] teloxide::RequestError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl CoordinatorError {
    /// Stable machine-readable code, used as the `code` field of §6.1 error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            CoordinatorError::InvalidMessagePayload(_) => "invalid_message_payload",
            CoordinatorError::InvalidIdempotencyKeyHeader(_) => "invalid_idempotency_key_header",
            CoordinatorError::IdempotencyKeyMismatch => "idempotency_key_mismatch",
            CoordinatorError::InvalidRunId(_) => "invalid_run_id",
            CoordinatorError::RunNotFound(_) => "run_not_found",
            CoordinatorError::InvalidThreadKey(_) => "invalid_thread_key",
            CoordinatorError::InvalidModelPayload(_) => "invalid_model_payload",
            CoordinatorError::InvalidThinkingPayload(_) => "invalid_thinking_payload",
            CoordinatorError::ThreadModelError(_) => "thread_model_error",
            CoordinatorError::ThreadRunCancelError(_) => "thread_run_cancel_error",
            CoordinatorError::ThreadSessionResetError(_) => "thread_session_reset_error",
            CoordinatorError::ThreadSessionShareError(_) => "thread_session_share_error",
            CoordinatorError::ThreadControlUnavailable => "thread_control_unavailable",
            CoordinatorError::AuthUnavailable => "auth_unavailable",
            CoordinatorError::SchedulerStopped(_) => "scheduler_stopped",
            CoordinatorError::Storage(_) => "storage_error",
            CoordinatorError::Telegram(_) => "telegram_error",
            CoordinatorError::Serialization(_) => "serialization_error",
            CoordinatorError::Config(_) => "config_error",
            CoordinatorError::Internal(_) => "internal_error",
        }
    }

    /// HTTP status to pair with `code()`, per the §6.1 table.
    pub fn status(&self) -> u16 {
        match self {
            CoordinatorError::InvalidMessagePayload(_)
            | CoordinatorError::InvalidIdempotencyKeyHeader(_)
            | CoordinatorError::IdempotencyKeyMismatch
            | CoordinatorError::InvalidRunId(_)
            | CoordinatorError::InvalidThreadKey(_)
            | CoordinatorError::InvalidModelPayload(_)
            | CoordinatorError::InvalidThinkingPayload(_)
            | CoordinatorError::ThreadModelError(_)
            | CoordinatorError::ThreadRunCancelError(_)
            | CoordinatorError::ThreadSessionResetError(_)
            | CoordinatorError::ThreadSessionShareError(_) => 400,
            CoordinatorError::RunNotFound(_) => 404,
            CoordinatorError::ThreadControlUnavailable | CoordinatorError::AuthUnavailable => 501,
            _ => 500,
        }
    }
}
