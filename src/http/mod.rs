//! HTTP API (spec §6.1, §4.7) — a thin actix-web layer over the Run Service
//! and Executor. Every handler maps `CoordinatorError` to the `{error:{code,
//! message}}` body shape via `ApiError`.

use std::sync::Arc;

use actix_web::{web, App, HttpResponse, HttpServer, ResponseError};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::executor::RunExecutor;
use crate::model::{DeliveryMode, ThreadKey};
use crate::service::{IngestMessageParams, RunService};
use crate::utils::errors::CoordinatorError;

pub struct AppState {
    pub service: Arc<RunService>,
    pub executor: Arc<RunExecutor>,
}

/// Wraps `CoordinatorError` so it can implement actix's `ResponseError`
/// without an orphan impl across crate boundaries.
#[derive(Debug)]
pub struct ApiError(pub CoordinatorError);

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<CoordinatorError> for ApiError {
    fn from(e: CoordinatorError) -> Self {
        ApiError(e)
    }
}

impl ResponseError for ApiError {
    fn error_response(&self) -> HttpResponse {
        let status = actix_web::http::StatusCode::from_u16(self.0.status()).unwrap_or(actix_web::http::StatusCode::INTERNAL_SERVER_ERROR);
        HttpResponse::build(status).json(ErrorBody {
            error: ErrorDetail {
                code: self.0.code().to_string(),
                message: self.0.to_string(),
            },
        })
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/healthz", web::get().to(healthz))
        .route("/v1/messages", web::post().to(post_message))
        .route("/v1/runs/{run_id}", web::get().to(get_run))
        .route("/v1/auth/providers", web::get().to(get_auth_providers))
        .route("/v1/threads/{thread_key}/runtime", web::get().to(get_thread_runtime))
        .route("/v1/threads/{thread_key}/model", web::put().to(put_thread_model))
        .route("/v1/threads/{thread_key}/thinking", web::put().to(put_thread_thinking))
        .route("/v1/threads/{thread_key}/cancel", web::post().to(post_thread_cancel))
        .route("/v1/threads/{thread_key}/session", web::delete().to(delete_thread_session))
        .route("/v1/threads/{thread_key}/share", web::post().to(post_thread_share));
}

pub async fn run_server(host: &str, port: u16, state: Arc<AppState>) -> std::io::Result<()> {
    info!(%host, port, "http server listening");
    HttpServer::new(move || App::new().app_data(web::Data::new(state.clone())).configure(configure))
        .bind((host, port))?
        .run()
        .await
}

async fn healthz() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({"ok": true}))
}

#[derive(Deserialize)]
struct PostMessageBody {
    source: String,
    thread_key: String,
    user_key: Option<String>,
    text: String,
    delivery_mode: Option<String>,
    idempotency_key: Option<String>,
}

#[derive(Serialize)]
struct RunBody {
    run_id: String,
    status: String,
    output: Option<serde_json::Value>,
    error: Option<String>,
}

async fn post_message(
    state: web::Data<Arc<AppState>>,
    req: actix_web::HttpRequest,
    body: web::Json<PostMessageBody>,
) -> Result<HttpResponse, ApiError> {
    let body = body.into_inner();

    if body.source.is_empty() || body.thread_key.is_empty() || body.text.is_empty() {
        return Err(CoordinatorError::InvalidMessagePayload(
            "source, thread_key, and text are required".to_string(),
        )
        .into());
    }

    let header_key = req
        .headers()
        .get("Idempotency-Key")
        .map(|v| v.to_str().map(|s| s.to_string()))
        .transpose()
        .map_err(|_| CoordinatorError::InvalidIdempotencyKeyHeader("non-UTF-8 header value".to_string()))?;

    let idempotency_key = match (header_key, body.idempotency_key.clone()) {
        (Some(h), Some(b)) if h != b => return Err(CoordinatorError::IdempotencyKeyMismatch.into()),
        (Some(h), _) => Some(h),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    };

    let delivery_mode = match body.delivery_mode.as_deref() {
        None => DeliveryMode::FollowUp,
        Some(raw) => DeliveryMode::parse(raw)
            .ok_or_else(|| CoordinatorError::InvalidMessagePayload(format!("invalid delivery_mode {raw:?}")))?,
    };

    let result = state
        .service
        .ingest_message(IngestMessageParams {
            source: body.source,
            thread_key: ThreadKey::new(body.thread_key),
            user_key: body.user_key,
            text: body.text,
            delivery_mode,
            idempotency_key,
        })
        .await
        .map_err(|e| CoordinatorError::Internal(e.to_string()))?;

    Ok(HttpResponse::Accepted().json(RunBody {
        run_id: result.run.run_id,
        status: result.run.status.as_str().to_string(),
        output: result.run.output,
        error: result.run.error_message,
    }))
}

async fn get_run(state: web::Data<Arc<AppState>>, path: web::Path<String>) -> Result<HttpResponse, ApiError> {
    let run_id = path.into_inner();
    if run_id.is_empty() {
        return Err(CoordinatorError::InvalidRunId(run_id).into());
    }

    let run = state
        .service
        .get_run(&run_id)
        .await
        .map_err(|e| CoordinatorError::Internal(e.to_string()))?
        .ok_or_else(|| CoordinatorError::RunNotFound(run_id.clone()))?;

    Ok(HttpResponse::Ok().json(RunBody {
        run_id: run.run_id,
        status: run.status.as_str().to_string(),
        output: run.output,
        error: run.error_message,
    }))
}

async fn get_auth_providers() -> Result<HttpResponse, ApiError> {
    Err(CoordinatorError::AuthUnavailable.into())
}

fn parse_thread_key(raw: &str) -> Result<ThreadKey, ApiError> {
    if raw.is_empty() {
        return Err(CoordinatorError::InvalidThreadKey(raw.to_string()).into());
    }
    Ok(ThreadKey::new(raw.to_string()))
}

async fn get_thread_runtime(
    state: web::Data<Arc<AppState>>,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let thread_key = parse_thread_key(&path.into_inner())?;
    match state.executor.get_thread_runtime_state(&thread_key).await {
        Some(runtime) => Ok(HttpResponse::Ok().json(runtime)),
        None => Err(CoordinatorError::ThreadControlUnavailable.into()),
    }
}

#[derive(Deserialize)]
struct ModelBody {
    provider: String,
    model_id: String,
}

async fn put_thread_model(
    state: web::Data<Arc<AppState>>,
    path: web::Path<String>,
    body: web::Json<ModelBody>,
) -> Result<HttpResponse, ApiError> {
    let thread_key = parse_thread_key(&path.into_inner())?;
    if body.provider.is_empty() || body.model_id.is_empty() {
        return Err(CoordinatorError::InvalidModelPayload("provider and model_id are required".to_string()).into());
    }
    let runtime = state
        .executor
        .set_thread_model(&thread_key, &body.provider, &body.model_id)
        .await?;
    Ok(HttpResponse::Ok().json(runtime))
}

#[derive(Deserialize)]
struct ThinkingBody {
    thinking_level: String,
}

async fn put_thread_thinking(
    state: web::Data<Arc<AppState>>,
    path: web::Path<String>,
    body: web::Json<ThinkingBody>,
) -> Result<HttpResponse, ApiError> {
    let thread_key = parse_thread_key(&path.into_inner())?;
    if body.thinking_level.is_empty() {
        return Err(CoordinatorError::InvalidThinkingPayload("thinking_level is required".to_string()).into());
    }
    let runtime = state
        .executor
        .set_thread_thinking_level(&thread_key, &body.thinking_level)
        .await
        .map_err(|e| CoordinatorError::ThreadModelError(e.to_string()))?;
    Ok(HttpResponse::Ok().json(runtime))
}

async fn post_thread_cancel(
    state: web::Data<Arc<AppState>>,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let thread_key = parse_thread_key(&path.into_inner())?;
    let cancelled = state.executor.cancel_thread_run(&thread_key).await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "thread_key": thread_key.as_str(),
        "cancelled": cancelled,
    })))
}

async fn delete_thread_session(
    state: web::Data<Arc<AppState>>,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let thread_key = parse_thread_key(&path.into_inner())?;
    state.executor.reset_thread_session(&thread_key).await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "thread_key": thread_key.as_str(),
        "reset": true,
    })))
}

async fn post_thread_share(
    state: web::Data<Arc<AppState>>,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let thread_key = parse_thread_key(&path.into_inner())?;
    let share = state.executor.share_thread_session(&thread_key).await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "thread_key": thread_key.as_str(),
        "gist_url": share.gist_url,
        "share_url": share.share_url,
    })))
}
