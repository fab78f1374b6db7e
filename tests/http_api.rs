//! End-to-end coverage of the HTTP API surface (spec §6.1) against an
//! in-memory store and the `echo` agent runner.

use std::sync::Arc;

use actix_web::{test, web, App};
use async_trait::async_trait;
use jagc_coordinator::http::{self, AppState};
use jagc_coordinator::model::Run;
use jagc_coordinator::scheduler::{InProcessScheduler, RunDispatchHandler};
use jagc_coordinator::{RunService, Store};
use jagc_coordinator::agent::echo::EchoSessionFactory;
use jagc_coordinator::executor::RunExecutor;

#[derive(Default)]
struct RecordingDispatch {
    service: std::sync::OnceLock<Arc<RunService>>,
}

#[async_trait]
impl RunDispatchHandler for RecordingDispatch {
    async fn handle(&self, run: Run) {
        if let Some(service) = self.service.get() {
            let _ = service.execute_run_by_id(&run.run_id).await;
        }
    }
}

fn build_state() -> Arc<AppState> {
    let workspace = tempfile::tempdir().unwrap();
    let store = Arc::new(Store::open(&workspace.path().join("jagc-test.sqlite")).unwrap());
    let executor = Arc::new(RunExecutor::new(
        store.clone(),
        Arc::new(EchoSessionFactory),
        workspace.into_path(),
    ));
    let dispatch_handler = Arc::new(RecordingDispatch::default());
    let scheduler = InProcessScheduler::new(dispatch_handler.clone());
    let service = RunService::new(store, scheduler, executor.clone());
    dispatch_handler.service.set(service.clone()).ok();
    Arc::new(AppState { service, executor })
}

#[actix_web::test]
async fn healthz_reports_ok() {
    let state = build_state();
    let app = test::init_service(
        App::new().app_data(web::Data::new(state)).configure(http::configure),
    )
    .await;

    let req = test::TestRequest::get().uri("/healthz").to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());
}

#[actix_web::test]
async fn post_message_then_get_run_reaches_succeeded() {
    let state = build_state();
    let app = test::init_service(
        App::new().app_data(web::Data::new(state)).configure(http::configure),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/v1/messages")
        .set_json(serde_json::json!({
            "source": "api",
            "thread_key": "api:test-thread",
            "text": "hello from the http api",
        }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success(), "post_message status: {}", resp.status());

    let body: serde_json::Value = test::read_body_json(resp).await;
    let run_id = body["run_id"].as_str().unwrap().to_string();

    let mut status = String::new();
    for _ in 0..20 {
        let req = test::TestRequest::get().uri(&format!("/v1/runs/{run_id}")).to_request();
        let resp = test::call_service(&app, req).await;
        let body: serde_json::Value = test::read_body_json(resp).await;
        status = body["status"].as_str().unwrap_or_default().to_string();
        if status == "succeeded" || status == "failed" {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(25)).await;
    }
    assert_eq!(status, "succeeded");
}

#[actix_web::test]
async fn post_message_rejects_missing_fields() {
    let state = build_state();
    let app = test::init_service(
        App::new().app_data(web::Data::new(state)).configure(http::configure),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/v1/messages")
        .set_json(serde_json::json!({"source": "", "thread_key": "", "text": ""}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_client_error());
}

#[actix_web::test]
async fn get_run_unknown_id_is_404() {
    let state = build_state();
    let app = test::init_service(
        App::new().app_data(web::Data::new(state)).configure(http::configure),
    )
    .await;

    let req = test::TestRequest::get().uri("/v1/runs/does-not-exist").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 404);
}

#[actix_web::test]
async fn thread_model_and_thinking_round_trip() {
    let state = build_state();
    let app = test::init_service(
        App::new().app_data(web::Data::new(state)).configure(http::configure),
    )
    .await;

    let req = test::TestRequest::put()
        .uri("/v1/threads/api:thread-x/model")
        .set_json(serde_json::json!({"provider": "anthropic", "model_id": "claude-opus"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());

    let req = test::TestRequest::put()
        .uri("/v1/threads/api:thread-x/thinking")
        .set_json(serde_json::json!({"thinking_level": "high"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());

    let req = test::TestRequest::get().uri("/v1/threads/api:thread-x/runtime").to_request();
    let resp = test::call_service(&app, req).await;
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["provider"], "anthropic");
    assert_eq!(body["thinkingLevel"].as_str().or(body["thinking_level"].as_str()), Some("high"));
}
