//! Run Service (spec §4.3): orchestrates ingest -> persist -> enqueue, and
//! drives execution with progress fan-out.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::executor::RunExecutor;
use crate::model::{DeliveryMode, Run, RunStatus, ThreadKey};
use crate::scheduler::{RunDispatchHandler, RunScheduler};
use crate::store::Store;
use async_trait::async_trait;

/// A progress event broadcast to `subscribeRunProgress` listeners.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunProgressEvent {
    Started { run_id: String },
    Succeeded { run_id: String, output: serde_json::Value },
    Failed { run_id: String, error_message: String },
}

impl RunProgressEvent {
    pub fn run_id(&self) -> &str {
        match self {
            RunProgressEvent::Started { run_id }
            | RunProgressEvent::Succeeded { run_id, .. }
            | RunProgressEvent::Failed { run_id, .. } => run_id,
        }
    }
}

pub struct IngestMessageParams {
    pub source: String,
    pub thread_key: ThreadKey,
    pub user_key: Option<String>,
    pub text: String,
    pub delivery_mode: DeliveryMode,
    pub idempotency_key: Option<String>,
}

pub struct IngestResult {
    pub run: Run,
    pub deduplicated: bool,
}

/// Orchestrates the full lifecycle of a run from ingestion through
/// execution, and fans out progress events to in-process subscribers.
pub struct RunService {
    store: Arc<Store>,
    scheduler: Arc<dyn RunScheduler>,
    executor: Arc<RunExecutor>,
    subscribers: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<RunProgressEvent>>>>,
}

impl RunService {
    pub fn new(store: Arc<Store>, scheduler: Arc<dyn RunScheduler>, executor: Arc<RunExecutor>) -> Arc<Self> {
        Arc::new(Self {
            store,
            scheduler,
            executor,
            subscribers: Mutex::new(HashMap::new()),
        })
    }

    pub async fn ingest_message(&self, params: IngestMessageParams) -> anyhow::Result<IngestResult> {
        let IngestMessageParams {
            source,
            thread_key,
            user_key,
            text,
            delivery_mode,
            idempotency_key,
        } = params;

        let idempotency_key = idempotency_key.unwrap_or_else(|| Uuid::new_v4().to_string());
        let thread_key_for_run = thread_key.clone();
        let user_key_for_run = user_key.clone();
        let source_for_run = source.clone();

        let (run, deduplicated) = self
            .store
            .ingest_message(&source, &idempotency_key, move || {
                Run::new_running(
                    Uuid::new_v4().to_string(),
                    source_for_run,
                    thread_key_for_run,
                    user_key_for_run,
                    delivery_mode,
                    text,
                    Vec::new(),
                )
            })
            .await?;

        if deduplicated {
            return Ok(IngestResult { run, deduplicated });
        }

        let mut run = run;
        if let Some(user_key) = user_key.as_deref() {
            let images = self.store.drain_pending_images(&thread_key, user_key).await?;
            if !images.is_empty() {
                run.images = images;
            }
        }

        self.scheduler.enqueue(run.clone()).await?;
        Ok(IngestResult { run, deduplicated: false })
    }

    /// Loads the run; no-op if already terminal (the enqueue-idempotency
    /// backstop). Never propagates executor failures — they become a
    /// `failed` run instead.
    pub async fn execute_run_by_id(&self, run_id: &str) -> anyhow::Result<()> {
        let Some(run) = self.store.get_run(run_id).await? else {
            warn!(run_id, "execute_run_by_id: run not found");
            return Ok(());
        };
        if run.status.is_terminal() {
            return Ok(());
        }

        self.publish(RunProgressEvent::Started {
            run_id: run.run_id.clone(),
        });

        match self.executor.execute(&run).await {
            Ok(output) => {
                let output_json = serde_json::to_value(&output)?;
                self.store
                    .finalize_run(&run.run_id, RunStatus::Succeeded, Some(output_json.clone()), None)
                    .await?;
                self.publish(RunProgressEvent::Succeeded {
                    run_id: run.run_id.clone(),
                    output: output_json,
                });
            }
            Err(e) => {
                let message = truncate_for_chat(&e.to_string());
                error!(run_id = %run.run_id, err = %e, "run execution failed");
                self.store
                    .finalize_run(&run.run_id, RunStatus::Failed, None, Some(message.clone()))
                    .await?;
                self.publish(RunProgressEvent::Failed {
                    run_id: run.run_id.clone(),
                    error_message: message,
                });
            }
        }

        self.subscribers.lock().unwrap().remove(run_id);
        Ok(())
    }

    /// Process-local fan-out: returns a receiver and an opaque unsubscribe
    /// token (drop the receiver to unsubscribe).
    pub fn subscribe_run_progress(&self, run_id: &str) -> mpsc::UnboundedReceiver<RunProgressEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap()
            .entry(run_id.to_string())
            .or_default()
            .push(tx);
        rx
    }

    fn publish(&self, event: RunProgressEvent) {
        let mut subs = self.subscribers.lock().unwrap();
        if let Some(list) = subs.get_mut(event.run_id()) {
            list.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }

    pub async fn get_run(&self, run_id: &str) -> anyhow::Result<Option<Run>> {
        self.store.get_run(run_id).await
    }

    pub async fn shutdown(&self) {
        self.scheduler.stop().await;
        info!("run service shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::echo::EchoSessionFactory;
    use crate::executor::RunExecutor;

    fn build() -> (Arc<RunService>, Arc<Store>) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let workspace = tempfile::tempdir().unwrap();
        let executor = Arc::new(RunExecutor::new(
            store.clone(),
            Arc::new(EchoSessionFactory),
            workspace.into_path(),
        ));
        let dispatch_handler = Arc::new(RecordingDispatch::default());
        let scheduler = crate::scheduler::InProcessScheduler::new(dispatch_handler.clone());
        let service = RunService::new(store.clone(), scheduler, executor);
        dispatch_handler.service.set(service.clone()).ok();
        (service, store)
    }

    #[derive(Default)]
    struct RecordingDispatch {
        service: std::sync::OnceLock<Arc<RunService>>,
    }

    #[async_trait]
    impl crate::scheduler::RunDispatchHandler for RecordingDispatch {
        async fn handle(&self, run: Run) {
            if let Some(service) = self.service.get() {
                let _ = service.execute_run_by_id(&run.run_id).await;
            }
        }
    }

    #[tokio::test]
    async fn ingest_and_execute_round_trip() {
        let (service, _store) = build();
        let result = service
            .ingest_message(IngestMessageParams {
                source: "cli".to_string(),
                thread_key: ThreadKey::new("cli:default"),
                user_key: None,
                text: "hello there".to_string(),
                delivery_mode: DeliveryMode::FollowUp,
                idempotency_key: Some("key-1".to_string()),
            })
            .await
            .unwrap();
        assert!(!result.deduplicated);

        let mut progress = service.subscribe_run_progress(&result.run.run_id);
        let mut saw_succeeded = false;
        for _ in 0..10 {
            match tokio::time::timeout(std::time::Duration::from_millis(500), progress.recv()).await {
                Ok(Some(RunProgressEvent::Succeeded { .. })) => {
                    saw_succeeded = true;
                    break;
                }
                Ok(Some(_)) => continue,
                _ => break,
            }
        }
        assert!(saw_succeeded, "expected the run to reach Succeeded");
    }

    #[tokio::test]
    async fn duplicate_idempotency_key_is_deduplicated() {
        let (service, _store) = build();
        let params = |key: &str| IngestMessageParams {
            source: "cli".to_string(),
            thread_key: ThreadKey::new("cli:default"),
            user_key: None,
            text: "hi".to_string(),
            delivery_mode: DeliveryMode::FollowUp,
            idempotency_key: Some(key.to_string()),
        };

        let first = service.ingest_message(params("dup-key")).await.unwrap();
        assert!(!first.deduplicated);
        let second = service.ingest_message(params("dup-key")).await.unwrap();
        assert!(second.deduplicated);
        assert_eq!(first.run.run_id, second.run.run_id);
    }
}

fn truncate_for_chat(message: &str) -> String {
    const LIMIT: usize = 180;
    if message.chars().count() <= LIMIT {
        message.to_string()
    } else {
        message.chars().take(LIMIT).collect()
    }
}

/// Bridges the scheduler's dispatch callback to `execute_run_by_id`,
/// isolating handler failures per spec §4.2 guarantee 4.
pub struct ServiceDispatchHandler {
    pub service: Arc<RunService>,
}

#[async_trait]
impl RunDispatchHandler for ServiceDispatchHandler {
    async fn handle(&self, run: Run) {
        if let Err(e) = self.service.execute_run_by_id(&run.run_id).await {
            error!(run_id = %run.run_id, err = %e, "dispatch handler failed to execute run");
        }
    }
}
