//! Run Executor and Thread Run Controller (spec §4.4) — the subtlest part
//! of the system. The executor owns one agent session per thread, created
//! single-flight; the controller serializes runs onto that session and
//! correlates streamed turns back to the run that triggered them.

mod controller;

pub use controller::ThreadRunController;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use crate::agent::{AgentSessionFactory, ShareResult, ThreadRuntimeState};
use crate::model::{Run, RunOutput, ThreadKey};
use crate::store::Store;
use crate::utils::errors::CoordinatorError;

struct ThreadEntry {
    controller: Arc<ThreadRunController>,
    generation: i64,
}

/// Owns agent sessions and their controllers, keyed by `thread_key`.
/// Session/controller creation is single-flighted through the entry map's
/// mutex: two runs racing for the same never-before-seen thread both await
/// the same creation future.
pub struct RunExecutor {
    store: Arc<Store>,
    session_factory: Arc<dyn AgentSessionFactory>,
    threads: AsyncMutex<HashMap<ThreadKey, ThreadEntry>>,
    workspace_dir: std::path::PathBuf,
}

impl RunExecutor {
    pub fn new(
        store: Arc<Store>,
        session_factory: Arc<dyn AgentSessionFactory>,
        workspace_dir: std::path::PathBuf,
    ) -> Self {
        Self {
            store,
            session_factory,
            threads: AsyncMutex::new(HashMap::new()),
            workspace_dir,
        }
    }

    fn session_file_path(&self, thread_key: &ThreadKey) -> String {
        let safe_name = thread_key.as_str().replace(':', "_");
        self.workspace_dir
            .join(".sessions")
            .join(format!("{safe_name}.json"))
            .to_string_lossy()
            .to_string()
    }

    /// Resolves (creating if absent) the controller for `thread_key`,
    /// returning it alongside the generation captured at creation/lookup
    /// time for the caller's later gated write.
    async fn resolve_controller(
        &self,
        thread_key: &ThreadKey,
    ) -> anyhow::Result<(Arc<ThreadRunController>, i64)> {
        let mut threads = self.threads.lock().await;
        if let Some(entry) = threads.get(thread_key) {
            return Ok((entry.controller.clone(), entry.generation));
        }

        let existing_session = self.store.get_thread_session(thread_key).await?;
        let (generation, stored_path) = match existing_session {
            Some(session) => (session.generation, session.session_file_path),
            None => (self.store.ensure_thread_generation(thread_key).await?, String::new()),
        };
        let session_file_path = if stored_path.is_empty() {
            self.session_file_path(thread_key)
        } else {
            stored_path
        };

        std::fs::create_dir_all(
            std::path::Path::new(&session_file_path)
                .parent()
                .unwrap_or(std::path::Path::new(".")),
        )
        .ok();

        let session = self
            .session_factory
            .create(thread_key.as_str(), &session_file_path)
            .await?;
        let controller = Arc::new(ThreadRunController::new(session));
        controller.spawn_event_loop();

        threads.insert(
            thread_key.clone(),
            ThreadEntry {
                controller: controller.clone(),
                generation,
            },
        );
        info!(%thread_key, "created thread session and controller");
        Ok((controller, generation))
    }

    /// `execute(run)`: resolve the thread's controller, submit, then
    /// persist the session mapping gated on the generation captured before
    /// the run started.
    pub async fn execute(&self, run: &Run) -> anyhow::Result<RunOutput> {
        let (controller, generation) = self.resolve_controller(&run.thread_key).await?;
        let output = controller.submit(run.clone()).await?;

        let session_id = controller.session_id();
        let session_file_path = self.session_file_path(&run.thread_key);
        let persisted = self
            .store
            .upsert_thread_session(&run.thread_key, &session_id, &session_file_path, generation)
            .await?;
        if !persisted {
            warn!(thread_key = %run.thread_key, "thread session write dropped: generation advanced mid-run");
        }

        Ok(output)
    }

    /// Returns `cancelled=true` iff the thread had a session that was
    /// actually streaming or had queued work.
    pub async fn cancel_thread_run(&self, thread_key: &ThreadKey) -> Result<bool, CoordinatorError> {
        let threads = self.threads.lock().await;
        let Some(entry) = threads.get(thread_key) else {
            return Ok(false);
        };
        let had_work = entry.controller.has_pending_work();
        if had_work {
            entry
                .controller
                .abort()
                .await
                .map_err(|e| {
                    CoordinatorError::ThreadRunCancelError(format!(
                        "failed to cancel active run for thread {thread_key}: {e}"
                    ))
                })?;
        }
        Ok(had_work)
    }

    /// Bumps the generation and drops the in-memory session/controller so
    /// the next run starts fresh. The persisted row is kept as a
    /// generation-only tombstone (session_id cleared) rather than deleted,
    /// so a stale write from a run still in flight under the old generation
    /// has a row to be rejected against instead of silently landing.
    pub async fn reset_thread_session(&self, thread_key: &ThreadKey) -> Result<(), CoordinatorError> {
        let new_generation = self
            .store
            .bump_generation(thread_key)
            .await
            .map_err(|e| CoordinatorError::ThreadSessionResetError(e.to_string()))?;

        let mut threads = self.threads.lock().await;
        threads.remove(thread_key);
        drop(threads);

        info!(%thread_key, generation = new_generation, "thread session reset");
        Ok(())
    }

    pub async fn share_thread_session(&self, thread_key: &ThreadKey) -> Result<ShareResult, CoordinatorError> {
        let threads = self.threads.lock().await;
        let entry = threads
            .get(thread_key)
            .ok_or_else(|| CoordinatorError::ThreadSessionShareError("no active session for thread".to_string()))?;
        entry
            .controller
            .share()
            .await
            .map_err(|e| CoordinatorError::ThreadSessionShareError(e.to_string()))
    }

    pub async fn get_thread_runtime_state(&self, thread_key: &ThreadKey) -> Option<ThreadRuntimeState> {
        let threads = self.threads.lock().await;
        threads.get(thread_key).map(|entry| entry.controller.runtime_state())
    }

    pub async fn set_thread_model(
        &self,
        thread_key: &ThreadKey,
        provider: &str,
        model_id: &str,
    ) -> Result<ThreadRuntimeState, CoordinatorError> {
        let (controller, _) = self
            .resolve_controller(thread_key)
            .await
            .map_err(|e| CoordinatorError::ThreadModelError(e.to_string()))?;
        controller
            .set_model(provider, model_id)
            .await
            .map_err(|e| CoordinatorError::ThreadModelError(e.to_string()))?;
        Ok(controller.runtime_state())
    }

    pub async fn set_thread_thinking_level(
        &self,
        thread_key: &ThreadKey,
        level: &str,
    ) -> anyhow::Result<ThreadRuntimeState> {
        let (controller, _) = self.resolve_controller(thread_key).await?;
        controller.set_thinking_level(level).await?;
        Ok(controller.runtime_state())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::echo::EchoSessionFactory;
    use crate::model::{DeliveryMode, Run};

    fn executor() -> RunExecutor {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let workspace = tempfile::tempdir().unwrap();
        RunExecutor::new(store, Arc::new(EchoSessionFactory), workspace.into_path())
    }

    fn sample_run(thread_key: &ThreadKey, text: &str) -> Run {
        Run::new_running(
            uuid::Uuid::new_v4().to_string(),
            "cli".to_string(),
            thread_key.clone(),
            None,
            DeliveryMode::FollowUp,
            text.to_string(),
            Vec::new(),
        )
    }

    #[tokio::test]
    async fn execute_persists_thread_session_on_first_run() {
        let executor = executor();
        let thread_key = ThreadKey::new("cli:test-1");
        let run = sample_run(&thread_key, "hello");

        let output = executor.execute(&run).await.unwrap();
        assert!(output.text.to_uppercase().contains("HELLO"));

        let runtime = executor.get_thread_runtime_state(&thread_key).await;
        assert!(runtime.is_some());
    }

    #[tokio::test]
    async fn reset_thread_session_drops_controller() {
        let executor = executor();
        let thread_key = ThreadKey::new("cli:test-2");
        let run = sample_run(&thread_key, "hi");
        executor.execute(&run).await.unwrap();
        assert!(executor.get_thread_runtime_state(&thread_key).await.is_some());

        executor.reset_thread_session(&thread_key).await.unwrap();
        assert!(executor.get_thread_runtime_state(&thread_key).await.is_none());
    }

    #[tokio::test]
    async fn cancel_on_idle_thread_reports_no_work() {
        let executor = executor();
        let thread_key = ThreadKey::new("cli:test-3");
        let cancelled = executor.cancel_thread_run(&thread_key).await.unwrap();
        assert!(!cancelled);
    }

    #[tokio::test]
    async fn set_thread_model_updates_runtime_state() {
        let executor = executor();
        let thread_key = ThreadKey::new("cli:test-4");
        let runtime = executor
            .set_thread_model(&thread_key, "anthropic", "claude-opus")
            .await
            .unwrap();
        assert_eq!(runtime.provider.as_deref(), Some("anthropic"));
        assert_eq!(runtime.model.as_deref(), Some("claude-opus"));
    }
}
