//! Telegram Background Run Registry (spec §4.6).
//!
//! Tracks one background delivery task per in-flight run, keyed by `run_id`,
//! plus a `thread_key -> set<run_id>` index so a thread-level action
//! (`/cancel`, session reset) can abort every handle for that thread.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::model::ThreadKey;

struct RunHandle {
    thread_key: ThreadKey,
    abort_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

#[derive(Default)]
pub struct BackgroundRunRegistry {
    handles: Mutex<HashMap<String, RunHandle>>,
    by_thread: Mutex<HashMap<ThreadKey, HashSet<String>>>,
}

impl BackgroundRunRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Spawns `start(abort_signal)` as a tracked background task. The task
    /// is expected to select on the signal and return once it observes
    /// `true`, or once it finishes its own work. Deregisters itself on
    /// completion either way.
    pub fn register<F, Fut>(self: &Arc<Self>, run_id: String, thread_key: ThreadKey, start: F)
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (abort_tx, abort_rx) = watch::channel(false);
        let fut = start(abort_rx);

        let registry = self.clone();
        let run_id_for_task = run_id.clone();
        let thread_key_for_task = thread_key.clone();
        let join = tokio::spawn(async move {
            fut.await;
            registry.deregister(&run_id_for_task, &thread_key_for_task);
        });

        self.handles.lock().unwrap().insert(
            run_id.clone(),
            RunHandle {
                thread_key: thread_key.clone(),
                abort_tx,
                join,
            },
        );
        self.by_thread
            .lock()
            .unwrap()
            .entry(thread_key)
            .or_default()
            .insert(run_id);
    }

    fn deregister(&self, run_id: &str, thread_key: &ThreadKey) {
        self.handles.lock().unwrap().remove(run_id);
        if let Some(set) = self.by_thread.lock().unwrap().get_mut(thread_key) {
            set.remove(run_id);
        }
    }

    /// Signals every handle registered for `thread_key` to abort. Does not
    /// wait for them to actually stop.
    pub fn abort_thread(&self, thread_key: &ThreadKey) {
        let run_ids: Vec<String> = self
            .by_thread
            .lock()
            .unwrap()
            .get(thread_key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();

        let handles = self.handles.lock().unwrap();
        for run_id in run_ids {
            if let Some(handle) = handles.get(&run_id) {
                let _ = handle.abort_tx.send(true);
            }
        }
    }

    /// Signals every tracked handle and awaits settlement of all of them.
    pub async fn abort_all_and_wait(&self) {
        let joins: Vec<JoinHandle<()>> = {
            let mut handles = self.handles.lock().unwrap();
            for handle in handles.values() {
                let _ = handle.abort_tx.send(true);
            }
            handles.drain().map(|(_, h)| h.join).collect()
        };
        self.by_thread.lock().unwrap().clear();

        for join in joins {
            if let Err(e) = join.await {
                if !e.is_cancelled() {
                    warn!(err = %e, "background run task panicked during shutdown");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn abort_thread_signals_its_runs_only() {
        let registry = BackgroundRunRegistry::new();
        let thread_a = ThreadKey::new("telegram:chat:1");
        let thread_b = ThreadKey::new("telegram:chat:2");

        let a_aborted = Arc::new(AtomicBool::new(false));
        let b_aborted = Arc::new(AtomicBool::new(false));

        {
            let a_aborted = a_aborted.clone();
            registry.register("run-a".to_string(), thread_a.clone(), move |mut abort_rx| async move {
                let _ = abort_rx.changed().await;
                a_aborted.store(*abort_rx.borrow(), Ordering::SeqCst);
            });
        }
        {
            let b_aborted = b_aborted.clone();
            registry.register("run-b".to_string(), thread_b.clone(), move |mut abort_rx| async move {
                let _ = tokio::time::timeout(std::time::Duration::from_millis(100), abort_rx.changed()).await;
                b_aborted.store(*abort_rx.borrow(), Ordering::SeqCst);
            });
        }

        registry.abort_thread(&thread_a);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        assert!(a_aborted.load(Ordering::SeqCst));
        assert!(!b_aborted.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn abort_all_and_wait_settles_every_handle() {
        let registry = BackgroundRunRegistry::new();
        let thread = ThreadKey::new("telegram:chat:3");
        let completed = Arc::new(AtomicBool::new(false));

        {
            let completed = completed.clone();
            registry.register("run-x".to_string(), thread, move |mut abort_rx| async move {
                let _ = abort_rx.changed().await;
                completed.store(true, Ordering::SeqCst);
            });
        }

        registry.abort_all_and_wait().await;
        assert!(completed.load(Ordering::SeqCst));
    }
}
