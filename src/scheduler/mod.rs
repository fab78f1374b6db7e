//! Per-thread FIFO run scheduler (spec §4.2).
//!
//! Each `ThreadKey` gets its own lane: an unbounded mpsc channel backing a
//! single worker task, so dispatch order within a thread is preserved while
//! unrelated threads run fully in parallel. Lanes are created lazily and
//! live for the scheduler's lifetime.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, error, info, warn};

use crate::model::{Run, ThreadKey};
use crate::utils::errors::CoordinatorError;

/// A unit of dispatch handed to a thread's worker task.
pub struct Dispatch {
    pub run: Run,
    pub done: oneshot::Sender<()>,
}

/// Handler invoked by a lane's worker for each dispatched run, in order.
#[async_trait]
pub trait RunDispatchHandler: Send + Sync {
    async fn handle(&self, run: Run);
}

/// Per-thread ordering and delivery of runs to a handler.
#[async_trait]
pub trait RunScheduler: Send + Sync {
    /// Enqueues `run` onto its thread's lane. A no-op if `run.run_id` is
    /// already scheduled or in flight — the scheduler dispatches every
    /// distinct run_id it's handed exactly once, in arrival order per thread.
    async fn enqueue(&self, run: Run) -> Result<(), CoordinatorError>;

    /// Like `enqueue`, but reports whether the run was newly scheduled.
    /// Returns `false` without enqueuing if `run.run_id` was already present.
    async fn ensure_enqueued(&self, run: Run) -> Result<bool, CoordinatorError>;

    /// Starts background processing. No-op if already started.
    async fn start(&self);

    /// Stops accepting new work and drains in-flight dispatches before
    /// returning.
    async fn stop(&self);
}

struct Lane {
    sender: mpsc::UnboundedSender<Dispatch>,
}

/// In-process variant: one `tokio::sync::mpsc` lane per thread key, created
/// lazily under a mutex-guarded map.
pub struct InProcessScheduler {
    handler: Arc<dyn RunDispatchHandler>,
    lanes: Mutex<HashMap<ThreadKey, Lane>>,
    in_flight: Arc<Mutex<HashSet<String>>>,
    stopping: Arc<Notify>,
    stopped: std::sync::atomic::AtomicBool,
}

impl InProcessScheduler {
    pub fn new(handler: Arc<dyn RunDispatchHandler>) -> Arc<Self> {
        Arc::new(Self {
            handler,
            lanes: Mutex::new(HashMap::new()),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            stopping: Arc::new(Notify::new()),
            stopped: std::sync::atomic::AtomicBool::new(false),
        })
    }

    fn ensure_lane_erased(&self, thread_key: &ThreadKey) -> mpsc::UnboundedSender<Dispatch> {
        let mut lanes = self.lanes.lock().unwrap();
        if let Some(lane) = lanes.get(thread_key) {
            return lane.sender.clone();
        }

        let (tx, rx) = mpsc::unbounded_channel::<Dispatch>();
        let handler = self.handler.clone();
        let thread_key_owned = thread_key.clone();
        let in_flight = self.in_flight.clone();
        tokio::spawn(Self::run_lane(thread_key_owned, rx, handler, in_flight));
        lanes.insert(
            thread_key.clone(),
            Lane {
                sender: tx.clone(),
            },
        );
        tx
    }

    /// Enqueues `run` unless its run_id is already scheduled or in flight.
    /// Returns whether it was newly inserted.
    async fn try_enqueue(&self, run: Run) -> Result<bool, CoordinatorError> {
        if self.stopped.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(CoordinatorError::SchedulerStopped(run.run_id));
        }
        let newly_inserted = self.in_flight.lock().unwrap().insert(run.run_id.clone());
        if !newly_inserted {
            return Ok(false);
        }

        let thread_key = run.thread_key.clone();
        let run_id = run.run_id.clone();
        let sender = self.ensure_lane_erased(&thread_key);
        let (done_tx, _done_rx) = oneshot::channel();
        sender.send(Dispatch { run, done: done_tx }).map_err(|_| {
            self.in_flight.lock().unwrap().remove(&run_id);
            CoordinatorError::SchedulerStopped(thread_key.to_string())
        })?;
        Ok(true)
    }

    async fn run_lane(
        thread_key: ThreadKey,
        mut rx: mpsc::UnboundedReceiver<Dispatch>,
        handler: Arc<dyn RunDispatchHandler>,
        in_flight: Arc<Mutex<HashSet<String>>>,
    ) {
        debug!(%thread_key, "lane started");
        while let Some(dispatch) = rx.recv().await {
            let run_id = dispatch.run.run_id.clone();
            // A handler panic or error must not stop subsequent dispatches
            // on this lane — isolate each one.
            let handled = std::panic::AssertUnwindSafe(handler.handle(dispatch.run))
                .catch_unwind()
                .await;
            if let Err(panic) = handled {
                error!(%thread_key, run_id, ?panic, "run dispatch panicked");
            }
            in_flight.lock().unwrap().remove(&run_id);
            let _ = dispatch.done.send(());
        }
        debug!(%thread_key, "lane drained and stopped");
    }
}

#[async_trait]
impl RunScheduler for InProcessScheduler {
    async fn enqueue(&self, run: Run) -> Result<(), CoordinatorError> {
        self.try_enqueue(run).await.map(|_| ())
    }

    async fn ensure_enqueued(&self, run: Run) -> Result<bool, CoordinatorError> {
        self.try_enqueue(run).await
    }

    async fn start(&self) {
        info!("run scheduler started");
    }

    async fn stop(&self) {
        self.stopped.store(true, std::sync::atomic::Ordering::SeqCst);
        let lanes = {
            let mut guard = self.lanes.lock().unwrap();
            std::mem::take(&mut *guard)
        };
        for (thread_key, lane) in lanes {
            // Dropping the sender closes the channel; the lane's worker
            // exits once it has drained everything already queued.
            drop(lane.sender);
            warn!(%thread_key, "lane closing for shutdown");
        }
        self.stopping.notify_waiters();
        info!("run scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DeliveryMode;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex as AsyncMutex;

    struct RecordingHandler {
        order: AsyncMutex<Vec<String>>,
        count: AtomicUsize,
    }

    #[async_trait]
    impl RunDispatchHandler for RecordingHandler {
        async fn handle(&self, run: Run) {
            self.count.fetch_add(1, Ordering::SeqCst);
            self.order.lock().await.push(run.run_id);
        }
    }

    fn sample_run(run_id: &str, thread: &str) -> Run {
        Run::new_running(
            run_id.to_string(),
            "cli".to_string(),
            ThreadKey::new(thread),
            None,
            DeliveryMode::FollowUp,
            "hi".to_string(),
            vec![],
        )
    }

    #[tokio::test]
    async fn preserves_per_thread_order() {
        let handler = Arc::new(RecordingHandler {
            order: AsyncMutex::new(Vec::new()),
            count: AtomicUsize::new(0),
        });
        let scheduler = InProcessScheduler::new(handler.clone());
        scheduler.start().await;

        for i in 0..5 {
            scheduler
                .enqueue(sample_run(&format!("run-{i}"), "cli:default"))
                .await
                .unwrap();
        }

        // Give the lane a moment to drain; a notify-on-empty would be more
        // precise but this suffices for a small fixed batch.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let order = handler.order.lock().await;
        assert_eq!(
            *order,
            vec!["run-0", "run-1", "run-2", "run-3", "run-4"]
                .into_iter()
                .map(String::from)
                .collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn enqueue_is_noop_for_already_scheduled_run_id() {
        let handler = Arc::new(RecordingHandler {
            order: AsyncMutex::new(Vec::new()),
            count: AtomicUsize::new(0),
        });
        let scheduler = InProcessScheduler::new(handler.clone());
        scheduler.start().await;

        let run = sample_run("run-dup", "cli:default");
        scheduler.enqueue(run.clone()).await.unwrap();
        scheduler.enqueue(run).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(handler.count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn ensure_enqueued_reports_false_when_already_present() {
        let handler = Arc::new(RecordingHandler {
            order: AsyncMutex::new(Vec::new()),
            count: AtomicUsize::new(0),
        });
        let scheduler = InProcessScheduler::new(handler.clone());
        scheduler.start().await;

        let run = sample_run("run-once", "cli:default");
        assert!(scheduler.ensure_enqueued(run.clone()).await.unwrap());
        assert!(!scheduler.ensure_enqueued(run).await.unwrap());

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(handler.count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn enqueue_after_stop_errors() {
        let handler = Arc::new(RecordingHandler {
            order: AsyncMutex::new(Vec::new()),
            count: AtomicUsize::new(0),
        });
        let scheduler = InProcessScheduler::new(handler);
        scheduler.start().await;
        scheduler.stop().await;
        let result = scheduler.enqueue(sample_run("run-x", "cli:default")).await;
        assert!(result.is_err());
    }
}
