//! Scheduled Task Engine (spec §4.5): polls due tasks, creates task-runs,
//! ingests them as runs through the Run Service, and records outcomes.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::model::{DeliveryMode, RunStatus, ScheduleKind, ScheduledTask, TaskRunStatus};
use crate::service::{IngestMessageParams, RunService};
use crate::store::Store;

pub struct ScheduledTaskEngine {
    store: Arc<Store>,
    service: Arc<RunService>,
    poll_interval: Duration,
}

impl ScheduledTaskEngine {
    pub fn new(store: Arc<Store>, service: Arc<RunService>, poll_interval: Duration) -> Self {
        Self {
            store,
            service,
            poll_interval,
        }
    }

    /// Runs the poll loop until `shutdown` fires.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(poll_interval_ms = self.poll_interval.as_millis(), "scheduled task engine started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("scheduled task engine shutting down");
                        return;
                    }
                }
            }

            if let Err(e) = self.poll_once().await {
                error!(err = %e, "scheduled task poll failed");
            }
        }
    }

    async fn poll_once(&self) -> anyhow::Result<()> {
        let now = Utc::now();
        let due = self.store.list_due_tasks(now).await?;
        if !due.is_empty() {
            info!(count = due.len(), "found due scheduled tasks");
        }

        for task in due {
            if let Err(e) = self.process_due_task(&task, now).await {
                error!(task_id = %task.task_id, err = %e, "failed to process due task");
            }
        }
        Ok(())
    }

    async fn process_due_task(&self, task: &ScheduledTask, now: DateTime<Utc>) -> anyhow::Result<()> {
        // Catch-up policy: a single coalesced run at `now`, not one per
        // missed occurrence, regardless of how far next_run_at has drifted
        // into the past.
        let scheduled_for = task.next_run_at.unwrap_or(now);
        let idempotency_key = task_idempotency_key(&task.task_id, scheduled_for);

        let (task_run, created) = self
            .store
            .create_or_get_task_run(&task.task_id, scheduled_for, &idempotency_key)
            .await?;

        if created {
            let ingest = self
                .service
                .ingest_message(IngestMessageParams {
                    source: "scheduled".to_string(),
                    thread_key: task.effective_execution_thread(),
                    user_key: task.owner_user_key.clone(),
                    text: task.instructions.clone(),
                    delivery_mode: DeliveryMode::FollowUp,
                    idempotency_key: Some(idempotency_key.clone()),
                })
                .await?;

            self.store
                .attach_task_run_id(&task_run.task_run_id, &ingest.run.run_id)
                .await?;

            self.spawn_outcome_watcher(task.task_id.clone(), task_run.task_run_id.clone(), ingest.run.run_id);
        } else {
            debug!(task_id = %task.task_id, scheduled_for = %scheduled_for, "task run already exists, skipping ingest");
        }

        let next_run_at = advance_next_run(task, now);
        let enabled = next_run_at.is_some();
        self.store
            .update_task_schedule(&task.task_id, enabled, next_run_at)
            .await?;

        Ok(())
    }

    /// Subscribes to the run's progress and records the outcome against the
    /// task once it terminates.
    fn spawn_outcome_watcher(&self, task_id: String, task_run_id: String, run_id: String) {
        let store = self.store.clone();
        let mut progress = self.service.subscribe_run_progress(&run_id);
        tokio::spawn(async move {
            while let Some(event) = progress.recv().await {
                use crate::service::RunProgressEvent;
                match event {
                    RunProgressEvent::Succeeded { .. } => {
                        let now = Utc::now();
                        if let Err(e) = store
                            .finalize_task_run(&task_run_id, TaskRunStatus::Succeeded, None)
                            .await
                        {
                            warn!(task_id, err = %e, "failed to finalize task run");
                        }
                        if let Err(e) = store
                            .record_task_outcome(&task_id, now, RunStatus::Succeeded, None)
                            .await
                        {
                            warn!(task_id, err = %e, "failed to record task outcome");
                        }
                        return;
                    }
                    RunProgressEvent::Failed { error_message, .. } => {
                        let now = Utc::now();
                        if let Err(e) = store
                            .finalize_task_run(&task_run_id, TaskRunStatus::Failed, Some(error_message.clone()))
                            .await
                        {
                            warn!(task_id, err = %e, "failed to finalize task run");
                        }
                        if let Err(e) = store
                            .record_task_outcome(&task_id, now, RunStatus::Failed, Some(error_message))
                            .await
                        {
                            warn!(task_id, err = %e, "failed to record task outcome");
                        }
                        return;
                    }
                    RunProgressEvent::Started { .. } => {}
                }
            }
        });
    }
}

fn task_idempotency_key(task_id: &str, scheduled_for: DateTime<Utc>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(task_id.as_bytes());
    hasher.update(scheduled_for.to_rfc3339().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// `once` disables; `cron` advances to the next matching time >= now+1s in
/// the task's timezone; `rrule` advances to the next occurrence.
fn advance_next_run(task: &ScheduledTask, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match task.schedule_kind {
        ScheduleKind::Once => None,
        ScheduleKind::Cron => {
            let expr = task.cron_expr.as_deref()?;
            let schedule = match cron::Schedule::from_str(expr) {
                Ok(s) => s,
                Err(e) => {
                    error!(task_id = %task.task_id, err = %e, "invalid cron expression");
                    return None;
                }
            };
            let tz: chrono_tz::Tz = task.timezone.parse().unwrap_or(chrono_tz::Tz::UTC);
            let floor = (now + chrono::Duration::seconds(1)).with_timezone(&tz);
            schedule.after(&floor).next().map(|dt| dt.with_timezone(&Utc))
        }
        ScheduleKind::Rrule => {
            let expr = task.rrule_expr.as_deref()?;
            next_rrule_occurrence(expr, &task.timezone, now)
        }
    }
}

fn next_rrule_occurrence(expr: &str, timezone: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    use rrule::RRuleSet;

    let rrule_set: RRuleSet = match expr.parse() {
        Ok(set) => set,
        Err(e) => {
            error!(err = %e, expr, "invalid rrule expression");
            return None;
        }
    };
    let tz: rrule::Tz = timezone.parse().unwrap_or(rrule::Tz::UTC);
    let after = now.with_timezone(&tz);
    let result = rrule_set.after(after).all(1);
    result
        .dates
        .into_iter()
        .next()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DeliveryTarget, ThreadKey};

    fn sample_task(kind: ScheduleKind) -> ScheduledTask {
        ScheduledTask {
            task_id: "task-1".to_string(),
            title: "t".to_string(),
            instructions: "do it".to_string(),
            schedule_kind: kind,
            once_at: None,
            cron_expr: Some("0 0 * * * *".to_string()),
            rrule_expr: Some("DTSTART:20260101T000000Z\nRRULE:FREQ=DAILY".to_string()),
            timezone: "UTC".to_string(),
            enabled: true,
            next_run_at: Some(Utc::now()),
            creator_thread_key: ThreadKey::cli_default(),
            owner_user_key: None,
            delivery_target: DeliveryTarget {
                provider: "cli".to_string(),
                route: "default".to_string(),
                metadata: serde_json::json!({}),
            },
            execution_thread_key: None,
            last_run_at: None,
            last_run_status: None,
            last_error_message: None,
        }
    }

    #[test]
    fn once_task_disables() {
        let task = sample_task(ScheduleKind::Once);
        assert!(advance_next_run(&task, Utc::now()).is_none());
    }

    #[test]
    fn cron_task_advances() {
        let task = sample_task(ScheduleKind::Cron);
        let next = advance_next_run(&task, Utc::now());
        assert!(next.is_some());
        assert!(next.unwrap() > Utc::now());
    }

    #[test]
    fn idempotency_key_is_stable() {
        let t = Utc::now();
        let a = task_idempotency_key("task-1", t);
        let b = task_idempotency_key("task-1", t);
        assert_eq!(a, b);
    }
}
