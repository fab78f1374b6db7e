mod migrations;

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::model::{
    DeliveryMode, DeliveryTarget, Run, RunImage, RunStatus, ScheduleKind, ScheduledTask,
    ScheduledTaskRun, TaskRunStatus, ThreadKey, ThreadSession,
};

/// Durable persistence of runs, thread->session mappings, message-ingest
/// dedup, scheduled tasks, and pending image buffers (spec §4.1).
///
/// Connections aren't `Send` across await points in rusqlite's synchronous
/// API, so every operation hands the connection to `spawn_blocking` rather
/// than holding the lock across an `.await` — mirroring the teacher's
/// `ConnectionPool`, minus the pool (a single mutex-guarded connection is
/// enough; WAL mode lets readers and the writer coexist, and our write
/// volume is one run/message at a time).
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

/// Result of `buffer_telegram_images`: how many images were newly inserted
/// (0 means the `telegram_update_id` was already seen) and their total size.
#[derive(Debug, Clone, Copy, Default)]
pub struct BufferResult {
    pub inserted_count: usize,
    pub total_bytes: u64,
}

const DEDUP_CONSTRAINT: &str = "telegram_update_dedup";

impl Store {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(path, flags)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.apply_migrations()?;
        Ok(store)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.apply_migrations()?;
        Ok(store)
    }

    fn apply_migrations(&self) -> anyhow::Result<()> {
        let mut conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version    INTEGER PRIMARY KEY,
                name       TEXT NOT NULL,
                applied_at TEXT NOT NULL
            );",
        )?;

        for migration in migrations::MIGRATIONS {
            let already_applied: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM schema_migrations WHERE version = ?1)",
                params![migration.version],
                |row| row.get(0),
            )?;
            if already_applied {
                debug!(migration = migration.name, "migration already applied");
                continue;
            }

            let tx = conn.transaction()?;
            tx.execute_batch(migration.sql)?;
            // INSERT OR IGNORE: two processes racing to apply the same
            // migration both succeed, only one row survives.
            tx.execute(
                "INSERT OR IGNORE INTO schema_migrations (version, name, applied_at) VALUES (?1, ?2, ?3)",
                params![migration.version, migration.name, Utc::now().to_rfc3339()],
            )?;
            tx.commit()?;
            info!(migration = migration.name, "applied migration");
        }

        Ok(())
    }

    async fn with_conn<T, F>(&self, f: F) -> anyhow::Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            f(&conn)
        })
        .await?
        .map_err(Into::into)
    }

    // ---------------------------------------------------------------
    // Runs
    // ---------------------------------------------------------------

    pub async fn insert_run(&self, run: Run) -> anyhow::Result<Run> {
        self.with_conn(move |conn| {
            insert_run_row(conn, &run)?;
            Ok(run)
        })
        .await
    }

    pub async fn finalize_run(
        &self,
        run_id: &str,
        status: RunStatus,
        output: Option<serde_json::Value>,
        error_message: Option<String>,
    ) -> anyhow::Result<()> {
        let run_id = run_id.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE runs SET status = ?1, output = ?2, error_message = ?3, updated_at = ?4 WHERE run_id = ?5",
                params![
                    status.as_str(),
                    output.map(|v| v.to_string()),
                    error_message,
                    Utc::now().to_rfc3339(),
                    run_id,
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_run(&self, run_id: &str) -> anyhow::Result<Option<Run>> {
        let run_id = run_id.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT run_id, source, thread_key, user_key, delivery_mode, status, input_text,
                        images, output, error_message, created_at, updated_at
                 FROM runs WHERE run_id = ?1",
                params![run_id],
                row_to_run,
            )
            .optional()
        })
        .await
    }

    /// Atomically looks up `(source, idempotency_key)`; if present, returns
    /// its run. Otherwise builds a new run via `run_factory` and inserts it
    /// alongside a new ingest row in the same transaction.
    pub async fn ingest_message<F>(
        &self,
        source: &str,
        idempotency_key: &str,
        run_factory: F,
    ) -> anyhow::Result<(Run, bool)>
    where
        F: FnOnce() -> Run + Send + 'static,
    {
        let source = source.to_string();
        let idempotency_key = idempotency_key.to_string();
        self.with_conn(move |conn| {
            if let Some(existing_run_id) = conn
                .query_row(
                    "SELECT run_id FROM message_ingest WHERE source = ?1 AND idempotency_key = ?2",
                    params![source, idempotency_key],
                    |row| row.get::<_, String>(0),
                )
                .optional()?
            {
                let run = conn.query_row(
                    "SELECT run_id, source, thread_key, user_key, delivery_mode, status, input_text,
                            images, output, error_message, created_at, updated_at
                     FROM runs WHERE run_id = ?1",
                    params![existing_run_id],
                    row_to_run,
                )?;
                return Ok((run, true));
            }

            let run = run_factory();
            let tx = conn.unchecked_transaction()?;
            insert_run_row(&tx, &run)?;
            tx.execute(
                "INSERT INTO message_ingest (source, idempotency_key, run_id, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![source, idempotency_key, run.run_id, Utc::now().to_rfc3339()],
            )?;
            tx.commit()?;
            Ok((run, false))
        })
        .await
    }

    // ---------------------------------------------------------------
    // Thread sessions
    // ---------------------------------------------------------------

    pub async fn get_thread_session(
        &self,
        thread_key: &ThreadKey,
    ) -> anyhow::Result<Option<ThreadSession>> {
        let key = thread_key.as_str().to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT thread_key, session_id, session_file_path, generation
                 FROM thread_sessions WHERE thread_key = ?1",
                params![key],
                |row| {
                    Ok(ThreadSession {
                        thread_key: ThreadKey::new(row.get::<_, String>(0)?),
                        session_id: row.get(1)?,
                        session_file_path: row.get(2)?,
                        generation: row.get(3)?,
                    })
                },
            )
            .optional()
        })
        .await
    }

    /// Ensures a `thread_sessions` row exists for `thread_key`, inserting a
    /// fresh generation-0 tombstone (no session yet) if one isn't already
    /// there. Returns the row's current generation either way. Callers that
    /// are about to capture a generation for a later `upsert_thread_session`
    /// must go through here first — `upsert_thread_session` never creates a
    /// row itself.
    pub async fn ensure_thread_generation(&self, thread_key: &ThreadKey) -> anyhow::Result<i64> {
        let key = thread_key.as_str().to_string();
        self.with_conn(move |conn| {
            let current: Option<i64> = conn
                .query_row(
                    "SELECT generation FROM thread_sessions WHERE thread_key = ?1",
                    params![key],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(generation) = current {
                return Ok(generation);
            }
            conn.execute(
                "INSERT INTO thread_sessions (thread_key, session_id, session_file_path, generation, updated_at)
                 VALUES (?1, '', '', 0, ?2)",
                params![key, Utc::now().to_rfc3339()],
            )?;
            Ok(0)
        })
        .await
    }

    /// No-op (returns `false`) if no row exists for `thread_key`, or if the
    /// row's `generation` doesn't match `expected_generation` exactly — the
    /// stale-write protection required by spec §3. A reset bumps the
    /// generation and leaves the row in place as a tombstone precisely so
    /// this check always has something to compare against; "no row" is
    /// never treated as "ok to write".
    pub async fn upsert_thread_session(
        &self,
        thread_key: &ThreadKey,
        session_id: &str,
        session_file_path: &str,
        expected_generation: i64,
    ) -> anyhow::Result<bool> {
        let key = thread_key.as_str().to_string();
        let session_id = session_id.to_string();
        let session_file_path = session_file_path.to_string();
        self.with_conn(move |conn| {
            let current_generation: Option<i64> = conn
                .query_row(
                    "SELECT generation FROM thread_sessions WHERE thread_key = ?1",
                    params![key],
                    |row| row.get(0),
                )
                .optional()?;

            if current_generation != Some(expected_generation) {
                return Ok(false);
            }

            conn.execute(
                "UPDATE thread_sessions
                 SET session_id = ?2, session_file_path = ?3, updated_at = ?4
                 WHERE thread_key = ?1",
                params![key, session_id, session_file_path, Utc::now().to_rfc3339()],
            )?;
            Ok(true)
        })
        .await
    }

    /// Bumps the thread's generation, invalidating in-flight writes from
    /// runs started before the reset, and clears the session identity —
    /// but keeps the row itself as a generation-only tombstone so a stale
    /// write afterwards still has a row to be rejected against. Returns the
    /// new generation.
    pub async fn bump_generation(&self, thread_key: &ThreadKey) -> anyhow::Result<i64> {
        let key = thread_key.as_str().to_string();
        self.with_conn(move |conn| {
            let current: Option<i64> = conn
                .query_row(
                    "SELECT generation FROM thread_sessions WHERE thread_key = ?1",
                    params![key],
                    |row| row.get(0),
                )
                .optional()?;
            let next = current.unwrap_or(0) + 1;
            conn.execute(
                "INSERT INTO thread_sessions (thread_key, session_id, session_file_path, generation, updated_at)
                 VALUES (?1, '', '', ?2, ?3)
                 ON CONFLICT(thread_key) DO UPDATE SET
                    session_id = '',
                    session_file_path = '',
                    generation = excluded.generation,
                    updated_at = excluded.updated_at",
                params![key, next, Utc::now().to_rfc3339()],
            )?;
            Ok(next)
        })
        .await
    }

    // ---------------------------------------------------------------
    // Pending Telegram image buffer
    // ---------------------------------------------------------------

    pub async fn buffer_telegram_images(
        &self,
        thread_key: &ThreadKey,
        user_key: &str,
        update_id: i64,
        media_group_id: Option<&str>,
        images: Vec<RunImage>,
    ) -> anyhow::Result<BufferResult> {
        let key = thread_key.as_str().to_string();
        let user_key = user_key.to_string();
        let media_group_id = media_group_id.map(|s| s.to_string());
        self.with_conn(move |conn| {
            let tx = conn.unchecked_transaction()?;
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO pending_image_batches (update_id, thread_key, user_key, media_group_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![update_id, key, user_key, media_group_id, Utc::now().to_rfc3339()],
            )?;

            if inserted == 0 {
                warn!(constraint = DEDUP_CONSTRAINT, update_id, "duplicate telegram update ignored");
                tx.commit()?;
                return Ok(BufferResult::default());
            }

            let mut total_bytes = 0u64;
            for (ordinal, image) in images.iter().enumerate() {
                tx.execute(
                    "INSERT INTO pending_images (update_id, ordinal, mime_type, bytes, filename)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![update_id, ordinal as i64, image.mime_type, image.bytes, image.filename],
                )?;
                total_bytes += image.bytes.len() as u64;
            }
            tx.commit()?;

            Ok(BufferResult {
                inserted_count: images.len(),
                total_bytes,
            })
        })
        .await
    }

    /// Returns and deletes all buffered images for `(thread_key, user_key)`,
    /// ordered by update then ordinal, atomically.
    pub async fn drain_pending_images(
        &self,
        thread_key: &ThreadKey,
        user_key: &str,
    ) -> anyhow::Result<Vec<RunImage>> {
        let key = thread_key.as_str().to_string();
        let user_key = user_key.to_string();
        self.with_conn(move |conn| {
            let tx = conn.unchecked_transaction()?;
            let update_ids: Vec<i64> = {
                let mut stmt = tx.prepare(
                    "SELECT update_id FROM pending_image_batches WHERE thread_key = ?1 AND user_key = ?2",
                )?;
                let rows = stmt.query_map(params![key, user_key], |row| row.get(0))?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            };

            let mut images = Vec::new();
            for update_id in &update_ids {
                let mut stmt = tx.prepare(
                    "SELECT mime_type, bytes, filename FROM pending_images
                     WHERE update_id = ?1 ORDER BY ordinal ASC",
                )?;
                let rows = stmt.query_map(params![update_id], |row| {
                    Ok(RunImage {
                        mime_type: row.get(0)?,
                        bytes: row.get(1)?,
                        filename: row.get(2)?,
                    })
                })?;
                for row in rows {
                    images.push(row?);
                }
            }

            tx.execute(
                "DELETE FROM pending_image_batches WHERE thread_key = ?1 AND user_key = ?2",
                params![key, user_key],
            )?;
            tx.commit()?;
            Ok(images)
        })
        .await
    }

    // ---------------------------------------------------------------
    // Scheduled tasks
    // ---------------------------------------------------------------

    pub async fn insert_scheduled_task(&self, task: ScheduledTask) -> anyhow::Result<ScheduledTask> {
        self.with_conn(move |conn| {
            insert_task_row(conn, &task)?;
            Ok(task)
        })
        .await
    }

    pub async fn get_scheduled_task(&self, task_id: &str) -> anyhow::Result<Option<ScheduledTask>> {
        let task_id = task_id.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT task_id, title, instructions, schedule_kind, once_at, cron_expr, rrule_expr,
                        timezone, enabled, next_run_at, creator_thread_key, owner_user_key,
                        delivery_target_provider, delivery_target_route, delivery_target_metadata,
                        execution_thread_key, last_run_at, last_run_status, last_error_message
                 FROM scheduled_tasks WHERE task_id = ?1",
                params![task_id],
                row_to_task,
            )
            .optional()
        })
        .await
    }

    /// Enabled tasks with `next_run_at <= now`, tie-broken by ascending
    /// `task_id` (spec §4.5).
    pub async fn list_due_tasks(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<ScheduledTask>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT task_id, title, instructions, schedule_kind, once_at, cron_expr, rrule_expr,
                        timezone, enabled, next_run_at, creator_thread_key, owner_user_key,
                        delivery_target_provider, delivery_target_route, delivery_target_metadata,
                        execution_thread_key, last_run_at, last_run_status, last_error_message
                 FROM scheduled_tasks
                 WHERE enabled = 1 AND next_run_at IS NOT NULL AND next_run_at <= ?1
                 ORDER BY task_id ASC",
            )?;
            let rows = stmt.query_map(params![now.to_rfc3339()], row_to_task)?;
            rows.collect()
        })
        .await
    }

    pub async fn update_task_schedule(
        &self,
        task_id: &str,
        enabled: bool,
        next_run_at: Option<DateTime<Utc>>,
    ) -> anyhow::Result<()> {
        let task_id = task_id.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE scheduled_tasks SET enabled = ?1, next_run_at = ?2 WHERE task_id = ?3",
                params![enabled as i64, next_run_at.map(|t| t.to_rfc3339()), task_id],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn record_task_outcome(
        &self,
        task_id: &str,
        last_run_at: DateTime<Utc>,
        last_run_status: RunStatus,
        last_error_message: Option<String>,
    ) -> anyhow::Result<()> {
        let task_id = task_id.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE scheduled_tasks SET last_run_at = ?1, last_run_status = ?2, last_error_message = ?3 WHERE task_id = ?4",
                params![last_run_at.to_rfc3339(), last_run_status.as_str(), last_error_message, task_id],
            )?;
            Ok(())
        })
        .await
    }

    /// `UNIQUE(task_id, scheduled_for)` and `UNIQUE(idempotency_key)` provide
    /// exactly-once-per-occurrence creation; returns the row and whether it
    /// was newly created.
    pub async fn create_or_get_task_run(
        &self,
        task_id: &str,
        scheduled_for: DateTime<Utc>,
        idempotency_key: &str,
    ) -> anyhow::Result<(ScheduledTaskRun, bool)> {
        let task_id = task_id.to_string();
        let idempotency_key = idempotency_key.to_string();
        self.with_conn(move |conn| {
            if let Some(existing) = conn
                .query_row(
                    "SELECT task_run_id, task_id, scheduled_for, idempotency_key, run_id, status, error_message
                     FROM scheduled_task_runs WHERE task_id = ?1 AND scheduled_for = ?2",
                    params![task_id, scheduled_for.to_rfc3339()],
                    row_to_task_run,
                )
                .optional()?
            {
                return Ok((existing, false));
            }

            let task_run_id = Uuid::new_v4().to_string();
            conn.execute(
                "INSERT INTO scheduled_task_runs (task_run_id, task_id, scheduled_for, idempotency_key, run_id, status, error_message)
                 VALUES (?1, ?2, ?3, ?4, NULL, ?5, NULL)",
                params![task_run_id, task_id, scheduled_for.to_rfc3339(), idempotency_key, TaskRunStatus::Pending.as_str()],
            )?;
            Ok((
                ScheduledTaskRun {
                    task_run_id,
                    task_id,
                    scheduled_for,
                    idempotency_key,
                    run_id: None,
                    status: TaskRunStatus::Pending,
                    error_message: None,
                },
                true,
            ))
        })
        .await
    }

    pub async fn attach_task_run_id(&self, task_run_id: &str, run_id: &str) -> anyhow::Result<()> {
        let task_run_id = task_run_id.to_string();
        let run_id = run_id.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE scheduled_task_runs SET run_id = ?1 WHERE task_run_id = ?2",
                params![run_id, task_run_id],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn finalize_task_run(
        &self,
        task_run_id: &str,
        status: TaskRunStatus,
        error_message: Option<String>,
    ) -> anyhow::Result<()> {
        let task_run_id = task_run_id.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE scheduled_task_runs SET status = ?1, error_message = ?2 WHERE task_run_id = ?3",
                params![status.as_str(), error_message, task_run_id],
            )?;
            Ok(())
        })
        .await
    }
}

fn insert_run_row(conn: &Connection, run: &Run) -> rusqlite::Result<()> {
    let images_json = serde_json::to_string(&run.images).unwrap_or_else(|_| "[]".to_string());
    conn.execute(
        "INSERT INTO runs (run_id, source, thread_key, user_key, delivery_mode, status, input_text,
                           images, output, error_message, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            run.run_id,
            run.source,
            run.thread_key.as_str(),
            run.user_key,
            run.delivery_mode.as_str(),
            run.status.as_str(),
            run.input_text,
            images_json,
            run.output.as_ref().map(|v| v.to_string()),
            run.error_message,
            run.created_at.to_rfc3339(),
            run.updated_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

fn row_to_run(row: &rusqlite::Row) -> rusqlite::Result<Run> {
    let delivery_mode_raw: String = row.get(4)?;
    let status_raw: String = row.get(5)?;
    let images_raw: String = row.get(7)?;
    let output_raw: Option<String> = row.get(8)?;
    let created_raw: String = row.get(10)?;
    let updated_raw: String = row.get(11)?;

    Ok(Run {
        run_id: row.get(0)?,
        source: row.get(1)?,
        thread_key: ThreadKey::new(row.get::<_, String>(2)?),
        user_key: row.get(3)?,
        delivery_mode: DeliveryMode::parse(&delivery_mode_raw).unwrap_or(DeliveryMode::FollowUp),
        status: RunStatus::parse(&status_raw).unwrap_or(RunStatus::Running),
        input_text: row.get(6)?,
        images: serde_json::from_str(&images_raw).unwrap_or_default(),
        output: output_raw.and_then(|s| serde_json::from_str(&s).ok()),
        error_message: row.get(9)?,
        created_at: parse_rfc3339(&created_raw),
        updated_at: parse_rfc3339(&updated_raw),
    })
}

fn insert_task_row(conn: &Connection, task: &ScheduledTask) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO scheduled_tasks (task_id, title, instructions, schedule_kind, once_at, cron_expr,
                                       rrule_expr, timezone, enabled, next_run_at, creator_thread_key,
                                       owner_user_key, delivery_target_provider, delivery_target_route,
                                       delivery_target_metadata, execution_thread_key, last_run_at,
                                       last_run_status, last_error_message)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)",
        params![
            task.task_id,
            task.title,
            task.instructions,
            task.schedule_kind.as_str(),
            task.once_at.map(|t| t.to_rfc3339()),
            task.cron_expr,
            task.rrule_expr,
            task.timezone,
            task.enabled as i64,
            task.next_run_at.map(|t| t.to_rfc3339()),
            task.creator_thread_key.as_str(),
            task.owner_user_key,
            task.delivery_target.provider,
            task.delivery_target.route,
            task.delivery_target.metadata.to_string(),
            task.execution_thread_key.as_ref().map(|k| k.as_str()),
            task.last_run_at.map(|t| t.to_rfc3339()),
            task.last_run_status.map(|s| s.as_str()),
            task.last_error_message,
        ],
    )?;
    Ok(())
}

fn row_to_task(row: &rusqlite::Row) -> rusqlite::Result<ScheduledTask> {
    let schedule_kind_raw: String = row.get(3)?;
    let once_at_raw: Option<String> = row.get(4)?;
    let next_run_raw: Option<String> = row.get(9)?;
    let execution_thread_raw: Option<String> = row.get(15)?;
    let last_run_at_raw: Option<String> = row.get(16)?;
    let last_run_status_raw: Option<String> = row.get(17)?;
    let metadata_raw: String = row.get(14)?;

    Ok(ScheduledTask {
        task_id: row.get(0)?,
        title: row.get(1)?,
        instructions: row.get(2)?,
        schedule_kind: ScheduleKind::parse(&schedule_kind_raw).unwrap_or(ScheduleKind::Once),
        once_at: once_at_raw.map(|s| parse_rfc3339(&s)),
        cron_expr: row.get(5)?,
        rrule_expr: row.get(6)?,
        timezone: row.get(7)?,
        enabled: row.get::<_, i64>(8)? != 0,
        next_run_at: next_run_raw.map(|s| parse_rfc3339(&s)),
        creator_thread_key: ThreadKey::new(row.get::<_, String>(10)?),
        owner_user_key: row.get(11)?,
        delivery_target: DeliveryTarget {
            provider: row.get(12)?,
            route: row.get(13)?,
            metadata: serde_json::from_str(&metadata_raw).unwrap_or(serde_json::Value::Null),
        },
        execution_thread_key: execution_thread_raw.map(ThreadKey::new),
        last_run_at: last_run_at_raw.map(|s| parse_rfc3339(&s)),
        last_run_status: last_run_status_raw.and_then(|s| RunStatus::parse(&s)),
        last_error_message: row.get(18)?,
    })
}

fn row_to_task_run(row: &rusqlite::Row) -> rusqlite::Result<ScheduledTaskRun> {
    let scheduled_for_raw: String = row.get(2)?;
    let status_raw: String = row.get(5)?;
    Ok(ScheduledTaskRun {
        task_run_id: row.get(0)?,
        task_id: row.get(1)?,
        scheduled_for: parse_rfc3339(&scheduled_for_raw),
        idempotency_key: row.get(3)?,
        run_id: row.get(4)?,
        status: TaskRunStatus::parse(&status_raw).unwrap_or(TaskRunStatus::Pending),
        error_message: row.get(6)?,
    })
}

fn parse_rfc3339(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DeliveryMode;

    fn sample_run(run_id: &str, thread: &str) -> Run {
        Run::new_running(
            run_id.to_string(),
            "cli".to_string(),
            ThreadKey::new(thread),
            None,
            DeliveryMode::FollowUp,
            "hello".to_string(),
            vec![],
        )
    }

    #[tokio::test]
    async fn migrations_are_recorded_exactly_once() {
        let store = Store::open_in_memory().unwrap();
        let names: Vec<String> = store
            .with_conn(|conn| {
                let mut stmt =
                    conn.prepare("SELECT name FROM schema_migrations ORDER BY version ASC")?;
                let rows = stmt.query_map([], |row| row.get(0))?;
                rows.collect()
            })
            .await
            .unwrap();
        assert_eq!(
            names,
            vec![
                "001_runs_and_ingest",
                "002_thread_sessions",
                "003_scheduled_tasks",
                "004_scheduled_tasks_rrule",
            ]
        );
    }

    #[tokio::test]
    async fn ingest_message_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        let (run1, dup1) = store
            .ingest_message("cli", "abc-123", || sample_run("run-1", "cli:default"))
            .await
            .unwrap();
        assert!(!dup1);

        let (run2, dup2) = store
            .ingest_message("cli", "abc-123", || sample_run("run-2", "cli:default"))
            .await
            .unwrap();
        assert!(dup2);
        assert_eq!(run1.run_id, run2.run_id);
    }

    #[tokio::test]
    async fn finalize_run_sets_terminal_state() {
        let store = Store::open_in_memory().unwrap();
        let run = store.insert_run(sample_run("run-1", "cli:default")).await.unwrap();
        store
            .finalize_run(&run.run_id, RunStatus::Succeeded, Some(serde_json::json!({"text": "ok"})), None)
            .await
            .unwrap();
        let loaded = store.get_run(&run.run_id).await.unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Succeeded);
        assert!(loaded.output.is_some());
        assert!(loaded.error_message.is_none());
    }

    #[tokio::test]
    async fn upsert_thread_session_rejects_stale_generation() {
        let store = Store::open_in_memory().unwrap();
        let key = ThreadKey::new("cli:default");
        assert_eq!(store.ensure_thread_generation(&key).await.unwrap(), 0);
        assert!(store.upsert_thread_session(&key, "sess-1", "/path/1", 0).await.unwrap());
        let bumped = store.bump_generation(&key).await.unwrap();
        assert_eq!(bumped, 1);
        // Stale write from a run that captured generation 0 is dropped.
        assert!(!store.upsert_thread_session(&key, "sess-2", "/path/2", 0).await.unwrap());
        assert!(store.upsert_thread_session(&key, "sess-2", "/path/2", 1).await.unwrap());
    }

    #[tokio::test]
    async fn upsert_thread_session_rejects_when_no_row_exists() {
        let store = Store::open_in_memory().unwrap();
        let key = ThreadKey::new("cli:default");
        assert!(!store.upsert_thread_session(&key, "sess-1", "/path/1", 0).await.unwrap());
    }

    #[tokio::test]
    async fn ensure_thread_generation_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        let key = ThreadKey::new("cli:default");
        assert_eq!(store.ensure_thread_generation(&key).await.unwrap(), 0);
        store.upsert_thread_session(&key, "sess-1", "/path/1", 0).await.unwrap();
        // Calling again must not clobber the row that's already there.
        assert_eq!(store.ensure_thread_generation(&key).await.unwrap(), 0);
        let session = store.get_thread_session(&key).await.unwrap().unwrap();
        assert_eq!(session.session_id, "sess-1");
    }

    #[tokio::test]
    async fn bump_generation_leaves_tombstone_row_instead_of_deleting() {
        let store = Store::open_in_memory().unwrap();
        let key = ThreadKey::new("cli:default");
        store.ensure_thread_generation(&key).await.unwrap();
        store.upsert_thread_session(&key, "sess-1", "/path/1", 0).await.unwrap();

        let bumped = store.bump_generation(&key).await.unwrap();
        assert_eq!(bumped, 1);

        let session = store.get_thread_session(&key).await.unwrap().unwrap();
        assert_eq!(session.generation, 1);
        assert!(session.session_id.is_empty());
        assert!(session.session_file_path.is_empty());
    }

    #[tokio::test]
    async fn buffer_and_drain_pending_images() {
        let store = Store::open_in_memory().unwrap();
        let key = ThreadKey::new("telegram:chat:1");
        let images = vec![RunImage {
            mime_type: "image/png".to_string(),
            bytes: vec![1, 2, 3],
            filename: Some("a.png".to_string()),
        }];
        let result = store
            .buffer_telegram_images(&key, "user-1", 42, None, images.clone())
            .await
            .unwrap();
        assert_eq!(result.inserted_count, 1);
        assert_eq!(result.total_bytes, 3);

        // Same update_id again: duplicate, no-op.
        let dup = store
            .buffer_telegram_images(&key, "user-1", 42, None, images)
            .await
            .unwrap();
        assert_eq!(dup.inserted_count, 0);

        let drained = store.drain_pending_images(&key, "user-1").await.unwrap();
        assert_eq!(drained.len(), 1);
        let drained_again = store.drain_pending_images(&key, "user-1").await.unwrap();
        assert!(drained_again.is_empty());
    }

    #[tokio::test]
    async fn scheduled_task_run_unique_per_occurrence() {
        let store = Store::open_in_memory().unwrap();
        let scheduled_for = Utc::now();
        let (run1, created1) = store
            .create_or_get_task_run("task-1", scheduled_for, "key-1")
            .await
            .unwrap();
        assert!(created1);
        let (run2, created2) = store
            .create_or_get_task_run("task-1", scheduled_for, "key-1")
            .await
            .unwrap();
        assert!(!created2);
        assert_eq!(run1.task_run_id, run2.task_run_id);
    }
}
