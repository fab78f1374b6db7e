//! Ordered migration set. Each entry is applied in its own transaction and
//! recorded in `schema_migrations`, which doubles as the barrier that lets
//! two processes opening the same database converge without double-applying
//! (`INSERT OR IGNORE` on the version makes re-application a no-op).

pub struct Migration {
    pub version: i64,
    pub name: &'static str,
    pub sql: &'static str,
}

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "001_runs_and_ingest",
        sql: r#"
            CREATE TABLE IF NOT EXISTS runs (
                run_id          TEXT PRIMARY KEY,
                source          TEXT NOT NULL,
                thread_key      TEXT NOT NULL,
                user_key        TEXT,
                delivery_mode   TEXT NOT NULL,
                status          TEXT NOT NULL,
                input_text      TEXT NOT NULL,
                images          TEXT NOT NULL DEFAULT '[]',
                output          TEXT,
                error_message   TEXT,
                created_at      TEXT NOT NULL,
                updated_at      TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_runs_thread_key ON runs(thread_key);

            CREATE TABLE IF NOT EXISTS message_ingest (
                source          TEXT NOT NULL,
                idempotency_key TEXT NOT NULL,
                run_id          TEXT NOT NULL REFERENCES runs(run_id),
                created_at      TEXT NOT NULL,
                UNIQUE(source, idempotency_key)
            );

            CREATE TABLE IF NOT EXISTS pending_image_batches (
                update_id       INTEGER PRIMARY KEY,
                thread_key      TEXT NOT NULL,
                user_key        TEXT NOT NULL,
                media_group_id  TEXT,
                created_at      TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS pending_images (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                update_id       INTEGER NOT NULL REFERENCES pending_image_batches(update_id) ON DELETE CASCADE,
                ordinal         INTEGER NOT NULL,
                mime_type       TEXT NOT NULL,
                bytes           BLOB NOT NULL,
                filename        TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_pending_images_scope
                ON pending_image_batches(thread_key, user_key);
        "#,
    },
    Migration {
        version: 2,
        name: "002_thread_sessions",
        sql: r#"
            CREATE TABLE IF NOT EXISTS thread_sessions (
                thread_key        TEXT PRIMARY KEY,
                session_id        TEXT NOT NULL,
                session_file_path TEXT NOT NULL,
                generation        INTEGER NOT NULL DEFAULT 0,
                updated_at        TEXT NOT NULL
            );
        "#,
    },
    Migration {
        version: 3,
        name: "003_scheduled_tasks",
        sql: r#"
            CREATE TABLE IF NOT EXISTS scheduled_tasks (
                task_id                  TEXT PRIMARY KEY,
                title                    TEXT NOT NULL,
                instructions             TEXT NOT NULL,
                schedule_kind            TEXT NOT NULL,
                once_at                  TEXT,
                cron_expr                TEXT,
                timezone                 TEXT NOT NULL,
                enabled                  INTEGER NOT NULL DEFAULT 1,
                next_run_at              TEXT,
                creator_thread_key       TEXT NOT NULL,
                owner_user_key           TEXT,
                delivery_target_provider TEXT NOT NULL,
                delivery_target_route    TEXT NOT NULL,
                delivery_target_metadata TEXT NOT NULL DEFAULT '{}',
                execution_thread_key     TEXT,
                last_run_at              TEXT,
                last_run_status          TEXT,
                last_error_message       TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_scheduled_tasks_due
                ON scheduled_tasks(enabled, next_run_at);

            CREATE TABLE IF NOT EXISTS scheduled_task_runs (
                task_run_id     TEXT PRIMARY KEY,
                task_id         TEXT NOT NULL REFERENCES scheduled_tasks(task_id),
                scheduled_for   TEXT NOT NULL,
                idempotency_key TEXT NOT NULL,
                run_id          TEXT,
                status          TEXT NOT NULL,
                error_message   TEXT,
                UNIQUE(task_id, scheduled_for),
                UNIQUE(idempotency_key)
            );
        "#,
    },
    Migration {
        version: 4,
        name: "004_scheduled_tasks_rrule",
        sql: r#"
            ALTER TABLE scheduled_tasks ADD COLUMN rrule_expr TEXT;
        "#,
    },
];
