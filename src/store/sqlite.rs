//! SQLite implementation of [`JobStore`].
//!
//! A single connection guarded by a mutex; every multi-row change runs inside one
//! transaction so the remaining-task counter can never drift from the task rows. Statements
//! run on Tokio's blocking pool so a busy database never stalls the workers' runtime threads.

use super::{
    Claim, ClaimSkip, Completion, JobResult, JobStore, LeaseToken, NewTask, RetryDecision,
    StoreError, TaskOutcome,
};
use crate::pipeline::{
    ChunkSpan, Document, Job, JobId, JobStatus, Task, TaskId, TaskStatus, Translation,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, Transaction, params};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;

const JOB_COLUMNS: &str = "id, status, media_type, byte_len, content_hash, created_at_ms, completed_at_ms, summary, error, remaining_tasks, region, explanation";
const TASK_COLUMNS: &str = "id, job_id, chunk_index, input, span_start, span_fresh_start, span_end, status, retry_count, summary, error";
const OPEN_JOB: &str = "status IN ('PENDING', 'RUNNING')";

/// Job store persisted in a SQLite database file.
#[derive(Clone)]
pub struct SqliteJobStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteJobStore {
    /// Create or open the database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// Create a private in-memory database.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(Duration::from_secs(5))?;
        migrate(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `op` against the connection on the blocking pool.
    async fn run<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock();
            op(&mut conn)
        })
        .await
        .map_err(|error| StoreError::Aborted(error.to_string()))?
    }
}

fn migrate(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;
        PRAGMA synchronous=NORMAL;
        PRAGMA foreign_keys=ON;
        "#,
    )?;

    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            id TEXT PRIMARY KEY,
            status TEXT NOT NULL,
            media_type TEXT NOT NULL,
            byte_len INTEGER NOT NULL,
            content_hash TEXT NOT NULL,
            created_at_ms INTEGER NOT NULL,
            completed_at_ms INTEGER,
            summary TEXT,
            error TEXT,
            total_tasks INTEGER NOT NULL DEFAULT 0,
            remaining_tasks INTEGER NOT NULL DEFAULT 0,
            aggregation_claimed INTEGER NOT NULL DEFAULT 0,
            aggregation_claimed_at_ms INTEGER,
            region TEXT,
            explanation TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
        CREATE INDEX IF NOT EXISTS idx_jobs_content_hash ON jobs(content_hash);

        CREATE TABLE IF NOT EXISTS documents (
            job_id TEXT PRIMARY KEY,
            media_type TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            content BLOB NOT NULL,
            FOREIGN KEY (job_id) REFERENCES jobs(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS tasks (
            id TEXT PRIMARY KEY,
            job_id TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            input TEXT NOT NULL,
            span_start INTEGER NOT NULL,
            span_fresh_start INTEGER NOT NULL,
            span_end INTEGER NOT NULL,
            status TEXT NOT NULL,
            retry_count INTEGER NOT NULL DEFAULT 0,
            summary TEXT,
            error TEXT,
            lease_token TEXT,
            lease_expires_at_ms INTEGER,
            updated_at_ms INTEGER NOT NULL,
            FOREIGN KEY (job_id) REFERENCES jobs(id) ON DELETE CASCADE,
            UNIQUE(job_id, chunk_index)
        );

        CREATE INDEX IF NOT EXISTS idx_tasks_job_id ON tasks(job_id);
        CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);

        CREATE TABLE IF NOT EXISTS job_translations (
            job_id TEXT NOT NULL,
            language TEXT NOT NULL,
            summary TEXT NOT NULL,
            explanation TEXT,
            PRIMARY KEY (job_id, language),
            FOREIGN KEY (job_id) REFERENCES jobs(id) ON DELETE CASCADE
        );
        "#,
    )?;

    // Databases created before these columns existed.
    ensure_column(conn, "jobs", "aggregation_claimed_at_ms", "INTEGER")?;
    ensure_column(conn, "jobs", "region", "TEXT")?;
    ensure_column(conn, "jobs", "explanation", "TEXT")?;
    Ok(())
}

fn ensure_column(
    conn: &Connection,
    table: &str,
    column: &str,
    definition: &str,
) -> Result<(), StoreError> {
    let present: i64 = conn.query_row(
        "SELECT COUNT(*) FROM pragma_table_info(?1) WHERE name=?2",
        params![table, column],
        |row| row.get(0),
    )?;
    if present == 0 {
        conn.execute_batch(&format!("ALTER TABLE {table} ADD COLUMN {column} {definition}"))?;
    }
    Ok(())
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn create_job(
        &self,
        job_id: JobId,
        document: &Document,
        created_at: OffsetDateTime,
    ) -> Result<(), StoreError> {
        let document = document.clone();
        self.run(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO jobs (id, status, media_type, byte_len, content_hash, created_at_ms, region) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    job_id.to_string(),
                    JobStatus::Pending.as_str(),
                    document.media_type(),
                    document.byte_len() as i64,
                    document.content_hash(),
                    to_millis(created_at),
                    document.region()
                ],
            )?;
            tx.execute(
                "INSERT INTO documents (job_id, media_type, content_hash, content) VALUES (?1, ?2, ?3, ?4)",
                params![
                    job_id.to_string(),
                    document.media_type(),
                    document.content_hash(),
                    document.content()
                ],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn create_tasks(&self, job_id: JobId, tasks: &[NewTask]) -> Result<bool, StoreError> {
        let tasks = tasks.to_vec();
        self.run(move |conn| {
            let id = job_id.to_string();
            let now = now_ms();
            let tx = conn.transaction()?;

            let status: Option<JobStatus> = tx
                .query_row("SELECT status FROM jobs WHERE id=?1", params![id], |row| {
                    parse_text(row, 0)
                })
                .optional()?;
            match status {
                None => return Err(StoreError::JobNotFound(job_id)),
                Some(JobStatus::Pending) => {}
                Some(_) => return Ok(false),
            }

            {
                let mut insert = tx.prepare(
                    r#"
                    INSERT INTO tasks (id, job_id, chunk_index, input, span_start, span_fresh_start, span_end, status, updated_at_ms)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                    "#,
                )?;
                for task in &tasks {
                    insert.execute(params![
                        task.id.to_string(),
                        id,
                        task.chunk_index,
                        task.input,
                        task.span.start as i64,
                        task.span.fresh_start as i64,
                        task.span.end as i64,
                        TaskStatus::Queued.as_str(),
                        now
                    ])?;
                }
            }

            tx.execute(
                "UPDATE jobs SET total_tasks=?2, remaining_tasks=?2 WHERE id=?1",
                params![id, tasks.len() as i64],
            )?;
            tx.commit()?;
            Ok(true)
        })
        .await
    }

    async fn mark_job_running(&self, job_id: JobId) -> Result<bool, StoreError> {
        self.run(move |conn| {
            let changed = conn.execute(
                "UPDATE jobs SET status=?2 WHERE id=?1 AND status=?3",
                params![
                    job_id.to_string(),
                    JobStatus::Running.as_str(),
                    JobStatus::Pending.as_str()
                ],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    async fn fail_job(&self, job_id: JobId, cause: &str) -> Result<bool, StoreError> {
        let cause = cause.to_string();
        self.run(move |conn| {
            let changed = conn.execute(
                &format!("UPDATE jobs SET status=?2, error=?3, completed_at_ms=?4 WHERE id=?1 AND {OPEN_JOB}"),
                params![
                    job_id.to_string(),
                    JobStatus::Failed.as_str(),
                    cause,
                    now_ms()
                ],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    async fn cancel_job(&self, job_id: JobId) -> Result<bool, StoreError> {
        self.run(move |conn| {
            let id = job_id.to_string();
            let now = now_ms();
            let tx = conn.transaction()?;

            let changed = tx.execute(
                &format!("UPDATE jobs SET status=?2, completed_at_ms=?3 WHERE id=?1 AND {OPEN_JOB}"),
                params![id, JobStatus::Cancelled.as_str(), now],
            )?;
            if changed == 0 {
                return Ok(false);
            }

            let cancelled = tx.execute(
                "UPDATE tasks SET status=?2, updated_at_ms=?3 WHERE job_id=?1 AND status=?4",
                params![
                    id,
                    TaskStatus::Cancelled.as_str(),
                    now,
                    TaskStatus::Queued.as_str()
                ],
            )?;
            tx.execute(
                "UPDATE jobs SET remaining_tasks = remaining_tasks - ?2 WHERE id=?1",
                params![id, cancelled as i64],
            )?;
            tx.commit()?;
            Ok(true)
        })
        .await
    }

    async fn finish_job(&self, job_id: JobId, result: JobResult) -> Result<bool, StoreError> {
        self.run(move |conn| {
            let id = job_id.to_string();
            let tx = conn.transaction()?;

            let changed = tx.execute(
                &format!(
                    "UPDATE jobs SET status=?2, summary=?3, error=?4, explanation=?5, completed_at_ms=?6 WHERE id=?1 AND {OPEN_JOB}"
                ),
                params![
                    id,
                    result.status.as_str(),
                    result.summary,
                    result.error,
                    result.explanation,
                    now_ms()
                ],
            )?;
            if changed == 0 {
                return Ok(false);
            }

            {
                let mut insert = tx.prepare(
                    "INSERT OR REPLACE INTO job_translations (job_id, language, summary, explanation) VALUES (?1, ?2, ?3, ?4)",
                )?;
                for translation in &result.translations {
                    insert.execute(params![
                        id,
                        translation.language,
                        translation.summary,
                        translation.explanation
                    ])?;
                }
            }
            tx.commit()?;
            Ok(true)
        })
        .await
    }

    async fn delete_job(&self, job_id: JobId) -> Result<bool, StoreError> {
        self.run(move |conn| {
            let changed =
                conn.execute("DELETE FROM jobs WHERE id=?1", params![job_id.to_string()])?;
            Ok(changed == 1)
        })
        .await
    }

    async fn get_job(&self, job_id: JobId) -> Result<Option<Job>, StoreError> {
        self.run(move |conn| {
            let id = job_id.to_string();
            let job = conn
                .query_row(
                    &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id=?1"),
                    params![id],
                    row_to_job,
                )
                .optional()?;
            let Some(mut job) = job else {
                return Ok(None);
            };

            let mut statement =
                conn.prepare("SELECT id FROM tasks WHERE job_id=?1 ORDER BY chunk_index")?;
            job.task_ids = statement
                .query_map(params![id], |row| parse_text(row, 0))?
                .collect::<Result<Vec<TaskId>, _>>()?;

            let mut statement = conn.prepare(
                "SELECT language, summary, explanation FROM job_translations WHERE job_id=?1 ORDER BY language",
            )?;
            job.translations = statement
                .query_map(params![id], |row| {
                    Ok(Translation {
                        language: row.get(0)?,
                        summary: row.get(1)?,
                        explanation: row.get(2)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Some(job))
        })
        .await
    }

    async fn get_document(&self, job_id: JobId) -> Result<Option<Document>, StoreError> {
        self.run(move |conn| {
            let document = conn
                .query_row(
                    r#"
                    SELECT d.content, d.media_type, j.region
                    FROM documents d JOIN jobs j ON j.id = d.job_id
                    WHERE d.job_id=?1
                    "#,
                    params![job_id.to_string()],
                    |row| {
                        let content: Vec<u8> = row.get(0)?;
                        let media_type: String = row.get(1)?;
                        let region: Option<String> = row.get(2)?;
                        let document = Document::new(content, media_type);
                        Ok(match region {
                            Some(region) => document.with_region(region),
                            None => document,
                        })
                    },
                )
                .optional()?;
            Ok(document)
        })
        .await
    }

    async fn get_task(&self, task_id: TaskId) -> Result<Option<Task>, StoreError> {
        self.run(move |conn| {
            let task = conn
                .query_row(
                    &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id=?1"),
                    params![task_id.to_string()],
                    row_to_task,
                )
                .optional()?;
            Ok(task)
        })
        .await
    }

    async fn list_tasks(&self, job_id: JobId) -> Result<Vec<Task>, StoreError> {
        self.run(move |conn| {
            let mut statement = conn.prepare(&format!(
                "SELECT {TASK_COLUMNS} FROM tasks WHERE job_id=?1 ORDER BY chunk_index"
            ))?;
            let tasks = statement
                .query_map(params![job_id.to_string()], row_to_task)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(tasks)
        })
        .await
    }

    async fn claim_task(&self, task_id: TaskId, lease: Duration) -> Result<Claim, StoreError> {
        self.run(move |conn| {
            let id = task_id.to_string();
            let now = now_ms();
            let tx = conn.transaction()?;

            let current: Option<(TaskStatus, Option<i64>, JobId, JobStatus)> = tx
                .query_row(
                    r#"
                    SELECT t.status, t.lease_expires_at_ms, t.job_id, j.status
                    FROM tasks t JOIN jobs j ON j.id = t.job_id
                    WHERE t.id=?1
                    "#,
                    params![id],
                    |row| {
                        Ok((
                            parse_text(row, 0)?,
                            row.get(1)?,
                            parse_text(row, 2)?,
                            parse_text(row, 3)?,
                        ))
                    },
                )
                .optional()?;
            let Some((task_status, lease_expires_at, job_id, job_status)) = current else {
                return Ok(Claim::Skipped(ClaimSkip::Unknown));
            };

            if task_status.is_terminal() {
                return Ok(Claim::Skipped(ClaimSkip::Terminal(task_status)));
            }
            let lease_live = task_status == TaskStatus::Running
                && lease_expires_at.is_some_and(|expires| expires > now);
            if lease_live {
                return Ok(Claim::Skipped(ClaimSkip::Leased));
            }

            if job_status.is_terminal() {
                tx.execute(
                    "UPDATE tasks SET status=?2, lease_token=NULL, lease_expires_at_ms=NULL, updated_at_ms=?3 WHERE id=?1",
                    params![id, TaskStatus::Cancelled.as_str(), now],
                )?;
                tx.execute(
                    "UPDATE jobs SET remaining_tasks = remaining_tasks - 1 WHERE id=?1",
                    params![job_id.to_string()],
                )?;
                tx.commit()?;
                return Ok(Claim::Cancelled { job_id });
            }

            let token = LeaseToken::new();
            tx.execute(
                "UPDATE tasks SET status=?2, lease_token=?3, lease_expires_at_ms=?4, updated_at_ms=?5 WHERE id=?1",
                params![
                    id,
                    TaskStatus::Running.as_str(),
                    token.to_string(),
                    lease_expiry(now, lease),
                    now
                ],
            )?;
            let task = tx.query_row(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id=?1"),
                params![id],
                row_to_task,
            )?;
            tx.commit()?;
            Ok(Claim::Claimed { task, lease: token })
        })
        .await
    }

    async fn heartbeat(
        &self,
        task_id: TaskId,
        token: LeaseToken,
        lease: Duration,
    ) -> Result<bool, StoreError> {
        self.run(move |conn| {
            let now = now_ms();
            let changed = conn.execute(
                "UPDATE tasks SET lease_expires_at_ms=?3, updated_at_ms=?4 WHERE id=?1 AND lease_token=?2 AND status=?5",
                params![
                    task_id.to_string(),
                    token.as_uuid().to_string(),
                    lease_expiry(now, lease),
                    now,
                    TaskStatus::Running.as_str()
                ],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    async fn complete_task(
        &self,
        task_id: TaskId,
        token: LeaseToken,
        outcome: TaskOutcome,
    ) -> Result<Completion, StoreError> {
        self.run(move |conn| {
            let tx = conn.transaction()?;

            let Some(lease) = current_lease(&tx, task_id)? else {
                return Err(StoreError::TaskNotFound(task_id));
            };
            if !lease.is_held_by(token) {
                let (_, remaining, _) = job_progress(&tx, lease.job_id)?;
                return Ok(Completion {
                    job_id: lease.job_id,
                    applied: false,
                    remaining,
                    aggregate: false,
                });
            }

            let completion = record_outcome(&tx, task_id, lease.job_id, &outcome)?;
            tx.commit()?;
            Ok(completion)
        })
        .await
    }

    async fn release_for_retry(
        &self,
        task_id: TaskId,
        token: LeaseToken,
        max_retries: u32,
        cause: &str,
    ) -> Result<RetryDecision, StoreError> {
        let cause = cause.to_string();
        self.run(move |conn| {
            let tx = conn.transaction()?;

            let Some(lease) = current_lease(&tx, task_id)? else {
                return Ok(RetryDecision::Stale);
            };
            if !lease.is_held_by(token) {
                return Ok(RetryDecision::Stale);
            }

            if lease.retry_count < max_retries {
                let retry_count = lease.retry_count + 1;
                tx.execute(
                    r#"
                    UPDATE tasks
                    SET status=?2, retry_count=?3, error=?4, lease_token=NULL, lease_expires_at_ms=NULL, updated_at_ms=?5
                    WHERE id=?1
                    "#,
                    params![
                        task_id.to_string(),
                        TaskStatus::Queued.as_str(),
                        retry_count,
                        cause,
                        now_ms()
                    ],
                )?;
                tx.commit()?;
                return Ok(RetryDecision::Requeued { retry_count });
            }

            let completion =
                record_outcome(&tx, task_id, lease.job_id, &TaskOutcome::Failed(cause))?;
            tx.commit()?;
            Ok(RetryDecision::Exhausted(completion))
        })
        .await
    }

    async fn requeue_expired(&self, now: OffsetDateTime) -> Result<Vec<TaskId>, StoreError> {
        let now = to_millis(now);
        self.run(move |conn| {
            let tx = conn.transaction()?;

            let expired = {
                let mut statement = tx.prepare(
                    r#"
                    SELECT t.id FROM tasks t JOIN jobs j ON j.id = t.job_id
                    WHERE t.status=?1 AND t.lease_expires_at_ms < ?2
                    ORDER BY j.created_at_ms, t.chunk_index
                    "#,
                )?;
                statement
                    .query_map(params![TaskStatus::Running.as_str(), now], |row| {
                        parse_text(row, 0)
                    })?
                    .collect::<Result<Vec<TaskId>, _>>()?
            };

            tx.execute(
                r#"
                UPDATE tasks SET status=?3, lease_token=NULL, lease_expires_at_ms=NULL, updated_at_ms=?2
                WHERE status=?1 AND lease_expires_at_ms < ?2
                "#,
                params![
                    TaskStatus::Running.as_str(),
                    now,
                    TaskStatus::Queued.as_str()
                ],
            )?;
            tx.commit()?;
            Ok(expired)
        })
        .await
    }

    async fn queued_tasks(&self) -> Result<Vec<TaskId>, StoreError> {
        self.run(|conn| {
            let mut statement = conn.prepare(
                r#"
                SELECT t.id FROM tasks t JOIN jobs j ON j.id = t.job_id
                WHERE t.status=?1
                ORDER BY j.created_at_ms, t.chunk_index
                "#,
            )?;
            let ids = statement
                .query_map(params![TaskStatus::Queued.as_str()], |row| {
                    parse_text(row, 0)
                })?
                .collect::<Result<Vec<TaskId>, _>>()?;
            Ok(ids)
        })
        .await
    }

    async fn reclaim_aggregations(
        &self,
        stale_before: OffsetDateTime,
    ) -> Result<Vec<JobId>, StoreError> {
        let cutoff = to_millis(stale_before);
        self.run(move |conn| {
            let now = now_ms();
            let tx = conn.transaction()?;

            let stranded = {
                let mut statement = tx.prepare(&format!(
                    r#"
                    SELECT id FROM jobs
                    WHERE {OPEN_JOB} AND total_tasks > 0 AND remaining_tasks = 0
                      AND (aggregation_claimed = 0
                           OR aggregation_claimed_at_ms IS NULL
                           OR aggregation_claimed_at_ms <= ?1)
                    ORDER BY created_at_ms
                    "#
                ))?;
                statement
                    .query_map(params![cutoff], |row| parse_text(row, 0))?
                    .collect::<Result<Vec<JobId>, _>>()?
            };

            for job_id in &stranded {
                tx.execute(
                    "UPDATE jobs SET aggregation_claimed=1, aggregation_claimed_at_ms=?2 WHERE id=?1",
                    params![job_id.to_string(), now],
                )?;
            }
            tx.commit()?;
            Ok(stranded)
        })
        .await
    }

    async fn renew_aggregation(&self, job_id: JobId) -> Result<bool, StoreError> {
        self.run(move |conn| {
            let changed = conn.execute(
                &format!(
                    "UPDATE jobs SET aggregation_claimed_at_ms=?2 WHERE id=?1 AND aggregation_claimed=1 AND {OPEN_JOB}"
                ),
                params![job_id.to_string(), now_ms()],
            )?;
            Ok(changed == 1)
        })
        .await
    }
}

struct CurrentLease {
    job_id: JobId,
    status: TaskStatus,
    token: Option<String>,
    retry_count: u32,
}

impl CurrentLease {
    fn is_held_by(&self, token: LeaseToken) -> bool {
        self.status == TaskStatus::Running
            && self.token.as_deref() == Some(token.as_uuid().to_string().as_str())
    }
}

fn current_lease(tx: &Transaction<'_>, task_id: TaskId) -> rusqlite::Result<Option<CurrentLease>> {
    tx.query_row(
        "SELECT job_id, status, lease_token, retry_count FROM tasks WHERE id=?1",
        params![task_id.to_string()],
        |row| {
            Ok(CurrentLease {
                job_id: parse_text(row, 0)?,
                status: parse_text(row, 1)?,
                token: row.get(2)?,
                retry_count: row.get(3)?,
            })
        },
    )
    .optional()
}

/// Mark a held task terminal, decrement the job counter and claim aggregation at zero.
fn record_outcome(
    tx: &Transaction<'_>,
    task_id: TaskId,
    job_id: JobId,
    outcome: &TaskOutcome,
) -> rusqlite::Result<Completion> {
    let (status, summary, error) = match outcome {
        TaskOutcome::Succeeded(summary) => (TaskStatus::Succeeded, Some(summary.as_str()), None),
        TaskOutcome::Failed(cause) => (TaskStatus::Failed, None, Some(cause.as_str())),
    };
    tx.execute(
        r#"
        UPDATE tasks
        SET status=?2, summary=?3, error=?4, lease_token=NULL, lease_expires_at_ms=NULL, updated_at_ms=?5
        WHERE id=?1
        "#,
        params![task_id.to_string(), status.as_str(), summary, error, now_ms()],
    )?;
    tx.execute(
        "UPDATE jobs SET remaining_tasks = remaining_tasks - 1 WHERE id=?1",
        params![job_id.to_string()],
    )?;

    let (job_status, remaining, claimed) = job_progress(tx, job_id)?;
    let aggregate = remaining == 0 && !job_status.is_terminal() && !claimed;
    if aggregate {
        tx.execute(
            "UPDATE jobs SET aggregation_claimed=1, aggregation_claimed_at_ms=?2 WHERE id=?1",
            params![job_id.to_string(), now_ms()],
        )?;
    }

    Ok(Completion {
        job_id,
        applied: true,
        remaining,
        aggregate,
    })
}

fn job_progress(tx: &Transaction<'_>, job_id: JobId) -> rusqlite::Result<(JobStatus, u32, bool)> {
    tx.query_row(
        "SELECT status, remaining_tasks, aggregation_claimed FROM jobs WHERE id=?1",
        params![job_id.to_string()],
        |row| Ok((parse_text(row, 0)?, row.get(1)?, row.get::<_, i64>(2)? != 0)),
    )
}

fn row_to_job(row: &Row<'_>) -> rusqlite::Result<Job> {
    Ok(Job {
        id: parse_text(row, 0)?,
        status: parse_text(row, 1)?,
        media_type: row.get(2)?,
        byte_len: row.get::<_, i64>(3)? as usize,
        content_hash: row.get(4)?,
        created_at: timestamp(row, 5)?,
        completed_at: row
            .get::<_, Option<i64>>(6)?
            .map(|ms| from_millis(ms, 6))
            .transpose()?,
        summary: row.get(7)?,
        error: row.get(8)?,
        region: row.get(10)?,
        explanation: row.get(11)?,
        translations: Vec::new(),
        task_ids: Vec::new(),
        remaining_tasks: row.get(9)?,
    })
}

fn row_to_task(row: &Row<'_>) -> rusqlite::Result<Task> {
    Ok(Task {
        id: parse_text(row, 0)?,
        job_id: parse_text(row, 1)?,
        chunk_index: row.get(2)?,
        input: row.get(3)?,
        span: ChunkSpan {
            start: row.get::<_, i64>(4)? as usize,
            fresh_start: row.get::<_, i64>(5)? as usize,
            end: row.get::<_, i64>(6)? as usize,
        },
        status: parse_text(row, 7)?,
        retry_count: row.get(8)?,
        summary: row.get(9)?,
        error: row.get(10)?,
    })
}

fn parse_text<T>(row: &Row<'_>, index: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let raw: String = row.get(index)?;
    raw.parse::<T>()
        .map_err(|error| rusqlite::Error::FromSqlConversionFailure(index, Type::Text, error.into()))
}

fn timestamp(row: &Row<'_>, index: usize) -> rusqlite::Result<OffsetDateTime> {
    from_millis(row.get(index)?, index)
}

fn from_millis(ms: i64, index: usize) -> rusqlite::Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(ms) * 1_000_000).map_err(|error| {
        rusqlite::Error::FromSqlConversionFailure(index, Type::Integer, Box::new(error))
    })
}

fn to_millis(value: OffsetDateTime) -> i64 {
    (value.unix_timestamp_nanos() / 1_000_000) as i64
}

fn now_ms() -> i64 {
    to_millis(OffsetDateTime::now_utc())
}

fn lease_expiry(now: i64, lease: Duration) -> i64 {
    now.saturating_add(i64::try_from(lease.as_millis()).unwrap_or(i64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    const LEASE: Duration = Duration::from_secs(30);

    fn document() -> Document {
        Document::new(b"Budget text".to_vec(), "text/plain")
    }

    async fn seeded(store: &SqliteJobStore, chunks: u32) -> (JobId, Vec<TaskId>) {
        let job_id = JobId::new();
        store
            .create_job(job_id, &document(), OffsetDateTime::now_utc())
            .await
            .expect("create job");
        let tasks: Vec<NewTask> = (0..chunks)
            .map(|index| NewTask {
                id: TaskId::new(),
                chunk_index: index,
                input: format!("chunk {index}"),
                span: ChunkSpan {
                    start: index as usize * 10,
                    fresh_start: index as usize * 10,
                    end: index as usize * 10 + 10,
                },
            })
            .collect();
        assert!(store.create_tasks(job_id, &tasks).await.expect("tasks"));
        (job_id, tasks.iter().map(|task| task.id).collect())
    }

    fn succeeded(summary: &str) -> JobResult {
        JobResult {
            status: JobStatus::Succeeded,
            summary: Some(summary.to_string()),
            error: None,
            explanation: None,
            translations: Vec::new(),
        }
    }

    async fn claim(store: &SqliteJobStore, task_id: TaskId) -> LeaseToken {
        match store.claim_task(task_id, LEASE).await.expect("claim") {
            Claim::Claimed { lease, .. } => lease,
            other => panic!("expected claim, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn creates_job_with_ordered_tasks_and_counter() {
        let store = SqliteJobStore::open_in_memory().expect("store");
        let (job_id, task_ids) = seeded(&store, 3).await;

        let job = store.get_job(job_id).await.expect("get").expect("job");
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.remaining_tasks, 3);
        assert_eq!(job.task_ids, task_ids);
        assert_eq!(job.content_hash, document().content_hash());

        assert!(store.mark_job_running(job_id).await.expect("running"));
        assert!(!store.mark_job_running(job_id).await.expect("second"));

        let tasks = store.list_tasks(job_id).await.expect("list");
        assert!(tasks.iter().all(|task| task.status == TaskStatus::Queued));
        assert_eq!(tasks[2].span.end, 30);
    }

    #[tokio::test]
    async fn duplicate_deliveries_are_skipped() {
        let store = SqliteJobStore::open_in_memory().expect("store");
        let (_, task_ids) = seeded(&store, 1).await;

        let lease = claim(&store, task_ids[0]).await;
        assert!(matches!(
            store.claim_task(task_ids[0], LEASE).await.expect("dup"),
            Claim::Skipped(ClaimSkip::Leased)
        ));

        store
            .complete_task(task_ids[0], lease, TaskOutcome::Succeeded("done".into()))
            .await
            .expect("complete");
        assert!(matches!(
            store.claim_task(task_ids[0], LEASE).await.expect("late dup"),
            Claim::Skipped(ClaimSkip::Terminal(TaskStatus::Succeeded))
        ));
        assert!(matches!(
            store.claim_task(TaskId::new(), LEASE).await.expect("unknown"),
            Claim::Skipped(ClaimSkip::Unknown)
        ));
    }

    #[tokio::test]
    async fn last_completion_claims_aggregation_once() {
        let store = SqliteJobStore::open_in_memory().expect("store");
        let (job_id, task_ids) = seeded(&store, 2).await;
        let first = claim(&store, task_ids[0]).await;
        let second = claim(&store, task_ids[1]).await;

        let completion = store
            .complete_task(task_ids[1], second, TaskOutcome::Failed("bad input".into()))
            .await
            .expect("complete");
        assert_eq!(completion.remaining, 1);
        assert!(!completion.aggregate);

        let completion = store
            .complete_task(task_ids[0], first, TaskOutcome::Succeeded("ok".into()))
            .await
            .expect("complete");
        assert_eq!(
            completion,
            Completion {
                job_id,
                applied: true,
                remaining: 0,
                aggregate: true
            }
        );

        let repeat = store
            .complete_task(task_ids[0], first, TaskOutcome::Succeeded("again".into()))
            .await
            .expect("repeat");
        assert!(!repeat.applied);
        assert!(!repeat.aggregate);
    }

    #[tokio::test]
    async fn aggregation_is_claimed_exactly_once_under_concurrency() {
        let store = Arc::new(SqliteJobStore::open_in_memory().expect("store"));
        let (_, task_ids) = seeded(&store, 32).await;

        let mut leases = Vec::new();
        for task_id in &task_ids {
            leases.push((*task_id, claim(&store, *task_id).await));
        }

        let handles: Vec<_> = leases
            .into_iter()
            .map(|(task_id, lease)| {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    store
                        .complete_task(task_id, lease, TaskOutcome::Succeeded("s".into()))
                        .await
                        .expect("complete")
                })
            })
            .collect();

        let mut winners = 0;
        for handle in handles {
            if handle.await.expect("join").aggregate {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn retry_release_requeues_until_budget_is_spent() {
        let store = SqliteJobStore::open_in_memory().expect("store");
        let (_, task_ids) = seeded(&store, 1).await;
        let task_id = task_ids[0];

        for expected in 1..=2 {
            let lease = claim(&store, task_id).await;
            let decision = store
                .release_for_retry(task_id, lease, 2, "timeout")
                .await
                .expect("release");
            assert_eq!(
                decision,
                RetryDecision::Requeued {
                    retry_count: expected
                }
            );
        }

        let lease = claim(&store, task_id).await;
        let decision = store
            .release_for_retry(task_id, lease, 2, "timeout")
            .await
            .expect("release");
        assert!(matches!(decision, RetryDecision::Exhausted(completion) if completion.aggregate));

        let task = store.get_task(task_id).await.expect("get").expect("task");
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.retry_count, 2);
        assert_eq!(task.error.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn expired_leases_are_requeued_and_stale_completions_discarded() {
        let store = SqliteJobStore::open_in_memory().expect("store");
        let (_, task_ids) = seeded(&store, 2).await;
        let stale = claim(&store, task_ids[0]).await;
        assert!(
            store
                .heartbeat(task_ids[0], stale, LEASE)
                .await
                .expect("heartbeat")
        );

        let later = OffsetDateTime::now_utc() + time::Duration::minutes(5);
        let requeued = store.requeue_expired(later).await.expect("reap");
        assert_eq!(requeued, vec![task_ids[0]]);

        let fresh = claim(&store, task_ids[0]).await;
        let discarded = store
            .complete_task(task_ids[0], stale, TaskOutcome::Succeeded("old".into()))
            .await
            .expect("stale");
        assert!(!discarded.applied);
        assert!(
            !store
                .heartbeat(task_ids[0], stale, LEASE)
                .await
                .expect("stale heartbeat")
        );

        let applied = store
            .complete_task(task_ids[0], fresh, TaskOutcome::Succeeded("new".into()))
            .await
            .expect("fresh");
        assert!(applied.applied);
        let task = store.get_task(task_ids[0]).await.expect("get").expect("task");
        assert_eq!(task.summary.as_deref(), Some("new"));
        assert_eq!(task.retry_count, 0);
    }

    #[tokio::test]
    async fn cancel_closes_job_and_queued_tasks() {
        let store = SqliteJobStore::open_in_memory().expect("store");
        let (job_id, task_ids) = seeded(&store, 3).await;
        let in_flight = claim(&store, task_ids[0]).await;

        assert!(store.cancel_job(job_id).await.expect("cancel"));
        assert!(!store.cancel_job(job_id).await.expect("cancel twice"));

        let job = store.get_job(job_id).await.expect("get").expect("job");
        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(job.remaining_tasks, 1);
        assert!(job.completed_at.is_some());

        let completion = store
            .complete_task(task_ids[0], in_flight, TaskOutcome::Succeeded("late".into()))
            .await
            .expect("complete");
        assert!(completion.applied);
        assert!(!completion.aggregate);
        assert!(
            !store
                .finish_job(job_id, succeeded("x"))
                .await
                .expect("finish")
        );
    }

    #[tokio::test]
    async fn requeued_task_of_closed_job_is_cancelled_at_claim() {
        let store = SqliteJobStore::open_in_memory().expect("store");
        let (job_id, task_ids) = seeded(&store, 1).await;
        let lease = claim(&store, task_ids[0]).await;
        store
            .release_for_retry(task_ids[0], lease, 3, "unavailable")
            .await
            .expect("release");
        store.cancel_job(job_id).await.expect("cancel");

        // The cancel already closed the queued task.
        assert!(matches!(
            store.claim_task(task_ids[0], LEASE).await.expect("claim"),
            Claim::Skipped(ClaimSkip::Terminal(TaskStatus::Cancelled))
        ));
        let job = store.get_job(job_id).await.expect("get").expect("job");
        assert_eq!(job.remaining_tasks, 0);
    }

    #[tokio::test]
    async fn create_tasks_refuses_closed_jobs() {
        let store = SqliteJobStore::open_in_memory().expect("store");
        let job_id = JobId::new();
        store
            .create_job(job_id, &document(), OffsetDateTime::now_utc())
            .await
            .expect("create");
        assert!(store.cancel_job(job_id).await.expect("cancel"));

        let inserted = store
            .create_tasks(
                job_id,
                &[NewTask {
                    id: TaskId::new(),
                    chunk_index: 0,
                    input: "text".into(),
                    span: ChunkSpan {
                        start: 0,
                        fresh_start: 0,
                        end: 4,
                    },
                }],
            )
            .await
            .expect("create tasks");
        assert!(!inserted);
        assert!(store.list_tasks(job_id).await.expect("list").is_empty());

        let missing = store.create_tasks(JobId::new(), &[]).await;
        assert!(matches!(missing, Err(StoreError::JobNotFound(_))));
    }

    #[tokio::test]
    async fn delete_cascades_to_tasks_and_document() {
        let store = SqliteJobStore::open_in_memory().expect("store");
        let (job_id, task_ids) = seeded(&store, 2).await;
        assert!(store.get_document(job_id).await.expect("doc").is_some());

        assert!(store.delete_job(job_id).await.expect("delete"));
        assert!(store.get_job(job_id).await.expect("get").is_none());
        assert!(store.get_document(job_id).await.expect("doc").is_none());
        assert!(store.get_task(task_ids[0]).await.expect("task").is_none());
        assert!(!store.delete_job(job_id).await.expect("delete twice"));
    }

    #[tokio::test]
    async fn state_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("jobs.db");

        let (job_id, task_ids) = {
            let store = SqliteJobStore::open(&path).expect("open");
            seeded(&store, 2).await
        };

        let store = SqliteJobStore::open(&path).expect("reopen");
        let job = store.get_job(job_id).await.expect("get").expect("job");
        assert_eq!(job.task_ids, task_ids);
        let queued: HashSet<TaskId> = store
            .queued_tasks()
            .await
            .expect("queued")
            .into_iter()
            .collect();
        assert_eq!(queued, task_ids.into_iter().collect());
    }

    #[tokio::test]
    async fn stale_aggregation_claim_is_reclaimed_once() {
        let store = SqliteJobStore::open_in_memory().expect("store");
        let (job_id, task_ids) = seeded(&store, 1).await;
        store.mark_job_running(job_id).await.expect("running");
        let lease = claim(&store, task_ids[0]).await;
        let completion = store
            .complete_task(task_ids[0], lease, TaskOutcome::Succeeded("done".into()))
            .await
            .expect("complete");
        assert!(completion.aggregate);

        // The claimer never finished the job.
        let now = OffsetDateTime::now_utc();
        let fresh_cutoff = now - time::Duration::minutes(1);
        assert!(store.reclaim_aggregations(fresh_cutoff).await.expect("fresh").is_empty());

        let later = now + time::Duration::minutes(1);
        assert_eq!(store.reclaim_aggregations(later).await.expect("stale"), vec![job_id]);
        assert!(store.reclaim_aggregations(fresh_cutoff).await.expect("restamped").is_empty());
        assert!(store.renew_aggregation(job_id).await.expect("renew"));

        assert!(store.finish_job(job_id, succeeded("done")).await.expect("finish"));
        assert!(store.reclaim_aggregations(later).await.expect("closed").is_empty());
        assert!(!store.renew_aggregation(job_id).await.expect("renew closed"));
    }

    #[tokio::test]
    async fn jobs_with_outstanding_tasks_are_not_reclaimed() {
        let store = SqliteJobStore::open_in_memory().expect("store");
        let (job_id, task_ids) = seeded(&store, 2).await;
        let lease = claim(&store, task_ids[0]).await;
        store
            .complete_task(task_ids[0], lease, TaskOutcome::Succeeded("half".into()))
            .await
            .expect("complete");

        let later = OffsetDateTime::now_utc() + time::Duration::minutes(1);
        assert!(store.reclaim_aggregations(later).await.expect("reclaim").is_empty());
        assert!(!store.renew_aggregation(job_id).await.expect("unclaimed"));
    }

    #[tokio::test]
    async fn finish_stores_explanation_and_translations() {
        let store = SqliteJobStore::open_in_memory().expect("store");
        let document = document().with_region("Uganda");
        let job_id = JobId::new();
        store
            .create_job(job_id, &document, OffsetDateTime::now_utc())
            .await
            .expect("create");

        let result = JobResult {
            explanation: Some("Clinics for mothers get more money.".into()),
            translations: vec![
                Translation {
                    language: "sw".into(),
                    summary: "Fedha zaidi kwa zahanati.".into(),
                    explanation: Some("Zahanati za akina mama.".into()),
                },
                Translation {
                    language: "fr".into(),
                    summary: "Plus de fonds pour les cliniques.".into(),
                    explanation: None,
                },
            ],
            ..succeeded("More money for clinics.")
        };
        assert!(store.finish_job(job_id, result.clone()).await.expect("finish"));
        assert!(!store.finish_job(job_id, result).await.expect("finish twice"));

        let job = store.get_job(job_id).await.expect("get").expect("job");
        assert_eq!(job.status, JobStatus::Succeeded);
        assert_eq!(job.region.as_deref(), Some("Uganda"));
        assert_eq!(job.explanation.as_deref(), Some("Clinics for mothers get more money."));
        let languages: Vec<&str> = job
            .translations
            .iter()
            .map(|translation| translation.language.as_str())
            .collect();
        assert_eq!(languages, ["fr", "sw"]);

        let stored = store.get_document(job_id).await.expect("doc").expect("document");
        assert_eq!(stored.region(), Some("Uganda"));

        assert!(store.delete_job(job_id).await.expect("delete"));
        let orphans: i64 = store
            .run(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM job_translations", [], |row| {
                    row.get(0)
                })?)
            })
            .await
            .expect("count");
        assert_eq!(orphans, 0);
    }

    #[tokio::test]
    async fn databases_from_before_claim_leases_are_upgraded() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("jobs.db");
        let job_id = JobId::new();
        {
            let conn = Connection::open(&path).expect("open");
            conn.execute_batch(
                r#"
                CREATE TABLE jobs (
                    id TEXT PRIMARY KEY,
                    status TEXT NOT NULL,
                    media_type TEXT NOT NULL,
                    byte_len INTEGER NOT NULL,
                    content_hash TEXT NOT NULL,
                    created_at_ms INTEGER NOT NULL,
                    completed_at_ms INTEGER,
                    summary TEXT,
                    error TEXT,
                    total_tasks INTEGER NOT NULL DEFAULT 0,
                    remaining_tasks INTEGER NOT NULL DEFAULT 0,
                    aggregation_claimed INTEGER NOT NULL DEFAULT 0
                );
                "#,
            )
            .expect("legacy schema");
            conn.execute(
                "INSERT INTO jobs (id, status, media_type, byte_len, content_hash, created_at_ms, total_tasks, remaining_tasks, aggregation_claimed) VALUES (?1, 'RUNNING', 'text/plain', 4, 'hash', 0, 1, 0, 1)",
                params![job_id.to_string()],
            )
            .expect("legacy row");
        }

        let store = SqliteJobStore::open(&path).expect("upgrade");
        let job = store.get_job(job_id).await.expect("get").expect("job");
        assert!(job.region.is_none());
        assert_eq!(
            store
                .reclaim_aggregations(OffsetDateTime::now_utc())
                .await
                .expect("reclaim"),
            vec![job_id]
        );
    }
}
