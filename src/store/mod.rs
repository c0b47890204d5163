//! Durable job and task state.
//!
//! Every transition the pipeline relies on for correctness is a single store transaction:
//! claiming a task under a lease, completing it while decrementing the job's remaining
//! counter, and claiming aggregation when that counter reaches zero. Workers never keep job
//! progress in memory.
//!
//! An aggregation claim is itself a lease: the claimer renews its timestamp while it works,
//! and a claim left unrenewed (crash, failed write of the result) can be taken over with
//! [`JobStore::reclaim_aggregations`].

mod sqlite;

pub use sqlite::SqliteJobStore;

use crate::pipeline::{
    ChunkSpan, Document, Job, JobId, JobStatus, Task, TaskId, TaskStatus, Translation,
};
use async_trait::async_trait;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

/// Errors raised by the job store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The database rejected a statement or could not be opened.
    #[error("database error: {0}")]
    Database(rusqlite::Error),
    /// A stored value could not be decoded.
    #[error("corrupt row: {0}")]
    Corrupt(String),
    /// The referenced job does not exist.
    #[error("job {0} not found")]
    JobNotFound(JobId),
    /// The referenced task does not exist.
    #[error("task {0} not found")]
    TaskNotFound(TaskId),
    /// The blocking thread running a statement panicked or was cancelled.
    #[error("store call aborted: {0}")]
    Aborted(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(error: rusqlite::Error) -> Self {
        match error {
            rusqlite::Error::FromSqlConversionFailure(column, _, source) => {
                Self::Corrupt(format!("column {column}: {source}"))
            }
            other => Self::Database(other),
        }
    }
}

/// Opaque token proving ownership of a task lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LeaseToken(Uuid);

impl LeaseToken {
    /// Generate a fresh token.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub(crate) fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for LeaseToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LeaseToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// A task to insert for a job.
#[derive(Debug, Clone)]
pub struct NewTask {
    /// Identifier assigned by the dispatcher.
    pub id: TaskId,
    /// Merge position.
    pub chunk_index: u32,
    /// Chunk text.
    pub input: String,
    /// Span of the chunk in the extracted text.
    pub span: ChunkSpan,
}

/// Terminal result of a job written by the aggregator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobResult {
    /// Terminal status.
    pub status: JobStatus,
    /// Merged summary, absent when the job failed.
    pub summary: Option<String>,
    /// Failure cause, or the gap note of a partial summary.
    pub error: Option<String>,
    /// Plain-language explanation of the summary.
    pub explanation: Option<String>,
    /// Summary in each additional configured language.
    pub translations: Vec<Translation>,
}

impl JobResult {
    /// FAILED result without a summary.
    pub fn failed(cause: impl Into<String>) -> Self {
        Self {
            status: JobStatus::Failed,
            summary: None,
            error: Some(cause.into()),
            explanation: None,
            translations: Vec::new(),
        }
    }
}

/// Why a delivery did not produce a runnable task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimSkip {
    /// The task does not exist (job deleted).
    Unknown,
    /// The task already reached a terminal status.
    Terminal(TaskStatus),
    /// Another worker holds a live lease.
    Leased,
}

/// Result of trying to claim a delivered task.
#[derive(Debug, Clone)]
pub enum Claim {
    /// The caller owns the task until the lease expires.
    Claimed {
        /// Task snapshot at claim time.
        task: Task,
        /// Token to present on heartbeat and completion.
        lease: LeaseToken,
    },
    /// The owning job was closed; the task was marked CANCELLED.
    Cancelled {
        /// Owning job.
        job_id: JobId,
    },
    /// Nothing to do for this delivery.
    Skipped(ClaimSkip),
}

/// Terminal result reported by a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Chunk summary.
    Succeeded(String),
    /// Failure cause.
    Failed(String),
}

/// Effect of a completion on the owning job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    /// Owning job.
    pub job_id: JobId,
    /// Whether the completion was recorded. False when the lease was stale.
    pub applied: bool,
    /// Tasks of the job still outstanding after this completion.
    pub remaining: u32,
    /// Whether the caller won the right to aggregate the job.
    pub aggregate: bool,
}

/// Outcome of releasing a task after a transient failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Task is QUEUED again; the caller re-enqueues it after backoff.
    Requeued {
        /// Retry count after this failure.
        retry_count: u32,
    },
    /// Retry budget spent; the task is FAILED.
    Exhausted(Completion),
    /// The lease was stale; nothing changed.
    Stale,
}

/// Persistence port for jobs, tasks and documents.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a PENDING job together with its document.
    async fn create_job(
        &self,
        job_id: JobId,
        document: &Document,
        created_at: OffsetDateTime,
    ) -> Result<(), StoreError>;

    /// Insert all tasks of a PENDING job in one transaction and set its remaining counter.
    ///
    /// Returns `false` without inserting anything when the job is no longer PENDING.
    async fn create_tasks(&self, job_id: JobId, tasks: &[NewTask]) -> Result<bool, StoreError>;

    /// PENDING → RUNNING. Returns whether the transition happened.
    async fn mark_job_running(&self, job_id: JobId) -> Result<bool, StoreError>;

    /// Non-terminal → FAILED with `cause`. Returns whether the transition happened.
    async fn fail_job(&self, job_id: JobId, cause: &str) -> Result<bool, StoreError>;

    /// Non-terminal → CANCELLED; QUEUED tasks become CANCELLED in the same transaction.
    async fn cancel_job(&self, job_id: JobId) -> Result<bool, StoreError>;

    /// Write the aggregation result. Only applies while the job is non-terminal.
    async fn finish_job(&self, job_id: JobId, result: JobResult) -> Result<bool, StoreError>;

    /// Remove a job with its tasks and document.
    async fn delete_job(&self, job_id: JobId) -> Result<bool, StoreError>;

    /// Load a job.
    async fn get_job(&self, job_id: JobId) -> Result<Option<Job>, StoreError>;

    /// Load the stored document of a job.
    async fn get_document(&self, job_id: JobId) -> Result<Option<Document>, StoreError>;

    /// Load a task.
    async fn get_task(&self, task_id: TaskId) -> Result<Option<Task>, StoreError>;

    /// Tasks of a job ordered by chunk index.
    async fn list_tasks(&self, job_id: JobId) -> Result<Vec<Task>, StoreError>;

    /// Atomically take a delivered task: QUEUED → RUNNING under a fresh lease.
    async fn claim_task(&self, task_id: TaskId, lease: Duration) -> Result<Claim, StoreError>;

    /// Extend a live lease. Returns `false` when the lease is no longer held.
    async fn heartbeat(
        &self,
        task_id: TaskId,
        token: LeaseToken,
        lease: Duration,
    ) -> Result<bool, StoreError>;

    /// Record a terminal outcome, decrement the job counter and claim aggregation at zero.
    async fn complete_task(
        &self,
        task_id: TaskId,
        token: LeaseToken,
        outcome: TaskOutcome,
    ) -> Result<Completion, StoreError>;

    /// Handle a transient failure: requeue while `retry_count < max_retries`, else fail.
    ///
    /// The count is compared before it is incremented, so a task runs at most
    /// `max_retries + 1` times: the first attempt plus `max_retries` retries.
    async fn release_for_retry(
        &self,
        task_id: TaskId,
        token: LeaseToken,
        max_retries: u32,
        cause: &str,
    ) -> Result<RetryDecision, StoreError>;

    /// Return RUNNING tasks whose lease expired before `now` to QUEUED.
    async fn requeue_expired(&self, now: OffsetDateTime) -> Result<Vec<TaskId>, StoreError>;

    /// All QUEUED tasks, oldest job first, for startup recovery.
    async fn queued_tasks(&self) -> Result<Vec<TaskId>, StoreError>;

    /// Re-claim aggregation of open jobs whose tasks are all done but whose claim was last
    /// renewed before `stale_before`. Each returned job now carries a fresh claim.
    async fn reclaim_aggregations(
        &self,
        stale_before: OffsetDateTime,
    ) -> Result<Vec<JobId>, StoreError>;

    /// Refresh the aggregation claim of an open job. Returns `false` once the job is closed.
    async fn renew_aggregation(&self, job_id: JobId) -> Result<bool, StoreError>;
}
