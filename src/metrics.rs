use std::sync::atomic::{AtomicU64, Ordering};

use crate::pipeline::JobStatus;

/// Thread-safe counters describing pipeline activity since startup.
#[derive(Default)]
pub struct PipelineMetrics {
    jobs_submitted: AtomicU64,
    jobs_succeeded: AtomicU64,
    jobs_partially_failed: AtomicU64,
    jobs_failed: AtomicU64,
    jobs_cancelled: AtomicU64,
    tasks_succeeded: AtomicU64,
    tasks_failed: AtomicU64,
    task_retries: AtomicU64,
    aggregations: AtomicU64,
}

impl PipelineMetrics {
    /// Create an empty metrics accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an accepted submission.
    pub fn record_submission(&self) {
        self.jobs_submitted.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a job reaching a terminal status.
    pub fn record_job_outcome(&self, status: JobStatus) {
        let counter = match status {
            JobStatus::Succeeded => &self.jobs_succeeded,
            JobStatus::PartiallyFailed => &self.jobs_partially_failed,
            JobStatus::Failed => &self.jobs_failed,
            JobStatus::Cancelled => &self.jobs_cancelled,
            JobStatus::Pending | JobStatus::Running => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a task stored as succeeded.
    pub fn record_task_success(&self) {
        self.tasks_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a task stored as failed.
    pub fn record_task_failure(&self) {
        self.tasks_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a task handed back to the queue after a transient failure.
    pub fn record_retry(&self) {
        self.task_retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one aggregator run.
    pub fn record_aggregation(&self) {
        self.aggregations.fetch_add(1, Ordering::Relaxed);
    }

    /// Return a snapshot of the current counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            jobs_submitted: self.jobs_submitted.load(Ordering::Relaxed),
            jobs_succeeded: self.jobs_succeeded.load(Ordering::Relaxed),
            jobs_partially_failed: self.jobs_partially_failed.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            jobs_cancelled: self.jobs_cancelled.load(Ordering::Relaxed),
            tasks_succeeded: self.tasks_succeeded.load(Ordering::Relaxed),
            tasks_failed: self.tasks_failed.load(Ordering::Relaxed),
            task_retries: self.task_retries.load(Ordering::Relaxed),
            aggregations: self.aggregations.load(Ordering::Relaxed),
        }
    }
}

/// Immutable view of pipeline counters used for reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct MetricsSnapshot {
    /// Jobs accepted by the dispatcher.
    pub jobs_submitted: u64,
    /// Jobs finished with every chunk summarized.
    pub jobs_succeeded: u64,
    /// Jobs finished with a best-effort summary.
    pub jobs_partially_failed: u64,
    /// Jobs finished without a summary.
    pub jobs_failed: u64,
    /// Jobs cancelled by a caller.
    pub jobs_cancelled: u64,
    /// Tasks stored as succeeded.
    pub tasks_succeeded: u64,
    /// Tasks stored as failed.
    pub tasks_failed: u64,
    /// Transient failures that sent a task back to the queue.
    pub task_retries: u64,
    /// Aggregator runs.
    pub aggregations: u64,
}
