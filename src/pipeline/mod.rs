//! Asynchronous document summarization pipeline.
//!
//! A submission is extracted and chunked by the dispatcher, each chunk becomes a persisted task
//! whose id goes through the broker, workers summarize tasks independently, and the worker that
//! completes the last task of a job runs the aggregator. The facade ([`Pipeline`]) owns the
//! worker pool and the lease reaper and is shared by the HTTP surface and the CLI.

mod aggregator;
mod dispatcher;
mod reaper;
mod types;
mod worker;

pub use aggregator::AggregationError;
pub use dispatcher::DispatchError;
pub use types::{
    ChunkSpan, Document, Job, JobId, JobStatus, JobStatusReport, Task, TaskFailure, TaskId,
    TaskStatus, Translation,
};

use crate::broker::{Broker, BrokerError};
use crate::chunking::determine_chunk_budget;
use crate::config::Config;
use crate::extraction::{ExtractOptions, RelevanceFilter};
use crate::metrics::{MetricsSnapshot, PipelineMetrics};
use crate::store::{JobStore, StoreError};
use crate::summarization::{LengthHint, SummarizationError, Summarizer, summarize_with_timeout};
use async_trait::async_trait;
use futures_util::FutureExt;
use parking_lot::Mutex;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Errors raised by the pipeline facade outside of submission.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Store access failed.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Broker rejected work.
    #[error(transparent)]
    Broker(#[from] BrokerError),
    /// The job does not exist.
    #[error("job {0} not found")]
    JobNotFound(JobId),
}

/// Failure of one guarded summarization call.
#[derive(Debug, Error)]
pub enum AttemptError {
    /// The backend reported an error or timed out.
    #[error(transparent)]
    Model(#[from] SummarizationError),
    /// The backend panicked. Never retried.
    #[error("summarizer panicked: {0}")]
    Panicked(String),
}

impl AttemptError {
    /// Whether another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Model(error) if error.is_retryable())
    }
}

/// Tunables shared by the dispatcher, workers, aggregator and reaper.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Chunk budget in characters; also bounds the merged summary.
    pub chunk_budget: usize,
    /// Characters carried from the previous chunk.
    pub chunk_overlap: usize,
    /// Upper bound on each summary, in words.
    pub summary_max_words: usize,
    /// Advisory lower bound on each summary, in words.
    pub summary_min_words: usize,
    /// Timeout of a single summarization call.
    pub model_timeout: Duration,
    /// Number of concurrent workers.
    pub worker_count: usize,
    /// Transient failures tolerated per task before it fails.
    pub max_retries: u32,
    /// Base delay of the exponential retry backoff.
    pub retry_backoff: Duration,
    /// Lease granted to a worker per claim and heartbeat.
    pub lease: Duration,
    /// Period of the expired-lease sweep.
    pub reaper_interval: Duration,
    /// Reject submissions while the broker holds this many ids.
    pub max_queue_depth: Option<usize>,
    /// Run one final combine pass over the merged summary.
    pub aggregate_final_pass: bool,
    /// Extraction knobs.
    pub extract: ExtractOptions,
    /// Timeout of document extraction.
    pub extract_timeout: Duration,
    /// Keep only keyword-relevant paragraphs before chunking.
    pub relevance: Option<RelevanceFilter>,
    /// Explain each finished summary in plain language.
    pub explanations: bool,
    /// Extra languages every finished summary is rendered in.
    pub translations: Vec<String>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            chunk_budget: 4_000,
            chunk_overlap: 0,
            summary_max_words: 150,
            summary_min_words: 50,
            model_timeout: Duration::from_secs(60),
            worker_count: 2,
            max_retries: 3,
            retry_backoff: Duration::from_secs(2),
            lease: Duration::from_secs(120),
            reaper_interval: Duration::from_secs(15),
            max_queue_depth: None,
            aggregate_final_pass: false,
            extract: ExtractOptions::default(),
            extract_timeout: Duration::from_secs(60),
            relevance: None,
            explanations: false,
            translations: Vec::new(),
        }
    }
}

impl PipelineSettings {
    /// Derive settings from the loaded configuration.
    pub fn from_config(config: &Config) -> Self {
        let model = config.effective_model();
        Self {
            chunk_budget: determine_chunk_budget(
                config.chunk_size,
                config.summarization_provider,
                &model,
            ),
            chunk_overlap: config.chunk_overlap,
            summary_max_words: config.summary_max_words,
            summary_min_words: config.summary_min_words,
            model_timeout: Duration::from_secs(config.model_timeout_secs),
            worker_count: config.worker_count.max(1),
            max_retries: config.max_retries,
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
            lease: Duration::from_secs(config.lease_secs.max(1)),
            reaper_interval: Duration::from_secs(config.reaper_interval_secs.max(1)),
            max_queue_depth: config.max_queue_depth,
            aggregate_final_pass: config.aggregate_final_pass,
            extract: ExtractOptions {
                max_pages: config.extract_max_pages,
                strip_toc: config.extract_strip_toc,
            },
            extract_timeout: Duration::from_secs(config.extract_timeout_secs),
            relevance: config.relevance_filter.then(|| {
                if config.relevance_keywords.is_empty() {
                    RelevanceFilter::default()
                } else {
                    RelevanceFilter::new(config.relevance_keywords.iter().map(String::as_str))
                }
            }),
            explanations: config.explanations_enabled,
            translations: config.summary_translations.clone(),
        }
    }

    pub(crate) fn length_hint(&self) -> LengthHint {
        LengthHint::chunk(self.summary_max_words, self.summary_min_words)
    }

    /// Interval at which task leases and aggregation claims are renewed.
    pub(crate) fn heartbeat_period(&self) -> Duration {
        (self.lease / 3).max(Duration::from_millis(10))
    }
}

/// Work picked up again by [`Pipeline::recover`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Recovery {
    /// QUEUED tasks handed back to the broker.
    pub tasks: usize,
    /// Jobs whose aggregation was claimed but never finished, now aggregating again.
    pub aggregations: usize,
}

impl Recovery {
    /// Whether nothing was left over.
    pub fn is_empty(&self) -> bool {
        self.tasks == 0 && self.aggregations == 0
    }
}

/// Handles shared by every pipeline component.
pub(crate) struct PipelineContext {
    pub(crate) store: Arc<dyn JobStore>,
    pub(crate) broker: Arc<dyn Broker>,
    pub(crate) summarizer: Arc<dyn Summarizer>,
    pub(crate) metrics: Arc<PipelineMetrics>,
    pub(crate) settings: PipelineSettings,
}

impl PipelineContext {
    /// One summarization call under timeout with panics converted into errors.
    pub(crate) async fn guarded_summarize(
        &self,
        text: &str,
        hint: &LengthHint,
    ) -> Result<String, AttemptError> {
        let call = summarize_with_timeout(
            self.summarizer.as_ref(),
            text,
            hint,
            self.settings.model_timeout,
        );
        match AssertUnwindSafe(call).catch_unwind().await {
            Ok(result) => result.map_err(AttemptError::Model),
            Err(payload) => Err(AttemptError::Panicked(panic_message(payload.as_ref()))),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Exponential backoff `base · 2^(attempt-1)`, capped at one minute.
pub(crate) fn retry_backoff(base: Duration, attempt: u32) -> Duration {
    const MAX_BACKOFF: Duration = Duration::from_secs(60);
    let exponent = attempt.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << exponent).min(MAX_BACKOFF)
}

/// Abstraction over the pipeline used by external surfaces (HTTP, CLI).
#[async_trait]
pub trait JobApi: Send + Sync {
    /// Accept a document and return its job id.
    async fn submit(&self, document: Document) -> Result<JobId, DispatchError>;

    /// Point-in-time status of a job; `None` when the job is unknown.
    async fn status(&self, job_id: JobId) -> Result<Option<JobStatusReport>, StoreError>;

    /// Cancel a non-terminal job.
    async fn cancel(&self, job_id: JobId) -> Result<bool, StoreError>;

    /// Delete a job with its tasks and document.
    async fn delete(&self, job_id: JobId) -> Result<bool, StoreError>;

    /// Current counters.
    fn metrics_snapshot(&self) -> MetricsSnapshot;
}

/// Owns the worker pool and exposes the job operations.
///
/// Construct once near process start, call [`Pipeline::start`] inside a Tokio runtime, and
/// share through an `Arc`.
pub struct Pipeline {
    ctx: Arc<PipelineContext>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

impl Pipeline {
    /// Assemble a pipeline from its parts.
    ///
    /// The chunk budget is lowered to the summarizer's input limit when it exceeds it.
    pub fn new(
        store: Arc<dyn JobStore>,
        broker: Arc<dyn Broker>,
        summarizer: Arc<dyn Summarizer>,
        mut settings: PipelineSettings,
    ) -> Self {
        let limit = summarizer.max_input_chars();
        if settings.chunk_budget > limit {
            tracing::warn!(
                chunk_budget = settings.chunk_budget,
                limit,
                backend = summarizer.name(),
                "Chunk budget exceeds the summarizer input limit; clamping"
            );
            settings.chunk_budget = limit;
        }
        let (shutdown, _) = watch::channel(false);
        Self {
            ctx: Arc::new(PipelineContext {
                store,
                broker,
                summarizer,
                metrics: Arc::new(PipelineMetrics::new()),
                settings,
            }),
            handles: Mutex::new(Vec::new()),
            shutdown,
        }
    }

    /// Effective settings.
    pub fn settings(&self) -> &PipelineSettings {
        &self.ctx.settings
    }

    /// Pick up work left in the store by a previous process.
    ///
    /// QUEUED tasks are re-enqueued. Jobs whose tasks all finished but whose aggregation never
    /// wrote a result are aggregated again; any claim they carry belonged to the previous
    /// process, so every such claim is taken over regardless of age.
    pub async fn recover(&self) -> Result<Recovery, PipelineError> {
        let queued = self.ctx.store.queued_tasks().await?;
        if !queued.is_empty() {
            self.ctx.broker.enqueue_batch(&queued).await?;
            tracing::info!(count = queued.len(), "Recovered queued tasks from the store");
        }

        let stranded = self
            .ctx
            .store
            .reclaim_aggregations(time::OffsetDateTime::now_utc())
            .await?;
        if !stranded.is_empty() {
            tracing::info!(count = stranded.len(), "Re-running unfinished aggregations");
            let mut handles = self.handles.lock();
            for job_id in &stranded {
                handles.push(aggregator::spawn_aggregation(&self.ctx, *job_id));
            }
        }

        Ok(Recovery {
            tasks: queued.len(),
            aggregations: stranded.len(),
        })
    }

    /// Spawn the workers and the lease reaper.
    pub fn start(&self) {
        let mut handles = self.handles.lock();
        for worker_id in 0..self.ctx.settings.worker_count {
            handles.push(tokio::spawn(worker::run_worker(
                Arc::clone(&self.ctx),
                worker_id,
            )));
        }
        handles.push(tokio::spawn(reaper::run_reaper(
            Arc::clone(&self.ctx),
            self.shutdown.subscribe(),
        )));
        tracing::info!(
            workers = self.ctx.settings.worker_count,
            chunk_budget = self.ctx.settings.chunk_budget,
            backend = self.ctx.summarizer.name(),
            "Pipeline started"
        );
    }

    /// Stop accepting deliveries and wait for workers to finish their current task.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        self.ctx.broker.close();
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            if let Err(error) = handle.await {
                tracing::warn!(error = %error, "Pipeline task ended abnormally");
            }
        }
        tracing::info!("Pipeline stopped");
    }

    /// Accept a document: persist, extract, chunk and enqueue.
    pub async fn submit(&self, document: Document) -> Result<JobId, DispatchError> {
        dispatcher::dispatch(&self.ctx, document).await
    }

    /// Point-in-time status of a job; `None` when the job is unknown.
    pub async fn get_status(&self, job_id: JobId) -> Result<Option<JobStatusReport>, StoreError> {
        let Some(job) = self.ctx.store.get_job(job_id).await? else {
            return Ok(None);
        };
        let tasks = self.ctx.store.list_tasks(job_id).await?;
        Ok(Some(JobStatusReport::from_parts(&job, &tasks)))
    }

    /// Cancel a non-terminal job. Returns `false` when the job is unknown or already terminal.
    pub async fn cancel(&self, job_id: JobId) -> Result<bool, StoreError> {
        let cancelled = self.ctx.store.cancel_job(job_id).await?;
        if cancelled {
            self.ctx.metrics.record_job_outcome(JobStatus::Cancelled);
            tracing::info!(%job_id, "Job cancelled");
        }
        Ok(cancelled)
    }

    /// Delete a job with its tasks and document.
    pub async fn delete(&self, job_id: JobId) -> Result<bool, StoreError> {
        let deleted = self.ctx.store.delete_job(job_id).await?;
        if deleted {
            tracing::info!(%job_id, "Job deleted");
        }
        Ok(deleted)
    }

    /// Poll until the job reaches a terminal status.
    pub async fn wait_for_terminal(
        &self,
        job_id: JobId,
        poll: Duration,
    ) -> Result<JobStatusReport, PipelineError> {
        loop {
            match self.get_status(job_id).await? {
                None => return Err(PipelineError::JobNotFound(job_id)),
                Some(report) if report.status.is_terminal() => return Ok(report),
                Some(_) => tokio::time::sleep(poll).await,
            }
        }
    }

    /// Current counters.
    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.ctx.metrics.snapshot()
    }
}

#[async_trait]
impl JobApi for Pipeline {
    async fn submit(&self, document: Document) -> Result<JobId, DispatchError> {
        Pipeline::submit(self, document).await
    }

    async fn status(&self, job_id: JobId) -> Result<Option<JobStatusReport>, StoreError> {
        Pipeline::get_status(self, job_id).await
    }

    async fn cancel(&self, job_id: JobId) -> Result<bool, StoreError> {
        Pipeline::cancel(self, job_id).await
    }

    async fn delete(&self, job_id: JobId) -> Result<bool, StoreError> {
        Pipeline::delete(self, job_id).await
    }

    fn metrics_snapshot(&self) -> MetricsSnapshot {
        Pipeline::metrics_snapshot(self)
    }
}
