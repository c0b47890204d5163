//! Worker loop: claim a delivered task, summarize it under a heartbeat-extended lease, record
//! the outcome, and aggregate the job when this completion was the last one.

use super::{AttemptError, PipelineContext, Task, TaskId, aggregator, retry_backoff};
use crate::logging;
use crate::store::{Claim, LeaseToken, RetryDecision, StoreError, TaskOutcome};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{Instrument, debug, error, info, trace, warn};

pub(crate) async fn run_worker(ctx: Arc<PipelineContext>, worker_id: usize) {
    debug!(worker_id, "Worker started");
    while let Some(task_id) = ctx.broker.dequeue().await {
        if let Err(error) = process_delivery(&ctx, task_id).await {
            error!(worker_id, %task_id, error = %error, "Task processing failed");
        }
    }
    debug!(worker_id, "Worker stopped");
}

/// Handle one delivery. Duplicate and stale deliveries are no-ops.
pub(crate) async fn process_delivery(
    ctx: &Arc<PipelineContext>,
    task_id: TaskId,
) -> Result<(), StoreError> {
    let (task, lease) = match ctx.store.claim_task(task_id, ctx.settings.lease).await? {
        Claim::Claimed { task, lease } => (task, lease),
        Claim::Cancelled { job_id } => {
            debug!(%job_id, %task_id, "Task cancelled with its job");
            return Ok(());
        }
        Claim::Skipped(reason) => {
            debug!(%task_id, ?reason, "Ignoring delivery");
            return Ok(());
        }
    };

    let span = logging::task_span(&task);
    run_claimed(ctx, task, lease).instrument(span).await
}

async fn run_claimed(
    ctx: &Arc<PipelineContext>,
    task: Task,
    lease: LeaseToken,
) -> Result<(), StoreError> {
    debug!(chars = task.input.chars().count(), "Task claimed");

    let completion = match summarize_with_heartbeat(ctx, &task, lease).await {
        Ok(summary) => {
            let completion = ctx
                .store
                .complete_task(task.id, lease, TaskOutcome::Succeeded(summary))
                .await?;
            if completion.applied {
                ctx.metrics.record_task_success();
                info!(remaining = completion.remaining, "Task succeeded");
            } else {
                warn!("Lease lost before completion; result discarded");
            }
            completion
        }
        Err(attempt_error) if attempt_error.is_retryable() => {
            let cause = attempt_error.to_string();
            match ctx
                .store
                .release_for_retry(task.id, lease, ctx.settings.max_retries, &cause)
                .await?
            {
                RetryDecision::Requeued { retry_count } => {
                    ctx.metrics.record_retry();
                    let delay = retry_backoff(ctx.settings.retry_backoff, retry_count);
                    warn!(
                        retry_count,
                        delay_ms = delay.as_millis() as u64,
                        error = %attempt_error,
                        "Transient failure; task re-queued"
                    );
                    schedule_redelivery(ctx, task.id, delay);
                    return Ok(());
                }
                RetryDecision::Exhausted(completion) => {
                    ctx.metrics.record_task_failure();
                    warn!(
                        error = %attempt_error,
                        remaining = completion.remaining,
                        "Retries exhausted; task failed"
                    );
                    completion
                }
                RetryDecision::Stale => {
                    warn!("Lease lost before retry; failure discarded");
                    return Ok(());
                }
            }
        }
        Err(attempt_error) => {
            let completion = ctx
                .store
                .complete_task(
                    task.id,
                    lease,
                    TaskOutcome::Failed(attempt_error.to_string()),
                )
                .await?;
            if completion.applied {
                ctx.metrics.record_task_failure();
                warn!(
                    error = %attempt_error,
                    remaining = completion.remaining,
                    "Task failed permanently"
                );
            } else {
                warn!("Lease lost before completion; failure discarded");
            }
            completion
        }
    };

    if completion.aggregate {
        aggregator::aggregate_job(ctx, completion.job_id).await?;
    }
    Ok(())
}

/// Run the model call while extending the lease every third of its duration.
async fn summarize_with_heartbeat(
    ctx: &PipelineContext,
    task: &Task,
    lease: LeaseToken,
) -> Result<String, AttemptError> {
    let hint = ctx.settings.length_hint();
    let call = ctx.guarded_summarize(&task.input, &hint);
    tokio::pin!(call);

    let period = ctx.settings.heartbeat_period();
    let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            result = &mut call => return result,
            _ = heartbeat.tick() => {
                match ctx.store.heartbeat(task.id, lease, ctx.settings.lease).await {
                    Ok(true) => trace!("Lease extended"),
                    Ok(false) => warn!("Lease lost while summarizing"),
                    Err(error) => warn!(error = %error, "Heartbeat failed"),
                }
            }
        }
    }
}

fn schedule_redelivery(ctx: &PipelineContext, task_id: TaskId, delay: Duration) {
    let broker = Arc::clone(&ctx.broker);
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        if let Err(error) = broker.enqueue_batch(&[task_id]).await {
            debug!(%task_id, error = %error, "Re-delivery dropped; task stays queued for recovery");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::testing::{SlowSummarizer, context, scripted, seed_job};
    use crate::pipeline::{JobStatus, PipelineSettings, TaskStatus};
    use crate::summarization::SummarizationError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_settings() -> PipelineSettings {
        PipelineSettings {
            retry_backoff: Duration::from_millis(1),
            model_timeout: Duration::from_secs(5),
            ..PipelineSettings::default()
        }
    }

    async fn next_delivery(ctx: &PipelineContext) -> TaskId {
        tokio::time::timeout(Duration::from_secs(2), ctx.broker.dequeue())
            .await
            .expect("redelivery")
            .expect("open broker")
    }

    #[tokio::test]
    async fn last_success_aggregates_the_job() {
        let ctx = context(
            scripted(|text, _| Ok(format!("sum:{}", text.trim()))),
            fast_settings(),
        );
        let (job_id, tasks) = seed_job(&ctx, &["first part.", "second part."]).await;

        process_delivery(&ctx, tasks[1]).await.expect("second");
        let job = ctx.store.get_job(job_id).await.expect("get").expect("job");
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.remaining_tasks, 1);

        process_delivery(&ctx, tasks[0]).await.expect("first");
        let job = ctx.store.get_job(job_id).await.expect("get").expect("job");
        assert_eq!(job.status, JobStatus::Succeeded);
        assert_eq!(
            job.summary.as_deref(),
            Some("sum:first part.\n\nsum:second part.")
        );

        let snapshot = ctx.metrics.snapshot();
        assert_eq!(snapshot.tasks_succeeded, 2);
        assert_eq!(snapshot.aggregations, 1);
        assert_eq!(snapshot.jobs_succeeded, 1);
    }

    #[tokio::test]
    async fn transient_failures_are_retried_until_exhausted() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let ctx = context(
            scripted(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(SummarizationError::ModelUnavailable("503 from backend".into()))
            }),
            PipelineSettings {
                max_retries: 2,
                ..fast_settings()
            },
        );
        let (job_id, tasks) = seed_job(&ctx, &["only chunk."]).await;

        process_delivery(&ctx, tasks[0]).await.expect("attempt 1");
        let task = ctx.store.get_task(tasks[0]).await.expect("get").expect("task");
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.retry_count, 1);

        let redelivered = next_delivery(&ctx).await;
        assert_eq!(redelivered, tasks[0]);
        process_delivery(&ctx, redelivered).await.expect("attempt 2");
        process_delivery(&ctx, next_delivery(&ctx).await)
            .await
            .expect("attempt 3");

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let task = ctx.store.get_task(tasks[0]).await.expect("get").expect("task");
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.retry_count, 2);

        let job = ctx.store.get_job(job_id).await.expect("get").expect("job");
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.summary.is_none());

        let snapshot = ctx.metrics.snapshot();
        assert_eq!(snapshot.task_retries, 2);
        assert_eq!(snapshot.tasks_failed, 1);
    }

    #[tokio::test]
    async fn model_input_errors_fail_without_retry() {
        let ctx = context(
            scripted(|_, _| {
                Err(SummarizationError::ModelInput("input too long".into()))
            }),
            fast_settings(),
        );
        let (_, tasks) = seed_job(&ctx, &["chunk."]).await;

        process_delivery(&ctx, tasks[0]).await.expect("attempt");

        let task = ctx.store.get_task(tasks[0]).await.expect("get").expect("task");
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.retry_count, 0);
        assert!(task.error.as_deref().unwrap_or_default().contains("input too long"));
        assert_eq!(ctx.broker.depth(), 0);
    }

    #[tokio::test]
    async fn panicking_backend_fails_the_task_only() {
        let ctx = context(
            scripted(|text, _| {
                if text.contains("poison") {
                    panic!("tokenizer overflow");
                }
                Ok("fine".to_string())
            }),
            fast_settings(),
        );
        let (job_id, tasks) = seed_job(&ctx, &["poison pill.", "healthy chunk."]).await;

        process_delivery(&ctx, tasks[0]).await.expect("poisoned");
        process_delivery(&ctx, tasks[1]).await.expect("healthy");

        let job = ctx.store.get_job(job_id).await.expect("get").expect("job");
        assert_eq!(job.status, JobStatus::PartiallyFailed);
        assert_eq!(job.summary.as_deref(), Some("fine"));
        let task = ctx.store.get_task(tasks[0]).await.expect("get").expect("task");
        assert!(task.error.as_deref().unwrap_or_default().contains("tokenizer overflow"));
    }

    #[tokio::test]
    async fn duplicate_delivery_is_a_no_op() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let ctx = context(
            scripted(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok("summary".to_string())
            }),
            fast_settings(),
        );
        let (job_id, tasks) = seed_job(&ctx, &["chunk."]).await;

        process_delivery(&ctx, tasks[0]).await.expect("first");
        process_delivery(&ctx, tasks[0]).await.expect("duplicate");

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(ctx.metrics.snapshot().aggregations, 1);
        let job = ctx.store.get_job(job_id).await.expect("get").expect("job");
        assert_eq!(job.status, JobStatus::Succeeded);
    }

    #[tokio::test]
    async fn heartbeat_keeps_lease_alive_during_slow_calls() {
        let ctx = context(
            Arc::new(SlowSummarizer {
                delay: Duration::from_millis(150),
            }),
            PipelineSettings {
                lease: Duration::from_millis(90),
                ..fast_settings()
            },
        );
        let (job_id, tasks) = seed_job(&ctx, &["slow chunk."]).await;

        let reaper_ctx = Arc::clone(&ctx);
        let sweeps = tokio::spawn(async move {
            let mut requeued = 0;
            for _ in 0..10 {
                tokio::time::sleep(Duration::from_millis(15)).await;
                requeued += reaper_ctx
                    .store
                    .requeue_expired(time::OffsetDateTime::now_utc())
                    .await
                    .expect("sweep")
                    .len();
            }
            requeued
        });

        process_delivery(&ctx, tasks[0]).await.expect("slow");
        assert_eq!(sweeps.await.expect("join"), 0);
        let job = ctx.store.get_job(job_id).await.expect("get").expect("job");
        assert_eq!(job.status, JobStatus::Succeeded);
    }
}
