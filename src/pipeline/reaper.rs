//! Periodic sweep returning RUNNING tasks with expired leases to the queue.
//!
//! A worker that dies mid-task stops heart-beating, so its lease lapses and the sweep
//! re-queues the task with its retry count unchanged. Completions presented later with the
//! old lease token are discarded by the store. Aggregation claims work the same way: a claim
//! not renewed within one lease is taken over and the job is aggregated again.

use super::{JobId, PipelineContext, PipelineError, TaskId, aggregator};
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

pub(crate) async fn run_reaper(ctx: Arc<PipelineContext>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(ctx.settings.reaper_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(error) = sweep(&ctx, OffsetDateTime::now_utc()).await {
                    warn!(error = %error, "Lease sweep failed");
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    debug!("Reaper stopped");
}

/// What one sweep picked up.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct Sweep {
    pub(crate) requeued: Vec<TaskId>,
    pub(crate) aggregations: Vec<JobId>,
}

/// Re-queue tasks whose lease expired before `now` and hand them back to the broker, then
/// restart aggregations whose claim went unrenewed for a full lease.
pub(crate) async fn sweep(
    ctx: &Arc<PipelineContext>,
    now: OffsetDateTime,
) -> Result<Sweep, PipelineError> {
    let requeued = ctx.store.requeue_expired(now).await?;
    if !requeued.is_empty() {
        warn!(count = requeued.len(), "Re-queued tasks with expired leases");
        ctx.broker.enqueue_batch(&requeued).await?;
    }

    let aggregations = ctx
        .store
        .reclaim_aggregations(now - ctx.settings.lease)
        .await?;
    for job_id in &aggregations {
        warn!(%job_id, "Aggregation claim expired; aggregating again");
        aggregator::spawn_aggregation(ctx, *job_id);
    }

    Ok(Sweep {
        requeued,
        aggregations,
    })
}
