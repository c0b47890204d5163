//! Merge chunk summaries into the document summary.
//!
//! Runs once per job, in the worker whose completion claimed aggregation, or in a task spawned
//! by recovery or the reaper when an earlier claimer stopped renewing its claim. Successful
//! chunk summaries are joined in chunk order; when the join is over the chunk budget it is
//! re-chunked and condensed with combine passes until it fits. A finished summary can then be
//! explained in plain language and rendered in additional languages.

use super::{
    AttemptError, JobId, JobStatus, PipelineContext, TaskStatus, Translation, retry_backoff,
};
use crate::chunking::{Chunker, ChunkingError};
use crate::logging;
use crate::store::{JobResult, StoreError};
use crate::summarization::LengthHint;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{Instrument, debug, error, info, trace, warn};

/// Combine passes allowed before giving up on an oversized merge.
pub const MAX_COMBINE_PASSES: usize = 8;

/// Generous characters-per-word estimate used to size combine requests.
const CHARS_PER_WORD: usize = 8;

/// Failures that end a job FAILED during aggregation.
#[derive(Debug, Error)]
pub enum AggregationError {
    /// Store access failed.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// A combine call failed for good.
    #[error("combine pass failed: {0}")]
    Summarization(AttemptError),
    /// The chunk budget is unusable.
    #[error(transparent)]
    Chunking(#[from] ChunkingError),
    /// A combine pass did not shrink the text.
    #[error("combine pass made no progress at {0} characters")]
    NoProgress(usize),
    /// The text still exceeded the budget after the pass limit.
    #[error("summary still over budget after {0} combine passes")]
    TooManyPasses(usize),
}

#[derive(Debug, PartialEq, Eq)]
struct Outcome {
    status: JobStatus,
    summary: Option<String>,
    note: Option<String>,
}

/// Aggregate a job and persist the result. Aggregation failures end the job FAILED; only
/// store errors are returned, and they leave the claim to expire for another attempt.
pub(crate) async fn aggregate_job(ctx: &PipelineContext, job_id: JobId) -> Result<(), StoreError> {
    async {
        ctx.metrics.record_aggregation();

        let result = match with_claim_renewal(ctx, job_id, build_result(ctx, job_id)).await {
            Ok(result) => result,
            Err(error) => {
                warn!(error = %error, "Aggregation failed");
                JobResult::failed(format!("aggregation failed: {error}"))
            }
        };

        let status = result.status;
        let summary_chars = result
            .summary
            .as_deref()
            .map(|summary| summary.chars().count())
            .unwrap_or(0);
        let translations = result.translations.len();
        if ctx.store.finish_job(job_id, result).await? {
            ctx.metrics.record_job_outcome(status);
            info!(%status, summary_chars, translations, "Job finished");
        } else {
            info!("Job closed while aggregating; result dropped");
        }
        Ok(())
    }
    .instrument(logging::job_span(job_id))
    .await
}

/// Run [`aggregate_job`] on its own task, for jobs whose earlier claimer went away.
pub(crate) fn spawn_aggregation(ctx: &Arc<PipelineContext>, job_id: JobId) -> JoinHandle<()> {
    let ctx = Arc::clone(ctx);
    tokio::spawn(async move {
        if let Err(error) = aggregate_job(&ctx, job_id).await {
            error!(%job_id, error = %error, "Re-run aggregation failed; claim left to expire");
        }
    })
}

/// Drive `work` while refreshing the job's aggregation claim so the reaper leaves it alone.
async fn with_claim_renewal<F: Future>(ctx: &PipelineContext, job_id: JobId, work: F) -> F::Output {
    tokio::pin!(work);
    let period = ctx.settings.heartbeat_period();
    let mut renewal = tokio::time::interval_at(Instant::now() + period, period);
    renewal.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            output = &mut work => return output,
            _ = renewal.tick() => {
                match ctx.store.renew_aggregation(job_id).await {
                    Ok(true) => trace!("Aggregation claim renewed"),
                    Ok(false) => debug!("Job closed while aggregating"),
                    Err(error) => warn!(error = %error, "Aggregation claim renewal failed"),
                }
            }
        }
    }
}

async fn build_result(ctx: &PipelineContext, job_id: JobId) -> Result<JobResult, AggregationError> {
    let outcome = build_outcome(ctx, job_id).await?;
    let Some(summary) = outcome.summary else {
        return Ok(JobResult {
            status: outcome.status,
            summary: None,
            error: outcome.note,
            explanation: None,
            translations: Vec::new(),
        });
    };

    let region = ctx
        .store
        .get_job(job_id)
        .await?
        .and_then(|job| job.region);
    let explanation = explain(ctx, &summary, region.as_deref(), None).await;
    let translations = translate(ctx, &summary, region.as_deref()).await;
    Ok(JobResult {
        status: outcome.status,
        summary: Some(summary),
        error: outcome.note,
        explanation,
        translations,
    })
}

/// Explanation used when the model cannot produce one.
pub(crate) fn fallback_explanation(region: Option<&str>) -> String {
    let region = region.map(|region| format!(" in {region}")).unwrap_or_default();
    format!(
        "This budget{region} contains provisions that may affect gender equality and the reduction of inequalities. For women and girls, it could change access to education, healthcare and economic opportunities. For marginalized communities, it might influence social services, infrastructure and protection programs. The actual impact depends on how funds are allocated and spent."
    )
}

/// Plain-language impact explanation of `summary`, when explanations are enabled.
///
/// A failed explanation in the primary language falls back to a generic text; a failed
/// translated explanation is left out.
async fn explain(
    ctx: &PipelineContext,
    summary: &str,
    region: Option<&str>,
    language: Option<&str>,
) -> Option<String> {
    if !ctx.settings.explanations {
        return None;
    }
    let mut hint = ctx.settings.length_hint().explain(region);
    if let Some(language) = language {
        hint = hint.in_language(language);
    }
    match summarize_with_retry(ctx, summary, &hint).await {
        Ok(explanation) => Some(explanation),
        Err(error) => {
            warn!(
                language = language.unwrap_or("default"),
                error = %error,
                "Explanation failed"
            );
            language.is_none().then(|| fallback_explanation(region))
        }
    }
}

/// Render the summary in every configured extra language. Failed languages are skipped.
async fn translate(ctx: &PipelineContext, summary: &str, region: Option<&str>) -> Vec<Translation> {
    let mut translations = Vec::with_capacity(ctx.settings.translations.len());
    for language in &ctx.settings.translations {
        let hint = ctx
            .settings
            .length_hint()
            .combine()
            .in_language(language.as_str());
        match summarize_with_retry(ctx, summary, &hint).await {
            Ok(translated) => translations.push(Translation {
                language: language.clone(),
                summary: translated,
                explanation: explain(ctx, summary, region, Some(language.as_str())).await,
            }),
            Err(error) => {
                warn!(language = %language, error = %error, "Translation failed; language skipped")
            }
        }
    }
    translations
}

async fn build_outcome(
    ctx: &PipelineContext,
    job_id: JobId,
) -> Result<Outcome, AggregationError> {
    let tasks = ctx.store.list_tasks(job_id).await?;
    let total = tasks.len();

    let mut summaries = Vec::with_capacity(total);
    let mut failed = Vec::new();
    let mut first_cause: Option<&str> = None;
    for task in &tasks {
        match (task.status, task.summary.as_deref()) {
            (TaskStatus::Succeeded, Some(summary)) => summaries.push(summary),
            _ => {
                failed.push(task.chunk_index);
                first_cause = first_cause.or(task.error.as_deref());
            }
        }
    }

    if summaries.is_empty() {
        let cause = first_cause.unwrap_or("no chunk produced a summary");
        return Ok(Outcome {
            status: JobStatus::Failed,
            summary: None,
            note: Some(format!("all {total} chunks failed; first error: {cause}")),
        });
    }

    let merged = summaries.len();
    let mut text = condense(ctx, summaries.join("\n\n")).await?;
    if ctx.settings.aggregate_final_pass && merged > 1 {
        let hint = ctx.settings.length_hint().combine();
        text = summarize_with_retry(ctx, &text, &hint).await?;
    }

    Ok(if failed.is_empty() {
        Outcome {
            status: JobStatus::Succeeded,
            summary: Some(text),
            note: None,
        }
    } else {
        Outcome {
            status: JobStatus::PartiallyFailed,
            summary: Some(text),
            note: Some(gap_note(&failed, total)),
        }
    })
}

/// Note attached to a partial summary naming the chunks it lacks.
pub(crate) fn gap_note(failed: &[u32], total: usize) -> String {
    let indices = failed
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "{} of {total} chunks failed; summary omits chunks {indices}",
        failed.len()
    )
}

/// Re-chunk and combine until the text fits the chunk budget.
async fn condense(ctx: &PipelineContext, mut text: String) -> Result<String, AggregationError> {
    let budget = ctx.settings.chunk_budget;
    let mut passes = 0;

    loop {
        let before = text.chars().count();
        if before <= budget {
            return Ok(text);
        }
        if passes == MAX_COMBINE_PASSES {
            return Err(AggregationError::TooManyPasses(passes));
        }
        passes += 1;

        let pieces: Vec<&str> = Chunker::new(&text, budget, 0)?
            .map(|chunk| chunk.text)
            .collect();
        let hint = piece_hint(ctx, pieces.len());
        let mut partials = Vec::with_capacity(pieces.len());
        for piece in pieces {
            partials.push(summarize_with_retry(ctx, piece, &hint).await?);
        }
        let next = partials.join("\n\n");

        let after = next.chars().count();
        if after >= before {
            return Err(AggregationError::NoProgress(before));
        }
        debug!(pass = passes, before, after, "Combine pass finished");
        text = next;
    }
}

/// Combine hint giving each of `pieces` an equal share of the chunk budget.
fn piece_hint(ctx: &PipelineContext, pieces: usize) -> LengthHint {
    let settings = &ctx.settings;
    let share = settings.chunk_budget / pieces.max(1) / CHARS_PER_WORD;
    LengthHint::chunk(
        share.clamp(1, settings.summary_max_words.max(1)),
        settings.summary_min_words,
    )
    .combine()
}

/// One aggregation-stage model call, retried with backoff while the backend is unavailable.
async fn summarize_with_retry(
    ctx: &PipelineContext,
    text: &str,
    hint: &LengthHint,
) -> Result<String, AggregationError> {
    let attempts = ctx.settings.max_retries.max(1);
    let mut attempt = 1;

    loop {
        match ctx.guarded_summarize(text, hint).await {
            Ok(summary) => return Ok(summary),
            Err(error) if error.is_retryable() && attempt < attempts => {
                let delay = retry_backoff(ctx.settings.retry_backoff, attempt);
                warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Aggregation call failed; retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(error) => return Err(AggregationError::Summarization(error)),
        }
    }
}
