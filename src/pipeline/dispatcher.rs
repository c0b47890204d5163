//! Submission path: persist the job, extract, chunk, create tasks and enqueue them.

use super::{ChunkSpan, Document, JobId, JobStatus, PipelineContext, TaskId};
use crate::broker::BrokerError;
use crate::chunking::{Chunker, ChunkingError};
use crate::extraction::extract_with_timeout;
use crate::store::{NewTask, StoreError};
use std::sync::Arc;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

/// Errors returned to the submitter.
///
/// Extraction failures are not among them: they end the job FAILED and the job id is
/// returned as usual.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The broker holds too many ids; retry later.
    #[error("queue is full ({depth} task ids waiting, limit {limit})")]
    QueueFull {
        /// Ids waiting in the broker.
        depth: usize,
        /// Configured limit.
        limit: usize,
    },
    /// Store access failed.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The broker refused the task batch.
    #[error(transparent)]
    Broker(#[from] BrokerError),
    /// The chunk budget is unusable.
    #[error(transparent)]
    Chunking(#[from] ChunkingError),
}

pub(crate) async fn dispatch(
    ctx: &PipelineContext,
    document: Document,
) -> Result<JobId, DispatchError> {
    if let Some(limit) = ctx.settings.max_queue_depth {
        let depth = ctx.broker.depth();
        if depth >= limit {
            warn!(depth, limit, "Rejecting submission: queue is full");
            return Err(DispatchError::QueueFull { depth, limit });
        }
    }

    let job_id = JobId::new();
    ctx.store
        .create_job(job_id, &document, OffsetDateTime::now_utc())
        .await?;
    ctx.metrics.record_submission();
    info!(
        %job_id,
        media_type = document.media_type(),
        bytes = document.byte_len(),
        content_hash = document.content_hash(),
        "Job created"
    );

    let extracted = match extract_with_timeout(
        Arc::new(document),
        ctx.settings.extract.clone(),
        ctx.settings.extract_timeout,
    )
    .await
    {
        Ok(extracted) => extracted,
        Err(error) => {
            warn!(%job_id, error = %error, "Extraction failed");
            fail_job(ctx, job_id, &format!("extraction failed: {error}")).await?;
            return Ok(job_id);
        }
    };
    if !extracted.skipped_pages().is_empty() {
        info!(
            %job_id,
            skipped = extracted.skipped_pages().len(),
            pages = extracted.page_count(),
            "Some pages contributed no text"
        );
    }

    let relevant = ctx
        .settings
        .relevance
        .as_ref()
        .and_then(|filter| filter.select(&extracted));
    let text = match &relevant {
        Some(relevant) => {
            info!(
                %job_id,
                kept_chars = relevant.chars().count(),
                chars = extracted.char_len(),
                "Summarizing keyword-relevant paragraphs only"
            );
            relevant.as_str()
        }
        None => {
            if ctx.settings.relevance.is_some() {
                info!(%job_id, "No keyword-relevant paragraphs; summarizing the full text");
            }
            extracted.text()
        }
    };

    let tasks = match plan_tasks(text, ctx.settings.chunk_budget, ctx.settings.chunk_overlap) {
        Ok(tasks) => tasks,
        Err(error) => {
            fail_job(ctx, job_id, &format!("chunking failed: {error}")).await?;
            return Err(error.into());
        }
    };

    match ctx.store.create_tasks(job_id, &tasks).await {
        Ok(true) => {}
        Ok(false) => {
            info!(%job_id, "Job closed before its tasks were created");
            return Ok(job_id);
        }
        Err(error) => {
            warn!(%job_id, error = %error, "Task creation failed");
            fail_job(ctx, job_id, &format!("task creation failed: {error}")).await?;
            return Err(error.into());
        }
    }

    let task_ids: Vec<TaskId> = tasks.iter().map(|task| task.id).collect();
    if let Err(error) = ctx.broker.enqueue_batch(&task_ids).await {
        warn!(%job_id, error = %error, "Enqueue failed");
        fail_job(ctx, job_id, &format!("enqueue failed: {error}")).await?;
        return Err(error.into());
    }

    if !ctx.store.mark_job_running(job_id).await? {
        debug!(%job_id, "Job left PENDING before dispatch finished");
    }
    info!(
        %job_id,
        tasks = task_ids.len(),
        chars = text.chars().count(),
        chunk_budget = ctx.settings.chunk_budget,
        "Job dispatched"
    );
    Ok(job_id)
}

async fn fail_job(ctx: &PipelineContext, job_id: JobId, cause: &str) -> Result<(), StoreError> {
    if ctx.store.fail_job(job_id, cause).await? {
        ctx.metrics.record_job_outcome(JobStatus::Failed);
    }
    Ok(())
}

/// One task per chunk, indices contiguous from zero.
pub(crate) fn plan_tasks(
    text: &str,
    budget: usize,
    overlap: usize,
) -> Result<Vec<NewTask>, ChunkingError> {
    Ok(Chunker::new(text, budget, overlap)?
        .map(|chunk| NewTask {
            id: TaskId::new(),
            chunk_index: chunk.index,
            input: chunk.text.to_string(),
            span: ChunkSpan {
                start: chunk.start,
                fresh_start: chunk.fresh_start,
                end: chunk.end,
            },
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extraction::{ExtractOptions, MEDIA_TYPE_TEXT, RelevanceFilter, extract};
    use crate::pipeline::testing::context;
    use crate::pipeline::{PipelineSettings, TaskStatus};
    use crate::summarization::ExtractiveSummarizer;

    fn policy_text() -> String {
        (0..12)
            .map(|index| {
                format!("Paragraph {index} allocates funds to district clinics and rural schools.\n\n")
            })
            .collect()
    }

    fn settings(budget: usize) -> PipelineSettings {
        PipelineSettings {
            chunk_budget: budget,
            ..PipelineSettings::default()
        }
    }

    #[test]
    fn plan_tasks_covers_text_in_order() {
        let text = "alpha beta.\ngamma delta.\nepsilon zeta.";
        let tasks = plan_tasks(text, 14, 0).expect("plan");
        let indices: Vec<u32> = tasks.iter().map(|task| task.chunk_index).collect();
        assert_eq!(indices, (0..tasks.len() as u32).collect::<Vec<_>>());
        let rebuilt: String = tasks.iter().map(|task| task.input.as_str()).collect();
        assert_eq!(rebuilt, text);
        assert_eq!(tasks.last().map(|task| task.span.end), Some(text.chars().count()));
    }

    #[test]
    fn plan_tasks_rejects_zero_budget() {
        assert_eq!(
            plan_tasks("text", 0, 0).map(|tasks| tasks.len()),
            Err(ChunkingError::InvalidBudget)
        );
    }

    #[tokio::test]
    async fn dispatch_creates_and_enqueues_tasks() {
        let ctx = context(Arc::new(ExtractiveSummarizer::new()), settings(200));
        let document = Document::new(policy_text().into_bytes(), MEDIA_TYPE_TEXT);
        let expected = extract(&document, &ExtractOptions::default()).expect("extract");

        let job_id = dispatch(&ctx, document).await.expect("dispatch");

        let job = ctx.store.get_job(job_id).await.expect("get").expect("job");
        assert_eq!(job.status, JobStatus::Running);
        let tasks = ctx.store.list_tasks(job_id).await.expect("tasks");
        assert!(tasks.len() > 1);
        assert_eq!(job.remaining_tasks as usize, tasks.len());
        assert_eq!(ctx.broker.depth(), tasks.len());
        assert!(tasks.iter().all(|task| task.status == TaskStatus::Queued));
        assert!(tasks.iter().all(|task| task.input.chars().count() <= 200));

        let rebuilt: String = tasks.iter().map(|task| task.input.as_str()).collect();
        assert_eq!(rebuilt, expected.text());
        assert_eq!(ctx.metrics.snapshot().jobs_submitted, 1);
    }

    #[tokio::test]
    async fn extraction_failure_fails_job_without_tasks() {
        let ctx = context(Arc::new(ExtractiveSummarizer::new()), settings(200));
        let document = Document::new(b"<html></html>".to_vec(), "text/html");

        let job_id = dispatch(&ctx, document).await.expect("job id returned");

        let job = ctx.store.get_job(job_id).await.expect("get").expect("job");
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.as_deref().unwrap_or_default().contains("unsupported media type"));
        assert!(job.completed_at.is_some());
        assert!(ctx.store.list_tasks(job_id).await.expect("tasks").is_empty());
        assert_eq!(ctx.broker.depth(), 0);
        assert_eq!(ctx.metrics.snapshot().jobs_failed, 1);
    }

    #[tokio::test]
    async fn blank_document_fails_extraction() {
        let ctx = context(Arc::new(ExtractiveSummarizer::new()), settings(200));
        let job_id = dispatch(&ctx, Document::new(b" \n\n ".to_vec(), MEDIA_TYPE_TEXT))
            .await
            .expect("dispatch");
        let job = ctx.store.get_job(job_id).await.expect("get").expect("job");
        assert_eq!(job.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn full_queue_rejects_before_creating_a_job() {
        let ctx = context(
            Arc::new(ExtractiveSummarizer::new()),
            PipelineSettings {
                max_queue_depth: Some(2),
                ..settings(200)
            },
        );
        ctx.broker
            .enqueue_batch(&[TaskId::new(), TaskId::new()])
            .await
            .expect("fill");

        let error = dispatch(&ctx, Document::new(policy_text().into_bytes(), MEDIA_TYPE_TEXT))
            .await
            .expect_err("queue full");
        assert!(matches!(error, DispatchError::QueueFull { depth: 2, limit: 2 }));
        assert_eq!(ctx.metrics.snapshot().jobs_submitted, 0);
    }

    #[tokio::test]
    async fn closed_broker_fails_the_job() {
        let ctx = context(Arc::new(ExtractiveSummarizer::new()), settings(200));
        ctx.broker.close();

        let error = dispatch(&ctx, Document::new(policy_text().into_bytes(), MEDIA_TYPE_TEXT))
            .await
            .expect_err("closed");
        assert!(matches!(error, DispatchError::Broker(BrokerError::Closed)));
        assert_eq!(ctx.metrics.snapshot().jobs_failed, 1);
    }

    #[tokio::test]
    async fn identical_documents_become_separate_jobs() {
        let ctx = context(Arc::new(ExtractiveSummarizer::new()), settings(200));
        let first = dispatch(&ctx, Document::new(policy_text().into_bytes(), MEDIA_TYPE_TEXT))
            .await
            .expect("first");
        let second = dispatch(&ctx, Document::new(policy_text().into_bytes(), MEDIA_TYPE_TEXT))
            .await
            .expect("second");
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn relevance_filter_limits_chunks_to_matching_paragraphs() {
        let ctx = context(
            Arc::new(ExtractiveSummarizer::new()),
            PipelineSettings {
                relevance: Some(RelevanceFilter::default()),
                ..settings(4_000)
            },
        );
        let body = format!(
            "{}Scholarships for girls in secondary schools are extended to all counties.\n\n",
            policy_text()
        );

        let job_id = dispatch(&ctx, Document::new(body.into_bytes(), MEDIA_TYPE_TEXT))
            .await
            .expect("dispatch");

        let tasks = ctx.store.list_tasks(job_id).await.expect("tasks");
        assert_eq!(tasks.len(), 1);
        assert_eq!(
            tasks[0].input,
            "Scholarships for girls in secondary schools are extended to all counties."
        );
    }

    #[tokio::test]
    async fn relevance_filter_falls_back_to_full_text() {
        let ctx = context(
            Arc::new(ExtractiveSummarizer::new()),
            PipelineSettings {
                relevance: Some(RelevanceFilter::default()),
                ..settings(4_000)
            },
        );
        let document = Document::new(policy_text().into_bytes(), MEDIA_TYPE_TEXT);
        let expected = extract(&document, &ExtractOptions::default()).expect("extract");

        let job_id = dispatch(&ctx, document).await.expect("dispatch");

        let tasks = ctx.store.list_tasks(job_id).await.expect("tasks");
        let rebuilt: String = tasks.iter().map(|task| task.input.as_str()).collect();
        assert_eq!(rebuilt, expected.text());
    }
}
