//! HTTP surface for the summarization pipeline.
//!
//! A compact Axum router over [`JobApi`]:
//!
//! - `POST /jobs` – Submit raw document bytes; the `Content-Type` header is the media type and
//!   an optional `X-Document-Password` header unlocks encrypted PDFs and `X-Document-Region`
//!   names the region quoted in impact explanations. Returns `202` with the job id, or `503`
//!   when the queue is full.
//! - `GET /jobs/:id` – Status report with the summary once available; `404` when unknown.
//! - `POST /jobs/:id/cancel` – Cancel a job that has not finished.
//! - `DELETE /jobs/:id` – Remove a job together with its tasks and document.
//! - `GET /metrics` – Pipeline counters.
//! - `GET /commands` – Machine-readable command catalog for quick discovery by tools/hosts.

use crate::pipeline::{DispatchError, Document, JobApi, JobId, JobStatusReport};
use crate::store::StoreError;
use axum::{
    Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, Path, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;

/// Header carrying the password of an encrypted document.
pub const PASSWORD_HEADER: &str = "x-document-password";
/// Header naming the country or region a document covers.
pub const REGION_HEADER: &str = "x-document-region";

/// Build the HTTP router exposing the job API surface.
///
/// Request bodies larger than `max_document_bytes` are rejected with `413`.
pub fn create_router<S>(service: Arc<S>, max_document_bytes: usize) -> Router
where
    S: JobApi + 'static,
{
    Router::new()
        .route("/jobs", post(submit_job::<S>))
        .route("/jobs/:id", get(get_job::<S>).delete(delete_job::<S>))
        .route("/jobs/:id/cancel", post(cancel_job::<S>))
        .route("/metrics", get(get_metrics::<S>))
        .route("/commands", get(get_commands))
        .layer(DefaultBodyLimit::max(max_document_bytes))
        .with_state(service)
}

/// Response body for `POST /jobs`.
#[derive(Serialize)]
struct SubmitResponse {
    job_id: JobId,
}

/// Accept a document for summarization.
async fn submit_job<S>(
    State(service): State<Arc<S>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<SubmitResponse>), AppError>
where
    S: JobApi,
{
    let media_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.trim().is_empty())
        .ok_or(AppError::MissingMediaType)?;
    if body.is_empty() {
        return Err(AppError::BadRequest("request body is empty".into()));
    }

    let mut document = Document::new(body.to_vec(), media_type);
    if let Some(password) = headers
        .get(PASSWORD_HEADER)
        .and_then(|value| value.to_str().ok())
    {
        document = document.with_password(password);
    }
    if let Some(region) = headers
        .get(REGION_HEADER)
        .and_then(|value| value.to_str().ok())
    {
        document = document.with_region(region);
    }

    let job_id = service.submit(document).await?;
    tracing::info!(%job_id, bytes = body.len(), "Submit request accepted");
    Ok((StatusCode::ACCEPTED, Json(SubmitResponse { job_id })))
}

/// Return the status report of a job.
async fn get_job<S>(
    State(service): State<Arc<S>>,
    Path(id): Path<String>,
) -> Result<Json<JobStatusReport>, AppError>
where
    S: JobApi,
{
    let job_id = parse_job_id(&id)?;
    let report = service
        .status(job_id)
        .await?
        .ok_or(AppError::NotFound(job_id))?;
    Ok(Json(report))
}

/// Response body for `POST /jobs/:id/cancel`.
#[derive(Serialize)]
struct CancelResponse {
    cancelled: bool,
}

/// Cancel a job. `cancelled` is false when the job is unknown or already finished.
async fn cancel_job<S>(
    State(service): State<Arc<S>>,
    Path(id): Path<String>,
) -> Result<Json<CancelResponse>, AppError>
where
    S: JobApi,
{
    let job_id = parse_job_id(&id)?;
    let cancelled = service.cancel(job_id).await?;
    Ok(Json(CancelResponse { cancelled }))
}

/// Delete a job and everything it owns.
async fn delete_job<S>(
    State(service): State<Arc<S>>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError>
where
    S: JobApi,
{
    let job_id = parse_job_id(&id)?;
    if service.delete(job_id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound(job_id))
    }
}

/// Return the pipeline counters.
async fn get_metrics<S>(State(service): State<Arc<S>>) -> Json<crate::metrics::MetricsSnapshot>
where
    S: JobApi,
{
    Json(service.metrics_snapshot())
}

fn parse_job_id(raw: &str) -> Result<JobId, AppError> {
    raw.parse()
        .map_err(|_| AppError::BadRequest(format!("'{raw}' is not a valid job id")))
}

/// Descriptor for a single command in the discovery catalog.
#[derive(Serialize)]
struct CommandDescriptor {
    name: &'static str,
    method: &'static str,
    path: &'static str,
    description: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    request_example: Option<serde_json::Value>,
}

/// Response body for `GET /commands`.
#[derive(Serialize)]
struct CommandsResponse {
    commands: Vec<CommandDescriptor>,
}

/// Enumerate supported HTTP commands for discovery/UX in hosts and tools.
async fn get_commands() -> Json<CommandsResponse> {
    Json(CommandsResponse {
        commands: vec![
            CommandDescriptor {
                name: "submit",
                method: "POST",
                path: "/jobs",
                description: "Submit raw document bytes for summarization. Content-Type must be application/pdf or text/plain; X-Document-Password and X-Document-Region are optional. Response returns { \"job_id\": string } with status 202.",
                request_example: None,
            },
            CommandDescriptor {
                name: "status",
                method: "GET",
                path: "/jobs/:id",
                description: "Return job status, the summary once available with its explanation and translations, per-chunk failures and timestamps.",
                request_example: None,
            },
            CommandDescriptor {
                name: "cancel",
                method: "POST",
                path: "/jobs/:id/cancel",
                description: "Cancel a job that has not finished. Response returns { \"cancelled\": bool }.",
                request_example: None,
            },
            CommandDescriptor {
                name: "delete",
                method: "DELETE",
                path: "/jobs/:id",
                description: "Delete a job with its tasks and stored document.",
                request_example: None,
            },
            CommandDescriptor {
                name: "metrics",
                method: "GET",
                path: "/metrics",
                description: "Return pipeline counters useful for observability dashboards.",
                request_example: Some(json!({
                    "jobs_submitted": 3,
                    "jobs_succeeded": 2,
                    "tasks_succeeded": 14,
                    "task_retries": 1
                })),
            },
        ],
    })
}

enum AppError {
    Dispatch(DispatchError),
    Store(StoreError),
    MissingMediaType,
    BadRequest(String),
    NotFound(JobId),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::Dispatch(error @ DispatchError::QueueFull { .. }) => {
                (StatusCode::SERVICE_UNAVAILABLE, error.to_string())
            }
            Self::Dispatch(error) => {
                tracing::error!(error = %error, "Submission failed");
                (StatusCode::INTERNAL_SERVER_ERROR, error.to_string())
            }
            Self::Store(error) => {
                tracing::error!(error = %error, "Job store request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, error.to_string())
            }
            Self::MissingMediaType => (
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                "Content-Type header is required".to_string(),
            ),
            Self::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            Self::NotFound(job_id) => (StatusCode::NOT_FOUND, format!("job {job_id} not found")),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<DispatchError> for AppError {
    fn from(inner: DispatchError) -> Self {
        Self::Dispatch(inner)
    }
}

impl From<StoreError> for AppError {
    fn from(inner: StoreError) -> Self {
        Self::Store(inner)
    }
}

#[cfg(test)]
mod tests {
    use super::{PASSWORD_HEADER, REGION_HEADER, create_router, get_commands};
    use crate::metrics::MetricsSnapshot;
    use crate::pipeline::{
        DispatchError, Document, JobApi, JobId, JobStatus, JobStatusReport, TaskFailure,
        Translation,
    };
    use crate::store::StoreError;
    use async_trait::async_trait;
    use axum::{
        Router,
        body::{Body, to_bytes},
        http::{Method, Request, StatusCode},
        response::Response,
    };
    use std::sync::Arc;
    use tokio::sync::Mutex;
    use tower::ServiceExt;

    #[derive(Clone, Debug)]
    struct SubmitCall {
        media_type: String,
        bytes: usize,
        has_password: bool,
        region: Option<String>,
    }

    #[derive(Default)]
    struct StubJobService {
        calls: Mutex<Vec<SubmitCall>>,
        job_id: Option<JobId>,
        queue_full: bool,
    }

    impl StubJobService {
        fn with_job(job_id: JobId) -> Self {
            Self {
                job_id: Some(job_id),
                ..Self::default()
            }
        }

        async fn recorded_calls(&self) -> Vec<SubmitCall> {
            self.calls.lock().await.clone()
        }
    }

    #[async_trait]
    impl JobApi for StubJobService {
        async fn submit(&self, document: Document) -> Result<JobId, DispatchError> {
            if self.queue_full {
                return Err(DispatchError::QueueFull {
                    depth: 10,
                    limit: 10,
                });
            }
            self.calls.lock().await.push(SubmitCall {
                media_type: document.media_type().to_string(),
                bytes: document.byte_len(),
                has_password: document.password().is_some(),
                region: document.region().map(str::to_string),
            });
            Ok(self.job_id.unwrap_or_default())
        }

        async fn status(&self, job_id: JobId) -> Result<Option<JobStatusReport>, StoreError> {
            if Some(job_id) != self.job_id {
                return Ok(None);
            }
            Ok(Some(JobStatusReport {
                job_id,
                status: JobStatus::PartiallyFailed,
                summary: Some("Budget raises clinic funding.".into()),
                error: Some("1 of 2 chunks failed; summary omits chunks 1".into()),
                explanation: Some("More money goes to clinics that serve mothers.".into()),
                translations: vec![Translation {
                    language: "sw".into(),
                    summary: "Bajeti inaongeza fedha za zahanati.".into(),
                    explanation: None,
                }],
                task_failures: vec![TaskFailure {
                    chunk_index: 1,
                    cause: "model rejected input".into(),
                }],
                tasks_total: 2,
                tasks_succeeded: 1,
                created_at: "2026-01-05T10:00:00Z".into(),
                completed_at: Some("2026-01-05T10:00:09Z".into()),
            }))
        }

        async fn cancel(&self, job_id: JobId) -> Result<bool, StoreError> {
            Ok(Some(job_id) == self.job_id)
        }

        async fn delete(&self, job_id: JobId) -> Result<bool, StoreError> {
            Ok(Some(job_id) == self.job_id)
        }

        fn metrics_snapshot(&self) -> MetricsSnapshot {
            MetricsSnapshot {
                jobs_submitted: 4,
                jobs_succeeded: 3,
                ..MetricsSnapshot::default()
            }
        }
    }

    async fn send(app: Router, request: Request<Body>) -> Response {
        app.oneshot(request).await.expect("router response")
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body bytes");
        serde_json::from_slice(&body).expect("json body")
    }

    #[tokio::test]
    async fn commands_catalog_exposes_job_endpoints() {
        let response = get_commands().await;
        let commands = response.0.commands;
        let submit = commands
            .iter()
            .find(|cmd| cmd.name == "submit")
            .expect("submit command present");

        assert_eq!(submit.method, "POST");
        assert_eq!(submit.path, "/jobs");
        assert!(commands.iter().any(|cmd| cmd.name == "cancel"));
        assert!(commands.len() >= 5);
    }

    #[tokio::test]
    async fn submit_returns_accepted_with_job_id() {
        let job_id = JobId::new();
        let service = Arc::new(StubJobService::with_job(job_id));
        let app = create_router(service.clone(), 1024);

        let response = send(
            app,
            Request::builder()
                .method(Method::POST)
                .uri("/jobs")
                .header("content-type", "application/pdf")
                .header(PASSWORD_HEADER, "hunter2")
                .header(REGION_HEADER, "Kenya")
                .body(Body::from(vec![b'%'; 32]))
                .expect("request"),
        )
        .await;

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let json = json_body(response).await;
        assert_eq!(json["job_id"], job_id.to_string());

        let calls = service.recorded_calls().await;
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].media_type, "application/pdf");
        assert_eq!(calls[0].bytes, 32);
        assert!(calls[0].has_password);
        assert_eq!(calls[0].region.as_deref(), Some("Kenya"));
    }

    #[tokio::test]
    async fn submit_requires_content_type_and_body() {
        let service = Arc::new(StubJobService::default());
        let app = create_router(service.clone(), 1024);

        let missing_type = send(
            app.clone(),
            Request::builder()
                .method(Method::POST)
                .uri("/jobs")
                .body(Body::from("text"))
                .expect("request"),
        )
        .await;
        assert_eq!(missing_type.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);

        let empty = send(
            app,
            Request::builder()
                .method(Method::POST)
                .uri("/jobs")
                .header("content-type", "text/plain")
                .body(Body::empty())
                .expect("request"),
        )
        .await;
        assert_eq!(empty.status(), StatusCode::BAD_REQUEST);
        assert!(service.recorded_calls().await.is_empty());
    }

    #[tokio::test]
    async fn oversized_body_is_rejected() {
        let app = create_router(Arc::new(StubJobService::default()), 16);
        let response = send(
            app,
            Request::builder()
                .method(Method::POST)
                .uri("/jobs")
                .header("content-type", "text/plain")
                .body(Body::from(vec![b'a'; 64]))
                .expect("request"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn full_queue_maps_to_service_unavailable() {
        let service = Arc::new(StubJobService {
            queue_full: true,
            ..StubJobService::default()
        });
        let response = send(
            create_router(service, 1024),
            Request::builder()
                .method(Method::POST)
                .uri("/jobs")
                .header("content-type", "text/plain")
                .body(Body::from("Budget text."))
                .expect("request"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let json = json_body(response).await;
        assert!(json["error"].as_str().unwrap_or_default().contains("queue is full"));
    }

    #[tokio::test]
    async fn status_reports_known_jobs_and_404s_unknown_ones() {
        let job_id = JobId::new();
        let app = create_router(Arc::new(StubJobService::with_job(job_id)), 1024);

        let response = send(
            app.clone(),
            Request::builder()
                .uri(format!("/jobs/{job_id}"))
                .body(Body::empty())
                .expect("request"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let json = json_body(response).await;
        assert_eq!(json["status"], "PARTIALLY_FAILED");
        assert_eq!(json["summary"], "Budget raises clinic funding.");
        assert_eq!(json["task_failures"][0]["chunk_index"], 1);
        assert_eq!(json["tasks_total"], 2);
        assert_eq!(
            json["explanation"],
            "More money goes to clinics that serve mothers."
        );
        assert_eq!(json["translations"][0]["language"], "sw");
        assert!(json["translations"][0]["explanation"].is_null());

        let unknown = send(
            app.clone(),
            Request::builder()
                .uri(format!("/jobs/{}", JobId::new()))
                .body(Body::empty())
                .expect("request"),
        )
        .await;
        assert_eq!(unknown.status(), StatusCode::NOT_FOUND);

        let malformed = send(
            app,
            Request::builder()
                .uri("/jobs/not-a-uuid")
                .body(Body::empty())
                .expect("request"),
        )
        .await;
        assert_eq!(malformed.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn cancel_and_delete_routes() {
        let job_id = JobId::new();
        let app = create_router(Arc::new(StubJobService::with_job(job_id)), 1024);

        let cancelled = send(
            app.clone(),
            Request::builder()
                .method(Method::POST)
                .uri(format!("/jobs/{job_id}/cancel"))
                .body(Body::empty())
                .expect("request"),
        )
        .await;
        assert_eq!(cancelled.status(), StatusCode::OK);
        assert_eq!(json_body(cancelled).await["cancelled"], true);

        let deleted = send(
            app.clone(),
            Request::builder()
                .method(Method::DELETE)
                .uri(format!("/jobs/{job_id}"))
                .body(Body::empty())
                .expect("request"),
        )
        .await;
        assert_eq!(deleted.status(), StatusCode::NO_CONTENT);

        let missing = send(
            app,
            Request::builder()
                .method(Method::DELETE)
                .uri(format!("/jobs/{}", JobId::new()))
                .body(Body::empty())
                .expect("request"),
        )
        .await;
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn metrics_route_returns_counters() {
        let app = create_router(Arc::new(StubJobService::default()), 1024);
        let response = send(
            app,
            Request::builder()
                .uri("/metrics")
                .body(Body::empty())
                .expect("request"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let json = json_body(response).await;
        assert_eq!(json["jobs_submitted"], 4);
        assert_eq!(json["jobs_succeeded"], 3);
        assert_eq!(json["task_retries"], 0);
    }
}
