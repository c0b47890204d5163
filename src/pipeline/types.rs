//! Data model shared by the dispatcher, workers, aggregator and job store.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use time::{OffsetDateTime, format_description::well_known::Rfc3339};
use uuid::Uuid;

/// Identifier of a summarization job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

/// Identifier of a single chunk task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

macro_rules! uuid_id {
    ($name:ident) => {
        impl $name {
            /// Generate a fresh random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Wrap an existing UUID.
            pub fn from_uuid(id: Uuid) -> Self {
                Self(id)
            }

            /// Borrow the underlying UUID.
            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

uuid_id!(JobId);
uuid_id!(TaskId);

/// A submitted document. Immutable once constructed.
#[derive(Clone)]
pub struct Document {
    content: Vec<u8>,
    media_type: String,
    content_hash: String,
    password: Option<String>,
    region: Option<String>,
}

impl Document {
    /// Wrap raw bytes with their declared media type.
    ///
    /// Media type parameters (`; charset=...`) are stripped and the essence lowercased.
    pub fn new(content: Vec<u8>, media_type: impl AsRef<str>) -> Self {
        let media_type = media_type
            .as_ref()
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_lowercase();
        let content_hash = hex::encode(Sha256::digest(&content));
        Self {
            content,
            media_type,
            content_hash,
            password: None,
            region: None,
        }
    }

    /// Attach a decryption password for encrypted PDFs. The password is never persisted.
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Name the country or region the document covers; quoted in impact explanations.
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        let region = region.into();
        let region = region.trim();
        self.region = (!region.is_empty()).then(|| region.to_string());
        self
    }

    /// Raw document bytes.
    pub fn content(&self) -> &[u8] {
        &self.content
    }

    /// Normalized media type essence, e.g. `application/pdf`.
    pub fn media_type(&self) -> &str {
        &self.media_type
    }

    /// Length of the raw content in bytes.
    pub fn byte_len(&self) -> usize {
        self.content.len()
    }

    /// Hex-encoded SHA-256 of the content.
    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    /// Decryption password supplied at submission.
    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    /// Region the document covers, if the submitter named one.
    pub fn region(&self) -> Option<&str> {
        self.region.as_deref()
    }
}

impl fmt::Debug for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Document")
            .field("media_type", &self.media_type)
            .field("byte_len", &self.content.len())
            .field("content_hash", &self.content_hash)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("region", &self.region)
            .finish()
    }
}

/// Lifecycle of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Created, tasks not yet enqueued.
    Pending,
    /// Tasks are enqueued or executing.
    Running,
    /// Finished with a best-effort summary; some chunks failed.
    PartiallyFailed,
    /// Finished without a summary.
    Failed,
    /// Finished with every chunk summarized.
    Succeeded,
    /// Cancelled by a caller.
    Cancelled,
}

/// Lifecycle of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Waiting in the broker.
    Queued,
    /// Held by a worker under a lease.
    Running,
    /// Summary stored.
    Succeeded,
    /// Gave up; cause stored.
    Failed,
    /// Skipped because the owning job was closed.
    Cancelled,
}

impl JobStatus {
    /// Whether no further transition can leave this status.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }

    /// Stable storage representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::PartiallyFailed => "PARTIALLY_FAILED",
            Self::Failed => "FAILED",
            Self::Succeeded => "SUCCEEDED",
            Self::Cancelled => "CANCELLED",
        }
    }
}

impl TaskStatus {
    /// Whether the task will not run again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    /// Stable storage representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "RUNNING" => Ok(Self::Running),
            "PARTIALLY_FAILED" => Ok(Self::PartiallyFailed),
            "FAILED" => Ok(Self::Failed),
            "SUCCEEDED" => Ok(Self::Succeeded),
            "CANCELLED" => Ok(Self::Cancelled),
            other => Err(format!("unknown job status '{other}'")),
        }
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "QUEUED" => Ok(Self::Queued),
            "RUNNING" => Ok(Self::Running),
            "SUCCEEDED" => Ok(Self::Succeeded),
            "FAILED" => Ok(Self::Failed),
            "CANCELLED" => Ok(Self::Cancelled),
            other => Err(format!("unknown task status '{other}'")),
        }
    }
}

/// Persisted job record.
#[derive(Debug, Clone)]
pub struct Job {
    /// Job identifier.
    pub id: JobId,
    /// Current status.
    pub status: JobStatus,
    /// Media type of the owned document.
    pub media_type: String,
    /// Size of the owned document in bytes.
    pub byte_len: usize,
    /// SHA-256 of the owned document.
    pub content_hash: String,
    /// Creation time.
    pub created_at: OffsetDateTime,
    /// Time the job reached a terminal status.
    pub completed_at: Option<OffsetDateTime>,
    /// Final or best-effort summary.
    pub summary: Option<String>,
    /// Failure cause, or the gap note of a partial summary.
    pub error: Option<String>,
    /// Region named at submission.
    pub region: Option<String>,
    /// Plain-language impact explanation of the summary.
    pub explanation: Option<String>,
    /// Summaries in additional languages, ordered by language tag.
    pub translations: Vec<Translation>,
    /// Task identifiers ordered by chunk index.
    pub task_ids: Vec<TaskId>,
    /// Tasks that have not reached a terminal status.
    pub remaining_tasks: u32,
}

/// Summary of a finished job rendered in another language.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Translation {
    /// Language the text is written in, as configured (e.g. `sw` or `Swahili`).
    pub language: String,
    /// Summary in that language.
    pub summary: String,
    /// Impact explanation in that language, when explanations are enabled.
    pub explanation: Option<String>,
}

/// Character span of a chunk inside the extracted document text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkSpan {
    /// First character, including any overlap carried from the previous chunk.
    pub start: usize,
    /// First character that belongs to this chunk alone.
    pub fresh_start: usize,
    /// One past the last character.
    pub end: usize,
}

/// Persisted task record.
#[derive(Debug, Clone)]
pub struct Task {
    /// Task identifier.
    pub id: TaskId,
    /// Owning job.
    pub job_id: JobId,
    /// Merge position within the job.
    pub chunk_index: u32,
    /// Chunk text to summarize.
    pub input: String,
    /// Position of the chunk in the extracted text.
    pub span: ChunkSpan,
    /// Current status.
    pub status: TaskStatus,
    /// Transient failures seen so far.
    pub retry_count: u32,
    /// Chunk summary once succeeded.
    pub summary: Option<String>,
    /// Last failure cause.
    pub error: Option<String>,
}

/// Failure of one chunk, as reported to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskFailure {
    /// Chunk index of the failed task.
    pub chunk_index: u32,
    /// Human-readable cause.
    pub cause: String,
}

/// Point-in-time view of a job returned by `get_status`.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatusReport {
    /// Job identifier.
    pub job_id: JobId,
    /// Current status.
    pub status: JobStatus,
    /// Final or best-effort summary.
    pub summary: Option<String>,
    /// Failure cause or partial-summary gap note.
    pub error: Option<String>,
    /// Plain-language impact explanation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    /// Summaries in additional languages.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub translations: Vec<Translation>,
    /// Per-chunk failures.
    pub task_failures: Vec<TaskFailure>,
    /// Number of tasks created for the job.
    pub tasks_total: usize,
    /// Number of tasks that succeeded.
    pub tasks_succeeded: usize,
    /// RFC 3339 creation timestamp.
    pub created_at: String,
    /// RFC 3339 completion timestamp.
    pub completed_at: Option<String>,
}

impl JobStatusReport {
    /// Build a report from a job and its tasks.
    pub fn from_parts(job: &Job, tasks: &[Task]) -> Self {
        let task_failures = tasks
            .iter()
            .filter(|task| task.status == TaskStatus::Failed)
            .map(|task| TaskFailure {
                chunk_index: task.chunk_index,
                cause: task
                    .error
                    .clone()
                    .unwrap_or_else(|| "unknown failure".to_string()),
            })
            .collect();
        Self {
            job_id: job.id,
            status: job.status,
            summary: job.summary.clone(),
            error: job.error.clone(),
            explanation: job.explanation.clone(),
            translations: job.translations.clone(),
            task_failures,
            tasks_total: tasks.len(),
            tasks_succeeded: tasks
                .iter()
                .filter(|task| task.status == TaskStatus::Succeeded)
                .count(),
            created_at: format_timestamp(job.created_at),
            completed_at: job.completed_at.map(format_timestamp),
        }
    }
}

fn format_timestamp(value: OffsetDateTime) -> String {
    value.format(&Rfc3339).unwrap_or_else(|_| value.to_string())
}
