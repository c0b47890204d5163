//! Tracing configuration and log routing.
//!
//! Logs go to stdout through a compact formatter and to a file: the path configured through
//! `POLICY_DIGEST_LOG_FILE` when set, `logs/policy-digest.log` otherwise. Workers log from many
//! tasks at once, so the file layer uses a non‑blocking writer. It also records the close of
//! every `job` and `task` span with its busy and idle time, which is how slow chunks and slow
//! aggregations show up in the file.
use std::path::PathBuf;
use std::sync::OnceLock;

use crate::pipeline::{JobId, Task};
use tracing::{Span, info_span};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const DEFAULT_LOG_DIR: &str = "logs";
const DEFAULT_LOG_FILE: &str = "policy-digest.log";

static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Span covering work done for a whole job, such as aggregation.
pub fn job_span(job_id: JobId) -> Span {
    info_span!("job", %job_id)
}

/// Span covering one claimed chunk task.
pub fn task_span(task: &Task) -> Span {
    info_span!(
        "task",
        job_id = %task.job_id,
        task_id = %task.id,
        chunk_index = task.chunk_index,
        retry_count = task.retry_count,
    )
}

/// Configure tracing subscribers for stdout and file logging.
///
/// - Respects `RUST_LOG` for filtering (defaults to `info`).
/// - Installs a compact stdout layer and, when available, a file layer.
/// - Uses a global guard to keep the non‑blocking writer alive for the process lifetime.
pub fn init_tracing(log_file: Option<&str>) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stdout_layer = fmt::layer().with_target(false).compact();

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer);

    if let Some(writer) = configure_file_writer(&log_target(log_file)) {
        let file_layer = fmt::layer()
            .with_writer(writer)
            .with_target(true)
            .with_ansi(false)
            .with_span_events(FmtSpan::CLOSE)
            .compact();

        let _ = registry.with(file_layer).try_init();
    } else {
        let _ = registry.try_init();
    }
}

/// Destination of the file layer.
#[derive(Debug, Clone, PartialEq, Eq)]
enum LogTarget {
    /// Append to an explicit file.
    File(PathBuf),
    /// Write `file` inside `dir`, creating the directory first.
    Directory { dir: PathBuf, file: String },
}

fn log_target(log_file: Option<&str>) -> LogTarget {
    match log_file.map(str::trim).filter(|path| !path.is_empty()) {
        Some(path) => LogTarget::File(PathBuf::from(path)),
        None => LogTarget::Directory {
            dir: PathBuf::from(DEFAULT_LOG_DIR),
            file: DEFAULT_LOG_FILE.to_string(),
        },
    }
}

/// Build a non‑blocking writer for file logging.
///
/// Returns `None` when the logs directory cannot be created or the target file cannot be opened.
fn configure_file_writer(target: &LogTarget) -> Option<NonBlocking> {
    match target {
        LogTarget::File(path) => match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
        {
            Ok(file) => {
                let (non_blocking, guard) = tracing_appender::non_blocking(file);
                let _ = LOG_GUARD.set(guard);
                Some(non_blocking)
            }
            Err(err) => {
                eprintln!("Failed to open log file {}: {err}", path.display());
                None
            }
        },
        LogTarget::Directory { dir, file } => {
            if let Err(err) = std::fs::create_dir_all(dir) {
                eprintln!("Failed to create logs directory: {err}");
                return None;
            }
            let file_appender = tracing_appender::rolling::never(dir, file);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let _ = LOG_GUARD.set(guard);
            Some(non_blocking)
        }
    }
}
