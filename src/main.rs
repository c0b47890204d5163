//! Policy Digest entrypoint.
//!
//! `serve` (the default) runs the HTTP surface and the worker pool; `summarize` pushes one file
//! through the same pipeline and prints the result once the job finishes.
use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use policy_digest::{
    api,
    broker::MemoryBroker,
    config::{self, Config},
    extraction::{MEDIA_TYPE_PDF, MEDIA_TYPE_TEXT},
    logging,
    pipeline::{Document, JobStatus, Pipeline, PipelineSettings},
    store::SqliteJobStore,
    summarization,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

#[derive(Parser)]
#[command(
    name = "policy-digest",
    about = "Summarize government documents through an asynchronous job pipeline"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP API and the worker pool.
    Serve,
    /// Summarize one document and print the result.
    Summarize {
        /// Path of the document to summarize.
        path: PathBuf,
        /// Media type; inferred from the file extension when omitted.
        #[arg(long)]
        media_type: Option<String>,
        /// Password for an encrypted PDF.
        #[arg(long)]
        password: Option<String>,
        /// Country or region the document covers, quoted in impact explanations.
        #[arg(long)]
        region: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = config::init_config().context("failed to load configuration")?;
    logging::init_tracing(config.log_file.as_deref());

    let pipeline = Arc::new(build_pipeline(config)?);
    let recovered = pipeline
        .recover()
        .await
        .context("failed to recover unfinished work")?;
    if !recovered.is_empty() {
        tracing::info!(
            tasks = recovered.tasks,
            aggregations = recovered.aggregations,
            "Resuming work left by a previous run"
        );
    }
    pipeline.start();

    let outcome = match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(Arc::clone(&pipeline), config).await,
        Command::Summarize {
            path,
            media_type,
            password,
            region,
        } => summarize_file(&pipeline, &path, media_type, password, region).await,
    };

    pipeline.shutdown().await;
    outcome
}

fn build_pipeline(config: &Config) -> Result<Pipeline> {
    let store = SqliteJobStore::open(&config.database_path)
        .with_context(|| format!("failed to open job store at {}", config.database_path))?;
    let summarizer =
        summarization::build_summarizer(config).context("failed to configure summarizer")?;
    Ok(Pipeline::new(
        Arc::new(store),
        Arc::new(MemoryBroker::new()),
        summarizer,
        PipelineSettings::from_config(config),
    ))
}

async fn serve(pipeline: Arc<Pipeline>, config: &Config) -> Result<()> {
    let app = api::create_router(pipeline, config.max_document_bytes);
    let (listener, port) = bind_listener(config)
        .await
        .context("failed to bind listener")?;
    tracing::info!("Listening on http://0.0.0.0:{}", port);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown requested");
        })
        .await
        .context("HTTP server terminated unexpectedly")
}

async fn summarize_file(
    pipeline: &Pipeline,
    path: &Path,
    media_type: Option<String>,
    password: Option<String>,
    region: Option<String>,
) -> Result<()> {
    let bytes =
        std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let media_type = match media_type {
        Some(media_type) => media_type,
        None => infer_media_type(path)?.to_string(),
    };
    let mut document = Document::new(bytes, media_type);
    if let Some(password) = password {
        document = document.with_password(password);
    }
    if let Some(region) = region {
        document = document.with_region(region);
    }

    let job_id = pipeline
        .submit(document)
        .await
        .context("failed to submit document")?;
    tracing::info!(%job_id, path = %path.display(), "Waiting for summary");
    let report = pipeline
        .wait_for_terminal(job_id, Duration::from_millis(250))
        .await
        .context("failed to poll job status")?;

    if let Some(summary) = &report.summary {
        println!("{summary}");
    }
    if let Some(explanation) = &report.explanation {
        println!("\n{explanation}");
    }
    for translation in &report.translations {
        println!("\n[{}]\n{}", translation.language, translation.summary);
        if let Some(explanation) = &translation.explanation {
            println!("\n{explanation}");
        }
    }
    match report.status {
        JobStatus::Succeeded => Ok(()),
        JobStatus::PartiallyFailed => {
            eprintln!(
                "warning: {}",
                report.error.as_deref().unwrap_or("some chunks failed")
            );
            Ok(())
        }
        status => bail!(
            "job {job_id} ended {status}: {}",
            report.error.as_deref().unwrap_or("no cause recorded")
        ),
    }
}

fn infer_media_type(path: &Path) -> Result<&'static str> {
    match path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("pdf") => Ok(MEDIA_TYPE_PDF),
        Some("txt" | "text" | "md") => Ok(MEDIA_TYPE_TEXT),
        _ => bail!(
            "cannot infer media type of {}; pass --media-type",
            path.display()
        ),
    }
}

async fn bind_listener(config: &Config) -> Result<(TcpListener, u16), std::io::Error> {
    use std::net::Ipv4Addr;

    if let Some(port) = config.server_port {
        return TcpListener::bind((Ipv4Addr::UNSPECIFIED, port))
            .await
            .map(|listener| (listener, port));
    }

    const PORT_RANGE: std::ops::RangeInclusive<u16> = 4100..=4199;
    for port in PORT_RANGE {
        match TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await {
            Ok(listener) => {
                tracing::debug!(port, "Bound server port");
                return Ok((listener, port));
            }
            Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
                tracing::debug!(port, "Port already in use; trying next");
                continue;
            }
            Err(err) => return Err(err),
        }
    }

    Err(std::io::Error::new(
        std::io::ErrorKind::AddrNotAvailable,
        "No available port found in range 4100-4199",
    ))
}
