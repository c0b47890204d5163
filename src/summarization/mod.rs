//! Summarization backends behind a single capability trait.
//!
//! The pipeline talks to one [`Summarizer`] chosen at startup from configuration. Remote
//! backends (Ollama, OpenAI-compatible, Hugging Face inference) issue HTTP requests directly;
//! the extractive backend runs in-process and never fails for well-formed input.

mod extractive;
mod huggingface;
mod ollama;
mod openai;
mod prompt;

pub use extractive::ExtractiveSummarizer;
pub use prompt::PromptSettings;

use crate::chunking::{CHARS_PER_TOKEN, model_context_window};
use crate::config::{Config, ConfigError, SummarizationProvider};
use async_trait::async_trait;
use reqwest::StatusCode;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub(crate) const USER_AGENT: &str = "policy-digest/summary";

/// Which stage of the map/reduce the request belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SummaryPass {
    /// Summarize one chunk of the source document.
    Chunk,
    /// Merge previously produced summaries.
    Combine,
    /// Explain a finished summary in plain language for a general audience.
    Explain,
}

/// Requested output shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LengthHint {
    /// Upper bound on the summary length in words.
    pub max_words: usize,
    /// Lower bound on the summary length in words. Backends treat it as advisory.
    pub min_words: usize,
    /// Map, reduce or explanation stage.
    pub pass: SummaryPass,
    /// Output language for this call; the backend default applies when `None`.
    pub language: Option<String>,
    /// Region the document covers, quoted in explanations.
    pub region: Option<String>,
}

impl LengthHint {
    /// Hint for the chunk (map) stage.
    pub fn chunk(max_words: usize, min_words: usize) -> Self {
        Self {
            max_words,
            min_words: min_words.min(max_words),
            pass: SummaryPass::Chunk,
            language: None,
            region: None,
        }
    }

    /// Same bounds for the combine (reduce) stage.
    pub fn combine(self) -> Self {
        Self {
            pass: SummaryPass::Combine,
            ..self
        }
    }

    /// Same bounds for a plain-language explanation of the document's impact.
    pub fn explain(self, region: Option<&str>) -> Self {
        Self {
            pass: SummaryPass::Explain,
            region: region.map(str::to_string),
            ..self
        }
    }

    /// Request output in `language` instead of the backend default.
    pub fn in_language(self, language: impl Into<String>) -> Self {
        Self {
            language: Some(language.into()),
            ..self
        }
    }
}

/// Errors surfaced by summarization backends.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SummarizationError {
    /// Backend unreachable, timed out, overloaded or answered with something unusable.
    #[error("summarization model unavailable: {0}")]
    ModelUnavailable(String),
    /// Backend rejected the input itself; retrying the same input will not help.
    #[error("summarization model rejected input: {0}")]
    ModelInput(String),
}

impl SummarizationError {
    /// Whether the same request may succeed later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ModelUnavailable(_))
    }
}

/// Interface implemented by summarization backends.
#[async_trait]
pub trait Summarizer: Send + Sync {
    /// Short backend name used in logs.
    fn name(&self) -> &str;

    /// Largest input, in characters, the backend accepts in one call.
    fn max_input_chars(&self) -> usize;

    /// Summarize `text` within the length hint.
    async fn summarize(&self, text: &str, hint: &LengthHint)
    -> Result<String, SummarizationError>;
}

/// Run one summarization call bounded by `timeout`.
///
/// Inputs above [`Summarizer::max_input_chars`] are rejected before the backend is called, and
/// an empty answer counts as an unusable response.
pub async fn summarize_with_timeout(
    summarizer: &dyn Summarizer,
    text: &str,
    hint: &LengthHint,
    timeout: Duration,
) -> Result<String, SummarizationError> {
    let chars = text.chars().count();
    let limit = summarizer.max_input_chars();
    if chars > limit {
        return Err(SummarizationError::ModelInput(format!(
            "input of {chars} characters exceeds the {limit} character limit of {}",
            summarizer.name()
        )));
    }

    let summary = tokio::time::timeout(timeout, summarizer.summarize(text, hint))
        .await
        .map_err(|_| {
            SummarizationError::ModelUnavailable(format!(
                "{} did not answer within {}s",
                summarizer.name(),
                timeout.as_secs_f32()
            ))
        })??;

    let trimmed = summary.trim();
    if trimmed.is_empty() {
        return Err(SummarizationError::ModelUnavailable(format!(
            "{} returned an empty summary",
            summarizer.name()
        )));
    }
    Ok(trimmed.to_string())
}

/// Build the summarizer selected by `SUMMARIZATION_PROVIDER`.
pub fn build_summarizer(config: &Config) -> Result<Arc<dyn Summarizer>, ConfigError> {
    let model = config.effective_model();
    let prompts = PromptSettings {
        focus: config.summary_focus.clone(),
        language: config.summary_language.clone(),
    };
    let max_input_chars =
        model_context_window(config.summarization_provider, &model) * CHARS_PER_TOKEN;

    let summarizer: Arc<dyn Summarizer> = match config.summarization_provider {
        SummarizationProvider::Ollama => {
            let base_url = config
                .ollama_url
                .clone()
                .unwrap_or_else(|| ollama::DEFAULT_OLLAMA_URL.to_string());
            Arc::new(ollama::OllamaSummarizer::new(
                base_url,
                model,
                prompts,
                max_input_chars,
            ))
        }
        SummarizationProvider::OpenAI => {
            let api_key = config
                .openai_api_key
                .clone()
                .ok_or_else(|| ConfigError::MissingVariable("OPENAI_API_KEY".into()))?;
            let base_url = config
                .openai_base_url
                .clone()
                .unwrap_or_else(|| openai::DEFAULT_OPENAI_URL.to_string());
            Arc::new(openai::OpenAiSummarizer::new(
                base_url,
                api_key,
                model,
                prompts,
                max_input_chars,
            ))
        }
        SummarizationProvider::HuggingFace => {
            let token = config
                .hf_token
                .clone()
                .ok_or_else(|| ConfigError::MissingVariable("HF_TOKEN".into()))?;
            let base_url = config
                .hf_inference_url
                .clone()
                .unwrap_or_else(|| huggingface::DEFAULT_HF_URL.to_string());
            Arc::new(huggingface::HuggingFaceSummarizer::new(
                base_url,
                Some(token),
                model,
                max_input_chars,
            ))
        }
        SummarizationProvider::Extractive => Arc::new(ExtractiveSummarizer::new()),
    };

    tracing::info!(
        backend = summarizer.name(),
        model = %config.effective_model(),
        max_input_chars = summarizer.max_input_chars(),
        "Summarization backend ready"
    );
    Ok(summarizer)
}

/// Map a non-success HTTP status onto an error kind.
///
/// Malformed requests and oversized payloads are input errors; everything else (timeouts,
/// rate limits, server errors, auth and routing problems) is treated as the model being
/// unavailable.
pub(crate) fn classify_status(backend: &str, status: StatusCode, body: &str) -> SummarizationError {
    let message = format!("{backend} returned {status}: {}", body.trim());
    match status {
        StatusCode::BAD_REQUEST | StatusCode::PAYLOAD_TOO_LARGE | StatusCode::UNPROCESSABLE_ENTITY => {
            SummarizationError::ModelInput(message)
        }
        _ => SummarizationError::ModelUnavailable(message),
    }
}

/// Map a transport failure onto [`SummarizationError::ModelUnavailable`].
pub(crate) fn transport_error(backend: &str, base_url: &str, error: reqwest::Error) -> SummarizationError {
    SummarizationError::ModelUnavailable(format!("failed to reach {backend} at {base_url}: {error}"))
}
