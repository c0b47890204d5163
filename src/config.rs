use serde::Deserialize;
use std::env;
use std::str::FromStr;
use std::sync::OnceLock;
use thiserror::Error;

/// Errors encountered while loading configuration from environment variables.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Required environment variable was not provided.
    #[error("Missing environment variable: {0}")]
    MissingVariable(String),
    /// Environment variable contained a value that could not be parsed.
    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(String),
}

/// Runtime configuration for the Policy Digest service.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Path of the SQLite database backing the job store.
    pub database_path: String,
    /// Optional override for the HTTP server port.
    pub server_port: Option<u16>,
    /// Backend used to summarize chunks.
    pub summarization_provider: SummarizationProvider,
    /// Model identifier passed to the backend; defaults per provider when absent.
    pub summarization_model: Option<String>,
    /// Base URL of the local Ollama runtime.
    pub ollama_url: Option<String>,
    /// API key for the hosted OpenAI-compatible backend.
    pub openai_api_key: Option<String>,
    /// Base URL override for the OpenAI-compatible backend.
    pub openai_base_url: Option<String>,
    /// Token for the Hugging Face inference API.
    pub hf_token: Option<String>,
    /// Base URL override for the Hugging Face inference API.
    pub hf_inference_url: Option<String>,
    /// Upper word budget requested from the model per summary.
    pub summary_max_words: usize,
    /// Lower word bound requested from models that honour one.
    pub summary_min_words: usize,
    /// Policy focus injected into prompts.
    pub summary_focus: String,
    /// Output language requested from the model.
    pub summary_language: String,
    /// Per-call model timeout in seconds.
    pub model_timeout_secs: u64,
    /// Optional override for the automatic chunk budget (characters).
    pub chunk_size: Option<usize>,
    /// Characters of preceding context carried into each chunk.
    pub chunk_overlap: usize,
    /// Number of concurrent task executors.
    pub worker_count: usize,
    /// Transient failures tolerated per task before it is marked failed.
    pub max_retries: u32,
    /// Base delay before a retried task is re-queued.
    pub retry_backoff_ms: u64,
    /// Lease granted to a worker holding a running task.
    pub lease_secs: u64,
    /// Interval between reaper sweeps.
    pub reaper_interval_secs: u64,
    /// Optional broker depth above which submissions are rejected.
    pub max_queue_depth: Option<usize>,
    /// Run one final combine pass over the joined chunk summaries.
    pub aggregate_final_pass: bool,
    /// Optional limit on the number of pages read from a document.
    pub extract_max_pages: Option<usize>,
    /// Drop table-of-contents lines and pages during extraction.
    pub extract_strip_toc: bool,
    /// Extraction timeout in seconds.
    pub extract_timeout_secs: u64,
    /// Maximum accepted document size for HTTP submissions.
    pub max_document_bytes: usize,
    /// Summarize only paragraphs mentioning relevance keywords, falling back to the full text.
    pub relevance_filter: bool,
    /// Keywords for the relevance filter; the built-in list applies when empty.
    pub relevance_keywords: Vec<String>,
    /// Add a plain-language impact explanation to every finished summary.
    pub explanations_enabled: bool,
    /// Extra languages each finished summary is rendered in.
    pub summary_translations: Vec<String>,
    /// Append logs to this file instead of `logs/policy-digest.log`.
    pub log_file: Option<String>,
}

/// Supported summarization backends.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SummarizationProvider {
    /// Local Ollama runtime.
    Ollama,
    /// Hosted OpenAI-compatible chat completions API.
    OpenAI,
    /// Hosted Hugging Face inference API.
    HuggingFace,
    /// Deterministic in-process extractive summarizer.
    Extractive,
}

const DEFAULT_FOCUS: &str =
    "gender equality, social inclusion, reduced inequalities and sustainable development";

impl Config {
    /// Load configuration from environment variables, performing validation along the way.
    pub fn from_env() -> Result<Self, ConfigError> {
        let worker_default = std::thread::available_parallelism()
            .map(|value| value.get().min(4))
            .unwrap_or(2);
        let model_timeout_secs = parse_or("MODEL_TIMEOUT_SECS", 60)?;

        Ok(Self {
            database_path: load_env_optional("DATABASE_PATH")
                .unwrap_or_else(|| "policy-digest.db".to_string()),
            server_port: parse_optional("SERVER_PORT")?,
            summarization_provider: load_env_optional("SUMMARIZATION_PROVIDER")
                .map(|value| {
                    value
                        .parse()
                        .map_err(|()| ConfigError::InvalidValue("SUMMARIZATION_PROVIDER".into()))
                })
                .transpose()?
                .unwrap_or(SummarizationProvider::Extractive),
            summarization_model: load_env_optional("SUMMARIZATION_MODEL"),
            ollama_url: load_env_optional("OLLAMA_URL"),
            openai_api_key: load_env_optional("OPENAI_API_KEY"),
            openai_base_url: load_env_optional("OPENAI_BASE_URL"),
            hf_token: load_env_optional("HF_TOKEN"),
            hf_inference_url: load_env_optional("HF_INFERENCE_URL"),
            summary_max_words: parse_or("SUMMARY_MAX_WORDS", 150)?,
            summary_min_words: parse_or("SUMMARY_MIN_WORDS", 50)?,
            summary_focus: load_env_optional("SUMMARY_FOCUS")
                .unwrap_or_else(|| DEFAULT_FOCUS.to_string()),
            summary_language: load_env_optional("SUMMARY_LANGUAGE")
                .unwrap_or_else(|| "English".to_string()),
            model_timeout_secs,
            chunk_size: parse_optional("CHUNK_SIZE")?,
            chunk_overlap: parse_or("CHUNK_OVERLAP", 0)?,
            worker_count: parse_or("WORKER_COUNT", worker_default)?,
            max_retries: parse_or("MAX_RETRIES", 3)?,
            retry_backoff_ms: parse_or("RETRY_BACKOFF_MS", 2_000)?,
            lease_secs: parse_or("LEASE_SECS", model_timeout_secs.saturating_mul(2))?,
            reaper_interval_secs: parse_or("REAPER_INTERVAL_SECS", 15)?,
            max_queue_depth: parse_optional("MAX_QUEUE_DEPTH")?,
            aggregate_final_pass: parse_flag("AGGREGATE_FINAL_PASS")?,
            extract_max_pages: parse_optional("EXTRACT_MAX_PAGES")?,
            extract_strip_toc: parse_flag("EXTRACT_STRIP_TOC")?,
            extract_timeout_secs: parse_or("EXTRACT_TIMEOUT_SECS", 60)?,
            max_document_bytes: parse_or("MAX_DOCUMENT_BYTES", 25 * 1024 * 1024)?,
            relevance_filter: parse_flag("RELEVANCE_FILTER")?,
            relevance_keywords: load_env_optional("RELEVANCE_KEYWORDS")
                .map(|value| parse_list(&value))
                .unwrap_or_default(),
            explanations_enabled: parse_flag("EXPLANATIONS_ENABLED")?,
            summary_translations: load_env_optional("SUMMARY_TRANSLATIONS")
                .map(|value| parse_list(&value))
                .unwrap_or_default(),
            log_file: load_env_optional("POLICY_DIGEST_LOG_FILE"),
        })
    }

    /// Model identifier to use, falling back to the provider default.
    pub fn effective_model(&self) -> String {
        self.summarization_model
            .clone()
            .unwrap_or_else(|| self.summarization_provider.default_model().to_string())
    }
}

impl SummarizationProvider {
    /// Default model identifier for the provider.
    pub fn default_model(self) -> &'static str {
        match self {
            Self::Ollama => "llama3.1",
            Self::OpenAI => "gpt-4o-mini",
            Self::HuggingFace => "facebook/bart-large-cnn",
            Self::Extractive => "extractive",
        }
    }
}

fn load_env_optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_optional<T: FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    load_env_optional(key)
        .map(|value| {
            value
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidValue(key.to_string()))
        })
        .transpose()
}

fn parse_or<T: FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    Ok(parse_optional(key)?.unwrap_or(default))
}

fn parse_flag(key: &str) -> Result<bool, ConfigError> {
    match load_env_optional(key) {
        None => Ok(false),
        Some(value) => match value.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidValue(key.to_string())),
        },
    }
}

/// Split a comma-separated value, dropping blanks and repeats.
fn parse_list(value: &str) -> Vec<String> {
    let mut items: Vec<String> = Vec::new();
    for item in value.split(',').map(str::trim).filter(|item| !item.is_empty()) {
        if !items.iter().any(|seen| seen.eq_ignore_ascii_case(item)) {
            items.push(item.to_string());
        }
    }
    items
}

impl FromStr for SummarizationProvider {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "ollama" => Ok(Self::Ollama),
            "openai" => Ok(Self::OpenAI),
            "huggingface" | "hf" => Ok(Self::HuggingFace),
            "extractive" | "local" => Ok(Self::Extractive),
            _ => Err(()),
        }
    }
}

static CONFIG: OnceLock<Config> = OnceLock::new();

/// Load configuration from the environment and install it in the global cache.
///
/// The first successful load wins; later calls return the cached configuration.
pub fn init_config() -> Result<&'static Config, ConfigError> {
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;
    tracing::debug!(
        database = %config.database_path,
        provider = ?config.summarization_provider,
        model = %config.effective_model(),
        workers = config.worker_count,
        server_port = ?config.server_port,
        "Loaded configuration"
    );
    Ok(CONFIG.get_or_init(|| config))
}
