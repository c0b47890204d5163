//! Ollama `/api/generate` backend.

use super::prompt::{PromptSettings, SYSTEM_PROMPT, build_prompt};
use super::{
    LengthHint, SummarizationError, Summarizer, USER_AGENT, classify_status, transport_error,
};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

pub(crate) const DEFAULT_OLLAMA_URL: &str = "http://127.0.0.1:11434";

pub(crate) struct OllamaSummarizer {
    http: Client,
    base_url: String,
    model: String,
    prompts: PromptSettings,
    max_input_chars: usize,
}

impl OllamaSummarizer {
    pub(crate) fn new(
        base_url: String,
        model: String,
        prompts: PromptSettings,
        max_input_chars: usize,
    ) -> Self {
        let http = Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .expect("Failed to construct reqwest::Client for Ollama");
        Self {
            http,
            base_url,
            model,
            prompts,
            max_input_chars,
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/api/generate", self.base_url.trim_end_matches('/'))
    }
}

#[derive(Debug, Deserialize)]
struct OllamaResponse {
    response: String,
    done: bool,
}

#[async_trait]
impl Summarizer for OllamaSummarizer {
    fn name(&self) -> &str {
        "ollama"
    }

    fn max_input_chars(&self) -> usize {
        self.max_input_chars
    }

    async fn summarize(
        &self,
        text: &str,
        hint: &LengthHint,
    ) -> Result<String, SummarizationError> {
        let payload = json!({
            "model": self.model,
            "system": SYSTEM_PROMPT,
            "prompt": build_prompt(&self.prompts, text, hint),
            "stream": false,
            "options": {
                // Lower temperature for deterministic summaries.
                "temperature": 0.1,
                "num_predict": hint.max_words * 2,
            }
        });

        let response = self
            .http
            .post(self.endpoint())
            .json(&payload)
            .send()
            .await
            .map_err(|error| transport_error("Ollama", &self.base_url, error))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status("Ollama", status, &body));
        }

        let body: OllamaResponse = response.json().await.map_err(|error| {
            SummarizationError::ModelUnavailable(format!(
                "failed to decode Ollama response: {error}"
            ))
        })?;

        if !body.done {
            return Err(SummarizationError::ModelUnavailable(
                "Ollama response incomplete (streaming not supported)".into(),
            ));
        }

        Ok(body.response.trim().to_string())
    }
}
