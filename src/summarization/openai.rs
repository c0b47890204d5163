//! OpenAI-compatible chat completions backend.

use super::prompt::{PromptSettings, SYSTEM_PROMPT, build_prompt};
use super::{
    LengthHint, SummarizationError, Summarizer, USER_AGENT, classify_status, transport_error,
};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

pub(crate) const DEFAULT_OPENAI_URL: &str = "https://api.openai.com/v1";

pub(crate) struct OpenAiSummarizer {
    http: Client,
    base_url: String,
    api_key: String,
    model: String,
    prompts: PromptSettings,
    max_input_chars: usize,
}

impl OpenAiSummarizer {
    pub(crate) fn new(
        base_url: String,
        api_key: String,
        model: String,
        prompts: PromptSettings,
        max_input_chars: usize,
    ) -> Self {
        let http = Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .expect("Failed to construct reqwest::Client for OpenAI");
        Self {
            http,
            base_url,
            api_key,
            model,
            prompts,
            max_input_chars,
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

#[async_trait]
impl Summarizer for OpenAiSummarizer {
    fn name(&self) -> &str {
        "openai"
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
            "temperature": 0.1,
            "max_tokens": hint.max_words * 2,
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": build_prompt(&self.prompts, text, hint) },
            ],
        });

        let response = self
            .http
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|error| transport_error("OpenAI", &self.base_url, error))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status("OpenAI", status, &body));
        }

        let body: ChatResponse = response.json().await.map_err(|error| {
            SummarizationError::ModelUnavailable(format!(
                "failed to decode OpenAI response: {error}"
            ))
        })?;

        body.choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .map(|content| content.trim().to_string())
            .ok_or_else(|| {
                SummarizationError::ModelUnavailable("OpenAI response contained no choices".into())
            })
    }
}
