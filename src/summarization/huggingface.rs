//! Hugging Face inference API backend for dedicated summarization models such as
//! `facebook/bart-large-cnn`.
//!
//! These models take raw text rather than a prompt, so focus and language settings do not
//! apply; the length hint maps onto the model's `min_length`/`max_length` parameters.

use super::{
    LengthHint, SummarizationError, Summarizer, USER_AGENT, classify_status, transport_error,
};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

pub(crate) const DEFAULT_HF_URL: &str = "https://api-inference.huggingface.co/models";

pub(crate) struct HuggingFaceSummarizer {
    http: Client,
    base_url: String,
    token: Option<String>,
    model: String,
    max_input_chars: usize,
}

impl HuggingFaceSummarizer {
    pub(crate) fn new(
        base_url: String,
        token: Option<String>,
        model: String,
        max_input_chars: usize,
    ) -> Self {
        let http = Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .expect("Failed to construct reqwest::Client for Hugging Face");
        Self {
            http,
            base_url,
            token,
            model,
            max_input_chars,
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), self.model)
    }
}

#[derive(Debug, Deserialize)]
struct SummaryOutput {
    summary_text: String,
}

#[async_trait]
impl Summarizer for HuggingFaceSummarizer {
    fn name(&self) -> &str {
        "huggingface"
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
            "inputs": text,
            "parameters": {
                "max_length": hint.max_words,
                "min_length": hint.min_words,
                "do_sample": false,
            },
            "options": { "wait_for_model": true },
        });

        let mut request = self.http.post(self.endpoint()).json(&payload);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|error| transport_error("Hugging Face", &self.base_url, error))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status("Hugging Face", status, &body));
        }

        let outputs: Vec<SummaryOutput> = response.json().await.map_err(|error| {
            SummarizationError::ModelUnavailable(format!(
                "unexpected Hugging Face response format: {error}"
            ))
        })?;

        outputs
            .into_iter()
            .next()
            .map(|output| output.summary_text.trim().to_string())
            .ok_or_else(|| {
                SummarizationError::ModelUnavailable("Hugging Face returned no summaries".into())
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::{Method::POST, MockServer};

    fn summarizer(base_url: String) -> HuggingFaceSummarizer {
        HuggingFaceSummarizer::new(
            base_url,
            Some("hf_test".into()),
            "facebook/bart-large-cnn".into(),
            4_000,
        )
    }

    #[tokio::test]
    async fn posts_length_parameters_to_model_path() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/facebook/bart-large-cnn")
                    .header("authorization", "Bearer hf_test")
                    .body_contains("\"max_length\":150")
                    .body_contains("\"min_length\":50");
                then.status(200)
                    .json_body(json!([{ "summary_text": "Funding for girls' schooling rises." }]));
            })
            .await;

        let summary = summarizer(server.base_url())
            .summarize("Long budget text.", &LengthHint::chunk(150, 50))
            .await
            .expect("summary");

        mock.assert_async().await;
        assert_eq!(summary, "Funding for girls' schooling rises.");
    }

    #[tokio::test]
    async fn model_loading_is_retryable() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/facebook/bart-large-cnn");
                then.status(503)
                    .json_body(json!({ "error": "Model is currently loading" }));
            })
            .await;

        let error = summarizer(server.base_url())
            .summarize("text", &LengthHint::chunk(150, 50))
            .await
            .expect_err("loading");
        assert!(error.is_retryable());
    }

    #[tokio::test]
    async fn payload_too_large_is_input_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/facebook/bart-large-cnn");
                then.status(413).body("payload too large");
            })
            .await;

        let error = summarizer(server.base_url())
            .summarize("text", &LengthHint::chunk(150, 50))
            .await
            .expect_err("too large");
        assert!(!error.is_retryable());
    }

    #[tokio::test]
    async fn unexpected_shape_is_retryable() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/facebook/bart-large-cnn");
                then.status(200).json_body(json!({ "generated": "nope" }));
            })
            .await;

        let error = summarizer(server.base_url())
            .summarize("text", &LengthHint::chunk(150, 50))
            .await
            .expect_err("bad shape");
        assert!(error.is_retryable());
    }
}
