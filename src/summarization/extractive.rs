//! Deterministic in-process summarizer.
//!
//! Chunk pass: leading sentences of the text until the word budget is spent.
//! Combine pass: the lead sentence of each paragraph in order, then further sentences while the
//! budget allows, so every merged section stays represented.
//! Explain pass: the leading sentences again; no language or region rewriting happens here.

use super::{LengthHint, SummarizationError, SummaryPass, Summarizer};
use async_trait::async_trait;

/// Summarizer that selects source sentences instead of generating text.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExtractiveSummarizer;

impl ExtractiveSummarizer {
    /// Construct the summarizer.
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Summarizer for ExtractiveSummarizer {
    fn name(&self) -> &str {
        "extractive"
    }

    fn max_input_chars(&self) -> usize {
        usize::MAX
    }

    async fn summarize(
        &self,
        text: &str,
        hint: &LengthHint,
    ) -> Result<String, SummarizationError> {
        let max_words = hint.max_words.max(1);
        let summary = match hint.pass {
            SummaryPass::Chunk | SummaryPass::Explain => lead_sentences(text, max_words),
            SummaryPass::Combine => paragraph_leads(text, max_words),
        };
        if summary.is_empty() {
            return Err(SummarizationError::ModelInput(
                "input contains no sentences to extract".into(),
            ));
        }
        Ok(summary)
    }
}

/// Leading sentences bounded by `max_words`; the first sentence is truncated if it alone is
/// over budget.
pub(crate) fn lead_sentences(text: &str, max_words: usize) -> String {
    let mut picked: Vec<&str> = Vec::new();
    let mut used_words = 0usize;

    for sentence in sentences(text) {
        let words = count_words(sentence);
        if used_words + words > max_words {
            if picked.is_empty() {
                return truncate_words(sentence, max_words);
            }
            break;
        }
        used_words += words;
        picked.push(sentence);
        if used_words >= max_words {
            break;
        }
    }

    picked.join(" ")
}

fn paragraph_leads(text: &str, max_words: usize) -> String {
    let paragraphs: Vec<Vec<&str>> = text
        .split("\n\n")
        .map(sentences)
        .filter(|sentences| !sentences.is_empty())
        .collect();

    let mut picked: Vec<Vec<&str>> = vec![Vec::new(); paragraphs.len()];
    let mut used_words = 0usize;
    let mut depth = 0usize;

    'rounds: loop {
        let mut progressed = false;
        for (index, sentences) in paragraphs.iter().enumerate() {
            let Some(&sentence) = sentences.get(depth) else {
                continue;
            };
            let words = count_words(sentence);
            if used_words + words > max_words {
                break 'rounds;
            }
            used_words += words;
            picked[index].push(sentence);
            progressed = true;
        }
        if !progressed {
            break;
        }
        depth += 1;
    }

    let summary = picked
        .into_iter()
        .filter(|sentences| !sentences.is_empty())
        .map(|sentences| sentences.join(" "))
        .collect::<Vec<_>>()
        .join(" ");

    if summary.is_empty() {
        lead_sentences(text, max_words)
    } else {
        summary
    }
}

/// Split text into trimmed sentences ending at `.`, `!` or `?` followed by whitespace.
fn sentences(text: &str) -> Vec<&str> {
    let mut result = Vec::new();
    let mut start = 0usize;
    let mut previous: Option<char> = None;

    for (offset, c) in text.char_indices() {
        if c.is_whitespace() && matches!(previous, Some('.' | '!' | '?')) {
            push_trimmed(&mut result, &text[start..offset]);
            start = offset;
        }
        previous = Some(c);
    }
    push_trimmed(&mut result, &text[start..]);
    result
}

fn push_trimmed<'a>(sentences: &mut Vec<&'a str>, candidate: &'a str) {
    let trimmed = candidate.trim();
    if !trimmed.is_empty() {
        sentences.push(trimmed);
    }
}

fn truncate_words(text: &str, max_words: usize) -> String {
    text.split_whitespace()
        .take(max_words)
        .collect::<Vec<_>>()
        .join(" ")
}

fn count_words(text: &str) -> usize {
    text.split_whitespace().count()
}
