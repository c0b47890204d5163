//! Chunk budgets and paragraph-aware chunking.
//!
//! Highlights:
//!
//! - Automatic sizing: derive a character budget from the summarization model's context window
//!   and clamp it to a conservative range; callers can override via `CHUNK_SIZE`.
//! - Lossless: the fresh regions of consecutive chunks partition the input exactly, so joining
//!   them reproduces the text byte for byte.
//! - Overlap: optionally prefix each chunk with the tail of the preceding text
//!   (`CHUNK_OVERLAP`) while still respecting the budget.
//! - Boundaries prefer paragraph breaks, then sentence ends, then whitespace, and only cut
//!   mid-word when a single run of text has none of those.

use crate::config::SummarizationProvider;
use thiserror::Error;
use tiktoken_rs::model::get_context_size;

/// Rough characters-per-token ratio used to turn token windows into character budgets.
pub const CHARS_PER_TOKEN: usize = 4;

const MIN_AUTOMATIC_CHUNK_CHARS: usize = 1_000;
const MAX_AUTOMATIC_CHUNK_CHARS: usize = 24_000;

/// Errors produced while configuring the chunker.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChunkingError {
    /// A zero budget cannot hold any text.
    #[error("chunk budget must be greater than zero")]
    InvalidBudget,
}

/// Determine the chunk budget in characters, respecting an explicit override.
///
/// Precedence:
/// 1) Explicit override (`CHUNK_SIZE`) wins and is clamped at `>= 1`.
/// 2) Otherwise half of the model's context window (in characters) is used, leaving room for
///    the prompt and the answer, clamped into `[1_000, 24_000]`.
pub fn determine_chunk_budget(
    override_size: Option<usize>,
    provider: SummarizationProvider,
    model: &str,
) -> usize {
    if let Some(explicit) = override_size {
        return explicit.max(1);
    }

    let window = model_context_window(provider, model);
    (window * CHARS_PER_TOKEN / 2).clamp(MIN_AUTOMATIC_CHUNK_CHARS, MAX_AUTOMATIC_CHUNK_CHARS)
}

/// Look up the context window (tokens) for a provider/model combination.
pub fn model_context_window(provider: SummarizationProvider, model: &str) -> usize {
    match provider {
        SummarizationProvider::OpenAI => get_context_size(model),
        SummarizationProvider::Ollama => ollama_context_window(model),
        SummarizationProvider::HuggingFace => huggingface_context_window(model),
        SummarizationProvider::Extractive => 8192,
    }
}

fn ollama_context_window(model: &str) -> usize {
    let normalized = model.to_lowercase();
    match normalized.as_str() {
        value if value.starts_with("llama3.1") || value.starts_with("llama3.2") => 8192,
        value if value.starts_with("mistral") || value.starts_with("qwen") => 8192,
        value if value.starts_with("phi3") || value.starts_with("gemma") => 4096,
        _ => {
            tracing::trace!(model, "Using default Ollama context window estimate");
            4096
        }
    }
}

fn huggingface_context_window(model: &str) -> usize {
    let normalized = model.to_lowercase();
    if normalized.contains("bart") || normalized.contains("pegasus") {
        1024
    } else if normalized.contains("t5") {
        512
    } else {
        2048
    }
}

/// One bounded slice of the input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk<'a> {
    /// Zero-based position in the sequence.
    pub index: u32,
    /// Chunk text, overlap included.
    pub text: &'a str,
    /// Character offset where the chunk starts (overlap included).
    pub start: usize,
    /// Character offset where the chunk's own text starts.
    pub fresh_start: usize,
    /// Character offset one past the chunk end.
    pub end: usize,
}

impl<'a> Chunk<'a> {
    /// Length in characters, overlap included.
    pub fn char_len(&self) -> usize {
        self.end - self.start
    }

    /// The part of the chunk not shared with its predecessor.
    pub fn fresh_text(&self) -> &'a str {
        let skip = self.fresh_start - self.start;
        match self.text.char_indices().nth(skip) {
            Some((offset, _)) => &self.text[offset..],
            None => "",
        }
    }
}

/// Lazy, deterministic iterator over the chunks of a text.
#[derive(Debug, Clone)]
pub struct Chunker<'a> {
    text: &'a str,
    budget: usize,
    overlap: usize,
    byte_cursor: usize,
    char_cursor: usize,
    index: u32,
}

impl<'a> Chunker<'a> {
    /// Build a chunker with a character `budget` and an `overlap` carried between chunks.
    ///
    /// The overlap is capped at `budget - 1` so every chunk contains fresh text.
    pub fn new(text: &'a str, budget: usize, overlap: usize) -> Result<Self, ChunkingError> {
        if budget == 0 {
            return Err(ChunkingError::InvalidBudget);
        }
        Ok(Self {
            text,
            budget,
            overlap: overlap.min(budget - 1),
            byte_cursor: 0,
            char_cursor: 0,
            index: 0,
        })
    }
}

impl<'a> Iterator for Chunker<'a> {
    type Item = Chunk<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.byte_cursor >= self.text.len() {
            return None;
        }

        let overlap_chars = self.overlap.min(self.char_cursor);
        let overlap_start = back_off_chars(self.text, self.byte_cursor, overlap_chars);
        let fresh_budget = self.budget - overlap_chars;

        let remaining = &self.text[self.byte_cursor..];
        let (fresh_bytes, fresh_chars) = split_point(remaining, fresh_budget);

        let start = self.char_cursor - overlap_chars;
        let fresh_start = self.char_cursor;
        let end_byte = self.byte_cursor + fresh_bytes;
        let chunk = Chunk {
            index: self.index,
            text: &self.text[overlap_start..end_byte],
            start,
            fresh_start,
            end: fresh_start + fresh_chars,
        };

        self.byte_cursor = end_byte;
        self.char_cursor += fresh_chars;
        self.index += 1;
        Some(chunk)
    }
}

/// Move `chars` characters back from `byte_position`.
fn back_off_chars(text: &str, byte_position: usize, chars: usize) -> usize {
    if chars == 0 {
        return byte_position;
    }
    text[..byte_position]
        .char_indices()
        .rev()
        .nth(chars - 1)
        .map(|(offset, _)| offset)
        .unwrap_or(0)
}

/// Choose where the next chunk ends, returning `(bytes, chars)` consumed from `text`.
///
/// The separator that triggered the split stays with the earlier chunk.
fn split_point(text: &str, budget: usize) -> (usize, usize) {
    let mut window_end = text.len();
    let mut window_chars = 0usize;
    for (count, (offset, _)) in text.char_indices().enumerate() {
        if count == budget {
            window_end = offset;
            break;
        }
        window_chars = count + 1;
    }

    if window_end == text.len() {
        return (window_end, window_chars);
    }

    let window = &text[..window_end];
    let cut = last_paragraph_break(window)
        .or_else(|| last_sentence_end(window))
        .or_else(|| last_whitespace(window))
        .unwrap_or(window_end);

    (cut, window[..cut].chars().count())
}

fn last_paragraph_break(window: &str) -> Option<usize> {
    window.rfind('\n').map(|offset| offset + 1).filter(|&cut| cut > 0)
}

fn last_sentence_end(window: &str) -> Option<usize> {
    let bytes = window.as_bytes();
    (1..bytes.len())
        .rev()
        .find(|&i| {
            bytes[i].is_ascii_whitespace() && matches!(bytes[i - 1], b'.' | b'!' | b'?' | b';')
        })
        .map(|i| i + 1)
}

fn last_whitespace(window: &str) -> Option<usize> {
    window
        .char_indices()
        .rev()
        .find(|(_, c)| c.is_whitespace())
        .map(|(offset, c)| offset + c.len_utf8())
        .filter(|&cut| cut > 0)
}
