//! Document text extraction.
//!
//! Turns submitted bytes into reading-order text split into page-tagged paragraph segments.
//! Segments are joined with a single `\n`, so every newline in [`ExtractedText::text`] is a
//! paragraph boundary the chunker can prefer.

mod pdf;
mod relevance;
mod sanitize;

pub use relevance::{DEFAULT_KEYWORDS, RelevanceFilter};

use crate::pipeline::Document;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Media type handled by the PDF extractor.
pub const MEDIA_TYPE_PDF: &str = "application/pdf";
/// Media type handled by the plain-text extractor.
pub const MEDIA_TYPE_TEXT: &str = "text/plain";

/// Terminal failures while reading a document. None of them are retried.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExtractionError {
    /// Bytes could not be parsed as the declared media type.
    #[error("document is corrupt: {0}")]
    Corrupt(String),
    /// Document is encrypted and no working password was supplied.
    #[error("document is encrypted: {0}")]
    Encrypted(String),
    /// No extractor exists for the declared media type.
    #[error("unsupported media type '{0}'")]
    UnsupportedMediaType(String),
    /// Extraction succeeded but produced no characters.
    #[error("document contains no extractable text")]
    NoText,
    /// Extraction did not finish within the configured timeout.
    #[error("extraction timed out after {0}s")]
    Timeout(u64),
    /// The blocking extraction thread panicked or was cancelled.
    #[error("extraction aborted: {0}")]
    Aborted(String),
}

/// Extraction knobs.
#[derive(Debug, Clone, Default)]
pub struct ExtractOptions {
    /// Read at most this many pages; the rest are reported as skipped.
    pub max_pages: Option<usize>,
    /// Drop table-of-contents lines and pages.
    pub strip_toc: bool,
}

/// Why a page contributed no text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Beyond [`ExtractOptions::max_pages`].
    PageLimit,
    /// Page content could not be decoded.
    Unreadable(String),
    /// Page was recognized as a table of contents.
    TableOfContents,
}

/// A page that was not included in the extracted text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedPage {
    /// One-based page number.
    pub page: u32,
    /// Reason the page was skipped.
    pub reason: SkipReason,
}

/// One paragraph of extracted text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextSegment {
    /// One-based page number.
    pub page: u32,
    /// Zero-based paragraph index within the page.
    pub paragraph: u32,
    /// First character offset in [`ExtractedText::text`].
    pub start: usize,
    /// One past the last character offset.
    pub end: usize,
}

/// Reading-order text of a document with its segment layout.
#[derive(Debug, Clone)]
pub struct ExtractedText {
    text: String,
    segments: Vec<TextSegment>,
    page_count: usize,
    skipped_pages: Vec<SkippedPage>,
}

impl ExtractedText {
    /// Full text, segments joined by single newlines.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Paragraph segments in reading order.
    pub fn segments(&self) -> &[TextSegment] {
        &self.segments
    }

    /// Pages that were read, including those that yielded no paragraphs.
    pub fn page_count(&self) -> usize {
        self.page_count
    }

    /// Pages left out of the text, with reasons.
    pub fn skipped_pages(&self) -> &[SkippedPage] {
        &self.skipped_pages
    }

    /// Text of one segment.
    pub fn segment_text(&self, segment: &TextSegment) -> &str {
        let start = byte_offset(&self.text, segment.start);
        let end = byte_offset(&self.text, segment.end);
        &self.text[start..end]
    }

    /// Number of characters in the text.
    pub fn char_len(&self) -> usize {
        self.segments.last().map(|segment| segment.end).unwrap_or(0)
    }
}

fn byte_offset(text: &str, char_offset: usize) -> usize {
    text.char_indices()
        .nth(char_offset)
        .map(|(offset, _)| offset)
        .unwrap_or(text.len())
}

/// Raw text of one page before cleanup.
#[derive(Debug, Clone)]
pub(crate) struct PageText {
    pub(crate) number: u32,
    pub(crate) raw: String,
}

/// Extract reading-order text from a document.
pub fn extract(
    document: &Document,
    options: &ExtractOptions,
) -> Result<ExtractedText, ExtractionError> {
    let (pages, skipped) = match document.media_type() {
        MEDIA_TYPE_PDF => pdf::read_pages(document.content(), document.password(), options.max_pages)?,
        MEDIA_TYPE_TEXT => read_plain_text(document.content(), options.max_pages)?,
        other => return Err(ExtractionError::UnsupportedMediaType(other.to_string())),
    };
    assemble(pages, skipped, options)
}

/// Run [`extract`] on a blocking thread, bounded by `timeout`.
pub async fn extract_with_timeout(
    document: Arc<Document>,
    options: ExtractOptions,
    timeout: Duration,
) -> Result<ExtractedText, ExtractionError> {
    let handle = tokio::task::spawn_blocking(move || extract(&document, &options));
    match tokio::time::timeout(timeout, handle).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_error)) => Err(ExtractionError::Aborted(join_error.to_string())),
        Err(_) => Err(ExtractionError::Timeout(timeout.as_secs())),
    }
}

fn read_plain_text(
    bytes: &[u8],
    max_pages: Option<usize>,
) -> Result<(Vec<PageText>, Vec<SkippedPage>), ExtractionError> {
    let text = std::str::from_utf8(bytes)
        .map_err(|error| ExtractionError::Corrupt(format!("text is not valid UTF-8: {error}")))?;
    let limit = max_pages.unwrap_or(usize::MAX);
    let mut pages = Vec::new();
    let mut skipped = Vec::new();

    for (position, raw) in text.split('\u{000C}').enumerate() {
        let number = position as u32 + 1;
        if position >= limit {
            skipped.push(SkippedPage {
                page: number,
                reason: SkipReason::PageLimit,
            });
        } else {
            pages.push(PageText {
                number,
                raw: raw.to_string(),
            });
        }
    }

    Ok((pages, skipped))
}

fn assemble(
    pages: Vec<PageText>,
    mut skipped: Vec<SkippedPage>,
    options: &ExtractOptions,
) -> Result<ExtractedText, ExtractionError> {
    let page_count = pages.len();
    let mut text = String::new();
    let mut segments = Vec::new();
    let mut cursor = 0usize;

    for page in pages {
        let lines: Vec<String> = page.raw.lines().map(sanitize::clean_line).collect();

        let lines = if options.strip_toc {
            if sanitize::is_toc_page(&lines) {
                tracing::debug!(page = page.number, "Skipping table-of-contents page");
                skipped.push(SkippedPage {
                    page: page.number,
                    reason: SkipReason::TableOfContents,
                });
                continue;
            }
            lines
                .into_iter()
                .map(|line| {
                    if sanitize::is_toc_line(&line) {
                        String::new()
                    } else {
                        line
                    }
                })
                .collect()
        } else {
            lines
        };

        for (index, paragraph) in sanitize::paragraphs(&lines).into_iter().enumerate() {
            if !text.is_empty() {
                text.push('\n');
                cursor += 1;
            }
            let length = paragraph.chars().count();
            segments.push(TextSegment {
                page: page.number,
                paragraph: index as u32,
                start: cursor,
                end: cursor + length,
            });
            text.push_str(&paragraph);
            cursor += length;
        }
    }

    if segments.is_empty() {
        return Err(ExtractionError::NoText);
    }

    tracing::info!(
        pages = page_count,
        segments = segments.len(),
        chars = cursor,
        skipped_pages = skipped.len(),
        "Text extraction complete"
    );

    Ok(ExtractedText {
        text,
        segments,
        page_count,
        skipped_pages: skipped,
    })
}
