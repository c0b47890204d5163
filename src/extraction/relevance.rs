//! Keyword prefilter keeping the paragraphs that concern gender equality and inequality.
//!
//! Budgets run to hundreds of pages of line items; summarizing only the paragraphs that
//! mention the focus topics keeps the map stage small. Headings, contents entries and short
//! fragments are never kept. When nothing matches, callers summarize the full text.

use super::ExtractedText;
use regex::Regex;
use std::sync::LazyLock;

/// Keywords used when none are configured.
pub const DEFAULT_KEYWORDS: &[&str] = &[
    "gender",
    "women",
    "girls",
    "female",
    "maternal",
    "gender-based violence",
    "gender equality",
    "gender parity",
    "inequality",
    "equity",
    "disparity",
    "marginalized",
    "vulnerable",
    "inclusion",
    "inclusive",
    "discrimination",
    "minority",
    "differently abled",
    "disabilities",
    "equal opportunity",
];

/// Paragraphs shorter than this many characters are headings or fragments.
const MIN_PARAGRAPH_CHARS: usize = 50;

static NUMBERED_HEADING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+\.\d+(\.\d+)?\s+").expect("valid heading pattern"));
static TRAILING_PAGE_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+\d+$").expect("valid page number pattern"));

/// Case-insensitive keyword filter over extracted paragraphs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelevanceFilter {
    keywords: Vec<String>,
}

impl Default for RelevanceFilter {
    fn default() -> Self {
        Self::new(DEFAULT_KEYWORDS.iter().copied())
    }
}

impl RelevanceFilter {
    /// Filter matching any of `keywords`. Blank keywords are ignored.
    pub fn new<'a>(keywords: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            keywords: keywords
                .into_iter()
                .map(|keyword| keyword.trim().to_lowercase())
                .filter(|keyword| !keyword.is_empty())
                .collect(),
        }
    }

    /// Lowercased keywords.
    pub fn keywords(&self) -> &[String] {
        &self.keywords
    }

    /// Relevant paragraphs joined by newlines, or `None` when no paragraph qualifies.
    pub fn select(&self, extracted: &ExtractedText) -> Option<String> {
        let kept: Vec<&str> = extracted
            .segments()
            .iter()
            .map(|segment| extracted.segment_text(segment).trim())
            .filter(|paragraph| self.is_relevant(paragraph))
            .collect();
        if kept.is_empty() {
            None
        } else {
            Some(kept.join("\n"))
        }
    }

    fn is_relevant(&self, paragraph: &str) -> bool {
        if paragraph.chars().count() < MIN_PARAGRAPH_CHARS || is_contents_entry(paragraph) {
            return false;
        }
        let lowered = paragraph.to_lowercase();
        self.keywords
            .iter()
            .any(|keyword| lowered.contains(keyword.as_str()))
    }
}

fn is_contents_entry(paragraph: &str) -> bool {
    NUMBERED_HEADING.is_match(paragraph)
        || paragraph.contains("...")
        || TRAILING_PAGE_NUMBER.is_match(paragraph)
}
