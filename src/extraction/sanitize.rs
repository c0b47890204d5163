//! Line cleanup and table-of-contents detection for extracted text.

use regex::Regex;
use std::sync::LazyLock;

static TOC_NUMBERED_ENTRY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\d+\.\d+(\.\d+)?\s+.*\s+\.+\s*\d+$").expect("valid TOC entry pattern")
});
static TRAILING_PAGE_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+\d+$").expect("valid page number pattern"));

/// Normalize one extracted line: drop control characters, expand ligatures, collapse spaces.
pub(crate) fn clean_line(line: &str) -> String {
    let mut cleaned = String::with_capacity(line.len());
    let mut pending_space = false;

    for c in line.chars() {
        let expanded: Option<&str> = match c {
            '\u{FB00}' => Some("ff"),
            '\u{FB01}' => Some("fi"),
            '\u{FB02}' => Some("fl"),
            '\u{FB03}' => Some("ffi"),
            '\u{FB04}' => Some("ffl"),
            '\u{00AD}' | '\u{200B}' | '\u{FEFF}' => Some(""),
            _ => None,
        };

        if let Some(replacement) = expanded {
            if !replacement.is_empty() {
                push_pending(&mut cleaned, &mut pending_space);
                cleaned.push_str(replacement);
            }
            continue;
        }

        if c.is_whitespace() {
            pending_space = true;
            continue;
        }
        if c.is_control() {
            continue;
        }
        push_pending(&mut cleaned, &mut pending_space);
        cleaned.push(c);
    }

    cleaned
}

fn push_pending(buffer: &mut String, pending_space: &mut bool) {
    if *pending_space && !buffer.is_empty() {
        buffer.push(' ');
    }
    *pending_space = false;
}

/// Whether a cleaned line looks like a table-of-contents entry.
pub(crate) fn is_toc_line(line: &str) -> bool {
    let length = line.chars().count();
    TOC_NUMBERED_ENTRY.is_match(line)
        || (line.contains("...") && length < 100)
        || (TRAILING_PAGE_NUMBER.is_match(line) && length < 100)
}

/// Whether a page is dominated by short lines, the usual shape of a contents page.
pub(crate) fn is_toc_page(lines: &[String]) -> bool {
    let non_empty: Vec<&String> = lines.iter().filter(|line| !line.is_empty()).collect();
    non_empty.len() > 20
        && non_empty
            .iter()
            .map(|line| line.chars().count())
            .max()
            .unwrap_or(0)
            < 50
}

/// Group cleaned lines into paragraphs.
///
/// A paragraph ends at a blank line, or at a line that ends with terminal punctuation and is
/// noticeably shorter than the longest line on the page. Wrapped lines are joined with a space
/// and end-of-line hyphenation is undone when the next line continues in lowercase.
pub(crate) fn paragraphs(lines: &[String]) -> Vec<String> {
    let longest = lines
        .iter()
        .map(|line| line.chars().count())
        .max()
        .unwrap_or(0);
    let mut paragraphs = Vec::new();
    let mut current = String::new();

    for line in lines {
        if line.is_empty() {
            flush(&mut current, &mut paragraphs);
            continue;
        }

        if current.is_empty() {
            current.push_str(line);
        } else if joins_hyphenated(&current, line) {
            current.pop();
            current.push_str(line);
        } else {
            current.push(' ');
            current.push_str(line);
        }

        let length = line.chars().count();
        if ends_with_terminal(line) && length * 5 < longest * 4 {
            flush(&mut current, &mut paragraphs);
        }
    }

    flush(&mut current, &mut paragraphs);
    paragraphs
}

fn flush(current: &mut String, paragraphs: &mut Vec<String>) {
    if !current.is_empty() {
        paragraphs.push(std::mem::take(current));
    }
}

fn joins_hyphenated(current: &str, next: &str) -> bool {
    let mut tail = current.chars().rev();
    let hyphen = tail.next() == Some('-');
    let letter_before = tail.next().is_some_and(char::is_alphabetic);
    let continues_lowercase = next.chars().next().is_some_and(char::is_lowercase);
    hyphen && letter_before && continues_lowercase
}

fn ends_with_terminal(line: &str) -> bool {
    line.chars()
        .next_back()
        .is_some_and(|c| matches!(c, '.' | '!' | '?' | ':'))
}
