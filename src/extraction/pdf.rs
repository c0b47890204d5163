//! Page-by-page PDF text extraction backed by `lopdf`.

use lopdf::Document as PdfDocument;

use super::{ExtractionError, PageText, SkipReason, SkippedPage};

/// Load a PDF from memory and extract each page's text in page order.
///
/// Pages whose content cannot be decoded are reported as skipped rather than dropped, so the
/// caller can decide whether a partial read is acceptable.
pub(crate) fn read_pages(
    bytes: &[u8],
    password: Option<&str>,
    max_pages: Option<usize>,
) -> Result<(Vec<PageText>, Vec<SkippedPage>), ExtractionError> {
    let mut pdf = PdfDocument::load_mem(bytes).map_err(|error| classify_load_error(&error))?;

    if pdf.is_encrypted() {
        let Some(password) = password else {
            return Err(ExtractionError::Encrypted(
                "document is encrypted and no password was supplied".into(),
            ));
        };
        pdf.decrypt(password).map_err(|error| {
            ExtractionError::Encrypted(format!("failed to decrypt document: {error}"))
        })?;
    }

    let page_numbers: Vec<u32> = pdf.get_pages().keys().copied().collect();
    if page_numbers.is_empty() {
        return Err(ExtractionError::Corrupt("document has no pages".into()));
    }

    let limit = max_pages.unwrap_or(usize::MAX);
    let mut pages = Vec::with_capacity(page_numbers.len().min(limit));
    let mut skipped = Vec::new();

    for (position, number) in page_numbers.into_iter().enumerate() {
        if position >= limit {
            skipped.push(SkippedPage {
                page: number,
                reason: SkipReason::PageLimit,
            });
            continue;
        }

        match pdf.extract_text(&[number]) {
            Ok(raw) => pages.push(PageText { number, raw }),
            Err(error) => {
                tracing::warn!(page = number, error = %error, "Failed to decode PDF page text");
                skipped.push(SkippedPage {
                    page: number,
                    reason: SkipReason::Unreadable(error.to_string()),
                });
            }
        }
    }

    tracing::debug!(
        pages = pages.len(),
        skipped = skipped.len(),
        "PDF page extraction finished"
    );
    Ok((pages, skipped))
}

fn classify_load_error(error: &lopdf::Error) -> ExtractionError {
    let message = error.to_string();
    let lowered = message.to_lowercase();
    if lowered.contains("encrypt") || lowered.contains("decrypt") || lowered.contains("password")
    {
        ExtractionError::Encrypted(message)
    } else {
        ExtractionError::Corrupt(format!("failed to parse PDF: {message}"))
    }
}
