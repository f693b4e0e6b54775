//! PDF text extraction.
//!
//! Turns raw PDF bytes into one string per page, in page order. The only
//! normalisation applied is collapsing line breaks inside a page to spaces;
//! there is no layout or table reconstruction.

use thiserror::Error;

const PDF_HEADER: &[u8] = b"%PDF-";

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("not a PDF document (missing %PDF- header)")]
    NotPdf,
    /// Parser failure, including encrypted documents that cannot be opened
    /// without a password.
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("PDF has no pages")]
    NoPages,
    #[error("PDF contains no extractable text")]
    NoText,
}

/// Extracts the text of every page, in order.
pub fn extract_pages(bytes: &[u8]) -> Result<Vec<String>, ExtractError> {
    if !bytes.starts_with(PDF_HEADER) {
        return Err(ExtractError::NotPdf);
    }

    let pages = pdf_extract::extract_text_from_mem_by_pages(bytes)
        .map_err(|e| ExtractError::Pdf(e.to_string()))?;

    if pages.is_empty() {
        return Err(ExtractError::NoPages);
    }

    let pages: Vec<String> = pages.iter().map(|p| normalize_page(p)).collect();
    if pages.iter().all(|p| p.trim().is_empty()) {
        return Err(ExtractError::NoText);
    }

    Ok(pages)
}

/// Replaces every line break inside a page with a single space.
pub fn normalize_page(page: &str) -> String {
    page.replace("\r\n", " ").replace(['\n', '\r'], " ")
}

/// Concatenates pages into the text fed to the chunker. Each page is
/// followed by exactly one space.
pub fn join_pages(pages: &[String]) -> String {
    let mut out = String::with_capacity(pages.iter().map(|p| p.len() + 1).sum());
    for page in pages {
        out.push_str(page);
        out.push(' ');
    }
    out
}
