//! Cheap checks for whether a response body is a PDF.

use crate::download::constants::SNIFF_WINDOW;

/// Whether a response looks like a PDF by header or leading bytes.
///
/// Accepts `application/pdf` or `application/octet-stream` content types,
/// a `.pdf` filename in `Content-Disposition`, or `%PDF` anywhere in the
/// first 4096 bytes.
#[must_use]
pub fn looks_like_pdf(content_type: Option<&str>, content_disposition: Option<&str>, body: &[u8]) -> bool {
    let content_type = content_type.unwrap_or_default().to_ascii_lowercase();
    if content_type.contains("application/pdf") || content_type.starts_with("application/octet-stream") {
        return true;
    }
    let disposition = content_disposition.unwrap_or_default().to_ascii_lowercase();
    if disposition.contains("filename=") && disposition.contains(".pdf") {
        return true;
    }
    let head = &body[..body.len().min(SNIFF_WINDOW)];
    head.windows(4).any(|w| w == b"%PDF")
}

/// Whether a browser network response is worth capturing as the document.
#[must_use]
pub fn is_pdf_response(mime_type: &str, url: &str) -> bool {
    mime_type.to_ascii_lowercase().contains("application/pdf")
        || url
            .split(['?', '#'])
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase()
            .ends_with(".pdf")
}
