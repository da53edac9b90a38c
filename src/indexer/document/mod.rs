
use crate::database::lancedb::{DocumentMetadata, IndexedDocument};
use crate::database::sqlite::models::LogRecord;

/// Longest window title kept in document metadata, in characters
pub const MAX_TITLE_CHARS: usize = 50;
/// Longest URL kept in document metadata, in characters
pub const MAX_URL_CHARS: usize = 100;

/// Marker preceding the OCR body in document text
pub const CONTENT_MARKER: &str = "Content: ";

/// Build the searchable document for a log record.
///
/// The returned document has an empty vector; the committer fills it in
/// after embedding. The timestamp is copied as stored and missing columns
/// render as empty strings.
#[inline]
pub fn build_document(record: &LogRecord) -> IndexedDocument {
    let timestamp = record.timestamp().to_string();

    let text = format!(
        "Time: {}, App: {}, Title: {}\n{}{}\nURL: {}",
        timestamp,
        record.app_name(),
        record.window_title(),
        CONTENT_MARKER,
        record.ocr_text(),
        record.url()
    );

    IndexedDocument {
        id: record.id.to_string(),
        text,
        vector: Vec::new(),
        metadata: DocumentMetadata {
            timestamp,
            app_name: record.app_name().to_string(),
            window_title: truncate_chars(record.window_title(), MAX_TITLE_CHARS).to_string(),
            url: truncate_chars(record.url(), MAX_URL_CHARS).to_string(),
        },
    }
}

/// The first `max_chars` characters of `text`, split on a char boundary
#[inline]
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((byte_index, _)) => text.get(..byte_index).unwrap_or(text),
        None => text,
    }
}
