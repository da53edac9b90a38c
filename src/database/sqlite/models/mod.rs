
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Layout the capture process writes into the `timestamp` column
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// One row of the capture process's activity log.
///
/// Rows are append-only: ids increase monotonically and are never reused,
/// and nothing in this crate updates or deletes them. Text columns may be
/// NULL when the capture process could not determine a value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct LogRecord {
    pub id: i64,
    /// Stored text, kept verbatim whatever layout the writer used
    pub timestamp: Option<String>,
    pub app_name: Option<String>,
    pub window_title: Option<String>,
    pub ocr_text: Option<String>,
    pub url: Option<String>,
    /// Ambient noise score in 0..=100, stored in the `audio_db` column
    pub audio_level: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewLogRecord {
    pub timestamp: NaiveDateTime,
    pub app_name: String,
    pub window_title: String,
    pub ocr_text: String,
    pub url: String,
    pub audio_level: f64,
}

impl LogRecord {
    #[inline]
    pub fn timestamp(&self) -> &str {
        self.timestamp.as_deref().unwrap_or_default()
    }

    #[inline]
    pub fn app_name(&self) -> &str {
        self.app_name.as_deref().unwrap_or_default()
    }

    #[inline]
    pub fn window_title(&self) -> &str {
        self.window_title.as_deref().unwrap_or_default()
    }

    #[inline]
    pub fn ocr_text(&self) -> &str {
        self.ocr_text.as_deref().unwrap_or_default()
    }

    #[inline]
    pub fn url(&self) -> &str {
        self.url.as_deref().unwrap_or_default()
    }
}
