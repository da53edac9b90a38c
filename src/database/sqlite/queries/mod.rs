
use super::models::*;
use anyhow::{Context, Result};
use sqlx::SqlitePool;
use tracing::debug;

// Columns are cast to the types the model decodes, so a value written with an
// unexpected type or layout cannot fail the whole fetch
const SELECT_LOG_COLUMNS: &str = r#"
    SELECT id,
           CAST(timestamp AS TEXT) AS timestamp,
           CAST(app_name AS TEXT) AS app_name,
           CAST(window_title AS TEXT) AS window_title,
           CAST(ocr_text AS TEXT) AS ocr_text,
           CAST(url AS TEXT) AS url,
           CAST(audio_db AS REAL) AS audio_level
    FROM screen_logs
"#;

pub struct LogQueries;

impl LogQueries {
    #[inline]
    pub async fn insert(pool: &SqlitePool, record: &NewLogRecord) -> Result<i64> {
        let id = sqlx::query(
            "INSERT INTO screen_logs (timestamp, app_name, window_title, ocr_text, url, audio_db) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(record.timestamp.format(TIMESTAMP_FORMAT).to_string())
        .bind(&record.app_name)
        .bind(&record.window_title)
        .bind(&record.ocr_text)
        .bind(&record.url)
        .bind(record.audio_level)
        .execute(pool)
        .await
        .context("Failed to insert log record")?
        .last_insert_rowid();

        Ok(id)
    }

    #[inline]
    pub async fn get_by_id(pool: &SqlitePool, id: i64) -> Result<Option<LogRecord>> {
        let result = sqlx::query_as::<_, LogRecord>(&format!("{SELECT_LOG_COLUMNS} WHERE id = ?"))
            .bind(id)
            .fetch_optional(pool)
            .await
            .context("Failed to get log record by id")?;

        Ok(result)
    }

    /// Every record, oldest first
    #[inline]
    pub async fn list_all(pool: &SqlitePool) -> Result<Vec<LogRecord>> {
        let records =
            sqlx::query_as::<_, LogRecord>(&format!("{SELECT_LOG_COLUMNS} ORDER BY id ASC"))
                .fetch_all(pool)
                .await
                .context("Failed to list log records")?;

        debug!("Loaded {} log records", records.len());
        Ok(records)
    }

    /// Records with an id strictly greater than `after`, oldest first
    #[inline]
    pub async fn list_after(pool: &SqlitePool, after: i64) -> Result<Vec<LogRecord>> {
        let records = sqlx::query_as::<_, LogRecord>(&format!(
            "{SELECT_LOG_COLUMNS} WHERE id > ? ORDER BY id ASC"
        ))
        .bind(after)
        .fetch_all(pool)
        .await
        .with_context(|| format!("Failed to list log records after id {after}"))?;

        debug!("Loaded {} log records after id {}", records.len(), after);
        Ok(records)
    }

    #[inline]
    pub async fn count(pool: &SqlitePool) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM screen_logs")
            .fetch_one(pool)
            .await
            .context("Failed to count log records")?;

        Ok(count)
    }

    #[inline]
    pub async fn count_after(pool: &SqlitePool, after: i64) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM screen_logs WHERE id > ?")
            .bind(after)
            .fetch_one(pool)
            .await
            .context("Failed to count pending log records")?;

        Ok(count)
    }

    #[inline]
    pub async fn max_id(pool: &SqlitePool) -> Result<Option<i64>> {
        let max: Option<i64> = sqlx::query_scalar("SELECT MAX(id) FROM screen_logs")
            .fetch_one(pool)
            .await
            .context("Failed to read highest log id")?;

        Ok(max)
    }
}
