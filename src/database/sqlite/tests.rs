use super::*;
use anyhow::Result;
use chrono::NaiveDate;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::collections::HashSet;
use tempfile::TempDir;

async fn create_test_database() -> Result<(TempDir, Database)> {
    let temp_dir = TempDir::new()?;
    let database = Database::new(temp_dir.path().join("lifelog.db")).await?;
    Ok((temp_dir, database))
}

fn new_record(text: &str) -> NewLogRecord {
    NewLogRecord {
        timestamp: NaiveDate::from_ymd_opt(2024, 3, 14)
            .and_then(|d| d.and_hms_opt(9, 30, 0))
            .expect("valid timestamp"),
        app_name: "Notes".to_string(),
        window_title: "Scratchpad".to_string(),
        ocr_text: text.to_string(),
        url: String::new(),
        audio_level: 12.0,
    }
}

#[tokio::test]
async fn integration_schema_migration() -> Result<()> {
    let (_temp_dir, database) = create_test_database().await?;

    let tables: Vec<String> = sqlx::query_scalar(
        "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%' AND name NOT LIKE '_sqlx%'",
    )
    .fetch_all(database.pool())
    .await?;

    let actual_tables: HashSet<&str> = tables.iter().map(|t| t.as_str()).collect();
    assert_eq!(actual_tables, HashSet::from(["screen_logs"]));

    Ok(())
}

#[tokio::test]
async fn migration_accepts_existing_capture_database() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let db_path = temp_dir.path().join("lifelog.db");

    {
        let database = Database::new(&db_path).await?;
        database.insert_log(&new_record("already captured")).await?;
        database.pool().close().await;
    }

    let reopened = Database::new(&db_path).await?;
    assert_eq!(reopened.count_logs().await?, 1);

    Ok(())
}

#[tokio::test]
async fn fetch_after_watermark() -> Result<()> {
    let (_temp_dir, database) = create_test_database().await?;

    let first = database.insert_log(&new_record("first")).await?;
    let second = database.insert_log(&new_record("second")).await?;

    let everything = database.fetch_after(None).await?;
    assert_eq!(everything.len(), 2);

    let newer = database.fetch_after(Some(first)).await?;
    assert_eq!(newer.len(), 1);
    assert_eq!(newer[0].id, second);

    assert!(database.fetch_after(Some(second)).await?.is_empty());
    assert_eq!(database.count_logs_after(Some(first)).await?, 1);
    assert_eq!(database.count_logs_after(None).await?, 2);
    assert_eq!(database.max_log_id().await?, Some(second));

    let stored = database.get_log(first).await?.expect("first record exists");
    assert_eq!(stored.ocr_text(), "first");

    Ok(())
}

/// Table as the capture process creates it, without any migration bookkeeping
async fn create_capture_database(db_path: &std::path::Path) -> Result<()> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(
            SqliteConnectOptions::new()
                .filename(db_path)
                .create_if_missing(true),
        )
        .await?;
    sqlx::query(
        "CREATE TABLE screen_logs (id INTEGER PRIMARY KEY AUTOINCREMENT, timestamp DATETIME, \
         app_name TEXT, window_title TEXT, ocr_text TEXT, url TEXT, audio_db REAL)",
    )
    .execute(&pool)
    .await?;
    pool.close().await;
    Ok(())
}

#[tokio::test]
async fn non_iso_timestamp_does_not_block_later_rows() -> Result<()> {
    let (_temp_dir, database) = create_test_database().await?;

    let before = database.insert_log(&new_record("before")).await?;
    sqlx::query(
        "INSERT INTO screen_logs (timestamp, app_name, window_title, ocr_text, url, audio_db) \
         VALUES ('Mon Jan 1 10:00:00 2024', 'Chrome', 'Docs', 'odd clock', '', 40)",
    )
    .execute(database.pool())
    .await?;
    let after = database.insert_log(&new_record("after")).await?;

    let records = database.fetch_logs_after(None).await?;
    assert_eq!(records.len(), 3);
    assert_eq!(records[1].timestamp(), "Mon Jan 1 10:00:00 2024");
    assert_eq!(records[1].ocr_text(), "odd clock");
    assert_eq!(records[2].id, after);
    assert_eq!(records[2].timestamp(), "2024-03-14 09:30:00");

    let newer = database.fetch_logs_after(Some(before)).await?;
    let newer_ids: Vec<i64> = newer.iter().map(|r| r.id).collect();
    assert_eq!(newer_ids, vec![before + 1, after]);

    Ok(())
}

#[tokio::test]
async fn existing_capture_database_is_not_migrated() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let db_path = temp_dir.path().join("lifelog.db");
    create_capture_database(&db_path).await?;

    let database = Database::new(&db_path).await?;
    database.insert_log(&new_record("captured")).await?;

    let tables: Vec<String> =
        sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type='table' AND name LIKE '_sqlx%'")
            .fetch_all(database.pool())
            .await?;
    assert!(tables.is_empty(), "unexpected bookkeeping tables: {tables:?}");
    assert_eq!(database.count_logs().await?, 1);

    Ok(())
}

#[tokio::test]
async fn open_existing_does_not_create_missing_database() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let db_path = temp_dir.path().join("typo.db");

    assert!(Database::open_existing(&db_path).await.is_err());
    assert!(!db_path.exists());

    Ok(())
}

#[tokio::test]
async fn open_existing_reads_capture_database() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let db_path = temp_dir.path().join("lifelog.db");
    create_capture_database(&db_path).await?;

    let database = Database::open_existing(&db_path).await?;
    assert!(database.has_log_table().await?);
    assert_eq!(database.count_logs().await?, 0);
    assert_eq!(database.max_log_id().await?, None);

    Ok(())
}
