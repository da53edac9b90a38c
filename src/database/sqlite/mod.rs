use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use tracing::{debug, info};

use crate::database::LogSource;
use crate::database::sqlite::models::{LogRecord, NewLogRecord};
use crate::database::sqlite::queries::LogQueries;

#[cfg(test)]
mod tests;

pub mod models;
pub mod queries;

pub type DbPool = Pool<Sqlite>;

/// Handle on the capture process's SQLite activity log
#[derive(Debug, Clone)]
pub struct Database {
    pool: DbPool,
}

impl Database {
    /// Open the log database for syncing, creating the file and the
    /// `screen_logs` table when the capture process has not done so yet
    pub async fn new<P: AsRef<Path>>(database_path: P) -> Result<Self> {
        let database_path = database_path.as_ref();
        if let Some(parent) = database_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create database directory: {}", parent.display())
            })?;
        }

        let database = Self {
            pool: Self::connect(database_path, true).await?,
        };

        if database.has_log_table().await? {
            debug!("Using existing screen_logs table");
        } else {
            database.run_migrations().await?;
        }

        Ok(database)
    }

    /// Open a log database that must already exist. Nothing is created or
    /// migrated, so read-only reports never touch the capture database.
    pub async fn open_existing<P: AsRef<Path>>(database_path: P) -> Result<Self> {
        let pool = Self::connect(database_path.as_ref(), false).await?;
        Ok(Self { pool })
    }

    async fn connect(database_path: &Path, create_if_missing: bool) -> Result<DbPool> {
        let options = SqliteConnectOptions::new()
            .filename(database_path)
            .create_if_missing(create_if_missing);

        SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .with_context(|| {
                format!(
                    "Failed to open log database at {}",
                    database_path.display()
                )
            })
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    /// Whether the `screen_logs` table exists
    pub async fn has_log_table(&self) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'screen_logs'",
        )
        .fetch_one(&self.pool)
        .await
        .context("Failed to inspect log database schema")?;

        Ok(count > 0)
    }

    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("src/database/sqlite/migrations")
            .run(&self.pool)
            .await
            .context("Failed to run schema migration")?;

        debug!("Database migrations completed successfully");
        Ok(())
    }

    pub async fn insert_log(&self, record: &NewLogRecord) -> Result<i64> {
        LogQueries::insert(&self.pool, record).await
    }

    pub async fn get_log(&self, id: i64) -> Result<Option<LogRecord>> {
        LogQueries::get_by_id(&self.pool, id).await
    }

    /// Records newer than `after`, or the whole log when there is no watermark yet
    pub async fn fetch_logs_after(&self, after: Option<i64>) -> Result<Vec<LogRecord>> {
        match after {
            Some(id) => LogQueries::list_after(&self.pool, id).await,
            None => LogQueries::list_all(&self.pool).await,
        }
    }

    pub async fn count_logs(&self) -> Result<i64> {
        LogQueries::count(&self.pool).await
    }

    pub async fn count_logs_after(&self, after: Option<i64>) -> Result<i64> {
        match after {
            Some(id) => LogQueries::count_after(&self.pool, id).await,
            None => LogQueries::count(&self.pool).await,
        }
    }

    pub async fn max_log_id(&self) -> Result<Option<i64>> {
        LogQueries::max_id(&self.pool).await
    }
}

#[async_trait]
impl LogSource for Database {
    async fn fetch_after(&self, watermark: Option<i64>) -> Result<Vec<LogRecord>> {
        self.fetch_logs_after(watermark).await
    }
}
