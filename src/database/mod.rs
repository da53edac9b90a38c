// Database module
// SQLite holds the capture process's activity log, LanceDB holds the vector index

pub mod lancedb;
pub mod sqlite;

use async_trait::async_trait;

use crate::database::lancedb::{IndexedDocument, SearchHit};
use crate::database::sqlite::models::LogRecord;

pub use sqlite::Database;

/// Append-only source of activity records
#[async_trait]
pub trait LogSource: Send + Sync {
    /// Records with an id strictly greater than `watermark`, ordered by id.
    /// `None` means nothing has been indexed yet and returns every record.
    async fn fetch_after(&self, watermark: Option<i64>) -> anyhow::Result<Vec<LogRecord>>;
}

/// Persistent id-keyed store of embedded documents.
///
/// `upsert` must overwrite documents whose id already exists and make each
/// document visible atomically. Only one writer may use an index at a time.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Insert or overwrite documents by id
    async fn upsert(&mut self, documents: Vec<IndexedDocument>) -> crate::Result<()>;

    /// Every stored id, in no particular order
    async fn list_ids(&self) -> crate::Result<Vec<String>>;

    /// The `limit` documents nearest to `vector`, closest first
    async fn nearest(&self, vector: &[f32], limit: usize) -> crate::Result<Vec<SearchHit>>;

    /// Number of stored documents
    async fn count(&self) -> crate::Result<u64>;

    /// Compact storage after writes
    async fn optimize(&mut self) -> crate::Result<()> {
        Ok(())
    }
}
