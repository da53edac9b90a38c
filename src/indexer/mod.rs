// Indexer module
// Keeps the vector index caught up with the activity log

pub mod document;
pub mod lock;
pub mod watermark;

#[cfg(test)]
mod tests;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::database::lancedb::IndexedDocument;
use crate::database::{LogSource, VectorIndex};
use crate::embeddings::Embedder;

pub use document::build_document;
pub use lock::SyncLock;
pub use watermark::current_watermark;

/// Outcome of one sync cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStats {
    /// Records read from the log above the watermark
    pub fetched: usize,
    /// Documents embedded and written to the index
    pub committed: usize,
    /// Batches committed successfully
    pub batches: usize,
    /// Why the cycle stopped early, if it did
    pub aborted: Option<String>,
    pub watermark_before: Option<i64>,
    pub watermark_after: Option<i64>,
}

impl SyncStats {
    /// Records fetched this cycle that were not committed
    #[inline]
    pub fn pending(&self) -> usize {
        self.fetched - self.committed
    }
}

/// Incremental sync from a log source into a vector index.
///
/// Each cycle derives the watermark from the index, fetches newer records,
/// and commits them in batches of `batch_size`, one embedding call and one
/// upsert per batch. A failed batch stops the cycle; everything committed
/// before it stays, and the next cycle resumes from the derived watermark.
pub struct SyncEngine<S, E, V> {
    source: S,
    embedder: Arc<E>,
    index: V,
    batch_size: usize,
}

impl<S, E, V> SyncEngine<S, E, V>
where
    S: LogSource,
    E: Embedder + 'static,
    V: VectorIndex,
{
    #[inline]
    pub fn new(source: S, embedder: Arc<E>, index: V, batch_size: usize) -> Self {
        Self {
            source,
            embedder,
            index,
            batch_size: batch_size.max(1),
        }
    }

    #[inline]
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    #[inline]
    pub fn source(&self) -> &S {
        &self.source
    }

    #[inline]
    pub fn index(&self) -> &V {
        &self.index
    }

    #[inline]
    pub fn embedder(&self) -> &Arc<E> {
        &self.embedder
    }

    #[inline]
    pub fn into_index(self) -> V {
        self.index
    }

    #[inline]
    pub async fn current_watermark(&self) -> crate::Result<Option<i64>> {
        current_watermark(&self.index).await
    }

    /// Run one sync cycle
    #[inline]
    pub async fn sync_once(&mut self) -> Result<SyncStats> {
        let watermark = self
            .current_watermark()
            .await
            .context("Failed to derive sync watermark from the vector index")?;

        let mut stats = SyncStats {
            watermark_before: watermark,
            watermark_after: watermark,
            ..SyncStats::default()
        };

        let records = match self.source.fetch_after(watermark).await {
            Ok(records) => records,
            Err(e) => {
                warn!("Log source unavailable, skipping this cycle: {:#}", e);
                return Ok(stats);
            }
        };

        stats.fetched = records.len();
        if records.is_empty() {
            debug!("No new log records after {:?}", watermark);
            return Ok(stats);
        }

        info!(
            "Syncing {} new log records after watermark {:?}",
            records.len(),
            watermark
        );

        let documents: Vec<IndexedDocument> = records.iter().map(build_document).collect();
        let total_batches = documents.len().div_ceil(self.batch_size);

        for (batch_index, batch) in documents.chunks(self.batch_size).enumerate() {
            debug!(
                "Committing batch {}/{} ({} documents)",
                batch_index + 1,
                total_batches,
                batch.len()
            );

            if let Err(e) = self.commit_batch(batch.to_vec()).await {
                let reason = format!(
                    "batch {}/{} starting at id {} failed: {:#}",
                    batch_index + 1,
                    total_batches,
                    batch.first().map_or("?", |d| d.id.as_str()),
                    e
                );
                warn!("Aborting sync cycle, {}", reason);
                stats.aborted = Some(reason);
                break;
            }

            stats.batches += 1;
            stats.committed += batch.len();
            if let Some(last) = records.get(stats.committed - 1) {
                stats.watermark_after = stats.watermark_after.max(Some(last.id));
            }
        }

        Ok(stats)
    }

    /// Embed one batch in a single call and upsert it
    async fn commit_batch(&mut self, batch: Vec<IndexedDocument>) -> Result<()> {
        let texts: Vec<String> = batch.iter().map(|d| d.text.clone()).collect();
        let expected = texts.len();

        let embedder = Arc::clone(&self.embedder);
        let vectors = tokio::task::spawn_blocking(move || embedder.embed_batch(&texts))
            .await
            .context("Embedding task panicked")?
            .context("Failed to generate embeddings")?;

        if vectors.len() != expected {
            return Err(anyhow!(
                "Embedding returned {} vectors for {} documents",
                vectors.len(),
                expected
            ));
        }

        let embedded: Vec<IndexedDocument> = batch
            .into_iter()
            .zip(vectors)
            .map(|(document, vector)| document.with_vector(vector))
            .collect();

        self.index
            .upsert(embedded)
            .await
            .context("Failed to upsert documents into the vector index")?;

        Ok(())
    }

    /// Run sync cycles every `period` until `cancel` fires.
    ///
    /// The first cycle starts immediately. A cycle in progress always runs to
    /// completion; cancellation is observed between cycles. When `lock` is
    /// given, ownership is confirmed before each cycle and the loop stops
    /// with an error once another process holds the lock file.
    #[inline]
    pub async fn run(
        &mut self,
        period: Duration,
        cancel: CancellationToken,
        lock: Option<&SyncLock>,
    ) -> Result<()> {
        info!("Starting sync loop with a {}s interval", period.as_secs());

        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("Sync loop cancelled");
                    break;
                }
                _ = ticker.tick() => {}
            }

            if let Some(lock) = lock {
                lock.heartbeat()
                    .await
                    .context("Sync lock is no longer held by this process")?;
            }

            match self.sync_once().await {
                Ok(stats) => {
                    if stats.fetched > 0 {
                        info!(
                            "Sync cycle committed {}/{} records in {} batches, watermark {:?} -> {:?}",
                            stats.committed,
                            stats.fetched,
                            stats.batches,
                            stats.watermark_before,
                            stats.watermark_after
                        );
                    }
                    if stats.committed > 0 {
                        if let Err(e) = self.index.optimize().await {
                            warn!("Failed to optimize vector index: {}", e);
                        }
                    }
                }
                Err(e) => error!("Sync cycle failed: {:#}", e),
            }
        }

        Ok(())
    }
}
