// Search module
// Answers free-text queries against the vector index


use std::fmt::Write as _;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::database::VectorIndex;
use crate::database::lancedb::{DocumentMetadata, SearchHit};
use crate::embeddings::Embedder;
use crate::indexer::document::{CONTENT_MARKER, truncate_chars};
use crate::{LifelogError, Result};

/// Longest excerpt shown for a result, in characters
pub const EXCERPT_CHARS: usize = 100;

/// One ranked match for a query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub id: String,
    /// Squared L2 distance; smaller is more similar
    pub distance: f32,
    pub metadata: DocumentMetadata,
    pub excerpt: String,
}

impl From<SearchHit> for QueryResult {
    #[inline]
    fn from(hit: SearchHit) -> Self {
        Self {
            excerpt: render_excerpt(&hit.text),
            id: hit.id,
            distance: hit.distance,
            metadata: hit.metadata,
        }
    }
}

/// Read-only query path over a vector index.
///
/// Must be given the same embedder as the sync engine that built the index.
pub struct QueryEngine<E, V> {
    embedder: Arc<E>,
    index: V,
}

impl<E, V> QueryEngine<E, V>
where
    E: Embedder + 'static,
    V: VectorIndex,
{
    #[inline]
    pub fn new(embedder: Arc<E>, index: V) -> Self {
        Self { embedder, index }
    }

    #[inline]
    pub fn index(&self) -> &V {
        &self.index
    }

    /// The `k` stored documents nearest to `query`, closest first.
    ///
    /// No matches is not an error. Searching before anything has been
    /// indexed fails with [`LifelogError::IndexNotFound`].
    #[inline]
    pub async fn search(&self, query: &str, k: usize) -> Result<Vec<QueryResult>> {
        if k == 0 {
            return Ok(Vec::new());
        }

        debug!("Embedding query {:?}", query);
        let embedder = Arc::clone(&self.embedder);
        let text = query.to_string();
        let vector = tokio::task::spawn_blocking(move || embedder.embed(&text))
            .await
            .map_err(|e| LifelogError::Embedding(format!("Embedding task failed: {}", e)))?
            .map_err(|e| LifelogError::Embedding(format!("Failed to embed query: {:#}", e)))?;

        let mut results: Vec<QueryResult> = self
            .index
            .nearest(&vector, k)
            .await?
            .into_iter()
            .map(QueryResult::from)
            .collect();

        results.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        results.truncate(k);

        debug!("Query returned {} results", results.len());
        Ok(results)
    }
}

/// Display excerpt for stored document text.
///
/// Takes what follows the first content marker (the whole text when there is
/// none), keeps the first 100 characters and flattens newlines to spaces.
#[inline]
pub fn render_excerpt(text: &str) -> String {
    let body = text
        .split_once(CONTENT_MARKER)
        .map_or(text, |(_, body)| body);
    truncate_chars(body, EXCERPT_CHARS).replace('\n', " ")
}

/// Human-readable listing of one result; `rank` starts at 1
#[inline]
pub fn format_result(rank: usize, result: &QueryResult) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "--- [Result {}] (Distance: {:.4}) ---",
        rank, result.distance
    );
    let _ = writeln!(
        out,
        "🕒 {} | 📱 {}",
        result.metadata.timestamp, result.metadata.app_name
    );
    let _ = writeln!(out, "📄 {}", result.metadata.window_title);
    if !result.metadata.url.is_empty() {
        let _ = writeln!(out, "🔗 {}", result.metadata.url);
    }
    let _ = write!(out, "📝 {}...", result.excerpt);
    out
}
