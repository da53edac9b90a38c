// Embeddings module
// The embedding function shared by indexing and querying, backed by Ollama

pub mod ollama;

use anyhow::{Result, anyhow};

pub use ollama::OllamaClient;

/// Deterministic mapping from text to a fixed-length vector.
///
/// The sync path and the query path must use the same implementation and
/// model; vectors from different models are not comparable.
pub trait Embedder: Send + Sync {
    /// Embed every text in one call, returning vectors in input order
    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Embed a single text
    #[inline]
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_batch(&[text.to_string()])?
            .pop()
            .ok_or_else(|| anyhow!("Embedding response was empty"))
    }
}

impl<E: Embedder + ?Sized> Embedder for std::sync::Arc<E> {
    #[inline]
    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        (**self).embed_batch(texts)
    }
}
