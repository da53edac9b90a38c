// LanceDB vector database module
// Stores embedded log records and answers nearest-neighbour queries


pub mod vector_store;

use serde::{Deserialize, Serialize};

pub use vector_store::VectorStore;

/// A log record as stored in the vector index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexedDocument {
    /// Decimal form of the log record id
    pub id: String,
    /// Composed searchable text, stored unmodified
    pub text: String,
    /// Embedding of `text`; empty until the document has been embedded
    pub vector: Vec<f32>,
    pub metadata: DocumentMetadata,
}

/// Filterable metadata kept alongside each document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub timestamp: String,
    pub app_name: String,
    /// First 50 characters of the window title
    pub window_title: String,
    /// First 100 characters of the URL
    pub url: String,
}

/// One nearest-neighbour match
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub id: String,
    /// Squared L2 distance to the query vector; smaller is more similar
    pub distance: f32,
    pub text: String,
    pub metadata: DocumentMetadata,
}

impl IndexedDocument {
    #[inline]
    pub fn with_vector(mut self, vector: Vec<f32>) -> Self {
        self.vector = vector;
        self
    }
}
