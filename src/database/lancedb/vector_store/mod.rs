
use super::{DocumentMetadata, IndexedDocument, SearchHit};
use crate::database::VectorIndex;
use crate::{LifelogError, config::Config};
use arrow::array::{Array, FixedSizeListArray, Float32Array, RecordBatchIterator, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use futures::TryStreamExt;
use lancedb::{
    Connection, DistanceType, Table,
    query::{ExecutableQuery, QueryBase, Select},
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

const TABLE_NAME: &str = "screen_logs";

/// Vector database store using LanceDB for similarity search.
///
/// The table is created on the first upsert, with the dimension of the first
/// vector written. Distances are squared L2 for the lifetime of the index.
pub struct VectorStore {
    connection: Connection,
    db_path: PathBuf,
    table_name: String,
    vector_dimension: Option<usize>,
}

impl VectorStore {
    /// Open the vector index configured for this installation
    #[inline]
    pub async fn new(config: &Config) -> Result<Self, LifelogError> {
        Self::open(config.vector_database_path()).await
    }

    /// Open (or prepare to create) a vector index rooted at `db_path`
    #[inline]
    pub async fn open<P: AsRef<Path>>(db_path: P) -> Result<Self, LifelogError> {
        let db_path = db_path.as_ref().to_path_buf();
        debug!("Initializing LanceDB at path: {:?}", db_path);

        std::fs::create_dir_all(&db_path).map_err(|e| {
            LifelogError::Database(format!("Failed to create vector database directory: {}", e))
        })?;

        let uri = db_path.to_string_lossy().to_string();
        let connection = lancedb::connect(&uri)
            .execute()
            .await
            .map_err(|e| LifelogError::Database(format!("Failed to connect to LanceDB: {}", e)))?;

        let mut store = Self {
            connection,
            db_path,
            table_name: TABLE_NAME.to_string(),
            vector_dimension: None,
        };

        store.vector_dimension = store.detect_existing_vector_dimension().await?;
        match store.vector_dimension {
            Some(dim) => info!("Opened vector index with {} dimensions", dim),
            None => info!("Vector index is empty; table will be created on first write"),
        }

        Ok(store)
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.db_path
    }

    #[inline]
    pub fn vector_dimension(&self) -> Option<usize> {
        self.vector_dimension
    }

    async fn table_exists(&self) -> Result<bool, LifelogError> {
        let table_names = self
            .connection
            .table_names()
            .execute()
            .await
            .map_err(|e| LifelogError::Database(format!("Failed to list tables: {}", e)))?;

        Ok(table_names.contains(&self.table_name))
    }

    /// Open the table if it has been created
    async fn open_existing_table(&self) -> Result<Option<Table>, LifelogError> {
        if !self.table_exists().await? {
            return Ok(None);
        }

        let table = self
            .connection
            .open_table(&self.table_name)
            .execute()
            .await
            .map_err(|e| LifelogError::Database(format!("Failed to open table: {}", e)))?;

        Ok(Some(table))
    }

    /// Detect vector dimension from existing table schema
    async fn detect_existing_vector_dimension(&self) -> Result<Option<usize>, LifelogError> {
        let Some(table) = self.open_existing_table().await? else {
            return Ok(None);
        };

        let schema = table
            .schema()
            .await
            .map_err(|e| LifelogError::Database(format!("Failed to get table schema: {}", e)))?;

        for field in schema.fields() {
            if field.name() == "vector" {
                if let DataType::FixedSizeList(_, size) = field.data_type() {
                    return Ok(Some(*size as usize));
                }
            }
        }

        Err(LifelogError::Database(
            "Could not find vector column or determine dimension".to_string(),
        ))
    }

    /// Create schema with the specified vector dimension
    fn create_schema(vector_dim: usize) -> Arc<Schema> {
        Arc::new(Schema::new(vec![
            Field::new("id", DataType::Utf8, false),
            Field::new(
                "vector",
                DataType::FixedSizeList(
                    Arc::new(Field::new("item", DataType::Float32, true)),
                    vector_dim as i32,
                ),
                false,
            ),
            Field::new("text", DataType::Utf8, false),
            Field::new("timestamp", DataType::Utf8, false),
            Field::new("app_name", DataType::Utf8, false),
            Field::new("window_title", DataType::Utf8, false),
            Field::new("url", DataType::Utf8, false),
        ]))
    }

    /// Open the table for writing, creating it with `vector_dim` when absent
    async fn ensure_table(&mut self, vector_dim: usize) -> Result<Table, LifelogError> {
        if self.vector_dimension.is_none() {
            self.vector_dimension = self.detect_existing_vector_dimension().await?;
        }

        match self.vector_dimension {
            Some(existing) if existing != vector_dim => Err(LifelogError::Embedding(format!(
                "Vector dimension {} does not match the index dimension {}; \
                 the embedding model must not change for an existing index",
                vector_dim, existing
            ))),
            Some(_) => self.open_existing_table().await?.ok_or_else(|| {
                LifelogError::Database("Vector table disappeared while open".to_string())
            }),
            None => {
                info!("Creating vector table with {} dimensions", vector_dim);
                let table = self
                    .connection
                    .create_empty_table(&self.table_name, Self::create_schema(vector_dim))
                    .execute()
                    .await
                    .map_err(|e| LifelogError::Database(format!("Failed to create table: {}", e)))?;
                self.vector_dimension = Some(vector_dim);
                Ok(table)
            }
        }
    }

    /// Insert documents, overwriting any that share an id with a stored document
    #[inline]
    pub async fn upsert_documents(
        &mut self,
        documents: Vec<IndexedDocument>,
    ) -> Result<(), LifelogError> {
        let Some(first) = documents.first() else {
            debug!("No documents to store");
            return Ok(());
        };

        let vector_dim = first.vector.len();
        if vector_dim == 0 {
            return Err(LifelogError::Embedding(format!(
                "Document {} has not been embedded",
                first.id
            )));
        }
        if let Some(bad) = documents.iter().find(|d| d.vector.len() != vector_dim) {
            return Err(LifelogError::Embedding(format!(
                "Document {} has a {}-dimensional vector, expected {}",
                bad.id,
                bad.vector.len(),
                vector_dim
            )));
        }

        debug!("Upserting batch of {} documents", documents.len());

        let table = self.ensure_table(vector_dim).await?;
        let record_batch = Self::create_record_batch(&documents, vector_dim)?;
        let schema = record_batch.schema();
        let reader = RecordBatchIterator::new(std::iter::once(Ok(record_batch)), schema);

        let mut merge = table.merge_insert(&["id"]);
        merge
            .when_matched_update_all(None)
            .when_not_matched_insert_all();
        merge
            .execute(Box::new(reader))
            .await
            .map_err(|e| LifelogError::Database(format!("Failed to upsert documents: {}", e)))?;

        debug!("Upserted {} documents", documents.len());
        Ok(())
    }

    /// Create a RecordBatch from embedded documents
    fn create_record_batch(
        documents: &[IndexedDocument],
        vector_dim: usize,
    ) -> Result<RecordBatch, LifelogError> {
        let len = documents.len();

        let mut ids = Vec::with_capacity(len);
        let mut texts = Vec::with_capacity(len);
        let mut timestamps = Vec::with_capacity(len);
        let mut app_names = Vec::with_capacity(len);
        let mut window_titles = Vec::with_capacity(len);
        let mut urls = Vec::with_capacity(len);
        let mut flat_values = Vec::with_capacity(len * vector_dim);

        for document in documents {
            ids.push(document.id.as_str());
            texts.push(document.text.as_str());
            timestamps.push(document.metadata.timestamp.as_str());
            app_names.push(document.metadata.app_name.as_str());
            window_titles.push(document.metadata.window_title.as_str());
            urls.push(document.metadata.url.as_str());
            flat_values.extend_from_slice(&document.vector);
        }

        let values_array = Float32Array::from(flat_values);
        let field = Arc::new(Field::new("item", DataType::Float32, true));
        let vector_array =
            FixedSizeListArray::try_new(field, vector_dim as i32, Arc::new(values_array), None)
                .map_err(|e| {
                    LifelogError::Database(format!("Failed to create vector array: {}", e))
                })?;

        let arrays: Vec<Arc<dyn Array>> = vec![
            Arc::new(StringArray::from(ids)),
            Arc::new(vector_array),
            Arc::new(StringArray::from(texts)),
            Arc::new(StringArray::from(timestamps)),
            Arc::new(StringArray::from(app_names)),
            Arc::new(StringArray::from(window_titles)),
            Arc::new(StringArray::from(urls)),
        ];

        RecordBatch::try_new(Self::create_schema(vector_dim), arrays)
            .map_err(|e| LifelogError::Database(format!("Failed to create record batch: {}", e)))
    }

    /// Every id stored in the index; empty when the table does not exist yet
    #[inline]
    pub async fn list_document_ids(&self) -> Result<Vec<String>, LifelogError> {
        let Some(table) = self.open_existing_table().await? else {
            return Ok(Vec::new());
        };

        let total = table
            .count_rows(None)
            .await
            .map_err(|e| LifelogError::Database(format!("Failed to count rows: {}", e)))?;
        if total == 0 {
            return Ok(Vec::new());
        }

        let mut stream = table
            .query()
            .select(Select::columns(&["id"]))
            .limit(total)
            .execute()
            .await
            .map_err(|e| LifelogError::Database(format!("Failed to scan ids: {}", e)))?;

        let mut ids = Vec::with_capacity(total);
        while let Some(batch) = stream
            .try_next()
            .await
            .map_err(|e| LifelogError::Database(format!("Failed to read id stream: {}", e)))?
        {
            let column = string_column(&batch, "id")?;
            ids.extend(
                (0..column.len())
                    .filter(|&row| !column.is_null(row))
                    .map(|row| column.value(row).to_string()),
            );
        }

        debug!("Listed {} document ids", ids.len());
        Ok(ids)
    }

    /// Search for the nearest documents by squared L2 distance
    #[inline]
    pub async fn search_similar(
        &self,
        query_vector: &[f32],
        limit: usize,
    ) -> Result<Vec<SearchHit>, LifelogError> {
        debug!("Searching for similar vectors with limit: {}", limit);

        let table = self
            .open_existing_table()
            .await?
            .ok_or_else(|| LifelogError::IndexNotFound(self.db_path.display().to_string()))?;

        if let Some(dim) = self.vector_dimension {
            if dim != query_vector.len() {
                return Err(LifelogError::Embedding(format!(
                    "Query vector has {} dimensions, index has {}",
                    query_vector.len(),
                    dim
                )));
            }
        }

        let results = table
            .vector_search(query_vector)
            .map_err(|e| LifelogError::Database(format!("Failed to create vector search: {}", e)))?
            .column("vector")
            .distance_type(DistanceType::L2)
            .limit(limit)
            .execute()
            .await
            .map_err(|e| LifelogError::Database(format!("Failed to execute search: {}", e)))?;

        Self::parse_search_results_stream(results).await
    }

    /// Parse search results from LanceDB stream into SearchHit structs
    async fn parse_search_results_stream(
        mut results: lancedb::arrow::SendableRecordBatchStream,
    ) -> Result<Vec<SearchHit>, LifelogError> {
        let mut hits = Vec::new();

        while let Some(batch) = results
            .try_next()
            .await
            .map_err(|e| LifelogError::Database(format!("Failed to read result stream: {}", e)))?
        {
            hits.extend(Self::parse_search_batch(&batch)?);
        }

        debug!("Parsed {} search results from stream", hits.len());
        Ok(hits)
    }

    /// Parse a single record batch from search results
    fn parse_search_batch(batch: &RecordBatch) -> Result<Vec<SearchHit>, LifelogError> {
        let ids = string_column(batch, "id")?;
        let texts = string_column(batch, "text")?;
        let timestamps = string_column(batch, "timestamp")?;
        let app_names = string_column(batch, "app_name")?;
        let window_titles = string_column(batch, "window_title")?;
        let urls = string_column(batch, "url")?;

        let distances = batch
            .column_by_name("_distance")
            .and_then(|col| col.as_any().downcast_ref::<Float32Array>());
        if distances.is_none() {
            warn!("Search results carry no distance column");
        }

        let hits = (0..batch.num_rows())
            .map(|row| SearchHit {
                id: ids.value(row).to_string(),
                distance: distances
                    .map_or(0.0, |d| if d.is_null(row) { 0.0 } else { d.value(row) }),
                text: texts.value(row).to_string(),
                metadata: DocumentMetadata {
                    timestamp: timestamps.value(row).to_string(),
                    app_name: app_names.value(row).to_string(),
                    window_title: window_titles.value(row).to_string(),
                    url: urls.value(row).to_string(),
                },
            })
            .collect();

        Ok(hits)
    }

    /// Get the total number of documents stored
    #[inline]
    pub async fn count_documents(&self) -> Result<u64, LifelogError> {
        let Some(table) = self.open_existing_table().await? else {
            return Ok(0);
        };

        let count = table
            .count_rows(None)
            .await
            .map_err(|e| LifelogError::Database(format!("Failed to count rows: {}", e)))?;

        Ok(count as u64)
    }

    /// Compact fragments and prune old versions left behind by upserts
    #[inline]
    pub async fn optimize_table(&self) -> Result<(), LifelogError> {
        let Some(table) = self.open_existing_table().await? else {
            return Ok(());
        };

        debug!("Optimizing vector database");
        table
            .optimize(lancedb::table::OptimizeAction::All)
            .await
            .map_err(|e| LifelogError::Database(format!("Failed to optimize table: {}", e)))?;

        debug!("Vector database optimization completed");
        Ok(())
    }
}

fn string_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray, LifelogError> {
    batch
        .column_by_name(name)
        .ok_or_else(|| LifelogError::Database(format!("Missing {} column", name)))?
        .as_any()
        .downcast_ref::<StringArray>()
        .ok_or_else(|| LifelogError::Database(format!("Invalid {} column type", name)))
}

#[async_trait]
impl VectorIndex for VectorStore {
    async fn upsert(&mut self, documents: Vec<IndexedDocument>) -> crate::Result<()> {
        self.upsert_documents(documents).await
    }

    async fn list_ids(&self) -> crate::Result<Vec<String>> {
        self.list_document_ids().await
    }

    async fn nearest(&self, vector: &[f32], limit: usize) -> crate::Result<Vec<SearchHit>> {
        self.search_similar(vector, limit).await
    }

    async fn count(&self) -> crate::Result<u64> {
        self.count_documents().await
    }

    async fn optimize(&mut self) -> crate::Result<()> {
        self.optimize_table().await
    }
}
