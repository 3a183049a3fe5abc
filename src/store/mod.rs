//! Vector store contract and backends.
//!
//! The [`VectorStore`] trait is what pipelines and generation backends talk
//! to. Two backends implement it:
//!
//! | Kind | Type | Persistence |
//! |------|------|-------------|
//! | `sqlite` | [`SqliteStore`] | single file, WAL journal |
//! | `postgres` | [`PostgresStore`] | networked server |
//!
//! Both keep one row per document (text, label, links, media, metadata and
//! the embedding as a little-endian `f32` BLOB) keyed by `(collection, doc_id)`
//! and rank by cosine similarity computed in process. The shared steps live
//! here so the backends only differ in SQL dialect:
//!
//! - [`prepare_documents`] validates a batch and fills missing embeddings
//!   before anything is written, so a rejected batch never touches storage.
//! - [`rank_rows`] orders candidates by score descending, then `doc_id`
//!   ascending, and truncates to `top_k`.

mod postgres;
mod sqlite;

pub use postgres::PostgresStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use crate::embedding::{blob_to_vec, check_vectors, cosine_similarity, Embedder};
use crate::error::{RagError, RagResult};
use crate::models::Document;

/// Operations every vector store backend provides.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Backend kind, for logs.
    fn kind(&self) -> &'static str;

    /// Persist a batch atomically, embedding any document that lacks a vector.
    ///
    /// Either every document is written or none is. Validation failures
    /// name the offending indices via [`RagError::PartialWriteError`].
    async fn add_documents(&self, docs: Vec<Document>) -> RagResult<()>;

    /// Most similar documents first, ties broken by `doc_id` ascending.
    ///
    /// `labels = None` searches every label; `Some(set)` restricts to the
    /// set (an empty set matches nothing). Returns fewer than `top_k`
    /// documents when fewer match.
    async fn similarity_search(
        &self,
        query: &str,
        labels: Option<&BTreeSet<String>>,
        top_k: usize,
    ) -> RagResult<Vec<Document>>;

    /// Distinct labels of committed documents.
    async fn list_labels(&self) -> RagResult<BTreeSet<String>>;

    /// Durability hook run when a session ends.
    async fn flush(&self) -> RagResult<()>;
}

/// Connection parameters for a store, as resolved by the selector.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreSpec {
    Sqlite {
        path: std::path::PathBuf,
        collection: String,
    },
    Postgres {
        host: String,
        port: u16,
        user: String,
        password: String,
        database: String,
        collection: String,
    },
}

impl StoreSpec {
    pub fn collection(&self) -> &str {
        match self {
            StoreSpec::Sqlite { collection, .. } | StoreSpec::Postgres { collection, .. } => {
                collection
            }
        }
    }
}

/// Closed set of store backends.
pub enum StoreBackend {
    Sqlite(SqliteStore),
    Postgres(PostgresStore),
}

impl StoreBackend {
    /// Open the store described by `spec`, connecting eagerly.
    pub async fn open(spec: &StoreSpec, embedder: Option<Arc<dyn Embedder>>) -> RagResult<Self> {
        validate_collection(spec.collection())?;
        match spec {
            StoreSpec::Sqlite { path, collection } => Ok(StoreBackend::Sqlite(
                SqliteStore::open(path, collection, embedder).await?,
            )),
            StoreSpec::Postgres {
                host,
                port,
                user,
                password,
                database,
                collection,
            } => Ok(StoreBackend::Postgres(
                PostgresStore::open(
                    postgres::PgTarget {
                        host,
                        port: *port,
                        user,
                        password,
                        database,
                    },
                    collection,
                    embedder,
                )
                .await?,
            )),
        }
    }
}

#[async_trait]
impl VectorStore for StoreBackend {
    fn kind(&self) -> &'static str {
        match self {
            StoreBackend::Sqlite(s) => s.kind(),
            StoreBackend::Postgres(s) => s.kind(),
        }
    }

    async fn add_documents(&self, docs: Vec<Document>) -> RagResult<()> {
        match self {
            StoreBackend::Sqlite(s) => s.add_documents(docs).await,
            StoreBackend::Postgres(s) => s.add_documents(docs).await,
        }
    }

    async fn similarity_search(
        &self,
        query: &str,
        labels: Option<&BTreeSet<String>>,
        top_k: usize,
    ) -> RagResult<Vec<Document>> {
        match self {
            StoreBackend::Sqlite(s) => s.similarity_search(query, labels, top_k).await,
            StoreBackend::Postgres(s) => s.similarity_search(query, labels, top_k).await,
        }
    }

    async fn list_labels(&self) -> RagResult<BTreeSet<String>> {
        match self {
            StoreBackend::Sqlite(s) => s.list_labels().await,
            StoreBackend::Postgres(s) => s.list_labels().await,
        }
    }

    async fn flush(&self) -> RagResult<()> {
        match self {
            StoreBackend::Sqlite(s) => s.flush().await,
            StoreBackend::Postgres(s) => s.flush().await,
        }
    }
}

/// Collection names end up in keys and log lines; keep them to `[A-Za-z0-9_]+`.
pub fn validate_collection(name: &str) -> RagResult<()> {
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(RagError::connection(
            "store",
            format!("invalid collection name '{}': use letters, digits and '_'", name),
        ));
    }
    Ok(())
}

/// A validated document ready to be written: vector present, JSON fields encoded.
#[derive(Debug, Clone)]
pub struct PreparedDocument {
    pub doc: Document,
    pub vector: Vec<f32>,
    pub links_json: String,
    pub media_json: String,
    pub metadata_json: String,
}

/// Validate a batch and fill missing embeddings.
///
/// Every vector in the batch must share the first one's length. Agreement
/// with what the collection already holds is checked later, under the
/// backend's write lock, by [`check_collection_dims`].
pub async fn prepare_documents(
    docs: Vec<Document>,
    embedder: Option<&dyn Embedder>,
) -> RagResult<Vec<PreparedDocument>> {
    let mut seen = HashSet::new();
    let invalid: Vec<usize> = docs
        .iter()
        .enumerate()
        .filter(|(_, d)| {
            d.doc_id.trim().is_empty() || d.text.trim().is_empty() || !seen.insert(d.doc_id.clone())
        })
        .map(|(i, _)| i)
        .collect();
    if !invalid.is_empty() {
        return Err(RagError::PartialWriteError {
            failed: invalid,
            reason: "documents need a unique non-empty docId and non-empty text".into(),
        });
    }

    let missing: Vec<usize> = docs
        .iter()
        .enumerate()
        .filter(|(_, d)| d.embedding.is_none())
        .map(|(i, _)| i)
        .collect();

    let mut filled = Vec::new();
    if !missing.is_empty() {
        let embedder = embedder.ok_or_else(|| {
            RagError::EmbeddingFailure(format!(
                "{} documents have no embedding and no embedding backend is configured",
                missing.len()
            ))
        })?;
        let texts: Vec<String> = missing.iter().map(|&i| docs[i].text.clone()).collect();
        let vectors = embedder.embed(&texts).await?;
        check_vectors(&vectors, texts.len(), embedder.dims())?;
        filled = vectors;
    }

    let mut filled = filled.into_iter();
    let mut prepared = Vec::with_capacity(docs.len());
    for mut doc in docs {
        let vector = match doc.embedding.take() {
            Some(v) => v,
            None => filled
                .next()
                .ok_or_else(|| RagError::EmbeddingFailure("embedding backend returned too few vectors".into()))?,
        };
        if vector.is_empty() || vector.iter().any(|x| !x.is_finite()) {
            return Err(RagError::EmbeddingFailure(format!(
                "document '{}' has an empty or non-finite embedding",
                doc.doc_id
            )));
        }
        let links_json = encode_json(&doc.links)?;
        let media_json = encode_json(&doc.media)?;
        let metadata_json = encode_json(&doc.metadata)?;
        doc.embedding = Some(vector.clone());
        prepared.push(PreparedDocument {
            doc,
            vector,
            links_json,
            media_json,
            metadata_json,
        });
    }

    check_collection_dims(&prepared, None)?;
    Ok(prepared)
}

/// Check a prepared batch against the collection's stored dimensionality.
///
/// With `collection_dims = None` (empty collection) the first document sets
/// the length. Must run inside the same serialized write as the inserts.
pub fn check_collection_dims(
    prepared: &[PreparedDocument],
    collection_dims: Option<usize>,
) -> RagResult<()> {
    let Some(dims) = collection_dims.or_else(|| prepared.first().map(|p| p.vector.len())) else {
        return Ok(());
    };
    let mismatched: Vec<usize> = prepared
        .iter()
        .enumerate()
        .filter(|(_, p)| p.vector.len() != dims)
        .map(|(i, _)| i)
        .collect();
    if !mismatched.is_empty() {
        return Err(RagError::PartialWriteError {
            failed: mismatched,
            reason: format!("embedding length differs from collection dimensionality {}", dims),
        });
    }
    Ok(())
}

/// A query vector must match the collection it searches.
pub(crate) fn check_query_dims(query_vec: &[f32], collection_dims: Option<usize>) -> RagResult<()> {
    match collection_dims {
        Some(dims) if dims != query_vec.len() => Err(RagError::EmbeddingFailure(format!(
            "query embedding has {} dimensions but the collection stores {}",
            query_vec.len(),
            dims
        ))),
        _ => Ok(()),
    }
}

fn encode_json<T: serde::Serialize>(value: &T) -> RagResult<String> {
    serde_json::to_string(value).map_err(|e| RagError::InvalidRequest(e.to_string()))
}

/// Embed a search query with the store's embedder.
pub(crate) async fn embed_query(embedder: Option<&dyn Embedder>, query: &str) -> RagResult<Vec<f32>> {
    let embedder = embedder
        .ok_or_else(|| RagError::EmbeddingFailure("no embedding backend configured for search".into()))?;
    let vectors = embedder.embed(&[query.to_string()]).await?;
    check_vectors(&vectors, 1, embedder.dims())?;
    vectors
        .into_iter()
        .next()
        .ok_or_else(|| RagError::EmbeddingFailure("empty query embedding".into()))
}

/// A stored row as read back from either backend.
#[derive(Debug, Clone)]
pub struct StoredRow {
    pub doc_id: String,
    pub text: String,
    pub label: String,
    pub links_json: String,
    pub media_json: String,
    pub metadata_json: String,
    pub embedding: Vec<u8>,
}

impl StoredRow {
    fn into_document(self, vector: Vec<f32>) -> Document {
        Document {
            doc_id: self.doc_id,
            text: self.text,
            embedding: Some(vector),
            label: self.label,
            links: serde_json::from_str(&self.links_json).unwrap_or_default(),
            media: serde_json::from_str(&self.media_json).unwrap_or_default(),
            metadata: serde_json::from_str(&self.metadata_json).unwrap_or_default(),
        }
    }
}

/// Score rows against `query_vec` and keep the best `top_k`.
pub fn rank_rows(rows: Vec<StoredRow>, query_vec: &[f32], top_k: usize) -> Vec<Document> {
    let mut scored: Vec<(f32, StoredRow, Vec<f32>)> = rows
        .into_iter()
        .map(|row| {
            let vector = blob_to_vec(&row.embedding);
            (cosine_similarity(query_vec, &vector), row, vector)
        })
        .collect();

    scored.sort_by(|a, b| {
        b.0.partial_cmp(&a.0)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.1.doc_id.cmp(&b.1.doc_id))
    });
    scored.truncate(top_k);

    scored
        .into_iter()
        .map(|(_, row, vector)| row.into_document(vector))
        .collect()
}

pub(crate) fn check_top_k(top_k: usize) -> RagResult<()> {
    if top_k == 0 {
        return Err(RagError::InvalidRequest("top_k must be at least 1".into()));
    }
    Ok(())
}
