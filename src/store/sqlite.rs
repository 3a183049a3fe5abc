//! SQLite-backed [`VectorStore`].
//!
//! One file holds every collection. The pool runs in WAL mode so chat
//! sessions can read while an ingestion writes; `flush` checkpoints the WAL
//! back into the main database file.

use async_trait::async_trait;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
};
use sqlx::{Executor, QueryBuilder, Row, Sqlite};
use std::collections::BTreeSet;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use super::{
    check_collection_dims, check_query_dims, check_top_k, embed_query, prepare_documents,
    rank_rows, PreparedDocument, StoredRow, VectorStore,
};
use crate::embedding::{vec_to_blob, Embedder};
use crate::error::{RagError, RagResult};
use crate::models::Document;

pub struct SqliteStore {
    pool: SqlitePool,
    collection: String,
    embedder: Option<Arc<dyn Embedder>>,
}

fn db_err(e: sqlx::Error) -> RagError {
    RagError::connection("sqlite", e)
}

impl SqliteStore {
    /// Open (creating if needed) the database file and its schema.
    pub async fn open(
        path: &Path,
        collection: &str,
        embedder: Option<Arc<dyn Embedder>>,
    ) -> RagResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    RagError::connection("sqlite", format!("cannot create {}: {}", parent.display(), e))
                })?;
            }
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
            .map_err(db_err)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(db_err)?;

        migrate(&pool).await?;
        tracing::debug!(path = %path.display(), collection, "sqlite store opened");

        Ok(Self {
            pool,
            collection: collection.to_string(),
            embedder,
        })
    }

    /// Dims check and upserts; the caller holds the write lock on `conn`.
    async fn write_locked(
        &self,
        conn: &mut SqliteConnection,
        prepared: &[PreparedDocument],
    ) -> RagResult<()> {
        let dims = collection_dims(&mut *conn, &self.collection).await?;
        check_collection_dims(prepared, dims)?;

        let now = chrono::Utc::now().timestamp();
        for (i, p) in prepared.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO rag_documents (collection, doc_id, text, label, links_json,
                                           media_json, metadata_json, dims, embedding, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(collection, doc_id) DO UPDATE SET
                    text = excluded.text,
                    label = excluded.label,
                    links_json = excluded.links_json,
                    media_json = excluded.media_json,
                    metadata_json = excluded.metadata_json,
                    dims = excluded.dims,
                    embedding = excluded.embedding
                "#,
            )
            .bind(&self.collection)
            .bind(&p.doc.doc_id)
            .bind(&p.doc.text)
            .bind(&p.doc.label)
            .bind(&p.links_json)
            .bind(&p.media_json)
            .bind(&p.metadata_json)
            .bind(p.vector.len() as i64)
            .bind(vec_to_blob(&p.vector))
            .bind(now)
            .execute(&mut *conn)
            .await
            .map_err(|e| RagError::PartialWriteError {
                failed: vec![i],
                reason: e.to_string(),
            })?;
        }
        Ok(())
    }
}

async fn collection_dims<'e, E>(executor: E, collection: &str) -> RagResult<Option<usize>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let dims: Option<i64> =
        sqlx::query_scalar("SELECT dims FROM rag_documents WHERE collection = ? LIMIT 1")
            .bind(collection)
            .fetch_optional(executor)
            .await
            .map_err(db_err)?;
    Ok(dims.map(|d| d as usize))
}

/// Create the document table; safe to run repeatedly.
pub async fn migrate(pool: &SqlitePool) -> RagResult<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS rag_documents (
            collection TEXT NOT NULL,
            doc_id TEXT NOT NULL,
            text TEXT NOT NULL,
            label TEXT NOT NULL,
            links_json TEXT NOT NULL DEFAULT '[]',
            media_json TEXT NOT NULL DEFAULT '[]',
            metadata_json TEXT NOT NULL DEFAULT '{}',
            dims INTEGER NOT NULL,
            embedding BLOB NOT NULL,
            created_at INTEGER NOT NULL,
            PRIMARY KEY (collection, doc_id)
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(db_err)?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_rag_documents_label ON rag_documents(collection, label)",
    )
    .execute(pool)
    .await
    .map_err(db_err)?;

    Ok(())
}

#[async_trait]
impl VectorStore for SqliteStore {
    fn kind(&self) -> &'static str {
        "sqlite"
    }

    async fn add_documents(&self, docs: Vec<Document>) -> RagResult<()> {
        if docs.is_empty() {
            return Ok(());
        }
        let count = docs.len();

        // Embedding happens before the lock; the provider may be slow.
        let prepared = prepare_documents(docs, self.embedder.as_deref()).await?;

        // BEGIN IMMEDIATE takes the write lock up front, so the dims read
        // and the inserts see no interleaved writer from any connection.
        let mut conn = self.pool.acquire().await.map_err(db_err)?;
        sqlx::query("BEGIN IMMEDIATE")
            .execute(&mut *conn)
            .await
            .map_err(db_err)?;

        if let Err(e) = self.write_locked(&mut conn, &prepared).await {
            if let Err(rollback) = sqlx::query("ROLLBACK").execute(&mut *conn).await {
                tracing::warn!(error = %rollback, "rollback failed, dropping connection");
                drop(conn.detach());
            }
            return Err(e);
        }

        if let Err(e) = sqlx::query("COMMIT").execute(&mut *conn).await {
            if sqlx::query("ROLLBACK").execute(&mut *conn).await.is_err() {
                drop(conn.detach());
            }
            return Err(RagError::PartialWriteError {
                failed: (0..count).collect(),
                reason: e.to_string(),
            });
        }

        tracing::info!(collection = %self.collection, count, "documents committed");
        Ok(())
    }

    async fn similarity_search(
        &self,
        query: &str,
        labels: Option<&BTreeSet<String>>,
        top_k: usize,
    ) -> RagResult<Vec<Document>> {
        check_top_k(top_k)?;
        if labels.is_some_and(|l| l.is_empty()) {
            return Ok(Vec::new());
        }
        let query_vec = embed_query(self.embedder.as_deref(), query).await?;
        check_query_dims(&query_vec, collection_dims(&self.pool, &self.collection).await?)?;

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT doc_id, text, label, links_json, media_json, metadata_json, embedding \
             FROM rag_documents WHERE collection = ",
        );
        qb.push_bind(self.collection.clone());
        if let Some(labels) = labels {
            qb.push(" AND label IN (");
            let mut sep = qb.separated(", ");
            for label in labels {
                sep.push_bind(label.clone());
            }
            sep.push_unseparated(")");
        }

        let rows = qb.build().fetch_all(&self.pool).await.map_err(db_err)?;
        let rows: Vec<StoredRow> = rows
            .iter()
            .map(|r| StoredRow {
                doc_id: r.get("doc_id"),
                text: r.get("text"),
                label: r.get("label"),
                links_json: r.get("links_json"),
                media_json: r.get("media_json"),
                metadata_json: r.get("metadata_json"),
                embedding: r.get("embedding"),
            })
            .collect();

        Ok(rank_rows(rows, &query_vec, top_k))
    }

    async fn list_labels(&self) -> RagResult<BTreeSet<String>> {
        let labels: Vec<String> =
            sqlx::query_scalar("SELECT DISTINCT label FROM rag_documents WHERE collection = ?")
                .bind(&self.collection)
                .fetch_all(&self.pool)
                .await
                .map_err(db_err)?;
        Ok(labels.into_iter().collect())
    }

    async fn flush(&self) -> RagResult<()> {
        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        tracing::debug!(collection = %self.collection, "sqlite WAL checkpointed");
        Ok(())
    }
}
