//! PostgreSQL-backed [`VectorStore`].
//!
//! Same row layout as the SQLite store (embedding kept as `BYTEA`), so
//! collections can be moved between the two with a plain dump. Each
//! `add_documents` call is one transaction holding a collection-scoped
//! advisory lock, so concurrent batches cannot disagree on dimensionality.

use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use sqlx::{Executor, Postgres, QueryBuilder, Row};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use super::{
    check_collection_dims, check_query_dims, check_top_k, embed_query, prepare_documents,
    rank_rows, StoredRow, VectorStore,
};
use crate::embedding::{vec_to_blob, Embedder};
use crate::error::{RagError, RagResult};
use crate::models::Document;

pub(super) struct PgTarget<'a> {
    pub host: &'a str,
    pub port: u16,
    pub user: &'a str,
    pub password: &'a str,
    pub database: &'a str,
}

pub struct PostgresStore {
    pool: PgPool,
    collection: String,
    embedder: Option<Arc<dyn Embedder>>,
}

fn db_err(e: sqlx::Error) -> RagError {
    RagError::connection("postgres", e)
}

impl PostgresStore {
    pub(super) async fn open(
        target: PgTarget<'_>,
        collection: &str,
        embedder: Option<Arc<dyn Embedder>>,
    ) -> RagResult<Self> {
        let options = PgConnectOptions::new()
            .host(target.host)
            .port(target.port)
            .username(target.user)
            .password(target.password)
            .database(target.database);

        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await
            .map_err(db_err)?;

        migrate(&pool).await?;
        tracing::debug!(host = target.host, port = target.port, collection, "postgres store opened");

        Ok(Self {
            pool,
            collection: collection.to_string(),
            embedder,
        })
    }
}

async fn collection_dims<'e, E>(executor: E, collection: &str) -> RagResult<Option<usize>>
where
    E: Executor<'e, Database = Postgres>,
{
    let dims: Option<i32> =
        sqlx::query_scalar("SELECT dims FROM rag_documents WHERE collection = $1 LIMIT 1")
            .bind(collection)
            .fetch_optional(executor)
            .await
            .map_err(db_err)?;
    Ok(dims.map(|d| d as usize))
}

async fn migrate(pool: &PgPool) -> RagResult<()> {
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
            embedding BYTEA NOT NULL,
            created_at BIGINT NOT NULL,
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
impl VectorStore for PostgresStore {
    fn kind(&self) -> &'static str {
        "postgres"
    }

    async fn add_documents(&self, docs: Vec<Document>) -> RagResult<()> {
        if docs.is_empty() {
            return Ok(());
        }
        let count = docs.len();

        let prepared = prepare_documents(docs, self.embedder.as_deref()).await?;

        let mut tx = self.pool.begin().await.map_err(db_err)?;
        // Released at commit or rollback.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(&self.collection)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        let dims = collection_dims(&mut *tx, &self.collection).await?;
        check_collection_dims(&prepared, dims)?;

        let now = chrono::Utc::now().timestamp();

        for (i, p) in prepared.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO rag_documents (collection, doc_id, text, label, links_json,
                                           media_json, metadata_json, dims, embedding, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                ON CONFLICT (collection, doc_id) DO UPDATE SET
                    text = EXCLUDED.text,
                    label = EXCLUDED.label,
                    links_json = EXCLUDED.links_json,
                    media_json = EXCLUDED.media_json,
                    metadata_json = EXCLUDED.metadata_json,
                    dims = EXCLUDED.dims,
                    embedding = EXCLUDED.embedding
                "#,
            )
            .bind(&self.collection)
            .bind(&p.doc.doc_id)
            .bind(&p.doc.text)
            .bind(&p.doc.label)
            .bind(&p.links_json)
            .bind(&p.media_json)
            .bind(&p.metadata_json)
            .bind(p.vector.len() as i32)
            .bind(vec_to_blob(&p.vector))
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| RagError::PartialWriteError {
                failed: vec![i],
                reason: e.to_string(),
            })?;
        }

        tx.commit().await.map_err(|e| RagError::PartialWriteError {
            failed: (0..count).collect(),
            reason: e.to_string(),
        })?;

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

        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
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
            sqlx::query_scalar("SELECT DISTINCT label FROM rag_documents WHERE collection = $1")
                .bind(&self.collection)
                .fetch_all(&self.pool)
                .await
                .map_err(db_err)?;
        Ok(labels.into_iter().collect())
    }

    async fn flush(&self) -> RagResult<()> {
        // every write already committed; release the connections
        self.pool.close().await;
        tracing::debug!(collection = %self.collection, "postgres pool closed");
        Ok(())
    }
}
