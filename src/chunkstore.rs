use anyhow::{anyhow, Result};
use async_trait::async_trait;
use diesel::prelude::*;
use pgvector::{Vector, VectorExpressionMethods};
use serde_json::json;
use tokio::task;
use uuid::Uuid;

use crate::db::PgPool;
use crate::models::NewChunkRow;
use crate::schema::chunks;

/// One embedded slice of a document, ready for persistence.
#[derive(Debug, Clone)]
pub struct ChunkRecord {
    pub id: Uuid,
    pub document_id: Uuid,
    pub tenant_id: Uuid,
    pub ordinal: i32,
    pub text: String,
    pub embedding: Vec<f32>,
    pub metadata: serde_json::Value,
}

impl ChunkRecord {
    pub fn new(
        document_id: Uuid,
        tenant_id: Uuid,
        ordinal: i32,
        text: String,
        embedding: Vec<f32>,
        source_title: &str,
    ) -> Self {
        // Tenant and document ids are duplicated into the metadata so a
        // query can filter on them without joining back to the documents
        // table.
        let metadata = json!({
            "tenant_id": tenant_id,
            "document_id": document_id,
            "source": source_title,
        });
        Self {
            id: Uuid::new_v4(),
            document_id,
            tenant_id,
            ordinal,
            text,
            embedding,
            metadata,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub document_id: Uuid,
    pub source: String,
    pub text: String,
    pub score: f32,
}

/// Tenant-scoped vector index. Tenant filtering happens inside the store;
/// callers never see another tenant's chunks regardless of query vector.
#[async_trait]
pub trait ChunkStore: Send + Sync + 'static {
    /// Replaces nothing by itself; the embedding worker deletes the
    /// document's chunks first so a re-run never duplicates.
    async fn upsert(&self, records: Vec<ChunkRecord>) -> Result<()>;

    async fn query(
        &self,
        tenant_id: Uuid,
        embedding: &[f32],
        top_k: usize,
    ) -> Result<Vec<ScoredChunk>>;

    async fn delete_by_document(&self, document_id: Uuid) -> Result<()>;

    async fn count_for_document(&self, document_id: Uuid) -> Result<usize>;
}

/// pgvector-backed store; cosine distance ordering with the tenant filter
/// applied in the same statement.
pub struct PgChunkStore {
    pool: PgPool,
}

impl PgChunkStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut PgConnection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|err| anyhow!("database pool error: {err}"))?;
            f(&mut conn)
        })
        .await
        .map_err(|join_err| anyhow!("chunk store task panicked: {join_err}"))?
    }
}

#[async_trait]
impl ChunkStore for PgChunkStore {
    async fn upsert(&self, records: Vec<ChunkRecord>) -> Result<()> {
        self.with_conn(move |conn| {
            let rows: Vec<NewChunkRow> = records
                .into_iter()
                .map(|record| NewChunkRow {
                    id: record.id,
                    document_id: record.document_id,
                    tenant_id: record.tenant_id,
                    ordinal: record.ordinal,
                    text: record.text,
                    embedding: Vector::from(record.embedding),
                    metadata: record.metadata,
                })
                .collect();

            diesel::insert_into(chunks::table)
                .values(&rows)
                .execute(conn)?;
            Ok(())
        })
        .await
    }

    async fn query(
        &self,
        tenant_id: Uuid,
        embedding: &[f32],
        top_k: usize,
    ) -> Result<Vec<ScoredChunk>> {
        let query_vector = Vector::from(embedding.to_vec());
        self.with_conn(move |conn| {
            let rows: Vec<(Uuid, String, serde_json::Value, Option<f64>)> = chunks::table
                .filter(chunks::tenant_id.eq(tenant_id))
                .select((
                    chunks::document_id,
                    chunks::text,
                    chunks::metadata,
                    chunks::embedding.cosine_distance(query_vector.clone()).nullable(),
                ))
                .order(chunks::embedding.cosine_distance(query_vector))
                .limit(top_k as i64)
                .load(conn)?;

            Ok(rows
                .into_iter()
                .map(|(document_id, text, metadata, distance)| {
                    let source = metadata
                        .get("source")
                        .and_then(|value| value.as_str())
                        .unwrap_or_default()
                        .to_string();
                    ScoredChunk {
                        document_id,
                        source,
                        text,
                        score: 1.0 - distance.unwrap_or(1.0) as f32,
                    }
                })
                .collect())
        })
        .await
    }

    async fn delete_by_document(&self, document_id: Uuid) -> Result<()> {
        self.with_conn(move |conn| {
            diesel::delete(chunks::table.filter(chunks::document_id.eq(document_id)))
                .execute(conn)?;
            Ok(())
        })
        .await
    }

    async fn count_for_document(&self, document_id: Uuid) -> Result<usize> {
        self.with_conn(move |conn| {
            let count: i64 = chunks::table
                .filter(chunks::document_id.eq(document_id))
                .count()
                .get_result(conn)?;
            Ok(count as usize)
        })
        .await
    }
}
