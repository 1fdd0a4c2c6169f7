//! SQLite-backed [`VectorStore`].
//!
//! Metadata filtering (tenant, category, age, provider) happens in SQL;
//! cosine similarity over the surviving rows is computed in Rust from
//! little-endian f32 BLOBs. Candidate pools per tenant are small enough
//! that exact scoring beats maintaining an approximate index.

use std::collections::BTreeMap;
use std::str::FromStr;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::{Row, SqlitePool};

use knowledge_gate_core::embedding::{blob_to_vec, cosine_similarity, vec_to_blob, TaggedVector};
use knowledge_gate_core::models::{Candidate, Category, Chunk, Document, UploaderRole};
use knowledge_gate_core::store::{SearchFilter, StoreMetrics, VectorStore};

pub struct SqliteVectorStore {
    pool: SqlitePool,
}

impl SqliteVectorStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn ts(dt: DateTime<Utc>) -> i64 {
    dt.timestamp()
}

fn from_ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_default()
}

fn chunk_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Chunk> {
    let category: String = row.get("category");
    let uploader_role: String = row.get("uploader_role");
    let metadata_json: String = row.get("metadata_json");
    let span_start: i64 = row.get("span_start");
    let span_end: i64 = row.get("span_end");

    Ok(Chunk {
        id: row.get("id"),
        document_id: row.get("document_id"),
        tenant_id: row.get("tenant_id"),
        category: Category::from_str(&category)
            .with_context(|| format!("unknown category in store: {}", category))?,
        uploader_role: UploaderRole::from_str(&uploader_role)
            .with_context(|| format!("unknown uploader role in store: {}", uploader_role))?,
        token_span: (span_start as usize, span_end as usize),
        text: row.get("text"),
        created_at: from_ts(row.get("created_at")),
        metadata: serde_json::from_str(&metadata_json).unwrap_or_else(|_| serde_json::json!({})),
    })
}

#[async_trait]
impl VectorStore for SqliteVectorStore {
    async fn upsert_document(&self, doc: &Document) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO documents (id, tenant_id, category, uploader_role, created_at, content, metadata_json)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                tenant_id = excluded.tenant_id,
                category = excluded.category,
                uploader_role = excluded.uploader_role,
                created_at = excluded.created_at,
                content = excluded.content,
                metadata_json = excluded.metadata_json
            "#,
        )
        .bind(&doc.id)
        .bind(&doc.tenant_id)
        .bind(doc.category.to_string())
        .bind(doc.uploader_role.to_string())
        .bind(ts(doc.created_at))
        .bind(&doc.content)
        .bind(doc.metadata.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn replace_chunks(
        &self,
        document_id: &str,
        chunks: &[Chunk],
        embeddings: &[Vec<TaggedVector>],
    ) -> Result<()> {
        anyhow::ensure!(
            chunks.len() == embeddings.len(),
            "chunks/embeddings length mismatch: {} vs {}",
            chunks.len(),
            embeddings.len()
        );

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "DELETE FROM chunk_vectors WHERE chunk_id IN (SELECT id FROM chunks WHERE document_id = ?)",
        )
        .bind(document_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;

        for (index, (chunk, vectors)) in chunks.iter().zip(embeddings.iter()).enumerate() {
            sqlx::query(
                r#"
                INSERT INTO chunks
                    (id, document_id, chunk_index, tenant_id, category, uploader_role,
                     created_at, text, span_start, span_end, metadata_json)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&chunk.id)
            .bind(document_id)
            .bind(index as i64)
            .bind(&chunk.tenant_id)
            .bind(chunk.category.to_string())
            .bind(chunk.uploader_role.to_string())
            .bind(ts(chunk.created_at))
            .bind(&chunk.text)
            .bind(chunk.token_span.0 as i64)
            .bind(chunk.token_span.1 as i64)
            .bind(chunk.metadata.to_string())
            .execute(&mut *tx)
            .await?;

            for tagged in vectors {
                sqlx::query(
                    r#"
                    INSERT INTO chunk_vectors (chunk_id, provider_id, dims, vector)
                    VALUES (?, ?, ?, ?)
                    ON CONFLICT(chunk_id, provider_id) DO UPDATE SET
                        dims = excluded.dims,
                        vector = excluded.vector
                    "#,
                )
                .bind(&chunk.id)
                .bind(&tagged.provider_id)
                .bind(tagged.dims() as i64)
                .bind(vec_to_blob(&tagged.vector))
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn delete_document(&self, document_id: &str, tenant_id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        // Owner check and document removal in one statement; the cascade
        // below only runs once the tenant is known to match.
        let result = sqlx::query("DELETE FROM documents WHERE id = ? AND tenant_id = ?")
            .bind(document_id)
            .bind(tenant_id)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Ok(false);
        }

        sqlx::query(
            "DELETE FROM chunk_vectors WHERE chunk_id IN (SELECT id FROM chunks WHERE document_id = ?)",
        )
        .bind(document_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn query(
        &self,
        vector: &TaggedVector,
        filter: &SearchFilter,
        k: usize,
    ) -> Result<Vec<Candidate>> {
        if filter.categories.is_empty() {
            return Ok(Vec::new());
        }

        // Tenant, category, provider and coarse age filtering in SQL;
        // similarity in Rust over the surviving BLOBs.
        let placeholders = vec!["?"; filter.categories.len()].join(", ");
        let mut sql = format!(
            r#"
            SELECT c.id, c.document_id, c.tenant_id, c.category, c.uploader_role,
                   c.created_at, c.text, c.span_start, c.span_end, c.metadata_json,
                   cv.vector
            FROM chunk_vectors cv
            JOIN chunks c ON c.id = cv.chunk_id
            WHERE cv.provider_id = ?
              AND c.tenant_id = ?
              AND c.category IN ({placeholders})
            "#
        );
        if filter.max_age.is_some() {
            sql.push_str(" AND c.created_at >= ?");
        }

        let mut query = sqlx::query(&sql)
            .bind(&vector.provider_id)
            .bind(&filter.tenant_id);
        for category in &filter.categories {
            query = query.bind(category.to_string());
        }
        if let Some(max_age) = filter.max_age {
            query = query.bind(ts(Utc::now() - max_age));
        }

        let rows = query.fetch_all(&self.pool).await?;

        let mut candidates = Vec::with_capacity(rows.len());
        for row in &rows {
            let blob: Vec<u8> = row.get("vector");
            let stored = blob_to_vec(&blob);
            if stored.len() != vector.vector.len() {
                continue;
            }
            let similarity = cosine_similarity(&vector.vector, &stored);
            candidates.push(Candidate {
                chunk: chunk_from_row(row)?,
                similarity,
            });
        }

        candidates.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        candidates.truncate(k);
        Ok(candidates)
    }

    async fn metrics(&self) -> Result<StoreMetrics> {
        let documents: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
            .fetch_one(&self.pool)
            .await?;
        let chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await?;
        let embeddings: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunk_vectors")
            .fetch_one(&self.pool)
            .await?;

        let mut chunks_by_category = BTreeMap::new();
        let rows = sqlx::query("SELECT category, COUNT(*) AS n FROM chunks GROUP BY category")
            .fetch_all(&self.pool)
            .await?;
        for row in &rows {
            let category: String = row.get("category");
            let n: i64 = row.get("n");
            chunks_by_category.insert(category, n as u64);
        }

        let mut documents_by_tenant = BTreeMap::new();
        let rows = sqlx::query("SELECT tenant_id, COUNT(*) AS n FROM documents GROUP BY tenant_id")
            .fetch_all(&self.pool)
            .await?;
        for row in &rows {
            let tenant_id: String = row.get("tenant_id");
            let n: i64 = row.get("n");
            documents_by_tenant.insert(tenant_id, n as u64);
        }

        Ok(StoreMetrics {
            documents: documents as u64,
            chunks: chunks as u64,
            embeddings: embeddings as u64,
            chunks_by_category,
            documents_by_tenant,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    async fn test_store() -> (SqliteVectorStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let pool = crate::db::connect(&dir.path().join("test.sqlite"))
            .await
            .unwrap();
        crate::db::run_migrations(&pool).await.unwrap();
        (SqliteVectorStore::new(pool), dir)
    }

    fn doc(id: &str, tenant: &str) -> Document {
        Document {
            id: id.to_string(),
            tenant_id: tenant.to_string(),
            category: Category::Medical,
            uploader_role: UploaderRole::Nurse,
            created_at: Utc::now(),
            content: "Metformin 500mg at 8am.".to_string(),
            metadata: serde_json::json!({}),
        }
    }

    fn chunk(id: &str, document_id: &str, tenant: &str) -> Chunk {
        Chunk {
            id: id.to_string(),
            document_id: document_id.to_string(),
            tenant_id: tenant.to_string(),
            category: Category::Medical,
            uploader_role: UploaderRole::Nurse,
            token_span: (0, 23),
            text: "Metformin 500mg at 8am.".to_string(),
            created_at: Utc::now(),
            metadata: serde_json::json!({}),
        }
    }

    fn tagged(provider: &str, vector: Vec<f32>) -> TaggedVector {
        TaggedVector {
            provider_id: provider.to_string(),
            vector,
        }
    }

    fn medical_filter(tenant: &str) -> SearchFilter {
        SearchFilter {
            tenant_id: tenant.to_string(),
            categories: BTreeSet::from([Category::Medical]),
            max_age: None,
        }
    }

    #[tokio::test]
    async fn test_roundtrip_and_query() {
        let (store, _dir) = test_store().await;
        store.upsert_document(&doc("d1", "t1")).await.unwrap();
        store
            .replace_chunks(
                "d1",
                &[chunk("c1", "d1", "t1")],
                &[vec![tagged("local", vec![1.0, 0.0])]],
            )
            .await
            .unwrap();

        let hits = store
            .query(&tagged("local", vec![1.0, 0.0]), &medical_filter("t1"), 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk.id, "c1");
        assert!((hits[0].similarity - 1.0).abs() < 1e-5);
        assert_eq!(hits[0].chunk.token_span, (0, 23));
    }

    #[tokio::test]
    async fn test_tenant_isolation_in_sql() {
        let (store, _dir) = test_store().await;
        store.upsert_document(&doc("d1", "t1")).await.unwrap();
        store
            .replace_chunks(
                "d1",
                &[chunk("c1", "d1", "t1")],
                &[vec![tagged("local", vec![1.0, 0.0])]],
            )
            .await
            .unwrap();

        let hits = store
            .query(&tagged("local", vec![1.0, 0.0]), &medical_filter("t2"), 10)
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn test_cross_provider_vectors_invisible() {
        let (store, _dir) = test_store().await;
        store.upsert_document(&doc("d1", "t1")).await.unwrap();
        store
            .replace_chunks(
                "d1",
                &[chunk("c1", "d1", "t1")],
                &[vec![tagged("remote", vec![1.0, 0.0])]],
            )
            .await
            .unwrap();

        let hits = store
            .query(&tagged("local", vec![1.0, 0.0]), &medical_filter("t1"), 10)
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn test_replace_chunks_drops_stale_vectors() {
        let (store, _dir) = test_store().await;
        store.upsert_document(&doc("d1", "t1")).await.unwrap();
        store
            .replace_chunks(
                "d1",
                &[chunk("c1", "d1", "t1")],
                &[vec![tagged("local", vec![1.0, 0.0])]],
            )
            .await
            .unwrap();
        store
            .replace_chunks(
                "d1",
                &[chunk("c2", "d1", "t1")],
                &[vec![tagged("local", vec![0.0, 1.0])]],
            )
            .await
            .unwrap();

        let hits = store
            .query(&tagged("local", vec![1.0, 0.0]), &medical_filter("t1"), 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk.id, "c2");
    }

    #[tokio::test]
    async fn test_delete_document() {
        let (store, _dir) = test_store().await;
        store.upsert_document(&doc("d1", "t1")).await.unwrap();
        store
            .replace_chunks(
                "d1",
                &[chunk("c1", "d1", "t1")],
                &[vec![tagged("local", vec![1.0, 0.0])]],
            )
            .await
            .unwrap();

        assert!(store.delete_document("d1", "t1").await.unwrap());
        assert!(!store.delete_document("d1", "t1").await.unwrap());

        let metrics = store.metrics().await.unwrap();
        assert_eq!(metrics.documents, 0);
        assert_eq!(metrics.chunks, 0);
        assert_eq!(metrics.embeddings, 0);
    }

    #[tokio::test]
    async fn test_delete_rejects_non_owning_tenant() {
        let (store, _dir) = test_store().await;
        store.upsert_document(&doc("d1", "t1")).await.unwrap();
        store
            .replace_chunks(
                "d1",
                &[chunk("c1", "d1", "t1")],
                &[vec![tagged("local", vec![1.0, 0.0])]],
            )
            .await
            .unwrap();

        assert!(!store.delete_document("d1", "t2").await.unwrap());

        let metrics = store.metrics().await.unwrap();
        assert_eq!(metrics.documents, 1);
        assert_eq!(metrics.chunks, 1);
        assert_eq!(metrics.embeddings, 1);
    }

    #[tokio::test]
    async fn test_metrics_counts() {
        let (store, _dir) = test_store().await;
        store.upsert_document(&doc("d1", "t1")).await.unwrap();
        store.upsert_document(&doc("d2", "t2")).await.unwrap();
        store
            .replace_chunks(
                "d1",
                &[chunk("c1", "d1", "t1")],
                &[vec![
                    tagged("local", vec![1.0, 0.0]),
                    tagged("remote", vec![0.5, 0.5]),
                ]],
            )
            .await
            .unwrap();

        let metrics = store.metrics().await.unwrap();
        assert_eq!(metrics.documents, 2);
        assert_eq!(metrics.chunks, 1);
        assert_eq!(metrics.embeddings, 2);
        assert_eq!(metrics.chunks_by_category.get("medical"), Some(&1));
        assert_eq!(metrics.documents_by_tenant.get("t2"), Some(&1));
    }
}
