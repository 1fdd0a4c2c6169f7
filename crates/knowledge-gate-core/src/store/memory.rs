//! In-memory [`VectorStore`] implementation for testing and offline use.
//!
//! Uses `HashMap` and `Vec` behind `std::sync::RwLock` for thread safety.
//! Search is brute-force cosine similarity over all stored vectors in the
//! query's provider space, so scoring is exact — near-threshold results
//! never flip between equivalent runs.

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;

use crate::embedding::{cosine_similarity, TaggedVector};
use crate::models::{Candidate, Chunk, Document};

use super::{SearchFilter, StoreMetrics, VectorStore};

struct StoredChunk {
    chunk: Chunk,
    /// At most one vector per provider id.
    vectors: Vec<TaggedVector>,
}

/// In-memory vector store.
#[derive(Default)]
pub struct MemoryVectorStore {
    docs: RwLock<HashMap<String, Document>>,
    chunks: RwLock<Vec<StoredChunk>>,
}

impl MemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    async fn upsert_document(&self, doc: &Document) -> Result<()> {
        let mut docs = self.docs.write().unwrap();
        docs.insert(doc.id.clone(), doc.clone());
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
            "chunks and embeddings must be parallel (got {} chunks, {} embedding sets)",
            chunks.len(),
            embeddings.len()
        );
        let mut stored = self.chunks.write().unwrap();
        stored.retain(|sc| sc.chunk.document_id != document_id);
        for (chunk, vectors) in chunks.iter().zip(embeddings.iter()) {
            stored.push(StoredChunk {
                chunk: chunk.clone(),
                vectors: vectors.clone(),
            });
        }
        Ok(())
    }

    async fn delete_document(&self, document_id: &str, tenant_id: &str) -> Result<bool> {
        {
            let mut docs = self.docs.write().unwrap();
            match docs.get(document_id) {
                Some(doc) if doc.tenant_id == tenant_id => {
                    docs.remove(document_id);
                }
                // Missing or owned by another tenant: nothing happens.
                _ => return Ok(false),
            }
        }
        self.chunks
            .write()
            .unwrap()
            .retain(|sc| sc.chunk.document_id != document_id);
        Ok(true)
    }

    async fn query(
        &self,
        vector: &TaggedVector,
        filter: &SearchFilter,
        k: usize,
    ) -> Result<Vec<Candidate>> {
        let now = Utc::now();
        let chunks = self.chunks.read().unwrap();

        let mut candidates: Vec<Candidate> = chunks
            .iter()
            .filter(|sc| sc.chunk.tenant_id == filter.tenant_id)
            .filter(|sc| filter.categories.contains(&sc.chunk.category))
            .filter(|sc| match filter.max_age {
                Some(max_age) => now - sc.chunk.created_at <= max_age,
                None => true,
            })
            .filter_map(|sc| {
                // Same provider space only; other spaces are invisible.
                let stored = sc
                    .vectors
                    .iter()
                    .find(|v| v.provider_id == vector.provider_id)?;
                Some(Candidate {
                    chunk: sc.chunk.clone(),
                    similarity: cosine_similarity(&vector.vector, &stored.vector),
                })
            })
            .collect();

        candidates.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        candidates.truncate(k);
        Ok(candidates)
    }

    async fn metrics(&self) -> Result<StoreMetrics> {
        let docs = self.docs.read().unwrap();
        let chunks = self.chunks.read().unwrap();

        let mut metrics = StoreMetrics {
            documents: docs.len() as u64,
            chunks: chunks.len() as u64,
            ..Default::default()
        };
        for doc in docs.values() {
            *metrics
                .documents_by_tenant
                .entry(doc.tenant_id.clone())
                .or_insert(0) += 1;
        }
        for sc in chunks.iter() {
            metrics.embeddings += sc.vectors.len() as u64;
            *metrics
                .chunks_by_category
                .entry(sc.chunk.category.as_str().to_string())
                .or_insert(0) += 1;
        }
        Ok(metrics)
    }
}
