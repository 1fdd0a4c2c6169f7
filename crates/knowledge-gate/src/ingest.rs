//! Document ingestion: chunking, dual-provider embedding, store writes.
//!
//! Each chunk is embedded with BOTH the remote and the local provider at
//! ingest time. Queries served by either provider then search a vector
//! space that actually contains the tenant's chunks; a remote outage
//! degrades match quality, not correctness.
//!
//! Re-ingesting a document replaces its chunks atomically and drops the
//! owning tenant's cached verdicts, so stale answers cannot outlive the
//! data they were derived from.

use std::sync::Arc;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use knowledge_gate_core::embedding::{EmbeddingProvider, TaggedVector};
use knowledge_gate_core::models::{Chunk, Document};
use knowledge_gate_core::store::VectorStore;

use crate::cache::SingleFlightCache;
use crate::config::ChunkingConfig;
use crate::orchestrator::CachedVerdict;

/// Split document content into overlapping character windows, preferring
/// sentence boundaries near the window end so facts are not cut mid-claim.
pub fn chunk_text(doc: &Document, config: &ChunkingConfig) -> Vec<Chunk> {
    let content = doc.content.trim();
    if content.is_empty() {
        return Vec::new();
    }

    let chars: Vec<char> = content.chars().collect();

    let mut chunks = Vec::new();
    let mut start = 0usize;
    let mut index = 0i64;

    while start < chars.len() {
        let hard_end = (start + config.chunk_chars).min(chars.len());
        // Prefer a sentence boundary in the second half of the window.
        let end = if hard_end < chars.len() {
            let floor = start + config.chunk_chars / 2;
            (floor..hard_end)
                .rev()
                .find(|&i| matches!(chars[i], '.' | '!' | '?' | '\n'))
                .map(|i| i + 1)
                .unwrap_or(hard_end)
        } else {
            hard_end
        };

        let text: String = chars[start..end].iter().collect();
        let text = text.trim().to_string();
        if !text.is_empty() {
            chunks.push(Chunk {
                id: chunk_id(&doc.id, index),
                document_id: doc.id.clone(),
                tenant_id: doc.tenant_id.clone(),
                category: doc.category,
                uploader_role: doc.uploader_role,
                token_span: (start, end),
                text,
                created_at: doc.created_at,
                metadata: doc.metadata.clone(),
            });
            index += 1;
        }

        if end >= chars.len() {
            break;
        }
        // Overlap anchored to the chosen boundary, but always move forward.
        let next = end.saturating_sub(config.overlap_chars);
        start = if next > start { next } else { end };
    }

    chunks
}

/// Deterministic chunk id from document id and index, stable across
/// re-ingests of identical content.
fn chunk_id(document_id: &str, index: i64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(document_id.as_bytes());
    hasher.update(index.to_le_bytes());
    let digest = hasher.finalize();
    Uuid::from_slice(&digest[0..16])
        .map(|u| u.to_string())
        .unwrap_or_else(|_| format!("{}:{}", document_id, index))
}

pub struct Ingestor {
    store: Arc<dyn VectorStore>,
    /// Providers to embed every chunk with, one vector each.
    providers: Vec<Arc<dyn EmbeddingProvider>>,
    chunking: ChunkingConfig,
    verdict_cache: SingleFlightCache<CachedVerdict>,
}

impl Ingestor {
    pub fn new(
        store: Arc<dyn VectorStore>,
        providers: Vec<Arc<dyn EmbeddingProvider>>,
        chunking: ChunkingConfig,
        verdict_cache: SingleFlightCache<CachedVerdict>,
    ) -> Self {
        Self {
            store,
            providers,
            chunking,
            verdict_cache,
        }
    }

    /// Ingest (or re-ingest) a document. Returns the number of chunks
    /// written.
    pub async fn ingest(&self, doc: &Document) -> Result<usize> {
        let chunks = chunk_text(doc, &self.chunking);

        let mut embeddings: Vec<Vec<TaggedVector>> = Vec::with_capacity(chunks.len());
        for chunk in &chunks {
            let mut vectors = Vec::with_capacity(self.providers.len());
            for provider in &self.providers {
                match provider.embed(&chunk.text).await {
                    Ok(tagged) => vectors.push(tagged),
                    Err(e) => {
                        // A provider outage at ingest time costs that
                        // provider's vector space a row, nothing else.
                        tracing::warn!(
                            provider = provider.provider_id(),
                            chunk = %chunk.id,
                            error = %e,
                            "embedding failed during ingest, skipping provider"
                        );
                    }
                }
            }
            anyhow::ensure!(
                !vectors.is_empty(),
                "no embedding provider available for chunk {}",
                chunk.id
            );
            embeddings.push(vectors);
        }

        self.store
            .upsert_document(doc)
            .await
            .context("failed to upsert document")?;
        self.store
            .replace_chunks(&doc.id, &chunks, &embeddings)
            .await
            .context("failed to replace chunks")?;

        self.verdict_cache.invalidate_tag(&doc.tenant_id).await;

        tracing::info!(
            document = %doc.id,
            tenant = %doc.tenant_id,
            category = %doc.category,
            chunks = chunks.len(),
            "document ingested"
        );
        Ok(chunks.len())
    }

    /// Delete a document and invalidate the owning tenant's cached
    /// verdicts. The store only removes the document when `tenant_id`
    /// matches its owner, so a caller naming someone else's document
    /// cannot delete it or touch the owner's cache.
    pub async fn delete(&self, document_id: &str, tenant_id: &str) -> Result<bool> {
        let removed = self.store.delete_document(document_id, tenant_id).await?;
        if removed {
            self.verdict_cache.invalidate_tag(tenant_id).await;
            tracing::info!(document = %document_id, tenant = %tenant_id, "document deleted");
        }
        Ok(removed)
    }
}
