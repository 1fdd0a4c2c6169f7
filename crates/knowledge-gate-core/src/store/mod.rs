//! Vector storage abstraction.
//!
//! The [`VectorStore`] trait defines the storage operations the retrieval
//! pipeline needs, enabling pluggable backends (embedded SQLite,
//! in-memory, networked stores).
//!
//! Two invariants bind every implementation, not just the shipped ones:
//!
//! - **Tenant isolation is structural.** `query` never returns a chunk
//!   whose `tenant_id` differs from the filter's. This is enforced inside
//!   the backend, not left to callers.
//! - **Vector spaces never mix.** Only stored vectors whose provider id
//!   matches the query vector's are scored; cross-provider similarity is
//!   rejected, not approximated.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

pub use memory::MemoryVectorStore;

use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;
use async_trait::async_trait;
use chrono::Duration;
use serde::Serialize;

use crate::embedding::TaggedVector;
use crate::models::{Candidate, Category, Chunk, Document};

/// Metadata filter applied to every vector query.
///
/// `tenant_id` is always present; `categories` carries the persona's
/// allowed set (emergency personas never reach the store at all).
#[derive(Debug, Clone)]
pub struct SearchFilter {
    pub tenant_id: String,
    pub categories: BTreeSet<Category>,
    /// Optional pre-filter on document age. The freshness stage re-checks
    /// per category with policy precision; this only trims the candidate
    /// pool.
    pub max_age: Option<Duration>,
}

/// Store-level counts, broken down by category and tenant.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreMetrics {
    pub documents: u64,
    pub chunks: u64,
    pub embeddings: u64,
    pub chunks_by_category: BTreeMap<String, u64>,
    pub documents_by_tenant: BTreeMap<String, u64>,
}

/// Abstract vector store for chunk embeddings with metadata filtering.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`upsert_document`](VectorStore::upsert_document) | Insert or update a source document |
/// | [`replace_chunks`](VectorStore::replace_chunks) | Replace a document's chunks and their embeddings |
/// | [`delete_document`](VectorStore::delete_document) | Remove a tenant's document and all its chunks/vectors |
/// | [`query`](VectorStore::query) | Filtered nearest-neighbor search, descending by similarity |
/// | [`metrics`](VectorStore::metrics) | Store-level counts |
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Insert or update a document.
    async fn upsert_document(&self, doc: &Document) -> Result<()>;

    /// Replace all chunks (and their embeddings) for a document.
    ///
    /// `embeddings[i]` holds the vectors for `chunks[i]` — at most one
    /// per provider; an existing embedding for the same (chunk, provider)
    /// is invalidated by the replacement. The write must be visible to
    /// `query` before this call returns (read-your-writes).
    async fn replace_chunks(
        &self,
        document_id: &str,
        chunks: &[Chunk],
        embeddings: &[Vec<TaggedVector>],
    ) -> Result<()>;

    /// Remove a document with all its chunks and vectors.
    ///
    /// `tenant_id` must match the stored document's owner; a mismatch
    /// removes nothing. Returns `true` if the owned document existed.
    async fn delete_document(&self, document_id: &str, tenant_id: &str) -> Result<bool>;

    /// Nearest-neighbor search over vectors in the query vector's
    /// provider space, restricted by `filter`, ordered descending by
    /// cosine similarity, truncated to `k`.
    async fn query(
        &self,
        vector: &TaggedVector,
        filter: &SearchFilter,
        k: usize,
    ) -> Result<Vec<Candidate>>;

    /// Store-level counts for operational visibility.
    async fn metrics(&self) -> Result<StoreMetrics>;
}
