//! Embedding provider trait and vector utilities.
//!
//! Defines the [`EmbeddingProvider`] trait that all embedding backends
//! implement, plus pure helpers for vector serialization and similarity
//! computation.
//!
//! Every vector is tagged with the provider that produced it
//! ([`TaggedVector`]). Providers define distinct vector spaces: a
//! similarity comparison between vectors from different providers is
//! meaningless, so stores refuse it rather than returning garbage
//! scores. Concrete providers (remote HTTP, local hashed-projection)
//! live in the `knowledge-gate` app crate.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::GateError;

/// A float vector tagged with the provider that produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaggedVector {
    /// Persistent provider identifier (e.g. `"remote"`, `"local"`).
    /// Vectors with different provider ids are never compared.
    pub provider_id: String,
    pub vector: Vec<f32>,
}

impl TaggedVector {
    pub fn dims(&self) -> usize {
        self.vector.len()
    }
}

/// Trait for embedding providers.
///
/// `embed` must be deterministic for identical input and provider
/// configuration. Failure with [`GateError::ProviderUnavailable`] signals
/// the caller to fall back to another provider for that call.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Persistent identifier distinguishing this provider's vector space.
    fn provider_id(&self) -> &str;

    /// Vector dimensionality produced by this provider.
    fn dims(&self) -> usize;

    /// Embed one text into this provider's vector space.
    async fn embed(&self, text: &str) -> Result<TaggedVector, GateError>;
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
///
/// Each `f32` is stored as 4 bytes in little-endian order, producing a
/// BLOB of `vec.len() × 4` bytes.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
///
/// Reverses [`vec_to_blob`]: reads 4-byte little-endian `f32` values
/// from the byte slice.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`:
/// - `1.0` = identical direction
/// - `0.0` = orthogonal (unrelated)
/// - `-1.0` = opposite direction
///
/// Returns `0.0` for empty vectors or vectors of different lengths.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        let blob = vec_to_blob(&vec);
        let restored = blob_to_vec(&blob);
        assert_eq!(vec, restored);
    }

    #[test]
    fn test_cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        let sim = cosine_similarity(&v, &v);
        assert!((sim - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![0.0, 1.0, 0.0];
        let sim = cosine_similarity(&a, &b);
        assert!(sim.abs() < 1e-6);
    }

    #[test]
    fn test_cosine_opposite() {
        let a = vec![1.0, 0.0];
        let b = vec![-1.0, 0.0];
        let sim = cosine_similarity(&a, &b);
        assert!((sim + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_empty() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    #[test]
    fn test_cosine_different_lengths() {
        let a = vec![1.0, 2.0];
        let b = vec![1.0];
        assert_eq!(cosine_similarity(&a, &b), 0.0);
    }
}
