//! Concrete embedding providers.
//!
//! Implements the core [`EmbeddingProvider`] trait:
//! - **[`RemoteProvider`]** — calls an OpenAI-compatible embeddings endpoint
//!   with a hard per-call timeout and bounded retry.
//! - **[`LocalProvider`]** — deterministic hashed bag-of-words vectors; no
//!   network, always available. Coarser than a learned model but stable.
//! - **[`FallbackProvider`]** — remote first, local when the remote call
//!   fails. The returned vector carries the provider id that produced it,
//!   so retrieval searches the matching vector space and the audit trail
//!   records which provider actually answered.
//!
//! Vectors from different providers are never comparable. Ingest embeds
//! every chunk with both providers so a query served by either one finds
//! its matches.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use sha2::{Digest, Sha256};

use knowledge_gate_core::embedding::{EmbeddingProvider, TaggedVector};
use knowledge_gate_core::error::GateError;

use crate::config::EmbeddingConfig;

pub const REMOTE_PROVIDER_ID: &str = "remote";
pub const LOCAL_PROVIDER_ID: &str = "local";

/// Instantiate the provider named by the configuration.
pub fn create_provider(config: &EmbeddingConfig) -> Result<Box<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "local" => Ok(Box::new(LocalProvider::new(config.dims))),
        "remote" => Ok(Box::new(RemoteProvider::new(config)?)),
        "fallback" => {
            let remote = RemoteProvider::new(config)?;
            let local = LocalProvider::new(config.dims);
            Ok(Box::new(FallbackProvider::new(remote, local)))
        }
        other => anyhow::bail!("Unknown embedding provider: {}", other),
    }
}

// ============ Remote Provider ============

/// Calls `POST {url}` with an OpenAI-shaped embeddings request.
///
/// Any failure mode — timeout, connection refused, non-2xx after retries,
/// malformed body — surfaces as [`GateError::ProviderUnavailable`] so the
/// caller can decide whether to fall back.
pub struct RemoteProvider {
    client: reqwest::Client,
    url: String,
    model: String,
    api_key: Option<String>,
    dims: usize,
    max_retries: u32,
}

impl RemoteProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let url = config
            .url
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.url required for remote provider"))?;
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for remote provider"))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;

        Ok(Self {
            client,
            url,
            model,
            api_key: std::env::var(&config.api_key_env).ok(),
            dims: config.dims,
            max_retries: 1,
        })
    }

    async fn call_once(&self, text: &str) -> Result<Vec<f32>, GateError> {
        let body = serde_json::json!({
            "model": self.model,
            "input": [text],
        });

        let mut req = self.client.post(&self.url).json(&body);
        if let Some(key) = &self.api_key {
            req = req.header("Authorization", format!("Bearer {}", key));
        }

        let response = req
            .send()
            .await
            .map_err(|e| GateError::ProviderUnavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(GateError::ProviderUnavailable(format!(
                "embedding endpoint returned {}: {}",
                status, body_text
            )));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| GateError::ProviderUnavailable(e.to_string()))?;

        parse_embedding_response(&json)
    }
}

/// Extract `data[0].embedding` from an OpenAI-shaped response.
fn parse_embedding_response(json: &serde_json::Value) -> Result<Vec<f32>, GateError> {
    let embedding = json
        .get("data")
        .and_then(|d| d.as_array())
        .and_then(|d| d.first())
        .and_then(|item| item.get("embedding"))
        .and_then(|e| e.as_array())
        .ok_or_else(|| {
            GateError::ProviderUnavailable("malformed embedding response".to_string())
        })?;

    Ok(embedding
        .iter()
        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
        .collect())
}

#[async_trait]
impl EmbeddingProvider for RemoteProvider {
    fn provider_id(&self) -> &str {
        REMOTE_PROVIDER_ID
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, text: &str) -> Result<TaggedVector, GateError> {
        let mut last_err = None;
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(50 << (attempt - 1))).await;
            }
            match self.call_once(text).await {
                Ok(vector) => {
                    if vector.len() != self.dims {
                        return Err(GateError::ProviderUnavailable(format!(
                            "embedding endpoint returned {} dims, expected {}",
                            vector.len(),
                            self.dims
                        )));
                    }
                    return Ok(TaggedVector {
                        provider_id: REMOTE_PROVIDER_ID.to_string(),
                        vector,
                    });
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err
            .unwrap_or_else(|| GateError::ProviderUnavailable("embedding failed".to_string())))
    }
}

// ============ Local Provider ============

/// Hashed bag-of-words embeddings.
///
/// Each lowercased whitespace token is hashed with SHA-256; the first 8
/// bytes pick a bucket and the next byte picks a sign. The final vector is
/// L2-normalized, so dot product equals cosine similarity. The same text
/// always produces the same vector on every machine.
pub struct LocalProvider {
    dims: usize,
}

impl LocalProvider {
    pub fn new(dims: usize) -> Self {
        Self { dims }
    }

    fn hash_vector(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dims];
        for token in text.to_lowercase().split_whitespace() {
            let digest = Sha256::digest(token.as_bytes());
            let bucket =
                u64::from_le_bytes(digest[0..8].try_into().unwrap_or([0; 8])) as usize % self.dims;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }

        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut vector {
                *x /= norm;
            }
        }
        vector
    }
}

#[async_trait]
impl EmbeddingProvider for LocalProvider {
    fn provider_id(&self) -> &str {
        LOCAL_PROVIDER_ID
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, text: &str) -> Result<TaggedVector, GateError> {
        Ok(TaggedVector {
            provider_id: LOCAL_PROVIDER_ID.to_string(),
            vector: self.hash_vector(text),
        })
    }
}

// ============ Fallback Provider ============

/// Remote with automatic local fallback.
pub struct FallbackProvider {
    remote: RemoteProvider,
    local: LocalProvider,
}

impl FallbackProvider {
    pub fn new(remote: RemoteProvider, local: LocalProvider) -> Self {
        Self { remote, local }
    }
}

#[async_trait]
impl EmbeddingProvider for FallbackProvider {
    fn provider_id(&self) -> &str {
        REMOTE_PROVIDER_ID
    }

    fn dims(&self) -> usize {
        self.remote.dims()
    }

    async fn embed(&self, text: &str) -> Result<TaggedVector, GateError> {
        match self.remote.embed(text).await {
            Ok(tagged) => Ok(tagged),
            Err(GateError::ProviderUnavailable(reason)) => {
                tracing::warn!(%reason, "remote embedding unavailable, using local fallback");
                self.local.embed(text).await
            }
            Err(e) => Err(e),
        }
    }
}
