//! TOML configuration parsing and validation.
//!
//! Persona policies are part of the same file so one reload swaps the
//! full configuration atomically. See `config/kgate.example.toml`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use knowledge_gate_core::models::Category;
use knowledge_gate_core::policy::{PersonaPolicy, PolicySet};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    pub server: ServerConfig,
    /// persona_id -> policy table.
    pub personas: BTreeMap<String, PersonaConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `"remote"`, `"local"`, or `"fallback"` (remote with automatic
    /// local fallback).
    #[serde(default = "default_provider")]
    pub provider: String,
    /// Remote embeddings endpoint (OpenAI-compatible).
    #[serde(default)]
    pub url: Option<String>,
    /// Remote model name.
    #[serde(default)]
    pub model: Option<String>,
    /// Vector dimensionality. Applies to both providers so fallback
    /// vectors live in a space of the same shape.
    #[serde(default = "default_dims")]
    pub dims: usize,
    /// Per-call timeout for the remote provider, in milliseconds.
    #[serde(default = "default_embed_timeout_ms")]
    pub timeout_ms: u64,
    /// Environment variable holding the remote API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            url: None,
            model: None,
            dims: default_dims(),
            timeout_ms: default_embed_timeout_ms(),
            api_key_env: default_api_key_env(),
        }
    }
}

fn default_provider() -> String {
    "local".to_string()
}
fn default_dims() -> usize {
    384
}
fn default_embed_timeout_ms() -> u64 {
    500
}
fn default_api_key_env() -> String {
    "KGATE_EMBEDDING_API_KEY".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// Candidates fetched from the store per query — sized to give the
    /// validation pipeline margin over the chunks actually used.
    #[serde(default = "default_candidate_k")]
    pub candidate_k: usize,
    /// Request-level deadline; expiry escalates with `retrieval_timeout`.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Upper bound on result-cache TTL. The effective TTL per persona is
    /// clamped to the strictest freshness window among its categories.
    #[serde(default = "default_result_ttl_secs")]
    pub result_ttl_secs: u64,
    /// LRU capacity shared by each cache instance.
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            candidate_k: default_candidate_k(),
            request_timeout_ms: default_request_timeout_ms(),
            result_ttl_secs: default_result_ttl_secs(),
            cache_capacity: default_cache_capacity(),
        }
    }
}

fn default_candidate_k() -> usize {
    12
}
fn default_request_timeout_ms() -> u64 {
    2000
}
fn default_result_ttl_secs() -> u64 {
    300
}
fn default_cache_capacity() -> usize {
    1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_chars")]
    pub chunk_chars: usize,
    #[serde(default = "default_overlap_chars")]
    pub overlap_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_chars: default_chunk_chars(),
            overlap_chars: default_overlap_chars(),
        }
    }
}

fn default_chunk_chars() -> usize {
    500
}
fn default_overlap_chars() -> usize {
    50
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

/// One persona's policy as written in TOML. Durations are expressed in
/// hours for the config surface; the core policy stores seconds.
#[derive(Debug, Deserialize, Clone)]
pub struct PersonaConfig {
    #[serde(default)]
    pub allowed_categories: Vec<Category>,
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,
    #[serde(default = "default_disclaimer_floor")]
    pub disclaimer_floor: f32,
    /// category -> max age in hours.
    #[serde(default)]
    pub max_age_hours: BTreeMap<Category, u64>,
    #[serde(default)]
    pub emergency: bool,
}

fn default_confidence_threshold() -> f32 {
    0.75
}
fn default_disclaimer_floor() -> f32 {
    0.6
}

impl Config {
    /// Build the validated [`PolicySet`] snapshot from the persona tables.
    pub fn policy_set(&self) -> Result<PolicySet> {
        let policies = self
            .personas
            .iter()
            .map(|(persona_id, p)| PersonaPolicy {
                persona_id: persona_id.clone(),
                allowed_categories: p.allowed_categories.iter().copied().collect(),
                confidence_threshold: p.confidence_threshold,
                disclaimer_floor: p.disclaimer_floor,
                max_age_secs: p
                    .max_age_hours
                    .iter()
                    .map(|(cat, hours)| (*cat, hours * 3600))
                    .collect(),
                emergency: p.emergency,
            })
            .collect();
        PolicySet::new(policies).context("invalid persona policy")
    }
}

/// Load and validate the configuration file.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    match config.embedding.provider.as_str() {
        "local" => {}
        "remote" | "fallback" => {
            if config.embedding.url.is_none() {
                anyhow::bail!(
                    "embedding.url must be set when provider is '{}'",
                    config.embedding.provider
                );
            }
            if config.embedding.model.is_none() {
                anyhow::bail!(
                    "embedding.model must be set when provider is '{}'",
                    config.embedding.provider
                );
            }
        }
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be remote, local, or fallback.",
            other
        ),
    }

    if config.embedding.dims == 0 {
        anyhow::bail!("embedding.dims must be > 0");
    }
    if config.retrieval.candidate_k == 0 {
        anyhow::bail!("retrieval.candidate_k must be >= 1");
    }
    if config.chunking.chunk_chars == 0 {
        anyhow::bail!("chunking.chunk_chars must be > 0");
    }
    if config.chunking.overlap_chars >= config.chunking.chunk_chars {
        anyhow::bail!("chunking.overlap_chars must be smaller than chunk_chars");
    }
    if config.personas.is_empty() {
        anyhow::bail!("at least one [personas.<id>] table is required");
    }

    // Surfaces threshold/category mistakes at load time, not per query.
    config.policy_set()?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(body: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(body.as_bytes()).unwrap();
        f
    }

    const MINIMAL: &str = r#"
[db]
path = "data/kgate.sqlite"

[server]
bind = "127.0.0.1:7431"

[personas.caregiver]
allowed_categories = ["medical", "protocol", "biography"]
confidence_threshold = 0.75
disclaimer_floor = 0.6

[personas.caregiver.max_age_hours]
medical = 24

[personas.emergency]
emergency = true
"#;

    #[test]
    fn test_minimal_config_loads() {
        let f = write_config(MINIMAL);
        let config = load_config(f.path()).unwrap();
        assert_eq!(config.embedding.provider, "local");
        assert_eq!(config.retrieval.candidate_k, 12);
        assert_eq!(config.embedding.timeout_ms, 500);

        let policies = config.policy_set().unwrap();
        let caregiver = policies.get("caregiver").unwrap();
        assert_eq!(
            caregiver.max_age_secs.get(&Category::Medical),
            Some(&(24 * 3600))
        );
        assert!(policies.get("emergency").unwrap().emergency);
    }

    #[test]
    fn test_remote_provider_requires_url() {
        let f = write_config(&MINIMAL.replace(
            "[server]",
            "[embedding]\nprovider = \"remote\"\nmodel = \"text-embedding-3-small\"\n\n[server]",
        ));
        let err = load_config(f.path()).unwrap_err();
        assert!(err.to_string().contains("embedding.url"));
    }

    #[test]
    fn test_floor_above_threshold_rejected() {
        let f = write_config(&MINIMAL.replace("disclaimer_floor = 0.6", "disclaimer_floor = 0.9"));
        assert!(load_config(f.path()).is_err());
    }

    #[test]
    fn test_no_personas_rejected() {
        let body = r#"
[db]
path = "data/kgate.sqlite"

[server]
bind = "127.0.0.1:7431"
"#;
        let f = write_config(body);
        assert!(load_config(f.path()).is_err());
    }
}
