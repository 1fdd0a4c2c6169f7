//! Query orchestration: the control loop around the validation pipeline.
//!
//! Per query, in order:
//!
//! 1. Take a policy snapshot and resolve the persona. Emergency personas
//!    short-circuit here: fixed escalation, no cache, no store access.
//! 2. Check the verdict cache (tenant + persona + normalized text). Hits
//!    are audited with `provider_used = "cache"`.
//! 3. On a miss, embed (memoized per provider and text hash) and search
//!    under a request-level deadline. Deadline expiry produces an
//!    escalation verdict with `retrieval_timeout`; a backend failure
//!    inside the deadline produces `retrieval_failure`. Neither
//!    surfaces as an error.
//! 4. Run the five validation stages.
//! 5. Audit (stage 6) through the background writer, submit escalations,
//!    and cache the verdict — unless it escalated. Escalation verdicts
//!    are never cached; the condition that caused one deserves a fresh
//!    look every time.
//!
//! Cache TTL is clamped to the persona's strictest freshness window so a
//! hit can never outlive the data it was validated against.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use knowledge_gate_core::embedding::{EmbeddingProvider, TaggedVector};
use knowledge_gate_core::error::GateError;
use knowledge_gate_core::models::{
    AuditRecord, Decision, EscalationReason, Query, Stage, StageReport, Verdict,
};
use knowledge_gate_core::sink::{EscalationContext, EscalationSink};
use knowledge_gate_core::store::{SearchFilter, VectorStore};
use knowledge_gate_core::validate::{PipelineContext, ValidationPipeline};

use crate::cache::SingleFlightCache;
use crate::config::RetrievalConfig;
use crate::policy_store::PolicyStore;
use crate::sinks::AuditWriter;

/// Disclaimer attached to `answer_with_disclaimer` responses.
pub const DISCLAIMER_TEXT: &str =
    "This information may be incomplete. Please verify with care staff before acting on it.";

/// Fixed safe message returned on every escalation. Deliberately free of
/// detail about what was found or why it was withheld.
pub const ESCALATION_MESSAGE: &str =
    "I can't answer that right now. The care team has been notified and will follow up.";

/// What the verdict cache stores per (tenant, persona, normalized text).
#[derive(Clone)]
pub struct CachedVerdict {
    pub verdict: Verdict,
    /// Provider that embedded the original computation.
    pub provider_used: String,
}

/// Serialized answer for transport back to the assistant.
#[derive(Debug, Clone, serde::Serialize)]
pub struct QueryResponse {
    pub query_id: Uuid,
    pub decision: Decision,
    pub confidence: f32,
    /// Chunk texts backing the answer, best match first. Empty on
    /// escalation.
    pub accepted_chunks: Vec<AcceptedChunk>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disclaimer: Option<String>,
    /// Fixed safe message, present only on escalation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Whether an escalation was handed to the human follow-up queue.
    pub human_notified: bool,
    pub provider_used: String,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct AcceptedChunk {
    pub chunk_id: String,
    pub document_id: String,
    pub text: String,
    pub similarity: f32,
}

pub struct Orchestrator {
    store: Arc<dyn VectorStore>,
    provider: Arc<dyn EmbeddingProvider>,
    pipeline: ValidationPipeline,
    policies: Arc<PolicyStore>,
    audit: AuditWriter,
    escalations: Arc<dyn EscalationSink>,
    verdict_cache: SingleFlightCache<CachedVerdict>,
    /// Memoized query embeddings, keyed by provider id + text hash.
    embedding_cache: SingleFlightCache<TaggedVector>,
    retrieval: RetrievalConfig,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn VectorStore>,
        provider: Arc<dyn EmbeddingProvider>,
        pipeline: ValidationPipeline,
        policies: Arc<PolicyStore>,
        audit: AuditWriter,
        escalations: Arc<dyn EscalationSink>,
        verdict_cache: SingleFlightCache<CachedVerdict>,
        embedding_cache: SingleFlightCache<TaggedVector>,
        retrieval: RetrievalConfig,
    ) -> Self {
        Self {
            store,
            provider,
            pipeline,
            policies,
            audit,
            escalations,
            verdict_cache,
            embedding_cache,
            retrieval,
        }
    }

    /// Handle one query end to end. The only error surfaced to callers is
    /// an unknown persona; every operational failure inside retrieval
    /// resolves to an escalation verdict instead.
    pub async fn handle(&self, query: Query) -> Result<QueryResponse, GateError> {
        let policies = self.policies.snapshot();
        let policy = policies
            .get(&query.persona_id)
            .ok_or_else(|| GateError::UnknownPersona(query.persona_id.clone()))?;

        if policy.emergency {
            return Ok(self.handle_emergency(query).await);
        }

        let cache_key = format!(
            "{}|{}|{}",
            query.tenant_id,
            query.persona_id,
            query.normalized_text()
        );
        let ttl = self.cache_ttl(policy.strictest_max_age());

        let (cached, hit) = self
            .verdict_cache
            .get_or_compute(&cache_key, &query.tenant_id, ttl, || {
                self.compute_verdict(&query, &policy)
            })
            .await?;

        let provider_used = if hit {
            "cache".to_string()
        } else {
            cached.provider_used.clone()
        };

        let mut human_notified = false;
        if cached.verdict.decision == Decision::Escalate {
            // Hits are never escalations; this is always a fresh verdict.
            self.verdict_cache.remove(&cache_key).await;
            human_notified = self.submit_escalation(&query, &cached.verdict).await;
        }

        self.audit.record(AuditRecord {
            id: Uuid::new_v4(),
            query: query.clone(),
            verdict: cached.verdict.clone(),
            timestamp: Utc::now(),
            provider_used: provider_used.clone(),
        });

        Ok(build_response(
            &query,
            &cached.verdict,
            provider_used,
            human_notified,
        ))
    }

    /// Reload persona policies from disk. Exposed for the admin surface.
    pub fn reload_policies(&self) -> anyhow::Result<usize> {
        self.policies.reload()
    }

    pub async fn cache_entries(&self) -> usize {
        self.verdict_cache.len().await
    }

    /// Emergency personas never consult stored knowledge: any query is a
    /// fixed escalation straight to a human, with nothing cached.
    async fn handle_emergency(&self, query: Query) -> QueryResponse {
        let verdict = Verdict {
            decision: Decision::Escalate,
            accepted_chunks: Vec::new(),
            reasons: vec![StageReport {
                stage: Stage::Confidence,
                dropped: 0,
                survivors: 0,
                forced: Some(EscalationReason::EmergencyPersona),
                note: Some("emergency persona bypasses retrieval".to_string()),
            }],
            confidence: 0.0,
        };

        let human_notified = self.submit_escalation(&query, &verdict).await;

        self.audit.record(AuditRecord {
            id: Uuid::new_v4(),
            query: query.clone(),
            verdict: verdict.clone(),
            timestamp: Utc::now(),
            provider_used: "none".to_string(),
        });

        build_response(&query, &verdict, "none".to_string(), human_notified)
    }

    /// Embed, search, validate. Runs under the request deadline; expiry
    /// becomes a `retrieval_timeout` escalation.
    async fn compute_verdict(
        &self,
        query: &Query,
        policy: &knowledge_gate_core::policy::PersonaPolicy,
    ) -> Result<CachedVerdict, GateError> {
        let deadline = Duration::from_millis(self.retrieval.request_timeout_ms);
        let normalized = query.normalized_text();

        // The store-level age filter must never drop a chunk the
        // freshness stage would keep, so prefilter with the loosest
        // window, and only when every allowed category is bounded.
        let prefilter_age = policy
            .allowed_categories
            .iter()
            .map(|c| policy.max_age_for(*c))
            .collect::<Option<Vec<_>>>()
            .and_then(|windows| windows.into_iter().max());

        let filter = SearchFilter {
            tenant_id: query.tenant_id.clone(),
            categories: policy.allowed_categories.clone(),
            max_age: prefilter_age,
        };

        let retrieval = async {
            // Memoized per (provider, text hash): the same normalized
            // text asked under another tenant or persona reuses the
            // vector instead of re-embedding. A vector produced by the
            // local fallback can be replayed until its TTL lapses even
            // once the remote side recovers.
            let embed_key = embedding_key(self.provider.provider_id(), &normalized);
            let (tagged, _) = self
                .embedding_cache
                .get_or_compute(
                    &embed_key,
                    self.provider.provider_id(),
                    Duration::from_secs(self.retrieval.result_ttl_secs),
                    || self.provider.embed(&normalized),
                )
                .await?;
            let provider_used = tagged.provider_id.clone();
            let candidates = self
                .store
                .query(&tagged, &filter, self.retrieval.candidate_k)
                .await
                .map_err(|e| GateError::ProviderUnavailable(e.to_string()))?;
            Ok::<_, GateError>((candidates, provider_used))
        };

        let (candidates, provider_used) = match tokio::time::timeout(deadline, retrieval).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                tracing::warn!(query = %query.id, error = %e, "retrieval failed, escalating");
                return Ok(CachedVerdict {
                    verdict: retrieval_failure_verdict(
                        EscalationReason::RetrievalFailure,
                        format!("retrieval failed: {}", e),
                    ),
                    provider_used: "none".to_string(),
                });
            }
            Err(_) => {
                tracing::warn!(query = %query.id, ?deadline, "retrieval deadline expired");
                return Ok(CachedVerdict {
                    verdict: retrieval_failure_verdict(
                        EscalationReason::RetrievalTimeout,
                        format!("retrieval exceeded {:?}", deadline),
                    ),
                    provider_used: "none".to_string(),
                });
            }
        };

        let ctx = PipelineContext::new(query, policy);
        let verdict = self.pipeline.run(candidates, &ctx);

        Ok(CachedVerdict {
            verdict,
            provider_used,
        })
    }

    /// Submit to the escalation sink. Sink failure is logged, not
    /// propagated; the caller still receives the escalation verdict.
    async fn submit_escalation(&self, query: &Query, verdict: &Verdict) -> bool {
        let reason = verdict
            .escalation_reason()
            .unwrap_or(EscalationReason::LowConfidence);
        let context = EscalationContext {
            query_id: query.id,
            tenant_id: query.tenant_id.clone(),
            persona_id: query.persona_id.clone(),
            reason,
            query_text: query.text.clone(),
            created_at: Utc::now(),
        };
        match self.escalations.submit(&context).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(query = %query.id, error = %e, "escalation sink unavailable");
                false
            }
        }
    }

    /// Result-cache TTL: the configured ceiling, clamped to the persona's
    /// strictest freshness window.
    fn cache_ttl(&self, strictest: Option<chrono::Duration>) -> Duration {
        let configured = Duration::from_secs(self.retrieval.result_ttl_secs);
        match strictest.and_then(|d| d.to_std().ok()) {
            Some(window) => configured.min(window),
            None => configured,
        }
    }
}

fn embedding_key(provider_id: &str, normalized: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    format!("{}|{:x}", provider_id, hasher.finalize())
}

fn retrieval_failure_verdict(reason: EscalationReason, note: String) -> Verdict {
    Verdict {
        decision: Decision::Escalate,
        accepted_chunks: Vec::new(),
        reasons: vec![StageReport {
            stage: Stage::Confidence,
            dropped: 0,
            survivors: 0,
            forced: Some(reason),
            note: Some(note),
        }],
        confidence: 0.0,
    }
}

fn build_response(
    query: &Query,
    verdict: &Verdict,
    provider_used: String,
    human_notified: bool,
) -> QueryResponse {
    QueryResponse {
        query_id: query.id,
        decision: verdict.decision,
        confidence: verdict.confidence,
        accepted_chunks: verdict
            .accepted_chunks
            .iter()
            .map(|c| AcceptedChunk {
                chunk_id: c.chunk.id.clone(),
                document_id: c.chunk.document_id.clone(),
                text: c.chunk.text.clone(),
                similarity: c.similarity,
            })
            .collect(),
        disclaimer: (verdict.decision == Decision::AnswerWithDisclaimer)
            .then(|| DISCLAIMER_TEXT.to_string()),
        message: (verdict.decision == Decision::Escalate)
            .then(|| ESCALATION_MESSAGE.to_string()),
        human_notified,
        provider_used,
    }
}
