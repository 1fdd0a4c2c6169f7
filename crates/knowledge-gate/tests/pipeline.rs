//! End-to-end tests: ingest → orchestrate → verdict, against the
//! in-memory store with hashed local embeddings and memory sinks.

use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use rand::seq::SliceRandom;
use rand::SeedableRng;

use knowledge_gate::cache::SingleFlightCache;
use knowledge_gate::config::{EmbeddingConfig, RetrievalConfig};
use knowledge_gate::embedding::{FallbackProvider, LocalProvider, RemoteProvider};
use knowledge_gate::ingest::Ingestor;
use knowledge_gate::orchestrator::{Orchestrator, QueryResponse};
use knowledge_gate::policy_store::PolicyStore;
use knowledge_gate::sinks::AuditWriter;

use knowledge_gate_core::embedding::{EmbeddingProvider, TaggedVector};
use knowledge_gate_core::error::GateError;
use knowledge_gate_core::models::{
    Candidate, Category, Decision, Document, EscalationReason, Query, UploaderRole,
};
use knowledge_gate_core::policy::{PersonaPolicy, PolicySet};
use knowledge_gate_core::sink::{MemoryAuditSink, MemoryEscalationSink};
use knowledge_gate_core::store::{MemoryVectorStore, SearchFilter, StoreMetrics, VectorStore};
use knowledge_gate_core::validate::ValidationPipeline;

const DIMS: usize = 4096;

/// Store wrapper that counts `query` calls, for asserting cache behavior
/// and the emergency bypass.
struct CountingStore {
    inner: MemoryVectorStore,
    query_calls: AtomicUsize,
}

impl CountingStore {
    fn new() -> Self {
        Self {
            inner: MemoryVectorStore::new(),
            query_calls: AtomicUsize::new(0),
        }
    }

    fn queries(&self) -> usize {
        self.query_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VectorStore for CountingStore {
    async fn upsert_document(&self, doc: &Document) -> Result<()> {
        self.inner.upsert_document(doc).await
    }

    async fn replace_chunks(
        &self,
        document_id: &str,
        chunks: &[knowledge_gate_core::models::Chunk],
        embeddings: &[Vec<TaggedVector>],
    ) -> Result<()> {
        self.inner
            .replace_chunks(document_id, chunks, embeddings)
            .await
    }

    async fn delete_document(&self, document_id: &str, tenant_id: &str) -> Result<bool> {
        self.inner.delete_document(document_id, tenant_id).await
    }

    async fn query(
        &self,
        vector: &TaggedVector,
        filter: &SearchFilter,
        k: usize,
    ) -> Result<Vec<Candidate>> {
        self.query_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.query(vector, filter, k).await
    }

    async fn metrics(&self) -> Result<StoreMetrics> {
        self.inner.metrics().await
    }
}

/// Provider wrapper that counts `embed` calls, for asserting embedding
/// memoization.
struct CountingProvider {
    inner: LocalProvider,
    embed_calls: AtomicUsize,
}

impl CountingProvider {
    fn new() -> Self {
        Self {
            inner: LocalProvider::new(DIMS),
            embed_calls: AtomicUsize::new(0),
        }
    }

    fn embeds(&self) -> usize {
        self.embed_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmbeddingProvider for CountingProvider {
    fn provider_id(&self) -> &str {
        self.inner.provider_id()
    }

    fn dims(&self) -> usize {
        self.inner.dims()
    }

    async fn embed(&self, text: &str) -> Result<TaggedVector, GateError> {
        self.embed_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.embed(text).await
    }
}

/// Provider that is permanently down, for exercising retrieval failure
/// handling.
struct DownProvider;

#[async_trait]
impl EmbeddingProvider for DownProvider {
    fn provider_id(&self) -> &str {
        "remote"
    }

    fn dims(&self) -> usize {
        DIMS
    }

    async fn embed(&self, _text: &str) -> Result<TaggedVector, GateError> {
        Err(GateError::ProviderUnavailable(
            "embedding backend offline".to_string(),
        ))
    }
}

fn persona(
    id: &str,
    categories: &[Category],
    threshold: f32,
    floor: f32,
    medical_max_age_hours: Option<u64>,
) -> PersonaPolicy {
    let mut max_age_secs = std::collections::BTreeMap::new();
    if let Some(hours) = medical_max_age_hours {
        max_age_secs.insert(Category::Medical, hours * 3600);
    }
    PersonaPolicy {
        persona_id: id.to_string(),
        allowed_categories: categories.iter().copied().collect(),
        confidence_threshold: threshold,
        disclaimer_floor: floor,
        max_age_secs,
        emergency: false,
    }
}

fn emergency_persona(id: &str) -> PersonaPolicy {
    PersonaPolicy {
        persona_id: id.to_string(),
        allowed_categories: Default::default(),
        confidence_threshold: 0.75,
        disclaimer_floor: 0.6,
        max_age_secs: Default::default(),
        emergency: true,
    }
}

fn default_policies() -> Vec<PersonaPolicy> {
    vec![
        persona(
            "caregiver",
            &[
                Category::Medical,
                Category::Protocol,
                Category::Biography,
                Category::Conversational,
            ],
            0.8,
            0.2,
            Some(24),
        ),
        persona(
            "companion",
            &[Category::Biography, Category::Conversational],
            0.8,
            0.2,
            None,
        ),
        emergency_persona("emergency"),
    ]
}

struct Harness {
    store: Arc<CountingStore>,
    ingestor: Ingestor,
    orchestrator: Orchestrator,
    escalations: Arc<MemoryEscalationSink>,
    _config_file: tempfile::NamedTempFile,
}

fn harness_with(
    policies: Vec<PersonaPolicy>,
    query_provider: Arc<dyn EmbeddingProvider>,
) -> Harness {
    // PolicyStore wants a config path for reloads; tests never reload.
    let mut config_file = tempfile::NamedTempFile::new().unwrap();
    config_file.write_all(b"# placeholder\n").unwrap();

    let store = Arc::new(CountingStore::new());
    let verdict_cache = SingleFlightCache::new(64);
    let embedding_cache = SingleFlightCache::new(64);

    let ingestor = Ingestor::new(
        store.clone() as Arc<dyn VectorStore>,
        vec![Arc::new(LocalProvider::new(DIMS))],
        knowledge_gate::config::ChunkingConfig::default(),
        verdict_cache.clone(),
    );

    let policy_store = Arc::new(PolicyStore::new(
        config_file.path(),
        PolicySet::new(policies).unwrap(),
    ));
    let audit = AuditWriter::spawn(Arc::new(MemoryAuditSink::default()));
    let escalations = Arc::new(MemoryEscalationSink::default());

    let orchestrator = Orchestrator::new(
        store.clone() as Arc<dyn VectorStore>,
        query_provider,
        ValidationPipeline::default(),
        policy_store,
        audit,
        escalations.clone(),
        verdict_cache,
        embedding_cache,
        RetrievalConfig::default(),
    );

    Harness {
        store,
        ingestor,
        orchestrator,
        escalations,
        _config_file: config_file,
    }
}

fn harness() -> Harness {
    harness_with(default_policies(), Arc::new(LocalProvider::new(DIMS)))
}

fn doc(
    id: &str,
    tenant: &str,
    category: Category,
    role: UploaderRole,
    content: &str,
    age: ChronoDuration,
    metadata: serde_json::Value,
) -> Document {
    Document {
        id: id.to_string(),
        tenant_id: tenant.to_string(),
        category,
        uploader_role: role,
        created_at: Utc::now() - age,
        content: content.to_string(),
        metadata,
    }
}

async fn ask(h: &Harness, text: &str, tenant: &str, persona: &str) -> QueryResponse {
    h.orchestrator
        .handle(Query::new(text, tenant, persona))
        .await
        .unwrap()
}

const MED_NOTE: &str = "Metformin 500mg with breakfast every morning";

#[tokio::test]
async fn test_fresh_medical_note_is_answered() {
    let h = harness();
    h.ingestor
        .ingest(&doc(
            "d1",
            "r1",
            Category::Medical,
            UploaderRole::Nurse,
            MED_NOTE,
            ChronoDuration::hours(1),
            serde_json::json!({}),
        ))
        .await
        .unwrap();

    let response = ask(&h, MED_NOTE, "r1", "caregiver").await;
    assert_eq!(response.decision, Decision::Answer);
    assert!(response.confidence > 0.99);
    assert_eq!(response.accepted_chunks.len(), 1);
    assert_eq!(response.accepted_chunks[0].document_id, "d1");
    assert_eq!(response.provider_used, "local");
    assert!(!response.human_notified);
}

#[tokio::test]
async fn test_stale_medical_note_escalates() {
    let h = harness();
    h.ingestor
        .ingest(&doc(
            "d1",
            "r1",
            Category::Medical,
            UploaderRole::Nurse,
            MED_NOTE,
            ChronoDuration::hours(48),
            serde_json::json!({}),
        ))
        .await
        .unwrap();

    let response = ask(&h, MED_NOTE, "r1", "caregiver").await;
    assert_eq!(response.decision, Decision::Escalate);
    assert!(response.accepted_chunks.is_empty());
    assert!(response.message.is_some());
    assert!(response.human_notified);

    let submissions = h.escalations.submissions();
    assert_eq!(submissions.len(), 1);
    assert_eq!(submissions[0].reason, EscalationReason::LowConfidence);
}

#[tokio::test]
async fn test_conflicting_dosages_escalate() {
    let h = harness();
    for (id, value, age_hours) in [("d1", "500mg", 2), ("d2", "850mg", 3)] {
        h.ingestor
            .ingest(&doc(
                id,
                "r1",
                Category::Medical,
                UploaderRole::Nurse,
                MED_NOTE,
                ChronoDuration::hours(age_hours),
                serde_json::json!({
                    "fact": "dosage:metformin",
                    "resident_id": "r1",
                    "value": value,
                }),
            ))
            .await
            .unwrap();
    }

    let response = ask(&h, MED_NOTE, "r1", "caregiver").await;
    assert_eq!(response.decision, Decision::Escalate);
    assert_eq!(
        h.escalations.submissions()[0].reason,
        EscalationReason::ConflictingSources
    );
}

#[tokio::test]
async fn test_agreeing_sources_do_not_conflict() {
    let h = harness();
    for id in ["d1", "d2"] {
        h.ingestor
            .ingest(&doc(
                id,
                "r1",
                Category::Medical,
                UploaderRole::Nurse,
                MED_NOTE,
                ChronoDuration::hours(1),
                serde_json::json!({
                    "fact": "dosage:metformin",
                    "resident_id": "r1",
                    "value": "500mg",
                }),
            ))
            .await
            .unwrap();
    }

    let response = ask(&h, MED_NOTE, "r1", "caregiver").await;
    assert_eq!(response.decision, Decision::Answer);
}

#[tokio::test]
async fn test_remote_outage_falls_back_to_local() {
    // Remote endpoint that can never be reached; the fallback must serve
    // the query from the local vector space written at ingest.
    let embedding_config = EmbeddingConfig {
        provider: "fallback".to_string(),
        url: Some("http://127.0.0.1:1/v1/embeddings".to_string()),
        model: Some("unreachable".to_string()),
        dims: DIMS,
        timeout_ms: 100,
        api_key_env: "KGATE_TEST_NO_KEY".to_string(),
    };
    let fallback = FallbackProvider::new(
        RemoteProvider::new(&embedding_config).unwrap(),
        LocalProvider::new(DIMS),
    );

    let h = harness_with(default_policies(), Arc::new(fallback));
    h.ingestor
        .ingest(&doc(
            "d1",
            "r1",
            Category::Medical,
            UploaderRole::Nurse,
            MED_NOTE,
            ChronoDuration::hours(1),
            serde_json::json!({}),
        ))
        .await
        .unwrap();

    let response = ask(&h, MED_NOTE, "r1", "caregiver").await;
    assert_eq!(response.decision, Decision::Answer);
    assert_eq!(response.provider_used, "local");
}

#[tokio::test]
async fn test_emergency_persona_bypasses_retrieval() {
    let h = harness();
    h.ingestor
        .ingest(&doc(
            "d1",
            "r1",
            Category::Medical,
            UploaderRole::Nurse,
            MED_NOTE,
            ChronoDuration::hours(1),
            serde_json::json!({}),
        ))
        .await
        .unwrap();

    let response = ask(&h, "chest pain right now", "r1", "emergency").await;
    assert_eq!(response.decision, Decision::Escalate);
    assert!(response.human_notified);
    assert_eq!(response.provider_used, "none");
    assert_eq!(h.store.queries(), 0, "emergency queries never hit the store");
    assert_eq!(
        h.escalations.submissions()[0].reason,
        EscalationReason::EmergencyPersona
    );
    assert_eq!(h.orchestrator.cache_entries().await, 0);
}

#[tokio::test]
async fn test_repeat_query_is_served_from_cache() {
    let h = harness();
    h.ingestor
        .ingest(&doc(
            "d1",
            "r1",
            Category::Medical,
            UploaderRole::Nurse,
            MED_NOTE,
            ChronoDuration::hours(1),
            serde_json::json!({}),
        ))
        .await
        .unwrap();

    let first = ask(&h, MED_NOTE, "r1", "caregiver").await;
    let second = ask(&h, MED_NOTE, "r1", "caregiver").await;

    assert_eq!(h.store.queries(), 1);
    assert_eq!(second.provider_used, "cache");
    assert_eq!(first.decision, second.decision);
    assert_eq!(first.confidence, second.confidence);

    // Normalization: whitespace and case variants share the entry.
    let third = ask(
        &h,
        &format!("  {}  ", MED_NOTE.to_uppercase()),
        "r1",
        "caregiver",
    )
    .await;
    assert_eq!(third.provider_used, "cache");
    assert_eq!(h.store.queries(), 1);
}

#[tokio::test]
async fn test_escalation_verdicts_are_not_cached() {
    let h = harness();
    // Empty store: every query escalates with low confidence.
    ask(&h, "where are her glasses", "r1", "caregiver").await;
    ask(&h, "where are her glasses", "r1", "caregiver").await;
    assert_eq!(h.store.queries(), 2);
    assert_eq!(h.orchestrator.cache_entries().await, 0);
}

#[tokio::test]
async fn test_reingest_invalidates_tenant_cache_only() {
    let h = harness();
    for tenant in ["r1", "r2"] {
        h.ingestor
            .ingest(&doc(
                &format!("doc-{}", tenant),
                tenant,
                Category::Medical,
                UploaderRole::Nurse,
                MED_NOTE,
                ChronoDuration::hours(1),
                serde_json::json!({}),
            ))
            .await
            .unwrap();
    }

    ask(&h, MED_NOTE, "r1", "caregiver").await;
    ask(&h, MED_NOTE, "r2", "caregiver").await;
    assert_eq!(h.store.queries(), 2);

    // Re-ingest r1's document; r2's cached verdict must survive.
    h.ingestor
        .ingest(&doc(
            "doc-r1",
            "r1",
            Category::Medical,
            UploaderRole::Nurse,
            "Metformin 850mg with breakfast every morning",
            ChronoDuration::hours(0),
            serde_json::json!({}),
        ))
        .await
        .unwrap();

    let r2 = ask(&h, MED_NOTE, "r2", "caregiver").await;
    assert_eq!(r2.provider_used, "cache");
    let r1 = ask(&h, MED_NOTE, "r1", "caregiver").await;
    assert_ne!(r1.provider_used, "cache");
    assert_eq!(h.store.queries(), 3);
}

#[tokio::test]
async fn test_companion_persona_cannot_see_medical() {
    let h = harness();
    h.ingestor
        .ingest(&doc(
            "d1",
            "r1",
            Category::Medical,
            UploaderRole::Nurse,
            MED_NOTE,
            ChronoDuration::hours(1),
            serde_json::json!({}),
        ))
        .await
        .unwrap();

    let response = ask(&h, MED_NOTE, "r1", "companion").await;
    assert_eq!(response.decision, Decision::Escalate);
    assert!(response.accepted_chunks.is_empty());
}

#[tokio::test]
async fn test_unknown_persona_is_an_error() {
    let h = harness();
    let err = h
        .orchestrator
        .handle(Query::new("hello", "r1", "nonexistent"))
        .await
        .unwrap_err();
    assert!(matches!(err, GateError::UnknownPersona(_)));
}

#[tokio::test]
async fn test_mid_similarity_gets_disclaimer() {
    let h = harness();
    h.ingestor
        .ingest(&doc(
            "d1",
            "r1",
            Category::Biography,
            UploaderRole::Family,
            "alpha beta gamma delta",
            ChronoDuration::hours(1),
            serde_json::json!({}),
        ))
        .await
        .unwrap();

    // Two of four tokens shared: similarity near 0.5, inside the
    // disclaimer band (floor 0.2, threshold 0.8).
    let response = ask(&h, "alpha beta zeta eta", "r1", "caregiver").await;
    assert_eq!(response.decision, Decision::AnswerWithDisclaimer);
    assert!(response.disclaimer.is_some());
    assert!(response.confidence > 0.2 && response.confidence < 0.8);
}

#[tokio::test]
async fn test_tenant_isolation_under_shuffled_load() {
    let h = harness();
    let mut rng = rand::rngs::StdRng::seed_from_u64(7);

    let tenants: Vec<String> = (0..8).map(|i| format!("resident-{}", i)).collect();
    for tenant in &tenants {
        h.ingestor
            .ingest(&doc(
                &format!("doc-{}", tenant),
                tenant,
                Category::Biography,
                UploaderRole::Family,
                &format!("life story for {} gardening music chess", tenant),
                ChronoDuration::hours(1),
                serde_json::json!({}),
            ))
            .await
            .unwrap();
    }

    let mut order: Vec<&String> = tenants.iter().collect();
    for _ in 0..5 {
        order.shuffle(&mut rng);
        for tenant in &order {
            let response = ask(
                &h,
                &format!("life story for {} gardening music chess", tenant),
                tenant,
                "companion",
            )
            .await;
            for chunk in &response.accepted_chunks {
                assert_eq!(&chunk.document_id, &format!("doc-{}", tenant));
            }
            assert!(!response.accepted_chunks.is_empty());
        }
    }
}

#[tokio::test]
async fn test_delete_removes_knowledge() {
    let h = harness();
    h.ingestor
        .ingest(&doc(
            "d1",
            "r1",
            Category::Biography,
            UploaderRole::Family,
            "she loved gardening in spring",
            ChronoDuration::hours(1),
            serde_json::json!({}),
        ))
        .await
        .unwrap();

    let before = ask(&h, "she loved gardening in spring", "r1", "companion").await;
    assert_eq!(before.decision, Decision::Answer);

    assert!(h.ingestor.delete("d1", "r1").await.unwrap());

    let after = ask(&h, "she loved gardening in spring", "r1", "companion").await;
    assert_eq!(after.decision, Decision::Escalate);
}

#[tokio::test]
async fn test_delete_by_wrong_tenant_changes_nothing() {
    let h = harness();
    h.ingestor
        .ingest(&doc(
            "d1",
            "r1",
            Category::Biography,
            UploaderRole::Family,
            "she loved gardening in spring",
            ChronoDuration::hours(1),
            serde_json::json!({}),
        ))
        .await
        .unwrap();

    let before = ask(&h, "she loved gardening in spring", "r1", "companion").await;
    assert_eq!(before.decision, Decision::Answer);

    assert!(!h.ingestor.delete("d1", "r2").await.unwrap());
    let metrics = h.store.metrics().await.unwrap();
    assert_eq!(metrics.documents, 1, "another tenant's delete must not land");

    // The owner's document and cached verdict both survive.
    let after = ask(&h, "she loved gardening in spring", "r1", "companion").await;
    assert_eq!(after.decision, Decision::Answer);

    assert!(h.ingestor.delete("d1", "r1").await.unwrap());
    let gone = ask(&h, "she loved gardening in spring", "r1", "companion").await;
    assert_eq!(gone.decision, Decision::Escalate);
}

#[tokio::test]
async fn test_same_text_embeds_once_across_tenants() {
    let provider = Arc::new(CountingProvider::new());
    let h = harness_with(default_policies(), provider.clone());
    for tenant in ["r1", "r2"] {
        h.ingestor
            .ingest(&doc(
                &format!("doc-{}", tenant),
                tenant,
                Category::Medical,
                UploaderRole::Nurse,
                MED_NOTE,
                ChronoDuration::hours(1),
                serde_json::json!({}),
            ))
            .await
            .unwrap();
    }

    // Distinct verdict-cache keys, identical normalized text: the store
    // is searched per tenant but the vector is computed once.
    let r1 = ask(&h, MED_NOTE, "r1", "caregiver").await;
    let r2 = ask(&h, &format!("  {}  ", MED_NOTE), "r2", "caregiver").await;
    assert_eq!(r1.decision, Decision::Answer);
    assert_eq!(r2.decision, Decision::Answer);
    assert_eq!(h.store.queries(), 2);
    assert_eq!(provider.embeds(), 1, "identical text re-embedded");
}

#[tokio::test]
async fn test_backend_failure_escalates_as_retrieval_failure() {
    let h = harness_with(default_policies(), Arc::new(DownProvider));

    let response = ask(&h, MED_NOTE, "r1", "caregiver").await;
    assert_eq!(response.decision, Decision::Escalate);
    assert_eq!(response.provider_used, "none");
    assert_eq!(
        h.escalations.submissions()[0].reason,
        EscalationReason::RetrievalFailure
    );
}
