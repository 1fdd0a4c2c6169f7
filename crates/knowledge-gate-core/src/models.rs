//! Core data models flowing through the retrieval-and-validation pipeline.
//!
//! Documents and chunks are created by ingestion and persist until removed;
//! queries, candidates, and verdicts live for a single retrieval call;
//! audit records are append-only and outlive everything.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Source document category. Each category carries its own freshness
/// window and permitted-uploader set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Medical,
    Protocol,
    Biography,
    Conversational,
}

impl Category {
    /// All categories, in declaration order.
    pub const ALL: [Category; 4] = [
        Category::Medical,
        Category::Protocol,
        Category::Biography,
        Category::Conversational,
    ];

    /// Uploader roles allowed to source documents of this category.
    ///
    /// Used by the authority stage: a medical candidate uploaded by a
    /// family member is dropped no matter how similar it is.
    pub fn permitted_uploaders(&self) -> &'static [UploaderRole] {
        match self {
            Category::Medical => &[UploaderRole::Nurse, UploaderRole::Doctor],
            Category::Protocol => &[UploaderRole::Nurse, UploaderRole::Doctor, UploaderRole::Staff],
            Category::Biography => &[
                UploaderRole::Family,
                UploaderRole::Staff,
                UploaderRole::Nurse,
                UploaderRole::Doctor,
            ],
            Category::Conversational => &[
                UploaderRole::Nurse,
                UploaderRole::Doctor,
                UploaderRole::Family,
                UploaderRole::Staff,
            ],
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Medical => "medical",
            Category::Protocol => "protocol",
            Category::Biography => "biography",
            Category::Conversational => "conversational",
        }
    }
}

impl std::str::FromStr for Category {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "medical" => Ok(Category::Medical),
            "protocol" => Ok(Category::Protocol),
            "biography" => Ok(Category::Biography),
            "conversational" => Ok(Category::Conversational),
            other => anyhow::bail!(
                "Unknown category: '{}'. Must be medical, protocol, biography, or conversational.",
                other
            ),
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Role of the person who uploaded a source document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploaderRole {
    Nurse,
    Doctor,
    Family,
    Staff,
}

impl UploaderRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploaderRole::Nurse => "nurse",
            UploaderRole::Doctor => "doctor",
            UploaderRole::Family => "family",
            UploaderRole::Staff => "staff",
        }
    }
}

impl std::str::FromStr for UploaderRole {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "nurse" => Ok(UploaderRole::Nurse),
            "doctor" => Ok(UploaderRole::Doctor),
            "family" => Ok(UploaderRole::Family),
            "staff" => Ok(UploaderRole::Staff),
            other => anyhow::bail!(
                "Unknown uploader role: '{}'. Must be nurse, doctor, family, or staff.",
                other
            ),
        }
    }
}

impl std::fmt::Display for UploaderRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable source document. Owned by ingestion; the pipeline only reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub tenant_id: String,
    pub category: Category,
    pub uploader_role: UploaderRole,
    pub created_at: DateTime<Utc>,
    pub content: String,
    /// Structured facts inherited by every chunk, e.g.
    /// `{"fact": "dosage:metformin", "resident_id": "R1", "value": "500mg"}`.
    /// Conflict detection compares these across sources.
    #[serde(default = "empty_metadata")]
    pub metadata: serde_json::Value,
}

/// A contiguous slice of a document's text — the unit of retrieval.
///
/// Tenant, category, uploader role, and creation time are denormalized
/// from the parent document so that store filtering and every validation
/// stage work without a join.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    /// Non-owning back-reference to the parent [`Document`].
    pub document_id: String,
    pub tenant_id: String,
    pub category: Category,
    pub uploader_role: UploaderRole,
    /// Character span `[start, end)` within the parent document's content.
    pub token_span: (usize, usize),
    pub text: String,
    /// Inherited from the document unless the document was re-ingested.
    pub created_at: DateTime<Utc>,
    /// Structured facts for conflict detection (e.g. `{"fact":
    /// "dosage:metformin", "resident_id": "R1", "value": "500mg"}`).
    /// Empty object when the chunk carries no structured facts.
    #[serde(default = "empty_metadata")]
    pub metadata: serde_json::Value,
}

fn empty_metadata() -> serde_json::Value {
    serde_json::json!({})
}

/// A chunk plus its similarity to the query vector, as returned by the
/// vector store before validation. Candidate lists are always ordered
/// descending by similarity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub chunk: Chunk,
    pub similarity: f32,
}

/// One retrieval request. Created per call, destroyed with it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Query {
    pub id: Uuid,
    pub text: String,
    pub tenant_id: String,
    pub persona_id: String,
    pub issued_at: DateTime<Utc>,
}

impl Query {
    pub fn new(text: impl Into<String>, tenant_id: impl Into<String>, persona_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            text: text.into(),
            tenant_id: tenant_id.into(),
            persona_id: persona_id.into(),
            issued_at: Utc::now(),
        }
    }

    /// Normalized form of the query text, used for cache keys and
    /// embedding: trimmed, lowercased, inner whitespace collapsed.
    pub fn normalized_text(&self) -> String {
        normalize_query_text(&self.text)
    }
}

/// Normalize query text for caching and embedding.
pub fn normalize_query_text(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Final decision for a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Answer,
    AnswerWithDisclaimer,
    Escalate,
}

/// Why a stage forced escalation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationReason {
    ConflictingSources,
    LowConfidence,
    IsolationViolation,
    /// Embedding or store backend failed before the deadline.
    RetrievalFailure,
    RetrievalTimeout,
    EmergencyPersona,
}

impl EscalationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EscalationReason::ConflictingSources => "conflicting_sources",
            EscalationReason::LowConfidence => "low_confidence",
            EscalationReason::IsolationViolation => "isolation_violation",
            EscalationReason::RetrievalFailure => "retrieval_failure",
            EscalationReason::RetrievalTimeout => "retrieval_timeout",
            EscalationReason::EmergencyPersona => "emergency_persona",
        }
    }
}

/// Validation pipeline stage names, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Freshness,
    Authority,
    Conflict,
    Isolation,
    Confidence,
    Audit,
}

/// Outcome of one validation stage, recorded in order on the verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageReport {
    pub stage: Stage,
    /// Candidates dropped by this stage.
    pub dropped: usize,
    /// Candidates surviving after this stage.
    pub survivors: usize,
    /// Set when this stage forced escalation (short-circuiting the rest).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forced: Option<EscalationReason>,
    /// Free-form detail (e.g. the conflicting fact key).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// The pipeline's decision for one query. Constructed once, immutable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verdict {
    pub decision: Decision,
    /// Ordered subset of the candidates that back the answer. Empty on
    /// escalation.
    pub accepted_chunks: Vec<Candidate>,
    /// One report per executed stage, in execution order.
    pub reasons: Vec<StageReport>,
    /// Similarity of the top accepted candidate; `0.0` when none survive.
    pub confidence: f32,
}

impl Verdict {
    /// The escalation reason, if any stage forced one.
    pub fn escalation_reason(&self) -> Option<EscalationReason> {
        self.reasons.iter().rev().find_map(|r| r.forced)
    }
}

/// Append-only record of one retrieval call. Written unconditionally,
/// never mutated or deleted by the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Uuid,
    pub query: Query,
    pub verdict: Verdict,
    pub timestamp: DateTime<Utc>,
    /// Which embedding provider actually served the call: `"remote"`,
    /// `"local"`, `"cache"` when the verdict came from the result cache,
    /// or `"none"` when no embedding happened (emergency bypass, timeout).
    pub provider_used: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_collapses_whitespace() {
        assert_eq!(
            normalize_query_text("  What   dose\tof Metformin?\n"),
            "what dose of metformin?"
        );
    }

    #[test]
    fn test_normalize_idempotent() {
        let once = normalize_query_text("Morning MEDS for R1");
        assert_eq!(normalize_query_text(&once), once);
    }

    #[test]
    fn test_category_roundtrip() {
        for cat in Category::ALL {
            let parsed: Category = cat.as_str().parse().unwrap();
            assert_eq!(parsed, cat);
        }
    }

    #[test]
    fn test_medical_uploaders_exclude_family() {
        let allowed = Category::Medical.permitted_uploaders();
        assert!(allowed.contains(&UploaderRole::Nurse));
        assert!(allowed.contains(&UploaderRole::Doctor));
        assert!(!allowed.contains(&UploaderRole::Family));
        assert!(!allowed.contains(&UploaderRole::Staff));
    }

    #[test]
    fn test_escalation_reason_from_reports() {
        let verdict = Verdict {
            decision: Decision::Escalate,
            accepted_chunks: vec![],
            reasons: vec![
                StageReport {
                    stage: Stage::Freshness,
                    dropped: 1,
                    survivors: 2,
                    forced: None,
                    note: None,
                },
                StageReport {
                    stage: Stage::Conflict,
                    dropped: 0,
                    survivors: 2,
                    forced: Some(EscalationReason::ConflictingSources),
                    note: Some("dosage:metformin".to_string()),
                },
            ],
            confidence: 0.0,
        };
        assert_eq!(
            verdict.escalation_reason(),
            Some(EscalationReason::ConflictingSources)
        );
    }
}
