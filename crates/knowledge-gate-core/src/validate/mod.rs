//! Six-stage validation pipeline.
//!
//! Candidates returned by the vector store pass through a strictly
//! ordered sequence of stages. Each stage may drop candidates, force
//! escalation (short-circuiting the remaining stages), or pass through
//! unchanged. Order matters: confidence scoring must only ever see
//! candidates that already survived the isolation and authority checks.
//!
//! | # | Stage | Effect |
//! |---|-------|--------|
//! | 1 | Freshness | Drops candidates older than the policy's per-category window |
//! | 2 | Authority | Drops candidates from uploaders outside the category's permitted set |
//! | 3 | Conflict | Forces escalation when structured facts disagree |
//! | 4 | Isolation | Integrity re-check of tenant and category; violation escalates and alerts |
//! | 5 | Confidence | Scores the survivors against the persona's thresholds |
//! | 6 | Audit | Observational only — performed by the orchestrator's sink, never changes the decision |
//!
//! State machine: `RECEIVED → FRESHNESS_CHECKED → AUTHORITY_CHECKED →
//! CONFLICT_CHECKED → ISOLATION_CHECKED → SCORED → {ANSWER |
//! ANSWER_WITH_DISCLAIMER | ESCALATE} → AUDITED`. Any stage may jump
//! straight to `ESCALATE → AUDITED`.
//!
//! Stages are pure functions over `(Vec<Candidate>, &PipelineContext)`;
//! [`ValidationPipeline::run`] composes them with short-circuit
//! reduction, so each stage is independently testable.

pub mod conflict;

use chrono::{DateTime, Utc};
use tracing::error;

use crate::models::{
    Candidate, Decision, EscalationReason, Query, Stage, StageReport, Verdict,
};
use crate::policy::PersonaPolicy;

use self::conflict::{ConflictDetector, MetadataConflictDetector};

/// Everything a stage may read: the query, the persona policy snapshot,
/// and the evaluation instant (fixed once per run so every stage agrees
/// on "now").
pub struct PipelineContext<'a> {
    pub query: &'a Query,
    pub policy: &'a PersonaPolicy,
    pub now: DateTime<Utc>,
}

impl<'a> PipelineContext<'a> {
    pub fn new(query: &'a Query, policy: &'a PersonaPolicy) -> Self {
        Self {
            query,
            policy,
            now: Utc::now(),
        }
    }
}

/// Result of one stage: the surviving candidates plus its report.
/// A `forced` reason on the report short-circuits the pipeline.
struct StageResult {
    survivors: Vec<Candidate>,
    report: StageReport,
}

/// The ordered validation pipeline, stages 1–5.
///
/// Stage 6 (audit) is observational and owned by the orchestrator: it
/// records the verdict this pipeline produced but can never change it.
pub struct ValidationPipeline {
    detector: Box<dyn ConflictDetector>,
}

impl Default for ValidationPipeline {
    fn default() -> Self {
        Self::new(Box::new(MetadataConflictDetector::default()))
    }
}

impl ValidationPipeline {
    /// Build a pipeline with a custom conflict-detection strategy.
    pub fn new(detector: Box<dyn ConflictDetector>) -> Self {
        Self { detector }
    }

    /// Run stages 1–5 over the ordered candidates and produce a
    /// [`Verdict`]. Never fails: integrity faults surface as an
    /// escalation verdict plus an error-level alert.
    pub fn run(&self, candidates: Vec<Candidate>, ctx: &PipelineContext<'_>) -> Verdict {
        let mut reasons = Vec::with_capacity(5);
        let mut current = candidates;

        for stage in [
            Stage::Freshness,
            Stage::Authority,
            Stage::Conflict,
            Stage::Isolation,
        ] {
            let result = match stage {
                Stage::Freshness => stage_freshness(current, ctx),
                Stage::Authority => stage_authority(current, ctx),
                Stage::Conflict => stage_conflict(current, ctx, self.detector.as_ref()),
                Stage::Isolation => stage_isolation(current, ctx),
                _ => unreachable!(),
            };
            let forced = result.report.forced;
            reasons.push(result.report);
            current = result.survivors;
            if let Some(reason) = forced {
                return escalate(current, reasons, reason);
            }
        }

        stage_confidence(current, ctx, reasons)
    }
}

/// Build the terminal escalation verdict. Accepted chunks are always
/// empty on escalation; confidence still reports the top survivor's
/// similarity for the audit trail.
fn escalate(survivors: Vec<Candidate>, reasons: Vec<StageReport>, _reason: EscalationReason) -> Verdict {
    let confidence = survivors.first().map(|c| c.similarity).unwrap_or(0.0);
    Verdict {
        decision: Decision::Escalate,
        accepted_chunks: Vec::new(),
        reasons,
        confidence,
    }
}

/// Stage 1 — drop candidates whose document age exceeds the category's
/// freshness window. An emptied candidate set is not an escalation
/// trigger here; it falls through to confidence scoring, which fails
/// the threshold naturally.
fn stage_freshness(candidates: Vec<Candidate>, ctx: &PipelineContext<'_>) -> StageResult {
    let before = candidates.len();
    let survivors: Vec<Candidate> = candidates
        .into_iter()
        .filter(|c| match ctx.policy.max_age_for(c.chunk.category) {
            Some(max_age) => ctx.now - c.chunk.created_at <= max_age,
            None => true,
        })
        .collect();
    StageResult {
        report: StageReport {
            stage: Stage::Freshness,
            dropped: before - survivors.len(),
            survivors: survivors.len(),
            forced: None,
            note: None,
        },
        survivors,
    }
}

/// Stage 2 — drop candidates whose uploader role is outside the
/// category's permitted set.
fn stage_authority(candidates: Vec<Candidate>, _ctx: &PipelineContext<'_>) -> StageResult {
    let before = candidates.len();
    let survivors: Vec<Candidate> = candidates
        .into_iter()
        .filter(|c| {
            c.chunk
                .category
                .permitted_uploaders()
                .contains(&c.chunk.uploader_role)
        })
        .collect();
    StageResult {
        report: StageReport {
            stage: Stage::Authority,
            dropped: before - survivors.len(),
            survivors: survivors.len(),
            forced: None,
            note: None,
        },
        survivors,
    }
}

/// Stage 3 — force escalation when the detector finds two sources
/// asserting different values for the same structured fact. Confidence
/// is irrelevant here: a 0.95-similarity candidate does not outrank a
/// disagreement about a dosage.
fn stage_conflict(
    candidates: Vec<Candidate>,
    _ctx: &PipelineContext<'_>,
    detector: &dyn ConflictDetector,
) -> StageResult {
    let finding = detector.detect(&candidates);
    let n = candidates.len();
    StageResult {
        report: StageReport {
            stage: Stage::Conflict,
            dropped: 0,
            survivors: n,
            forced: finding.as_ref().map(|_| EscalationReason::ConflictingSources),
            note: finding.map(|f| f.fact_key),
        },
        survivors: candidates,
    }
}

/// Stage 4 — defense-in-depth re-check of tenant and category.
///
/// The store filter should have excluded anything caught here; a hit
/// means the filter layer is defective, so the request escalates and an
/// integrity alert fires — distinct from a business escalation.
fn stage_isolation(candidates: Vec<Candidate>, ctx: &PipelineContext<'_>) -> StageResult {
    let violation = candidates.iter().find(|c| {
        c.chunk.tenant_id != ctx.query.tenant_id || !ctx.policy.allows(c.chunk.category)
    });

    let forced = violation.map(|c| {
        error!(
            target: "knowledge_gate::integrity",
            chunk_id = %c.chunk.id,
            chunk_tenant = %c.chunk.tenant_id,
            query_tenant = %ctx.query.tenant_id,
            category = %c.chunk.category,
            persona = %ctx.policy.persona_id,
            "isolation violation: candidate escaped the store filter"
        );
        EscalationReason::IsolationViolation
    });
    let note = violation.map(|c| format!("chunk {}", c.chunk.id));

    let n = candidates.len();
    StageResult {
        report: StageReport {
            stage: Stage::Isolation,
            dropped: 0,
            survivors: n,
            forced,
            note,
        },
        survivors: candidates,
    }
}

/// Stage 5 — score the survivors and decide.
///
/// Confidence is the similarity of the top surviving candidate. At or
/// above the persona's threshold → ANSWER; in `[floor, threshold)` →
/// ANSWER_WITH_DISCLAIMER; below the floor (or with no survivors) →
/// ESCALATE with reason `low_confidence`.
fn stage_confidence(
    survivors: Vec<Candidate>,
    ctx: &PipelineContext<'_>,
    mut reasons: Vec<StageReport>,
) -> Verdict {
    let confidence = survivors.first().map(|c| c.similarity).unwrap_or(0.0);

    let decision = if survivors.is_empty() || confidence < ctx.policy.disclaimer_floor {
        Decision::Escalate
    } else if confidence < ctx.policy.confidence_threshold {
        Decision::AnswerWithDisclaimer
    } else {
        Decision::Answer
    };

    reasons.push(StageReport {
        stage: Stage::Confidence,
        dropped: 0,
        survivors: survivors.len(),
        forced: match decision {
            Decision::Escalate => Some(EscalationReason::LowConfidence),
            _ => None,
        },
        note: Some(format!(
            "confidence {:.3} vs threshold {:.3} / floor {:.3}",
            confidence, ctx.policy.confidence_threshold, ctx.policy.disclaimer_floor
        )),
    });

    Verdict {
        accepted_chunks: match decision {
            Decision::Escalate => Vec::new(),
            _ => survivors,
        },
        decision,
        reasons,
        confidence,
    }
}
