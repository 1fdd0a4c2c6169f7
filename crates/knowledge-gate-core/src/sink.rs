//! Audit and escalation sink traits, plus in-memory implementations.
//!
//! The audit sink receives one [`AuditRecord`] per retrieval call,
//! unconditionally. The escalation sink receives a context for every
//! verdict requiring human attention; delivery is at-least-once and
//! duplicates are de-duplicated downstream by `(query_id, bucket)`.
//!
//! Durable SQLite-backed implementations live in the app crate; the
//! in-memory sinks here back the test suites.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::GateError;
use crate::models::{AuditRecord, EscalationReason};

/// Width of the escalation idempotency bucket, in seconds. Duplicate
/// submissions for the same query within one bucket collapse to one row.
pub const ESCALATION_BUCKET_SECS: i64 = 60;

/// Context forwarded for human follow-up when a query escalates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationContext {
    pub query_id: Uuid,
    pub tenant_id: String,
    pub persona_id: String,
    pub reason: EscalationReason,
    pub query_text: String,
    pub created_at: DateTime<Utc>,
}

impl EscalationContext {
    /// Idempotency bucket: the creation timestamp truncated to
    /// [`ESCALATION_BUCKET_SECS`].
    pub fn bucket(&self) -> i64 {
        self.created_at.timestamp() / ESCALATION_BUCKET_SECS
    }
}

/// Append-only audit log.
///
/// `append` must not raise on transient failure in a way that blocks the
/// caller's response — the orchestrator queues failed records for retry.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn append(&self, record: &AuditRecord) -> Result<(), GateError>;
}

/// Durable queue of verdicts requiring human attention.
#[async_trait]
pub trait EscalationSink: Send + Sync {
    /// Enqueue for human follow-up. At-least-once: callers may retry,
    /// implementations de-duplicate by `(query_id, bucket)`.
    async fn submit(&self, context: &EscalationContext) -> Result<(), GateError>;
}

/// In-memory audit sink for tests and offline runs.
#[derive(Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().unwrap().clone()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn append(&self, record: &AuditRecord) -> Result<(), GateError> {
        self.records.lock().unwrap().push(record.clone());
        Ok(())
    }
}

/// In-memory escalation sink for tests and offline runs. Idempotent by
/// `(query_id, bucket)` like the durable implementation.
#[derive(Default)]
pub struct MemoryEscalationSink {
    submissions: Mutex<Vec<EscalationContext>>,
}

impl MemoryEscalationSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submissions(&self) -> Vec<EscalationContext> {
        self.submissions.lock().unwrap().clone()
    }
}

#[async_trait]
impl EscalationSink for MemoryEscalationSink {
    async fn submit(&self, context: &EscalationContext) -> Result<(), GateError> {
        let mut submissions = self.submissions.lock().unwrap();
        let duplicate = submissions
            .iter()
            .any(|s| s.query_id == context.query_id && s.bucket() == context.bucket());
        if !duplicate {
            submissions.push(context.clone());
        }
        Ok(())
    }
}
