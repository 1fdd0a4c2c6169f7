//! Error taxonomy for the retrieval-and-validation pipeline.
//!
//! Conflicting sources are deliberately *not* represented here: a conflict
//! is a business-level escalation carried in the [`Verdict`]'s reasons,
//! not an error. Everything in [`GateError`] is an infrastructure or
//! integrity failure with a defined recovery policy:
//!
//! | Variant | Recovery |
//! |---------|----------|
//! | `ProviderUnavailable` | Transparent fallback to the local provider; logged, never user-visible |
//! | `ProviderMismatch` | Programming/configuration defect; the store refuses the comparison |
//! | `IsolationViolation` | Fatal to the request; escalated and alerted as an integrity fault |
//! | `RetrievalTimeout` | Request escalates with reason `retrieval_timeout` |
//! | `AuditSinkUnavailable` | Record is queued for background retry; never blocks the response |
//! | `UnknownPersona` | Rejected at the API boundary before retrieval starts |
//!
//! [`Verdict`]: crate::models::Verdict

use std::time::Duration;

use thiserror::Error;

/// Errors produced by the retrieval pipeline and its backends.
#[derive(Debug, Error)]
pub enum GateError {
    /// The remote embedding provider could not serve the call.
    ///
    /// Triggers the automatic local fallback; the caller should never
    /// surface this to the user.
    #[error("embedding provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// A similarity comparison was attempted across vector spaces.
    ///
    /// Vectors are tagged with the provider that produced them; querying
    /// a store with a vector from a different provider is refused rather
    /// than silently returning garbage similarities.
    #[error("vector space mismatch: query embedded by '{query_provider}', stored vectors use '{stored_provider}'")]
    ProviderMismatch {
        query_provider: String,
        stored_provider: String,
    },

    /// A candidate escaped the store's tenant/category filter.
    ///
    /// This is an internal integrity fault — it means the filter layer is
    /// defective — and must be alerted distinctly from an ordinary
    /// escalation.
    #[error("isolation violation: chunk {chunk_id} (tenant {chunk_tenant}) reached validation for tenant {query_tenant}")]
    IsolationViolation {
        chunk_id: String,
        chunk_tenant: String,
        query_tenant: String,
    },

    /// The retrieval call exceeded its request-level deadline.
    #[error("retrieval timed out after {0:?}")]
    RetrievalTimeout(Duration),

    /// The audit sink rejected an append.
    ///
    /// Transient by contract; the record is retried asynchronously and
    /// the verdict is returned to the caller regardless.
    #[error("audit sink unavailable: {0}")]
    AuditSinkUnavailable(String),

    /// No policy is configured for the requested persona.
    #[error("unknown persona: {0}")]
    UnknownPersona(String),
}
