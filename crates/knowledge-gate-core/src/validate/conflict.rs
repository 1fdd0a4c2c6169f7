//! Conflict detection over structured chunk metadata.
//!
//! Two chunks describe the "same fact" when their structured metadata
//! agree on every key field (e.g. `fact` + `resident_id`) and a conflict
//! exists when they then disagree on the value field. Retrieval
//! similarity is never consulted: using it to decide whether two chunks
//! talk about the same thing would be circular.
//!
//! The strategy sits behind the [`ConflictDetector`] trait so deployments
//! can substitute their own notion of fact identity.

use std::collections::BTreeMap;

use crate::models::Candidate;

/// A detected disagreement between surviving candidates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictFinding {
    /// The composite fact key the sources disagree about.
    pub fact_key: String,
    /// The distinct values asserted for that key, sorted.
    pub values: Vec<String>,
}

/// Pluggable strategy for deciding whether candidates conflict.
pub trait ConflictDetector: Send + Sync {
    /// Inspect the surviving candidates and report the first conflict
    /// found, if any.
    fn detect(&self, candidates: &[Candidate]) -> Option<ConflictFinding>;
}

/// Default detector: groups candidates by the configured key fields and
/// flags any group asserting two or more distinct values.
///
/// Chunks missing any key field carry no structured fact and are
/// ignored — free-text disagreement is not this stage's problem.
pub struct MetadataConflictDetector {
    key_fields: Vec<String>,
    value_field: String,
}

impl MetadataConflictDetector {
    pub fn new(key_fields: Vec<String>, value_field: impl Into<String>) -> Self {
        Self {
            key_fields,
            value_field: value_field.into(),
        }
    }
}

impl Default for MetadataConflictDetector {
    fn default() -> Self {
        Self::new(
            vec!["fact".to_string(), "resident_id".to_string()],
            "value",
        )
    }
}

impl ConflictDetector for MetadataConflictDetector {
    fn detect(&self, candidates: &[Candidate]) -> Option<ConflictFinding> {
        // fact key -> distinct asserted values
        let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();

        for candidate in candidates {
            let meta = match candidate.chunk.metadata.as_object() {
                Some(meta) => meta,
                None => continue,
            };

            let mut key_parts = Vec::with_capacity(self.key_fields.len());
            for field in &self.key_fields {
                match meta.get(field).and_then(|v| v.as_str()) {
                    Some(part) => key_parts.push(part),
                    None => {
                        key_parts.clear();
                        break;
                    }
                }
            }
            if key_parts.is_empty() {
                continue;
            }
            let value = match meta.get(&self.value_field).and_then(|v| v.as_str()) {
                Some(v) => v.to_string(),
                None => continue,
            };

            let key = key_parts.join("|");
            let values = groups.entry(key).or_default();
            if !values.contains(&value) {
                values.push(value);
            }
        }

        groups
            .into_iter()
            .find(|(_, values)| values.len() >= 2)
            .map(|(fact_key, mut values)| {
                values.sort();
                ConflictFinding { fact_key, values }
            })
    }
}
