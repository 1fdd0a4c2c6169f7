//! Persona access policy.
//!
//! Persona-specific behavior — which categories are visible, which
//! confidence thresholds apply, whether retrieval is bypassed entirely —
//! is modeled as data, not as per-persona code paths. A single
//! orchestrator reads the active [`PersonaPolicy`] record; there is no
//! conditional dispatch scattered per persona.
//!
//! Policies are loaded at startup and may be hot-reloaded; readers always
//! see an atomically swapped, internally consistent snapshot. A query
//! holds one snapshot for its entire lifetime.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use anyhow::{bail, Result};
use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::models::Category;

/// Default freshness window for medical documents: 24 hours.
pub const DEFAULT_MEDICAL_MAX_AGE_SECS: u64 = 24 * 3600;
/// Default freshness window for protocol documents: one year.
pub const DEFAULT_PROTOCOL_MAX_AGE_SECS: u64 = 365 * 24 * 3600;

/// Built-in freshness window for a category, applied when the policy does
/// not override it. Biography and conversational content does not go
/// stale.
pub fn default_max_age_secs(category: Category) -> Option<u64> {
    match category {
        Category::Medical => Some(DEFAULT_MEDICAL_MAX_AGE_SECS),
        Category::Protocol => Some(DEFAULT_PROTOCOL_MAX_AGE_SECS),
        Category::Biography | Category::Conversational => None,
    }
}

/// Access policy for one persona.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonaPolicy {
    pub persona_id: String,
    /// Document categories this persona may retrieve.
    pub allowed_categories: BTreeSet<Category>,
    /// Minimum confidence to answer without a disclaimer.
    pub confidence_threshold: f32,
    /// Below the threshold but at or above this floor, the answer carries
    /// a disclaimer; below the floor, the query escalates.
    pub disclaimer_floor: f32,
    /// Per-category freshness overrides, in seconds. Categories absent
    /// here use [`default_max_age_secs`].
    #[serde(default)]
    pub max_age_secs: BTreeMap<Category, u64>,
    /// Emergency-class personas bypass retrieval entirely and return a
    /// fixed escalation verdict.
    #[serde(default)]
    pub emergency: bool,
}

impl PersonaPolicy {
    /// Freshness window for a category under this policy, or `None` when
    /// the category does not go stale.
    pub fn max_age_for(&self, category: Category) -> Option<Duration> {
        self.max_age_secs
            .get(&category)
            .copied()
            .or_else(|| default_max_age_secs(category))
            .map(|secs| Duration::seconds(secs as i64))
    }

    pub fn allows(&self, category: Category) -> bool {
        self.allowed_categories.contains(&category)
    }

    /// The strictest (smallest) freshness window among this persona's
    /// allowed categories. Retrieval-result cache entries must not
    /// outlive this, or a cache hit could serve a result that a fresh
    /// freshness check would have rejected.
    pub fn strictest_max_age(&self) -> Option<Duration> {
        self.allowed_categories
            .iter()
            .filter_map(|cat| self.max_age_for(*cat))
            .min()
    }

    /// Validate threshold ordering and ranges.
    pub fn validate(&self) -> Result<()> {
        if self.persona_id.is_empty() {
            bail!("persona_id must not be empty");
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            bail!(
                "persona '{}': confidence_threshold must be in [0.0, 1.0]",
                self.persona_id
            );
        }
        if !(0.0..=1.0).contains(&self.disclaimer_floor) {
            bail!(
                "persona '{}': disclaimer_floor must be in [0.0, 1.0]",
                self.persona_id
            );
        }
        if self.disclaimer_floor > self.confidence_threshold {
            bail!(
                "persona '{}': disclaimer_floor ({}) must not exceed confidence_threshold ({})",
                self.persona_id,
                self.disclaimer_floor,
                self.confidence_threshold
            );
        }
        if !self.emergency && self.allowed_categories.is_empty() {
            bail!(
                "persona '{}': allowed_categories must not be empty for a non-emergency persona",
                self.persona_id
            );
        }
        Ok(())
    }
}

/// An immutable set of persona policies — one consistent snapshot.
///
/// Hot reload builds a new `PolicySet` and swaps the `Arc`; in-flight
/// queries keep reading the snapshot they started with.
#[derive(Debug, Default)]
pub struct PolicySet {
    policies: HashMap<String, Arc<PersonaPolicy>>,
}

impl PolicySet {
    /// Build a snapshot, validating every policy.
    pub fn new(policies: Vec<PersonaPolicy>) -> Result<Self> {
        let mut map = HashMap::with_capacity(policies.len());
        for policy in policies {
            policy.validate()?;
            if map
                .insert(policy.persona_id.clone(), Arc::new(policy))
                .is_some()
            {
                bail!("duplicate persona policy");
            }
        }
        Ok(Self { policies: map })
    }

    pub fn get(&self, persona_id: &str) -> Option<Arc<PersonaPolicy>> {
        self.policies.get(persona_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    pub fn persona_ids(&self) -> impl Iterator<Item = &str> {
        self.policies.keys().map(|s| s.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caregiver() -> PersonaPolicy {
        PersonaPolicy {
            persona_id: "caregiver".to_string(),
            allowed_categories: [Category::Medical, Category::Protocol, Category::Biography]
                .into_iter()
                .collect(),
            confidence_threshold: 0.75,
            disclaimer_floor: 0.6,
            max_age_secs: BTreeMap::new(),
            emergency: false,
        }
    }

    #[test]
    fn test_default_max_ages() {
        let p = caregiver();
        assert_eq!(
            p.max_age_for(Category::Medical),
            Some(Duration::hours(24))
        );
        assert_eq!(
            p.max_age_for(Category::Protocol),
            Some(Duration::days(365))
        );
        assert_eq!(p.max_age_for(Category::Biography), None);
    }

    #[test]
    fn test_override_wins_over_default() {
        let mut p = caregiver();
        p.max_age_secs.insert(Category::Medical, 3600);
        assert_eq!(p.max_age_for(Category::Medical), Some(Duration::hours(1)));
    }

    #[test]
    fn test_strictest_max_age_is_medical_window() {
        let p = caregiver();
        assert_eq!(p.strictest_max_age(), Some(Duration::hours(24)));
    }

    #[test]
    fn test_strictest_max_age_unbounded_persona() {
        let mut p = caregiver();
        p.allowed_categories = [Category::Biography].into_iter().collect();
        assert_eq!(p.strictest_max_age(), None);
    }

    #[test]
    fn test_validate_rejects_floor_above_threshold() {
        let mut p = caregiver();
        p.disclaimer_floor = 0.9;
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_categories() {
        let mut p = caregiver();
        p.allowed_categories.clear();
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_emergency_persona_may_have_no_categories() {
        let mut p = caregiver();
        p.allowed_categories.clear();
        p.emergency = true;
        assert!(p.validate().is_ok());
    }

    #[test]
    fn test_policy_set_rejects_duplicates() {
        let result = PolicySet::new(vec![caregiver(), caregiver()]);
        assert!(result.is_err());
    }

    #[test]
    fn test_policy_set_lookup() {
        let set = PolicySet::new(vec![caregiver()]).unwrap();
        assert!(set.get("caregiver").is_some());
        assert!(set.get("missing").is_none());
    }
}
