//! Persona policy snapshots with hot reload.
//!
//! Policies load from the configuration file into an immutable
//! [`PolicySet`]. Readers take an `Arc` snapshot per query, so a reload
//! swaps the set atomically while in-flight queries keep evaluating
//! against the policies they started with.

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use anyhow::Result;

use knowledge_gate_core::policy::PolicySet;

use crate::config;

pub struct PolicyStore {
    config_path: PathBuf,
    current: RwLock<Arc<PolicySet>>,
}

impl PolicyStore {
    pub fn new(config_path: &Path, initial: PolicySet) -> Self {
        Self {
            config_path: config_path.to_path_buf(),
            current: RwLock::new(Arc::new(initial)),
        }
    }

    /// The snapshot a query should evaluate against, taken once at the
    /// start of handling.
    pub fn snapshot(&self) -> Arc<PolicySet> {
        self.current
            .read()
            .map(|guard| Arc::clone(&guard))
            .unwrap_or_else(|poisoned| Arc::clone(&poisoned.into_inner()))
    }

    /// Re-read persona tables from the config file and swap the snapshot.
    /// A file that fails validation leaves the current set untouched.
    pub fn reload(&self) -> Result<usize> {
        let config = config::load_config(&self.config_path)?;
        let policies = config.policy_set()?;
        let count = policies.len();

        let next = Arc::new(policies);
        match self.current.write() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }

        tracing::info!(personas = count, "persona policies reloaded");
        Ok(count)
    }
}
