//! Environment cache
//!
//! Collects container environment variables from three layers (what the live
//! Deployment already carries, what the user declared in the spec, and what the
//! operator computes) and linearizes them into one deterministic list.
//!
//! Conflicts are resolved by [`EnvPriority`]: a write only replaces an existing
//! variable if its priority is at least as high. Variables may declare
//! dependencies on other variables so that `$(VAR)` interpolation sees the
//! producer before the consumer.
//!
//! Deletions are staged as tombstones and only purged when the current period
//! ends, see [`EnvCache::process_and_advance_to_next_period`].

use crate::error::{OperatorError, Result};
use indexmap::IndexMap;
use k8s_openapi::api::core::v1::EnvVar;
use std::collections::HashSet;
use tracing::info;

/// Override rank of an environment variable source.
///
/// Ordered from lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EnvPriority {
    /// Observed on the live Deployment
    Deployment,
    /// Declared in the ApicurioRegistry spec
    Spec,
    /// Computed by the operator
    Operator,
}

impl EnvPriority {
    /// All tiers, lowest first
    pub const ALL: [EnvPriority; 3] = [
        EnvPriority::Deployment,
        EnvPriority::Spec,
        EnvPriority::Operator,
    ];
}

/// One environment variable candidate
#[derive(Debug, Clone, PartialEq)]
pub struct EnvCacheEntry {
    value: EnvVar,
    dependencies: Vec<String>,
    priority: EnvPriority,
}

impl EnvCacheEntry {
    /// Start building an entry from a full variable (literal or `valueFrom`)
    pub fn builder(value: EnvVar) -> EnvCacheEntryBuilder {
        EnvCacheEntryBuilder {
            value,
            dependencies: Vec::new(),
            priority: EnvPriority::Operator,
        }
    }

    /// Start building an entry with a literal value
    pub fn simple(name: impl Into<String>, value: impl Into<String>) -> EnvCacheEntryBuilder {
        Self::builder(EnvVar {
            name: name.into(),
            value: Some(value.into()),
            ..Default::default()
        })
    }

    pub fn name(&self) -> &str {
        &self.value.name
    }

    pub fn value(&self) -> &EnvVar {
        &self.value
    }

    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    pub fn priority(&self) -> EnvPriority {
        self.priority
    }
}

/// Builder for [`EnvCacheEntry`]
#[derive(Debug, Clone)]
pub struct EnvCacheEntryBuilder {
    value: EnvVar,
    dependencies: Vec<String>,
    priority: EnvPriority,
}

impl EnvCacheEntryBuilder {
    /// Require `name` to be emitted before this entry
    pub fn depends_on(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        if !self.dependencies.contains(&name) {
            self.dependencies.push(name);
        }
        self
    }

    /// Chain onto the previous variable of an ordered list, if any
    pub fn after(self, previous: Option<&str>) -> Self {
        match previous {
            Some(name) => self.depends_on(name),
            None => self,
        }
    }

    pub fn priority(mut self, priority: EnvPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn build(self) -> Result<EnvCacheEntry> {
        if self.value.name.trim().is_empty() {
            return Err(OperatorError::InvalidEnvName(self.value.name));
        }
        if let Some(dep) = self.dependencies.iter().find(|d| d.trim().is_empty()) {
            return Err(OperatorError::InvalidEnvName(dep.clone()));
        }
        Ok(EnvCacheEntry {
            value: self.value,
            dependencies: self.dependencies,
            priority: self.priority,
        })
    }
}

/// Priority and dependency aware store of environment variables
#[derive(Debug, Clone, Default)]
pub struct EnvCache {
    entries: IndexMap<String, EnvCacheEntry>,
    deleted: HashSet<String>,
    changed: bool,
}

impl EnvCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live (not tombstoned) entry for `name`
    pub fn get(&self, name: &str) -> Option<&EnvCacheEntry> {
        if self.was_deleted(name) {
            return None;
        }
        self.entries.get(name)
    }

    /// Whether [`set`](Self::set) would modify the cache
    pub fn would_change(&self, entry: &EnvCacheEntry) -> bool {
        match self.get(entry.name()) {
            None => true,
            Some(existing) => existing != entry && entry.priority >= existing.priority,
        }
    }

    /// Insert or override an entry.
    ///
    /// Writes with a lower priority than the stored entry are dropped. Setting a
    /// tombstoned name revives it. Returns whether the cache was modified.
    pub fn set(&mut self, entry: EnvCacheEntry) -> bool {
        if !self.would_change(&entry) {
            return false;
        }
        let name = entry.name().to_string();
        self.deleted.remove(&name);
        self.entries.insert(name, entry);
        self.changed = true;
        true
    }

    /// Stage `name` for removal at the end of the period; returns whether the
    /// name is known, including names already staged
    pub fn delete_by_name(&mut self, name: &str) -> bool {
        if !self.entries.contains_key(name) {
            return false;
        }
        if self.deleted.insert(name.to_string()) {
            self.changed = true;
        }
        true
    }

    pub fn was_deleted(&self, name: &str) -> bool {
        self.deleted.contains(name)
    }

    pub fn is_changed(&self) -> bool {
        self.changed
    }

    /// Purge tombstoned entries and clear the changed flag
    pub fn process_and_advance_to_next_period(&mut self) {
        for name in self.deleted.drain() {
            self.entries.shift_remove(&name);
        }
        self.changed = false;
    }

    /// Live entries in insertion order
    pub fn entries(&self) -> impl Iterator<Item = &EnvCacheEntry> + '_ {
        self.entries
            .values()
            .filter(move |entry| !self.deleted.contains(entry.name()))
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.deleted.clear();
        self.changed = true;
    }

    /// Linearize the live entries.
    ///
    /// Tiers are emitted lowest priority first; inside a tier entries follow
    /// insertion order, each preceded by its (transitive) dependencies.
    ///
    /// # Panics
    ///
    /// Panics when the dependency graph contains a cycle.
    pub fn get_sorted(&self) -> Vec<EnvVar> {
        let mut processed = HashSet::with_capacity(self.entries.len());
        let mut sorted = Vec::with_capacity(self.entries.len());
        for priority in EnvPriority::ALL {
            for entry in self.entries.values().filter(|e| e.priority == priority) {
                self.emit_with_dependencies(0, entry, &mut processed, &mut sorted);
            }
        }
        sorted
    }

    fn emit_with_dependencies<'a>(
        &'a self,
        depth: usize,
        entry: &'a EnvCacheEntry,
        processed: &mut HashSet<&'a str>,
        sorted: &mut Vec<EnvVar>,
    ) {
        if depth > self.entries.len() {
            panic!(
                "Cycle detected during the processing of environment variables, at entry {:?}",
                entry.name()
            );
        }
        if processed.contains(entry.name()) || self.was_deleted(entry.name()) {
            return;
        }
        for dependency in &entry.dependencies {
            match self.get(dependency) {
                Some(dep) => self.emit_with_dependencies(depth + 1, dep, processed, sorted),
                None => info!(
                    entry = entry.name(),
                    dependency = dependency.as_str(),
                    "Dependency for an environment variable not found"
                ),
            }
        }
        processed.insert(entry.name());
        sorted.push(entry.value.clone());
    }
}
