//! Resource cache
//!
//! A dirty-tracking view of externally persisted objects, shared by all control
//! functions of one loop. Entries are keyed by their semantic role (deployment,
//! service, ...) rather than by name, since an object can be known to the cache
//! before the API server has assigned it one.
//!
//! Mutation goes exclusively through [`ResourceCacheEntry::apply_patch`], which
//! hands the closure an owned copy of the current value. The original value is
//! only replaced when the entry is (re)observed or flushed by the services layer.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;

/// Name of a cached object in the external store
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum EntryName {
    /// Known to the cache but not yet created externally
    #[default]
    NotCreated,
    /// Created (or observed) under this name
    Named(String),
}

impl EntryName {
    /// Name as observed, `None` while not created
    pub fn as_str(&self) -> Option<&str> {
        match self {
            EntryName::NotCreated => None,
            EntryName::Named(name) => Some(name),
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, EntryName::Named(_))
    }
}

impl fmt::Display for EntryName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryName::NotCreated => f.write_str("<not created>"),
            EntryName::Named(name) => f.write_str(name),
        }
    }
}

/// One external object under management
#[derive(Debug, Clone)]
pub struct ResourceCacheEntry<R> {
    name: EntryName,
    value: R,
    original: R,
    changed: bool,
}

impl<R: Clone> ResourceCacheEntry<R> {
    /// Entry for an object that still has to be created.
    ///
    /// It starts dirty so that the flush step picks it up.
    pub fn not_created(value: R) -> Self {
        Self {
            name: EntryName::NotCreated,
            original: value.clone(),
            value,
            changed: true,
        }
    }

    /// Entry for an object as last read from the external store
    pub fn observed(name: impl Into<String>, value: R) -> Self {
        Self {
            name: EntryName::Named(name.into()),
            original: value.clone(),
            value,
            changed: false,
        }
    }

    pub fn name(&self) -> &EntryName {
        &self.name
    }

    /// Current, possibly patched, value
    pub fn value(&self) -> &R {
        &self.value
    }

    /// Value as last synchronized with the external store
    pub fn original_value(&self) -> &R {
        &self.original
    }

    pub fn has_changed(&self) -> bool {
        self.changed
    }

    /// Transform the current value.
    ///
    /// The closure receives a copy and its result replaces the current value.
    /// The entry is marked changed unconditionally, so callers check whether a
    /// change is needed before patching.
    pub fn apply_patch<F>(&mut self, patch: F)
    where
        F: FnOnce(R) -> R,
    {
        self.value = patch(self.value.clone());
        self.changed = true;
    }

    /// Record that the external store now holds `value` under `name`
    pub fn mark_flushed(&mut self, name: impl Into<String>, value: R) {
        self.name = EntryName::Named(name.into());
        self.original = value.clone();
        self.value = value;
        self.changed = false;
    }

    /// Drop the dirty bit without touching the values (empty diff)
    pub fn reset_changed(&mut self) {
        self.changed = false;
    }
}

/// Mapping from cache key to at most one entry
#[derive(Debug, Clone)]
pub struct ResourceCache<K, R> {
    entries: HashMap<K, ResourceCacheEntry<R>>,
}

impl<K, R> Default for ResourceCache<K, R> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<K, R> ResourceCache<K, R>
where
    K: Copy + Eq + Hash,
    R: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &K) -> Option<&ResourceCacheEntry<R>> {
        self.entries.get(key)
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut ResourceCacheEntry<R>> {
        self.entries.get_mut(key)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// Unconditionally replace the entry under `key`
    pub fn set(&mut self, key: K, entry: ResourceCacheEntry<R>) {
        self.entries.insert(key, entry);
    }

    /// Evict the entry under `key`, returning it if present
    pub fn remove(&mut self, key: &K) -> Option<ResourceCacheEntry<R>> {
        self.entries.remove(key)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = K> + '_ {
        self.entries.keys().copied()
    }

    /// Keys of all entries that need to be written back
    pub fn changed_keys(&self) -> Vec<K> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.has_changed())
            .map(|(key, _)| *key)
            .collect()
    }
}
