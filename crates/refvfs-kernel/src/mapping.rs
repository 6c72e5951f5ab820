//! The expanded, flat path → entry table.

use indexmap::IndexMap;
use serde_json::{Map, Value};
use std::collections::HashMap;

use crate::entry::ReferenceEntry;

/// Strip leading/trailing separators so `/a/b/`, `a/b` and `a/b/` agree.
pub fn normalize_key(path: &str) -> &str {
    path.trim_matches('/')
}

/// Flat mapping of logical path to [`ReferenceEntry`].
///
/// Insertion order is preserved so a serialized document lists entries
/// in the order they were loaded.
#[derive(Debug, Clone, Default)]
pub struct ReferenceMapping {
    entries: IndexMap<String, ReferenceEntry>,
    /// Paths whose locator still holds a placeholder after expansion.
    unresolved: HashMap<String, String>,
}

impl ReferenceMapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, path: &str) -> Option<&ReferenceEntry> {
        self.entries.get(normalize_key(path))
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(normalize_key(path))
    }

    /// Insert or replace an entry. Later writes win.
    pub fn insert(&mut self, path: impl AsRef<str>, entry: ReferenceEntry) {
        let key = normalize_key(path.as_ref()).to_string();
        self.unresolved.remove(&key);
        self.entries.insert(key, entry);
    }

    /// Insert an entry whose locator kept an unexpanded `placeholder`.
    pub fn insert_unresolved(
        &mut self,
        path: impl AsRef<str>,
        entry: ReferenceEntry,
        placeholder: impl Into<String>,
    ) {
        let key = normalize_key(path.as_ref()).to_string();
        self.unresolved.insert(key.clone(), placeholder.into());
        self.entries.insert(key, entry);
    }

    /// Remove an entry, keeping the order of the rest.
    pub fn remove(&mut self, path: &str) -> Option<ReferenceEntry> {
        let key = normalize_key(path);
        self.unresolved.remove(key);
        self.entries.shift_remove(key)
    }

    /// The leftover placeholder for `path`, if its expansion was incomplete.
    pub fn unresolved(&self, path: &str) -> Option<&str> {
        self.unresolved.get(normalize_key(path)).map(String::as_str)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ReferenceEntry)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Flat legacy-form object.
    pub fn to_refs_json(&self) -> Value {
        let refs: Map<String, Value> = self
            .entries
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect();
        Value::Object(refs)
    }

    /// Versioned document with no templates or generators.
    pub fn to_document(&self) -> Value {
        let mut doc = Map::new();
        doc.insert("version".into(), Value::from(1));
        doc.insert("refs".into(), self.to_refs_json());
        Value::Object(doc)
    }
}

impl FromIterator<(String, ReferenceEntry)> for ReferenceMapping {
    fn from_iter<T: IntoIterator<Item = (String, ReferenceEntry)>>(iter: T) -> Self {
        let mut mapping = Self::new();
        for (path, entry) in iter {
            mapping.insert(path, entry);
        }
        mapping
    }
}
