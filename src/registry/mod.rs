//! In-memory index of tracked shows
//!
//! Queues and jobs consult this instead of the database for identity
//! checks. After a source switch the old key stays resolvable through a
//! remap table, so callers holding a stale key (watched-state feeds, queued
//! tasks from before the switch) still reach the right show.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::db::ShowRecord;
use crate::providers::SourceKey;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryEntry {
    pub show_id: i64,
    pub key: SourceKey,
    pub name: String,
    pub year: Option<i32>,
}

impl RegistryEntry {
    pub fn from_record(record: &ShowRecord) -> Self {
        Self {
            show_id: record.id,
            key: record.key(),
            name: record.name.clone(),
            year: record.year,
        }
    }
}

#[derive(Default)]
struct RegistryInner {
    shows: HashMap<SourceKey, RegistryEntry>,
    /// Old identity to new identity, recorded on each switch.
    remapped: HashMap<SourceKey, SourceKey>,
}

#[derive(Default)]
pub struct ShowRegistry {
    inner: RwLock<RegistryInner>,
}

impl ShowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the index with the given catalog rows.
    pub fn hydrate(&self, records: &[ShowRecord]) {
        let mut inner = self.inner.write();
        inner.shows.clear();
        inner.remapped.clear();
        for record in records {
            let entry = RegistryEntry::from_record(record);
            inner.shows.insert(entry.key, entry);
        }
    }

    pub fn insert(&self, entry: RegistryEntry) {
        self.inner.write().shows.insert(entry.key, entry);
    }

    pub fn remove(&self, key: SourceKey) -> Option<RegistryEntry> {
        let mut inner = self.inner.write();
        inner.remapped.retain(|_, target| *target != key);
        inner.shows.remove(&key)
    }

    /// Move a show from `old` to `new` and remember the remap, atomically.
    pub fn rekey(&self, old: SourceKey, new: SourceKey) -> bool {
        let mut inner = self.inner.write();
        let Some(mut entry) = inner.shows.remove(&old) else {
            return false;
        };
        entry.key = new;
        inner.shows.insert(new, entry);
        inner.remapped.insert(old, new);
        // Older remaps pointing at the moved key follow it.
        for target in inner.remapped.values_mut() {
            if *target == old {
                *target = new;
            }
        }
        true
    }

    /// Exact lookup, no remap following.
    pub fn get(&self, key: SourceKey) -> Option<RegistryEntry> {
        self.inner.read().shows.get(&key).cloned()
    }

    pub fn contains(&self, key: SourceKey) -> bool {
        self.inner.read().shows.contains_key(&key)
    }

    /// Lookup that follows remapped identities, so pre-switch keys still
    /// find their show.
    pub fn resolve(&self, key: SourceKey) -> Option<RegistryEntry> {
        let inner = self.inner.read();
        let mut current = key;
        let mut hops = 0;
        loop {
            if let Some(entry) = inner.shows.get(&current) {
                return Some(entry.clone());
            }
            match inner.remapped.get(&current) {
                Some(next) if hops < 8 => {
                    current = *next;
                    hops += 1;
                }
                _ => return None,
            }
        }
    }

    /// A different tracked show already holding `key`, if any.
    pub fn find_conflict(&self, key: SourceKey, excluding_show_id: i64) -> Option<RegistryEntry> {
        self.inner
            .read()
            .shows
            .get(&key)
            .filter(|entry| entry.show_id != excluding_show_id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().shows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().shows.is_empty()
    }

    pub fn snapshot(&self) -> Vec<RegistryEntry> {
        let mut entries: Vec<RegistryEntry> = self.inner.read().shows.values().cloned().collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries
    }
}
