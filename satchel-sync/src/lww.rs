//! Last-Writer-Wins Element Set over entries.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::entry::{Entry, EntryId, EntryKind};

/// An entry paired with the metadata the merge algebra compares on.
///
/// `timestamp` always equals `entry.updated_time` and `tombstone` always
/// equals `entry.tombstone`; the pair is kept explicit because it is the unit
/// exchanged in merges.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LwwElement {
    /// The entry itself. For synthetic tombstones this is a placeholder
    /// carrying only the id and times.
    pub entry: Entry,
    /// Logical time used for conflict resolution.
    pub timestamp: u64,
    /// Deletion marker.
    pub tombstone: bool,
}

impl LwwElement {
    fn from_entry(entry: Entry) -> Self {
        LwwElement {
            timestamp: entry.updated_time,
            tombstone: entry.tombstone,
            entry,
        }
    }

    /// A tombstone for an id that was never observed live.
    fn synthetic_tombstone(id: EntryId, timestamp: u64) -> Self {
        let mut entry = Entry::with_id(id, EntryKind::Note, Vec::new(), Vec::new(), timestamp);
        entry.tombstone = true;
        LwwElement {
            entry,
            timestamp,
            tombstone: true,
        }
    }
}

/// Decides whether `candidate` replaces `current` for the same id.
///
/// Rules, in order: higher timestamp wins; at equal timestamp a tombstone
/// wins over a live element; at equal timestamp and equal tombstone state the
/// higher id (byte order) wins.
fn supersedes(candidate: &LwwElement, current: &LwwElement) -> bool {
    if candidate.timestamp != current.timestamp {
        return candidate.timestamp > current.timestamp;
    }
    if candidate.tombstone != current.tombstone {
        return candidate.tombstone;
    }
    candidate.entry.id > current.entry.id
}

/// A Last-Writer-Wins set keyed by entry id.
///
/// Deleted entries are kept as tombstones so that merges cannot resurrect
/// them. Merge is commutative, associative, and idempotent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LwwSet {
    elements: BTreeMap<EntryId, LwwElement>,
}

impl LwwSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or updates an entry. No-op if the stored element supersedes it.
    pub fn add(&mut self, entry: Entry) {
        self.insert_element(LwwElement::from_entry(entry));
    }

    /// Inserts an element if it supersedes the stored one. This is the
    /// primitive `merge`, state loading, and delta application all go
    /// through.
    pub fn insert_element(&mut self, element: LwwElement) {
        match self.elements.get(&element.entry.id) {
            Some(current) if !supersedes(&element, current) => {}
            _ => {
                self.elements.insert(element.entry.id, element);
            }
        }
    }

    /// Tombstones `id` at time `timestamp`.
    ///
    /// Unknown ids get a synthetic tombstone, so a later `add` with a lower
    /// timestamp stays suppressed. At equal timestamp the tombstone wins over
    /// a live element.
    pub fn remove(&mut self, id: EntryId, timestamp: u64) {
        match self.elements.get_mut(&id) {
            None => {
                self.elements
                    .insert(id, LwwElement::synthetic_tombstone(id, timestamp));
            }
            Some(current) => {
                if timestamp > current.timestamp
                    || (timestamp == current.timestamp && !current.tombstone)
                {
                    current.timestamp = timestamp;
                    current.tombstone = true;
                    current.entry.updated_time = timestamp;
                    current.entry.tombstone = true;
                }
            }
        }
    }

    /// Returns the entry for `id` if present and live.
    pub fn lookup(&self, id: EntryId) -> Option<&Entry> {
        self.elements
            .get(&id)
            .filter(|element| !element.tombstone)
            .map(|element| &element.entry)
    }

    /// Returns the element for `id` even if tombstoned.
    pub fn lookup_including_tombstones(&self, id: EntryId) -> Option<&LwwElement> {
        self.elements.get(&id)
    }

    /// Iterates over all live entries.
    pub fn elements(&self) -> impl Iterator<Item = &Entry> {
        self.elements
            .values()
            .filter(|element| !element.tombstone)
            .map(|element| &element.entry)
    }

    /// Iterates over every element, tombstones included.
    pub fn all_elements(&self) -> impl Iterator<Item = &LwwElement> {
        self.elements.values()
    }

    /// Merges `other` into `self`: per id, the superseding element wins.
    pub fn merge(&mut self, other: &LwwSet) {
        for element in other.elements.values() {
            self.insert_element(element.clone());
        }
    }

    /// Total number of elements, tombstones included.
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    /// Number of live elements.
    pub fn live_len(&self) -> usize {
        self.elements.values().filter(|e| !e.tombstone).count()
    }

    /// True if no element was ever recorded.
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }
}
