//! Observed-Remove set for the tags of a single entry.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entry::EntryId;

/// One observed addition of a tag: the tag string plus the unique token
/// minted for that particular add.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TagToken {
    /// The tag string.
    pub tag: String,
    /// Unique identifier of this add operation.
    pub token: Uuid,
}

/// An OR-Set of tag strings.
///
/// Every `add` mints a fresh token; `remove` tombstones exactly the tokens it
/// has observed. A tag is present while at least one of its add tokens
/// survives. Merging unions both tables, which makes concurrent adds win over
/// removes that never saw them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrSet {
    adds: BTreeSet<TagToken>,
    removes: BTreeSet<TagToken>,
}

impl OrSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `tag` under a fresh token and returns the token.
    pub fn add(&mut self, tag: &str) -> Uuid {
        let token = Uuid::new_v4();
        self.add_with_token(tag, token);
        token
    }

    /// Adds `tag` under a specific token. Used by merges and hydration.
    pub fn add_with_token(&mut self, tag: &str, token: Uuid) {
        self.adds.insert(TagToken {
            tag: tag.to_owned(),
            token,
        });
    }

    /// Removes `tag` by tombstoning every token observed for it locally.
    /// Tokens minted concurrently elsewhere survive the next merge.
    pub fn remove(&mut self, tag: &str) {
        let observed: Vec<TagToken> = self
            .adds
            .iter()
            .filter(|tt| tt.tag == tag)
            .cloned()
            .collect();
        self.removes.extend(observed);
    }

    /// Tombstones a single token by value, whatever tag it carries. Used when
    /// applying deltas.
    pub fn remove_token(&mut self, token: Uuid) {
        let observed: Vec<TagToken> = self
            .adds
            .iter()
            .filter(|tt| tt.token == token)
            .cloned()
            .collect();
        self.removes.extend(observed);
    }

    /// True while at least one add of `tag` has not been removed.
    pub fn contains(&self, tag: &str) -> bool {
        self.adds
            .iter()
            .any(|tt| tt.tag == tag && !self.removes.contains(tt))
    }

    /// The tags currently present, sorted and deduplicated.
    pub fn elements(&self) -> Vec<String> {
        let mut tags: Vec<String> = self
            .adds
            .iter()
            .filter(|tt| !self.removes.contains(tt))
            .map(|tt| tt.tag.clone())
            .collect();
        tags.dedup();
        tags
    }

    /// Replaces the locally visible tag set with `target`.
    ///
    /// Tags present locally but absent from `target` are removed (killing
    /// only locally observed tokens); tags in `target` not present locally
    /// are added; tags in both keep their existing tokens. A concurrent add
    /// on another replica therefore survives this replace.
    pub fn replace(&mut self, target: &[String]) {
        let current = self.elements();
        for tag in &current {
            if !target.contains(tag) {
                self.remove(tag);
            }
        }
        for tag in target {
            if !current.contains(tag) {
                self.add(tag);
            }
        }
    }

    /// Merges `other` into `self`: adds and removes are both unioned.
    pub fn merge(&mut self, other: &OrSet) {
        self.adds.extend(other.adds.iter().cloned());
        self.removes.extend(other.removes.iter().cloned());
    }

    /// All add pairs, for state export.
    pub fn adds(&self) -> impl Iterator<Item = &TagToken> {
        self.adds.iter()
    }

    /// All remove pairs, for state export.
    pub fn removes(&self) -> impl Iterator<Item = &TagToken> {
        self.removes.iter()
    }

    /// True if the set has never observed an add.
    pub fn is_empty(&self) -> bool {
        self.adds.is_empty()
    }
}

/// Deterministic hydration token for a `(entry, tag)` pair.
///
/// Rehydrating from the durable store (which persists only the tag strings)
/// must re-inject the same tokens on every boot, otherwise each restart would
/// mint fresh adds and pile up tombstones. A v5 UUID namespaced by the entry
/// id gives the same token for the same pair everywhere.
pub fn hydration_token(id: EntryId, tag: &str) -> Uuid {
    Uuid::new_v5(id.as_uuid(), tag.as_bytes())
}
