//! The per-node replica: clock + LWW entries + per-entry tag OR-Sets.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::clock::Clock;
use crate::entry::{Entry, EntryId, EntryKind};
use crate::lww::{LwwElement, LwwSet};
use crate::orset::{hydration_token, OrSet, TagToken};

/// Errors from replica operations that require a live entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ReplicaError {
    /// The id was never observed.
    #[error("entry not found: {0}")]
    NotFound(EntryId),
    /// The id exists only as a tombstone.
    #[error("entry is tombstoned: {0}")]
    Tombstoned(EntryId),
}

/// Serializable snapshot of an OR-Set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagSetState {
    /// All observed `(tag, token)` adds.
    pub adds: Vec<TagToken>,
    /// All observed `(tag, token)` removes.
    pub removes: Vec<TagToken>,
}

impl TagSetState {
    fn from_or_set(set: &OrSet) -> Self {
        TagSetState {
            adds: set.adds().cloned().collect(),
            removes: set.removes().cloned().collect(),
        }
    }

    fn into_or_set(self) -> OrSet {
        let mut set = OrSet::new();
        for tt in &self.adds {
            set.add_with_token(&tt.tag, tt.token);
        }
        // A remove pair whose add was never shipped still has to stick, so
        // record the pair on both sides before tombstoning it.
        for tt in &self.removes {
            set.add_with_token(&tt.tag, tt.token);
            set.remove_token(tt.token);
        }
        set
    }
}

/// The full exportable state of a replica: every LWW element (tombstones
/// included), every tag token pair, and the clock. This is the sync payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaState {
    /// All elements, ordered by entry id.
    pub entries: Vec<LwwElement>,
    /// Tag token tables per entry id.
    pub tags: BTreeMap<EntryId, TagSetState>,
    /// The exporting replica's clock at export time.
    pub clock_time: u64,
}

/// The elements whose timestamp exceeds a threshold, with the tag tables of
/// just those entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaState {
    /// Elements with `timestamp > since`.
    pub entries: Vec<LwwElement>,
    /// Tag token tables for the entries above.
    pub tags: BTreeMap<EntryId, TagSetState>,
    /// The exporting replica's clock at export time.
    pub clock_time: u64,
    /// The threshold the delta was cut at.
    pub since: u64,
}

/// A replica's in-memory CRDT state and the merge driver over it.
///
/// The replica is the source of truth; the durable store is a projection
/// hydrated from it at boot. All operations are pure in-memory and never
/// suspend.
#[derive(Debug, Clone, Default)]
pub struct Replica {
    clock: Clock,
    entries: LwwSet,
    tags: BTreeMap<EntryId, OrSet>,
}

impl Replica {
    /// Creates an empty replica with a zeroed clock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty replica whose clock resumes at `time`. Used at boot
    /// with the durable store's max updated time, and for the throwaway
    /// replica a received state is loaded into.
    pub fn with_clock_time(time: u64) -> Self {
        Replica {
            clock: Clock::with_time(time),
            ..Default::default()
        }
    }

    /// Read access to the clock.
    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    /// Creates a new entry with a fresh id and returns it with its tag set
    /// materialized.
    pub fn add(&mut self, kind: EntryKind, payload: Vec<u8>, tags: &[String]) -> Entry {
        self.add_with_id(EntryId::generate(), kind, payload, tags)
    }

    /// Creates a new entry under an externally supplied id. The engine uses
    /// this to bind ciphertext to the id before the entry exists.
    pub fn add_with_id(
        &mut self,
        id: EntryId,
        kind: EntryKind,
        payload: Vec<u8>,
        tags: &[String],
    ) -> Entry {
        let t = self.clock.tick();
        let entry = Entry::with_id(id, kind, payload, Vec::new(), t);
        self.entries.add(entry);

        if !tags.is_empty() {
            let set = self.tags.entry(id).or_default();
            for tag in tags {
                set.add(tag);
            }
        }
        self.materialize(id).expect("entry was just added")
    }

    /// Updates the payload and/or tags of a live entry at a fresh timestamp
    /// and returns the updated entry.
    pub fn update(
        &mut self,
        id: EntryId,
        payload: Option<Vec<u8>>,
        tags: Option<&[String]>,
    ) -> Result<Entry, ReplicaError> {
        let current = self
            .entries
            .lookup_including_tombstones(id)
            .ok_or(ReplicaError::NotFound(id))?;
        if current.tombstone {
            return Err(ReplicaError::Tombstoned(id));
        }

        let t = self.clock.tick();
        let mut updated = current.entry.clone();
        if let Some(payload) = payload {
            updated.payload = payload;
        }
        updated.updated_time = t;
        self.entries.add(updated);

        if let Some(tags) = tags {
            self.tags.entry(id).or_default().replace(tags);
        }
        Ok(self.materialize(id).expect("entry is present"))
    }

    /// Tombstones an entry at a fresh timestamp and returns that timestamp.
    /// Removing an unknown id is idempotent: it records a tombstone under the
    /// supplied id.
    pub fn remove(&mut self, id: EntryId) -> u64 {
        let t = self.clock.tick();
        self.entries.remove(id, t);
        t
    }

    /// Returns a live entry with its current tag set.
    pub fn get(&self, id: EntryId) -> Result<Entry, ReplicaError> {
        match self.entries.lookup_including_tombstones(id) {
            None => Err(ReplicaError::NotFound(id)),
            Some(element) if element.tombstone => Err(ReplicaError::Tombstoned(id)),
            Some(_) => Ok(self.materialize(id).expect("entry is present")),
        }
    }

    /// Returns the stored element for `id`, tombstoned or not.
    pub fn get_including_tombstones(&self, id: EntryId) -> Option<LwwElement> {
        self.entries.lookup_including_tombstones(id).cloned()
    }

    /// All live entries with their tag sets.
    pub fn list(&self) -> Vec<Entry> {
        let ids: Vec<EntryId> = self.entries.elements().map(|entry| entry.id).collect();
        ids.into_iter()
            .map(|id| self.materialize(id).expect("entry is present"))
            .collect()
    }

    /// The tag set of `id` as currently visible, even for tombstoned
    /// entries.
    pub fn tags_of(&self, id: EntryId) -> Vec<String> {
        self.tags.get(&id).map(OrSet::elements).unwrap_or_default()
    }

    /// Loads an entry from the durable store into the CRDT at boot.
    ///
    /// Tags are re-added under deterministic, content-derived tokens so
    /// hydration is idempotent across restarts.
    pub fn hydrate(&mut self, mut entry: Entry) {
        let id = entry.id;
        let tags = std::mem::take(&mut entry.tags);
        self.entries.add(entry);
        if !tags.is_empty() {
            let set = self.tags.entry(id).or_default();
            for tag in &tags {
                set.add_with_token(tag, hydration_token(id, tag));
            }
        }
    }

    /// Exports the full state, tombstones and token tables included.
    pub fn state(&self) -> ReplicaState {
        ReplicaState {
            entries: self.entries.all_elements().cloned().collect(),
            tags: self
                .tags
                .iter()
                .map(|(id, set)| (*id, TagSetState::from_or_set(set)))
                .collect(),
            clock_time: self.clock.now(),
        }
    }

    /// Imports a state snapshot: elements are inserted through the LWW
    /// algebra, token tables are unioned. Does not touch the clock; use
    /// [`merge`](Replica::merge) to absorb another replica wholesale.
    pub fn load_state(&mut self, state: ReplicaState) {
        for element in state.entries {
            self.entries.insert_element(element);
        }
        for (id, tag_state) in state.tags {
            let set = tag_state.into_or_set();
            match self.tags.get_mut(&id) {
                Some(existing) => existing.merge(&set),
                None => {
                    self.tags.insert(id, set);
                }
            }
        }
    }

    /// Merges another replica into this one.
    ///
    /// The clock observes the other side's maximum timestamp *before* any
    /// state is merged, so every later local tick is strictly greater than
    /// everything just absorbed.
    pub fn merge(&mut self, other: &Replica) {
        self.clock.observe(other.max_timestamp());
        self.entries.merge(&other.entries);
        for (id, other_set) in &other.tags {
            match self.tags.get_mut(id) {
                Some(set) => set.merge(other_set),
                None => {
                    self.tags.insert(*id, other_set.clone());
                }
            }
        }
    }

    /// The highest timestamp across all elements, tombstones included.
    pub fn max_timestamp(&self) -> u64 {
        self.entries
            .all_elements()
            .map(|element| element.timestamp)
            .max()
            .unwrap_or(0)
    }

    /// Cuts a delta: every element with `timestamp > since` plus the tag
    /// tables of exactly those entries.
    pub fn delta_since(&self, since: u64) -> DeltaState {
        let entries: Vec<LwwElement> = self
            .entries
            .all_elements()
            .filter(|element| element.timestamp > since)
            .cloned()
            .collect();
        let tags = entries
            .iter()
            .filter_map(|element| {
                self.tags
                    .get(&element.entry.id)
                    .map(|set| (element.entry.id, TagSetState::from_or_set(set)))
            })
            .collect();
        DeltaState {
            entries,
            tags,
            clock_time: self.clock.now(),
            since,
        }
    }

    /// Applies a delta cut on another replica: elements go through the LWW
    /// algebra, token tables are unioned, and the clock observes the delta's
    /// clock.
    pub fn apply_delta(&mut self, delta: DeltaState) {
        self.clock.observe(delta.clock_time);
        for element in delta.entries {
            self.entries.insert_element(element);
        }
        for (id, tag_state) in delta.tags {
            let set = tag_state.into_or_set();
            match self.tags.get_mut(&id) {
                Some(existing) => existing.merge(&set),
                None => {
                    self.tags.insert(id, set);
                }
            }
        }
    }

    /// SHA-256 over the serialized state. Equal replicas produce equal
    /// hashes: the state is exported in id order from ordered containers.
    pub fn state_hash(&self) -> [u8; 32] {
        let bytes =
            postcard::to_stdvec(&self.state()).expect("replica state serialization is infallible");
        let digest = Sha256::digest(&bytes);
        digest.into()
    }

    /// Number of live entries.
    pub fn live_len(&self) -> usize {
        self.entries.live_len()
    }

    fn materialize(&self, id: EntryId) -> Option<Entry> {
        let element = self.entries.lookup_including_tombstones(id)?;
        let mut entry = element.entry.clone();
        entry.tags = self.tags_of(id);
        Some(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note(replica: &mut Replica, payload: &[u8], tags: &[&str]) -> Entry {
        let tags: Vec<String> = tags.iter().map(|t| t.to_string()).collect();
        replica.add(EntryKind::Note, payload.to_vec(), &tags)
    }

    #[test]
    fn add_assigns_fresh_time_and_materializes_tags() {
        let mut replica = Replica::new();
        let entry = note(&mut replica, b"hi", &["a", "b"]);
        assert_eq!(entry.created_time, 1);
        assert_eq!(entry.updated_time, 1);
        assert_eq!(entry.tags, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(replica.get(entry.id).unwrap(), entry);
    }

    #[test]
    fn update_requires_a_live_entry() {
        let mut replica = Replica::new();
        let missing = EntryId::generate();
        assert_eq!(
            replica.update(missing, None, None),
            Err(ReplicaError::NotFound(missing))
        );

        let entry = note(&mut replica, b"hi", &[]);
        replica.remove(entry.id);
        assert_eq!(
            replica.update(entry.id, Some(b"x".to_vec()), None),
            Err(ReplicaError::Tombstoned(entry.id))
        );
        assert_eq!(replica.get(entry.id), Err(ReplicaError::Tombstoned(entry.id)));
    }

    #[test]
    fn update_bumps_updated_time_only() {
        let mut replica = Replica::new();
        let entry = note(&mut replica, b"v1", &[]);
        let updated = replica
            .update(entry.id, Some(b"v2".to_vec()), None)
            .unwrap();
        assert_eq!(updated.created_time, entry.created_time);
        assert!(updated.updated_time > entry.updated_time);
        assert_eq!(updated.payload, b"v2");
    }

    #[test]
    fn remove_unknown_id_is_idempotent() {
        let mut replica = Replica::new();
        let id = EntryId::generate();
        let t = replica.remove(id);
        assert_eq!(replica.get(id), Err(ReplicaError::Tombstoned(id)));
        let element = replica.get_including_tombstones(id).unwrap();
        assert!(element.tombstone);
        assert_eq!(element.timestamp, t);
    }

    #[test]
    fn merge_observes_clock_before_state() {
        let mut a = Replica::new();
        let mut b = Replica::new();
        for i in 0..10 {
            note(&mut b, format!("{i}").as_bytes(), &[]);
        }
        assert_eq!(b.max_timestamp(), 10);

        a.merge(&b);
        assert!(a.clock.now() > b.max_timestamp());
        // Every local operation after a merge outranks everything absorbed.
        let entry = note(&mut a, b"later", &[]);
        assert!(entry.updated_time > b.max_timestamp());
    }

    #[test]
    fn state_round_trips() {
        let mut replica = Replica::new();
        let kept = note(&mut replica, b"kept", &["x", "y"]);
        let gone = note(&mut replica, b"gone", &[]);
        replica.remove(gone.id);

        let bytes = postcard::to_stdvec(&replica.state()).unwrap();
        let state: ReplicaState = postcard::from_bytes(&bytes).unwrap();

        let mut restored = Replica::with_clock_time(state.clock_time);
        restored.load_state(state);
        assert_eq!(restored.get(kept.id).unwrap(), kept);
        assert_eq!(
            restored.get(gone.id),
            Err(ReplicaError::Tombstoned(gone.id))
        );
        assert_eq!(restored.state_hash(), replica.state_hash());
    }

    #[test]
    fn hydration_matches_original_live_set() {
        let mut source = Replica::new();
        let first = note(&mut source, b"one", &["a"]);
        let second = note(&mut source, b"two", &["b", "c"]);
        let dropped = note(&mut source, b"three", &[]);
        source.remove(dropped.id);

        // Simulate a restart: only the projected entries survive.
        let mut restored = Replica::with_clock_time(source.max_timestamp());
        for entry in [first.clone(), second.clone()] {
            restored.hydrate(entry);
        }
        let mut dropped_projection = source.get_including_tombstones(dropped.id).unwrap().entry;
        dropped_projection.tags = Vec::new();
        restored.hydrate(dropped_projection);

        assert_eq!(restored.live_len(), source.live_len());
        assert_eq!(restored.get(first.id).unwrap(), first);
        assert_eq!(restored.get(second.id).unwrap(), second);

        // Hydrating twice changes nothing: tokens are deterministic.
        let before = restored.state();
        restored.hydrate(first.clone());
        assert_eq!(restored.state(), before);
    }

    #[test]
    fn delta_since_returns_exactly_the_newer_elements() {
        let mut a = Replica::new();
        for i in 0..100u64 {
            note(&mut a, format!("{i}").as_bytes(), &[]);
        }
        let delta = a.delta_since(50);
        assert_eq!(delta.entries.len(), 50);
        assert!(delta.entries.iter().all(|e| e.timestamp > 50));

        // B holds the same history through time 50.
        let mut b = Replica::with_clock_time(50);
        for element in a.state().entries {
            if element.timestamp <= 50 {
                b.load_state(ReplicaState {
                    entries: vec![element],
                    ..Default::default()
                });
            }
        }
        b.apply_delta(delta);
        assert_eq!(b.live_len(), a.live_len());
        assert!(b.clock().now() > a.max_timestamp());
    }

    #[test]
    fn concurrent_tag_edits_converge() {
        let mut a = Replica::new();
        let entry = note(&mut a, b"e", &["initial"]);
        let mut b = a.clone();

        a.update(
            entry.id,
            None,
            Some(&["initial".to_string(), "A".to_string()]),
        )
        .unwrap();
        b.update(
            entry.id,
            None,
            Some(&["initial".to_string(), "B".to_string()]),
        )
        .unwrap();

        a.merge(&b);
        b.merge(&a);

        let expect = vec!["A".to_string(), "B".to_string(), "initial".to_string()];
        assert_eq!(a.get(entry.id).unwrap().tags, expect);
        assert_eq!(b.get(entry.id).unwrap().tags, expect);
    }

    #[test]
    fn tombstone_dominates_concurrent_update() {
        let mut a = Replica::new();
        let entry = note(&mut a, b"e", &[]);
        let mut b = a.clone();

        a.update(entry.id, Some(b"from-a".to_vec()), None).unwrap();
        for _ in 0..94 {
            b.clock().tick();
        }
        b.remove(entry.id);
        assert!(b.max_timestamp() > a.max_timestamp());

        a.merge(&b);
        b.merge(&a);
        assert_eq!(a.get(entry.id), Err(ReplicaError::Tombstoned(entry.id)));
        assert_eq!(b.get(entry.id), Err(ReplicaError::Tombstoned(entry.id)));
    }
}
