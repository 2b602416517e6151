//! The entry model: the unit of replicated data.

use std::fmt::{self, Debug, Display};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identity of an entry, minted once at creation and immutable.
///
/// Ids are 128-bit random values; two replicas never mint the same id.
/// Ordering is plain byte order, which for the hyphenated lowercase rendering
/// coincides with string order.
#[derive(
    Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct EntryId(Uuid);

impl EntryId {
    /// Mints a fresh random id.
    pub fn generate() -> Self {
        EntryId(Uuid::new_v4())
    }

    /// Returns the raw 16 bytes of the id.
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// Reconstructs an id from its raw bytes.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        EntryId(Uuid::from_bytes(bytes))
    }

    pub(crate) fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Debug for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntryId({})", self.0)
    }
}

impl FromStr for EntryId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(EntryId(Uuid::parse_str(s)?))
    }
}

/// Error returned when parsing a string that is not one of the known entry
/// kinds.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid entry kind: {0:?}")]
pub struct InvalidKind(pub String);

/// The category of an entry. Closed set, immutable after creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntryKind {
    /// Free-form note.
    Note,
    /// Append-style log line.
    Log,
    /// Reference to content in the blob store.
    FileRef,
    /// Calendar-style event.
    Event,
}

impl EntryKind {
    /// The canonical string form, as used on the wire and in storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::Note => "note",
            EntryKind::Log => "log",
            EntryKind::FileRef => "file-ref",
            EntryKind::Event => "event",
        }
    }
}

impl Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryKind {
    type Err = InvalidKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "note" => Ok(EntryKind::Note),
            "log" => Ok(EntryKind::Log),
            "file-ref" => Ok(EntryKind::FileRef),
            "event" => Ok(EntryKind::Event),
            other => Err(InvalidKind(other.to_owned())),
        }
    }
}

/// A single replicated record.
///
/// The payload is opaque: the engine may store ciphertext here, and nothing
/// in the replica ever interprets it. Tags are materialized from the
/// per-entry OR-Set; the `tags` field on a stored or exported entry is a
/// snapshot of that set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// World-unique identity.
    pub id: EntryId,
    /// Category; immutable after creation.
    pub kind: EntryKind,
    /// Opaque bytes, possibly ciphertext.
    pub payload: Vec<u8>,
    /// Snapshot of the entry's tag set.
    pub tags: Vec<String>,
    /// Lamport time of creation.
    pub created_time: u64,
    /// Lamport time of the latest mutation. Always `>= created_time`.
    pub updated_time: u64,
    /// Deletion marker. Once set it never reverts, only its time advances.
    pub tombstone: bool,
}

impl Entry {
    /// Creates a live entry with a fresh id at logical time `t`.
    pub fn new(kind: EntryKind, payload: Vec<u8>, tags: Vec<String>, t: u64) -> Self {
        Self::with_id(EntryId::generate(), kind, payload, tags, t)
    }

    /// Creates a live entry with an externally supplied id at time `t`.
    pub fn with_id(
        id: EntryId,
        kind: EntryKind,
        payload: Vec<u8>,
        tags: Vec<String>,
        t: u64,
    ) -> Self {
        Entry {
            id,
            kind,
            payload,
            tags,
            created_time: t,
            updated_time: t,
            tombstone: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_round_trips_through_strings() {
        for kind in [
            EntryKind::Note,
            EntryKind::Log,
            EntryKind::FileRef,
            EntryKind::Event,
        ] {
            assert_eq!(kind.as_str().parse::<EntryKind>().unwrap(), kind);
        }
        assert_eq!(
            "journal".parse::<EntryKind>(),
            Err(InvalidKind("journal".into()))
        );
    }

    #[test]
    fn new_entries_are_live_with_equal_times() {
        let entry = Entry::new(EntryKind::Note, b"hi".to_vec(), vec!["a".into()], 7);
        assert_eq!(entry.created_time, 7);
        assert_eq!(entry.updated_time, 7);
        assert!(!entry.tombstone);
    }

    #[test]
    fn id_order_matches_string_order() {
        let mut ids: Vec<EntryId> = (0..32).map(|_| EntryId::generate()).collect();
        let mut by_string = ids.clone();
        ids.sort();
        by_string.sort_by_key(|id| id.to_string());
        assert_eq!(ids, by_string);
    }
}
