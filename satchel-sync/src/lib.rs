//! Conflict-free replicated state for collections of entries, plus the
//! pairwise protocol that keeps replicas convergent.
//!
//! The crate operates on [Replicas](Replica). A replica holds an
//! LWW-Element-Set of [entries](Entry), one [Observed-Remove set](OrSet) of
//! tags per entry, and a [Lamport clock](Clock). Merging two replicas is
//! commutative, associative, and idempotent: replicas that have seen the same
//! set of states are equal, regardless of delivery order.
//!
//! Synchronization is state-based. Two peers first exchange a SHA-256
//! fingerprint of their serialized state; only when the fingerprints differ
//! does either side transfer the full (or delta) state, which the receiver
//! merges. See [`net`] for the framed wire protocol and [`service`] for the
//! session-deduplicating driver that runs it against a peer table.

pub mod clock;
pub mod entry;
pub mod lww;
pub mod net;
pub mod orset;
pub mod replica;
pub mod service;

pub use self::clock::Clock;
pub use self::entry::{Entry, EntryId, EntryKind, InvalidKind};
pub use self::lww::{LwwElement, LwwSet};
pub use self::net::{SessionId, StateProvider, SyncOutcome};
pub use self::orset::{OrSet, TagToken};
pub use self::replica::{DeltaState, Replica, ReplicaError, ReplicaState, TagSetState};
pub use self::service::{
    Allowlist, Connector, MetricsSnapshot, PeerId, SyncConfig, SyncMetrics, SyncService,
};
