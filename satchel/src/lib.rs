//! Local-first, peer-to-peer synchronization for personal structured
//! records.
//!
//! A satchel node owns a full replica of a logical collection of
//! [entries](Entry). Replicas converge without a coordinator after arbitrary
//! offline periods and out-of-order deliveries: entries merge through a
//! Last-Writer-Wins set, tags through per-entry Observed-Remove sets, and
//! logical time is Lamport (see [`satchel_sync`]).
//!
//! This crate is the composition layer. An [`Engine`] binds a replica to a
//! durable projection ([`satchel_store`]), optional per-entry content
//! encryption bound to entry identity ([`crypto`]), a content-addressed blob
//! store ([`satchel_blobs`]), and a bounded [event bus](events). Hosts (a
//! CLI, an HTTP façade, a discovery layer) stay outside: they construct the
//! engine with a [`Config`], drive it through its operations, and wire its
//! [`StateProvider`] into a [`satchel_sync::SyncService`] for pairwise sync.
//!
//! ```no_run
//! use satchel::{Config, Engine, EntryKind};
//!
//! let engine = Engine::open(Config::persistent("/tmp/satchel-data"))?;
//! let entry = engine.add(
//!     EntryKind::Note,
//!     b"remember the milk".to_vec(),
//!     vec!["groceries".into()],
//! )?;
//! assert_eq!(engine.get(entry.id)?.payload, b"remember the milk");
//! # Ok::<(), satchel::Error>(())
//! ```

pub mod crypto;
mod engine;
pub mod events;

pub use self::crypto::{ContentKey, CryptoError, KeyStore, KeyStoreError};
pub use self::engine::{Config, Engine, Error};
pub use self::events::{Event, EventKind, Subscription};

pub use satchel_blobs::{BlobError, BlobStore, Cid};
pub use satchel_store::{BatchOp, EntryStore, ListFilter, StoreError};
pub use satchel_sync::{
    Entry, EntryId, EntryKind, InvalidKind, Replica, ReplicaState, StateProvider, SyncOutcome,
};
