//! The engine façade: one replica, one durable store, optional content
//! encryption, and an event bus, composed behind the operations hosts call.

use std::path::PathBuf;

use parking_lot::RwLock;
use tracing::debug;

use satchel_blobs::{BlobError, BlobStore, Cid};
use satchel_store::{
    fs::RedbStore, memory::MemStore, BatchOp, EntryStore, ListFilter, StoreError,
};
use satchel_sync::{
    Entry, EntryId, EntryKind, InvalidKind, Replica, ReplicaError, ReplicaState, StateProvider,
};

use crate::crypto::{self, ContentKey, CryptoError};
use crate::events::{Event, EventBus, EventKind, Subscription};

/// Errors surfaced by engine operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The id is unknown.
    #[error("entry not found: {0}")]
    NotFound(EntryId),
    /// The id exists only as a tombstone.
    #[error("entry is tombstoned: {0}")]
    Tombstoned(EntryId),
    /// A kind string outside the closed set.
    #[error(transparent)]
    InvalidKind(#[from] InvalidKind),
    /// Encryption or decryption failure.
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    /// A sync payload that did not deserialize.
    #[error("malformed sync payload")]
    Payload(#[source] postcard::Error),
    /// The durable layer failed.
    #[error(transparent)]
    Store(StoreError),
    /// A blob operation failed.
    #[error(transparent)]
    Blob(#[from] BlobError),
    /// Blob operations need a data directory.
    #[error("no data directory configured, blob storage is unavailable")]
    BlobsUnavailable,
    /// A persistent engine was configured without a data directory.
    #[error("a data directory is required unless the engine is in-memory")]
    MissingDataDir,
}

impl From<ReplicaError> for Error {
    fn from(err: ReplicaError) -> Self {
        match err {
            ReplicaError::NotFound(id) => Error::NotFound(id),
            ReplicaError::Tombstoned(id) => Error::Tombstoned(id),
        }
    }
}

impl From<StoreError> for Error {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => Error::NotFound(id),
            other => Error::Store(other),
        }
    }
}

/// Engine construction parameters.
#[derive(Debug, Default)]
pub struct Config {
    /// Directory for the database, blobs, and key file. Required unless
    /// `in_memory` is set; still used for blobs when both are given.
    pub data_dir: Option<PathBuf>,
    /// Keep the projection in memory instead of on disk.
    pub in_memory: bool,
    /// Encrypt entry payloads under this key.
    pub content_key: Option<ContentKey>,
}

impl Config {
    /// An ephemeral engine for tests and tooling.
    pub fn in_memory() -> Self {
        Config {
            in_memory: true,
            ..Default::default()
        }
    }

    /// A persistent engine rooted at `data_dir`.
    pub fn persistent(data_dir: impl Into<PathBuf>) -> Self {
        Config {
            data_dir: Some(data_dir.into()),
            ..Default::default()
        }
    }

    /// Enables content encryption.
    pub fn with_content_key(mut self, key: ContentKey) -> Self {
        self.content_key = Some(key);
        self
    }
}

/// The public face of a satchel node.
///
/// Multiple engines coexist in one process when given distinct data
/// directories; there is no global state. The replica is the source of
/// truth, the store its durable projection, and every mutation leaves both
/// consistent before it returns.
#[derive(Debug)]
pub struct Engine {
    replica: RwLock<Replica>,
    store: Box<dyn EntryStore>,
    blobs: Option<BlobStore>,
    key: Option<ContentKey>,
    events: EventBus,
}

const DB_FILE_NAME: &str = "satchel.db";

impl Engine {
    /// Opens an engine: opens the store, seeds the clock from the store's
    /// maximum updated time, and hydrates the replica from every projected
    /// row. A corrupt database fails here and the engine refuses to start.
    pub fn open(config: Config) -> Result<Self, Error> {
        let store: Box<dyn EntryStore> = if config.in_memory {
            Box::new(MemStore::new())
        } else {
            let dir = config.data_dir.as_ref().ok_or(Error::MissingDataDir)?;
            std::fs::create_dir_all(dir)
                .map_err(|err| Error::Store(StoreError::Backend(err.into())))?;
            Box::new(RedbStore::persistent(dir.join(DB_FILE_NAME))?)
        };
        let blobs = match &config.data_dir {
            Some(dir) => Some(BlobStore::open(dir.join("blobs"))?),
            None => None,
        };

        let max_time = store.max_updated_time()?;
        let mut replica = Replica::with_clock_time(max_time);
        let rows = store.list(&ListFilter::everything())?;
        let hydrated = rows.len();
        for entry in rows {
            replica.hydrate(entry);
        }
        debug!(hydrated, clock = max_time, "engine opened");

        Ok(Engine {
            replica: RwLock::new(replica),
            store,
            blobs,
            key: config.content_key,
            events: EventBus::new(),
        })
    }

    /// Creates an entry and returns it with its plaintext payload.
    pub fn add(
        &self,
        kind: EntryKind,
        payload: Vec<u8>,
        tags: Vec<String>,
    ) -> Result<Entry, Error> {
        let id = EntryId::generate();
        let stored = self.seal(&payload, id)?;
        // The store write happens under the replica lock so no later
        // mutation's projection can land before this one.
        let mut entry = {
            let mut replica = self.replica.write();
            let entry = replica.add_with_id(id, kind, stored, &tags);
            self.store.put(&entry)?;
            entry
        };
        self.events
            .publish(Event::now(EventKind::Created, id, Some(kind)));
        entry.payload = payload;
        Ok(entry)
    }

    /// Fetches a live entry, decrypting its payload when keyed.
    pub fn get(&self, id: EntryId) -> Result<Entry, Error> {
        let mut entry = self.replica.read().get(id)?;
        entry.payload = self.unseal(entry.payload, id)?;
        Ok(entry)
    }

    /// Updates payload and/or tags of a live entry.
    pub fn update(
        &self,
        id: EntryId,
        payload: Option<Vec<u8>>,
        tags: Option<Vec<String>>,
    ) -> Result<(), Error> {
        let sealed = match &payload {
            Some(plaintext) => Some(self.seal(plaintext, id)?),
            None => None,
        };
        let entry = {
            let mut replica = self.replica.write();
            let entry = replica.update(id, sealed, tags.as_deref())?;
            self.store.put(&entry)?;
            entry
        };
        self.events
            .publish(Event::now(EventKind::Updated, id, Some(entry.kind)));
        Ok(())
    }

    /// Tombstones an entry.
    pub fn remove(&self, id: EntryId) -> Result<(), Error> {
        let element = {
            let mut replica = self.replica.write();
            replica.remove(id);
            let element = replica
                .get_including_tombstones(id)
                .expect("remove records a tombstone");
            match self.store.delete(id) {
                Ok(()) => {}
                // The projection never saw this id; record the tombstone row
                // so projection and replica agree after a restart.
                Err(StoreError::NotFound(_)) => self.store.put(&element.entry)?,
                Err(err) => return Err(err.into()),
            }
            element
        };
        self.events.publish(Event::now(
            EventKind::Removed,
            id,
            Some(element.entry.kind),
        ));
        Ok(())
    }

    /// Lists entries from the projection, with tags taken from the replica
    /// (which may be ahead of the projected tag rows) and payloads
    /// decrypted.
    pub fn list(&self, filter: &ListFilter) -> Result<Vec<Entry>, Error> {
        let mut entries = self.store.list(filter)?;
        {
            let replica = self.replica.read();
            for entry in &mut entries {
                entry.tags = replica.tags_of(entry.id);
            }
        }
        for entry in &mut entries {
            entry.payload = self.unseal(std::mem::take(&mut entry.payload), entry.id)?;
        }
        Ok(entries)
    }

    /// Serializes the replica state for a sync exchange.
    pub fn sync_payload(&self) -> Result<Vec<u8>, Error> {
        postcard::to_stdvec(&self.replica.read().state()).map_err(Error::Payload)
    }

    /// Merges a serialized remote state and re-projects what changed.
    pub fn apply_sync_payload(&self, payload: &[u8]) -> Result<(), Error> {
        let state: ReplicaState = postcard::from_bytes(payload).map_err(Error::Payload)?;
        self.apply_remote_state(state)
    }

    /// Registers an event subscriber.
    pub fn subscribe(&self) -> Subscription {
        self.events.subscribe()
    }

    /// Stores a blob under the engine's data directory.
    pub fn add_blob(&self, data: &[u8]) -> Result<Cid, Error> {
        Ok(self.blob_store()?.put(data)?)
    }

    /// Reads a blob back, verifying its integrity.
    pub fn get_blob(&self, cid: &Cid) -> Result<Vec<u8>, Error> {
        Ok(self.blob_store()?.get(cid)?)
    }

    /// The engine's blob store, when a data directory is configured.
    pub fn blobs(&self) -> Option<&BlobStore> {
        self.blobs.as_ref()
    }

    /// Closes subscriptions and the store.
    pub fn close(&self) -> Result<(), Error> {
        self.events.close();
        self.store.close()?;
        Ok(())
    }

    fn blob_store(&self) -> Result<&BlobStore, Error> {
        self.blobs.as_ref().ok_or(Error::BlobsUnavailable)
    }

    fn seal(&self, plaintext: &[u8], id: EntryId) -> Result<Vec<u8>, Error> {
        match &self.key {
            Some(key) => Ok(crypto::encrypt_payload(key, plaintext, id)?),
            None => Ok(plaintext.to_vec()),
        }
    }

    fn unseal(&self, payload: Vec<u8>, id: EntryId) -> Result<Vec<u8>, Error> {
        match &self.key {
            Some(key) if !payload.is_empty() => {
                Ok(crypto::decrypt_payload(key, &payload, id)?)
            }
            _ => Ok(payload),
        }
    }

    /// Merges a remote state through a throwaway replica, then re-projects
    /// the entries the merge actually changed in one atomic batch.
    fn apply_remote_state(&self, state: ReplicaState) -> Result<(), Error> {
        let incoming_ids: Vec<EntryId> =
            state.entries.iter().map(|element| element.entry.id).collect();

        let events = {
            let mut replica = self.replica.write();

            // Snapshot what we hold for every incoming id, so only entries
            // the merge changes are re-projected. Tags are part of the
            // snapshot: a tag-only union leaves the element untouched.
            let before: Vec<_> = incoming_ids
                .iter()
                .map(|id| {
                    let element = replica
                        .get_including_tombstones(*id)
                        .map(|element| (element.timestamp, element.tombstone));
                    (element, replica.tags_of(*id))
                })
                .collect();

            let mut incoming = Replica::with_clock_time(state.clock_time);
            incoming.load_state(state);
            replica.merge(&incoming);

            let mut ops = Vec::new();
            let mut events = Vec::new();
            for (id, (element_before, tags_before)) in incoming_ids.into_iter().zip(before) {
                let element = replica
                    .get_including_tombstones(id)
                    .expect("merge retains every incoming id");
                let tags = replica.tags_of(id);
                if element_before == Some((element.timestamp, element.tombstone))
                    && tags_before == tags
                {
                    continue;
                }
                let mut entry = element.entry;
                entry.tags = tags;
                events.push(Event::now(EventKind::Synced, id, Some(entry.kind)));
                ops.push(BatchOp::Put(entry));
            }

            if !ops.is_empty() {
                debug!(changed = ops.len(), "projecting merged entries");
                self.store.apply_batch(ops)?;
            }
            events
        };

        for event in events {
            self.events.publish(event);
        }
        Ok(())
    }
}

impl StateProvider for Engine {
    fn state(&self) -> ReplicaState {
        self.replica.read().state()
    }

    fn apply_state(&self, state: ReplicaState) -> anyhow::Result<()> {
        self.apply_remote_state(state).map_err(Into::into)
    }

    fn state_hash(&self) -> [u8; 32] {
        self.replica.read().state_hash()
    }
}
