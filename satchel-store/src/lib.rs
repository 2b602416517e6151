//! Durable, queryable projection of a replica's entries.
//!
//! The store is a cache and index, not the source of truth: the replica is
//! hydrated from it at boot and every replica mutation is re-projected into
//! it. Writes are idempotent upserts; a crash between transactions leaves the
//! projection at the previous consistent state.
//!
//! Two backends implement the same [`EntryStore`] trait: [`memory::MemStore`]
//! for tests and in-memory engines, and [`fs::RedbStore`], a single-file
//! [`redb`] database with secondary indexes, for persistent use.

use satchel_sync::{Entry, EntryId, EntryKind};

pub mod fs;
pub mod memory;

/// Errors from the durable layer.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The id has no row.
    #[error("entry not found: {0}")]
    NotFound(EntryId),
    /// The underlying database failed.
    #[error("storage backend error")]
    Backend(#[from] anyhow::Error),
}

macro_rules! impl_backend_error {
    ($($err:ty),* $(,)?) => {
        $(
            impl From<$err> for StoreError {
                fn from(err: $err) -> Self {
                    StoreError::Backend(err.into())
                }
            }
        )*
    };
}

impl_backend_error!(
    redb::CommitError,
    redb::DatabaseError,
    redb::StorageError,
    redb::TableError,
    redb::TransactionError,
);

/// Criteria for [`EntryStore::list`]. The zero value selects all live
/// entries.
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    /// Only entries of this kind.
    pub kind: Option<EntryKind>,
    /// Only entries carrying this tag.
    pub tag: Option<String>,
    /// Only entries with `updated_time >= since`.
    pub since: Option<u64>,
    /// Only entries with `updated_time <= until`.
    pub until: Option<u64>,
    /// Also return tombstoned entries.
    pub include_tombstoned: bool,
    /// Maximum number of results; `0` means unlimited.
    pub limit: usize,
    /// Number of leading results to skip.
    pub offset: usize,
}

impl ListFilter {
    /// Everything, tombstones included. Used at boot for hydration.
    pub fn everything() -> Self {
        ListFilter {
            include_tombstoned: true,
            ..Default::default()
        }
    }

    fn matches(&self, entry: &Entry) -> bool {
        if !self.include_tombstoned && entry.tombstone {
            return false;
        }
        if let Some(kind) = self.kind {
            if entry.kind != kind {
                return false;
            }
        }
        if let Some(since) = self.since {
            if entry.updated_time < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if entry.updated_time > until {
                return false;
            }
        }
        if let Some(tag) = &self.tag {
            if !entry.tags.contains(tag) {
                return false;
            }
        }
        true
    }
}

/// One operation of an atomic batch.
#[derive(Debug, Clone)]
pub enum BatchOp {
    /// Upsert an entry (tombstoned or live) with its tag rows.
    Put(Entry),
    /// Set the tombstone flag on an existing row.
    Delete(EntryId),
}

/// Abstraction over the durable backends.
///
/// Implementations are object-safe so the engine can hold a boxed store;
/// listing returns owned entries ordered by descending `updated_time`.
pub trait EntryStore: std::fmt::Debug + Send + Sync {
    /// Upserts an entry by id, replacing all of its tag rows. Idempotent:
    /// repeating a `put` with equal content observes the same state.
    fn put(&self, entry: &Entry) -> Result<(), StoreError>;

    /// Fetches an entry by id, tombstoned or not.
    fn get(&self, id: EntryId) -> Result<Entry, StoreError>;

    /// Marks an entry tombstoned without touching its timestamps.
    fn delete(&self, id: EntryId) -> Result<(), StoreError>;

    /// Returns the entries matching `filter`, newest first.
    fn list(&self, filter: &ListFilter) -> Result<Vec<Entry>, StoreError>;

    /// Applies a mixed sequence of puts and deletes in one transaction.
    fn apply_batch(&self, ops: Vec<BatchOp>) -> Result<(), StoreError>;

    /// The highest `updated_time` of any row, or `0` when empty. Seeds the
    /// clock on restart.
    fn max_updated_time(&self) -> Result<u64, StoreError>;

    /// Releases resources. Further calls may fail.
    fn close(&self) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use satchel_sync::Entry;

    use super::*;

    /// The shared behavior suite both backends must pass.
    pub(crate) fn test_store(store: &dyn EntryStore) {
        let mut first = Entry::new(
            EntryKind::Note,
            b"one".to_vec(),
            vec!["alpha".into(), "beta".into()],
            1,
        );
        let second = Entry::new(EntryKind::Log, b"two".to_vec(), vec!["beta".into()], 2);
        let third = Entry::new(EntryKind::Note, b"three".to_vec(), vec![], 3);

        store.put(&first).unwrap();
        store.put(&second).unwrap();
        store.put(&third).unwrap();

        // Round trip with tags.
        let fetched = store.get(first.id).unwrap();
        assert_eq!(fetched, first);

        // Put is an idempotent upsert.
        store.put(&first).unwrap();
        assert_eq!(store.get(first.id).unwrap(), first);
        assert_eq!(store.list(&ListFilter::default()).unwrap().len(), 3);

        // Upsert replaces payload and tag rows.
        first.payload = b"one, revised".to_vec();
        first.tags = vec!["gamma".into()];
        first.updated_time = 5;
        store.put(&first).unwrap();
        let fetched = store.get(first.id).unwrap();
        assert_eq!(fetched.payload, b"one, revised");
        assert_eq!(fetched.tags, vec!["gamma".to_string()]);

        // Ordering is newest-first.
        let all = store.list(&ListFilter::default()).unwrap();
        assert_eq!(
            all.iter().map(|e| e.id).collect::<Vec<_>>(),
            vec![first.id, third.id, second.id]
        );

        // Filters.
        let notes = store
            .list(&ListFilter {
                kind: Some(EntryKind::Note),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(notes.len(), 2);

        let tagged = store
            .list(&ListFilter {
                tag: Some("beta".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(tagged.len(), 1);
        assert_eq!(tagged[0].id, second.id);

        let windowed = store
            .list(&ListFilter {
                since: Some(2),
                until: Some(3),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(windowed.len(), 2);

        let paged = store
            .list(&ListFilter {
                limit: 1,
                offset: 1,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(paged.len(), 1);
        assert_eq!(paged[0].id, third.id);

        // Tombstoning.
        store.delete(second.id).unwrap();
        let deleted = store.get(second.id).unwrap();
        assert!(deleted.tombstone);
        assert_eq!(deleted.updated_time, 2, "delete must not touch times");
        assert_eq!(store.list(&ListFilter::default()).unwrap().len(), 2);
        assert_eq!(store.list(&ListFilter::everything()).unwrap().len(), 3);

        let missing = EntryId::generate();
        assert!(matches!(
            store.delete(missing),
            Err(StoreError::NotFound(id)) if id == missing
        ));
        assert!(matches!(
            store.get(missing),
            Err(StoreError::NotFound(id)) if id == missing
        ));

        // Clock recovery seed.
        assert_eq!(store.max_updated_time().unwrap(), 5);

        // Atomic batch.
        let fourth = Entry::new(EntryKind::Event, b"four".to_vec(), vec!["x".into()], 9);
        store
            .apply_batch(vec![
                BatchOp::Put(fourth.clone()),
                BatchOp::Delete(third.id),
            ])
            .unwrap();
        assert_eq!(store.get(fourth.id).unwrap(), fourth);
        assert!(store.get(third.id).unwrap().tombstone);
        assert_eq!(store.max_updated_time().unwrap(), 9);
    }
}
