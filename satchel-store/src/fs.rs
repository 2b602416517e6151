//! Persistent projection backend on `redb`.
//!
//! A single database file holds three tables: the entry rows keyed by id, a
//! multimap of tag rows per entry, and a `(updated_time, id)` index that
//! serves both the newest-first ordering and the `since`/`until` bounds
//! without scanning unrelated rows. Every mutation is one write transaction;
//! a batch is a single transaction.

use std::path::Path;

use redb::{
    Database, MultimapTableDefinition, ReadableMultimapTable, ReadableTable,
    ReadableTableMetadata, TableDefinition,
};
use satchel_sync::{Entry, EntryId};

use crate::{BatchOp, EntryStore, ListFilter, StoreError};

/// `(kind, payload, created_time, updated_time, tombstone)`.
type EntryRow = (&'static str, &'static [u8], u64, u64, bool);

const ENTRIES_TABLE: TableDefinition<&[u8; 16], EntryRow> = TableDefinition::new("entries-v1");
const TAGS_TABLE: MultimapTableDefinition<&[u8; 16], &str> =
    MultimapTableDefinition::new("tags-v1");
const BY_TIME_TABLE: TableDefinition<(u64, &[u8; 16]), ()> =
    TableDefinition::new("entries-by-time-v1");

/// A persistent [`EntryStore`] backed by a single `redb` file.
#[derive(Debug)]
pub struct RedbStore {
    db: Database,
}

impl RedbStore {
    /// Creates or opens the database file at `path`.
    ///
    /// A corrupt file fails here, before the engine accepts any operation.
    pub fn persistent(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = Database::create(path)?;
        // Create all tables up front so later read transactions never race
        // their first writer.
        let tx = db.begin_write()?;
        {
            let _ = tx.open_table(ENTRIES_TABLE)?;
            let _ = tx.open_multimap_table(TAGS_TABLE)?;
            let _ = tx.open_table(BY_TIME_TABLE)?;
        }
        tx.commit()?;
        Ok(RedbStore { db })
    }
}

fn write_entry(
    entries: &mut redb::Table<&[u8; 16], EntryRow>,
    tags: &mut redb::MultimapTable<&[u8; 16], &str>,
    by_time: &mut redb::Table<(u64, &[u8; 16]), ()>,
    entry: &Entry,
) -> Result<(), StoreError> {
    let id = entry.id.as_bytes();
    let row = (
        entry.kind.as_str(),
        entry.payload.as_slice(),
        entry.created_time,
        entry.updated_time,
        entry.tombstone,
    );
    let old_time = entries.insert(id, row)?.map(|prev| prev.value().3);
    if let Some(old_time) = old_time {
        if old_time != entry.updated_time {
            by_time.remove(&(old_time, id))?;
        }
    }
    by_time.insert(&(entry.updated_time, id), ())?;

    tags.remove_all(id)?;
    for tag in &entry.tags {
        tags.insert(id, tag.as_str())?;
    }
    Ok(())
}

fn tombstone_entry(
    entries: &mut redb::Table<&[u8; 16], EntryRow>,
    id: EntryId,
) -> Result<(), StoreError> {
    let key = id.as_bytes();
    let row = match entries.get(key)? {
        Some(guard) => {
            let (kind, payload, created, updated, _) = guard.value();
            (kind.to_owned(), payload.to_vec(), created, updated)
        }
        None => return Err(StoreError::NotFound(id)),
    };
    entries.insert(
        key,
        (row.0.as_str(), row.1.as_slice(), row.2, row.3, true),
    )?;
    Ok(())
}

fn read_entry(
    entries: &impl ReadableTable<&'static [u8; 16], EntryRow>,
    tags: &impl ReadableMultimapTable<&'static [u8; 16], &'static str>,
    id: [u8; 16],
) -> Result<Option<Entry>, StoreError> {
    let Some(guard) = entries.get(&id)? else {
        return Ok(None);
    };
    let (kind, payload, created_time, updated_time, tombstone) = guard.value();
    let kind = kind
        .parse()
        .map_err(|err| StoreError::Backend(anyhow::Error::new(err)))?;
    let mut tag_rows = Vec::new();
    for tag in tags.get(&id)? {
        tag_rows.push(tag?.value().to_owned());
    }
    Ok(Some(Entry {
        id: EntryId::from_bytes(id),
        kind,
        payload: payload.to_vec(),
        tags: tag_rows,
        created_time,
        updated_time,
        tombstone,
    }))
}

impl EntryStore for RedbStore {
    fn put(&self, entry: &Entry) -> Result<(), StoreError> {
        let tx = self.db.begin_write()?;
        {
            let mut entries = tx.open_table(ENTRIES_TABLE)?;
            let mut tags = tx.open_multimap_table(TAGS_TABLE)?;
            let mut by_time = tx.open_table(BY_TIME_TABLE)?;
            write_entry(&mut entries, &mut tags, &mut by_time, entry)?;
        }
        tx.commit()?;
        Ok(())
    }

    fn get(&self, id: EntryId) -> Result<Entry, StoreError> {
        let tx = self.db.begin_read()?;
        let entries = tx.open_table(ENTRIES_TABLE)?;
        let tags = tx.open_multimap_table(TAGS_TABLE)?;
        read_entry(&entries, &tags, *id.as_bytes())?.ok_or(StoreError::NotFound(id))
    }

    fn delete(&self, id: EntryId) -> Result<(), StoreError> {
        let tx = self.db.begin_write()?;
        {
            let mut entries = tx.open_table(ENTRIES_TABLE)?;
            tombstone_entry(&mut entries, id)?;
        }
        tx.commit()?;
        Ok(())
    }

    fn list(&self, filter: &ListFilter) -> Result<Vec<Entry>, StoreError> {
        let tx = self.db.begin_read()?;
        let entries = tx.open_table(ENTRIES_TABLE)?;
        let tags = tx.open_multimap_table(TAGS_TABLE)?;
        let by_time = tx.open_table(BY_TIME_TABLE)?;

        const MIN_ID: [u8; 16] = [0x00; 16];
        const MAX_ID: [u8; 16] = [0xff; 16];
        let lower = (filter.since.unwrap_or(0), &MIN_ID);
        let upper = (filter.until.unwrap_or(u64::MAX), &MAX_ID);

        let mut out = Vec::new();
        let mut skipped = 0;
        for item in by_time.range(lower..=upper)?.rev() {
            let (key, _) = item?;
            let (_, id) = key.value();
            let Some(entry) = read_entry(&entries, &tags, *id)? else {
                continue;
            };
            if !filter.matches(&entry) {
                continue;
            }
            if skipped < filter.offset {
                skipped += 1;
                continue;
            }
            out.push(entry);
            if filter.limit > 0 && out.len() == filter.limit {
                break;
            }
        }
        Ok(out)
    }

    fn apply_batch(&self, ops: Vec<BatchOp>) -> Result<(), StoreError> {
        let tx = self.db.begin_write()?;
        {
            let mut entries = tx.open_table(ENTRIES_TABLE)?;
            let mut tags = tx.open_multimap_table(TAGS_TABLE)?;
            let mut by_time = tx.open_table(BY_TIME_TABLE)?;
            // Any failure drops the transaction uncommitted, so the batch is
            // all-or-nothing.
            for op in &ops {
                match op {
                    BatchOp::Put(entry) => {
                        write_entry(&mut entries, &mut tags, &mut by_time, entry)?
                    }
                    BatchOp::Delete(id) => tombstone_entry(&mut entries, *id)?,
                }
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn max_updated_time(&self) -> Result<u64, StoreError> {
        let tx = self.db.begin_read()?;
        let by_time = tx.open_table(BY_TIME_TABLE)?;
        if by_time.is_empty()? {
            return Ok(0);
        }
        let last = by_time.last()?.expect("table is non-empty");
        Ok(last.0.value().0)
    }

    fn close(&self) -> Result<(), StoreError> {
        // The database flushes on every commit; dropping the store releases
        // the file lock.
        Ok(())
    }
}
