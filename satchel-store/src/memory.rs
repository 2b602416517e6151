//! In-memory projection backend.

use std::collections::BTreeMap;

use parking_lot::RwLock;
use satchel_sync::{Entry, EntryId};

use crate::{BatchOp, EntryStore, ListFilter, StoreError};

/// A [`EntryStore`] over a locked `BTreeMap`. Used by tests and by engines
/// opened in memory; contents vanish with the process.
#[derive(Debug, Default)]
pub struct MemStore {
    entries: RwLock<BTreeMap<EntryId, Entry>>,
}

impl MemStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn apply_put(entries: &mut BTreeMap<EntryId, Entry>, entry: &Entry) {
        entries.insert(entry.id, entry.clone());
    }

    fn apply_delete(
        entries: &mut BTreeMap<EntryId, Entry>,
        id: EntryId,
    ) -> Result<(), StoreError> {
        match entries.get_mut(&id) {
            Some(entry) => {
                entry.tombstone = true;
                Ok(())
            }
            None => Err(StoreError::NotFound(id)),
        }
    }
}

impl EntryStore for MemStore {
    fn put(&self, entry: &Entry) -> Result<(), StoreError> {
        Self::apply_put(&mut self.entries.write(), entry);
        Ok(())
    }

    fn get(&self, id: EntryId) -> Result<Entry, StoreError> {
        self.entries
            .read()
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    fn delete(&self, id: EntryId) -> Result<(), StoreError> {
        Self::apply_delete(&mut self.entries.write(), id)
    }

    fn list(&self, filter: &ListFilter) -> Result<Vec<Entry>, StoreError> {
        let entries = self.entries.read();
        let mut matched: Vec<Entry> = entries
            .values()
            .filter(|entry| filter.matches(entry))
            .cloned()
            .collect();
        // Newest first; ties resolved on id so pagination is stable.
        matched.sort_by(|a, b| {
            b.updated_time
                .cmp(&a.updated_time)
                .then_with(|| b.id.cmp(&a.id))
        });
        let skipped = matched.into_iter().skip(filter.offset);
        Ok(if filter.limit > 0 {
            skipped.take(filter.limit).collect()
        } else {
            skipped.collect()
        })
    }

    fn apply_batch(&self, ops: Vec<BatchOp>) -> Result<(), StoreError> {
        let mut entries = self.entries.write();
        // Stage the whole batch on a copy so a failing op leaves the live
        // map untouched.
        let mut staged = entries.clone();
        for op in ops {
            match op {
                BatchOp::Put(entry) => Self::apply_put(&mut staged, &entry),
                BatchOp::Delete(id) => Self::apply_delete(&mut staged, id)?,
            }
        }
        *entries = staged;
        Ok(())
    }

    fn max_updated_time(&self) -> Result<u64, StoreError> {
        Ok(self
            .entries
            .read()
            .values()
            .map(|entry| entry.updated_time)
            .max()
            .unwrap_or(0))
    }

    fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn behaves_like_a_store() {
        let store = MemStore::new();
        crate::tests::test_store(&store);
    }
}
