use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::{Column, KeyValueStore, PrefixVisitor, ScanResult, StoreError, WriteBatch, WriteOp};

/// One ordered map per column, all behind a single lock so batches are atomic.
pub struct MemoryStore {
    columns: RwLock<Vec<BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            columns: RwLock::new(vec![BTreeMap::new(); Column::ALL.len()]),
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self, column: Column) -> usize {
        self.read()
            .map(|guard| guard[column.index()].len())
            .unwrap_or(0)
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Vec<BTreeMap<Vec<u8>, Vec<u8>>>>, StoreError> {
        self.columns
            .read()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Vec<BTreeMap<Vec<u8>, Vec<u8>>>>, StoreError> {
        self.columns
            .write()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".to_string()))
    }
}

fn prefix_range<'a>(
    map: &'a BTreeMap<Vec<u8>, Vec<u8>>,
    prefix: &'a [u8],
) -> impl Iterator<Item = (&'a Vec<u8>, &'a Vec<u8>)> + 'a {
    map.range::<[u8], _>((Bound::Included(prefix), Bound::Unbounded))
        .take_while(move |(key, _)| key.starts_with(prefix))
}

impl KeyValueStore for MemoryStore {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.read()?[column.index()].get(key).cloned())
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.write()?[column.index()].insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        self.write()?[column.index()].remove(key);
        Ok(())
    }

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError> {
        let guard = self.read()?;
        Ok(prefix_range(&guard[column.index()], prefix)
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError> {
        // Visit a copy so visitors may write back into the store.
        for (key, value) in self.scan_prefix(column, prefix)? {
            visitor(&key, &value)?;
        }
        Ok(())
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        let mut guard = self.write()?;
        for op in batch.iter() {
            match op {
                WriteOp::Put { column, key, value } => {
                    guard[column.index()].insert(key.as_slice().to_vec(), value.as_slice().to_vec());
                }
                WriteOp::Delete { column, key } => {
                    guard[column.index()].remove(key.as_slice());
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_scan_is_ordered_and_bounded() {
        let store = MemoryStore::new();
        store.put(Column::TxHints, b"ab\x02", b"2").expect("put");
        store.put(Column::TxHints, b"ab\x01", b"1").expect("put");
        store.put(Column::TxHints, b"ac", b"x").expect("put");
        store.put(Column::TxOut, b"ab\x00", b"other column").expect("put");

        let rows = store.scan_prefix(Column::TxHints, b"ab").expect("scan");
        assert_eq!(
            rows,
            vec![
                (b"ab\x01".to_vec(), b"1".to_vec()),
                (b"ab\x02".to_vec(), b"2".to_vec()),
            ]
        );
        assert_eq!(store.scan_prefix(Column::TxHints, b"").expect("scan").len(), 3);
    }

    #[test]
    fn batch_applies_puts_and_deletes_in_order() {
        let store = MemoryStore::new();
        store.put(Column::Meta, b"gone", b"1").expect("put");
        let mut batch = WriteBatch::new();
        batch.put(Column::Meta, b"kept", b"a");
        batch.delete(Column::Meta, b"gone");
        batch.put(Column::Meta, b"kept", b"b");
        store.write_batch(&batch).expect("batch");
        assert_eq!(store.get(Column::Meta, b"kept").expect("get"), Some(b"b".to_vec()));
        assert_eq!(store.get(Column::Meta, b"gone").expect("get"), None);
    }

    #[test]
    fn clear_prefix_removes_only_matching_keys() {
        let store = MemoryStore::new();
        store.put(Column::Pending, b"\xff\xff1", b"a").expect("put");
        store.put(Column::Pending, b"\xff\xff2", b"b").expect("put");
        store.put(Column::Pending, b"meta", b"c").expect("put");
        let removed = crate::clear_prefix(&store, Column::Pending, b"\xff\xff").expect("clear");
        assert_eq!(removed, 2);
        assert_eq!(store.len(Column::Pending), 1);
    }
}
