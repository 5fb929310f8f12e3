//! The `Pending` column: raw pending transactions by key.
//!
//! The table is flagged dirty while a tracker has it open. Finding the flag
//! set at startup means the last run did not shut down cleanly, so the
//! stored set is thrown away and rebuilt from the network.

use chainscan_chainstate::{ChainError, TxKey};
use chainscan_storage::{clear_prefix, Column, KeyValueStore, WriteBatch};

use crate::error::MempoolError;

pub const META_PENDING_NEXT_KEY: &[u8] = b"pending_next_key";
pub const META_PENDING_DIRTY: &[u8] = b"pending_dirty";

#[derive(Debug, Default)]
pub struct StoredPending {
    pub next_key: u32,
    pub txs: Vec<(TxKey, Vec<u8>)>,
    /// The stored set was discarded.
    pub cleared: bool,
}

fn read_next_key<S: KeyValueStore + ?Sized>(store: &S) -> Result<u32, MempoolError> {
    let Some(bytes) = store.get(Column::Meta, META_PENDING_NEXT_KEY)? else {
        return Ok(0);
    };
    let bytes: [u8; 4] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| ChainError::corrupt(META_PENDING_NEXT_KEY, "bad pending key counter"))?;
    Ok(u32::from_le_bytes(bytes))
}

/// Loads the stored pending set and marks the table dirty.
pub fn open_pending<S: KeyValueStore + ?Sized>(
    store: &S,
    clear: bool,
) -> Result<StoredPending, MempoolError> {
    let dirty = store.get(Column::Meta, META_PENDING_DIRTY)?.is_some_and(|flag| flag == [1]);
    let mut stored = StoredPending {
        next_key: read_next_key(store)?,
        ..StoredPending::default()
    };
    if dirty || clear {
        let removed = clear_prefix(store, Column::Pending, &[])?;
        chainscan_log::log_info!(
            "pending table cleared ({} txs, {})",
            removed,
            if clear { "requested" } else { "unclean shutdown" }
        );
        stored.cleared = true;
    } else {
        let mut corrupt = None;
        store.for_each_prefix(Column::Pending, &[], &mut |key, value| {
            match TxKey::from_slice(key).filter(TxKey::is_pending) {
                Some(tx_key) => stored.txs.push((tx_key, value.to_vec())),
                None => corrupt = Some(key.to_vec()),
            }
            Ok(())
        })?;
        if let Some(key) = corrupt {
            return Err(ChainError::corrupt(&key, "bad pending key").into());
        }
        stored.txs.sort_by_key(|(key, _)| *key);
        if let Some(last) = stored.txs.last().and_then(|(key, _)| key.pending_id()) {
            stored.next_key = stored.next_key.max(last.saturating_add(1));
        }
    }
    store.put(Column::Meta, META_PENDING_DIRTY, &[1])?;
    Ok(stored)
}

pub fn mark_clean<S: KeyValueStore + ?Sized>(store: &S) -> Result<(), MempoolError> {
    store.delete(Column::Meta, META_PENDING_DIRTY)?;
    Ok(())
}

pub fn write_pending(
    batch: &mut WriteBatch,
    added: &[(TxKey, &[u8])],
    removed: &[TxKey],
    next_key: u32,
) {
    for (key, raw) in added {
        batch.put(Column::Pending, key.as_bytes(), *raw);
    }
    for key in removed {
        batch.delete(Column::Pending, key.as_bytes());
    }
    batch.put(Column::Meta, META_PENDING_NEXT_KEY, next_key.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainscan_storage::memory::MemoryStore;

    #[test]
    fn dirty_table_is_cleared_on_open() {
        let store = MemoryStore::new();
        let mut batch = WriteBatch::new();
        write_pending(&mut batch, &[(TxKey::pending(4), &[1u8, 2, 3][..])], &[], 5);
        store.write_batch(&batch).expect("write");

        let first = open_pending(&store, false).expect("open");
        assert!(!first.cleared);
        assert_eq!(first.next_key, 5);
        assert_eq!(first.txs, vec![(TxKey::pending(4), vec![1, 2, 3])]);

        // No clean shutdown in between.
        let second = open_pending(&store, false).expect("reopen");
        assert!(second.cleared);
        assert!(second.txs.is_empty());
        assert_eq!(store.len(Column::Pending), 0);

        mark_clean(&store).expect("clean");
        let third = open_pending(&store, false).expect("clean reopen");
        assert!(!third.cleared);
        assert_eq!(third.next_key, 5);
    }
}
