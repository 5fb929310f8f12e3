//! Writing batch results and scan position bookkeeping.

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use chainscan_chainstate::keys::tx_hint_key;
use chainscan_chainstate::resolver::encode_txout_record;
use chainscan_chainstate::ChainError;
use chainscan_primitives::Hash256;
use chainscan_storage::{Column, KeyValueStore, WriteBatch};

use crate::error::ScanError;
use crate::history::SubHistory;
use crate::passes::BatchDelta;
use crate::summary::mark_dirty;

pub const META_SCAN_TOP_HASH: &[u8] = b"scan_top_hash";
pub const META_SCAN_TOP_HEIGHT: &[u8] = b"scan_top_height";
pub const META_SCAN_BATCH_COUNTER: &[u8] = b"scan_batch_counter";
pub const META_SUMMARY_TOP_HASH: &[u8] = b"summary_top_hash";
pub const META_SUMMARY_TOP_HEIGHT: &[u8] = b"summary_top_height";

const SLOW_COMMIT: Duration = Duration::from_secs(2);

/// Last block whose history has been committed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ChainPosition {
    pub hash: Hash256,
    pub height: u32,
}

pub fn read_position<S: KeyValueStore + ?Sized>(
    store: &S,
    hash_key: &[u8],
    height_key: &[u8],
) -> Result<Option<ChainPosition>, ScanError> {
    let (Some(hash), Some(height)) = (
        store.get(Column::Meta, hash_key)?,
        store.get(Column::Meta, height_key)?,
    ) else {
        return Ok(None);
    };
    let hash: Hash256 = hash.as_slice().try_into().map_err(|_| {
        ScanError::Chain(ChainError::corrupt(hash_key, "bad position hash"))
    })?;
    let height: [u8; 4] = height.as_slice().try_into().map_err(|_| {
        ScanError::Chain(ChainError::corrupt(height_key, "bad position height"))
    })?;
    Ok(Some(ChainPosition {
        hash,
        height: u32::from_le_bytes(height),
    }))
}

pub fn write_position(
    batch: &mut WriteBatch,
    hash_key: &[u8],
    height_key: &[u8],
    position: Option<ChainPosition>,
) {
    match position {
        Some(position) => {
            batch.put(Column::Meta, hash_key, position.hash);
            batch.put(Column::Meta, height_key, position.height.to_le_bytes());
        }
        None => {
            batch.delete(Column::Meta, hash_key);
            batch.delete(Column::Meta, height_key);
        }
    }
}

pub fn read_batch_counter<S: KeyValueStore + ?Sized>(store: &S) -> Result<u64, ScanError> {
    let Some(bytes) = store.get(Column::Meta, META_SCAN_BATCH_COUNTER)? else {
        return Ok(0);
    };
    let bytes: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
        ScanError::Chain(ChainError::corrupt(META_SCAN_BATCH_COUNTER, "bad batch counter"))
    })?;
    Ok(u64::from_le_bytes(bytes))
}

/// Merges the delta with stored rows and writes it together with the new
/// scan position. Returns the batch counter that was written.
pub fn commit_batch<S: KeyValueStore + ?Sized>(
    store: &S,
    delta: &BatchDelta,
    top: ChainPosition,
) -> Result<u64, ScanError> {
    let started = Instant::now();
    let mut batch = WriteBatch::with_capacity(
        2 * delta.histories.len() + delta.hints.len() + delta.txouts.len() + delta.spent.len() + 3,
    );

    let mut rows: Vec<_> = delta.histories.iter().collect();
    rows.sort_by(|a, b| a.0.cmp(b.0));
    let mut dirty = BTreeSet::new();
    for (key, history) in rows {
        if dirty.insert(&key.scraddr) {
            mark_dirty(&mut batch, &key.scraddr);
        }
        let row_key = key.row_key();
        let merged = match store.get(Column::Subhistory, &row_key)? {
            Some(bytes) => {
                let mut stored = SubHistory::decode(&bytes).ok_or_else(|| {
                    ScanError::Chain(ChainError::corrupt(&row_key, "bad subhistory row"))
                })?;
                stored.merge(history);
                stored
            }
            None => history.clone(),
        };
        batch.put(Column::Subhistory, row_key, merged.encode());
    }
    for (txid, key) in &delta.hints {
        batch.put(Column::TxHints, tx_hint_key(txid, *key), [0u8; 0]);
    }
    for (key, scraddr, value) in &delta.txouts {
        batch.put(Column::TxOut, key.to_bytes(), encode_txout_record(scraddr, *value));
    }
    for (spent, spender) in &delta.spent {
        batch.put(Column::Spentness, spent.to_bytes(), spender.to_bytes());
    }

    let counter = read_batch_counter(store)? + 1;
    write_position(
        &mut batch,
        META_SCAN_TOP_HASH,
        META_SCAN_TOP_HEIGHT,
        Some(top),
    );
    batch.put(Column::Meta, META_SCAN_BATCH_COUNTER, counter.to_le_bytes());

    let ops = batch.len();
    store.write_batch(&batch)?;
    let elapsed = started.elapsed();
    if elapsed >= SLOW_COMMIT {
        chainscan_log::log_info!(
            "slow scan commit: {} ops up to height {} took {}ms",
            ops,
            top.height,
            elapsed.as_millis()
        );
    } else {
        chainscan_log::log_debug!(
            "committed scan batch {} ({} rows, {} ops) up to height {}",
            counter,
            delta.histories.len(),
            ops,
            top.height
        );
    }
    Ok(counter)
}
