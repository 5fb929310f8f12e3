//! Folding subhistory rows into per-address summaries.
//!
//! Commits and undos mark every address whose rows they change in the
//! `SummaryDirty` column. A refresh refolds only those addresses, so its
//! cost follows the new blocks rather than the whole history. A forced
//! refresh rebuilds every summary from the rows.

use std::collections::{BTreeMap, HashMap};

use chainscan_chainstate::{ChainError, HeaderGraph};
use chainscan_primitives::ScrAddr;
use chainscan_storage::{Column, KeyValueStore, WriteBatch};

use crate::commit::{
    read_position, write_position, META_SCAN_TOP_HASH, META_SCAN_TOP_HEIGHT,
    META_SUMMARY_TOP_HASH, META_SUMMARY_TOP_HEIGHT,
};
use crate::error::ScanError;
use crate::history::{AddressSummary, BucketSummary, HistoryKey, SubHistory};

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SummaryReport {
    pub from_height: u32,
    pub addresses: usize,
    pub top_height: Option<u32>,
}

/// Queues `scraddr` for the next summary refresh.
pub fn mark_dirty(batch: &mut WriteBatch, scraddr: &ScrAddr) {
    batch.put(Column::SummaryDirty, scraddr.as_bytes(), [0u8; 0]);
}

/// First height whose buckets must be recomputed.
fn refresh_from<S: KeyValueStore + ?Sized>(
    store: &S,
    graph: &HeaderGraph,
    force: bool,
) -> Result<u32, ScanError> {
    if force {
        return Ok(0);
    }
    let Some(position) = read_position(store, META_SUMMARY_TOP_HASH, META_SUMMARY_TOP_HEIGHT)?
    else {
        return Ok(0);
    };
    Ok(graph
        .id_of(&position.hash)
        .and_then(|id| graph.main_ancestor(id))
        .and_then(|id| graph.get(id)?.height)
        .map_or(0, |height| height + 1))
}

pub fn update_summary<S: KeyValueStore + ?Sized>(
    store: &S,
    graph: &HeaderGraph,
    force: bool,
) -> Result<SummaryReport, ScanError> {
    let from = refresh_from(store, graph, force)?;
    let mut dirty = Vec::new();
    store.for_each_prefix(Column::SummaryDirty, &[], &mut |key, _| {
        dirty.push(key.to_vec());
        Ok(())
    })?;

    let mut batch = WriteBatch::new();
    let addresses = if force {
        rebuild_all(store, graph, &mut batch)?
    } else {
        refold_dirty(store, graph, &dirty, &mut batch)?
    };
    for key in dirty {
        batch.delete(Column::SummaryDirty, key);
    }

    let top = read_position(store, META_SCAN_TOP_HASH, META_SCAN_TOP_HEIGHT)?;
    write_position(&mut batch, META_SUMMARY_TOP_HASH, META_SUMMARY_TOP_HEIGHT, top);
    store.write_batch(&batch)?;

    chainscan_log::log_info!(
        "summary refresh from height {}: {} addresses updated",
        from,
        addresses
    );
    Ok(SummaryReport {
        from_height: from,
        addresses,
        top_height: top.map(|position| position.height),
    })
}

fn refold_dirty<S: KeyValueStore + ?Sized>(
    store: &S,
    graph: &HeaderGraph,
    dirty: &[Vec<u8>],
    batch: &mut WriteBatch,
) -> Result<usize, ScanError> {
    let mut addresses = 0;
    for key in dirty {
        let scraddr = ScrAddr::from_bytes(key)
            .ok_or_else(|| ScanError::Chain(ChainError::corrupt(key, "bad dirty summary key")))?;
        let summary = fold_address(store, graph, &scraddr)?;
        let stored = match store.get(Column::Summary, key)? {
            Some(value) => Some(AddressSummary::decode(&value).ok_or_else(|| {
                ScanError::Chain(ChainError::corrupt(key, "bad address summary"))
            })?),
            None => None,
        };
        if summary.buckets.is_empty() {
            if stored.is_some() {
                addresses += 1;
                batch.delete(Column::Summary, key.as_slice());
            }
        } else if stored.as_ref() != Some(&summary) {
            addresses += 1;
            batch.put(Column::Summary, key.as_slice(), summary.encode());
        }
    }
    Ok(addresses)
}

fn rebuild_all<S: KeyValueStore + ?Sized>(
    store: &S,
    graph: &HeaderGraph,
    batch: &mut WriteBatch,
) -> Result<usize, ScanError> {
    let mut fresh: HashMap<ScrAddr, BTreeMap<u32, BucketSummary>> = HashMap::new();
    let mut corrupt: Option<Vec<u8>> = None;
    store.for_each_prefix(Column::Subhistory, &[], &mut |key, value| {
        if corrupt.is_some() {
            return Ok(());
        }
        let Some(history_key) = HistoryKey::from_row_key(key) else {
            corrupt = Some(key.to_vec());
            return Ok(());
        };
        let block = history_key.block;
        if !graph.is_valid_block_key(block) {
            return Ok(());
        }
        let Some(history) = SubHistory::decode(value) else {
            corrupt = Some(key.to_vec());
            return Ok(());
        };
        fresh
            .entry(history_key.scraddr)
            .or_default()
            .insert(block.height, history.fold(block));
        Ok(())
    })?;
    if let Some(key) = corrupt {
        return Err(ScanError::Chain(ChainError::corrupt(&key, "bad subhistory row")));
    }

    let mut stored_addresses = Vec::new();
    store.for_each_prefix(Column::Summary, &[], &mut |key, value| {
        stored_addresses.push((key.to_vec(), value.to_vec()));
        Ok(())
    })?;

    let mut addresses = 0;
    for (key, value) in stored_addresses {
        let before = AddressSummary::decode(&value)
            .ok_or_else(|| ScanError::Chain(ChainError::corrupt(&key, "bad address summary")))?;
        let scraddr = ScrAddr::from_bytes(&key)
            .ok_or_else(|| ScanError::Chain(ChainError::corrupt(&key, "bad summary key")))?;
        let mut summary = AddressSummary::default();
        if let Some(buckets) = fresh.remove(&scraddr) {
            for (height, bucket) in buckets {
                summary.set_bucket(height, bucket);
            }
            summary.refold();
        }
        if summary == before {
            continue;
        }
        addresses += 1;
        if summary.buckets.is_empty() {
            batch.delete(Column::Summary, key);
        } else {
            batch.put(Column::Summary, key, summary.encode());
        }
    }
    for (scraddr, buckets) in fresh {
        let mut summary = AddressSummary::default();
        for (height, bucket) in buckets {
            summary.set_bucket(height, bucket);
        }
        summary.refold();
        addresses += 1;
        batch.put(Column::Summary, scraddr.as_bytes(), summary.encode());
    }
    Ok(addresses)
}

/// Summary recomputed straight from the stored rows, without touching the
/// `Summary` column.
pub fn fold_address<S: KeyValueStore + ?Sized>(
    store: &S,
    graph: &HeaderGraph,
    scraddr: &ScrAddr,
) -> Result<AddressSummary, ScanError> {
    let mut summary = AddressSummary::default();
    let mut corrupt = None;
    store.for_each_prefix(Column::Subhistory, scraddr.as_bytes(), &mut |key, value| {
        let Some(history_key) = HistoryKey::from_row_key(key) else {
            corrupt = Some(key.to_vec());
            return Ok(());
        };
        if &history_key.scraddr != scraddr || !graph.is_valid_block_key(history_key.block) {
            return Ok(());
        }
        match SubHistory::decode(value) {
            Some(history) => {
                summary.set_bucket(history_key.block.height, history.fold(history_key.block));
            }
            None => corrupt = Some(key.to_vec()),
        }
        Ok(())
    })?;
    if let Some(key) = corrupt {
        return Err(ScanError::Chain(ChainError::corrupt(&key, "bad subhistory row")));
    }
    summary.refold();
    Ok(summary)
}
