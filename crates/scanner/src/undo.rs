//! Removing history written for blocks that left the main branch.

use std::collections::{BTreeSet, HashMap};

use chainscan_chainstate::keys::tx_hint_key;
use chainscan_chainstate::resolver::decode_txout_record;
use chainscan_chainstate::{BlockSource, ChainError, HeaderGraph, HeaderId, OutpointResolver, TxKey};
use chainscan_primitives::{hash256_to_hex, Block, Hash256};
use chainscan_storage::{Column, KeyValueStore, WriteBatch};

use crate::commit::{
    read_position, write_position, ChainPosition, META_SCAN_TOP_HASH, META_SCAN_TOP_HEIGHT,
};
use crate::error::ScanError;
use crate::history::HistoryKey;
use crate::summary::mark_dirty;

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct UndoReport {
    pub blocks: usize,
    pub rows: usize,
    /// Scan position after the undo.
    pub top: Option<ChainPosition>,
}

/// Stale headers from the scanned top down to (excluding) the first
/// main-branch ancestor, highest first.
fn stale_scanned(graph: &HeaderGraph, top: &Hash256) -> (Vec<HeaderId>, Option<HeaderId>) {
    let mut stale = Vec::new();
    let mut cursor = graph.id_of(top);
    while let Some(id) = cursor {
        let Some(node) = graph.get(id) else {
            break;
        };
        if node.is_main_branch {
            return (stale, Some(id));
        }
        stale.push(id);
        cursor = node.parent;
    }
    (stale, None)
}

pub fn undo_stale_blocks<S: KeyValueStore + ?Sized>(
    store: &S,
    graph: &HeaderGraph,
    source: &dyn BlockSource,
    resolver: &dyn OutpointResolver,
) -> Result<UndoReport, ScanError> {
    let Some(position) = read_position(store, META_SCAN_TOP_HASH, META_SCAN_TOP_HEIGHT)? else {
        return Ok(UndoReport::default());
    };
    let (stale, branch) = stale_scanned(graph, &position.hash);
    if stale.is_empty() {
        return Ok(UndoReport {
            top: Some(position),
            ..UndoReport::default()
        });
    }

    let mut blocks = Vec::with_capacity(stale.len());
    let mut local_txs: HashMap<Hash256, TxKey> = HashMap::new();
    for id in &stale {
        let node = graph
            .get(*id)
            .ok_or(ScanError::Chain(ChainError::UnknownHeader(position.hash)))?;
        let (Some(height), Some(key)) = (node.height, node.block_key()) else {
            continue;
        };
        let raw = source.get_block(height, &node.hash)?;
        let block = Block::consensus_decode(&raw).map_err(|err| ScanError::Malformed {
            height,
            reason: err.to_string(),
        })?;
        for (tx_idx, tx) in block.transactions.iter().enumerate() {
            local_txs.insert(tx.txid(), TxKey::confirmed(key, tx_idx as u16));
        }
        blocks.push((key, block));
    }

    let mut batch = WriteBatch::new();
    let mut rows = BTreeSet::new();
    let mut dirty = BTreeSet::new();
    for (key, block) in &blocks {
        for (tx_idx, tx) in block.transactions.iter().enumerate() {
            let tx_key = TxKey::confirmed(*key, tx_idx as u16);
            batch.delete(Column::TxHints, tx_hint_key(&tx.txid(), tx_key));
            for index in 0..tx.vout.len().min(usize::from(u16::MAX) + 1) {
                let io = tx_key.output(index as u16).to_bytes();
                if let Some(record) = store.get(Column::TxOut, &io)? {
                    if let Some((scraddr, _)) = decode_txout_record(&record) {
                        rows.insert(HistoryKey::new(scraddr.clone(), *key).row_key());
                        dirty.insert(scraddr);
                    }
                }
                batch.delete(Column::TxOut, io);
            }
            if tx.is_coinbase() {
                continue;
            }
            for input in &tx.vin {
                let Ok(index) = u16::try_from(input.prevout.index) else {
                    continue;
                };
                let funding = match local_txs.get(&input.prevout.hash) {
                    Some(tx_key) => Some(*tx_key),
                    None => resolver.resolve_tx(&input.prevout.hash)?,
                };
                let Some(funding) = funding else {
                    continue;
                };
                let spent = funding.output(index).to_bytes();
                if let Some(record) = store.get(Column::TxOut, &spent)? {
                    if let Some((scraddr, _)) = decode_txout_record(&record) {
                        rows.insert(HistoryKey::new(scraddr.clone(), *key).row_key());
                        dirty.insert(scraddr);
                    }
                }
                batch.delete(Column::Spentness, spent);
            }
        }
    }
    let row_count = rows.len();
    for row in rows {
        batch.delete(Column::Subhistory, row);
    }
    for scraddr in &dirty {
        mark_dirty(&mut batch, scraddr);
    }

    let top = branch.and_then(|id| {
        let node = graph.get(id)?;
        Some(ChainPosition {
            hash: node.hash,
            height: node.height?,
        })
    });
    write_position(&mut batch, META_SCAN_TOP_HASH, META_SCAN_TOP_HEIGHT, top);
    store.write_batch(&batch)?;

    chainscan_log::log_warn!(
        "undid {} scanned blocks above {} ({} history rows removed)",
        blocks.len(),
        top.map(|position| hash256_to_hex(&position.hash))
            .unwrap_or_else(|| "genesis".to_string()),
        row_count
    );
    Ok(UndoReport {
        blocks: blocks.len(),
        rows: row_count,
        top,
    })
}
