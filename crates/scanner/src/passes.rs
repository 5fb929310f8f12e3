//! The two per-batch passes.
//!
//! The output pass records every funding txio plus the tx hints and txout
//! records. Previous outputs are then looked up (same batch first, then
//! batches still waiting to be written, then storage), and the input pass
//! records the spending halves. Each worker fills its own maps; the partial
//! results are merged once a pass completes.

use std::collections::HashMap;

use chainscan_chainstate::{ConfirmedOutput, IoKey, OutpointResolver, TxKey};
use chainscan_primitives::{Hash256, OutPoint, ScrAddr, Transaction};
use rayon::prelude::*;

use crate::batch::{ScanBatch, ScannedBlock};
use crate::error::ScanError;
use crate::history::{HistoryKey, SubHistory, TxIoEntry};

pub type OutputTable = HashMap<OutPoint, ConfirmedOutput>;

/// Everything one batch adds to storage.
#[derive(Debug, Default)]
pub struct BatchDelta {
    pub histories: HashMap<HistoryKey, SubHistory>,
    pub hints: Vec<(Hash256, TxKey)>,
    pub txouts: Vec<(IoKey, ScrAddr, i64)>,
    /// Spent output key and the input that spent it.
    pub spent: Vec<(IoKey, IoKey)>,
}

impl BatchDelta {
    fn add_entry(&mut self, key: HistoryKey, entry: TxIoEntry) {
        self.histories.entry(key).or_default().insert(entry);
    }

    pub fn merge(mut self, other: BatchDelta) -> BatchDelta {
        for (key, history) in other.histories {
            match self.histories.get_mut(&key) {
                Some(existing) => existing.merge(&history),
                None => {
                    self.histories.insert(key, history);
                }
            }
        }
        self.hints.extend(other.hints);
        self.txouts.extend(other.txouts);
        self.spent.extend(other.spent);
        self
    }
}

#[derive(Default)]
struct OutputPassResult {
    delta: BatchDelta,
    created: OutputTable,
}

fn tx_items(batch: &ScanBatch) -> Vec<(usize, usize)> {
    batch
        .blocks
        .iter()
        .enumerate()
        .flat_map(|(block_idx, block)| {
            (0..block.block.transactions.len()).map(move |tx_idx| (block_idx, tx_idx))
        })
        .collect()
}

fn chunk_size(items: usize, threads: usize) -> usize {
    (items / threads.max(1).saturating_mul(4)).max(1)
}

fn tx_key(block: &ScannedBlock, tx_idx: usize) -> TxKey {
    TxKey::confirmed(block.key, tx_idx as u16)
}

pub fn output_pass(batch: &ScanBatch, threads: usize) -> (BatchDelta, OutputTable) {
    let items = tx_items(batch);
    let result = items
        .par_chunks(chunk_size(items.len(), threads))
        .map(|chunk| {
            let mut partial = OutputPassResult::default();
            for (block_idx, tx_idx) in chunk {
                let block = &batch.blocks[*block_idx];
                let tx = &block.block.transactions[*tx_idx];
                index_outputs(block, *tx_idx, tx, &mut partial);
            }
            partial
        })
        .reduce(OutputPassResult::default, |mut left, right| {
            left.delta = left.delta.merge(right.delta);
            left.created.extend(right.created);
            left
        });
    (result.delta, result.created)
}

fn index_outputs(block: &ScannedBlock, tx_idx: usize, tx: &Transaction, out: &mut OutputPassResult) {
    let key = tx_key(block, tx_idx);
    let txid = block.txids[tx_idx];
    let coinbase = tx.is_coinbase();
    out.delta.hints.push((txid, key));
    for (index, output) in tx.vout.iter().enumerate() {
        let Ok(index) = u16::try_from(index) else {
            chainscan_log::log_warn!(
                "block {} tx {} has more outputs than the key space; truncating",
                block.height,
                tx_idx
            );
            break;
        };
        let io = key.output(index);
        let scraddr = ScrAddr::from_script(&output.script_pubkey);
        out.delta.add_entry(
            HistoryKey::new(scraddr.clone(), block.key),
            TxIoEntry::funding(io, output.value, coinbase),
        );
        out.delta.txouts.push((io, scraddr.clone(), output.value));
        out.created.insert(
            OutPoint::new(txid, u32::from(index)),
            ConfirmedOutput {
                key: io,
                scraddr,
                value: output.value,
            },
        );
    }
}

/// Resolves every outpoint the batch spends.
pub fn lookup_prevouts(
    batch: &ScanBatch,
    created: &OutputTable,
    inflight: &OutputTable,
    resolver: &dyn OutpointResolver,
) -> Result<OutputTable, ScanError> {
    let outpoints: Vec<OutPoint> = batch
        .blocks
        .iter()
        .flat_map(|block| block.block.transactions.iter())
        .filter(|tx| !tx.is_coinbase())
        .flat_map(|tx| tx.vin.iter().map(|input| input.prevout.clone()))
        .collect();
    outpoints
        .into_par_iter()
        .filter_map(|outpoint| {
            if let Some(found) = created.get(&outpoint).or_else(|| inflight.get(&outpoint)) {
                return Some(Ok((outpoint, found.clone())));
            }
            match resolver.confirmed_output(&outpoint) {
                Ok(Some(found)) => Some(Ok((outpoint, found))),
                Ok(None) => None,
                Err(err) => Some(Err(ScanError::from(err))),
            }
        })
        .collect()
}

pub fn input_pass(batch: &ScanBatch, prevouts: &OutputTable, threads: usize) -> BatchDelta {
    let items = tx_items(batch);
    items
        .par_chunks(chunk_size(items.len(), threads))
        .map(|chunk| {
            let mut delta = BatchDelta::default();
            for (block_idx, tx_idx) in chunk {
                let block = &batch.blocks[*block_idx];
                let tx = &block.block.transactions[*tx_idx];
                if tx.is_coinbase() {
                    continue;
                }
                index_inputs(block, *tx_idx, tx, prevouts, &mut delta);
            }
            delta
        })
        .reduce(BatchDelta::default, BatchDelta::merge)
}

fn index_inputs(
    block: &ScannedBlock,
    tx_idx: usize,
    tx: &Transaction,
    prevouts: &OutputTable,
    delta: &mut BatchDelta,
) {
    let key = tx_key(block, tx_idx);
    for (index, input) in tx.vin.iter().enumerate() {
        let Ok(index) = u16::try_from(index) else {
            break;
        };
        let Some(prev) = prevouts.get(&input.prevout) else {
            chainscan_log::log_debug!(
                "block {} tx {} input {}: previous output {} not indexed",
                block.height,
                tx_idx,
                index,
                input.prevout
            );
            continue;
        };
        let spender = key.output(index);
        delta.add_entry(
            HistoryKey::new(prev.scraddr.clone(), block.key),
            TxIoEntry::spending(prev.key, prev.value, spender, false),
        );
        delta.spent.push((prev.key, spender));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::BatchPlanner;
    use chainscan_chainstate::{BlockKey, ChainError};
    use chainscan_primitives::{merkle_root, Block, BlockHeader, TxIn, TxOut};

    struct NoStorage;

    impl OutpointResolver for NoStorage {
        fn resolve_tx(&self, _txid: &Hash256) -> Result<Option<TxKey>, ChainError> {
            Ok(None)
        }

        fn confirmed_output(&self, _outpoint: &OutPoint) -> Result<Option<ConfirmedOutput>, ChainError> {
            Ok(None)
        }

        fn spender(&self, _key: &IoKey) -> Result<Option<IoKey>, ChainError> {
            Ok(None)
        }
    }

    fn p2pkh(tag: u8) -> Vec<u8> {
        let mut script = vec![0x76, 0xa9, 0x14];
        script.extend_from_slice(&[tag; 20]);
        script.extend_from_slice(&[0x88, 0xac]);
        script
    }

    fn scanned(height: u32, transactions: Vec<Transaction>) -> ScannedBlock {
        let txids: Vec<Hash256> = transactions.iter().map(Transaction::txid).collect();
        let header = BlockHeader {
            version: 1,
            prev_block: [height as u8; 32],
            merkle_root: merkle_root(&txids),
            time: height,
            bits: 0x207f_ffff,
            nonce: height,
        };
        ScannedBlock {
            height,
            key: BlockKey::new(height, 0),
            hash: header.hash(),
            block: Block {
                header,
                transactions,
            },
            txids,
            size: 250,
        }
    }

    fn coinbase(height: u32, tag: u8) -> Transaction {
        Transaction {
            version: 1,
            vin: vec![TxIn::new(OutPoint::null(), height.to_le_bytes().to_vec(), u32::MAX)],
            vout: vec![TxOut {
                value: 5_000,
                script_pubkey: p2pkh(tag),
            }],
            lock_time: 0,
        }
    }

    #[test]
    fn same_batch_spends_resolve_through_the_side_table() {
        let cb = coinbase(0, 1);
        let spend = Transaction {
            version: 1,
            vin: vec![TxIn::new(OutPoint::new(cb.txid(), 0), vec![], u32::MAX)],
            vout: vec![TxOut {
                value: 4_900,
                script_pubkey: p2pkh(2),
            }],
            lock_time: 0,
        };
        let mut planner = BatchPlanner::new(1 << 20);
        planner.push(scanned(0, vec![cb.clone()]));
        planner.push(scanned(1, vec![coinbase(1, 3), spend]));
        let batch = planner.finish().expect("batch");

        let (outputs, created) = output_pass(&batch, 4);
        let prevouts = lookup_prevouts(&batch, &created, &OutputTable::new(), &NoStorage)
            .expect("lookup");
        let inputs = input_pass(&batch, &prevouts, 4);
        let delta = outputs.merge(inputs);

        assert_eq!(delta.hints.len(), 3);
        assert_eq!(delta.txouts.len(), 3);
        assert_eq!(delta.spent.len(), 1);
        let funded = TxKey::confirmed(BlockKey::new(0, 0), 0).output(0);
        let spender = TxKey::confirmed(BlockKey::new(1, 0), 1).output(0);
        assert_eq!(delta.spent[0], (funded, spender));

        let owner = ScrAddr::from_script(&p2pkh(1));
        let funding_row = &delta.histories[&HistoryKey::new(owner.clone(), BlockKey::new(0, 0))];
        assert!(!funding_row.get(&funded).expect("funding").has_txin());
        let spend_row = &delta.histories[&HistoryKey::new(owner, BlockKey::new(1, 0))];
        assert_eq!(spend_row.get(&funded).and_then(|entry| entry.input), Some(spender));
    }

    #[test]
    fn thread_count_does_not_change_the_result() {
        let blocks: Vec<ScannedBlock> = (0..6u32)
            .map(|height| {
                scanned(height, vec![coinbase(height, (height % 3) as u8), coinbase(height + 100, 9)])
            })
            .collect();
        let mut planner = BatchPlanner::new(1 << 20);
        for block in blocks {
            planner.push(block);
        }
        let batch = planner.finish().expect("batch");
        let (one, _) = output_pass(&batch, 1);
        let (many, _) = output_pass(&batch, 8);
        let mut one_keys: Vec<_> = one.histories.into_iter().collect();
        let mut many_keys: Vec<_> = many.histories.into_iter().collect();
        one_keys.sort_by(|a, b| a.0.cmp(&b.0));
        many_keys.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(one_keys, many_keys);
    }
}
