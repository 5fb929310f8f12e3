//! Block loading and byte-budgeted batch planning.

use chainscan_chainstate::{BlockKey, BlockSource, HeaderNode};
use chainscan_primitives::{merkle_root, Block, Hash256};

use crate::error::ScanError;

/// A decoded, validated block ready for the passes.
#[derive(Clone, Debug)]
pub struct ScannedBlock {
    pub height: u32,
    pub key: BlockKey,
    pub hash: Hash256,
    pub block: Block,
    pub txids: Vec<Hash256>,
    pub size: usize,
}

#[derive(Clone, Debug, Default)]
pub struct ScanBatch {
    pub sequence: u64,
    pub blocks: Vec<ScannedBlock>,
    pub bytes: usize,
}

impl ScanBatch {
    pub fn first_height(&self) -> Option<u32> {
        self.blocks.first().map(|block| block.height)
    }

    pub fn last(&self) -> Option<&ScannedBlock> {
        self.blocks.last()
    }

    pub fn tx_count(&self) -> usize {
        self.blocks.iter().map(|block| block.block.transactions.len()).sum()
    }
}

/// Groups consecutive blocks until their decoded size reaches the budget.
/// A block larger than the budget gets a batch of its own.
#[derive(Clone, Debug)]
pub struct BatchPlanner {
    budget: usize,
    current: ScanBatch,
    next_sequence: u64,
}

impl BatchPlanner {
    pub fn new(budget: usize) -> Self {
        Self {
            budget: budget.max(1),
            current: ScanBatch::default(),
            next_sequence: 0,
        }
    }

    /// Adds a block, returning the batch it closed, if any.
    pub fn push(&mut self, block: ScannedBlock) -> Option<ScanBatch> {
        let closed = if !self.current.blocks.is_empty()
            && self.current.bytes + block.size > self.budget
        {
            self.take()
        } else {
            None
        };
        self.current.bytes += block.size;
        self.current.blocks.push(block);
        closed
    }

    /// Closes the batch in progress.
    pub fn finish(&mut self) -> Option<ScanBatch> {
        self.take()
    }

    fn take(&mut self) -> Option<ScanBatch> {
        if self.current.blocks.is_empty() {
            return None;
        }
        let mut batch = std::mem::take(&mut self.current);
        batch.sequence = self.next_sequence;
        self.next_sequence += 1;
        Some(batch)
    }
}

/// Fetches and validates the main-branch block for `node`.
pub fn load_block(source: &dyn BlockSource, node: &HeaderNode) -> Result<ScannedBlock, ScanError> {
    let (height, key) = match (node.height, node.block_key()) {
        (Some(height), Some(key)) => (height, key),
        _ => {
            return Err(ScanError::Malformed {
                height: 0,
                reason: "header has no height".to_string(),
            })
        }
    };
    let raw = source.get_block(height, &node.hash)?;
    let block = Block::consensus_decode(&raw).map_err(|err| ScanError::Malformed {
        height,
        reason: err.to_string(),
    })?;
    if block.header.hash() != node.hash {
        return Err(ScanError::Malformed {
            height,
            reason: "block header does not match the chain".to_string(),
        });
    }
    let txids = block.txids();
    if merkle_root(&txids) != block.header.merkle_root {
        return Err(ScanError::MerkleMismatch { height });
    }
    if txids.len() > usize::from(u16::MAX) {
        return Err(ScanError::Malformed {
            height,
            reason: format!("{} transactions exceed the key space", txids.len()),
        });
    }
    Ok(ScannedBlock {
        height,
        key,
        hash: node.hash,
        block,
        txids,
        size: raw.len(),
    })
}
