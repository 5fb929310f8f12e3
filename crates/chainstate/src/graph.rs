//! In-memory header tree and best-chain selection.
//!
//! Headers live in an arena indexed by [`HeaderId`]; every cross reference
//! (parent, next on the main chain) is an id. `add_headers` only inserts,
//! `organize` computes cumulative work, picks the top and reports reorgs.

use std::collections::HashMap;

use chainscan_primitives::{hash256_to_hex, work_from_bits, BlockHeader, Hash256};
use primitive_types::U256;

use crate::keys::{BlockKey, MAX_HEIGHT};

pub type HeaderId = u32;

const NULL_HASH: Hash256 = [0u8; 32];

/// Where a block's bytes live in the block files.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct BlockLocation {
    pub file: u32,
    pub offset: u64,
    pub size: u32,
}

#[derive(Clone, Debug)]
pub struct HeaderRecord {
    pub header: BlockHeader,
    pub location: BlockLocation,
}

impl HeaderRecord {
    pub fn new(header: BlockHeader) -> Self {
        Self {
            header,
            location: BlockLocation::default(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct HeaderNode {
    pub id: HeaderId,
    pub hash: Hash256,
    pub header: BlockHeader,
    pub location: BlockLocation,
    pub parent: Option<HeaderId>,
    /// Assigned once the ancestry reaches genesis.
    pub height: Option<u32>,
    pub dup: Option<u8>,
    pub chain_work: Option<U256>,
    pub next: Option<HeaderId>,
    pub is_main_branch: bool,
    pub is_orphan: bool,
}

impl HeaderNode {
    pub fn block_key(&self) -> Option<BlockKey> {
        Some(BlockKey::new(self.height?, self.dup?))
    }

    pub fn prev_hash(&self) -> &Hash256 {
        &self.header.prev_block
    }
}

/// Outcome of one `organize` pass.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ReorgState {
    pub prev_top: Option<HeaderId>,
    pub new_top: Option<HeaderId>,
    /// Highest header shared by the old and new best chains; set only when
    /// the new top does not descend from the previous top.
    pub branch_point: Option<HeaderId>,
    pub prev_top_still_valid: bool,
    pub has_new_top: bool,
}

impl ReorgState {
    pub fn is_reorg(&self) -> bool {
        !self.prev_top_still_valid
    }

    /// The last header both chains agree on: the branch point for a reorg,
    /// the previous top for an extension.
    pub fn common_ancestor(&self) -> Option<HeaderId> {
        if self.prev_top_still_valid {
            self.prev_top
        } else {
            self.branch_point
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct HeaderGraph {
    nodes: Vec<HeaderNode>,
    by_hash: HashMap<Hash256, HeaderId>,
    /// Main-branch header id per height.
    main_chain: Vec<HeaderId>,
    /// Dup ids handed out per height. Reaches 256 once every id is used.
    dup_counts: HashMap<u32, u16>,
    genesis: Option<HeaderId>,
    top: Option<HeaderId>,
    /// Ids inserted or resolved since the last `take_dirty`.
    dirty: Vec<HeaderId>,
}

impl HeaderGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, id: HeaderId) -> Option<&HeaderNode> {
        self.nodes.get(id as usize)
    }

    pub fn id_of(&self, hash: &Hash256) -> Option<HeaderId> {
        self.by_hash.get(hash).copied()
    }

    pub fn by_hash(&self, hash: &Hash256) -> Option<&HeaderNode> {
        self.get(self.id_of(hash)?)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &HeaderNode> {
        self.nodes.iter()
    }

    pub fn genesis(&self) -> Option<&HeaderNode> {
        self.get(self.genesis?)
    }

    pub fn top(&self) -> Option<&HeaderNode> {
        self.get(self.top?)
    }

    pub fn top_height(&self) -> Option<u32> {
        self.top()?.height
    }

    pub fn header_by_height(&self, height: u32) -> Option<&HeaderNode> {
        self.get(*self.main_chain.get(height as usize)?)
    }

    pub fn is_main_branch(&self, hash: &Hash256) -> bool {
        self.by_hash(hash).is_some_and(|node| node.is_main_branch)
    }

    /// Main-branch dup id for every height of the best chain.
    pub fn height_and_dup_map(&self) -> HashMap<u32, u8> {
        self.main_chain
            .iter()
            .enumerate()
            .filter_map(|(height, id)| Some((height as u32, self.get(*id)?.dup?)))
            .collect()
    }

    pub fn is_valid_dup(&self, height: u32, dup: u8) -> bool {
        self.header_by_height(height)
            .is_some_and(|node| node.dup == Some(dup))
    }

    pub fn is_valid_block_key(&self, key: BlockKey) -> bool {
        self.is_valid_dup(key.height, key.dup)
    }

    pub fn main_block_key(&self, height: u32) -> Option<BlockKey> {
        self.header_by_height(height)?.block_key()
    }

    /// Main-branch headers in `[start, end]`, clamped to the chain.
    pub fn main_range(&self, start: u32, end: u32) -> Vec<&HeaderNode> {
        (start..=end)
            .map_while(|height| self.header_by_height(height))
            .collect()
    }

    /// Walks back from `id` until a main-branch header is found.
    pub fn main_ancestor(&self, mut id: HeaderId) -> Option<HeaderId> {
        loop {
            let node = self.get(id)?;
            if node.is_main_branch {
                return Some(id);
            }
            id = node.parent?;
        }
    }

    pub fn add_header(&mut self, record: HeaderRecord) -> Option<HeaderId> {
        self.insert(record, None)
    }

    /// Re-inserts a persisted header keeping the dup id it was given when
    /// first organized.
    pub fn restore_header(&mut self, record: HeaderRecord, dup: Option<u8>) -> Option<HeaderId> {
        self.insert(record, dup)
    }

    fn insert(&mut self, record: HeaderRecord, dup: Option<u8>) -> Option<HeaderId> {
        let hash = record.header.hash();
        if self.by_hash.contains_key(&hash) {
            return None;
        }
        let id = self.nodes.len() as HeaderId;
        let is_genesis = record.header.prev_block == NULL_HASH;
        let parent = if is_genesis {
            None
        } else {
            self.id_of(&record.header.prev_block)
        };
        self.nodes.push(HeaderNode {
            id,
            hash,
            header: record.header,
            location: record.location,
            parent,
            height: None,
            dup,
            chain_work: None,
            next: None,
            is_main_branch: false,
            is_orphan: false,
        });
        self.by_hash.insert(hash, id);
        self.dirty.push(id);
        if is_genesis {
            if self.genesis.is_none() {
                self.genesis = Some(id);
            } else {
                chainscan_log::log_warn!(
                    "ignoring second genesis header {}",
                    hash256_to_hex(&hash)
                );
                self.nodes[id as usize].is_orphan = true;
            }
        }
        Some(id)
    }

    /// Inserts a batch of headers; already known hashes are skipped.
    pub fn add_headers<I>(&mut self, batch: I) -> Vec<HeaderId>
    where
        I: IntoIterator<Item = HeaderRecord>,
    {
        batch
            .into_iter()
            .filter_map(|record| self.add_header(record))
            .collect()
    }

    /// Headers whose persisted form changed since the last call.
    pub fn take_dirty(&mut self) -> Vec<HeaderId> {
        let mut dirty = std::mem::take(&mut self.dirty);
        dirty.sort_unstable();
        dirty.dedup();
        dirty
    }

    pub fn organize(&mut self) -> ReorgState {
        // Restored headers carry their dup; resolve them before fresh ones
        // so new dups never collide with persisted ones.
        for preset in [true, false] {
            for id in 0..self.nodes.len() as HeaderId {
                let node = &self.nodes[id as usize];
                if node.chain_work.is_none() && node.dup.is_some() == preset {
                    self.resolve_work(id);
                }
            }
        }

        let prev_top = self.top;
        let mut best = prev_top;
        let mut best_work = prev_top
            .and_then(|id| self.nodes[id as usize].chain_work)
            .unwrap_or_else(U256::zero);
        for node in &self.nodes {
            if let Some(work) = node.chain_work {
                if best.is_none() || work > best_work {
                    best = Some(node.id);
                    best_work = work;
                }
            }
        }

        let mut state = ReorgState {
            prev_top,
            new_top: best,
            branch_point: None,
            prev_top_still_valid: true,
            has_new_top: best != prev_top,
        };
        let Some(new_top) = best else {
            return state;
        };
        if !state.has_new_top {
            return state;
        }

        let branch = self.main_ancestor(new_top);
        if prev_top.is_some() && branch != prev_top {
            state.prev_top_still_valid = false;
            state.branch_point = branch;
            let new_height = self.nodes[new_top as usize].height.unwrap_or(0);
            chainscan_log::log_warn!(
                "reorg: top {} -> {} (height {}), branch point {}",
                prev_top
                    .map(|id| hash256_to_hex(&self.nodes[id as usize].hash))
                    .unwrap_or_default(),
                hash256_to_hex(&self.nodes[new_top as usize].hash),
                new_height,
                branch
                    .and_then(|id| self.nodes[id as usize].height)
                    .map(|height| height.to_string())
                    .unwrap_or_else(|| "none".to_string()),
            );
        }
        self.switch_main_chain(branch, new_top);
        self.top = Some(new_top);
        state
    }

    /// Walks back to a header with known work, then assigns work, height
    /// and dup forward. Chains that never reach genesis stay orphaned.
    fn resolve_work(&mut self, id: HeaderId) {
        let mut path = Vec::new();
        let mut cursor = id;
        let base = loop {
            let node = &self.nodes[cursor as usize];
            if node.chain_work.is_some() {
                break Some(cursor);
            }
            path.push(cursor);
            if Some(cursor) == self.genesis {
                break None;
            }
            let parent = node
                .parent
                .or_else(|| self.by_hash.get(&node.header.prev_block).copied());
            match parent {
                Some(parent) => {
                    self.nodes[cursor as usize].parent = Some(parent);
                    cursor = parent;
                }
                None => {
                    for orphan in &path {
                        self.nodes[*orphan as usize].is_orphan = true;
                    }
                    return;
                }
            }
        };

        let (mut work, mut height) = match base {
            Some(base) => {
                let node = &self.nodes[base as usize];
                (node.chain_work.unwrap_or_else(U256::zero), node.height)
            }
            None => (U256::zero(), None),
        };
        for node_id in path.into_iter().rev() {
            let step = if Some(node_id) == self.genesis {
                U256::one()
            } else {
                work_from_bits(self.nodes[node_id as usize].header.bits)
            };
            work = work.saturating_add(step);
            let node_height = height.map_or(0, |parent: u32| parent + 1);
            if node_height > MAX_HEIGHT {
                self.nodes[node_id as usize].is_orphan = true;
                return;
            }
            let dup = match self.nodes[node_id as usize].dup {
                Some(dup) => {
                    let count = self.dup_counts.entry(node_height).or_insert(0);
                    *count = (*count).max(u16::from(dup) + 1);
                    dup
                }
                None => match self.next_dup(node_height) {
                    Some(dup) => dup,
                    None => {
                        chainscan_log::log_warn!(
                            "no dup id left at height {} for header {}; treating it as orphan",
                            node_height,
                            hash256_to_hex(&self.nodes[node_id as usize].hash)
                        );
                        self.nodes[node_id as usize].is_orphan = true;
                        return;
                    }
                },
            };
            self.dirty.push(node_id);
            let node = &mut self.nodes[node_id as usize];
            node.chain_work = Some(work);
            node.height = Some(node_height);
            node.dup = Some(dup);
            node.is_orphan = false;
            height = Some(node_height);
        }
    }

    fn next_dup(&mut self, height: u32) -> Option<u8> {
        let count = self.dup_counts.entry(height).or_insert(0);
        let dup = u8::try_from(*count).ok()?;
        *count += 1;
        Some(dup)
    }

    /// Demotes the main chain above `branch` and promotes the path from
    /// `branch` up to `new_top`, rebuilding height and next links.
    fn switch_main_chain(&mut self, branch: Option<HeaderId>, new_top: HeaderId) {
        let keep = branch
            .and_then(|id| self.nodes[id as usize].height)
            .map_or(0, |height| height as usize + 1);
        for id in self.main_chain.drain(keep..) {
            let node = &mut self.nodes[id as usize];
            node.is_main_branch = false;
            node.next = None;
        }

        let mut path = Vec::new();
        let mut cursor = Some(new_top);
        while let Some(id) = cursor {
            if Some(id) == branch {
                break;
            }
            path.push(id);
            cursor = self.nodes[id as usize].parent;
        }
        path.reverse();

        let mut prev = branch;
        for id in path {
            if let Some(prev) = prev {
                self.nodes[prev as usize].next = Some(id);
            }
            self.nodes[id as usize].is_main_branch = true;
            self.main_chain.push(id);
            prev = Some(id);
        }
        if let Some(top) = prev {
            self.nodes[top as usize].next = None;
        }
    }
}
