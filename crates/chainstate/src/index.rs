//! Header persistence for fast restart.
//!
//! The `Headers` column maps a block hash to the raw 80-byte header plus
//! the arena id, the dup id and the block file location. Loading replays
//! headers in id order with their stored dups, so both come back unchanged.

use std::sync::Arc;

use chainscan_primitives::encoding::{Decoder, Encoder};
use chainscan_primitives::{BlockHeader, Hash256, HEADER_SIZE};
use chainscan_storage::{Column, KeyValueStore, WriteBatch};

use crate::error::ChainError;
use crate::graph::{BlockLocation, HeaderGraph, HeaderId, HeaderNode, HeaderRecord};

const META_BEST_HEADER_KEY: &[u8] = b"best_header";
const HEADER_ENTRY_LEN: usize = HEADER_SIZE + 4 + 2 + 4 + 8 + 4;

pub struct HeaderIndex<S> {
    store: Arc<S>,
}

impl<S: KeyValueStore> HeaderIndex<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn put_header(&self, batch: &mut WriteBatch, node: &HeaderNode) {
        batch.put(Column::Headers, node.hash, encode_header_entry(node));
    }

    pub fn set_best_header(&self, batch: &mut WriteBatch, hash: &Hash256) {
        batch.put(Column::Meta, META_BEST_HEADER_KEY, *hash);
    }

    /// Writes the given headers and the current top in one batch.
    pub fn persist(&self, graph: &HeaderGraph, ids: &[HeaderId]) -> Result<(), ChainError> {
        let mut batch = WriteBatch::with_capacity(ids.len() + 1);
        for id in ids {
            if let Some(node) = graph.get(*id) {
                self.put_header(&mut batch, node);
            }
        }
        if let Some(top) = graph.top() {
            self.set_best_header(&mut batch, &top.hash);
        }
        self.store.write_batch(&batch)?;
        Ok(())
    }

    pub fn best_header(&self) -> Result<Option<Hash256>, ChainError> {
        let Some(bytes) = self.store.get(Column::Meta, META_BEST_HEADER_KEY)? else {
            return Ok(None);
        };
        let hash: Hash256 = bytes
            .as_slice()
            .try_into()
            .map_err(|_| ChainError::corrupt(META_BEST_HEADER_KEY, "bad best header hash"))?;
        Ok(Some(hash))
    }

    pub fn load_graph(&self) -> Result<HeaderGraph, ChainError> {
        let mut entries = Vec::new();
        self.store.for_each_prefix(Column::Headers, &[], &mut |key, value| {
            entries.push((key.to_vec(), value.to_vec()));
            Ok(())
        })?;
        let mut records = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            let (id, dup, record) = decode_header_entry(&value)
                .ok_or_else(|| ChainError::corrupt(&key, "bad header entry"))?;
            if record.header.hash().as_slice() != key.as_slice() {
                return Err(ChainError::corrupt(&key, "header hash does not match key"));
            }
            records.push((id, dup, record));
        }
        records.sort_by_key(|(id, _, _)| *id);

        let mut graph = HeaderGraph::new();
        for (_, dup, record) in records {
            graph.restore_header(record, dup);
        }
        graph.organize();
        graph.take_dirty();
        if let (Some(stored), Some(top)) = (self.best_header()?, graph.top()) {
            if stored != top.hash {
                chainscan_log::log_warn!(
                    "stored best header differs from organized top at height {:?}",
                    top.height
                );
            }
        }
        chainscan_log::log_info!(
            "loaded {} headers, top height {:?}",
            graph.len(),
            graph.top_height()
        );
        Ok(graph)
    }
}

fn encode_header_entry(node: &HeaderNode) -> Vec<u8> {
    let mut encoder = Encoder::with_capacity(HEADER_ENTRY_LEN);
    encoder.write_bytes(&node.header.to_bytes());
    encoder.write_u32_le(node.id);
    match node.dup {
        Some(dup) => {
            encoder.write_u8(1);
            encoder.write_u8(dup);
        }
        None => {
            encoder.write_u8(0);
            encoder.write_u8(0);
        }
    }
    encoder.write_u32_le(node.location.file);
    encoder.write_u64_le(node.location.offset);
    encoder.write_u32_le(node.location.size);
    encoder.into_inner()
}

type HeaderEntry = (HeaderId, Option<u8>, HeaderRecord);

fn decode_header_entry(bytes: &[u8]) -> Option<HeaderEntry> {
    let mut decoder = Decoder::new(bytes);
    let header = BlockHeader::from_bytes(decoder.read_slice(HEADER_SIZE).ok()?).ok()?;
    let id = decoder.read_u32_le().ok()?;
    let has_dup = decoder.read_u8().ok()?;
    let dup = decoder.read_u8().ok()?;
    let dup = match has_dup {
        0 => None,
        1 => Some(dup),
        _ => return None,
    };
    let location = BlockLocation {
        file: decoder.read_u32_le().ok()?,
        offset: decoder.read_u64_le().ok()?,
        size: decoder.read_u32_le().ok()?,
    };
    decoder.finish().ok()?;
    Some((id, dup, HeaderRecord { header, location }))
}
