//! Pull interface for raw block bytes.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use chainscan_primitives::{hash256_to_hex, BlockHeader, Hash256, HEADER_SIZE};

#[derive(Debug)]
pub enum SourceError {
    Missing { height: u32, hash: Hash256 },
    Io(String),
}

impl std::fmt::Display for SourceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceError::Missing { height, hash } => write!(
                f,
                "block {} at height {height} not available",
                hash256_to_hex(hash)
            ),
            SourceError::Io(message) => write!(f, "block source: {message}"),
        }
    }
}

impl std::error::Error for SourceError {}

impl From<std::io::Error> for SourceError {
    fn from(err: std::io::Error) -> Self {
        SourceError::Io(err.to_string())
    }
}

pub trait BlockSource: Send + Sync {
    /// Raw serialized block for the main-branch header `hash` at `height`.
    fn get_block(&self, height: u32, hash: &Hash256) -> Result<Vec<u8>, SourceError>;
}

impl<T: BlockSource + ?Sized> BlockSource for std::sync::Arc<T> {
    fn get_block(&self, height: u32, hash: &Hash256) -> Result<Vec<u8>, SourceError> {
        self.as_ref().get_block(height, hash)
    }
}

/// Blocks held in memory, keyed by header hash.
#[derive(Default)]
pub struct MemoryBlockSource {
    blocks: RwLock<HashMap<Hash256, Vec<u8>>>,
}

impl MemoryBlockSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a serialized block and returns its header hash.
    pub fn insert(&self, raw: Vec<u8>) -> Option<Hash256> {
        let header = BlockHeader::from_bytes(raw.get(..HEADER_SIZE)?).ok()?;
        let hash = header.hash();
        self.blocks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(hash, raw);
        Some(hash)
    }

    pub fn len(&self) -> usize {
        self.blocks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BlockSource for MemoryBlockSource {
    fn get_block(&self, height: u32, hash: &Hash256) -> Result<Vec<u8>, SourceError> {
        self.blocks
            .read()
            .map_err(|_| SourceError::Io("block map lock poisoned".to_string()))?
            .get(hash)
            .cloned()
            .ok_or(SourceError::Missing {
                height,
                hash: *hash,
            })
    }
}
