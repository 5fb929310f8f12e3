//! Block header and block types.

use crate::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};
use crate::hash::{sha256d, Hash256};
use crate::transaction::{Transaction, TransactionDecodeError};

pub const HEADER_SIZE: usize = 80;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_block: Hash256,
    pub merkle_root: Hash256,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut encoder = Encoder::with_capacity(HEADER_SIZE);
        Encodable::consensus_encode(self, &mut encoder);
        let mut out = [0u8; HEADER_SIZE];
        out.copy_from_slice(&encoder.into_inner());
        out
    }

    pub fn hash(&self) -> Hash256 {
        sha256d(&self.to_bytes())
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        crate::encoding::decode(bytes)
    }
}

impl Encodable for BlockHeader {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_i32_le(self.version);
        encoder.write_hash(&self.prev_block);
        encoder.write_hash(&self.merkle_root);
        encoder.write_u32_le(self.time);
        encoder.write_u32_le(self.bits);
        encoder.write_u32_le(self.nonce);
    }
}

impl Decodable for BlockHeader {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(Self {
            version: decoder.read_i32_le()?,
            prev_block: decoder.read_hash()?,
            merkle_root: decoder.read_hash()?,
            time: decoder.read_u32_le()?,
            bits: decoder.read_u32_le()?,
            nonce: decoder.read_u32_le()?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn consensus_encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        Encodable::consensus_encode(&self.header, &mut encoder);
        encoder.write_varint(self.transactions.len() as u64);
        for tx in &self.transactions {
            encoder.write_bytes(&tx.consensus_encode());
        }
        encoder.into_inner()
    }

    pub fn consensus_decode(bytes: &[u8]) -> Result<Self, BlockDecodeError> {
        let mut decoder = Decoder::new(bytes);
        let header = <BlockHeader as Decodable>::consensus_decode(&mut decoder)?;
        let count = decoder.read_len()?;
        if count == 0 {
            return Err(BlockDecodeError::Empty);
        }
        let mut transactions = Vec::with_capacity(count.min(16_384));
        for _ in 0..count {
            transactions.push(Transaction::decode_from(&mut decoder)?);
        }
        decoder.finish()?;
        Ok(Self {
            header,
            transactions,
        })
    }

    pub fn txids(&self) -> Vec<Hash256> {
        self.transactions.iter().map(Transaction::txid).collect()
    }

    pub fn computed_merkle_root(&self) -> Hash256 {
        merkle_root(&self.txids())
    }
}

/// Bitcoin merkle root: odd levels duplicate their last node.
pub fn merkle_root(txids: &[Hash256]) -> Hash256 {
    if txids.is_empty() {
        return [0u8; 32];
    }
    let mut level: Vec<Hash256> = txids.to_vec();
    let mut pair = [0u8; 64];
    while level.len() > 1 {
        if level.len() % 2 == 1 {
            let last = level[level.len() - 1];
            level.push(last);
        }
        level = level
            .chunks_exact(2)
            .map(|nodes| {
                pair[..32].copy_from_slice(&nodes[0]);
                pair[32..].copy_from_slice(&nodes[1]);
                sha256d(&pair)
            })
            .collect();
    }
    level[0]
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockDecodeError {
    Decode(DecodeError),
    Transaction(TransactionDecodeError),
    Empty,
}

impl From<DecodeError> for BlockDecodeError {
    fn from(error: DecodeError) -> Self {
        BlockDecodeError::Decode(error)
    }
}

impl From<TransactionDecodeError> for BlockDecodeError {
    fn from(error: TransactionDecodeError) -> Self {
        BlockDecodeError::Transaction(error)
    }
}

impl std::fmt::Display for BlockDecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockDecodeError::Decode(error) => write!(f, "{error}"),
            BlockDecodeError::Transaction(error) => write!(f, "transaction: {error}"),
            BlockDecodeError::Empty => write!(f, "block has no transactions"),
        }
    }
}

impl std::error::Error for BlockDecodeError {}
