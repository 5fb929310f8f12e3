//! Database key layouts for confirmed and pending transaction data.
//!
//! Confirmed keys start with a 4-byte big-endian "hgtx" (`height << 8 | dup`)
//! so rows sort by height. Pending keys reuse the same shape behind the
//! reserved `0xFFFF` prefix, which keeps both kinds in one 8-byte key space.

use std::fmt;

use chainscan_primitives::Hash256;

pub const HGTX_LEN: usize = 4;
pub const TX_KEY_LEN: usize = 6;
pub const IO_KEY_LEN: usize = 8;
pub const TX_HINT_KEY_LEN: usize = 32 + TX_KEY_LEN;

pub const PENDING_PREFIX: [u8; 2] = [0xff, 0xff];
/// Heights at or above this value would collide with the pending prefix.
pub const MAX_HEIGHT: u32 = 0x00ff_ff00 - 1;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct BlockKey {
    pub height: u32,
    pub dup: u8,
}

impl BlockKey {
    pub fn new(height: u32, dup: u8) -> Self {
        Self { height, dup }
    }

    pub fn hgtx(self) -> [u8; HGTX_LEN] {
        ((self.height << 8) | u32::from(self.dup)).to_be_bytes()
    }

    pub fn from_hgtx(bytes: [u8; HGTX_LEN]) -> Self {
        let raw = u32::from_be_bytes(bytes);
        Self {
            height: raw >> 8,
            dup: (raw & 0xff) as u8,
        }
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let hgtx: [u8; HGTX_LEN] = bytes.get(..HGTX_LEN)?.try_into().ok()?;
        if hgtx[..2] == PENDING_PREFIX {
            return None;
        }
        Some(Self::from_hgtx(hgtx))
    }
}

impl fmt::Display for BlockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.height, self.dup)
    }
}

/// Location of a transaction: a block position or a pending slot.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct TxKey([u8; TX_KEY_LEN]);

impl TxKey {
    pub fn confirmed(block: BlockKey, tx_index: u16) -> Self {
        let mut bytes = [0u8; TX_KEY_LEN];
        bytes[..HGTX_LEN].copy_from_slice(&block.hgtx());
        bytes[HGTX_LEN..].copy_from_slice(&tx_index.to_be_bytes());
        Self(bytes)
    }

    pub fn pending(id: u32) -> Self {
        let mut bytes = [0u8; TX_KEY_LEN];
        bytes[..2].copy_from_slice(&PENDING_PREFIX);
        bytes[2..].copy_from_slice(&id.to_be_bytes());
        Self(bytes)
    }

    pub fn is_pending(&self) -> bool {
        self.0[..2] == PENDING_PREFIX
    }

    pub fn block(&self) -> Option<BlockKey> {
        BlockKey::from_slice(&self.0)
    }

    pub fn tx_index(&self) -> Option<u16> {
        if self.is_pending() {
            return None;
        }
        Some(u16::from_be_bytes([self.0[4], self.0[5]]))
    }

    pub fn pending_id(&self) -> Option<u32> {
        if !self.is_pending() {
            return None;
        }
        Some(u32::from_be_bytes([self.0[2], self.0[3], self.0[4], self.0[5]]))
    }

    pub fn as_bytes(&self) -> &[u8; TX_KEY_LEN] {
        &self.0
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        Some(Self(bytes.get(..TX_KEY_LEN)?.try_into().ok()?))
    }

    pub fn output(self, index: u16) -> IoKey {
        IoKey::new(self, index)
    }
}

impl fmt::Debug for TxKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.block(), self.tx_index(), self.pending_id()) {
            (Some(block), Some(index), _) => write!(f, "TxKey({block}:{index})"),
            (_, _, Some(id)) => write!(f, "TxKey(pending {id})"),
            _ => write!(f, "TxKey({:?})", self.0),
        }
    }
}

/// A transaction input or output: tx key plus io index.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct IoKey {
    pub tx: TxKey,
    pub index: u16,
}

impl IoKey {
    pub fn new(tx: TxKey, index: u16) -> Self {
        Self { tx, index }
    }

    pub fn is_pending(&self) -> bool {
        self.tx.is_pending()
    }

    pub fn block(&self) -> Option<BlockKey> {
        self.tx.block()
    }

    pub fn to_bytes(&self) -> [u8; IO_KEY_LEN] {
        let mut bytes = [0u8; IO_KEY_LEN];
        bytes[..TX_KEY_LEN].copy_from_slice(self.tx.as_bytes());
        bytes[TX_KEY_LEN..].copy_from_slice(&self.index.to_be_bytes());
        bytes
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != IO_KEY_LEN {
            return None;
        }
        let tx = TxKey::from_slice(bytes)?;
        let index = u16::from_be_bytes([bytes[6], bytes[7]]);
        Some(Self { tx, index })
    }
}

/// `txid ++ tx key`, the row that lets a txid find its block position.
pub fn tx_hint_key(txid: &Hash256, key: TxKey) -> [u8; TX_HINT_KEY_LEN] {
    let mut out = [0u8; TX_HINT_KEY_LEN];
    out[..32].copy_from_slice(txid);
    out[32..].copy_from_slice(key.as_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hgtx_orders_by_height_then_dup() {
        let low = BlockKey::new(255, 3).hgtx();
        let high = BlockKey::new(256, 0).hgtx();
        assert!(low < high);
        assert_eq!(BlockKey::from_hgtx(high), BlockKey::new(256, 0));
        assert_eq!(BlockKey::from_hgtx(low), BlockKey::new(255, 3));
    }

    #[test]
    fn pending_and_confirmed_keys_share_a_space() {
        let confirmed = TxKey::confirmed(BlockKey::new(MAX_HEIGHT, 255), 9);
        let pending = TxKey::pending(0);
        assert!(!confirmed.is_pending());
        assert!(pending.is_pending());
        assert!(confirmed < pending);
        assert_eq!(confirmed.block(), Some(BlockKey::new(MAX_HEIGHT, 255)));
        assert_eq!(confirmed.tx_index(), Some(9));
        assert_eq!(pending.pending_id(), Some(0));
        assert_eq!(pending.block(), None);
    }

    #[test]
    fn io_key_bytes_sort_like_the_struct() {
        let tx = TxKey::confirmed(BlockKey::new(10, 0), 1);
        let a = tx.output(1);
        let b = tx.output(256);
        assert!(a < b);
        assert!(a.to_bytes() < b.to_bytes());
        assert_eq!(IoKey::from_slice(&b.to_bytes()), Some(b));
        assert_eq!(IoKey::from_slice(&b.to_bytes()[..7]), None);
    }
}
