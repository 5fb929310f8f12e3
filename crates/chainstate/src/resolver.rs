//! Outpoint resolution against confirmed storage.
//!
//! Stored rows are only trusted when their block key is the main-branch
//! dup for that height; rows left behind by a reorged block are skipped.

use std::sync::Arc;

use chainscan_primitives::{Hash256, OutPoint, ScrAddr};
use chainscan_storage::{Column, KeyValueStore};

use crate::error::ChainError;
use crate::keys::{IoKey, TxKey, TX_HINT_KEY_LEN};
use crate::shared::SharedHeaderGraph;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConfirmedOutput {
    pub key: IoKey,
    pub scraddr: ScrAddr,
    pub value: i64,
}

pub trait OutpointResolver: Send + Sync {
    /// Main-branch location of `txid`.
    fn resolve_tx(&self, txid: &Hash256) -> Result<Option<TxKey>, ChainError>;
    fn confirmed_output(&self, outpoint: &OutPoint) -> Result<Option<ConfirmedOutput>, ChainError>;
    /// Main-branch input that spent the confirmed output `key`.
    fn spender(&self, key: &IoKey) -> Result<Option<IoKey>, ChainError>;
}

/// `TxOut` column value: scraddr followed by the value (i64 LE).
pub fn encode_txout_record(scraddr: &ScrAddr, value: i64) -> Vec<u8> {
    let mut out = Vec::with_capacity(scraddr.as_bytes().len() + 8);
    out.extend_from_slice(scraddr.as_bytes());
    out.extend_from_slice(&value.to_le_bytes());
    out
}

pub fn decode_txout_record(bytes: &[u8]) -> Option<(ScrAddr, i64)> {
    let (scraddr, rest) = ScrAddr::split_prefix(bytes)?;
    let value: [u8; 8] = rest.try_into().ok()?;
    Some((scraddr, i64::from_le_bytes(value)))
}

pub struct StoreResolver<S> {
    store: Arc<S>,
    graph: Arc<SharedHeaderGraph>,
}

impl<S: KeyValueStore> StoreResolver<S> {
    pub fn new(store: Arc<S>, graph: Arc<SharedHeaderGraph>) -> Self {
        Self { store, graph }
    }

    fn is_main(&self, key: &TxKey) -> bool {
        key.block()
            .is_some_and(|block| self.graph.snapshot().is_valid_block_key(block))
    }
}

impl<S: KeyValueStore> OutpointResolver for StoreResolver<S> {
    fn resolve_tx(&self, txid: &Hash256) -> Result<Option<TxKey>, ChainError> {
        let graph = self.graph.snapshot();
        let mut found = None;
        self.store
            .for_each_prefix(Column::TxHints, txid, &mut |key, _| {
                if found.is_some() || key.len() != TX_HINT_KEY_LEN {
                    return Ok(());
                }
                if let Some(tx_key) = TxKey::from_slice(&key[32..]) {
                    if tx_key
                        .block()
                        .is_some_and(|block| graph.is_valid_block_key(block))
                    {
                        found = Some(tx_key);
                    }
                }
                Ok(())
            })?;
        Ok(found)
    }

    fn confirmed_output(&self, outpoint: &OutPoint) -> Result<Option<ConfirmedOutput>, ChainError> {
        let Ok(index) = u16::try_from(outpoint.index) else {
            return Ok(None);
        };
        let Some(tx_key) = self.resolve_tx(&outpoint.hash)? else {
            return Ok(None);
        };
        let key = tx_key.output(index);
        let raw_key = key.to_bytes();
        let Some(bytes) = self.store.get(Column::TxOut, &raw_key)? else {
            return Ok(None);
        };
        let (scraddr, value) = decode_txout_record(&bytes)
            .ok_or_else(|| ChainError::corrupt(&raw_key, "bad txout record"))?;
        Ok(Some(ConfirmedOutput {
            key,
            scraddr,
            value,
        }))
    }

    fn spender(&self, key: &IoKey) -> Result<Option<IoKey>, ChainError> {
        let raw_key = key.to_bytes();
        let Some(bytes) = self.store.get(Column::Spentness, &raw_key)? else {
            return Ok(None);
        };
        let spender = IoKey::from_slice(&bytes)
            .ok_or_else(|| ChainError::corrupt(&raw_key, "bad spentness record"))?;
        Ok(self.is_main(&spender.tx).then_some(spender))
    }
}
