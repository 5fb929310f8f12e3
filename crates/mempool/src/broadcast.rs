//! Pushing locally created transactions to the network.

use std::sync::Arc;
use std::time::Duration;

use chainscan_chainstate::TxKey;
use chainscan_primitives::{hash256_to_hex, Hash256, Transaction};
use chainscan_storage::KeyValueStore;
use crossbeam_channel::{bounded, RecvTimeoutError};

use crate::error::MempoolError;
use crate::network::{NetworkLayer, PeerReply};
use crate::tracker::MempoolTracker;

pub const DEFAULT_BROADCAST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum BroadcastResult {
    Accepted { key: TxKey, txid: Hash256 },
    Rejected(String),
}

pub struct Broadcaster {
    network: Arc<dyn NetworkLayer>,
    timeout: Duration,
}

impl Broadcaster {
    pub fn new(network: Arc<dyn NetworkLayer>, timeout: Duration) -> Self {
        Self { network, timeout }
    }

    pub fn network(&self) -> &Arc<dyn NetworkLayer> {
        &self.network
    }

    /// Sends `raw` to peers and, once a peer accepts it, adds it to the
    /// tracker. Rejections are results, not errors; `Err` is reserved for
    /// tracker failures.
    pub fn broadcast<S: KeyValueStore + 'static>(
        &self,
        tracker: &MempoolTracker<S>,
        raw: Vec<u8>,
    ) -> Result<BroadcastResult, MempoolError> {
        let tx = match Transaction::consensus_decode(&raw) {
            Ok(tx) => tx,
            Err(err) => {
                return Ok(BroadcastResult::Rejected(format!(
                    "structurally invalid: {err}"
                )))
            }
        };
        if !self.network.is_online() {
            return Ok(BroadcastResult::Rejected(
                "node is offline, cannot broadcast".to_string(),
            ));
        }

        let txid = tx.txid();
        let (reply_tx, reply_rx) = bounded(1);
        if let Err(reason) = self.network.send_tx(txid, &raw, reply_tx) {
            return Ok(BroadcastResult::Rejected(reason));
        }
        match reply_rx.recv_timeout(self.timeout) {
            Ok(PeerReply::Accepted) => {}
            Ok(PeerReply::Rejected(reason)) => return Ok(BroadcastResult::Rejected(reason)),
            Err(RecvTimeoutError::Timeout) => {
                chainscan_log::log_warn!("broadcast of {} timed out", hash256_to_hex(&txid));
                return Ok(BroadcastResult::Rejected(
                    "tx broadcast timed out (send)".to_string(),
                ));
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Ok(BroadcastResult::Rejected(
                    "tx broadcast failed: peer went away".to_string(),
                ))
            }
        }

        let outcome = tracker.process_batch(vec![raw])?;
        if let Some((key, _)) = outcome.accepted.first() {
            return Ok(BroadcastResult::Accepted { key: *key, txid });
        }
        if let Some(key) = outcome.waiting.first() {
            return Ok(BroadcastResult::Accepted { key: *key, txid });
        }
        if let Some((_, reason)) = outcome.rejected.into_iter().next() {
            return Ok(BroadcastResult::Rejected(reason));
        }
        if let Some(existing) = tracker.pending_tx_by_hash(&txid) {
            return Ok(BroadcastResult::Accepted {
                key: existing.key,
                txid,
            });
        }
        Ok(BroadcastResult::Rejected(
            "transaction already confirmed".to_string(),
        ))
    }
}
