//! The peer-to-peer side the tracker talks to.

use chainscan_primitives::Hash256;
use crossbeam_channel::Sender;

/// What a peer said about a broadcast transaction.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PeerReply {
    Accepted,
    Rejected(String),
}

pub trait NetworkLayer: Send + Sync {
    fn is_online(&self) -> bool;

    /// Asks peers for the full transactions behind announced txids.
    fn request_txs(&self, txids: &[Hash256]);

    /// Sends a transaction to peers. The answer, if one comes, goes to
    /// `reply`.
    fn send_tx(&self, txid: Hash256, raw: &[u8], reply: Sender<PeerReply>) -> Result<(), String>;
}

/// Network layer for a node running without peers.
pub struct OfflineNetwork;

impl NetworkLayer for OfflineNetwork {
    fn is_online(&self) -> bool {
        false
    }

    fn request_txs(&self, _txids: &[Hash256]) {}

    fn send_tx(&self, _txid: Hash256, _raw: &[u8], _reply: Sender<PeerReply>) -> Result<(), String> {
        Err("node is offline".to_string())
    }
}
