//! Change notifications emitted after every published mutation.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chainscan_chainstate::TxKey;
use chainscan_primitives::{Hash256, ScrAddr};
use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::pending::{PendingTx, TxState};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NotificationKind {
    NewTx,
    Purge { reorg: bool },
}

/// Delivery is at-least-once; consumers should be idempotent on tx key.
#[derive(Clone, Debug)]
pub struct PendingNotification {
    pub sequence: u64,
    pub kind: NotificationKind,
    pub new_pending: Vec<(TxKey, Arc<PendingTx>)>,
    pub invalidated: Vec<(TxKey, Hash256)>,
    /// Pending key of each mined transaction and its confirmed key.
    pub mined: Vec<(TxKey, TxKey)>,
    pub address_delta: BTreeMap<ScrAddr, BTreeSet<TxKey>>,
    /// Final state of every transaction that left the pending set.
    pub final_states: Vec<(TxKey, TxState)>,
}

impl PendingNotification {
    pub fn new(sequence: u64, kind: NotificationKind) -> Self {
        Self {
            sequence,
            kind,
            new_pending: Vec::new(),
            invalidated: Vec::new(),
            mined: Vec::new(),
            address_delta: BTreeMap::new(),
            final_states: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.new_pending.is_empty()
            && self.invalidated.is_empty()
            && self.mined.is_empty()
            && self.address_delta.is_empty()
            && self.final_states.is_empty()
    }

    pub(crate) fn touch(&mut self, addresses: Vec<ScrAddr>, key: TxKey) {
        for scraddr in addresses {
            self.address_delta.entry(scraddr).or_default().insert(key);
        }
    }
}

pub trait NotificationSink: Send + Sync {
    fn notify(&self, notification: &PendingNotification);
}

pub struct NullSink;

impl NotificationSink for NullSink {
    fn notify(&self, _notification: &PendingNotification) {}
}

/// Forwards notifications over a crossbeam channel.
pub struct ChannelSink {
    sender: Sender<PendingNotification>,
}

impl ChannelSink {
    pub fn new() -> (Self, Receiver<PendingNotification>) {
        let (sender, receiver) = unbounded();
        (Self { sender }, receiver)
    }
}

impl NotificationSink for ChannelSink {
    fn notify(&self, notification: &PendingNotification) {
        if self.sender.send(notification.clone()).is_err() {
            chainscan_log::log_debug!(
                "notification {} dropped: receiver gone",
                notification.sequence
            );
        }
    }
}
