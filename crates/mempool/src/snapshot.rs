//! Immutable views of the pending set.
//!
//! Readers take an `Arc<MempoolSnapshot>` and never see a half-applied
//! batch. The tracker edits a private clone under its sequencing lock and
//! publishes it with a single pointer swap.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};

use chainscan_chainstate::{IoKey, TxKey};
use chainscan_primitives::{Hash256, OutPoint, ScrAddr};

use crate::pending::PendingTx;

/// One half-or-whole txio of an address, keyed by the funding output.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PendingTxIo {
    pub output: IoKey,
    pub value: i64,
    /// Pending input spending the output, if any.
    pub spender: Option<IoKey>,
    pub is_rbf: bool,
    pub is_chained: bool,
}

#[derive(Clone, Debug, Default)]
pub struct MempoolSnapshot {
    pub(crate) sequence: u64,
    pub(crate) txs: HashMap<TxKey, Arc<PendingTx>>,
    pub(crate) by_hash: HashMap<Hash256, TxKey>,
    pub(crate) address_txios: HashMap<ScrAddr, BTreeMap<IoKey, PendingTxIo>>,
    /// Outpoint -> pending input spending it.
    pub(crate) spent_by_pending: HashMap<OutPoint, IoKey>,
}

impl MempoolSnapshot {
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn len(&self) -> usize {
        self.txs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.txs.is_empty()
    }

    pub fn txs(&self) -> impl Iterator<Item = &Arc<PendingTx>> {
        self.txs.values()
    }

    pub fn pending_tx_by_hash(&self, txid: &Hash256) -> Option<Arc<PendingTx>> {
        self.pending_tx_by_key(self.by_hash.get(txid)?)
    }

    pub fn pending_tx_by_key(&self, key: &TxKey) -> Option<Arc<PendingTx>> {
        self.txs.get(key).cloned()
    }

    pub fn is_outpoint_spent_by_pending(&self, outpoint: &OutPoint) -> bool {
        self.spent_by_pending.contains_key(outpoint)
    }

    pub fn spender_of(&self, outpoint: &OutPoint) -> Option<IoKey> {
        self.spent_by_pending.get(outpoint).copied()
    }

    /// Outputs paying `scraddr` created by pending transactions and not
    /// spent by another one.
    pub fn unspent_for_address(&self, scraddr: &ScrAddr) -> Vec<PendingTxIo> {
        self.address_txios
            .get(scraddr)
            .map(|txios| {
                txios
                    .values()
                    .filter(|txio| txio.spender.is_none())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Txios of `scraddr` whose pending side signals replaceability.
    pub fn rbf_candidates_for_address(&self, scraddr: &ScrAddr) -> Vec<PendingTxIo> {
        self.address_txios
            .get(scraddr)
            .map(|txios| txios.values().filter(|txio| txio.is_rbf).cloned().collect())
            .unwrap_or_default()
    }

    pub fn txios_for_address(&self, scraddr: &ScrAddr) -> Vec<PendingTxIo> {
        self.address_txios
            .get(scraddr)
            .map(|txios| txios.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Pending transactions spending any output of `key`.
    pub(crate) fn children(&self, key: &TxKey) -> Vec<TxKey> {
        let Some(tx) = self.txs.get(key) else {
            return Vec::new();
        };
        let mut children: Vec<TxKey> = (0..tx.outputs.len())
            .filter_map(|index| {
                let spender = self.spent_by_pending.get(&OutPoint::new(tx.txid, index as u32))?;
                Some(spender.tx)
            })
            .collect();
        children.sort_unstable();
        children.dedup();
        children
    }

    /// `key` and everything transitively spending it, children first.
    pub(crate) fn descendants(&self, key: TxKey) -> Vec<TxKey> {
        fn visit(
            snapshot: &MempoolSnapshot,
            key: TxKey,
            visited: &mut HashSet<TxKey>,
            order: &mut Vec<TxKey>,
        ) {
            if !visited.insert(key) {
                return;
            }
            for child in snapshot.children(&key) {
                visit(snapshot, child, visited, order);
            }
            order.push(key);
        }

        let mut visited = HashSet::new();
        let mut order = Vec::new();
        visit(self, key, &mut visited, &mut order);
        order
    }

    /// Adds the transaction and its address entries. Returns the touched
    /// addresses.
    pub(crate) fn insert(&mut self, tx: PendingTx) -> Vec<ScrAddr> {
        let touched = self.index(&tx);
        self.by_hash.insert(tx.txid, tx.key);
        for (index, input) in tx.inputs.iter().enumerate() {
            if let Some(spender) = tx.input_key(index) {
                self.spent_by_pending
                    .insert(input.prevout.outpoint.clone(), spender);
            }
        }
        self.txs.insert(tx.key, Arc::new(tx));
        touched
    }

    /// Drops the transaction and its address entries.
    pub(crate) fn remove(&mut self, key: &TxKey) -> Option<(Arc<PendingTx>, Vec<ScrAddr>)> {
        let tx = self.txs.remove(key)?;
        if self.by_hash.get(&tx.txid) == Some(key) {
            self.by_hash.remove(&tx.txid);
        }
        for (index, input) in tx.inputs.iter().enumerate() {
            let outpoint = &input.prevout.outpoint;
            if self.spent_by_pending.get(outpoint).copied() == tx.input_key(index) {
                self.spent_by_pending.remove(outpoint);
            }
        }
        let touched = self.unindex(&tx);
        Some((tx, touched))
    }

    /// Swaps in a modified version of a transaction already present.
    pub(crate) fn replace(&mut self, tx: PendingTx) -> Vec<ScrAddr> {
        let mut touched = match self.txs.get(&tx.key).cloned() {
            Some(old) => self.unindex(&old),
            None => Vec::new(),
        };
        touched.extend(self.index(&tx));
        self.by_hash.insert(tx.txid, tx.key);
        self.txs.insert(tx.key, Arc::new(tx));
        touched
    }

    fn index(&mut self, tx: &PendingTx) -> Vec<ScrAddr> {
        let mut touched = Vec::with_capacity(tx.outputs.len() + tx.inputs.len());
        for (index, output) in tx.outputs.iter().enumerate() {
            let Some(key) = tx.output_key(index) else {
                break;
            };
            let spender = self
                .spent_by_pending
                .get(&OutPoint::new(tx.txid, index as u32))
                .and_then(|spender| Some((*spender, self.txs.get(&spender.tx)?)));
            let txio = match spender {
                Some((spender, child)) => PendingTxIo {
                    output: key,
                    value: output.value,
                    spender: Some(spender),
                    is_rbf: child.is_rbf,
                    is_chained: child.is_chained,
                },
                None => PendingTxIo {
                    output: key,
                    value: output.value,
                    spender: None,
                    is_rbf: tx.is_rbf,
                    is_chained: tx.is_chained,
                },
            };
            self.address_txios
                .entry(output.scraddr.clone())
                .or_default()
                .insert(key, txio);
            touched.push(output.scraddr.clone());
        }
        for (index, input) in tx.inputs.iter().enumerate() {
            let (Some(output), Some(scraddr), Some(value), Some(spender)) = (
                input.prevout.key(),
                input.scraddr.as_ref(),
                input.value,
                tx.input_key(index),
            ) else {
                continue;
            };
            self.address_txios.entry(scraddr.clone()).or_default().insert(
                output,
                PendingTxIo {
                    output,
                    value,
                    spender: Some(spender),
                    is_rbf: tx.is_rbf,
                    is_chained: tx.is_chained,
                },
            );
            touched.push(scraddr.clone());
        }
        touched
    }

    fn unindex(&mut self, tx: &PendingTx) -> Vec<ScrAddr> {
        let mut touched = Vec::with_capacity(tx.outputs.len() + tx.inputs.len());
        for (index, output) in tx.outputs.iter().enumerate() {
            let Some(key) = tx.output_key(index) else {
                break;
            };
            if let Some(entries) = self.address_txios.get_mut(&output.scraddr) {
                entries.remove(&key);
                if entries.is_empty() {
                    self.address_txios.remove(&output.scraddr);
                }
            }
            touched.push(output.scraddr.clone());
        }
        for (index, input) in tx.inputs.iter().enumerate() {
            let (Some(output), Some(scraddr)) = (input.prevout.key(), input.scraddr.as_ref()) else {
                continue;
            };
            let spender = tx.input_key(index);
            let restored = self.restored_funding(output);
            let Some(entries) = self.address_txios.get_mut(scraddr) else {
                continue;
            };
            if entries.get(&output).map(|txio| txio.spender) != Some(spender) {
                continue;
            }
            match restored {
                Some(txio) => {
                    entries.insert(output, txio);
                }
                None => {
                    entries.remove(&output);
                    if entries.is_empty() {
                        self.address_txios.remove(scraddr);
                    }
                }
            }
            touched.push(scraddr.clone());
        }
        touched
    }

    /// Funding half of a pending output whose creator is still present.
    fn restored_funding(&self, output: IoKey) -> Option<PendingTxIo> {
        if !output.is_pending() {
            return None;
        }
        let parent = self.txs.get(&output.tx)?;
        let funded = parent.outputs.get(usize::from(output.index))?;
        Some(PendingTxIo {
            output,
            value: funded.value,
            spender: None,
            is_rbf: parent.is_rbf,
            is_chained: parent.is_chained,
        })
    }
}

/// The published snapshot.
#[derive(Default)]
pub struct SharedSnapshot {
    current: RwLock<Arc<MempoolSnapshot>>,
}

impl SharedSnapshot {
    pub fn new(snapshot: MempoolSnapshot) -> Self {
        Self {
            current: RwLock::new(Arc::new(snapshot)),
        }
    }

    pub fn load(&self) -> Arc<MempoolSnapshot> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn store(&self, snapshot: MempoolSnapshot) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(snapshot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pending::{PendingOutput, TxState};
    use chainscan_primitives::{Transaction, TxIn, TxOut};

    fn script(tag: u8) -> Vec<u8> {
        let mut script = vec![0x00, 0x14];
        script.extend_from_slice(&[tag; 20]);
        script
    }

    fn pending(id: u32, prevouts: Vec<OutPoint>, outputs: &[(u8, i64)]) -> PendingTx {
        let tx = Transaction {
            version: 2,
            vin: prevouts
                .into_iter()
                .map(|prevout| TxIn::new(prevout, vec![], u32::MAX))
                .collect(),
            vout: outputs
                .iter()
                .map(|(tag, value)| TxOut {
                    value: *value,
                    script_pubkey: script(*tag),
                })
                .collect(),
            lock_time: id,
        };
        let mut pending = PendingTx::new(TxKey::pending(id), tx.consensus_encode(), tx);
        pending.state = TxState::Resolved;
        pending
    }

    #[test]
    fn spending_overwrites_and_removal_restores_the_funding_half() {
        let mut snapshot = MempoolSnapshot::default();
        let parent = pending(1, vec![OutPoint::new([9u8; 32], 0)], &[(1, 40)]);
        let parent_out = parent.key.output(0);
        let parent_txid = parent.txid;
        snapshot.insert(parent);
        let owner = ScrAddr::from_script(&script(1));
        assert_eq!(snapshot.unspent_for_address(&owner).len(), 1);

        let mut child = pending(2, vec![OutPoint::new(parent_txid, 0)], &[(2, 39)]);
        child.inputs[0].resolve_pending(
            parent_out,
            &PendingOutput {
                scraddr: owner.clone(),
                value: 40,
            },
        );
        child.refresh_chained();
        let child_key = child.key;
        snapshot.insert(child);

        assert!(snapshot.unspent_for_address(&owner).is_empty());
        assert!(snapshot.is_outpoint_spent_by_pending(&OutPoint::new(parent_txid, 0)));
        assert_eq!(snapshot.descendants(TxKey::pending(1)), vec![child_key, TxKey::pending(1)]);

        snapshot.remove(&child_key).expect("child present");
        let unspent = snapshot.unspent_for_address(&owner);
        assert_eq!(unspent.len(), 1);
        assert_eq!(unspent[0].output, parent_out);
        assert!(!snapshot.is_outpoint_spent_by_pending(&OutPoint::new(parent_txid, 0)));
    }
}
