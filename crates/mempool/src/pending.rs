//! Parsed zero-conf transactions and their input references.

use chainscan_chainstate::{ConfirmedOutput, IoKey, TxKey};
use chainscan_primitives::{Hash256, OutPoint, ScrAddr, Transaction};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TxState {
    Uninitialized,
    /// Some input has no known funding output yet.
    Unresolved,
    Resolved,
    /// Waiting transaction being retried.
    ResolveAgain,
    Invalid,
    Mined,
    /// Removed without becoming invalid on its own, e.g. as a descendant of
    /// a replaced transaction.
    Purged,
}

/// An outpoint plus the key of the output it names, once known.
///
/// A pending key may later be replaced by a confirmed key, or the reverse
/// after a reorg. Waiting transactions drop every key before a retry.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OutpointRef {
    pub outpoint: OutPoint,
    key: Option<IoKey>,
}

impl OutpointRef {
    pub fn new(outpoint: OutPoint) -> Self {
        Self {
            outpoint,
            key: None,
        }
    }

    pub fn key(&self) -> Option<IoKey> {
        self.key
    }

    pub fn is_resolved(&self) -> bool {
        self.key.is_some()
    }

    /// Resolved to another pending transaction's output.
    pub fn is_pending(&self) -> bool {
        self.key.is_some_and(|key| key.is_pending())
    }

    pub fn resolve(&mut self, key: IoKey) {
        self.key = Some(key);
    }

    pub fn clear(&mut self) {
        self.key = None;
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PendingInput {
    pub prevout: OutpointRef,
    pub sequence: u32,
    /// Owner and value of the spent output, filled in with the key.
    pub scraddr: Option<ScrAddr>,
    pub value: Option<i64>,
}

impl PendingInput {
    pub fn resolve_confirmed(&mut self, output: &ConfirmedOutput) {
        self.prevout.resolve(output.key);
        self.scraddr = Some(output.scraddr.clone());
        self.value = Some(output.value);
    }

    pub fn resolve_pending(&mut self, key: IoKey, output: &PendingOutput) {
        self.prevout.resolve(key);
        self.scraddr = Some(output.scraddr.clone());
        self.value = Some(output.value);
    }

    fn clear(&mut self) {
        self.prevout.clear();
        self.scraddr = None;
        self.value = None;
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PendingOutput {
    pub scraddr: ScrAddr,
    pub value: i64,
}

#[derive(Clone, Debug)]
pub struct PendingTx {
    pub key: TxKey,
    pub txid: Hash256,
    pub raw: Vec<u8>,
    pub tx: Transaction,
    pub inputs: Vec<PendingInput>,
    pub outputs: Vec<PendingOutput>,
    pub state: TxState,
    pub is_rbf: bool,
    /// Spends an output of another pending transaction.
    pub is_chained: bool,
}

impl PendingTx {
    pub fn new(key: TxKey, raw: Vec<u8>, tx: Transaction) -> Self {
        let inputs = tx
            .vin
            .iter()
            .map(|input| PendingInput {
                prevout: OutpointRef::new(input.prevout.clone()),
                sequence: input.sequence,
                scraddr: None,
                value: None,
            })
            .collect();
        let outputs = tx
            .vout
            .iter()
            .map(|output| PendingOutput {
                scraddr: ScrAddr::from_script(&output.script_pubkey),
                value: output.value,
            })
            .collect();
        Self {
            key,
            txid: tx.txid(),
            is_rbf: tx.signals_rbf(),
            raw,
            tx,
            inputs,
            outputs,
            state: TxState::Uninitialized,
            is_chained: false,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.inputs.iter().all(|input| input.prevout.is_resolved())
    }

    /// Key of this transaction's output `index`.
    pub fn output_key(&self, index: usize) -> Option<IoKey> {
        u16::try_from(index)
            .ok()
            .map(|index| self.key.output(index))
    }

    pub fn input_key(&self, index: usize) -> Option<IoKey> {
        self.output_key(index)
    }

    /// Forgets every input resolution so the next attempt starts from the
    /// current chain and pending set.
    pub fn reset_resolution(&mut self) {
        for input in self.inputs.iter_mut() {
            input.clear();
        }
        self.is_rbf = self.tx.signals_rbf();
        self.is_chained = false;
    }

    pub fn refresh_chained(&mut self) {
        self.is_chained = self.inputs.iter().any(|input| input.prevout.is_pending());
    }

    pub fn spent_outpoints(&self) -> impl Iterator<Item = &OutPoint> {
        self.inputs.iter().map(|input| &input.prevout.outpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainscan_primitives::{TxIn, TxOut};

    #[test]
    fn new_tx_starts_unresolved_with_rbf_from_sequences() {
        let tx = Transaction {
            version: 2,
            vin: vec![
                TxIn::new(OutPoint::new([1u8; 32], 0), vec![], u32::MAX),
                TxIn::new(OutPoint::new([2u8; 32], 3), vec![], 0xffff_fffd),
            ],
            vout: vec![TxOut {
                value: 10,
                script_pubkey: vec![0x51],
            }],
            lock_time: 0,
        };
        let mut pending = PendingTx::new(TxKey::pending(7), tx.consensus_encode(), tx);
        assert!(pending.is_rbf);
        assert!(!pending.is_resolved());
        assert_eq!(pending.state, TxState::Uninitialized);

        let parent = TxKey::pending(3).output(0);
        let output = PendingOutput {
            scraddr: ScrAddr::from_script(&[0x51]),
            value: 5,
        };
        pending.inputs[0].resolve_pending(parent, &output);
        pending.inputs[1].prevout.resolve(TxKey::pending(4).output(3));
        pending.refresh_chained();
        assert!(pending.is_resolved());
        assert!(pending.is_chained);
        assert_eq!(pending.output_key(0), Some(TxKey::pending(7).output(0)));

        pending.reset_resolution();
        assert!(!pending.is_chained);
        assert!(pending.inputs.iter().all(|input| input.prevout.key().is_none()));
        assert_eq!(pending.inputs[0].scraddr, None);
    }
}
