//! The zero-conf transaction tracker.
//!
//! New transactions are parsed and resolved against confirmed storage
//! outside the sequencing lock. Chaining to pending parents, replacement
//! and publication happen under the lock against the latest snapshot, so
//! snapshot N is always built on top of snapshot N-1.
//!
//! Every purge bumps an epoch under the lock. A batch prepared in an older
//! epoch repeats its storage checks under the lock before merging, so a
//! block connected mid-batch cannot let a mined or conflicting tx through.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use chainscan_chainstate::{
    BlockKey, BlockSource, HeaderGraph, OutpointResolver, ReorgState, SharedHeaderGraph,
    StoreResolver, TxKey, WorkQueue,
};
use chainscan_primitives::{hash256_to_hex, Block, Hash256, OutPoint, ScrAddr, Transaction};
use chainscan_storage::{KeyValueStore, WriteBatch};
use rayon::prelude::*;

use crate::error::{MempoolError, MempoolErrorKind};
use crate::network::NetworkLayer;
use crate::notify::{NotificationKind, NotificationSink, PendingNotification};
use crate::pending::{PendingTx, TxState};
use crate::persist::{mark_clean, open_pending, write_pending};
use crate::snapshot::{MempoolSnapshot, PendingTxIo, SharedSnapshot};

pub const DEFAULT_WORKERS: usize = 2;
pub const DEFAULT_INGEST_QUEUE: usize = 1024;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MempoolConfig {
    pub workers: usize,
    pub ingest_queue: usize,
    /// Drop the stored pending set on open.
    pub clear_on_open: bool,
}

impl Default for MempoolConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            ingest_queue: DEFAULT_INGEST_QUEUE,
            clear_on_open: false,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct BatchOutcome {
    pub accepted: Vec<(TxKey, Hash256)>,
    /// Still missing a parent; retried after later batches and purges.
    pub waiting: Vec<TxKey>,
    pub rejected: Vec<(TxKey, String)>,
    /// Previously pending transactions removed by replacement.
    pub invalidated: Vec<(TxKey, Hash256)>,
    /// Already confirmed on the main branch.
    pub mined: Vec<Hash256>,
    pub duplicates: Vec<Hash256>,
}

#[derive(Clone, Debug, Default)]
pub struct PurgeOutcome {
    pub blocks: usize,
    /// Pending key of each mined transaction and its confirmed key.
    pub mined: Vec<(TxKey, TxKey)>,
    pub invalidated: Vec<(TxKey, Hash256)>,
    /// Transactions whose stale confirmed inputs were re-pointed.
    pub rechained: Vec<TxKey>,
    /// Waiting transactions accepted on the retry.
    pub accepted: Vec<(TxKey, Hash256)>,
    /// Waiting transactions the new chain made invalid.
    pub rejected: Vec<(TxKey, String)>,
}

enum Prepared {
    Ready(PendingTx),
    Rejected(PendingTx, String),
    Mined(PendingTx, TxKey),
    Duplicate(PendingTx),
}

enum Merged {
    Accepted,
    Waiting(PendingTx),
    Dropped,
}

#[derive(Default)]
struct Sequenced {
    waiting: BTreeMap<TxKey, PendingTx>,
    /// Number of purges applied so far.
    epoch: u64,
}

impl Sequenced {
    fn park(&mut self, txs: Vec<PendingTx>) {
        for tx in txs {
            self.waiting.insert(tx.key, tx);
        }
    }
}

/// Waiting transactions taken out for a retry, plus the epoch they were
/// taken in.
struct Retry {
    txs: Vec<PendingTx>,
    epoch: u64,
}

/// Everything one locked mutation changed.
struct Mutation {
    note: PendingNotification,
    outcome: BatchOutcome,
    /// Keys to (re)write to the pending table.
    stored: Vec<(TxKey, Vec<u8>)>,
    /// Keys to delete from the pending table. Applied after `stored`.
    removed: Vec<TxKey>,
}

impl Mutation {
    fn new(kind: NotificationKind) -> Self {
        Self {
            note: PendingNotification::new(0, kind),
            outcome: BatchOutcome::default(),
            stored: Vec::new(),
            removed: Vec::new(),
        }
    }

    fn reject(&mut self, mut tx: PendingTx, reason: String) -> Merged {
        if tx.state == TxState::ResolveAgain {
            self.note.final_states.push((tx.key, TxState::Invalid));
        }
        tx.state = TxState::Invalid;
        chainscan_log::log_debug!(
            "pending tx {} rejected: {}",
            hash256_to_hex(&tx.txid),
            reason
        );
        self.outcome.rejected.push((tx.key, reason));
        self.removed.push(tx.key);
        Merged::Dropped
    }
}

/// A main-branch block as seen by `purge`.
struct MinedBlock {
    key: BlockKey,
    txids: Vec<Hash256>,
    spent: Vec<OutPoint>,
}

pub struct MempoolTracker<S> {
    store: Arc<S>,
    graph: Arc<SharedHeaderGraph>,
    source: Arc<dyn BlockSource>,
    resolver: StoreResolver<S>,
    sink: Arc<dyn NotificationSink>,
    snapshot: SharedSnapshot,
    sequencing: Mutex<Sequenced>,
    next_key: AtomicU32,
    queue: WorkQueue<(TxKey, Vec<u8>)>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    config: MempoolConfig,
}

impl<S: KeyValueStore + 'static> MempoolTracker<S> {
    /// Opens the tracker and replays the stored pending set.
    pub fn open(
        store: Arc<S>,
        graph: Arc<SharedHeaderGraph>,
        source: Arc<dyn BlockSource>,
        sink: Arc<dyn NotificationSink>,
        config: MempoolConfig,
    ) -> Result<Arc<Self>, MempoolError> {
        let stored = open_pending(store.as_ref(), config.clear_on_open)?;
        let resolver = StoreResolver::new(Arc::clone(&store), Arc::clone(&graph));
        let tracker = Arc::new(Self {
            store,
            graph,
            source,
            resolver,
            sink,
            snapshot: SharedSnapshot::default(),
            sequencing: Mutex::new(Sequenced::default()),
            next_key: AtomicU32::new(stored.next_key),
            queue: WorkQueue::bounded(config.ingest_queue.max(1)),
            workers: Mutex::new(Vec::new()),
            config,
        });
        if !stored.txs.is_empty() {
            let count = stored.txs.len();
            let outcome = tracker.process_keyed(stored.txs)?;
            chainscan_log::log_info!(
                "restored {} pending txs ({} accepted, {} waiting)",
                count,
                outcome.accepted.len(),
                outcome.waiting.len()
            );
        }
        Ok(tracker)
    }

    pub fn config(&self) -> MempoolConfig {
        self.config
    }

    pub fn start_workers(self: &Arc<Self>) -> Result<(), MempoolError> {
        let mut workers = self.workers.lock().map_err(|_| {
            MempoolError::new(MempoolErrorKind::Internal, "worker list lock poisoned")
        })?;
        for index in 0..self.config.workers.max(1) {
            let tracker = Arc::clone(self);
            let handle = thread::Builder::new()
                .name(format!("mempool-worker-{index}"))
                .spawn(move || tracker.worker_loop())
                .map_err(|err| {
                    MempoolError::new(
                        MempoolErrorKind::Internal,
                        format!("failed to spawn mempool worker: {err}"),
                    )
                })?;
            workers.push(handle);
        }
        Ok(())
    }

    fn worker_loop(&self) {
        while let Some((key, raw)) = self.queue.pop() {
            if let Err(err) = self.process_keyed(vec![(key, raw)]) {
                chainscan_log::log_warn!("pending tx {:?} failed: {}", key, err);
            }
        }
    }

    /// Stops the workers and marks the pending table clean. Queued but
    /// unprocessed transactions are dropped.
    pub fn shutdown(&self) -> Result<(), MempoolError> {
        self.queue.terminate();
        let handles = match self.workers.lock() {
            Ok(mut workers) => std::mem::take(&mut *workers),
            Err(_) => Vec::new(),
        };
        for handle in handles {
            if handle.join().is_err() {
                chainscan_log::log_warn!("mempool worker panicked");
            }
        }
        let mut batch = WriteBatch::new();
        write_pending(&mut batch, &[], &[], self.next_key.load(Ordering::SeqCst));
        self.store.write_batch(&batch)?;
        mark_clean(self.store.as_ref())?;
        chainscan_log::log_info!(
            "mempool shut down with {} pending txs",
            self.snapshot.load().len()
        );
        Ok(())
    }

    fn allocate_key(&self) -> TxKey {
        TxKey::pending(self.next_key.fetch_add(1, Ordering::SeqCst))
    }

    /// Queues a raw transaction for the workers and returns its key.
    pub fn ingest(&self, raw: Vec<u8>) -> Result<TxKey, MempoolError> {
        let key = self.allocate_key();
        self.queue
            .push((key, raw))
            .map_err(|_| MempoolError::new(MempoolErrorKind::Shutdown, "ingest queue closed"))?;
        Ok(key)
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Processes raw transactions on the calling thread.
    pub fn process_batch(&self, raws: Vec<Vec<u8>>) -> Result<BatchOutcome, MempoolError> {
        let keyed = raws
            .into_iter()
            .map(|raw| (self.allocate_key(), raw))
            .collect();
        self.process_keyed(keyed)
    }

    fn process_keyed(&self, keyed: Vec<(TxKey, Vec<u8>)>) -> Result<BatchOutcome, MempoolError> {
        let mut mutation = Mutation::new(NotificationKind::NewTx);
        let mut parsed = Vec::with_capacity(keyed.len());
        for (key, raw) in keyed {
            match Transaction::consensus_decode(&raw) {
                Ok(tx) => parsed.push(PendingTx::new(key, raw, tx)),
                Err(err) => {
                    let reason = format!("structurally invalid: {err}");
                    chainscan_log::log_debug!("pending tx {:?} rejected: {}", key, reason);
                    mutation.outcome.rejected.push((key, reason));
                    mutation.removed.push(key);
                }
            }
        }
        let retry = self.take_waiting()?;
        let taken = retry.txs.clone();
        parsed.extend(retry.txs);
        let prepared = match self.prepare(parsed) {
            Ok(prepared) => prepared,
            Err(err) => {
                self.lock()?.park(taken);
                return Err(err);
            }
        };

        let mut guard = self.lock()?;
        let mut next = (*self.snapshot.load()).clone();
        let prepared = match self.recheck_if_stale(&guard, retry.epoch, prepared, &next) {
            Ok(prepared) => prepared,
            Err(err) => {
                guard.park(taken);
                return Err(err);
            }
        };
        let candidates = sort_prepared(prepared, &mut mutation);
        let waiting = merge_candidates(&mut next, candidates, &mut mutation);
        self.commit(&mut guard, next, &mut mutation, waiting, taken)?;
        drop(guard);
        Ok(mutation.outcome)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Sequenced>, MempoolError> {
        self.sequencing
            .lock()
            .map_err(|_| MempoolError::new(MempoolErrorKind::Internal, "sequencing lock poisoned"))
    }

    fn take_waiting(&self) -> Result<Retry, MempoolError> {
        let mut guard = self.lock()?;
        let txs = std::mem::take(&mut guard.waiting)
            .into_values()
            .map(|mut tx| {
                tx.state = TxState::ResolveAgain;
                tx
            })
            .collect();
        Ok(Retry {
            txs,
            epoch: guard.epoch,
        })
    }

    /// Repeats the storage checks of txs prepared before a purge that has
    /// since been applied. Called with the sequencing lock held.
    fn recheck_if_stale(
        &self,
        guard: &Sequenced,
        epoch: u64,
        prepared: Vec<Prepared>,
        known: &MempoolSnapshot,
    ) -> Result<Vec<Prepared>, MempoolError> {
        if guard.epoch == epoch {
            return Ok(prepared);
        }
        chainscan_log::log_debug!(
            "rechecking {} prepared txs after {} purges",
            prepared.len(),
            guard.epoch - epoch
        );
        prepared
            .into_iter()
            .map(|item| match item {
                Prepared::Ready(tx) => self.prepare_one(tx, known),
                other => Ok(other),
            })
            .collect()
    }

    /// Storage-side checks, run in parallel and without the lock.
    fn prepare(&self, txs: Vec<PendingTx>) -> Result<Vec<Prepared>, MempoolError> {
        let known = self.snapshot.load();
        txs.into_par_iter()
            .map(|tx| self.prepare_one(tx, &known))
            .collect()
    }

    fn prepare_one(&self, mut tx: PendingTx, known: &MempoolSnapshot) -> Result<Prepared, MempoolError> {
        tx.reset_resolution();
        if known.by_hash.contains_key(&tx.txid) {
            return Ok(Prepared::Duplicate(tx));
        }
        if let Some(confirmed) = self.resolver.resolve_tx(&tx.txid)? {
            return Ok(Prepared::Mined(tx, confirmed));
        }
        if tx.tx.is_coinbase() {
            let reason = "coinbase transactions cannot be pending".to_string();
            return Ok(Prepared::Rejected(tx, reason));
        }
        for input in tx.inputs.iter_mut() {
            let Some(output) = self.resolver.confirmed_output(&input.prevout.outpoint)? else {
                continue;
            };
            if self.resolver.spender(&output.key)?.is_some() {
                let reason = format!("spends confirmed-spent output {}", input.prevout.outpoint);
                return Ok(Prepared::Rejected(tx, reason));
            }
            input.resolve_confirmed(&output);
        }
        Ok(Prepared::Ready(tx))
    }

    /// Publishes the mutation and parks what is still waiting. If the write
    /// fails the retried txs go back to the waiting set unchanged.
    fn commit(
        &self,
        guard: &mut Sequenced,
        next: MempoolSnapshot,
        mutation: &mut Mutation,
        waiting: Vec<PendingTx>,
        taken: Vec<PendingTx>,
    ) -> Result<(), MempoolError> {
        if let Err(err) = self.publish(next, mutation) {
            chainscan_log::log_warn!(
                "pending set write failed, keeping {} waiting txs: {}",
                taken.len(),
                err
            );
            guard.park(taken);
            return Err(err);
        }
        guard.park(waiting);
        Ok(())
    }

    /// Persists the change set, swaps in `next` and notifies. Called with
    /// the sequencing lock held.
    fn publish(&self, mut next: MempoolSnapshot, mutation: &mut Mutation) -> Result<(), MempoolError> {
        let added: Vec<(TxKey, &[u8])> = mutation
            .stored
            .iter()
            .map(|(key, raw)| (*key, raw.as_slice()))
            .collect();
        let mut batch = WriteBatch::with_capacity(added.len() + mutation.removed.len() + 1);
        write_pending(
            &mut batch,
            &added,
            &mutation.removed,
            self.next_key.load(Ordering::SeqCst),
        );
        self.store.write_batch(&batch)?;

        if mutation.note.is_empty() {
            return Ok(());
        }
        next.sequence += 1;
        mutation.note.sequence = next.sequence;
        self.snapshot.store(next);
        self.sink.notify(&mutation.note);
        Ok(())
    }

    /// Applies newly connected main-branch blocks and, after a reorg,
    /// re-points inputs funded by blocks that left the main branch.
    ///
    /// Storage must already reflect the new chain.
    pub fn purge(&self, reorg: &ReorgState) -> Result<PurgeOutcome, MempoolError> {
        let graph = self.graph.snapshot();
        let blocks = self.mined_blocks(&graph, reorg)?;
        let retry = self.take_waiting()?;
        let taken = retry.txs.clone();
        let prepared = match self.prepare(retry.txs) {
            Ok(prepared) => prepared,
            Err(err) => {
                self.lock()?.park(taken);
                return Err(err);
            }
        };

        let mut mutation = Mutation::new(NotificationKind::Purge {
            reorg: reorg.is_reorg(),
        });
        let mut guard = self.lock()?;
        let mut next = (*self.snapshot.load()).clone();
        let applied = self.recheck_if_stale(&guard, retry.epoch, prepared, &next).and_then(|prepared| {
            for block in &blocks {
                apply_block(&mut next, block, &mut mutation);
            }
            let rechained = if reorg.is_reorg() {
                self.repoint_stale(&graph, &mut next, &mut mutation)?
            } else {
                Vec::new()
            };
            Ok((prepared, rechained))
        });
        let (prepared, rechained) = match applied {
            Ok(applied) => applied,
            Err(err) => {
                guard.park(taken);
                return Err(err);
            }
        };
        guard.epoch += 1;
        let candidates = sort_prepared(prepared, &mut mutation);
        let waiting = merge_candidates(&mut next, candidates, &mut mutation);
        self.commit(&mut guard, next, &mut mutation, waiting, taken)?;
        drop(guard);

        chainscan_log::log_info!(
            "mempool purge: {} blocks, {} mined, {} invalidated, {} rechained{}",
            blocks.len(),
            mutation.note.mined.len(),
            mutation.outcome.invalidated.len(),
            rechained.len(),
            if reorg.is_reorg() { " (reorg)" } else { "" }
        );
        Ok(PurgeOutcome {
            blocks: blocks.len(),
            mined: mutation.note.mined,
            invalidated: mutation.outcome.invalidated,
            rechained,
            accepted: mutation.outcome.accepted,
            rejected: mutation.outcome.rejected,
        })
    }

    /// Main-branch blocks above the common ancestor, up to the new top.
    fn mined_blocks(&self, graph: &HeaderGraph, reorg: &ReorgState) -> Result<Vec<MinedBlock>, MempoolError> {
        if !reorg.has_new_top {
            return Ok(Vec::new());
        }
        let Some(end) = reorg
            .new_top
            .and_then(|id| graph.get(id))
            .and_then(|node| node.height)
        else {
            return Ok(Vec::new());
        };
        let start = reorg
            .common_ancestor()
            .and_then(|id| graph.get(id))
            .and_then(|node| node.height)
            .map_or(0, |height| height + 1);

        let mut blocks = Vec::new();
        for node in graph.main_range(start, end) {
            let Some(key) = node.block_key() else {
                continue;
            };
            let raw = self.source.get_block(key.height, &node.hash)?;
            let block = Block::consensus_decode(&raw).map_err(|err| {
                MempoolError::new(
                    MempoolErrorKind::Source,
                    format!(
                        "block {} at height {}: {}",
                        hash256_to_hex(&node.hash),
                        key.height,
                        err
                    ),
                )
            })?;
            let spent = block
                .transactions
                .iter()
                .filter(|tx| !tx.is_coinbase())
                .flat_map(|tx| tx.vin.iter().map(|input| input.prevout.clone()))
                .collect();
            blocks.push(MinedBlock {
                key,
                txids: block.txids(),
                spent,
            });
        }
        Ok(blocks)
    }

    /// Re-points inputs whose confirmed funding key belongs to a block that
    /// is no longer on the main branch: first to a pending transaction with
    /// that txid, then to the output's new main-branch location. Anything
    /// left without funding is invalidated with its descendants.
    fn repoint_stale(
        &self,
        graph: &HeaderGraph,
        next: &mut MempoolSnapshot,
        mutation: &mut Mutation,
    ) -> Result<Vec<TxKey>, MempoolError> {
        let mut keys: Vec<TxKey> = next.txs.keys().copied().collect();
        keys.sort_unstable();
        let mut rechained = Vec::new();
        for key in keys {
            let Some(current) = next.pending_tx_by_key(&key) else {
                continue;
            };
            let stale: Vec<usize> = current
                .inputs
                .iter()
                .enumerate()
                .filter(|(_, input)| {
                    input
                        .prevout
                        .key()
                        .and_then(|output| output.block())
                        .is_some_and(|block| !graph.is_valid_block_key(block))
                })
                .map(|(index, _)| index)
                .collect();
            if stale.is_empty() {
                continue;
            }

            let mut updated = (*current).clone();
            let mut lost = None;
            for index in stale {
                let outpoint = updated.inputs[index].prevout.outpoint.clone();
                if let Some(parent) = next.pending_tx_by_hash(&outpoint.hash) {
                    let funded = usize::try_from(outpoint.index).ok().and_then(|out| {
                        Some((parent.output_key(out)?, parent.outputs.get(out)?))
                    });
                    if let Some((parent_key, output)) = funded {
                        updated.inputs[index].resolve_pending(parent_key, output);
                        updated.is_rbf |= parent.is_rbf;
                        continue;
                    }
                }
                match self.resolver.confirmed_output(&outpoint)? {
                    Some(output) if self.resolver.spender(&output.key)?.is_none() => {
                        updated.inputs[index].resolve_confirmed(&output);
                    }
                    _ => {
                        lost = Some(outpoint);
                        break;
                    }
                }
            }
            if let Some(outpoint) = lost {
                chainscan_log::log_debug!(
                    "pending tx {} lost its funding {}",
                    hash256_to_hex(&updated.txid),
                    outpoint
                );
                invalidate(next, key, mutation);
                continue;
            }
            updated.refresh_chained();
            let touched = next.replace(updated);
            mutation.note.touch(touched, key);
            rechained.push(key);
        }
        Ok(rechained)
    }

    /// Requests announced transactions that are neither pending nor
    /// waiting. Returns the requested txids.
    pub fn handle_inventory(&self, network: &dyn NetworkLayer, txids: &[Hash256]) -> Vec<Hash256> {
        let snapshot = self.snapshot.load();
        let waiting: HashSet<Hash256> = match self.lock() {
            Ok(guard) => guard.waiting.values().map(|tx| tx.txid).collect(),
            Err(_) => HashSet::new(),
        };
        let mut seen = HashSet::new();
        let unknown: Vec<Hash256> = txids
            .iter()
            .filter(|txid| !snapshot.by_hash.contains_key(*txid) && !waiting.contains(*txid))
            .filter(|txid| seen.insert(**txid))
            .copied()
            .collect();
        if !unknown.is_empty() {
            network.request_txs(&unknown);
        }
        unknown
    }

    pub fn snapshot(&self) -> Arc<MempoolSnapshot> {
        self.snapshot.load()
    }

    pub fn waiting_len(&self) -> usize {
        self.lock().map_or(0, |guard| guard.waiting.len())
    }

    pub fn pending_tx_by_hash(&self, txid: &Hash256) -> Option<Arc<PendingTx>> {
        self.snapshot.load().pending_tx_by_hash(txid)
    }

    pub fn pending_tx_by_key(&self, key: &TxKey) -> Option<Arc<PendingTx>> {
        self.snapshot.load().pending_tx_by_key(key)
    }

    pub fn is_outpoint_spent_by_pending(&self, outpoint: &OutPoint) -> bool {
        self.snapshot.load().is_outpoint_spent_by_pending(outpoint)
    }

    pub fn unspent_for_address(&self, scraddr: &ScrAddr) -> Vec<PendingTxIo> {
        self.snapshot.load().unspent_for_address(scraddr)
    }

    pub fn rbf_candidates_for_address(&self, scraddr: &ScrAddr) -> Vec<PendingTxIo> {
        self.snapshot.load().rbf_candidates_for_address(scraddr)
    }
}

fn sort_prepared(prepared: Vec<Prepared>, mutation: &mut Mutation) -> Vec<PendingTx> {
    let mut candidates = Vec::with_capacity(prepared.len());
    for item in prepared {
        match item {
            Prepared::Ready(tx) => candidates.push(tx),
            Prepared::Rejected(tx, reason) => {
                mutation.reject(tx, reason);
            }
            Prepared::Mined(tx, confirmed) => {
                if tx.state == TxState::ResolveAgain {
                    mutation.note.mined.push((tx.key, confirmed));
                    mutation.note.final_states.push((tx.key, TxState::Mined));
                }
                mutation.outcome.mined.push(tx.txid);
                mutation.removed.push(tx.key);
            }
            Prepared::Duplicate(tx) => {
                mutation.outcome.duplicates.push(tx.txid);
                mutation.removed.push(tx.key);
            }
        }
    }
    candidates.sort_by_key(|tx| tx.key);
    candidates
}

/// Merges until a pass accepts nothing and returns what is left to wait.
fn merge_candidates(
    next: &mut MempoolSnapshot,
    mut candidates: Vec<PendingTx>,
    mutation: &mut Mutation,
) -> Vec<PendingTx> {
    loop {
        let mut progressed = false;
        let mut unresolved = Vec::new();
        for tx in candidates {
            match merge_one(next, tx, mutation) {
                Merged::Accepted => progressed = true,
                Merged::Waiting(tx) => unresolved.push(tx),
                Merged::Dropped => {}
            }
        }
        candidates = unresolved;
        if !progressed || candidates.is_empty() {
            break;
        }
    }
    for tx in &candidates {
        mutation.outcome.waiting.push(tx.key);
        mutation.stored.push((tx.key, tx.raw.clone()));
    }
    candidates
}

fn merge_one(next: &mut MempoolSnapshot, mut tx: PendingTx, mutation: &mut Mutation) -> Merged {
    if next.by_hash.contains_key(&tx.txid) {
        mutation.outcome.duplicates.push(tx.txid);
        mutation.removed.push(tx.key);
        return Merged::Dropped;
    }

    for index in 0..tx.inputs.len() {
        if tx.inputs[index].prevout.is_resolved() {
            continue;
        }
        let outpoint = tx.inputs[index].prevout.outpoint.clone();
        let Some(parent) = next.pending_tx_by_hash(&outpoint.hash) else {
            continue;
        };
        let funded = usize::try_from(outpoint.index)
            .ok()
            .and_then(|out| Some((parent.output_key(out)?, parent.outputs.get(out)?)));
        let Some((parent_key, output)) = funded else {
            return mutation.reject(tx, format!("spends missing output {outpoint}"));
        };
        tx.inputs[index].resolve_pending(parent_key, output);
        tx.is_rbf |= parent.is_rbf;
    }
    tx.refresh_chained();
    if !tx.is_resolved() {
        tx.state = TxState::Unresolved;
        return Merged::Waiting(tx);
    }

    // Any conflicting spend replaces the earlier transaction.
    let conflicts: BTreeSet<TxKey> = tx
        .spent_outpoints()
        .filter_map(|outpoint| next.spender_of(outpoint))
        .map(|spender| spender.tx)
        .collect();
    if !conflicts.is_empty() {
        let doomed: HashSet<TxKey> = conflicts
            .iter()
            .flat_map(|key| next.descendants(*key))
            .collect();
        let spends_doomed = tx
            .inputs
            .iter()
            .filter_map(|input| input.prevout.key())
            .any(|funding| doomed.contains(&funding.tx));
        if spends_doomed {
            return mutation.reject(tx, "conflicts with its own ancestor".to_string());
        }
        for root in conflicts {
            chainscan_log::log_debug!(
                "pending tx {:?} replaced by {}",
                root,
                hash256_to_hex(&tx.txid)
            );
            invalidate(next, root, mutation);
        }
    }

    tx.state = TxState::Resolved;
    let key = tx.key;
    let txid = tx.txid;
    mutation.stored.push((key, tx.raw.clone()));
    let touched = next.insert(tx);
    if let Some(accepted) = next.pending_tx_by_key(&key) {
        mutation.note.new_pending.push((key, accepted));
    }
    mutation.note.touch(touched, key);
    mutation.outcome.accepted.push((key, txid));
    Merged::Accepted
}

/// Removes `root` and everything spending it.
fn invalidate(next: &mut MempoolSnapshot, root: TxKey, mutation: &mut Mutation) {
    for key in next.descendants(root) {
        let Some((tx, touched)) = next.remove(&key) else {
            continue;
        };
        let state = if key == root {
            TxState::Invalid
        } else {
            TxState::Purged
        };
        mutation.note.final_states.push((key, state));
        mutation.note.touch(touched, key);
        mutation.note.invalidated.push((key, tx.txid));
        mutation.outcome.invalidated.push((key, tx.txid));
        mutation.removed.push(key);
    }
}

/// Drops transactions mined in `block`, re-keys their children to the
/// confirmed outputs and invalidates pending spends the block conflicts
/// with.
fn apply_block(next: &mut MempoolSnapshot, block: &MinedBlock, mutation: &mut Mutation) {
    for (index, txid) in block.txids.iter().enumerate() {
        let Some(pending_key) = next.by_hash.get(txid).copied() else {
            continue;
        };
        let Ok(index) = u16::try_from(index) else {
            continue;
        };
        let confirmed = TxKey::confirmed(block.key, index);
        let children = next.children(&pending_key);
        let Some((_, touched)) = next.remove(&pending_key) else {
            continue;
        };
        mutation.note.touch(touched, pending_key);
        mutation.note.mined.push((pending_key, confirmed));
        mutation.note.final_states.push((pending_key, TxState::Mined));
        mutation.removed.push(pending_key);

        for child in children {
            let Some(current) = next.pending_tx_by_key(&child) else {
                continue;
            };
            let mut updated = (*current).clone();
            for input in updated.inputs.iter_mut() {
                if input.prevout.outpoint.hash != *txid {
                    continue;
                }
                if let Ok(out) = u16::try_from(input.prevout.outpoint.index) {
                    input.prevout.resolve(confirmed.output(out));
                }
            }
            updated.refresh_chained();
            let touched = next.replace(updated);
            mutation.note.touch(touched, child);
        }
    }

    for outpoint in &block.spent {
        if let Some(spender) = next.spender_of(outpoint) {
            chainscan_log::log_debug!(
                "pending tx {:?} conflicts with block {:?} on {}",
                spender.tx,
                block.key,
                outpoint
            );
            invalidate(next, spender.tx, mutation);
        }
    }
}
