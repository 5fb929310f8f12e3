use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use chainscan_chainstate::{
    BlockKey, HeaderGraph, HeaderRecord, IoKey, MemoryBlockSource, ReorgState, SharedHeaderGraph,
    TxKey,
};
use chainscan_mempool::{
    BroadcastResult, Broadcaster, ChannelSink, MempoolConfig, MempoolErrorKind, MempoolTracker,
    NetworkLayer, NotificationKind, NotificationSink, NullSink, OfflineNetwork, PeerReply,
    TxState,
};
use chainscan_primitives::{
    merkle_root, Block, BlockHeader, Hash256, OutPoint, ScrAddr, Transaction, TxIn, TxOut,
};
use chainscan_scanner::{ScanConfig, Scanner};
use chainscan_storage::memory::MemoryStore;
use chainscan_storage::{Column, KeyValueStore, PrefixVisitor, ScanResult, StoreError, WriteBatch};
use crossbeam_channel::{bounded, Receiver, Sender};

const BITS: u32 = 0x207f_ffff;
const RBF_SEQUENCE: u32 = 0xffff_fffd;

fn p2pkh(tag: u8) -> Vec<u8> {
    let mut script = vec![0x76, 0xa9, 0x14];
    script.extend_from_slice(&[tag; 20]);
    script.extend_from_slice(&[0x88, 0xac]);
    script
}

fn addr(tag: u8) -> ScrAddr {
    ScrAddr::from_script(&p2pkh(tag))
}

fn coinbase(height: u32, tag: u8) -> Transaction {
    let mut script_sig = height.to_le_bytes().to_vec();
    script_sig.push(tag);
    Transaction {
        version: 1,
        vin: vec![TxIn::new(OutPoint::null(), script_sig, u32::MAX)],
        vout: vec![TxOut {
            value: 50,
            script_pubkey: p2pkh(tag),
        }],
        lock_time: 0,
    }
}

fn spend_with(prev: OutPoint, sequence: u32, outputs: &[(u8, i64)]) -> Transaction {
    Transaction {
        version: 1,
        vin: vec![TxIn::new(prev, vec![0x51], sequence)],
        vout: outputs
            .iter()
            .map(|(tag, value)| TxOut {
                value: *value,
                script_pubkey: p2pkh(*tag),
            })
            .collect(),
        lock_time: 0,
    }
}

fn spend(prev: OutPoint, outputs: &[(u8, i64)]) -> Transaction {
    spend_with(prev, u32::MAX, outputs)
}

fn spend_many(prevs: &[OutPoint], outputs: &[(u8, i64)]) -> Transaction {
    let mut tx = spend(prevs[0].clone(), outputs);
    tx.vin = prevs
        .iter()
        .map(|prev| TxIn::new(prev.clone(), vec![0x51], u32::MAX))
        .collect();
    tx
}

fn out(tx: &Transaction, index: u32) -> OutPoint {
    OutPoint::new(tx.txid(), index)
}

fn make_block(prev: Hash256, nonce: u32, transactions: Vec<Transaction>) -> Block {
    let txids: Vec<Hash256> = transactions.iter().map(Transaction::txid).collect();
    Block {
        header: BlockHeader {
            version: 1,
            prev_block: prev,
            merkle_root: merkle_root(&txids),
            time: 1_700_000_000 + nonce,
            bits: BITS,
            nonce,
        },
        transactions,
    }
}

/// h0: coinbase to A. h1: coinbase to B, A's coin moves to C.
struct Chain {
    blocks: Vec<Block>,
    cb0: Transaction,
    cb1: Transaction,
    to_c: Transaction,
}

fn base_chain() -> Chain {
    let cb0 = coinbase(0, 0xa);
    let cb1 = coinbase(1, 0xb);
    let to_c = spend(out(&cb0, 0), &[(0xc, 50)]);
    let h0 = make_block([0u8; 32], 0, vec![cb0.clone()]);
    let h1 = make_block(h0.header.hash(), 1, vec![cb1.clone(), to_c.clone()]);
    Chain {
        blocks: vec![h0, h1],
        cb0,
        cb1,
        to_c,
    }
}

struct Fixture {
    store: Arc<MemoryStore>,
    graph: Arc<SharedHeaderGraph>,
    source: Arc<MemoryBlockSource>,
    scanner: Scanner<MemoryStore>,
}

impl Fixture {
    fn new(chain: &Chain) -> Self {
        let store = Arc::new(MemoryStore::new());
        let graph = Arc::new(SharedHeaderGraph::new(HeaderGraph::new()));
        let source = Arc::new(MemoryBlockSource::new());
        let scanner = Scanner::new(
            Arc::clone(&store),
            Arc::clone(&graph),
            source.clone(),
            ScanConfig {
                threads: 1,
                batch_bytes: 1 << 20,
                write_queue_depth: 1,
            },
        )
        .expect("scanner");
        let fixture = Self {
            store,
            graph,
            source,
            scanner,
        };
        for block in &chain.blocks {
            fixture.connect(block);
        }
        fixture.catch_up();
        fixture
    }

    fn connect(&self, block: &Block) -> ReorgState {
        self.source
            .insert(block.consensus_encode())
            .expect("block stored");
        let (_, state) = self
            .graph
            .add_and_organize(vec![HeaderRecord::new(block.header.clone())]);
        state
    }

    fn catch_up(&self) {
        let top = self.graph.snapshot().top_height().expect("top");
        let from = self.scanner.scan_from().expect("scan from");
        self.scanner.scan(from, top).expect("scan");
    }

    fn tracker_with(&self, sink: Arc<dyn NotificationSink>) -> Arc<MempoolTracker<MemoryStore>> {
        MempoolTracker::open(
            Arc::clone(&self.store),
            Arc::clone(&self.graph),
            self.source.clone(),
            sink,
            MempoolConfig::default(),
        )
        .expect("tracker")
    }

    fn tracker(&self) -> Arc<MempoolTracker<MemoryStore>> {
        self.tracker_with(Arc::new(NullSink))
    }
}

fn accept_one(tracker: &MempoolTracker<MemoryStore>, tx: &Transaction) -> TxKey {
    let outcome = tracker
        .process_batch(vec![tx.consensus_encode()])
        .expect("batch");
    assert_eq!(outcome.rejected, vec![], "unexpected rejection");
    outcome
        .accepted
        .iter()
        .find(|(_, txid)| *txid == tx.txid())
        .map(|(key, _)| *key)
        .expect("accepted")
}

#[test]
fn child_arriving_first_waits_for_its_parent() {
    let chain = base_chain();
    let fixture = Fixture::new(&chain);
    let tracker = fixture.tracker();

    let parent = spend(out(&chain.cb1, 0), &[(0xd, 30), (0xb, 20)]);
    let child = spend(out(&parent, 0), &[(0xe, 29)]);

    let first = tracker
        .process_batch(vec![child.consensus_encode()])
        .expect("child");
    assert!(first.accepted.is_empty());
    assert_eq!(first.waiting.len(), 1);
    assert_eq!(tracker.waiting_len(), 1);
    assert!(tracker.pending_tx_by_hash(&child.txid()).is_none());

    let second = tracker
        .process_batch(vec![parent.consensus_encode()])
        .expect("parent");
    let accepted: Vec<Hash256> = second.accepted.iter().map(|(_, txid)| *txid).collect();
    assert_eq!(accepted, vec![parent.txid(), child.txid()]);
    assert_eq!(tracker.waiting_len(), 0);

    let pending_child = tracker.pending_tx_by_hash(&child.txid()).expect("child");
    assert!(pending_child.is_chained);
    assert!(pending_child.inputs[0].prevout.is_pending());
}

#[test]
fn mined_parent_rekeys_its_pending_child() {
    let chain = base_chain();
    let fixture = Fixture::new(&chain);
    let tracker = fixture.tracker();

    let parent = spend_with(out(&chain.cb1, 0), RBF_SEQUENCE, &[(0xd, 30), (0xb, 20)]);
    let child = spend(out(&parent, 0), &[(0xe, 29)]);
    let parent_key = accept_one(&tracker, &parent);
    let child_key = accept_one(&tracker, &child);

    let snapshot = tracker.snapshot();
    let pending_child = snapshot.pending_tx_by_key(&child_key).expect("child");
    assert!(pending_child.is_chained);
    assert!(pending_child.is_rbf, "replaceability is inherited");
    assert!(tracker.unspent_for_address(&addr(0xd)).is_empty());
    assert_eq!(tracker.rbf_candidates_for_address(&addr(0xd)).len(), 1);
    assert_eq!(tracker.unspent_for_address(&addr(0xb)).len(), 1);
    assert_eq!(tracker.unspent_for_address(&addr(0xe))[0].value, 29);

    let h2 = make_block(
        chain.blocks[1].header.hash(),
        2,
        vec![coinbase(2, 0x2), parent.clone()],
    );
    let reorg = fixture.connect(&h2);
    fixture.catch_up();
    let outcome = tracker.purge(&reorg).expect("purge");

    let block = fixture.graph.snapshot().main_block_key(2).expect("h2 key");
    let confirmed = TxKey::confirmed(block, 1);
    assert_eq!(outcome.blocks, 1);
    assert_eq!(outcome.mined, vec![(parent_key, confirmed)]);
    assert!(outcome.invalidated.is_empty());

    assert!(tracker.pending_tx_by_key(&parent_key).is_none());
    let rekeyed = tracker.pending_tx_by_key(&child_key).expect("child stays");
    assert_eq!(rekeyed.inputs[0].prevout.key(), Some(confirmed.output(0)));
    assert!(!rekeyed.is_chained);
    let txios: Vec<(IoKey, Option<IoKey>)> = tracker
        .snapshot()
        .txios_for_address(&addr(0xd))
        .into_iter()
        .map(|txio| (txio.output, txio.spender))
        .collect();
    assert_eq!(txios, vec![(confirmed.output(0), Some(child_key.output(0)))]);
    assert!(tracker.unspent_for_address(&addr(0xb)).is_empty());
}

#[test]
fn conflicting_spend_replaces_the_whole_chain() {
    let chain = base_chain();
    let fixture = Fixture::new(&chain);
    let tracker = fixture.tracker();

    let first = spend(out(&chain.cb1, 0), &[(0xd, 50)]);
    let second = spend(out(&first, 0), &[(0xe, 49)]);
    let third = spend(out(&second, 0), &[(0xf, 48)]);
    let keys: Vec<TxKey> = [&first, &second, &third]
        .into_iter()
        .map(|tx| accept_one(&tracker, tx))
        .collect();
    assert_eq!(tracker.snapshot().len(), 3);

    let replacement = spend(out(&chain.cb1, 0), &[(0x9, 45)]);
    let outcome = tracker
        .process_batch(vec![replacement.consensus_encode()])
        .expect("replacement");
    assert_eq!(outcome.accepted.len(), 1);
    let mut invalidated: Vec<TxKey> = outcome.invalidated.iter().map(|(key, _)| *key).collect();
    invalidated.sort_unstable();
    assert_eq!(invalidated, keys);

    let snapshot = tracker.snapshot();
    assert_eq!(snapshot.len(), 1);
    for tag in [0xd, 0xe, 0xf] {
        assert!(snapshot.txios_for_address(&addr(tag)).is_empty());
    }
    let spender = snapshot
        .spender_of(&out(&chain.cb1, 0))
        .expect("replacement spends the coinbase");
    assert_eq!(spender.tx, outcome.accepted[0].0);
    assert_eq!(fixture.store.len(Column::Pending), 1);
}

#[test]
fn spending_a_confirmed_spent_output_is_rejected() {
    let chain = base_chain();
    let fixture = Fixture::new(&chain);
    let tracker = fixture.tracker();

    let double = spend(out(&chain.cb0, 0), &[(0xd, 50)]);
    let outcome = tracker
        .process_batch(vec![double.consensus_encode()])
        .expect("batch");
    assert_eq!(outcome.rejected.len(), 1);
    assert!(outcome.rejected[0].1.contains("confirmed-spent"));

    let garbage = tracker.process_batch(vec![vec![0x01, 0x02]]).expect("batch");
    assert!(garbage.rejected[0].1.starts_with("structurally invalid"));

    let confirmed = tracker
        .process_batch(vec![chain.to_c.consensus_encode()])
        .expect("batch");
    assert_eq!(confirmed.mined, vec![chain.to_c.txid()]);
    assert!(tracker.snapshot().is_empty());
}

#[test]
fn block_spend_invalidates_the_conflicting_pending_tx() {
    let chain = base_chain();
    let fixture = Fixture::new(&chain);
    let tracker = fixture.tracker();

    let pending = spend(out(&chain.to_c, 0), &[(0xd, 50)]);
    let child = spend(out(&pending, 0), &[(0xe, 50)]);
    let pending_key = accept_one(&tracker, &pending);
    let child_key = accept_one(&tracker, &child);

    let confirmed_spend = spend(out(&chain.to_c, 0), &[(0x9, 50)]);
    let h2 = make_block(
        chain.blocks[1].header.hash(),
        2,
        vec![coinbase(2, 0x2), confirmed_spend],
    );
    let reorg = fixture.connect(&h2);
    fixture.catch_up();
    let outcome = tracker.purge(&reorg).expect("purge");

    let mut invalidated: Vec<TxKey> = outcome.invalidated.iter().map(|(key, _)| *key).collect();
    invalidated.sort_unstable();
    assert_eq!(invalidated, vec![pending_key, child_key]);
    assert!(outcome.mined.is_empty());
    assert!(tracker.snapshot().is_empty());
    assert!(!tracker.is_outpoint_spent_by_pending(&out(&chain.to_c, 0)));
}

#[test]
fn reorg_rechains_to_reingested_parents_and_drops_orphaned_spends() {
    let chain = base_chain();
    let fixture = Fixture::new(&chain);

    let cb2 = coinbase(2, 0x2);
    let funding = spend(out(&chain.cb1, 0), &[(0xf, 50)]);
    let h2 = make_block(
        chain.blocks[1].header.hash(),
        2,
        vec![cb2.clone(), funding.clone()],
    );
    fixture.connect(&h2);
    fixture.catch_up();

    let tracker = fixture.tracker();
    let on_funding = spend(out(&funding, 0), &[(0xd, 49)]);
    let on_coinbase = spend(out(&cb2, 0), &[(0xe, 49)]);
    let on_funding_key = accept_one(&tracker, &on_funding);
    let on_coinbase_key = accept_one(&tracker, &on_coinbase);
    let funded = tracker.pending_tx_by_key(&on_funding_key).expect("pending");
    assert!(!funded.is_chained);

    let alt2 = make_block(chain.blocks[1].header.hash(), 20, vec![coinbase(2, 0x7)]);
    let alt3 = make_block(alt2.header.hash(), 21, vec![coinbase(3, 0x7)]);
    fixture.connect(&alt2);
    let reorg = fixture.connect(&alt3);
    assert!(reorg.is_reorg());
    fixture.scanner.undo(&reorg).expect("undo");
    fixture.catch_up();

    // The funding tx went back to the network and is seen again as pending.
    let funding_key = accept_one(&tracker, &funding);
    let outcome = tracker.purge(&reorg).expect("purge");

    assert_eq!(outcome.blocks, 2);
    assert_eq!(outcome.rechained, vec![on_funding_key]);
    assert_eq!(
        outcome.invalidated,
        vec![(on_coinbase_key, on_coinbase.txid())]
    );

    let rechained = tracker.pending_tx_by_key(&on_funding_key).expect("kept");
    assert!(rechained.is_chained);
    assert_eq!(rechained.inputs[0].prevout.key(), Some(funding_key.output(0)));
    assert!(tracker.unspent_for_address(&addr(0xf)).is_empty());
    assert_eq!(tracker.unspent_for_address(&addr(0xd)).len(), 1);
    assert!(tracker.snapshot().txios_for_address(&addr(0xe)).is_empty());
}

#[test]
fn reorg_without_a_pending_parent_invalidates_the_spend() {
    let chain = base_chain();
    let fixture = Fixture::new(&chain);

    let funding = spend(out(&chain.cb1, 0), &[(0xf, 50)]);
    let h2 = make_block(
        chain.blocks[1].header.hash(),
        2,
        vec![coinbase(2, 0x2), funding.clone()],
    );
    fixture.connect(&h2);
    fixture.catch_up();

    let tracker = fixture.tracker();
    let on_funding = spend(out(&funding, 0), &[(0xd, 49)]);
    let key = accept_one(&tracker, &on_funding);

    let alt2 = make_block(chain.blocks[1].header.hash(), 20, vec![coinbase(2, 0x7)]);
    let alt3 = make_block(alt2.header.hash(), 21, vec![coinbase(3, 0x7)]);
    fixture.connect(&alt2);
    let reorg = fixture.connect(&alt3);
    fixture.scanner.undo(&reorg).expect("undo");
    fixture.catch_up();

    let outcome = tracker.purge(&reorg).expect("purge");
    assert_eq!(outcome.invalidated, vec![(key, on_funding.txid())]);
    assert!(outcome.rechained.is_empty());
    assert!(tracker.snapshot().is_empty());
}

#[test]
fn notifications_follow_snapshot_sequence() {
    let chain = base_chain();
    let fixture = Fixture::new(&chain);
    let (sink, notifications) = ChannelSink::new();
    let tracker = fixture.tracker_with(Arc::new(sink));

    let first = spend(out(&chain.cb1, 0), &[(0xd, 50)]);
    let first_key = accept_one(&tracker, &first);
    let note = notifications.try_recv().expect("first notification");
    assert_eq!(note.sequence, 1);
    assert_eq!(note.kind, NotificationKind::NewTx);
    assert_eq!(note.new_pending.len(), 1);
    assert!(note.address_delta[&addr(0xd)].contains(&first_key));
    assert!(note.address_delta[&addr(0xb)].contains(&first_key));
    assert_eq!(tracker.snapshot().sequence(), 1);

    let replacement = spend(out(&chain.cb1, 0), &[(0xe, 49)]);
    accept_one(&tracker, &replacement);
    let note = notifications.try_recv().expect("second notification");
    assert_eq!(note.sequence, 2);
    assert_eq!(note.invalidated, vec![(first_key, first.txid())]);
    assert_eq!(note.final_states, vec![(first_key, TxState::Invalid)]);
    assert!(note.address_delta.contains_key(&addr(0xd)));

    // Nothing changed, nothing published.
    tracker
        .process_batch(vec![replacement.consensus_encode()])
        .expect("duplicate");
    assert!(notifications.try_recv().is_err());
    assert_eq!(tracker.snapshot().sequence(), 2);
}

#[test]
fn readers_keep_their_snapshot_while_batches_land() {
    let chain = base_chain();
    let fixture = Fixture::new(&chain);
    let tracker = fixture.tracker();

    let before = tracker.snapshot();
    accept_one(&tracker, &spend(out(&chain.cb1, 0), &[(0xd, 50)]));
    assert!(before.is_empty());
    assert_eq!(tracker.snapshot().len(), 1);
}

#[test]
fn pending_set_survives_a_clean_restart_only() {
    let chain = base_chain();
    let fixture = Fixture::new(&chain);
    let parent = spend(out(&chain.cb1, 0), &[(0xd, 50)]);
    let child = spend(out(&parent, 0), &[(0xe, 49)]);

    let tracker = fixture.tracker();
    let parent_key = accept_one(&tracker, &parent);
    let child_key = accept_one(&tracker, &child);
    tracker.shutdown().expect("shutdown");
    drop(tracker);

    let reopened = fixture.tracker();
    assert_eq!(reopened.snapshot().len(), 2);
    assert!(reopened.pending_tx_by_key(&parent_key).is_some());
    let restored = reopened.pending_tx_by_key(&child_key).expect("child");
    assert!(restored.is_chained);
    let next = accept_one(&reopened, &spend(out(&chain.to_c, 0), &[(0x9, 50)]));
    assert!(next > child_key);
    drop(reopened);

    // Dropped without shutdown: the table is dirty and gets cleared.
    let dirty = fixture.tracker();
    assert!(dirty.snapshot().is_empty());
    assert_eq!(fixture.store.len(Column::Pending), 0);
}

#[test]
fn workers_process_ingested_transactions() {
    let chain = base_chain();
    let fixture = Fixture::new(&chain);
    let tracker = fixture.tracker();
    tracker.start_workers().expect("workers");

    let tx = spend(out(&chain.cb1, 0), &[(0xd, 50)]);
    let key = tracker.ingest(tx.consensus_encode()).expect("ingest");
    let deadline = Instant::now() + Duration::from_secs(5);
    while tracker.pending_tx_by_key(&key).is_none() {
        assert!(Instant::now() < deadline, "worker never processed the tx");
        thread::sleep(Duration::from_millis(5));
    }

    tracker.shutdown().expect("shutdown");
    let err = tracker
        .ingest(spend(out(&chain.to_c, 0), &[(0xe, 50)]).consensus_encode())
        .expect_err("closed");
    assert_eq!(err.kind, MempoolErrorKind::Shutdown);
}

#[derive(Default)]
struct ScriptedNetwork {
    reply: Option<PeerReply>,
    requested: Mutex<Vec<Hash256>>,
    held: Mutex<Vec<Sender<PeerReply>>>,
}

impl NetworkLayer for ScriptedNetwork {
    fn is_online(&self) -> bool {
        true
    }

    fn request_txs(&self, txids: &[Hash256]) {
        self.requested.lock().expect("requested").extend_from_slice(txids);
    }

    fn send_tx(&self, _txid: Hash256, _raw: &[u8], reply: Sender<PeerReply>) -> Result<(), String> {
        match &self.reply {
            Some(answer) => reply.send(answer.clone()).map_err(|err| err.to_string()),
            None => {
                self.held.lock().expect("held").push(reply);
                Ok(())
            }
        }
    }
}

fn broadcaster(network: ScriptedNetwork) -> Broadcaster {
    Broadcaster::new(Arc::new(network), Duration::from_millis(50))
}

#[test]
fn broadcast_adds_peer_accepted_transactions() {
    let chain = base_chain();
    let fixture = Fixture::new(&chain);
    let tracker = fixture.tracker();
    let tx = spend(out(&chain.cb1, 0), &[(0xd, 50)]);

    let accepting = broadcaster(ScriptedNetwork {
        reply: Some(PeerReply::Accepted),
        ..ScriptedNetwork::default()
    });
    match accepting
        .broadcast(&tracker, tx.consensus_encode())
        .expect("broadcast")
    {
        BroadcastResult::Accepted { key, txid } => {
            assert_eq!(txid, tx.txid());
            assert!(tracker.pending_tx_by_key(&key).is_some());
        }
        other => panic!("unexpected {other:?}"),
    }

    let garbage = accepting.broadcast(&tracker, vec![0xff]).expect("broadcast");
    assert!(matches!(garbage, BroadcastResult::Rejected(reason) if reason.starts_with("structurally invalid")));
}

#[test]
fn broadcast_reports_peer_failures() {
    let chain = base_chain();
    let fixture = Fixture::new(&chain);
    let tracker = fixture.tracker();
    let raw = spend(out(&chain.cb1, 0), &[(0xd, 50)]).consensus_encode();

    let offline = Broadcaster::new(Arc::new(OfflineNetwork), Duration::from_millis(50));
    assert_eq!(
        offline.broadcast(&tracker, raw.clone()).expect("offline"),
        BroadcastResult::Rejected("node is offline, cannot broadcast".to_string())
    );

    let rejecting = broadcaster(ScriptedNetwork {
        reply: Some(PeerReply::Rejected("insufficient fee".to_string())),
        ..ScriptedNetwork::default()
    });
    assert_eq!(
        rejecting.broadcast(&tracker, raw.clone()).expect("rejected"),
        BroadcastResult::Rejected("insufficient fee".to_string())
    );

    let silent = broadcaster(ScriptedNetwork::default());
    assert_eq!(
        silent.broadcast(&tracker, raw).expect("timeout"),
        BroadcastResult::Rejected("tx broadcast timed out (send)".to_string())
    );
    assert!(tracker.snapshot().is_empty());
}

#[test]
fn inventory_requests_only_unknown_transactions() {
    let chain = base_chain();
    let fixture = Fixture::new(&chain);
    let tracker = fixture.tracker();
    let known = spend(out(&chain.cb1, 0), &[(0xd, 50)]);
    accept_one(&tracker, &known);

    let network = ScriptedNetwork::default();
    let unknown = [7u8; 32];
    let requested = tracker.handle_inventory(&network, &[known.txid(), unknown, unknown]);
    assert_eq!(requested, vec![unknown]);
    assert_eq!(*network.requested.lock().expect("requested"), vec![unknown]);

    let none = tracker.handle_inventory(&network, &[known.txid()]);
    assert!(none.is_empty());
    assert_eq!(network.requested.lock().expect("requested").len(), 1);
}

#[test]
fn confirmed_outputs_resolve_with_their_block_key() {
    let chain = base_chain();
    let fixture = Fixture::new(&chain);
    let tracker = fixture.tracker();
    let tx = spend(out(&chain.to_c, 0), &[(0xd, 50)]);
    let key = accept_one(&tracker, &tx);

    let pending = tracker.pending_tx_by_key(&key).expect("pending");
    let funding = pending.inputs[0].prevout.key().expect("resolved");
    assert_eq!(funding, TxKey::confirmed(BlockKey::new(1, 0), 1).output(0));
    assert_eq!(pending.inputs[0].value, Some(50));
    assert_eq!(pending.inputs[0].scraddr, Some(addr(0xc)));
    assert!(tracker.is_outpoint_spent_by_pending(&out(&chain.to_c, 0)));
}

/// Memory store that can pause the first spentness lookup and fail writes.
struct HookedStore {
    inner: Arc<MemoryStore>,
    /// Signals the test, then waits for its release.
    spentness_gate: Mutex<Option<(Sender<()>, Receiver<()>)>>,
    fail_writes: AtomicBool,
}

impl HookedStore {
    fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            spentness_gate: Mutex::new(None),
            fail_writes: AtomicBool::new(false),
        }
    }
}

impl KeyValueStore for HookedStore {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let value = self.inner.get(column, key)?;
        if column == Column::Spentness {
            let gate = self.spentness_gate.lock().expect("gate").take();
            if let Some((reached, release)) = gate {
                reached.send(()).expect("reached");
                release.recv().expect("release");
            }
        }
        Ok(value)
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.inner.put(column, key, value)
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        self.inner.delete(column, key)
    }

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError> {
        self.inner.scan_prefix(column, prefix)
    }

    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError> {
        self.inner.for_each_prefix(column, prefix, visitor)
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("disk full".to_string()));
        }
        self.inner.write_batch(batch)
    }
}

fn hooked_tracker(fixture: &Fixture, store: &Arc<HookedStore>) -> Arc<MempoolTracker<HookedStore>> {
    MempoolTracker::open(
        Arc::clone(store),
        Arc::clone(&fixture.graph),
        fixture.source.clone(),
        Arc::new(NullSink),
        MempoolConfig::default(),
    )
    .expect("tracker")
}

#[test]
fn waiting_tx_is_rejected_once_a_block_spends_its_confirmed_input() {
    let chain = base_chain();
    let fixture = Fixture::new(&chain);
    let (sink, notifications) = ChannelSink::new();
    let tracker = fixture.tracker_with(Arc::new(sink));

    let parent = spend(out(&chain.to_c, 0), &[(0xd, 50)]);
    let waiting = spend_many(&[out(&chain.cb1, 0), out(&parent, 0)], &[(0xe, 90)]);
    let first = tracker
        .process_batch(vec![waiting.consensus_encode()])
        .expect("waiting");
    assert_eq!(first.waiting.len(), 1);
    let waiting_key = first.waiting[0];

    let h2 = make_block(
        chain.blocks[1].header.hash(),
        2,
        vec![coinbase(2, 0x2), spend(out(&chain.cb1, 0), &[(0x9, 50)])],
    );
    let reorg = fixture.connect(&h2);
    fixture.catch_up();
    let purged = tracker.purge(&reorg).expect("purge");
    assert_eq!(purged.rejected.len(), 1);
    assert_eq!(purged.rejected[0].0, waiting_key);
    assert!(purged.rejected[0].1.contains("confirmed-spent"));
    assert_eq!(tracker.waiting_len(), 0);
    let note = notifications.try_recv().expect("purge notification");
    assert_eq!(note.final_states, vec![(waiting_key, TxState::Invalid)]);

    let parent_key = accept_one(&tracker, &parent);
    assert!(tracker.pending_tx_by_key(&parent_key).is_some());
    assert!(tracker.pending_tx_by_hash(&waiting.txid()).is_none());
    assert!(!tracker.is_outpoint_spent_by_pending(&out(&chain.cb1, 0)));
}

#[test]
fn waiting_tx_forgets_inputs_funded_by_a_reorged_block() {
    let chain = base_chain();
    let fixture = Fixture::new(&chain);

    let funding = spend(out(&chain.cb1, 0), &[(0xf, 50)]);
    let h2 = make_block(
        chain.blocks[1].header.hash(),
        2,
        vec![coinbase(2, 0x2), funding.clone()],
    );
    fixture.connect(&h2);
    fixture.catch_up();

    let tracker = fixture.tracker();
    let parent = spend(out(&chain.to_c, 0), &[(0xd, 50)]);
    let waiting = spend_many(&[out(&funding, 0), out(&parent, 0)], &[(0xe, 90)]);
    let first = tracker
        .process_batch(vec![waiting.consensus_encode()])
        .expect("waiting");
    let waiting_key = first.waiting[0];

    let alt2 = make_block(chain.blocks[1].header.hash(), 20, vec![coinbase(2, 0x7)]);
    let alt3 = make_block(alt2.header.hash(), 21, vec![coinbase(3, 0x7)]);
    fixture.connect(&alt2);
    let reorg = fixture.connect(&alt3);
    fixture.scanner.undo(&reorg).expect("undo");
    fixture.catch_up();
    let purged = tracker.purge(&reorg).expect("purge");
    assert!(purged.rejected.is_empty());
    assert!(purged.accepted.is_empty());
    assert_eq!(tracker.waiting_len(), 1);

    // The parent alone no longer completes it: its other funding is gone.
    let with_parent = tracker
        .process_batch(vec![parent.consensus_encode()])
        .expect("parent");
    let accepted: Vec<Hash256> = with_parent.accepted.iter().map(|(_, txid)| *txid).collect();
    assert_eq!(accepted, vec![parent.txid()]);
    assert_eq!(with_parent.waiting, vec![waiting_key]);

    let funding_key = accept_one(&tracker, &funding);
    let pending = tracker.pending_tx_by_key(&waiting_key).expect("accepted");
    assert_eq!(pending.inputs[0].prevout.key(), Some(funding_key.output(0)));
    assert!(pending.is_chained);
    assert_eq!(tracker.waiting_len(), 0);
}

#[test]
fn block_connected_mid_batch_is_seen_before_merge() {
    let chain = base_chain();
    let fixture = Fixture::new(&chain);
    let store = Arc::new(HookedStore::new(Arc::clone(&fixture.store)));
    let tracker = hooked_tracker(&fixture, &store);

    let (reached_tx, reached) = bounded(1);
    let (release, release_rx) = bounded(1);
    *store.spentness_gate.lock().expect("gate") = Some((reached_tx, release_rx));

    let late = spend(out(&chain.to_c, 0), &[(0xd, 50)]);
    let worker = {
        let tracker = Arc::clone(&tracker);
        let raw = late.consensus_encode();
        thread::spawn(move || tracker.process_batch(vec![raw]))
    };
    reached
        .recv_timeout(Duration::from_secs(5))
        .expect("batch reached the spentness check");

    let h2 = make_block(
        chain.blocks[1].header.hash(),
        2,
        vec![coinbase(2, 0x2), spend(out(&chain.to_c, 0), &[(0x9, 50)])],
    );
    let reorg = fixture.connect(&h2);
    fixture.catch_up();
    tracker.purge(&reorg).expect("purge");
    release.send(()).expect("release");

    let outcome = worker.join().expect("worker").expect("batch");
    assert!(outcome.accepted.is_empty());
    assert_eq!(outcome.rejected.len(), 1);
    assert!(outcome.rejected[0].1.contains("confirmed-spent"));
    assert!(tracker.snapshot().is_empty());
    assert!(!tracker.is_outpoint_spent_by_pending(&out(&chain.to_c, 0)));
}

#[test]
fn failed_write_keeps_waiting_transactions() {
    let chain = base_chain();
    let fixture = Fixture::new(&chain);
    let store = Arc::new(HookedStore::new(Arc::clone(&fixture.store)));
    let tracker = hooked_tracker(&fixture, &store);

    let parent = spend(out(&chain.cb1, 0), &[(0xd, 50)]);
    let child = spend(out(&parent, 0), &[(0xe, 49)]);
    tracker
        .process_batch(vec![child.consensus_encode()])
        .expect("child");
    assert_eq!(tracker.waiting_len(), 1);

    store.fail_writes.store(true, Ordering::SeqCst);
    tracker
        .process_batch(vec![parent.consensus_encode()])
        .expect_err("write fails");
    assert_eq!(tracker.waiting_len(), 1);
    assert!(tracker.snapshot().is_empty());

    store.fail_writes.store(false, Ordering::SeqCst);
    let outcome = tracker
        .process_batch(vec![parent.consensus_encode()])
        .expect("parent");
    let accepted: Vec<Hash256> = outcome.accepted.iter().map(|(_, txid)| *txid).collect();
    assert_eq!(accepted, vec![parent.txid(), child.txid()]);
    assert_eq!(tracker.waiting_len(), 0);
}
