//! Wires the header graph, the scanner and the mempool tracker together
//! over one store.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chainscan_chainstate::{
    BlockKey, BlockSource, ChainError, HeaderGraph, HeaderIndex, HeaderRecord, ReorgState,
    SharedHeaderGraph, SourceError, TxKey,
};
use chainscan_mempool::{
    BatchOutcome, BroadcastResult, Broadcaster, MempoolConfig, MempoolError, MempoolTracker,
    NetworkLayer, NotificationSink, DEFAULT_BROADCAST_TIMEOUT,
};
use chainscan_primitives::{hash256_to_hex, Hash256, ScrAddr};
use chainscan_scanner::{AddressSummary, ScanConfig, ScanError, Scanner, SubHistory};
use chainscan_storage::{KeyValueStore, StoreError};
use serde::Serialize;

#[derive(Clone, Copy, Debug)]
pub struct EngineConfig {
    pub scan: ScanConfig,
    pub mempool: MempoolConfig,
    pub broadcast_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            scan: ScanConfig::default(),
            mempool: MempoolConfig::default(),
            broadcast_timeout: DEFAULT_BROADCAST_TIMEOUT,
        }
    }
}

#[derive(Debug)]
pub enum EngineError {
    Chain(ChainError),
    Scan(ScanError),
    Mempool(MempoolError),
    Source(SourceError),
    Store(StoreError),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Chain(err) => write!(f, "{err}"),
            EngineError::Scan(err) => write!(f, "{err}"),
            EngineError::Mempool(err) => write!(f, "{err}"),
            EngineError::Source(err) => write!(f, "{err}"),
            EngineError::Store(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<ChainError> for EngineError {
    fn from(err: ChainError) -> Self {
        EngineError::Chain(err)
    }
}

impl From<ScanError> for EngineError {
    fn from(err: ScanError) -> Self {
        EngineError::Scan(err)
    }
}

impl From<MempoolError> for EngineError {
    fn from(err: MempoolError) -> Self {
        EngineError::Mempool(err)
    }
}

impl From<SourceError> for EngineError {
    fn from(err: SourceError) -> Self {
        EngineError::Source(err)
    }
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        EngineError::Store(err)
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct EngineStatus {
    pub headers: usize,
    pub top_height: Option<u32>,
    pub top_hash: Option<String>,
    pub scan_height: Option<u32>,
    pub scan_batches: u64,
    pub pending_txs: usize,
    pub waiting_txs: usize,
    pub mempool_sequence: u64,
    pub ingest_queued: usize,
}

pub struct Engine<S> {
    graph: Arc<SharedHeaderGraph>,
    headers: HeaderIndex<S>,
    scanner: Scanner<S>,
    mempool: Arc<MempoolTracker<S>>,
    broadcaster: Broadcaster,
    network: Arc<dyn NetworkLayer>,
    /// Serializes block application.
    block_lock: Mutex<()>,
}

impl<S: KeyValueStore + 'static> Engine<S> {
    /// Loads the stored header graph and pending set, then scans whatever
    /// the previous run left unscanned.
    pub fn open(
        config: EngineConfig,
        store: Arc<S>,
        blocks: Arc<dyn BlockSource>,
        network: Arc<dyn NetworkLayer>,
        sink: Arc<dyn NotificationSink>,
    ) -> Result<Self, EngineError> {
        let headers = HeaderIndex::new(Arc::clone(&store));
        let graph = Arc::new(SharedHeaderGraph::new(headers.load_graph()?));
        let scanner = Scanner::new(
            Arc::clone(&store),
            Arc::clone(&graph),
            Arc::clone(&blocks),
            config.scan,
        )?;
        let mempool = MempoolTracker::open(
            Arc::clone(&store),
            Arc::clone(&graph),
            blocks,
            sink,
            config.mempool,
        )?;
        mempool.start_workers()?;
        let engine = Self {
            graph,
            headers,
            scanner,
            mempool,
            broadcaster: Broadcaster::new(Arc::clone(&network), config.broadcast_timeout),
            network,
            block_lock: Mutex::new(()),
        };
        engine.catch_up()?;
        Ok(engine)
    }

    fn catch_up(&self) -> Result<(), EngineError> {
        let graph = self.graph.snapshot();
        let Some(top) = graph.top_height() else {
            return Ok(());
        };
        // Stopped between persisting a reorg's headers and undoing it.
        if let Some(scanned) = self.scanner.scan_top()? {
            if !graph.is_main_branch(&scanned.hash) {
                let undone = self.scanner.undo(&ReorgState::default())?;
                chainscan_log::log_warn!(
                    "scan top {} left the best chain; undid {} blocks",
                    hash256_to_hex(&scanned.hash),
                    undone.blocks
                );
            }
        }
        let from = self.scanner.scan_from()?;
        if from <= top {
            let report = self.scanner.scan(from, top)?;
            chainscan_log::log_info!(
                "caught up {} blocks ({} txs) to height {}",
                report.blocks,
                report.transactions,
                top
            );
        }
        self.scanner.update_summary(false)?;
        Ok(())
    }

    /// Adds headers of blocks available from the block source, brings the
    /// scanned history onto the new best chain and purges the mempool.
    pub fn add_blocks(&self, records: Vec<HeaderRecord>) -> Result<ReorgState, EngineError> {
        let _guard = self.block_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let (state, dirty) = self.graph.update(|graph| {
            graph.add_headers(records);
            let state = graph.organize();
            (state, graph.take_dirty())
        });
        let graph = self.graph.snapshot();
        self.headers.persist(&graph, &dirty)?;

        if state.is_reorg() {
            let branch = state
                .branch_point
                .and_then(|id| graph.get(id))
                .and_then(|node| node.height);
            chainscan_log::log_warn!(
                "reorg: new top {} at height {:?}, branch point height {:?}",
                top_hash_hex(&graph).unwrap_or_default(),
                graph.top_height(),
                branch
            );
            let undone = self.scanner.undo(&state)?;
            chainscan_log::log_info!("undid {} stale blocks", undone.blocks);
        }

        if let Some(top) = graph.top_height() {
            let from = self.scanner.scan_from()?;
            if from <= top {
                self.scanner.scan(from, top)?;
            }
            self.scanner.update_summary(false)?;
        }

        if state.has_new_top || state.is_reorg() {
            let purged = self.mempool.purge(&state)?;
            if !purged.mined.is_empty() || !purged.invalidated.is_empty() {
                chainscan_log::log_debug!(
                    "purge: {} mined, {} invalidated",
                    purged.mined.len(),
                    purged.invalidated.len()
                );
            }
        }
        Ok(state)
    }

    /// Queues a raw transaction for the mempool workers.
    pub fn ingest(&self, raw: Vec<u8>) -> Result<TxKey, EngineError> {
        Ok(self.mempool.ingest(raw)?)
    }

    /// Processes raw transactions on the calling thread.
    pub fn process_txs(&self, raws: Vec<Vec<u8>>) -> Result<BatchOutcome, EngineError> {
        Ok(self.mempool.process_batch(raws)?)
    }

    pub fn broadcast(&self, raw: Vec<u8>) -> Result<BroadcastResult, EngineError> {
        Ok(self.broadcaster.broadcast(&self.mempool, raw)?)
    }

    /// Requests announced transactions the mempool does not have yet.
    pub fn handle_inventory(&self, txids: &[Hash256]) -> Vec<Hash256> {
        self.mempool.handle_inventory(self.network.as_ref(), txids)
    }

    pub fn status(&self) -> Result<EngineStatus, EngineError> {
        let graph = self.graph.snapshot();
        let snapshot = self.mempool.snapshot();
        Ok(EngineStatus {
            headers: graph.len(),
            top_height: graph.top_height(),
            top_hash: top_hash_hex(&graph),
            scan_height: self.scanner.scan_top()?.map(|top| top.height),
            scan_batches: self.scanner.batch_counter()?,
            pending_txs: snapshot.len(),
            waiting_txs: self.mempool.waiting_len(),
            mempool_sequence: snapshot.sequence(),
            ingest_queued: self.mempool.queued(),
        })
    }

    pub fn summary(&self, scraddr: &ScrAddr) -> Result<Option<AddressSummary>, EngineError> {
        Ok(self.scanner.summary(scraddr)?)
    }

    pub fn subhistory(&self, scraddr: &ScrAddr) -> Result<Vec<(BlockKey, SubHistory)>, EngineError> {
        Ok(self.scanner.subhistory(scraddr)?)
    }

    pub fn graph(&self) -> Arc<HeaderGraph> {
        self.graph.snapshot()
    }

    pub fn scanner(&self) -> &Scanner<S> {
        &self.scanner
    }

    pub fn mempool(&self) -> &Arc<MempoolTracker<S>> {
        &self.mempool
    }

    /// Stops the mempool workers and persists the pending set.
    pub fn shutdown(&self) -> Result<(), EngineError> {
        self.mempool.shutdown()?;
        chainscan_log::log_info!("engine stopped");
        Ok(())
    }
}

fn top_hash_hex(graph: &HeaderGraph) -> Option<String> {
    graph.top().map(|node| hash256_to_hex(&node.hash))
}
