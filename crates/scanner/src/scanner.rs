//! The scan pipeline.
//!
//! A loader thread fetches and validates blocks and cuts them into batches.
//! The calling thread runs both passes on the worker pool and hands each
//! batch to a writer thread. Outputs created by batches the writer has not
//! committed yet stay in an in-flight table so later batches can spend them.

use std::collections::{HashMap, VecDeque};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use chainscan_chainstate::{
    BlockKey, BlockSource, HeaderGraph, HeaderNode, ReorgState, SharedHeaderGraph, StoreResolver,
    WorkQueue,
};
use chainscan_primitives::{hash256_to_hex, OutPoint, ScrAddr};
use chainscan_storage::{Column, KeyValueStore};
use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::batch::{load_block, BatchPlanner, ScanBatch};
use crate::commit::{
    commit_batch, read_batch_counter, read_position, ChainPosition, META_SCAN_TOP_HASH,
    META_SCAN_TOP_HEIGHT,
};
use crate::error::ScanError;
use crate::history::{AddressSummary, HistoryKey, SubHistory};
use crate::passes::{input_pass, lookup_prevouts, output_pass, BatchDelta, OutputTable};
use crate::summary::{fold_address, update_summary, SummaryReport};
use crate::undo::{undo_stale_blocks, UndoReport};

pub const DEFAULT_BATCH_BYTES: usize = 32 * 1024 * 1024;
pub const DEFAULT_WRITE_QUEUE_DEPTH: usize = 2;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ScanConfig {
    pub threads: usize,
    /// Decoded block bytes per batch.
    pub batch_bytes: usize,
    /// Batches allowed to wait for the writer before the passes stall.
    pub write_queue_depth: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            threads: thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(1),
            batch_bytes: DEFAULT_BATCH_BYTES,
            write_queue_depth: DEFAULT_WRITE_QUEUE_DEPTH,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ScanReport {
    pub batches: u64,
    pub blocks: u64,
    pub transactions: u64,
    pub top: Option<ChainPosition>,
}

struct WriteJob {
    sequence: u64,
    top: ChainPosition,
    delta: BatchDelta,
}

type Ack = (u64, Result<u64, ScanError>);

/// Batches handed to the writer and not yet acknowledged, with the
/// outpoints each one added to the in-flight table.
struct Outstanding {
    pending: VecDeque<(u64, Vec<OutPoint>)>,
    inflight: OutputTable,
}

impl Outstanding {
    fn new() -> Self {
        Self {
            pending: VecDeque::new(),
            inflight: OutputTable::new(),
        }
    }

    fn add(&mut self, sequence: u64, created: OutputTable) {
        let keys = created.keys().cloned().collect();
        self.inflight.extend(created);
        self.pending.push_back((sequence, keys));
    }

    fn wait_oldest(&mut self, acks: &Receiver<Ack>) -> Result<(), ScanError> {
        let (sequence, result) = acks
            .recv()
            .map_err(|_| ScanError::Interrupted("writer"))?;
        result?;
        match self.pending.pop_front() {
            Some((expected, keys)) if expected == sequence => {
                for key in keys {
                    self.inflight.remove(&key);
                }
                Ok(())
            }
            _ => Err(ScanError::Interrupted("writer")),
        }
    }
}

pub struct Scanner<S> {
    store: Arc<S>,
    graph: Arc<SharedHeaderGraph>,
    source: Arc<dyn BlockSource>,
    resolver: StoreResolver<S>,
    pool: rayon::ThreadPool,
    config: ScanConfig,
}

impl<S: KeyValueStore + 'static> Scanner<S> {
    pub fn new(
        store: Arc<S>,
        graph: Arc<SharedHeaderGraph>,
        source: Arc<dyn BlockSource>,
        config: ScanConfig,
    ) -> Result<Self, ScanError> {
        let threads = config.threads.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("scan-worker-{i}"))
            .build()
            .map_err(|err| ScanError::ThreadPool(err.to_string()))?;
        let resolver = StoreResolver::new(Arc::clone(&store), Arc::clone(&graph));
        Ok(Self {
            store,
            graph,
            source,
            resolver,
            pool,
            config: ScanConfig { threads, ..config },
        })
    }

    pub fn config(&self) -> ScanConfig {
        self.config
    }

    pub fn scan_top(&self) -> Result<Option<ChainPosition>, ScanError> {
        read_position(self.store.as_ref(), META_SCAN_TOP_HASH, META_SCAN_TOP_HEIGHT)
    }

    pub fn batch_counter(&self) -> Result<u64, ScanError> {
        read_batch_counter(self.store.as_ref())
    }

    /// First height that still needs scanning on the current best chain.
    pub fn scan_from(&self) -> Result<u32, ScanError> {
        let Some(position) = self.scan_top()? else {
            return Ok(0);
        };
        let graph = self.graph.snapshot();
        let Some(id) = graph.id_of(&position.hash) else {
            chainscan_log::log_warn!(
                "scan top {} is not a known header; rescanning from genesis",
                hash256_to_hex(&position.hash)
            );
            return Ok(0);
        };
        Ok(graph
            .main_ancestor(id)
            .and_then(|id| graph.get(id)?.height)
            .map_or(0, |height| height + 1))
    }

    /// Scans main-branch heights `start..=end`. On error nothing at or above
    /// the failing block is committed.
    pub fn scan(&self, start: u32, end: u32) -> Result<ScanReport, ScanError> {
        let graph = self.graph.snapshot();
        let nodes: Vec<HeaderNode> = graph.main_range(start, end).into_iter().cloned().collect();
        let mut report = ScanReport {
            top: self.scan_top()?,
            ..ScanReport::default()
        };
        if nodes.is_empty() {
            return Ok(report);
        }
        let started = Instant::now();
        let last_height = nodes.last().and_then(|node| node.height).unwrap_or(end);
        chainscan_log::log_debug!(
            "scanning heights {}..={} with {} threads",
            start,
            last_height,
            self.config.threads
        );

        let depth = self.config.write_queue_depth.max(1);
        let loaded: WorkQueue<Result<ScanBatch, ScanError>> = WorkQueue::bounded(depth);
        let writes: WorkQueue<WriteJob> = WorkQueue::bounded(depth);
        let (ack_tx, ack_rx) = unbounded::<Ack>();
        let write_queue = &writes;

        let result = thread::scope(|scope| {
            let loader = thread::Builder::new()
                .name("scan-loader".to_string())
                .spawn_scoped(scope, || self.load_batches(&nodes, &loaded));
            let writer = thread::Builder::new()
                .name("scan-writer".to_string())
                .spawn_scoped(scope, move || self.write_batches(write_queue, ack_tx));
            let (Ok(_loader), Ok(_writer)) = (loader, writer) else {
                loaded.terminate();
                writes.terminate();
                return Err(ScanError::Interrupted("thread spawn"));
            };

            let mut outstanding = Outstanding::new();
            let outcome = self.run_passes(&loaded, &writes, &ack_rx, &mut outstanding, &mut report);
            if outcome.is_err() {
                loaded.terminate();
            }
            writes.completed();
            let mut drained = Ok(());
            while !outstanding.pending.is_empty() {
                if let Err(err) = outstanding.wait_oldest(&ack_rx) {
                    drained = Err(err);
                    break;
                }
            }
            outcome.and(drained)
        });

        match result {
            Ok(()) => {
                report.top = self.scan_top()?;
                chainscan_log::log_info!(
                    "scanned {} blocks ({} txs) in {} batches up to height {} in {}ms",
                    report.blocks,
                    report.transactions,
                    report.batches,
                    report.top.map_or(0, |top| top.height),
                    started.elapsed().as_millis()
                );
                Ok(report)
            }
            Err(err) => {
                chainscan_log::log_error!("scan stopped: {}", err);
                Err(err)
            }
        }
    }

    fn load_batches(&self, nodes: &[HeaderNode], loaded: &WorkQueue<Result<ScanBatch, ScanError>>) {
        let mut planner = BatchPlanner::new(self.config.batch_bytes);
        for node in nodes {
            if loaded.is_closed() {
                return;
            }
            match load_block(self.source.as_ref(), node) {
                Ok(block) => {
                    if let Some(batch) = planner.push(block) {
                        if loaded.push(Ok(batch)).is_err() {
                            return;
                        }
                    }
                }
                Err(err) => {
                    let _ = loaded.push(Err(err));
                    loaded.completed();
                    return;
                }
            }
        }
        if let Some(batch) = planner.finish() {
            let _ = loaded.push(Ok(batch));
        }
        loaded.completed();
    }

    fn write_batches(&self, writes: &WorkQueue<WriteJob>, acks: Sender<Ack>) {
        while let Some(job) = writes.pop() {
            let result = commit_batch(self.store.as_ref(), &job.delta, job.top);
            let failed = result.is_err();
            if acks.send((job.sequence, result)).is_err() || failed {
                writes.terminate();
                return;
            }
        }
    }

    fn run_passes(
        &self,
        loaded: &WorkQueue<Result<ScanBatch, ScanError>>,
        writes: &WorkQueue<WriteJob>,
        acks: &Receiver<Ack>,
        outstanding: &mut Outstanding,
        report: &mut ScanReport,
    ) -> Result<(), ScanError> {
        let threads = self.config.threads;
        let depth = self.config.write_queue_depth.max(1);
        while let Some(loaded_batch) = loaded.pop() {
            let batch = loaded_batch?;
            let Some(last) = batch.last() else {
                continue;
            };
            let top = ChainPosition {
                hash: last.hash,
                height: last.height,
            };
            chainscan_log::log_debug!(
                "scan batch {} heights {}..={} ({} bytes)",
                batch.sequence,
                batch.first_height().unwrap_or(top.height),
                top.height,
                batch.bytes
            );

            let (outputs, created) = self.pool.install(|| output_pass(&batch, threads));
            let prevouts = self.pool.install(|| {
                lookup_prevouts(&batch, &created, &outstanding.inflight, &self.resolver)
            })?;
            let inputs = self.pool.install(|| input_pass(&batch, &prevouts, threads));
            let delta = outputs.merge(inputs);

            while outstanding.pending.len() >= depth {
                outstanding.wait_oldest(acks)?;
            }
            outstanding.add(batch.sequence, created);
            let job = WriteJob {
                sequence: batch.sequence,
                top,
                delta,
            };
            if writes.push(job).is_err() {
                outstanding.pending.pop_back();
                return Err(ScanError::Interrupted("writer"));
            }
            report.batches += 1;
            report.blocks += batch.blocks.len() as u64;
            report.transactions += batch.tx_count() as u64;
        }
        Ok(())
    }

    /// Removes history of scanned blocks that left the main branch and
    /// moves the scan top back onto it.
    pub fn undo(&self, reorg: &ReorgState) -> Result<UndoReport, ScanError> {
        let graph = self.graph.snapshot();
        let report = undo_stale_blocks(
            self.store.as_ref(),
            &graph,
            self.source.as_ref(),
            &self.resolver,
        )?;
        if let Some(branch) = reorg.branch_point.and_then(|id| graph.get(id)) {
            chainscan_log::log_debug!(
                "reorg branch point {} at height {}, scan top now {}",
                hash256_to_hex(&branch.hash),
                branch.height.unwrap_or(0),
                report.top.map_or(0, |top| top.height)
            );
        }
        Ok(report)
    }

    pub fn update_summary(&self, force: bool) -> Result<SummaryReport, ScanError> {
        update_summary(self.store.as_ref(), &self.graph.snapshot(), force)
    }

    /// Every stored row for `scraddr` on the current main branch.
    pub fn subhistory(&self, scraddr: &ScrAddr) -> Result<Vec<(BlockKey, SubHistory)>, ScanError> {
        let graph = self.graph.snapshot();
        subhistory_rows(self.store.as_ref(), &graph, scraddr)
    }

    pub fn summary(&self, scraddr: &ScrAddr) -> Result<Option<AddressSummary>, ScanError> {
        let Some(bytes) = self.store.get(Column::Summary, scraddr.as_bytes())? else {
            return Ok(None);
        };
        AddressSummary::decode(&bytes).map(Some).ok_or_else(|| {
            ScanError::Chain(chainscan_chainstate::ChainError::corrupt(
                scraddr.as_bytes(),
                "bad address summary",
            ))
        })
    }

    /// Summary folded directly from the rows, bypassing the stored one.
    pub fn fold_summary(&self, scraddr: &ScrAddr) -> Result<AddressSummary, ScanError> {
        fold_address(self.store.as_ref(), &self.graph.snapshot(), scraddr)
    }
}

fn subhistory_rows<S: KeyValueStore + ?Sized>(
    store: &S,
    graph: &HeaderGraph,
    scraddr: &ScrAddr,
) -> Result<Vec<(BlockKey, SubHistory)>, ScanError> {
    let mut rows = HashMap::new();
    for (key, value) in store.scan_prefix(Column::Subhistory, scraddr.as_bytes())? {
        let Some(history_key) = HistoryKey::from_row_key(&key) else {
            continue;
        };
        if &history_key.scraddr != scraddr || !graph.is_valid_block_key(history_key.block) {
            continue;
        }
        let history = SubHistory::decode(&value).ok_or_else(|| {
            ScanError::Chain(chainscan_chainstate::ChainError::corrupt(&key, "bad subhistory row"))
        })?;
        rows.insert(history_key.block, history);
    }
    let mut rows: Vec<_> = rows.into_iter().collect();
    rows.sort_by_key(|(block, _)| *block);
    Ok(rows)
}
