//! `KeyValueStore` over a fjall keyspace, one partition per column.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use fjall::{Batch, Config, Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};

use crate::{Column, KeyValueStore, PrefixVisitor, ScanResult, StoreError, WriteBatch, WriteOp};

const SLOW_COMMIT: Duration = Duration::from_millis(500);
/// Only every n-th slow commit is logged.
const SLOW_COMMIT_LOG_EVERY: u64 = 64;

#[derive(Clone, Debug, Default)]
pub struct FjallOptions {
    pub cache_bytes: Option<u64>,
    pub memtable_bytes: Option<u32>,
    /// Fsync the journal on every batch instead of buffering.
    pub sync_writes: bool,
}

pub struct FjallStore {
    keyspace: Keyspace,
    partitions: Vec<PartitionHandle>,
    durability: PersistMode,
    slow_commits: AtomicU64,
}

impl FjallStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::open_with_options(path, FjallOptions::default())
    }

    pub fn open_with_options(
        path: impl AsRef<Path>,
        options: FjallOptions,
    ) -> Result<Self, StoreError> {
        let config = match options.cache_bytes {
            Some(bytes) => Config::new(path).cache_size(bytes),
            None => Config::new(path),
        };
        let partition_options = match options.memtable_bytes {
            Some(bytes) => PartitionCreateOptions::default().max_memtable_size(bytes),
            None => PartitionCreateOptions::default(),
        };
        let keyspace = config.open().map_err(map_err)?;
        let partitions = Column::ALL
            .iter()
            .map(|column| keyspace.open_partition(column.as_str(), partition_options.clone()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(map_err)?;
        chainscan_log::log_debug!("opened fjall keyspace with {} partitions", partitions.len());
        Ok(Self {
            keyspace,
            partitions,
            durability: if options.sync_writes {
                PersistMode::SyncAll
            } else {
                PersistMode::Buffer
            },
            slow_commits: AtomicU64::new(0),
        })
    }

    fn partition(&self, column: Column) -> Result<&PartitionHandle, StoreError> {
        self.partitions
            .get(column.index())
            .ok_or_else(|| StoreError::Backend(format!("missing partition {}", column.as_str())))
    }

    /// Flushes buffered journal writes to disk.
    pub fn persist(&self) -> Result<(), StoreError> {
        self.keyspace.persist(PersistMode::SyncAll).map_err(map_err)
    }

    fn note_slow_commit(&self, elapsed: Duration, ops: usize) {
        let seen = self.slow_commits.fetch_add(1, Ordering::Relaxed);
        if seen % SLOW_COMMIT_LOG_EVERY == 0 {
            chainscan_log::log_warn!(
                "slow fjall commit: {}ms for {} ops ({} slow commits so far)",
                elapsed.as_millis(),
                ops,
                seen + 1
            );
        }
    }
}

impl KeyValueStore for FjallStore {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let value = self.partition(column)?.get(key).map_err(map_err)?;
        Ok(value.map(|bytes| bytes.to_vec()))
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.partition(column)?.insert(key, value).map_err(map_err)
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        self.partition(column)?.remove(key).map_err(map_err)
    }

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError> {
        self.partition(column)?
            .prefix(prefix)
            .map(|entry| {
                entry
                    .map(|(key, value)| (key.to_vec(), value.to_vec()))
                    .map_err(map_err)
            })
            .collect()
    }

    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError> {
        let partition = self.partition(column)?;
        for entry in partition.prefix(prefix) {
            let (key, value) = entry.map_err(map_err)?;
            visitor(key.as_ref(), value.as_ref())?;
        }
        Ok(())
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut commit = Batch::with_capacity(self.keyspace.clone(), batch.len())
            .durability(Some(self.durability));
        for op in batch.iter() {
            match op {
                WriteOp::Put { column, key, value } => {
                    commit.insert(self.partition(*column)?, key.as_slice(), value.as_slice());
                }
                WriteOp::Delete { column, key } => {
                    commit.remove(self.partition(*column)?, key.as_slice());
                }
            }
        }
        let started = Instant::now();
        commit.commit().map_err(map_err)?;
        let elapsed = started.elapsed();
        if elapsed >= SLOW_COMMIT {
            self.note_slow_commit(elapsed, batch.len());
        }
        Ok(())
    }
}

fn map_err(err: fjall::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}
