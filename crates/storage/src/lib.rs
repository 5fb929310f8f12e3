//! Ordered key-value storage used by the indexer.
//!
//! Every logical table is a [`Column`]. Writers collect puts and deletes into
//! a [`WriteBatch`] which backends apply all-or-nothing.

use std::fmt;
use std::sync::Arc;

use smallvec::SmallVec;

pub mod memory;

#[cfg(feature = "fjall")]
pub mod fjall;

#[derive(Debug)]
pub enum StoreError {
    Backend(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Backend(message) => write!(f, "storage backend: {message}"),
        }
    }
}

impl std::error::Error for StoreError {}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum Column {
    /// Header graph snapshot, keyed by block hash.
    Headers,
    /// Per-address history segments, keyed by scraddr ++ hgtx.
    Subhistory,
    /// Folded per-address summaries, keyed by scraddr.
    Summary,
    /// txid ++ tx key, empty value.
    TxHints,
    /// Confirmed output records, keyed by output io key.
    TxOut,
    /// Spent output io key -> spending input io key.
    Spentness,
    /// Raw pending transactions, keyed by pending tx key.
    Pending,
    Meta,
    /// Addresses whose summary must be refolded, keyed by scraddr.
    SummaryDirty,
}

impl Column {
    pub const ALL: [Column; 9] = [
        Column::Headers,
        Column::Subhistory,
        Column::Summary,
        Column::TxHints,
        Column::TxOut,
        Column::Spentness,
        Column::Pending,
        Column::Meta,
        Column::SummaryDirty,
    ];

    pub const fn index(self) -> usize {
        match self {
            Column::Headers => 0,
            Column::Subhistory => 1,
            Column::Summary => 2,
            Column::TxHints => 3,
            Column::TxOut => 4,
            Column::Spentness => 5,
            Column::Pending => 6,
            Column::Meta => 7,
            Column::SummaryDirty => 8,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Column::Headers => "headers",
            Column::Subhistory => "subhistory",
            Column::Summary => "summary",
            Column::TxHints => "tx_hints",
            Column::TxOut => "txout",
            Column::Spentness => "spentness",
            Column::Pending => "pending",
            Column::Meta => "meta",
            Column::SummaryDirty => "summary_dirty",
        }
    }
}

/// Byte buffers that keep up to `$inline` bytes without a heap allocation.
macro_rules! inline_bytes {
    ($name:ident, $inline:literal) => {
        #[derive(Clone, Debug, Eq, PartialEq)]
        pub struct $name(SmallVec<[u8; $inline]>);

        impl $name {
            pub fn as_slice(&self) -> &[u8] {
                &self.0
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }

        impl From<Vec<u8>> for $name {
            fn from(bytes: Vec<u8>) -> Self {
                Self(SmallVec::from_vec(bytes))
            }
        }

        impl From<&[u8]> for $name {
            fn from(bytes: &[u8]) -> Self {
                Self(SmallVec::from_slice(bytes))
            }
        }

        impl<const N: usize> From<[u8; N]> for $name {
            fn from(bytes: [u8; N]) -> Self {
                Self(SmallVec::from_slice(&bytes))
            }
        }

        impl<const N: usize> From<&[u8; N]> for $name {
            fn from(bytes: &[u8; N]) -> Self {
                Self(SmallVec::from_slice(bytes))
            }
        }
    };
}

// Io keys and subhistory keys of 20-byte-hash addresses stay inline.
inline_bytes!(WriteKey, 32);
inline_bytes!(WriteValue, 32);

#[derive(Clone, Debug)]
pub enum WriteOp {
    Put {
        column: Column,
        key: WriteKey,
        value: WriteValue,
    },
    Delete {
        column: Column,
        key: WriteKey,
    },
}

#[derive(Clone, Debug, Default)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            ops: Vec::with_capacity(capacity),
        }
    }

    pub fn put(&mut self, column: Column, key: impl Into<WriteKey>, value: impl Into<WriteValue>) {
        self.ops.push(WriteOp::Put {
            column,
            key: key.into(),
            value: value.into(),
        });
    }

    pub fn delete(&mut self, column: Column, key: impl Into<WriteKey>) {
        self.ops.push(WriteOp::Delete {
            column,
            key: key.into(),
        });
    }

    pub fn iter(&self) -> impl Iterator<Item = &WriteOp> {
        self.ops.iter()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

pub type ScanResult = Vec<(Vec<u8>, Vec<u8>)>;
pub type PrefixVisitor<'a> = dyn FnMut(&[u8], &[u8]) -> Result<(), StoreError> + 'a;

pub trait KeyValueStore: Send + Sync {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;
    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError>;
    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError>;
    /// Entries whose key starts with `prefix`, in ascending key order.
    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError>;
    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError>;
    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError>;
}

impl<T: KeyValueStore + ?Sized> KeyValueStore for Arc<T> {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.as_ref().get(column, key)
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.as_ref().put(column, key, value)
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        self.as_ref().delete(column, key)
    }

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError> {
        self.as_ref().scan_prefix(column, prefix)
    }

    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError> {
        self.as_ref().for_each_prefix(column, prefix, visitor)
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        self.as_ref().write_batch(batch)
    }
}

/// Deletes every key under `prefix` in one batch.
pub fn clear_prefix<S: KeyValueStore + ?Sized>(
    store: &S,
    column: Column,
    prefix: &[u8],
) -> Result<usize, StoreError> {
    let mut batch = WriteBatch::new();
    store.for_each_prefix(column, prefix, &mut |key, _| {
        batch.delete(column, key);
        Ok(())
    })?;
    let removed = batch.len();
    store.write_batch(&batch)?;
    Ok(removed)
}
