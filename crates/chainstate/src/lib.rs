//! Header graph, chain reorganization tracking and the shared lookup layer
//! (db keys, outpoint resolution, block sources) used by the scanner and
//! the mempool tracker.

pub mod error;
pub mod graph;
pub mod index;
pub mod keys;
pub mod queue;
pub mod resolver;
pub mod shared;
pub mod source;

pub use error::ChainError;
pub use graph::{BlockLocation, HeaderGraph, HeaderId, HeaderNode, HeaderRecord, ReorgState};
pub use index::HeaderIndex;
pub use keys::{BlockKey, IoKey, TxKey};
pub use queue::WorkQueue;
pub use resolver::{ConfirmedOutput, OutpointResolver, StoreResolver};
pub use shared::SharedHeaderGraph;
pub use source::{BlockSource, MemoryBlockSource, SourceError};
