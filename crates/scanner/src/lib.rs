//! Block scanning into per-address history.

pub mod batch;
pub mod commit;
pub mod error;
pub mod history;
pub mod passes;
pub mod scanner;
pub mod summary;
pub mod undo;

pub use batch::{BatchPlanner, ScanBatch, ScannedBlock};
pub use commit::ChainPosition;
pub use error::ScanError;
pub use history::{AddressSummary, BucketSummary, HistoryKey, SubHistory, TxIoEntry};
pub use scanner::{ScanConfig, ScanReport, Scanner};
pub use summary::SummaryReport;
pub use undo::UndoReport;
