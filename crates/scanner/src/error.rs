use chainscan_chainstate::{ChainError, SourceError};
use chainscan_storage::StoreError;

#[derive(Debug)]
pub enum ScanError {
    /// Recomputed merkle root differs from the header's.
    MerkleMismatch { height: u32 },
    /// Block bytes failed to decode or do not match the expected header.
    Malformed { height: u32, reason: String },
    Store(StoreError),
    Source(SourceError),
    Chain(ChainError),
    /// A pipeline stage went away before the scan finished.
    Interrupted(&'static str),
    ThreadPool(String),
}

impl ScanError {
    /// Height of the offending block for structural failures.
    pub fn height(&self) -> Option<u32> {
        match self {
            ScanError::MerkleMismatch { height } | ScanError::Malformed { height, .. } => {
                Some(*height)
            }
            _ => None,
        }
    }
}

impl std::fmt::Display for ScanError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScanError::MerkleMismatch { height } => {
                write!(f, "merkle root mismatch in block at height {height}")
            }
            ScanError::Malformed { height, reason } => {
                write!(f, "malformed block at height {height}: {reason}")
            }
            ScanError::Store(err) => write!(f, "{err}"),
            ScanError::Source(err) => write!(f, "{err}"),
            ScanError::Chain(err) => write!(f, "{err}"),
            ScanError::Interrupted(stage) => write!(f, "scan interrupted: {stage} stopped"),
            ScanError::ThreadPool(message) => write!(f, "scan worker pool: {message}"),
        }
    }
}

impl std::error::Error for ScanError {}

impl From<StoreError> for ScanError {
    fn from(err: StoreError) -> Self {
        ScanError::Store(err)
    }
}

impl From<SourceError> for ScanError {
    fn from(err: SourceError) -> Self {
        ScanError::Source(err)
    }
}

impl From<ChainError> for ScanError {
    fn from(err: ChainError) -> Self {
        ScanError::Chain(err)
    }
}
