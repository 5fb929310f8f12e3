use chainscan_chainstate::{ChainError, SourceError};
use chainscan_storage::StoreError;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MempoolErrorKind {
    /// Raw bytes do not decode as a transaction.
    InvalidTransaction,
    Store,
    Chain,
    Source,
    /// The tracker is shutting down and no longer takes work.
    Shutdown,
    Internal,
}

#[derive(Clone, Debug)]
pub struct MempoolError {
    pub kind: MempoolErrorKind,
    pub message: String,
}

impl MempoolError {
    pub fn new(kind: MempoolErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for MempoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for MempoolError {}

impl From<StoreError> for MempoolError {
    fn from(err: StoreError) -> Self {
        MempoolError::new(MempoolErrorKind::Store, err.to_string())
    }
}

impl From<ChainError> for MempoolError {
    fn from(err: ChainError) -> Self {
        let kind = match err {
            ChainError::Store(_) => MempoolErrorKind::Store,
            _ => MempoolErrorKind::Chain,
        };
        MempoolError::new(kind, err.to_string())
    }
}

impl From<SourceError> for MempoolError {
    fn from(err: SourceError) -> Self {
        MempoolError::new(MempoolErrorKind::Source, err.to_string())
    }
}
