use chainscan_primitives::{hash256_to_hex, Hash256};
use chainscan_storage::StoreError;

#[derive(Debug)]
pub enum ChainError {
    Store(StoreError),
    /// A stored record failed to decode; carries the column key.
    CorruptRecord {
        key: Vec<u8>,
        message: &'static str,
    },
    UnknownHeader(Hash256),
    LockPoisoned(&'static str),
}

impl ChainError {
    pub fn corrupt(key: &[u8], message: &'static str) -> Self {
        ChainError::CorruptRecord {
            key: key.to_vec(),
            message,
        }
    }
}

impl std::fmt::Display for ChainError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChainError::Store(err) => write!(f, "{err}"),
            ChainError::CorruptRecord { key, message } => {
                write!(f, "corrupt record ")?;
                for byte in key {
                    write!(f, "{byte:02x}")?;
                }
                write!(f, ": {message}")
            }
            ChainError::UnknownHeader(hash) => {
                write!(f, "unknown header {}", hash256_to_hex(hash))
            }
            ChainError::LockPoisoned(what) => write!(f, "{what} lock poisoned"),
        }
    }
}

impl std::error::Error for ChainError {}

impl From<StoreError> for ChainError {
    fn from(err: StoreError) -> Self {
        ChainError::Store(err)
    }
}
