//! Bitcoin block/transaction types, consensus serialization and the address
//! keys the indexer groups history by.

pub mod block;
pub mod encoding;
pub mod hash;
pub mod outpoint;
pub mod scraddr;
pub mod transaction;
pub mod work;

pub use block::{merkle_root, Block, BlockDecodeError, BlockHeader, HEADER_SIZE};
pub use hash::{hash160, hash256_from_hex, hash256_to_hex, sha256, sha256d, Hash256};
pub use outpoint::OutPoint;
pub use scraddr::{ScrAddr, ScrAddrKind};
pub use transaction::{Transaction, TransactionDecodeError, TxIn, TxOut};
pub use work::{compact_to_target, work_from_bits};
