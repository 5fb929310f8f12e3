//! Zero-conf transaction tracking: pending transactions resolved against
//! confirmed storage and each other, published as immutable snapshots.

pub mod broadcast;
pub mod error;
pub mod network;
pub mod notify;
pub mod pending;
pub mod persist;
pub mod snapshot;
pub mod tracker;

pub use broadcast::{BroadcastResult, Broadcaster, DEFAULT_BROADCAST_TIMEOUT};
pub use error::{MempoolError, MempoolErrorKind};
pub use network::{NetworkLayer, OfflineNetwork, PeerReply};
pub use notify::{ChannelSink, NotificationKind, NotificationSink, NullSink, PendingNotification};
pub use pending::{OutpointRef, PendingInput, PendingOutput, PendingTx, TxState};
pub use snapshot::{MempoolSnapshot, PendingTxIo, SharedSnapshot};
pub use tracker::{BatchOutcome, MempoolConfig, MempoolTracker, PurgeOutcome};
