// src/chain/mod.rs
pub mod block;
pub mod manager;
pub mod pool;
pub mod transaction;

pub use block::Block;
pub use manager::{BlockManager, ChainInfo, SessionAnchors};
pub use pool::{PendingPool, PoolInsert};
pub use transaction::{AnchorKey, Transaction, TransactionKind};

use chrono::{DateTime, TimeZone, Utc};

/// Drop sub-millisecond precision; hashes commit to milliseconds only.
pub fn truncate_millis(t: DateTime<Utc>) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(t.timestamp_millis())
        .single()
        .unwrap_or(t)
}

pub fn now_millis() -> DateTime<Utc> {
    truncate_millis(Utc::now())
}
