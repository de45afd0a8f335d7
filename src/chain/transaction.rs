// src/chain/transaction.rs
use crate::chain::truncate_millis;
use crate::crypto::{CanonicalBytes, Hash};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const ANCHOR_ID_TAG: &[u8] = b"LUCID-ANCHOR-V1";
const TX_HASH_TAG: &[u8] = b"LUCID-TX-V1";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    SessionAnchor,
}

impl TransactionKind {
    /// Byte tag in hash inputs; never renumber.
    pub fn tag(&self) -> u8 {
        match self {
            TransactionKind::SessionAnchor => 1,
        }
    }
}

/// Identity of an anchor for dedup: one inclusion per pair across the chain.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AnchorKey {
    pub session_id: String,
    pub merkle_root: Hash,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Derived from kind, session and root, so a retried submission has the same id.
    pub tx_id: Hash,
    pub kind: TransactionKind,
    pub session_id: String,
    /// Root of the session's chunk tree.
    pub merkle_root: Hash,
    pub chunk_count: u64,
    pub submitted_at: DateTime<Utc>,
}

impl Transaction {
    pub fn session_anchor(
        session_id: &str,
        merkle_root: Hash,
        chunk_count: u64,
        submitted_at: DateTime<Utc>,
    ) -> Self {
        let kind = TransactionKind::SessionAnchor;
        Self {
            tx_id: Self::compute_id(kind, session_id, &merkle_root),
            kind,
            session_id: session_id.to_string(),
            merkle_root,
            chunk_count,
            submitted_at: truncate_millis(submitted_at),
        }
    }

    pub fn compute_id(kind: TransactionKind, session_id: &str, merkle_root: &Hash) -> Hash {
        CanonicalBytes::tagged(ANCHOR_ID_TAG)
            .u8(kind.tag())
            .str(session_id)
            .digest(merkle_root)
            .hash()
    }

    pub fn verify_id(&self) -> bool {
        self.tx_id
            .ct_eq(&Self::compute_id(self.kind, &self.session_id, &self.merkle_root))
    }

    /// Leaf of the block's transaction tree; commits to every field.
    pub fn hash(&self) -> Hash {
        CanonicalBytes::tagged(TX_HASH_TAG)
            .u8(self.kind.tag())
            .str(&self.session_id)
            .digest(&self.merkle_root)
            .u64(self.chunk_count)
            .i64(self.submitted_at.timestamp_millis())
            .hash()
    }

    pub fn anchor_key(&self) -> AnchorKey {
        AnchorKey {
            session_id: self.session_id.clone(),
            merkle_root: self.merkle_root,
        }
    }
}
