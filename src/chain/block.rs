// src/chain/block.rs
use crate::chain::transaction::Transaction;
use crate::chain::truncate_millis;
use crate::consensus::validator_registry::NodeId;
use crate::crypto::{CanonicalBytes, Hash};
use crate::errors::Result;
use crate::merkle::merkle_root_or_zero;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

const BLOCK_TAG: &[u8] = b"LUCID-BLOCK-V1";

pub const GENESIS_PRODUCER: &str = "genesis";
/// 2024-01-01T00:00:00Z
pub const GENESIS_TIMESTAMP_MS: i64 = 1_704_067_200_000;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub height: u64,
    pub block_id: Hash,
    /// `block_id` of the block at `height - 1`; zero for genesis.
    pub previous_hash: Hash,
    /// Root over the ordered transaction hashes; zero when empty.
    pub merkle_root: Hash,
    pub transactions: Vec<Transaction>,
    pub timestamp: DateTime<Utc>,
    pub producer_id: NodeId,
}

impl Block {
    /// Assemble a block and seal its id.
    pub fn new(
        height: u64,
        previous_hash: Hash,
        transactions: Vec<Transaction>,
        timestamp: DateTime<Utc>,
        producer_id: &str,
    ) -> Result<Self> {
        let mut block = Block {
            height,
            block_id: Hash::ZERO,
            previous_hash,
            merkle_root: Self::transactions_root(&transactions)?,
            transactions,
            timestamp: truncate_millis(timestamp),
            producer_id: producer_id.to_string(),
        };
        block.block_id = block.compute_id();
        Ok(block)
    }

    /// Identical on every node.
    pub fn genesis() -> Self {
        let timestamp = Utc
            .timestamp_millis_opt(GENESIS_TIMESTAMP_MS)
            .single()
            .unwrap_or_default();
        let mut block = Block {
            height: 0,
            block_id: Hash::ZERO,
            previous_hash: Hash::ZERO,
            merkle_root: Hash::ZERO,
            transactions: Vec::new(),
            timestamp,
            producer_id: GENESIS_PRODUCER.to_string(),
        };
        block.block_id = block.compute_id();
        block
    }

    pub fn is_genesis(&self) -> bool {
        self.height == 0
    }

    pub fn transactions_root(transactions: &[Transaction]) -> Result<Hash> {
        let hashes: Vec<Hash> = transactions.iter().map(Transaction::hash).collect();
        merkle_root_or_zero(&hashes)
    }

    /// Hash of the header fields; the transaction list enters through `merkle_root`.
    pub fn compute_id(&self) -> Hash {
        CanonicalBytes::tagged(BLOCK_TAG)
            .u64(self.height)
            .digest(&self.previous_hash)
            .digest(&self.merkle_root)
            .i64(self.timestamp.timestamp_millis())
            .str(&self.producer_id)
            .u32(self.transactions.len() as u32)
            .hash()
    }
}
