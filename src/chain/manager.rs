// src/chain/manager.rs
// Canonical chain: an arena of blocks indexed by height behind a single write gate,
// plus the pending pool of anchor transactions.

use crate::chain::block::Block;
use crate::chain::pool::{PendingPool, PoolInsert};
use crate::chain::transaction::{AnchorKey, Transaction};
use crate::chain::truncate_millis;
use crate::config::ChainConfig;
use crate::consensus::quorum::QuorumCertificate;
use crate::crypto::Hash;
use crate::errors::{ChainError, Result};
use crate::metrics::{ChainMetrics, METRICS};
use crate::storage::{self, RocksDb, StoreBatch};
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

const BLOCK_PREFIX: &str = "block:";
const PENDING_PREFIX: &str = "pending:";

fn block_key(height: u64) -> String {
    format!("{}{:020}", BLOCK_PREFIX, height)
}

fn pending_key(tx_id: &Hash) -> String {
    format!("{}{}", PENDING_PREFIX, tx_id)
}

#[derive(Serialize, Deserialize)]
struct PendingRecord {
    seq: u64,
    tx: Transaction,
}

/// What happened to a submitted anchor transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SubmitOutcome {
    Pending(Transaction),
    AlreadyPending(Transaction),
    AlreadyAnchored { tx: Transaction, height: u64 },
}

impl SubmitOutcome {
    pub fn transaction(&self) -> &Transaction {
        match self {
            SubmitOutcome::Pending(tx)
            | SubmitOutcome::AlreadyPending(tx)
            | SubmitOutcome::AlreadyAnchored { tx, .. } => tx,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, SubmitOutcome::Pending(_))
    }
}

/// Where a session's anchors are, read from one chain snapshot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SessionAnchors {
    pub anchored: bool,
    pub pending: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainInfo {
    pub height: u64,
    pub latest_block_id: Hash,
    pub latest_timestamp: DateTime<Utc>,
    pub total_blocks: u64,
    pub total_anchors: u64,
    pub pending_transactions: usize,
    pub halted: Option<String>,
}

#[derive(Default)]
struct ChainState {
    blocks: Vec<Arc<Block>>,
    by_hash: HashMap<Hash, u64>,
    anchors: HashMap<AnchorKey, u64>,
    /// Anchored roots per session, in chain order.
    sessions: HashMap<String, Vec<Hash>>,
    /// Set when the persisted chain failed self-validation.
    halted: Option<String>,
}

impl ChainState {
    fn with_genesis() -> Self {
        let mut state = ChainState::default();
        state.index(Arc::new(Block::genesis()));
        state
    }

    /// Blocks is never empty: construction always indexes genesis first.
    fn latest(&self) -> &Arc<Block> {
        &self.blocks[self.blocks.len() - 1]
    }

    fn index(&mut self, block: Arc<Block>) {
        self.by_hash.insert(block.block_id, block.height);
        for tx in &block.transactions {
            self.anchors.insert(tx.anchor_key(), block.height);
            self.sessions
                .entry(tx.session_id.clone())
                .or_default()
                .push(tx.merkle_root);
        }
        self.blocks.push(block);
    }

    /// Rebuild from persisted blocks in height order, validating as it goes.
    /// Blocks after the first failure are still indexed for reads, up to the first
    /// missing height; nothing past a gap is indexed.
    fn rebuild(blocks: Vec<Block>) -> Self {
        if blocks.is_empty() {
            return Self::with_genesis();
        }
        let total = blocks.len();
        let mut state = ChainState::default();
        for block in blocks {
            let expected = state.blocks.len() as u64;
            if block.height != expected {
                let reason = format!(
                    "persisted chain has no block at height {} (next stored is {})",
                    expected, block.height
                );
                state.halted.get_or_insert(reason);
                warn!(
                    "CHAIN: {} persisted blocks past height {} left unindexed",
                    total - state.blocks.len(),
                    expected
                );
                break;
            }
            if state.halted.is_none() {
                let check = match state.blocks.last() {
                    None => check_genesis(&block),
                    Some(prev) => check_block(&state, &block, prev, usize::MAX),
                };
                if let Err(e) = check {
                    state.halted = Some(format!("persisted block {}: {}", block.height, e));
                }
            }
            state.index(Arc::new(block));
        }
        if state.blocks.is_empty() {
            // genesis itself was missing; keep a tip for reads
            state.index(Arc::new(Block::genesis()));
        }
        state
    }

    fn block_at(&self, height: u64) -> Option<&Arc<Block>> {
        self.blocks.get(usize::try_from(height).ok()?)
    }

    fn anchored_tx(&self, key: &AnchorKey) -> Option<(u64, Transaction)> {
        let height = *self.anchors.get(key)?;
        self.block_at(height)?
            .transactions
            .iter()
            .find(|t| t.anchor_key() == *key)
            .map(|t| (height, t.clone()))
    }
}

fn check_genesis(block: &Block) -> Result<()> {
    if *block != Block::genesis() {
        return Err(ChainError::ChainLinkage {
            height: block.height,
            reason: "genesis block does not match the canonical genesis".into(),
        });
    }
    Ok(())
}

/// Height, linkage, timestamp, size, transaction ids, merkle root and block id.
fn check_structure(block: &Block, previous: &Block, max_txs: usize) -> Result<()> {
    let expected_height = previous.height + 1;
    if block.height != expected_height {
        return Err(ChainError::ChainLinkage {
            height: block.height,
            reason: format!("expected height {}", expected_height),
        });
    }
    if !block.previous_hash.ct_eq(&previous.block_id) {
        return Err(ChainError::ChainLinkage {
            height: block.height,
            reason: format!(
                "previous_hash {} does not match block {} ({})",
                block.previous_hash, previous.height, previous.block_id
            ),
        });
    }
    if block.timestamp < previous.timestamp {
        return Err(ChainError::ChainLinkage {
            height: block.height,
            reason: "timestamp precedes previous block".into(),
        });
    }
    if block.transactions.len() > max_txs {
        return Err(ChainError::BlockTooLarge {
            count: block.transactions.len(),
            max: max_txs,
        });
    }
    for tx in &block.transactions {
        if !tx.verify_id() {
            return Err(ChainError::TransactionIdMismatch(tx.tx_id));
        }
        if tx.chunk_count == 0 {
            return Err(ChainError::EmptyChunkSet(tx.session_id.clone()));
        }
    }
    let computed = Block::transactions_root(&block.transactions)?;
    if !computed.ct_eq(&block.merkle_root) {
        return Err(ChainError::MerkleMismatch {
            expected: block.merkle_root,
            computed,
        });
    }
    let computed_id = block.compute_id();
    if !computed_id.ct_eq(&block.block_id) {
        return Err(ChainError::BlockIdMismatch {
            height: block.height,
            expected: block.block_id,
            computed: computed_id,
        });
    }
    Ok(())
}

/// No anchor may repeat inside the block or against the chain, except at `own_height`
/// (used when re-checking blocks already indexed).
fn check_anchors(state: &ChainState, block: &Block, own_height: Option<u64>) -> Result<()> {
    let mut seen = HashSet::new();
    for tx in &block.transactions {
        let key = tx.anchor_key();
        let on_chain = state
            .anchors
            .get(&key)
            .map_or(false, |h| Some(*h) != own_height);
        if on_chain || !seen.insert(key) {
            return Err(ChainError::DuplicateAnchor {
                session_id: tx.session_id.clone(),
                merkle_root: tx.merkle_root,
            });
        }
    }
    Ok(())
}

fn check_block(state: &ChainState, block: &Block, previous: &Block, max_txs: usize) -> Result<()> {
    check_structure(block, previous, max_txs)?;
    check_anchors(state, block, None)
}

fn check_certificate(block: &Block, qc: &QuorumCertificate) -> Result<()> {
    if qc.round.height != block.height {
        return Err(ChainError::CertificateMismatch(format!(
            "certificate for height {}, block at {}",
            qc.round.height, block.height
        )));
    }
    if !qc.block_hash.ct_eq(&block.block_id) {
        return Err(ChainError::CertificateMismatch(format!(
            "certificate names {}, block is {}",
            qc.block_hash, block.block_id
        )));
    }
    let distinct: HashSet<&String> = qc.signers.iter().collect();
    if qc.threshold == 0 || distinct.len() < qc.threshold {
        return Err(ChainError::CertificateMismatch(format!(
            "{} distinct signers below threshold {}",
            distinct.len(),
            qc.threshold
        )));
    }
    Ok(())
}

pub struct BlockManager {
    chain: RwLock<ChainState>,
    pool: Mutex<PendingPool>,
    max_txs_per_block: usize,
    db: Option<RocksDb>,
}

impl BlockManager {
    /// In-memory chain starting at genesis.
    pub fn new(max_txs_per_block: usize, max_pending: usize) -> Self {
        Self {
            chain: RwLock::new(ChainState::with_genesis()),
            pool: Mutex::new(PendingPool::new(max_pending)),
            max_txs_per_block,
            db: None,
        }
    }

    pub fn from_config(cfg: &ChainConfig) -> Result<Self> {
        match &cfg.db_path {
            Some(path) => Self::open(
                storage::try_open_db(path)?,
                cfg.max_transactions_per_block,
                cfg.max_pending_transactions,
            ),
            None => Ok(Self::new(
                cfg.max_transactions_per_block,
                cfg.max_pending_transactions,
            )),
        }
    }

    /// Load and self-validate the persisted chain. A chain that fails validation is
    /// kept readable but every append is refused until it is repaired externally.
    pub fn open(db: RocksDb, max_txs_per_block: usize, max_pending: usize) -> Result<Self> {
        let blocks: Vec<Block> = storage::iter_prefix(&db, BLOCK_PREFIX.as_bytes())?;
        let fresh = blocks.is_empty();
        let state = ChainState::rebuild(blocks);

        if fresh {
            storage::put(&db, block_key(0), state.latest().as_ref())?;
            info!("CHAIN: initialised new chain with genesis {}", state.latest().block_id);
        }
        match &state.halted {
            Some(reason) => error!("CHAIN: persisted chain failed self-validation, appends disabled: {}", reason),
            None => info!(
                "CHAIN: loaded {} blocks, tip {} at height {}",
                state.blocks.len(),
                state.latest().block_id,
                state.latest().height
            ),
        }

        let mut records: Vec<PendingRecord> = storage::iter_prefix(&db, PENDING_PREFIX.as_bytes())?;
        records.sort_by_key(|r| r.seq);
        let mut pool = PendingPool::new(max_pending);
        let mut stale = Vec::new();
        for record in records {
            if state.anchors.contains_key(&record.tx.anchor_key()) {
                stale.push(record.tx.tx_id);
            } else {
                pool.restore(record.seq, record.tx);
            }
        }
        if !stale.is_empty() {
            let mut batch = StoreBatch::default();
            for id in &stale {
                batch.delete(pending_key(id));
            }
            batch.commit(&db)?;
            warn!("CHAIN: dropped {} pending entries already on chain", stale.len());
        }

        METRICS.set_chain_height(state.latest().height);
        Ok(Self {
            chain: RwLock::new(state),
            pool: Mutex::new(pool),
            max_txs_per_block,
            db: Some(db),
        })
    }

    pub fn max_transactions_per_block(&self) -> usize {
        self.max_txs_per_block
    }

    /// Assemble the next block on `previous`: pending transactions in arrival order up
    /// to `max_txs`, timestamp never earlier than the parent's.
    pub fn propose_block(
        previous: &Block,
        pending: &[Transaction],
        producer_id: &str,
        timestamp: DateTime<Utc>,
        max_txs: usize,
    ) -> Result<Block> {
        let transactions: Vec<Transaction> = pending.iter().take(max_txs).cloned().collect();
        let timestamp = truncate_millis(timestamp).max(previous.timestamp);
        Block::new(
            previous.height + 1,
            previous.block_id,
            transactions,
            timestamp,
            producer_id,
        )
    }

    /// Candidate for the next height from the current tip and pool.
    pub fn propose_next(&self, producer_id: &str, timestamp: DateTime<Utc>) -> Result<Block> {
        let previous = self.get_latest_block();
        let pending = self.pool.lock().select(self.max_txs_per_block);
        Self::propose_block(&previous, &pending, producer_id, timestamp, self.max_txs_per_block)
    }

    pub fn validate_block(&self, block: &Block, previous: &Block) -> Result<()> {
        let state = self.chain.read();
        check_block(&state, block, previous, self.max_txs_per_block)
    }

    /// The only mutation point for chain state. Validation and append happen under
    /// one write lock, so two blocks can never land at the same height.
    pub fn append_block(&self, block: Block, certificate: &QuorumCertificate) -> Result<Arc<Block>> {
        let mut state = self.chain.write();
        if let Some(reason) = &state.halted {
            return Err(ChainError::ChainHalted(reason.clone()));
        }

        let previous = Arc::clone(state.latest());
        let checked = check_certificate(&block, certificate)
            .and_then(|_| check_block(&state, &block, &previous, self.max_txs_per_block));
        if let Err(e) = checked {
            ChainMetrics::inc(&METRICS.blocks_rejected);
            warn!("CHAIN: rejected block {} at height {}: {}", block.block_id, block.height, e);
            return Err(e);
        }

        if let Some(db) = &self.db {
            let mut batch = StoreBatch::default();
            batch.put(block_key(block.height), &block)?;
            for tx in &block.transactions {
                batch.delete(pending_key(&tx.tx_id));
            }
            batch.commit(db)?;
        }

        let block = Arc::new(block);
        state.index(Arc::clone(&block));
        let removed = self.pool.lock().remove_included(&block.transactions);
        drop(state);

        ChainMetrics::inc(&METRICS.blocks_appended);
        METRICS.set_chain_height(block.height);
        info!(
            "CHAIN: appended block {} at height {} ({} txs, {} left the pool, producer {})",
            block.block_id,
            block.height,
            block.transactions.len(),
            removed.len(),
            block.producer_id
        );
        Ok(block)
    }

    /// Pool an anchor unless the same `(session_id, merkle_root)` is already pending or
    /// on chain, in which case the existing record is returned.
    pub fn submit_transaction(&self, tx: Transaction) -> Result<SubmitOutcome> {
        if !tx.verify_id() {
            return Err(ChainError::TransactionIdMismatch(tx.tx_id));
        }
        if tx.chunk_count == 0 {
            return Err(ChainError::EmptyChunkSet(tx.session_id));
        }

        // chain before pool, same order as append_block
        let state = self.chain.read();
        if let Some((height, existing)) = state.anchored_tx(&tx.anchor_key()) {
            if existing.tx_id == tx.tx_id {
                return Ok(SubmitOutcome::AlreadyAnchored {
                    tx: existing,
                    height,
                });
            }
        }

        let mut pool = self.pool.lock();
        let (insert, seq) = pool.insert(tx)?;
        match insert {
            PoolInsert::Existing(existing) => Ok(SubmitOutcome::AlreadyPending(existing)),
            PoolInsert::Inserted(tx) => {
                if let Some(db) = &self.db {
                    let record = PendingRecord { seq, tx: tx.clone() };
                    if let Err(e) = storage::put(db, pending_key(&tx.tx_id), &record) {
                        pool.remove_included(std::slice::from_ref(&tx));
                        return Err(e);
                    }
                }
                Ok(SubmitOutcome::Pending(tx))
            }
        }
    }

    pub fn get_latest_block(&self) -> Arc<Block> {
        Arc::clone(self.chain.read().latest())
    }

    pub fn get_block_by_height(&self, height: u64) -> Option<Arc<Block>> {
        self.chain.read().block_at(height).cloned()
    }

    pub fn get_block_by_hash(&self, block_id: &Hash) -> Option<Arc<Block>> {
        let state = self.chain.read();
        let height = *state.by_hash.get(block_id)?;
        state.block_at(height).cloned()
    }

    /// Snapshot of the whole chain, genesis first.
    pub fn get_chain(&self) -> Vec<Arc<Block>> {
        self.chain.read().blocks.clone()
    }

    /// Height and transaction of the anchor for `(session_id, merkle_root)`, if on chain.
    pub fn find_anchor(&self, session_id: &str, merkle_root: &Hash) -> Option<(u64, Transaction)> {
        let key = AnchorKey {
            session_id: session_id.to_string(),
            merkle_root: *merkle_root,
        };
        self.chain.read().anchored_tx(&key)
    }

    pub fn anchored_roots(&self, session_id: &str) -> Vec<Hash> {
        self.chain
            .read()
            .sessions
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn pending_transactions(&self) -> Vec<Transaction> {
        let pool = self.pool.lock();
        pool.select(pool.len())
    }

    pub fn pending_for_session(&self, session_id: &str) -> Vec<Transaction> {
        self.pool.lock().for_session(session_id)
    }

    /// Chain and pool read together. The chain read lock is held while the pool is
    /// consulted, so an append can never move the session between the two reads.
    pub fn session_anchors(&self, session_id: &str) -> SessionAnchors {
        let state = self.chain.read();
        let anchored = state
            .sessions
            .get(session_id)
            .map_or(false, |roots| !roots.is_empty());
        let pending = !self.pool.lock().for_session(session_id).is_empty();
        SessionAnchors { anchored, pending }
    }

    pub fn halted_reason(&self) -> Option<String> {
        self.chain.read().halted.clone()
    }

    /// Re-check heights `start..=end` for linkage, roots, ids and anchor uniqueness.
    pub fn verify_chain_integrity(&self, start: u64, end: u64) -> Result<()> {
        let state = self.chain.read();
        let tip = state.latest().height;
        if start > end || end > tip {
            return Err(ChainError::InvalidParameter(format!(
                "range {}..={} outside chain 0..={}",
                start, end, tip
            )));
        }
        for height in start..=end {
            let block = state.block_at(height).ok_or_else(|| {
                ChainError::InvalidParameter(format!("no block indexed at height {}", height))
            })?;
            if height == 0 {
                check_genesis(block)?;
                continue;
            }
            let previous = state.block_at(height - 1).ok_or_else(|| {
                ChainError::InvalidParameter(format!("no block indexed at height {}", height - 1))
            })?;
            check_structure(block, previous, usize::MAX)?;
            check_anchors(&state, block, Some(height))?;
        }
        Ok(())
    }

    pub fn chain_info(&self) -> ChainInfo {
        let state = self.chain.read();
        let latest = state.latest();
        ChainInfo {
            height: latest.height,
            latest_block_id: latest.block_id,
            latest_timestamp: latest.timestamp,
            total_blocks: state.blocks.len() as u64,
            total_anchors: state.anchors.len() as u64,
            pending_transactions: self.pool.lock().len(),
            halted: state.halted.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::quorum::form_qc;
    use crate::consensus::round::RoundId;
    use crate::crypto::hash;

    fn qc_for(block: &Block) -> QuorumCertificate {
        form_qc(
            RoundId::new(block.height, 0),
            block.block_id,
            vec!["a".into(), "b".into(), "c".into()],
            3,
        )
    }

    fn anchor(session: &str) -> Transaction {
        Transaction::session_anchor(session, hash(session.as_bytes()), 4, Utc::now())
    }

    #[test]
    fn starts_at_genesis() {
        let mgr = BlockManager::new(10, 100);
        let tip = mgr.get_latest_block();
        assert_eq!(tip.height, 0);
        assert_eq!(*tip, Block::genesis());
        assert_eq!(mgr.get_chain().len(), 1);
    }

    #[test]
    fn append_links_and_drains_pool() {
        let mgr = BlockManager::new(10, 100);
        mgr.submit_transaction(anchor("s1")).unwrap();
        let block = mgr.propose_next("n1", Utc::now()).unwrap();
        assert_eq!(block.transactions.len(), 1);

        let appended = mgr.append_block(block.clone(), &qc_for(&block)).unwrap();
        assert_eq!(appended.height, 1);
        assert_eq!(appended.previous_hash, Block::genesis().block_id);
        assert!(mgr.pending_transactions().is_empty());
        assert!(mgr.find_anchor("s1", &hash(b"s1")).is_some());
        assert_eq!(mgr.get_block_by_hash(&block.block_id).unwrap().height, 1);
    }

    #[test]
    fn wrong_height_or_parent_is_linkage_error() {
        let mgr = BlockManager::new(10, 100);
        let genesis = mgr.get_latest_block();
        let skip = Block::new(2, genesis.block_id, vec![], Utc::now(), "n1").unwrap();
        assert!(matches!(
            mgr.append_block(skip.clone(), &qc_for(&skip)),
            Err(ChainError::ChainLinkage { .. })
        ));

        let orphan = Block::new(1, hash(b"nowhere"), vec![], Utc::now(), "n1").unwrap();
        assert!(matches!(
            mgr.append_block(orphan.clone(), &qc_for(&orphan)),
            Err(ChainError::ChainLinkage { .. })
        ));
        assert_eq!(mgr.get_latest_block().height, 0);
    }

    #[test]
    fn merkle_root_is_recomputed() {
        let mgr = BlockManager::new(10, 100);
        let genesis = mgr.get_latest_block();
        let mut block =
            Block::new(1, genesis.block_id, vec![anchor("s1")], Utc::now(), "n1").unwrap();
        block.merkle_root = hash(b"lie");
        block.block_id = block.compute_id();
        assert!(matches!(
            mgr.validate_block(&block, &genesis),
            Err(ChainError::MerkleMismatch { .. })
        ));
    }

    #[test]
    fn duplicate_anchor_in_block_or_chain() {
        let mgr = BlockManager::new(10, 100);
        let genesis = mgr.get_latest_block();
        let tx = anchor("s1");
        let twice = Block::new(1, genesis.block_id, vec![tx.clone(), tx.clone()], Utc::now(), "n1")
            .unwrap();
        assert!(matches!(
            mgr.validate_block(&twice, &genesis),
            Err(ChainError::DuplicateAnchor { .. })
        ));

        let once = Block::new(1, genesis.block_id, vec![tx.clone()], Utc::now(), "n1").unwrap();
        mgr.append_block(once.clone(), &qc_for(&once)).unwrap();
        let again = Block::new(2, once.block_id, vec![tx], Utc::now(), "n1").unwrap();
        assert!(matches!(
            mgr.validate_block(&again, &once),
            Err(ChainError::DuplicateAnchor { .. })
        ));
    }

    #[test]
    fn certificate_must_cover_block() {
        let mgr = BlockManager::new(10, 100);
        let block = mgr.propose_next("n1", Utc::now()).unwrap();
        let mut qc = qc_for(&block);
        qc.block_hash = hash(b"other");
        assert!(matches!(
            mgr.append_block(block.clone(), &qc),
            Err(ChainError::CertificateMismatch(_))
        ));
        let mut thin = qc_for(&block);
        thin.signers = vec!["a".into(), "a".into(), "a".into()];
        assert!(matches!(
            mgr.append_block(block, &thin),
            Err(ChainError::CertificateMismatch(_))
        ));
    }

    #[test]
    fn block_size_is_bounded() {
        let mgr = BlockManager::new(2, 100);
        for s in ["a", "b", "c"] {
            mgr.submit_transaction(anchor(s)).unwrap();
        }
        let block = mgr.propose_next("n1", Utc::now()).unwrap();
        assert_eq!(block.transactions.len(), 2);
        mgr.append_block(block.clone(), &qc_for(&block)).unwrap();
        assert_eq!(mgr.pending_transactions().len(), 1);
    }

    #[test]
    fn resubmission_after_inclusion_returns_chain_record() {
        let mgr = BlockManager::new(10, 100);
        let tx = anchor("s1");
        assert!(mgr.submit_transaction(tx.clone()).unwrap().is_new());
        let block = mgr.propose_next("n1", Utc::now()).unwrap();
        mgr.append_block(block.clone(), &qc_for(&block)).unwrap();

        match mgr.submit_transaction(anchor("s1")).unwrap() {
            SubmitOutcome::AlreadyAnchored { tx: existing, height } => {
                assert_eq!(height, 1);
                assert_eq!(existing, tx);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(mgr.pending_transactions().is_empty());
    }

    #[test]
    fn integrity_check_covers_range() {
        let mgr = BlockManager::new(10, 100);
        for s in ["a", "b"] {
            mgr.submit_transaction(anchor(s)).unwrap();
            let block = mgr.propose_next("n1", Utc::now()).unwrap();
            mgr.append_block(block.clone(), &qc_for(&block)).unwrap();
        }
        mgr.verify_chain_integrity(0, 2).unwrap();
        assert!(mgr.verify_chain_integrity(1, 3).is_err());
        let info = mgr.chain_info();
        assert_eq!(info.height, 2);
        assert_eq!(info.total_anchors, 2);
        assert!(info.halted.is_none());
    }

    #[test]
    fn reopen_restores_chain_and_pool() {
        let dir = tempfile::tempdir().unwrap();
        let tx_id = {
            let mgr = BlockManager::open(storage::try_open_db(dir.path()).unwrap(), 10, 100).unwrap();
            mgr.submit_transaction(anchor("s1")).unwrap();
            let block = mgr.propose_next("n1", Utc::now()).unwrap();
            mgr.append_block(block.clone(), &qc_for(&block)).unwrap();
            mgr.submit_transaction(anchor("s2")).unwrap().transaction().tx_id
        };

        let mgr = BlockManager::open(storage::try_open_db(dir.path()).unwrap(), 10, 100).unwrap();
        assert_eq!(mgr.get_latest_block().height, 1);
        assert!(mgr.find_anchor("s1", &hash(b"s1")).is_some());
        let pending = mgr.pending_transactions();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].tx_id, tx_id);
        assert!(mgr.halted_reason().is_none());
    }

    #[test]
    fn tampered_block_halts_appends_but_keeps_reads() {
        let dir = tempfile::tempdir().unwrap();
        {
            let db = storage::try_open_db(dir.path()).unwrap();
            let mgr = BlockManager::open(db.clone(), 10, 100).unwrap();
            mgr.submit_transaction(anchor("s1")).unwrap();
            let block = mgr.propose_next("n1", Utc::now()).unwrap();
            mgr.append_block(block.clone(), &qc_for(&block)).unwrap();

            let mut tampered = block;
            tampered.producer_id = "mallory".into();
            storage::put(&db, block_key(1), &tampered).unwrap();
        }

        let mgr = BlockManager::open(storage::try_open_db(dir.path()).unwrap(), 10, 100).unwrap();
        assert!(mgr.halted_reason().is_some());
        assert!(mgr.chain_info().halted.is_some());
        assert_eq!(mgr.get_block_by_height(1).unwrap().producer_id, "mallory");

        let next = mgr.propose_next("n1", Utc::now()).unwrap();
        assert!(matches!(
            mgr.append_block(next.clone(), &qc_for(&next)),
            Err(ChainError::ChainHalted(_))
        ));
    }

    #[test]
    fn missing_middle_block_halts_without_bad_reads() {
        let dir = tempfile::tempdir().unwrap();
        let third = {
            let db = storage::try_open_db(dir.path()).unwrap();
            let mgr = BlockManager::open(db.clone(), 10, 100).unwrap();
            let mut last = None;
            for s in ["a", "b", "c"] {
                mgr.submit_transaction(anchor(s)).unwrap();
                let block = mgr.propose_next("n1", Utc::now()).unwrap();
                last = Some(mgr.append_block(block.clone(), &qc_for(&block)).unwrap());
            }
            db.delete(block_key(2)).unwrap();
            last.unwrap()
        };

        let mgr = BlockManager::open(storage::try_open_db(dir.path()).unwrap(), 10, 100).unwrap();
        assert!(mgr.halted_reason().unwrap().contains("height 2"));
        assert_eq!(mgr.get_latest_block().height, 1);
        assert!(mgr.get_block_by_height(2).is_none());
        assert!(mgr.get_block_by_height(3).is_none());
        assert!(mgr.get_block_by_hash(&third.block_id).is_none());
        assert!(mgr.find_anchor("a", &hash(b"a")).is_some());
        assert!(mgr.find_anchor("c", &hash(b"c")).is_none());
        assert!(mgr.anchored_roots("c").is_empty());
        mgr.verify_chain_integrity(0, 1).unwrap();
        assert!(mgr.verify_chain_integrity(0, 3).is_err());

        // past the gap the anchor is unknown, so a resubmission pools again
        assert!(matches!(
            mgr.submit_transaction(anchor("c")).unwrap(),
            SubmitOutcome::Pending(_)
        ));
        let next = mgr.propose_next("n1", Utc::now()).unwrap();
        assert!(matches!(
            mgr.append_block(next.clone(), &qc_for(&next)),
            Err(ChainError::ChainHalted(_))
        ));
    }

    #[test]
    fn missing_genesis_keeps_a_readable_tip() {
        let dir = tempfile::tempdir().unwrap();
        {
            let db = storage::try_open_db(dir.path()).unwrap();
            let mgr = BlockManager::open(db.clone(), 10, 100).unwrap();
            let block = mgr.propose_next("n1", Utc::now()).unwrap();
            mgr.append_block(block.clone(), &qc_for(&block)).unwrap();
            db.delete(block_key(0)).unwrap();
        }

        let mgr = BlockManager::open(storage::try_open_db(dir.path()).unwrap(), 10, 100).unwrap();
        assert!(mgr.halted_reason().is_some());
        assert_eq!(*mgr.get_latest_block(), Block::genesis());
        assert!(mgr.get_block_by_height(1).is_none());
    }

    #[test]
    fn session_anchors_never_miss_a_moving_session() {
        let mgr = Arc::new(BlockManager::new(1, 100));
        let sessions: Vec<String> = (0..40).map(|i| format!("s{}", i)).collect();
        for s in &sessions {
            mgr.submit_transaction(anchor(s)).unwrap();
        }

        std::thread::scope(|scope| {
            let appender = Arc::clone(&mgr);
            let handle = scope.spawn(move || {
                for _ in 0..40 {
                    let block = appender.propose_next("n1", Utc::now()).unwrap();
                    appender.append_block(block.clone(), &qc_for(&block)).unwrap();
                }
            });
            while !handle.is_finished() {
                for s in &sessions {
                    let status = mgr.session_anchors(s);
                    assert!(status.anchored || status.pending, "{} seen nowhere", s);
                }
            }
        });

        assert_eq!(mgr.get_latest_block().height, 40);
        assert_eq!(
            mgr.session_anchors("s0"),
            SessionAnchors { anchored: true, pending: false }
        );
        assert_eq!(mgr.session_anchors("nope"), SessionAnchors::default());
    }
}
