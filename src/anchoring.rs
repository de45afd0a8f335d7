// src/anchoring.rs
// Session anchoring: ordered chunk hashes -> Merkle root -> pending anchor transaction.

use crate::chain::manager::{BlockManager, SubmitOutcome};
use crate::chain::{now_millis, AnchorKey, Transaction};
use crate::crypto::Hash;
use crate::errors::{ChainError, Result};
use crate::merkle::{build_merkle_tree, verify_merkle_proof_in, MerkleProof, MerkleTree};
use crate::metrics::{ChainMetrics, METRICS};
use crate::storage::{self, RocksDb, StoreBatch};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

const TREE_PREFIX: &str = "tree:";

/// Session trees kept in memory; with a store behind the service, evicted trees
/// are reloaded on demand.
pub const DEFAULT_TREE_CACHE: usize = 50;

fn tree_key(key: &AnchorKey) -> String {
    format!("{}{}:{}", TREE_PREFIX, key.session_id, key.merkle_root)
}

/// Persisted form of a session tree: the ordered leaves it was built from.
#[derive(Serialize, Deserialize)]
struct TreeRecord {
    session_id: String,
    merkle_root: Hash,
    leaves: Vec<Hash>,
    created_at: DateTime<Utc>,
}

/// Bounded map of session trees, oldest insertion evicted first.
struct TreeCache {
    trees: HashMap<AnchorKey, Arc<MerkleTree>>,
    order: VecDeque<AnchorKey>,
    capacity: usize,
}

impl TreeCache {
    fn new(capacity: usize) -> Self {
        Self {
            trees: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    fn get(&self, key: &AnchorKey) -> Option<Arc<MerkleTree>> {
        self.trees.get(key).cloned()
    }

    fn contains(&self, key: &AnchorKey) -> bool {
        self.trees.contains_key(key)
    }

    fn insert(&mut self, key: AnchorKey, tree: Arc<MerkleTree>) -> Arc<MerkleTree> {
        if let Some(existing) = self.trees.get(&key) {
            return Arc::clone(existing);
        }
        while self.order.len() >= self.capacity {
            match self.order.pop_front() {
                Some(old) => {
                    self.trees.remove(&old);
                }
                None => break,
            }
        }
        self.order.push_back(key.clone());
        self.trees.insert(key, Arc::clone(&tree));
        tree
    }

    fn remove(&mut self, key: &AnchorKey) {
        if self.trees.remove(key).is_some() {
            self.order.retain(|k| k != key);
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnchorStatus {
    Pending,
    Anchored,
    NotFound,
}

/// Producer of a session's chunk hashes in strict recording order.
#[async_trait]
pub trait ChunkSource: Send + Sync {
    async fn fetch_chunk_hashes(&self, session_id: &str) -> Result<Vec<Hash>>;
}

pub struct AnchoringService {
    manager: Arc<BlockManager>,
    /// Session trees by anchor, kept for proof reconstruction.
    trees: Mutex<TreeCache>,
    source_timeout: Duration,
    db: Option<RocksDb>,
}

impl AnchoringService {
    /// In-memory trees only; evicted trees must be registered again.
    pub fn new(manager: Arc<BlockManager>, source_timeout: Duration) -> Self {
        Self {
            manager,
            trees: Mutex::new(TreeCache::new(DEFAULT_TREE_CACHE)),
            source_timeout,
            db: None,
        }
    }

    /// Trees are written under `tree:{session}:{root}` in `db` and reloaded lazily,
    /// so proofs survive a restart.
    pub fn with_db(manager: Arc<BlockManager>, source_timeout: Duration, db: RocksDb) -> Self {
        Self {
            db: Some(db),
            ..Self::new(manager, source_timeout)
        }
    }

    pub fn with_cache_capacity(self, capacity: usize) -> Self {
        Self {
            trees: Mutex::new(TreeCache::new(capacity)),
            ..self
        }
    }

    /// Persist (when backed by a store) and cache a session tree.
    fn keep_tree(&self, key: AnchorKey, tree: Arc<MerkleTree>) -> Result<()> {
        if self.trees.lock().contains(&key) {
            return Ok(());
        }
        if let Some(db) = &self.db {
            let record = TreeRecord {
                session_id: key.session_id.clone(),
                merkle_root: key.merkle_root,
                leaves: tree.leaves().to_vec(),
                created_at: now_millis(),
            };
            storage::put(db, tree_key(&key), &record)?;
        }
        self.trees.lock().insert(key, tree);
        Ok(())
    }

    /// Cached tree for `key`, else the persisted one rebuilt from its leaves.
    fn tree_for(&self, key: &AnchorKey) -> Option<Arc<MerkleTree>> {
        if let Some(tree) = self.trees.lock().get(key) {
            return Some(tree);
        }
        let db = self.db.as_ref()?;
        let record = match storage::get::<_, TreeRecord>(db, tree_key(key)) {
            Ok(Some(record)) => record,
            Ok(None) => return None,
            Err(e) => {
                warn!("ANCHOR: failed to load tree for session {}: {}", key.session_id, e);
                return None;
            }
        };
        let tree = match build_merkle_tree(&record.leaves) {
            Ok(tree) if tree.root().ct_eq(&key.merkle_root) => tree,
            Ok(tree) => {
                warn!(
                    "ANCHOR: stored tree for session {} rebuilds to {}, expected {}",
                    key.session_id,
                    tree.root(),
                    key.merkle_root
                );
                return None;
            }
            Err(e) => {
                warn!("ANCHOR: stored tree for session {} is unusable: {}", key.session_id, e);
                return None;
            }
        };
        debug!("ANCHOR: reloaded tree for session {} root {}", key.session_id, key.merkle_root);
        Some(self.trees.lock().insert(key.clone(), Arc::new(tree)))
    }

    /// Delete persisted trees created more than `max_age` ago and drop them from
    /// the cache. Returns how many were removed.
    pub fn cleanup_old_trees(&self, max_age: chrono::Duration) -> Result<usize> {
        let Some(db) = &self.db else {
            return Ok(0);
        };
        let cutoff = Utc::now() - max_age;
        let records: Vec<TreeRecord> = storage::iter_prefix(db, TREE_PREFIX.as_bytes())?;
        let stale: Vec<AnchorKey> = records
            .into_iter()
            .filter(|r| r.created_at < cutoff)
            .map(|r| AnchorKey {
                session_id: r.session_id,
                merkle_root: r.merkle_root,
            })
            .collect();
        if stale.is_empty() {
            return Ok(0);
        }

        let mut batch = StoreBatch::default();
        for key in &stale {
            batch.delete(tree_key(key));
        }
        batch.commit(db)?;
        let mut trees = self.trees.lock();
        for key in &stale {
            trees.remove(key);
        }
        info!("ANCHOR: removed {} session trees older than {}", stale.len(), cutoff);
        Ok(stale.len())
    }

    /// Build the session tree and pool its anchor. A retry with the same resulting
    /// root returns the transaction already pending or on chain.
    pub fn anchor_session(&self, session_id: &str, ordered_chunk_hashes: &[Hash]) -> Result<Transaction> {
        if ordered_chunk_hashes.is_empty() {
            return Err(ChainError::EmptyChunkSet(session_id.to_string()));
        }
        let tree = Arc::new(build_merkle_tree(ordered_chunk_hashes)?);
        let tx = Transaction::session_anchor(
            session_id,
            tree.root(),
            ordered_chunk_hashes.len() as u64,
            now_millis(),
        );
        // tree is stored before the anchor can be pooled
        self.keep_tree(tx.anchor_key(), tree)?;
        let outcome = self.manager.submit_transaction(tx)?;

        match &outcome {
            SubmitOutcome::Pending(tx) => {
                ChainMetrics::inc(&METRICS.anchors_submitted);
                info!(
                    "ANCHOR: session {} pooled with root {} ({} chunks)",
                    session_id, tx.merkle_root, tx.chunk_count
                );
            }
            SubmitOutcome::AlreadyPending(tx) => {
                ChainMetrics::inc(&METRICS.anchors_deduplicated);
                debug!("ANCHOR: session {} root {} already pending", session_id, tx.merkle_root);
            }
            SubmitOutcome::AlreadyAnchored { tx, height } => {
                ChainMetrics::inc(&METRICS.anchors_deduplicated);
                debug!(
                    "ANCHOR: session {} root {} already anchored at height {}",
                    session_id, tx.merkle_root, height
                );
            }
        }
        Ok(outcome.transaction().clone())
    }

    /// Chunk pipeline entry point.
    pub fn submit_session_chunks(&self, session_id: &str, ordered_chunk_hashes: &[Hash]) -> Result<Transaction> {
        self.anchor_session(session_id, ordered_chunk_hashes)
    }

    /// Pull chunk hashes from `source` under the configured timeout, then anchor.
    /// No chain lock is held while waiting on the source.
    pub async fn anchor_from_source(&self, source: &dyn ChunkSource, session_id: &str) -> Result<Transaction> {
        let hashes = match tokio::time::timeout(self.source_timeout, source.fetch_chunk_hashes(session_id)).await {
            Ok(result) => result?,
            Err(_) => {
                warn!(
                    "ANCHOR: chunk source timed out after {:?} for session {}",
                    self.source_timeout, session_id
                );
                return Err(ChainError::SourceTimeout(session_id.to_string()));
            }
        };
        self.anchor_session(session_id, &hashes)
    }

    /// Hold a session's chunk list so proofs can be served for an anchor this node
    /// did not submit itself. Returns the computed root.
    pub fn register_manifest(&self, session_id: &str, ordered_chunk_hashes: &[Hash]) -> Result<Hash> {
        let tree = build_merkle_tree(ordered_chunk_hashes)?;
        let root = tree.root();
        let key = AnchorKey {
            session_id: session_id.to_string(),
            merkle_root: root,
        };
        self.keep_tree(key, Arc::new(tree))?;
        Ok(root)
    }

    pub fn get_anchor_status(&self, session_id: &str) -> AnchorStatus {
        let status = self.manager.session_anchors(session_id);
        if status.anchored {
            AnchorStatus::Anchored
        } else if status.pending {
            AnchorStatus::Pending
        } else {
            AnchorStatus::NotFound
        }
    }

    /// Proof for `chunk_index` against the most recent chain-recorded root for which
    /// this node holds the session tree.
    pub fn proof_for_chunk(&self, session_id: &str, chunk_index: usize) -> Option<MerkleProof> {
        self.manager
            .anchored_roots(session_id)
            .into_iter()
            .rev()
            .find_map(|root| {
                let key = AnchorKey {
                    session_id: session_id.to_string(),
                    merkle_root: root,
                };
                self.tree_for(&key)?.proof(chunk_index).ok()
            })
    }

    /// True when `chunk_hash` sits at `chunk_index` of a session tree whose root is
    /// recorded on chain.
    pub fn verify_anchor(&self, session_id: &str, chunk_hash: &Hash, chunk_index: usize) -> bool {
        self.manager
            .anchored_roots(session_id)
            .into_iter()
            .any(|chain_root| {
                let key = AnchorKey {
                    session_id: session_id.to_string(),
                    merkle_root: chain_root,
                };
                let Some(tree) = self.tree_for(&key) else {
                    return false;
                };
                let Ok(path) = tree.proof(chunk_index) else {
                    return false;
                };
                let proof = MerkleProof {
                    leaf_hash: *chunk_hash,
                    leaf_index: chunk_index,
                    sibling_hashes: path.sibling_hashes,
                    root: chain_root,
                };
                verify_merkle_proof_in(&proof, tree.leaf_count())
            })
    }
}
