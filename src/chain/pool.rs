// src/chain/pool.rs
// Pending anchor transactions awaiting inclusion, in arrival order.

use crate::chain::transaction::Transaction;
use crate::crypto::Hash;
use crate::errors::{ChainError, Result};
use std::collections::HashMap;

/// Maximum number of pending transactions (DoS protection)
pub const MAX_POOL_SIZE: usize = 10_000;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PoolInsert {
    Inserted(Transaction),
    /// Same anchor already pending; the original submission is returned.
    Existing(Transaction),
}

impl PoolInsert {
    pub fn transaction(&self) -> &Transaction {
        match self {
            PoolInsert::Inserted(tx) | PoolInsert::Existing(tx) => tx,
        }
    }

    pub fn into_transaction(self) -> Transaction {
        match self {
            PoolInsert::Inserted(tx) | PoolInsert::Existing(tx) => tx,
        }
    }
}

#[derive(Debug)]
pub struct PendingPool {
    order: Vec<Hash>,
    entries: HashMap<Hash, (u64, Transaction)>,
    next_seq: u64,
    capacity: usize,
}

impl PendingPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            order: Vec::new(),
            entries: HashMap::new(),
            next_seq: 0,
            capacity,
        }
    }

    /// Insert unless an entry with the same anchor id is pending. The returned
    /// sequence number records arrival order for persistence.
    pub fn insert(&mut self, tx: Transaction) -> Result<(PoolInsert, u64)> {
        if let Some((seq, existing)) = self.entries.get(&tx.tx_id) {
            return Ok((PoolInsert::Existing(existing.clone()), *seq));
        }
        if self.entries.len() >= self.capacity {
            return Err(ChainError::PoolFull(self.entries.len()));
        }
        let seq = self.next_seq;
        self.restore(seq, tx.clone());
        Ok((PoolInsert::Inserted(tx), seq))
    }

    /// Re-insert a persisted entry with its original sequence number.
    pub fn restore(&mut self, seq: u64, tx: Transaction) {
        if self.entries.contains_key(&tx.tx_id) {
            return;
        }
        self.next_seq = self.next_seq.max(seq + 1);
        self.order.push(tx.tx_id);
        self.entries.insert(tx.tx_id, (seq, tx));
    }

    /// Up to `limit` transactions in arrival order, without removing them.
    pub fn select(&self, limit: usize) -> Vec<Transaction> {
        self.order
            .iter()
            .filter_map(|id| self.entries.get(id).map(|(_, tx)| tx.clone()))
            .take(limit)
            .collect()
    }

    /// Drop entries that made it into a block; returns the sequence numbers removed.
    pub fn remove_included(&mut self, included: &[Transaction]) -> Vec<u64> {
        let mut removed = Vec::new();
        for tx in included {
            if let Some((seq, _)) = self.entries.remove(&tx.tx_id) {
                removed.push(seq);
            }
        }
        if !removed.is_empty() {
            let entries = &self.entries;
            self.order.retain(|id| entries.contains_key(id));
        }
        removed
    }

    pub fn get(&self, tx_id: &Hash) -> Option<&Transaction> {
        self.entries.get(tx_id).map(|(_, tx)| tx)
    }

    pub fn for_session(&self, session_id: &str) -> Vec<Transaction> {
        self.order
            .iter()
            .filter_map(|id| self.entries.get(id))
            .filter(|(_, tx)| tx.session_id == session_id)
            .map(|(_, tx)| tx.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for PendingPool {
    fn default() -> Self {
        Self::new(MAX_POOL_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::hash;
    use chrono::Utc;

    fn tx(session: &str) -> Transaction {
        Transaction::session_anchor(session, hash(session.as_bytes()), 1, Utc::now())
    }

    #[test]
    fn duplicate_returns_original() {
        let mut pool = PendingPool::default();
        let first = tx("s1");
        let (ins, _) = pool.insert(first.clone()).unwrap();
        assert!(matches!(ins, PoolInsert::Inserted(_)));

        let mut retry = first.clone();
        retry.submitted_at = Utc::now() + chrono::Duration::seconds(5);
        let (again, _) = pool.insert(retry).unwrap();
        assert_eq!(again, PoolInsert::Existing(first));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn select_keeps_arrival_order() {
        let mut pool = PendingPool::default();
        for s in ["c", "a", "b"] {
            pool.insert(tx(s)).unwrap();
        }
        let picked: Vec<String> = pool.select(2).into_iter().map(|t| t.session_id).collect();
        assert_eq!(picked, vec!["c", "a"]);
    }

    #[test]
    fn capacity_is_enforced() {
        let mut pool = PendingPool::new(1);
        pool.insert(tx("a")).unwrap();
        assert!(matches!(pool.insert(tx("b")), Err(ChainError::PoolFull(1))));
        // a retry of a pending anchor still answers when full
        assert!(pool.insert(tx("a")).is_ok());
    }

    #[test]
    fn removal_after_inclusion() {
        let mut pool = PendingPool::default();
        let a = tx("a");
        let b = tx("b");
        pool.insert(a.clone()).unwrap();
        pool.insert(b.clone()).unwrap();
        assert_eq!(pool.remove_included(&[a.clone()]), vec![0]);
        assert_eq!(pool.select(10), vec![b]);
        assert!(pool.get(&a.tx_id).is_none());
        assert!(pool.for_session("a").is_empty());
    }
}
