// src/consensus/validator_registry.rs
use crate::poot::EpochId;
use crate::storage::RocksDb;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

pub type NodeId = String;

const REGISTRY_KEY: &[u8] = b"validator_registry";

/// Read-only membership lookup consumed by the consensus engine and score board.
pub trait NodeRegistry: Send + Sync {
    fn get_public_key(&self, node_id: &str) -> Option<Vec<u8>>;

    /// Members allowed to score and vote in `epoch_id`, sorted by node id.
    fn list_eligible_nodes(&self, epoch_id: EpochId) -> Vec<NodeId>;

    /// Size of the voting set used for quorum sizing.
    fn total_nodes(&self, epoch_id: EpochId) -> usize {
        self.list_eligible_nodes(epoch_id).len()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorIdentity {
    pub node_id: NodeId,
    pub public_key: Vec<u8>,
    /// First epoch in which the node counts as a member.
    #[serde(default)]
    pub active_from_epoch: EpochId,
    /// Epoch at which the node stopped counting, if retired.
    #[serde(default)]
    pub retired_at_epoch: Option<EpochId>,
}

impl ValidatorIdentity {
    pub fn new(node_id: &str, public_key: Vec<u8>) -> Self {
        Self {
            node_id: node_id.to_string(),
            public_key,
            active_from_epoch: 0,
            retired_at_epoch: None,
        }
    }

    pub fn is_active(&self, epoch_id: EpochId) -> bool {
        epoch_id >= self.active_from_epoch
            && self.retired_at_epoch.map_or(true, |r| epoch_id < r)
    }
}

/// In-process registry with optional RocksDB persistence.
#[derive(Clone, Default)]
pub struct ValidatorRegistry {
    inner: Arc<RwLock<BTreeMap<NodeId, ValidatorIdentity>>>,
    db: Option<RocksDb>,
}

impl ValidatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry backed by `db`; previously registered validators are loaded.
    pub fn with_db(db: RocksDb) -> Self {
        let registry = Self {
            inner: Arc::new(RwLock::new(BTreeMap::new())),
            db: Some(db),
        };
        if let Some(db) = &registry.db {
            match crate::storage::get::<_, BTreeMap<NodeId, ValidatorIdentity>>(db, REGISTRY_KEY) {
                Ok(Some(validators)) => {
                    log::info!("Loaded {} validators from database", validators.len());
                    *registry.inner.write() = validators;
                }
                Ok(None) => {}
                Err(e) => log::warn!("Failed to load validators from DB: {}", e),
            }
        }
        registry
    }

    fn persist(&self) {
        if let Some(db) = &self.db {
            let validators = self.inner.read().clone();
            if let Err(e) = crate::storage::put(db, REGISTRY_KEY, &validators) {
                log::error!("Failed to persist validator registry: {}", e);
            }
        }
    }

    /// Register or replace a validator active from epoch 0.
    pub fn register(&self, node_id: &str, public_key: Vec<u8>) {
        self.register_identity(ValidatorIdentity::new(node_id, public_key));
    }

    pub fn register_identity(&self, identity: ValidatorIdentity) {
        log::info!("Registered validator {}", identity.node_id);
        self.inner.write().insert(identity.node_id.clone(), identity);
        self.persist();
    }

    /// Retire a validator from `epoch_id` onwards; earlier epochs are unaffected.
    pub fn retire(&self, node_id: &str, epoch_id: EpochId) -> bool {
        let found = match self.inner.write().get_mut(node_id) {
            Some(identity) => {
                identity.retired_at_epoch = Some(epoch_id);
                true
            }
            None => false,
        };
        if found {
            self.persist();
        }
        found
    }

    pub fn get(&self, node_id: &str) -> Option<ValidatorIdentity> {
        self.inner.read().get(node_id).cloned()
    }

    pub fn exists(&self, node_id: &str) -> bool {
        self.inner.read().contains_key(node_id)
    }

    pub fn count(&self) -> usize {
        self.inner.read().len()
    }
}

impl NodeRegistry for ValidatorRegistry {
    fn get_public_key(&self, node_id: &str) -> Option<Vec<u8>> {
        self.inner.read().get(node_id).map(|v| v.public_key.clone())
    }

    fn list_eligible_nodes(&self, epoch_id: EpochId) -> Vec<NodeId> {
        self.inner
            .read()
            .values()
            .filter(|v| v.is_active(epoch_id))
            .map(|v| v.node_id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn eligibility_follows_activation_window() {
        let reg = ValidatorRegistry::new();
        reg.register("a", vec![1; 32]);
        reg.register_identity(ValidatorIdentity {
            active_from_epoch: 5,
            ..ValidatorIdentity::new("b", vec![2; 32])
        });
        assert_eq!(reg.list_eligible_nodes(0), vec!["a".to_string()]);
        assert_eq!(reg.list_eligible_nodes(5), vec!["a".to_string(), "b".to_string()]);

        assert!(reg.retire("a", 6));
        assert_eq!(reg.list_eligible_nodes(6), vec!["b".to_string()]);
        assert_eq!(reg.total_nodes(5), 2);
        assert!(!reg.retire("ghost", 1));
    }

    #[test]
    fn persisted_registry_reloads() {
        let dir = TempDir::new().unwrap();
        let db = crate::storage::try_open_db(dir.path()).unwrap();
        {
            let reg = ValidatorRegistry::with_db(db.clone());
            reg.register("node-1", vec![9; 32]);
        }
        let reloaded = ValidatorRegistry::with_db(db);
        assert_eq!(reloaded.get_public_key("node-1"), Some(vec![9; 32]));
        assert_eq!(reloaded.count(), 1);
    }
}
