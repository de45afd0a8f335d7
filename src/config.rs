// src/config.rs
// Node configuration: JSON file, .env, LUCID_* environment overrides and startup validation.

use crate::consensus::quorum::QuorumPolicy;
use anyhow::{Context, Result};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::Path;
use std::str::FromStr;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct PootConfig {
    /// Score units per observed hour.
    pub multiplier: f64,
    pub min_observation_time_secs: u64,
    /// Cap on any single node's score.
    pub max_score: f64,
    /// Scores must be strictly above this to be eligible for leadership.
    pub eligibility_floor: f64,
}

impl Default for PootConfig {
    fn default() -> Self {
        Self {
            multiplier: 1.0,
            min_observation_time_secs: 60,
            max_score: 100.0,
            eligibility_floor: 0.0,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ChainConfig {
    /// RocksDB directory; in-memory chain when unset.
    pub db_path: Option<String>,
    pub node_id: Option<String>,
    pub quorum: QuorumPolicy,
    pub round_timeout_ms: u64,
    pub slot_interval_ms: u64,
    pub slots_per_epoch: u64,
    pub max_transactions_per_block: usize,
    pub max_pending_transactions: usize,
    pub chunk_source_timeout_ms: u64,
    pub poot: PootConfig,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            node_id: None,
            quorum: QuorumPolicy::Majority,
            round_timeout_ms: 5_000,
            slot_interval_ms: 10_000,
            slots_per_epoch: 720,
            max_transactions_per_block: 1_000,
            max_pending_transactions: 10_000,
            chunk_source_timeout_ms: 10_000,
            poot: PootConfig::default(),
        }
    }
}

impl ChainConfig {
    /// Load `.env`, then the JSON file if present, then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut cfg = match path {
            Some(p) if p.exists() => {
                let raw = fs::read_to_string(p)
                    .with_context(|| format!("read config {}", p.display()))?;
                serde_json::from_str(&raw)
                    .with_context(|| format!("parse config {}", p.display()))?
            }
            Some(p) => {
                info!("Config file {} not found, using defaults", p.display());
                ChainConfig::default()
            }
            None => ChainConfig::default(),
        };
        cfg.apply_env();
        Ok(cfg)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).ok();
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).with_context(|| format!("write config {}", path.display()))?;
        Ok(())
    }

    pub fn apply_env(&mut self) {
        if let Ok(p) = env::var("LUCID_DB_PATH") {
            self.db_path = Some(p);
        }
        if let Ok(id) = env::var("LUCID_NODE_ID") {
            self.node_id = Some(id);
        }
        override_parsed("LUCID_QUORUM", &mut self.quorum);
        override_parsed("LUCID_ROUND_TIMEOUT_MS", &mut self.round_timeout_ms);
        override_parsed("LUCID_SLOT_INTERVAL_MS", &mut self.slot_interval_ms);
        override_parsed("LUCID_SLOTS_PER_EPOCH", &mut self.slots_per_epoch);
        override_parsed("LUCID_MAX_TXS_PER_BLOCK", &mut self.max_transactions_per_block);
        override_parsed("LUCID_POOT_MULTIPLIER", &mut self.poot.multiplier);
        override_parsed(
            "LUCID_MIN_OBSERVATION_SECS",
            &mut self.poot.min_observation_time_secs,
        );
        override_parsed("LUCID_POOT_MAX_SCORE", &mut self.poot.max_score);
        override_parsed("LUCID_ELIGIBILITY_FLOOR", &mut self.poot.eligibility_floor);
    }

    pub fn validate(&self) -> ConfigValidation {
        let mut v = ConfigValidation::new();

        if self.round_timeout_ms == 0 {
            v.add_error("round_timeout_ms must be positive".into());
        }
        if self.slot_interval_ms == 0 {
            v.add_error("slot_interval_ms must be positive".into());
        } else if self.round_timeout_ms > self.slot_interval_ms {
            v.add_warning(format!(
                "round timeout {}ms exceeds slot interval {}ms; slots will be skipped",
                self.round_timeout_ms, self.slot_interval_ms
            ));
        }
        if self.slots_per_epoch == 0 {
            v.add_error("slots_per_epoch must be positive".into());
        }
        if self.max_transactions_per_block == 0 {
            v.add_error("max_transactions_per_block must be positive".into());
        }
        if self.max_pending_transactions < self.max_transactions_per_block {
            v.add_warning(format!(
                "pending pool ({}) smaller than one block ({})",
                self.max_pending_transactions, self.max_transactions_per_block
            ));
        }
        if let QuorumPolicy::Fixed(0) = self.quorum {
            v.add_error("fixed quorum size must be at least 1".into());
        }

        let p = &self.poot;
        if !p.multiplier.is_finite() || p.multiplier < 0.0 {
            v.add_error(format!("poot.multiplier {} must be finite and >= 0", p.multiplier));
        }
        if !p.max_score.is_finite() || p.max_score <= 0.0 {
            v.add_error(format!("poot.max_score {} must be positive", p.max_score));
        }
        if !p.eligibility_floor.is_finite()
            || p.eligibility_floor < 0.0
            || p.eligibility_floor >= p.max_score
        {
            v.add_error(format!(
                "poot.eligibility_floor {} must lie in [0, max_score)",
                p.eligibility_floor
            ));
        }

        match &self.db_path {
            Some(path) => {
                let path = Path::new(path);
                if !path.exists() {
                    if let Err(e) = fs::create_dir_all(path) {
                        v.add_error(format!(
                            "cannot create RocksDB directory '{}': {}",
                            path.display(),
                            e
                        ));
                    }
                }
            }
            None => v.add_warning("db_path unset; chain is kept in memory only".into()),
        }

        v
    }
}

fn override_parsed<T: FromStr>(key: &str, slot: &mut T) {
    if let Ok(raw) = env::var(key) {
        match raw.parse::<T>() {
            Ok(val) => *slot = val,
            Err(_) => warn!("Ignoring {}={}: not a valid value", key, raw),
        }
    }
}

/// Validation result for configuration checks
pub struct ConfigValidation {
    pub valid: bool,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl ConfigValidation {
    fn new() -> Self {
        Self {
            valid: true,
            warnings: Vec::new(),
            errors: Vec::new(),
        }
    }

    fn add_warning(&mut self, msg: String) {
        self.warnings.push(msg);
    }

    fn add_error(&mut self, msg: String) {
        self.errors.push(msg);
        self.valid = false;
    }

    pub fn print_summary(&self) {
        for w in &self.warnings {
            warn!("Config: {}", w);
        }
        for e in &self.errors {
            error!("Config: {}", e);
        }
        if self.valid && self.warnings.is_empty() {
            info!("Configuration validation passed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_are_valid() {
        let v = ChainConfig::default().validate();
        assert!(v.valid, "{:?}", v.errors);
    }

    #[test]
    fn bad_poot_values_are_errors() {
        let mut cfg = ChainConfig::default();
        cfg.poot.multiplier = -1.0;
        cfg.poot.eligibility_floor = 200.0;
        let v = cfg.validate();
        assert!(!v.valid);
        assert_eq!(v.errors.len(), 2);
    }

    #[test]
    fn file_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("lucid.json");
        let mut cfg = ChainConfig::default();
        cfg.quorum = QuorumPolicy::Fixed(4);
        cfg.round_timeout_ms = 1234;
        cfg.save(&path).unwrap();

        let raw = fs::read_to_string(&path).unwrap();
        let loaded: ChainConfig = serde_json::from_str(&raw).unwrap();
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let cfg: ChainConfig = serde_json::from_str(r#"{"slots_per_epoch": 10}"#).unwrap();
        assert_eq!(cfg.slots_per_epoch, 10);
        assert_eq!(cfg.round_timeout_ms, 5_000);
    }
}
