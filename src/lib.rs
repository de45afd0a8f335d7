// src/lib.rs
// Lucid chain: PoOT-elected, quorum-finalized ledger of session Merkle anchors.

pub mod anchoring;
pub mod chain;
pub mod config;
pub mod consensus;
pub mod crypto;
pub mod errors;
pub mod merkle;
pub mod metrics;
pub mod node;
pub mod poot;
pub mod storage;

use crate::anchoring::{AnchoringService, ChunkSource};
use crate::chain::BlockManager;
use crate::config::ChainConfig;
use crate::consensus::engine::ConsensusEngine;
use crate::consensus::validator_registry::ValidatorRegistry;
use crate::crypto::{Ed25519Verifier, Hash};
use crate::errors::ChainError;
use crate::metrics::METRICS;
use crate::node::{LocalValidator, ValidatorNode};
use crate::poot::{PootCalculator, ScoreBoard};
use crate::storage::RocksDb;
use anyhow::{bail, Context};
use async_trait::async_trait;
use chrono::Utc;
use clap::{Parser, Subcommand};
use log::{debug, info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// JSON config file (LUCID_* environment variables override it)
    #[arg(long, global = true, default_value = "lucid.json")]
    config: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the slot driver until Ctrl+C
    Start {
        /// How often the slot timer checks deadlines and slot boundaries
        #[arg(long, default_value_t = 250)]
        check_interval_ms: u64,
        /// How often this node credits its own observation time
        #[arg(long, default_value_t = 60)]
        observation_report_secs: u64,
    },
    /// Re-validate persisted blocks between two heights
    VerifyChain {
        #[arg(long, default_value_t = 0)]
        start: u64,
        /// Defaults to the current tip
        #[arg(long)]
        end: Option<u64>,
    },
    /// Print chain and metrics summary as JSON
    Info {
        /// Print metrics in Prometheus text format instead
        #[arg(long)]
        prometheus: bool,
    },
    /// Anchor a session from a manifest of hex chunk hashes, one per line
    Anchor {
        #[arg(long)]
        session: String,
        #[arg(long)]
        manifest: PathBuf,
    },
    /// Add a validator public key to the persisted registry
    RegisterValidator {
        #[arg(long)]
        node_id: String,
        /// 32-byte ed25519 public key, hex
        #[arg(long)]
        public_key: String,
    },
}

/// Chunk hashes read from a manifest file, one hex digest per line.
pub struct ManifestFile {
    path: PathBuf,
}

impl ManifestFile {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

pub fn parse_manifest(raw: &str) -> errors::Result<Vec<Hash>> {
    raw.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(|l| {
            Hash::from_hex(l)
                .map_err(|e| ChainError::InvalidParameter(format!("chunk hash '{}': {}", l, e)))
        })
        .collect()
}

#[async_trait]
impl ChunkSource for ManifestFile {
    async fn fetch_chunk_hashes(&self, session_id: &str) -> errors::Result<Vec<Hash>> {
        let raw = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            ChainError::InvalidParameter(format!(
                "manifest {} for session {}: {}",
                self.path.display(),
                session_id,
                e
            ))
        })?;
        parse_manifest(&raw)
    }
}

/// Chain and registry over one RocksDB handle, or in memory when no path is configured.
/// Chain, validator registry and the shared RocksDB handle when one is configured.
fn open_chain(
    cfg: &ChainConfig,
) -> anyhow::Result<(Arc<BlockManager>, Arc<ValidatorRegistry>, Option<RocksDb>)> {
    match &cfg.db_path {
        Some(path) => {
            let db = storage::try_open_db(path)
                .with_context(|| format!("open RocksDB at {}", path))?;
            let manager = BlockManager::open(
                db.clone(),
                cfg.max_transactions_per_block,
                cfg.max_pending_transactions,
            )?;
            let registry = ValidatorRegistry::with_db(db.clone());
            Ok((Arc::new(manager), Arc::new(registry), Some(db)))
        }
        None => Ok((
            Arc::new(BlockManager::from_config(cfg)?),
            Arc::new(ValidatorRegistry::new()),
            None,
        )),
    }
}

fn local_validator(cfg: &ChainConfig) -> anyhow::Result<Option<LocalValidator>> {
    let Ok(seed_hex) = std::env::var("LUCID_VALIDATOR_SEED") else {
        return Ok(None);
    };
    let node_id = cfg
        .node_id
        .clone()
        .context("LUCID_VALIDATOR_SEED is set but no node_id is configured")?;
    Ok(Some(LocalValidator::from_hex(&node_id, &seed_hex)?))
}

async fn start_node(
    cfg: ChainConfig,
    check_interval_ms: u64,
    observation_report_secs: u64,
) -> anyhow::Result<()> {
    let (manager, registry, _) = open_chain(&cfg)?;
    if let Some(reason) = manager.halted_reason() {
        bail!("chain is halted: {}", reason);
    }
    let local = local_validator(&cfg)?;
    match &local {
        Some(v) if !registry.exists(&v.node_id) => {
            info!("CONSENSUS: registering local validator {}", v.node_id);
            registry.register(&v.node_id, v.public_key());
        }
        Some(v) => info!("CONSENSUS: running as validator {}", v.node_id),
        None => warn!("CONSENSUS: LUCID_VALIDATOR_SEED not set, running as observer"),
    }

    let verifier = Arc::new(Ed25519Verifier);
    let calculator = Arc::new(PootCalculator::new(cfg.poot.clone()));
    let scores = Arc::new(ScoreBoard::new(
        calculator.clone(),
        registry.clone(),
        verifier.clone(),
    ));
    let engine = Arc::new(ConsensusEngine::new(
        cfg.quorum,
        cfg.round_timeout_ms,
        registry.clone(),
        verifier,
    ));
    let node = Arc::new(ValidatorNode::new(
        cfg.clone(),
        manager.clone(),
        engine,
        scores.clone(),
        calculator.clone(),
        local.clone(),
    ));

    let slot_timer = node.clone().spawn_slot_timer(check_interval_ms);

    // local telemetry: credit our own uptime and publish once the epoch minimum is met
    let telemetry = local.map(|validator| {
        let node = node.clone();
        tokio::spawn(async move {
            let period = observation_report_secs.max(1);
            let mut interval = tokio::time::interval(Duration::from_secs(period));
            interval.tick().await;
            loop {
                interval.tick().await;
                let epoch = node.epoch_of(node.slot_at(Utc::now()));
                calculator.report_observation_time(&validator.node_id, epoch, period);
                calculator.prune_before(epoch.saturating_sub(1));
                scores.prune_before(epoch.saturating_sub(1));
                if scores.score_of(&validator.node_id, epoch).is_some() {
                    continue;
                }
                match node.publish_score(epoch) {
                    Ok(score) => info!("POOT: published score {:.4} for epoch {}", score, epoch),
                    Err(ChainError::InsufficientObservation { observed, minimum }) => debug!(
                        "POOT: epoch {} observation {}s below minimum {}s",
                        epoch, observed, minimum
                    ),
                    Err(e) => warn!("POOT: score publication failed: {}", e),
                }
            }
        })
    });

    info!(
        "Node started: tip {} at height {}",
        manager.get_latest_block().block_id,
        manager.get_latest_block().height
    );
    tokio::signal::ctrl_c().await.context("wait for Ctrl+C")?;
    info!("Shutting down");
    slot_timer.abort();
    if let Some(handle) = telemetry {
        handle.abort();
    }
    Ok(())
}

pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = ChainConfig::load(Some(&cli.config))?;
    let validation = cfg.validate();
    validation.print_summary();
    if !validation.valid {
        bail!("invalid configuration: {}", validation.errors.join("; "));
    }

    match cli.command {
        Commands::Start {
            check_interval_ms,
            observation_report_secs,
        } => start_node(cfg, check_interval_ms, observation_report_secs).await?,
        Commands::VerifyChain { start, end } => {
            let (manager, _, _) = open_chain(&cfg)?;
            let end = end.unwrap_or_else(|| manager.get_latest_block().height);
            manager.verify_chain_integrity(start, end)?;
            println!("chain verified: heights {}..={}", start, end);
        }
        Commands::Info { prometheus: true } => {
            open_chain(&cfg)?;
            print!("{}", METRICS.export_prometheus());
        }
        Commands::Info { prometheus: false } => {
            let (manager, registry, _) = open_chain(&cfg)?;
            let summary = serde_json::json!({
                "chain": manager.chain_info(),
                "validators": registry.count(),
                "metrics": METRICS.export_json(),
            });
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Anchor { session, manifest } => {
            let (manager, _, db) = open_chain(&cfg)?;
            let timeout = Duration::from_millis(cfg.chunk_source_timeout_ms);
            let service = match db {
                Some(db) => AnchoringService::with_db(manager, timeout, db),
                None => AnchoringService::new(manager, timeout),
            };
            let tx = service
                .anchor_from_source(&ManifestFile::new(&manifest), &session)
                .await?;
            println!("{}", serde_json::to_string_pretty(&tx)?);
            println!("status: {:?}", service.get_anchor_status(&session));
        }
        Commands::RegisterValidator {
            node_id,
            public_key,
        } => {
            let key = hex::decode(public_key.trim()).context("public key must be hex")?;
            if key.len() != 32 {
                bail!("public key must be 32 bytes, got {}", key.len());
            }
            let (_, registry, _) = open_chain(&cfg)?;
            registry.register(&node_id, key);
            println!("registered {} ({} validators)", node_id, registry.count());
        }
    }
    Ok(())
}
