// src/poot.rs
// Proof of Observation Time: telemetry intake, bounded scoring and signed score submissions.

use crate::config::PootConfig;
use crate::consensus::validator_registry::{NodeId, NodeRegistry};
use crate::crypto::{keys, CanonicalBytes, SignatureVerifier};
use crate::errors::{ChainError, Result};
use log::{debug, warn};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

pub type EpochId = u64;

pub const SECONDS_PER_HOUR: f64 = 3600.0;
pub const DEFAULT_MAX_SCORE: f64 = 100.0;

const SCORE_TAG: &[u8] = b"LUCID-POOT-V1";

/// Score with the default cap. See [`calculate_score_capped`].
pub fn calculate_score(
    observation_time_seconds: u64,
    multiplier: f64,
    min_observation_time: u64,
) -> Result<f64> {
    calculate_score_capped(
        observation_time_seconds,
        multiplier,
        min_observation_time,
        DEFAULT_MAX_SCORE,
    )
}

/// Observed hours times `multiplier`, capped at `max_score`.
/// Below `min_observation_time` the node is ineligible and the caller decides what to do.
pub fn calculate_score_capped(
    observation_time_seconds: u64,
    multiplier: f64,
    min_observation_time: u64,
    max_score: f64,
) -> Result<f64> {
    if !multiplier.is_finite() || multiplier < 0.0 {
        return Err(ChainError::InvalidParameter(format!(
            "multiplier {} must be finite and non-negative",
            multiplier
        )));
    }
    if !max_score.is_finite() || max_score <= 0.0 {
        return Err(ChainError::InvalidParameter(format!(
            "max score {} must be positive",
            max_score
        )));
    }
    if observation_time_seconds < min_observation_time {
        return Err(ChainError::InsufficientObservation {
            observed: observation_time_seconds,
            minimum: min_observation_time,
        });
    }
    let hours = observation_time_seconds as f64 / SECONDS_PER_HOUR;
    Ok((hours * multiplier).min(max_score))
}

/// Canonical bytes a node signs when submitting its score.
pub fn score_payload_bytes(node_id: &str, epoch_id: EpochId, observation_time_seconds: u64) -> Vec<u8> {
    CanonicalBytes::tagged(SCORE_TAG)
        .str(node_id)
        .u64(epoch_id)
        .u64(observation_time_seconds)
        .into_bytes()
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PootScore {
    pub node_id: NodeId,
    pub epoch_id: EpochId,
    pub observation_time_seconds: u64,
    /// Derived; receivers recompute it rather than trusting this field.
    pub score: f64,
    pub signature: Vec<u8>,
}

impl PootScore {
    pub fn signing_message(&self) -> Vec<u8> {
        score_payload_bytes(&self.node_id, self.epoch_id, self.observation_time_seconds)
    }
}

/// Per-node telemetry accumulator and score function for one configuration.
pub struct PootCalculator {
    config: PootConfig,
    observed: RwLock<HashMap<(NodeId, EpochId), u64>>,
}

impl PootCalculator {
    pub fn new(config: PootConfig) -> Self {
        Self {
            config,
            observed: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &PootConfig {
        &self.config
    }

    pub fn calculate_score(&self, observation_time_seconds: u64) -> Result<f64> {
        calculate_score_capped(
            observation_time_seconds,
            self.config.multiplier,
            self.config.min_observation_time_secs,
            self.config.max_score,
        )
    }

    /// Telemetry intake; repeated reports for the same epoch accumulate.
    pub fn report_observation_time(&self, node_id: &str, epoch_id: EpochId, seconds: u64) {
        let mut observed = self.observed.write();
        let total = observed
            .entry((node_id.to_string(), epoch_id))
            .or_insert(0);
        *total = total.saturating_add(seconds);
        debug!(
            "POOT: {} observed {}s in epoch {} (total {}s)",
            node_id, seconds, epoch_id, *total
        );
    }

    pub fn observed_seconds(&self, node_id: &str, epoch_id: EpochId) -> u64 {
        self.observed
            .read()
            .get(&(node_id.to_string(), epoch_id))
            .copied()
            .unwrap_or(0)
    }

    /// Build and sign this node's score from accumulated telemetry.
    pub fn sign_score(&self, node_id: &str, epoch_id: EpochId, seed: &[u8]) -> Result<PootScore> {
        let seconds = self.observed_seconds(node_id, epoch_id);
        let score = self.calculate_score(seconds)?;
        let signature = keys::sign_bytes(seed, &score_payload_bytes(node_id, epoch_id, seconds))
            .ok_or_else(|| ChainError::InvalidParameter("validator seed must be 32 bytes".into()))?;
        Ok(PootScore {
            node_id: node_id.to_string(),
            epoch_id,
            observation_time_seconds: seconds,
            score,
            signature,
        })
    }

    /// Drop telemetry for epochs older than `epoch_id`.
    pub fn prune_before(&self, epoch_id: EpochId) {
        self.observed.write().retain(|(_, e), _| *e >= epoch_id);
    }
}

/// Signed score submissions collected per epoch. First submission per node wins.
pub struct ScoreBoard {
    calculator: Arc<PootCalculator>,
    registry: Arc<dyn NodeRegistry>,
    verifier: Arc<dyn SignatureVerifier>,
    scores: RwLock<BTreeMap<EpochId, BTreeMap<NodeId, PootScore>>>,
}

impl ScoreBoard {
    pub fn new(
        calculator: Arc<PootCalculator>,
        registry: Arc<dyn NodeRegistry>,
        verifier: Arc<dyn SignatureVerifier>,
    ) -> Self {
        Self {
            calculator,
            registry,
            verifier,
            scores: RwLock::new(BTreeMap::new()),
        }
    }

    /// Verify and record a score; returns the recomputed score.
    pub fn submit_score(&self, mut submission: PootScore) -> Result<f64> {
        let public_key = self
            .registry
            .get_public_key(&submission.node_id)
            .ok_or_else(|| ChainError::UnknownNode(submission.node_id.clone()))?;

        if !self.verifier.verify_signature(
            &public_key,
            &submission.signing_message(),
            &submission.signature,
        ) {
            warn!(
                "POOT: rejected score from {} for epoch {}: bad signature",
                submission.node_id, submission.epoch_id
            );
            return Err(ChainError::InvalidSignature(submission.node_id));
        }

        let score = self
            .calculator
            .calculate_score(submission.observation_time_seconds)?;
        if (submission.score - score).abs() > f64::EPSILON {
            debug!(
                "POOT: {} reported score {} but observation yields {}",
                submission.node_id, submission.score, score
            );
        }
        submission.score = score;

        let mut scores = self.scores.write();
        let epoch = scores.entry(submission.epoch_id).or_default();
        if epoch.contains_key(&submission.node_id) {
            return Err(ChainError::DuplicateScore {
                node_id: submission.node_id,
                epoch_id: submission.epoch_id,
            });
        }
        debug!(
            "POOT: accepted score {:.4} from {} for epoch {}",
            score, submission.node_id, submission.epoch_id
        );
        epoch.insert(submission.node_id.clone(), submission);
        Ok(score)
    }

    pub fn score_of(&self, node_id: &str, epoch_id: EpochId) -> Option<f64> {
        self.scores
            .read()
            .get(&epoch_id)
            .and_then(|e| e.get(node_id))
            .map(|s| s.score)
    }

    /// Scores strictly above the eligibility floor for nodes the registry lists for the epoch.
    pub fn eligible_scores(&self, epoch_id: EpochId) -> Vec<(NodeId, f64)> {
        let floor = self.calculator.config().eligibility_floor;
        let members = self.registry.list_eligible_nodes(epoch_id);
        let scores = self.scores.read();
        let Some(epoch) = scores.get(&epoch_id) else {
            return Vec::new();
        };
        members
            .into_iter()
            .filter_map(|node| {
                let score = epoch.get(&node)?.score;
                (score > floor).then_some((node, score))
            })
            .collect()
    }

    pub fn prune_before(&self, epoch_id: EpochId) {
        let mut scores = self.scores.write();
        *scores = scores.split_off(&epoch_id);
    }
}
