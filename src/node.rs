// src/node.rs
// Slot driver: leader selection, candidate assembly, local voting and chain append.

use crate::chain::block::{Block, GENESIS_TIMESTAMP_MS};
use crate::chain::manager::BlockManager;
use crate::config::ChainConfig;
use crate::consensus::engine::{sign_vote, ConsensusEngine, RoundSummary};
use crate::consensus::leader_rotation::rank_candidates;
use crate::consensus::quorum::QuorumCertificate;
use crate::consensus::round::{RoundId, RoundState, VoteOutcome};
use crate::consensus::validator_registry::NodeId;
use crate::crypto::{keys, Hash};
use crate::errors::{ChainError, Result};
use crate::poot::{EpochId, PootCalculator, ScoreBoard};
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::sync::Arc;

/// This node's signing identity.
#[derive(Clone)]
pub struct LocalValidator {
    pub node_id: NodeId,
    seed: [u8; 32],
}

impl LocalValidator {
    pub fn new(node_id: &str, seed: [u8; 32]) -> Self {
        Self {
            node_id: node_id.to_string(),
            seed,
        }
    }

    pub fn from_hex(node_id: &str, seed_hex: &str) -> Result<Self> {
        let mut seed = [0u8; 32];
        hex::decode_to_slice(seed_hex.trim(), &mut seed)
            .map_err(|e| ChainError::InvalidParameter(format!("validator seed: {}", e)))?;
        Ok(Self::new(node_id, seed))
    }

    pub fn public_key(&self) -> Vec<u8> {
        // seed is always 32 bytes
        keys::public_from_seed(&self.seed).unwrap_or_default()
    }

    pub fn seed(&self) -> &[u8; 32] {
        &self.seed
    }

    pub fn sign_vote(&self, round: RoundId, candidate: &Hash) -> Option<Vec<u8>> {
        sign_vote(&self.seed, round, candidate, &self.node_id)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum SlotOutcome {
    /// A round is still collecting votes.
    Collecting(RoundId),
    /// Slot already handled; waiting for the next one.
    Waiting,
    Opened {
        round: RoundId,
        leader: NodeId,
        candidate: Hash,
    },
    /// No node had an eligible score for the epoch.
    Missed { slot: u64, epoch: EpochId },
    TimedOut(RoundSummary),
    Appended { height: u64, block_id: Hash },
}

#[derive(Default)]
struct SlotState {
    last_slot: Option<u64>,
    height: u64,
    attempt: u32,
    candidate: Option<Block>,
}

pub struct ValidatorNode {
    config: ChainConfig,
    manager: Arc<BlockManager>,
    engine: Arc<ConsensusEngine>,
    scores: Arc<ScoreBoard>,
    calculator: Arc<PootCalculator>,
    local: Option<LocalValidator>,
    slots: Mutex<SlotState>,
}

impl ValidatorNode {
    pub fn new(
        config: ChainConfig,
        manager: Arc<BlockManager>,
        engine: Arc<ConsensusEngine>,
        scores: Arc<ScoreBoard>,
        calculator: Arc<PootCalculator>,
        local: Option<LocalValidator>,
    ) -> Self {
        Self {
            config,
            manager,
            engine,
            scores,
            calculator,
            local,
            slots: Mutex::new(SlotState::default()),
        }
    }

    pub fn manager(&self) -> &Arc<BlockManager> {
        &self.manager
    }

    pub fn engine(&self) -> &Arc<ConsensusEngine> {
        &self.engine
    }

    pub fn scores(&self) -> &Arc<ScoreBoard> {
        &self.scores
    }

    /// Slot number since genesis; the same on every node with a synchronised clock.
    pub fn slot_at(&self, now: DateTime<Utc>) -> u64 {
        let elapsed = now.timestamp_millis().saturating_sub(GENESIS_TIMESTAMP_MS).max(0) as u64;
        elapsed / self.config.slot_interval_ms.max(1)
    }

    pub fn epoch_of(&self, slot: u64) -> EpochId {
        slot / self.config.slots_per_epoch.max(1)
    }

    /// Sign this node's accumulated observation time for `epoch_id` and submit it.
    pub fn publish_score(&self, epoch_id: EpochId) -> Result<f64> {
        let local = self
            .local
            .as_ref()
            .ok_or_else(|| ChainError::InvalidParameter("node has no validator identity".into()))?;
        let score = self.calculator.sign_score(&local.node_id, epoch_id, local.seed())?;
        self.scores.submit_score(score)
    }

    /// Scheduler tick: expire the active round, otherwise open a round when a new
    /// slot has started.
    pub fn tick(&self, now: DateTime<Utc>) -> Result<SlotOutcome> {
        let mut slots = self.slots.lock();

        if let Some(summary) = self.engine.tick(now) {
            // height is retried next slot with a fresh candidate; pool is untouched
            slots.candidate = None;
            slots.attempt = slots.attempt.saturating_add(1);
            return Ok(SlotOutcome::TimedOut(summary));
        }
        let last_round = self.engine.active_round().map(|r| (r.round_id, r.state()));
        if let Some((round_id, RoundState::Collecting)) = last_round {
            return Ok(SlotOutcome::Collecting(round_id));
        }

        let slot = self.slot_at(now);
        if slots.last_slot.map_or(false, |last| slot <= last) {
            return Ok(SlotOutcome::Waiting);
        }
        slots.last_slot = Some(slot);
        let epoch = self.epoch_of(slot);

        let height = self.manager.get_latest_block().height + 1;
        if slots.height != height {
            slots.height = height;
            slots.attempt = 0;
        }
        // a round at this height closed without an append (late-vote timeout, or a
        // finalized block this node never held): never reuse its round id
        if let Some((last, _)) = last_round {
            if last.height == height && last.attempt >= slots.attempt {
                slots.attempt = last.attempt.saturating_add(1);
            }
        }

        let ranked = rank_candidates(&self.scores.eligible_scores(epoch));
        let Some(leader) = ranked.first().cloned() else {
            warn!("CONSENSUS: slot {} (epoch {}) has no eligible leader", slot, epoch);
            return Ok(SlotOutcome::Missed { slot, epoch });
        };

        let candidate = self.manager.propose_next(&leader, now)?;
        let round = RoundId::new(height, slots.attempt);
        self.engine
            .open_round(round, epoch, &leader, candidate.block_id, now)?;
        let candidate_id = candidate.block_id;
        debug!(
            "CONSENSUS: slot {} leader {} (fallbacks {:?})",
            slot,
            leader,
            &ranked[1..]
        );
        slots.candidate = Some(candidate);
        drop(slots);

        if let Some(appended) = self.cast_local_vote(round, now)? {
            return Ok(appended);
        }
        Ok(SlotOutcome::Opened {
            round,
            leader,
            candidate: candidate_id,
        })
    }

    /// Vote for the held candidate if it passes local validation; abstain otherwise.
    fn cast_local_vote(&self, round: RoundId, now: DateTime<Utc>) -> Result<Option<SlotOutcome>> {
        let Some(local) = &self.local else {
            return Ok(None);
        };
        let held = self.slots.lock().candidate.clone();
        let Some(candidate) = held else {
            return Ok(None);
        };
        let previous = self.manager.get_latest_block();
        if let Err(e) = self.manager.validate_block(&candidate, &previous) {
            warn!(
                "CONSENSUS: {} withholding vote on {} for round {}: {}",
                local.node_id, candidate.block_id, round, e
            );
            return Ok(None);
        }
        let signature = local
            .sign_vote(round, &candidate.block_id)
            .ok_or_else(|| ChainError::InvalidParameter("validator seed must be 32 bytes".into()))?;
        match self.engine.submit_vote_at(round, &local.node_id, candidate.block_id, &signature, now) {
            Ok(VoteOutcome::Finalized(qc)) => self.commit(&qc).map(Some),
            Ok(VoteOutcome::Counted { .. }) => Ok(None),
            // not a member this epoch
            Err(ChainError::UnknownNode(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Peer vote intake; appends the held candidate when the vote completes quorum.
    pub fn submit_vote(
        &self,
        round: RoundId,
        node_id: &str,
        candidate_block_hash: Hash,
        signature: &[u8],
    ) -> Result<VoteOutcome> {
        self.submit_vote_at(round, node_id, candidate_block_hash, signature, Utc::now())
    }

    pub fn submit_vote_at(
        &self,
        round: RoundId,
        node_id: &str,
        candidate_block_hash: Hash,
        signature: &[u8],
        now: DateTime<Utc>,
    ) -> Result<VoteOutcome> {
        let outcome = self
            .engine
            .submit_vote_at(round, node_id, candidate_block_hash, signature, now)?;
        // vote was counted; commit failure is logged, not returned
        if let VoteOutcome::Finalized(qc) = &outcome {
            if let Err(e) = self.commit(qc) {
                error!(
                    "CONSENSUS: round {} finalized {} but the local append failed: {}",
                    qc.round, qc.block_hash, e
                );
            }
        }
        Ok(outcome)
    }

    fn commit(&self, qc: &QuorumCertificate) -> Result<SlotOutcome> {
        let mut slots = self.slots.lock();
        let candidate = match slots.candidate.take() {
            Some(c) if c.block_id == qc.block_hash => c,
            other => {
                slots.candidate = other;
                error!(
                    "CONSENSUS: round {} finalized {} which this node does not hold",
                    qc.round, qc.block_hash
                );
                return Err(ChainError::CertificateMismatch(format!(
                    "finalized block {} not held locally",
                    qc.block_hash
                )));
            }
        };
        let block = self.manager.append_block(candidate, qc)?;
        slots.attempt = 0;
        Ok(SlotOutcome::Appended {
            height: block.height,
            block_id: block.block_id,
        })
    }

    /// Drive `tick` on a fixed interval until the task is aborted.
    pub fn spawn_slot_timer(self: Arc<Self>, check_interval_ms: u64) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_millis(check_interval_ms.max(1)));
            info!(
                "CONSENSUS: slot timer started (check every {}ms, slot {}ms, round timeout {}ms)",
                check_interval_ms, self.config.slot_interval_ms, self.config.round_timeout_ms
            );
            loop {
                interval.tick().await;
                match self.tick(Utc::now()) {
                    Ok(SlotOutcome::Collecting(_)) | Ok(SlotOutcome::Waiting) => {}
                    Ok(outcome) => debug!("CONSENSUS: {:?}", outcome),
                    Err(e) => warn!("CONSENSUS: slot tick failed: {} ({:?})", e, e.kind()),
                }
            }
        })
    }
}
