// src/consensus/engine.rs
// Vote intake, quorum detection and round deadlines for the slot-driven PoOT consensus.

use crate::consensus::quorum::QuorumPolicy;
use crate::consensus::round::{ConsensusRound, RoundId, RoundState, Vote, VoteOutcome};
use crate::consensus::validator_registry::{NodeId, NodeRegistry};
use crate::crypto::{keys, CanonicalBytes, Hash, SignatureVerifier};
use crate::errors::{ChainError, Result};
use crate::metrics::{ChainMetrics, METRICS};
use crate::poot::EpochId;
use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;

/// Closed rounds kept for late-vote classification and inspection.
const MAX_ROUND_HISTORY: usize = 1000;

const VOTE_TAG: &[u8] = b"LUCID-VOTE-V1";

/// Canonical bytes a validator signs to vote for `candidate` in `round`.
pub fn vote_payload_bytes(round: RoundId, candidate: &Hash, node_id: &str) -> Vec<u8> {
    CanonicalBytes::tagged(VOTE_TAG)
        .u64(round.height)
        .u32(round.attempt)
        .digest(candidate)
        .str(node_id)
        .into_bytes()
}

/// Sign a vote with a 32-byte validator seed.
pub fn sign_vote(seed: &[u8], round: RoundId, candidate: &Hash, node_id: &str) -> Option<Vec<u8>> {
    keys::sign_bytes(seed, &vote_payload_bytes(round, candidate, node_id))
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusStats {
    pub total_rounds: u64,
    pub finalized_rounds: u64,
    pub timed_out_rounds: u64,
    pub accepted_votes: u64,
    pub rejected_votes: u64,
}

/// Result of a closed round, reported by [`ConsensusEngine::tick`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoundSummary {
    pub round_id: RoundId,
    pub state: RoundState,
    pub votes: usize,
    pub threshold: usize,
}

pub struct ConsensusEngine {
    policy: QuorumPolicy,
    round_timeout: Duration,
    registry: Arc<dyn NodeRegistry>,
    verifier: Arc<dyn SignatureVerifier>,
    active: Mutex<Option<ConsensusRound>>,
    history: Mutex<VecDeque<ConsensusRound>>,
    stats: Mutex<ConsensusStats>,
}

impl ConsensusEngine {
    pub fn new(
        policy: QuorumPolicy,
        round_timeout_ms: u64,
        registry: Arc<dyn NodeRegistry>,
        verifier: Arc<dyn SignatureVerifier>,
    ) -> Self {
        Self {
            policy,
            round_timeout: Duration::milliseconds(round_timeout_ms as i64),
            registry,
            verifier,
            active: Mutex::new(None),
            history: Mutex::new(VecDeque::new()),
            stats: Mutex::new(ConsensusStats::default()),
        }
    }

    pub fn policy(&self) -> QuorumPolicy {
        self.policy
    }

    /// Open a COLLECTING round on `candidate`. Fails while another round is still collecting.
    pub fn open_round(
        &self,
        round_id: RoundId,
        epoch_id: EpochId,
        proposer: &str,
        candidate: Hash,
        now: DateTime<Utc>,
    ) -> Result<RoundId> {
        let electorate: BTreeSet<NodeId> =
            self.registry.list_eligible_nodes(epoch_id).into_iter().collect();
        let threshold = self.policy.threshold(electorate.len())?;

        let mut active = self.active.lock();
        if let Some(current) = active.as_mut() {
            current.check_deadline(now);
            if current.state() == RoundState::Collecting {
                return Err(ChainError::InvalidParameter(format!(
                    "round {} is still collecting",
                    current.round_id
                )));
            }
        }
        if let Some(previous) = active.take() {
            self.archive(previous);
        }

        info!(
            "CONSENSUS: round {} opened (epoch {}, proposer {}, candidate {}, quorum {}/{})",
            round_id,
            epoch_id,
            proposer,
            candidate,
            threshold,
            electorate.len()
        );
        *active = Some(ConsensusRound::new(
            round_id,
            epoch_id,
            proposer.to_string(),
            candidate,
            now,
            now + self.round_timeout,
            threshold,
            electorate,
        ));
        self.stats.lock().total_rounds += 1;
        ChainMetrics::inc(&METRICS.rounds_opened);
        Ok(round_id)
    }

    fn archive(&self, round: ConsensusRound) {
        let mut history = self.history.lock();
        history.push_back(round);
        while history.len() > MAX_ROUND_HISTORY {
            history.pop_front();
        }
    }

    pub fn submit_vote(
        &self,
        round_id: RoundId,
        node_id: &str,
        candidate_block_hash: Hash,
        signature: &[u8],
    ) -> Result<VoteOutcome> {
        self.submit_vote_at(round_id, node_id, candidate_block_hash, signature, Utc::now())
    }

    /// Verify and count a vote. Rejected votes never touch the tally.
    pub fn submit_vote_at(
        &self,
        round_id: RoundId,
        node_id: &str,
        candidate_block_hash: Hash,
        signature: &[u8],
        now: DateTime<Utc>,
    ) -> Result<VoteOutcome> {
        let result = self.ingest_vote(round_id, node_id, candidate_block_hash, signature, now);
        match &result {
            Ok(outcome) => {
                self.stats.lock().accepted_votes += 1;
                ChainMetrics::inc(&METRICS.votes_accepted);
                if let VoteOutcome::Finalized(qc) = outcome {
                    self.stats.lock().finalized_rounds += 1;
                    ChainMetrics::inc(&METRICS.rounds_finalized);
                    info!(
                        "CONSENSUS: round {} finalized on {} with {} votes",
                        qc.round,
                        qc.block_hash,
                        qc.signers.len()
                    );
                }
            }
            Err(e) => {
                self.stats.lock().rejected_votes += 1;
                ChainMetrics::inc(&METRICS.votes_rejected);
                warn!(
                    "CONSENSUS: rejected vote from {} for round {}: {}",
                    node_id, round_id, e
                );
            }
        }
        result
    }

    fn ingest_vote(
        &self,
        round_id: RoundId,
        node_id: &str,
        candidate_block_hash: Hash,
        signature: &[u8],
        now: DateTime<Utc>,
    ) -> Result<VoteOutcome> {
        let public_key = self
            .registry
            .get_public_key(node_id)
            .ok_or_else(|| ChainError::UnknownNode(node_id.to_string()))?;

        let payload = vote_payload_bytes(round_id, &candidate_block_hash, node_id);
        if !self.verifier.verify_signature(&public_key, &payload, signature) {
            return Err(ChainError::InvalidSignature(node_id.to_string()));
        }

        let mut active = self.active.lock();
        let is_current = active.as_ref().map_or(false, |r| r.round_id == round_id);
        if !is_current {
            drop(active);
            if self.history.lock().iter().any(|r| r.round_id == round_id) {
                return Err(ChainError::RoundClosed(round_id.to_string()));
            }
            return Err(ChainError::UnknownRound(round_id.to_string()));
        }
        let round = active
            .as_mut()
            .ok_or_else(|| ChainError::UnknownRound(round_id.to_string()))?;

        let vote = Vote {
            node_id: node_id.to_string(),
            candidate_block_hash,
            signature: signature.to_vec(),
            received_at: now,
        };
        let was_collecting = round.state() == RoundState::Collecting;
        let outcome = round.record_vote(vote, now);
        if was_collecting && round.state() == RoundState::TimedOut {
            self.note_timeout(round);
        }
        if let Ok(VoteOutcome::Counted { votes_for, threshold }) = &outcome {
            debug!(
                "CONSENSUS: round {} vote from {} ({}/{})",
                round_id, node_id, votes_for, threshold
            );
        }
        outcome
    }

    fn note_timeout(&self, round: &ConsensusRound) {
        self.stats.lock().timed_out_rounds += 1;
        ChainMetrics::inc(&METRICS.rounds_timed_out);
        let best = round.tally().values().copied().max().unwrap_or(0);
        warn!(
            "CONSENSUS: round {} timed out with {}/{} votes for the leading candidate",
            round.round_id, best, round.threshold
        );
    }

    /// Scheduler tick: time out the active round if its deadline has passed.
    pub fn tick(&self, now: DateTime<Utc>) -> Option<RoundSummary> {
        let mut active = self.active.lock();
        let round = active.as_mut()?;
        if !round.check_deadline(now) {
            return None;
        }
        self.note_timeout(round);
        Some(RoundSummary {
            round_id: round.round_id,
            state: round.state(),
            votes: round.votes().len(),
            threshold: round.threshold,
        })
    }

    /// Snapshot of the active round.
    pub fn active_round(&self) -> Option<ConsensusRound> {
        self.active.lock().clone()
    }

    pub fn round_state(&self, round_id: RoundId) -> Option<RoundState> {
        if let Some(r) = self.active.lock().as_ref().filter(|r| r.round_id == round_id) {
            return Some(r.state());
        }
        self.history
            .lock()
            .iter()
            .rev()
            .find(|r| r.round_id == round_id)
            .map(|r| r.state())
    }

    pub fn stats(&self) -> ConsensusStats {
        self.stats.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::validator_registry::ValidatorRegistry;
    use crate::crypto::{hash, keys::public_from_seed, Ed25519Verifier};

    fn setup(n: u8) -> (ConsensusEngine, Vec<(String, [u8; 32])>) {
        let registry = ValidatorRegistry::new();
        let mut nodes = Vec::new();
        for i in 0..n {
            let seed = [i + 1; 32];
            let id = format!("node-{}", i);
            registry.register(&id, public_from_seed(&seed).unwrap());
            nodes.push((id, seed));
        }
        let engine = ConsensusEngine::new(
            QuorumPolicy::Majority,
            1_000,
            Arc::new(registry),
            Arc::new(Ed25519Verifier),
        );
        (engine, nodes)
    }

    #[test]
    fn signature_must_match_claimed_node() {
        let (engine, nodes) = setup(3);
        let now = Utc::now();
        let id = RoundId::new(1, 0);
        let h = hash(b"block");
        engine.open_round(id, 0, "node-0", h, now).unwrap();

        // node-1's signature presented as node-2's vote
        let forged = sign_vote(&nodes[1].1, id, &h, "node-2").unwrap();
        assert!(matches!(
            engine.submit_vote_at(id, "node-2", h, &forged, now),
            Err(ChainError::InvalidSignature(_))
        ));
        assert!(engine.active_round().unwrap().votes().is_empty());
        assert_eq!(engine.stats().rejected_votes, 1);
    }

    #[test]
    fn vote_for_wrong_round() {
        let (engine, nodes) = setup(3);
        let now = Utc::now();
        let h = hash(b"block");
        engine.open_round(RoundId::new(1, 0), 0, "node-0", h, now).unwrap();
        let other = RoundId::new(1, 1);
        let sig = sign_vote(&nodes[0].1, other, &h, "node-0").unwrap();
        assert!(matches!(
            engine.submit_vote_at(other, "node-0", h, &sig, now),
            Err(ChainError::UnknownRound(_))
        ));
    }

    #[test]
    fn tick_times_out_and_next_round_opens() {
        let (engine, _) = setup(3);
        let now = Utc::now();
        let h = hash(b"block");
        let first = RoundId::new(1, 0);
        engine.open_round(first, 0, "node-0", h, now).unwrap();
        assert!(engine
            .open_round(first.retry(), 0, "node-0", h, now)
            .is_err());

        assert!(engine.tick(now).is_none());
        let summary = engine.tick(now + Duration::seconds(2)).unwrap();
        assert_eq!(summary.state, RoundState::TimedOut);
        assert!(engine.tick(now + Duration::seconds(3)).is_none());

        engine
            .open_round(first.retry(), 0, "node-0", h, now + Duration::seconds(3))
            .unwrap();
        assert_eq!(engine.round_state(first), Some(RoundState::TimedOut));
        assert_eq!(engine.stats().timed_out_rounds, 1);
        assert_eq!(engine.stats().total_rounds, 2);
    }

    #[test]
    fn vote_payload_binds_round_and_node() {
        let h = hash(b"x");
        let a = vote_payload_bytes(RoundId::new(1, 0), &h, "n");
        assert_ne!(a, vote_payload_bytes(RoundId::new(1, 1), &h, "n"));
        assert_ne!(a, vote_payload_bytes(RoundId::new(1, 0), &h, "m"));
    }
}
