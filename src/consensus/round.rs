// src/consensus/round.rs
// One attempt to agree on the block at a height: COLLECTING until quorum or deadline.

use crate::consensus::quorum::{form_qc, select_winner, QuorumCertificate};
use crate::consensus::validator_registry::NodeId;
use crate::crypto::Hash;
use crate::errors::{ChainError, Result};
use crate::poot::EpochId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Target height plus retry attempt; a timed-out height is retried with `attempt + 1`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RoundId {
    pub height: u64,
    pub attempt: u32,
}

impl RoundId {
    pub fn new(height: u64, attempt: u32) -> Self {
        Self { height, attempt }
    }

    pub fn retry(&self) -> Self {
        Self {
            height: self.height,
            attempt: self.attempt.saturating_add(1),
        }
    }
}

impl fmt::Display for RoundId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.height, self.attempt)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoundState {
    Collecting,
    Finalized,
    TimedOut,
}

impl RoundState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RoundState::Collecting)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub node_id: NodeId,
    pub candidate_block_hash: Hash,
    pub signature: Vec<u8>,
    pub received_at: DateTime<Utc>,
}

/// Equivocation evidence: a second vote from the same node naming a different hash.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Equivocation {
    pub validator: NodeId,
    pub round: RoundId,
    pub existing: Hash,
    pub conflicting: Hash,
    pub observed_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VoteOutcome {
    Counted { votes_for: usize, threshold: usize },
    Finalized(QuorumCertificate),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConsensusRound {
    pub round_id: RoundId,
    pub epoch_id: EpochId,
    pub proposer: NodeId,
    pub candidate_block_hash: Hash,
    pub opened_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub threshold: usize,
    /// Nodes allowed to vote, fixed when the round opens.
    electorate: BTreeSet<NodeId>,
    state: RoundState,
    votes: BTreeMap<NodeId, Vote>,
    certificate: Option<QuorumCertificate>,
    equivocations: Vec<Equivocation>,
}

impl ConsensusRound {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        round_id: RoundId,
        epoch_id: EpochId,
        proposer: NodeId,
        candidate_block_hash: Hash,
        opened_at: DateTime<Utc>,
        deadline: DateTime<Utc>,
        threshold: usize,
        electorate: BTreeSet<NodeId>,
    ) -> Self {
        Self {
            round_id,
            epoch_id,
            proposer,
            candidate_block_hash,
            opened_at,
            deadline,
            threshold,
            electorate,
            state: RoundState::Collecting,
            votes: BTreeMap::new(),
            certificate: None,
            equivocations: Vec::new(),
        }
    }

    pub fn state(&self) -> RoundState {
        self.state
    }

    pub fn total_nodes(&self) -> usize {
        self.electorate.len()
    }

    pub fn is_voter(&self, node_id: &str) -> bool {
        self.electorate.contains(node_id)
    }

    pub fn votes(&self) -> &BTreeMap<NodeId, Vote> {
        &self.votes
    }

    pub fn certificate(&self) -> Option<&QuorumCertificate> {
        self.certificate.as_ref()
    }

    pub fn equivocations(&self) -> &[Equivocation] {
        &self.equivocations
    }

    /// Distinct votes per candidate hash.
    pub fn tally(&self) -> BTreeMap<Hash, usize> {
        let mut tallies = BTreeMap::new();
        for vote in self.votes.values() {
            *tallies.entry(vote.candidate_block_hash).or_insert(0) += 1;
        }
        tallies
    }

    /// Move to TIMED_OUT if the deadline has passed. Returns true on the transition.
    pub fn check_deadline(&mut self, now: DateTime<Utc>) -> bool {
        if self.state == RoundState::Collecting && now >= self.deadline {
            self.state = RoundState::TimedOut;
            return true;
        }
        false
    }

    /// Insert a vote whose signature the caller has already verified.
    /// Duplicate check and insert happen together; the first vote per node wins.
    pub fn record_vote(&mut self, vote: Vote, now: DateTime<Utc>) -> Result<VoteOutcome> {
        if self.state.is_terminal() || self.check_deadline(now) {
            return Err(ChainError::RoundClosed(self.round_id.to_string()));
        }
        if !self.is_voter(&vote.node_id) {
            return Err(ChainError::UnknownNode(vote.node_id));
        }

        if let Some(existing) = self.votes.get(&vote.node_id) {
            if existing.candidate_block_hash != vote.candidate_block_hash {
                self.equivocations.push(Equivocation {
                    validator: vote.node_id.clone(),
                    round: self.round_id,
                    existing: existing.candidate_block_hash,
                    conflicting: vote.candidate_block_hash,
                    observed_at: now,
                });
            }
            return Err(ChainError::DuplicateVote {
                node_id: vote.node_id,
                round: self.round_id.to_string(),
            });
        }

        let voted_for = vote.candidate_block_hash;
        self.votes.insert(vote.node_id.clone(), vote);

        let tallies = self.tally();
        match select_winner(&tallies, self.threshold) {
            Some(winner) => {
                let signers = self
                    .votes
                    .values()
                    .filter(|v| v.candidate_block_hash == winner)
                    .map(|v| v.node_id.clone())
                    .collect();
                let qc = form_qc(self.round_id, winner, signers, self.threshold);
                self.state = RoundState::Finalized;
                self.certificate = Some(qc.clone());
                Ok(VoteOutcome::Finalized(qc))
            }
            None => Ok(VoteOutcome::Counted {
                votes_for: tallies.get(&voted_for).copied().unwrap_or(0),
                threshold: self.threshold,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::hash;
    use chrono::Duration;

    fn round(threshold: usize, now: DateTime<Utc>) -> ConsensusRound {
        ConsensusRound::new(
            RoundId::new(1, 0),
            0,
            "leader".into(),
            hash(b"candidate"),
            now,
            now + Duration::seconds(5),
            threshold,
            ["a", "b", "c", "d", "e"].iter().map(|s| s.to_string()).collect(),
        )
    }

    fn vote(node: &str, h: Hash, at: DateTime<Utc>) -> Vote {
        Vote {
            node_id: node.into(),
            candidate_block_hash: h,
            signature: vec![],
            received_at: at,
        }
    }

    #[test]
    fn finalizes_at_threshold() {
        let now = Utc::now();
        let mut r = round(3, now);
        let h = r.candidate_block_hash;
        assert!(matches!(
            r.record_vote(vote("a", h, now), now).unwrap(),
            VoteOutcome::Counted { votes_for: 1, threshold: 3 }
        ));
        r.record_vote(vote("b", h, now), now).unwrap();
        let out = r.record_vote(vote("c", h, now), now).unwrap();
        let VoteOutcome::Finalized(qc) = out else {
            panic!("expected finalization");
        };
        assert_eq!(qc.signers, vec!["a", "b", "c"]);
        assert_eq!(r.state(), RoundState::Finalized);
        assert!(matches!(
            r.record_vote(vote("d", h, now), now),
            Err(ChainError::RoundClosed(_))
        ));
    }

    #[test]
    fn first_vote_wins_and_flip_is_evidence() {
        let now = Utc::now();
        let mut r = round(3, now);
        let h = r.candidate_block_hash;
        let other = hash(b"other");
        r.record_vote(vote("a", h, now), now).unwrap();
        assert!(matches!(
            r.record_vote(vote("a", other, now), now),
            Err(ChainError::DuplicateVote { .. })
        ));
        assert_eq!(r.tally().get(&h), Some(&1));
        assert_eq!(r.tally().get(&other), None);
        assert_eq!(r.equivocations().len(), 1);

        // identical repeat is a duplicate but not evidence
        assert!(r.record_vote(vote("a", h, now), now).is_err());
        assert_eq!(r.equivocations().len(), 1);
    }

    #[test]
    fn outsiders_cannot_vote() {
        let now = Utc::now();
        let mut r = round(3, now);
        let h = r.candidate_block_hash;
        assert!(matches!(
            r.record_vote(vote("mallory", h, now), now),
            Err(ChainError::UnknownNode(_))
        ));
        assert!(r.votes().is_empty());
        assert_eq!(r.total_nodes(), 5);
    }

    #[test]
    fn late_vote_times_the_round_out() {
        let now = Utc::now();
        let mut r = round(1, now);
        let late = r.deadline + Duration::milliseconds(1);
        let h = r.candidate_block_hash;
        assert!(r.record_vote(vote("a", h, late), late).is_err());
        assert_eq!(r.state(), RoundState::TimedOut);
        assert!(r.certificate().is_none());
    }

    #[test]
    fn deadline_check_is_one_shot() {
        let now = Utc::now();
        let mut r = round(3, now);
        assert!(!r.check_deadline(now));
        assert!(r.check_deadline(r.deadline));
        assert!(!r.check_deadline(r.deadline));
        assert_eq!(r.state(), RoundState::TimedOut);
    }

    #[test]
    fn retry_keeps_height() {
        let id = RoundId::new(9, 2).retry();
        assert_eq!(id, RoundId::new(9, 3));
        assert_eq!(id.to_string(), "9/3");
    }
}
