// src/consensus/quorum.rs
use crate::consensus::round::RoundId;
use crate::consensus::validator_registry::NodeId;
use crate::crypto::Hash;
use crate::errors::{ChainError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// How many distinct votes finalize a round, given the voting set size.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "policy", content = "size")]
pub enum QuorumPolicy {
    /// floor(n/2) + 1
    Majority,
    /// 2f + 1 with f = floor((n-1)/3); unanimity below four nodes
    Bft,
    Fixed(usize),
}

impl Default for QuorumPolicy {
    fn default() -> Self {
        QuorumPolicy::Majority
    }
}

/// Compute f from total nodes n. f = floor((n-1)/3)
pub fn f_from_n(n: usize) -> usize {
    n.saturating_sub(1) / 3
}

impl QuorumPolicy {
    pub fn threshold(&self, total_nodes: usize) -> Result<usize> {
        if total_nodes == 0 {
            return Err(ChainError::InvalidParameter("empty voting set".into()));
        }
        let k = match *self {
            QuorumPolicy::Majority => total_nodes / 2 + 1,
            QuorumPolicy::Bft if total_nodes < 4 => total_nodes,
            QuorumPolicy::Bft => 2 * f_from_n(total_nodes) + 1,
            QuorumPolicy::Fixed(k) => k,
        };
        if k == 0 || k > total_nodes {
            return Err(ChainError::InvalidParameter(format!(
                "quorum {} not satisfiable with {} nodes",
                k, total_nodes
            )));
        }
        Ok(k)
    }
}

impl fmt::Display for QuorumPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuorumPolicy::Majority => f.write_str("majority"),
            QuorumPolicy::Bft => f.write_str("bft"),
            QuorumPolicy::Fixed(k) => write!(f, "{}", k),
        }
    }
}

impl FromStr for QuorumPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "majority" => Ok(QuorumPolicy::Majority),
            "bft" => Ok(QuorumPolicy::Bft),
            other => other
                .parse::<usize>()
                .map(QuorumPolicy::Fixed)
                .map_err(|_| format!("unknown quorum policy '{}'", s)),
        }
    }
}

/// Proof that `signers` (at least the threshold) voted for `block_hash` in `round`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuorumCertificate {
    pub round: RoundId,
    pub block_hash: Hash,
    /// Sorted by node id.
    pub signers: Vec<NodeId>,
    pub threshold: usize,
}

/// Pick the winning hash among tallies that reached `threshold`: most votes,
/// then the lexicographically smaller hash.
pub fn select_winner(tallies: &BTreeMap<Hash, usize>, threshold: usize) -> Option<Hash> {
    tallies
        .iter()
        .filter(|(_, &count)| count >= threshold)
        // reversed on the hash: the smaller hash wins ties
        .max_by(|(ha, ca), (hb, cb)| ca.cmp(cb).then_with(|| hb.cmp(ha)))
        .map(|(h, _)| *h)
}

pub fn form_qc(round: RoundId, block_hash: Hash, mut signers: Vec<NodeId>, threshold: usize) -> QuorumCertificate {
    signers.sort();
    QuorumCertificate {
        round,
        block_hash,
        signers,
        threshold,
    }
}
