// src/consensus/leader_rotation.rs
use crate::consensus::validator_registry::NodeId;
use std::cmp::Ordering;

/// Order candidates for proposing: highest PoOT score first, ties by smallest node id.
/// Entries after the first are the fallback order for the slot.
pub fn rank_candidates(scores: &[(NodeId, f64)]) -> Vec<NodeId> {
    let mut ranked: Vec<&(NodeId, f64)> = scores.iter().filter(|(_, s)| s.is_finite()).collect();
    ranked.sort_by(|(na, sa), (nb, sb)| {
        sb.partial_cmp(sa)
            .unwrap_or(Ordering::Equal)
            .then_with(|| na.cmp(nb))
    });
    ranked.into_iter().map(|(n, _)| n.clone()).collect()
}

/// The proposer for a slot, or None when nobody is eligible.
pub fn select_leader(scores: &[(NodeId, f64)]) -> Option<NodeId> {
    rank_candidates(scores).into_iter().next()
}
