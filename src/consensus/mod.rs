// src/consensus/mod.rs
pub mod engine;
pub mod leader_rotation;
pub mod quorum;
pub mod round;
pub mod validator_registry;

pub use engine::{sign_vote, vote_payload_bytes, ConsensusEngine, ConsensusStats, RoundSummary};
pub use leader_rotation::{rank_candidates, select_leader};
pub use quorum::{QuorumCertificate, QuorumPolicy};
pub use round::{ConsensusRound, RoundId, RoundState, Vote, VoteOutcome};
pub use validator_registry::{NodeId, NodeRegistry, ValidatorIdentity, ValidatorRegistry};
