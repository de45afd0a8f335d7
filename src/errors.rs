// src/errors.rs
use crate::crypto::Hash;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ChainError>;

/// Coarse classification operators use to tell misbehaving input from missing quorum.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Caller supplied malformed input; never retried automatically.
    Input,
    /// Offending vote, block or transaction is discarded; processing continues.
    Validation,
    /// Retried on the next slot.
    Liveness,
    /// Appends are refused until the store is repaired.
    Fatal,
}

#[derive(Error, Debug)]
pub enum ChainError {
    #[error("empty leaf set")]
    EmptyInput,

    #[error("leaf index {index} out of range (tree has {len} leaves)")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("session {0} has no chunks")]
    EmptyChunkSet(String),

    #[error("too many leaves: {count} (max {max})")]
    TooManyLeaves { count: usize, max: usize },

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("insufficient observation: {observed}s observed, {minimum}s required")]
    InsufficientObservation { observed: u64, minimum: u64 },

    #[error("invalid signature from node {0}")]
    InvalidSignature(String),

    #[error("unknown node {0}")]
    UnknownNode(String),

    #[error("duplicate vote from {node_id} in round {round}")]
    DuplicateVote { node_id: String, round: String },

    #[error("duplicate score from {node_id} for epoch {epoch_id}")]
    DuplicateScore { node_id: String, epoch_id: u64 },

    #[error("chain linkage error at height {height}: {reason}")]
    ChainLinkage { height: u64, reason: String },

    #[error("merkle root mismatch: header {expected}, computed {computed}")]
    MerkleMismatch { expected: Hash, computed: Hash },

    #[error("session {session_id} already anchored with root {merkle_root}")]
    DuplicateAnchor { session_id: String, merkle_root: Hash },

    #[error("block id mismatch at height {height}: header {expected}, computed {computed}")]
    BlockIdMismatch {
        height: u64,
        expected: Hash,
        computed: Hash,
    },

    #[error("transaction {0} does not match its content")]
    TransactionIdMismatch(Hash),

    #[error("block carries {count} transactions (max {max})")]
    BlockTooLarge { count: usize, max: usize },

    #[error("quorum certificate does not cover block: {0}")]
    CertificateMismatch(String),

    #[error("round {0} is closed")]
    RoundClosed(String),

    #[error("no open round {0}")]
    UnknownRound(String),

    #[error("no eligible leader for epoch {0}")]
    NoEligibleLeader(u64),

    #[error("pending pool full ({0} transactions)")]
    PoolFull(usize),

    #[error("chunk source timed out for session {0}")]
    SourceTimeout(String),

    #[error("chain halted: {0}")]
    ChainHalted(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ChainError {
    pub fn kind(&self) -> ErrorKind {
        use ChainError::*;
        match self {
            EmptyInput
            | IndexOutOfRange { .. }
            | EmptyChunkSet(_)
            | TooManyLeaves { .. }
            | InvalidParameter(_)
            | InsufficientObservation { .. } => ErrorKind::Input,
            InvalidSignature(_)
            | UnknownNode(_)
            | DuplicateVote { .. }
            | DuplicateScore { .. }
            | ChainLinkage { .. }
            | MerkleMismatch { .. }
            | DuplicateAnchor { .. }
            | BlockIdMismatch { .. }
            | TransactionIdMismatch(_)
            | BlockTooLarge { .. }
            | CertificateMismatch(_) => ErrorKind::Validation,
            RoundClosed(_) | UnknownRound(_) | NoEligibleLeader(_) | PoolFull(_)
            | SourceTimeout(_) => ErrorKind::Liveness,
            ChainHalted(_) | Storage(_) | Serialization(_) => ErrorKind::Fatal,
        }
    }
}

impl From<rocksdb::Error> for ChainError {
    fn from(e: rocksdb::Error) -> Self {
        ChainError::Storage(e.to_string())
    }
}
