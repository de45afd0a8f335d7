// tests/consensus.rs
// Round lifecycle against a five-validator registry with a majority quorum.
use chrono::{DateTime, Duration, TimeZone, Utc};
use lucid_chain::chain::block::GENESIS_TIMESTAMP_MS;
use lucid_chain::chain::BlockManager;
use lucid_chain::consensus::engine::{sign_vote, ConsensusEngine};
use lucid_chain::consensus::quorum::QuorumPolicy;
use lucid_chain::consensus::round::{RoundId, RoundState, VoteOutcome};
use lucid_chain::consensus::validator_registry::ValidatorRegistry;
use lucid_chain::crypto::{keys, Ed25519Verifier};
use lucid_chain::errors::ChainError;
use std::sync::Arc;

struct Network {
    engine: ConsensusEngine,
    manager: BlockManager,
    validators: Vec<(String, [u8; 32])>,
}

fn network() -> Network {
    let registry = Arc::new(ValidatorRegistry::new());
    let mut validators = Vec::new();
    for i in 0..5u8 {
        let seed = [i + 10; 32];
        let id = format!("validator-{}", i);
        registry.register(&id, keys::public_from_seed(&seed).unwrap());
        validators.push((id, seed));
    }
    Network {
        engine: ConsensusEngine::new(
            QuorumPolicy::Majority,
            5_000,
            registry,
            Arc::new(Ed25519Verifier),
        ),
        manager: BlockManager::new(100, 100),
        validators,
    }
}

fn t0() -> DateTime<Utc> {
    Utc.timestamp_millis_opt(GENESIS_TIMESTAMP_MS + 60_000).unwrap()
}

#[test]
fn four_votes_finalize_at_third_and_extend_chain() {
    let net = network();
    let now = t0();
    let round = RoundId::new(1, 0);
    let candidate = net.manager.propose_next("validator-2", now).unwrap();
    net.engine
        .open_round(round, 0, "validator-2", candidate.block_id, now)
        .unwrap();

    let mut certificate = None;
    for (i, (id, seed)) in net.validators.iter().take(4).enumerate() {
        let sig = sign_vote(seed, round, &candidate.block_id, id).unwrap();
        let result = net
            .engine
            .submit_vote_at(round, id, candidate.block_id, &sig, now + Duration::milliseconds(10));
        match i {
            0 | 1 => assert!(matches!(result, Ok(VoteOutcome::Counted { .. }))),
            2 => match result {
                Ok(VoteOutcome::Finalized(qc)) => certificate = Some(qc),
                other => panic!("expected finalization, got {:?}", other),
            },
            _ => assert!(matches!(result, Err(ChainError::RoundClosed(_)))),
        }
    }
    let qc = certificate.unwrap();
    assert_eq!(qc.threshold, 3);
    assert_eq!(qc.signers, vec!["validator-0", "validator-1", "validator-2"]);

    let genesis = net.manager.get_latest_block();
    let block = net.manager.append_block(candidate, &qc).unwrap();
    assert_eq!(block.height, genesis.height + 1);
    assert_eq!(block.previous_hash, genesis.block_id);
    assert_eq!(net.engine.round_state(round), Some(RoundState::Finalized));
}

#[test]
fn forged_vote_is_rejected_and_round_still_finalizes() {
    let net = network();
    let now = t0();
    let round = RoundId::new(1, 0);
    let candidate = net.manager.propose_next("validator-0", now).unwrap();
    net.engine
        .open_round(round, 0, "validator-0", candidate.block_id, now)
        .unwrap();

    // validator-4's seed signing on behalf of validator-3
    let (_, intruder) = &net.validators[4];
    let forged = sign_vote(intruder, round, &candidate.block_id, "validator-3").unwrap();
    assert!(matches!(
        net.engine
            .submit_vote_at(round, "validator-3", candidate.block_id, &forged, now),
        Err(ChainError::InvalidSignature(_))
    ));
    assert!(matches!(
        net.engine
            .submit_vote_at(round, "stranger", candidate.block_id, &forged, now),
        Err(ChainError::UnknownNode(_))
    ));

    let mut outcome = None;
    for (id, seed) in &net.validators[..3] {
        let sig = sign_vote(seed, round, &candidate.block_id, id).unwrap();
        outcome = Some(
            net.engine
                .submit_vote_at(round, id, candidate.block_id, &sig, now)
                .unwrap(),
        );
    }
    let Some(VoteOutcome::Finalized(qc)) = outcome else {
        panic!("round did not finalize");
    };
    assert!(!qc.signers.contains(&"validator-3".to_string()));
    assert_eq!(net.engine.stats().rejected_votes, 2);
    net.manager.append_block(candidate, &qc).unwrap();
}

#[test]
fn timeout_produces_no_block_and_retry_rejects_stale_votes() {
    let net = network();
    let now = t0();
    let round = RoundId::new(1, 0);
    let candidate = net.manager.propose_next("validator-1", now).unwrap();
    net.engine
        .open_round(round, 0, "validator-1", candidate.block_id, now)
        .unwrap();

    for (id, seed) in &net.validators[..2] {
        let sig = sign_vote(seed, round, &candidate.block_id, id).unwrap();
        net.engine
            .submit_vote_at(round, id, candidate.block_id, &sig, now)
            .unwrap();
    }
    let summary = net.engine.tick(now + Duration::seconds(6)).unwrap();
    assert_eq!(summary.state, RoundState::TimedOut);
    assert_eq!(summary.votes, 2);
    assert_eq!(net.manager.get_latest_block().height, 0);

    let later = now + Duration::seconds(10);
    let retry = round.retry();
    let candidate = net.manager.propose_next("validator-1", later).unwrap();
    net.engine
        .open_round(retry, 0, "validator-1", candidate.block_id, later)
        .unwrap();

    // a vote signed for the timed-out attempt does not count toward the retry
    let (id, seed) = &net.validators[2];
    let stale = sign_vote(seed, round, &candidate.block_id, id).unwrap();
    assert!(matches!(
        net.engine
            .submit_vote_at(retry, id, candidate.block_id, &stale, later),
        Err(ChainError::InvalidSignature(_))
    ));
    assert!(matches!(
        net.engine
            .submit_vote_at(round, id, candidate.block_id, &stale, later),
        Err(ChainError::RoundClosed(_))
    ));
}

#[test]
fn append_requires_a_certificate_for_the_block() {
    let net = network();
    let now = t0();
    let round = RoundId::new(1, 0);
    let first = net.manager.propose_next("validator-0", now).unwrap();
    let other = net
        .manager
        .propose_next("validator-1", now + Duration::seconds(1))
        .unwrap();
    net.engine
        .open_round(round, 0, "validator-0", first.block_id, now)
        .unwrap();
    let mut qc = None;
    for (id, seed) in &net.validators[..3] {
        let sig = sign_vote(seed, round, &first.block_id, id).unwrap();
        if let VoteOutcome::Finalized(c) = net
            .engine
            .submit_vote_at(round, id, first.block_id, &sig, now)
            .unwrap()
        {
            qc = Some(c);
        }
    }
    let qc = qc.unwrap();
    assert!(matches!(
        net.manager.append_block(other, &qc),
        Err(ChainError::CertificateMismatch(_))
    ));
    net.manager.append_block(first.clone(), &qc).unwrap();
    // same block again is a linkage failure, never a second block at height 1
    assert!(net.manager.append_block(first, &qc).is_err());
    assert_eq!(net.manager.get_chain().len(), 2);
}
