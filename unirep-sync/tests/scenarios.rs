//! End-to-end scenarios over the mock chain and prover.
//!
//! Every test scripts a literal event sequence, drains the synchronizer
//! and checks the mirrored state: tree roots, validity verdicts,
//! nullifier bookkeeping and the per-identity read model.

use std::sync::{Arc, Mutex};

use unirep_common::{
    attestation_hash, hash2, seal_hash_chain, Field, Identity, UnirepConfig, SMT_ONE_LEAF,
};
use unirep_sync::events::{AttestationSubmittedEvent, EpochEndedEvent, UnirepEvent, UserSignedUpEvent, UserStateTransitionedEvent};
use unirep_sync::mock::{
    self, bad_proof, ok_proof, MockChain, MockProver,
};
use unirep_sync::store::StoreReader;
use unirep_sync::{
    gen_epoch_tree, gen_gst_tree, SparseTree, StopHandle, SyncObserver, SyncStore, Synchronizer,
};

const ATTESTER: &str = "0x00000000000000000000000000000000000000aa";

fn test_config() -> UnirepConfig {
    UnirepConfig {
        gst_depth: 8,
        ust_depth: 8,
        epoch_tree_depth: 16,
        ..Default::default()
    }
}

fn new_synchronizer(
    cfg: &UnirepConfig,
) -> (Arc<MockChain>, Synchronizer<Arc<MockChain>, MockProver>) {
    let store = SyncStore::in_memory().expect("in-memory store");
    let chain = Arc::new(MockChain::new());
    let sync = Synchronizer::new(store, chain.clone(), MockProver, cfg.clone())
        .expect("synchronizer init");
    (chain, sync)
}

fn identity(n: u64) -> Identity {
    Identity::from_seed(format!("user-{n}").as_bytes())
}

fn signup_event(epoch: u64, id: &Identity, attester_id: u64, airdrop: u64) -> UnirepEvent {
    UnirepEvent::UserSignedUp(UserSignedUpEvent {
        epoch,
        identity_commitment: id.commitment(),
        attester_id: Field::from(attester_id),
        airdrop_amount: Field::from(airdrop),
    })
}

fn attestation_event(
    epoch: u64,
    epoch_key: Field,
    attester_id: u64,
    pos_rep: u64,
    neg_rep: u64,
    to_proof_index: u64,
    from_proof_index: u64,
) -> AttestationSubmittedEvent {
    AttestationSubmittedEvent {
        epoch,
        epoch_key,
        attester: ATTESTER.into(),
        attester_id: Field::from(attester_id),
        pos_rep: Field::from(pos_rep),
        neg_rep: Field::from(neg_rep),
        graffiti: Field::zero(),
        sign_up: Field::zero(),
        to_proof_index,
        from_proof_index,
    }
}

/// Scenario: one attester, five airdropped signups and five without.
#[tokio::test]
async fn signup_only_mirrors_gst_and_airdrops() {
    let cfg = test_config();
    let (chain, mut sync) = new_synchronizer(&cfg);

    for n in 0..10u64 {
        let airdrop = if n < 5 { 10 } else { 0 };
        chain.emit(&signup_event(1, &identity(n), 1, airdrop));
    }

    let processed = sync.poll_once().await.unwrap();
    assert_eq!(processed, 10);

    let store = sync.store();
    assert_eq!(store.count_gst_leaves(1).unwrap(), 10);
    assert_eq!(store.unsealed_epoch_count().unwrap(), 1);

    // The in-memory GST mirrors the latest persisted root.
    assert_eq!(
        sync.gst_root(),
        store.latest_gst_root(1).unwrap().unwrap()
    );
    // Leaf indices are dense: the rebuild walks them in order and checks.
    let rebuilt = gen_gst_tree(store, &cfg, 1).unwrap();
    assert_eq!(rebuilt.root(), sync.gst_root());

    let attester_id = Field::from(1u64);
    for n in 0..10u64 {
        let user = sync.user_state(identity(n));
        assert!(user.has_signed_up().unwrap());
        let rep = user.reputation(&attester_id).unwrap();
        if n < 5 {
            assert_eq!(rep.sign_up, Field::one(), "user {n} was airdropped");
            assert_eq!(rep.pos_rep, Field::from(10u64));
        } else {
            assert_eq!(rep.sign_up, Field::zero(), "user {n} had no airdrop");
            assert_eq!(rep.pos_rep, Field::zero());
        }
    }
}

/// Scenario: a sign-up proof, one attestation, then the epoch seals into
/// the expected epoch-tree root.
#[tokio::test]
async fn attestation_then_seal_produces_expected_epoch_root() {
    let cfg = test_config();
    let (chain, mut sync) = new_synchronizer(&cfg);

    for n in 0..4u64 {
        chain.emit(&signup_event(1, &identity(n), 1, 10));
    }
    sync.poll_once().await.unwrap();

    // User #3 proves its sign-up status; the attester then attests to the
    // proven epoch key.
    let user = sync.user_state(identity(3));
    let inputs = user
        .gen_signup_proof_inputs(&Field::from(1u64), 0)
        .unwrap();
    let epk = inputs.epoch_key.clone();
    chain.emit(&UnirepEvent::IndexedUserSignedUpProof(
        mock::signup_proof_event(
            1,
            inputs.epoch,
            epk.clone(),
            inputs.gst.root.clone(),
            Field::from(1u64),
            ok_proof(),
        ),
    ));
    chain.emit(&UnirepEvent::AttestationSubmitted(attestation_event(
        1,
        epk.clone(),
        1,
        5,
        2,
        1,
        0,
    )));
    sync.poll_once().await.unwrap();

    let proof = sync.store().proof(1).unwrap().unwrap();
    assert_eq!(proof.valid, Some(true));
    let user = sync.user_state(identity(3));
    assert_eq!(user.attestations_for_key(1, &epk).unwrap().len(), 1);

    chain.emit(&UnirepEvent::EpochEnded(EpochEndedEvent { epoch: 1 }));
    sync.poll_once().await.unwrap();

    let epoch = sync.store().epoch(1).unwrap().unwrap();
    assert!(epoch.sealed);
    assert_eq!(sync.current_epoch(), 2);

    // epochRoot == SMT root of { epk -> H(1, H(attHash, 0)) }.
    let att_hash = attestation_hash(
        &Field::from(1u64),
        &Field::from(5u64),
        &Field::from(2u64),
        &Field::zero(),
        &Field::zero(),
    );
    let sealed_leaf = seal_hash_chain(&hash2(&att_hash, &Field::zero()));
    let mut expected = SparseTree::new(cfg.epoch_tree_depth, SMT_ONE_LEAF.clone());
    expected.update(&epk, sealed_leaf);
    assert_eq!(epoch.epoch_root, Some(expected.root()));

    // Round-trip laws: rebuilt trees match the persisted roots of the
    // sealed epoch.
    let rebuilt = gen_epoch_tree(sync.store(), &cfg, 1).unwrap();
    assert_eq!(
        Some(rebuilt.root()),
        sync.store().epoch(1).unwrap().unwrap().epoch_root
    );
    let final_gst = gen_gst_tree(sync.store(), &cfg, 1).unwrap();
    assert_eq!(
        Some(final_gst.root()),
        sync.store().latest_gst_root(1).unwrap()
    );
    assert_eq!(sync.store().unsealed_epoch_count().unwrap(), 1);
}

/// Scenario: a proof that fails verification is persisted invalid and
/// attestations against it are not honored.
#[tokio::test]
async fn invalid_proof_is_not_honored() {
    let cfg = test_config();
    let (chain, mut sync) = new_synchronizer(&cfg);

    for n in 0..4u64 {
        chain.emit(&signup_event(1, &identity(n), 1, 10));
    }
    sync.poll_once().await.unwrap();

    let user = sync.user_state(identity(3));
    let inputs = user
        .gen_signup_proof_inputs(&Field::from(1u64), 0)
        .unwrap();
    let epk = inputs.epoch_key.clone();

    // Same flow as the honest one, but the proof blob fails verification.
    chain.emit(&UnirepEvent::IndexedUserSignedUpProof(
        mock::signup_proof_event(
            1,
            inputs.epoch,
            epk.clone(),
            inputs.gst.root.clone(),
            Field::from(1u64),
            bad_proof(),
        ),
    ));
    chain.emit(&UnirepEvent::AttestationSubmitted(attestation_event(
        1,
        epk.clone(),
        1,
        5,
        2,
        1,
        0,
    )));
    sync.poll_once().await.unwrap();

    let proof = sync.store().proof(1).unwrap().unwrap();
    assert_eq!(proof.valid, Some(false));

    let attestations = sync.store().attestations_for_key(1, &epk, false).unwrap();
    assert_eq!(attestations.len(), 1);
    assert_eq!(attestations[0].valid, Some(false));

    let user = sync.user_state(identity(3));
    assert!(user.attestations_for_key(1, &epk).unwrap().is_empty());
}

/// Scenario: an event the contract rejected never reaches the
/// synchronizer; a replayed wrong-epoch log that somehow does is a no-op.
#[tokio::test]
async fn wrong_epoch_replay_leaves_state_unchanged() {
    let cfg = test_config();
    let (chain, mut sync) = new_synchronizer(&cfg);

    chain.emit(&signup_event(1, &identity(0), 1, 10));
    chain.emit(&UnirepEvent::EpochEnded(EpochEndedEvent { epoch: 1 }));
    sync.poll_once().await.unwrap();
    assert_eq!(sync.current_epoch(), 2);

    let leaves_before = sync.store().count_gst_leaves(1).unwrap();
    let root_before = sync.gst_root();

    // Nothing new on chain: the poll is a no-op.
    assert_eq!(sync.poll_once().await.unwrap(), 0);

    // A stale epoch-1 signup emitted after the transition is ignored.
    chain.emit(&signup_event(1, &identity(9), 1, 10));
    assert_eq!(sync.poll_once().await.unwrap(), 1);
    assert_eq!(sync.store().count_gst_leaves(1).unwrap(), leaves_before);
    assert_eq!(sync.store().count_gst_leaves(2).unwrap(), 0);
    assert_eq!(sync.gst_root(), root_before);
}

/// Drive a full, honest user-state transition for `id` out of `from_epoch`
/// using proof indexes `base..base+3`. Returns the transition's nullifiers.
async fn run_transition(
    chain: &MockChain,
    sync: &mut Synchronizer<Arc<MockChain>, MockProver>,
    id: &Identity,
    from_epoch: u64,
    base: u64,
) -> Vec<Field> {
    let inputs = sync
        .user_state(id.clone())
        .gen_user_state_transition_inputs(from_epoch)
        .unwrap();

    // Start proof opens the chain with the first blinded hash chain.
    chain.emit(&UnirepEvent::IndexedStartedTransitionProof(
        mock::start_transition_proof_event(
            base,
            inputs.blinded_user_states[0].clone(),
            inputs.blinded_hash_chains[0].clone(),
            inputs.from_gst.root.clone(),
            ok_proof(),
        ),
    ));
    // Two processed-attestations proofs thread the blinded user state from
    // entry to exit and produce the remaining hash chains.
    let intermediate = Field::from(777u64);
    chain.emit(&UnirepEvent::IndexedProcessedAttestationsProof(
        mock::processed_attestations_proof_event(
            base + 1,
            inputs.blinded_user_states[0].clone(),
            intermediate.clone(),
            inputs.blinded_hash_chains[1].clone(),
            ok_proof(),
        ),
    ));
    chain.emit(&UnirepEvent::IndexedProcessedAttestationsProof(
        mock::processed_attestations_proof_event(
            base + 2,
            intermediate,
            inputs.blinded_user_states[1].clone(),
            inputs.blinded_hash_chains[2].clone(),
            ok_proof(),
        ),
    ));
    chain.emit(&UnirepEvent::IndexedUserStateTransitionProof(
        mock::ust_proof_event(
            base + 3,
            inputs.new_gst_leaf.clone(),
            inputs.epk_nullifiers.clone(),
            from_epoch,
            inputs.blinded_user_states.clone(),
            inputs.from_gst.root.clone(),
            inputs.blinded_hash_chains.clone(),
            inputs.from_epoch_tree_root.clone(),
            vec![base, base + 1, base + 2],
            ok_proof(),
        ),
    ));
    chain.emit(&UnirepEvent::UserStateTransitioned(
        UserStateTransitionedEvent {
            epoch: from_epoch + 1,
            hashed_leaf: inputs.new_gst_leaf.clone(),
            proof_index: base + 3,
        },
    ));
    sync.poll_once().await.unwrap();
    inputs.epk_nullifiers
}

/// Scenario: an honest transition lands a new GST leaf and confirms its
/// nullifiers; replaying those nullifiers is rejected without touching
/// state.
#[tokio::test]
async fn nullifier_double_spend_is_rejected() {
    let cfg = test_config();
    let (chain, mut sync) = new_synchronizer(&cfg);

    for n in 0..3u64 {
        chain.emit(&signup_event(1, &identity(n), 1, 10));
    }
    chain.emit(&UnirepEvent::EpochEnded(EpochEndedEvent { epoch: 1 }));
    sync.poll_once().await.unwrap();

    let nullifiers = run_transition(&chain, &mut sync, &identity(0), 1, 1).await;

    let store = sync.store();
    assert_eq!(store.count_gst_leaves(2).unwrap(), 1);
    for nullifier in &nullifiers {
        assert!(store.nullifier_confirmed(nullifier).unwrap());
    }
    let confirmed_before = store.count_confirmed_nullifiers().unwrap();
    let root_before = sync.gst_root();

    // Replay: a second transition proof consuming the same nullifiers,
    // chained over the original (still valid) sub-proofs. Every check up
    // to the nullifier set passes; the confirmed nullifiers reject it.
    let inputs = sync
        .user_state(identity(0))
        .gen_user_state_transition_inputs(1)
        .unwrap();
    chain.emit(&UnirepEvent::IndexedUserStateTransitionProof(
        mock::ust_proof_event(
            5,
            inputs.new_gst_leaf.clone(),
            inputs.epk_nullifiers.clone(),
            1,
            inputs.blinded_user_states.clone(),
            inputs.from_gst.root.clone(),
            inputs.blinded_hash_chains.clone(),
            inputs.from_epoch_tree_root.clone(),
            vec![1, 2, 3],
            ok_proof(),
        ),
    ));
    chain.emit(&UnirepEvent::UserStateTransitioned(
        UserStateTransitionedEvent {
            epoch: 2,
            hashed_leaf: inputs.new_gst_leaf.clone(),
            proof_index: 5,
        },
    ));
    sync.poll_once().await.unwrap();

    let store = sync.store();
    assert_eq!(store.count_gst_leaves(2).unwrap(), 1, "no leaf inserted");
    assert_eq!(
        store.count_confirmed_nullifiers().unwrap(),
        confirmed_before,
        "nullifier rows untouched"
    );
    assert_eq!(sync.gst_root(), root_before);
}

/// Scenario: a transition proof referencing a GST root that was never
/// observed is persisted invalid and its execution event is a no-op.
#[tokio::test]
async fn ust_proof_with_unknown_root_is_invalid() {
    let cfg = test_config();
    let (chain, mut sync) = new_synchronizer(&cfg);

    for n in 0..3u64 {
        chain.emit(&signup_event(1, &identity(n), 1, 10));
    }
    chain.emit(&UnirepEvent::EpochEnded(EpochEndedEvent { epoch: 1 }));
    sync.poll_once().await.unwrap();

    // Honest inputs except for a fabricated source GST root.
    let inputs = sync
        .user_state(identity(0))
        .gen_user_state_transition_inputs(1)
        .unwrap();
    let fabricated_root = Field::from(999_999u64);
    chain.emit(&UnirepEvent::IndexedStartedTransitionProof(
        mock::start_transition_proof_event(
            1,
            inputs.blinded_user_states[0].clone(),
            inputs.blinded_hash_chains[0].clone(),
            fabricated_root.clone(),
            ok_proof(),
        ),
    ));
    chain.emit(&UnirepEvent::IndexedUserStateTransitionProof(
        mock::ust_proof_event(
            2,
            inputs.new_gst_leaf.clone(),
            inputs.epk_nullifiers.clone(),
            1,
            inputs.blinded_user_states.clone(),
            fabricated_root,
            inputs.blinded_hash_chains.clone(),
            inputs.from_epoch_tree_root.clone(),
            vec![1],
            ok_proof(),
        ),
    ));
    chain.emit(&UnirepEvent::UserStateTransitioned(
        UserStateTransitionedEvent {
            epoch: 2,
            hashed_leaf: inputs.new_gst_leaf.clone(),
            proof_index: 2,
        },
    ));
    sync.poll_once().await.unwrap();

    let store = sync.store();
    assert_eq!(store.proof(2).unwrap().unwrap().valid, Some(false));
    // No nullifier was reserved and the execution event changed nothing.
    for nullifier in &inputs.epk_nullifiers {
        assert!(store.nullifier(nullifier).unwrap().is_none());
    }
    assert_eq!(store.count_gst_leaves(2).unwrap(), 0);
}

/// A reputation proof spends nullifiers; an attestation consuming it
/// marks it spent; reusing either is rejected.
#[tokio::test]
async fn reputation_spending_and_proof_consumption() {
    let cfg = test_config();
    let (chain, mut sync) = new_synchronizer(&cfg);

    for n in 0..2u64 {
        chain.emit(&signup_event(1, &identity(n), 1, 10));
    }
    sync.poll_once().await.unwrap();

    // User 0 spends two units of reputation.
    let spender = sync.user_state(identity(0));
    let rep_inputs = spender
        .gen_reputation_proof_inputs(&Field::from(1u64), 0, 2, Field::zero(), None)
        .unwrap();
    chain.emit(&UnirepEvent::IndexedReputationProof(
        mock::reputation_proof_event(
            1,
            rep_inputs.epoch,
            rep_inputs.epoch_key.clone(),
            rep_inputs.gst.root.clone(),
            Field::from(1u64),
            rep_inputs.rep_nullifiers.clone(),
            ok_proof(),
        ),
    ));

    // User 1's epoch key receives the attestation funded by that proof.
    let receiver = sync.user_state(identity(1));
    let epk_inputs = receiver.gen_epoch_key_proof_inputs(0).unwrap();
    chain.emit(&UnirepEvent::IndexedEpochKeyProof(
        mock::epoch_key_proof_event(
            2,
            epk_inputs.epoch,
            epk_inputs.epoch_key.clone(),
            epk_inputs.gst.root.clone(),
            ok_proof(),
        ),
    ));
    chain.emit(&UnirepEvent::AttestationSubmitted(attestation_event(
        1,
        epk_inputs.epoch_key.clone(),
        1,
        2,
        0,
        2,
        1,
    )));
    sync.poll_once().await.unwrap();

    let store = sync.store();
    assert_eq!(store.proof(1).unwrap().unwrap().valid, Some(true));
    assert!(store.proof(1).unwrap().unwrap().spent);
    for nullifier in rep_inputs.rep_nullifiers.iter().filter(|n| !n.is_zero()) {
        assert!(store.nullifier_confirmed(nullifier).unwrap());
    }
    let attestations = store
        .attestations_for_key(1, &epk_inputs.epoch_key, true)
        .unwrap();
    assert_eq!(attestations.len(), 1);

    // A second attestation spending the same proof is recorded invalid.
    chain.emit(&UnirepEvent::AttestationSubmitted(attestation_event(
        1,
        epk_inputs.epoch_key.clone(),
        1,
        3,
        0,
        2,
        1,
    )));
    // A second reputation proof reusing a spent nullifier is invalid.
    chain.emit(&UnirepEvent::IndexedReputationProof(
        mock::reputation_proof_event(
            3,
            rep_inputs.epoch,
            rep_inputs.epoch_key.clone(),
            rep_inputs.gst.root.clone(),
            Field::from(1u64),
            rep_inputs.rep_nullifiers.clone(),
            ok_proof(),
        ),
    ));
    sync.poll_once().await.unwrap();

    let store = sync.store();
    let all = store
        .attestations_for_key(1, &epk_inputs.epoch_key, false)
        .unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[1].valid, Some(false));
    assert_eq!(store.proof(3).unwrap().unwrap().valid, Some(false));
}

/// The legacy attestation topic dispatches to the same handler.
#[tokio::test]
async fn legacy_attestation_topic_is_equivalent() {
    let cfg = test_config();
    let (chain, mut sync) = new_synchronizer(&cfg);

    chain.emit(&signup_event(1, &identity(0), 1, 10));
    sync.poll_once().await.unwrap();

    let user = sync.user_state(identity(0));
    let inputs = user.gen_epoch_key_proof_inputs(0).unwrap();
    chain.emit(&UnirepEvent::IndexedEpochKeyProof(
        mock::epoch_key_proof_event(
            1,
            inputs.epoch,
            inputs.epoch_key.clone(),
            inputs.gst.root.clone(),
            ok_proof(),
        ),
    ));
    chain.emit_legacy_attestation(&attestation_event(
        1,
        inputs.epoch_key.clone(),
        1,
        4,
        1,
        1,
        0,
    ));
    sync.poll_once().await.unwrap();

    let attestations = sync
        .store()
        .attestations_for_key(1, &inputs.epoch_key, true)
        .unwrap();
    assert_eq!(attestations.len(), 1);
    assert_eq!(attestations[0].pos_rep, Field::from(4u64));
}

/// Observers fire once per committed event, after the commit.
#[tokio::test]
async fn observers_fire_after_each_commit() {
    struct Recorder(Mutex<Vec<[u8; 32]>>);
    impl SyncObserver for Recorder {
        fn on_event(&self, topic: [u8; 32]) {
            self.0.lock().unwrap().push(topic);
        }
    }

    let cfg = test_config();
    let (chain, mut sync) = new_synchronizer(&cfg);
    let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
    sync.add_observer(recorder.clone());

    for n in 0..3u64 {
        chain.emit(&signup_event(1, &identity(n), 1, 0));
    }
    let processed = sync.poll_once().await.unwrap();
    assert_eq!(processed, 3);
    let topics = recorder.0.lock().unwrap();
    assert_eq!(topics.len(), 3);
    assert!(topics
        .iter()
        .all(|t| t == &*unirep_sync::events::USER_SIGNED_UP));
}

/// Logs are processed in `(block, txIndex, logIndex)` order regardless of
/// delivery order, and a restarted synchronizer resumes past the cursor.
#[tokio::test]
async fn ordering_and_restart_resume() {
    let cfg = test_config();
    let (chain, mut sync) = new_synchronizer(&cfg);

    // Deliver out of order within one block.
    chain.emit_at(&signup_event(1, &identity(1), 1, 0), 1, 0, 1);
    chain.emit_at(&signup_event(1, &identity(0), 1, 0), 1, 0, 0);
    sync.poll_once().await.unwrap();

    let leaves = sync.store().gst_leaves(1).unwrap();
    assert_eq!(leaves.len(), 2);
    // identity(0)'s log sorts first, so it owns leaf 0.
    let user0 = sync.user_state(identity(0));
    assert_eq!(user0.latest_gst_leaf_index(1).unwrap(), 0);

    // Re-polling is a no-op: everything is behind the cursor.
    assert_eq!(sync.poll_once().await.unwrap(), 0);

    // A later event lands after restart-shaped re-fetches.
    chain.emit(&signup_event(1, &identity(2), 1, 0));
    assert_eq!(sync.poll_once().await.unwrap(), 1);
    assert_eq!(sync.store().count_gst_leaves(1).unwrap(), 3);
}

/// Replaying the full log into a fresh store reproduces identical state.
#[tokio::test]
async fn replay_from_genesis_is_deterministic() {
    let cfg = test_config();
    let (chain, mut sync) = new_synchronizer(&cfg);

    for n in 0..3u64 {
        chain.emit(&signup_event(1, &identity(n), 1, 10));
    }
    emit_signup_proof_and_attestation(&chain, &mut sync).await;
    chain.emit(&UnirepEvent::EpochEnded(EpochEndedEvent { epoch: 1 }));
    sync.poll_once().await.unwrap();
    run_transition(&chain, &mut sync, &identity(0), 1, 2).await;

    // Fresh store, same log.
    let replay_store = SyncStore::in_memory().unwrap();
    let mut replay =
        Synchronizer::new(replay_store, chain.clone(), MockProver, cfg.clone()).unwrap();
    replay.poll_once().await.unwrap();

    let a = sync.store();
    let b = replay.store();
    assert_eq!(a.epochs().unwrap(), b.epochs().unwrap());
    for epoch in 1..=2u64 {
        assert_eq!(a.gst_leaves(epoch).unwrap(), b.gst_leaves(epoch).unwrap());
        assert_eq!(
            a.latest_gst_root(epoch).unwrap(),
            b.latest_gst_root(epoch).unwrap()
        );
        assert_eq!(a.epoch_keys(epoch).unwrap(), b.epoch_keys(epoch).unwrap());
    }
    assert_eq!(
        a.count_confirmed_nullifiers().unwrap(),
        b.count_confirmed_nullifiers().unwrap()
    );
    assert_eq!(a.cursor().unwrap(), b.cursor().unwrap());
    assert_eq!(sync.gst_root(), replay.gst_root());
}

/// Emit a sign-up proof and an attestation for user 2 so the replay test
/// exercises the attestation and epoch-key paths too.
async fn emit_signup_proof_and_attestation(
    chain: &MockChain,
    sync: &mut Synchronizer<Arc<MockChain>, MockProver>,
) -> Field {
    sync.poll_once().await.unwrap();
    let user = sync.user_state(identity(2));
    let inputs = user
        .gen_signup_proof_inputs(&Field::from(1u64), 0)
        .unwrap();
    let epk = inputs.epoch_key.clone();
    chain.emit(&UnirepEvent::IndexedUserSignedUpProof(
        mock::signup_proof_event(
            1,
            inputs.epoch,
            epk.clone(),
            inputs.gst.root.clone(),
            Field::from(1u64),
            ok_proof(),
        ),
    ));
    chain.emit(&UnirepEvent::AttestationSubmitted(attestation_event(
        1, epk.clone(), 1, 5, 2, 1, 0,
    )));
    sync.poll_once().await.unwrap();
    epk
}

/// The start/stop loop drains and halts on the stop signal.
#[tokio::test]
async fn start_loop_stops_on_signal() {
    let mut cfg = test_config();
    cfg.poll_interval = std::time::Duration::from_millis(5);
    let (chain, mut sync) = new_synchronizer(&cfg);
    chain.emit(&signup_event(1, &identity(0), 1, 0));

    let stop: StopHandle = sync.stop_handle();
    let task = tokio::spawn(async move {
        sync.start().await.unwrap();
        sync
    });
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    stop.stop();
    let sync = task.await.unwrap();
    assert_eq!(sync.store().count_gst_leaves(1).unwrap(), 1);
}

/// Reopening against a chain that no longer carries the cursor's log
/// demands a full resync.
#[tokio::test]
async fn missing_cursor_log_requires_resync() {
    let cfg = test_config();
    let (chain, mut sync) = new_synchronizer(&cfg);
    chain.emit(&signup_event(1, &identity(0), 1, 0));
    sync.poll_once().await.unwrap();
    sync.validate_cursor().await.unwrap();

    // Reattach the synced store to a chain that never produced its logs.
    let store = sync.into_store();
    let empty_chain = Arc::new(MockChain::new());
    let stale = Synchronizer::new(store, empty_chain, MockProver, cfg.clone()).unwrap();
    assert!(matches!(
        stale.validate_cursor().await,
        Err(unirep_sync::SynchronizerError::ResyncRequired)
    ));

    // Resetting the store returns it to genesis for the full resync.
    let mut store = stale.into_store();
    store.reset().unwrap();
    assert_eq!(store.cursor().unwrap().latest_processed_block, 0);
}
