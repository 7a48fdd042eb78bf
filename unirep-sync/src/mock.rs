//! In-memory collaborators for deterministic tests.
//!
//! `MockChain` plays the chain client: tests script a sequence of UniRep
//! events, the mock ABI-encodes them into logs and serves them through
//! the [`ChainReader`] interface. `MockProver` plays the verifier: a
//! proof blob whose first element is [`INVALID_PROOF_MARKER`] fails
//! verification, everything else passes. Both are deliberately simple so
//! scenarios stay byte-for-byte reproducible.

use std::sync::Mutex;

use once_cell::sync::Lazy;
use unirep_common::Field;

use crate::chain::{ChainReader, LogFilter, LogPosition, RawLog};
use crate::error::SynchronizerError;
use crate::events::{
    self, AttestationSubmittedEvent, EpochKeyProofEvent, ProcessedAttestationsProofEvent,
    ReputationProofEvent, SignUpProofEvent, StartedTransitionProofEvent, UnirepEvent,
    UserStateTransitionProofEvent,
};
use crate::prover::{Circuit, Prover};

/// A proof blob starting with this marker fails mock verification.
pub static INVALID_PROOF_MARKER: Lazy<Field> = Lazy::new(|| Field::from(0xbad_00f_u64));

/// An all-passing proof blob.
pub fn ok_proof() -> Vec<Field> {
    vec![Field::zero(); events::PROOF_WORDS]
}

/// A proof blob the mock prover rejects.
pub fn bad_proof() -> Vec<Field> {
    let mut proof = ok_proof();
    proof[0] = INVALID_PROOF_MARKER.clone();
    proof
}

/// Verifier double: rejects exactly the blobs marked invalid.
#[derive(Clone, Copy, Debug, Default)]
pub struct MockProver;

impl Prover for MockProver {
    fn verify(
        &self,
        _circuit: Circuit,
        _public_signals: &[Field],
        proof: &[Field],
    ) -> Result<bool, SynchronizerError> {
        Ok(proof.first() != Some(&*INVALID_PROOF_MARKER))
    }
}

struct MockChainInner {
    logs: Vec<RawLog>,
    block_number: u64,
}

/// Chain double serving scripted logs.
pub struct MockChain {
    inner: Mutex<MockChainInner>,
}

impl Default for MockChain {
    fn default() -> Self {
        Self::new()
    }
}

impl MockChain {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MockChainInner {
                logs: Vec::new(),
                block_number: 0,
            }),
        }
    }

    /// Append an event in a fresh block and advance the chain head.
    pub fn emit(&self, event: &UnirepEvent) -> LogPosition {
        let mut inner = self.inner.lock().expect("mock chain lock");
        let block = inner.block_number + 1;
        self.emit_locked(&mut inner, event, block, 0, 0, false)
    }

    /// Append an event at an explicit position. The chain head advances
    /// to the containing block when it is ahead of the current head.
    pub fn emit_at(
        &self,
        event: &UnirepEvent,
        block: u64,
        tx_index: u64,
        log_index: u64,
    ) -> LogPosition {
        let mut inner = self.inner.lock().expect("mock chain lock");
        self.emit_locked(&mut inner, event, block, tx_index, log_index, false)
    }

    /// Append an attestation under the legacy topic.
    pub fn emit_legacy_attestation(&self, event: &AttestationSubmittedEvent) -> LogPosition {
        let mut inner = self.inner.lock().expect("mock chain lock");
        let block = inner.block_number + 1;
        self.emit_locked(
            &mut inner,
            &UnirepEvent::AttestationSubmitted(event.clone()),
            block,
            0,
            0,
            true,
        )
    }

    fn emit_locked(
        &self,
        inner: &mut MockChainInner,
        event: &UnirepEvent,
        block: u64,
        tx_index: u64,
        log_index: u64,
        legacy_topic: bool,
    ) -> LogPosition {
        let (mut topics, data) = encode_event(event);
        if legacy_topic {
            topics[0] = *events::ATTESTATION_SUBMITTED_LEGACY;
        }
        let log = RawLog {
            block_number: block,
            transaction_index: tx_index,
            log_index,
            transaction_hash: format!("0xmock{block:08x}{tx_index:04x}{log_index:04x}"),
            topics,
            data,
        };
        let position = log.position();
        inner.logs.push(log);
        if block > inner.block_number {
            inner.block_number = block;
        }
        position
    }

    /// Raise the chain head without emitting anything.
    pub fn mine_to(&self, block: u64) {
        let mut inner = self.inner.lock().expect("mock chain lock");
        if block > inner.block_number {
            inner.block_number = block;
        }
    }
}

impl ChainReader for MockChain {
    async fn get_block_number(&self) -> Result<u64, SynchronizerError> {
        Ok(self.inner.lock().expect("mock chain lock").block_number)
    }

    async fn query_filter(
        &self,
        filter: &LogFilter,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<RawLog>, SynchronizerError> {
        let inner = self.inner.lock().expect("mock chain lock");
        Ok(inner
            .logs
            .iter()
            .filter(|log| {
                log.block_number >= from_block
                    && log.block_number <= to_block
                    && filter.matches(log)
            })
            .cloned()
            .collect())
    }
}

/// 32-byte-word ABI writer, the inverse of the decoder's reader.
struct AbiWriter {
    head: Vec<u8>,
}

impl AbiWriter {
    fn new() -> Self {
        Self { head: Vec::new() }
    }

    fn field(&mut self, f: &Field) -> &mut Self {
        self.head.extend_from_slice(&f.to_word());
        self
    }

    fn u64(&mut self, v: u64) -> &mut Self {
        self.field(&Field::from(v))
    }

    fn fields(&mut self, fs: &[Field]) -> &mut Self {
        for f in fs {
            self.field(f);
        }
        self
    }

    /// Append a dynamic `uint256[]`: one offset word in the head, then
    /// length + elements as the tail. Must be the last call.
    fn tail_u64_array(mut self, values: &[u64]) -> Vec<u8> {
        let offset = self.head.len() + 32;
        self.u64(offset as u64);
        self.u64(values.len() as u64);
        for v in values {
            self.u64(*v);
        }
        self.head
    }

    fn finish(self) -> Vec<u8> {
        self.head
    }
}

fn address_word(address: &str) -> [u8; 32] {
    let raw = address.strip_prefix("0x").unwrap_or(address);
    let bytes = hex::decode(raw).expect("mock attester address is valid hex");
    let mut word = [0u8; 32];
    word[32 - bytes.len()..].copy_from_slice(&bytes);
    word
}

/// Encode an event into `(topics, data)` exactly as the contract would.
pub fn encode_event(event: &UnirepEvent) -> (Vec<[u8; 32]>, Vec<u8>) {
    match event {
        UnirepEvent::UserSignedUp(ev) => {
            let mut w = AbiWriter::new();
            w.field(&ev.attester_id).field(&ev.airdrop_amount);
            (
                vec![
                    *events::USER_SIGNED_UP,
                    Field::from(ev.epoch).to_word(),
                    ev.identity_commitment.to_word(),
                ],
                w.finish(),
            )
        }
        UnirepEvent::UserStateTransitioned(ev) => {
            let mut w = AbiWriter::new();
            w.u64(ev.proof_index);
            (
                vec![
                    *events::USER_STATE_TRANSITIONED,
                    Field::from(ev.epoch).to_word(),
                    ev.hashed_leaf.to_word(),
                ],
                w.finish(),
            )
        }
        UnirepEvent::AttestationSubmitted(ev) => {
            let mut w = AbiWriter::new();
            w.field(&ev.attester_id)
                .field(&ev.pos_rep)
                .field(&ev.neg_rep)
                .field(&ev.graffiti)
                .field(&ev.sign_up)
                .u64(ev.to_proof_index)
                .u64(ev.from_proof_index);
            (
                vec![
                    *events::ATTESTATION_SUBMITTED,
                    Field::from(ev.epoch).to_word(),
                    ev.epoch_key.to_word(),
                    address_word(&ev.attester),
                ],
                w.finish(),
            )
        }
        UnirepEvent::EpochEnded(ev) => (
            vec![*events::EPOCH_ENDED, Field::from(ev.epoch).to_word()],
            Vec::new(),
        ),
        UnirepEvent::IndexedEpochKeyProof(ev) => {
            let mut w = AbiWriter::new();
            w.field(&ev.global_state_tree)
                .u64(ev.epoch)
                .field(&ev.epoch_key)
                .fields(&ev.proof);
            (
                vec![
                    *events::INDEXED_EPOCH_KEY_PROOF,
                    Field::from(ev.proof_index).to_word(),
                    Field::from(ev.epoch).to_word(),
                    ev.epoch_key.to_word(),
                ],
                w.finish(),
            )
        }
        UnirepEvent::IndexedReputationProof(ev) => {
            let mut w = AbiWriter::new();
            // publicSignals are declared in data-word order; the proof
            // blob follows them.
            w.fields(&ev.public_signals).fields(&ev.proof);
            (
                vec![
                    *events::INDEXED_REPUTATION_PROOF,
                    Field::from(ev.proof_index).to_word(),
                    Field::from(ev.epoch).to_word(),
                    ev.epoch_key.to_word(),
                ],
                w.finish(),
            )
        }
        UnirepEvent::IndexedUserSignedUpProof(ev) => {
            let mut w = AbiWriter::new();
            w.fields(&ev.public_signals).fields(&ev.proof);
            (
                vec![
                    *events::INDEXED_USER_SIGNED_UP_PROOF,
                    Field::from(ev.proof_index).to_word(),
                    Field::from(ev.epoch).to_word(),
                    ev.epoch_key.to_word(),
                ],
                w.finish(),
            )
        }
        UnirepEvent::IndexedStartedTransitionProof(ev) => {
            let mut w = AbiWriter::new();
            w.field(&ev.blinded_hash_chain).fields(&ev.proof);
            (
                vec![
                    *events::INDEXED_STARTED_TRANSITION_PROOF,
                    Field::from(ev.proof_index).to_word(),
                    ev.blinded_user_state.to_word(),
                    ev.global_state_tree.to_word(),
                ],
                w.finish(),
            )
        }
        UnirepEvent::IndexedProcessedAttestationsProof(ev) => {
            let mut w = AbiWriter::new();
            w.field(&ev.output_blinded_user_state)
                .field(&ev.output_blinded_hash_chain)
                .fields(&ev.proof);
            (
                vec![
                    *events::INDEXED_PROCESSED_ATTESTATIONS_PROOF,
                    Field::from(ev.proof_index).to_word(),
                    ev.input_blinded_user_state.to_word(),
                ],
                w.finish(),
            )
        }
        UnirepEvent::IndexedUserStateTransitionProof(ev) => {
            let mut w = AbiWriter::new();
            w.field(&ev.new_gst_leaf)
                .fields(&ev.epk_nullifiers)
                .u64(ev.transition_from_epoch)
                .fields(&ev.blinded_user_states)
                .field(&ev.from_global_state_tree)
                .fields(&ev.blinded_hash_chains)
                .field(&ev.from_epoch_tree)
                .fields(&ev.proof);
            let data = w.tail_u64_array(&ev.proof_index_records);
            (
                vec![
                    *events::INDEXED_USER_STATE_TRANSITION_PROOF,
                    Field::from(ev.proof_index).to_word(),
                ],
                data,
            )
        }
    }
}

/// Assemble a sign-up proof event with its public-signal layout.
pub fn signup_proof_event(
    proof_index: u64,
    epoch: u64,
    epoch_key: Field,
    global_state_tree: Field,
    attester_id: Field,
    proof: Vec<Field>,
) -> SignUpProofEvent {
    let user_has_signed_up = Field::one();
    let public_signals = vec![
        Field::from(epoch),
        epoch_key.clone(),
        global_state_tree.clone(),
        attester_id.clone(),
        user_has_signed_up.clone(),
    ];
    SignUpProofEvent {
        proof_index,
        epoch,
        epoch_key,
        global_state_tree,
        attester_id,
        user_has_signed_up,
        public_signals,
        proof,
    }
}

/// Assemble an epoch-key proof event with its public-signal layout.
pub fn epoch_key_proof_event(
    proof_index: u64,
    epoch: u64,
    epoch_key: Field,
    global_state_tree: Field,
    proof: Vec<Field>,
) -> EpochKeyProofEvent {
    let public_signals = vec![
        global_state_tree.clone(),
        Field::from(epoch),
        epoch_key.clone(),
    ];
    EpochKeyProofEvent {
        proof_index,
        epoch,
        epoch_key,
        global_state_tree,
        public_signals,
        proof,
    }
}

/// Assemble a reputation proof event. Unasserted optional signals
/// (minRep, graffiti) are zero.
pub fn reputation_proof_event(
    proof_index: u64,
    epoch: u64,
    epoch_key: Field,
    global_state_tree: Field,
    attester_id: Field,
    rep_nullifiers: Vec<Field>,
    proof: Vec<Field>,
) -> ReputationProofEvent {
    let mut public_signals = rep_nullifiers.clone();
    public_signals.extend([
        Field::from(epoch),
        epoch_key.clone(),
        global_state_tree.clone(),
        attester_id.clone(),
        Field::from(rep_nullifiers.iter().filter(|n| !n.is_zero()).count() as u64),
        Field::zero(),
        Field::zero(),
        Field::zero(),
    ]);
    ReputationProofEvent {
        proof_index,
        epoch,
        epoch_key,
        global_state_tree,
        attester_id,
        rep_nullifiers,
        public_signals,
        proof,
    }
}

/// Assemble a start-transition proof event.
pub fn start_transition_proof_event(
    proof_index: u64,
    blinded_user_state: Field,
    blinded_hash_chain: Field,
    global_state_tree: Field,
    proof: Vec<Field>,
) -> StartedTransitionProofEvent {
    let public_signals = vec![
        blinded_user_state.clone(),
        blinded_hash_chain.clone(),
        global_state_tree.clone(),
    ];
    StartedTransitionProofEvent {
        proof_index,
        blinded_user_state,
        blinded_hash_chain,
        global_state_tree,
        public_signals,
        proof,
    }
}

/// Assemble a processed-attestations proof event.
pub fn processed_attestations_proof_event(
    proof_index: u64,
    input_blinded_user_state: Field,
    output_blinded_user_state: Field,
    output_blinded_hash_chain: Field,
    proof: Vec<Field>,
) -> ProcessedAttestationsProofEvent {
    let public_signals = vec![
        output_blinded_user_state.clone(),
        output_blinded_hash_chain.clone(),
        input_blinded_user_state.clone(),
    ];
    ProcessedAttestationsProofEvent {
        proof_index,
        input_blinded_user_state,
        output_blinded_user_state,
        output_blinded_hash_chain,
        public_signals,
        proof,
    }
}

/// Assemble a user-state-transition proof event with its public-signal
/// layout.
#[allow(clippy::too_many_arguments)]
pub fn ust_proof_event(
    proof_index: u64,
    new_gst_leaf: Field,
    epk_nullifiers: Vec<Field>,
    transition_from_epoch: u64,
    blinded_user_states: [Field; 2],
    from_global_state_tree: Field,
    blinded_hash_chains: Vec<Field>,
    from_epoch_tree: Field,
    proof_index_records: Vec<u64>,
    proof: Vec<Field>,
) -> UserStateTransitionProofEvent {
    let mut public_signals = vec![new_gst_leaf.clone()];
    public_signals.extend(epk_nullifiers.iter().cloned());
    public_signals.push(Field::from(transition_from_epoch));
    public_signals.extend(blinded_user_states.iter().cloned());
    public_signals.push(from_global_state_tree.clone());
    public_signals.extend(blinded_hash_chains.iter().cloned());
    public_signals.push(from_epoch_tree.clone());
    UserStateTransitionProofEvent {
        proof_index,
        new_gst_leaf,
        epk_nullifiers,
        transition_from_epoch,
        blinded_user_states,
        from_global_state_tree,
        blinded_hash_chains,
        from_epoch_tree,
        proof_index_records,
        public_signals,
        proof,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::decode_log;
    use unirep_common::UnirepConfig;

    fn f(v: u64) -> Field {
        Field::from(v)
    }

    #[tokio::test]
    async fn signup_event_round_trips_through_abi() {
        let cfg = UnirepConfig::default();
        let chain = MockChain::new();
        let ev = UnirepEvent::UserSignedUp(crate::events::UserSignedUpEvent {
            epoch: 1,
            identity_commitment: f(1234),
            attester_id: f(7),
            airdrop_amount: f(10),
        });
        chain.emit(&ev);

        let filter = LogFilter {
            address: "0x0".into(),
            topics: events::topic_union(),
        };
        let logs = chain.query_filter(&filter, 0, 10).await.unwrap();
        assert_eq!(logs.len(), 1);
        match decode_log(&logs[0], &cfg).unwrap() {
            UnirepEvent::UserSignedUp(decoded) => {
                assert_eq!(decoded.epoch, 1);
                assert_eq!(decoded.identity_commitment, f(1234));
                assert_eq!(decoded.attester_id, f(7));
                assert_eq!(decoded.airdrop_amount, f(10));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn ust_proof_event_round_trips_with_dynamic_tail() {
        let cfg = UnirepConfig::default();
        let nonces = cfg.num_epoch_key_nonce_per_epoch as usize;
        let chain = MockChain::new();
        let ev = ust_proof_event(
            9,
            f(111),
            (0..nonces as u64).map(|i| f(1000 + i)).collect(),
            1,
            [f(21), f(22)],
            f(31),
            (0..nonces as u64).map(|i| f(2000 + i)).collect(),
            f(41),
            vec![3, 4, 5],
            ok_proof(),
        );
        chain.emit(&UnirepEvent::IndexedUserStateTransitionProof(ev.clone()));

        let filter = LogFilter {
            address: "0x0".into(),
            topics: events::topic_union(),
        };
        let logs = chain.query_filter(&filter, 0, 10).await.unwrap();
        match decode_log(&logs[0], &cfg).unwrap() {
            UnirepEvent::IndexedUserStateTransitionProof(decoded) => {
                assert_eq!(decoded.proof_index, 9);
                assert_eq!(decoded.new_gst_leaf, f(111));
                assert_eq!(decoded.transition_from_epoch, 1);
                assert_eq!(decoded.proof_index_records, vec![3, 4, 5]);
                assert_eq!(decoded.public_signals, ev.public_signals);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn mock_prover_rejects_marked_blobs() {
        let prover = MockProver;
        assert!(prover
            .verify(Circuit::VerifyEpochKey, &[], &ok_proof())
            .unwrap());
        assert!(!prover
            .verify(Circuit::VerifyEpochKey, &[], &bad_proof())
            .unwrap());
    }
}
