//! Event topics and log decoding.
//!
//! The contract emits eleven topics: four state-mutating events, six
//! indexed-proof events, and the legacy attestation topic kept for
//! deployments that predate the event rename. Topic hashes are the
//! Keccak-256 digests of the Solidity signatures; indexed parameters
//! arrive in `topics[1..]` and the remaining payload as 32-byte ABI words
//! in `data` (the user-state-transition proof event carries one trailing
//! dynamic `uint256[]`).

use once_cell::sync::Lazy;
use sha3::{Digest, Keccak256};
use unirep_common::{Field, UnirepConfig};

use crate::chain::RawLog;
use crate::error::SynchronizerError;

/// Width of the Groth16 proof blob in field elements.
pub const PROOF_WORDS: usize = 8;

fn keccak_topic(signature: &str) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(signature.as_bytes());
    hasher.finalize().into()
}

pub static USER_SIGNED_UP: Lazy<[u8; 32]> =
    Lazy::new(|| keccak_topic("UserSignedUp(uint256,uint256,uint256,uint256)"));
pub static USER_STATE_TRANSITIONED: Lazy<[u8; 32]> =
    Lazy::new(|| keccak_topic("UserStateTransitioned(uint256,uint256,uint256)"));
pub static ATTESTATION_SUBMITTED: Lazy<[u8; 32]> = Lazy::new(|| {
    keccak_topic(
        "AttestationSubmitted(uint256,uint256,address,(uint256,uint256,uint256,uint256,uint256),uint256,uint256)",
    )
});
/// Pre-rename attestation topic. The payload is byte-identical to
/// [`ATTESTATION_SUBMITTED`]; both decode and dispatch the same way.
pub static ATTESTATION_SUBMITTED_LEGACY: Lazy<[u8; 32]> = Lazy::new(|| {
    keccak_topic(
        "AttestationSubmittedV1(uint256,uint256,address,(uint256,uint256,uint256,uint256,uint256),uint256,uint256)",
    )
});
pub static EPOCH_ENDED: Lazy<[u8; 32]> = Lazy::new(|| keccak_topic("EpochEnded(uint256)"));
pub static INDEXED_EPOCH_KEY_PROOF: Lazy<[u8; 32]> = Lazy::new(|| {
    keccak_topic("IndexedEpochKeyProof(uint256,uint256,uint256,(uint256,uint256,uint256,uint256[8]))")
});
pub static INDEXED_REPUTATION_PROOF: Lazy<[u8; 32]> = Lazy::new(|| {
    keccak_topic(
        "IndexedReputationProof(uint256,uint256,uint256,(uint256[10],uint256,uint256,uint256,uint256,uint256,uint256,uint256,uint256,uint256[8]))",
    )
});
pub static INDEXED_USER_SIGNED_UP_PROOF: Lazy<[u8; 32]> = Lazy::new(|| {
    keccak_topic(
        "IndexedUserSignedUpProof(uint256,uint256,uint256,(uint256,uint256,uint256,uint256,uint256,uint256[8]))",
    )
});
pub static INDEXED_STARTED_TRANSITION_PROOF: Lazy<[u8; 32]> = Lazy::new(|| {
    keccak_topic("IndexedStartedTransitionProof(uint256,uint256,uint256,uint256,uint256[8])")
});
pub static INDEXED_PROCESSED_ATTESTATIONS_PROOF: Lazy<[u8; 32]> = Lazy::new(|| {
    keccak_topic("IndexedProcessedAttestationsProof(uint256,uint256,uint256,uint256,uint256[8])")
});
pub static INDEXED_USER_STATE_TRANSITION_PROOF: Lazy<[u8; 32]> = Lazy::new(|| {
    keccak_topic(
        "IndexedUserStateTransitionProof(uint256,(uint256,uint256[3],uint256,uint256[2],uint256,uint256[3],uint256,uint256[8]),uint256[])",
    )
});

/// The full topic union the log filter subscribes to.
pub fn topic_union() -> Vec<[u8; 32]> {
    vec![
        *USER_SIGNED_UP,
        *USER_STATE_TRANSITIONED,
        *ATTESTATION_SUBMITTED,
        *ATTESTATION_SUBMITTED_LEGACY,
        *EPOCH_ENDED,
        *INDEXED_EPOCH_KEY_PROOF,
        *INDEXED_REPUTATION_PROOF,
        *INDEXED_USER_SIGNED_UP_PROOF,
        *INDEXED_STARTED_TRANSITION_PROOF,
        *INDEXED_PROCESSED_ATTESTATIONS_PROOF,
        *INDEXED_USER_STATE_TRANSITION_PROOF,
    ]
}

#[derive(Clone, Debug)]
pub struct UserSignedUpEvent {
    pub epoch: u64,
    pub identity_commitment: Field,
    pub attester_id: Field,
    pub airdrop_amount: Field,
}

#[derive(Clone, Debug)]
pub struct UserStateTransitionedEvent {
    pub epoch: u64,
    pub hashed_leaf: Field,
    pub proof_index: u64,
}

#[derive(Clone, Debug)]
pub struct AttestationSubmittedEvent {
    pub epoch: u64,
    pub epoch_key: Field,
    pub attester: String,
    pub attester_id: Field,
    pub pos_rep: Field,
    pub neg_rep: Field,
    pub graffiti: Field,
    pub sign_up: Field,
    pub to_proof_index: u64,
    pub from_proof_index: u64,
}

#[derive(Clone, Debug)]
pub struct EpochEndedEvent {
    pub epoch: u64,
}

#[derive(Clone, Debug)]
pub struct EpochKeyProofEvent {
    pub proof_index: u64,
    pub epoch: u64,
    pub epoch_key: Field,
    pub global_state_tree: Field,
    pub public_signals: Vec<Field>,
    pub proof: Vec<Field>,
}

#[derive(Clone, Debug)]
pub struct ReputationProofEvent {
    pub proof_index: u64,
    pub epoch: u64,
    pub epoch_key: Field,
    pub global_state_tree: Field,
    pub attester_id: Field,
    pub rep_nullifiers: Vec<Field>,
    pub public_signals: Vec<Field>,
    pub proof: Vec<Field>,
}

#[derive(Clone, Debug)]
pub struct SignUpProofEvent {
    pub proof_index: u64,
    pub epoch: u64,
    pub epoch_key: Field,
    pub global_state_tree: Field,
    pub attester_id: Field,
    pub user_has_signed_up: Field,
    pub public_signals: Vec<Field>,
    pub proof: Vec<Field>,
}

#[derive(Clone, Debug)]
pub struct StartedTransitionProofEvent {
    pub proof_index: u64,
    pub blinded_user_state: Field,
    pub blinded_hash_chain: Field,
    pub global_state_tree: Field,
    pub public_signals: Vec<Field>,
    pub proof: Vec<Field>,
}

#[derive(Clone, Debug)]
pub struct ProcessedAttestationsProofEvent {
    pub proof_index: u64,
    pub input_blinded_user_state: Field,
    pub output_blinded_user_state: Field,
    pub output_blinded_hash_chain: Field,
    pub public_signals: Vec<Field>,
    pub proof: Vec<Field>,
}

#[derive(Clone, Debug)]
pub struct UserStateTransitionProofEvent {
    pub proof_index: u64,
    pub new_gst_leaf: Field,
    pub epk_nullifiers: Vec<Field>,
    pub transition_from_epoch: u64,
    pub blinded_user_states: [Field; 2],
    pub from_global_state_tree: Field,
    pub blinded_hash_chains: Vec<Field>,
    pub from_epoch_tree: Field,
    pub proof_index_records: Vec<u64>,
    pub public_signals: Vec<Field>,
    pub proof: Vec<Field>,
}

/// Decoded UniRep event. The legacy attestation topic decodes into the
/// same variant as the current one; handlers never branch on which topic
/// delivered it.
#[derive(Clone, Debug)]
pub enum UnirepEvent {
    UserSignedUp(UserSignedUpEvent),
    UserStateTransitioned(UserStateTransitionedEvent),
    AttestationSubmitted(AttestationSubmittedEvent),
    EpochEnded(EpochEndedEvent),
    IndexedEpochKeyProof(EpochKeyProofEvent),
    IndexedReputationProof(ReputationProofEvent),
    IndexedUserSignedUpProof(SignUpProofEvent),
    IndexedStartedTransitionProof(StartedTransitionProofEvent),
    IndexedProcessedAttestationsProof(ProcessedAttestationsProofEvent),
    IndexedUserStateTransitionProof(UserStateTransitionProofEvent),
}

impl UnirepEvent {
    pub fn name(&self) -> &'static str {
        match self {
            UnirepEvent::UserSignedUp(_) => "UserSignedUp",
            UnirepEvent::UserStateTransitioned(_) => "UserStateTransitioned",
            UnirepEvent::AttestationSubmitted(_) => "AttestationSubmitted",
            UnirepEvent::EpochEnded(_) => "EpochEnded",
            UnirepEvent::IndexedEpochKeyProof(_) => "IndexedEpochKeyProof",
            UnirepEvent::IndexedReputationProof(_) => "IndexedReputationProof",
            UnirepEvent::IndexedUserSignedUpProof(_) => "IndexedUserSignedUpProof",
            UnirepEvent::IndexedStartedTransitionProof(_) => "IndexedStartedTransitionProof",
            UnirepEvent::IndexedProcessedAttestationsProof(_) => {
                "IndexedProcessedAttestationsProof"
            }
            UnirepEvent::IndexedUserStateTransitionProof(_) => "IndexedUserStateTransitionProof",
        }
    }
}

/// Sequential reader over 32-byte ABI words.
struct AbiReader<'a> {
    data: &'a [u8],
    cursor: usize,
}

impl<'a> AbiReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, cursor: 0 }
    }

    fn word(&mut self) -> Result<&'a [u8], SynchronizerError> {
        let end = self.cursor + 32;
        if end > self.data.len() {
            return Err(SynchronizerError::Decode(format!(
                "payload truncated at word offset {}",
                self.cursor
            )));
        }
        let word = &self.data[self.cursor..end];
        self.cursor = end;
        Ok(word)
    }

    fn field(&mut self) -> Result<Field, SynchronizerError> {
        Ok(Field::from_be_bytes_reduced(self.word()?))
    }

    fn u64(&mut self) -> Result<u64, SynchronizerError> {
        self.field()?
            .to_u64()
            .map_err(|e| SynchronizerError::Decode(e.to_string()))
    }

    fn fields(&mut self, n: usize) -> Result<Vec<Field>, SynchronizerError> {
        (0..n).map(|_| self.field()).collect()
    }

    /// Read a dynamic `uint256[]` whose offset word sits at the current
    /// cursor. The offset is relative to the start of `data`.
    fn tail_u64_array(&mut self) -> Result<Vec<u64>, SynchronizerError> {
        let offset = self.u64()? as usize;
        let mut tail = AbiReader {
            data: self.data,
            cursor: offset,
        };
        let len = tail.u64()? as usize;
        if len > 1024 {
            return Err(SynchronizerError::Decode(format!(
                "dynamic array length {len} exceeds sanity bound"
            )));
        }
        (0..len).map(|_| tail.u64()).collect()
    }
}

fn topic_field(log: &RawLog, i: usize) -> Result<Field, SynchronizerError> {
    log.topics
        .get(i)
        .map(|t| Field::from_be_bytes_reduced(t))
        .ok_or_else(|| SynchronizerError::Decode(format!("missing indexed topic {i}")))
}

fn topic_u64(log: &RawLog, i: usize) -> Result<u64, SynchronizerError> {
    topic_field(log, i)?
        .to_u64()
        .map_err(|e| SynchronizerError::Decode(e.to_string()))
}

fn topic_address(log: &RawLog, i: usize) -> Result<String, SynchronizerError> {
    let word = log
        .topics
        .get(i)
        .ok_or_else(|| SynchronizerError::Decode(format!("missing indexed topic {i}")))?;
    Ok(format!("0x{}", hex::encode(&word[12..])))
}

/// Decode a filtered log into a typed event. Unknown topics are fatal.
pub fn decode_log(log: &RawLog, cfg: &UnirepConfig) -> Result<UnirepEvent, SynchronizerError> {
    let topic = log
        .topics
        .first()
        .ok_or_else(|| SynchronizerError::Decode("log carries no topics".into()))?;

    if topic == &*USER_SIGNED_UP {
        let mut data = AbiReader::new(&log.data);
        Ok(UnirepEvent::UserSignedUp(UserSignedUpEvent {
            epoch: topic_u64(log, 1)?,
            identity_commitment: topic_field(log, 2)?,
            attester_id: data.field()?,
            airdrop_amount: data.field()?,
        }))
    } else if topic == &*USER_STATE_TRANSITIONED {
        let mut data = AbiReader::new(&log.data);
        Ok(UnirepEvent::UserStateTransitioned(
            UserStateTransitionedEvent {
                epoch: topic_u64(log, 1)?,
                hashed_leaf: topic_field(log, 2)?,
                proof_index: data.u64()?,
            },
        ))
    } else if topic == &*ATTESTATION_SUBMITTED || topic == &*ATTESTATION_SUBMITTED_LEGACY {
        let mut data = AbiReader::new(&log.data);
        Ok(UnirepEvent::AttestationSubmitted(AttestationSubmittedEvent {
            epoch: topic_u64(log, 1)?,
            epoch_key: topic_field(log, 2)?,
            attester: topic_address(log, 3)?,
            attester_id: data.field()?,
            pos_rep: data.field()?,
            neg_rep: data.field()?,
            graffiti: data.field()?,
            sign_up: data.field()?,
            to_proof_index: data.u64()?,
            from_proof_index: data.u64()?,
        }))
    } else if topic == &*EPOCH_ENDED {
        Ok(UnirepEvent::EpochEnded(EpochEndedEvent {
            epoch: topic_u64(log, 1)?,
        }))
    } else if topic == &*INDEXED_EPOCH_KEY_PROOF {
        let mut data = AbiReader::new(&log.data);
        let global_state_tree = data.field()?;
        let epoch = data.field()?;
        let epoch_key = data.field()?;
        let proof = data.fields(PROOF_WORDS)?;
        let public_signals = vec![global_state_tree.clone(), epoch.clone(), epoch_key.clone()];
        Ok(UnirepEvent::IndexedEpochKeyProof(EpochKeyProofEvent {
            proof_index: topic_u64(log, 1)?,
            epoch: epoch
                .to_u64()
                .map_err(|e| SynchronizerError::Decode(e.to_string()))?,
            epoch_key,
            global_state_tree,
            public_signals,
            proof,
        }))
    } else if topic == &*INDEXED_REPUTATION_PROOF {
        let mut data = AbiReader::new(&log.data);
        let rep_nullifiers = data.fields(cfg.max_reputation_budget)?;
        let epoch = data.field()?;
        let epoch_key = data.field()?;
        let global_state_tree = data.field()?;
        let attester_id = data.field()?;
        let prove_reputation_amount = data.field()?;
        let min_rep = data.field()?;
        let prove_graffiti = data.field()?;
        let graffiti_pre_image = data.field()?;
        let proof = data.fields(PROOF_WORDS)?;

        let mut public_signals = rep_nullifiers.clone();
        public_signals.extend([
            epoch.clone(),
            epoch_key.clone(),
            global_state_tree.clone(),
            attester_id.clone(),
            prove_reputation_amount,
            min_rep,
            prove_graffiti,
            graffiti_pre_image,
        ]);
        Ok(UnirepEvent::IndexedReputationProof(ReputationProofEvent {
            proof_index: topic_u64(log, 1)?,
            epoch: epoch
                .to_u64()
                .map_err(|e| SynchronizerError::Decode(e.to_string()))?,
            epoch_key,
            global_state_tree,
            attester_id,
            rep_nullifiers,
            public_signals,
            proof,
        }))
    } else if topic == &*INDEXED_USER_SIGNED_UP_PROOF {
        let mut data = AbiReader::new(&log.data);
        let epoch = data.field()?;
        let epoch_key = data.field()?;
        let global_state_tree = data.field()?;
        let attester_id = data.field()?;
        let user_has_signed_up = data.field()?;
        let proof = data.fields(PROOF_WORDS)?;
        let public_signals = vec![
            epoch.clone(),
            epoch_key.clone(),
            global_state_tree.clone(),
            attester_id.clone(),
            user_has_signed_up.clone(),
        ];
        Ok(UnirepEvent::IndexedUserSignedUpProof(SignUpProofEvent {
            proof_index: topic_u64(log, 1)?,
            epoch: epoch
                .to_u64()
                .map_err(|e| SynchronizerError::Decode(e.to_string()))?,
            epoch_key,
            global_state_tree,
            attester_id,
            user_has_signed_up,
            public_signals,
            proof,
        }))
    } else if topic == &*INDEXED_STARTED_TRANSITION_PROOF {
        let mut data = AbiReader::new(&log.data);
        let blinded_user_state = topic_field(log, 2)?;
        let global_state_tree = topic_field(log, 3)?;
        let blinded_hash_chain = data.field()?;
        let proof = data.fields(PROOF_WORDS)?;
        let public_signals = vec![
            blinded_user_state.clone(),
            blinded_hash_chain.clone(),
            global_state_tree.clone(),
        ];
        Ok(UnirepEvent::IndexedStartedTransitionProof(
            StartedTransitionProofEvent {
                proof_index: topic_u64(log, 1)?,
                blinded_user_state,
                blinded_hash_chain,
                global_state_tree,
                public_signals,
                proof,
            },
        ))
    } else if topic == &*INDEXED_PROCESSED_ATTESTATIONS_PROOF {
        let mut data = AbiReader::new(&log.data);
        let input_blinded_user_state = topic_field(log, 2)?;
        let output_blinded_user_state = data.field()?;
        let output_blinded_hash_chain = data.field()?;
        let proof = data.fields(PROOF_WORDS)?;
        let public_signals = vec![
            output_blinded_user_state.clone(),
            output_blinded_hash_chain.clone(),
            input_blinded_user_state.clone(),
        ];
        Ok(UnirepEvent::IndexedProcessedAttestationsProof(
            ProcessedAttestationsProofEvent {
                proof_index: topic_u64(log, 1)?,
                input_blinded_user_state,
                output_blinded_user_state,
                output_blinded_hash_chain,
                public_signals,
                proof,
            },
        ))
    } else if topic == &*INDEXED_USER_STATE_TRANSITION_PROOF {
        let nonces = cfg.num_epoch_key_nonce_per_epoch as usize;
        let mut data = AbiReader::new(&log.data);
        let new_gst_leaf = data.field()?;
        let epk_nullifiers = data.fields(nonces)?;
        let transition_from_epoch = data.u64()?;
        let bus = data.fields(2)?;
        let blinded_user_states = [bus[0].clone(), bus[1].clone()];
        let from_global_state_tree = data.field()?;
        let blinded_hash_chains = data.fields(nonces)?;
        let from_epoch_tree = data.field()?;
        let proof = data.fields(PROOF_WORDS)?;
        let proof_index_records = data.tail_u64_array()?;

        let mut public_signals = vec![new_gst_leaf.clone()];
        public_signals.extend(epk_nullifiers.iter().cloned());
        public_signals.push(Field::from(transition_from_epoch));
        public_signals.extend(blinded_user_states.iter().cloned());
        public_signals.push(from_global_state_tree.clone());
        public_signals.extend(blinded_hash_chains.iter().cloned());
        public_signals.push(from_epoch_tree.clone());

        Ok(UnirepEvent::IndexedUserStateTransitionProof(
            UserStateTransitionProofEvent {
                proof_index: topic_u64(log, 1)?,
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
            },
        ))
    } else {
        Err(SynchronizerError::UnknownTopic(*topic))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_union_has_eleven_distinct_topics() {
        let topics = topic_union();
        assert_eq!(topics.len(), 11);
        for (i, a) in topics.iter().enumerate() {
            for b in topics.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn legacy_topic_differs_from_current() {
        assert_ne!(*ATTESTATION_SUBMITTED, *ATTESTATION_SUBMITTED_LEGACY);
    }

    #[test]
    fn unknown_topic_is_fatal() {
        let log = RawLog {
            block_number: 1,
            transaction_index: 0,
            log_index: 0,
            transaction_hash: "0xdead".into(),
            topics: vec![[0xabu8; 32]],
            data: vec![],
        };
        match decode_log(&log, &UnirepConfig::default()) {
            Err(SynchronizerError::UnknownTopic(t)) => assert_eq!(t, [0xabu8; 32]),
            other => panic!("expected UnknownTopic, got {other:?}"),
        }
    }

    #[test]
    fn truncated_payload_is_a_decode_error() {
        let log = RawLog {
            block_number: 1,
            transaction_index: 0,
            log_index: 0,
            transaction_hash: "0xdead".into(),
            topics: vec![
                *USER_SIGNED_UP,
                Field::from(1u64).to_word(),
                Field::from(99u64).to_word(),
            ],
            data: vec![0u8; 32], // one word where two are required
        };
        assert!(matches!(
            decode_log(&log, &UnirepConfig::default()),
            Err(SynchronizerError::Decode(_))
        ));
    }
}
