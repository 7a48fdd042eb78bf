//! Persisted record types.
//!
//! One struct per table. Field elements are stored as their canonical
//! decimal strings; `publicSignals`, `proof` and `proofIndexRecords`
//! blobs are JSON arrays of those strings so that replayed stores hash
//! identically.

use serde::{Deserialize, Serialize};
use unirep_common::Field;

use crate::chain::LogPosition;

/// One protocol epoch. At most one row is unsealed at any time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EpochRecord {
    pub number: u64,
    pub sealed: bool,
    pub epoch_root: Option<Field>,
}

/// A leaf of the per-epoch global state tree. Indices are dense from 0.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GstLeafRecord {
    pub epoch: u64,
    pub index: u64,
    pub hash: Field,
    pub tx_hash: String,
}

/// One attestation event, ordered by its on-chain position.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AttestationRecord {
    /// Packed `(block, txIndex, logIndex)` of the emitting log.
    pub event_index: u64,
    pub epoch: u64,
    pub epoch_key: Field,
    pub attester: String,
    pub proof_index: u64,
    pub attester_id: Field,
    pub pos_rep: Field,
    pub neg_rep: Field,
    pub graffiti: Field,
    pub sign_up: Field,
    pub hash: Field,
    /// `None` until the referenced proof chain has been checked.
    pub valid: Option<bool>,
}

/// A spent (or reserved) nullifier.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NullifierRecord {
    pub epoch: u64,
    pub nullifier: Field,
    pub confirmed: bool,
}

/// Which indexed event wrote a proof row.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProofEventKind {
    IndexedEpochKeyProof,
    IndexedReputationProof,
    IndexedUserSignedUpProof,
    IndexedStartedTransitionProof,
    IndexedProcessedAttestationsProof,
    IndexedUserStateTransitionProof,
}

impl ProofEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProofEventKind::IndexedEpochKeyProof => "IndexedEpochKeyProof",
            ProofEventKind::IndexedReputationProof => "IndexedReputationProof",
            ProofEventKind::IndexedUserSignedUpProof => "IndexedUserSignedUpProof",
            ProofEventKind::IndexedStartedTransitionProof => "IndexedStartedTransitionProof",
            ProofEventKind::IndexedProcessedAttestationsProof => {
                "IndexedProcessedAttestationsProof"
            }
            ProofEventKind::IndexedUserStateTransitionProof => "IndexedUserStateTransitionProof",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "IndexedEpochKeyProof" => Some(ProofEventKind::IndexedEpochKeyProof),
            "IndexedReputationProof" => Some(ProofEventKind::IndexedReputationProof),
            "IndexedUserSignedUpProof" => Some(ProofEventKind::IndexedUserSignedUpProof),
            "IndexedStartedTransitionProof" => Some(ProofEventKind::IndexedStartedTransitionProof),
            "IndexedProcessedAttestationsProof" => {
                Some(ProofEventKind::IndexedProcessedAttestationsProof)
            }
            "IndexedUserStateTransitionProof" => {
                Some(ProofEventKind::IndexedUserStateTransitionProof)
            }
            _ => None,
        }
    }
}

/// One indexed-proof event, written exactly once per on-chain proof index.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProofRecord {
    pub index: u64,
    pub event: ProofEventKind,
    pub epoch: Option<u64>,
    pub public_signals: Vec<Field>,
    pub proof: Vec<Field>,
    /// Conjunction of zk verification, root existence and (for reputation
    /// proofs) nullifier freshness.
    pub valid: Option<bool>,
    /// Set once an attestation consumes this reputation proof.
    pub spent: bool,
    pub global_state_tree: Option<Field>,
    pub blinded_user_state: Option<Field>,
    pub blinded_hash_chain: Option<Field>,
    pub output_blinded_user_state: Option<Field>,
    pub output_blinded_hash_chain: Option<Field>,
    pub input_blinded_user_state: Option<Field>,
    pub proof_index_records: Vec<u64>,
}

impl ProofRecord {
    pub fn new(index: u64, event: ProofEventKind, public_signals: Vec<Field>, proof: Vec<Field>) -> Self {
        Self {
            index,
            event,
            epoch: None,
            public_signals,
            proof,
            valid: None,
            spent: false,
            global_state_tree: None,
            blinded_user_state: None,
            blinded_hash_chain: None,
            output_blinded_user_state: None,
            output_blinded_hash_chain: None,
            input_blinded_user_state: None,
            proof_index_records: Vec::new(),
        }
    }
}

/// One signup event; feeds the per-identity read model.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserSignUpRecord {
    pub epoch: u64,
    pub commitment: Field,
    pub attester_id: Field,
    pub airdrop: Field,
    pub leaf_index: u64,
}

/// The singleton ingestion cursor. Advances monotonically.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CursorRecord {
    pub latest_processed_block: u64,
    pub latest_processed_transaction_index: u64,
    pub latest_processed_event_index: u64,
    pub latest_complete_block: u64,
}

impl CursorRecord {
    /// The last processed log position as an orderable tuple.
    pub fn position(&self) -> LogPosition {
        LogPosition {
            block_number: self.latest_processed_block,
            transaction_index: self.latest_processed_transaction_index,
            log_index: self.latest_processed_event_index,
        }
    }
}
