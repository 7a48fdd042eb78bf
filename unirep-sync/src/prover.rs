//! Prover/verifier collaborator interface.
//!
//! The synchronizer treats the proving system as opaque: it hands a named
//! circuit the public signals and proof blob exactly as they came off the
//! chain and receives a verdict. Proof *generation* is likewise delegated;
//! the [`crate::user_state`] builders only assemble circuit inputs.

use serde::{Deserialize, Serialize};
use unirep_common::Field;

use crate::error::SynchronizerError;

/// The six protocol circuits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Circuit {
    #[serde(rename = "verifyEpochKey")]
    VerifyEpochKey,
    #[serde(rename = "proveReputation")]
    ProveReputation,
    #[serde(rename = "proveUserSignUp")]
    ProveUserSignUp,
    #[serde(rename = "startTransition")]
    StartTransition,
    #[serde(rename = "processAttestations")]
    ProcessAttestations,
    #[serde(rename = "userStateTransition")]
    UserStateTransition,
}

impl Circuit {
    pub fn name(&self) -> &'static str {
        match self {
            Circuit::VerifyEpochKey => "verifyEpochKey",
            Circuit::ProveReputation => "proveReputation",
            Circuit::ProveUserSignUp => "proveUserSignUp",
            Circuit::StartTransition => "startTransition",
            Circuit::ProcessAttestations => "processAttestations",
            Circuit::UserStateTransition => "userStateTransition",
        }
    }
}

impl std::fmt::Display for Circuit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Verifies a named circuit against public signals and proof bytes.
pub trait Prover: Send + Sync {
    /// `Ok(true)` when the proof verifies; `Ok(false)` when it is simply
    /// invalid. `Err` is reserved for infrastructure failures.
    fn verify(
        &self,
        circuit: Circuit,
        public_signals: &[Field],
        proof: &[Field],
    ) -> Result<bool, SynchronizerError>;
}

/// The `userStateTransition` public-signal layout, reassembled from a
/// persisted proof row. Declaration order:
/// `newGlobalStateTreeLeaf, epkNullifiers[K], transitionFromEpoch,
/// blindedUserStates[2], fromGlobalStateTree, blindedHashChains[K],
/// fromEpochTree`.
#[derive(Clone, Debug)]
pub struct UstPublicSignals {
    pub new_gst_leaf: Field,
    pub epk_nullifiers: Vec<Field>,
    pub transition_from_epoch: u64,
    pub blinded_user_states: [Field; 2],
    pub from_global_state_tree: Field,
    pub blinded_hash_chains: Vec<Field>,
    pub from_epoch_tree: Field,
}

impl UstPublicSignals {
    pub fn parse(
        signals: &[Field],
        nonce_count: usize,
    ) -> Result<Self, SynchronizerError> {
        let expected = 1 + nonce_count + 1 + 2 + 1 + nonce_count + 1;
        if signals.len() != expected {
            return Err(SynchronizerError::Protocol(format!(
                "userStateTransition proof carries {} public signals, expected {expected}",
                signals.len()
            )));
        }
        let mut it = signals.iter().cloned();
        let mut take = |n: usize| it.by_ref().take(n).collect::<Vec<_>>();
        let new_gst_leaf = take(1).remove(0);
        let epk_nullifiers = take(nonce_count);
        let transition_from_epoch = take(1)
            .remove(0)
            .to_u64()
            .map_err(|e| SynchronizerError::Protocol(e.to_string()))?;
        let bus = take(2);
        let blinded_user_states = [bus[0].clone(), bus[1].clone()];
        let from_global_state_tree = take(1).remove(0);
        let blinded_hash_chains = take(nonce_count);
        let from_epoch_tree = take(1).remove(0);
        Ok(Self {
            new_gst_leaf,
            epk_nullifiers,
            transition_from_epoch,
            blinded_user_states,
            from_global_state_tree,
            blinded_hash_chains,
            from_epoch_tree,
        })
    }
}
