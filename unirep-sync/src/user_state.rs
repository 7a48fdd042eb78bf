//! Per-identity read model.
//!
//! A stateless projection over the synchronized store for one identity:
//! which epoch keys belong to it, what reputation each attester has given
//! it, and the witnesses it needs to generate new proofs. Everything here
//! reads through the store; nothing writes, and trees for past epochs are
//! rebuilt from persisted rows on demand.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::debug;
use unirep_common::{
    blinded_hash_chain, blinded_user_state, epoch_key, hash2, reputation_hash,
    reputation_nullifier, seal_hash_chain, transition_nullifier, Field, Identity, UnirepConfig,
};

use crate::error::SynchronizerError;
use crate::store::models::{AttestationRecord, UserSignUpRecord};
use crate::store::StoreReader;
use crate::synchronizer::{gen_epoch_tree, gen_gst_tree};
use crate::trees::{IncrementalTree, MerklePath, SparsePath, SparseTree};

/// Aggregated reputation one attester has given one identity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Reputation {
    pub pos_rep: Field,
    pub neg_rep: Field,
    pub graffiti: Field,
    pub sign_up: Field,
}

impl Default for Reputation {
    fn default() -> Self {
        Self {
            pos_rep: Field::zero(),
            neg_rep: Field::zero(),
            graffiti: Field::zero(),
            sign_up: Field::zero(),
        }
    }
}

impl Reputation {
    fn apply(&mut self, attestation: &AttestationRecord) {
        self.pos_rep += &attestation.pos_rep;
        self.neg_rep += &attestation.neg_rep;
        // A non-zero graffiti overwrites; the latest attestation that sets
        // it wins.
        if !attestation.graffiti.is_zero() {
            self.graffiti = attestation.graffiti.clone();
        }
        if !attestation.sign_up.is_zero() {
            self.sign_up = Field::one();
        }
    }

    /// The user-state-tree leaf for this reputation.
    pub fn hash(&self) -> Field {
        reputation_hash(&self.pos_rep, &self.neg_rep, &self.graffiti, &self.sign_up)
    }
}

/// Membership witness in a global state tree.
#[derive(Clone, Debug, Serialize)]
pub struct GstMembership {
    pub root: Field,
    pub path: MerklePath,
}

/// Circuit inputs for a sign-up proof.
#[derive(Clone, Debug, Serialize)]
pub struct SignUpProofInputs {
    pub epoch: u64,
    pub epoch_key: Field,
    pub nonce: u64,
    pub identity_nullifier: Field,
    pub identity_trapdoor: Field,
    pub attester_id: Field,
    pub reputation: Reputation,
    pub ust_root: Field,
    pub ust_path: SparsePath,
    pub gst: GstMembership,
}

/// Circuit inputs for an epoch-key proof.
#[derive(Clone, Debug, Serialize)]
pub struct EpochKeyProofInputs {
    pub epoch: u64,
    pub epoch_key: Field,
    pub nonce: u64,
    pub identity_nullifier: Field,
    pub identity_trapdoor: Field,
    pub ust_root: Field,
    pub gst: GstMembership,
}

/// Circuit inputs for a reputation proof.
#[derive(Clone, Debug, Serialize)]
pub struct ReputationProofInputs {
    pub epoch: u64,
    pub epoch_key: Field,
    pub nonce: u64,
    pub identity_nullifier: Field,
    pub identity_trapdoor: Field,
    pub attester_id: Field,
    pub reputation: Reputation,
    pub ust_root: Field,
    pub ust_path: SparsePath,
    pub gst: GstMembership,
    /// Nullifiers for the reputation being spent; zero-padded to the
    /// configured budget.
    pub rep_nullifiers: Vec<Field>,
    pub prove_reputation_amount: u64,
    pub min_rep: Field,
    pub prove_graffiti: bool,
    pub graffiti_pre_image: Field,
}

/// Per-epoch-key material inside a transition.
#[derive(Clone, Debug, Serialize)]
pub struct TransitionKeyInputs {
    pub nonce: u64,
    pub epoch_key: Field,
    /// Sealed attestation hash chain for the key.
    pub hash_chain: Field,
    pub epoch_tree_path: SparsePath,
}

/// Circuit inputs for the start-transition / process-attestations /
/// user-state-transition proof chain.
#[derive(Clone, Debug, Serialize)]
pub struct UserStateTransitionInputs {
    pub transition_from_epoch: u64,
    pub identity_nullifier: Field,
    pub identity_trapdoor: Field,
    pub from_gst: GstMembership,
    pub from_epoch_tree_root: Field,
    pub from_ust_root: Field,
    pub new_ust_root: Field,
    pub new_gst_leaf: Field,
    pub keys: Vec<TransitionKeyInputs>,
    /// `[entry, exit]` blinded user states binding the sub-proof chain.
    pub blinded_user_states: [Field; 2],
    pub blinded_hash_chains: Vec<Field>,
    pub epk_nullifiers: Vec<Field>,
}

/// Read model over the synchronized store for one identity.
pub struct UserState<'a, R: StoreReader> {
    store: &'a R,
    identity: Identity,
    config: UnirepConfig,
}

impl<'a, R: StoreReader> UserState<'a, R> {
    pub fn new(store: &'a R, identity: Identity, config: UnirepConfig) -> Self {
        Self {
            store,
            identity,
            config,
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn commitment(&self) -> Field {
        self.identity.commitment()
    }

    /// The highest-numbered epoch the synchronizer has observed.
    pub fn current_epoch(&self) -> Result<u64, SynchronizerError> {
        Ok(self
            .store
            .current_epoch()?
            .ok_or_else(|| SynchronizerError::NotFound("current epoch".into()))?
            .number)
    }

    pub fn has_signed_up(&self) -> Result<bool, SynchronizerError> {
        Ok(!self.store.user_signups_for(&self.commitment())?.is_empty())
    }

    fn signup(&self) -> Result<UserSignUpRecord, SynchronizerError> {
        self.store
            .user_signups_for(&self.commitment())?
            .into_iter()
            .next()
            .ok_or_else(|| {
                SynchronizerError::NotFound(format!(
                    "signup for identity commitment {}",
                    self.commitment()
                ))
            })
    }

    /// The identity's epoch keys for `epoch`, one per nonce.
    pub fn epoch_keys(&self, epoch: u64) -> Vec<Field> {
        (0..self.config.num_epoch_key_nonce_per_epoch)
            .map(|nonce| {
                epoch_key(
                    self.identity.nullifier(),
                    epoch,
                    nonce,
                    self.config.epoch_tree_depth,
                )
            })
            .collect()
    }

    /// Valid attestations for one epoch key, in event order.
    pub fn attestations_for_key(
        &self,
        epoch: u64,
        key: &Field,
    ) -> Result<Vec<AttestationRecord>, SynchronizerError> {
        self.store.attestations_for_key(epoch, key, true)
    }

    /// All attestations targeting this identity's keys in epochs before
    /// `epoch`, in global event order, merged with the signup airdrop.
    fn reputation_map_as_of(
        &self,
        epoch: u64,
    ) -> Result<BTreeMap<Field, Reputation>, SynchronizerError> {
        let signup = self.signup()?;
        let mut map: BTreeMap<Field, Reputation> = BTreeMap::new();

        if signup.epoch <= epoch && !signup.airdrop.is_zero() && !signup.attester_id.is_zero() {
            let rep = map.entry(signup.attester_id.clone()).or_default();
            rep.pos_rep += &signup.airdrop;
            rep.sign_up = Field::one();
        }

        let mut attestations: Vec<AttestationRecord> = Vec::new();
        for record in self.store.epochs()? {
            if !record.sealed || record.number >= epoch {
                continue;
            }
            for key in self.epoch_keys(record.number) {
                attestations.extend(self.store.attestations_for_key(record.number, &key, true)?);
            }
        }
        attestations.sort_by_key(|a| a.event_index);
        for attestation in &attestations {
            map.entry(attestation.attester_id.clone())
                .or_default()
                .apply(attestation);
        }
        Ok(map)
    }

    /// Aggregate reputation from one attester across all sealed epochs.
    pub fn reputation(&self, attester_id: &Field) -> Result<Reputation, SynchronizerError> {
        let epoch = self.current_epoch()?;
        Ok(self
            .reputation_map_as_of(epoch)?
            .remove(attester_id)
            .unwrap_or_default())
    }

    /// Rebuild the identity's user-state tree as it stood entering
    /// `epoch`.
    pub fn gen_user_state_tree(&self, epoch: u64) -> Result<SparseTree, SynchronizerError> {
        let mut tree = SparseTree::new(self.config.ust_depth, Field::zero());
        for (attester_id, reputation) in self.reputation_map_as_of(epoch)? {
            tree.update(&attester_id, reputation.hash());
        }
        Ok(tree)
    }

    pub fn ust_root(&self, epoch: u64) -> Result<Field, SynchronizerError> {
        Ok(self.gen_user_state_tree(epoch)?.root())
    }

    /// Rebuild the global state tree of any epoch from persisted leaves.
    pub fn gen_gst_tree(&self, epoch: u64) -> Result<IncrementalTree, SynchronizerError> {
        gen_gst_tree(self.store, &self.config, epoch)
    }

    /// Rebuild the epoch tree of any epoch.
    pub fn gen_epoch_tree(&self, epoch: u64) -> Result<SparseTree, SynchronizerError> {
        gen_epoch_tree(self.store, &self.config, epoch)
    }

    /// The identity's GST leaf for `epoch` and its index, derived from the
    /// user-state-tree root it entered the epoch with.
    pub fn latest_gst_leaf_index(&self, epoch: u64) -> Result<u64, SynchronizerError> {
        let leaf = hash2(&self.commitment(), &self.ust_root(epoch)?);
        Ok(self
            .store
            .find_gst_leaf_by_hash(epoch, &leaf)?
            .ok_or_else(|| {
                SynchronizerError::NotFound(format!("GST leaf for epoch {epoch}"))
            })?
            .index)
    }

    fn gst_membership(&self, epoch: u64) -> Result<GstMembership, SynchronizerError> {
        let index = self.latest_gst_leaf_index(epoch)?;
        let tree = self.gen_gst_tree(epoch)?;
        let path = tree.path(index).ok_or_else(|| {
            SynchronizerError::NotFound(format!("GST path for leaf {index} in epoch {epoch}"))
        })?;
        Ok(GstMembership {
            root: tree.root(),
            path,
        })
    }

    fn check_nonce(&self, nonce: u64) -> Result<(), SynchronizerError> {
        if nonce >= self.config.num_epoch_key_nonce_per_epoch {
            return Err(SynchronizerError::Config(format!(
                "epoch key nonce {nonce} exceeds the configured {} nonces",
                self.config.num_epoch_key_nonce_per_epoch
            )));
        }
        Ok(())
    }

    /// Assemble sign-up proof inputs for the current epoch.
    pub fn gen_signup_proof_inputs(
        &self,
        attester_id: &Field,
        nonce: u64,
    ) -> Result<SignUpProofInputs, SynchronizerError> {
        self.check_nonce(nonce)?;
        let epoch = self.current_epoch()?;
        let ust = self.gen_user_state_tree(epoch)?;
        let reputation = self
            .reputation_map_as_of(epoch)?
            .remove(attester_id)
            .unwrap_or_default();
        Ok(SignUpProofInputs {
            epoch,
            epoch_key: epoch_key(
                self.identity.nullifier(),
                epoch,
                nonce,
                self.config.epoch_tree_depth,
            ),
            nonce,
            identity_nullifier: self.identity.nullifier().clone(),
            identity_trapdoor: self.identity.trapdoor().clone(),
            attester_id: attester_id.clone(),
            reputation,
            ust_root: ust.root(),
            ust_path: ust.merkle_proof(attester_id),
            gst: self.gst_membership(epoch)?,
        })
    }

    /// Assemble epoch-key proof inputs for the current epoch.
    pub fn gen_epoch_key_proof_inputs(
        &self,
        nonce: u64,
    ) -> Result<EpochKeyProofInputs, SynchronizerError> {
        self.check_nonce(nonce)?;
        let epoch = self.current_epoch()?;
        Ok(EpochKeyProofInputs {
            epoch,
            epoch_key: epoch_key(
                self.identity.nullifier(),
                epoch,
                nonce,
                self.config.epoch_tree_depth,
            ),
            nonce,
            identity_nullifier: self.identity.nullifier().clone(),
            identity_trapdoor: self.identity.trapdoor().clone(),
            ust_root: self.ust_root(epoch)?,
            gst: self.gst_membership(epoch)?,
        })
    }

    /// Assemble reputation proof inputs for the current epoch.
    pub fn gen_reputation_proof_inputs(
        &self,
        attester_id: &Field,
        nonce: u64,
        spend_amount: u64,
        min_rep: Field,
        graffiti_pre_image: Option<Field>,
    ) -> Result<ReputationProofInputs, SynchronizerError> {
        self.check_nonce(nonce)?;
        if spend_amount as usize > self.config.max_reputation_budget {
            return Err(SynchronizerError::Config(format!(
                "cannot spend {spend_amount} reputation; budget is {}",
                self.config.max_reputation_budget
            )));
        }
        let epoch = self.current_epoch()?;
        let ust = self.gen_user_state_tree(epoch)?;
        let reputation = self
            .reputation_map_as_of(epoch)?
            .remove(attester_id)
            .unwrap_or_default();

        let mut rep_nullifiers: Vec<Field> = (0..spend_amount)
            .map(|n| reputation_nullifier(self.identity.nullifier(), epoch, n))
            .collect();
        rep_nullifiers.resize(self.config.max_reputation_budget, Field::zero());

        Ok(ReputationProofInputs {
            epoch,
            epoch_key: epoch_key(
                self.identity.nullifier(),
                epoch,
                nonce,
                self.config.epoch_tree_depth,
            ),
            nonce,
            identity_nullifier: self.identity.nullifier().clone(),
            identity_trapdoor: self.identity.trapdoor().clone(),
            attester_id: attester_id.clone(),
            reputation,
            ust_root: ust.root(),
            ust_path: ust.merkle_proof(attester_id),
            gst: self.gst_membership(epoch)?,
            rep_nullifiers,
            prove_reputation_amount: spend_amount,
            min_rep,
            prove_graffiti: graffiti_pre_image.is_some(),
            graffiti_pre_image: graffiti_pre_image.unwrap_or_else(Field::zero),
        })
    }

    /// Assemble the full input bundle for a user-state transition out of
    /// `from_epoch`. The epoch must be sealed; the resulting record feeds
    /// the start-transition, process-attestations and transition circuits.
    pub fn gen_user_state_transition_inputs(
        &self,
        from_epoch: u64,
    ) -> Result<UserStateTransitionInputs, SynchronizerError> {
        let epoch_record = self
            .store
            .epoch(from_epoch)?
            .ok_or_else(|| SynchronizerError::NotFound(format!("epoch {from_epoch}")))?;
        if !epoch_record.sealed {
            return Err(SynchronizerError::Protocol(format!(
                "cannot transition out of unsealed epoch {from_epoch}"
            )));
        }
        let from_epoch_tree_root = epoch_record.epoch_root.clone().ok_or_else(|| {
            SynchronizerError::NotFound(format!("sealed epoch tree for epoch {from_epoch}"))
        })?;

        let from_ust = self.gen_user_state_tree(from_epoch)?;
        let from_ust_root = from_ust.root();
        let from_gst = self.gst_membership(from_epoch)?;
        let epoch_tree = self.gen_epoch_tree(from_epoch)?;

        let nullifier = self.identity.nullifier();
        let mut keys = Vec::new();
        let mut blinded_hash_chains = Vec::new();
        let mut epk_nullifiers = Vec::new();
        for nonce in 0..self.config.num_epoch_key_nonce_per_epoch {
            let key = epoch_key(nullifier, from_epoch, nonce, self.config.epoch_tree_depth);
            let mut chain = Field::zero();
            for attestation in self.store.attestations_for_key(from_epoch, &key, true)? {
                chain = hash2(&attestation.hash, &chain);
            }
            let sealed = seal_hash_chain(&chain);
            blinded_hash_chains.push(blinded_hash_chain(nullifier, &sealed, from_epoch, nonce));
            epk_nullifiers.push(transition_nullifier(nullifier, from_epoch, nonce));
            keys.push(TransitionKeyInputs {
                nonce,
                epoch_key: key.clone(),
                hash_chain: sealed,
                epoch_tree_path: epoch_tree.merkle_proof(&key),
            });
        }

        // The exit state folds every sealed epoch up to and including the
        // source epoch into the user-state tree.
        let new_ust_root = self.ust_root(from_epoch + 1)?;
        let new_gst_leaf = hash2(&self.commitment(), &new_ust_root);
        let blinded_user_states = [
            blinded_user_state(nullifier, &from_ust_root, from_epoch, 0),
            blinded_user_state(nullifier, &new_ust_root, from_epoch, 0),
        ];

        debug!(
            from_epoch,
            keys = keys.len(),
            "assembled user state transition inputs"
        );
        Ok(UserStateTransitionInputs {
            transition_from_epoch: from_epoch,
            identity_nullifier: nullifier.clone(),
            identity_trapdoor: self.identity.trapdoor().clone(),
            from_gst,
            from_epoch_tree_root,
            from_ust_root,
            new_ust_root,
            new_gst_leaf,
            keys,
            blinded_user_states,
            blinded_hash_chains,
            epk_nullifiers,
        })
    }
}
