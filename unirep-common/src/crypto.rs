//! Protocol hash primitives.
//!
//! The protocol needs a single collision-resistant hash over field elements
//! for everything: tree nodes, attestation digests, epoch keys, blinded
//! commitments. We use BLAKE3 with a domain separator over the canonical
//! 32-byte big-endian encodings, reduced back into the field. Determinism
//! across platforms is the property the synchronizer's replay and
//! round-trip guarantees rest on.

use blake3::Hasher;
use once_cell::sync::Lazy;

use crate::field::Field;

/// Domain separator for the field-element hash.
const DS_FIELD_HASH: &[u8] = b"UNIREP::FIELD_HASH::V1";
/// Domain separator for identity key material derivation.
const DS_IDENTITY: &[u8] = b"UNIREP::IDENTITY::V1";

/// Default leaf of sparse epoch trees: `hash2(1, 0)`.
pub static SMT_ONE_LEAF: Lazy<Field> = Lazy::new(|| hash2(&Field::one(), &Field::zero()));

/// Hash an ordered sequence of field elements into the field.
pub fn hash_many(inputs: &[Field]) -> Field {
    let mut hasher = Hasher::new();
    hasher.update(DS_FIELD_HASH);
    hasher.update(&(inputs.len() as u64).to_be_bytes());
    for input in inputs {
        hasher.update(&input.to_word());
    }
    Field::from_be_bytes_reduced(hasher.finalize().as_bytes())
}

/// Two-input hash, the binary-tree node combiner.
pub fn hash2(left: &Field, right: &Field) -> Field {
    hash_many(&[left.clone(), right.clone()])
}

/// Five-input hash used for attestation and reputation digests.
pub fn hash5(inputs: &[Field; 5]) -> Field {
    hash_many(inputs.as_slice())
}

/// Digest of one attestation: `hash5([attesterId, posRep, negRep, graffiti, signUp])`.
pub fn attestation_hash(
    attester_id: &Field,
    pos_rep: &Field,
    neg_rep: &Field,
    graffiti: &Field,
    sign_up: &Field,
) -> Field {
    hash5(&[
        attester_id.clone(),
        pos_rep.clone(),
        neg_rep.clone(),
        graffiti.clone(),
        sign_up.clone(),
    ])
}

/// Leaf of a user-state tree: `hash5([posRep, negRep, graffiti, signUp, 0])`.
pub fn reputation_hash(pos_rep: &Field, neg_rep: &Field, graffiti: &Field, sign_up: &Field) -> Field {
    hash5(&[
        pos_rep.clone(),
        neg_rep.clone(),
        graffiti.clone(),
        sign_up.clone(),
        Field::zero(),
    ])
}

/// Epoch key for `(identityNullifier, epoch, nonce)`, truncated to the
/// epoch-tree depth.
pub fn epoch_key(
    identity_nullifier: &Field,
    epoch: u64,
    nonce: u64,
    epoch_tree_depth: usize,
) -> Field {
    hash_many(&[
        identity_nullifier.clone(),
        Field::from(epoch),
        Field::from(nonce),
    ])
    .truncate_bits(epoch_tree_depth)
}

/// Single-use nullifier consumed by a user-state transition for one epoch
/// key nonce.
pub fn transition_nullifier(identity_nullifier: &Field, epoch: u64, nonce: u64) -> Field {
    hash_many(&[
        identity_nullifier.clone(),
        Field::from(epoch),
        Field::from(nonce),
        Field::one(),
    ])
}

/// Single-use nullifier consumed when spending one unit of reputation.
pub fn reputation_nullifier(identity_nullifier: &Field, epoch: u64, nonce: u64) -> Field {
    hash_many(&[
        identity_nullifier.clone(),
        Field::from(epoch),
        Field::from(nonce),
        Field::from(2u64),
    ])
}

/// Blinded user-state commitment chained across transition sub-proofs.
pub fn blinded_user_state(
    identity_nullifier: &Field,
    ust_root: &Field,
    epoch: u64,
    nonce: u64,
) -> Field {
    hash5(&[
        identity_nullifier.clone(),
        ust_root.clone(),
        Field::from(epoch),
        Field::from(nonce),
        Field::zero(),
    ])
}

/// Blinded hash-chain commitment chained across transition sub-proofs.
pub fn blinded_hash_chain(
    identity_nullifier: &Field,
    hash_chain: &Field,
    epoch: u64,
    nonce: u64,
) -> Field {
    hash5(&[
        identity_nullifier.clone(),
        hash_chain.clone(),
        Field::from(epoch),
        Field::from(nonce),
        Field::zero(),
    ])
}

/// Seal an epoch key's attestation hash chain: `hash2(1, hashChain)`.
pub fn seal_hash_chain(hash_chain: &Field) -> Field {
    hash2(&Field::one(), hash_chain)
}

/// A user identity: the two secrets plus the public commitment derived
/// from them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    nullifier: Field,
    trapdoor: Field,
}

impl Identity {
    pub fn new(nullifier: Field, trapdoor: Field) -> Self {
        Self { nullifier, trapdoor }
    }

    /// Derive an identity deterministically from seed bytes.
    pub fn from_seed(seed: &[u8]) -> Self {
        let mut hasher = Hasher::new();
        hasher.update(DS_IDENTITY);
        hasher.update(b"nullifier");
        hasher.update(seed);
        let nullifier = Field::from_be_bytes_reduced(hasher.finalize().as_bytes());

        let mut hasher = Hasher::new();
        hasher.update(DS_IDENTITY);
        hasher.update(b"trapdoor");
        hasher.update(seed);
        let trapdoor = Field::from_be_bytes_reduced(hasher.finalize().as_bytes());

        Self { nullifier, trapdoor }
    }

    pub fn nullifier(&self) -> &Field {
        &self.nullifier
    }

    pub fn trapdoor(&self) -> &Field {
        &self.trapdoor
    }

    /// The public identity commitment registered on signup.
    pub fn commitment(&self) -> Field {
        hash2(&self.nullifier, &self.trapdoor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_deterministic() {
        let a = hash2(&Field::from(1u64), &Field::from(2u64));
        let b = hash2(&Field::from(1u64), &Field::from(2u64));
        assert_eq!(a, b);
    }

    #[test]
    fn hash_is_order_sensitive() {
        let a = hash2(&Field::from(1u64), &Field::from(2u64));
        let b = hash2(&Field::from(2u64), &Field::from(1u64));
        assert_ne!(a, b);
    }

    #[test]
    fn arity_is_domain_separating() {
        // [1, 0] and [1] must not collide even though the padded words agree.
        let two = hash_many(&[Field::one(), Field::zero()]);
        let one = hash_many(&[Field::one()]);
        assert_ne!(two, one);
    }

    #[test]
    fn epoch_key_respects_depth() {
        let id = Identity::from_seed(b"user-0");
        let key = epoch_key(id.nullifier(), 1, 0, 8);
        assert!(key.to_u64().unwrap() < 256);
    }

    #[test]
    fn epoch_keys_differ_per_nonce() {
        let id = Identity::from_seed(b"user-0");
        let k0 = epoch_key(id.nullifier(), 1, 0, 32);
        let k1 = epoch_key(id.nullifier(), 1, 1, 32);
        assert_ne!(k0, k1);
    }

    #[test]
    fn identity_commitment_is_stable() {
        let a = Identity::from_seed(b"seed");
        let b = Identity::from_seed(b"seed");
        assert_eq!(a.commitment(), b.commitment());
        assert_ne!(a.commitment(), Identity::from_seed(b"other").commitment());
    }
}
