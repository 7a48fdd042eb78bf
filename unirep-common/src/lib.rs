//! Shared protocol layer for the UniRep reputation protocol.
//!
//! This crate carries everything both the synchronizer and its consumers
//! need to agree on:
//! - the field-element type with its canonical decimal-string encoding,
//! - the protocol hash primitives (attestation hashes, epoch keys,
//!   blinded commitments, hash-chain sealing),
//! - the protocol configuration block with its tree depths and timings.

pub mod config;
pub mod crypto;
pub mod field;

pub use config::UnirepConfig;
pub use crypto::{
    attestation_hash, blinded_hash_chain, blinded_user_state, epoch_key, hash2, hash5, hash_many,
    reputation_hash, reputation_nullifier, seal_hash_chain, transition_nullifier, Identity,
    SMT_ONE_LEAF,
};
pub use field::{Field, FieldError};
