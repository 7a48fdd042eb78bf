//! Off-chain state reconstruction for the UniRep reputation protocol.
//!
//! The synchronizer tails a chain's event log and maintains, in SQLite, a
//! faithful mirror of the on-chain reputation state: a global state tree
//! per epoch, epoch trees sealed by hash-chained attestations, nullifier
//! sets, and a validity verdict for every zk proof ever submitted. The
//! [`UserState`] layer derives per-identity projections from that store
//! and assembles the witnesses new proofs need.
//!
//! The chain client and the zk verifier are collaborators behind the
//! [`ChainReader`] and [`Prover`] seams; in-memory doubles for both live
//! in [`mock`].

pub mod chain;
pub mod error;
pub mod events;
pub mod mock;
pub mod prover;
pub mod store;
pub mod synchronizer;
pub mod trees;
pub mod user_state;

pub use chain::{ChainReader, LogFilter, LogPosition, RawLog};
pub use error::SynchronizerError;
pub use prover::{Circuit, Prover};
pub use store::models::{
    AttestationRecord, CursorRecord, EpochRecord, GstLeafRecord, NullifierRecord, ProofEventKind,
    ProofRecord, UserSignUpRecord,
};
pub use store::{StoreReader, StoreTx, SyncStore};
pub use synchronizer::{
    compute_init_ust_root, default_gst_leaf, empty_ust_root, gen_epoch_tree, gen_gst_tree,
    StopHandle, SyncObserver, Synchronizer,
};
pub use trees::{IncrementalTree, MerklePath, SparsePath, SparseTree};
pub use user_state::{Reputation, UserState};
