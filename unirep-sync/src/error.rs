//! Error surface of the synchronizer.
//!
//! The taxonomy mirrors how failures propagate: transient chain errors are
//! retried on the next poll, store errors abort the wrapping transaction
//! and are retried up to a bound, and the remaining variants are fatal.
//! Protocol violations inside handlers (bad proof chains, duplicate
//! nullifiers) are *not* errors: the handler records the rejection and
//! the event counts as processed.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SynchronizerError {
    /// RPC failure talking to the chain. Retried on the next poll.
    #[error("chain RPC error: {0}")]
    Chain(String),

    /// A chain RPC call exceeded the configured bound. Retried.
    #[error("chain RPC timed out after {0:?}")]
    ChainTimeout(Duration),

    /// A log matched the filter but none of the known topics. Programming
    /// error; aborts the ingestor.
    #[error("unknown event topic 0x{}", hex::encode(.0))]
    UnknownTopic([u8; 32]),

    /// A known topic carried a payload that does not decode. Fatal.
    #[error("malformed event payload: {0}")]
    Decode(String),

    /// Storage failure. The wrapping transaction is rolled back and the
    /// event retried on the next poll.
    #[error("storage error: {0}")]
    Store(#[from] rusqlite::Error),

    /// The same log failed `attempts` store transactions; surfaced as
    /// fatal once the retry bound is exhausted.
    #[error("log at position {position} failed {attempts} store transactions; giving up")]
    StoreRetriesExhausted { position: u64, attempts: u32 },

    /// A record a caller referenced does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// An internal invariant does not hold (e.g. a proof event references
    /// a predecessor row that was never written). Aborts the transaction.
    #[error("protocol invariant violated: {0}")]
    Protocol(String),

    /// The persisted cursor no longer resolves to a real chain log; the
    /// store must be resynced from genesis.
    #[error("persisted cursor does not resolve to a chain log; full resync required")]
    ResyncRequired,

    /// Configuration rejected at startup.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl SynchronizerError {
    /// Whether the ingestor loop should retry after this error instead of
    /// aborting.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SynchronizerError::Chain(_)
                | SynchronizerError::ChainTimeout(_)
                | SynchronizerError::Store(_)
        )
    }
}

impl From<unirep_common::config::ConfigError> for SynchronizerError {
    fn from(err: unirep_common::config::ConfigError) -> Self {
        SynchronizerError::Config(err.to_string())
    }
}

impl From<unirep_common::FieldError> for SynchronizerError {
    fn from(err: unirep_common::FieldError) -> Self {
        SynchronizerError::Decode(err.to_string())
    }
}
