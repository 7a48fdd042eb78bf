//! Chain collaborator interface.
//!
//! The synchronizer never talks to a node directly; it consumes a filtered
//! event stream through this seam. Implementations wrap an RPC client; the
//! in-crate [`crate::mock::MockChain`] drives the deterministic tests.

use std::future::Future;

use serde::{Deserialize, Serialize};

use crate::error::SynchronizerError;

/// One log as delivered by the chain client.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RawLog {
    pub block_number: u64,
    pub transaction_index: u64,
    pub log_index: u64,
    pub transaction_hash: String,
    /// `topics[0]` is the event topic; the rest are indexed parameters as
    /// 32-byte big-endian words.
    pub topics: Vec<[u8; 32]>,
    /// ABI-encoded non-indexed payload.
    #[serde(with = "serde_bytes_hex")]
    pub data: Vec<u8>,
}

impl RawLog {
    pub fn position(&self) -> LogPosition {
        LogPosition {
            block_number: self.block_number,
            transaction_index: self.transaction_index,
            log_index: self.log_index,
        }
    }
}

/// Total order over logs: `(block, txIndex, logIndex)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct LogPosition {
    pub block_number: u64,
    pub transaction_index: u64,
    pub log_index: u64,
}

impl LogPosition {
    pub const GENESIS: LogPosition = LogPosition {
        block_number: 0,
        transaction_index: 0,
        log_index: 0,
    };

    /// Pack the tuple into one ordered `u64`:
    /// `(block << 32) | (txIndex << 16) | logIndex`.
    ///
    /// Order-isomorphic to the tuple as long as a block holds fewer than
    /// 2^16 transactions and a transaction fewer than 2^16 logs, which
    /// every supported deployment satisfies.
    pub fn packed(&self) -> u64 {
        (self.block_number << 32)
            | ((self.transaction_index & 0xffff) << 16)
            | (self.log_index & 0xffff)
    }
}

impl std::fmt::Display for LogPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.block_number, self.transaction_index, self.log_index
        )
    }
}

/// Address + topic union the synchronizer subscribes to.
#[derive(Clone, Debug)]
pub struct LogFilter {
    pub address: String,
    pub topics: Vec<[u8; 32]>,
}

impl LogFilter {
    pub fn matches(&self, log: &RawLog) -> bool {
        log.topics
            .first()
            .map(|t| self.topics.contains(t))
            .unwrap_or(false)
    }
}

/// Read access to the chain's event log.
///
/// Both methods are bounded by the ingestor's RPC timeout; implementations
/// should surface transport failures as [`SynchronizerError::Chain`].
pub trait ChainReader: Send + Sync {
    /// Current chain head.
    fn get_block_number(&self) -> impl Future<Output = Result<u64, SynchronizerError>> + Send;

    /// All logs matching `filter` in the inclusive block range.
    fn query_filter(
        &self,
        filter: &LogFilter,
        from_block: u64,
        to_block: u64,
    ) -> impl Future<Output = Result<Vec<RawLog>, SynchronizerError>> + Send;
}

impl<T: ChainReader> ChainReader for std::sync::Arc<T> {
    fn get_block_number(&self) -> impl Future<Output = Result<u64, SynchronizerError>> + Send {
        (**self).get_block_number()
    }

    fn query_filter(
        &self,
        filter: &LogFilter,
        from_block: u64,
        to_block: u64,
    ) -> impl Future<Output = Result<Vec<RawLog>, SynchronizerError>> + Send {
        (**self).query_filter(filter, from_block, to_block)
    }
}

mod serde_bytes_hex {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("0x{}", hex::encode(bytes)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s.strip_prefix("0x").unwrap_or(&s)).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packed_preserves_tuple_order() {
        let a = LogPosition {
            block_number: 5,
            transaction_index: 0,
            log_index: 3,
        };
        let b = LogPosition {
            block_number: 5,
            transaction_index: 1,
            log_index: 0,
        };
        let c = LogPosition {
            block_number: 6,
            transaction_index: 0,
            log_index: 0,
        };
        assert!(a < b && b < c);
        assert!(a.packed() < b.packed() && b.packed() < c.packed());
    }
}
