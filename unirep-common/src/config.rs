//! Protocol and synchronizer configuration.
//!
//! Defaults match the reference deployment; every knob can be overridden
//! through `UNIREP_*` environment variables so operators do not need to
//! change initialization code.

use std::time::Duration;

use thiserror::Error;

const CONTRACT_ADDRESS_ENV: &str = "UNIREP_CONTRACT_ADDRESS";
const GST_DEPTH_ENV: &str = "UNIREP_GST_DEPTH";
const UST_DEPTH_ENV: &str = "UNIREP_UST_DEPTH";
const EPOCH_TREE_DEPTH_ENV: &str = "UNIREP_EPOCH_TREE_DEPTH";
const EPOCH_KEY_NONCES_ENV: &str = "UNIREP_EPOCH_KEY_NONCES";
const MAX_REP_BUDGET_ENV: &str = "UNIREP_MAX_REPUTATION_BUDGET";
const EPOCH_LENGTH_ENV: &str = "UNIREP_EPOCH_LENGTH_SECS";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },
    #[error("tree depth {name}={value} out of range (1..=63)")]
    DepthOutOfRange { name: &'static str, value: usize },
}

/// Protocol parameters plus ingestor timings.
#[derive(Clone, Debug)]
pub struct UnirepConfig {
    /// Address of the UniRep contract the log filter targets.
    pub contract_address: String,
    /// Depth of the per-epoch global state tree.
    pub gst_depth: usize,
    /// Depth of per-user state trees.
    pub ust_depth: usize,
    /// Depth of per-epoch epoch trees; epoch keys are truncated to this.
    pub epoch_tree_depth: usize,
    /// Epoch keys derivable per identity per epoch.
    pub num_epoch_key_nonce_per_epoch: u64,
    /// Width of the `repNullifiers` array in reputation proofs.
    pub max_reputation_budget: usize,
    /// Epoch length in seconds (informational; epoch ends arrive as events).
    pub epoch_length: u64,
    /// Ingestor sleep between empty polls.
    pub poll_interval: Duration,
    /// Upper bound on a single chain RPC call.
    pub rpc_timeout: Duration,
    /// Store failures tolerated for one log before the ingestor gives up.
    pub max_event_retries: u32,
}

impl Default for UnirepConfig {
    fn default() -> Self {
        Self {
            contract_address: "0x0000000000000000000000000000000000000000".into(),
            gst_depth: 16,
            ust_depth: 16,
            epoch_tree_depth: 32,
            num_epoch_key_nonce_per_epoch: 3,
            max_reputation_budget: 10,
            epoch_length: 300,
            poll_interval: Duration::from_secs(1),
            rpc_timeout: Duration::from_secs(30),
            max_event_retries: 5,
        }
    }
}

impl UnirepConfig {
    /// Defaults overridden by any `UNIREP_*` environment variables present.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = Self::default();

        if let Ok(addr) = std::env::var(CONTRACT_ADDRESS_ENV) {
            cfg.contract_address = addr;
        }
        if let Some(v) = env_parse::<usize>(GST_DEPTH_ENV)? {
            cfg.gst_depth = v;
        }
        if let Some(v) = env_parse::<usize>(UST_DEPTH_ENV)? {
            cfg.ust_depth = v;
        }
        if let Some(v) = env_parse::<usize>(EPOCH_TREE_DEPTH_ENV)? {
            cfg.epoch_tree_depth = v;
        }
        if let Some(v) = env_parse::<u64>(EPOCH_KEY_NONCES_ENV)? {
            cfg.num_epoch_key_nonce_per_epoch = v;
        }
        if let Some(v) = env_parse::<usize>(MAX_REP_BUDGET_ENV)? {
            cfg.max_reputation_budget = v;
        }
        if let Some(v) = env_parse::<u64>(EPOCH_LENGTH_ENV)? {
            cfg.epoch_length = v;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// Range-check the tree depths. Tree node indices are 64-bit, so all
    /// depths must stay below 64.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("gst_depth", self.gst_depth),
            ("ust_depth", self.ust_depth),
            ("epoch_tree_depth", self.epoch_tree_depth),
        ] {
            if value == 0 || value > 63 {
                return Err(ConfigError::DepthOutOfRange { name, value });
            }
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(name: &'static str) -> Result<Option<T>, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { name, value: raw }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        UnirepConfig::default().validate().unwrap();
    }

    #[test]
    fn zero_depth_rejected() {
        let cfg = UnirepConfig {
            gst_depth: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn oversized_depth_rejected() {
        let cfg = UnirepConfig {
            epoch_tree_depth: 64,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }
}
