//! Configuration for the tangle hub.

use serde::{Deserialize, Serialize};
use std::{fmt, path::PathBuf, time::Duration};

use crate::ledger::{format, RpcLedgerConfig};
use crate::types::SecurityLevel;

/// Output mode for hub events.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    /// Print events to stdout as JSON lines
    #[default]
    Stdout,
    /// POST events to a webhook URL
    Webhook,
}

/// Limits and batch sizes of the hub engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineLimits {
    /// Addresses per account; also the stride between accounts' key-indices.
    pub max_addresses: u64,
    /// Addresses per balance query.
    pub address_batch_size: usize,
    /// Transaction hashes per inclusion query.
    pub inclusion_batch_size: usize,
    /// Deposits swept by a single transfer.
    pub sweep_batch_size: usize,
}

impl Default for EngineLimits {
    fn default() -> Self {
        Self {
            max_addresses: 1_000_000,
            address_batch_size: 100,
            inclusion_batch_size: 100,
            sweep_batch_size: 10,
        }
    }
}

impl EngineLimits {
    /// Reject limits the engine cannot work with: zero-sized batches and an
    /// empty address space.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_addresses == 0 {
            anyhow::bail!("max_addresses must be positive");
        }
        if self.address_batch_size == 0
            || self.inclusion_batch_size == 0
            || self.sweep_batch_size == 0
        {
            anyhow::bail!("batch sizes must be positive");
        }
        Ok(())
    }
}

/// Hub configuration.
///
/// `Debug` output leaves out the hot-wallet seed.
#[derive(Clone, Serialize, Deserialize)]
pub struct HubConfig {
    /// RPC endpoints to connect to (with failover support)
    #[serde(default = "default_rpc_endpoints")]
    pub rpc_endpoints: Vec<String>,

    /// Request timeout for RPC calls, in seconds
    #[serde(default = "default_rpc_timeout")]
    pub rpc_timeout_secs: u64,

    /// Seed of the hot wallet that receives sweeps and funds withdrawals
    pub hot_wallet_seed: String,

    /// Security level of hot-wallet addresses
    #[serde(default = "default_security")]
    pub hot_wallet_security: u8,

    /// Snapshot file of the store
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,

    /// Output mode for events
    #[serde(default)]
    pub output_mode: OutputMode,

    /// Webhook URL (required if output_mode = webhook)
    pub webhook_url: Option<String>,

    /// Seconds between deposit scans in `run`
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Seconds between confirmation syncs in `run`
    #[serde(default = "default_sync_interval")]
    pub sync_interval_secs: u64,

    /// Tip-selection depth for submitted transfers
    #[serde(default = "default_depth")]
    pub depth: u32,

    /// Minimum weight magnitude for submitted transfers
    #[serde(default = "default_min_weight_magnitude")]
    pub min_weight_magnitude: u32,

    #[serde(default)]
    pub limits: EngineLimits,
}

fn default_rpc_endpoints() -> Vec<String> {
    vec!["http://localhost:14265".to_string()]
}

fn default_rpc_timeout() -> u64 {
    30
}

fn default_security() -> u8 {
    SecurityLevel::MEDIUM.value()
}

fn default_state_file() -> PathBuf {
    PathBuf::from("hub_state.json")
}

fn default_poll_interval() -> u64 {
    30
}

fn default_sync_interval() -> u64 {
    60
}

fn default_depth() -> u32 {
    3
}

fn default_min_weight_magnitude() -> u32 {
    15
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            rpc_endpoints: default_rpc_endpoints(),
            rpc_timeout_secs: default_rpc_timeout(),
            hot_wallet_seed: String::new(),
            hot_wallet_security: default_security(),
            state_file: default_state_file(),
            output_mode: OutputMode::default(),
            webhook_url: None,
            poll_interval_secs: default_poll_interval(),
            sync_interval_secs: default_sync_interval(),
            depth: default_depth(),
            min_weight_magnitude: default_min_weight_magnitude(),
            limits: EngineLimits::default(),
        }
    }
}

impl fmt::Debug for HubConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HubConfig")
            .field("rpc_endpoints", &self.rpc_endpoints)
            .field("rpc_timeout_secs", &self.rpc_timeout_secs)
            .field("hot_wallet_seed", &"<redacted>")
            .field("hot_wallet_security", &self.hot_wallet_security)
            .field("state_file", &self.state_file)
            .field("output_mode", &self.output_mode)
            .field("webhook_url", &self.webhook_url)
            .field("poll_interval_secs", &self.poll_interval_secs)
            .field("sync_interval_secs", &self.sync_interval_secs)
            .field("depth", &self.depth)
            .field("min_weight_magnitude", &self.min_weight_magnitude)
            .field("limits", &self.limits)
            .finish()
    }
}

impl HubConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &std::path::Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: HubConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if !format::is_valid_seed(&self.hot_wallet_seed) {
            anyhow::bail!("hot_wallet_seed must be 1 to 81 trytes (A-Z and 9)");
        }
        self.security()?;

        if self.rpc_endpoints.is_empty() {
            anyhow::bail!("At least one RPC endpoint must be specified");
        }

        if self.output_mode == OutputMode::Webhook && self.webhook_url.is_none() {
            anyhow::bail!("webhook_url is required when output_mode = webhook");
        }

        if self.poll_interval_secs == 0 || self.sync_interval_secs == 0 {
            anyhow::bail!("poll and sync intervals must be positive");
        }

        self.limits.validate()
    }

    pub fn security(&self) -> anyhow::Result<SecurityLevel> {
        SecurityLevel::try_from(self.hot_wallet_security)
            .map_err(|e| anyhow::anyhow!("hot_wallet_security: {}", e))
    }

    pub fn rpc_config(&self) -> RpcLedgerConfig {
        RpcLedgerConfig {
            endpoints: self.rpc_endpoints.clone(),
            depth: self.depth,
            min_weight_magnitude: self.min_weight_magnitude,
            timeout: Duration::from_secs(self.rpc_timeout_secs),
        }
    }
}
