//! Ledger network client interface.
//!
//! The hub never builds or signs transaction bundles itself. Address
//! derivation, balance and inclusion queries, and transfer submission are all
//! delegated to a [`LedgerClient`]. Two implementations ship with the crate:
//!
//! - [`JsonRpcLedger`]: talks JSON-RPC to a node (or a local signing daemon)
//! - [`MockLedger`]: deterministic in-process ledger used by tests and drills

pub mod format;
mod mock;
mod rpc;

pub use mock::{MockLedger, SubmittedTransfer};
pub use rpc::{JsonRpcLedger, RpcLedgerConfig};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::LedgerClientError;
use crate::types::SecurityLevel;

/// An output of a transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    pub address: String,
    pub value: u64,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub tag: String,
}

impl Transfer {
    pub fn new(address: impl Into<String>, value: u64) -> Self {
        Self {
            address: address.into(),
            value,
            message: String::new(),
            tag: String::new(),
        }
    }
}

/// An address spent by a transfer, signed with the key at `key_index`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferInput {
    pub address: String,
    #[serde(rename = "keyIndex")]
    pub key_index: u64,
    pub security: SecurityLevel,
    pub value: u64,
}

/// Inputs and remainder destination of a transfer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferOptions {
    pub inputs: Vec<TransferInput>,
    #[serde(rename = "remainderAddress")]
    pub remainder_address: Option<String>,
}

impl TransferOptions {
    pub fn input_value(&self) -> u64 {
        self.inputs.iter().map(|i| i.value).sum()
    }
}

/// Result of a submitted transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionHandle {
    /// Tail transaction hash, used for inclusion queries.
    pub hash: String,
}

/// Capabilities the hub needs from the ledger network.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    fn is_valid_address(&self, address: &str) -> bool {
        format::is_valid_address(address)
    }

    fn is_valid_seed(&self, seed: &str) -> bool {
        format::is_valid_seed(seed)
    }

    /// Derive the address at `key_index` of `seed`.
    async fn derive_address(
        &self,
        seed: &str,
        key_index: u64,
        security: SecurityLevel,
    ) -> Result<String, LedgerClientError>;

    /// Confirmed balances of `addresses`, in the same order.
    async fn get_balances(&self, addresses: &[String]) -> Result<Vec<u64>, LedgerClientError>;

    /// Whether each of `hashes` is included in the confirmed ledger state.
    async fn get_inclusion_states(&self, hashes: &[String])
        -> Result<Vec<bool>, LedgerClientError>;

    /// Sign and submit a transfer spending `options.inputs`.
    async fn send_transfer(
        &self,
        seed: &str,
        transfers: &[Transfer],
        options: &TransferOptions,
    ) -> Result<TransactionHandle, LedgerClientError>;

    /// Whether `address` has outgoing (signed) activity.
    async fn was_spent_from(&self, address: &str) -> Result<bool, LedgerClientError>;
}
