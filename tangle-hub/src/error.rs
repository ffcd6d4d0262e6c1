//! Error types for the hub engine and its collaborators.

use thiserror::Error;

use crate::types::{AccountId, HubId};

/// Failure reported by a [`Store`](crate::store::Store) implementation.
///
/// Absence of a key is never an error; stores return `None` or an empty
/// collection for that.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store backend unavailable: {0}")]
    Unavailable(String),

    #[error("Value at {key} is not an integer: {value}")]
    NotAnInteger { key: String, value: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Snapshot I/O error: {0}")]
    Io(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err.to_string())
    }
}

/// Failure reported by a [`LedgerClient`](crate::ledger::LedgerClient).
#[derive(Debug, Error)]
pub enum LedgerClientError {
    #[error("RPC transport error: {0}")]
    Transport(String),

    #[error("RPC error {code}: {message}")]
    Rpc { code: i32, message: String },

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Invalid seed")]
    InvalidSeed,

    #[error("Transfer rejected: {0}")]
    TransferRejected(String),

    /// The request reached a node but no usable answer came back, so it may
    /// or may not have been applied.
    #[error("Outcome unknown: {0}")]
    Ambiguous(String),
}

impl LedgerClientError {
    /// Whether the request may have been applied despite the error.
    pub fn is_ambiguous(&self) -> bool {
        matches!(self, LedgerClientError::Ambiguous(_))
    }
}

impl From<reqwest::Error> for LedgerClientError {
    fn from(err: reqwest::Error) -> Self {
        LedgerClientError::Transport(err.to_string())
    }
}

/// Errors surfaced by the hub engine.
#[derive(Debug, Error)]
pub enum HubError {
    #[error("Provide a valid seed")]
    InvalidSeed,

    #[error("Provide a valid security level (1, 2 or 3), got {0}")]
    InvalidSecurity(u8),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid value: {0}")]
    InvalidValue(String),

    #[error("Hub #{0} already exists")]
    HubExists(HubId),

    #[error("Hub #{0} does not exist")]
    HubNotFound(HubId),

    #[error("Hub #{0} is already attached")]
    AlreadyAttached(HubId),

    #[error("Hub #{0} is not attached")]
    NotAttached(HubId),

    #[error("Account #{account} not found in hub #{hub}")]
    AccountNotFound { hub: HubId, account: AccountId },

    #[error("Address index not found for account #{account} in hub #{hub}")]
    MissingAddressIndex { hub: HubId, account: AccountId },

    #[error("Account #{account} has reached the limit of {max} addresses")]
    AddressSpaceExhausted { account: AccountId, max: u64 },

    #[error("No deposit address at index {index} for account #{account} in hub #{hub}")]
    DepositAddressNotFound {
        hub: HubId,
        account: AccountId,
        index: u64,
    },

    #[error("Account #{account} has insufficient credit to withdraw {requested}")]
    InsufficientCredit { account: AccountId, requested: u64 },

    #[error("Address {0} has already been spent from")]
    AddressAlreadySpent(String),

    #[error("Hot wallet inputs exhausted: collected {collected} out of {requested}")]
    InsufficientInputs { collected: u64, requested: u64 },

    #[error("Hot wallet pool is empty")]
    EmptyHotWalletPool,

    #[error(
        "Pending sweeps of hub #{0} contain credited sweeps; reconcile before syncing again"
    )]
    NotEvenWithDb(HubId),

    #[error("Transfer failed: {0}")]
    TransferFailed(String),

    #[error("Transfer outcome unknown, inputs stay locked until reconciled: {0}")]
    TransferOutcomeUnknown(String),

    #[error("Corrupt record {key}: {reason}")]
    CorruptRecord { key: String, reason: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Ledger(#[from] LedgerClientError),
}

impl HubError {
    /// Whether the error stems from caller input rather than infrastructure.
    pub fn is_validation(&self) -> bool {
        !matches!(
            self,
            HubError::Store(_)
                | HubError::Ledger(_)
                | HubError::TransferFailed(_)
                | HubError::TransferOutcomeUnknown(_)
                | HubError::InsufficientInputs { .. }
                | HubError::EmptyHotWalletPool
                | HubError::CorruptRecord { .. }
                | HubError::NotEvenWithDb(_)
        )
    }
}

pub type Result<T, E = HubError> = std::result::Result<T, E>;
