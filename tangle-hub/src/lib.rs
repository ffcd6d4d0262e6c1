//! Tangle Hub
//!
//! A custodial deposit and withdrawal hub for tangle-based ledgers. Customers
//! deposit to per-account addresses derived from a hub seed; the hub sweeps
//! those deposits into a hot wallet, credits the accounts once the sweeps are
//! confirmed, and pays withdrawals from the hot wallet.
//!
//! # Architecture
//!
//! All shared state lives behind the [`store::Store`] trait and all ledger
//! access behind [`ledger::LedgerClient`], so several hub processes can share
//! one store. [`hub::HubEngine`] drives the cycles:
//!
//! - `process` scans deposit addresses and sweeps new deposits
//! - `sync` credits accounts for sweeps the ledger has confirmed
//! - `withdraw` pays out of the hot wallet and rolls back on failure
//!
//! Cross-process mutual exclusion uses per-hub flags set with an atomic
//! get-and-set. Engine activity is published as [`events::HubEvent`]s, which
//! the [`output`] handlers forward to stdout or a webhook.
//!
//! # Security Model
//!
//! Seeds never leave the process except inside signed transfer requests to
//! the configured node, and are kept out of `Debug` output.

pub mod config;
pub mod error;
pub mod events;
pub mod hub;
pub mod ledger;
pub mod output;
pub mod store;
pub mod types;

pub use config::{EngineLimits, HubConfig, OutputMode};
pub use error::{HubError, LedgerClientError, StoreError};
pub use events::{EventBus, HubEvent};
pub use hub::{EngineConfig, HubEngine, WithdrawRequest, Withdrawal};
pub use ledger::{JsonRpcLedger, LedgerClient, MockLedger};
pub use store::{MemoryStore, Store};
pub use types::{Account, AccountId, Hub, HubId, ScanKind, SecurityLevel};
