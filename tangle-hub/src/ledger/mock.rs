//! Deterministic in-process ledger.
//!
//! Addresses are derived by hashing `(seed, key_index, security)`, balances
//! move when transfers are submitted, and transactions stay unconfirmed until
//! [`MockLedger::confirm`] is called. Each capability can be switched into a
//! failing mode to exercise the hub's recovery paths.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::{
    collections::{HashMap, HashSet},
    sync::{Mutex, MutexGuard},
};

use super::{
    format::{bytes_to_trytes, no_checksum, ADDRESS_LENGTH},
    LedgerClient, TransactionHandle, Transfer, TransferOptions,
};
use crate::error::LedgerClientError;
use crate::types::SecurityLevel;

/// A transfer accepted by the mock ledger.
#[derive(Debug, Clone)]
pub struct SubmittedTransfer {
    pub hash: String,
    pub transfers: Vec<Transfer>,
    pub options: TransferOptions,
}

#[derive(Debug, Default)]
struct MockState {
    balances: HashMap<String, u64>,
    confirmed: HashSet<String>,
    spent: HashSet<String>,
    submitted: Vec<SubmittedTransfer>,
    fail_balances: bool,
    fail_inclusion: bool,
    fail_transfers: bool,
    lose_transfer_replies: bool,
    fail_spent_check: bool,
    balance_queries: usize,
}

#[derive(Debug, Default)]
pub struct MockLedger {
    state: Mutex<MockState>,
}

fn derive(seed: &str, key_index: u64, security: SecurityLevel) -> String {
    let mut bytes = Vec::with_capacity(96);
    for round in 0u8..3 {
        let mut hasher = Sha256::new();
        hasher.update(seed.as_bytes());
        hasher.update(key_index.to_le_bytes());
        hasher.update([security.value(), round]);
        bytes.extend_from_slice(&hasher.finalize());
    }
    bytes_to_trytes(&bytes, ADDRESS_LENGTH)
}

impl MockLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Address the mock derives for `(seed, key_index, security)`.
    pub fn address_for(&self, seed: &str, key_index: u64, security: SecurityLevel) -> String {
        derive(seed, key_index, security)
    }

    pub fn set_balance(&self, address: &str, value: u64) {
        self.lock()
            .balances
            .insert(no_checksum(address).to_string(), value);
    }

    /// Simulate an incoming deposit.
    pub fn deposit(&self, address: &str, value: u64) {
        *self
            .lock()
            .balances
            .entry(no_checksum(address).to_string())
            .or_default() += value;
    }

    pub fn balance(&self, address: &str) -> u64 {
        self.lock()
            .balances
            .get(no_checksum(address))
            .copied()
            .unwrap_or(0)
    }

    /// Mark a transaction as included in the confirmed ledger state.
    pub fn confirm(&self, hash: &str) {
        self.lock().confirmed.insert(hash.to_string());
    }

    pub fn confirm_all(&self) {
        let mut state = self.lock();
        let hashes: Vec<String> = state.submitted.iter().map(|t| t.hash.clone()).collect();
        state.confirmed.extend(hashes);
    }

    pub fn mark_spent(&self, address: &str) {
        self.lock().spent.insert(no_checksum(address).to_string());
    }

    pub fn fail_balances(&self, fail: bool) {
        self.lock().fail_balances = fail;
    }

    pub fn fail_inclusion(&self, fail: bool) {
        self.lock().fail_inclusion = fail;
    }

    pub fn fail_transfers(&self, fail: bool) {
        self.lock().fail_transfers = fail;
    }

    /// Apply submitted transfers but answer with an unknown outcome, as a
    /// node does when the connection drops after it accepted the request.
    pub fn fail_transfers_ambiguously(&self, fail: bool) {
        self.lock().lose_transfer_replies = fail;
    }

    pub fn fail_spent_check(&self, fail: bool) {
        self.lock().fail_spent_check = fail;
    }

    /// Transfers accepted so far, oldest first.
    pub fn submitted(&self) -> Vec<SubmittedTransfer> {
        self.lock().submitted.clone()
    }

    /// Number of balance queries served, including failed ones.
    pub fn balance_queries(&self) -> usize {
        self.lock().balance_queries
    }
}

#[async_trait]
impl LedgerClient for MockLedger {
    async fn derive_address(
        &self,
        seed: &str,
        key_index: u64,
        security: SecurityLevel,
    ) -> Result<String, LedgerClientError> {
        if !self.is_valid_seed(seed) {
            return Err(LedgerClientError::InvalidSeed);
        }
        Ok(derive(seed, key_index, security))
    }

    async fn get_balances(&self, addresses: &[String]) -> Result<Vec<u64>, LedgerClientError> {
        let mut state = self.lock();
        state.balance_queries += 1;
        if state.fail_balances {
            return Err(LedgerClientError::Transport("balance query disabled".into()));
        }
        Ok(addresses
            .iter()
            .map(|a| state.balances.get(no_checksum(a)).copied().unwrap_or(0))
            .collect())
    }

    async fn get_inclusion_states(
        &self,
        hashes: &[String],
    ) -> Result<Vec<bool>, LedgerClientError> {
        let state = self.lock();
        if state.fail_inclusion {
            return Err(LedgerClientError::Transport("inclusion query disabled".into()));
        }
        Ok(hashes.iter().map(|h| state.confirmed.contains(h)).collect())
    }

    async fn send_transfer(
        &self,
        seed: &str,
        transfers: &[Transfer],
        options: &TransferOptions,
    ) -> Result<TransactionHandle, LedgerClientError> {
        if !self.is_valid_seed(seed) {
            return Err(LedgerClientError::InvalidSeed);
        }

        let mut state = self.lock();
        if state.fail_transfers {
            return Err(LedgerClientError::Transport("transfer submission disabled".into()));
        }

        for input in &options.inputs {
            let available = state
                .balances
                .get(no_checksum(&input.address))
                .copied()
                .unwrap_or(0);
            if available < input.value {
                return Err(LedgerClientError::TransferRejected(format!(
                    "input {} holds {} but declares {}",
                    input.address, available, input.value
                )));
            }
        }

        let input_value: u64 = options.inputs.iter().map(|i| i.value).sum();
        let output_value: u64 = transfers.iter().map(|t| t.value).sum();
        if output_value > input_value {
            return Err(LedgerClientError::TransferRejected(format!(
                "outputs {} exceed inputs {}",
                output_value, input_value
            )));
        }
        let remainder = input_value - output_value;
        if remainder > 0 && options.remainder_address.is_none() {
            return Err(LedgerClientError::TransferRejected(
                "remainder without remainder address".into(),
            ));
        }

        for input in &options.inputs {
            let address = no_checksum(&input.address).to_string();
            if let Some(balance) = state.balances.get_mut(&address) {
                *balance -= input.value;
            }
            state.spent.insert(address);
        }
        for transfer in transfers {
            *state
                .balances
                .entry(no_checksum(&transfer.address).to_string())
                .or_default() += transfer.value;
        }
        if let Some(remainder_address) = &options.remainder_address {
            if remainder > 0 {
                *state
                    .balances
                    .entry(no_checksum(remainder_address).to_string())
                    .or_default() += remainder;
            }
        }

        let mut hasher = Sha256::new();
        hasher.update(b"tx");
        hasher.update((state.submitted.len() as u64).to_le_bytes());
        let hash = bytes_to_trytes(&hasher.finalize(), ADDRESS_LENGTH);

        state.submitted.push(SubmittedTransfer {
            hash: hash.clone(),
            transfers: transfers.to_vec(),
            options: options.clone(),
        });

        if state.lose_transfer_replies {
            return Err(LedgerClientError::Ambiguous(format!(
                "reply to transfer {} lost",
                hash
            )));
        }
        Ok(TransactionHandle { hash })
    }

    async fn was_spent_from(&self, address: &str) -> Result<bool, LedgerClientError> {
        let state = self.lock();
        if state.fail_spent_check {
            return Err(LedgerClientError::Transport("spent check disabled".into()));
        }
        Ok(state.spent.contains(no_checksum(address)))
    }
}
