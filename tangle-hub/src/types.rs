//! Records shared by the hub components.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::HubError;

/// Identifier of a hub (hot-wallet configuration).
pub type HubId = u64;

/// Identifier of a customer account. Unique across all hubs.
pub type AccountId = u64;

/// Number of signature fragments per address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct SecurityLevel(u8);

impl SecurityLevel {
    pub const LOW: SecurityLevel = SecurityLevel(1);
    pub const MEDIUM: SecurityLevel = SecurityLevel(2);
    pub const HIGH: SecurityLevel = SecurityLevel(3);

    pub fn value(self) -> u8 {
        self.0
    }
}

impl Default for SecurityLevel {
    fn default() -> Self {
        SecurityLevel::MEDIUM
    }
}

impl TryFrom<u8> for SecurityLevel {
    type Error = HubError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1..=3 => Ok(SecurityLevel(value)),
            other => Err(HubError::InvalidSecurity(other)),
        }
    }
}

impl From<SecurityLevel> for u8 {
    fn from(level: SecurityLevel) -> Self {
        level.0
    }
}

impl fmt::Display for SecurityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A hub as persisted in the store.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hub {
    pub id: HubId,
    pub seed: String,
    pub security: SecurityLevel,
    #[serde(default)]
    pub name: String,
}

// The seed never ends up in logs.
impl fmt::Debug for Hub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hub")
            .field("id", &self.id)
            .field("security", &self.security)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// The persisted part of an account. Balances live in separate counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRecord {
    pub id: AccountId,
    #[serde(rename = "hubId")]
    pub hub_id: HubId,
    #[serde(default)]
    pub name: String,
}

/// An account together with its current counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    #[serde(rename = "hubId")]
    pub hub_id: HubId,
    pub name: String,
    /// Deposited value seen on the ledger but not yet swept and credited.
    #[serde(rename = "balanceOnTangle")]
    pub balance_on_tangle: i64,
    /// Internally spendable balance.
    pub credit: i64,
}

/// Which address collection a scan walks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanKind {
    /// Fresh deposit addresses that never received value.
    Unused,
    /// Addresses that already received a deposit.
    Used,
}

impl ScanKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ScanKind::Unused => "unused",
            ScanKind::Used => "used",
        }
    }
}

impl fmt::Display for ScanKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A deposit address entry: field `{account}_{index}`, value `{locked}_{address}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressEntry {
    pub account: AccountId,
    pub index: u64,
    pub locked: bool,
    pub address: String,
}

impl AddressEntry {
    pub fn new(account: AccountId, index: u64, address: impl Into<String>) -> Self {
        Self {
            account,
            index,
            locked: false,
            address: address.into(),
        }
    }

    /// Hash field identifying the entry.
    pub fn field(&self) -> String {
        entry_field(self.account, self.index)
    }

    /// Hash value carrying the lock bit and the address.
    pub fn value(&self) -> String {
        entry_value(self.locked, &self.address)
    }

    /// Parse a stored `(field, value)` pair.
    pub fn parse(field: &str, value: &str) -> Option<Self> {
        let (account, index) = field.split_once('_')?;
        let (locked, address) = split_lock_prefix(value)?;

        Some(Self {
            account: account.parse().ok()?,
            index: index.parse().ok()?,
            locked,
            address: address.to_string(),
        })
    }
}

pub fn entry_field(account: AccountId, index: u64) -> String {
    format!("{}_{}", account, index)
}

pub fn entry_value(locked: bool, address: &str) -> String {
    format!("{}_{}", if locked { 1 } else { 0 }, address)
}

/// Split a stored `{locked}_{address}` value.
pub fn split_lock_prefix(value: &str) -> Option<(bool, &str)> {
    let (locked, address) = value.split_once('_')?;
    let locked = match locked {
        "0" => false,
        "1" => true,
        _ => return None,
    };
    if address.is_empty() {
        return None;
    }
    Some((locked, address))
}

/// A spendable hot-wallet address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HotWalletInput {
    pub address: String,
    #[serde(rename = "keyIndex")]
    pub key_index: u64,
    pub value: u64,
}

/// A withdrawal the ledger may or may not have applied.
///
/// The debited credit and the spent inputs stay out of circulation until an
/// operator settles the record against the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsettledWithdrawal {
    pub account: AccountId,
    pub address: String,
    pub value: u64,
    pub inputs: Vec<HotWalletInput>,
    #[serde(rename = "remainderAddress")]
    pub remainder_address: Option<String>,
    /// Fresh input minted to receive the change, kept out of the pool.
    #[serde(rename = "remainderInput")]
    pub remainder_input: Option<HotWalletInput>,
    pub reason: String,
}

/// A detected deposit waiting to be swept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepCandidate {
    pub address: String,
    pub index: u64,
    pub key_index: u64,
    pub value: u64,
    pub account: AccountId,
}

/// A submitted (or failed) sweep as recorded in the pending/failing lists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sweep {
    pub address: String,
    pub index: u64,
    #[serde(rename = "keyIndex")]
    pub key_index: u64,
    pub value: u64,
    pub account: AccountId,
    #[serde(rename = "destinationAddress")]
    pub destination_address: String,
    /// Tail transaction hash; `None` for failed submissions.
    pub tx: Option<String>,
}

impl Sweep {
    pub fn from_candidate(
        candidate: &SweepCandidate,
        destination_address: &str,
        tx: Option<String>,
    ) -> Self {
        Self {
            address: candidate.address.clone(),
            index: candidate.index,
            key_index: candidate.key_index,
            value: candidate.value,
            account: candidate.account,
            destination_address: destination_address.to_string(),
            tx,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_security_level_bounds() {
        assert!(SecurityLevel::try_from(0).is_err());
        assert_eq!(SecurityLevel::try_from(2).unwrap(), SecurityLevel::MEDIUM);
        assert!(SecurityLevel::try_from(4).is_err());
    }

    #[test]
    fn test_security_level_rejected_on_deserialize() {
        let json = r#"{"id":1,"seed":"A","security":7,"name":""}"#;
        assert!(serde_json::from_str::<Hub>(json).is_err());
    }

    #[test]
    fn test_address_entry_parse() {
        let entry = AddressEntry::parse("12_3", "1_ABC").unwrap();
        assert_eq!(entry.account, 12);
        assert_eq!(entry.index, 3);
        assert!(entry.locked);
        assert_eq!(entry.address, "ABC");
        assert_eq!(entry.field(), "12_3");
        assert_eq!(entry.value(), "1_ABC");
    }

    #[test]
    fn test_address_entry_rejects_garbage() {
        assert!(AddressEntry::parse("12", "0_ABC").is_none());
        assert!(AddressEntry::parse("12_x", "0_ABC").is_none());
        assert!(AddressEntry::parse("12_3", "2_ABC").is_none());
        assert!(AddressEntry::parse("12_3", "0_").is_none());
    }

    #[test]
    fn test_hub_debug_hides_seed() {
        let hub = Hub {
            id: 1,
            seed: "SECRETSEED".to_string(),
            security: SecurityLevel::MEDIUM,
            name: "main".to_string(),
        };
        assert!(!format!("{:?}", hub).contains("SECRETSEED"));
    }
}
