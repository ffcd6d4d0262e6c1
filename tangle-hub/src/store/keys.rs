//! Key layout of the shared store.

use crate::types::{AccountId, HubId, ScanKind};

const HUB_PREFIX: &str = "hub_";
const ACCOUNT_PREFIX: &str = "account_";
const ACCOUNT_INDEX_PREFIX: &str = "account_index_";
const ADDRESSES_PREFIX: &str = "address_";
const USED_ADDRESSES_PREFIX: &str = "used_address_";
const PENDING_SWEEPS_PREFIX: &str = "pending_sweeps_";
const FAILING_SWEEPS_PREFIX: &str = "failing_sweeps_";
const UNSETTLED_WITHDRAWALS_PREFIX: &str = "unsettled_withdrawals_";

/// Global account id counter.
pub const ACCOUNTS_COUNTER: &str = "accounts_counter";
/// Global hot-wallet key-index counter.
pub const HOT_WALLET_INDEX: &str = "hot_wallet_index";
/// List of spendable hot-wallet inputs.
pub const HOT_WALLET_INPUTS: &str = "hot_wallet_inputs";
/// Hash of hot-wallet addresses locked as sweep destinations.
pub const HOT_WALLET_LOCKED_INPUTS: &str = "hot_wallet_locked_inputs";

/// Value marking a locked hot-wallet input.
pub const LOCKED: &str = "locked";
/// Value marking an unlocked hot-wallet input.
pub const UNLOCKED: &str = "0";

pub fn hub(id: HubId) -> String {
    format!("{}{}", HUB_PREFIX, id)
}

pub fn processing_flag(id: HubId, kind: ScanKind) -> String {
    format!("{}{}_processing_{}", HUB_PREFIX, id, kind.as_str())
}

pub fn syncing_flag(id: HubId) -> String {
    format!("{}{}_syncing", HUB_PREFIX, id)
}

pub fn account(hub: HubId, account: AccountId) -> String {
    format!("{}{}_{}", ACCOUNT_PREFIX, hub, account)
}

pub fn account_balance(hub: HubId, account: AccountId) -> String {
    format!("{}{}_{}_balance", ACCOUNT_PREFIX, hub, account)
}

pub fn account_credit(hub: HubId, account: AccountId) -> String {
    format!("{}{}_{}_credit", ACCOUNT_PREFIX, hub, account)
}

pub fn account_index(hub: HubId, account: AccountId) -> String {
    format!("{}{}_{}", ACCOUNT_INDEX_PREFIX, hub, account)
}

/// Hash holding the address entries a scan of `kind` walks.
pub fn addresses(hub: HubId, kind: ScanKind) -> String {
    match kind {
        ScanKind::Unused => format!("{}{}", ADDRESSES_PREFIX, hub),
        ScanKind::Used => format!("{}{}", USED_ADDRESSES_PREFIX, hub),
    }
}

pub fn pending_sweeps(hub: HubId) -> String {
    format!("{}{}", PENDING_SWEEPS_PREFIX, hub)
}

pub fn failing_sweeps(hub: HubId) -> String {
    format!("{}{}", FAILING_SWEEPS_PREFIX, hub)
}

/// Withdrawals whose submission outcome is unknown.
pub fn unsettled_withdrawals(hub: HubId) -> String {
    format!("{}{}", UNSETTLED_WITHDRAWALS_PREFIX, hub)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_account_keys_do_not_collide_with_index_keys() {
        assert_ne!(account(1, 2), account_index(1, 2));
        assert_ne!(account_balance(1, 2), account_credit(1, 2));
        assert_eq!(account_credit(1, 2), "account_1_2_credit");
    }

    #[test]
    fn test_flag_keys() {
        assert_eq!(processing_flag(7, ScanKind::Unused), "hub_7_processing_unused");
        assert_eq!(processing_flag(7, ScanKind::Used), "hub_7_processing_used");
        assert_eq!(syncing_flag(7), "hub_7_syncing");
    }
}
