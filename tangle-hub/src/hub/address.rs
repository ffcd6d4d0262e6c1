//! Deposit address issuance.
//!
//! Every account owns a window of `max_addresses` key-indices starting at
//! `account * max_addresses`. Indices inside the window come from a per-account
//! counter that is only ever incremented, so an index is never issued twice
//! even when callers race.

use tracing::{debug, warn};

use super::context::HubContext;
use crate::error::{HubError, Result};
use crate::store::{get_int, keys};
use crate::types::{entry_field, entry_value, split_lock_prefix, AccountId, Hub, HubId, ScanKind};

/// Issues deposit addresses and tracks which of them were used.
///
/// Each account owns a contiguous range of `max_addresses` key-indices of its
/// hub's seed; the `index`th address of an account is derived from
/// [`AddressAllocator::key_index`].
pub struct AddressAllocator<'a> {
    ctx: &'a HubContext,
}

impl<'a> AddressAllocator<'a> {
    pub fn new(ctx: &'a HubContext) -> Self {
        Self { ctx }
    }

    /// Physical key-index of the `index`th address of `account`.
    pub fn key_index(&self, account: AccountId, index: u64) -> u64 {
        account
            .saturating_mul(self.ctx.limits().max_addresses)
            .saturating_add(index)
    }

    /// Issue the next deposit address of `account`.
    pub async fn allocate(&self, hub: &Hub, account: AccountId) -> Result<(u64, String)> {
        let store = self.ctx.store();
        let max = self.ctx.limits().max_addresses;
        let index_key = keys::account_index(hub.id, account);

        let current = get_int(store, &index_key)
            .await?
            .ok_or(HubError::MissingAddressIndex {
                hub: hub.id,
                account,
            })?;
        if current < 0 || current as u64 >= max {
            return Err(HubError::AddressSpaceExhausted { account, max });
        }

        let index = (store.incr(&index_key).await? - 1) as u64;
        if index >= max {
            // Lost a race for the last slot.
            return Err(HubError::AddressSpaceExhausted { account, max });
        }

        let key_index = self.key_index(account, index);
        let address = self
            .ctx
            .ledger
            .derive_address(&hub.seed, key_index, hub.security)
            .await?;

        if let Err(e) = store
            .hset(
                &keys::addresses(hub.id, ScanKind::Unused),
                &entry_field(account, index),
                entry_value(false, &address),
            )
            .await
        {
            warn!(
                "Could not store address {} of account #{} in hub #{}: {}",
                index, account, hub.id, e
            );
        }

        debug!(
            "Issued address {} (key-index {}) to account #{} in hub #{}",
            index, key_index, account, hub.id
        );
        Ok((index, address))
    }

    /// Address issued at `index`, or the most recent one.
    pub async fn last_address(
        &self,
        hub: HubId,
        account: AccountId,
        index: Option<u64>,
    ) -> Result<String> {
        let store = self.ctx.store();
        let index = match index {
            Some(index) => index,
            None => {
                let counter = get_int(store, &keys::account_index(hub, account))
                    .await?
                    .ok_or(HubError::MissingAddressIndex { hub, account })?;
                if counter <= 0 {
                    return Err(HubError::DepositAddressNotFound {
                        hub,
                        account,
                        index: 0,
                    });
                }
                (counter - 1) as u64
            }
        };

        let field = entry_field(account, index);
        for kind in [ScanKind::Unused, ScanKind::Used] {
            if let Some(value) = store.hget(&keys::addresses(hub, kind), &field).await? {
                return match split_lock_prefix(&value) {
                    Some((_, address)) => Ok(address.to_string()),
                    None => Err(HubError::CorruptRecord {
                        key: format!("{}[{}]", keys::addresses(hub, kind), field),
                        reason: format!("malformed entry {}", value),
                    }),
                };
            }
        }

        Err(HubError::DepositAddressNotFound {
            hub,
            account,
            index,
        })
    }

    /// Move an entry from the unused collection to the used one.
    pub(crate) async fn move_to_used(
        &self,
        hub: HubId,
        account: AccountId,
        index: u64,
        address: &str,
        locked: bool,
    ) -> Result<()> {
        let store = self.ctx.store();
        let field = entry_field(account, index);
        store
            .hset(
                &keys::addresses(hub, ScanKind::Used),
                &field,
                entry_value(locked, address),
            )
            .await?;
        store
            .hdel(&keys::addresses(hub, ScanKind::Unused), &field)
            .await?;
        Ok(())
    }

    /// Set the lock bit of a used entry.
    pub(crate) async fn set_used_lock(
        &self,
        hub: HubId,
        account: AccountId,
        index: u64,
        address: &str,
        locked: bool,
    ) -> Result<()> {
        self.ctx
            .store()
            .hset(
                &keys::addresses(hub, ScanKind::Used),
                &entry_field(account, index),
                entry_value(locked, address),
            )
            .await?;
        Ok(())
    }
}
