//! Customer accounts and their credit bookkeeping.

use tracing::{info, warn};

use super::context::HubContext;
use crate::error::{HubError, Result};
use crate::events::HubEvent;
use crate::store::{get_int, get_json, keys, set_json};
use crate::types::{Account, AccountId, AccountRecord, HubId};

/// Registers accounts and moves value between `balanceOnTangle` and `credit`.
pub struct AccountLedger<'a> {
    ctx: &'a HubContext,
}

impl<'a> AccountLedger<'a> {
    /// Borrow the shared context; the ledger itself holds no state.
    pub fn new(ctx: &'a HubContext) -> Self {
        Self { ctx }
    }

    pub async fn register(&self, hub: HubId, name: &str) -> Result<Account> {
        let store = self.ctx.store();
        if store.get(&keys::hub(hub)).await?.is_none() {
            return Err(HubError::HubNotFound(hub));
        }

        let id = store.incr(keys::ACCOUNTS_COUNTER).await? as AccountId;
        let record = AccountRecord {
            id,
            hub_id: hub,
            name: name.to_string(),
        };

        set_json(store, &keys::account(hub, id), &record).await?;
        store.set(&keys::account_balance(hub, id), "0".to_string()).await?;
        store.set(&keys::account_credit(hub, id), "0".to_string()).await?;
        store.set(&keys::account_index(hub, id), "0".to_string()).await?;

        info!("Registered account #{} ({}) in hub #{}", id, name, hub);

        Ok(Account {
            id,
            hub_id: hub,
            name: record.name,
            balance_on_tangle: 0,
            credit: 0,
        })
    }

    async fn record(&self, hub: HubId, account: AccountId) -> Result<AccountRecord> {
        get_json(self.ctx.store(), &keys::account(hub, account))
            .await?
            .ok_or(HubError::AccountNotFound { hub, account })
    }

    pub async fn get(&self, hub: HubId, account: AccountId) -> Result<Account> {
        let record = self.record(hub, account).await?;
        let store = self.ctx.store();
        let balance_on_tangle = get_int(store, &keys::account_balance(hub, account))
            .await?
            .unwrap_or(0);
        let credit = get_int(store, &keys::account_credit(hub, account))
            .await?
            .unwrap_or(0);

        Ok(Account {
            id: record.id,
            hub_id: record.hub_id,
            name: record.name,
            balance_on_tangle,
            credit,
        })
    }

    pub async fn credit_of(&self, hub: HubId, account: AccountId) -> Result<i64> {
        self.record(hub, account).await?;
        Ok(get_int(self.ctx.store(), &keys::account_credit(hub, account))
            .await?
            .unwrap_or(0))
    }

    pub async fn balance_on_tangle(&self, hub: HubId, account: AccountId) -> Result<i64> {
        self.record(hub, account).await?;
        Ok(get_int(self.ctx.store(), &keys::account_balance(hub, account))
            .await?
            .unwrap_or(0))
    }

    pub async fn has_credit(&self, hub: HubId, account: AccountId, value: u64) -> Result<bool> {
        let credit = self.credit_of(hub, account).await?;
        Ok(credit >= 0 && credit as u64 >= value)
    }

    /// Operator credit that never touched the ledger.
    pub async fn credit_off_chain(
        &self,
        hub: HubId,
        account: AccountId,
        value: u64,
    ) -> Result<i64> {
        let delta = to_delta(value)?;
        self.record(hub, account).await?;

        let credit = self
            .ctx
            .store()
            .incr_by(&keys::account_credit(hub, account), delta)
            .await?;
        let balance = get_int(self.ctx.store(), &keys::account_balance(hub, account))
            .await
            .ok()
            .flatten();

        info!(
            "Credited {} off-chain to account #{} in hub #{}",
            value, account, hub
        );
        self.ctx.events.emit(HubEvent::Credit {
            hub,
            account,
            value,
            credit: Some(credit),
            balance_on_tangle: balance,
            off_chain: true,
        });

        Ok(credit)
    }

    /// Credit a confirmed sweep.
    ///
    /// The credit increment is the step that counts; the matching decrement
    /// of `balanceOnTangle` is best effort.
    pub(crate) async fn settle_sweep(
        &self,
        hub: HubId,
        account: AccountId,
        value: u64,
    ) -> Result<i64> {
        let delta = to_delta(value)?;
        let store = self.ctx.store();

        let credit = store
            .incr_by(&keys::account_credit(hub, account), delta)
            .await?;
        let balance = match store
            .decr_by(&keys::account_balance(hub, account), delta)
            .await
        {
            Ok(balance) => Some(balance),
            Err(e) => {
                warn!(
                    "Could not lower balanceOnTangle of account #{} in hub #{}: {}",
                    account, hub, e
                );
                None
            }
        };

        self.ctx.events.emit(HubEvent::Credit {
            hub,
            account,
            value,
            credit: Some(credit),
            balance_on_tangle: balance,
            off_chain: false,
        });

        Ok(credit)
    }

    /// Adjust `balanceOnTangle`, logging failures.
    pub(crate) async fn adjust_balance_on_tangle(
        &self,
        hub: HubId,
        account: AccountId,
        delta: i64,
    ) {
        if let Err(e) = self
            .ctx
            .store()
            .incr_by(&keys::account_balance(hub, account), delta)
            .await
        {
            warn!(
                "Could not adjust balanceOnTangle of account #{} in hub #{} by {}: {}",
                account, hub, delta, e
            );
        }
    }

    /// Take `value` from the account's credit, returning the credit left.
    pub(crate) async fn debit(&self, hub: HubId, account: AccountId, value: u64) -> Result<i64> {
        let delta = to_delta(value)?;
        Ok(self
            .ctx
            .store()
            .decr_by(&keys::account_credit(hub, account), delta)
            .await?)
    }

    /// Return a previously debited `value`.
    pub(crate) async fn refund(&self, hub: HubId, account: AccountId, value: u64) -> Result<i64> {
        let delta = to_delta(value)?;
        Ok(self
            .ctx
            .store()
            .incr_by(&keys::account_credit(hub, account), delta)
            .await?)
    }
}

fn to_delta(value: u64) -> Result<i64> {
    if value == 0 {
        return Err(HubError::InvalidValue("value must be positive".into()));
    }
    i64::try_from(value).map_err(|_| HubError::InvalidValue(format!("{} is too large", value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::tests::{context, seed_hub};

    #[tokio::test]
    async fn test_register_requires_hub() {
        let (ctx, _ledger) = context();
        let ledger = AccountLedger::new(&ctx);

        assert!(matches!(
            ledger.register(9, "alice").await,
            Err(HubError::HubNotFound(9))
        ));
    }

    #[tokio::test]
    async fn test_register_zeroes_counters() {
        let (ctx, _ledger) = context();
        seed_hub(&ctx, 1).await;
        let ledger = AccountLedger::new(&ctx);

        let first = ledger.register(1, "alice").await.unwrap();
        let second = ledger.register(1, "bob").await.unwrap();

        assert_eq!(first.id, 1);
        assert_eq!(second.id, 2);
        let account = ledger.get(1, first.id).await.unwrap();
        assert_eq!(account.credit, 0);
        assert_eq!(account.balance_on_tangle, 0);
        assert_eq!(
            get_int(ctx.store(), &keys::account_index(1, first.id)).await.unwrap(),
            Some(0)
        );
    }

    #[tokio::test]
    async fn test_unknown_account() {
        let (ctx, _ledger) = context();
        seed_hub(&ctx, 1).await;
        let ledger = AccountLedger::new(&ctx);

        assert!(matches!(
            ledger.get(1, 5).await,
            Err(HubError::AccountNotFound { hub: 1, account: 5 })
        ));
        assert!(ledger.credit_off_chain(1, 5, 10).await.is_err());
    }

    #[tokio::test]
    async fn test_off_chain_credit() {
        let (ctx, _ledger) = context();
        seed_hub(&ctx, 1).await;
        let ledger = AccountLedger::new(&ctx);
        let account = ledger.register(1, "alice").await.unwrap();
        let mut events = ctx.events.subscribe();

        assert_eq!(ledger.credit_off_chain(1, account.id, 250).await.unwrap(), 250);
        assert!(ledger.has_credit(1, account.id, 250).await.unwrap());
        assert!(!ledger.has_credit(1, account.id, 251).await.unwrap());
        assert_eq!(ledger.balance_on_tangle(1, account.id).await.unwrap(), 0);
        assert!(ledger.credit_off_chain(1, account.id, 0).await.is_err());

        match events.recv().await.unwrap() {
            HubEvent::Credit {
                value, off_chain, ..
            } => {
                assert_eq!(value, 250);
                assert!(off_chain);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_settle_sweep_moves_balance_to_credit() {
        let (ctx, _ledger) = context();
        seed_hub(&ctx, 1).await;
        let ledger = AccountLedger::new(&ctx);
        let account = ledger.register(1, "alice").await.unwrap();

        ledger.adjust_balance_on_tangle(1, account.id, 1000).await;
        ledger.settle_sweep(1, account.id, 1000).await.unwrap();

        let account = ledger.get(1, account.id).await.unwrap();
        assert_eq!(account.credit, 1000);
        assert_eq!(account.balance_on_tangle, 0);
    }
}
