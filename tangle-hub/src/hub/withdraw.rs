//! Withdrawals from the hot wallet.
//!
//! Credit is debited before the transfer is submitted and given back if the
//! submission fails, so a customer can never spend the same credit twice.
//! When the ledger may have applied the transfer anyway, neither the credit
//! nor the inputs come back; the withdrawal is parked as unsettled instead.

use serde::Serialize;
use tracing::{error, info, warn};

use super::{account::AccountLedger, context::HubContext, hot_wallet::HotWalletPool};
use crate::error::{HubError, LedgerClientError, Result};
use crate::events::HubEvent;
use crate::ledger::{Transfer, TransferInput, TransferOptions};
use crate::store::{keys, rpush_json};
use crate::types::{AccountId, HotWalletInput, HubId, UnsettledWithdrawal};

/// A withdrawal as requested by the customer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WithdrawRequest {
    pub address: String,
    pub value: u64,
    /// Where the change goes; a fresh hot-wallet input when absent.
    pub remainder_address: Option<String>,
    /// Refuse destinations that were already spent from.
    pub check_address: bool,
}

impl WithdrawRequest {
    /// A request with a minted remainder input and the spent-address check on.
    pub fn new(address: impl Into<String>, value: u64) -> Self {
        Self {
            address: address.into(),
            value,
            remainder_address: None,
            check_address: true,
        }
    }

    pub fn with_remainder_address(mut self, address: impl Into<String>) -> Self {
        self.remainder_address = Some(address.into());
        self
    }

    pub fn skip_address_check(mut self) -> Self {
        self.check_address = false;
        self
    }
}

/// A submitted withdrawal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Withdrawal {
    pub hash: String,
    pub value: u64,
    /// Credit left after the debit.
    pub credit: i64,
    pub inputs: Vec<HotWalletInput>,
    pub remainder: u64,
    pub remainder_address: Option<String>,
    /// Fresh inputs added to the pool in place of the consumed ones.
    pub replenished: usize,
}

/// Pays withdrawals out of the hot-wallet pool.
pub struct WithdrawalProcessor<'a> {
    ctx: &'a HubContext,
}

impl<'a> WithdrawalProcessor<'a> {
    pub fn new(ctx: &'a HubContext) -> Self {
        Self { ctx }
    }

    fn validate(&self, request: &WithdrawRequest) -> Result<()> {
        if request.value == 0 {
            return Err(HubError::InvalidValue("withdrawal value must be positive".into()));
        }
        if !self.ctx.ledger.is_valid_address(&request.address) {
            return Err(HubError::InvalidAddress(request.address.clone()));
        }
        if let Some(remainder) = &request.remainder_address {
            if !self.ctx.ledger.is_valid_address(remainder) {
                return Err(HubError::InvalidAddress(remainder.clone()));
            }
        }
        Ok(())
    }

    pub async fn withdraw(
        &self,
        hub: HubId,
        account: AccountId,
        request: &WithdrawRequest,
    ) -> Result<Withdrawal> {
        self.validate(request)?;
        self.ctx.attached_hub(hub)?;

        let accounts = AccountLedger::new(self.ctx);
        let credit = accounts.credit_of(hub, account).await?;

        if request.check_address && self.ctx.ledger.was_spent_from(&request.address).await? {
            return Err(HubError::AddressAlreadySpent(request.address.clone()));
        }
        if credit < 0 || (credit as u64) < request.value {
            return Err(HubError::InsufficientCredit {
                account,
                requested: request.value,
            });
        }

        let pool = HotWalletPool::new(self.ctx);
        let collected = pool.collect(request.value).await?;
        let remainder = collected.total - request.value;

        let minted = if remainder > 0 && request.remainder_address.is_none() {
            match pool.new_input().await {
                Ok(input) => Some(input),
                Err(e) => {
                    pool.restore_all_front(&collected.originals).await;
                    return Err(e);
                }
            }
        } else {
            None
        };
        let remainder_address = minted
            .as_ref()
            .map(|input| input.address.clone())
            .or_else(|| request.remainder_address.clone());

        let credit = match accounts.debit(hub, account, request.value).await {
            Ok(credit) if credit >= 0 => credit,
            Ok(_) => {
                // Another withdrawal won the race for the credit.
                self.refund(hub, account, request.value).await;
                pool.restore_all_front(&collected.originals).await;
                return Err(HubError::InsufficientCredit {
                    account,
                    requested: request.value,
                });
            }
            Err(e) => {
                pool.restore_all_front(&collected.originals).await;
                return Err(e);
            }
        };

        let security = self.ctx.config.hot_wallet_security;
        let options = TransferOptions {
            inputs: collected
                .inputs
                .iter()
                .map(|input| TransferInput {
                    address: input.address.clone(),
                    key_index: input.key_index,
                    security,
                    value: input.value,
                })
                .collect(),
            remainder_address: remainder_address.clone(),
        };
        let transfer = Transfer::new(request.address.clone(), request.value);

        let handle = match self
            .ctx
            .ledger
            .send_transfer(
                &self.ctx.config.hot_wallet_seed,
                std::slice::from_ref(&transfer),
                &options,
            )
            .await
        {
            Ok(handle) => handle,
            Err(e) if e.is_ambiguous() => {
                error!(
                    "Withdrawal of {} from account #{} in hub #{} to {} may have been applied: {}",
                    request.value, account, hub, request.address, e
                );
                let record = UnsettledWithdrawal {
                    account,
                    address: request.address.clone(),
                    value: request.value,
                    inputs: collected.inputs,
                    remainder_address,
                    remainder_input: minted,
                    reason: e.to_string(),
                };
                self.park(hub, &record, &e).await;
                return Err(HubError::TransferOutcomeUnknown(e.to_string()));
            }
            Err(e) => {
                warn!(
                    "Withdrawal of {} from account #{} in hub #{} failed: {}",
                    request.value, account, hub, e
                );
                self.refund(hub, account, request.value).await;
                pool.restore_all_front(&collected.originals).await;
                return Err(HubError::TransferFailed(e.to_string()));
            }
        };

        if let Some(mut input) = minted.clone() {
            input.value = remainder;
            if let Err(e) = pool.restore_back(&input).await {
                error!(
                    "Remainder input {} (key-index {}) holding {} not added to the pool: {}",
                    input.address, input.key_index, remainder, e
                );
            }
        }

        let wanted = collected.inputs.len() - usize::from(minted.is_some());
        let mut replenished = 0;
        for _ in 0..wanted {
            match pool.create_input().await {
                Ok(_) => replenished += 1,
                Err(e) => warn!("Could not replenish the hot-wallet pool: {}", e),
            }
        }

        info!(
            "Withdrew {} from account #{} in hub #{} to {} (tx {})",
            request.value, account, hub, request.address, handle.hash
        );
        self.ctx.events.emit(HubEvent::Withdraw {
            hub,
            account,
            value: request.value,
            credit,
            address: request.address.clone(),
            remainder,
            inputs: collected.inputs.clone(),
            remainder_address: remainder_address.clone(),
            hash: handle.hash.clone(),
        });

        Ok(Withdrawal {
            hash: handle.hash,
            value: request.value,
            credit,
            inputs: collected.inputs,
            remainder,
            remainder_address,
            replenished,
        })
    }

    /// Keep the inputs of a withdrawal with unknown outcome locked and out of
    /// the pool, and record it for reconciliation.
    async fn park(&self, hub: HubId, record: &UnsettledWithdrawal, cause: &LedgerClientError) {
        let pool = HotWalletPool::new(self.ctx);
        for input in &record.inputs {
            if let Err(e) = pool.lock(&input.address).await {
                warn!("Could not lock hot-wallet input {}: {}", input.address, e);
            }
        }
        if let Err(e) =
            rpush_json(self.ctx.store(), &keys::unsettled_withdrawals(hub), record).await
        {
            error!(
                "Unsettled withdrawal of {} from account #{} in hub #{} not recorded ({}): {}; inputs {:?}",
                record.value, record.account, hub, cause, e, record.inputs
            );
        }
    }

    async fn refund(&self, hub: HubId, account: AccountId, value: u64) {
        if let Err(e) = AccountLedger::new(self.ctx).refund(hub, account, value).await {
            error!(
                "Could not return {} credit to account #{} in hub #{}: {}",
                value, account, hub, e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::tests::{context, seed_hub};
    use crate::ledger::MockLedger;
    use crate::store::lrange_json;

    const DESTINATION: &str =
        "DESTINATION9ADDRESS99999999999999999999999999999999999999999999999999999999999999";

    async fn funded_account(
        ctx: &HubContext,
        ledger: &MockLedger,
        credit: u64,
        pool: &[u64],
    ) -> u64 {
        seed_hub(ctx, 1).await;
        let accounts = AccountLedger::new(ctx);
        let account = accounts.register(1, "a").await.unwrap();
        accounts.credit_off_chain(1, account.id, credit).await.unwrap();
        let hot = HotWalletPool::new(ctx);
        for value in pool {
            let input = hot.create_input().await.unwrap();
            ledger.deposit(&input.address, *value);
        }
        account.id
    }

    #[tokio::test]
    async fn test_withdraw_with_minted_remainder() {
        let (ctx, ledger) = context();
        let id = funded_account(&ctx, &ledger, 1000, &[1000]).await;

        let withdrawal = WithdrawalProcessor::new(&ctx)
            .withdraw(1, id, &WithdrawRequest::new(DESTINATION, 400))
            .await
            .unwrap();

        assert_eq!(withdrawal.credit, 600);
        assert_eq!(withdrawal.remainder, 600);
        assert_eq!(withdrawal.replenished, 0);
        assert_eq!(ledger.balance(DESTINATION), 400);

        let remainder_address = withdrawal.remainder_address.unwrap();
        assert_eq!(ledger.balance(&remainder_address), 600);
        let pool = HotWalletPool::new(&ctx).inputs().await.unwrap();
        assert_eq!(pool.len(), 1);
        assert_eq!(pool[0].address, remainder_address);
        assert_eq!(pool[0].value, 600);
    }

    #[tokio::test]
    async fn test_withdraw_exact_value_replenishes_pool() {
        let (ctx, ledger) = context();
        let id = funded_account(&ctx, &ledger, 500, &[200, 300]).await;

        let withdrawal = WithdrawalProcessor::new(&ctx)
            .withdraw(1, id, &WithdrawRequest::new(DESTINATION, 500))
            .await
            .unwrap();

        assert_eq!(withdrawal.remainder, 0);
        assert_eq!(withdrawal.remainder_address, None);
        assert_eq!(withdrawal.replenished, 2);
        assert_eq!(HotWalletPool::new(&ctx).inputs().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_explicit_remainder_address() {
        let (ctx, ledger) = context();
        let id = funded_account(&ctx, &ledger, 1000, &[1000]).await;
        let change = "C".repeat(81);

        let withdrawal = WithdrawalProcessor::new(&ctx)
            .withdraw(
                1,
                id,
                &WithdrawRequest::new(DESTINATION, 100).with_remainder_address(change.clone()),
            )
            .await
            .unwrap();

        assert_eq!(withdrawal.remainder_address.as_deref(), Some(change.as_str()));
        assert_eq!(withdrawal.replenished, 1);
        assert_eq!(ledger.balance(&change), 900);
    }

    #[tokio::test]
    async fn test_insufficient_credit_has_no_side_effects() {
        let (ctx, ledger) = context();
        let id = funded_account(&ctx, &ledger, 100, &[1000]).await;
        let before = HotWalletPool::new(&ctx).inputs().await.unwrap();

        let result = WithdrawalProcessor::new(&ctx)
            .withdraw(1, id, &WithdrawRequest::new(DESTINATION, 400))
            .await;

        assert!(matches!(result, Err(HubError::InsufficientCredit { .. })));
        assert_eq!(HotWalletPool::new(&ctx).inputs().await.unwrap(), before);
        assert!(ledger.submitted().is_empty());
    }

    #[tokio::test]
    async fn test_failed_submission_rolls_back() {
        let (ctx, ledger) = context();
        let id = funded_account(&ctx, &ledger, 1000, &[300, 800]).await;
        let mut before = HotWalletPool::new(&ctx).inputs().await.unwrap();
        ledger.fail_transfers(true);

        let result = WithdrawalProcessor::new(&ctx)
            .withdraw(1, id, &WithdrawRequest::new(DESTINATION, 1000))
            .await;

        assert!(matches!(result, Err(HubError::TransferFailed(_))));
        assert_eq!(
            AccountLedger::new(&ctx).credit_of(1, id).await.unwrap(),
            1000
        );
        let mut after = HotWalletPool::new(&ctx).inputs().await.unwrap();
        before.sort_by_key(|i| i.key_index);
        after.sort_by_key(|i| i.key_index);
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_unknown_outcome_keeps_debit_and_inputs() {
        let (ctx, ledger) = context();
        let id = funded_account(&ctx, &ledger, 1000, &[1000]).await;
        let spent = HotWalletPool::new(&ctx).inputs().await.unwrap();
        ledger.fail_transfers_ambiguously(true);

        let result = WithdrawalProcessor::new(&ctx)
            .withdraw(1, id, &WithdrawRequest::new(DESTINATION, 400))
            .await;

        assert!(matches!(result, Err(HubError::TransferOutcomeUnknown(_))));
        assert_eq!(ledger.submitted().len(), 1);
        assert_eq!(
            AccountLedger::new(&ctx).credit_of(1, id).await.unwrap(),
            600
        );
        let pool = HotWalletPool::new(&ctx);
        assert!(pool.inputs().await.unwrap().is_empty());
        assert!(pool.is_locked(&spent[0].address).await.unwrap());

        let unsettled: Vec<UnsettledWithdrawal> =
            lrange_json(ctx.store(), &keys::unsettled_withdrawals(1), 0, -1)
                .await
                .unwrap();
        assert_eq!(unsettled.len(), 1);
        assert_eq!(unsettled[0].value, 400);
        assert_eq!(unsettled[0].inputs[0].address, spent[0].address);
        assert!(unsettled[0].remainder_input.is_some());
    }

    #[tokio::test]
    async fn test_spent_destination_is_refused() {
        let (ctx, ledger) = context();
        let id = funded_account(&ctx, &ledger, 1000, &[1000]).await;
        ledger.mark_spent(DESTINATION);

        let result = WithdrawalProcessor::new(&ctx)
            .withdraw(1, id, &WithdrawRequest::new(DESTINATION, 10))
            .await;
        assert!(matches!(result, Err(HubError::AddressAlreadySpent(_))));

        let result = WithdrawalProcessor::new(&ctx)
            .withdraw(1, id, &WithdrawRequest::new(DESTINATION, 10).skip_address_check())
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_validation() {
        let (ctx, ledger) = context();
        let id = funded_account(&ctx, &ledger, 1000, &[1000]).await;
        let processor = WithdrawalProcessor::new(&ctx);

        assert!(matches!(
            processor.withdraw(1, id, &WithdrawRequest::new("bad", 10)).await,
            Err(HubError::InvalidAddress(_))
        ));
        assert!(matches!(
            processor.withdraw(1, id, &WithdrawRequest::new(DESTINATION, 0)).await,
            Err(HubError::InvalidValue(_))
        ));
        assert!(matches!(
            processor.withdraw(2, id, &WithdrawRequest::new(DESTINATION, 10)).await,
            Err(HubError::NotAttached(2))
        ));
    }
}
