//! The hot-wallet input pool.
//!
//! Inputs are spendable hot-wallet addresses kept in a single list. Sweeps
//! take their destination from the back and return it to the front; withdrawals
//! collect from the front and send zero-balance inputs to the back. An input
//! that is the destination of an unconfirmed sweep is marked in the lock hash
//! and skipped by withdrawals.

use std::collections::HashSet;
use tracing::{debug, error, info, warn};

use super::context::HubContext;
use crate::error::{HubError, Result};
use crate::store::{keys, lpop_json, lpush_json, lrange_json, rpop_json, rpush_json};
use crate::types::HotWalletInput;

/// Inputs gathered for a withdrawal.
#[derive(Debug, Clone, Default)]
pub struct CollectedInputs {
    /// Inputs with their current confirmed balance as value.
    pub inputs: Vec<HotWalletInput>,
    pub total: u64,
    /// The same inputs as they were stored in the pool.
    pub(crate) originals: Vec<HotWalletInput>,
}

/// View of the hot-wallet input list and its lock hash.
pub struct HotWalletPool<'a> {
    ctx: &'a HubContext,
}

impl<'a> HotWalletPool<'a> {
    pub fn new(ctx: &'a HubContext) -> Self {
        Self { ctx }
    }

    /// All inputs, front first.
    pub async fn inputs(&self) -> Result<Vec<HotWalletInput>> {
        Ok(lrange_json(self.ctx.store(), keys::HOT_WALLET_INPUTS, 0, -1).await?)
    }

    pub(crate) async fn take_front(&self) -> Result<Option<HotWalletInput>> {
        Ok(lpop_json(self.ctx.store(), keys::HOT_WALLET_INPUTS).await?)
    }

    pub(crate) async fn take_back(&self) -> Result<Option<HotWalletInput>> {
        Ok(rpop_json(self.ctx.store(), keys::HOT_WALLET_INPUTS).await?)
    }

    pub(crate) async fn restore_front(&self, input: &HotWalletInput) -> Result<()> {
        lpush_json(self.ctx.store(), keys::HOT_WALLET_INPUTS, input).await?;
        Ok(())
    }

    pub(crate) async fn restore_back(&self, input: &HotWalletInput) -> Result<()> {
        rpush_json(self.ctx.store(), keys::HOT_WALLET_INPUTS, input).await?;
        Ok(())
    }

    /// Put `inputs` back at the front, keeping their order.
    pub(crate) async fn restore_all_front(&self, inputs: &[HotWalletInput]) {
        for input in inputs.iter().rev() {
            if let Err(e) = self.restore_front(input).await {
                error!(
                    "Lost hot-wallet input {} (key-index {}) while restoring the pool: {}",
                    input.address, input.key_index, e
                );
            }
        }
    }

    pub(crate) async fn lock(&self, address: &str) -> Result<()> {
        self.ctx
            .store()
            .hset(keys::HOT_WALLET_LOCKED_INPUTS, address, keys::LOCKED.to_string())
            .await?;
        Ok(())
    }

    pub(crate) async fn unlock(&self, address: &str) -> Result<()> {
        self.ctx
            .store()
            .hset(keys::HOT_WALLET_LOCKED_INPUTS, address, keys::UNLOCKED.to_string())
            .await?;
        Ok(())
    }

    pub async fn is_locked(&self, address: &str) -> Result<bool> {
        Ok(self
            .ctx
            .store()
            .hget(keys::HOT_WALLET_LOCKED_INPUTS, address)
            .await?
            .as_deref()
            == Some(keys::LOCKED))
    }

    /// Derive a fresh hot-wallet input without adding it to the pool.
    pub(crate) async fn new_input(&self) -> Result<HotWalletInput> {
        let key_index = self.ctx.store().incr(keys::HOT_WALLET_INDEX).await? as u64;
        let address = self
            .ctx
            .ledger
            .derive_address(
                &self.ctx.config.hot_wallet_seed,
                key_index,
                self.ctx.config.hot_wallet_security,
            )
            .await?;

        Ok(HotWalletInput {
            address,
            key_index,
            value: 0,
        })
    }

    /// Derive a fresh input and append it to the pool.
    pub async fn create_input(&self) -> Result<HotWalletInput> {
        let input = self.new_input().await?;
        self.restore_back(&input).await?;
        info!(
            "Added hot-wallet input {} (key-index {})",
            input.address, input.key_index
        );
        Ok(input)
    }

    /// Pop inputs from the front until their confirmed balance covers `value`.
    ///
    /// Locked inputs and inputs whose balance cannot be read are set aside and
    /// returned to the front afterwards. Zero-balance inputs go to the back;
    /// meeting one a second time means the pool has nothing more to offer.
    /// When the pool runs out every collected input is returned as well.
    pub(crate) async fn collect(&self, value: u64) -> Result<CollectedInputs> {
        let mut collected = CollectedInputs::default();
        let mut set_aside = Vec::new();
        let mut empty_seen = HashSet::new();
        let mut popped_any = false;

        while collected.total < value {
            let mut input = match self.take_front().await {
                Ok(Some(input)) => input,
                Ok(None) => break,
                Err(e) => {
                    warn!("Could not pop hot-wallet input: {}", e);
                    break;
                }
            };
            popped_any = true;

            match self.is_locked(&input.address).await {
                Ok(false) => {}
                Ok(true) => {
                    debug!("Skipping locked hot-wallet input {}", input.address);
                    set_aside.push(input);
                    continue;
                }
                Err(e) => {
                    warn!("Could not read lock of {}: {}", input.address, e);
                    set_aside.push(input);
                    continue;
                }
            }

            let balance = match self
                .ctx
                .ledger
                .get_balances(std::slice::from_ref(&input.address))
                .await
            {
                Ok(balances) if balances.len() == 1 => balances[0],
                Ok(balances) => {
                    warn!(
                        "Expected one balance for {}, got {}",
                        input.address,
                        balances.len()
                    );
                    set_aside.push(input);
                    continue;
                }
                Err(e) => {
                    warn!("Could not read balance of {}: {}", input.address, e);
                    set_aside.push(input);
                    continue;
                }
            };

            if balance == 0 {
                let seen_before = !empty_seen.insert(input.address.clone());
                if let Err(e) = self.restore_back(&input).await {
                    error!(
                        "Lost hot-wallet input {} (key-index {}): {}",
                        input.address, input.key_index, e
                    );
                }
                if seen_before {
                    break;
                }
                continue;
            }

            collected.originals.push(input.clone());
            input.value = balance;
            collected.total = collected.total.saturating_add(balance);
            collected.inputs.push(input);
        }

        self.restore_all_front(&set_aside).await;

        if collected.total < value {
            self.restore_all_front(&collected.originals).await;
            if !popped_any {
                return Err(HubError::EmptyHotWalletPool);
            }
            return Err(HubError::InsufficientInputs {
                collected: collected.total,
                requested: value,
            });
        }

        debug!(
            "Collected {} hot-wallet inputs worth {} for {}",
            collected.inputs.len(),
            collected.total,
            value
        );
        Ok(collected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::tests::{context, HOT_SEED};
    use crate::ledger::MockLedger;
    use crate::types::SecurityLevel;

    async fn funded(pool: &HotWalletPool<'_>, ledger: &MockLedger, value: u64) -> HotWalletInput {
        let input = pool.create_input().await.unwrap();
        ledger.deposit(&input.address, value);
        input
    }

    #[tokio::test]
    async fn test_create_input_uses_counter() {
        let (ctx, ledger) = context();
        let pool = HotWalletPool::new(&ctx);

        let first = pool.create_input().await.unwrap();
        let second = pool.create_input().await.unwrap();

        assert_eq!(first.key_index, 1);
        assert_eq!(second.key_index, 2);
        assert_eq!(first.address, ledger.address_for(HOT_SEED, 1, SecurityLevel::MEDIUM));
        assert_eq!(pool.inputs().await.unwrap(), vec![first, second]);
    }

    #[tokio::test]
    async fn test_lock_roundtrip() {
        let (ctx, _ledger) = context();
        let pool = HotWalletPool::new(&ctx);

        assert!(!pool.is_locked("ADDR").await.unwrap());
        pool.lock("ADDR").await.unwrap();
        assert!(pool.is_locked("ADDR").await.unwrap());
        pool.unlock("ADDR").await.unwrap();
        assert!(!pool.is_locked("ADDR").await.unwrap());
    }

    #[tokio::test]
    async fn test_collect_skips_locked_and_empty() {
        let (ctx, ledger) = context();
        let pool = HotWalletPool::new(&ctx);
        let locked = funded(&pool, &ledger, 500).await;
        let empty = funded(&pool, &ledger, 0).await;
        let rich = funded(&pool, &ledger, 700).await;
        pool.lock(&locked.address).await.unwrap();

        let collected = pool.collect(600).await.unwrap();

        assert_eq!(collected.total, 700);
        assert_eq!(collected.inputs.len(), 1);
        assert_eq!(collected.inputs[0].address, rich.address);
        assert_eq!(collected.inputs[0].value, 700);

        let remaining: Vec<String> = pool
            .inputs()
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.address)
            .collect();
        assert_eq!(remaining, vec![locked.address, empty.address]);
    }

    #[tokio::test]
    async fn test_collect_exhaustion_restores_pool() {
        let (ctx, ledger) = context();
        let pool = HotWalletPool::new(&ctx);
        funded(&pool, &ledger, 100).await;
        funded(&pool, &ledger, 0).await;
        funded(&pool, &ledger, 200).await;
        let mut before = pool.inputs().await.unwrap();

        let result = pool.collect(1000).await;

        assert!(matches!(
            result,
            Err(HubError::InsufficientInputs {
                collected: 300,
                requested: 1000
            })
        ));
        let mut after = pool.inputs().await.unwrap();
        before.sort_by_key(|i| i.key_index);
        after.sort_by_key(|i| i.key_index);
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_collect_from_empty_pool() {
        let (ctx, _ledger) = context();
        let pool = HotWalletPool::new(&ctx);

        assert!(matches!(
            pool.collect(1).await,
            Err(HubError::EmptyHotWalletPool)
        ));
    }

    #[tokio::test]
    async fn test_collect_keeps_undetermined_inputs() {
        let (ctx, ledger) = context();
        let pool = HotWalletPool::new(&ctx);
        funded(&pool, &ledger, 100).await;
        ledger.fail_balances(true);

        assert!(pool.collect(50).await.is_err());
        assert_eq!(pool.inputs().await.unwrap().len(), 1);
    }
}
