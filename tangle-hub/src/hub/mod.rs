//! The hub orchestration engine.
//!
//! [`HubEngine`] is the entry point. It owns a [`HubContext`] holding the
//! store, the ledger client, the event bus and the registry of hubs attached
//! to this process, and hands it to the components that do the work:
//!
//! - [`AccountLedger`]: account registration and credit bookkeeping
//! - [`AddressAllocator`]: deposit address issuance
//! - [`HotWalletPool`]: the queue of spendable hot-wallet inputs
//! - [`DepositScanner`]: `process` cycles detecting deposits
//! - [`SweepExecutor`]: moving deposits into the hot wallet
//! - [`SweepSync`]: `sync` cycles crediting confirmed sweeps
//! - [`WithdrawalProcessor`]: withdrawals with rollback

mod account;
mod address;
mod context;
mod flags;
mod hot_wallet;
mod scanner;
mod sweep;
mod sync;
mod withdraw;

pub use account::AccountLedger;
pub use address::AddressAllocator;
pub use context::{EngineConfig, HubContext};
pub use hot_wallet::{CollectedInputs, HotWalletPool};
pub use scanner::{DepositScanner, ScanReport};
pub use sweep::{SweepExecutor, SweepReport};
pub use sync::{SweepSync, SyncReport};
pub use withdraw::{WithdrawRequest, Withdrawal, WithdrawalProcessor};

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

use crate::error::{HubError, Result};
use crate::events::{EventBus, HubEvent};
use crate::ledger::LedgerClient;
use crate::store::{get_json, keys, lrange_json, set_json, Store};
use crate::types::{
    Account, AccountId, HotWalletInput, Hub, HubId, ScanKind, SecurityLevel, Sweep,
    UnsettledWithdrawal,
};

/// Coordinates the hub components over one store and one ledger client.
#[derive(Clone)]
pub struct HubEngine {
    ctx: Arc<HubContext>,
}

impl HubEngine {
    /// Engine with its own event bus. See [`HubEngine::with_events`].
    pub fn new(
        store: Arc<dyn Store>,
        ledger: Arc<dyn LedgerClient>,
        config: EngineConfig,
    ) -> Result<Self> {
        Self::with_events(store, ledger, config, EventBus::default())
    }

    /// Engine publishing to `events`.
    ///
    /// Fails with [`HubError::InvalidSeed`] for a malformed hot-wallet seed and
    /// with [`HubError::InvalidValue`] for unusable limits.
    pub fn with_events(
        store: Arc<dyn Store>,
        ledger: Arc<dyn LedgerClient>,
        config: EngineConfig,
        events: EventBus,
    ) -> Result<Self> {
        if !ledger.is_valid_seed(&config.hot_wallet_seed) {
            return Err(HubError::InvalidSeed);
        }
        config
            .limits
            .validate()
            .map_err(|e| HubError::InvalidValue(e.to_string()))?;
        Ok(Self {
            ctx: Arc::new(HubContext::new(store, ledger, config, events)),
        })
    }

    pub fn context(&self) -> &HubContext {
        &self.ctx
    }

    pub fn events(&self) -> &EventBus {
        &self.ctx.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HubEvent> {
        self.ctx.events.subscribe()
    }

    // Hubs

    /// Persist a new hub with all its process flags cleared.
    pub async fn create(&self, id: HubId, seed: &str, security: u8, name: &str) -> Result<Hub> {
        if !self.ctx.ledger.is_valid_seed(seed) {
            return Err(HubError::InvalidSeed);
        }
        let security = SecurityLevel::try_from(security)?;

        let store = self.ctx.store();
        if store.get(&keys::hub(id)).await?.is_some() {
            return Err(HubError::HubExists(id));
        }

        let hub = Hub {
            id,
            seed: seed.to_string(),
            security,
            name: name.to_string(),
        };
        for key in [
            keys::processing_flag(id, ScanKind::Unused),
            keys::processing_flag(id, ScanKind::Used),
            keys::syncing_flag(id),
        ] {
            flags::reset(store, &key).await?;
        }
        set_json(store, &keys::hub(id), &hub).await?;

        info!("Created hub #{} ({}) with security {}", id, name, security);
        Ok(hub)
    }

    pub async fn find(&self, id: HubId) -> Result<Option<Hub>> {
        Ok(get_json(self.ctx.store(), &keys::hub(id)).await?)
    }

    pub fn attach(&self, hub: Hub) -> Result<()> {
        if !self.ctx.ledger.is_valid_seed(&hub.seed) {
            return Err(HubError::InvalidSeed);
        }
        let id = hub.id;
        self.ctx.attach(hub)?;
        info!("Attached hub #{}", id);
        Ok(())
    }

    pub async fn attach_by_id(&self, id: HubId) -> Result<Hub> {
        let hub = self.find(id).await?.ok_or(HubError::HubNotFound(id))?;
        self.attach(hub.clone())?;
        Ok(hub)
    }

    pub fn detach(&self, id: HubId) -> Result<()> {
        self.ctx.detach(id)?;
        info!("Detached hub #{}", id);
        Ok(())
    }

    pub fn is_attached(&self, id: HubId) -> bool {
        self.ctx.is_attached(id)
    }

    pub fn attached_hubs(&self) -> Vec<HubId> {
        self.ctx.attached_ids()
    }

    // Accounts and addresses

    pub async fn register_account(&self, hub: HubId, name: &str) -> Result<Account> {
        AccountLedger::new(&self.ctx).register(hub, name).await
    }

    pub async fn get_new_deposit_address(&self, hub: HubId, account: AccountId) -> Result<String> {
        let hub = self.ctx.load_hub(hub).await?;
        let (_, address) = AddressAllocator::new(&self.ctx)
            .allocate(&hub, account)
            .await?;
        Ok(address)
    }

    /// Address issued at `index`, or the latest one when `index` is `None`.
    pub async fn get_deposit_address(
        &self,
        hub: HubId,
        account: AccountId,
        index: Option<u64>,
    ) -> Result<String> {
        AddressAllocator::new(&self.ctx)
            .last_address(hub, account, index)
            .await
    }

    pub async fn get_account(&self, hub: HubId, account: AccountId) -> Result<Account> {
        AccountLedger::new(&self.ctx).get(hub, account).await
    }

    pub async fn get_credit(&self, hub: HubId, account: AccountId) -> Result<i64> {
        AccountLedger::new(&self.ctx).credit_of(hub, account).await
    }

    pub async fn get_balance_on_tangle(&self, hub: HubId, account: AccountId) -> Result<i64> {
        AccountLedger::new(&self.ctx)
            .balance_on_tangle(hub, account)
            .await
    }

    pub async fn has_credit(&self, hub: HubId, account: AccountId, value: u64) -> Result<bool> {
        AccountLedger::new(&self.ctx)
            .has_credit(hub, account, value)
            .await
    }

    /// Operator credit outside the ledger.
    pub async fn credit(&self, hub: HubId, account: AccountId, value: u64) -> Result<i64> {
        AccountLedger::new(&self.ctx)
            .credit_off_chain(hub, account, value)
            .await
    }

    // Cycles

    /// Scan the unused deposit addresses of an attached hub.
    pub async fn process(&self, hub: HubId) -> Result<ScanReport> {
        let hub = self.ctx.attached_hub(hub)?;
        DepositScanner::new(&self.ctx)
            .scan(&hub, ScanKind::Unused)
            .await
    }

    /// Scan the addresses that already received a deposit.
    pub async fn process_used(&self, hub: HubId) -> Result<ScanReport> {
        let hub = self.ctx.attached_hub(hub)?;
        DepositScanner::new(&self.ctx)
            .scan(&hub, ScanKind::Used)
            .await
    }

    pub async fn sync(&self, hub: HubId) -> Result<SyncReport> {
        let hub = self.ctx.attached_hub(hub)?;
        SweepSync::new(&self.ctx).sync(&hub).await
    }

    pub async fn withdraw(
        &self,
        hub: HubId,
        account: AccountId,
        request: &WithdrawRequest,
    ) -> Result<Withdrawal> {
        WithdrawalProcessor::new(&self.ctx)
            .withdraw(hub, account, request)
            .await
    }

    // Operator tools

    pub async fn reset_process_flag(&self, hub: HubId, kind: ScanKind) -> Result<()> {
        flags::reset(self.ctx.store(), &keys::processing_flag(hub, kind)).await?;
        info!("Reset {} process flag of hub #{}", kind, hub);
        Ok(())
    }

    pub async fn reset_sync_flag(&self, hub: HubId) -> Result<()> {
        flags::reset(self.ctx.store(), &keys::syncing_flag(hub)).await?;
        info!("Reset sync flag of hub #{}", hub);
        Ok(())
    }

    /// Clear the inconsistency flag once the pending sweeps were reconciled.
    pub fn mark_reconciled(&self, hub: HubId) -> Result<()> {
        self.ctx.set_not_even_with_db(hub, false)?;
        info!("Hub #{} marked as reconciled", hub);
        Ok(())
    }

    pub fn is_not_even_with_db(&self, hub: HubId) -> bool {
        self.ctx.is_not_even_with_db(hub)
    }

    pub async fn create_hot_wallet_input(&self) -> Result<HotWalletInput> {
        HotWalletPool::new(&self.ctx).create_input().await
    }

    pub async fn hot_wallet_inputs(&self) -> Result<Vec<HotWalletInput>> {
        HotWalletPool::new(&self.ctx).inputs().await
    }

    /// Whether `address` has been spent from and must not receive value again.
    pub async fn is_used(&self, address: &str) -> Result<bool> {
        if !self.ctx.ledger.is_valid_address(address) {
            return Err(HubError::InvalidAddress(address.to_string()));
        }
        Ok(self.ctx.ledger.was_spent_from(address).await?)
    }

    pub fn is_valid_address(&self, address: &str) -> bool {
        self.ctx.ledger.is_valid_address(address)
    }

    pub async fn pending_sweeps(&self, hub: HubId) -> Result<Vec<Sweep>> {
        Ok(lrange_json(self.ctx.store(), &keys::pending_sweeps(hub), 0, -1).await?)
    }

    pub async fn failing_sweeps(&self, hub: HubId) -> Result<Vec<Sweep>> {
        Ok(lrange_json(self.ctx.store(), &keys::failing_sweeps(hub), 0, -1).await?)
    }

    /// Withdrawals whose transfer may or may not have reached the ledger.
    pub async fn unsettled_withdrawals(&self, hub: HubId) -> Result<Vec<UnsettledWithdrawal>> {
        Ok(lrange_json(self.ctx.store(), &keys::unsettled_withdrawals(hub), 0, -1).await?)
    }
}
