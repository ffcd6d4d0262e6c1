//! Sweeping detected deposits into the hot wallet.

use serde::Serialize;
use tracing::{error, info, warn};

use super::{
    account::AccountLedger, address::AddressAllocator, context::HubContext,
    hot_wallet::HotWalletPool,
};
use crate::events::HubEvent;
use crate::ledger::{Transfer, TransferInput, TransferOptions};
use crate::store::{keys, rpush_json};
use crate::types::{Hub, Sweep, SweepCandidate};

/// Outcome of sweeping one scan's deposits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Hot-wallet address the deposits were sent to.
    pub destination: Option<String>,
    pub batches: usize,
    /// Batches recorded as failing. Their deposit addresses stay locked.
    pub failed_batches: usize,
    /// Failed batches the ledger may still have applied.
    pub ambiguous_batches: usize,
    /// Deposits submitted successfully.
    pub swept: usize,
    pub value: u64,
    /// No destination input could be obtained; nothing was submitted.
    pub aborted: bool,
}

impl SweepReport {
    pub fn is_success(&self) -> bool {
        !self.aborted && self.failed_batches == 0
    }
}

/// Moves deposit balances into the hot wallet for one hub.
pub struct SweepExecutor<'a> {
    ctx: &'a HubContext,
}

impl<'a> SweepExecutor<'a> {
    pub fn new(ctx: &'a HubContext) -> Self {
        Self { ctx }
    }

    /// Sweep `candidates` into a hot-wallet input taken from the back of the
    /// pool, one transfer per sub-batch.
    pub async fn sweep(&self, hub: &Hub, candidates: &[SweepCandidate]) -> SweepReport {
        let mut report = SweepReport::default();
        if candidates.is_empty() {
            return report;
        }

        let pool = HotWalletPool::new(self.ctx);
        let mut destination = match pool.take_back().await {
            Ok(Some(input)) => input,
            Ok(None) => {
                error!("Hot-wallet pool is empty, cannot sweep hub #{}", hub.id);
                self.release(hub, candidates).await;
                report.aborted = true;
                return report;
            }
            Err(e) => {
                error!("Could not take a hot-wallet input for hub #{}: {}", hub.id, e);
                self.release(hub, candidates).await;
                report.aborted = true;
                return report;
            }
        };

        if let Err(e) = pool.lock(&destination.address).await {
            error!(
                "Could not lock hot-wallet input {} for hub #{}: {}",
                destination.address, hub.id, e
            );
            if let Err(e) = pool.restore_back(&destination).await {
                error!(
                    "Lost hot-wallet input {} (key-index {}): {}",
                    destination.address, destination.key_index, e
                );
            }
            self.release(hub, candidates).await;
            report.aborted = true;
            return report;
        }
        report.destination = Some(destination.address.clone());

        let store = self.ctx.store();
        for batch in candidates.chunks(self.ctx.limits().sweep_batch_size) {
            report.batches += 1;
            let value: u64 = batch.iter().map(|c| c.value).sum();
            let options = TransferOptions {
                inputs: batch
                    .iter()
                    .map(|c| TransferInput {
                        address: c.address.clone(),
                        key_index: c.key_index,
                        security: hub.security,
                        value: c.value,
                    })
                    .collect(),
                remainder_address: None,
            };
            let transfer = Transfer::new(destination.address.clone(), value);

            match self
                .ctx
                .ledger
                .send_transfer(&hub.seed, std::slice::from_ref(&transfer), &options)
                .await
            {
                Ok(handle) => {
                    for candidate in batch {
                        let sweep = Sweep::from_candidate(
                            candidate,
                            &destination.address,
                            Some(handle.hash.clone()),
                        );
                        let recorded =
                            rpush_json(store, &keys::pending_sweeps(hub.id), &sweep).await;
                        if let Err(e) = recorded {
                            error!(
                                "Sweep of {} (tx {}) submitted but not recorded as pending: {}",
                                sweep.address, handle.hash, e
                            );
                        }
                        self.ctx
                            .events
                            .emit(HubEvent::sweep(hub.id, &sweep, &handle.hash));
                    }
                    destination.value = destination.value.saturating_add(value);
                    report.swept += batch.len();
                    report.value += value;
                    info!(
                        "Swept {} deposits worth {} of hub #{} to {} (tx {})",
                        batch.len(),
                        value,
                        hub.id,
                        destination.address,
                        handle.hash
                    );
                }
                Err(e) => {
                    if e.is_ambiguous() {
                        report.ambiguous_batches += 1;
                        error!(
                            "Sweep of {} deposits worth {} of hub #{} to {} may have been applied: {}",
                            batch.len(),
                            value,
                            hub.id,
                            destination.address,
                            e
                        );
                    } else {
                        warn!(
                            "Sweep of {} deposits worth {} of hub #{} failed: {}",
                            batch.len(),
                            value,
                            hub.id,
                            e
                        );
                    }
                    report.failed_batches += 1;
                    for candidate in batch {
                        let sweep = Sweep::from_candidate(candidate, &destination.address, None);
                        let recorded =
                            rpush_json(store, &keys::failing_sweeps(hub.id), &sweep).await;
                        if let Err(e) = recorded {
                            warn!("Could not record failing sweep of {}: {}", sweep.address, e);
                        }
                    }
                }
            }
        }

        // Nothing in flight targets the input.
        if report.swept == 0 && report.ambiguous_batches == 0 {
            if let Err(e) = pool.unlock(&destination.address).await {
                warn!("Could not unlock hot-wallet input {}: {}", destination.address, e);
            }
        }

        if let Err(e) = pool.restore_front(&destination).await {
            error!(
                "Lost hot-wallet input {} (key-index {}) holding {}: {}",
                destination.address, destination.key_index, destination.value, e
            );
        }

        report
    }

    /// Hand deposits back to the used-address scan. Only valid when no
    /// transfer spending them was attempted.
    async fn release(&self, hub: &Hub, candidates: &[SweepCandidate]) {
        let addresses = AddressAllocator::new(self.ctx);
        let accounts = AccountLedger::new(self.ctx);
        for candidate in candidates {
            if let Err(e) = addresses
                .set_used_lock(
                    hub.id,
                    candidate.account,
                    candidate.index,
                    &candidate.address,
                    false,
                )
                .await
            {
                warn!("Could not unlock deposit address {}: {}", candidate.address, e);
            }
            if let Ok(delta) = i64::try_from(candidate.value) {
                accounts
                    .adjust_balance_on_tangle(hub.id, candidate.account, -delta)
                    .await;
            }
        }
    }
}
