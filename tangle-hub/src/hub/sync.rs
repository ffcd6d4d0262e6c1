//! Confirmation sync: crediting swept deposits exactly once.
//!
//! The pending list is settled head first. The entry being settled must sit
//! right behind the `failed` credited entries whose removal failed earlier in
//! the cycle, so that `ltrim(1 + failed, -1)` removes exactly the settled
//! entries. Entries that cannot be settled yet are rotated to the tail.

use futures::future::join_all;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use tracing::{debug, error, info, warn};

use super::{
    account::AccountLedger, address::AddressAllocator, context::HubContext, flags,
    hot_wallet::HotWalletPool,
};
use crate::error::{HubError, Result};
use crate::store::keys;
use crate::types::{Hub, HubId, Sweep};

/// Outcome of one `sync` cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// Another cycle held the flag; nothing was synced.
    pub skipped: bool,
    pub pending: usize,
    pub confirmed: usize,
    pub credited: u64,
    /// Sweeps whose inclusion state could not be determined.
    pub unresolved: usize,
    pub credit_failures: usize,
    /// Credited sweeps still in the pending list.
    pub failed_removals: usize,
    /// The cycle stopped before visiting every pending sweep.
    pub interrupted: bool,
}

impl SyncReport {
    pub fn is_success(&self) -> bool {
        self.unresolved == 0
            && self.credit_failures == 0
            && self.failed_removals == 0
            && !self.interrupted
    }
}

/// Credits confirmed sweeps and trims them off the pending list.
pub struct SweepSync<'a> {
    ctx: &'a HubContext,
}

/// What happened to the head of the pending list.
enum Settled {
    Removed,
    Rotated,
    Stop,
}

impl<'a> SweepSync<'a> {
    pub fn new(ctx: &'a HubContext) -> Self {
        Self { ctx }
    }

    pub async fn sync(&self, hub: &Hub) -> Result<SyncReport> {
        if self.ctx.is_not_even_with_db(hub.id) {
            error!(
                "Hub #{} has credited sweeps left in its pending list, refusing to sync",
                hub.id
            );
            return Err(HubError::NotEvenWithDb(hub.id));
        }

        let flag = keys::syncing_flag(hub.id);
        let report = match flags::guarded(self.ctx.store(), &flag, self.sync_body(hub)).await? {
            Some(report) => report?,
            None => {
                return Ok(SyncReport {
                    skipped: true,
                    ..Default::default()
                })
            }
        };

        if report.failed_removals > 0 {
            error!(
                "Hub #{} is not even with the database: {} credited sweeps remain pending",
                hub.id, report.failed_removals
            );
            self.ctx.set_not_even_with_db(hub.id, true)?;
        }
        Ok(report)
    }

    async fn sync_body(&self, hub: &Hub) -> Result<SyncReport> {
        let store = self.ctx.store();
        let list = keys::pending_sweeps(hub.id);
        let mut report = SyncReport::default();

        let raw = store.lrange(&list, 0, -1).await?;
        report.pending = raw.len();
        if raw.is_empty() {
            return Ok(report);
        }

        let sweeps: Vec<Option<Sweep>> = raw
            .iter()
            .map(|entry| match serde_json::from_str::<Sweep>(entry) {
                Ok(sweep) => Some(sweep),
                Err(e) => {
                    warn!("Malformed pending sweep in hub #{}: {}", hub.id, e);
                    None
                }
            })
            .collect();
        let states = self.inclusion_states(&sweeps).await;

        let mut failed = 0usize;
        for (entry, sweep) in raw.iter().zip(&sweeps) {
            match store.lrange(&list, failed as i64, failed as i64).await {
                Ok(head) if head.first() == Some(entry) => {}
                Ok(_) => {
                    error!(
                        "Pending sweeps of hub #{} changed during sync, stopping",
                        hub.id
                    );
                    report.interrupted = true;
                    break;
                }
                Err(e) => {
                    warn!("Could not read pending sweeps of hub #{}: {}", hub.id, e);
                    report.interrupted = true;
                    break;
                }
            }

            let confirmed = sweep.as_ref().and_then(|sweep| {
                let tx = sweep.tx.as_ref()?;
                states.get(tx).copied().flatten()
            });

            let outcome = match (sweep, confirmed) {
                (Some(sweep), Some(true)) => {
                    match self.settle(hub, sweep, &list, &mut failed).await {
                        Ok(outcome) => {
                            report.confirmed += 1;
                            report.credited = report.credited.saturating_add(sweep.value);
                            outcome
                        }
                        Err(e) => {
                            warn!(
                                "Could not credit sweep of {} to account #{}: {}",
                                sweep.address, sweep.account, e
                            );
                            report.credit_failures += 1;
                            self.rotate(hub.id, &list, &mut failed).await
                        }
                    }
                }
                (_, state) => {
                    if state.is_none() {
                        report.unresolved += 1;
                    }
                    self.rotate(hub.id, &list, &mut failed).await
                }
            };

            match outcome {
                Settled::Removed | Settled::Rotated => {}
                Settled::Stop => {
                    report.interrupted = true;
                    break;
                }
            }
        }

        report.failed_removals = failed;
        info!(
            "Synced hub #{}: {} of {} pending sweeps confirmed, {} credited",
            hub.id, report.confirmed, report.pending, report.credited
        );
        Ok(report)
    }

    /// Credit a confirmed sweep, release its locks and drop it from the list.
    async fn settle(
        &self,
        hub: &Hub,
        sweep: &Sweep,
        list: &str,
        failed: &mut usize,
    ) -> Result<Settled> {
        AccountLedger::new(self.ctx)
            .settle_sweep(hub.id, sweep.account, sweep.value)
            .await?;
        info!(
            "Credited {} to account #{} of hub #{} (tx {})",
            sweep.value,
            sweep.account,
            hub.id,
            sweep.tx.as_deref().unwrap_or_default()
        );

        if let Err(e) = AddressAllocator::new(self.ctx)
            .set_used_lock(hub.id, sweep.account, sweep.index, &sweep.address, false)
            .await
        {
            warn!("Could not unlock deposit address {}: {}", sweep.address, e);
        }
        if let Err(e) = HotWalletPool::new(self.ctx)
            .unlock(&sweep.destination_address)
            .await
        {
            warn!(
                "Could not unlock hot-wallet input {}: {}",
                sweep.destination_address, e
            );
        }

        match self
            .ctx
            .store()
            .ltrim(list, 1 + *failed as i64, -1)
            .await
        {
            Ok(()) => {
                if *failed > 0 {
                    info!(
                        "Removed {} stale credited sweeps of hub #{}",
                        *failed, hub.id
                    );
                    *failed = 0;
                }
            }
            Err(e) => {
                *failed += 1;
                error!(
                    "Credited sweep of {} is still pending in hub #{}: {}",
                    sweep.address, hub.id, e
                );
            }
        }
        Ok(Settled::Removed)
    }

    /// Move the entry at offset `failed` to the tail.
    async fn rotate(&self, hub: HubId, list: &str, failed: &mut usize) -> Settled {
        let store = self.ctx.store();

        if *failed > 0 {
            // The head is occupied by credited entries; drop them first.
            match store.ltrim(list, *failed as i64, -1).await {
                Ok(()) => {
                    info!("Removed {} stale credited sweeps of hub #{}", *failed, hub);
                    *failed = 0;
                }
                Err(e) => {
                    warn!("Could not remove stale sweeps of hub #{}: {}", hub, e);
                    return Settled::Stop;
                }
            }
        }

        let entry = match store.lpop(list).await {
            Ok(Some(entry)) => entry,
            Ok(None) => return Settled::Stop,
            Err(e) => {
                warn!("Could not rotate pending sweeps of hub #{}: {}", hub, e);
                return Settled::Stop;
            }
        };
        if let Err(e) = store.rpush(list, entry.clone()).await {
            error!(
                "Dropped pending sweep of hub #{} while rotating, restore manually: {} ({})",
                hub, entry, e
            );
            return Settled::Stop;
        }
        debug!("Rotated pending sweep of hub #{}", hub);
        Settled::Rotated
    }

    /// Inclusion state per transaction hash; `None` when unknown.
    async fn inclusion_states(&self, sweeps: &[Option<Sweep>]) -> HashMap<String, Option<bool>> {
        let mut seen = HashSet::new();
        let hashes: Vec<String> = sweeps
            .iter()
            .flatten()
            .filter_map(|sweep| sweep.tx.clone())
            .filter(|tx| seen.insert(tx.clone()))
            .collect();

        let batches: Vec<&[String]> = hashes
            .chunks(self.ctx.limits().inclusion_batch_size)
            .collect();
        let results = join_all(
            batches
                .iter()
                .map(|batch| self.ctx.ledger.get_inclusion_states(batch)),
        )
        .await;

        let mut states = HashMap::with_capacity(hashes.len());
        for (batch, result) in batches.iter().zip(results) {
            match result {
                Ok(values) if values.len() == batch.len() => {
                    for (hash, state) in batch.iter().zip(values) {
                        states.insert(hash.clone(), Some(state));
                    }
                }
                Ok(values) => {
                    warn!(
                        "Asked for {} inclusion states, got {}",
                        batch.len(),
                        values.len()
                    );
                    for hash in batch.iter() {
                        states.insert(hash.clone(), None);
                    }
                }
                Err(e) => {
                    warn!("Inclusion query for {} sweeps failed: {}", batch.len(), e);
                    for hash in batch.iter() {
                        states.insert(hash.clone(), None);
                    }
                }
            }
        }
        states
    }
}
