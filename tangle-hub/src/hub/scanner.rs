//! Deposit detection.

use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::{
    account::AccountLedger,
    address::AddressAllocator,
    context::HubContext,
    flags,
    sweep::{SweepExecutor, SweepReport},
};
use crate::error::{HubError, LedgerClientError, Result};
use crate::events::HubEvent;
use crate::store::keys;
use crate::types::{AddressEntry, Hub, ScanKind, SweepCandidate};

/// Outcome of one `process` cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    pub kind: ScanKind,
    /// Another cycle held the flag; nothing was scanned.
    pub skipped: bool,
    pub scanned: usize,
    /// Entries that could not be parsed.
    pub malformed: usize,
    /// Addresses whose balance could not be determined.
    pub undetermined: usize,
    pub deposits: usize,
    pub value: u64,
    pub sweep: Option<SweepReport>,
}

impl ScanReport {
    fn new(kind: ScanKind) -> Self {
        Self {
            kind,
            skipped: false,
            scanned: 0,
            malformed: 0,
            undetermined: 0,
            deposits: 0,
            value: 0,
            sweep: None,
        }
    }

    fn skipped(kind: ScanKind) -> Self {
        Self {
            skipped: true,
            ..Self::new(kind)
        }
    }

    pub fn is_success(&self) -> bool {
        self.undetermined == 0 && self.sweep.as_ref().map_or(true, SweepReport::is_success)
    }
}

/// Runs `process` cycles: balance queries over one address collection,
/// followed by a sweep of whatever was found.
pub struct DepositScanner<'a> {
    ctx: &'a HubContext,
}

impl<'a> DepositScanner<'a> {
    pub fn new(ctx: &'a HubContext) -> Self {
        Self { ctx }
    }

    /// Scan the `kind` collection of `hub` under its process flag.
    pub async fn scan(&self, hub: &Hub, kind: ScanKind) -> Result<ScanReport> {
        let flag = keys::processing_flag(hub.id, kind);
        match flags::guarded(self.ctx.store(), &flag, self.scan_body(hub, kind)).await? {
            Some(report) => report,
            None => Ok(ScanReport::skipped(kind)),
        }
    }

    async fn scan_body(&self, hub: &Hub, kind: ScanKind) -> Result<ScanReport> {
        let mut report = ScanReport::new(kind);

        let raw = self
            .ctx
            .store()
            .hget_all(&keys::addresses(hub.id, kind))
            .await?;

        let mut entries = Vec::with_capacity(raw.len());
        for (field, value) in &raw {
            match AddressEntry::parse(field, value) {
                Some(entry) => entries.push(entry),
                None => {
                    warn!(
                        "Skipping malformed {} address entry {} => {} of hub #{}",
                        kind, field, value, hub.id
                    );
                    report.malformed += 1;
                }
            }
        }
        report.scanned = entries.len();
        if entries.is_empty() {
            return Ok(report);
        }

        let addresses: Vec<String> = entries.iter().map(|e| e.address.clone()).collect();
        let balances = self.balances(&addresses).await?;

        let allocator = AddressAllocator::new(self.ctx);
        let accounts = AccountLedger::new(self.ctx);
        let mut candidates = Vec::new();

        for (entry, balance) in entries.iter().zip(balances) {
            let value = match balance {
                Some(0) => continue,
                Some(value) => value,
                None => {
                    report.undetermined += 1;
                    continue;
                }
            };
            if entry.locked {
                debug!("Address {} is being swept, skipping", entry.address);
                continue;
            }
            let delta = match i64::try_from(value) {
                Ok(delta) => delta,
                Err(_) => {
                    warn!("Balance {} of {} is out of range", value, entry.address);
                    report.undetermined += 1;
                    continue;
                }
            };

            let key_index = allocator.key_index(entry.account, entry.index);
            info!(
                "Deposit of {} to {} (account #{}, hub #{})",
                value, entry.address, entry.account, hub.id
            );

            accounts
                .adjust_balance_on_tangle(hub.id, entry.account, delta)
                .await;
            candidates.push(SweepCandidate {
                address: entry.address.clone(),
                index: entry.index,
                key_index,
                value,
                account: entry.account,
            });
            self.ctx.events.emit(HubEvent::Deposit {
                hub: hub.id,
                account: entry.account,
                address: entry.address.clone(),
                key_index,
                value,
            });

            let locked = match kind {
                ScanKind::Unused => {
                    allocator
                        .move_to_used(hub.id, entry.account, entry.index, &entry.address, true)
                        .await
                }
                ScanKind::Used => {
                    allocator
                        .set_used_lock(hub.id, entry.account, entry.index, &entry.address, true)
                        .await
                }
            };
            if let Err(e) = locked {
                warn!("Could not lock deposit address {}: {}", entry.address, e);
            }

            report.deposits += 1;
            report.value = report.value.saturating_add(value);
        }

        if report.undetermined > 0 {
            warn!(
                "Balances of {} {} addresses of hub #{} are unknown",
                report.undetermined, kind, hub.id
            );
        }

        if !candidates.is_empty() {
            report.sweep = Some(SweepExecutor::new(self.ctx).sweep(hub, &candidates).await);
        }

        info!(
            "Scanned {} {} addresses of hub #{}: {} deposits worth {}",
            report.scanned, kind, hub.id, report.deposits, report.value
        );
        Ok(report)
    }

    /// Balances of `addresses` in order, queried in concurrent batches.
    ///
    /// A failed batch leaves its balances unknown; a batch answering with the
    /// wrong number of balances fails the whole query.
    async fn balances(&self, addresses: &[String]) -> Result<Vec<Option<u64>>> {
        let batches: Vec<&[String]> = addresses
            .chunks(self.ctx.limits().address_batch_size)
            .collect();
        let results = join_all(
            batches
                .iter()
                .map(|batch| self.ctx.ledger.get_balances(batch)),
        )
        .await;

        let mut balances = Vec::with_capacity(addresses.len());
        for (batch, result) in batches.iter().zip(results) {
            match result {
                Ok(values) if values.len() == batch.len() => {
                    balances.extend(values.into_iter().map(Some));
                }
                Ok(values) => {
                    return Err(HubError::Ledger(LedgerClientError::MalformedResponse(
                        format!("asked for {} balances, got {}", batch.len(), values.len()),
                    )));
                }
                Err(e) => {
                    warn!("Balance query for {} addresses failed: {}", batch.len(), e);
                    balances.extend(std::iter::repeat(None).take(batch.len()));
                }
            }
        }
        Ok(balances)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::account::AccountLedger;
    use crate::hub::hot_wallet::HotWalletPool;
    use crate::hub::tests::{context, seed_hub};
    use crate::store::Store;
    use crate::types::{entry_field, entry_value};

    #[tokio::test]
    async fn test_scan_detects_and_moves_deposit() {
        let (ctx, ledger) = context();
        let hub = seed_hub(&ctx, 1).await;
        HotWalletPool::new(&ctx).create_input().await.unwrap();
        let account = AccountLedger::new(&ctx).register(1, "a").await.unwrap();
        let allocator = AddressAllocator::new(&ctx);
        let (_, funded) = allocator.allocate(&hub, account.id).await.unwrap();
        allocator.allocate(&hub, account.id).await.unwrap();
        ledger.deposit(&funded, 1000);
        let mut events = ctx.events.subscribe();

        let report = DepositScanner::new(&ctx)
            .scan(&hub, ScanKind::Unused)
            .await
            .unwrap();

        assert!(report.is_success());
        assert_eq!(report.scanned, 2);
        assert_eq!(report.deposits, 1);
        assert_eq!(report.value, 1000);
        assert_eq!(events.recv().await.unwrap().name(), "deposit");

        let store = ctx.store();
        let field = entry_field(account.id, 0);
        assert!(store
            .hget(&keys::addresses(1, ScanKind::Unused), &field)
            .await
            .unwrap()
            .is_none());
        assert_eq!(
            store
                .hget(&keys::addresses(1, ScanKind::Used), &field)
                .await
                .unwrap(),
            Some(entry_value(true, &funded))
        );
        assert_eq!(
            AccountLedger::new(&ctx)
                .balance_on_tangle(1, account.id)
                .await
                .unwrap(),
            1000
        );
    }

    #[tokio::test]
    async fn test_scan_skips_locked_entries() {
        let (ctx, ledger) = context();
        let hub = seed_hub(&ctx, 1).await;
        let address = ledger.address_for(&hub.seed, 5, hub.security);
        ledger.deposit(&address, 10);
        ctx.store()
            .hset(
                &keys::addresses(1, ScanKind::Used),
                "1_0",
                entry_value(true, &address),
            )
            .await
            .unwrap();

        let report = DepositScanner::new(&ctx)
            .scan(&hub, ScanKind::Used)
            .await
            .unwrap();

        assert_eq!(report.deposits, 0);
        assert!(report.sweep.is_none());
    }

    #[tokio::test]
    async fn test_scan_with_flag_set_is_noop() {
        let (ctx, ledger) = context();
        let hub = seed_hub(&ctx, 1).await;
        ctx.store()
            .set(&keys::processing_flag(1, ScanKind::Unused), "true".into())
            .await
            .unwrap();

        let report = DepositScanner::new(&ctx)
            .scan(&hub, ScanKind::Unused)
            .await
            .unwrap();

        assert!(report.skipped);
        assert!(report.is_success());
        assert_eq!(ledger.balance_queries(), 0);
    }

    #[tokio::test]
    async fn test_failed_balance_query_marks_scan_failed() {
        let (ctx, ledger) = context();
        let hub = seed_hub(&ctx, 1).await;
        let account = AccountLedger::new(&ctx).register(1, "a").await.unwrap();
        AddressAllocator::new(&ctx)
            .allocate(&hub, account.id)
            .await
            .unwrap();
        ledger.fail_balances(true);

        let report = DepositScanner::new(&ctx)
            .scan(&hub, ScanKind::Unused)
            .await
            .unwrap();

        assert_eq!(report.undetermined, 1);
        assert!(!report.is_success());
        assert!(!flags::is_set(ctx.store(), &keys::processing_flag(1, ScanKind::Unused))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_malformed_entries_are_skipped() {
        let (ctx, _ledger) = context();
        let hub = seed_hub(&ctx, 1).await;
        ctx.store()
            .hset(&keys::addresses(1, ScanKind::Unused), "garbage", "x".into())
            .await
            .unwrap();

        let report = DepositScanner::new(&ctx)
            .scan(&hub, ScanKind::Unused)
            .await
            .unwrap();

        assert_eq!(report.malformed, 1);
        assert_eq!(report.scanned, 0);
    }
}
