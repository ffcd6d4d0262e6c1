//! End-to-end scenarios driving the engine with the in-memory store and the
//! mock ledger.

use std::collections::HashSet;
use std::sync::Arc;

use tangle_hub::{
    config::EngineLimits,
    hub::{EngineConfig, HubEngine, WithdrawRequest},
    ledger::MockLedger,
    store::{keys, MemoryStore, Store, StoreOp},
    types::{entry_field, entry_value, ScanKind, SecurityLevel},
    HubError,
};

const HOT_SEED: &str = "HOTWALLET9SEED";
const HUB_SEED: &str = "CUSTOMER9DEPOSITS9SEED";

struct Harness {
    engine: HubEngine,
    store: Arc<MemoryStore>,
    ledger: Arc<MockLedger>,
}

fn harness_with(store: MemoryStore, limits: EngineLimits) -> Harness {
    let store = Arc::new(store);
    let ledger = Arc::new(MockLedger::new());
    let config = EngineConfig {
        hot_wallet_seed: HOT_SEED.to_string(),
        hot_wallet_security: SecurityLevel::MEDIUM,
        limits,
    };
    let engine = HubEngine::new(store.clone(), ledger.clone(), config).unwrap();
    Harness {
        engine,
        store,
        ledger,
    }
}

fn harness() -> Harness {
    harness_with(MemoryStore::new(), EngineLimits::default())
}

fn destination() -> String {
    "D".repeat(81)
}

/// Hub #1 with one account, one deposit address and one empty hot-wallet input.
async fn setup(h: &Harness) -> (u64, String) {
    h.engine.create(1, HUB_SEED, 2, "main").await.unwrap();
    h.engine.attach_by_id(1).await.unwrap();
    h.engine.create_hot_wallet_input().await.unwrap();
    let account = h.engine.register_account(1, "alice").await.unwrap();
    let address = h.engine.get_new_deposit_address(1, account.id).await.unwrap();
    (account.id, address)
}

/// Deposit `value`, sweep it and credit it.
async fn fund(h: &Harness, address: &str, value: u64) {
    h.ledger.deposit(address, value);
    let scan = h.engine.process(1).await.unwrap();
    assert!(scan.is_success());
    h.ledger.confirm_all();
    let sync = h.engine.sync(1).await.unwrap();
    assert!(sync.is_success());
}

async fn pool_addresses(h: &Harness) -> HashSet<String> {
    h.engine
        .hot_wallet_inputs()
        .await
        .unwrap()
        .into_iter()
        .map(|input| input.address)
        .collect()
}

#[tokio::test]
async fn test_create_find_and_duplicate_hub() {
    let h = harness();

    let hub = h.engine.create(7, HUB_SEED, 3, "cold").await.unwrap();
    assert_eq!(hub.security, SecurityLevel::HIGH);
    assert_eq!(h.engine.find(7).await.unwrap(), Some(hub));

    let duplicate = h.engine.create(7, HUB_SEED, 2, "again").await;
    assert!(matches!(duplicate, Err(HubError::HubExists(7))));
}

#[tokio::test]
async fn test_addresses_follow_account_key_indices() {
    let h = harness();
    h.engine.create(1, HUB_SEED, 2, "main").await.unwrap();
    let account = h.engine.register_account(1, "alice").await.unwrap();

    let mut issued = Vec::new();
    for _ in 0..3 {
        issued.push(h.engine.get_new_deposit_address(1, account.id).await.unwrap());
    }

    let max = EngineLimits::default().max_addresses;
    for (index, address) in issued.iter().enumerate() {
        let index = index as u64;
        let expected =
            h.ledger
                .address_for(HUB_SEED, account.id * max + index, SecurityLevel::MEDIUM);
        assert_eq!(address, &expected);
        assert_eq!(
            &h.engine
                .get_deposit_address(1, account.id, Some(index))
                .await
                .unwrap(),
            address
        );
    }
    assert_eq!(
        h.engine.get_deposit_address(1, account.id, None).await.unwrap(),
        issued[2]
    );
}

#[tokio::test]
async fn test_address_space_exhausted() {
    let h = harness_with(
        MemoryStore::new(),
        EngineLimits {
            max_addresses: 2,
            ..EngineLimits::default()
        },
    );
    h.engine.create(1, HUB_SEED, 2, "main").await.unwrap();
    let account = h.engine.register_account(1, "alice").await.unwrap();

    h.engine.get_new_deposit_address(1, account.id).await.unwrap();
    h.engine.get_new_deposit_address(1, account.id).await.unwrap();

    assert!(matches!(
        h.engine.get_new_deposit_address(1, account.id).await,
        Err(HubError::AddressSpaceExhausted { max: 2, .. })
    ));
}

#[tokio::test]
async fn test_process_with_flag_held_elsewhere_is_noop() {
    let h = harness();
    let (_, address) = setup(&h).await;
    h.ledger.deposit(&address, 1000);
    h.store
        .set(&keys::processing_flag(1, ScanKind::Unused), "true".into())
        .await
        .unwrap();

    let report = h.engine.process(1).await.unwrap();

    assert!(report.skipped);
    assert_eq!(h.ledger.balance_queries(), 0);
    assert!(h.engine.pending_sweeps(1).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_deposit_is_swept_and_credited() {
    let h = harness();
    let (account, address) = setup(&h).await;
    h.ledger.deposit(&address, 1000);

    let scan = h.engine.process(1).await.unwrap();
    assert_eq!(scan.deposits, 1);
    assert_eq!(scan.value, 1000);
    assert_eq!(h.engine.get_balance_on_tangle(1, account).await.unwrap(), 1000);
    assert_eq!(h.engine.get_credit(1, account).await.unwrap(), 0);
    assert_eq!(h.engine.pending_sweeps(1).await.unwrap().len(), 1);

    // Not confirmed yet: nothing is credited and the sweep stays pending.
    let sync = h.engine.sync(1).await.unwrap();
    assert_eq!(sync.confirmed, 0);
    assert_eq!(h.engine.pending_sweeps(1).await.unwrap().len(), 1);

    h.ledger.confirm_all();
    let sync = h.engine.sync(1).await.unwrap();
    assert_eq!(sync.confirmed, 1);
    assert_eq!(sync.credited, 1000);

    let state = h.engine.get_account(1, account).await.unwrap();
    assert_eq!(state.credit, 1000);
    assert_eq!(state.balance_on_tangle, 0);
    assert!(h.engine.pending_sweeps(1).await.unwrap().is_empty());
    assert_eq!(
        h.store
            .hget(&keys::addresses(1, ScanKind::Used), &entry_field(account, 0))
            .await
            .unwrap(),
        Some(entry_value(false, &address))
    );
    assert_eq!(h.ledger.balance(&address), 0);
}

#[tokio::test]
async fn test_withdrawal_pays_from_hot_wallet() {
    let h = harness();
    let (account, address) = setup(&h).await;
    fund(&h, &address, 1000).await;

    let withdrawal = h
        .engine
        .withdraw(1, account, &WithdrawRequest::new(destination(), 400))
        .await
        .unwrap();

    assert_eq!(withdrawal.value, 400);
    assert_eq!(withdrawal.credit, 600);
    assert_eq!(withdrawal.remainder, 600);
    assert_eq!(h.engine.get_credit(1, account).await.unwrap(), 600);
    assert_eq!(h.ledger.balance(&destination()), 400);

    let remainder_address = withdrawal.remainder_address.unwrap();
    assert_eq!(h.ledger.balance(&remainder_address), 600);
    assert!(pool_addresses(&h).await.contains(&remainder_address));
}

#[tokio::test]
async fn test_failed_withdrawal_rolls_back() {
    let h = harness();
    let (account, address) = setup(&h).await;
    fund(&h, &address, 1000).await;
    let pool_before = pool_addresses(&h).await;
    h.ledger.fail_transfers(true);

    let result = h
        .engine
        .withdraw(1, account, &WithdrawRequest::new(destination(), 400))
        .await;

    assert!(matches!(result, Err(HubError::TransferFailed(_))));
    assert_eq!(h.engine.get_credit(1, account).await.unwrap(), 1000);
    assert_eq!(pool_addresses(&h).await, pool_before);

    // Once the ledger recovers, the same withdrawal goes through.
    h.ledger.fail_transfers(false);
    let withdrawal = h
        .engine
        .withdraw(1, account, &WithdrawRequest::new(destination(), 400))
        .await
        .unwrap();
    assert_eq!(withdrawal.credit, 600);
}

#[tokio::test]
async fn test_withdrawal_with_unknown_outcome_is_parked() {
    let h = harness();
    let (account, address) = setup(&h).await;
    fund(&h, &address, 1000).await;
    let pool_before = pool_addresses(&h).await;
    h.ledger.fail_transfers_ambiguously(true);

    let result = h
        .engine
        .withdraw(1, account, &WithdrawRequest::new(destination(), 400))
        .await;

    assert!(matches!(result, Err(HubError::TransferOutcomeUnknown(_))));
    // The node applied it; the hub must not hand the credit back.
    assert_eq!(h.ledger.balance(&destination()), 400);
    assert_eq!(h.engine.get_credit(1, account).await.unwrap(), 600);
    assert!(pool_addresses(&h).await.is_disjoint(&pool_before));

    let unsettled = h.engine.unsettled_withdrawals(1).await.unwrap();
    assert_eq!(unsettled.len(), 1);
    assert_eq!(unsettled[0].account, account);
    assert_eq!(unsettled[0].address, destination());

    // The parked inputs cannot fund another withdrawal.
    h.ledger.fail_transfers_ambiguously(false);
    assert!(h
        .engine
        .withdraw(1, account, &WithdrawRequest::new(destination(), 100))
        .await
        .is_err());
    assert_eq!(h.ledger.submitted().len(), 2);
}

#[tokio::test]
async fn test_store_failure_during_withdrawal_keeps_credit_and_pool() {
    let dir = tempfile::tempdir().unwrap();
    let state_dir = dir.path().join("state");
    std::fs::create_dir(&state_dir).unwrap();
    let h = harness_with(
        MemoryStore::open(&state_dir.join("hub_state.json")).unwrap(),
        EngineLimits::default(),
    );
    let (account, address) = setup(&h).await;
    fund(&h, &address, 1000).await;
    let pool_before = pool_addresses(&h).await;
    let submitted_before = h.ledger.submitted().len();

    std::fs::remove_dir_all(&state_dir).unwrap();
    let result = h
        .engine
        .withdraw(1, account, &WithdrawRequest::new(destination(), 400))
        .await;

    assert!(result.is_err());
    assert_eq!(h.engine.get_credit(1, account).await.unwrap(), 1000);
    assert_eq!(pool_addresses(&h).await, pool_before);
    assert_eq!(h.ledger.submitted().len(), submitted_before);

    std::fs::create_dir(&state_dir).unwrap();
    let withdrawal = h
        .engine
        .withdraw(1, account, &WithdrawRequest::new(destination(), 400))
        .await
        .unwrap();
    assert_eq!(withdrawal.credit, 600);
}

#[tokio::test]
async fn test_failed_sweep_is_not_swept_again() {
    let h = harness();
    let (account, address) = setup(&h).await;
    h.ledger.deposit(&address, 100);
    h.ledger.fail_transfers(true);

    let scan = h.engine.process(1).await.unwrap();
    assert_eq!(scan.deposits, 1);
    assert!(!scan.is_success());

    h.ledger.fail_transfers(false);
    let retry = h.engine.process_used(1).await.unwrap();

    assert_eq!(retry.deposits, 0);
    assert!(h.ledger.submitted().is_empty());
    assert_eq!(h.engine.failing_sweeps(1).await.unwrap().len(), 1);
    assert!(h.engine.pending_sweeps(1).await.unwrap().is_empty());
    assert_eq!(h.engine.get_balance_on_tangle(1, account).await.unwrap(), 100);
}

#[tokio::test]
async fn test_withdrawal_needs_credit() {
    let h = harness();
    let (account, _) = setup(&h).await;
    h.engine.credit(1, account, 100).await.unwrap();

    let result = h
        .engine
        .withdraw(1, account, &WithdrawRequest::new(destination(), 101))
        .await;

    assert!(matches!(result, Err(HubError::InsufficientCredit { .. })));
    assert_eq!(h.engine.get_credit(1, account).await.unwrap(), 100);
}

#[tokio::test]
async fn test_failed_removal_marks_hub_inconsistent() {
    let h = harness();
    let (account, address) = setup(&h).await;
    h.ledger.deposit(&address, 1000);
    h.engine.process(1).await.unwrap();
    h.ledger.confirm_all();
    h.store.fail_operation(StoreOp::LTrim);

    let report = h.engine.sync(1).await.unwrap();

    assert_eq!(report.confirmed, 1);
    assert_eq!(report.failed_removals, 1);
    assert!(h.engine.is_not_even_with_db(1));
    assert_eq!(h.engine.get_credit(1, account).await.unwrap(), 1000);
    assert!(matches!(
        h.engine.sync(1).await,
        Err(HubError::NotEvenWithDb(1))
    ));

    h.store.restore_operation(StoreOp::LTrim);
    h.engine.mark_reconciled(1).unwrap();
    assert!(!h.engine.is_not_even_with_db(1));
}

#[tokio::test]
async fn test_state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("hub_state.json");

    let (account, address) = {
        let h = harness_with(MemoryStore::open(&path).unwrap(), EngineLimits::default());
        h.engine.create(1, HUB_SEED, 2, "main").await.unwrap();
        let account = h.engine.register_account(1, "alice").await.unwrap();
        h.engine.credit(1, account.id, 250).await.unwrap();
        let address = h.engine.get_new_deposit_address(1, account.id).await.unwrap();
        (account.id, address)
    };

    let h = harness_with(MemoryStore::open(&path).unwrap(), EngineLimits::default());
    assert!(h.engine.find(1).await.unwrap().is_some());
    assert_eq!(h.engine.get_credit(1, account).await.unwrap(), 250);
    assert_eq!(
        h.engine.get_deposit_address(1, account, None).await.unwrap(),
        address
    );
    // Attachment is process-local.
    assert!(!h.engine.is_attached(1));
}
