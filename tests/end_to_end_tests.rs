// Copyright 2025 Cowboy AI, LLC.

//! End-to-end scenarios wiring the ring pipeline, the Saga Coordinator,
//! and the Timeout Watcher together against in-memory adapters, one
//! per quantified scenario.

use std::sync::Arc;
use std::time::Duration;

use ledger_core::command_bus::{CommandBus, RingCommandBus};
use ledger_core::config::LedgerConfig;
use ledger_core::domain::{AccountCommand, EventKind};
use ledger_core::identifiers::{AccountId, SagaStep, TransactionId};
use ledger_core::infrastructure::event_log::InMemoryEventLog;
use ledger_core::infrastructure::relational_store::{
    InMemoryIdempotencyStore, InMemoryReadModelStore, InMemorySnapshotRepository,
};
use ledger_core::infrastructure::AggregateLoader;
use ledger_core::janitor::SnapshotJanitor;
use ledger_core::ring::{RingBuffer, RingPipeline};
use ledger_core::saga::SagaCoordinator;
use ledger_core::watcher::TimeoutWatcher;
use rust_decimal::Decimal;

struct Harness {
    ring: Arc<RingBuffer>,
    pipeline: RingPipeline,
    event_log: Arc<InMemoryEventLog>,
    read_model: Arc<InMemoryReadModelStore>,
    idempotency: Arc<InMemoryIdempotencyStore>,
    bus: Arc<RingCommandBus>,
    saga_handle: tokio::task::JoinHandle<()>,
}

impl Harness {
    async fn wire() -> Self {
        let config = LedgerConfig::default();
        let ring = Arc::new(RingBuffer::new(config.ring_capacity));
        let event_log = Arc::new(InMemoryEventLog::new());
        let snapshots = Arc::new(InMemorySnapshotRepository::default());
        let read_model = Arc::new(InMemoryReadModelStore::default());
        let idempotency = Arc::new(InMemoryIdempotencyStore::default());

        let loader = Arc::new(AggregateLoader::new(
            event_log.clone(),
            snapshots.clone(),
            config.aggregate_read_timeout,
        ));
        let janitor = Arc::new(SnapshotJanitor::new(snapshots, config.snapshot_retain_count));

        let pipeline = RingPipeline::spawn(
            ring.clone(),
            loader,
            event_log.clone() as Arc<dyn ledger_core::infrastructure::EventLog>,
            read_model.clone() as Arc<dyn ledger_core::infrastructure::ReadModelStore>,
            janitor,
            config.snapshot_threshold,
        );

        let bus = Arc::new(RingCommandBus::new(ring.clone()));

        let saga = SagaCoordinator::new(
            event_log.clone() as Arc<dyn ledger_core::infrastructure::EventLog>,
            idempotency.clone() as Arc<dyn ledger_core::infrastructure::IdempotencyStore>,
            bus.clone() as Arc<dyn CommandBus>,
            config.subscription_max_retries,
        );
        let saga_handle = tokio::spawn(async move {
            let _ = saga.run().await;
        });

        Self {
            ring,
            pipeline,
            event_log,
            read_model,
            idempotency,
            bus,
            saga_handle,
        }
    }

    async fn shutdown(self) {
        self.saga_handle.abort();
        self.pipeline.shutdown();
    }

    async fn wait_for_balance(&self, account: AccountId, expected: Decimal) {
        for _ in 0..400 {
            if self.read_model.get_balance(account).await.unwrap() == Some(expected) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("balance for {account} never converged to {expected}");
    }

    async fn wait_for_stages(&self, transaction_id: TransactionId, expected: usize) {
        for _ in 0..400 {
            let stages = self
                .idempotency
                .find_stages_by_transaction_id(transaction_id)
                .await
                .unwrap();
            if stages.len() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("idempotency rows for {transaction_id:?} never reached {expected}");
    }
}

#[tokio::test]
async fn deposit_succeeds_with_no_idempotency_row() {
    let harness = Harness::wire().await;
    let account = AccountId::new();
    let tx = TransactionId::new();

    harness
        .bus
        .publish(AccountCommand::deposit(account, Decimal::new(1000, 0), tx))
        .await
        .unwrap();

    harness.wait_for_balance(account, Decimal::new(1000, 0)).await;
    let stages = harness.idempotency.find_stages_by_transaction_id(tx).await.unwrap();
    assert!(stages.is_empty());

    harness.shutdown().await;
}

#[tokio::test]
async fn withdraw_overdraft_fails_and_leaves_balance_unchanged() {
    let harness = Harness::wire().await;
    let account = AccountId::new();
    let tx = TransactionId::new();

    harness
        .bus
        .publish(AccountCommand::withdraw(account, Decimal::new(50, 0), tx))
        .await
        .unwrap();

    for _ in 0..400 {
        let events = harness
            .event_log
            .read_stream_from(&account.stream_name(), 0)
            .await
            .unwrap();
        if !events.is_empty() {
            assert_eq!(events[0].kind, EventKind::Fail);
            assert_eq!(harness.read_model.get_balance(account).await.unwrap(), None);
            harness.shutdown().await;
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("overdraft withdrawal never produced a FAIL");
}

#[tokio::test]
async fn happy_path_transfer_moves_balance_with_no_compensation_row() {
    let harness = Harness::wire().await;
    let a = AccountId::new();
    let b = AccountId::new();

    harness
        .bus
        .publish(AccountCommand::deposit(a, Decimal::new(1000, 0), TransactionId::new()))
        .await
        .unwrap();
    harness
        .bus
        .publish(AccountCommand::deposit(b, Decimal::new(200, 0), TransactionId::new()))
        .await
        .unwrap();
    harness.wait_for_balance(a, Decimal::new(1000, 0)).await;
    harness.wait_for_balance(b, Decimal::new(200, 0)).await;

    let tx3 = TransactionId::new();
    harness
        .bus
        .publish(AccountCommand::transfer(a, b, Decimal::new(150, 0), tx3))
        .await
        .unwrap();

    harness.wait_for_balance(a, Decimal::new(850, 0)).await;
    harness.wait_for_balance(b, Decimal::new(350, 0)).await;

    let stages = harness.idempotency.find_stages_by_transaction_id(tx3).await.unwrap();
    assert_eq!(stages.len(), 1);
    assert_eq!(stages[0].0, SagaStep::Init);

    harness.shutdown().await;
}

#[tokio::test]
async fn failing_transfer_to_a_nonexistent_account_is_auto_compensated() {
    let harness = Harness::wire().await;
    let a = AccountId::new();
    let nonexistent = AccountId::new();

    harness
        .bus
        .publish(AccountCommand::deposit(a, Decimal::new(1000, 0), TransactionId::new()))
        .await
        .unwrap();
    harness.wait_for_balance(a, Decimal::new(1000, 0)).await;

    let tx4 = TransactionId::new();
    harness
        .bus
        .publish(AccountCommand::transfer(a, nonexistent, Decimal::new(200, 0), tx4))
        .await
        .unwrap();

    // A dips to 800 on the withdrawal, then returns to 1000 once the
    // Saga's compensation lands.
    harness.wait_for_balance(a, Decimal::new(1000, 0)).await;
    harness.wait_for_stages(tx4, 2).await;

    let stages = harness.idempotency.find_stages_by_transaction_id(tx4).await.unwrap();
    let steps: Vec<SagaStep> = stages.iter().map(|(step, _)| *step).collect();
    assert!(steps.contains(&SagaStep::Init));
    assert!(steps.contains(&SagaStep::Compensation));
    assert_eq!(
        harness.read_model.get_balance(nonexistent).await.unwrap(),
        None
    );

    harness.shutdown().await;
}

#[tokio::test]
async fn a_stalled_transfer_is_recovered_by_the_watcher_and_compensated() {
    let harness = Harness::wire().await;
    let a = AccountId::new();
    let b = AccountId::new();

    harness
        .bus
        .publish(AccountCommand::deposit(a, Decimal::new(1000, 0), TransactionId::new()))
        .await
        .unwrap();
    harness.wait_for_balance(a, Decimal::new(1000, 0)).await;

    // A withdrawal tagged with the Saga-silence sentinel: the Saga
    // never reacts to it on its own, simulating a reaction that never
    // arrived.
    let tx5 = TransactionId::new();
    let mut silent_withdrawal =
        AccountCommand::transfer(a, b, Decimal::new(100, 0), tx5);
    silent_withdrawal.description = Some(
        ledger_core::domain::events::SAGA_SILENCE_SENTINEL.to_string(),
    );
    harness.bus.publish(silent_withdrawal).await.unwrap();
    harness.wait_for_balance(a, Decimal::new(900, 0)).await;

    harness
        .idempotency
        .try_mark_as_processed(tx5, SagaStep::Init)
        .await
        .unwrap();

    let watcher = TimeoutWatcher::new(
        harness.event_log.clone() as Arc<dyn ledger_core::infrastructure::EventLog>,
        harness.idempotency.clone() as Arc<dyn ledger_core::infrastructure::IdempotencyStore>,
        harness.bus.clone() as Arc<dyn CommandBus>,
        Duration::from_secs(60),
        Duration::from_secs(0),
        2000,
    );
    watcher.sweep().await.unwrap();

    harness.wait_for_balance(a, Decimal::new(1000, 0)).await;
    harness.wait_for_stages(tx5, 2).await;

    harness.shutdown().await;
}

#[tokio::test]
async fn a_snapshot_at_the_threshold_reproduces_full_replay_state() {
    let event_log = Arc::new(InMemoryEventLog::new());
    let snapshots = Arc::new(InMemorySnapshotRepository::default());
    let account_id = AccountId::new();

    let loader_no_snapshot = AggregateLoader::new(
        event_log.clone(),
        Arc::new(InMemorySnapshotRepository::default()),
        Duration::from_secs(1),
    );
    let mut account = loader_no_snapshot.load(account_id).await;

    for _ in 0..9999u32 {
        let cmd = AccountCommand::deposit(account_id, Decimal::new(1, 0), TransactionId::new());
        let event = account.apply_command(&cmd).unwrap();
        event_log
            .append_to_stream(&account_id.stream_name(), &[event])
            .await
            .unwrap();
    }
    assert_eq!(account.version(), 9999);

    let janitor = SnapshotJanitor::new(snapshots.clone(), 2);
    assert!(SnapshotJanitor::should_snapshot(9999, 9999));
    janitor.snapshot(&account).await;

    let loader_with_snapshot = AggregateLoader::new(event_log, snapshots, Duration::from_secs(1));
    let reloaded = loader_with_snapshot.load(account_id).await;

    assert_eq!(reloaded.balance(), account.balance());
    assert_eq!(reloaded.version(), account.version());
}
