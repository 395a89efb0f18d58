// Copyright 2025 Cowboy AI, LLC.

//! The three ordered consumer stages that drain a [`RingBuffer`]
//! (§4.1): apply, journal, and read-model-buffer-plus-snapshot-tick.
//! `RingPipeline::spawn` starts one long-lived task per stage; they
//! communicate only by advancing the buffer's cursors.

use std::collections::HashMap;
use std::sync::Arc;

use rust_decimal::Decimal;
use tokio::task::JoinHandle;

use crate::domain::{AccountCommand, AccountEvent, EventKind};
use crate::identifiers::AccountId;
use crate::infrastructure::{AggregateLoader, EventLog, ReadModelStore};
use crate::janitor::SnapshotJanitor;

use super::RingBuffer;

/// Owns the three background tasks that drain a [`RingBuffer`]. Drop
/// (or [`RingPipeline::shutdown`]) aborts them; there is no graceful
/// drain, matching the teacher's fire-and-forget task handles.
pub struct RingPipeline {
    apply: JoinHandle<()>,
    journal: JoinHandle<()>,
    readmodel: JoinHandle<()>,
}

impl RingPipeline {
    /// Spawn the apply, journal, and read-model/snapshot-tick stages
    /// against a shared ring. `snapshot_threshold` is the N in "every
    /// N events" (§4.3); `0` disables snapshotting entirely.
    pub fn spawn(
        ring: Arc<RingBuffer>,
        loader: Arc<AggregateLoader>,
        event_log: Arc<dyn EventLog>,
        read_model: Arc<dyn ReadModelStore>,
        janitor: Arc<SnapshotJanitor>,
        snapshot_threshold: u64,
    ) -> Self {
        let apply = tokio::spawn(run_apply_stage(ring.clone(), loader.clone()));
        let journal = tokio::spawn(run_journal_stage(ring.clone(), event_log));
        let readmodel = tokio::spawn(run_readmodel_stage(
            ring,
            loader,
            read_model,
            janitor,
            snapshot_threshold,
        ));
        Self {
            apply,
            journal,
            readmodel,
        }
    }

    /// Abort all three stage tasks immediately.
    pub fn shutdown(self) {
        self.apply.abort();
        self.journal.abort();
        self.readmodel.abort();
    }
}

/// Decide the outcome of `command` against the aggregate loader and
/// record the decision in the loader's L1 cache. The first-seen rule
/// for transfer targets (§4.2/§7) lives inside `apply_command` itself,
/// checked against the account the command is addressed to — nothing
/// extra to resolve here. Exposed at module level so the pipeline and
/// the test suite exercise identical logic.
async fn decide(loader: &AggregateLoader, command: &AccountCommand) -> Option<AccountEvent> {
    let mut account = loader.load(command.account_id).await;

    match account.apply_command(command) {
        Ok(event) => {
            loader.store(account).await;
            Some(event)
        }
        Err(error) => {
            // Duplicate transaction ids are an idempotency collision,
            // not a business failure: no event is produced and the
            // aggregate is left untouched (§7).
            tracing::warn!(
                account_id = %command.account_id,
                transaction_id = %command.transaction_id,
                %error,
                "command rejected by the aggregate, nothing journaled"
            );
            None
        }
    }
}

async fn run_apply_stage(ring: Arc<RingBuffer>, loader: Arc<AggregateLoader>) {
    loop {
        let (sequence, command, _end_of_batch) = ring.wait_for_apply().await;
        let event = match decide(&loader, &command).await {
            Some(event) => event,
            None => AccountEvent {
                account_id: command.account_id,
                amount: command.amount,
                kind: EventKind::Fail,
                transaction_id: command.transaction_id,
                target_account_id: command.target_account_id,
                description: command.description.clone(),
                occurred_at: chrono::Utc::now(),
            },
        };
        ring.complete_apply(sequence, event);
    }
}

async fn run_journal_stage(ring: Arc<RingBuffer>, event_log: Arc<dyn EventLog>) {
    let mut batch: Vec<(u64, AccountEvent)> = Vec::new();
    loop {
        let (sequence, event, end_of_batch) = ring.wait_for_journal().await;
        batch.push((sequence, event));

        if !end_of_batch {
            continue;
        }

        // Append one stream at a time, preserving per-account order;
        // a failure halts the pipeline rather than risk an
        // unrecorded fact (§7) — this task simply stops advancing the
        // journal cursor, which backs up the whole ring.
        for (sequence, event) in &batch {
            let stream = event.account_id.stream_name();
            if let Err(error) = event_log.append_to_stream(&stream, std::slice::from_ref(event)).await {
                tracing::error!(%stream, sequence, %error, "journal append failed, pipeline halted");
                return;
            }
        }

        for (sequence, _) in &batch {
            ring.complete_journal(*sequence);
        }
        batch.clear();
    }
}

async fn run_readmodel_stage(
    ring: Arc<RingBuffer>,
    loader: Arc<AggregateLoader>,
    read_model: Arc<dyn ReadModelStore>,
    janitor: Arc<SnapshotJanitor>,
    snapshot_threshold: u64,
) {
    let mut deposits: HashMap<AccountId, Decimal> = HashMap::new();
    let mut withdraws: HashMap<AccountId, Decimal> = HashMap::new();
    let mut pending: Vec<(u64, AccountEvent)> = Vec::new();

    loop {
        let (sequence, event, end_of_batch) = ring.wait_for_readmodel().await;

        if SnapshotJanitor::should_snapshot(sequence + 1, snapshot_threshold)
            && event.kind != EventKind::Fail
        {
            let account = loader.load(event.account_id).await;
            janitor.snapshot(&account).await;
        }

        match event.kind {
            EventKind::Deposit => {
                *deposits.entry(event.account_id).or_insert(Decimal::ZERO) += event.amount;
            }
            EventKind::Withdraw => {
                *withdraws.entry(event.account_id).or_insert(Decimal::ZERO) += event.amount;
            }
            EventKind::Fail => {}
        }
        pending.push((sequence, event));

        if !end_of_batch {
            continue;
        }

        for (&account_id, &amount) in deposits.iter() {
            if let Err(error) = read_model.upsert_deposit(account_id, amount).await {
                tracing::error!(%account_id, %error, "read-model deposit upsert failed, dropping batch");
            }
        }
        for (&account_id, &amount) in withdraws.iter() {
            match read_model.update_withdraw(account_id, amount).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::warn!(%account_id, "read-model withdraw affected zero rows");
                }
                Err(error) => {
                    tracing::error!(%account_id, %error, "read-model withdraw update failed, dropping batch");
                }
            }
        }

        deposits.clear();
        withdraws.clear();
        for (sequence, _) in pending.drain(..) {
            ring.complete_readmodel(sequence);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LedgerConfig;
    use crate::identifiers::TransactionId;
    use crate::infrastructure::event_log::InMemoryEventLog;
    use crate::infrastructure::relational_store::{InMemoryReadModelStore, InMemorySnapshotRepository};
    use std::time::Duration;

    async fn wire() -> (
        Arc<RingBuffer>,
        RingPipeline,
        Arc<InMemoryEventLog>,
        Arc<InMemoryReadModelStore>,
    ) {
        let config = LedgerConfig::default();
        let ring = Arc::new(RingBuffer::new(config.ring_capacity));
        let event_log = Arc::new(InMemoryEventLog::new());
        let snapshots = Arc::new(InMemorySnapshotRepository::default());
        let read_model = Arc::new(InMemoryReadModelStore::default());
        let loader = Arc::new(AggregateLoader::new(
            event_log.clone(),
            snapshots.clone(),
            config.aggregate_read_timeout,
        ));
        let janitor = Arc::new(SnapshotJanitor::new(snapshots, config.snapshot_retain_count));

        let pipeline = RingPipeline::spawn(
            ring.clone(),
            loader,
            event_log.clone() as Arc<dyn EventLog>,
            read_model.clone() as Arc<dyn ReadModelStore>,
            janitor,
            config.snapshot_threshold,
        );
        (ring, pipeline, event_log, read_model)
    }

    async fn publish(ring: &RingBuffer, command: AccountCommand) {
        let sequence = ring.claim().await;
        ring.write(sequence, command);
        ring.publish(sequence, true);
    }

    async fn wait_for_balance(store: &InMemoryReadModelStore, account: AccountId, expected: Decimal) {
        for _ in 0..200 {
            if store.get_balance(account).await.unwrap() == Some(expected) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("balance for {account} never converged to {expected}");
    }

    #[tokio::test]
    async fn a_deposit_flows_through_to_the_read_model() {
        let (ring, pipeline, _log, read_model) = wire().await;
        let account = AccountId::new();
        publish(
            &ring,
            AccountCommand::deposit(account, Decimal::new(1000, 0), TransactionId::new()),
        )
        .await;

        wait_for_balance(&read_model, account, Decimal::new(1000, 0)).await;
        pipeline.shutdown();
    }

    #[tokio::test]
    async fn an_overdraft_withdrawal_produces_a_fail_and_leaves_the_read_model_untouched() {
        let (ring, pipeline, log, read_model) = wire().await;
        let account = AccountId::new();
        publish(
            &ring,
            AccountCommand::withdraw(account, Decimal::new(50, 0), TransactionId::new()),
        )
        .await;

        for _ in 0..200 {
            let events = log.read_stream_from(&account.stream_name(), 0).await.unwrap();
            if !events.is_empty() {
                assert_eq!(events[0].kind, EventKind::Fail);
                assert_eq!(read_model.get_balance(account).await.unwrap(), None);
                pipeline.shutdown();
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("fail event never journaled");
    }
}
