// Copyright 2025 Cowboy AI, LLC.

//! The Projector (§4.5): a buffered, checkpointed catch-up subscriber
//! that keeps the relational read model eventually consistent with
//! the event log, independently of the ring pipeline's own
//! read-model-buffer stage. At-least-once; idempotent by construction
//! (additive arithmetic plus a monotone position checkpoint).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;

use crate::domain::{EventKind, GlobalPosition, RecordedEvent};
use crate::errors::ProjectorError;
use crate::identifiers::AccountId;
use crate::infrastructure::event_log::EventLog;
use crate::infrastructure::relational_store::{CheckpointStore, ReadModelStore};

/// Checkpoint name this projector persists under.
const CHECKPOINT_NAME: &str = "read-model-projector";

/// Drives one catch-up subscription to completion (forever, in
/// practice): buffers events, flushes on a size or time trigger, and
/// persists its checkpoint only after a successful flush.
pub struct Projector {
    event_log: Arc<dyn EventLog>,
    read_model: Arc<dyn ReadModelStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    batch_size: usize,
    flush_period: Duration,
}

impl Projector {
    /// Build a projector against its three dependencies, with the
    /// configured flush triggers (§6).
    pub fn new(
        event_log: Arc<dyn EventLog>,
        read_model: Arc<dyn ReadModelStore>,
        checkpoints: Arc<dyn CheckpointStore>,
        batch_size: usize,
        flush_period: Duration,
    ) -> Self {
        Self {
            event_log,
            read_model,
            checkpoints,
            batch_size,
            flush_period,
        }
    }

    /// Resume from the persisted checkpoint (or the start of the log)
    /// and run the catch-up loop until the subscription ends.
    pub async fn run(&self) -> Result<(), ProjectorError> {
        let from_position = self
            .checkpoints
            .load(CHECKPOINT_NAME)
            .await?
            .unwrap_or(GlobalPosition::START);

        let mut subscription = self.event_log.subscribe_catch_up(from_position).await?;
        let mut buffer: Vec<RecordedEvent> = Vec::with_capacity(self.batch_size);
        let mut ticker = tokio::time::interval(self.flush_period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so we don't flush
        // an empty buffer before anything has arrived.
        ticker.tick().await;

        loop {
            tokio::select! {
                next = subscription.next() => {
                    let Some(record) = next else { break; };
                    buffer.push(record);
                    if buffer.len() >= self.batch_size {
                        self.flush(&mut buffer).await?;
                    }
                }
                _ = ticker.tick() => {
                    if !buffer.is_empty() {
                        self.flush(&mut buffer).await?;
                    }
                }
            }
        }

        if !buffer.is_empty() {
            self.flush(&mut buffer).await?;
        }
        Ok(())
    }

    /// Apply one batch: firewall FAIL events, partition the survivors,
    /// apply deposits/withdraws, and persist the batch's last position
    /// as the new checkpoint. A read-model write failure is logged and
    /// the batch is dropped (§7) — the checkpoint is not advanced, so
    /// the next flush (or the next run) will re-deliver it.
    async fn flush(&self, buffer: &mut Vec<RecordedEvent>) -> Result<(), ProjectorError> {
        let last_position = buffer
            .last()
            .expect("flush is only called on a non-empty buffer")
            .global_position;

        let mut deposits: HashMap<AccountId, Decimal> = HashMap::new();
        let mut withdraws: HashMap<AccountId, Decimal> = HashMap::new();
        let mut failed = 0usize;

        for record in buffer.drain(..) {
            match record.event.kind {
                EventKind::Fail => failed += 1,
                EventKind::Deposit => {
                    *deposits.entry(record.event.account_id).or_insert(Decimal::ZERO) +=
                        record.event.amount;
                }
                EventKind::Withdraw => {
                    *withdraws.entry(record.event.account_id).or_insert(Decimal::ZERO) +=
                        record.event.amount;
                }
            }
        }
        if failed > 0 {
            tracing::debug!(failed, "projector firewalled FAIL events out of this batch");
        }

        let mut write_failed = false;
        for (account_id, amount) in deposits {
            if let Err(error) = self.read_model.upsert_deposit(account_id, amount).await {
                tracing::error!(%account_id, %error, "projector deposit write failed, dropping batch");
                write_failed = true;
            }
        }
        for (account_id, amount) in withdraws {
            match self.read_model.update_withdraw(account_id, amount).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::warn!(%account_id, "projector withdraw affected zero rows");
                }
                Err(error) => {
                    tracing::error!(%account_id, %error, "projector withdraw write failed, dropping batch");
                    write_failed = true;
                }
            }
        }

        if write_failed {
            return Ok(());
        }

        self.checkpoints.save(CHECKPOINT_NAME, last_position).await?;
        Ok(())
    }
}
