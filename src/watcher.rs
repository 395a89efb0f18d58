// Copyright 2025 Cowboy AI, LLC.

//! The Timeout Watcher (§4.6): a periodic sweep for transfers whose
//! Saga reaction never arrived, paired with a bounded backward scan to
//! recover the original `WITHDRAW` without ever guessing at one.

use std::sync::Arc;
use std::time::Duration;

use crate::command_bus::CommandBus;
use crate::domain::{AccountCommand, AccountEvent, CommandKind};
use crate::errors::WatcherError;
use crate::identifiers::TransactionId;
use crate::infrastructure::event_log::EventLog;
use crate::infrastructure::relational_store::IdempotencyStore;

/// Periodically recovers stalled transfers: a withdrawal whose
/// idempotency `INIT` row is old and has no matching `COMPLETE` or
/// `COMPENSATION` row means the Saga's phase-two deposit (or its
/// compensation) never resolved.
pub struct TimeoutWatcher {
    event_log: Arc<dyn EventLog>,
    idempotency: Arc<dyn IdempotencyStore>,
    command_bus: Arc<dyn CommandBus>,
    period: Duration,
    timeout_threshold: Duration,
    scan_depth: usize,
}

impl TimeoutWatcher {
    /// Build a watcher with the configured period, staleness
    /// threshold, and backward-scan depth bound (§6).
    pub fn new(
        event_log: Arc<dyn EventLog>,
        idempotency: Arc<dyn IdempotencyStore>,
        command_bus: Arc<dyn CommandBus>,
        period: Duration,
        timeout_threshold: Duration,
        scan_depth: usize,
    ) -> Self {
        Self {
            event_log,
            idempotency,
            command_bus,
            period,
            timeout_threshold,
            scan_depth,
        }
    }

    /// Run the periodic scan forever. Intended to be spawned as its
    /// own long-lived task.
    pub async fn run(&self) -> Result<(), WatcherError> {
        let mut ticker = tokio::time::interval(self.period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.sweep().await?;
        }
    }

    /// One pass: find stalled transfers and try to recover each.
    pub async fn sweep(&self) -> Result<(), WatcherError> {
        let stalled = self
            .idempotency
            .find_timeout_transactions(self.timeout_threshold)
            .await?;

        for transaction_id in stalled {
            self.recover(transaction_id).await?;
        }
        Ok(())
    }

    /// Scan the global fact stream backward, up to the configured
    /// depth bound, for `transaction_id`'s original withdrawal. On a
    /// match, emit a recovery command the Saga will treat as a
    /// compensation. On scan exhaustion, log for operator attention
    /// and never guess (§4.6 step 4).
    async fn recover(&self, transaction_id: TransactionId) -> Result<(), WatcherError> {
        let scanned = self.event_log.read_all_backward(self.scan_depth).await?;

        let original = scanned
            .into_iter()
            .map(|record| record.event)
            .find(|event: &AccountEvent| {
                event.is_transfer_withdrawal() && event.transaction_id == transaction_id
            });

        let Some(withdrawal) = original else {
            tracing::warn!(
                %transaction_id,
                scan_depth = self.scan_depth,
                "timeout recovery scan exhausted its bound without finding the original withdrawal"
            );
            return Ok(());
        };

        let recovery = AccountEvent::timeout_recovery(
            withdrawal.account_id,
            withdrawal.amount,
            transaction_id,
        );
        let command = AccountCommand {
            account_id: recovery.account_id,
            amount: recovery.amount,
            kind: CommandKind::Withdraw,
            transaction_id: recovery.transaction_id,
            target_account_id: recovery.target_account_id,
            description: recovery.description,
        };

        self.command_bus
            .publish(command)
            .await
            .map_err(|error| WatcherError::CommandBus(error.to_string()))
    }
}
