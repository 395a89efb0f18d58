// Copyright 2025 Cowboy AI, LLC.

//! The Saga Coordinator: a choreographed process manager, not an
//! orchestrator. It holds no per-transfer state machine of its own —
//! `INIT_CAPTURED`/`DEPOSIT_PENDING`/`COMPLETED`/`COMPENSATION_CAPTURED`/
//! `REFUNDED` are derivable from the idempotency rows, never stored
//! here (§4.4).

use std::collections::HashMap;
use std::sync::Arc;

use crate::command_bus::CommandBus;
use crate::domain::{AccountCommand, AccountEvent, CommandKind};
use crate::domain::events::{COMPENSATION, TRANSFER_DEPOSIT};
use crate::errors::SagaError;
use crate::identifiers::SagaStep;
use crate::infrastructure::event_log::{EventLog, PersistentSubscription};
use crate::infrastructure::relational_store::IdempotencyStore;

/// Subscription group name the Saga joins. Fixed rather than
/// configurable: there is exactly one Saga reacting to the global
/// stream, and a fixed name lets it resume its own position across
/// restarts without additional wiring.
const SUBSCRIPTION_GROUP: &str = "saga-coordinator";

/// Reacts to the global fact stream and emits transfer phase-two
/// deposits and compensating refunds. Every reaction is gated by an
/// idempotency reservation so redelivery (this is an at-least-once
/// subscription) never double-reacts.
pub struct SagaCoordinator {
    event_log: Arc<dyn EventLog>,
    idempotency: Arc<dyn IdempotencyStore>,
    command_bus: Arc<dyn CommandBus>,
    max_retries: u32,
}

impl SagaCoordinator {
    /// Build a coordinator. `max_retries` is the
    /// [`crate::config::LedgerConfig::subscription_max_retries`]
    /// tunable: a delivery is parked, not retried forever, once it's
    /// failed this many times.
    pub fn new(
        event_log: Arc<dyn EventLog>,
        idempotency: Arc<dyn IdempotencyStore>,
        command_bus: Arc<dyn CommandBus>,
        max_retries: u32,
    ) -> Self {
        Self {
            event_log,
            idempotency,
            command_bus,
            max_retries,
        }
    }

    /// Run the coordinator's receive loop forever (until the
    /// subscription closes). Intended to be spawned as its own
    /// long-lived task.
    pub async fn run(&self) -> Result<(), SagaError> {
        let mut subscription = self
            .event_log
            .subscribe_persistent(SUBSCRIPTION_GROUP)
            .await?;
        let mut attempts: HashMap<u64, u32> = HashMap::new();

        while let Some((recorded, handle)) = subscription.next().await {
            let key = recorded.global_position.commit;
            match self.react(&recorded.event).await {
                Ok(()) => {
                    attempts.remove(&key);
                    subscription.ack(handle).await?;
                }
                Err(error) => {
                    let count = attempts.entry(key).or_insert(0);
                    *count += 1;
                    if *count >= self.max_retries {
                        tracing::error!(
                            transaction_id = %recorded.event.transaction_id,
                            %error,
                            attempts = *count,
                            "saga reaction failed repeatedly, parking delivery"
                        );
                        subscription.nack_park(handle).await?;
                        attempts.remove(&key);
                    } else {
                        tracing::warn!(
                            transaction_id = %recorded.event.transaction_id,
                            %error,
                            attempts = *count,
                            "saga reaction failed, requesting redelivery"
                        );
                        subscription.nack_retry(handle).await?;
                    }
                }
            }
        }

        Ok(())
    }

    /// Decide (and, if applicable, publish) this coordinator's
    /// reaction to a single event. At most one outbound command per
    /// call, per §4.4.
    async fn react(&self, event: &AccountEvent) -> Result<(), SagaError> {
        if event.is_saga_silenced() {
            return Ok(());
        }
        if event.is_transfer_withdrawal() {
            return self.react_to_transfer_withdrawal(event).await;
        }
        if event.is_compensatable_failure() {
            return self.react_to_compensatable_failure(event).await;
        }
        Ok(())
    }

    /// Phase one → phase two: a successful withdrawal carrying a
    /// target becomes a deposit to that target, tagged so a later
    /// failure can be recognised as needing compensation.
    async fn react_to_transfer_withdrawal(&self, event: &AccountEvent) -> Result<(), SagaError> {
        let target = event
            .target_account_id
            .expect("is_transfer_withdrawal guarantees a target is present");

        let reserved = self
            .idempotency
            .try_mark_as_processed(event.transaction_id, SagaStep::Init)
            .await?;
        if !reserved {
            tracing::debug!(
                transaction_id = %event.transaction_id,
                "transfer phase one already reserved, dropping redelivered event"
            );
            return Ok(());
        }

        let deposit = AccountCommand {
            account_id: target,
            amount: event.amount,
            kind: CommandKind::Deposit,
            transaction_id: event.transaction_id,
            target_account_id: Some(event.account_id),
            description: Some(TRANSFER_DEPOSIT.to_string()),
        };
        self.command_bus
            .publish(deposit)
            .await
            .map_err(|error| SagaError::CommandBus(error.to_string()))
    }

    /// A failed `TRANSFER_DEPOSIT` (or the Watcher's synthetic
    /// stand-in for one) becomes a refund deposit back to the
    /// original source, unless the target id needed to address that
    /// refund is absent — in which case the compensation is abandoned
    /// and logged (DESIGN.md open question (b)).
    async fn react_to_compensatable_failure(&self, event: &AccountEvent) -> Result<(), SagaError> {
        let Some(refund_target) = event.target_account_id else {
            tracing::warn!(
                transaction_id = %event.transaction_id,
                "compensation abandoned: no refund target on this failure, transfer left unresolved"
            );
            return Ok(());
        };

        let reserved = self
            .idempotency
            .try_mark_as_processed(event.transaction_id, SagaStep::Compensation)
            .await?;
        if !reserved {
            tracing::debug!(
                transaction_id = %event.transaction_id,
                "compensation already reserved, dropping redelivered event"
            );
            return Ok(());
        }

        let refund = AccountCommand {
            account_id: refund_target,
            amount: event.amount,
            kind: CommandKind::Deposit,
            transaction_id: event.transaction_id,
            target_account_id: None,
            description: Some(COMPENSATION.to_string()),
        };
        self.command_bus
            .publish(refund)
            .await
            .map_err(|error| SagaError::CommandBus(error.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_bus::RingCommandBus;
    use crate::domain::EventKind;
    use crate::identifiers::{AccountId, TransactionId};
    use crate::infrastructure::event_log::InMemoryEventLog;
    use crate::infrastructure::relational_store::InMemoryIdempotencyStore;
    use crate::ring::RingBuffer;
    use rust_decimal::Decimal;

    fn withdrawal(source: AccountId, target: AccountId, transaction_id: TransactionId) -> AccountEvent {
        AccountEvent {
            account_id: source,
            amount: Decimal::new(150, 0),
            kind: EventKind::Withdraw,
            transaction_id,
            target_account_id: Some(target),
            description: None,
            occurred_at: chrono::Utc::now(),
        }
    }

    async fn coordinator() -> (
        SagaCoordinator,
        Arc<InMemoryEventLog>,
        Arc<RingBuffer>,
        Arc<InMemoryIdempotencyStore>,
    ) {
        let log = Arc::new(InMemoryEventLog::new());
        let idempotency = Arc::new(InMemoryIdempotencyStore::default());
        let ring = Arc::new(RingBuffer::new(16));
        let bus = Arc::new(RingCommandBus::new(ring.clone()));
        (
            SagaCoordinator::new(log.clone(), idempotency.clone(), bus, 10),
            log,
            ring,
            idempotency,
        )
    }

    #[tokio::test]
    async fn transfer_withdrawal_emits_a_tagged_deposit_to_the_target() {
        let (saga, _log, ring, _idempotency) = coordinator().await;
        let source = AccountId::new();
        let target = AccountId::new();
        let tx = TransactionId::new();

        saga.react(&withdrawal(source, target, tx)).await.unwrap();

        let (_, command, _) = ring.wait_for_apply().await;
        assert_eq!(command.account_id, target);
        assert_eq!(command.kind, CommandKind::Deposit);
        assert_eq!(command.target_account_id, Some(source));
        assert_eq!(command.description.as_deref(), Some(TRANSFER_DEPOSIT));
    }

    #[tokio::test]
    async fn redelivered_transfer_withdrawal_is_dropped_by_idempotency() {
        let (saga, _log, ring, idempotency) = coordinator().await;
        let source = AccountId::new();
        let target = AccountId::new();
        let tx = TransactionId::new();

        saga.react(&withdrawal(source, target, tx)).await.unwrap();
        ring.wait_for_apply().await;

        saga.react(&withdrawal(source, target, tx)).await.unwrap();

        let stages = idempotency.find_stages_by_transaction_id(tx).await.unwrap();
        assert_eq!(stages.len(), 1, "redelivery must not reserve a second INIT row");
    }

    #[tokio::test]
    async fn compensatable_failure_with_no_target_is_abandoned_without_panicking() {
        let (saga, _log, _ring, _idempotency) = coordinator().await;
        let event = AccountEvent {
            account_id: AccountId::new(),
            amount: Decimal::new(150, 0),
            kind: EventKind::Fail,
            transaction_id: TransactionId::new(),
            target_account_id: None,
            description: Some(TRANSFER_DEPOSIT.to_string()),
            occurred_at: chrono::Utc::now(),
        };
        saga.react(&event).await.unwrap();
    }

    #[tokio::test]
    async fn compensatable_failure_with_a_target_emits_a_refund() {
        let (saga, _log, ring, _idempotency) = coordinator().await;
        let source = AccountId::new();
        let event = AccountEvent {
            account_id: AccountId::new(),
            amount: Decimal::new(150, 0),
            kind: EventKind::Fail,
            transaction_id: TransactionId::new(),
            target_account_id: Some(source),
            description: Some(TRANSFER_DEPOSIT.to_string()),
            occurred_at: chrono::Utc::now(),
        };
        saga.react(&event).await.unwrap();

        let (_, command, _) = ring.wait_for_apply().await;
        assert_eq!(command.account_id, source);
        assert_eq!(command.description.as_deref(), Some(COMPENSATION));
    }

    #[tokio::test]
    async fn sentinel_tagged_events_are_ignored_entirely() {
        let (saga, _log, ring, _idempotency) = coordinator().await;
        let event = AccountEvent {
            account_id: AccountId::new(),
            amount: Decimal::new(10, 0),
            kind: EventKind::Withdraw,
            transaction_id: TransactionId::new(),
            target_account_id: Some(AccountId::new()),
            description: Some(crate::domain::events::SAGA_SILENCE_SENTINEL.to_string()),
            occurred_at: chrono::Utc::now(),
        };
        saga.react(&event).await.unwrap();

        let claimed = tokio::time::timeout(std::time::Duration::from_millis(50), ring.claim()).await;
        assert!(claimed.is_err(), "sentinel must not provoke any reaction");
    }
}
