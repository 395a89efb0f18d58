// Copyright 2025 Cowboy AI, LLC.

//! `AccountEvent`: the durable fact recorded for every command the
//! apply stage processes, successful or not.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::identifiers::{AccountId, TransactionId};

/// Description tag the Saga attaches to the deposit it emits as phase
/// two of a transfer. A `FAIL` carrying this tag is what tells the
/// Saga a transfer needs compensating.
pub const TRANSFER_DEPOSIT: &str = "TRANSFER_DEPOSIT";

/// Description tag on a compensating (refund) deposit back to a
/// transfer's original source.
pub const COMPENSATION: &str = "COMPENSATION";

/// Description tag on the synthetic event the Timeout Watcher injects
/// to resume a stalled transfer's compensation path.
pub const TIMEOUT_RECOVERY_TRIGGER: &str = "TIMEOUT_RECOVERY_TRIGGER";

/// A sentinel description the Saga recognises and ignores without
/// reserving an idempotency row. This is a real, always-compiled code
/// path (see DESIGN.md open question (a)): it exists so the Timeout
/// Watcher's recovery behaviour can be exercised deterministically,
/// by giving a transfer no chance to be settled by the Saga's normal
/// reaction before the watcher's timeout window elapses.
pub const SAGA_SILENCE_SENTINEL: &str = "__ignore_for_saga__";

/// What kind of fact an [`AccountEvent`] records. A sum type rather
/// than an overloaded field, per §9's "error-as-event" design note:
/// `Fail` is a first-class variant, not a mutated `Deposit`/`Withdraw`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    /// The account's balance increased by `amount`.
    Deposit,
    /// The account's balance decreased by `amount`.
    Withdraw,
    /// The command was rejected; the balance is unaffected.
    Fail,
}

/// A durable fact about one account. Journaled to the account's
/// stream by the ring pipeline's journal stage; read back by the
/// Aggregate Loader, the Projector, the Saga, and the Timeout Watcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountEvent {
    /// Account this fact is about.
    pub account_id: AccountId,
    /// Amount moved. Always positive regardless of direction.
    pub amount: Decimal,
    /// Deposit, withdraw, or fail.
    pub kind: EventKind,
    /// Correlates this fact with its command and, for transfers, with
    /// the reactive commands the Saga emits.
    pub transaction_id: TransactionId,
    /// For a transfer's withdrawal, the destination account. For the
    /// Saga's reactive deposit, the original source (so a failure can
    /// be compensated). `None` for a plain deposit/withdraw.
    pub target_account_id: Option<AccountId>,
    /// Free-form tag: `TRANSFER_DEPOSIT`, `COMPENSATION`,
    /// `TIMEOUT_RECOVERY_TRIGGER`, the Saga-silence sentinel, or
    /// `None` for an ordinary deposit/withdraw.
    pub description: Option<String>,
    /// When the apply stage produced this fact.
    pub occurred_at: DateTime<Utc>,
}

impl AccountEvent {
    /// Build the synthetic recovery event the Timeout Watcher injects
    /// when it finds a stalled transfer's original `WITHDRAW`.
    ///
    /// Deliberately places `account_id` into both `account_id` and
    /// `target_account_id`: the Saga's compensation rule reads
    /// `target_account_id` as the refund destination, and this is the
    /// only way for a Watcher-synthesised event to be recognised by
    /// that rule at all (see DESIGN.md open question (d); this is
    /// confirmed intentional, not a bug to "clean up").
    pub fn timeout_recovery(
        account_id: AccountId,
        amount: Decimal,
        transaction_id: TransactionId,
    ) -> Self {
        Self {
            account_id,
            amount,
            kind: EventKind::Fail,
            transaction_id,
            target_account_id: Some(account_id),
            description: Some(TIMEOUT_RECOVERY_TRIGGER.to_string()),
            occurred_at: Utc::now(),
        }
    }

    /// Whether this event's description is the test-only sentinel
    /// that instructs the Saga to stay silent.
    pub fn is_saga_silenced(&self) -> bool {
        self.description.as_deref() == Some(SAGA_SILENCE_SENTINEL)
    }

    /// Whether this event is a failed `TRANSFER_DEPOSIT` (phase two of
    /// a transfer failing, or the Watcher's synthetic stand-in for
    /// one) — the condition the Saga's compensation rule matches on.
    pub fn is_compensatable_failure(&self) -> bool {
        self.kind == EventKind::Fail
            && (self.description.as_deref() == Some(TRANSFER_DEPOSIT)
                || self.description.as_deref() == Some(TIMEOUT_RECOVERY_TRIGGER))
    }

    /// Whether this event is phase one of a transfer: a successful
    /// withdrawal with a target account set.
    pub fn is_transfer_withdrawal(&self) -> bool {
        self.kind == EventKind::Withdraw && self.target_account_id.is_some()
    }
}

/// A globally-ordered fact as delivered by a log-wide subscription
/// (the Projector's catch-up feed, the Saga's and Watcher's global
/// scans). Pairs the domain fact with its position in `$all`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedEvent {
    /// The account-stream event, as journaled.
    pub event: AccountEvent,
    /// Which stream (`Account-<id>`) this event was appended to.
    pub stream: String,
    /// This event's sequence number within its own stream.
    pub stream_sequence: u64,
    /// This event's position in the global log.
    pub global_position: GlobalPosition,
}

/// A position in the append-only log's global (`$all`) ordering.
/// Modelled as the commit/prepare pair most event stores expose so a
/// checkpoint can resume exactly where it left off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct GlobalPosition {
    /// Commit position.
    pub commit: u64,
    /// Prepare position. Equal to `commit` for single-event commits,
    /// which is the only kind this ledger produces.
    pub prepare: u64,
}

impl GlobalPosition {
    /// The position before any event has been written.
    pub const START: GlobalPosition = GlobalPosition {
        commit: 0,
        prepare: 0,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(kind: EventKind, description: Option<&str>) -> AccountEvent {
        AccountEvent {
            account_id: AccountId::new(),
            amount: Decimal::new(100, 0),
            kind,
            transaction_id: TransactionId::new(),
            target_account_id: None,
            description: description.map(|d| d.to_string()),
            occurred_at: Utc::now(),
        }
    }

    #[test]
    fn timeout_recovery_duplicates_account_id_into_target() {
        let account_id = AccountId::new();
        let event = AccountEvent::timeout_recovery(account_id, Decimal::new(100, 0), TransactionId::new());
        assert_eq!(event.target_account_id, Some(account_id));
        assert_eq!(event.description.as_deref(), Some(TIMEOUT_RECOVERY_TRIGGER));
        assert!(event.is_compensatable_failure());
    }

    #[test]
    fn sentinel_is_recognised() {
        let event = sample(EventKind::Fail, Some(SAGA_SILENCE_SENTINEL));
        assert!(event.is_saga_silenced());
    }

    #[test]
    fn plain_fail_is_not_compensatable() {
        let event = sample(EventKind::Fail, None);
        assert!(!event.is_compensatable_failure());
    }

    #[test]
    fn transfer_deposit_failure_is_compensatable() {
        let event = sample(EventKind::Fail, Some(TRANSFER_DEPOSIT));
        assert!(event.is_compensatable_failure());
    }
}
