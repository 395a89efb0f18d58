// Copyright 2025 Cowboy AI, LLC.

//! The `Account` aggregate: the single consistency boundary this
//! ledger maintains. Accounts are folded from their event stream,
//! optionally starting from a snapshot, and are mutated only by the
//! ring pipeline's apply stage.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::events::{AccountEvent, EventKind, TRANSFER_DEPOSIT};
use crate::errors::DomainError;
use crate::identifiers::{AccountId, TransactionId};

/// A command accepted by the ring pipeline, as claimed into a ring
/// slot. The type is deliberately flat and `Copy`-friendly where
/// possible so it can be written into a preallocated slot without an
/// extra heap allocation per command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountCommand {
    /// Account the command is addressed to.
    pub account_id: AccountId,
    /// Amount to move. Always positive; direction comes from `kind`.
    pub amount: Decimal,
    /// What kind of movement this is.
    pub kind: CommandKind,
    /// Transaction id correlating this command (and any reactions it
    /// provokes) across accounts.
    pub transaction_id: TransactionId,
    /// For a transfer, the other account involved. `None` for a plain
    /// deposit or withdrawal.
    pub target_account_id: Option<AccountId>,
    /// Free-form tag copied onto the resulting event. The Saga sets
    /// this for its own reactions (`TRANSFER_DEPOSIT`, `COMPENSATION`);
    /// callers never set it for an original transfer command.
    pub description: Option<String>,
}

/// The kind of movement a command requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandKind {
    /// Increase the account's balance.
    Deposit,
    /// Decrease the account's balance; fails if it would go negative.
    Withdraw,
    /// A withdrawal from this account paired with a deposit to
    /// `target_account_id`. Enters the ring as a `Withdraw` with a
    /// target set — the Saga is responsible for emitting the matching
    /// deposit once the withdrawal is journaled.
    Transfer,
}

impl AccountCommand {
    /// Build a plain deposit command.
    pub fn deposit(account_id: AccountId, amount: Decimal, transaction_id: TransactionId) -> Self {
        Self {
            account_id,
            amount,
            kind: CommandKind::Deposit,
            transaction_id,
            target_account_id: None,
            description: None,
        }
    }

    /// Build a plain withdrawal command.
    pub fn withdraw(account_id: AccountId, amount: Decimal, transaction_id: TransactionId) -> Self {
        Self {
            account_id,
            amount,
            kind: CommandKind::Withdraw,
            transaction_id,
            target_account_id: None,
            description: None,
        }
    }

    /// Build a transfer command. Enters the ring as a withdrawal with
    /// a target; the caller never sets a description, since the
    /// description is the Saga's to assign once it reacts.
    pub fn transfer(
        source_account_id: AccountId,
        target_account_id: AccountId,
        amount: Decimal,
        transaction_id: TransactionId,
    ) -> Self {
        Self {
            account_id: source_account_id,
            amount,
            kind: CommandKind::Transfer,
            transaction_id,
            target_account_id: Some(target_account_id),
            description: None,
        }
    }
}

/// The Account aggregate.
///
/// Instantiated on first command or first replayed event, cached by
/// the Aggregate Loader, and always reconstructible from the event
/// log plus an optional snapshot. Only the ring pipeline's apply
/// stage ever mutates a live instance.
#[derive(Debug, Clone, PartialEq)]
pub struct Account {
    id: AccountId,
    balance: Decimal,
    version: u64,
    processed_transactions: HashSet<TransactionId>,
    first_seen: bool,
}

impl Account {
    /// A brand-new account with zero balance and no history.
    pub fn new(id: AccountId) -> Self {
        Self {
            id,
            balance: Decimal::ZERO,
            version: 0,
            processed_transactions: HashSet::new(),
            first_seen: false,
        }
    }

    /// Rebuild from a snapshot: the balance and processed-transaction
    /// set are taken verbatim, the version is the snapshot's
    /// last-applied sequence, and `first_seen` is always `true` since
    /// a snapshot can only exist for an account that has already
    /// accepted at least one event.
    pub fn from_snapshot(
        id: AccountId,
        balance: Decimal,
        last_applied_sequence: u64,
        processed_transactions: HashSet<TransactionId>,
    ) -> Self {
        Self {
            id,
            balance,
            version: last_applied_sequence,
            processed_transactions,
            first_seen: true,
        }
    }

    /// Account identifier.
    pub fn id(&self) -> AccountId {
        self.id
    }

    /// Current balance.
    pub fn balance(&self) -> Decimal {
        self.balance
    }

    /// Current version (the sequence of the last event applied).
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Whether this account has accepted at least one event, either
    /// live or via snapshot/replay. Used by the transfer-target
    /// "first-seen" rule: a `TRANSFER_DEPOSIT` may not implicitly
    /// create a new account (see DESIGN.md open question (c)).
    pub fn is_known(&self) -> bool {
        self.first_seen
    }

    /// Whether `transaction_id` has already been applied to this
    /// account. A transaction id is applied at most once per account.
    pub fn has_processed(&self, transaction_id: &TransactionId) -> bool {
        self.processed_transactions.contains(transaction_id)
    }

    /// Defensive copy of the processed-transaction set, for the
    /// Snapshot Janitor to persist.
    pub fn processed_transactions(&self) -> HashSet<TransactionId> {
        self.processed_transactions.clone()
    }

    /// Apply a command, producing the fact that should be journaled.
    /// On a business rule violation the returned event has
    /// `kind = EventKind::Fail` and the description is preserved (the
    /// single point where a business error becomes a recorded fact,
    /// per the error handling design) — `Err` is reserved for cases
    /// where no event at all can be produced (an unrecognised command
    /// type).
    ///
    /// The transfer-target "must already exist" rule (§4.1, §8
    /// scenario 4) is checked here, on `self`, not on the withdrawal
    /// leg: a transfer's withdrawal always succeeds balance-permitting
    /// regardless of the target, and the failure surfaces only when
    /// the Saga's `TRANSFER_DEPOSIT` reaction lands on an account that
    /// has never been seen before.
    pub fn apply_command(&mut self, command: &AccountCommand) -> Result<AccountEvent, DomainError> {
        if self.processed_transactions.contains(&command.transaction_id) {
            return Err(DomainError::DuplicateTransaction(
                command.transaction_id.to_string(),
            ));
        }

        let event = match command.kind {
            CommandKind::Deposit => {
                if command.description.as_deref() == Some(TRANSFER_DEPOSIT) && !self.is_known() {
                    self.fail(
                        command,
                        format!("target must exist: {}", self.id),
                    )
                } else {
                    self.deposit(command)
                }
            }
            CommandKind::Withdraw => self.withdraw(command, None),
            CommandKind::Transfer => {
                if command.target_account_id.is_none() {
                    return Err(DomainError::UnknownCommandType("Transfer without a target".into()));
                }
                self.withdraw(command, command.target_account_id)
            }
        };

        self.apply_event(&event);
        Ok(event)
    }

    /// Fold an already-journaled event into this aggregate, as
    /// replay does. Mirrors `apply_command`'s state transition without
    /// re-deciding success/failure — a replayed FAIL never touches
    /// the balance.
    pub fn apply_event(&mut self, event: &AccountEvent) {
        match event.kind {
            EventKind::Deposit => {
                self.balance += event.amount;
                self.processed_transactions.insert(event.transaction_id);
            }
            EventKind::Withdraw => {
                self.balance -= event.amount;
                self.processed_transactions.insert(event.transaction_id);
            }
            EventKind::Fail => {}
        }
        self.version += 1;
        self.first_seen = true;
    }

    fn deposit(&self, command: &AccountCommand) -> AccountEvent {
        AccountEvent {
            account_id: command.account_id,
            amount: command.amount,
            kind: EventKind::Deposit,
            transaction_id: command.transaction_id,
            target_account_id: None,
            description: command.description.clone(),
            occurred_at: Utc::now(),
        }
    }

    fn withdraw(
        &self,
        command: &AccountCommand,
        target_account_id: Option<AccountId>,
    ) -> AccountEvent {
        if self.balance < command.amount {
            return AccountEvent {
                account_id: command.account_id,
                amount: command.amount,
                kind: EventKind::Fail,
                transaction_id: command.transaction_id,
                target_account_id,
                description: command.description.clone(),
                occurred_at: Utc::now(),
            };
        }
        AccountEvent {
            account_id: command.account_id,
            amount: command.amount,
            kind: EventKind::Withdraw,
            transaction_id: command.transaction_id,
            target_account_id,
            description: command.description.clone(),
            occurred_at: Utc::now(),
        }
    }

    fn fail(&self, command: &AccountCommand, reason: String) -> AccountEvent {
        tracing::warn!(
            account_id = %command.account_id,
            transaction_id = %command.transaction_id,
            reason = %reason,
            "command rejected"
        );
        AccountEvent {
            account_id: command.account_id,
            amount: command.amount,
            kind: EventKind::Fail,
            transaction_id: command.transaction_id,
            target_account_id: command.target_account_id,
            description: command.description.clone(),
            occurred_at: Utc::now(),
        }
    }
}

/// When a snapshot was captured.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    /// Account the snapshot belongs to.
    pub account_id: AccountId,
    /// Balance at `last_applied_sequence`.
    pub balance: Decimal,
    /// The sequence of the last event folded into this snapshot.
    pub last_applied_sequence: u64,
    /// Transactions already applied as of this snapshot.
    pub processed_transactions: HashSet<TransactionId>,
    /// When the snapshot was written.
    pub created_at: DateTime<Utc>,
}
