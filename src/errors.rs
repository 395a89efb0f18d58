// Copyright 2025 Cowboy AI, LLC.

//! Error types for ledger operations.
//!
//! Every component that can fail owns its own error enum; conversions
//! between them go through `#[from]`, never string matching.

use thiserror::Error;

/// Errors raised while applying a command against an [`crate::domain::Account`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DomainError {
    /// Withdrawal (or transfer phase 1) would take the balance negative.
    #[error("insufficient balance: account {account_id} has {balance}, requested {requested}")]
    InsufficientBalance {
        /// Account the withdrawal was attempted against.
        account_id: String,
        /// Balance at the time of the attempt.
        balance: String,
        /// Amount requested.
        requested: String,
    },

    /// A command type the apply stage does not recognise.
    #[error("unknown command type: {0}")]
    UnknownCommandType(String),

    /// A transfer's target account does not exist and may not be
    /// created implicitly by a `TRANSFER_DEPOSIT`.
    #[error("transfer target does not exist: {0}")]
    TargetMustExist(String),

    /// A transaction id has already been applied to this account.
    #[error("transaction {0} already applied")]
    DuplicateTransaction(String),
}

/// Errors raised by the ring pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The ring is at capacity and the producer must wait.
    #[error("ring buffer is full")]
    RingFull,

    /// The journal stage could not durably append a batch; the
    /// pipeline halts rather than risk losing accepted facts.
    #[error("journal append failed, pipeline halted: {0}")]
    JournalHalted(#[from] StoreError),

    /// The aggregate loader failed in a way that isn't the normal
    /// "return the base aggregate" degraded path (e.g. the command
    /// channel itself closed).
    #[error("aggregate load failed: {0}")]
    LoadFailed(String),
}

/// Errors raised by the event log / relational store adapters.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The underlying connection could not be reached.
    #[error("connection error: {0}")]
    Connection(String),

    /// Serialising or deserialising event/row payloads failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// An append's expected-version check did not match the stream's
    /// actual current version.
    #[error("concurrency conflict on stream {stream}: expected version {expected}, found {actual}")]
    ConcurrencyConflict {
        /// Stream the append targeted.
        stream: String,
        /// Version the caller expected.
        expected: u64,
        /// Version the store actually holds.
        actual: u64,
    },

    /// The requested stream has no events.
    #[error("stream not found: {0}")]
    StreamNotFound(String),

    /// A generic storage-layer failure (query error, timeout, etc).
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Storage(err.to_string())
    }
}

/// Errors raised by the snapshot store and Snapshot Janitor.
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// The underlying store could not be reached or written to.
    #[error("storage error: {0}")]
    Storage(String),

    /// No snapshot exists for the requested account.
    #[error("no snapshot for account {0}")]
    NotFound(String),

    /// Serialising or deserialising the processed-transaction set failed.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<StoreError> for SnapshotError {
    fn from(err: StoreError) -> Self {
        SnapshotError::Storage(err.to_string())
    }
}

/// Errors raised by the Saga Coordinator.
#[derive(Debug, Error)]
pub enum SagaError {
    /// The idempotency store could not be reached.
    #[error("idempotency store error: {0}")]
    Store(#[from] StoreError),

    /// Publishing the Saga's reaction command back onto the ring failed.
    #[error("command bus error: {0}")]
    CommandBus(String),
}

/// Errors raised by the Projector.
#[derive(Debug, Error)]
pub enum ProjectorError {
    /// The checkpoint or read-model store could not be reached.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The event log subscription ended unexpectedly.
    #[error("subscription error: {0}")]
    Subscription(String),
}

/// Errors raised by the Timeout Watcher.
#[derive(Debug, Error)]
pub enum WatcherError {
    /// The idempotency store could not be reached.
    #[error("idempotency store error: {0}")]
    Store(#[from] StoreError),

    /// Publishing a recovery command back onto the ring failed.
    #[error("command bus error: {0}")]
    CommandBus(String),
}

/// Top-level error type for operational/binary code that needs to
/// report a single failure across subsystems. Library code prefers
/// the specific enums above; this exists at the crate's edges rather
/// than threaded through internal control flow.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// A domain rule was violated.
    #[error(transparent)]
    Domain(#[from] DomainError),

    /// The ring pipeline failed.
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    /// A store adapter failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The snapshot subsystem failed.
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    /// The Saga Coordinator failed.
    #[error(transparent)]
    Saga(#[from] SagaError),

    /// The Projector failed.
    #[error(transparent)]
    Projector(#[from] ProjectorError),

    /// The Timeout Watcher failed.
    #[error(transparent)]
    Watcher(#[from] WatcherError),
}

/// Result alias for domain-rule application.
pub type DomainResult<T> = Result<T, DomainError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concurrency_conflict_message_contains_both_versions() {
        let err = StoreError::ConcurrencyConflict {
            stream: "Account-1".into(),
            expected: 5,
            actual: 7,
        };
        let msg = err.to_string();
        assert!(msg.contains("expected version 5"));
        assert!(msg.contains("found 7"));
    }

    #[test]
    fn ledger_error_wraps_domain_error_transparently() {
        let domain = DomainError::UnknownCommandType("FROBNICATE".into());
        let wrapped: LedgerError = domain.clone().into();
        assert_eq!(wrapped.to_string(), domain.to_string());
    }
}
