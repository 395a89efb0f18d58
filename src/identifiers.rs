//! Identifier types for accounts and transactions.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Opaque account identifier.
///
/// Accounts have no further structure visible to this crate beyond
/// identity: the ledger does not know or care what an account
/// "means" upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AccountId(Uuid);

impl AccountId {
    /// Create a new random account ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID as an account ID.
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// Borrow the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// The stream name this account's events are journaled under.
    pub fn stream_name(&self) -> String {
        format!("Account-{}", self.0)
    }
}

impl Default for AccountId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<AccountId> for Uuid {
    fn from(id: AccountId) -> Self {
        id.0
    }
}

impl From<&AccountId> for Uuid {
    fn from(id: &AccountId) -> Self {
        id.0
    }
}

impl From<Uuid> for AccountId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

/// Identifier for a transaction: a deposit, a withdrawal, or one leg of
/// a transfer. Carried by every [`crate::domain::AccountEvent`] so the
/// Saga and idempotency store can correlate events across accounts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionId(Uuid);

impl TransactionId {
    /// Create a new random transaction ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID as a transaction ID.
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// Borrow the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<TransactionId> for Uuid {
    fn from(id: TransactionId) -> Self {
        id.0
    }
}

impl From<Uuid> for TransactionId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

/// A step within a saga transaction's lifecycle, used as half of the
/// idempotency table's composite primary key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SagaStep {
    /// Phase-1 withdrawal reservation captured.
    Init,
    /// Compensation (refund) reservation captured.
    Compensation,
    /// Transfer observed as fully settled.
    Complete,
}

impl SagaStep {
    /// The string form stored in the `processed_transactions.step` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaStep::Init => "INIT",
            SagaStep::Compensation => "COMPENSATION",
            SagaStep::Complete => "COMPLETE",
        }
    }
}

impl fmt::Display for SagaStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for SagaStep {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INIT" => Ok(SagaStep::Init),
            "COMPENSATION" => Ok(SagaStep::Compensation),
            "COMPLETE" => Ok(SagaStep::Complete),
            other => Err(format!("unknown saga step: {other}")),
        }
    }
}
