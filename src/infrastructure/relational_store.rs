// Copyright 2025 Cowboy AI, LLC.

//! The Relational Store Adapter: read model, snapshots, checkpoints,
//! and idempotency, against the SQL shapes §6 specifies. Each concern
//! is its own narrow trait so a caller (the ring pipeline, the
//! Projector, the Janitor, the Saga) depends only on what it uses.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use sqlx::PgPool;

use crate::domain::{GlobalPosition, Snapshot};
use crate::errors::StoreError;
use crate::identifiers::{AccountId, SagaStep, TransactionId};

/// `accounts(account_id PK, balance, last_updated_at)`.
#[async_trait]
pub trait ReadModelStore: Send + Sync {
    /// `INSERT ... ON CONFLICT DO UPDATE SET balance = balance + ?`.
    /// Creates the row if it doesn't exist, per §4.5 step 4.
    async fn upsert_deposit(&self, account_id: AccountId, amount: Decimal) -> Result<(), StoreError>;

    /// Strict `UPDATE balance = balance - ? WHERE account_id = ?`.
    /// Returns `false` (zero rows affected) rather than erroring when
    /// the account doesn't exist in the read model yet — §4.5 step 5
    /// treats that as a logged divergence, not a fatal error.
    async fn update_withdraw(&self, account_id: AccountId, amount: Decimal) -> Result<bool, StoreError>;

    /// Point `SELECT balance FROM accounts WHERE account_id = ?`.
    async fn get_balance(&self, account_id: AccountId) -> Result<Option<Decimal>, StoreError>;
}

/// `account_snapshots(account_id, last_event_sequence, balance,
/// processed_transactions JSON, created_at, PK(account_id,
/// last_event_sequence))`.
#[async_trait]
pub trait SnapshotRepository: Send + Sync {
    /// Persist a new snapshot row (never updates an existing one —
    /// the PK includes the sequence, so every snapshot is an insert).
    async fn save(&self, snapshot: &Snapshot) -> Result<(), StoreError>;

    /// The highest-sequence snapshot for `account_id`, if any.
    async fn latest(&self, account_id: AccountId) -> Result<Option<Snapshot>, StoreError>;

    /// Delete all but the newest `retain_count` rows for `account_id`.
    async fn prune(&self, account_id: AccountId, retain_count: u32) -> Result<(), StoreError>;
}

/// `projection_checkpoints(projection_name PK, last_commit,
/// last_prepare)` and the identically-shaped `saga_checkpoints`. One
/// trait serves both tables; callers key by their own component name.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// The last position this named checkpoint reached, or `None` if
    /// it has never been saved (start from the beginning of the log).
    async fn load(&self, name: &str) -> Result<Option<GlobalPosition>, StoreError>;

    /// Persist `position` as the new checkpoint for `name`.
    async fn save(&self, name: &str, position: GlobalPosition) -> Result<(), StoreError>;
}

/// `processed_transactions(transaction_id, step, processed_at,
/// PK(transaction_id, step))`.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Atomically insert `(transaction_id, step)`. Returns `true` if
    /// this call won the race (the row did not already exist),
    /// `false` if it lost (unique violation, swallowed rather than
    /// propagated — §7 treats this as expected, not an error).
    async fn try_mark_as_processed(
        &self,
        transaction_id: TransactionId,
        step: SagaStep,
    ) -> Result<bool, StoreError>;

    /// Every step recorded for `transaction_id`, oldest first.
    async fn find_stages_by_transaction_id(
        &self,
        transaction_id: TransactionId,
    ) -> Result<Vec<(SagaStep, DateTime<Utc>)>, StoreError>;

    /// Transaction ids whose `INIT` row is older than `older_than`
    /// and which have no `COMPLETE` or `COMPENSATION` row — the
    /// anti-join §4.6 step 1 describes.
    async fn find_timeout_transactions(
        &self,
        older_than: std::time::Duration,
    ) -> Result<Vec<TransactionId>, StoreError>;

    /// Delete rows older than `older_than_days`, for housekeeping.
    /// Returns the number of rows removed.
    async fn delete_old_records(&self, older_than_days: i64) -> Result<u64, StoreError>;
}

// ---------------------------------------------------------------------
// Postgres adapters
// ---------------------------------------------------------------------

/// sqlx/Postgres-backed [`ReadModelStore`].
pub struct PgReadModelStore {
    pool: PgPool,
}

impl PgReadModelStore {
    /// Wrap an existing connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ReadModelStore for PgReadModelStore {
    async fn upsert_deposit(&self, account_id: AccountId, amount: Decimal) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO accounts (account_id, balance, last_updated_at) \
             VALUES ($1, $2, now()) \
             ON CONFLICT (account_id) DO UPDATE \
             SET balance = accounts.balance + EXCLUDED.balance, last_updated_at = now()",
        )
        .bind(account_id.as_uuid())
        .bind(amount)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_withdraw(&self, account_id: AccountId, amount: Decimal) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE accounts SET balance = balance - $1, last_updated_at = now() WHERE account_id = $2",
        )
        .bind(amount)
        .bind(account_id.as_uuid())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_balance(&self, account_id: AccountId) -> Result<Option<Decimal>, StoreError> {
        let row: Option<(Decimal,)> =
            sqlx::query_as("SELECT balance FROM accounts WHERE account_id = $1")
                .bind(account_id.as_uuid())
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(balance,)| balance))
    }
}

/// sqlx/Postgres-backed [`SnapshotRepository`].
pub struct PgSnapshotRepository {
    pool: PgPool,
}

impl PgSnapshotRepository {
    /// Wrap an existing connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SnapshotRepository for PgSnapshotRepository {
    async fn save(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        let processed: Vec<uuid::Uuid> = snapshot
            .processed_transactions
            .iter()
            .map(|tx| (*tx).into())
            .collect();
        let payload = serde_json::to_value(&processed)?;

        sqlx::query(
            "INSERT INTO account_snapshots \
             (account_id, last_event_sequence, balance, processed_transactions, created_at) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(snapshot.account_id.as_uuid())
        .bind(snapshot.last_applied_sequence as i64)
        .bind(snapshot.balance)
        .bind(payload)
        .bind(snapshot.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn latest(&self, account_id: AccountId) -> Result<Option<Snapshot>, StoreError> {
        let row: Option<(i64, Decimal, serde_json::Value, DateTime<Utc>)> = sqlx::query_as(
            "SELECT last_event_sequence, balance, processed_transactions, created_at \
             FROM account_snapshots WHERE account_id = $1 \
             ORDER BY last_event_sequence DESC LIMIT 1",
        )
        .bind(account_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        let Some((sequence, balance, payload, created_at)) = row else {
            return Ok(None);
        };
        let ids: Vec<uuid::Uuid> = serde_json::from_value(payload)?;
        let processed_transactions: HashSet<TransactionId> =
            ids.into_iter().map(TransactionId::from_uuid).collect();

        Ok(Some(Snapshot {
            account_id,
            balance,
            last_applied_sequence: sequence as u64,
            processed_transactions,
            created_at,
        }))
    }

    async fn prune(&self, account_id: AccountId, retain_count: u32) -> Result<(), StoreError> {
        sqlx::query(
            "DELETE FROM account_snapshots WHERE account_id = $1 AND last_event_sequence NOT IN \
             (SELECT last_event_sequence FROM account_snapshots WHERE account_id = $1 \
              ORDER BY last_event_sequence DESC LIMIT $2)",
        )
        .bind(account_id.as_uuid())
        .bind(retain_count as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// sqlx/Postgres-backed [`CheckpointStore`], shared by
/// `projection_checkpoints` and `saga_checkpoints` via `table_name`.
pub struct PgCheckpointStore {
    pool: PgPool,
    table_name: &'static str,
    name_column: &'static str,
}

impl PgCheckpointStore {
    /// A checkpoint store over `projection_checkpoints`.
    pub fn for_projections(pool: PgPool) -> Self {
        Self {
            pool,
            table_name: "projection_checkpoints",
            name_column: "projection_name",
        }
    }

    /// A checkpoint store over `saga_checkpoints`.
    pub fn for_sagas(pool: PgPool) -> Self {
        Self {
            pool,
            table_name: "saga_checkpoints",
            name_column: "saga_name",
        }
    }
}

#[async_trait]
impl CheckpointStore for PgCheckpointStore {
    async fn load(&self, name: &str) -> Result<Option<GlobalPosition>, StoreError> {
        let query = format!(
            "SELECT last_commit, last_prepare FROM {} WHERE {} = $1",
            self.table_name, self.name_column
        );
        let row: Option<(i64, i64)> = sqlx::query_as(&query)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(commit, prepare)| GlobalPosition {
            commit: commit as u64,
            prepare: prepare as u64,
        }))
    }

    async fn save(&self, name: &str, position: GlobalPosition) -> Result<(), StoreError> {
        let query = format!(
            "INSERT INTO {0} ({1}, last_commit, last_prepare) VALUES ($1, $2, $3) \
             ON CONFLICT ({1}) DO UPDATE SET last_commit = EXCLUDED.last_commit, \
             last_prepare = EXCLUDED.last_prepare",
            self.table_name, self.name_column
        );
        sqlx::query(&query)
            .bind(name)
            .bind(position.commit as i64)
            .bind(position.prepare as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// sqlx/Postgres-backed [`IdempotencyStore`].
pub struct PgIdempotencyStore {
    pool: PgPool,
}

impl PgIdempotencyStore {
    /// Wrap an existing connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl IdempotencyStore for PgIdempotencyStore {
    async fn try_mark_as_processed(
        &self,
        transaction_id: TransactionId,
        step: SagaStep,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "INSERT INTO processed_transactions (transaction_id, step, processed_at) \
             VALUES ($1, $2, now()) ON CONFLICT (transaction_id, step) DO NOTHING",
        )
        .bind(transaction_id.as_uuid())
        .bind(step.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_stages_by_transaction_id(
        &self,
        transaction_id: TransactionId,
    ) -> Result<Vec<(SagaStep, DateTime<Utc>)>, StoreError> {
        let rows: Vec<(String, DateTime<Utc>)> = sqlx::query_as(
            "SELECT step, processed_at FROM processed_transactions \
             WHERE transaction_id = $1 ORDER BY processed_at ASC",
        )
        .bind(transaction_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(step, at)| {
                step.parse::<SagaStep>()
                    .map(|parsed| (parsed, at))
                    .map_err(StoreError::Serialization)
            })
            .collect()
    }

    async fn find_timeout_transactions(
        &self,
        older_than: std::time::Duration,
    ) -> Result<Vec<TransactionId>, StoreError> {
        let threshold = Utc::now() - ChronoDuration::from_std(older_than)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let rows: Vec<(uuid::Uuid,)> = sqlx::query_as(
            "SELECT init.transaction_id FROM processed_transactions init \
             WHERE init.step = 'INIT' AND init.processed_at < $1 \
             AND NOT EXISTS ( \
                 SELECT 1 FROM processed_transactions done \
                 WHERE done.transaction_id = init.transaction_id \
                 AND done.step IN ('COMPLETE', 'COMPENSATION') \
             )",
        )
        .bind(threshold)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(id,)| TransactionId::from_uuid(id)).collect())
    }

    async fn delete_old_records(&self, older_than_days: i64) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "DELETE FROM processed_transactions WHERE processed_at < now() - ($1 || ' days')::interval",
        )
        .bind(older_than_days.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

// ---------------------------------------------------------------------
// In-memory test doubles
// ---------------------------------------------------------------------

/// In-memory [`ReadModelStore`] for tests and benchmarks.
#[derive(Default)]
pub struct InMemoryReadModelStore {
    balances: Mutex<HashMap<AccountId, Decimal>>,
}

#[async_trait]
impl ReadModelStore for InMemoryReadModelStore {
    async fn upsert_deposit(&self, account_id: AccountId, amount: Decimal) -> Result<(), StoreError> {
        let mut balances = self.balances.lock().map_err(|_| StoreError::Storage("poisoned".into()))?;
        *balances.entry(account_id).or_insert(Decimal::ZERO) += amount;
        Ok(())
    }

    async fn update_withdraw(&self, account_id: AccountId, amount: Decimal) -> Result<bool, StoreError> {
        let mut balances = self.balances.lock().map_err(|_| StoreError::Storage("poisoned".into()))?;
        match balances.get_mut(&account_id) {
            Some(balance) => {
                *balance -= amount;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn get_balance(&self, account_id: AccountId) -> Result<Option<Decimal>, StoreError> {
        let balances = self.balances.lock().map_err(|_| StoreError::Storage("poisoned".into()))?;
        Ok(balances.get(&account_id).copied())
    }
}

/// In-memory [`SnapshotRepository`] for tests and benchmarks.
#[derive(Default)]
pub struct InMemorySnapshotRepository {
    rows: Mutex<Vec<Snapshot>>,
}

#[async_trait]
impl SnapshotRepository for InMemorySnapshotRepository {
    async fn save(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        let mut rows = self.rows.lock().map_err(|_| StoreError::Storage("poisoned".into()))?;
        rows.push(snapshot.clone());
        Ok(())
    }

    async fn latest(&self, account_id: AccountId) -> Result<Option<Snapshot>, StoreError> {
        let rows = self.rows.lock().map_err(|_| StoreError::Storage("poisoned".into()))?;
        Ok(rows
            .iter()
            .filter(|s| s.account_id == account_id)
            .max_by_key(|s| s.last_applied_sequence)
            .cloned())
    }

    async fn prune(&self, account_id: AccountId, retain_count: u32) -> Result<(), StoreError> {
        let mut rows = self.rows.lock().map_err(|_| StoreError::Storage("poisoned".into()))?;
        let mut sequences: Vec<u64> = rows
            .iter()
            .filter(|s| s.account_id == account_id)
            .map(|s| s.last_applied_sequence)
            .collect();
        sequences.sort_unstable_by(|a, b| b.cmp(a));
        let keep: HashSet<u64> = sequences.into_iter().take(retain_count as usize).collect();
        rows.retain(|s| s.account_id != account_id || keep.contains(&s.last_applied_sequence));
        Ok(())
    }
}

/// In-memory [`CheckpointStore`] for tests and benchmarks.
#[derive(Default)]
pub struct InMemoryCheckpointStore {
    positions: Mutex<HashMap<String, GlobalPosition>>,
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn load(&self, name: &str) -> Result<Option<GlobalPosition>, StoreError> {
        let positions = self.positions.lock().map_err(|_| StoreError::Storage("poisoned".into()))?;
        Ok(positions.get(name).copied())
    }

    async fn save(&self, name: &str, position: GlobalPosition) -> Result<(), StoreError> {
        let mut positions = self.positions.lock().map_err(|_| StoreError::Storage("poisoned".into()))?;
        positions.insert(name.to_string(), position);
        Ok(())
    }
}

/// In-memory [`IdempotencyStore`] for tests and benchmarks.
#[derive(Default)]
pub struct InMemoryIdempotencyStore {
    rows: Mutex<HashMap<(TransactionId, SagaStep), DateTime<Utc>>>,
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn try_mark_as_processed(
        &self,
        transaction_id: TransactionId,
        step: SagaStep,
    ) -> Result<bool, StoreError> {
        let mut rows = self.rows.lock().map_err(|_| StoreError::Storage("poisoned".into()))?;
        let key = (transaction_id, step);
        if rows.contains_key(&key) {
            return Ok(false);
        }
        rows.insert(key, Utc::now());
        Ok(true)
    }

    async fn find_stages_by_transaction_id(
        &self,
        transaction_id: TransactionId,
    ) -> Result<Vec<(SagaStep, DateTime<Utc>)>, StoreError> {
        let rows = self.rows.lock().map_err(|_| StoreError::Storage("poisoned".into()))?;
        let mut found: Vec<(SagaStep, DateTime<Utc>)> = rows
            .iter()
            .filter(|((tx, _), _)| *tx == transaction_id)
            .map(|((_, step), at)| (*step, *at))
            .collect();
        found.sort_by_key(|(_, at)| *at);
        Ok(found)
    }

    async fn find_timeout_transactions(
        &self,
        older_than: std::time::Duration,
    ) -> Result<Vec<TransactionId>, StoreError> {
        let rows = self.rows.lock().map_err(|_| StoreError::Storage("poisoned".into()))?;
        let threshold = Utc::now()
            - ChronoDuration::from_std(older_than).map_err(|e| StoreError::Serialization(e.to_string()))?;

        let mut timed_out = Vec::new();
        for ((tx, step), at) in rows.iter() {
            if *step != SagaStep::Init || *at >= threshold {
                continue;
            }
            let settled = rows.iter().any(|((other_tx, other_step), _)| {
                other_tx == tx
                    && matches!(other_step, SagaStep::Complete | SagaStep::Compensation)
            });
            if !settled {
                timed_out.push(*tx);
            }
        }
        Ok(timed_out)
    }

    async fn delete_old_records(&self, older_than_days: i64) -> Result<u64, StoreError> {
        let mut rows = self.rows.lock().map_err(|_| StoreError::Storage("poisoned".into()))?;
        let threshold = Utc::now() - ChronoDuration::days(older_than_days);
        let before = rows.len();
        rows.retain(|_, at| *at >= threshold);
        Ok((before - rows.len()) as u64)
    }
}
