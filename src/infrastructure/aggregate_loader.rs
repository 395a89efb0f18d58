// Copyright 2025 Cowboy AI, LLC.

//! The Aggregate Loader: L1 cache plus snapshot-accelerated replay
//! (§4.2). The only component allowed to hand out a live, mutable
//! [`Account`] to the ring pipeline's apply stage.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use tokio::sync::RwLock;

use crate::domain::Account;
use crate::identifiers::AccountId;
use crate::infrastructure::event_log::EventLog;
use crate::infrastructure::relational_store::SnapshotRepository;

/// Cache entries held when no explicit capacity is given. Generous
/// enough that eviction is a safety valve, not the common case: a
/// missed cache hit just costs a snapshot-plus-replay, never data.
const DEFAULT_CACHE_CAPACITY: usize = 10_000;

/// Loads and caches [`Account`] aggregates.
///
/// Scoped to one pipeline instance (§9: no module-level singleton).
/// Only the apply stage calls [`load`](Self::load) on the hot path;
/// the single-writer invariant is what makes the `RwLock`-guarded LRU
/// cache safe despite `Account` itself not being internally
/// synchronised.
pub struct AggregateLoader {
    cache: RwLock<LruCache<AccountId, Account>>,
    event_log: Arc<dyn EventLog>,
    snapshots: Arc<dyn SnapshotRepository>,
    read_timeout: Duration,
}

impl AggregateLoader {
    /// Build a loader against the given event log and snapshot
    /// repository, with the configured replay read timeout (§6) and
    /// the default L1 cache capacity.
    pub fn new(
        event_log: Arc<dyn EventLog>,
        snapshots: Arc<dyn SnapshotRepository>,
        read_timeout: Duration,
    ) -> Self {
        Self::with_cache_capacity(event_log, snapshots, read_timeout, DEFAULT_CACHE_CAPACITY)
    }

    /// Build a loader with an explicit L1 cache capacity, for
    /// deployments that want to bound its memory footprint.
    pub fn with_cache_capacity(
        event_log: Arc<dyn EventLog>,
        snapshots: Arc<dyn SnapshotRepository>,
        read_timeout: Duration,
        cache_capacity: usize,
    ) -> Self {
        let capacity = NonZeroUsize::new(cache_capacity).unwrap_or(NonZeroUsize::new(1).unwrap());
        Self {
            cache: RwLock::new(LruCache::new(capacity)),
            event_log,
            snapshots,
            read_timeout,
        }
    }

    /// Resolve `account_id` to a consistent [`Account`] via the three
    /// cascading strategies in §4.2: L1 hit, snapshot-plus-replay, or
    /// a fresh zero-balance aggregate replayed from sequence zero.
    ///
    /// On any log-read failure during replay this returns the base
    /// aggregate (fresh or snapshot-restored) unchanged and logs a
    /// warning — it never fabricates state past what it could
    /// actually confirm.
    pub async fn load(&self, account_id: AccountId) -> Account {
        if let Some(cached) = self.cache.write().await.get(&account_id) {
            return cached.clone();
        }

        let mut account = match self.snapshots.latest(account_id).await {
            Ok(Some(snapshot)) => Account::from_snapshot(
                account_id,
                snapshot.balance,
                snapshot.last_applied_sequence,
                snapshot.processed_transactions,
            ),
            Ok(None) => Account::new(account_id),
            Err(error) => {
                tracing::warn!(%account_id, %error, "snapshot lookup failed, starting from a fresh aggregate");
                Account::new(account_id)
            }
        };

        let from_sequence = account.version();
        let replay = tokio::time::timeout(
            self.read_timeout,
            self.event_log.read_stream_from(&account_id.stream_name(), from_sequence),
        )
        .await;

        match replay {
            Ok(Ok(events)) => {
                for event in &events {
                    account.apply_event(event);
                }
            }
            Ok(Err(error)) => {
                tracing::warn!(%account_id, %error, "event log read failed during replay, using base aggregate");
            }
            Err(_) => {
                tracing::warn!(%account_id, timeout = ?self.read_timeout, "replay timed out, using base aggregate");
            }
        }

        self.cache.write().await.put(account_id, account.clone());
        account
    }

    /// Store a mutated aggregate back into the L1 cache. Called by
    /// the apply stage after `apply_command` so the canonical
    /// in-memory instance reflects the latest applied command.
    pub async fn store(&self, account: Account) {
        self.cache.write().await.put(account.id(), account);
    }

    /// Evict one account from the L1 cache. Exposed for tests and
    /// benchmarks that need to force a reload from the log (§4.2).
    pub async fn evict(&self, account_id: AccountId) {
        self.cache.write().await.pop(&account_id);
    }

    /// Clear the entire L1 cache.
    pub async fn evict_all(&self) {
        self.cache.write().await.clear();
    }

    /// Whether `account_id` is currently resident in the L1 cache, for
    /// tests asserting cache behaviour without depending on internals.
    pub async fn is_cached(&self, account_id: AccountId) -> bool {
        self.cache.read().await.contains(&account_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AccountCommand, AccountEvent, EventKind, Snapshot};
    use crate::identifiers::TransactionId;
    use crate::infrastructure::event_log::InMemoryEventLog;
    use crate::infrastructure::relational_store::InMemorySnapshotRepository;
    use rust_decimal::Decimal;
    use std::collections::HashSet;

    fn loader() -> (AggregateLoader, Arc<InMemoryEventLog>) {
        let log = Arc::new(InMemoryEventLog::new());
        let snapshots = Arc::new(InMemorySnapshotRepository::default());
        (
            AggregateLoader::new(log.clone(), snapshots, Duration::from_secs(1)),
            log,
        )
    }

    #[tokio::test]
    async fn unknown_account_loads_as_fresh_zero_balance() {
        let (loader, _log) = loader();
        let account = loader.load(AccountId::new()).await;
        assert_eq!(account.balance(), Decimal::ZERO);
        assert_eq!(account.version(), 0);
    }

    #[tokio::test]
    async fn load_replays_events_from_the_log_when_no_snapshot_exists() {
        let (loader, log) = loader();
        let account_id = AccountId::new();
        let event = AccountEvent {
            account_id,
            amount: Decimal::new(500, 0),
            kind: EventKind::Deposit,
            transaction_id: TransactionId::new(),
            target_account_id: None,
            description: None,
            occurred_at: chrono::Utc::now(),
        };
        log.append_to_stream(&account_id.stream_name(), &[event]).await.unwrap();

        let account = loader.load(account_id).await;
        assert_eq!(account.balance(), Decimal::new(500, 0));
        assert_eq!(account.version(), 1);
    }

    #[tokio::test]
    async fn load_replays_only_events_after_the_snapshot_sequence() {
        let log = Arc::new(InMemoryEventLog::new());
        let snapshots = Arc::new(InMemorySnapshotRepository::default());
        let account_id = AccountId::new();

        for _ in 0..3 {
            let event = AccountEvent {
                account_id,
                amount: Decimal::new(1, 0),
                kind: EventKind::Deposit,
                transaction_id: TransactionId::new(),
                target_account_id: None,
                description: None,
                occurred_at: chrono::Utc::now(),
            };
            log.append_to_stream(&account_id.stream_name(), &[event]).await.unwrap();
        }
        snapshots
            .save(&Snapshot {
                account_id,
                balance: Decimal::new(3, 0),
                last_applied_sequence: 3,
                processed_transactions: HashSet::new(),
                created_at: chrono::Utc::now(),
            })
            .await
            .unwrap();

        let loader = AggregateLoader::new(log, snapshots, Duration::from_secs(1));
        let account = loader.load(account_id).await;
        assert_eq!(account.balance(), Decimal::new(3, 0));
        assert_eq!(account.version(), 3);
    }

    #[tokio::test]
    async fn second_load_is_served_from_the_l1_cache() {
        let (loader, log) = loader();
        let account_id = AccountId::new();
        loader.load(account_id).await;
        assert!(loader.is_cached(account_id).await);

        // Append after caching: a cached load should not see it.
        let event = AccountEvent {
            account_id,
            amount: Decimal::new(999, 0),
            kind: EventKind::Deposit,
            transaction_id: TransactionId::new(),
            target_account_id: None,
            description: None,
            occurred_at: chrono::Utc::now(),
        };
        log.append_to_stream(&account_id.stream_name(), &[event]).await.unwrap();

        let account = loader.load(account_id).await;
        assert_eq!(account.balance(), Decimal::ZERO);
    }

    #[tokio::test]
    async fn eviction_forces_a_fresh_replay_from_the_log() {
        let (loader, log) = loader();
        let account_id = AccountId::new();
        loader.load(account_id).await;

        let event = AccountEvent {
            account_id,
            amount: Decimal::new(42, 0),
            kind: EventKind::Deposit,
            transaction_id: TransactionId::new(),
            target_account_id: None,
            description: None,
            occurred_at: chrono::Utc::now(),
        };
        log.append_to_stream(&account_id.stream_name(), &[event]).await.unwrap();
        loader.evict(account_id).await;

        let account = loader.load(account_id).await;
        assert_eq!(account.balance(), Decimal::new(42, 0));
    }

    #[tokio::test]
    async fn store_updates_the_cached_instance_in_place() {
        let (loader, _log) = loader();
        let account_id = AccountId::new();
        let mut account = loader.load(account_id).await;
        let cmd = AccountCommand::deposit(account_id, Decimal::new(10, 0), TransactionId::new());
        account.apply_command(&cmd).unwrap();
        loader.store(account.clone()).await;

        let reloaded = loader.load(account_id).await;
        assert_eq!(reloaded.balance(), Decimal::new(10, 0));
    }
}
