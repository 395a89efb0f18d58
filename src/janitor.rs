// Copyright 2025 Cowboy AI, LLC.

//! The Snapshot Janitor (§4.3): threshold-driven snapshot emission
//! plus retention pruning, invoked by the ring pipeline's snapshot-
//! tick stage.

use std::sync::Arc;

use chrono::Utc;

use crate::domain::Account;
use crate::infrastructure::relational_store::SnapshotRepository;
use crate::domain::Snapshot;

/// Emits and prunes snapshots for the ring pipeline's snapshot-tick
/// stage. Stateless beyond its configuration: the threshold/retain
/// decision is made by the caller (the ring sequence crossing a
/// multiple of `threshold`), this just does the persist-and-prune work.
pub struct SnapshotJanitor {
    snapshots: Arc<dyn SnapshotRepository>,
    retain_count: u32,
}

impl SnapshotJanitor {
    /// Build a janitor against the given snapshot repository, keeping
    /// `retain_count` rows per account after each prune.
    pub fn new(snapshots: Arc<dyn SnapshotRepository>, retain_count: u32) -> Self {
        Self {
            snapshots,
            retain_count,
        }
    }

    /// Whether `sequence` is a point at which a snapshot should be
    /// emitted: a nonzero multiple of `threshold`. Matches §8's
    /// boundary requirement (exactly at the threshold, not one before
    /// or after).
    pub fn should_snapshot(sequence: u64, threshold: u64) -> bool {
        threshold > 0 && sequence > 0 && sequence % threshold == 0
    }

    /// Take a defensive copy of `account`'s processed-transaction set,
    /// stamp it with `account`'s current version as the snapshot
    /// sequence, persist it, then prune all but the newest
    /// `retain_count` rows for that account.
    ///
    /// Persistence and pruning failures are both logged and
    /// non-fatal (§7): a missed snapshot only costs a longer replay
    /// next time this account loads, it never loses data.
    pub async fn snapshot(&self, account: &Account) {
        let snapshot = Snapshot {
            account_id: account.id(),
            balance: account.balance(),
            last_applied_sequence: account.version(),
            processed_transactions: account.processed_transactions(),
            created_at: Utc::now(),
        };

        if let Err(error) = self.snapshots.save(&snapshot).await {
            tracing::warn!(account_id = %account.id(), %error, "snapshot persistence failed");
            return;
        }

        if let Err(error) = self.snapshots.prune(account.id(), self.retain_count).await {
            tracing::warn!(account_id = %account.id(), %error, "snapshot retention pruning failed");
        }
    }
}
