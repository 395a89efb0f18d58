// Copyright 2025 Cowboy AI, LLC.

//! Tunable configuration for every component, with the defaults
//! stated by the component design.

use std::time::Duration;

/// All tunables for a running ledger. Constructible programmatically
/// (tests, benchmarks) via [`LedgerConfig::default`], or from the
/// environment via [`LedgerConfig::from_env`] for operational use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerConfig {
    /// Ring buffer capacity. Must be a power of two.
    pub ring_capacity: usize,
    /// Emit a snapshot every N accepted events (by ring sequence).
    pub snapshot_threshold: u64,
    /// Keep only the newest `snapshot_retain_count` snapshot rows per account.
    pub snapshot_retain_count: u32,
    /// Projector flush trigger: number of buffered events.
    pub projector_batch_size: usize,
    /// Projector flush trigger: time since the buffer was last flushed.
    pub projector_flush_period: Duration,
    /// How often the Timeout Watcher scans for stalled transfers.
    pub watcher_period: Duration,
    /// How old an uncompensated INIT row must be before it's considered stalled.
    pub watcher_timeout_threshold: Duration,
    /// How far back the Watcher scans the global fact stream for a match.
    pub watcher_scan_depth: usize,
    /// How long the Aggregate Loader waits on a log read before giving up.
    pub aggregate_read_timeout: Duration,
    /// Persistent subscription's internal delivery buffer size.
    pub subscription_buffer_size: usize,
    /// Persistent subscription's max redelivery attempts before parking.
    pub subscription_max_retries: u32,
    /// Persistent subscription's per-message ack timeout.
    pub subscription_ack_timeout: Duration,
}

impl LedgerConfig {
    /// Load configuration from environment variables, falling back to
    /// [`LedgerConfig::default`] for anything unset. Variable names
    /// are the field names upper-cased with a `LEDGER_` prefix, e.g.
    /// `LEDGER_RING_CAPACITY`, `LEDGER_SNAPSHOT_THRESHOLD`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            ring_capacity: env_usize("LEDGER_RING_CAPACITY", defaults.ring_capacity),
            snapshot_threshold: env_u64("LEDGER_SNAPSHOT_THRESHOLD", defaults.snapshot_threshold),
            snapshot_retain_count: env_u32(
                "LEDGER_SNAPSHOT_RETAIN_COUNT",
                defaults.snapshot_retain_count,
            ),
            projector_batch_size: env_usize(
                "LEDGER_PROJECTOR_BATCH_SIZE",
                defaults.projector_batch_size,
            ),
            projector_flush_period: env_duration_secs(
                "LEDGER_PROJECTOR_FLUSH_PERIOD_SECS",
                defaults.projector_flush_period,
            ),
            watcher_period: env_duration_secs("LEDGER_WATCHER_PERIOD_SECS", defaults.watcher_period),
            watcher_timeout_threshold: env_duration_secs(
                "LEDGER_WATCHER_TIMEOUT_THRESHOLD_SECS",
                defaults.watcher_timeout_threshold,
            ),
            watcher_scan_depth: env_usize(
                "LEDGER_WATCHER_SCAN_DEPTH",
                defaults.watcher_scan_depth,
            ),
            aggregate_read_timeout: env_duration_secs(
                "LEDGER_AGGREGATE_READ_TIMEOUT_SECS",
                defaults.aggregate_read_timeout,
            ),
            subscription_buffer_size: env_usize(
                "LEDGER_SUBSCRIPTION_BUFFER_SIZE",
                defaults.subscription_buffer_size,
            ),
            subscription_max_retries: env_u32(
                "LEDGER_SUBSCRIPTION_MAX_RETRIES",
                defaults.subscription_max_retries,
            ),
            subscription_ack_timeout: env_duration_secs(
                "LEDGER_SUBSCRIPTION_ACK_TIMEOUT_SECS",
                defaults.subscription_ack_timeout,
            ),
        }
    }

    /// `true` if `ring_capacity` is a power of two, as required by
    /// the ring buffer's sequence-masking arithmetic.
    pub fn is_valid(&self) -> bool {
        self.ring_capacity > 0 && self.ring_capacity.is_power_of_two()
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            ring_capacity: 1024,
            snapshot_threshold: 100,
            snapshot_retain_count: 2,
            projector_batch_size: 500,
            projector_flush_period: Duration::from_secs(3),
            watcher_period: Duration::from_secs(60),
            watcher_timeout_threshold: Duration::from_secs(30),
            watcher_scan_depth: 2000,
            aggregate_read_timeout: Duration::from_secs(5),
            subscription_buffer_size: 50,
            subscription_max_retries: 10,
            subscription_ack_timeout: Duration::from_secs(10),
        }
    }
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_duration_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}
