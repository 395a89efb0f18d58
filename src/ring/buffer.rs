// Copyright 2025 Cowboy AI, LLC.

//! The bounded, power-of-two ring that carries commands from producers
//! to the apply/journal/read-model stages.
//!
//! Slots are preallocated once at construction; a producer claims a
//! sequence, writes its command into the slot at `sequence & mask` in
//! place, then publishes it. No slot's contents are heap-allocated
//! per command beyond what `AccountCommand` itself already owns
//! (mostly `Copy` fields plus one optional `String`).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::sync::Notify;

use crate::domain::{AccountCommand, AccountEvent};

/// One ring slot. Producers write `command`; the apply stage reads it
/// and, on success or business failure, writes `event` and the
/// apply-stage outcome kind directly into the same slot so downstream
/// stages see the canonical fact without a second allocation.
#[derive(Debug, Default)]
pub struct Slot {
    /// The command a producer claimed this slot to carry.
    pub command: Option<AccountCommand>,
    /// The fact the apply stage derived from `command`. `None` until
    /// the apply stage has run.
    pub event: Option<AccountEvent>,
    /// Set by the producer that claims the last slot of a batch (or,
    /// in the steady state, simply "no more are immediately
    /// available"); the journal and read-model stages flush on this.
    pub end_of_batch: bool,
}

/// A bounded sequence buffer with a fixed, power-of-two capacity.
///
/// Three consumer cursors advance in the fixed dependency order
/// described by §4.1: `apply`, then `journal`, then `readmodel`
/// (shared by the read-model-buffer stage and the snapshot-tick
/// stage, which run off the same barrier). A producer's claim can
/// only succeed once the slot it would reuse has cleared the
/// slowest (readmodel) cursor — this is what makes "ring full" block
/// the producer rather than silently drop an event.
pub struct RingBuffer {
    capacity: u64,
    mask: u64,
    slots: Vec<Mutex<Slot>>,
    /// For slot `i`, the sequence number last published there, or
    /// `u64::MAX` if slot `i` has never been published (guards against
    /// a consumer racing ahead into a not-yet-written lap).
    published: Vec<AtomicU64>,
    claimed: AtomicU64,
    apply_cursor: AtomicU64,
    journal_cursor: AtomicU64,
    readmodel_cursor: AtomicU64,
    producer_gate: Notify,
    apply_gate: Notify,
    journal_gate: Notify,
    readmodel_gate: Notify,
}

/// Sentinel meaning "this slot has not been published in the current
/// lap" — distinct from any real sequence number producers emit.
const UNPUBLISHED: u64 = u64::MAX;

impl RingBuffer {
    /// Build a new ring. `capacity` must be a power of two (checked by
    /// [`crate::config::LedgerConfig::is_valid`] before construction;
    /// this constructor trusts its caller).
    pub fn new(capacity: usize) -> Self {
        debug_assert!(capacity > 0 && capacity.is_power_of_two());
        let mut slots = Vec::with_capacity(capacity);
        let mut published = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            slots.push(Mutex::new(Slot::default()));
            published.push(AtomicU64::new(UNPUBLISHED));
        }
        Self {
            capacity: capacity as u64,
            mask: capacity as u64 - 1,
            slots,
            published,
            claimed: AtomicU64::new(0),
            apply_cursor: AtomicU64::new(0),
            journal_cursor: AtomicU64::new(0),
            readmodel_cursor: AtomicU64::new(0),
            producer_gate: Notify::new(),
            apply_gate: Notify::new(),
            journal_gate: Notify::new(),
            readmodel_gate: Notify::new(),
        }
    }

    /// Ring capacity (always a power of two).
    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    fn index(&self, sequence: u64) -> usize {
        (sequence & self.mask) as usize
    }

    /// Claim the next sequence number, blocking (cooperatively) until
    /// the slot it maps to has been fully drained by the slowest
    /// (read-model) consumer. Returns the claimed sequence; the caller
    /// must [`write`](Self::write) and then [`publish`](Self::publish)
    /// it.
    pub async fn claim(&self) -> u64 {
        let sequence = self.claimed.fetch_add(1, Ordering::AcqRel);
        loop {
            // Register for the next notification before re-checking the
            // condition: if we checked first, a `complete_readmodel` that
            // drains the slot and calls `notify_waiters` between our check
            // and the `notified().await` below would be lost forever.
            let notified = self.producer_gate.notified();
            let drained = self.readmodel_cursor.load(Ordering::Acquire);
            if sequence < drained + self.capacity {
                return sequence;
            }
            notified.await;
        }
    }

    /// Write a command into the slot claimed at `sequence`. Must be
    /// called by the claimer before [`publish`](Self::publish).
    pub fn write(&self, sequence: u64, command: AccountCommand) {
        let mut slot = self.slots[self.index(sequence)].lock().expect("slot lock poisoned");
        slot.command = Some(command);
        slot.event = None;
        slot.end_of_batch = false;
    }

    /// Make a written slot visible to the apply stage. `end_of_batch`
    /// tells the journal and read-model stages this is (as of
    /// publish time) the last immediately-available event, so they
    /// should flush rather than keep buffering.
    pub fn publish(&self, sequence: u64, end_of_batch: bool) {
        {
            let mut slot = self.slots[self.index(sequence)].lock().expect("slot lock poisoned");
            slot.end_of_batch = end_of_batch;
        }
        self.published[self.index(sequence)].store(sequence, Ordering::Release);
        self.apply_gate.notify_waiters();
    }

    /// Block until `sequence` has been published.
    async fn wait_published(&self, sequence: u64) {
        loop {
            let notified = self.apply_gate.notified();
            if self.published[self.index(sequence)].load(Ordering::Acquire) == sequence {
                return;
            }
            notified.await;
        }
    }

    /// The apply stage's read half: wait for the next sequence after
    /// its cursor to be published, then hand a clone of its command
    /// (plus `end_of_batch`) to the caller. Does not advance the
    /// cursor — callers do async work (loading the aggregate) between
    /// this and [`complete_apply`](Self::complete_apply).
    pub async fn wait_for_apply(&self) -> (u64, AccountCommand, bool) {
        let sequence = self.apply_cursor.load(Ordering::Acquire);
        self.wait_published(sequence).await;
        let (command, end_of_batch) = {
            let slot = self.slots[self.index(sequence)].lock().expect("slot lock poisoned");
            (
                slot.command.clone().expect("published slot has no command"),
                slot.end_of_batch,
            )
        };
        (sequence, command, end_of_batch)
    }

    /// Write the apply stage's outcome back into `sequence`'s slot,
    /// advance the apply cursor, and wake the journal stage. This is
    /// the point at which a business failure becomes a recorded FAIL
    /// fact (§7): `event` is whatever the apply stage decided, already
    /// rewritten to `EventKind::Fail` if the command was rejected.
    pub fn complete_apply(&self, sequence: u64, event: AccountEvent) {
        {
            let mut slot = self.slots[self.index(sequence)].lock().expect("slot lock poisoned");
            slot.event = Some(event);
        }
        self.apply_cursor.store(sequence + 1, Ordering::Release);
        self.journal_gate.notify_waiters();
    }

    /// The journal stage's read half: wait until the apply stage has
    /// processed `sequence`, then hand a clone of its resulting event
    /// (plus `end_of_batch`) to the caller.
    pub async fn wait_for_journal(&self) -> (u64, AccountEvent, bool) {
        let sequence = self.journal_cursor.load(Ordering::Acquire);
        loop {
            let notified = self.journal_gate.notified();
            if self.apply_cursor.load(Ordering::Acquire) > sequence {
                break;
            }
            notified.await;
        }
        let (event, end_of_batch) = {
            let slot = self.slots[self.index(sequence)].lock().expect("slot lock poisoned");
            (
                slot.event.clone().expect("applied slot has no event"),
                slot.end_of_batch,
            )
        };
        (sequence, event, end_of_batch)
    }

    /// Advance the journal cursor past `sequence` once its batch has
    /// been durably appended, and wake the read-model stage.
    pub fn complete_journal(&self, sequence: u64) {
        self.journal_cursor.store(sequence + 1, Ordering::Release);
        self.readmodel_gate.notify_waiters();
    }

    /// The read-model/snapshot-tick stage's read half: wait until the
    /// journal stage has durably appended `sequence`, then hand a
    /// clone of its event (plus `end_of_batch`) to the caller.
    pub async fn wait_for_readmodel(&self) -> (u64, AccountEvent, bool) {
        let sequence = self.readmodel_cursor.load(Ordering::Acquire);
        loop {
            let notified = self.readmodel_gate.notified();
            if self.journal_cursor.load(Ordering::Acquire) > sequence {
                break;
            }
            notified.await;
        }
        let (event, end_of_batch) = {
            let slot = self.slots[self.index(sequence)].lock().expect("slot lock poisoned");
            (
                slot.event.clone().expect("applied slot has no event"),
                slot.end_of_batch,
            )
        };
        (sequence, event, end_of_batch)
    }

    /// Advance the read-model cursor past `sequence` — the slowest
    /// cursor, which is what actually frees the slot for producers —
    /// and wake any blocked producers.
    pub fn complete_readmodel(&self, sequence: u64) {
        self.readmodel_cursor.store(sequence + 1, Ordering::Release);
        self.producer_gate.notify_waiters();
    }

    /// Current apply cursor, for diagnostics and tests.
    pub fn apply_sequence(&self) -> u64 {
        self.apply_cursor.load(Ordering::Acquire)
    }

    /// Current journal cursor, for diagnostics and tests.
    pub fn journal_sequence(&self) -> u64 {
        self.journal_cursor.load(Ordering::Acquire)
    }

    /// Current read-model cursor, for diagnostics and tests.
    pub fn readmodel_sequence(&self) -> u64 {
        self.readmodel_cursor.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifiers::{AccountId, TransactionId};
    use rust_decimal::Decimal;

    fn command() -> AccountCommand {
        AccountCommand::deposit(AccountId::new(), Decimal::new(1, 0), TransactionId::new())
    }

    #[test]
    fn capacity_reports_what_was_constructed() {
        let ring = RingBuffer::new(16);
        assert_eq!(ring.capacity(), 16);
    }

    fn event() -> AccountEvent {
        AccountEvent {
            account_id: AccountId::new(),
            amount: rust_decimal::Decimal::new(1, 0),
            kind: crate::domain::EventKind::Deposit,
            transaction_id: TransactionId::new(),
            target_account_id: None,
            description: None,
            occurred_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn claim_write_publish_round_trips_through_all_three_stages() {
        let ring = RingBuffer::new(4);
        let seq = ring.claim().await;
        ring.write(seq, command());
        ring.publish(seq, true);

        let (apply_seq, seen_command, _) = ring.wait_for_apply().await;
        assert_eq!(apply_seq, seq);
        assert_eq!(seen_command, command());
        ring.complete_apply(apply_seq, event());

        let (journal_seq, _seen_event, _) = ring.wait_for_journal().await;
        assert_eq!(journal_seq, seq);
        ring.complete_journal(journal_seq);

        let (readmodel_seq, _seen_event, _) = ring.wait_for_readmodel().await;
        assert_eq!(readmodel_seq, seq);
        ring.complete_readmodel(readmodel_seq);

        assert_eq!(ring.apply_sequence(), seq + 1);
        assert_eq!(ring.journal_sequence(), seq + 1);
        assert_eq!(ring.readmodel_sequence(), seq + 1);
    }

    #[tokio::test]
    async fn producer_blocks_until_readmodel_stage_drains_the_slot_it_would_reuse() {
        let ring = RingBuffer::new(2);
        for _ in 0..2 {
            let seq = ring.claim().await;
            ring.write(seq, command());
            ring.publish(seq, false);
        }

        let claim_third = tokio::time::timeout(std::time::Duration::from_millis(50), ring.claim()).await;
        assert!(claim_third.is_err(), "ring full: claim must block, not silently drop");

        let (seq, _, _) = ring.wait_for_apply().await;
        ring.complete_apply(seq, event());
        let (seq, _, _) = ring.wait_for_journal().await;
        ring.complete_journal(seq);
        let (seq, _, _) = ring.wait_for_readmodel().await;
        ring.complete_readmodel(seq);

        let claimed = tokio::time::timeout(std::time::Duration::from_millis(50), ring.claim()).await;
        assert!(claimed.is_ok(), "slot freed after full drain, claim should succeed");
    }
}
