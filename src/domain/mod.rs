// Copyright 2025 Cowboy AI, LLC.

//! The ledger's single aggregate and the facts it produces.
//!
//! Everything here is pure, synchronous, and allocation-light on the
//! hot path: no I/O, no async, no knowledge of the ring pipeline, the
//! event log, or the read model. Those are infrastructure concerns
//! layered on top in [`crate::infrastructure`], [`crate::ring`],
//! [`crate::saga`], [`crate::projector`], and [`crate::watcher`].

pub mod account;
pub mod events;

pub use account::{Account, AccountCommand, CommandKind, Snapshot};
pub use events::{
    AccountEvent, EventKind, GlobalPosition, RecordedEvent, COMPENSATION,
    SAGA_SILENCE_SENTINEL, TIMEOUT_RECOVERY_TRIGGER, TRANSFER_DEPOSIT,
};
