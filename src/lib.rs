// Copyright 2025 Cowboy AI, LLC.

//! # ledger-core
//!
//! A single-writer, event-sourced account ledger with cross-account
//! money transfers coordinated by a choreographed Saga.
//!
//! ## Layout
//!
//! - [`domain`] — the `Account` aggregate, its commands and events.
//!   Pure, synchronous, no I/O.
//! - [`ring`] — the single-writer ring pipeline: a bounded buffer with
//!   ordered apply/journal/read-model/snapshot-tick consumer stages.
//! - [`infrastructure`] — the Event Log and Relational Store port
//!   traits, their Postgres/NATS adapters and in-memory test doubles,
//!   plus the Aggregate Loader that sits on top of both.
//! - [`saga`] — the choreographed Saga Coordinator driving two-phase
//!   transfers and their compensation.
//! - [`projector`] — the buffered, checkpointed read-model projector.
//! - [`watcher`] — the Timeout Watcher that recovers stalled transfers.
//! - [`janitor`] — snapshot emission and retention pruning.
//! - [`command_bus`] — the narrow port every command producer depends
//!   on to reach the ring.
//! - [`config`] — every tunable, with its documented default.
//! - [`errors`] — one error enum per fallible component, composed into
//!   [`errors::LedgerError`].
//! - [`identifiers`] — newtype identifiers (`AccountId`, `TransactionId`)
//!   and the `SagaStep` enum.

#![warn(missing_docs)]

pub mod command_bus;
pub mod config;
pub mod domain;
pub mod errors;
pub mod identifiers;
pub mod infrastructure;
pub mod janitor;
pub mod projector;
pub mod ring;
pub mod saga;
pub mod watcher;

pub use command_bus::{CommandBus, RingCommandBus};
pub use config::LedgerConfig;
pub use domain::{Account, AccountCommand, AccountEvent, CommandKind, EventKind};
pub use errors::{DomainError, LedgerError};
pub use identifiers::{AccountId, SagaStep, TransactionId};
pub use janitor::SnapshotJanitor;
pub use projector::Projector;
pub use ring::{RingBuffer, RingPipeline};
pub use saga::SagaCoordinator;
pub use watcher::TimeoutWatcher;
