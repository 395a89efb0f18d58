// Copyright 2025 Cowboy AI, LLC.

//! Infrastructure adapters: the Event Log Adapter and the Relational
//! Store Adapter (§6), plus the Aggregate Loader that sits on top of
//! both. Everything here is an implementation of a narrow port trait;
//! domain and pipeline code depends on the trait, never the adapter.

pub mod aggregate_loader;
pub mod event_log;
pub mod relational_store;

pub use aggregate_loader::AggregateLoader;
pub use event_log::{CatchUpSubscription, DeliveryHandle, EventLog, InMemoryEventLog, PersistentSubscription};
pub use relational_store::{
    CheckpointStore, IdempotencyStore, InMemoryCheckpointStore, InMemoryIdempotencyStore,
    InMemoryReadModelStore, InMemorySnapshotRepository, PgCheckpointStore, PgIdempotencyStore,
    PgReadModelStore, PgSnapshotRepository, ReadModelStore, SnapshotRepository,
};
