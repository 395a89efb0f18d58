// Copyright 2025 Cowboy AI, LLC.

//! The choreographed Saga (§4.4): no central orchestrator state
//! machine, just a coordinator that reacts to one event at a time and
//! decides at most one outbound command.

pub mod coordinator;

pub use coordinator::SagaCoordinator;
