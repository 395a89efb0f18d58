// Copyright 2025 Cowboy AI, LLC.

//! The single-writer ring pipeline (§4.1): a bounded buffer with a
//! producer side and three ordered consumer stages (apply, journal,
//! read-model/snapshot-tick).

pub mod buffer;
pub mod pipeline;

pub use buffer::{RingBuffer, Slot};
pub use pipeline::RingPipeline;
