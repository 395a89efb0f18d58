// Copyright 2025 Cowboy AI, LLC.

//! The `CommandBus` port (§9): the single way any producer — REST
//! handlers, the Saga, the Timeout Watcher — gets a command onto the
//! ring. No aspect-style interception; every producer builds a
//! command record and calls [`CommandBus::publish`] explicitly.

use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::AccountCommand;
use crate::errors::PipelineError;
use crate::ring::RingBuffer;

/// Narrow port every command producer depends on.
#[async_trait]
pub trait CommandBus: Send + Sync {
    /// Publish `command` onto the ring. Blocks (cooperatively, never
    /// drops) if the ring is full, per §8's "ring full: producer
    /// blocks" boundary behaviour.
    async fn publish(&self, command: AccountCommand) -> Result<(), PipelineError>;
}

/// The only [`CommandBus`] implementation: a thin wrapper over the
/// ring pipeline's buffer. Each publish is its own batch boundary —
/// the journal stage still buffers and batches internally (§4.1),
/// this just doesn't try to coalesce across independent publish calls
/// from unrelated producers.
pub struct RingCommandBus {
    ring: Arc<RingBuffer>,
}

impl RingCommandBus {
    /// Wrap a ring buffer shared with the pipeline's consumer stages.
    pub fn new(ring: Arc<RingBuffer>) -> Self {
        Self { ring }
    }
}

#[async_trait]
impl CommandBus for RingCommandBus {
    async fn publish(&self, command: AccountCommand) -> Result<(), PipelineError> {
        let sequence = self.ring.claim().await;
        self.ring.write(sequence, command);
        self.ring.publish(sequence, true);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifiers::{AccountId, TransactionId};
    use rust_decimal::Decimal;

    #[tokio::test]
    async fn publish_makes_the_command_visible_to_the_apply_stage() {
        let ring = Arc::new(RingBuffer::new(4));
        let bus = RingCommandBus::new(ring.clone());
        let command = AccountCommand::deposit(AccountId::new(), Decimal::new(10, 0), TransactionId::new());
        bus.publish(command.clone()).await.unwrap();

        let (_, seen, end_of_batch) = ring.wait_for_apply().await;
        assert_eq!(seen, command);
        assert!(end_of_batch);
    }
}
