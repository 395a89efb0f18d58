// Copyright 2025 Cowboy AI, LLC.

//! The `EventLog` port: the narrow slice of an append-only event
//! store this ledger actually uses (§6). Everything else the log
//! might offer (multi-stream projections, arbitrary querying) is
//! deliberately not exposed here.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_nats::jetstream::{self, consumer::AckPolicy, consumer::DeliverPolicy, consumer::pull::Config as PullConfig};
use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::domain::{AccountEvent, GlobalPosition, RecordedEvent};
use crate::errors::StoreError;

/// A subscription handed out by [`EventLog::subscribe_catch_up`]: a
/// push-based feed the Projector drains event-by-event, acknowledging
/// (advancing its checkpoint) only after each delivery is processed.
#[async_trait]
pub trait CatchUpSubscription: Send {
    /// Await the next event. `None` means the subscription ended
    /// (log adapter shut down); it is not a normal end-of-stream
    /// signal, since catch-up subscriptions never naturally end.
    async fn next(&mut self) -> Option<RecordedEvent>;
}

/// An opaque handle identifying one delivery of a persistent
/// (competing-consumer) subscription, to be passed back to
/// `ack`/`nack_retry`/`nack_park`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryHandle(pub u64);

/// A subscription handed out by [`EventLog::subscribe_persistent`]:
/// server-tracked redelivery with an ack timeout and a bounded retry
/// count, used by the Saga so a delivery failure doesn't silently
/// lose a compensation decision.
#[async_trait]
pub trait PersistentSubscription: Send {
    /// Await the next delivery.
    async fn next(&mut self) -> Option<(RecordedEvent, DeliveryHandle)>;
    /// Confirm successful processing.
    async fn ack(&mut self, handle: DeliveryHandle) -> Result<(), StoreError>;
    /// Request a server-side retry (redelivery), counted against the
    /// subscription's max-retries limit.
    async fn nack_retry(&mut self, handle: DeliveryHandle) -> Result<(), StoreError>;
    /// Move the message to the parked queue; it will not be
    /// redelivered automatically.
    async fn nack_park(&mut self, handle: DeliveryHandle) -> Result<(), StoreError>;
}

/// Thin contract over an append-only, per-stream event log (§6).
///
/// Stream naming follows `Account-<accountId>` throughout; this trait
/// never sees that convention directly — callers pass the fully
/// formed stream name (see [`crate::identifiers::AccountId::stream_name`]).
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Durably append `events` to `stream`. The journal stage awaits
    /// this and halts the pipeline on error (§7).
    async fn append_to_stream(&self, stream: &str, events: &[AccountEvent]) -> Result<(), StoreError>;

    /// Read a single stream starting after `from_sequence` (`0` reads
    /// the whole stream). Used by the Aggregate Loader's replay path.
    async fn read_stream_from(
        &self,
        stream: &str,
        from_sequence: u64,
    ) -> Result<Vec<AccountEvent>, StoreError>;

    /// Scan the global (`$all`) ordering backward from the current
    /// end, up to `depth` events, most recent first. Used by the
    /// Timeout Watcher to reconstruct an original `WITHDRAW`.
    async fn read_all_backward(&self, depth: usize) -> Result<Vec<RecordedEvent>, StoreError>;

    /// Open a catch-up subscription over the global stream, resuming
    /// from `from_position` (or the start of the log if never
    /// checkpointed). Used by the Projector.
    async fn subscribe_catch_up(
        &self,
        from_position: GlobalPosition,
    ) -> Result<Box<dyn CatchUpSubscription>, StoreError>;

    /// Open (or join) a persistent, competing-consumer subscription
    /// named `group`. Used by the Saga.
    async fn subscribe_persistent(
        &self,
        group: &str,
    ) -> Result<Box<dyn PersistentSubscription>, StoreError>;
}

/// In-memory [`EventLog`] used by tests, benchmarks, and any
/// deployment that doesn't need a real broker. Keeps one append-only
/// `Vec` per stream plus a single interleaved global log used for
/// backward scans and subscriptions.
#[derive(Default)]
pub struct InMemoryEventLog {
    inner: Mutex<InMemoryLogState>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<RecordedEvent>>>,
}

#[derive(Default)]
struct InMemoryLogState {
    streams: std::collections::HashMap<String, Vec<AccountEvent>>,
    global: Vec<RecordedEvent>,
}

impl InMemoryEventLog {
    /// An empty log.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventLog for InMemoryEventLog {
    async fn append_to_stream(&self, stream: &str, events: &[AccountEvent]) -> Result<(), StoreError> {
        let mut guard = self.inner.lock().map_err(|_| StoreError::Storage("log lock poisoned".into()))?;
        let mut recorded = Vec::with_capacity(events.len());
        for event in events {
            let stream_events = guard.streams.entry(stream.to_string()).or_default();
            let stream_sequence = stream_events.len() as u64;
            stream_events.push(event.clone());

            let global_position = GlobalPosition {
                commit: guard.global.len() as u64,
                prepare: guard.global.len() as u64,
            };
            let record = RecordedEvent {
                event: event.clone(),
                stream: stream.to_string(),
                stream_sequence,
                global_position,
            };
            guard.global.push(record.clone());
            recorded.push(record);
        }
        drop(guard);

        let subscribers = self.subscribers.lock().map_err(|_| StoreError::Storage("subscriber lock poisoned".into()))?;
        for record in recorded {
            for sender in subscribers.iter() {
                let _ = sender.send(record.clone());
            }
        }
        Ok(())
    }

    async fn read_stream_from(
        &self,
        stream: &str,
        from_sequence: u64,
    ) -> Result<Vec<AccountEvent>, StoreError> {
        let guard = self.inner.lock().map_err(|_| StoreError::Storage("log lock poisoned".into()))?;
        Ok(guard
            .streams
            .get(stream)
            .map(|events| {
                events
                    .iter()
                    .skip(from_sequence as usize)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn read_all_backward(&self, depth: usize) -> Result<Vec<RecordedEvent>, StoreError> {
        let guard = self.inner.lock().map_err(|_| StoreError::Storage("log lock poisoned".into()))?;
        Ok(guard
            .global
            .iter()
            .rev()
            .take(depth)
            .cloned()
            .collect())
    }

    async fn subscribe_catch_up(
        &self,
        from_position: GlobalPosition,
    ) -> Result<Box<dyn CatchUpSubscription>, StoreError> {
        let guard = self.inner.lock().map_err(|_| StoreError::Storage("log lock poisoned".into()))?;
        let backlog: VecDeque<RecordedEvent> = guard
            .global
            .iter()
            .filter(|record| record.global_position.commit >= from_position.commit)
            .cloned()
            .collect();
        drop(guard);

        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .map_err(|_| StoreError::Storage("subscriber lock poisoned".into()))?
            .push(tx);

        Ok(Box::new(InMemoryCatchUp { backlog, live: rx }))
    }

    async fn subscribe_persistent(
        &self,
        _group: &str,
    ) -> Result<Box<dyn PersistentSubscription>, StoreError> {
        let guard = self.inner.lock().map_err(|_| StoreError::Storage("log lock poisoned".into()))?;
        let backlog: VecDeque<RecordedEvent> = guard.global.iter().cloned().collect();
        drop(guard);

        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .map_err(|_| StoreError::Storage("subscriber lock poisoned".into()))?
            .push(tx);

        Ok(Box::new(InMemoryPersistent {
            backlog,
            live: rx,
            next_handle: 0,
        }))
    }
}

struct InMemoryCatchUp {
    backlog: VecDeque<RecordedEvent>,
    live: mpsc::UnboundedReceiver<RecordedEvent>,
}

#[async_trait]
impl CatchUpSubscription for InMemoryCatchUp {
    async fn next(&mut self) -> Option<RecordedEvent> {
        if let Some(event) = self.backlog.pop_front() {
            return Some(event);
        }
        self.live.recv().await
    }
}

struct InMemoryPersistent {
    backlog: VecDeque<RecordedEvent>,
    live: mpsc::UnboundedReceiver<RecordedEvent>,
    next_handle: u64,
}

#[async_trait]
impl PersistentSubscription for InMemoryPersistent {
    async fn next(&mut self) -> Option<(RecordedEvent, DeliveryHandle)> {
        let event = if let Some(event) = self.backlog.pop_front() {
            event
        } else {
            self.live.recv().await?
        };
        let handle = DeliveryHandle(self.next_handle);
        self.next_handle += 1;
        Some((event, handle))
    }

    async fn ack(&mut self, _handle: DeliveryHandle) -> Result<(), StoreError> {
        Ok(())
    }

    async fn nack_retry(&mut self, _handle: DeliveryHandle) -> Result<(), StoreError> {
        Ok(())
    }

    async fn nack_park(&mut self, _handle: DeliveryHandle) -> Result<(), StoreError> {
        tracing::warn!("message parked after exceeding max retries");
        Ok(())
    }
}

/// Subject prefix every stream is published under, so a single
/// JetStream stream (`subjects: ["accounts.>"]`) carries every
/// account's events and a catch-up subscriber can filter to one
/// account or take them all (§6).
const SUBJECT_PREFIX: &str = "accounts";

/// How long a bounded fetch (`read_stream_from`, `read_all_backward`)
/// waits for JetStream to hand back a batch before giving up on an
/// empty stream.
const FETCH_EXPIRES: Duration = Duration::from_millis(500);

/// Batch size for the bounded pulls backing `read_stream_from` and
/// `read_all_backward`. Generous enough that one fetch usually covers
/// an account's whole history; callers needing more would need a
/// paged API this port doesn't expose (§6 Non-goals).
const FETCH_BATCH: usize = 10_000;

const CATCH_UP_CHANNEL_CAPACITY: usize = 256;
const PERSISTENT_CHANNEL_CAPACITY: usize = 256;

/// Configuration for [`JetStreamEventLog`].
pub struct JetStreamEventLogConfig {
    /// Name of the JetStream stream backing every account's events.
    pub stream_name: String,
}

impl Default for JetStreamEventLogConfig {
    fn default() -> Self {
        Self {
            stream_name: "ledger-events".to_string(),
        }
    }
}

/// Production [`EventLog`] backed by NATS JetStream. One stream holds
/// every account's events under `accounts.<streamName>` subjects;
/// per-stream reads and the global backward scan both work by
/// filtering an ephemeral pull consumer to the subject they need.
pub struct JetStreamEventLog {
    client: async_nats::Client,
    stream_name: String,
}

impl JetStreamEventLog {
    /// Connect to (or adopt) the configured stream, creating it with
    /// file-backed, size/age-limited retention if it doesn't exist yet
    /// (mirrors the teacher's `JetStreamEventStore::new`).
    pub async fn new(client: async_nats::Client, config: JetStreamEventLogConfig) -> Result<Self, StoreError> {
        let js = jetstream::new(client.clone());
        js.create_stream(jetstream::stream::Config {
            name: config.stream_name.clone(),
            subjects: vec![format!("{SUBJECT_PREFIX}.>")],
            retention: jetstream::stream::RetentionPolicy::Limits,
            storage: jetstream::stream::StorageType::File,
            ..Default::default()
        })
        .await
        .map_err(|error| StoreError::Storage(format!("failed to create/adopt event stream: {error}")))?;

        Ok(Self {
            client,
            stream_name: config.stream_name,
        })
    }

    fn subject(stream: &str) -> String {
        format!("{SUBJECT_PREFIX}.{stream}")
    }

    async fn ephemeral_consumer(
        &self,
        filter_subject: String,
        deliver_policy: DeliverPolicy,
    ) -> Result<jetstream::consumer::PullConsumer, StoreError> {
        let js = jetstream::new(self.client.clone());
        let stream = js
            .get_stream(&self.stream_name)
            .await
            .map_err(|error| StoreError::Storage(format!("failed to get stream: {error}")))?;

        stream
            .create_consumer(PullConfig {
                durable_name: None,
                filter_subject,
                deliver_policy,
                ack_policy: AckPolicy::None,
                ..Default::default()
            })
            .await
            .map_err(|error| StoreError::Storage(format!("failed to create consumer: {error}")))
    }
}

#[async_trait]
impl EventLog for JetStreamEventLog {
    async fn append_to_stream(&self, stream: &str, events: &[AccountEvent]) -> Result<(), StoreError> {
        let js = jetstream::new(self.client.clone());
        let subject = Self::subject(stream);
        for event in events {
            let payload = serde_json::to_vec(event)
                .map_err(|error| StoreError::Storage(format!("failed to serialise event: {error}")))?;
            // Awaiting the publish future sends the message; awaiting
            // the ack future it resolves to waits for the stream to
            // confirm durability (§7: the journal stage must not move
            // on until the append is actually safe).
            js.publish(subject.clone(), bytes::Bytes::from(payload))
                .await
                .map_err(|error| StoreError::Storage(format!("failed to publish event: {error}")))?
                .await
                .map_err(|error| StoreError::Storage(format!("publish not acknowledged: {error}")))?;
        }
        Ok(())
    }

    async fn read_stream_from(
        &self,
        stream: &str,
        from_sequence: u64,
    ) -> Result<Vec<AccountEvent>, StoreError> {
        let consumer = self
            .ephemeral_consumer(Self::subject(stream), DeliverPolicy::All)
            .await?;

        let mut messages = consumer
            .fetch()
            .max_messages(FETCH_BATCH)
            .expires(FETCH_EXPIRES)
            .messages()
            .await
            .map_err(|error| StoreError::Storage(format!("failed to fetch messages: {error}")))?;

        let mut events = Vec::new();
        let mut index = 0u64;
        while let Some(message) = messages.next().await {
            let message = message.map_err(|error| StoreError::Storage(format!("stream error: {error}")))?;
            if index >= from_sequence {
                let event: AccountEvent = serde_json::from_slice(&message.payload)
                    .map_err(|error| StoreError::Storage(format!("failed to deserialise event: {error}")))?;
                events.push(event);
            }
            index += 1;
        }
        Ok(events)
    }

    async fn read_all_backward(&self, depth: usize) -> Result<Vec<RecordedEvent>, StoreError> {
        let consumer = self
            .ephemeral_consumer(format!("{SUBJECT_PREFIX}.>"), DeliverPolicy::All)
            .await?;

        let mut messages = consumer
            .fetch()
            .max_messages(FETCH_BATCH)
            .expires(FETCH_EXPIRES)
            .messages()
            .await
            .map_err(|error| StoreError::Storage(format!("failed to fetch messages: {error}")))?;

        let mut forward = Vec::new();
        while let Some(message) = messages.next().await {
            let message = message.map_err(|error| StoreError::Storage(format!("stream error: {error}")))?;
            forward.push(decode_recorded_event(&message)?);
        }

        forward.reverse();
        forward.truncate(depth);
        Ok(forward)
    }

    async fn subscribe_catch_up(
        &self,
        from_position: GlobalPosition,
    ) -> Result<Box<dyn CatchUpSubscription>, StoreError> {
        let deliver_policy = if from_position.commit == 0 {
            DeliverPolicy::All
        } else {
            DeliverPolicy::ByStartSequence {
                start_sequence: from_position.commit + 1,
            }
        };
        let consumer = self
            .ephemeral_consumer(format!("{SUBJECT_PREFIX}.>"), deliver_policy)
            .await?;

        let mut messages = consumer
            .messages()
            .await
            .map_err(|error| StoreError::Storage(format!("failed to open message stream: {error}")))?;

        let (tx, rx) = mpsc::channel(CATCH_UP_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            while let Some(Ok(message)) = messages.next().await {
                let record = match decode_recorded_event(&message) {
                    Ok(record) => record,
                    Err(error) => {
                        tracing::warn!(%error, "dropping undecodable catch-up message");
                        continue;
                    }
                };
                if tx.send(record).await.is_err() {
                    break;
                }
            }
        });

        Ok(Box::new(JetStreamCatchUp {
            inner: ReceiverStream::new(rx),
        }))
    }

    async fn subscribe_persistent(
        &self,
        group: &str,
    ) -> Result<Box<dyn PersistentSubscription>, StoreError> {
        let js = jetstream::new(self.client.clone());
        let stream = js
            .get_stream(&self.stream_name)
            .await
            .map_err(|error| StoreError::Storage(format!("failed to get stream: {error}")))?;

        let consumer = stream
            .create_consumer(PullConfig {
                durable_name: Some(group.to_string()),
                filter_subject: format!("{SUBJECT_PREFIX}.>"),
                deliver_policy: DeliverPolicy::All,
                ack_policy: AckPolicy::Explicit,
                ..Default::default()
            })
            .await
            .map_err(|error| StoreError::Storage(format!("failed to create durable consumer: {error}")))?;

        let mut messages = consumer
            .messages()
            .await
            .map_err(|error| StoreError::Storage(format!("failed to open message stream: {error}")))?;

        let (tx, rx) = mpsc::channel(PERSISTENT_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            while let Some(Ok(message)) = messages.next().await {
                let record = match decode_recorded_event(&message) {
                    Ok(record) => record,
                    Err(error) => {
                        tracing::warn!(%error, "dropping undecodable persistent-subscription message");
                        continue;
                    }
                };
                if tx.send((record, message)).await.is_err() {
                    break;
                }
            }
        });

        Ok(Box::new(JetStreamPersistent {
            inner: ReceiverStream::new(rx),
            pending: HashMap::new(),
            next_handle: 0,
        }))
    }
}

/// Decode a JetStream message's payload back into a [`RecordedEvent`],
/// using the broker's own stream sequence as both the per-stream and
/// global ordinal. `RecordedEvent::stream_sequence` is only ever
/// assigned by this port, never compared against, so the approximation
/// is safe.
fn decode_recorded_event(message: &jetstream::Message) -> Result<RecordedEvent, StoreError> {
    let event: AccountEvent = serde_json::from_slice(&message.payload)
        .map_err(|error| StoreError::Storage(format!("failed to deserialise event: {error}")))?;
    let info = message
        .info()
        .map_err(|error| StoreError::Storage(format!("failed to read message metadata: {error}")))?;
    let sequence = info.stream_sequence;

    Ok(RecordedEvent {
        event,
        stream: message.subject.to_string(),
        stream_sequence: sequence,
        global_position: GlobalPosition {
            commit: sequence,
            prepare: sequence,
        },
    })
}

struct JetStreamCatchUp {
    inner: ReceiverStream<RecordedEvent>,
}

#[async_trait]
impl CatchUpSubscription for JetStreamCatchUp {
    async fn next(&mut self) -> Option<RecordedEvent> {
        self.inner.next().await
    }
}

struct JetStreamPersistent {
    inner: ReceiverStream<(RecordedEvent, jetstream::Message)>,
    pending: HashMap<u64, jetstream::Message>,
    next_handle: u64,
}

#[async_trait]
impl PersistentSubscription for JetStreamPersistent {
    async fn next(&mut self) -> Option<(RecordedEvent, DeliveryHandle)> {
        let (record, message) = self.inner.next().await?;
        let handle = DeliveryHandle(self.next_handle);
        self.next_handle += 1;
        self.pending.insert(handle.0, message);
        Some((record, handle))
    }

    async fn ack(&mut self, handle: DeliveryHandle) -> Result<(), StoreError> {
        if let Some(message) = self.pending.remove(&handle.0) {
            message
                .ack()
                .await
                .map_err(|error| StoreError::Storage(format!("ack failed: {error}")))?;
        }
        Ok(())
    }

    async fn nack_retry(&mut self, handle: DeliveryHandle) -> Result<(), StoreError> {
        if let Some(message) = self.pending.remove(&handle.0) {
            message
                .ack_with(jetstream::AckKind::Nak(None))
                .await
                .map_err(|error| StoreError::Storage(format!("nack failed: {error}")))?;
        }
        Ok(())
    }

    async fn nack_park(&mut self, handle: DeliveryHandle) -> Result<(), StoreError> {
        if let Some(message) = self.pending.remove(&handle.0) {
            message
                .ack_with(jetstream::AckKind::Term)
                .await
                .map_err(|error| StoreError::Storage(format!("terminal nack failed: {error}")))?;
        }
        tracing::warn!("message parked after exceeding max retries");
        Ok(())
    }
}

#[cfg(test)]
mod jetstream_tests {
    use super::*;

    #[test]
    fn default_config_names_the_ledger_events_stream() {
        let config = JetStreamEventLogConfig::default();
        assert_eq!(config.stream_name, "ledger-events");
    }

    #[test]
    fn subject_is_namespaced_under_the_accounts_prefix() {
        assert_eq!(
            JetStreamEventLog::subject("Account-123"),
            "accounts.Account-123"
        );
    }
}
