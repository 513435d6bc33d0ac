use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::PipelineError;

/// Event type identifier; the actor registry is keyed by it.
#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventType(String);

impl EventType {
    /// A concrete blob unit is ready for parse and push.
    pub const BLOB_FILE_ARRIVED: &'static str = "BlobFileArrived";
    /// A key range needs resolving into per-key units.
    pub const SHARD_RANGE_ARRIVED: &'static str = "ShardRangeArrived";
    /// A partition key or time bucket is ready to be read.
    pub const SHARD_KEY_ARRIVED: &'static str = "ShardKeyArrived";

    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn blob_file_arrived() -> Self {
        Self::new(Self::BLOB_FILE_ARRIVED)
    }

    pub fn shard_range_arrived() -> Self {
        Self::new(Self::SHARD_RANGE_ARRIVED)
    }

    pub fn shard_key_arrived() -> Self {
        Self::new(Self::SHARD_KEY_ARRIVED)
    }
}

impl Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EventType {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for EventType {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Unique identifier for an enqueued envelope.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct EnvelopeId(pub Uuid);

impl Default for EnvelopeId {
    fn default() -> Self {
        Self::new()
    }
}

impl EnvelopeId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Display for EnvelopeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An event produced by a scheduler or actor, before it is enqueued.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_type: EventType,
    pub body: serde_json::Value,
}

impl Event {
    pub fn new<T: Serialize>(
        event_type: impl Into<EventType>,
        body: &T,
    ) -> Result<Self, PipelineError> {
        Ok(Self {
            event_type: event_type.into(),
            body: serde_json::to_value(body)?,
        })
    }

    pub fn body_as<T: DeserializeOwned>(&self) -> Result<T, PipelineError> {
        Ok(serde_json::from_value(self.body.clone())?)
    }
}

/// Delivery metadata attached by the queue.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnvelopeMeta {
    /// Deliveries so far, including the current one.
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
    /// Shared by every envelope descended from the same discovery.
    pub correlation_id: Uuid,
}

/// A typed message as delivered by the queue.
///
/// The body is opaque to the queue; only the consuming actor interprets it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub id: EnvelopeId,
    pub event_type: EventType,
    pub body: serde_json::Value,
    pub meta: EnvelopeMeta,
}

impl EventEnvelope {
    pub fn new(event: Event, correlation_id: Option<Uuid>) -> Self {
        Self {
            id: EnvelopeId::new(),
            event_type: event.event_type,
            body: event.body,
            meta: EnvelopeMeta {
                attempts: 0,
                enqueued_at: Utc::now(),
                correlation_id: correlation_id.unwrap_or_else(Uuid::now_v7),
            },
        }
    }

    pub fn body_as<T: DeserializeOwned>(&self) -> Result<T, PipelineError> {
        Ok(serde_json::from_value(self.body.clone())?)
    }
}

/// Lifecycle notifications published by the scheduler and dispatch loops.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum PipelineEvent {
    /// A scheduling pass enqueued discovery events for a source.
    UnitsDiscovered { source: String, count: usize },
    /// A source failed during a scheduling pass and was skipped.
    SourceFailed { source: String, error: String },
    /// An envelope was handed to its actor.
    Dispatched {
        envelope_id: EnvelopeId,
        event_type: EventType,
        attempt: u32,
    },
    /// The actor succeeded; follow-ons were enqueued and the envelope acked.
    Completed {
        envelope_id: EnvelopeId,
        event_type: EventType,
        follow_ons: usize,
    },
    /// The actor failed; the envelope was left for redelivery.
    Failed {
        envelope_id: EnvelopeId,
        event_type: EventType,
        attempt: u32,
        error: String,
    },
    /// A stale or oversized unit was acknowledged without processing.
    Dropped {
        envelope_id: EnvelopeId,
        event_type: EventType,
        reason: String,
    },
    /// No actor is registered for the envelope's type.
    Unresolved {
        envelope_id: EnvelopeId,
        event_type: EventType,
    },
    /// The queue gave up on an envelope after its delivery budget.
    DeadLettered {
        envelope_id: EnvelopeId,
        event_type: EventType,
        attempts: u32,
    },
}

/// Generic event subscriber trait for receiving events of type `E`.
pub trait EventSubscriber<E>: Send + Sync
where
    E: Clone + Send + Sync + 'static,
{
    /// Subscribe to events, returning a broadcast receiver.
    fn subscribe(&self) -> broadcast::Receiver<E>;
}

/// In-process event bus using tokio broadcast channels.
///
/// Publishing never waits for slow subscribers: a subscriber that falls
/// more than `capacity` events behind receives `RecvError::Lagged`.
/// Events published with no subscribers are discarded.
pub struct InProcEventBus {
    sender: broadcast::Sender<PipelineEvent>,
    capacity: usize,
}

impl std::fmt::Debug for InProcEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcEventBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl Default for InProcEventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl InProcEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender, capacity }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Non-blocking publish.
    pub fn emit(&self, event: PipelineEvent) {
        let _ = self.sender.send(event);
    }
}

impl EventSubscriber<PipelineEvent> for InProcEventBus {
    fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.sender.subscribe()
    }
}
