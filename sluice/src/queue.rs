use std::collections::{HashMap, VecDeque};
use std::fmt::Display;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::events::{
    EnvelopeId, Event, EventEnvelope, EventType, InProcEventBus, PipelineEvent,
};
use crate::telemetry;

/// Handle for one delivery of an envelope; acknowledge or abandon with it.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct ReceiptId(pub Uuid);

impl ReceiptId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for ReceiptId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for ReceiptId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A received envelope, invisible to other receivers until `visible_until`.
#[derive(Clone, Debug)]
pub struct Delivery {
    pub receipt: ReceiptId,
    pub envelope: EventEnvelope,
    pub visible_until: DateTime<Utc>,
}

/// An envelope that exhausted its delivery budget.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeadLetter {
    pub envelope: EventEnvelope,
    pub last_error: Option<String>,
    pub dead_lettered_at: DateTime<Utc>,
}

/// At-least-once delivery of typed envelopes between workers.
///
/// An envelope that is neither acknowledged nor abandoned becomes visible
/// again once its visibility timeout passes. The queue, not its callers,
/// owns the retry budget and dead-letters envelopes that exhaust it.
#[async_trait]
pub trait EventQueue: Send + Sync {
    /// Enqueue an event. Follow-ons pass their parent's correlation id.
    async fn send(
        &self,
        event: Event,
        correlation_id: Option<Uuid>,
    ) -> anyhow::Result<EnvelopeId>;

    /// Enqueue several events sharing one correlation id.
    async fn send_many(
        &self,
        events: Vec<Event>,
        correlation_id: Option<Uuid>,
    ) -> anyhow::Result<Vec<EnvelopeId>> {
        let mut ids = Vec::with_capacity(events.len());
        for event in events {
            ids.push(self.send(event, correlation_id).await?);
        }
        Ok(ids)
    }

    /// Take the next visible envelope of `event_type`, if any.
    async fn receive(
        &self,
        event_type: &EventType,
    ) -> anyhow::Result<Option<Delivery>>;

    /// Remove a delivered envelope for good.
    async fn acknowledge(&self, receipt: ReceiptId) -> anyhow::Result<()>;

    /// Give a delivery back for redelivery after backoff.
    async fn abandon(
        &self,
        receipt: ReceiptId,
        error: Option<String>,
    ) -> anyhow::Result<()>;

    async fn dead_letters(
        &self,
        event_type: &EventType,
    ) -> anyhow::Result<Vec<DeadLetter>>;

    async fn snapshot(&self) -> anyhow::Result<QueueSnapshot>;
}

/// Snapshot of queue state at a point in time.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub sampled_at: DateTime<Utc>,
    pub queues: HashMap<String, QueueSnapshotEntry>,
}

impl QueueSnapshot {
    pub fn new(sampled_at: DateTime<Utc>) -> Self {
        Self {
            sampled_at,
            queues: HashMap::new(),
        }
    }

    /// Get or create an entry for an event type.
    pub fn entry_mut(&mut self, event_type: &str) -> &mut QueueSnapshotEntry {
        self.queues.entry(event_type.to_string()).or_default()
    }

    /// Entry for an event type, zeroed when the type was never seen.
    pub fn entry(&self, event_type: &str) -> QueueSnapshotEntry {
        self.queues.get(event_type).cloned().unwrap_or_default()
    }
}

/// Statistics for a single event type.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSnapshotEntry {
    /// Envelopes waiting for delivery, including those in backoff.
    pub ready_count: usize,
    /// Envelopes delivered and not yet acknowledged.
    pub in_flight_count: usize,
    pub dead_lettered_count: usize,
    pub acknowledged_count: usize,
}

/// Redelivery delay after a failed delivery.
///
/// Formula: delay = min(base_delay * 2^(attempts-1), max_backoff)
pub fn compute_redelivery_delay(attempts: u32, config: &QueueConfig) -> Duration {
    if attempts == 0 {
        return Duration::milliseconds(0);
    }

    let exp = attempts.saturating_sub(1).min(30) as i32;
    let scaled = (config.base_delay_ms as f64) * 2f64.powi(exp);
    let capped = scaled.min(config.max_backoff_ms as f64);
    let clamped_ms = capped.max(0.0) as i64;

    Duration::milliseconds(clamped_ms)
}

/// Returns true when attempts >= max_attempts.
pub fn should_dead_letter(attempts: u32, max_attempts: u32) -> bool {
    attempts >= max_attempts
}

#[derive(Debug)]
struct Pending {
    envelope: EventEnvelope,
    visible_at: DateTime<Utc>,
    last_error: Option<String>,
}

#[derive(Debug)]
struct InFlight {
    pending: Pending,
    visible_until: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Topic {
    ready: VecDeque<Pending>,
    in_flight: HashMap<ReceiptId, InFlight>,
    dead: Vec<DeadLetter>,
    acknowledged: usize,
}

impl Topic {
    /// Requeue with backoff, or dead-letter once the budget is spent.
    fn settle_failure(
        &mut self,
        mut pending: Pending,
        now: DateTime<Utc>,
        config: &QueueConfig,
    ) -> Option<PipelineEvent> {
        let attempts = pending.envelope.meta.attempts;
        if should_dead_letter(attempts, config.max_delivery_attempts) {
            let event = PipelineEvent::DeadLettered {
                envelope_id: pending.envelope.id,
                event_type: pending.envelope.event_type.clone(),
                attempts,
            };
            telemetry::record_dead_lettered(
                pending.envelope.event_type.as_str(),
                attempts,
                pending.last_error.as_deref().unwrap_or("visibility timeout"),
            );
            self.dead.push(DeadLetter {
                envelope: pending.envelope,
                last_error: pending.last_error,
                dead_lettered_at: now,
            });
            return Some(event);
        }

        pending.visible_at = now + compute_redelivery_delay(attempts, config);
        self.ready.push_back(pending);
        None
    }

    /// Settle deliveries whose visibility timeout passed unacknowledged.
    fn reclaim_expired(
        &mut self,
        now: DateTime<Utc>,
        config: &QueueConfig,
    ) -> (Vec<ReceiptId>, Vec<PipelineEvent>) {
        let expired: Vec<ReceiptId> = self
            .in_flight
            .iter()
            .filter(|(_, flight)| flight.visible_until <= now)
            .map(|(receipt, _)| *receipt)
            .collect();

        let mut dead = Vec::new();
        for receipt in &expired {
            if let Some(flight) = self.in_flight.remove(receipt) {
                dead.extend(self.settle_failure(flight.pending, now, config));
            }
        }
        (expired, dead)
    }
}

#[derive(Debug, Default)]
struct QueueState {
    topics: HashMap<EventType, Topic>,
    receipts: HashMap<ReceiptId, EventType>,
}

/// Single-process queue with visibility timeouts, backoff and dead letters.
#[derive(Debug)]
pub struct InMemoryEventQueue {
    config: QueueConfig,
    state: Mutex<QueueState>,
    events: Option<Arc<InProcEventBus>>,
}

impl Default for InMemoryEventQueue {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}

impl InMemoryEventQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            state: Mutex::new(QueueState::default()),
            events: None,
        }
    }

    /// Publish `DeadLettered` notifications on `bus`.
    pub fn with_event_bus(mut self, bus: Arc<InProcEventBus>) -> Self {
        self.events = Some(bus);
        self
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    fn notify(&self, events: impl IntoIterator<Item = PipelineEvent>) {
        if let Some(bus) = &self.events {
            for event in events {
                bus.emit(event);
            }
        }
    }

    /// Envelopes of `event_type` not yet acknowledged or dead-lettered.
    pub fn outstanding(&self, event_type: &EventType) -> usize {
        let state = self.state.lock();
        state
            .topics
            .get(event_type)
            .map(|topic| topic.ready.len() + topic.in_flight.len())
            .unwrap_or(0)
    }

    fn settle<F>(&self, receipt: ReceiptId, action: F) -> anyhow::Result<()>
    where
        F: FnOnce(&mut Topic, Pending, &QueueConfig) -> Option<PipelineEvent>,
    {
        let dead = {
            let mut state = self.state.lock();
            let Some(event_type) = state.receipts.remove(&receipt) else {
                anyhow::bail!("unknown or expired receipt {receipt}");
            };
            let topic = state.topics.entry(event_type).or_default();
            let Some(flight) = topic.in_flight.remove(&receipt) else {
                anyhow::bail!("delivery {receipt} already settled");
            };
            action(topic, flight.pending, &self.config)
        };
        self.notify(dead);
        Ok(())
    }
}

#[async_trait]
impl EventQueue for InMemoryEventQueue {
    async fn send(
        &self,
        event: Event,
        correlation_id: Option<Uuid>,
    ) -> anyhow::Result<EnvelopeId> {
        let envelope = EventEnvelope::new(event, correlation_id);
        let id = envelope.id;
        let mut state = self.state.lock();
        state
            .topics
            .entry(envelope.event_type.clone())
            .or_default()
            .ready
            .push_back(Pending {
                visible_at: envelope.meta.enqueued_at,
                envelope,
                last_error: None,
            });
        Ok(id)
    }

    async fn receive(
        &self,
        event_type: &EventType,
    ) -> anyhow::Result<Option<Delivery>> {
        let now = Utc::now();
        let (delivery, dead) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let Some(topic) = state.topics.get_mut(event_type) else {
                return Ok(None);
            };

            let (expired, dead) = topic.reclaim_expired(now, &self.config);
            for receipt in &expired {
                state.receipts.remove(receipt);
            }

            let delivery = topic
                .ready
                .iter()
                .position(|pending| pending.visible_at <= now)
                .and_then(|position| topic.ready.remove(position))
                .map(|mut pending| {
                    pending.envelope.meta.attempts += 1;
                    let receipt = ReceiptId::new();
                    let visible_until = now + self.config.visibility_timeout();
                    let envelope = pending.envelope.clone();
                    topic.in_flight.insert(
                        receipt,
                        InFlight {
                            pending,
                            visible_until,
                        },
                    );
                    Delivery {
                        receipt,
                        envelope,
                        visible_until,
                    }
                });

            if let Some(delivery) = &delivery {
                state.receipts.insert(delivery.receipt, event_type.clone());
            }
            (delivery, dead)
        };

        self.notify(dead);
        Ok(delivery)
    }

    async fn acknowledge(&self, receipt: ReceiptId) -> anyhow::Result<()> {
        self.settle(receipt, |topic, _pending, _config| {
            topic.acknowledged += 1;
            None
        })
    }

    async fn abandon(
        &self,
        receipt: ReceiptId,
        error: Option<String>,
    ) -> anyhow::Result<()> {
        self.settle(receipt, |topic, mut pending, config| {
            pending.last_error = error;
            topic.settle_failure(pending, Utc::now(), config)
        })
    }

    async fn dead_letters(
        &self,
        event_type: &EventType,
    ) -> anyhow::Result<Vec<DeadLetter>> {
        let state = self.state.lock();
        Ok(state
            .topics
            .get(event_type)
            .map(|topic| topic.dead.clone())
            .unwrap_or_default())
    }

    async fn snapshot(&self) -> anyhow::Result<QueueSnapshot> {
        let state = self.state.lock();
        let mut snapshot = QueueSnapshot::new(Utc::now());
        for (event_type, topic) in &state.topics {
            let entry = snapshot.entry_mut(event_type.as_str());
            entry.ready_count = topic.ready.len();
            entry.in_flight_count = topic.in_flight.len();
            entry.dead_lettered_count = topic.dead.len();
            entry.acknowledged_count = topic.acknowledged;
        }
        Ok(snapshot)
    }
}
