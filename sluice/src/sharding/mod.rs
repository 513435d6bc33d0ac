//! Shard schedulers decide what work exists and claim it.
//!
//! Discovery runs in two phases. [`ShardScheduler::discover`] enumerates
//! candidate units and acquires their leases, producing a [`Discovery`]
//! batch. [`Discovery::publish`] then enqueues each unit, writes its
//! discovered mark and advances the source high-water mark, and finally
//! releases every claim. Marks are only written once the event is in the
//! queue, so a crash between the phases loses no work: the leases expire
//! and the next pass enumerates the same units again.
//!
//! Every scheduler checks the discovered mark again after acquiring a
//! lease, since another worker may have published the unit between the
//! first check and the acquisition.

use std::collections::HashMap;
use std::fmt::{self, Display};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::checkpoint::CheckpointStore;
use crate::error::PipelineError;
use crate::events::{Event, EventType};
use crate::lock::{Lease, LockStore};
use crate::queue::EventQueue;
use crate::source::{SourceConfig, keys};
use crate::storage::BlobStore;

pub mod blob;
pub mod range;
pub mod time_bucket;

pub use blob::BlobScheduler;
pub use range::RangeKeyScheduler;
pub use time_bucket::{ReverseTimeBucketScheduler, TimeBucketScheduler};

/// Strategy identifiers carried in a source's `scheduler` property.
pub mod strategies {
    pub const RANGE_KEY: &str = "range-key";
    pub const TIME_BUCKET: &str = "time-bucket";
    pub const REVERSE_TIME_BUCKET: &str = "reverse-time-bucket";
    pub const BLOB: &str = "blob";
}

const DEFAULT_MAX_UNITS_PER_PASS: i64 = 100;

/// Opaque partition identifier within a source.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShardKey(String);

impl ShardKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ShardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A half-open `[start, end)` window in epoch seconds.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct TimeBucket {
    pub start: i64,
    pub end: i64,
}

impl TimeBucket {
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    /// The bucket of width `size` that contains `ts`.
    pub fn containing(ts: i64, size: i64) -> Self {
        let start = ts.div_euclid(size) * size;
        Self::new(start, start.saturating_add(size))
    }

    /// The most recent bucket with `end + grace <= now`.
    pub fn latest_closed(now: i64, size: i64, grace: i64) -> Self {
        let end = now.saturating_sub(grace).div_euclid(size) * size;
        Self::new(end.saturating_sub(size), end)
    }

    pub fn len(&self) -> i64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    /// `None` once the walk would leave the `i64` range.
    pub fn previous(&self) -> Option<Self> {
        let start = self.start.checked_sub(self.len())?;
        Some(Self::new(start, self.start))
    }

    /// `None` once the walk would leave the `i64` range.
    pub fn next(&self) -> Option<Self> {
        let end = self.end.checked_add(self.len())?;
        Some(Self::new(self.end, end))
    }

    pub fn is_closed(&self, now: i64, grace: i64) -> bool {
        self.end.checked_add(grace).is_some_and(|closes| now >= closes)
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.start, 0)
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.end, 0)
    }
}

impl Display for TimeBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// Lease name for a shard of `source`: `"{source}:{key}"`.
pub fn lease_name(source: &str, key: impl Display) -> String {
    format!("{source}:{key}")
}

/// The concrete unit a descriptor points at.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UnitRef {
    /// One object in the source's container.
    Blob { id: String },
    /// A contiguous key range still to be split into partition keys.
    KeyRange { start: i64, end: i64 },
    /// One table partition.
    PartitionKey { key: String },
    /// Everything timestamped inside a closed bucket.
    TimeBucket { start: i64, end: i64 },
}

impl UnitRef {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::Blob { .. } => EventType::blob_file_arrived(),
            Self::KeyRange { .. } => EventType::shard_range_arrived(),
            Self::PartitionKey { .. } | Self::TimeBucket { .. } => {
                EventType::shard_key_arrived()
            }
        }
    }
}

/// Body of every discovery event. Stages derive new descriptors rather
/// than editing the one they received.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryDescriptor {
    pub source: SourceConfig,
    pub shard_key: ShardKey,
    /// Lease the processing stage acquires for this unit.
    pub lease_name: String,
    pub unit: UnitRef,
    pub discovered_at: DateTime<Utc>,
}

impl DiscoveryDescriptor {
    pub fn new(
        source: &SourceConfig,
        shard_key: ShardKey,
        unit: UnitRef,
        discovered_at: DateTime<Utc>,
    ) -> Self {
        Self {
            lease_name: lease_name(&source.name, &shard_key),
            source: source.clone(),
            shard_key,
            unit,
            discovered_at,
        }
    }

    pub fn event_type(&self) -> EventType {
        self.unit.event_type()
    }

    pub fn to_event(&self) -> Result<Event, PipelineError> {
        Event::new(self.event_type(), self)
    }
}

/// Per-pass inputs shared by every scheduler.
#[derive(Clone, Debug)]
pub struct DiscoveryContext {
    pub now: DateTime<Utc>,
    /// Lease holder, normally the worker id.
    pub holder: String,
}

impl DiscoveryContext {
    pub fn new(now: DateTime<Utc>, holder: impl Into<String>) -> Self {
        Self {
            now,
            holder: holder.into(),
        }
    }
}

/// One partitioning strategy.
///
/// `discover` re-enumerates from the lock and checkpoint stores on every
/// call; schedulers hold no cursor of their own. A shard whose lease is
/// held elsewhere is skipped without error.
#[async_trait]
pub trait ShardScheduler: Send + Sync {
    fn strategy(&self) -> &'static str;

    async fn discover(
        &self,
        source: &SourceConfig,
        ctx: &DiscoveryContext,
    ) -> anyhow::Result<Discovery>;
}

struct PendingUnit {
    descriptor: DiscoveryDescriptor,
    claim: usize,
    advances_to: Option<i64>,
}

/// Claimed but not yet enqueued units from one `discover` call.
///
/// Consume it with [`Discovery::publish`] or [`Discovery::abandon`]. A
/// batch that is simply dropped leaves its leases to expire.
pub struct Discovery {
    lock: Option<Arc<dyn LockStore>>,
    ttl: Duration,
    source: Option<String>,
    claims: Vec<Lease>,
    units: Vec<PendingUnit>,
    trailing_mark: Option<i64>,
}

impl fmt::Debug for Discovery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Discovery")
            .field("source", &self.source)
            .field("claims", &self.claims.len())
            .field("units", &self.units.len())
            .field("trailing_mark", &self.trailing_mark)
            .finish()
    }
}

impl Discovery {
    pub fn new(lock: Arc<dyn LockStore>, ttl: Duration, source: &SourceConfig) -> Self {
        Self {
            lock: Some(lock),
            ttl,
            source: Some(source.name.clone()),
            claims: Vec::new(),
            units: Vec::new(),
            trailing_mark: None,
        }
    }

    /// A batch with nothing claimed.
    pub fn empty() -> Self {
        Self {
            lock: None,
            ttl: Duration::zero(),
            source: None,
            claims: Vec::new(),
            units: Vec::new(),
            trailing_mark: None,
        }
    }

    /// Hold `lease` until the batch is published or abandoned. Returns the
    /// claim index to pass to [`Discovery::push`].
    pub fn claim(&mut self, lease: Lease) -> usize {
        self.claims.push(lease);
        self.claims.len() - 1
    }

    /// Queue a unit under `claim`. `advances_to` raises the source
    /// high-water mark once the unit is enqueued.
    pub fn push(
        &mut self,
        claim: usize,
        descriptor: DiscoveryDescriptor,
        advances_to: Option<i64>,
    ) {
        self.units.push(PendingUnit {
            descriptor,
            claim,
            advances_to,
        });
    }

    /// High-water mark applied after every unit has been enqueued.
    pub fn set_trailing_mark(&mut self, mark: i64) {
        self.trailing_mark = Some(mark);
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &DiscoveryDescriptor> {
        self.units.iter().map(|unit| &unit.descriptor)
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn claim_count(&self) -> usize {
        self.claims.len()
    }

    /// Release a claim that ended up with no units.
    pub(crate) async fn release_last_claim(&mut self) -> anyhow::Result<()> {
        let idle = self
            .claims
            .len()
            .checked_sub(1)
            .filter(|idx| !self.units.iter().any(|unit| unit.claim == *idx));
        if let Some(idx) = idle {
            let lease = self.claims.remove(idx);
            if let Some(lock) = &self.lock {
                lock.release(&lease.name, lease.token).await?;
            }
        }
        Ok(())
    }

    /// Enqueue every unit in order, then release the claims.
    ///
    /// Ownership of a unit's claim is renewed right before its event is
    /// sent. At the first lost claim publishing stops; the remaining units
    /// are left for a later pass. Returns the number of events enqueued.
    pub async fn publish(
        mut self,
        queue: &dyn EventQueue,
        checkpoints: &dyn CheckpointStore,
    ) -> anyhow::Result<usize> {
        let result = self.publish_units(queue, checkpoints).await;
        self.release_claims().await;
        result
    }

    /// Release every claim without enqueueing anything.
    pub async fn abandon(mut self) {
        self.release_claims().await;
    }

    async fn publish_units(
        &mut self,
        queue: &dyn EventQueue,
        checkpoints: &dyn CheckpointStore,
    ) -> anyhow::Result<usize> {
        let units = std::mem::take(&mut self.units);
        let mut published = 0;

        for unit in &units {
            if !self.still_owned(unit.claim).await? {
                tracing::warn!(
                    source = %unit.descriptor.source.name,
                    shard_key = %unit.descriptor.shard_key,
                    "claim lost before enqueue, leaving unit for a later pass"
                );
                return Ok(published);
            }

            queue.send(unit.descriptor.to_event()?, None).await?;
            checkpoints
                .mark_discovered(&unit.descriptor.lease_name)
                .await?;
            if let Some(mark) = unit.advances_to {
                checkpoints
                    .advance_high_water_mark(&unit.descriptor.source.name, mark)
                    .await?;
            }
            published += 1;
        }

        if let (Some(mark), Some(source)) = (self.trailing_mark, &self.source) {
            checkpoints.advance_high_water_mark(source, mark).await?;
        }
        Ok(published)
    }

    async fn still_owned(&self, claim: usize) -> anyhow::Result<bool> {
        let (Some(lock), Some(lease)) = (&self.lock, self.claims.get(claim)) else {
            return Ok(false);
        };
        lock.renew(&lease.name, lease.token, self.ttl).await
    }

    async fn release_claims(&mut self) {
        let Some(lock) = &self.lock else {
            return;
        };
        for lease in self.claims.drain(..) {
            if let Err(err) = lock.release(&lease.name, lease.token).await {
                tracing::warn!(lease = %lease.name, error = %err, "claim release failed");
            }
        }
    }
}

/// What happened when a scheduler tried to claim one shard.
pub(crate) enum ClaimOutcome {
    Claimed(Lease),
    /// Another holder has it this pass.
    Held,
    AlreadyDiscovered,
}

/// Shared check, acquire, re-check sequence.
#[derive(Clone)]
pub(crate) struct Claimer {
    pub(crate) lock: Arc<dyn LockStore>,
    pub(crate) checkpoints: Arc<dyn CheckpointStore>,
    pub(crate) ttl: Duration,
}

impl Claimer {
    pub(crate) fn discovery(&self, source: &SourceConfig) -> Discovery {
        Discovery::new(Arc::clone(&self.lock), self.ttl, source)
    }

    pub(crate) async fn claim(
        &self,
        name: &str,
        holder: &str,
    ) -> anyhow::Result<ClaimOutcome> {
        if self.checkpoints.is_discovered(name).await? {
            return Ok(ClaimOutcome::AlreadyDiscovered);
        }
        let Some(lease) = self.lock.try_acquire(name, holder, self.ttl).await? else {
            tracing::debug!(lease = %name, "shard held elsewhere, skipping");
            return Ok(ClaimOutcome::Held);
        };
        if self.checkpoints.is_discovered(name).await? {
            self.lock.release(&lease.name, lease.token).await?;
            return Ok(ClaimOutcome::AlreadyDiscovered);
        }
        Ok(ClaimOutcome::Claimed(lease))
    }
}

/// `grace_secs`, defaulting to zero.
pub(crate) fn grace_secs(source: &SourceConfig) -> Result<i64, PipelineError> {
    let grace = source.property_i64(keys::GRACE_SECS)?.unwrap_or(0);
    if grace < 0 {
        return Err(PipelineError::configuration(format!(
            "source '{}' property '{}' must not be negative",
            source.name,
            keys::GRACE_SECS
        )));
    }
    Ok(grace)
}

pub(crate) fn max_units_per_pass(source: &SourceConfig) -> Result<usize, PipelineError> {
    Ok(source.property_positive(keys::MAX_UNITS_PER_PASS, DEFAULT_MAX_UNITS_PER_PASS)?
        as usize)
}

/// Strategy id to scheduler lookup.
#[derive(Clone, Default)]
pub struct SchedulerRegistry {
    schedulers: HashMap<String, Arc<dyn ShardScheduler>>,
}

impl fmt::Debug for SchedulerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut strategies: Vec<_> = self.schedulers.keys().collect();
        strategies.sort();
        f.debug_struct("SchedulerRegistry")
            .field("strategies", &strategies)
            .finish()
    }
}

impl SchedulerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// All four built-in strategies over the given stores.
    pub fn standard(
        lock: Arc<dyn LockStore>,
        checkpoints: Arc<dyn CheckpointStore>,
        blobs: Arc<dyn BlobStore>,
        lease_ttl: Duration,
    ) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(RangeKeyScheduler::new(
            Arc::clone(&lock),
            Arc::clone(&checkpoints),
            lease_ttl,
        )));
        registry.register(Arc::new(TimeBucketScheduler::new(
            Arc::clone(&lock),
            Arc::clone(&checkpoints),
            lease_ttl,
        )));
        registry.register(Arc::new(ReverseTimeBucketScheduler::new(
            Arc::clone(&lock),
            Arc::clone(&checkpoints),
            lease_ttl,
        )));
        registry.register(Arc::new(BlobScheduler::new(
            lock,
            checkpoints,
            blobs,
            lease_ttl,
        )));
        registry
    }

    /// Register under the scheduler's own strategy id, replacing any
    /// previous entry.
    pub fn register(&mut self, scheduler: Arc<dyn ShardScheduler>) {
        self.schedulers
            .insert(scheduler.strategy().to_string(), scheduler);
    }

    pub fn resolve(
        &self,
        strategy: &str,
    ) -> Result<Arc<dyn ShardScheduler>, PipelineError> {
        self.schedulers.get(strategy).cloned().ok_or_else(|| {
            PipelineError::configuration(format!(
                "unknown scheduler strategy '{strategy}'"
            ))
        })
    }

    /// Resolve the scheduler named by `source`'s `scheduler` property.
    pub fn for_source(
        &self,
        source: &SourceConfig,
    ) -> Result<Arc<dyn ShardScheduler>, PipelineError> {
        self.resolve(source.scheduler_strategy()?)
    }

    pub fn strategies(&self) -> Vec<&str> {
        let mut strategies: Vec<&str> =
            self.schedulers.keys().map(String::as_str).collect();
        strategies.sort_unstable();
        strategies
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::InMemoryCheckpointStore;
    use crate::lock::InMemoryLockStore;
    use crate::queue::InMemoryEventQueue;
    use chrono::TimeZone;

    fn source() -> SourceConfig {
        SourceConfig::new("logs-A", "memory://")
    }

    fn descriptor(start: i64, end: i64) -> DiscoveryDescriptor {
        DiscoveryDescriptor::new(
            &source(),
            ShardKey::new(TimeBucket::new(start, end).to_string()),
            UnitRef::TimeBucket { start, end },
            Utc.timestamp_opt(125, 0).unwrap(),
        )
    }

    #[test]
    fn test_latest_closed_bucket() {
        assert_eq!(TimeBucket::latest_closed(125, 60, 0), TimeBucket::new(60, 120));
        assert_eq!(TimeBucket::latest_closed(120, 60, 0), TimeBucket::new(60, 120));
        assert_eq!(TimeBucket::latest_closed(125, 60, 10), TimeBucket::new(0, 60));
        assert!(!TimeBucket::new(120, 180).is_closed(125, 0));
        assert_eq!(TimeBucket::containing(-1, 60), TimeBucket::new(-60, 0));
    }

    #[test]
    fn test_bucket_walk_stops_at_the_edge_of_i64() {
        let widest = TimeBucket::latest_closed(125, i64::MAX, 0);
        assert_eq!(widest, TimeBucket::new(-i64::MAX, 0));
        assert_eq!(widest.previous(), None);
        assert_eq!(
            TimeBucket::new(60, 120).previous(),
            Some(TimeBucket::new(0, 60))
        );
        assert_eq!(TimeBucket::new(i64::MAX - 10, i64::MAX).next(), None);
        assert!(!TimeBucket::new(0, i64::MAX).is_closed(i64::MAX, 1));
    }

    #[test]
    fn test_descriptor_routes_by_unit() {
        let d = descriptor(60, 120);
        assert_eq!(d.lease_name, "logs-A:60-120");
        assert_eq!(d.event_type(), EventType::shard_key_arrived());

        let event = d.to_event().unwrap();
        assert_eq!(event.body["unit"]["kind"], "time_bucket");
        let back: DiscoveryDescriptor = event.body_as().unwrap();
        assert_eq!(back, d);

        let blob = UnitRef::Blob { id: "a.log".into() };
        assert_eq!(blob.event_type(), EventType::blob_file_arrived());
        let range = UnitRef::KeyRange { start: 0, end: 60 };
        assert_eq!(range.event_type(), EventType::shard_range_arrived());
    }

    #[tokio::test]
    async fn test_publish_marks_after_enqueue_and_releases() {
        let lock = Arc::new(InMemoryLockStore::new());
        let checkpoints = InMemoryCheckpointStore::new();
        let queue = InMemoryEventQueue::default();
        let ttl = Duration::seconds(30);

        let lease = lock
            .try_acquire("logs-A:60-120", "w1", ttl)
            .await
            .unwrap()
            .unwrap();
        let mut discovery = Discovery::new(lock.clone(), ttl, &source());
        let claim = discovery.claim(lease);
        discovery.push(claim, descriptor(60, 120), Some(120));

        let published = discovery.publish(&queue, &checkpoints).await.unwrap();
        assert_eq!(published, 1);
        assert!(checkpoints.is_discovered("logs-A:60-120").await.unwrap());
        assert_eq!(checkpoints.high_water_mark("logs-A").await.unwrap(), Some(120));
        assert_eq!(queue.outstanding(&EventType::shard_key_arrived()), 1);
        assert_eq!(lock.held_count(), 0);
    }

    #[tokio::test]
    async fn test_publish_stops_at_lost_claim() {
        let lock = Arc::new(InMemoryLockStore::new());
        let checkpoints = InMemoryCheckpointStore::new();
        let queue = InMemoryEventQueue::default();
        let ttl = Duration::seconds(30);

        let mut discovery = Discovery::new(lock.clone(), ttl, &source());
        for (start, end) in [(0, 60), (60, 120)] {
            let name = lease_name("logs-A", TimeBucket::new(start, end));
            let lease = lock.try_acquire(&name, "w1", ttl).await.unwrap().unwrap();
            let claim = discovery.claim(lease);
            discovery.push(claim, descriptor(start, end), Some(end));
        }
        discovery.set_trailing_mark(120);

        // Another worker breaks the second claim before publish.
        let second = lock.current("logs-A:60-120").unwrap();
        lock.release(&second.name, second.token).await.unwrap();
        lock.try_acquire("logs-A:60-120", "w2", ttl).await.unwrap().unwrap();

        let published = discovery.publish(&queue, &checkpoints).await.unwrap();
        assert_eq!(published, 1);
        assert!(!checkpoints.is_discovered("logs-A:60-120").await.unwrap());
        assert_eq!(checkpoints.high_water_mark("logs-A").await.unwrap(), Some(60));
        assert_eq!(lock.current("logs-A:60-120").unwrap().holder, "w2");
        assert!(lock.current("logs-A:0-60").is_none());
    }

    #[tokio::test]
    async fn test_abandon_releases_without_marks() {
        let lock = Arc::new(InMemoryLockStore::new());
        let checkpoints = InMemoryCheckpointStore::new();
        let ttl = Duration::seconds(30);

        let lease = lock.try_acquire("logs-A:0-60", "w1", ttl).await.unwrap().unwrap();
        let mut discovery = Discovery::new(lock.clone(), ttl, &source());
        let claim = discovery.claim(lease);
        discovery.push(claim, descriptor(0, 60), Some(60));
        discovery.abandon().await;

        assert_eq!(lock.held_count(), 0);
        assert_eq!(checkpoints.discovered_count(), 0);
    }

    #[test]
    fn test_unknown_strategy_is_configuration_error() {
        let registry = SchedulerRegistry::new();
        let source = source().with_property(keys::SCHEDULER, "hourly");
        assert!(matches!(
            registry.for_source(&source),
            Err(PipelineError::Configuration(_))
        ));
        assert!(registry.for_source(&self::source()).is_err());
    }
}
