use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;

use super::{
    ClaimOutcome, Claimer, Discovery, DiscoveryContext, DiscoveryDescriptor,
    ShardKey, ShardScheduler, TimeBucket, UnitRef, grace_secs, lease_name,
    max_units_per_pass, strategies,
};
use crate::checkpoint::CheckpointStore;
use crate::lock::LockStore;
use crate::source::{SourceConfig, keys};

const DEFAULT_BUCKET_SECS: i64 = 60;
const DEFAULT_LOOKBACK_BUCKETS: i64 = 24;

struct BucketWindow {
    size: i64,
    latest: TimeBucket,
    limit: usize,
    start_offset: Option<i64>,
}

impl BucketWindow {
    fn for_source(source: &SourceConfig, now: i64) -> anyhow::Result<Self> {
        let size = source.property_positive(keys::BUCKET_SECS, DEFAULT_BUCKET_SECS)?;
        let grace = grace_secs(source)?;
        Ok(Self {
            size,
            latest: TimeBucket::latest_closed(now, size, grace),
            limit: max_units_per_pass(source)?,
            start_offset: source.property_i64(keys::START_OFFSET)?,
        })
    }
}

fn bucket_descriptor(
    source: &SourceConfig,
    bucket: TimeBucket,
    ctx: &DiscoveryContext,
) -> DiscoveryDescriptor {
    DiscoveryDescriptor::new(
        source,
        ShardKey::new(bucket.to_string()),
        UnitRef::TimeBucket {
            start: bucket.start,
            end: bucket.end,
        },
        ctx.now,
    )
}

/// Walks closed buckets forward from the source high-water mark.
///
/// Claims are contiguous: the walk stops at the first bucket held by
/// another worker so the high-water mark never skips an unpublished
/// bucket. A source with no mark and no `start_offset` starts at the
/// latest closed bucket.
pub struct TimeBucketScheduler {
    claimer: Claimer,
}

impl TimeBucketScheduler {
    pub fn new(
        lock: Arc<dyn LockStore>,
        checkpoints: Arc<dyn CheckpointStore>,
        lease_ttl: Duration,
    ) -> Self {
        Self {
            claimer: Claimer {
                lock,
                checkpoints,
                ttl: lease_ttl,
            },
        }
    }

    async fn walk(
        &self,
        discovery: &mut Discovery,
        source: &SourceConfig,
        ctx: &DiscoveryContext,
    ) -> anyhow::Result<()> {
        let window = BucketWindow::for_source(source, ctx.now.timestamp())?;
        let mark = self.claimer.checkpoints.high_water_mark(&source.name).await?;
        let mut bucket = match mark.or(window.start_offset) {
            Some(from) => TimeBucket::containing(from, window.size),
            None => window.latest,
        };

        let mut walked_to = None;
        while bucket.end <= window.latest.end && discovery.len() < window.limit {
            let name = lease_name(&source.name, bucket);
            match self.claimer.claim(&name, &ctx.holder).await? {
                ClaimOutcome::Claimed(lease) => {
                    let claim = discovery.claim(lease);
                    discovery.push(
                        claim,
                        bucket_descriptor(source, bucket, ctx),
                        Some(bucket.end),
                    );
                }
                ClaimOutcome::AlreadyDiscovered => {}
                ClaimOutcome::Held => break,
            }
            walked_to = Some(bucket.end);
            match bucket.next() {
                Some(next) => bucket = next,
                None => break,
            }
        }

        if let Some(mark) = walked_to {
            discovery.set_trailing_mark(mark);
        }
        Ok(())
    }
}

#[async_trait]
impl ShardScheduler for TimeBucketScheduler {
    fn strategy(&self) -> &'static str {
        strategies::TIME_BUCKET
    }

    async fn discover(
        &self,
        source: &SourceConfig,
        ctx: &DiscoveryContext,
    ) -> anyhow::Result<Discovery> {
        let mut discovery = self.claimer.discovery(source);
        if let Err(err) = self.walk(&mut discovery, source, ctx).await {
            discovery.abandon().await;
            return Err(err);
        }
        Ok(discovery)
    }
}

/// Walks closed buckets backward from the most recent one, at most
/// `lookback_buckets` deep.
///
/// Fresh data comes first and older gaps are backfilled on later passes.
/// Held buckets are skipped rather than ending the walk. No high-water
/// mark is kept; discovered marks alone decide what is new.
pub struct ReverseTimeBucketScheduler {
    claimer: Claimer,
}

impl ReverseTimeBucketScheduler {
    pub fn new(
        lock: Arc<dyn LockStore>,
        checkpoints: Arc<dyn CheckpointStore>,
        lease_ttl: Duration,
    ) -> Self {
        Self {
            claimer: Claimer {
                lock,
                checkpoints,
                ttl: lease_ttl,
            },
        }
    }

    async fn walk(
        &self,
        discovery: &mut Discovery,
        source: &SourceConfig,
        ctx: &DiscoveryContext,
    ) -> anyhow::Result<()> {
        let window = BucketWindow::for_source(source, ctx.now.timestamp())?;
        let lookback =
            source.property_positive(keys::LOOKBACK_BUCKETS, DEFAULT_LOOKBACK_BUCKETS)?;

        let mut bucket = window.latest;
        for _ in 0..lookback {
            if discovery.len() >= window.limit
                || window.start_offset.is_some_and(|floor| bucket.end <= floor)
            {
                break;
            }
            let name = lease_name(&source.name, bucket);
            if let ClaimOutcome::Claimed(lease) =
                self.claimer.claim(&name, &ctx.holder).await?
            {
                let claim = discovery.claim(lease);
                discovery.push(claim, bucket_descriptor(source, bucket, ctx), None);
            }
            match bucket.previous() {
                Some(previous) => bucket = previous,
                None => break,
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ShardScheduler for ReverseTimeBucketScheduler {
    fn strategy(&self) -> &'static str {
        strategies::REVERSE_TIME_BUCKET
    }

    async fn discover(
        &self,
        source: &SourceConfig,
        ctx: &DiscoveryContext,
    ) -> anyhow::Result<Discovery> {
        let mut discovery = self.claimer.discovery(source);
        if let Err(err) = self.walk(&mut discovery, source, ctx).await {
            discovery.abandon().await;
            return Err(err);
        }
        Ok(discovery)
    }
}
