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

const DEFAULT_RANGE_SECS: i64 = 3600;

/// Splits the keyspace below `now - grace` into closed ranges of
/// `bucket_secs`, aligned to multiples of `bucket_secs`.
///
/// A range is only emitted once its end has passed, so every key inside it
/// is final when it is fanned out. A high-water mark that is not on a range
/// boundary is rounded down. Like the forward time-bucket walk, claiming
/// stops at the first range held elsewhere.
pub struct RangeKeyScheduler {
    claimer: Claimer,
}

impl RangeKeyScheduler {
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
        let size = source.property_positive(keys::BUCKET_SECS, DEFAULT_RANGE_SECS)?;
        let closed = TimeBucket::latest_closed(ctx.now.timestamp(), size, grace_secs(source)?);
        let limit = max_units_per_pass(source)?;

        let mark = self.claimer.checkpoints.high_water_mark(&source.name).await?;
        let mut range = match mark.or(source.property_i64(keys::START_OFFSET)?) {
            Some(from) => TimeBucket::containing(from, size),
            None => closed,
        };

        let mut walked_to = None;
        while range.end <= closed.end && discovery.len() < limit {
            let name = lease_name(&source.name, range);
            match self.claimer.claim(&name, &ctx.holder).await? {
                ClaimOutcome::Claimed(lease) => {
                    let claim = discovery.claim(lease);
                    discovery.push(
                        claim,
                        DiscoveryDescriptor::new(
                            source,
                            ShardKey::new(range.to_string()),
                            UnitRef::KeyRange {
                                start: range.start,
                                end: range.end,
                            },
                            ctx.now,
                        ),
                        Some(range.end),
                    );
                }
                ClaimOutcome::AlreadyDiscovered => {}
                ClaimOutcome::Held => break,
            }
            walked_to = Some(range.end);
            match range.next() {
                Some(next) => range = next,
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
impl ShardScheduler for RangeKeyScheduler {
    fn strategy(&self) -> &'static str {
        strategies::RANGE_KEY
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
