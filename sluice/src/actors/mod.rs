//! The standard pipeline stages.
//!
//! | event type          | actor               | unit                       |
//! |---------------------|---------------------|----------------------------|
//! | `ShardRangeArrived` | [`ShardRangeActor`] | key range, fans out keys   |
//! | `ShardKeyArrived`   | [`ShardKeyActor`]   | partition key, time bucket |
//! | `BlobFileArrived`   | [`FileArrivalActor`]| one blob                   |
//!
//! Stages that read data take the unit's lease for the duration of the
//! work and keep it renewed with a [`LeaseKeeper`]. Ownership is checked
//! before every push and before the flush. Each invocation writes through
//! its own pusher, so a unit that fails never has its buffered records
//! flushed by another.

use std::sync::Arc;

use uuid::Uuid;

use crate::actor::{ActorDescriptor, ActorRegistry};
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::events::EventType;
use crate::lock::{LeaseKeeper, LockStore};
use crate::parsing::ParserRegistry;
use crate::pusher::{BatchPusher, PusherFactory};
use crate::record::ParsedRecord;
use crate::source::SourceConfig;
use crate::storage::{BlobStore, TableStore};

pub mod file_arrival;
pub mod shard_key;
pub mod shard_range;

pub use file_arrival::FileArrivalActor;
pub use shard_key::ShardKeyActor;
pub use shard_range::ShardRangeActor;

/// Collaborators the standard stages are built from.
#[derive(Clone)]
pub struct ActorDeps {
    pub lock: Arc<dyn LockStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub tables: Arc<dyn TableStore>,
    pub pusher: Arc<dyn PusherFactory>,
    pub parsers: Arc<ParserRegistry>,
    pub config: PipelineConfig,
}

impl std::fmt::Debug for ActorDeps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActorDeps")
            .field("parsers", &self.parsers)
            .field("config", &self.config)
            .finish()
    }
}

/// Register the three standard stages at the configured default
/// parallelism.
pub fn register_standard(
    registry: &mut ActorRegistry,
    deps: ActorDeps,
) -> Result<(), PipelineError> {
    let file_deps = deps.clone();
    registry.register(ActorDescriptor::new(
        EventType::BLOB_FILE_ARRIVED,
        0,
        move || FileArrivalActor::new(file_deps.clone()),
    ))?;

    let key_deps = deps;
    registry.register(ActorDescriptor::new(
        EventType::SHARD_KEY_ARRIVED,
        0,
        move || ShardKeyActor::new(key_deps.clone()),
    ))?;

    registry.register(ActorDescriptor::new(
        EventType::SHARD_RANGE_ARRIVED,
        1,
        ShardRangeActor::new,
    ))?;
    Ok(())
}

/// Take the unit lease for one invocation and keep it renewed.
///
/// The holder is unique per invocation, so a redelivered envelope racing
/// its own earlier delivery cannot re-enter the same lease.
pub(crate) async fn acquire_unit(
    deps: &ActorDeps,
    lease_name: &str,
) -> Result<LeaseKeeper, PipelineError> {
    let holder = format!("{}/{}", deps.config.worker_id, Uuid::now_v7());
    let ttl = deps.config.lease_ttl();
    let lease = deps
        .lock
        .try_acquire(lease_name, &holder, ttl)
        .await
        .map_err(|err| {
            PipelineError::transient(format!("acquire of {lease_name} failed: {err:#}"))
        })?
        .ok_or_else(|| {
            PipelineError::transient(format!("unit lease {lease_name} is held by another worker"))
        })?;

    Ok(LeaseKeeper::spawn(
        Arc::clone(&deps.lock),
        lease,
        ttl,
        deps.config.renewal(),
    ))
}

/// Release the unit lease, or let it expire when ownership was lost.
pub(crate) async fn settle<T>(keeper: LeaseKeeper, result: &Result<T, PipelineError>) {
    if let Err(PipelineError::LostOwnership { .. }) = result {
        keeper.abandon().await;
        return;
    }
    let lease = keeper.lease().name.clone();
    if let Err(err) = keeper.release().await {
        tracing::warn!(lease = %lease, error = %err, "unit lease release failed");
    }
}

/// Pushes one unit's records under its lease and flushes once at the end.
///
/// Owns the unit's pusher. Dropping it without [`UnitIngest::finish`]
/// discards whatever is still buffered.
pub(crate) struct UnitIngest<'a> {
    keeper: &'a LeaseKeeper,
    pusher: Box<dyn BatchPusher>,
    source: &'a SourceConfig,
    pushed: usize,
    skipped: usize,
}

impl<'a> UnitIngest<'a> {
    pub(crate) fn new(
        keeper: &'a LeaseKeeper,
        pusher: &dyn PusherFactory,
        source: &'a SourceConfig,
    ) -> Self {
        Self {
            keeper,
            pusher: pusher.create(),
            source,
            pushed: 0,
            skipped: 0,
        }
    }

    /// Push every record; malformed ones are logged and skipped.
    pub(crate) async fn push_all<I>(&mut self, records: I) -> Result<(), PipelineError>
    where
        I: Iterator<Item = anyhow::Result<ParsedRecord>> + Send,
    {
        for record in records {
            let record = match record {
                Ok(record) => record,
                Err(err) => {
                    self.skipped += 1;
                    tracing::warn!(
                        source = %self.source.name,
                        error = %err,
                        "skipping unparsable record"
                    );
                    continue;
                }
            };
            self.keeper.ensure_owned()?;
            self.pusher.push(record, self.source).await?;
            self.pushed += 1;
        }
        Ok(())
    }

    /// Flush if anything was pushed. Returns the pushed count.
    pub(crate) async fn finish(self) -> Result<usize, PipelineError> {
        if self.pushed > 0 {
            self.keeper.ensure_owned()?;
            self.pusher.flush().await?;
        }
        tracing::debug!(
            source = %self.source.name,
            lease = %self.keeper.lease().name,
            pushed = self.pushed,
            skipped = self.skipped,
            "unit ingested"
        );
        Ok(self.pushed)
    }
}
