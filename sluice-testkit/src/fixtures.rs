use std::sync::Arc;

use chrono::{DateTime, Utc};
use sluice::sharding::strategies;
use sluice::*;

use crate::mock::RecordingPusher;
use crate::storage::{InMemoryBlobStore, InMemoryTableStore};

pub const IIS_FIELDS: &str = "#Fields: date time cs-method cs-uri-stem sc-status";

/// Epoch seconds as a UTC timestamp.
pub fn at(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

/// An IIS log with the [`IIS_FIELDS`] header followed by `rows`.
pub fn iis_log(rows: &[&str]) -> String {
    let mut log = String::from(IIS_FIELDS);
    log.push('\n');
    for row in rows {
        log.push_str(row);
        log.push('\n');
    }
    log
}

/// Container source split into closed time buckets, parsed as IIS.
pub fn bucketed_source(name: &str, container: &str, bucket_secs: i64) -> SourceConfig {
    SourceConfig::new(name, "memory://account")
        .with_container(container)
        .with_property(keys::SCHEDULER, strategies::TIME_BUCKET)
        .with_property(keys::PARSER, "iis")
        .with_property(keys::BUCKET_SECS, bucket_secs)
        .with_property(keys::GRACE_SECS, 0)
}

/// Container source where every new blob is a unit, parsed as IIS.
pub fn blob_source(name: &str, container: &str) -> SourceConfig {
    SourceConfig::new(name, "memory://account")
        .with_container(container)
        .with_property(keys::SCHEDULER, strategies::BLOB)
        .with_property(keys::PARSER, "iis")
}

/// Table source discovered as key ranges of `bucket_secs`.
pub fn range_source(name: &str, table: &str, bucket_secs: i64) -> SourceConfig {
    SourceConfig::new(name, "memory://tables")
        .with_table(table)
        .with_property(keys::SCHEDULER, strategies::RANGE_KEY)
        .with_property(keys::BUCKET_SECS, bucket_secs)
        .with_property(keys::GRACE_SECS, 0)
}

/// Every collaborator of one worker, in memory.
///
/// Clones share state, so two stacks cloned from one behave like two
/// workers against the same shared stores.
#[derive(Clone)]
pub struct MemoryStack {
    pub config: PipelineConfig,
    pub lock: Arc<InMemoryLockStore>,
    pub checkpoints: Arc<InMemoryCheckpointStore>,
    pub queue: Arc<InMemoryEventQueue>,
    pub blobs: Arc<InMemoryBlobStore>,
    pub tables: Arc<InMemoryTableStore>,
    pub pusher: Arc<RecordingPusher>,
    pub events: Arc<InProcEventBus>,
}

impl MemoryStack {
    /// Redelivery is immediate so retried envelopes are visible at once.
    pub fn new(config: PipelineConfig) -> Self {
        Self::with_queue_config(config, QueueConfig::default().with_base_delay_ms(0))
    }

    pub fn with_queue_config(config: PipelineConfig, queue_config: QueueConfig) -> Self {
        let events = Arc::new(InProcEventBus::default());
        let queue = InMemoryEventQueue::new(queue_config).with_event_bus(Arc::clone(&events));
        Self {
            config,
            lock: Arc::new(InMemoryLockStore::new()),
            checkpoints: Arc::new(InMemoryCheckpointStore::new()),
            queue: Arc::new(queue),
            blobs: Arc::new(InMemoryBlobStore::new()),
            tables: Arc::new(InMemoryTableStore::new()),
            pusher: Arc::new(RecordingPusher::new()),
            events,
        }
    }

    /// The same shared stores seen from another worker id.
    pub fn as_worker(&self, worker_id: &str) -> Self {
        Self {
            config: self.config.clone().with_worker_id(worker_id),
            ..self.clone()
        }
    }

    pub fn deps(&self) -> actors::ActorDeps {
        actors::ActorDeps {
            lock: self.lock.clone(),
            blobs: self.blobs.clone(),
            tables: self.tables.clone(),
            pusher: self.pusher.clone(),
            parsers: Arc::new(ParserRegistry::with_builtins()),
            config: self.config.clone(),
        }
    }

    /// The three standard stages over this stack.
    pub fn registry(&self) -> Result<ActorRegistry, PipelineError> {
        let mut registry = ActorRegistry::new();
        actors::register_standard(&mut registry, self.deps())?;
        Ok(registry)
    }

    pub fn schedulers(&self) -> SchedulerRegistry {
        SchedulerRegistry::standard(
            self.lock.clone(),
            self.checkpoints.clone(),
            self.blobs.clone(),
            self.config.lease_ttl(),
        )
    }

    pub fn master(&self, sources: Vec<SourceConfig>) -> MasterScheduler {
        MasterScheduler::new(
            Arc::new(StaticSourceProvider::new(sources)),
            self.schedulers(),
            self.queue.clone(),
            self.checkpoints.clone(),
            Arc::clone(&self.events),
            self.config.clone(),
        )
    }

    pub fn orchestrator(&self) -> anyhow::Result<Orchestrator> {
        OrchestratorBuilder::new(self.config.clone())
            .with_registry(self.registry()?)
            .with_queue(self.queue.clone())
            .with_events(Arc::clone(&self.events))
            .build()
    }
}

impl Default for MemoryStack {
    fn default() -> Self {
        Self::new(PipelineConfig::default())
    }
}
