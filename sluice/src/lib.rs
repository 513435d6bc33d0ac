//! Sluice - lease-guarded shard scheduling and actor dispatch for
//! distributed log ingestion.
//!
//! Every worker in a fleet runs the same two loops. The master scheduler
//! periodically asks each configured source what work exists, claims it
//! through leases and enqueues one event per unit. The orchestrator pulls
//! those events and dispatches them to stage actors, which read the unit,
//! parse it and push the records to a search backend in batches. Workers
//! coordinate only through the shared lock, checkpoint and queue stores.
//!
//! # Core Concepts
//!
//! - **Lease**: A named, time-bounded exclusive claim in a [`LockStore`].
//!   Long work keeps its lease alive with a [`LeaseKeeper`].
//!
//! - **Shard scheduler**: A [`ShardScheduler`] turns a source's partition
//!   scheme into leased units. See [`sharding`] for the time-bucket,
//!   range-key and blob strategies.
//!
//! - **Checkpoints**: A [`CheckpointStore`] keeps per-source high-water
//!   marks and per-unit discovered marks so finished work is never
//!   rediscovered.
//!
//! - **Queue**: An [`EventQueue`] delivers envelopes at least once, with
//!   redelivery backoff and a dead-letter threshold.
//!
//! - **Actors**: [`ProcessorActor`] implementations registered per event
//!   type in an [`ActorRegistry`] and driven by the [`Orchestrator`].
//!
//! - **Pusher**: A [`BatchPusher`] buffers records per index and writes
//!   them through a [`SearchClient`]. Stages get a fresh one per unit from
//!   a [`PusherFactory`].
//!
//! # Feature Flags
//!
//! - `metrics` - Prometheus counters, gauges and histograms
//!
//! # Example
//!
//! ```ignore
//! use sluice::*;
//!
//! let config = PipelineConfig::from_env()?;
//! let mut registry = ActorRegistry::new();
//! actors::register_standard(&mut registry, deps)?;
//!
//! let orchestrator = OrchestratorBuilder::new(config.clone())
//!     .with_registry(registry)
//!     .with_queue(queue.clone())
//!     .build()?;
//! let worker = PipelineWorker::new(master, orchestrator);
//! worker.start().await?;
//! ```

/// Processor actor trait and the event-type registry.
pub mod actor;

/// The standard ingestion stages.
pub mod actors;

/// High-water marks and discovered-unit marks.
pub mod checkpoint;

/// Worker, queue and batching configuration.
///
/// [`PipelineConfig`] loads from `SLUICE_*` environment variables and
/// validates itself; [`QueueConfig`] and [`BatchConfig`] tune delivery
/// and the pusher.
pub mod config;

/// Elasticsearch `_bulk` client.
pub mod elastic;

/// Pipeline failure taxonomy and its retry disposition.
pub mod error;

/// Queue events, envelopes and the in-process lifecycle bus.
///
/// - [`Event`] and [`EventEnvelope`] for queued work
/// - [`PipelineEvent`] for lifecycle notifications
/// - [`InProcEventBus`] for in-process broadcasting
pub mod events;

/// Distributed leases and the renewal keeper.
pub mod lock;

/// Periodic discovery pass over every active source.
pub mod master;

#[cfg(feature = "metrics")]
/// Prometheus metrics registry and recorders.
pub mod metrics;

/// Record parsers and their registry.
pub mod parsing;

/// Batched writes to the search backend.
pub mod pusher;

/// Event queue trait, in-memory implementation and snapshots.
pub mod queue;

/// Normalized parsed records.
pub mod record;

/// Dispatch loops, the orchestrator builder and the worker process.
pub mod runtime;

/// Shard schedulers and two-phase discovery.
pub mod sharding;

/// Source configuration and providers.
pub mod source;

/// Blob and table storage collaborators.
pub mod storage;

/// Tracing spans and structured log helpers.
pub mod telemetry;

pub use actor::*;
pub use checkpoint::*;
pub use config::*;
pub use elastic::ElasticsearchClient;
pub use error::*;
pub use events::*;
pub use lock::*;
pub use master::{MasterScheduler, PassReport, SourceFailure};
pub use parsing::{Parser, ParserRegistry, RecordIter};
pub use pusher::*;
pub use queue::*;
pub use record::*;
pub use runtime::{DispatchOutcome, Orchestrator, OrchestratorBuilder, PipelineWorker, ShutdownToken};
pub use sharding::{
    Discovery, DiscoveryContext, DiscoveryDescriptor, SchedulerRegistry, ShardKey,
    ShardScheduler, TimeBucket, UnitRef,
};
pub use source::*;
pub use storage::*;
