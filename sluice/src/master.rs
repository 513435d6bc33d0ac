use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::Instrument;

use crate::checkpoint::CheckpointStore;
use crate::config::PipelineConfig;
use crate::events::{InProcEventBus, PipelineEvent};
use crate::queue::EventQueue;
use crate::runtime::ShutdownToken;
use crate::sharding::{DiscoveryContext, SchedulerRegistry};
use crate::source::{SourceConfig, SourceProvider};
use crate::telemetry;

/// One source that was skipped during a pass.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceFailure {
    pub source: String,
    pub error: String,
}

/// Outcome of one scheduling pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PassReport {
    /// Active sources visited.
    pub sources: usize,
    /// Discovery events enqueued across all sources.
    pub discovered: usize,
    pub failed: Vec<SourceFailure>,
}

/// Time left in `interval` after a pass that took `elapsed`, never negative.
pub fn remaining_interval(interval: Duration, elapsed: Duration) -> Duration {
    interval.saturating_sub(elapsed)
}

/// Drives discovery on a fixed cadence.
///
/// Each pass loads the active sources, runs the matching shard scheduler
/// for each and publishes what it claimed. A failing source is logged and
/// skipped; the rest of the pass continues.
pub struct MasterScheduler {
    sources: Arc<dyn SourceProvider>,
    schedulers: SchedulerRegistry,
    queue: Arc<dyn EventQueue>,
    checkpoints: Arc<dyn CheckpointStore>,
    events: Arc<InProcEventBus>,
    config: PipelineConfig,
}

impl std::fmt::Debug for MasterScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterScheduler")
            .field("worker_id", &self.config.worker_id)
            .field("cadence_secs", &self.config.cadence_secs)
            .field("schedulers", &self.schedulers)
            .finish()
    }
}

impl MasterScheduler {
    pub fn new(
        sources: Arc<dyn SourceProvider>,
        schedulers: SchedulerRegistry,
        queue: Arc<dyn EventQueue>,
        checkpoints: Arc<dyn CheckpointStore>,
        events: Arc<InProcEventBus>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            sources,
            schedulers,
            queue,
            checkpoints,
            events,
            config,
        }
    }

    /// Run one pass as of `now`.
    ///
    /// Fails only when the source list itself cannot be loaded.
    pub async fn schedule_sources(
        &self,
        now: DateTime<Utc>,
    ) -> anyhow::Result<PassReport> {
        let sources = self.sources.active_sources().await?;
        let ctx = DiscoveryContext::new(now, &self.config.worker_id);
        let mut report = PassReport {
            sources: sources.len(),
            ..PassReport::default()
        };

        for source in &sources {
            let strategy = source
                .scheduler_strategy()
                .unwrap_or("unset")
                .to_string();
            let result = self
                .schedule_source(source, &ctx)
                .instrument(telemetry::discover_span(&source.name, &strategy))
                .await;

            match result {
                Ok(count) => {
                    telemetry::record_units_discovered(&source.name, &strategy, count);
                    if count > 0 {
                        self.events.emit(PipelineEvent::UnitsDiscovered {
                            source: source.name.clone(),
                            count,
                        });
                    }
                    report.discovered += count;
                }
                Err(err) => {
                    let error = format!("{err:#}");
                    telemetry::record_source_failed(&source.name, &error);
                    self.events.emit(PipelineEvent::SourceFailed {
                        source: source.name.clone(),
                        error: error.clone(),
                    });
                    report.failed.push(SourceFailure {
                        source: source.name.clone(),
                        error,
                    });
                }
            }
        }

        self.sample_queue_depth().await;
        Ok(report)
    }

    async fn schedule_source(
        &self,
        source: &SourceConfig,
        ctx: &DiscoveryContext,
    ) -> anyhow::Result<usize> {
        let scheduler = self.schedulers.for_source(source)?;
        let discovery = scheduler.discover(source, ctx).await?;
        discovery
            .publish(self.queue.as_ref(), self.checkpoints.as_ref())
            .await
    }

    async fn sample_queue_depth(&self) {
        match self.queue.snapshot().await {
            Ok(snapshot) => {
                for (event_type, entry) in &snapshot.queues {
                    telemetry::set_queue_depth(event_type, entry.ready_count);
                }
            }
            Err(err) => tracing::debug!(error = %err, "queue snapshot unavailable"),
        }
    }

    /// Run passes every `cadence_secs` until `shutdown` is cancelled.
    ///
    /// A pass that overruns the cadence is followed immediately by the next
    /// one. An in-flight pass is finished before the loop exits.
    pub async fn run(&self, shutdown: ShutdownToken) {
        let interval = self.config.cadence();
        tracing::info!(
            worker_id = %self.config.worker_id,
            cadence_secs = self.config.cadence_secs,
            "master scheduler started"
        );

        while !shutdown.is_cancelled() {
            let started = Instant::now();
            let pass = self
                .schedule_sources(Utc::now())
                .instrument(telemetry::schedule_pass_span(&self.config.worker_id))
                .await;
            match pass {
                Ok(report) => tracing::debug!(
                    sources = report.sources,
                    discovered = report.discovered,
                    failed = report.failed.len(),
                    "scheduling pass finished"
                ),
                Err(err) => tracing::warn!(error = %err, "scheduling pass failed"),
            }

            let wait = remaining_interval(interval, started.elapsed());
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }

        tracing::info!("master scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::InMemoryCheckpointStore;
    use crate::events::EventType;
    use crate::lock::InMemoryLockStore;
    use crate::queue::InMemoryEventQueue;
    use crate::sharding::{TimeBucketScheduler, strategies};
    use crate::source::{StaticSourceProvider, keys};
    use chrono::TimeZone;

    struct Fixture {
        queue: Arc<InMemoryEventQueue>,
        master: MasterScheduler,
    }

    fn fixture(sources: Vec<SourceConfig>, config: PipelineConfig) -> Fixture {
        let lock = Arc::new(InMemoryLockStore::new());
        let checkpoints = Arc::new(InMemoryCheckpointStore::new());
        let queue = Arc::new(InMemoryEventQueue::default());
        let mut schedulers = SchedulerRegistry::new();
        schedulers.register(Arc::new(TimeBucketScheduler::new(
            lock,
            checkpoints.clone(),
            config.lease_ttl(),
        )));

        let master = MasterScheduler::new(
            Arc::new(StaticSourceProvider::new(sources)),
            schedulers,
            queue.clone(),
            checkpoints,
            Arc::new(InProcEventBus::default()),
            config,
        );
        Fixture { queue, master }
    }

    fn bucketed(name: &str) -> SourceConfig {
        SourceConfig::new(name, "memory://")
            .with_table("requests")
            .with_property(keys::SCHEDULER, strategies::TIME_BUCKET)
            .with_property(keys::BUCKET_SECS, 60)
    }

    #[test]
    fn test_remaining_interval_never_negative() {
        let interval = Duration::from_secs(30);
        assert_eq!(
            remaining_interval(interval, Duration::from_secs(12)),
            Duration::from_secs(18)
        );
        assert_eq!(
            remaining_interval(interval, Duration::from_secs(45)),
            Duration::ZERO
        );
    }

    #[tokio::test]
    async fn test_failing_sources_do_not_abort_the_pass() {
        let fx = fixture(
            vec![
                bucketed("logs-A"),
                bucketed("hourly").with_property(keys::SCHEDULER, "hourly"),
                SourceConfig::new("unscheduled", "memory://"),
                bucketed("logs-B"),
            ],
            PipelineConfig::default(),
        );

        let report = fx
            .master
            .schedule_sources(Utc.timestamp_opt(125, 0).unwrap())
            .await
            .unwrap();

        assert_eq!(report.sources, 4);
        assert_eq!(report.discovered, 2);
        let failed: Vec<_> = report.failed.iter().map(|f| f.source.as_str()).collect();
        assert_eq!(failed, vec!["hourly", "unscheduled"]);
        assert_eq!(fx.queue.outstanding(&EventType::shard_key_arrived()), 2);
    }

    #[tokio::test]
    async fn test_run_exits_promptly_on_shutdown() {
        let fx = fixture(
            vec![bucketed("logs-A")],
            PipelineConfig::default().with_cadence_secs(3600),
        );
        let master = Arc::new(fx.master);
        let shutdown = ShutdownToken::new();

        let handle = tokio::spawn({
            let master = Arc::clone(&master);
            let shutdown = shutdown.clone();
            async move { master.run(shutdown).await }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("master loop did not stop")
            .unwrap();
        assert_eq!(fx.queue.outstanding(&EventType::shard_key_arrived()), 1);
    }
}
