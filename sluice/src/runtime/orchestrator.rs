use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::actor::ActorRegistry;
use crate::config::PipelineConfig;
use crate::error::Disposition;
use crate::events::{EventType, InProcEventBus, PipelineEvent};
use crate::queue::{Delivery, EventQueue};
use crate::telemetry;

/// Token for signaling graceful shutdown to the dispatch and cadence loops.
#[derive(Clone, Debug)]
pub struct ShutdownToken {
    inner: Arc<ShutdownTokenInner>,
}

#[derive(Debug)]
struct ShutdownTokenInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ShutdownTokenInner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Wait until cancelled.
    pub async fn cancelled(&self) {
        // Register before checking the flag so a cancel in between is seen.
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}

/// What the orchestrator did with one delivery.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Follow-ons enqueued, envelope acknowledged.
    Completed { follow_ons: usize },
    /// Envelope abandoned; the queue decides on redelivery or dead-letter.
    Retry { error: String },
    /// Stale or oversized unit; envelope acknowledged without effect.
    Dropped { reason: String },
    /// No actor for the type; envelope abandoned.
    Unresolved { event_type: EventType },
}

impl DispatchOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Completed { .. } => "completed",
            Self::Retry { .. } => "retry",
            Self::Dropped { .. } => "dropped",
            Self::Unresolved { .. } => "unresolved",
        }
    }
}

#[derive(Clone)]
struct Dispatcher {
    registry: Arc<ActorRegistry>,
    queue: Arc<dyn EventQueue>,
    events: Arc<InProcEventBus>,
}

impl Dispatcher {
    async fn handle(&self, delivery: Delivery) -> DispatchOutcome {
        let envelope = &delivery.envelope;
        let attempt = envelope.meta.attempts;
        let timer = telemetry::record_dispatch_start(envelope.id.to_string());

        self.events.emit(PipelineEvent::Dispatched {
            envelope_id: envelope.id,
            event_type: envelope.event_type.clone(),
            attempt,
        });

        let outcome = self
            .dispatch(&delivery)
            .instrument(telemetry::dispatch_span(
                envelope.id.to_string(),
                envelope.event_type.as_str(),
                attempt,
            ))
            .await;

        telemetry::record_dispatch_end(timer, envelope.event_type.as_str(), outcome.label());
        outcome
    }

    async fn dispatch(&self, delivery: &Delivery) -> DispatchOutcome {
        let envelope = &delivery.envelope;
        let envelope_id = envelope.id;
        let event_type = envelope.event_type.clone();

        let actor = match self.registry.resolve(&event_type) {
            Ok(actor) => actor,
            Err(err) => {
                tracing::error!(%event_type, error = %err, "no actor for envelope");
                self.abandon(delivery, err.to_string()).await;
                self.events.emit(PipelineEvent::Unresolved {
                    envelope_id,
                    event_type: event_type.clone(),
                });
                return DispatchOutcome::Unresolved { event_type };
            }
        };

        match actor.process(envelope).await {
            Ok(follow_ons) => {
                let count = follow_ons.len();
                if let Err(err) = self
                    .queue
                    .send_many(follow_ons, Some(envelope.meta.correlation_id))
                    .await
                {
                    let error = format!("enqueue of follow-ons failed: {err}");
                    tracing::warn!(%event_type, error = %error, "leaving envelope for redelivery");
                    return self.retry(delivery, error).await;
                }
                if let Err(err) = self.queue.acknowledge(delivery.receipt).await {
                    tracing::warn!(
                        %event_type,
                        error = %err,
                        "acknowledge failed, envelope may be redelivered"
                    );
                }
                self.events.emit(PipelineEvent::Completed {
                    envelope_id,
                    event_type,
                    follow_ons: count,
                });
                DispatchOutcome::Completed { follow_ons: count }
            }
            Err(err) => match err.disposition() {
                Disposition::Drop => {
                    let reason = err.to_string();
                    tracing::warn!(
                        %event_type,
                        kind = err.kind(),
                        reason = %reason,
                        "dropping envelope"
                    );
                    if let Err(ack_err) = self.queue.acknowledge(delivery.receipt).await {
                        tracing::warn!(%event_type, error = %ack_err, "acknowledge of dropped envelope failed");
                    }
                    self.events.emit(PipelineEvent::Dropped {
                        envelope_id,
                        event_type,
                        reason: reason.clone(),
                    });
                    DispatchOutcome::Dropped { reason }
                }
                Disposition::Retry => {
                    tracing::warn!(
                        %event_type,
                        attempt = envelope.meta.attempts,
                        kind = err.kind(),
                        error = %err,
                        "actor failed, leaving envelope for redelivery"
                    );
                    self.retry(delivery, err.to_string()).await
                }
            },
        }
    }

    async fn retry(&self, delivery: &Delivery, error: String) -> DispatchOutcome {
        self.abandon(delivery, error.clone()).await;
        self.events.emit(PipelineEvent::Failed {
            envelope_id: delivery.envelope.id,
            event_type: delivery.envelope.event_type.clone(),
            attempt: delivery.envelope.meta.attempts,
            error: error.clone(),
        });
        DispatchOutcome::Retry { error }
    }

    async fn abandon(&self, delivery: &Delivery, error: String) {
        if let Err(err) = self.queue.abandon(delivery.receipt, Some(error)).await {
            tracing::warn!(
                receipt = %delivery.receipt,
                error = %err,
                "abandon failed, envelope returns after its visibility timeout"
            );
        }
    }
}

/// Pulls envelopes off the queue and runs them through their actors.
///
/// Each registered event type gets its own pool of workers. The
/// orchestrator never retries on its own: failed envelopes are abandoned
/// and the queue's redelivery and dead-letter policy takes over.
pub struct Orchestrator {
    dispatcher: Dispatcher,
    config: PipelineConfig,
    shutdown_token: ShutdownToken,
    worker_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let worker_count = self
            .worker_handles
            .try_lock()
            .map(|handles| handles.len())
            .unwrap_or_default();

        f.debug_struct("Orchestrator")
            .field("config", &self.config)
            .field("registry", &self.dispatcher.registry)
            .field("worker_count", &worker_count)
            .field("shutdown_cancelled", &self.shutdown_token.is_cancelled())
            .finish()
    }
}

impl Orchestrator {
    pub fn new(
        config: PipelineConfig,
        registry: Arc<ActorRegistry>,
        queue: Arc<dyn EventQueue>,
        events: Arc<InProcEventBus>,
        shutdown_token: ShutdownToken,
    ) -> Self {
        Self {
            dispatcher: Dispatcher {
                registry,
                queue,
                events,
            },
            config,
            shutdown_token,
            worker_handles: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn registry(&self) -> Arc<ActorRegistry> {
        Arc::clone(&self.dispatcher.registry)
    }

    pub fn events(&self) -> Arc<InProcEventBus> {
        Arc::clone(&self.dispatcher.events)
    }

    pub fn shutdown_token(&self) -> ShutdownToken {
        self.shutdown_token.clone()
    }

    pub async fn worker_count(&self) -> usize {
        self.worker_handles.lock().await.len()
    }

    /// Spawn a worker pool for every registered actor.
    pub async fn start(&self) -> anyhow::Result<()> {
        let registry = self.registry();
        if registry.is_empty() {
            anyhow::bail!("no actors registered");
        }
        for descriptor in registry.descriptors() {
            let parallelism = self.config.effective_parallelism(descriptor.parallelism);
            self.spawn_worker_pool(descriptor.event_type.clone(), parallelism)
                .await;
        }
        tracing::info!(
            actors = registry.len(),
            workers = self.worker_count().await,
            "orchestrator started"
        );
        Ok(())
    }

    /// Cancel the workers and wait for in-flight envelopes to settle.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        tracing::info!("initiating graceful shutdown of orchestrator");
        self.shutdown_token.cancel();

        let handles = {
            let mut guard = self.worker_handles.lock().await;
            std::mem::take(&mut *guard)
        };

        let grace = self.config.shutdown_grace();
        for handle in handles {
            match tokio::time::timeout(grace, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => tracing::warn!(error = ?err, "dispatch worker failed"),
                Err(_) => tracing::warn!("dispatch worker timed out during shutdown"),
            }
        }

        tracing::info!("orchestrator shutdown complete");
        Ok(())
    }

    /// Spawn `parallelism` workers for one event type.
    pub async fn spawn_worker_pool(&self, event_type: EventType, parallelism: usize) {
        let worker_group = format!("{}-{}", self.config.worker_id, event_type);
        let mut spawned = Vec::with_capacity(parallelism);

        for i in 0..parallelism {
            let worker_id = format!("{worker_group}-w{i}");
            let dispatcher = self.dispatcher.clone();
            let shutdown = self.shutdown_token.clone();
            let event_type = event_type.clone();
            let idle_backoff = self.config.idle_backoff();

            spawned.push(tokio::spawn(async move {
                Self::worker_loop(worker_id, event_type, dispatcher, shutdown, idle_backoff)
                    .await;
            }));
        }

        self.worker_handles.lock().await.extend(spawned);
    }

    /// Receive and dispatch one envelope of `event_type`, if one is visible.
    pub async fn process_next(
        &self,
        event_type: &EventType,
    ) -> anyhow::Result<Option<DispatchOutcome>> {
        match self.dispatcher.queue.receive(event_type).await? {
            Some(delivery) => Ok(Some(self.dispatcher.handle(delivery).await)),
            None => Ok(None),
        }
    }

    pub async fn handle_delivery(&self, delivery: Delivery) -> DispatchOutcome {
        self.dispatcher.handle(delivery).await
    }

    async fn worker_loop(
        worker_id: String,
        event_type: EventType,
        dispatcher: Dispatcher,
        shutdown: ShutdownToken,
        idle_backoff: Duration,
    ) {
        loop {
            if shutdown.is_cancelled() {
                tracing::debug!(worker_id = %worker_id, "dispatch worker shutting down");
                break;
            }

            let idle = match dispatcher.queue.receive(&event_type).await {
                Ok(Some(delivery)) => {
                    dispatcher.handle(delivery).await;
                    false
                }
                Ok(None) => true,
                Err(err) => {
                    tracing::warn!(worker_id = %worker_id, %event_type, error = %err, "receive error");
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(idle_backoff) => {}
                }
            }
        }
    }
}
