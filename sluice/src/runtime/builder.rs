use std::fmt;
use std::sync::Arc;

use crate::actor::ActorRegistry;
use crate::config::PipelineConfig;
use crate::events::InProcEventBus;
use crate::queue::EventQueue;

use super::orchestrator::{Orchestrator, ShutdownToken};

/// Builder for an [`Orchestrator`] with explicit dependencies.
///
/// The queue and registry are required. Without an event bus the
/// orchestrator gets a private one; without a shutdown token, a fresh one.
///
/// # Example
///
/// ```ignore
/// let orchestrator = OrchestratorBuilder::new(config)
///     .with_registry(registry)
///     .with_queue(queue)
///     .with_events(bus)
///     .build()?;
/// orchestrator.start().await?;
/// ```
pub struct OrchestratorBuilder {
    config: PipelineConfig,
    registry: Option<Arc<ActorRegistry>>,
    queue: Option<Arc<dyn EventQueue>>,
    events: Option<Arc<InProcEventBus>>,
    shutdown_token: Option<ShutdownToken>,
}

impl fmt::Debug for OrchestratorBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrchestratorBuilder")
            .field("config", &self.config)
            .field("registry_set", &self.registry.is_some())
            .field("queue_set", &self.queue.is_some())
            .field("events_set", &self.events.is_some())
            .field("shutdown_token_set", &self.shutdown_token.is_some())
            .finish()
    }
}

impl OrchestratorBuilder {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            registry: None,
            queue: None,
            events: None,
            shutdown_token: None,
        }
    }

    pub fn with_registry(mut self, registry: impl Into<Arc<ActorRegistry>>) -> Self {
        self.registry = Some(registry.into());
        self
    }

    pub fn with_queue(mut self, queue: Arc<dyn EventQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn with_events(mut self, events: Arc<InProcEventBus>) -> Self {
        self.events = Some(events);
        self
    }

    /// Share a token with other loops, such as the master scheduler.
    pub fn with_shutdown_token(mut self, token: ShutdownToken) -> Self {
        self.shutdown_token = Some(token);
        self
    }

    /// # Errors
    ///
    /// Returns an error if the queue or registry is missing, or the
    /// registry is empty.
    pub fn build(self) -> anyhow::Result<Orchestrator> {
        let registry = self
            .registry
            .ok_or_else(|| anyhow::anyhow!("registry dependency missing"))?;
        if registry.is_empty() {
            anyhow::bail!("registry has no actors");
        }
        let queue = self
            .queue
            .ok_or_else(|| anyhow::anyhow!("queue dependency missing"))?;
        let events = self.events.unwrap_or_default();
        let shutdown_token = self.shutdown_token.unwrap_or_default();

        Ok(Orchestrator::new(
            self.config,
            registry,
            queue,
            events,
            shutdown_token,
        ))
    }
}
