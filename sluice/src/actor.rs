use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::PipelineError;
use crate::events::{Event, EventEnvelope, EventType};

/// A single pipeline stage bound to one event type.
///
/// Instances are constructed per invocation, so implementations keep any
/// shared state behind the collaborators they were built with.
#[async_trait]
pub trait ProcessorActor: Send + Sync {
    /// Handle one envelope. Returned events are enqueued by the
    /// orchestrator before the envelope is acknowledged.
    async fn process(
        &self,
        envelope: &EventEnvelope,
    ) -> Result<Vec<Event>, PipelineError>;
}

type ActorFactory = Arc<dyn Fn() -> Box<dyn ProcessorActor> + Send + Sync>;

/// Static mapping from an event type to a handler constructor.
#[derive(Clone)]
pub struct ActorDescriptor {
    pub event_type: EventType,
    /// Requested worker count; `0` means the configured default.
    pub parallelism: usize,
    factory: ActorFactory,
}

impl ActorDescriptor {
    pub fn new<F, A>(
        event_type: impl Into<EventType>,
        parallelism: usize,
        factory: F,
    ) -> Self
    where
        F: Fn() -> A + Send + Sync + 'static,
        A: ProcessorActor + 'static,
    {
        Self {
            event_type: event_type.into(),
            parallelism,
            factory: Arc::new(move || Box::new(factory()) as Box<dyn ProcessorActor>),
        }
    }

    pub fn instantiate(&self) -> Box<dyn ProcessorActor> {
        (self.factory)()
    }
}

impl fmt::Debug for ActorDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActorDescriptor")
            .field("event_type", &self.event_type)
            .field("parallelism", &self.parallelism)
            .finish()
    }
}

/// Event type to actor lookup, built once in the composition root.
#[derive(Clone, Debug, Default)]
pub struct ActorRegistry {
    descriptors: HashMap<EventType, ActorDescriptor>,
}

impl ActorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a descriptor. Registering the same event type twice is a
    /// configuration error.
    pub fn register(
        &mut self,
        descriptor: ActorDescriptor,
    ) -> Result<(), PipelineError> {
        if self.descriptors.contains_key(&descriptor.event_type) {
            return Err(PipelineError::configuration(format!(
                "actor for '{}' registered twice",
                descriptor.event_type
            )));
        }
        self.descriptors
            .insert(descriptor.event_type.clone(), descriptor);
        Ok(())
    }

    /// Construct a fresh actor for `event_type`.
    pub fn resolve(
        &self,
        event_type: &EventType,
    ) -> Result<Box<dyn ProcessorActor>, PipelineError> {
        self.descriptor(event_type)
            .map(ActorDescriptor::instantiate)
            .ok_or_else(|| {
                PipelineError::configuration(format!(
                    "no actor registered for event type '{event_type}'"
                ))
            })
    }

    pub fn descriptor(&self, event_type: &EventType) -> Option<&ActorDescriptor> {
        self.descriptors.get(event_type)
    }

    /// Descriptors sorted by event type.
    pub fn descriptors(&self) -> Vec<&ActorDescriptor> {
        let mut descriptors: Vec<_> = self.descriptors.values().collect();
        descriptors.sort_by(|a, b| a.event_type.as_str().cmp(b.event_type.as_str()));
        descriptors
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Echo;

    #[async_trait]
    impl ProcessorActor for Echo {
        async fn process(
            &self,
            envelope: &EventEnvelope,
        ) -> Result<Vec<Event>, PipelineError> {
            Ok(vec![Event {
                event_type: EventType::from("Echoed"),
                body: envelope.body.clone(),
            }])
        }
    }

    #[tokio::test]
    async fn test_resolve_constructs_per_call() {
        let built = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&built);
        let mut registry = ActorRegistry::new();
        registry
            .register(ActorDescriptor::new("Echo", 2, move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Echo
            }))
            .unwrap();

        let event_type = EventType::from("Echo");
        let envelope = EventEnvelope::new(
            Event::new("Echo", &serde_json::json!({"n": 1})).unwrap(),
            None,
        );
        for _ in 0..2 {
            let out = registry
                .resolve(&event_type)
                .unwrap()
                .process(&envelope)
                .await
                .unwrap();
            assert_eq!(out[0].body["n"], 1);
        }
        assert_eq!(built.load(Ordering::SeqCst), 2);
        assert_eq!(registry.descriptor(&event_type).unwrap().parallelism, 2);
    }

    #[test]
    fn test_unknown_type_is_configuration_error() {
        let registry = ActorRegistry::new();
        assert!(matches!(
            registry.resolve(&EventType::from("Nope")),
            Err(PipelineError::Configuration(_))
        ));
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry = ActorRegistry::new();
        registry.register(ActorDescriptor::new("Echo", 1, || Echo)).unwrap();
        assert!(registry
            .register(ActorDescriptor::new("Echo", 4, || Echo))
            .is_err());
        assert_eq!(registry.len(), 1);
    }
}
