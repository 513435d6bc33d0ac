//! The queue's delivery budget is the only retry budget: failed envelopes
//! are redelivered until they are dead-lettered, deliberate drops are not.

use std::sync::Arc;

use serde_json::json;
use sluice::*;
use sluice_testkit::ScriptedActor;

fn setup(actor: ScriptedActor) -> (Arc<InMemoryEventQueue>, Arc<InProcEventBus>, Orchestrator) {
    let events = Arc::new(InProcEventBus::default());
    let queue = Arc::new(
        InMemoryEventQueue::new(
            QueueConfig::default()
                .with_base_delay_ms(0)
                .with_max_delivery_attempts(3),
        )
        .with_event_bus(Arc::clone(&events)),
    );
    let mut registry = ActorRegistry::new();
    registry
        .register(ActorDescriptor::new("Work", 1, move || actor.clone()))
        .unwrap();
    let orchestrator = OrchestratorBuilder::new(PipelineConfig::default())
        .with_registry(registry)
        .with_queue(queue.clone())
        .with_events(Arc::clone(&events))
        .build()
        .unwrap();
    (queue, events, orchestrator)
}

#[tokio::test]
async fn test_repeated_failures_end_in_the_dead_letter_list() {
    let actor = ScriptedActor::failing(|| PipelineError::transient("timeout"));
    let (queue, events, orchestrator) = setup(actor.clone());
    let mut rx = events.subscribe();
    let work = EventType::new("Work");

    queue
        .send(Event::new("Work", &json!({ "blob": "a.log" })).unwrap(), None)
        .await
        .unwrap();

    for _ in 0..3 {
        let outcome = orchestrator.process_next(&work).await.unwrap();
        assert!(matches!(outcome, Some(DispatchOutcome::Retry { .. })));
    }
    assert!(orchestrator.process_next(&work).await.unwrap().is_none());
    assert_eq!(actor.invocation_count(), 3);

    let dead = queue.dead_letters(&work).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].envelope.meta.attempts, 3);
    assert!(dead[0].last_error.as_deref().unwrap_or_default().contains("timeout"));

    let mut dead_lettered = false;
    while let Ok(event) = rx.try_recv() {
        if let PipelineEvent::DeadLettered { attempts, .. } = event {
            assert_eq!(attempts, 3);
            dead_lettered = true;
        }
    }
    assert!(dead_lettered);
}

#[tokio::test]
async fn test_recovered_actor_completes_before_the_budget_runs_out() {
    let actor = ScriptedActor::failing(|| PipelineError::transient("timeout"));
    let (queue, _events, orchestrator) = setup(actor.clone());
    let work = EventType::new("Work");
    queue
        .send(Event::new("Work", &json!({})).unwrap(), None)
        .await
        .unwrap();

    let first = orchestrator.process_next(&work).await.unwrap();
    assert!(matches!(first, Some(DispatchOutcome::Retry { .. })));

    actor.succeed();
    let second = orchestrator.process_next(&work).await.unwrap();
    assert!(matches!(second, Some(DispatchOutcome::Completed { .. })));
    assert!(queue.dead_letters(&work).await.unwrap().is_empty());
    assert_eq!(queue.snapshot().await.unwrap().entry("Work").acknowledged_count, 1);
}

#[tokio::test]
async fn test_stale_units_are_dropped_not_dead_lettered() {
    let actor = ScriptedActor::failing(|| PipelineError::stale("iis/a.log"));
    let (queue, _events, orchestrator) = setup(actor.clone());
    let work = EventType::new("Work");
    queue
        .send(Event::new("Work", &json!({})).unwrap(), None)
        .await
        .unwrap();

    let outcome = orchestrator.process_next(&work).await.unwrap();
    assert!(matches!(outcome, Some(DispatchOutcome::Dropped { .. })));
    assert!(orchestrator.process_next(&work).await.unwrap().is_none());
    assert!(queue.dead_letters(&work).await.unwrap().is_empty());
    assert_eq!(actor.invocation_count(), 1);
}
