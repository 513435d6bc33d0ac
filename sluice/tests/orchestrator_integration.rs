//! Orchestrator dispatch against the in-memory queue with scripted actors.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use sluice::*;
use sluice_testkit::ScriptedActor;
use tokio::time::timeout;
use uuid::Uuid;

fn config() -> PipelineConfig {
    PipelineConfig::default()
        .with_worker_id("w1")
        .with_idle_backoff_ms(10)
}

fn queue() -> Arc<InMemoryEventQueue> {
    Arc::new(InMemoryEventQueue::new(
        QueueConfig::default().with_base_delay_ms(0),
    ))
}

fn orchestrator(
    registry: ActorRegistry,
    queue: &Arc<InMemoryEventQueue>,
    events: &Arc<InProcEventBus>,
) -> Orchestrator {
    OrchestratorBuilder::new(config())
        .with_registry(registry)
        .with_queue(queue.clone())
        .with_events(Arc::clone(events))
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_follow_ons_inherit_the_parent_correlation() {
    let leaf_event = |n: u32| Event::new("Leaf", &json!({ "n": n })).unwrap();
    let root = ScriptedActor::with_follow_ons(vec![leaf_event(1), leaf_event(2)]);
    let leaf = ScriptedActor::new();

    let mut registry = ActorRegistry::new();
    let root_actor = root.clone();
    registry
        .register(ActorDescriptor::new("Root", 1, move || root_actor.clone()))
        .unwrap();
    let leaf_actor = leaf.clone();
    registry
        .register(ActorDescriptor::new("Leaf", 1, move || leaf_actor.clone()))
        .unwrap();

    let queue = queue();
    let events = Arc::new(InProcEventBus::default());
    let orchestrator = orchestrator(registry, &queue, &events);

    let correlation = Uuid::now_v7();
    queue
        .send(Event::new("Root", &json!({})).unwrap(), Some(correlation))
        .await
        .unwrap();

    let outcome = orchestrator
        .process_next(&EventType::new("Root"))
        .await
        .unwrap();
    assert!(matches!(outcome, Some(DispatchOutcome::Completed { follow_ons: 2 })));

    for _ in 0..2 {
        let outcome = orchestrator
            .process_next(&EventType::new("Leaf"))
            .await
            .unwrap();
        assert!(matches!(outcome, Some(DispatchOutcome::Completed { follow_ons: 0 })));
    }

    let seen = leaf.seen();
    assert_eq!(seen.len(), 2);
    assert!(seen.iter().all(|env| env.meta.correlation_id == correlation));
    let bodies: Vec<_> = seen.iter().map(|env| env.body["n"].clone()).collect();
    assert_eq!(bodies, vec![json!(1), json!(2)]);

    let snapshot = queue.snapshot().await.unwrap();
    assert_eq!(snapshot.entry("Root").acknowledged_count, 1);
    assert_eq!(snapshot.entry("Leaf").acknowledged_count, 2);
}

#[tokio::test]
async fn test_lifecycle_events_follow_a_failed_dispatch() {
    let failing = ScriptedActor::failing(|| PipelineError::transient("search cluster busy"));
    let mut registry = ActorRegistry::new();
    registry
        .register(ActorDescriptor::new("Work", 1, move || failing.clone()))
        .unwrap();

    let queue = queue();
    let events = Arc::new(InProcEventBus::default());
    let mut rx = events.subscribe();
    let orchestrator = orchestrator(registry, &queue, &events);

    queue
        .send(Event::new("Work", &json!({})).unwrap(), None)
        .await
        .unwrap();
    let outcome = orchestrator
        .process_next(&EventType::new("Work"))
        .await
        .unwrap();
    assert!(matches!(outcome, Some(DispatchOutcome::Retry { .. })));

    assert!(matches!(
        rx.recv().await.unwrap(),
        PipelineEvent::Dispatched { attempt: 1, .. }
    ));
    match rx.recv().await.unwrap() {
        PipelineEvent::Failed { attempt, error, .. } => {
            assert_eq!(attempt, 1);
            assert!(error.contains("search cluster busy"));
        }
        other => panic!("expected Failed, got {other:?}"),
    }
    assert_eq!(queue.outstanding(&EventType::new("Work")), 1);
}

#[tokio::test]
async fn test_started_pools_drain_the_queue() {
    let work = ScriptedActor::new();
    let mut registry = ActorRegistry::new();
    let actor = work.clone();
    registry
        .register(ActorDescriptor::new("Work", 3, move || actor.clone()))
        .unwrap();

    let queue = queue();
    let events = Arc::new(InProcEventBus::default());
    let orchestrator = orchestrator(registry, &queue, &events);
    orchestrator.start().await.unwrap();
    assert_eq!(orchestrator.worker_count().await, 3);

    for n in 0..20 {
        queue
            .send(Event::new("Work", &json!({ "n": n })).unwrap(), None)
            .await
            .unwrap();
    }

    timeout(Duration::from_secs(5), async {
        while work.invocation_count() < 20 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("workers did not drain the queue");

    orchestrator.shutdown().await.unwrap();
    assert_eq!(queue.outstanding(&EventType::new("Work")), 0);
    assert_eq!(work.invocation_count(), 20);
}
