//! Discovery behavior of the shard schedulers against shared in-memory
//! stores, including two workers racing for the same source.

use chrono::Duration;
use sluice::sharding::{BlobScheduler, TimeBucketScheduler};
use sluice::*;
use sluice_testkit::{InMemoryBlobStore, MemoryStack, at, blob_source, bucketed_source};
use std::sync::Arc;

fn blob_scheduler(stack: &MemoryStack) -> BlobScheduler {
    BlobScheduler::new(
        stack.lock.clone(),
        stack.checkpoints.clone(),
        stack.blobs.clone(),
        Duration::seconds(60),
    )
}

fn ids(discovery: &Discovery) -> Vec<String> {
    discovery
        .descriptors()
        .map(|descriptor| descriptor.shard_key.to_string())
        .collect()
}

fn seed(blobs: &InMemoryBlobStore) {
    blobs.put("iis", "c.log", "x", at(300));
    blobs.put("iis", "a.log", "x", at(100));
    blobs.put("iis", "b.log", "x", at(100));
}

#[tokio::test]
async fn test_blob_scheduler_emits_oldest_first_and_marks_on_publish() {
    let stack = MemoryStack::default();
    seed(&stack.blobs);
    let scheduler = blob_scheduler(&stack);
    let source = blob_source("logs-B", "iis");
    let ctx = DiscoveryContext::new(at(1_000), "w1");

    let discovery = scheduler.discover(&source, &ctx).await.unwrap();
    assert_eq!(ids(&discovery), vec!["a.log", "b.log", "c.log"]);
    assert_eq!(discovery.claim_count(), 1);
    assert_eq!(
        stack.lock.current("logs-B:iis/").map(|lease| lease.holder),
        Some("w1".to_string())
    );

    let published = discovery
        .publish(stack.queue.as_ref(), stack.checkpoints.as_ref())
        .await
        .unwrap();
    assert_eq!(published, 3);
    assert!(stack.checkpoints.is_discovered("logs-B:a.log").await.unwrap());
    assert_eq!(stack.lock.held_count(), 0);
    assert_eq!(stack.queue.outstanding(&EventType::blob_file_arrived()), 3);

    stack.blobs.put("iis", "d.log", "x", at(400));
    let next = scheduler.discover(&source, &ctx).await.unwrap();
    assert_eq!(ids(&next), vec!["d.log"]);
}

#[tokio::test]
async fn test_blob_scheduler_caps_units_per_pass() {
    let stack = MemoryStack::default();
    seed(&stack.blobs);
    let scheduler = blob_scheduler(&stack);
    let source = blob_source("logs-B", "iis").with_property(keys::MAX_UNITS_PER_PASS, 2);
    let ctx = DiscoveryContext::new(at(1_000), "w1");

    let first = scheduler.discover(&source, &ctx).await.unwrap();
    assert_eq!(ids(&first), vec!["a.log", "b.log"]);
    first
        .publish(stack.queue.as_ref(), stack.checkpoints.as_ref())
        .await
        .unwrap();

    let second = scheduler.discover(&source, &ctx).await.unwrap();
    assert_eq!(ids(&second), vec!["c.log"]);
}

#[tokio::test]
async fn test_blob_scheduler_skips_listing_held_elsewhere() {
    let stack = MemoryStack::default();
    seed(&stack.blobs);
    let scheduler = blob_scheduler(&stack);
    let source = blob_source("logs-B", "iis");

    let held = scheduler
        .discover(&source, &DiscoveryContext::new(at(1_000), "w1"))
        .await
        .unwrap();
    assert_eq!(held.len(), 3);

    let other = scheduler
        .discover(&source, &DiscoveryContext::new(at(1_000), "w2"))
        .await
        .unwrap();
    assert!(other.is_empty());
    assert_eq!(other.claim_count(), 0);
}

#[tokio::test]
async fn test_blob_scheduler_releases_claim_when_nothing_is_new() {
    let stack = MemoryStack::default();
    let scheduler = blob_scheduler(&stack);
    let source = blob_source("logs-B", "iis");

    let discovery = scheduler
        .discover(&source, &DiscoveryContext::new(at(1_000), "w1"))
        .await
        .unwrap();
    assert!(discovery.is_empty());
    assert_eq!(discovery.claim_count(), 0);
    assert_eq!(stack.lock.held_count(), 0);
}

#[tokio::test]
async fn test_two_workers_never_discover_the_same_bucket() {
    let stack = MemoryStack::default();
    let scheduler = Arc::new(TimeBucketScheduler::new(
        stack.lock.clone(),
        stack.checkpoints.clone(),
        Duration::seconds(60),
    ));
    let source = bucketed_source("logs-A", "iis", 60);
    stack
        .checkpoints
        .advance_high_water_mark("logs-A", 0)
        .await
        .unwrap();

    let mut handles = Vec::new();
    for worker in ["w1", "w2"] {
        let scheduler = Arc::clone(&scheduler);
        let source = source.clone();
        handles.push(tokio::spawn(async move {
            let ctx = DiscoveryContext::new(at(250), worker);
            let discovery = scheduler.discover(&source, &ctx).await.unwrap();
            ids(&discovery)
        }));
    }

    let mut seen = Vec::new();
    for handle in handles {
        seen.extend(handle.await.unwrap());
    }
    let total = seen.len();
    seen.sort();
    seen.dedup();
    assert_eq!(seen.len(), total, "a bucket was claimed twice: {seen:?}");
}
