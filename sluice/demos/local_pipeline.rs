//! A single worker over in-memory stores.
//!
//! Seeds a container with IIS logs spread across the last few minutes,
//! then runs the master scheduler and the stage pools until every record
//! has reached the (recording) search client.
//!
//! ```text
//! RUST_LOG=sluice=debug cargo run --example local_pipeline
//! ```
//!
//! `SLUICE_*` environment variables override the worker configuration.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sluice::*;
use sluice_testkit::{MemoryStack, RecordingSearchClient, at, blob_source, bucketed_source, iis_log};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sluice=info")),
        )
        .init();

    let config = PipelineConfig::from_env()?
        .with_cadence_secs(2)
        .with_idle_backoff_ms(50);
    let stack = MemoryStack::new(config.clone());

    let now = Utc::now().timestamp();
    let first_bucket = now.div_euclid(60) * 60 - 300;
    let mut expected = 0;
    for minute in 0..5 {
        let rows: Vec<String> = (0..=minute)
            .map(|n| format!("2024-01-01 00:{minute:02}:{n:02} GET /orders/{n} 200"))
            .collect();
        let rows: Vec<&str> = rows.iter().map(String::as_str).collect();
        expected += rows.len();
        stack.blobs.put(
            "iis",
            &format!("W3SVC1/u_ex{minute}.log"),
            iis_log(&rows),
            at(first_bucket + minute * 60 + 5),
        );
    }
    stack
        .blobs
        .put("uploads", "batch-1.log", iis_log(&["2024-01-01 00:00:00 PUT /upload 201"]), at(now));
    expected += 1;

    let sources = vec![
        bucketed_source("web-logs", "iis", 60).with_property(keys::START_OFFSET, first_bucket),
        blob_source("uploads", "uploads"),
    ];

    let client = Arc::new(RecordingSearchClient::new());
    let mut deps = stack.deps();
    deps.pusher = Arc::new(SearchPusherFactory::new(
        client.clone(),
        BatchConfig::default().with_max_records(4),
    ));
    let mut registry = ActorRegistry::new();
    actors::register_standard(&mut registry, deps)?;

    let orchestrator = OrchestratorBuilder::new(config)
        .with_registry(registry)
        .with_queue(stack.queue.clone())
        .with_events(stack.events.clone())
        .build()?;
    let worker = PipelineWorker::new(stack.master(sources), orchestrator);

    let mut lifecycle = stack.events.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = lifecycle.recv().await {
            if let PipelineEvent::UnitsDiscovered { source, count } = event {
                println!("discovered {count} unit(s) for {source}");
            }
        }
    });

    worker.start().await?;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    while client.document_count() < expected && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    worker.shutdown().await?;

    println!(
        "indexed {}/{} records in {} bulk request(s)",
        client.document_count(),
        expected,
        client.batches().len()
    );
    for (index, docs) in client.batches() {
        println!("  {index}: {} document(s)", docs.len());
    }
    Ok(())
}
