//! Prometheus metrics for the scheduling and dispatch loops.
//!
//! ## Counters
//! - `sluice_units_discovered_total` - units enqueued by shard schedulers
//! - `sluice_source_failures_total` - sources skipped after an error
//! - `sluice_dispatch_total` - dispatch outcomes per event type
//! - `sluice_dead_lettered_total` - envelopes that exhausted redelivery
//! - `sluice_records_pushed_total` - records written to the search backend
//!
//! ## Gauges
//! - `sluice_queue_depth` - outstanding envelopes per event type
//!
//! ## Histograms
//! - `sluice_dispatch_duration_seconds` - actor invocation time
#![cfg(feature = "metrics")]

use prometheus::{
    CounterVec, GaugeVec, HistogramVec, Opts, Registry, exponential_buckets,
};
use std::sync::LazyLock;

/// Global Prometheus registry for sluice metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

pub static UNITS_DISCOVERED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "sluice_units_discovered_total",
        "Total number of units enqueued by shard schedulers",
    );
    CounterVec::new(opts, &["source", "strategy"])
        .expect("sluice_units_discovered_total metric creation failed")
});

pub static SOURCE_FAILURES_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "sluice_source_failures_total",
        "Total number of sources skipped during a scheduling pass",
    );
    CounterVec::new(opts, &["source"])
        .expect("sluice_source_failures_total metric creation failed")
});

/// Labels: `event_type`, `outcome` (completed, retry, dropped, unresolved).
pub static DISPATCH_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts =
        Opts::new("sluice_dispatch_total", "Total number of dispatched envelopes");
    CounterVec::new(opts, &["event_type", "outcome"])
        .expect("sluice_dispatch_total metric creation failed")
});

pub static DEAD_LETTERED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "sluice_dead_lettered_total",
        "Total number of dead-lettered envelopes",
    );
    CounterVec::new(opts, &["event_type"])
        .expect("sluice_dead_lettered_total metric creation failed")
});

/// Labels: `index`, `trigger` (threshold or flush).
pub static RECORDS_PUSHED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "sluice_records_pushed_total",
        "Total number of records written to the search backend",
    );
    CounterVec::new(opts, &["index", "trigger"])
        .expect("sluice_records_pushed_total metric creation failed")
});

pub static QUEUE_DEPTH: LazyLock<GaugeVec> = LazyLock::new(|| {
    let opts = Opts::new("sluice_queue_depth", "Outstanding envelopes per type");
    GaugeVec::new(opts, &["event_type"])
        .expect("sluice_queue_depth metric creation failed")
});

pub static DISPATCH_DURATION_SECONDS: LazyLock<HistogramVec> =
    LazyLock::new(|| {
        let buckets = exponential_buckets(0.001, 2.0, 15)
            .expect("bucket creation failed");
        let opts = prometheus::HistogramOpts::new(
            "sluice_dispatch_duration_seconds",
            "Actor invocation duration in seconds",
        )
        .buckets(buckets);
        HistogramVec::new(opts, &["event_type", "outcome"])
            .expect("sluice_dispatch_duration_seconds metric creation failed")
    });

/// Register every collector with [`REGISTRY`]. Safe to call repeatedly.
pub fn init_metrics() -> anyhow::Result<()> {
    let registry = &*REGISTRY;

    for metric in [
        Box::new(UNITS_DISCOVERED_TOTAL.clone())
            as Box<dyn prometheus::core::Collector>,
        Box::new(SOURCE_FAILURES_TOTAL.clone()),
        Box::new(DISPATCH_TOTAL.clone()),
        Box::new(DEAD_LETTERED_TOTAL.clone()),
        Box::new(RECORDS_PUSHED_TOTAL.clone()),
        Box::new(QUEUE_DEPTH.clone()),
        Box::new(DISPATCH_DURATION_SECONDS.clone()),
    ] {
        if let Err(e) = registry.register(metric) {
            let msg = e.to_string();
            if !msg.contains("Duplicate metrics collector registration attempted")
            {
                return Err(e.into());
            }
        }
    }

    Ok(())
}

pub fn record_units_discovered(source: &str, strategy: &str, count: u64) {
    UNITS_DISCOVERED_TOTAL
        .with_label_values(&[source, strategy])
        .inc_by(count as f64);
}

pub fn record_source_failed(source: &str) {
    SOURCE_FAILURES_TOTAL.with_label_values(&[source]).inc();
}

pub fn record_dead_lettered(event_type: &str) {
    DEAD_LETTERED_TOTAL.with_label_values(&[event_type]).inc();
}

pub fn record_batch_written(index: &str, trigger: &str, records: u64) {
    RECORDS_PUSHED_TOTAL
        .with_label_values(&[index, trigger])
        .inc_by(records as f64);
}

pub fn set_queue_depth(event_type: &str, depth: f64) {
    QUEUE_DEPTH.with_label_values(&[event_type]).set(depth);
}

pub fn observe_dispatch(event_type: &str, outcome: &str, duration_secs: f64) {
    DISPATCH_TOTAL.with_label_values(&[event_type, outcome]).inc();
    DISPATCH_DURATION_SECONDS
        .with_label_values(&[event_type, outcome])
        .observe(duration_secs);
}

/// Gather all registered metrics in Prometheus text format.
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .map_err(Into::into)
}
