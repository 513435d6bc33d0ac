//! Tracing spans and recording helpers for the pipeline.
//!
//! Span constructors cover the four long-running activities: a scheduling
//! pass, one source's discovery, one envelope dispatch, and one batch
//! write. The `record_*` helpers log with structured fields and, with the
//! `metrics` feature enabled, update the Prometheus collectors.
//!
//! # Example
//!
//! ```ignore
//! use sluice::telemetry::{dispatch_span, record_dispatch_start};
//!
//! let timer = record_dispatch_start(envelope.id.to_string());
//! actor.process(&envelope).instrument(dispatch_span(..)).await;
//! record_dispatch_end(timer, "BlobFileArrived", "completed");
//! ```

use tracing::{Span, info_span};

/// Span for one master scheduler pass.
#[must_use]
pub fn schedule_pass_span(worker_id: impl AsRef<str>) -> Span {
    info_span!("sluice.schedule", worker_id = %worker_id.as_ref())
}

/// Span for discovery on one source.
#[must_use]
pub fn discover_span(source: impl AsRef<str>, strategy: impl AsRef<str>) -> Span {
    info_span!(
        "sluice.discover",
        source = %source.as_ref(),
        strategy = %strategy.as_ref(),
    )
}

/// Span for one envelope handed to its actor.
#[must_use]
pub fn dispatch_span(
    envelope_id: impl AsRef<str>,
    event_type: impl AsRef<str>,
    attempt: u32,
) -> Span {
    info_span!(
        "sluice.dispatch",
        envelope_id = %envelope_id.as_ref(),
        event_type = %event_type.as_ref(),
        attempt = attempt,
    )
}

/// Span for one bulk write to the search backend.
#[must_use]
pub fn push_span(index: impl AsRef<str>, records: usize) -> Span {
    info_span!("sluice.push", index = %index.as_ref(), records = records)
}

pub fn record_units_discovered(
    source: impl AsRef<str>,
    strategy: impl AsRef<str>,
    count: usize,
) {
    if count > 0 {
        tracing::info!(
            source = %source.as_ref(),
            strategy = %strategy.as_ref(),
            count,
            "units discovered"
        );
    } else {
        tracing::debug!(
            source = %source.as_ref(),
            strategy = %strategy.as_ref(),
            "nothing new"
        );
    }

    #[cfg(feature = "metrics")]
    crate::metrics::record_units_discovered(
        source.as_ref(),
        strategy.as_ref(),
        count as u64,
    );
}

/// Per-source failures are non-fatal: the pass moves on to the next source.
pub fn record_source_failed(source: impl AsRef<str>, error: impl AsRef<str>) {
    tracing::warn!(
        source = %source.as_ref(),
        error = %error.as_ref(),
        "source skipped this pass"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_source_failed(source.as_ref());
}

pub fn record_dead_lettered(
    event_type: impl AsRef<str>,
    attempts: u32,
    error: impl AsRef<str>,
) {
    tracing::warn!(
        event_type = %event_type.as_ref(),
        attempts,
        error = %error.as_ref(),
        "envelope dead-lettered"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_dead_lettered(event_type.as_ref());
}

pub fn record_batch_written(
    index: impl AsRef<str>,
    records: usize,
    trigger: impl AsRef<str>,
) {
    tracing::debug!(
        index = %index.as_ref(),
        records,
        trigger = %trigger.as_ref(),
        "batch written"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_batch_written(
        index.as_ref(),
        trigger.as_ref(),
        records as u64,
    );
}

pub fn set_queue_depth(event_type: impl AsRef<str>, depth: usize) {
    tracing::debug!(
        event_type = %event_type.as_ref(),
        depth,
        "queue depth updated"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::set_queue_depth(event_type.as_ref(), depth as f64);
}

/// Start timing a dispatch. Pass the handle to [`record_dispatch_end`].
pub fn record_dispatch_start(envelope_id: impl AsRef<str>) -> DispatchTimer {
    DispatchTimer {
        envelope_id: envelope_id.as_ref().to_string(),
        start: std::time::Instant::now(),
    }
}

pub fn record_dispatch_end(
    timer: DispatchTimer,
    event_type: impl AsRef<str>,
    outcome: impl AsRef<str>,
) {
    let duration_secs = timer.start.elapsed().as_secs_f64();
    tracing::debug!(
        envelope_id = %timer.envelope_id,
        event_type = %event_type.as_ref(),
        outcome = %outcome.as_ref(),
        duration_secs,
        "dispatch finished"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::observe_dispatch(
        event_type.as_ref(),
        outcome.as_ref(),
        duration_secs,
    );
}

/// Opaque handle returned by [`record_dispatch_start`].
#[derive(Debug)]
pub struct DispatchTimer {
    envelope_id: String,
    start: std::time::Instant,
}

impl DispatchTimer {
    #[must_use]
    pub fn envelope_id(&self) -> &str {
        &self.envelope_id
    }

    #[must_use]
    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }
}
