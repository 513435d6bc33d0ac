use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::PipelineError;

/// Process-level controls for the scheduling and dispatch loops.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Identity used as the lease holder for this process.
    pub worker_id: String,
    /// Master scheduler cadence in seconds.
    pub cadence_secs: u64,
    /// Lease time-to-live in seconds.
    pub lease_ttl_secs: u64,
    /// Fraction of the TTL after which a held lease is renewed.
    pub renew_at_fraction: f32,
    /// Minimum margin before expiry for renewal attempts.
    pub renew_min_margin_secs: u64,
    /// Upper bound on a unit buffered in memory.
    pub max_unit_bytes: u64,
    /// Parallelism used when an actor descriptor does not specify one.
    pub default_parallelism: usize,
    /// Hard cap on workers per event type.
    pub max_parallelism: usize,
    /// Sleep between polls of an empty queue, in milliseconds.
    pub idle_backoff_ms: u64,
    /// How long shutdown waits for in-flight units.
    pub shutdown_grace_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            worker_id: default_worker_id(),
            cadence_secs: 30,
            lease_ttl_secs: 60,
            renew_at_fraction: 0.5,
            renew_min_margin_secs: 2,
            max_unit_bytes: 64 * 1024 * 1024,
            default_parallelism: 4,
            max_parallelism: 32,
            idle_backoff_ms: 250,
            shutdown_grace_secs: 30,
        }
    }
}

impl PipelineConfig {
    /// Defaults overlaid with `SLUICE_*` environment variables.
    pub fn from_env() -> Result<Self, PipelineError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with whatever `lookup` returns for each
    /// `SLUICE_*` key.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, PipelineError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(worker_id) = lookup("SLUICE_WORKER_ID") {
            config.worker_id = worker_id;
        }
        overlay(&lookup, "SLUICE_CADENCE_SECS", &mut config.cadence_secs)?;
        overlay(&lookup, "SLUICE_LEASE_TTL_SECS", &mut config.lease_ttl_secs)?;
        overlay(
            &lookup,
            "SLUICE_RENEW_AT_FRACTION",
            &mut config.renew_at_fraction,
        )?;
        overlay(
            &lookup,
            "SLUICE_RENEW_MIN_MARGIN_SECS",
            &mut config.renew_min_margin_secs,
        )?;
        overlay(&lookup, "SLUICE_MAX_UNIT_BYTES", &mut config.max_unit_bytes)?;
        overlay(
            &lookup,
            "SLUICE_DEFAULT_PARALLELISM",
            &mut config.default_parallelism,
        )?;
        overlay(
            &lookup,
            "SLUICE_MAX_PARALLELISM",
            &mut config.max_parallelism,
        )?;
        overlay(&lookup, "SLUICE_IDLE_BACKOFF_MS", &mut config.idle_backoff_ms)?;
        overlay(
            &lookup,
            "SLUICE_SHUTDOWN_GRACE_SECS",
            &mut config.shutdown_grace_secs,
        )?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the lease and dispatch loops cannot honour.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.worker_id.trim().is_empty() {
            return Err(PipelineError::configuration("worker_id is empty"));
        }
        if self.lease_ttl_secs == 0 {
            return Err(PipelineError::configuration(
                "lease_ttl_secs must be positive",
            ));
        }
        if !(self.renew_at_fraction > 0.0 && self.renew_at_fraction < 1.0) {
            return Err(PipelineError::configuration(format!(
                "renew_at_fraction must be in (0, 1), got {}",
                self.renew_at_fraction
            )));
        }
        if self.max_parallelism == 0 {
            return Err(PipelineError::configuration(
                "max_parallelism must be positive",
            ));
        }
        Ok(())
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn with_cadence_secs(mut self, secs: u64) -> Self {
        self.cadence_secs = secs;
        self
    }

    pub fn with_lease_ttl_secs(mut self, secs: u64) -> Self {
        self.lease_ttl_secs = secs;
        self
    }

    pub fn with_max_unit_bytes(mut self, bytes: u64) -> Self {
        self.max_unit_bytes = bytes;
        self
    }

    pub fn with_idle_backoff_ms(mut self, ms: u64) -> Self {
        self.idle_backoff_ms = ms;
        self
    }

    pub fn with_max_parallelism(mut self, workers: usize) -> Self {
        self.max_parallelism = workers;
        self
    }

    pub fn cadence(&self) -> Duration {
        Duration::from_secs(self.cadence_secs)
    }

    pub fn lease_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lease_ttl_secs as i64)
    }

    pub fn idle_backoff(&self) -> Duration {
        Duration::from_millis(self.idle_backoff_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn renewal(&self) -> RenewalPolicy {
        RenewalPolicy {
            renew_at_fraction: self.renew_at_fraction,
            min_margin: Duration::from_secs(self.renew_min_margin_secs),
        }
    }

    /// Clamp a descriptor's requested parallelism to `[1, max_parallelism]`.
    pub fn effective_parallelism(&self, requested: usize) -> usize {
        let requested = if requested == 0 {
            self.default_parallelism
        } else {
            requested
        };
        requested.clamp(1, self.max_parallelism.max(1))
    }
}

/// When a lease keeper renews relative to the lease expiry.
#[derive(Clone, Copy, Debug)]
pub struct RenewalPolicy {
    pub renew_at_fraction: f32,
    pub min_margin: Duration,
}

impl Default for RenewalPolicy {
    fn default() -> Self {
        PipelineConfig::default().renewal()
    }
}

/// Configuration for queue visibility, redelivery and dead-lettering.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// How long a received envelope stays invisible to other receivers.
    pub visibility_timeout_ms: u64,
    /// Deliveries allowed before an envelope is dead-lettered.
    pub max_delivery_attempts: u32,
    /// Base delay for exponential redelivery backoff.
    pub base_delay_ms: u64,
    /// Maximum redelivery backoff.
    pub max_backoff_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            visibility_timeout_ms: 120_000,
            max_delivery_attempts: 5,
            base_delay_ms: 1000,
            max_backoff_ms: 300_000, // 5 minutes
        }
    }
}

impl QueueConfig {
    pub fn with_visibility_timeout_ms(mut self, ms: u64) -> Self {
        self.visibility_timeout_ms = ms;
        self
    }

    pub fn with_max_delivery_attempts(mut self, attempts: u32) -> Self {
        self.max_delivery_attempts = attempts;
        self
    }

    pub fn with_base_delay_ms(mut self, ms: u64) -> Self {
        self.base_delay_ms = ms;
        self
    }

    pub fn visibility_timeout(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.visibility_timeout_ms as i64)
    }
}

/// Thresholds and retry policy for the batch pusher.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Records buffered per index before an automatic flush.
    pub max_records: usize,
    /// Serialized bytes buffered per index before an automatic flush.
    pub max_bytes: usize,
    /// Write attempts per batch before surfacing a write failure.
    pub max_write_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_records: 500,
            max_bytes: 5 * 1024 * 1024,
            max_write_attempts: 3,
            retry_base_delay_ms: 200,
            retry_max_delay_ms: 5000,
        }
    }
}

impl BatchConfig {
    pub fn with_max_records(mut self, records: usize) -> Self {
        self.max_records = records;
        self
    }

    pub fn with_max_bytes(mut self, bytes: usize) -> Self {
        self.max_bytes = bytes;
        self
    }

    pub fn with_max_write_attempts(mut self, attempts: u32) -> Self {
        self.max_write_attempts = attempts;
        self
    }

    pub fn with_retry_delays_ms(mut self, base: u64, max: u64) -> Self {
        self.retry_base_delay_ms = base;
        self.retry_max_delay_ms = max;
        self
    }

    /// Exponential backoff before write attempt `attempt + 1`.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let scaled = self.retry_base_delay_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(scaled.min(self.retry_max_delay_ms))
    }
}

fn default_worker_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("worker-{}-{}", std::process::id(), &suffix[..8])
}

fn overlay<F, T>(
    lookup: &F,
    key: &str,
    target: &mut T,
) -> Result<(), PipelineError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    if let Some(raw) = lookup(key) {
        *target = raw.trim().parse().map_err(|_| {
            PipelineError::configuration(format!(
                "{key} has unparsable value '{raw}'"
            ))
        })?;
    }
    Ok(())
}
