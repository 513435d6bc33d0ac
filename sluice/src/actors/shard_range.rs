use async_trait::async_trait;
use chrono::Utc;

use crate::actor::ProcessorActor;
use crate::error::PipelineError;
use crate::events::{Event, EventEnvelope};
use crate::sharding::{DiscoveryDescriptor, ShardKey, UnitRef};
use crate::source::keys;

const DEFAULT_KEY_STEP_SECS: i64 = 60;

/// Splits a key range into one `ShardKeyArrived` event per partition key.
///
/// Partition keys are epoch seconds aligned to the source's
/// `key_step_secs`. A range owns the keys whose step window ends inside
/// it, so contiguous ranges hand out each key exactly once and only after
/// its window has closed. The fan-out takes no lease: the range was
/// claimed at discovery and each key is leased by the stage that reads it.
#[derive(Debug, Default)]
pub struct ShardRangeActor;

impl ShardRangeActor {
    pub fn new() -> Self {
        Self
    }

    /// Keys `k`, multiples of `step`, with `start < k + step <= end`.
    pub fn partition_keys(start: i64, end: i64, step: i64) -> Vec<String> {
        let mut keys = Vec::new();
        let mut key = start.div_euclid(step) * step;
        while let Some(closes) = key.checked_add(step) {
            if closes > end {
                break;
            }
            keys.push(key.to_string());
            key = closes;
        }
        keys
    }
}

#[async_trait]
impl ProcessorActor for ShardRangeActor {
    async fn process(&self, envelope: &EventEnvelope) -> Result<Vec<Event>, PipelineError> {
        let descriptor: DiscoveryDescriptor = envelope.body_as()?;
        let UnitRef::KeyRange { start, end } = descriptor.unit else {
            return Err(PipelineError::configuration(format!(
                "{} carries a non-range unit for {}",
                envelope.event_type, descriptor.lease_name
            )));
        };
        let step = descriptor
            .source
            .property_positive(keys::KEY_STEP_SECS, DEFAULT_KEY_STEP_SECS)?;

        let now = Utc::now();
        let events = Self::partition_keys(start, end, step)
            .into_iter()
            .map(|key| {
                DiscoveryDescriptor::new(
                    &descriptor.source,
                    ShardKey::new(key.clone()),
                    UnitRef::PartitionKey { key },
                    now,
                )
                .to_event()
            })
            .collect::<Result<Vec<_>, _>>()?;

        tracing::debug!(
            source = %descriptor.source.name,
            range = %descriptor.shard_key,
            keys = events.len(),
            "key range fanned out"
        );
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventType;
    use crate::source::SourceConfig;

    fn range_envelope(source: SourceConfig, start: i64, end: i64) -> EventEnvelope {
        let descriptor = DiscoveryDescriptor::new(
            &source,
            ShardKey::new(format!("{start}-{end}")),
            UnitRef::KeyRange { start, end },
            Utc::now(),
        );
        EventEnvelope::new(descriptor.to_event().unwrap(), None)
    }

    #[test]
    fn test_open_step_window_is_left_to_the_next_range() {
        assert_eq!(ShardRangeActor::partition_keys(0, 150, 60), vec!["0", "60"]);
        assert_eq!(ShardRangeActor::partition_keys(150, 300, 60), vec!["120", "180", "240"]);
        assert!(ShardRangeActor::partition_keys(60, 60, 60).is_empty());
    }

    #[test]
    fn test_keys_align_to_the_step() {
        assert_eq!(
            ShardRangeActor::partition_keys(7300, 10_900, 1800),
            vec!["7200", "9000"]
        );
        assert_eq!(ShardRangeActor::partition_keys(-90, 0, 60), vec!["-120", "-60"]);
    }

    #[tokio::test]
    async fn test_range_fans_out_partition_keys() {
        let source = SourceConfig::new("orders", "memory://tables")
            .with_table("orders")
            .with_property(keys::KEY_STEP_SECS, 1800);
        let events = ShardRangeActor::new()
            .process(&range_envelope(source, 3600, 7200))
            .await
            .unwrap();

        assert_eq!(events.len(), 2);
        let leases: Vec<String> = events
            .iter()
            .map(|event| {
                assert_eq!(event.event_type, EventType::shard_key_arrived());
                event.body_as::<DiscoveryDescriptor>().unwrap().lease_name
            })
            .collect();
        assert_eq!(leases, vec!["orders:3600", "orders:5400"]);
    }

    #[tokio::test]
    async fn test_non_range_unit_is_a_configuration_error() {
        let source = SourceConfig::new("orders", "memory://tables");
        let descriptor = DiscoveryDescriptor::new(
            &source,
            ShardKey::new("a.log"),
            UnitRef::Blob { id: "a.log".into() },
            Utc::now(),
        );
        let envelope = EventEnvelope::new(descriptor.to_event().unwrap(), None);

        let err = ShardRangeActor::new().process(&envelope).await.unwrap_err();
        assert!(matches!(err, PipelineError::Configuration(_)));
    }
}
