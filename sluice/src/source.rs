use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PipelineError;

/// Well-known keys in [`SourceConfig::properties`].
pub mod keys {
    /// Shard scheduler strategy id (`range-key`, `time-bucket`, ...).
    pub const SCHEDULER: &str = "scheduler";
    /// Parser name resolved through the parser registry.
    pub const PARSER: &str = "parser";
    /// Destination index; defaults to the lowercased source name.
    pub const INDEX: &str = "index";
    /// Blob name prefix listed by the blob scheduler.
    pub const PREFIX: &str = "prefix";
    /// strftime template producing the blob prefix for a time bucket.
    pub const BUCKET_PREFIX_FORMAT: &str = "bucket_prefix_format";
    /// Width of a time bucket or range, in seconds.
    pub const BUCKET_SECS: &str = "bucket_secs";
    /// Delay after a bucket's end before it counts as closed.
    pub const GRACE_SECS: &str = "grace_secs";
    /// Closed buckets the reverse scheduler looks back over.
    pub const LOOKBACK_BUCKETS: &str = "lookback_buckets";
    /// First key (epoch seconds) to schedule when no high-water mark exists.
    pub const START_OFFSET: &str = "start_offset";
    /// Upper bound on units discovered for this source in one pass.
    pub const MAX_UNITS_PER_PASS: &str = "max_units_per_pass";
    /// Partition key granularity used when a range fans out into keys.
    pub const KEY_STEP_SECS: &str = "key_step_secs";
    /// `false` disables the source without removing it.
    pub const ENABLED: &str = "enabled";
}

/// A data origin: connection info, container or table, and free-form
/// properties naming the scheduler strategy and parser.
///
/// Read-only to the pipeline; a scheduling pass works on a snapshot.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    pub connection_string: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, Value>,
}

impl SourceConfig {
    pub fn new(
        name: impl Into<String>,
        connection_string: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            connection_string: connection_string.into(),
            container: None,
            table: None,
            properties: BTreeMap::new(),
        }
    }

    pub fn with_container(mut self, container: impl Into<String>) -> Self {
        self.container = Some(container.into());
        self
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    pub fn with_property(
        mut self,
        key: impl Into<String>,
        value: impl Into<Value>,
    ) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn property_str(&self, key: &str) -> Option<&str> {
        self.properties.get(key).and_then(Value::as_str)
    }

    /// Numeric property, accepting JSON numbers or numeric strings.
    pub fn property_i64(&self, key: &str) -> Result<Option<i64>, PipelineError> {
        match self.properties.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Number(n)) => n.as_i64().map(Some).ok_or_else(|| {
                self.bad_property(key, "an integer")
            }),
            Some(Value::String(s)) => s
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| self.bad_property(key, "an integer")),
            Some(_) => Err(self.bad_property(key, "an integer")),
        }
    }

    /// Positive numeric property with a default.
    pub fn property_positive(
        &self,
        key: &str,
        default: i64,
    ) -> Result<i64, PipelineError> {
        let value = self.property_i64(key)?.unwrap_or(default);
        if value <= 0 {
            return Err(self.bad_property(key, "positive"));
        }
        Ok(value)
    }

    pub fn require_str(&self, key: &str) -> Result<&str, PipelineError> {
        self.property_str(key)
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| {
                PipelineError::configuration(format!(
                    "source '{}' is missing property '{key}'",
                    self.name
                ))
            })
    }

    pub fn scheduler_strategy(&self) -> Result<&str, PipelineError> {
        self.require_str(keys::SCHEDULER)
    }

    pub fn parser_name(&self) -> Result<&str, PipelineError> {
        self.require_str(keys::PARSER)
    }

    pub fn container_name(&self) -> Result<&str, PipelineError> {
        self.container.as_deref().ok_or_else(|| {
            PipelineError::configuration(format!(
                "source '{}' has no container",
                self.name
            ))
        })
    }

    /// Destination index for records from this source.
    pub fn index_name(&self) -> String {
        self.property_str(keys::INDEX)
            .map(str::to_string)
            .unwrap_or_else(|| self.name.to_lowercase())
    }

    pub fn is_enabled(&self) -> bool {
        match self.properties.get(keys::ENABLED) {
            Some(Value::Bool(enabled)) => *enabled,
            Some(Value::String(s)) => !s.eq_ignore_ascii_case("false"),
            _ => true,
        }
    }

    fn bad_property(&self, key: &str, expected: &str) -> PipelineError {
        PipelineError::configuration(format!(
            "source '{}' property '{key}' must be {expected}",
            self.name
        ))
    }
}

/// Read-only enumeration of the sources to schedule.
#[async_trait]
pub trait SourceProvider: Send + Sync {
    async fn active_sources(&self) -> anyhow::Result<Vec<SourceConfig>>;
}

/// Fixed source list, replaceable at runtime.
#[derive(Debug, Default)]
pub struct StaticSourceProvider {
    sources: RwLock<Vec<SourceConfig>>,
}

impl StaticSourceProvider {
    pub fn new(sources: Vec<SourceConfig>) -> Self {
        Self {
            sources: RwLock::new(sources),
        }
    }

    pub fn replace(&self, sources: Vec<SourceConfig>) {
        *self.sources.write() = sources;
    }
}

#[async_trait]
impl SourceProvider for StaticSourceProvider {
    async fn active_sources(&self) -> anyhow::Result<Vec<SourceConfig>> {
        Ok(self
            .sources
            .read()
            .iter()
            .filter(|source| source.is_enabled())
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source() -> SourceConfig {
        SourceConfig::new("Logs-A", "memory://")
            .with_container("iis")
            .with_property(keys::SCHEDULER, "time-bucket")
            .with_property(keys::BUCKET_SECS, 60)
            .with_property(keys::GRACE_SECS, "15")
    }

    #[test]
    fn test_numeric_properties_accept_numbers_and_strings() {
        let source = source();
        assert_eq!(source.property_i64(keys::BUCKET_SECS).unwrap(), Some(60));
        assert_eq!(source.property_i64(keys::GRACE_SECS).unwrap(), Some(15));
        assert_eq!(source.property_i64(keys::LOOKBACK_BUCKETS).unwrap(), None);
    }

    #[test]
    fn test_bad_numeric_property_is_configuration_error() {
        let source = source().with_property(keys::BUCKET_SECS, "minutely");
        assert!(matches!(
            source.property_positive(keys::BUCKET_SECS, 60),
            Err(PipelineError::Configuration(_))
        ));

        let source = self::source().with_property(keys::BUCKET_SECS, 0);
        assert!(source.property_positive(keys::BUCKET_SECS, 60).is_err());
    }

    #[test]
    fn test_missing_parser_is_configuration_error() {
        let err = source().parser_name().unwrap_err();
        assert!(err.to_string().contains("parser"));
    }

    #[test]
    fn test_index_defaults_to_lowercase_name() {
        assert_eq!(source().index_name(), "logs-a");
        assert_eq!(
            source().with_property(keys::INDEX, "iis-2024").index_name(),
            "iis-2024"
        );
    }

    #[tokio::test]
    async fn test_static_provider_skips_disabled_sources() {
        let provider = StaticSourceProvider::new(vec![
            source(),
            SourceConfig::new("off", "memory://")
                .with_property(keys::ENABLED, false),
        ]);
        let active = provider.active_sources().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].name, "Logs-A");
    }
}
