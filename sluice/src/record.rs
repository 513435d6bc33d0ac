use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One structured entity parsed out of a unit.
///
/// `id` is derived from the unit and the record's position in it, so
/// re-processing the same unit overwrites rather than duplicates documents.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParsedRecord {
    pub id: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub source_uri: String,
    pub fields: Map<String, Value>,
}

impl ParsedRecord {
    pub fn new(source_uri: impl Into<String>) -> Self {
        Self {
            id: None,
            timestamp: None,
            source_uri: source_uri.into(),
            fields: Map::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_field(
        mut self,
        name: impl Into<String>,
        value: impl Into<Value>,
    ) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// The document body sent to the search backend.
    pub fn to_document(&self) -> Value {
        let mut doc = self.fields.clone();
        if let Some(timestamp) = self.timestamp {
            doc.insert("@timestamp".into(), Value::String(timestamp.to_rfc3339()));
        }
        doc.insert("source_uri".into(), Value::String(self.source_uri.clone()));
        Value::Object(doc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_document_carries_timestamp_and_origin() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 1, 30).unwrap();
        let record = ParsedRecord::new("memory://iis/a.log")
            .with_id("memory://iis/a.log#5")
            .with_timestamp(ts)
            .with_field("sc-status", 200);

        let doc = record.to_document();
        assert_eq!(doc["sc-status"], 200);
        assert_eq!(doc["@timestamp"], "2024-01-01T00:01:30+00:00");
        assert_eq!(doc["source_uri"], "memory://iis/a.log");
    }
}
