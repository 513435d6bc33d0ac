use anyhow::anyhow;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde_json::Value;

use super::{Lines, Parser, RecordIter, record_id};
use crate::record::ParsedRecord;

pub const NAME: &str = "jsonl";

const TIMESTAMP_FIELDS: [&str; 2] = ["@timestamp", "timestamp"];

/// One JSON object per line. An RFC 3339 `@timestamp` or `timestamp`
/// field becomes the record timestamp.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonLinesParser;

impl Parser for JsonLinesParser {
    fn parse(&self, content: Bytes, source_uri: &str) -> RecordIter {
        let source_uri = source_uri.to_string();
        Box::new(
            Lines::new(content)
                .filter(|(_, line)| !line.trim().is_empty())
                .map(move |(line_no, line)| parse_line(&source_uri, line_no, &line)),
        )
    }
}

fn parse_line(
    source_uri: &str,
    line_no: u64,
    line: &str,
) -> anyhow::Result<ParsedRecord> {
    let value: Value = serde_json::from_str(line)
        .map_err(|err| anyhow!("{source_uri}:{line_no}: {err}"))?;
    let Value::Object(mut fields) = value else {
        return Err(anyhow!("{source_uri}:{line_no}: expected a JSON object"));
    };

    let timestamp = TIMESTAMP_FIELDS.iter().find_map(|key| {
        fields
            .get(*key)
            .and_then(Value::as_str)
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|ts| ts.with_timezone(&Utc))
    });
    fields.remove("@timestamp");

    let mut record =
        ParsedRecord::new(source_uri).with_id(record_id(source_uri, line_no));
    record.timestamp = timestamp;
    record.fields = fields;
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_objects_become_records() {
        let content = Bytes::from_static(
            b"{\"@timestamp\":\"2024-01-01T00:01:00Z\",\"level\":\"warn\"}\n\n{\"level\":\"info\"}\n",
        );
        let records: Vec<ParsedRecord> = JsonLinesParser
            .parse(content, "memory://app/a.jsonl")
            .map(Result::unwrap)
            .collect();

        assert_eq!(records.len(), 2);
        assert_eq!(
            records[0].timestamp,
            Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 1, 0).unwrap())
        );
        assert_eq!(records[0].fields["level"], "warn");
        assert!(!records[0].fields.contains_key("@timestamp"));
        assert_eq!(records[1].id.as_deref(), Some("memory://app/a.jsonl#3"));
    }

    #[test]
    fn test_non_object_lines_are_errors() {
        let results: Vec<_> = JsonLinesParser
            .parse(Bytes::from_static(b"[1,2]\nnot json\n"), "u")
            .collect();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(Result::is_err));
    }
}
