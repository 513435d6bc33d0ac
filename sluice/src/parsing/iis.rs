use anyhow::anyhow;
use bytes::Bytes;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use serde_json::Value;

use super::{Lines, Parser, RecordIter, record_id};
use crate::record::ParsedRecord;

pub const NAME: &str = "iis";

/// W3C extended log format as written by IIS.
///
/// `#Fields:` names the columns of the data lines that follow and may be
/// repeated mid-file. `date` and `time` (UTC) combine into the record
/// timestamp; a missing `date` column falls back to the `#Date:` header.
/// `-` marks an empty value and is omitted.
#[derive(Clone, Copy, Debug, Default)]
pub struct IisParser;

impl Parser for IisParser {
    fn parse(&self, content: Bytes, source_uri: &str) -> RecordIter {
        Box::new(IisRecords {
            lines: Lines::new(content),
            source_uri: source_uri.to_string(),
            fields: Vec::new(),
            header_date: None,
        })
    }
}

struct IisRecords {
    lines: Lines,
    source_uri: String,
    fields: Vec<String>,
    header_date: Option<NaiveDate>,
}

impl IisRecords {
    fn directive(&mut self, line: &str) {
        if let Some(fields) = line.strip_prefix("#Fields:") {
            self.fields = fields.split_whitespace().map(str::to_string).collect();
        } else if let Some(date) = line.strip_prefix("#Date:") {
            self.header_date = date
                .split_whitespace()
                .next()
                .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok());
        }
    }

    fn record(&self, line_no: u64, line: &str) -> anyhow::Result<ParsedRecord> {
        if self.fields.is_empty() {
            return Err(anyhow!(
                "{}:{line_no}: data line before #Fields directive",
                self.source_uri
            ));
        }
        let values: Vec<&str> = line.split_whitespace().collect();
        if values.len() != self.fields.len() {
            return Err(anyhow!(
                "{}:{line_no}: expected {} columns, found {}",
                self.source_uri,
                self.fields.len(),
                values.len()
            ));
        }

        let mut record = ParsedRecord::new(&self.source_uri)
            .with_id(record_id(&self.source_uri, line_no));
        let mut date = self.header_date;
        let mut time = None;

        for (name, raw) in self.fields.iter().zip(values) {
            match name.as_str() {
                "date" => date = NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok(),
                "time" => time = NaiveTime::parse_from_str(raw, "%H:%M:%S").ok(),
                _ => {}
            }
            if raw == "-" {
                continue;
            }
            record.fields.insert(name.clone(), typed(raw));
        }

        if let (Some(date), Some(time)) = (date, time) {
            record.timestamp =
                Some(Utc.from_utc_datetime(&NaiveDateTime::new(date, time)));
        }
        Ok(record)
    }
}

impl Iterator for IisRecords {
    type Item = anyhow::Result<ParsedRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (line_no, line) = self.lines.next()?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if line.starts_with('#') {
                self.directive(line);
                continue;
            }
            return Some(self.record(line_no, line));
        }
    }
}

fn typed(raw: &str) -> Value {
    raw.parse::<i64>()
        .map(Value::from)
        .unwrap_or_else(|_| Value::String(raw.to_string()))
}
