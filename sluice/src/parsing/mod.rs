//! Parsers turn a unit's bytes into a lazy sequence of records.
//!
//! Parsers are selected by the name carried in a source's `parser`
//! property. The registry maps names to constructors; an unknown name is
//! a configuration error.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::PipelineError;
use crate::record::ParsedRecord;

pub mod iis;
pub mod jsonl;

pub use iis::IisParser;
pub use jsonl::JsonLinesParser;

/// Lazy, finite record sequence. Per-line failures are yielded as `Err`
/// without ending the sequence.
pub type RecordIter = Box<dyn Iterator<Item = anyhow::Result<ParsedRecord>> + Send>;

pub trait Parser: Send + Sync {
    fn parse(&self, content: Bytes, source_uri: &str) -> RecordIter;
}

type ParserFactory = Arc<dyn Fn() -> Box<dyn Parser> + Send + Sync>;

/// Name to constructor mapping for parsers.
#[derive(Clone, Default)]
pub struct ParserRegistry {
    factories: HashMap<String, ParserFactory>,
}

impl std::fmt::Debug for ParserRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.factories.keys().collect();
        names.sort();
        f.debug_struct("ParserRegistry").field("parsers", &names).finish()
    }
}

impl ParserRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with `iis` and `jsonl`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(iis::NAME, || IisParser);
        registry.register(jsonl::NAME, || JsonLinesParser);
        registry
    }

    /// Register `factory` under `name`, replacing any previous entry.
    pub fn register<F, P>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> P + Send + Sync + 'static,
        P: Parser + 'static,
    {
        self.factories.insert(
            name.into(),
            Arc::new(move || Box::new(factory()) as Box<dyn Parser>),
        );
    }

    pub fn resolve(&self, name: &str) -> Result<Box<dyn Parser>, PipelineError> {
        self.factories
            .get(name)
            .map(|factory| factory())
            .ok_or_else(|| {
                PipelineError::configuration(format!("unknown parser '{name}'"))
            })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }
}

/// Yields `(line_number, line)` from owned bytes, one line at a time.
///
/// Line numbers start at 1. Trailing `\r` is stripped and invalid UTF-8 is
/// replaced rather than rejected.
#[derive(Debug)]
pub(crate) struct Lines {
    content: Bytes,
    pos: usize,
    line_no: u64,
}

impl Lines {
    pub(crate) fn new(content: Bytes) -> Self {
        Self {
            content,
            pos: 0,
            line_no: 0,
        }
    }
}

impl Iterator for Lines {
    type Item = (u64, String);

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.content.len() {
            return None;
        }
        let rest = &self.content[self.pos..];
        let (line, advance) = match rest.iter().position(|b| *b == b'\n') {
            Some(end) => (&rest[..end], end + 1),
            None => (rest, rest.len()),
        };
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        let text = String::from_utf8_lossy(line).into_owned();

        self.pos += advance;
        self.line_no += 1;
        Some((self.line_no, text))
    }
}

/// Stable document id for a record at `line_no` of `source_uri`.
pub(crate) fn record_id(source_uri: &str, line_no: u64) -> String {
    format!("{source_uri}#{line_no}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lines_handles_crlf_and_missing_final_newline() {
        let lines: Vec<_> =
            Lines::new(Bytes::from_static(b"a\r\nb\n\nc")).collect();
        assert_eq!(
            lines,
            vec![
                (1, "a".to_string()),
                (2, "b".to_string()),
                (3, String::new()),
                (4, "c".to_string()),
            ]
        );
    }

    #[test]
    fn test_registry_resolves_builtins() {
        let registry = ParserRegistry::with_builtins();
        assert!(registry.contains("iis"));
        assert!(registry.resolve("jsonl").is_ok());
    }

    #[test]
    fn test_unknown_parser_is_configuration_error() {
        let registry = ParserRegistry::with_builtins();
        assert!(matches!(
            registry.resolve("csv"),
            Err(PipelineError::Configuration(_))
        ));
    }
}
