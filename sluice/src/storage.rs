use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::record::ParsedRecord;
use crate::source::SourceConfig;

/// A listed blob.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobRef {
    pub id: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

/// Concrete address of a blob, resolved from a source and a blob id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlobLocation {
    pub connection: String,
    pub container: String,
    pub blob: String,
}

impl BlobLocation {
    pub fn resolve(
        source: &SourceConfig,
        blob_id: &str,
    ) -> Result<Self, PipelineError> {
        if blob_id.trim().is_empty() {
            return Err(PipelineError::configuration(format!(
                "source '{}' produced an empty blob id",
                source.name
            )));
        }
        Ok(Self {
            connection: source.connection_string.clone(),
            container: source.container_name()?.to_string(),
            blob: blob_id.to_string(),
        })
    }

    /// `connection/container/blob`, used as the record source URI.
    pub fn uri(&self) -> String {
        format!(
            "{}/{}/{}",
            self.connection.trim_end_matches('/'),
            self.container,
            self.blob
        )
    }
}

pub type ByteStream = BoxStream<'static, anyhow::Result<Bytes>>;

/// Object storage collaborator.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn list(
        &self,
        connection: &str,
        container: &str,
        prefix: &str,
    ) -> anyhow::Result<Vec<BlobRef>>;

    async fn exists(&self, location: &BlobLocation) -> anyhow::Result<bool>;

    /// Stream the blob's content. Fails if the blob does not exist.
    async fn download(&self, location: &BlobLocation) -> anyhow::Result<ByteStream>;
}

/// Which rows to read from a table partition scheme.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TableQuery {
    /// Every row of one partition key.
    Partition(String),
    /// Rows whose timestamp falls in `[start, end)` epoch seconds.
    TimeRange { start: i64, end: i64 },
}

/// Wide-column/table storage collaborator.
#[async_trait]
pub trait TableStore: Send + Sync {
    async fn query(
        &self,
        connection: &str,
        table: &str,
        query: &TableQuery,
    ) -> anyhow::Result<Vec<ParsedRecord>>;
}

/// Drain `stream` into memory, failing with `Capacity` past `limit` bytes.
pub async fn read_bounded(
    mut stream: ByteStream,
    limit: u64,
    unit: &str,
) -> Result<Bytes, PipelineError> {
    let mut buffer = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|err| {
            PipelineError::transient(format!("download of {unit} failed: {err}"))
        })?;
        if (buffer.len() + chunk.len()) as u64 > limit {
            return Err(PipelineError::Capacity {
                unit: unit.to_string(),
                limit,
            });
        }
        buffer.extend_from_slice(&chunk);
    }
    Ok(buffer.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn chunks(parts: &[&'static str]) -> ByteStream {
        let items: Vec<anyhow::Result<Bytes>> = parts
            .iter()
            .map(|part| Ok(Bytes::from_static(part.as_bytes())))
            .collect();
        stream::iter(items).boxed()
    }

    #[tokio::test]
    async fn test_read_bounded_concatenates_chunks() {
        let bytes = read_bounded(chunks(&["ab", "cd"]), 4, "u").await.unwrap();
        assert_eq!(&bytes[..], b"abcd");
    }

    #[tokio::test]
    async fn test_read_bounded_rejects_oversized_units() {
        let err = read_bounded(chunks(&["abc", "de"]), 4, "big.log")
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Capacity { limit: 4, .. }));
    }

    #[test]
    fn test_location_requires_container() {
        let source = SourceConfig::new("logs-A", "memory://acct/");
        assert!(BlobLocation::resolve(&source, "a.log").is_err());

        let location =
            BlobLocation::resolve(&source.with_container("iis"), "2024/a.log")
                .unwrap();
        assert_eq!(location.uri(), "memory://acct/iis/2024/a.log");
    }
}
