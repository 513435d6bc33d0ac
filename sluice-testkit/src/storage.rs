use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use futures::stream;
use parking_lot::Mutex;
use sluice::*;

#[derive(Clone, Debug)]
struct StoredBlob {
    content: Bytes,
    last_modified: DateTime<Utc>,
}

/// Blob store keyed by container and blob id. The connection string is
/// ignored.
#[derive(Clone)]
pub struct InMemoryBlobStore {
    containers: Arc<Mutex<HashMap<String, BTreeMap<String, StoredBlob>>>>,
    downloads: Arc<Mutex<Vec<String>>>,
    chunk_size: usize,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self {
            containers: Arc::new(Mutex::new(HashMap::new())),
            downloads: Arc::new(Mutex::new(Vec::new())),
            chunk_size: 4096,
        }
    }

    /// Downloads stream in chunks of `chunk_size` bytes.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn put(
        &self,
        container: &str,
        id: &str,
        content: impl Into<Bytes>,
        last_modified: DateTime<Utc>,
    ) {
        self.containers
            .lock()
            .entry(container.to_string())
            .or_default()
            .insert(
                id.to_string(),
                StoredBlob {
                    content: content.into(),
                    last_modified,
                },
            );
    }

    pub fn remove(&self, container: &str, id: &str) -> bool {
        self.containers
            .lock()
            .get_mut(container)
            .and_then(|blobs| blobs.remove(id))
            .is_some()
    }

    /// Blob ids in download order.
    pub fn downloads(&self) -> Vec<String> {
        self.downloads.lock().clone()
    }

    fn get(&self, location: &BlobLocation) -> Option<StoredBlob> {
        self.containers
            .lock()
            .get(&location.container)
            .and_then(|blobs| blobs.get(&location.blob))
            .cloned()
    }
}

impl Default for InMemoryBlobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn list(
        &self,
        _connection: &str,
        container: &str,
        prefix: &str,
    ) -> anyhow::Result<Vec<BlobRef>> {
        let containers = self.containers.lock();
        let Some(blobs) = containers.get(container) else {
            return Ok(Vec::new());
        };
        Ok(blobs
            .iter()
            .filter(|(id, _)| id.starts_with(prefix))
            .map(|(id, blob)| BlobRef {
                id: id.clone(),
                size: blob.content.len() as u64,
                last_modified: blob.last_modified,
            })
            .collect())
    }

    async fn exists(&self, location: &BlobLocation) -> anyhow::Result<bool> {
        Ok(self.get(location).is_some())
    }

    async fn download(&self, location: &BlobLocation) -> anyhow::Result<ByteStream> {
        let blob = self
            .get(location)
            .ok_or_else(|| anyhow::anyhow!("blob {} not found", location.uri()))?;
        self.downloads.lock().push(location.blob.clone());

        let chunks: Vec<anyhow::Result<Bytes>> = blob
            .content
            .chunks(self.chunk_size)
            .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
            .collect();
        Ok(stream::iter(chunks).boxed())
    }
}

#[derive(Clone, Debug)]
struct TableRow {
    partition: String,
    record: ParsedRecord,
}

/// Table store holding rows per table name.
#[derive(Clone, Default)]
pub struct InMemoryTableStore {
    tables: Arc<Mutex<HashMap<String, Vec<TableRow>>>>,
    queries: Arc<Mutex<Vec<TableQuery>>>,
}

impl InMemoryTableStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, table: &str, partition: impl Into<String>, record: ParsedRecord) {
        self.tables
            .lock()
            .entry(table.to_string())
            .or_default()
            .push(TableRow {
                partition: partition.into(),
                record,
            });
    }

    pub fn queries(&self) -> Vec<TableQuery> {
        self.queries.lock().clone()
    }
}

#[async_trait]
impl TableStore for InMemoryTableStore {
    async fn query(
        &self,
        _connection: &str,
        table: &str,
        query: &TableQuery,
    ) -> anyhow::Result<Vec<ParsedRecord>> {
        self.queries.lock().push(query.clone());
        let tables = self.tables.lock();
        let Some(rows) = tables.get(table) else {
            return Ok(Vec::new());
        };
        Ok(rows
            .iter()
            .filter(|row| match query {
                TableQuery::Partition(key) => &row.partition == key,
                TableQuery::TimeRange { start, end } => row
                    .record
                    .timestamp
                    .map(|ts| *start <= ts.timestamp() && ts.timestamp() < *end)
                    .unwrap_or(false),
            })
            .map(|row| row.record.clone())
            .collect())
    }
}
