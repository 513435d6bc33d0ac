use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::Instrument;

use crate::config::BatchConfig;
use crate::error::PipelineError;
use crate::record::ParsedRecord;
use crate::source::SourceConfig;
use crate::telemetry;

/// One document ready for a bulk write.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IndexDocument {
    /// Backend document id; `None` lets the backend assign one.
    pub id: Option<String>,
    pub body: Value,
}

impl From<&ParsedRecord> for IndexDocument {
    fn from(record: &ParsedRecord) -> Self {
        Self {
            id: record.id.clone(),
            body: record.to_document(),
        }
    }
}

/// Search/index backend collaborator.
#[async_trait]
pub trait SearchClient: Send + Sync {
    /// Write `docs` to `index`. Any rejected document fails the call.
    async fn bulk_write(
        &self,
        index: &str,
        docs: &[IndexDocument],
    ) -> anyhow::Result<()>;
}

/// Buffers parsed records in front of the search backend.
#[async_trait]
pub trait BatchPusher: Send + Sync {
    /// Buffer `record` for the index derived from `source`. May write a
    /// batch when a threshold is reached.
    async fn push(
        &self,
        record: ParsedRecord,
        source: &SourceConfig,
    ) -> Result<(), PipelineError>;

    /// Write everything buffered and wait for the backend to accept it.
    async fn flush(&self) -> Result<(), PipelineError>;
}

/// Hands out the pusher one unit of work writes through.
///
/// Stages ask for a fresh pusher per invocation. Records a failed unit
/// left buffered are dropped with its pusher and never reach another
/// unit's flush.
pub trait PusherFactory: Send + Sync {
    fn create(&self) -> Box<dyn BatchPusher>;
}

/// Builds one [`SearchBatchPusher`] per unit over a shared client.
#[derive(Clone)]
pub struct SearchPusherFactory {
    client: Arc<dyn SearchClient>,
    config: BatchConfig,
}

impl std::fmt::Debug for SearchPusherFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchPusherFactory")
            .field("config", &self.config)
            .finish()
    }
}

impl SearchPusherFactory {
    pub fn new(client: Arc<dyn SearchClient>, config: BatchConfig) -> Self {
        Self { client, config }
    }
}

impl PusherFactory for SearchPusherFactory {
    fn create(&self) -> Box<dyn BatchPusher> {
        Box::new(SearchBatchPusher::new(
            Arc::clone(&self.client),
            self.config.clone(),
        ))
    }
}

/// Flush counters for a [`SearchBatchPusher`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PushStats {
    /// Batches written because a buffer hit a threshold.
    pub automatic_flushes: u64,
    /// Calls to [`BatchPusher::flush`].
    pub explicit_flushes: u64,
    pub batches_written: u64,
    pub records_written: u64,
}

#[derive(Debug, Default)]
struct IndexBuffer {
    docs: Vec<IndexDocument>,
    bytes: usize,
}

impl IndexBuffer {
    fn take(&mut self) -> Vec<IndexDocument> {
        self.bytes = 0;
        std::mem::take(&mut self.docs)
    }

    /// Put an unwritten batch back ahead of anything pushed since.
    fn restore(&mut self, mut batch: Vec<IndexDocument>, bytes: usize) {
        batch.append(&mut self.docs);
        self.docs = batch;
        self.bytes += bytes;
    }
}

/// [`BatchPusher`] over a [`SearchClient`] with one buffer per index.
///
/// Buffers are drained under the lock and written after it is released.
/// A batch that still fails after `max_write_attempts` is put back into
/// its buffer, so a later flush retries it.
pub struct SearchBatchPusher {
    client: Arc<dyn SearchClient>,
    config: BatchConfig,
    buffers: Mutex<HashMap<String, IndexBuffer>>,
    stats: Mutex<PushStats>,
}

impl std::fmt::Debug for SearchBatchPusher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchBatchPusher")
            .field("config", &self.config)
            .field("pending", &self.pending())
            .field("stats", &self.stats())
            .finish()
    }
}

impl SearchBatchPusher {
    pub fn new(client: Arc<dyn SearchClient>, config: BatchConfig) -> Self {
        Self {
            client,
            config,
            buffers: Mutex::new(HashMap::new()),
            stats: Mutex::new(PushStats::default()),
        }
    }

    pub fn stats(&self) -> PushStats {
        *self.stats.lock()
    }

    /// Automatic plus explicit flushes so far.
    pub fn flush_count(&self) -> u64 {
        let stats = self.stats();
        stats.automatic_flushes + stats.explicit_flushes
    }

    /// Buffered documents across all indexes.
    pub fn pending(&self) -> usize {
        self.buffers.lock().values().map(|b| b.docs.len()).sum()
    }

    async fn write_batch(
        &self,
        index: &str,
        batch: Vec<IndexDocument>,
        bytes: usize,
        trigger: &'static str,
    ) -> Result<(), PipelineError> {
        let max_attempts = self.config.max_write_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = self
                .client
                .bulk_write(index, &batch)
                .instrument(telemetry::push_span(index, batch.len()))
                .await;

            match result {
                Ok(()) => {
                    telemetry::record_batch_written(index, batch.len(), trigger);
                    let mut stats = self.stats.lock();
                    stats.batches_written += 1;
                    stats.records_written += batch.len() as u64;
                    return Ok(());
                }
                Err(err) if attempt >= max_attempts => {
                    tracing::error!(
                        index,
                        attempt,
                        records = batch.len(),
                        error = %err,
                        "bulk write failed, keeping batch buffered"
                    );
                    self.buffers
                        .lock()
                        .entry(index.to_string())
                        .or_default()
                        .restore(batch, bytes);
                    return Err(PipelineError::WriteFailure {
                        index: index.to_string(),
                        attempts: attempt,
                        reason: err.to_string(),
                    });
                }
                Err(err) => {
                    let delay = self.config.retry_delay(attempt);
                    tracing::warn!(
                        index,
                        attempt,
                        error = %err,
                        delay_ms = delay.as_millis() as u64,
                        "bulk write failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[async_trait]
impl BatchPusher for SearchBatchPusher {
    async fn push(
        &self,
        record: ParsedRecord,
        source: &SourceConfig,
    ) -> Result<(), PipelineError> {
        let index = source.index_name();
        let doc = IndexDocument::from(&record);
        let size = serde_json::to_vec(&doc.body)?.len();

        let full = {
            let mut buffers = self.buffers.lock();
            let buffer = buffers.entry(index.clone()).or_default();
            buffer.docs.push(doc);
            buffer.bytes += size;
            if buffer.docs.len() >= self.config.max_records.max(1)
                || buffer.bytes >= self.config.max_bytes
            {
                let bytes = buffer.bytes;
                Some((buffer.take(), bytes))
            } else {
                None
            }
        };

        if let Some((batch, bytes)) = full {
            self.stats.lock().automatic_flushes += 1;
            self.write_batch(&index, batch, bytes, "threshold").await?;
        }
        Ok(())
    }

    async fn flush(&self) -> Result<(), PipelineError> {
        let drained: Vec<(String, Vec<IndexDocument>, usize)> = {
            let mut buffers = self.buffers.lock();
            buffers
                .iter_mut()
                .filter(|(_, buffer)| !buffer.docs.is_empty())
                .map(|(index, buffer)| {
                    let bytes = buffer.bytes;
                    (index.clone(), buffer.take(), bytes)
                })
                .collect()
        };
        self.stats.lock().explicit_flushes += 1;

        let mut first_error = None;
        for (index, batch, bytes) in drained {
            if let Err(err) = self.write_batch(&index, batch, bytes, "flush").await {
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingClient {
        batches: Mutex<Vec<(String, usize)>>,
        failures_left: AtomicUsize,
    }

    #[async_trait]
    impl SearchClient for CountingClient {
        async fn bulk_write(
            &self,
            index: &str,
            docs: &[IndexDocument],
        ) -> anyhow::Result<()> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                anyhow::bail!("503 service unavailable");
            }
            self.batches.lock().push((index.to_string(), docs.len()));
            Ok(())
        }
    }

    fn source() -> SourceConfig {
        SourceConfig::new("Logs-A", "memory://")
    }

    fn record(n: u64) -> ParsedRecord {
        ParsedRecord::new("memory://iis/a.log")
            .with_id(format!("memory://iis/a.log#{n}"))
            .with_field("n", n)
    }

    fn fast_retries() -> BatchConfig {
        BatchConfig::default().with_retry_delays_ms(1, 2)
    }

    #[tokio::test]
    async fn test_threshold_flushes_then_explicit_remainder() {
        let client = Arc::new(CountingClient::default());
        let pusher =
            SearchBatchPusher::new(client.clone(), fast_retries().with_max_records(3));

        for n in 0..7 {
            pusher.push(record(n), &source()).await.unwrap();
        }
        assert_eq!(pusher.stats().automatic_flushes, 2);
        assert_eq!(pusher.pending(), 1);

        pusher.flush().await.unwrap();
        let stats = pusher.stats();
        assert_eq!(stats.explicit_flushes, 1);
        assert_eq!(stats.records_written, 7);
        assert_eq!(pusher.flush_count(), 3);

        let sizes: Vec<usize> = client.batches.lock().iter().map(|(_, n)| *n).collect();
        assert_eq!(sizes, vec![3, 3, 1]);
        assert_eq!(client.batches.lock()[0].0, "logs-a");
    }

    #[tokio::test]
    async fn test_byte_threshold_triggers_write() {
        let client = Arc::new(CountingClient::default());
        let pusher =
            SearchBatchPusher::new(client.clone(), fast_retries().with_max_bytes(1));

        pusher.push(record(1), &source()).await.unwrap();
        assert_eq!(pusher.stats().automatic_flushes, 1);
        assert_eq!(pusher.pending(), 0);
    }

    #[tokio::test]
    async fn test_transient_write_errors_are_retried() {
        let client = Arc::new(CountingClient::default());
        client.failures_left.store(2, Ordering::SeqCst);
        let pusher = SearchBatchPusher::new(client.clone(), fast_retries());

        pusher.push(record(1), &source()).await.unwrap();
        pusher.flush().await.unwrap();
        assert_eq!(client.batches.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_surface_write_failure() {
        let client = Arc::new(CountingClient::default());
        client.failures_left.store(usize::MAX, Ordering::SeqCst);
        let pusher = SearchBatchPusher::new(client, fast_retries());

        pusher.push(record(1), &source()).await.unwrap();
        let err = pusher.flush().await.unwrap_err();
        assert!(matches!(err, PipelineError::WriteFailure { attempts: 3, .. }));
        assert_eq!(pusher.pending(), 1);
    }

    #[tokio::test]
    async fn test_factory_pushers_do_not_share_buffers() {
        let client = Arc::new(CountingClient::default());
        let factory = SearchPusherFactory::new(client.clone(), fast_retries());

        let abandoned = factory.create();
        abandoned.push(record(1), &source()).await.unwrap();
        drop(abandoned);

        let unit = factory.create();
        unit.push(record(2), &source()).await.unwrap();
        unit.flush().await.unwrap();

        assert_eq!(*client.batches.lock(), vec![("logs-a".to_string(), 1)]);
    }

    #[tokio::test]
    async fn test_flush_with_nothing_buffered_writes_nothing() {
        let client = Arc::new(CountingClient::default());
        let pusher = SearchBatchPusher::new(client.clone(), fast_retries());
        pusher.flush().await.unwrap();
        assert!(client.batches.lock().is_empty());
    }
}
