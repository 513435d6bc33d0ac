use std::fmt::Write as _;

use async_trait::async_trait;

use crate::actor::ProcessorActor;
use crate::error::PipelineError;
use crate::events::{Event, EventEnvelope};
use crate::parsing::Parser;
use crate::sharding::{DiscoveryDescriptor, TimeBucket, UnitRef};
use crate::source::{SourceConfig, keys};
use crate::storage::{BlobLocation, BlobRef, TableQuery, read_bounded};

use super::{ActorDeps, UnitIngest, acquire_unit, settle};

/// Reads one partition key or one closed time bucket.
///
/// Table sources are queried directly. Container sources read every blob
/// belonging to the bucket: blobs under the bucket's formatted prefix
/// when `bucket_prefix_format` is set, otherwise blobs under `prefix`
/// whose modification time falls inside the bucket. Blobs that vanished
/// or exceed the size bound are skipped so one bad object does not stall
/// the bucket.
#[derive(Debug)]
pub struct ShardKeyActor {
    deps: ActorDeps,
}

impl ShardKeyActor {
    pub fn new(deps: ActorDeps) -> Self {
        Self { deps }
    }

    async fn read_table(
        &self,
        source: &SourceConfig,
        table: &str,
        query: TableQuery,
        ingest: &mut UnitIngest<'_>,
    ) -> Result<(), PipelineError> {
        let rows = self
            .deps
            .tables
            .query(&source.connection_string, table, &query)
            .await
            .map_err(|err| {
                PipelineError::transient(format!("query of {table} {query:?} failed: {err:#}"))
            })?;
        ingest.push_all(rows.into_iter().map(Ok)).await
    }

    async fn read_bucket(
        &self,
        source: &SourceConfig,
        bucket: TimeBucket,
        ingest: &mut UnitIngest<'_>,
    ) -> Result<(), PipelineError> {
        if let Some(table) = &source.table {
            let query = TableQuery::TimeRange {
                start: bucket.start,
                end: bucket.end,
            };
            return self.read_table(source, table, query, ingest).await;
        }

        let container = source.container_name()?;
        let parser = self.deps.parsers.resolve(source.parser_name()?)?;
        for blob in self.bucket_blobs(source, container, bucket).await? {
            self.read_blob(source, &blob, parser.as_ref(), ingest).await?;
        }
        Ok(())
    }

    async fn bucket_blobs(
        &self,
        source: &SourceConfig,
        container: &str,
        bucket: TimeBucket,
    ) -> Result<Vec<BlobRef>, PipelineError> {
        let (prefix, by_modification) = match source.property_str(keys::BUCKET_PREFIX_FORMAT) {
            Some(format) => (bucket_prefix(source, bucket, format)?, false),
            None => (
                source.property_str(keys::PREFIX).unwrap_or_default().to_string(),
                true,
            ),
        };

        let mut blobs = self
            .deps
            .blobs
            .list(&source.connection_string, container, &prefix)
            .await
            .map_err(|err| {
                PipelineError::transient(format!(
                    "listing of {container}/{prefix} failed: {err:#}"
                ))
            })?;
        if by_modification {
            blobs.retain(|blob| {
                let modified = blob.last_modified.timestamp();
                bucket.start <= modified && modified < bucket.end
            });
        }
        blobs.sort_by(|a, b| (a.last_modified, &a.id).cmp(&(b.last_modified, &b.id)));
        Ok(blobs)
    }

    async fn read_blob(
        &self,
        source: &SourceConfig,
        blob: &BlobRef,
        parser: &dyn Parser,
        ingest: &mut UnitIngest<'_>,
    ) -> Result<(), PipelineError> {
        let location = BlobLocation::resolve(source, &blob.id)?;
        let uri = location.uri();

        let exists = self.deps.blobs.exists(&location).await.map_err(|err| {
            PipelineError::transient(format!("existence check of {uri} failed: {err:#}"))
        })?;
        if !exists {
            tracing::warn!(blob = %uri, "blob vanished before it was read, skipping");
            return Ok(());
        }

        let stream = self.deps.blobs.download(&location).await.map_err(|err| {
            PipelineError::transient(format!("download of {uri} failed: {err:#}"))
        })?;
        let content = match read_bounded(stream, self.deps.config.max_unit_bytes, &uri).await {
            Ok(content) => content,
            Err(err @ PipelineError::Capacity { .. }) => {
                tracing::warn!(blob = %uri, error = %err, "skipping oversized blob");
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        ingest.push_all(parser.parse(content, &uri)).await
    }
}

/// Format the bucket start with a strftime pattern.
fn bucket_prefix(
    source: &SourceConfig,
    bucket: TimeBucket,
    format: &str,
) -> Result<String, PipelineError> {
    let start = bucket.start_time().ok_or_else(|| {
        PipelineError::configuration(format!("bucket {bucket} is out of range"))
    })?;
    let mut prefix = String::new();
    write!(prefix, "{}", start.format(format)).map_err(|_| {
        PipelineError::configuration(format!(
            "source '{}' has an invalid {} '{format}'",
            source.name,
            keys::BUCKET_PREFIX_FORMAT
        ))
    })?;
    Ok(prefix)
}

#[async_trait]
impl ProcessorActor for ShardKeyActor {
    async fn process(&self, envelope: &EventEnvelope) -> Result<Vec<Event>, PipelineError> {
        let descriptor: DiscoveryDescriptor = envelope.body_as()?;
        let source = &descriptor.source;

        let keeper = acquire_unit(&self.deps, &descriptor.lease_name).await?;
        let result = {
            let mut ingest = UnitIngest::new(&keeper, self.deps.pusher.as_ref(), source);
            let read = match &descriptor.unit {
                UnitRef::TimeBucket { start, end } => {
                    self.read_bucket(source, TimeBucket::new(*start, *end), &mut ingest)
                        .await
                }
                UnitRef::PartitionKey { key } => match &source.table {
                    Some(table) => {
                        let query = TableQuery::Partition(key.clone());
                        self.read_table(source, table, query, &mut ingest).await
                    }
                    None => Err(PipelineError::configuration(format!(
                        "source '{}' has no table for partition {key}",
                        source.name
                    ))),
                },
                other => Err(PipelineError::configuration(format!(
                    "{} cannot read a {other:?} unit",
                    envelope.event_type
                ))),
            };
            match read {
                Ok(()) => ingest.finish().await,
                Err(err) => Err(err),
            }
        };
        settle(keeper, &result).await;

        let pushed = result?;
        tracing::info!(
            source = %source.name,
            shard = %descriptor.shard_key,
            records = pushed,
            "shard ingested"
        );
        Ok(Vec::new())
    }
}
