use async_trait::async_trait;

use crate::actor::ProcessorActor;
use crate::error::PipelineError;
use crate::events::{Event, EventEnvelope};
use crate::sharding::{DiscoveryDescriptor, UnitRef};
use crate::storage::{BlobLocation, read_bounded};

use super::{ActorDeps, UnitIngest, acquire_unit, settle};

/// Ingests one newly discovered blob.
///
/// The blob is downloaded into memory up to `max_unit_bytes`, parsed with
/// the source's parser and pushed record by record. The pusher is flushed
/// once, and only when at least one record was pushed. A blob that no
/// longer exists is dropped as a stale reference.
#[derive(Debug)]
pub struct FileArrivalActor {
    deps: ActorDeps,
}

impl FileArrivalActor {
    pub fn new(deps: ActorDeps) -> Self {
        Self { deps }
    }

    async fn ingest(
        &self,
        descriptor: &DiscoveryDescriptor,
        blob_id: &str,
        ingest: &mut UnitIngest<'_>,
    ) -> Result<(), PipelineError> {
        let source = &descriptor.source;
        let location = BlobLocation::resolve(source, blob_id)?;
        let uri = location.uri();

        let exists = self.deps.blobs.exists(&location).await.map_err(|err| {
            PipelineError::transient(format!("existence check of {uri} failed: {err:#}"))
        })?;
        if !exists {
            return Err(PipelineError::stale(uri));
        }

        let stream = self.deps.blobs.download(&location).await.map_err(|err| {
            PipelineError::transient(format!("download of {uri} failed: {err:#}"))
        })?;
        let content = read_bounded(stream, self.deps.config.max_unit_bytes, &uri).await?;

        let parser = self.deps.parsers.resolve(source.parser_name()?)?;
        ingest.push_all(parser.parse(content, &uri)).await
    }
}

#[async_trait]
impl ProcessorActor for FileArrivalActor {
    async fn process(&self, envelope: &EventEnvelope) -> Result<Vec<Event>, PipelineError> {
        let descriptor: DiscoveryDescriptor = envelope.body_as()?;
        let UnitRef::Blob { id } = &descriptor.unit else {
            return Err(PipelineError::configuration(format!(
                "{} carries a non-blob unit for {}",
                envelope.event_type, descriptor.lease_name
            )));
        };

        let keeper = acquire_unit(&self.deps, &descriptor.lease_name).await?;
        let result = {
            let mut ingest =
                UnitIngest::new(&keeper, self.deps.pusher.as_ref(), &descriptor.source);
            match self.ingest(&descriptor, id, &mut ingest).await {
                Ok(()) => ingest.finish().await,
                Err(err) => Err(err),
            }
        };
        settle(keeper, &result).await;

        let pushed = result?;
        tracing::info!(
            source = %descriptor.source.name,
            blob = %id,
            records = pushed,
            "blob ingested"
        );
        Ok(Vec::new())
    }
}
