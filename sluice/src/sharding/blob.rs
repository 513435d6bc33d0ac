use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;

use super::{
    Claimer, Discovery, DiscoveryContext, DiscoveryDescriptor, ShardKey,
    ShardScheduler, UnitRef, lease_name, max_units_per_pass, strategies,
};
use crate::checkpoint::CheckpointStore;
use crate::lock::LockStore;
use crate::source::{SourceConfig, keys};
use crate::storage::BlobStore;

/// Enumerates blobs under `container/prefix` that have no discovered mark.
///
/// One lease covers the whole listing, named `"{source}:{container}/{prefix}"`.
/// Each blob becomes a unit whose own lease, `"{source}:{blob_id}"`, is
/// taken by the file-arrival stage. Oldest blobs are emitted first.
pub struct BlobScheduler {
    claimer: Claimer,
    blobs: Arc<dyn BlobStore>,
}

impl BlobScheduler {
    pub fn new(
        lock: Arc<dyn LockStore>,
        checkpoints: Arc<dyn CheckpointStore>,
        blobs: Arc<dyn BlobStore>,
        lease_ttl: Duration,
    ) -> Self {
        Self {
            claimer: Claimer {
                lock,
                checkpoints,
                ttl: lease_ttl,
            },
            blobs,
        }
    }

    async fn list_new(
        &self,
        discovery: &mut Discovery,
        claim: usize,
        source: &SourceConfig,
        container: &str,
        prefix: &str,
        ctx: &DiscoveryContext,
    ) -> anyhow::Result<()> {
        let limit = max_units_per_pass(source)?;
        let mut listed = self
            .blobs
            .list(&source.connection_string, container, prefix)
            .await?;
        listed.sort_by(|a, b| {
            a.last_modified
                .cmp(&b.last_modified)
                .then_with(|| a.id.cmp(&b.id))
        });

        for blob in listed {
            if discovery.len() >= limit {
                break;
            }
            let name = lease_name(&source.name, &blob.id);
            if self.claimer.checkpoints.is_discovered(&name).await? {
                continue;
            }
            discovery.push(
                claim,
                DiscoveryDescriptor::new(
                    source,
                    ShardKey::new(blob.id.clone()),
                    UnitRef::Blob { id: blob.id },
                    ctx.now,
                ),
                None,
            );
        }
        Ok(())
    }
}

#[async_trait]
impl ShardScheduler for BlobScheduler {
    fn strategy(&self) -> &'static str {
        strategies::BLOB
    }

    async fn discover(
        &self,
        source: &SourceConfig,
        ctx: &DiscoveryContext,
    ) -> anyhow::Result<Discovery> {
        let container = source.container_name()?;
        let prefix = source.property_str(keys::PREFIX).unwrap_or_default();
        let mut discovery = self.claimer.discovery(source);

        let claim_name = lease_name(&source.name, format!("{container}/{prefix}"));
        let Some(lease) = self
            .claimer
            .lock
            .try_acquire(&claim_name, &ctx.holder, self.claimer.ttl)
            .await?
        else {
            tracing::debug!(lease = %claim_name, "container listing held elsewhere");
            return Ok(discovery);
        };
        let claim = discovery.claim(lease);

        if let Err(err) = self
            .list_new(&mut discovery, claim, source, container, prefix, ctx)
            .await
        {
            discovery.abandon().await;
            return Err(err);
        }
        if discovery.is_empty() {
            discovery.release_last_claim().await?;
        }
        Ok(discovery)
    }
}
