use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::master::MasterScheduler;

use super::orchestrator::{Orchestrator, ShutdownToken};

/// One worker process: the master scheduler cadence loop plus the
/// orchestrator's dispatch pools, stopped together by one token.
pub struct PipelineWorker {
    master: Arc<MasterScheduler>,
    orchestrator: Arc<Orchestrator>,
    master_handle: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for PipelineWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineWorker")
            .field("master", &self.master)
            .field("orchestrator", &self.orchestrator)
            .field("master_running", &self.master_handle.lock().is_some())
            .finish()
    }
}

impl PipelineWorker {
    /// The master loop observes the orchestrator's shutdown token.
    pub fn new(master: MasterScheduler, orchestrator: Orchestrator) -> Self {
        Self {
            master: Arc::new(master),
            orchestrator: Arc::new(orchestrator),
            master_handle: Mutex::new(None),
        }
    }

    pub fn master(&self) -> Arc<MasterScheduler> {
        Arc::clone(&self.master)
    }

    pub fn orchestrator(&self) -> Arc<Orchestrator> {
        Arc::clone(&self.orchestrator)
    }

    pub fn shutdown_token(&self) -> ShutdownToken {
        self.orchestrator.shutdown_token()
    }

    /// Start the dispatch pools, then the cadence loop.
    pub async fn start(&self) -> anyhow::Result<()> {
        self.orchestrator.start().await?;

        let master = Arc::clone(&self.master);
        let shutdown = self.shutdown_token();
        let handle = tokio::spawn(async move { master.run(shutdown).await });
        if let Some(previous) = self.master_handle.lock().replace(handle) {
            previous.abort();
        }
        Ok(())
    }

    /// Stop issuing new work and wait for in-flight passes and envelopes.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.orchestrator.shutdown().await?;

        let handle = self.master_handle.lock().take();
        if let Some(handle) = handle {
            let grace = self.orchestrator.config().shutdown_grace();
            match tokio::time::timeout(grace, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => tracing::warn!(error = ?err, "master scheduler task failed"),
                Err(_) => tracing::warn!("master scheduler timed out during shutdown"),
            }
        }
        Ok(())
    }
}
