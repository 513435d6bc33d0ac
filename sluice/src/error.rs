use thiserror::Error;

/// Failure taxonomy for pipeline stages.
///
/// Collaborator traits keep returning `anyhow::Result`; stages classify
/// what they observe into one of these variants so the orchestrator can
/// decide between redelivery and a deliberate drop.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Network or storage hiccup. Retried by queue redelivery.
    #[error("transient failure: {0}")]
    Transient(String),

    /// A lease renewal failed or the unit lease is held elsewhere.
    #[error("lost ownership of lease {lease}")]
    LostOwnership { lease: String },

    /// The unit vanished between discovery and processing.
    #[error("unit {unit} no longer exists")]
    StaleReference { unit: String },

    /// Missing or unresolvable parser, scheduler or actor.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The unit exceeds the buffered size bound.
    #[error("unit {unit} exceeds the {limit} byte limit")]
    Capacity { unit: String, limit: u64 },

    /// The search backend rejected a batch after pusher-level retries.
    #[error("write to index {index} failed after {attempts} attempts: {reason}")]
    WriteFailure {
        index: String,
        attempts: u32,
        reason: String,
    },

    #[error("malformed event body: {0}")]
    Body(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// What the orchestrator does with an envelope whose handler failed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Disposition {
    /// Leave the envelope unacknowledged for queue redelivery.
    Retry,
    /// Acknowledge the envelope and log the drop.
    Drop,
}

impl PipelineError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn lost_ownership(lease: impl Into<String>) -> Self {
        Self::LostOwnership {
            lease: lease.into(),
        }
    }

    pub fn stale(unit: impl Into<String>) -> Self {
        Self::StaleReference { unit: unit.into() }
    }

    /// Stale references and oversized units are the only deliberate drops.
    /// Everything else, configuration errors included, goes back to the
    /// queue so its dead-letter threshold stays the single retry budget.
    pub fn disposition(&self) -> Disposition {
        match self {
            Self::StaleReference { .. } | Self::Capacity { .. } => {
                Disposition::Drop
            }
            _ => Disposition::Retry,
        }
    }

    /// Stable label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transient(_) => "transient",
            Self::LostOwnership { .. } => "lost_ownership",
            Self::StaleReference { .. } => "stale_reference",
            Self::Configuration(_) => "configuration",
            Self::Capacity { .. } => "capacity",
            Self::WriteFailure { .. } => "write_failure",
            Self::Body(_) => "body",
            Self::Other(_) => "other",
        }
    }
}
