use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::Mutex;

/// Records what discovery has already handed to the queue.
///
/// Two kinds of marks: a per-source high-water mark (the end of the last
/// contiguous range or bucket enqueued) and per-unit discovered marks
/// keyed by lease name. Marks are written only after the discovery event
/// is in the queue.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn high_water_mark(&self, source: &str) -> anyhow::Result<Option<i64>>;

    /// Raise the high-water mark; lower values are ignored.
    async fn advance_high_water_mark(
        &self,
        source: &str,
        mark: i64,
    ) -> anyhow::Result<()>;

    async fn is_discovered(&self, unit: &str) -> anyhow::Result<bool>;

    /// Returns `false` when the unit was already marked.
    async fn mark_discovered(&self, unit: &str) -> anyhow::Result<bool>;
}

#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    marks: Mutex<HashMap<String, i64>>,
    discovered: Mutex<HashSet<String>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn discovered_count(&self) -> usize {
        self.discovered.lock().len()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn high_water_mark(&self, source: &str) -> anyhow::Result<Option<i64>> {
        Ok(self.marks.lock().get(source).copied())
    }

    async fn advance_high_water_mark(
        &self,
        source: &str,
        mark: i64,
    ) -> anyhow::Result<()> {
        let mut marks = self.marks.lock();
        let current = marks.entry(source.to_string()).or_insert(mark);
        *current = (*current).max(mark);
        Ok(())
    }

    async fn is_discovered(&self, unit: &str) -> anyhow::Result<bool> {
        Ok(self.discovered.lock().contains(unit))
    }

    async fn mark_discovered(&self, unit: &str) -> anyhow::Result<bool> {
        Ok(self.discovered.lock().insert(unit.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_high_water_mark_only_moves_forward() {
        let store = InMemoryCheckpointStore::new();
        assert_eq!(store.high_water_mark("logs-A").await.unwrap(), None);

        store.advance_high_water_mark("logs-A", 120).await.unwrap();
        store.advance_high_water_mark("logs-A", 60).await.unwrap();
        assert_eq!(store.high_water_mark("logs-A").await.unwrap(), Some(120));
    }

    #[tokio::test]
    async fn test_mark_discovered_reports_first_writer() {
        let store = InMemoryCheckpointStore::new();
        assert!(store.mark_discovered("logs-A:a.log").await.unwrap());
        assert!(!store.mark_discovered("logs-A:a.log").await.unwrap());
        assert!(store.is_discovered("logs-A:a.log").await.unwrap());
        assert_eq!(store.discovered_count(), 1);
    }
}
