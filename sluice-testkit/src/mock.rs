use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use sluice::*;

/// Pusher that keeps every record and counts flushes.
///
/// As a [`PusherFactory`] it hands out clones, so every unit's pushes land
/// in the one record the test inspects.
#[derive(Clone, Default)]
pub struct RecordingPusher {
    pushed: Arc<Mutex<Vec<(String, ParsedRecord)>>>,
    flushes: Arc<AtomicUsize>,
    fail_flush: Arc<Mutex<bool>>,
}

impl RecordingPusher {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(index, record)` pairs in push order.
    pub fn pushed(&self) -> Vec<(String, ParsedRecord)> {
        self.pushed.lock().clone()
    }

    pub fn pushed_count(&self) -> usize {
        self.pushed.lock().len()
    }

    pub fn flush_count(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }

    pub fn assert_flush_count_eq(&self, expected: usize) {
        assert_eq!(
            self.flush_count(),
            expected,
            "Expected {} flushes, got {}",
            expected,
            self.flush_count()
        );
    }

    /// Make every later flush fail with a transient error.
    pub fn set_fail_flush(&self, fail: bool) {
        *self.fail_flush.lock() = fail;
    }
}

#[async_trait]
impl BatchPusher for RecordingPusher {
    async fn push(
        &self,
        record: ParsedRecord,
        source: &SourceConfig,
    ) -> Result<(), PipelineError> {
        self.pushed.lock().push((source.index_name(), record));
        Ok(())
    }

    async fn flush(&self) -> Result<(), PipelineError> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        if *self.fail_flush.lock() {
            return Err(PipelineError::transient("injected flush failure"));
        }
        Ok(())
    }
}

impl PusherFactory for RecordingPusher {
    fn create(&self) -> Box<dyn BatchPusher> {
        Box::new(self.clone())
    }
}

/// Search client that records bulk writes and can fail on demand.
#[derive(Clone, Default)]
pub struct RecordingSearchClient {
    batches: Arc<Mutex<Vec<(String, Vec<IndexDocument>)>>>,
    failures_remaining: Arc<AtomicU32>,
}

impl RecordingSearchClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` writes.
    pub fn fail_next(&self, count: u32) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    pub fn batches(&self) -> Vec<(String, Vec<IndexDocument>)> {
        self.batches.lock().clone()
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batches.lock().iter().map(|(_, docs)| docs.len()).collect()
    }

    pub fn document_count(&self) -> usize {
        self.batch_sizes().iter().sum()
    }
}

#[async_trait]
impl SearchClient for RecordingSearchClient {
    async fn bulk_write(&self, index: &str, docs: &[IndexDocument]) -> anyhow::Result<()> {
        let failing = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            anyhow::bail!("injected bulk failure for {index}");
        }
        self.batches.lock().push((index.to_string(), docs.to_vec()));
        Ok(())
    }
}

#[derive(Clone)]
enum Script {
    FollowOns(Vec<Event>),
    Fail(fn() -> PipelineError),
}

/// Actor returning a fixed result and recording what it saw.
///
/// Clones share their record, so a registry factory can hand out clones
/// and the test still observes every invocation.
#[derive(Clone)]
pub struct ScriptedActor {
    script: Arc<Mutex<Script>>,
    seen: Arc<Mutex<Vec<EventEnvelope>>>,
}

impl ScriptedActor {
    /// Succeeds with no follow-ons.
    pub fn new() -> Self {
        Self::with_follow_ons(Vec::new())
    }

    pub fn with_follow_ons(events: Vec<Event>) -> Self {
        Self {
            script: Arc::new(Mutex::new(Script::FollowOns(events))),
            seen: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn failing(error: fn() -> PipelineError) -> Self {
        Self {
            script: Arc::new(Mutex::new(Script::Fail(error))),
            seen: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn succeed(&self) {
        *self.script.lock() = Script::FollowOns(Vec::new());
    }

    pub fn seen(&self) -> Vec<EventEnvelope> {
        self.seen.lock().clone()
    }

    pub fn invocation_count(&self) -> usize {
        self.seen.lock().len()
    }
}

impl Default for ScriptedActor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessorActor for ScriptedActor {
    async fn process(&self, envelope: &EventEnvelope) -> Result<Vec<Event>, PipelineError> {
        self.seen.lock().push(envelope.clone());
        let script = self.script.lock().clone();
        match script {
            Script::FollowOns(events) => Ok(events),
            Script::Fail(error) => Err(error()),
        }
    }
}
