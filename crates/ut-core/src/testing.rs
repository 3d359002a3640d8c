//! In-memory collaborators for unit tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use thiserror::Error;

use crate::bucket::BucketAggregate;
use crate::event::LifecycleEvent;
use crate::store::{AggregateStore, EventSource, NameResolver};

#[derive(Debug, Error)]
#[error("{0}")]
pub struct FakeError(pub String);

#[derive(Debug, Default)]
pub struct FakeSource {
    events: Vec<LifecycleEvent>,
    live: HashSet<String>,
    fail: bool,
    delay: Option<Duration>,
    requested: Mutex<Vec<(i64, i64)>>,
}

impl FakeSource {
    pub fn new(events: Vec<LifecycleEvent>) -> Self {
        Self {
            events,
            ..Self::default()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn with_live(mut self, ids: &[&str]) -> Self {
        self.live = ids.iter().map(|s| (*s).to_string()).collect();
        self
    }

    /// Sleeps in every fetch, widening the gap between checkpoint read and
    /// write.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn requested_windows(&self) -> Vec<(i64, i64)> {
        self.requested.lock().unwrap().clone()
    }
}

impl EventSource for FakeSource {
    type Error = FakeError;

    fn fetch_events(&self, start_ms: i64, end_ms: i64) -> Result<Vec<LifecycleEvent>, FakeError> {
        if self.fail {
            return Err(FakeError("source offline".to_string()));
        }
        self.requested.lock().unwrap().push((start_ms, end_ms));
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        Ok(self
            .events
            .iter()
            .filter(|e| e.timestamp_ms >= start_ms && e.timestamp_ms < end_ms)
            .cloned()
            .collect())
    }

    fn live_entities_now(&self) -> Result<HashSet<String>, FakeError> {
        Ok(self.live.clone())
    }
}

#[derive(Debug, Default)]
pub struct FakeResolver {
    names: HashMap<String, String>,
    calls: AtomicUsize,
}

impl FakeResolver {
    pub fn with_names(names: &[(&str, &str)]) -> Self {
        Self {
            names: names
                .iter()
                .map(|(id, name)| ((*id).to_string(), (*name).to_string()))
                .collect(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl NameResolver for FakeResolver {
    type Error = FakeError;

    fn resolve_display_name(&self, entity_id: &str) -> Result<String, FakeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.names
            .get(entity_id)
            .cloned()
            .ok_or_else(|| FakeError(format!("no name for {entity_id}")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointOp {
    Read,
    Write(i64),
}

#[derive(Debug, Default)]
struct StoreState {
    checkpoint: Option<i64>,
    checkpoint_log: Vec<CheckpointOp>,
    buckets: BTreeMap<(String, i64), (i64, i64)>,
    entities: BTreeMap<String, (i64, String)>,
    rejected: HashSet<String>,
}

#[derive(Debug, Default)]
pub struct FakeStore {
    state: Mutex<StoreState>,
}

impl FakeStore {
    pub fn reject_writes_for(&self, entity_id: &str) {
        self.state
            .lock()
            .unwrap()
            .rejected
            .insert(entity_id.to_string());
    }

    pub fn rows(&self) -> Vec<BucketAggregate> {
        self.query_buckets(i64::MIN, i64::MAX).unwrap()
    }

    pub fn checkpoint_value(&self) -> Option<i64> {
        self.state.lock().unwrap().checkpoint
    }

    /// Checkpoint reads and writes made through [`AggregateStore`], in order.
    pub fn checkpoint_log(&self) -> Vec<CheckpointOp> {
        self.state.lock().unwrap().checkpoint_log.clone()
    }

    pub fn display_name(&self, entity_id: &str) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .entities
            .get(entity_id)
            .map(|(_, name)| name.clone())
    }

    fn filtered(&self, entity: Option<&str>, start_ms: i64, end_ms: i64) -> Vec<BucketAggregate> {
        self.state
            .lock()
            .unwrap()
            .buckets
            .iter()
            .filter(|((id, start), _)| {
                *start >= start_ms && *start < end_ms && entity.is_none_or(|e| e == id)
            })
            .map(|((id, start), (duration, count))| BucketAggregate {
                entity_id: id.clone(),
                bucket_start_ms: *start,
                duration_ms: *duration,
                occurrence_count: *count,
            })
            .collect()
    }
}

impl AggregateStore for FakeStore {
    type Error = FakeError;

    fn checkpoint(&self) -> Result<Option<i64>, FakeError> {
        let mut state = self.state.lock().unwrap();
        state.checkpoint_log.push(CheckpointOp::Read);
        Ok(state.checkpoint)
    }

    fn set_checkpoint(&self, checkpoint_ms: i64) -> Result<(), FakeError> {
        let mut state = self.state.lock().unwrap();
        state.checkpoint_log.push(CheckpointOp::Write(checkpoint_ms));
        state.checkpoint = Some(checkpoint_ms);
        Ok(())
    }

    fn upsert_bucket(
        &self,
        entity_id: &str,
        bucket_start_ms: i64,
        duration_ms: i64,
        occurrence_count: i64,
    ) -> Result<(), FakeError> {
        let mut state = self.state.lock().unwrap();
        if state.rejected.contains(entity_id) {
            return Err(FakeError(format!("write rejected for {entity_id}")));
        }
        state.buckets.insert(
            (entity_id.to_string(), bucket_start_ms),
            (duration_ms, occurrence_count),
        );
        Ok(())
    }

    fn query_buckets(&self, start_ms: i64, end_ms: i64) -> Result<Vec<BucketAggregate>, FakeError> {
        Ok(self.filtered(None, start_ms, end_ms))
    }

    fn query_buckets_for_entity(
        &self,
        entity_id: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<BucketAggregate>, FakeError> {
        Ok(self.filtered(Some(entity_id), start_ms, end_ms))
    }

    fn find_entity(&self, entity_id: &str) -> Result<Option<i64>, FakeError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .entities
            .get(entity_id)
            .map(|(id, _)| *id))
    }

    fn ensure_entity(&self, entity_id: &str, display_name: &str) -> Result<i64, FakeError> {
        let mut state = self.state.lock().unwrap();
        let next_id = i64::try_from(state.entities.len()).unwrap() + 1;
        let (id, _) = state
            .entities
            .entry(entity_id.to_string())
            .or_insert_with(|| (next_id, display_name.to_string()));
        Ok(*id)
    }

    fn display_names(&self) -> Result<HashMap<String, String>, FakeError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .entities
            .iter()
            .map(|(id, (_, name))| (id.clone(), name.clone()))
            .collect())
    }
}
