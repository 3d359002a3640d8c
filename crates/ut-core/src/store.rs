//! Collaborator contracts consumed by the sync coordinator and rollups.
//!
//! All methods take `&self`: implementations are expected to handle their
//! own interior mutability (a `SQLite` connection already does).

use std::collections::{HashMap, HashSet};

use crate::bucket::BucketAggregate;
use crate::event::LifecycleEvent;

/// Supplies lifecycle events for a window.
pub trait EventSource {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Returns events in `[start_ms, end_ms)` in delivery order.
    fn fetch_events(&self, start_ms: i64, end_ms: i64) -> Result<Vec<LifecycleEvent>, Self::Error>;

    /// Returns entities currently in the foreground.
    fn live_entities_now(&self) -> Result<HashSet<String>, Self::Error>;
}

/// Maps entity ids to human-readable names.
pub trait NameResolver {
    type Error: std::error::Error + Send + Sync + 'static;

    fn resolve_display_name(&self, entity_id: &str) -> Result<String, Self::Error>;
}

/// Durable storage for bucket aggregates, the entity registry, and the
/// sync checkpoint.
pub trait AggregateStore {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Returns the last checkpoint, or `None` before the first sync.
    fn checkpoint(&self) -> Result<Option<i64>, Self::Error>;

    fn set_checkpoint(&self, checkpoint_ms: i64) -> Result<(), Self::Error>;

    /// Inserts or overwrites the row for `(entity_id, bucket_start_ms)`.
    fn upsert_bucket(
        &self,
        entity_id: &str,
        bucket_start_ms: i64,
        duration_ms: i64,
        occurrence_count: i64,
    ) -> Result<(), Self::Error>;

    /// Returns rows with `start_ms <= bucket_start_ms < end_ms`.
    fn query_buckets(&self, start_ms: i64, end_ms: i64) -> Result<Vec<BucketAggregate>, Self::Error>;

    /// Like [`query_buckets`](Self::query_buckets), restricted to one entity.
    fn query_buckets_for_entity(
        &self,
        entity_id: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<BucketAggregate>, Self::Error>;

    /// Returns the store-local id of a registered entity.
    fn find_entity(&self, entity_id: &str) -> Result<Option<i64>, Self::Error>;

    /// Registers an entity if missing; existing rows are left untouched.
    fn ensure_entity(&self, entity_id: &str, display_name: &str) -> Result<i64, Self::Error>;

    /// Returns `entity_id -> display_name` for every registered entity.
    fn display_names(&self) -> Result<HashMap<String, String>, Self::Error>;
}

impl<T: EventSource + ?Sized> EventSource for &T {
    type Error = T::Error;

    fn fetch_events(&self, start_ms: i64, end_ms: i64) -> Result<Vec<LifecycleEvent>, Self::Error> {
        (**self).fetch_events(start_ms, end_ms)
    }

    fn live_entities_now(&self) -> Result<HashSet<String>, Self::Error> {
        (**self).live_entities_now()
    }
}

impl<T: NameResolver + ?Sized> NameResolver for &T {
    type Error = T::Error;

    fn resolve_display_name(&self, entity_id: &str) -> Result<String, Self::Error> {
        (**self).resolve_display_name(entity_id)
    }
}

impl<T: AggregateStore + ?Sized> AggregateStore for &T {
    type Error = T::Error;

    fn checkpoint(&self) -> Result<Option<i64>, Self::Error> {
        (**self).checkpoint()
    }

    fn set_checkpoint(&self, checkpoint_ms: i64) -> Result<(), Self::Error> {
        (**self).set_checkpoint(checkpoint_ms)
    }

    fn upsert_bucket(
        &self,
        entity_id: &str,
        bucket_start_ms: i64,
        duration_ms: i64,
        occurrence_count: i64,
    ) -> Result<(), Self::Error> {
        (**self).upsert_bucket(entity_id, bucket_start_ms, duration_ms, occurrence_count)
    }

    fn query_buckets(&self, start_ms: i64, end_ms: i64) -> Result<Vec<BucketAggregate>, Self::Error> {
        (**self).query_buckets(start_ms, end_ms)
    }

    fn query_buckets_for_entity(
        &self,
        entity_id: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<BucketAggregate>, Self::Error> {
        (**self).query_buckets_for_entity(entity_id, start_ms, end_ms)
    }

    fn find_entity(&self, entity_id: &str) -> Result<Option<i64>, Self::Error> {
        (**self).find_entity(entity_id)
    }

    fn ensure_entity(&self, entity_id: &str, display_name: &str) -> Result<i64, Self::Error> {
        (**self).ensure_entity(entity_id, display_name)
    }

    fn display_names(&self) -> Result<HashMap<String, String>, Self::Error> {
        (**self).display_names()
    }
}
