//! Core domain logic for the usage tracker.
//!
//! This crate contains the fundamental types and logic for:
//! - Session reconstruction: turning lifecycle events into foreground intervals
//! - Bucket aggregation: splitting intervals into hour/day buckets
//! - Incremental sync: merging freshly computed buckets into a store
//! - Rollups: hour, day and per-entity summaries over stored buckets

pub mod bucket;
pub mod event;
pub mod reconstruct;
pub mod rollup;
pub mod store;
mod sync;

#[cfg(test)]
mod testing;

pub use bucket::{BucketAggregate, BucketKey, BucketMap, BucketWidth, DAY_MS, HOUR_MS, aggregate};
pub use event::{LifecycleEvent, LifecycleKind, UnknownLifecycleKind, ValidationError};
pub use reconstruct::{
    ForegroundInterval, MalformedEvent, Reconstruction, TransitionEvent, Window, reconstruct,
};
pub use rollup::{EntityUsage, UsageTotal};
pub use store::{AggregateStore, EventSource, NameResolver};
pub use sync::{SyncConfig, SyncCoordinator, SyncError, SyncResult, SyncState, SyncStatus};
