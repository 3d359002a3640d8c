//! Incremental synchronization of bucket aggregates.
//!
//! One pass rescans from the start of the alignment period (a day by
//! default) containing the last checkpoint, recomputes every hour bucket in
//! that window, and overwrites the stored rows. Because rows are
//! overwritten rather than incremented, re-running a pass over the same
//! window is idempotent.

use std::collections::HashSet;
use std::sync::{Mutex, PoisonError, TryLockError};

use chrono::Utc;
use thiserror::Error;

use crate::bucket::{DAY_MS, HOUR_MS, aggregate, floor_to, into_sorted_rows};
use crate::reconstruct::{Window, reconstruct};
use crate::store::{AggregateStore, EventSource, NameResolver};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Configuration for a sync pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncConfig {
    /// The rescan window starts at the checkpoint floored to this alignment,
    /// then to the hour. Default: 86400000 (1 day). Non-positive values
    /// rescan only the hour containing the checkpoint.
    pub rescan_alignment_ms: i64,

    /// Live entities are only consulted when the requested `now` is within
    /// this distance of the wall clock.
    /// Default: 60000 (1 minute).
    pub live_tolerance_ms: i64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            rescan_alignment_ms: DAY_MS,
            live_tolerance_ms: 60_000,
        }
    }
}

/// Whether a sync pass is currently running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Syncing,
}

/// Errors that abort a sync pass.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The event source failed; nothing was written.
    #[error("event source unavailable")]
    SourceUnavailable(#[source] BoxError),

    /// The checkpoint could not be read; nothing was written.
    #[error("failed to read sync checkpoint")]
    CheckpointRead(#[source] BoxError),

    /// Buckets were written but the checkpoint did not advance.
    #[error("failed to advance sync checkpoint to {checkpoint_ms}")]
    CheckpointWrite {
        checkpoint_ms: i64,
        #[source]
        source: BoxError,
    },

    /// The requested end of the window precedes its start.
    #[error("sync time {now_ms} precedes window start {window_start_ms}")]
    ClockWentBackwards { now_ms: i64, window_start_ms: i64 },
}

/// Overall outcome of a completed pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Succeeded,
    /// Completed, but this many buckets could not be written.
    SucceededWithSkips(usize),
}

/// Summary of a completed sync pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncResult {
    pub window_start_ms: i64,
    pub window_end_ms: i64,
    pub intervals_reconstructed: usize,
    pub buckets_written: usize,
    pub buckets_skipped: usize,
    pub malformed_events: usize,
    pub discarded_closes: usize,
}

impl SyncResult {
    pub const fn status(&self) -> SyncStatus {
        if self.buckets_skipped == 0 {
            SyncStatus::Succeeded
        } else {
            SyncStatus::SucceededWithSkips(self.buckets_skipped)
        }
    }
}

fn wall_clock_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Runs incremental sync passes against injected collaborators.
///
/// Concurrent calls to [`run_incremental_sync`](Self::run_incremental_sync)
/// are serialized; the checkpoint read and write never interleave.
pub struct SyncCoordinator<S, St, R> {
    source: S,
    store: St,
    resolver: R,
    config: SyncConfig,
    clock: fn() -> i64,
    guard: Mutex<()>,
}

impl<S, St, R> SyncCoordinator<S, St, R>
where
    S: EventSource,
    St: AggregateStore,
    R: NameResolver,
{
    pub fn new(source: S, store: St, resolver: R, config: SyncConfig) -> Self {
        Self {
            source,
            store,
            resolver,
            config,
            clock: wall_clock_ms,
            guard: Mutex::new(()),
        }
    }

    /// Replaces the wall clock used to decide whether live entities apply.
    #[must_use]
    pub fn with_clock(mut self, clock: fn() -> i64) -> Self {
        self.clock = clock;
        self
    }

    pub fn state(&self) -> SyncState {
        match self.guard.try_lock() {
            Err(TryLockError::WouldBlock) => SyncState::Syncing,
            Ok(_) | Err(TryLockError::Poisoned(_)) => SyncState::Idle,
        }
    }

    /// Run one incremental pass ending at `now_ms`.
    pub fn run_incremental_sync(&self, now_ms: i64) -> Result<SyncResult, SyncError> {
        let _running = self.guard.lock().unwrap_or_else(PoisonError::into_inner);

        let last_sync_ms = self
            .store
            .checkpoint()
            .map_err(|e| SyncError::CheckpointRead(Box::new(e)))?
            .unwrap_or(0);
        let window = Window::new(self.window_start(last_sync_ms), now_ms);
        if window.end_ms < window.start_ms {
            return Err(SyncError::ClockWentBackwards {
                now_ms,
                window_start_ms: window.start_ms,
            });
        }

        let events = self
            .source
            .fetch_events(window.start_ms, window.end_ms)
            .map_err(|e| SyncError::SourceUnavailable(Box::new(e)))?;
        let live = if (now_ms - (self.clock)()).abs() <= self.config.live_tolerance_ms {
            self.source
                .live_entities_now()
                .map_err(|e| SyncError::SourceUnavailable(Box::new(e)))?
        } else {
            HashSet::new()
        };

        tracing::debug!(
            window_start_ms = window.start_ms,
            window_end_ms = window.end_ms,
            event_count = events.len(),
            live_count = live.len(),
            "reconstructing sessions"
        );

        let reconstruction = reconstruct(&events, window, &live, now_ms);
        let rows = into_sorted_rows(aggregate(&reconstruction.intervals, HOUR_MS));

        let mut registered: HashSet<String> = HashSet::new();
        let mut buckets_written = 0;
        let mut buckets_skipped = 0;
        for row in &rows {
            if !registered.contains(&row.entity_id) {
                if let Err(e) = self.register_entity(&row.entity_id) {
                    tracing::warn!(entity_id = %row.entity_id, error = %e, "failed to register entity");
                    buckets_skipped += 1;
                    continue;
                }
                registered.insert(row.entity_id.clone());
            }

            match self.store.upsert_bucket(
                &row.entity_id,
                row.bucket_start_ms,
                row.duration_ms,
                row.occurrence_count,
            ) {
                Ok(()) => buckets_written += 1,
                Err(e) => {
                    tracing::warn!(
                        entity_id = %row.entity_id,
                        bucket_start_ms = row.bucket_start_ms,
                        error = %e,
                        "failed to write bucket"
                    );
                    buckets_skipped += 1;
                }
            }
        }

        let checkpoint_ms = last_sync_ms.max(now_ms);
        self.store
            .set_checkpoint(checkpoint_ms)
            .map_err(|e| SyncError::CheckpointWrite {
                checkpoint_ms,
                source: Box::new(e),
            })?;

        let result = SyncResult {
            window_start_ms: window.start_ms,
            window_end_ms: window.end_ms,
            intervals_reconstructed: reconstruction.intervals.len(),
            buckets_written,
            buckets_skipped,
            malformed_events: reconstruction.malformed.len(),
            discarded_closes: reconstruction.discarded_closes,
        };
        tracing::info!(
            buckets_written,
            buckets_skipped,
            checkpoint_ms,
            "sync pass complete"
        );
        Ok(result)
    }

    /// Always an hour boundary: a bucket is only ever rewritten from a
    /// window covering all of it.
    const fn window_start(&self, last_sync_ms: i64) -> i64 {
        let aligned = if self.config.rescan_alignment_ms > 0 {
            floor_to(last_sync_ms, self.config.rescan_alignment_ms)
        } else {
            last_sync_ms
        };
        floor_to(aligned, HOUR_MS)
    }

    fn register_entity(&self, entity_id: &str) -> Result<(), St::Error> {
        if self.store.find_entity(entity_id)?.is_some() {
            return Ok(());
        }
        let display_name = match self.resolver.resolve_display_name(entity_id) {
            Ok(name) => name,
            Err(e) => {
                tracing::warn!(entity_id, error = %e, "name resolution failed, using raw id");
                entity_id.to_string()
            }
        };
        self.store.ensure_entity(entity_id, &display_name)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use crate::bucket::BucketAggregate;
    use crate::event::LifecycleEvent;
    use crate::testing::{CheckpointOp, FakeResolver, FakeSource, FakeStore};

    const WALL_CLOCK: i64 = 1_000 * DAY_MS;

    fn fixed_clock() -> i64 {
        WALL_CLOCK
    }

    fn coordinator<'a>(
        source: &'a FakeSource,
        store: &'a FakeStore,
        resolver: &'a FakeResolver,
    ) -> SyncCoordinator<&'a FakeSource, &'a FakeStore, &'a FakeResolver> {
        SyncCoordinator::new(source, store, resolver, SyncConfig::default()).with_clock(fixed_clock)
    }

    fn row(entity: &str, start: i64, duration: i64, count: i64) -> BucketAggregate {
        BucketAggregate {
            entity_id: entity.to_string(),
            bucket_start_ms: start,
            duration_ms: duration,
            occurrence_count: count,
        }
    }

    #[test]
    fn test_first_sync_backfills_from_epoch() {
        let source = FakeSource::new(vec![
            LifecycleEvent::activated("A", "1", 1000),
            LifecycleEvent::deactivated("A", "1", 5000),
        ]);
        let store = FakeStore::default();
        let resolver = FakeResolver::with_names(&[("A", "App A")]);

        let result = coordinator(&source, &store, &resolver)
            .run_incremental_sync(10_000)
            .unwrap();

        assert_eq!(result.window_start_ms, 0);
        assert_eq!(result.window_end_ms, 10_000);
        assert_eq!(result.buckets_written, 1);
        assert_eq!(result.status(), SyncStatus::Succeeded);
        assert_eq!(store.rows(), vec![row("A", 0, 4000, 1)]);
        assert_eq!(store.checkpoint_value(), Some(10_000));
        assert_eq!(store.display_name("A").as_deref(), Some("App A"));
    }

    #[test]
    fn test_repeated_sync_is_idempotent() {
        let source = FakeSource::new(vec![
            LifecycleEvent::activated("A", "1", HOUR_MS / 2),
            LifecycleEvent::deactivated("A", "1", 2 * HOUR_MS),
        ]);
        let store = FakeStore::default();
        let resolver = FakeResolver::default();
        let sync = coordinator(&source, &store, &resolver);

        sync.run_incremental_sync(3 * HOUR_MS).unwrap();
        let first = store.rows();
        let second_result = sync.run_incremental_sync(3 * HOUR_MS + 1000).unwrap();

        assert_eq!(store.rows(), first);
        assert_eq!(
            first,
            vec![row("A", 0, HOUR_MS / 2, 1), row("A", HOUR_MS, HOUR_MS, 1)]
        );
        assert_eq!(second_result.buckets_written, 2);
        assert_eq!(store.checkpoint_value(), Some(3 * HOUR_MS + 1000));
    }

    #[test]
    fn test_rescan_starts_at_day_of_checkpoint() {
        let source = FakeSource::new(Vec::new());
        let store = FakeStore::default();
        store.set_checkpoint(3 * DAY_MS + 5 * HOUR_MS).unwrap();
        let resolver = FakeResolver::default();

        let result = coordinator(&source, &store, &resolver)
            .run_incremental_sync(4 * DAY_MS)
            .unwrap();

        assert_eq!(result.window_start_ms, 3 * DAY_MS);
        assert_eq!(source.requested_windows(), vec![(3 * DAY_MS, 4 * DAY_MS)]);
    }

    #[test]
    fn test_custom_alignment_is_respected() {
        let source = FakeSource::new(Vec::new());
        let store = FakeStore::default();
        store.set_checkpoint(5 * HOUR_MS + 10).unwrap();
        let resolver = FakeResolver::default();
        let config = SyncConfig {
            rescan_alignment_ms: HOUR_MS,
            ..SyncConfig::default()
        };

        let result = SyncCoordinator::new(&source, &store, &resolver, config)
            .with_clock(fixed_clock)
            .run_incremental_sync(6 * HOUR_MS)
            .unwrap();

        assert_eq!(result.window_start_ms, 5 * HOUR_MS);
    }

    #[test]
    fn test_unaligned_rescan_still_rewrites_whole_hours() {
        const MINUTE_MS: i64 = 60_000;
        let source = FakeSource::new(vec![
            LifecycleEvent::activated("A", "1", 0),
            LifecycleEvent::deactivated("A", "1", 20 * MINUTE_MS),
            LifecycleEvent::activated("A", "1", 40 * MINUTE_MS),
            LifecycleEvent::deactivated("A", "1", 50 * MINUTE_MS),
        ]);
        let store = FakeStore::default();
        let resolver = FakeResolver::default();
        let config = SyncConfig {
            rescan_alignment_ms: 0,
            ..SyncConfig::default()
        };
        let sync = SyncCoordinator::new(&source, &store, &resolver, config).with_clock(fixed_clock);

        sync.run_incremental_sync(30 * MINUTE_MS).unwrap();
        assert_eq!(store.rows(), vec![row("A", 0, 20 * MINUTE_MS, 1)]);

        let second = sync.run_incremental_sync(HOUR_MS).unwrap();

        assert_eq!(second.window_start_ms, 0);
        assert_eq!(store.rows(), vec![row("A", 0, 30 * MINUTE_MS, 2)]);
    }

    #[test]
    fn test_alignment_off_the_hour_is_floored_to_hour() {
        let source = FakeSource::new(Vec::new());
        let store = FakeStore::default();
        store.set_checkpoint(5 * HOUR_MS + 10).unwrap();
        let resolver = FakeResolver::default();
        let config = SyncConfig {
            rescan_alignment_ms: 90 * 60_000,
            ..SyncConfig::default()
        };

        let result = SyncCoordinator::new(&source, &store, &resolver, config)
            .with_clock(fixed_clock)
            .run_incremental_sync(6 * HOUR_MS)
            .unwrap();

        assert_eq!(result.window_start_ms, 4 * HOUR_MS);
    }

    #[test]
    fn test_source_failure_aborts_without_changes() {
        let source = FakeSource::failing();
        let store = FakeStore::default();
        store.set_checkpoint(HOUR_MS).unwrap();
        let resolver = FakeResolver::default();

        let err = coordinator(&source, &store, &resolver)
            .run_incremental_sync(2 * HOUR_MS)
            .unwrap_err();

        assert!(matches!(err, SyncError::SourceUnavailable(_)));
        assert!(store.rows().is_empty());
        assert_eq!(store.checkpoint_value(), Some(HOUR_MS));
    }

    #[test]
    fn test_name_resolution_failure_falls_back_to_id() {
        let source = FakeSource::new(vec![LifecycleEvent::deactivated("com.example", "main", 500)]);
        let store = FakeStore::default();
        let resolver = FakeResolver::default();

        let result = coordinator(&source, &store, &resolver)
            .run_incremental_sync(1000)
            .unwrap();

        assert_eq!(result.status(), SyncStatus::Succeeded);
        assert_eq!(store.display_name("com.example").as_deref(), Some("com.example"));
    }

    #[test]
    fn test_existing_entity_is_not_renamed() {
        let source = FakeSource::new(vec![LifecycleEvent::deactivated("A", "1", 500)]);
        let store = FakeStore::default();
        store.ensure_entity("A", "Original").unwrap();
        let resolver = FakeResolver::with_names(&[("A", "Renamed")]);

        coordinator(&source, &store, &resolver)
            .run_incremental_sync(1000)
            .unwrap();

        assert_eq!(store.display_name("A").as_deref(), Some("Original"));
        assert_eq!(resolver.calls(), 0);
    }

    #[test]
    fn test_write_failures_skip_bucket_and_still_advance() {
        let source = FakeSource::new(vec![
            LifecycleEvent::deactivated("A", "1", 500),
            LifecycleEvent::activated("B", "1", 600),
            LifecycleEvent::deactivated("B", "1", 900),
        ]);
        let store = FakeStore::default();
        store.reject_writes_for("A");
        let resolver = FakeResolver::default();

        let result = coordinator(&source, &store, &resolver)
            .run_incremental_sync(1000)
            .unwrap();

        assert_eq!(result.status(), SyncStatus::SucceededWithSkips(1));
        assert_eq!(result.buckets_written, 1);
        assert_eq!(store.rows(), vec![row("B", 0, 300, 1)]);
        assert_eq!(store.checkpoint_value(), Some(1000));
    }

    #[test]
    fn test_live_entities_used_near_wall_clock() {
        let source = FakeSource::new(Vec::new()).with_live(&["A"]);
        let store = FakeStore::default();
        let resolver = FakeResolver::default();
        store.set_checkpoint(WALL_CLOCK - 2 * HOUR_MS).unwrap();

        let result = coordinator(&source, &store, &resolver)
            .run_incremental_sync(WALL_CLOCK)
            .unwrap();

        // Window starts at the day boundary, which is WALL_CLOCK - 1 day.
        assert_eq!(result.window_start_ms, WALL_CLOCK - DAY_MS);
        assert_eq!(result.buckets_written, 24);
    }

    #[test]
    fn test_live_entities_ignored_for_historical_sync() {
        let source = FakeSource::new(Vec::new()).with_live(&["A"]);
        let store = FakeStore::default();
        let resolver = FakeResolver::default();

        let result = coordinator(&source, &store, &resolver)
            .run_incremental_sync(2 * HOUR_MS)
            .unwrap();

        assert_eq!(result.buckets_written, 0);
        assert_eq!(store.checkpoint_value(), Some(2 * HOUR_MS));
    }

    #[test]
    fn test_clock_going_backwards_is_rejected() {
        let source = FakeSource::new(Vec::new());
        let store = FakeStore::default();
        store.set_checkpoint(2 * DAY_MS).unwrap();
        let resolver = FakeResolver::default();

        let err = coordinator(&source, &store, &resolver)
            .run_incremental_sync(DAY_MS)
            .unwrap_err();

        assert!(matches!(err, SyncError::ClockWentBackwards { .. }));
        assert!(source.requested_windows().is_empty());
        assert_eq!(store.checkpoint_value(), Some(2 * DAY_MS));
    }

    #[test]
    fn test_checkpoint_never_moves_backwards() {
        let source = FakeSource::new(Vec::new());
        let store = FakeStore::default();
        store.set_checkpoint(DAY_MS + 5000).unwrap();
        let resolver = FakeResolver::default();

        coordinator(&source, &store, &resolver)
            .run_incremental_sync(DAY_MS + 1000)
            .unwrap();

        assert_eq!(store.checkpoint_value(), Some(DAY_MS + 5000));
    }

    #[test]
    fn test_concurrent_passes_do_not_interleave() {
        let events = vec![
            LifecycleEvent::activated("A", "1", HOUR_MS / 2),
            LifecycleEvent::deactivated("A", "1", 2 * HOUR_MS),
            LifecycleEvent::activated("B", "1", 2 * HOUR_MS),
            LifecycleEvent::deactivated("B", "1", 2 * HOUR_MS + 5000),
        ];
        let source = FakeSource::new(events.clone()).with_delay(Duration::from_millis(5));
        let store = FakeStore::default();
        let resolver = FakeResolver::default();
        let sync = coordinator(&source, &store, &resolver);

        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| sync.run_incremental_sync(3 * HOUR_MS).unwrap());
            }
        });

        let log = store.checkpoint_log();
        assert_eq!(log.len(), 8);
        for pass in log.chunks(2) {
            assert_eq!(pass, [CheckpointOp::Read, CheckpointOp::Write(3 * HOUR_MS)]);
        }
        assert_eq!(sync.state(), SyncState::Idle);

        let single_source = FakeSource::new(events);
        let single_store = FakeStore::default();
        coordinator(&single_source, &single_store, &resolver)
            .run_incremental_sync(3 * HOUR_MS)
            .unwrap();
        assert_eq!(store.rows(), single_store.rows());
    }

    #[test]
    fn test_idle_outside_of_pass() {
        let source = FakeSource::new(Vec::new());
        let store = FakeStore::default();
        let resolver = FakeResolver::default();

        assert_eq!(coordinator(&source, &store, &resolver).state(), SyncState::Idle);
    }
}
