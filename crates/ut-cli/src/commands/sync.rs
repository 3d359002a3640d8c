//! Sync command for folding recorded events into hourly usage buckets.

use std::fs::File;
use std::io::Write;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Args;
use fs2::FileExt;

use ut_core::{SyncCoordinator, SyncResult, SyncStatus};
use ut_db::Database;

use crate::commands::util::{format_millis, parse_millis_or};
use crate::{Config, ConfigNameResolver};

#[derive(Debug, Args)]
pub struct SyncArgs {
    /// End of the sync window (RFC 3339 or e.g. "1 hour ago"). Defaults to now.
    #[arg(long)]
    pub now: Option<String>,
}

/// Runs one incremental pass and records it in the run history.
///
/// Holds an exclusive lock next to the database for the whole pass, so
/// concurrent `ut sync` processes never interleave.
pub fn run(db: &Database, config: &Config, args: &SyncArgs) -> Result<SyncResult> {
    let started_at = Utc::now();
    let now_ms = parse_millis_or(args.now.as_deref(), started_at)?;

    let lock_file = File::create(config.lock_path()).context("failed to create lock file")?;
    lock_file
        .lock_exclusive()
        .context("failed to acquire sync lock")?;

    let resolver = ConfigNameResolver::new(&config.display_names);
    let coordinator = SyncCoordinator::new(db, db, resolver, config.sync_config());
    let outcome = coordinator.run_incremental_sync(now_ms);

    match db.record_sync_run(started_at, now_ms, &outcome) {
        Ok(run_id) => tracing::debug!(run_id = %run_id, "recorded sync run"),
        Err(e) => tracing::warn!(error = %e, "failed to record sync run"),
    }

    outcome.context("sync pass failed")
}

pub fn write_summary<W: Write>(writer: &mut W, result: &SyncResult) -> Result<()> {
    writeln!(
        writer,
        "Synced {} to {}",
        format_millis(result.window_start_ms),
        format_millis(result.window_end_ms)
    )?;
    writeln!(
        writer,
        "Intervals: {}, buckets written: {}",
        result.intervals_reconstructed, result.buckets_written
    )?;
    if result.malformed_events > 0 || result.discarded_closes > 0 {
        writeln!(
            writer,
            "Ignored: {} malformed events, {} unmatched closes",
            result.malformed_events, result.discarded_closes
        )?;
    }
    if let SyncStatus::SucceededWithSkips(skipped) = result.status() {
        writeln!(writer, "Warning: {skipped} buckets could not be written")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::BTreeMap;

    use insta::assert_snapshot;
    use ut_core::{AggregateStore, HOUR_MS, LifecycleEvent};
    use ut_db::EventRecord;

    fn config_for(temp: &tempfile::TempDir) -> Config {
        Config {
            database_path: temp.path().join("ut.db"),
            display_names: BTreeMap::from([("com.example.mail".to_string(), "Mail".to_string())]),
            ..Config::default()
        }
    }

    #[test]
    fn sync_writes_buckets_and_records_run() {
        let temp = tempfile::tempdir().unwrap();
        let config = config_for(&temp);
        let mut db = Database::open(&config.database_path).unwrap();
        db.insert_events(&[
            EventRecord::from_event(&LifecycleEvent::activated("com.example.mail", "inbox", 0)),
            EventRecord::from_event(&LifecycleEvent::deactivated(
                "com.example.mail",
                "inbox",
                HOUR_MS + HOUR_MS / 2,
            )),
        ])
        .unwrap();

        let args = SyncArgs {
            now: Some("1970-01-01T02:00:00Z".to_string()),
        };
        let result = run(&db, &config, &args).unwrap();

        assert_eq!(result.buckets_written, 2);
        assert_eq!(db.checkpoint().unwrap(), Some(2 * HOUR_MS));
        assert_eq!(db.display_names().unwrap()["com.example.mail"], "Mail");
        let last = db.last_sync_run().unwrap().unwrap();
        assert_eq!(last.outcome, "succeeded");
        assert_eq!(last.buckets_written, 2);

        let mut output = Vec::new();
        write_summary(&mut output, &result).unwrap();
        assert_snapshot!(String::from_utf8(output).unwrap(), @r"
        Synced 1970-01-01T00:00:00Z to 1970-01-01T02:00:00Z
        Intervals: 1, buckets written: 2
        ");
    }

    #[test]
    fn sync_failure_is_recorded_as_aborted() {
        let temp = tempfile::tempdir().unwrap();
        let config = config_for(&temp);
        let db = Database::open(&config.database_path).unwrap();
        db.set_checkpoint(2 * 86_400_000).unwrap();

        let args = SyncArgs {
            now: Some("1970-01-01T00:00:00Z".to_string()),
        };
        let err = run(&db, &config, &args).unwrap_err();

        assert!(err.to_string().contains("sync pass failed"));
        let last = db.last_sync_run().unwrap().unwrap();
        assert_eq!(last.outcome, "aborted");
    }

    #[test]
    fn summary_mentions_skips_and_ignored_events() {
        let result = SyncResult {
            window_start_ms: 0,
            window_end_ms: HOUR_MS,
            intervals_reconstructed: 3,
            buckets_written: 2,
            buckets_skipped: 1,
            malformed_events: 1,
            discarded_closes: 2,
        };

        let mut output = Vec::new();
        write_summary(&mut output, &result).unwrap();

        assert_snapshot!(String::from_utf8(output).unwrap(), @r"
        Synced 1970-01-01T00:00:00Z to 1970-01-01T01:00:00Z
        Intervals: 3, buckets written: 2
        Ignored: 1 malformed events, 2 unmatched closes
        Warning: 1 buckets could not be written
        ");
    }
}
