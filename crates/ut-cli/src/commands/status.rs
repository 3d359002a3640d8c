//! Status command for showing database contents and the latest sync.

use std::io::Write;

use anyhow::Result;

use ut_core::AggregateStore;
use ut_db::Database;

use crate::Config;
use crate::commands::util::format_millis;

pub fn run<W: Write>(writer: &mut W, db: &Database, config: &Config) -> Result<()> {
    writeln!(writer, "Usage tracker status")?;
    writeln!(writer, "Database: {}", config.database_path.display())?;
    writeln!(writer, "Events: {}", db.event_count()?)?;
    writeln!(writer, "Applications: {}", db.entity_count()?)?;

    match db.checkpoint()? {
        Some(ms) => writeln!(writer, "Synced through: {}", format_millis(ms))?,
        None => writeln!(writer, "Synced through: never")?,
    }

    let Some(last) = db.last_sync_run()? else {
        writeln!(writer, "Last sync: none")?;
        return Ok(());
    };
    writeln!(
        writer,
        "Last sync: {} ({}, {} buckets written, {} skipped)",
        last.started_at, last.outcome, last.buckets_written, last.buckets_skipped
    )?;
    if let Some(error) = last.error {
        writeln!(writer, "Last error: {error}")?;
    }

    Ok(())
}
