//! Apps command: total usage per application over a range.

use std::fmt::Write as _;
use std::io::Write;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Args;
use serde::Serialize;

use ut_core::rollup::entity_usage_summary;
use ut_core::{DAY_MS, EntityUsage};
use ut_db::Database;

use crate::commands::util::{format_duration, format_millis, progress_bar, resolve_range};

#[derive(Debug, Args)]
pub struct AppsArgs {
    /// Range start (RFC 3339 or e.g. "3 days ago"). Defaults to one day before the end.
    #[arg(long)]
    pub start: Option<String>,

    /// Range end (exclusive). Defaults to now.
    #[arg(long)]
    pub end: Option<String>,

    /// Output as JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Serialize)]
pub struct AppsData {
    pub start_ms: i64,
    pub end_ms: i64,
    pub apps: Vec<EntityUsage>,
}

pub fn generate_apps_data(db: &Database, args: &AppsArgs, now: DateTime<Utc>) -> Result<AppsData> {
    let (start_ms, end_ms) = resolve_range(args.start.as_deref(), args.end.as_deref(), DAY_MS, now)?;
    let apps = entity_usage_summary(db, start_ms, end_ms).context("failed to summarize usage")?;
    Ok(AppsData {
        start_ms,
        end_ms,
        apps,
    })
}

pub fn format_apps(data: &AppsData) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Usage by application ({} to {})",
        format_millis(data.start_ms),
        format_millis(data.end_ms)
    );
    out.push('\n');

    if data.apps.is_empty() {
        out.push_str("No usage recorded.\n");
        return out;
    }

    let label_width = data.apps.iter().map(|a| a.label().len()).max().unwrap_or(0);
    let max = data.apps.first().map_or(0, |a| a.total_duration_ms);
    for app in &data.apps {
        let _ = writeln!(
            out,
            "{:<label_width$}  {}  {:>7}  ({} activations)",
            app.label(),
            progress_bar(app.total_duration_ms, max),
            format_duration(app.total_duration_ms),
            app.total_count
        );
    }
    out
}

pub fn run<W: Write>(writer: &mut W, db: &Database, args: &AppsArgs) -> Result<()> {
    let data = generate_apps_data(db, args, Utc::now())?;
    if args.json {
        let json = serde_json::to_string_pretty(&data).context("failed to serialize apps")?;
        writeln!(writer, "{json}")?;
    } else {
        write!(writer, "{}", format_apps(&data))?;
    }
    Ok(())
}
