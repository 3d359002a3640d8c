//! Report command for hourly and daily usage totals.
//!
//! This module implements `ut report` with hourly (default) or daily
//! buckets and output formats (human-readable, JSON).

use std::fmt::Write as _;
use std::io::Write;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Args;
use serde::Serialize;

use ut_core::rollup::{entity_usage_totals, usage_totals};
use ut_core::{BucketWidth, DAY_MS, UsageTotal};
use ut_db::Database;

use crate::commands::util::{
    format_bucket_start, format_duration, format_millis, progress_bar, resolve_range,
};

#[derive(Debug, Args)]
pub struct ReportArgs {
    /// One row per hour (default).
    #[arg(long, conflicts_with = "daily")]
    pub hourly: bool,

    /// One row per day.
    #[arg(long)]
    pub daily: bool,

    /// Range start (RFC 3339 or e.g. "2 days ago"). Defaults to one day
    /// before the end, or a week for `--daily`.
    #[arg(long)]
    pub start: Option<String>,

    /// Range end (exclusive). Defaults to now.
    #[arg(long)]
    pub end: Option<String>,

    /// Only count usage of this application.
    #[arg(long)]
    pub entity: Option<String>,

    /// Output as JSON.
    #[arg(long)]
    pub json: bool,
}

impl ReportArgs {
    pub const fn width(&self) -> BucketWidth {
        if self.daily {
            BucketWidth::Day
        } else {
            BucketWidth::Hour
        }
    }

    const fn default_span_ms(&self) -> i64 {
        match self.width() {
            BucketWidth::Hour => DAY_MS,
            BucketWidth::Day => 7 * DAY_MS,
        }
    }
}

/// Computed report data.
#[derive(Debug, Serialize)]
pub struct ReportData {
    pub generated_at: DateTime<Utc>,
    pub granularity: BucketWidth,
    pub start_ms: i64,
    pub end_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    pub total_duration_ms: i64,
    pub buckets: Vec<UsageTotal>,
}

/// Generates report data from the database.
pub fn generate_report_data(
    db: &Database,
    args: &ReportArgs,
    generated_at: DateTime<Utc>,
) -> Result<ReportData> {
    let width = args.width();
    let (start_ms, end_ms) = resolve_range(
        args.start.as_deref(),
        args.end.as_deref(),
        args.default_span_ms(),
        generated_at,
    )?;

    let buckets = match args.entity.as_deref() {
        Some(entity_id) => entity_usage_totals(db, entity_id, width, start_ms, end_ms),
        None => usage_totals(db, width, start_ms, end_ms),
    }
    .context("failed to query usage buckets")?;

    Ok(ReportData {
        generated_at,
        granularity: width,
        start_ms,
        end_ms,
        entity_id: args.entity.clone(),
        total_duration_ms: buckets.iter().map(|b| b.total_duration_ms).sum(),
        buckets,
    })
}

/// Formats the report as a human-readable table.
pub fn format_report(data: &ReportData) -> String {
    let mut out = String::new();
    let scope = data.entity_id.as_deref().unwrap_or("all applications");
    let _ = writeln!(
        out,
        "Usage by {} for {scope} ({} to {})",
        data.granularity.as_str(),
        format_millis(data.start_ms),
        format_millis(data.end_ms)
    );
    out.push('\n');

    if data.buckets.is_empty() {
        out.push_str("No usage recorded.\n");
        return out;
    }

    let max = data
        .buckets
        .iter()
        .map(|b| b.total_duration_ms)
        .max()
        .unwrap_or(0);
    for bucket in &data.buckets {
        let _ = writeln!(
            out,
            "{:<16}  {}  {:>7}  ({} activations)",
            format_bucket_start(bucket.bucket_start_ms, data.granularity),
            progress_bar(bucket.total_duration_ms, max),
            format_duration(bucket.total_duration_ms),
            bucket.total_count
        );
    }
    out.push('\n');
    let _ = writeln!(out, "Total: {}", format_duration(data.total_duration_ms));
    out
}

pub fn run<W: Write>(writer: &mut W, db: &Database, args: &ReportArgs) -> Result<()> {
    let data = generate_report_data(db, args, Utc::now())?;
    if args.json {
        let json = serde_json::to_string_pretty(&data).context("failed to serialize report")?;
        writeln!(writer, "{json}")?;
    } else {
        write!(writer, "{}", format_report(&data))?;
    }
    Ok(())
}
