//! Command-line argument definitions.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::commands::apps::AppsArgs;
use crate::commands::ingest::IngestArgs;
use crate::commands::report::ReportArgs;
use crate::commands::sync::SyncArgs;

/// Application usage tracker.
///
/// Records foreground lifecycle events and rolls them up into hourly and
/// daily usage totals per application.
#[derive(Debug, Parser)]
#[command(name = "ut", version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to config file.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Record a single lifecycle event.
    Ingest(IngestArgs),

    /// Import lifecycle events from JSONL on stdin.
    Import,

    /// Run one incremental sync pass over recorded events.
    Sync(SyncArgs),

    /// Show usage totals per hour or day.
    Report(ReportArgs),

    /// Show usage totals per application.
    Apps(AppsArgs),

    /// Show database and sync status.
    Status,
}
