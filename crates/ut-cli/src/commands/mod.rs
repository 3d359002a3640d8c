//! CLI subcommand implementations.

pub mod apps;
pub mod import;
pub mod ingest;
pub mod report;
pub mod status;
pub mod sync;
pub mod util;
