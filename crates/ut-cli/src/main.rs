use std::io::{self, Write};
use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use ut_cli::commands::{apps, import, ingest, report, status, sync};
use ut_cli::{Cli, Commands, Config};

/// Load config and open database, ensuring the parent directory exists.
fn open_database(config_path: Option<&Path>) -> Result<(ut_db::Database, Config)> {
    let config = Config::load_from(config_path).context("failed to load configuration")?;
    tracing::debug!(?config, "loaded configuration");

    if let Some(parent) = config.database_path.parent() {
        std::fs::create_dir_all(parent).context("failed to create database directory")?;
    }

    let db = ut_db::Database::open(&config.database_path)
        .with_context(|| format!("failed to open {}", config.database_path.display()))?;
    Ok((db, config))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing with verbose flag support
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env()
    };
    // Use try_init to avoid panic if tracing is already initialized (e.g., in tests)
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();

    let mut stdout = io::stdout().lock();
    match &cli.command {
        Some(Commands::Ingest(args)) => {
            let (mut db, _config) = open_database(cli.config.as_deref())?;
            ingest::run(&mut db, args)?;
        }
        Some(Commands::Import) => {
            let (mut db, _config) = open_database(cli.config.as_deref())?;
            let inserted = import::run(&mut db, io::stdin().lock())?;
            writeln!(stdout, "Imported {inserted} events")?;
        }
        Some(Commands::Sync(args)) => {
            let (db, config) = open_database(cli.config.as_deref())?;
            let result = sync::run(&db, &config, args)?;
            sync::write_summary(&mut stdout, &result)?;
        }
        Some(Commands::Report(args)) => {
            let (db, _config) = open_database(cli.config.as_deref())?;
            report::run(&mut stdout, &db, args)?;
        }
        Some(Commands::Apps(args)) => {
            let (db, _config) = open_database(cli.config.as_deref())?;
            apps::run(&mut stdout, &db, args)?;
        }
        Some(Commands::Status) => {
            let (db, config) = open_database(cli.config.as_deref())?;
            status::run(&mut stdout, &db, &config)?;
        }
        None => {
            // No subcommand, show help
            use clap::CommandFactory;
            Cli::command().print_help()?;
            println!();
        }
    }

    Ok(())
}
