//! Usage tracker CLI library.
//!
//! This crate provides the CLI interface for the usage tracker.

mod cli;
pub mod commands;
mod config;
mod names;

pub use cli::{Cli, Commands};
pub use config::Config;
pub use names::{ConfigNameResolver, NameNotConfigured};
