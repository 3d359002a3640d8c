//! Ingest command for recording a single lifecycle event.
//!
//! Each event gets a deterministic ID derived from its kind, time, entity
//! and component, so replaying a hook is harmless.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Args;

use ut_core::{LifecycleEvent, LifecycleKind};
use ut_db::{Database, EventRecord};

use crate::commands::util::parse_millis_or;

#[derive(Debug, Args)]
pub struct IngestArgs {
    /// Event kind: activated, deactivated, suspended or resumed.
    pub kind: LifecycleKind,

    /// Application (entity) id, required for activated/deactivated.
    #[arg(long)]
    pub entity: Option<String>,

    /// Component id within the application, required for activated/deactivated.
    #[arg(long)]
    pub component: Option<String>,

    /// When the transition happened (RFC 3339 or e.g. "5 minutes ago"). Defaults to now.
    #[arg(long)]
    pub at: Option<String>,
}

/// Builds and validates the event described by `args`.
pub fn build_event(args: &IngestArgs, now: DateTime<Utc>) -> Result<LifecycleEvent> {
    let timestamp_ms = parse_millis_or(args.at.as_deref(), now)?;
    let event = if args.kind.is_system_wide() {
        if args.entity.is_some() || args.component.is_some() {
            tracing::debug!(kind = %args.kind, "ignoring entity/component for system-wide event");
        }
        LifecycleEvent {
            entity_id: String::new(),
            component_id: None,
            timestamp_ms,
            kind: args.kind,
        }
    } else {
        LifecycleEvent {
            entity_id: args.entity.clone().unwrap_or_default(),
            component_id: args.component.clone(),
            timestamp_ms,
            kind: args.kind,
        }
    };
    event.validate().context("invalid event")?;
    Ok(event)
}

/// Records one event. Returns `false` if it was already recorded.
pub fn run(db: &mut Database, args: &IngestArgs) -> Result<bool> {
    let event = build_event(args, Utc::now())?;
    let record = EventRecord::from_event(&event);
    let inserted = db
        .insert_events(std::slice::from_ref(&record))
        .context("failed to record event")?;

    if inserted == 0 {
        tracing::debug!(event_id = %record.id, "event already recorded");
    } else {
        tracing::info!(event_id = %record.id, "ingested lifecycle event");
    }
    Ok(inserted > 0)
}
