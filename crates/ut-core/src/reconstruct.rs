//! Session reconstruction.
//!
//! Turns a chronological stream of lifecycle transitions into closed
//! foreground intervals per entity.
//!
//! # Algorithm Summary
//!
//! 1. Walk the events once, tracking each `(entity, component)` pair as open
//!    (with its start time) or closed
//! 2. Deactivations close their pair; a deactivation with nothing open for
//!    the entity is a dangling close and starts at the window start
//! 3. A deactivation for a component that was never opened while a sibling
//!    component is open is discarded
//! 4. Suspend closes everything at that instant; resume forgets everything
//! 5. At the end, open pairs survive only for entities reported live

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::event::{self, LifecycleEvent, LifecycleKind, ValidationError};

/// An event suitable for session reconstruction.
///
/// This trait allows reconstruction to work with different event
/// representations (e.g., rows loaded from storage, or test fixtures).
pub trait TransitionEvent {
    /// Returns the tracked entity, empty for system-wide kinds.
    fn entity_id(&self) -> &str;

    /// Returns the component within the entity, if any.
    fn component_id(&self) -> Option<&str>;

    /// Returns the event time in UTC epoch milliseconds.
    fn timestamp_ms(&self) -> i64;

    /// Returns the transition kind.
    fn kind(&self) -> LifecycleKind;

    /// Returns the component of an activate/deactivate event, or why the
    /// event is malformed. Same rules as [`LifecycleEvent::validate`].
    fn checked_component(&self) -> Result<&str, ValidationError> {
        event::checked_component(self.kind(), self.entity_id(), self.component_id())
    }
}

impl TransitionEvent for LifecycleEvent {
    fn entity_id(&self) -> &str {
        &self.entity_id
    }

    fn component_id(&self) -> Option<&str> {
        self.component_id.as_deref()
    }

    fn timestamp_ms(&self) -> i64 {
        self.timestamp_ms
    }

    fn kind(&self) -> LifecycleKind {
        self.kind
    }
}

/// Half-open query window `[start_ms, end_ms)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub start_ms: i64,
    pub end_ms: i64,
}

impl Window {
    pub const fn new(start_ms: i64, end_ms: i64) -> Self {
        Self { start_ms, end_ms }
    }
}

/// A span during which an entity was continuously in the foreground.
///
/// Always satisfies `end_ms > start_ms`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ForegroundInterval {
    pub entity_id: String,
    pub start_ms: i64,
    pub end_ms: i64,
}

impl ForegroundInterval {
    pub fn new(entity_id: impl Into<String>, start_ms: i64, end_ms: i64) -> Self {
        Self {
            entity_id: entity_id.into(),
            start_ms,
            end_ms,
        }
    }
}

/// An input event that was skipped because it violated shape constraints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedEvent {
    /// Position of the event in the input sequence.
    pub index: usize,
    pub reason: ValidationError,
}

/// Output of a reconstruction pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconstruction {
    /// Closed intervals in emission order.
    pub intervals: Vec<ForegroundInterval>,

    /// Events skipped for missing entity/component ids.
    pub malformed: Vec<MalformedEvent>,

    /// Deactivations dropped because a sibling component was open.
    pub discarded_closes: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PairState {
    Open(i64),
    Closed,
}

impl PairState {
    const fn open_start(self) -> Option<i64> {
        match self {
            Self::Open(start) => Some(start),
            Self::Closed => None,
        }
    }
}

/// entity -> component -> state. Ordered maps keep emission deterministic.
type ActivePairs = BTreeMap<String, BTreeMap<String, PairState>>;

/// Reconstruct foreground intervals for a window.
///
/// Events must be in the order they were delivered by the source (non-decreasing
/// timestamps per `(entity, component)` pair).
///
/// # Arguments
///
/// * `events` - Events to process (must implement `TransitionEvent`)
/// * `window` - The window the events were fetched for
/// * `live_at_window_end` - Entities known to be foreground when the window ends
/// * `now_ms` - Wall-clock instant; open intervals never extend past it
pub fn reconstruct<E: TransitionEvent>(
    events: &[E],
    window: Window,
    live_at_window_end: &HashSet<String>,
    now_ms: i64,
) -> Reconstruction {
    let mut out = Reconstruction::default();
    let close_at = window.end_ms.min(now_ms);

    if events.is_empty() {
        let mut live: Vec<&String> = live_at_window_end.iter().collect();
        live.sort();
        for entity_id in live {
            push_interval(&mut out.intervals, entity_id, window.start_ms, close_at);
        }
        return out;
    }

    let mut active = ActivePairs::new();

    for (index, event) in events.iter().enumerate() {
        let t = event.timestamp_ms();
        match event.kind() {
            LifecycleKind::EntityActivated => {
                let component = match event.checked_component() {
                    Ok(c) => c,
                    Err(reason) => {
                        record_malformed(&mut out, index, reason);
                        continue;
                    }
                };
                active
                    .entry(event.entity_id().to_string())
                    .or_default()
                    .insert(component.to_string(), PairState::Open(t));
            }

            LifecycleKind::EntityDeactivated => {
                let component = match event.checked_component() {
                    Ok(c) => c,
                    Err(reason) => {
                        record_malformed(&mut out, index, reason);
                        continue;
                    }
                };
                close_component(&mut active, &mut out, window, event.entity_id(), component, t);
            }

            LifecycleKind::SystemSuspended => {
                for (entity_id, components) in &mut active {
                    if let Some(start) = earliest_open(components.values()) {
                        push_interval(&mut out.intervals, entity_id, start, t);
                    }
                    close_all(components);
                }
            }

            LifecycleKind::SystemResumed => {
                for components in active.values_mut() {
                    close_all(components);
                }
            }
        }
    }

    for (entity_id, components) in &active {
        let Some(start) = earliest_open(components.values()) else {
            continue;
        };
        if live_at_window_end.contains(entity_id) {
            push_interval(&mut out.intervals, entity_id, start, close_at);
        } else {
            tracing::debug!(entity_id = %entity_id, start, "dropping open session without close event");
        }
    }

    out
}

fn close_component(
    active: &mut ActivePairs,
    out: &mut Reconstruction,
    window: Window,
    entity_id: &str,
    component: &str,
    t: i64,
) {
    let components = active.entry(entity_id.to_string()).or_default();

    let siblings_open = earliest_open(
        components
            .iter()
            .filter(|(c, _)| c.as_str() != component)
            .map(|(_, state)| state),
    );
    let own_start = components.get(component).copied().and_then(PairState::open_start);

    match (own_start, siblings_open) {
        (Some(start), _) => {
            let end = siblings_open.map_or(t, |sibling| t.min(sibling));
            push_interval(&mut out.intervals, entity_id, start, end);
        }
        (None, None) => {
            // Entity was already foreground when the window opened.
            push_interval(&mut out.intervals, entity_id, window.start_ms, t);
        }
        (None, Some(_)) => {
            tracing::debug!(entity_id, component, t, "discarding unmatched close");
            out.discarded_closes += 1;
            return;
        }
    }
    components.insert(component.to_string(), PairState::Closed);
}

fn record_malformed(out: &mut Reconstruction, index: usize, reason: ValidationError) {
    tracing::warn!(index, error = %reason, "skipping malformed lifecycle event");
    out.malformed.push(MalformedEvent { index, reason });
}

fn earliest_open<'a>(states: impl Iterator<Item = &'a PairState>) -> Option<i64> {
    states.filter_map(|state| state.open_start()).min()
}

fn close_all(components: &mut BTreeMap<String, PairState>) {
    for state in components.values_mut() {
        *state = PairState::Closed;
    }
}

fn push_interval(intervals: &mut Vec<ForegroundInterval>, entity_id: &str, start: i64, end: i64) {
    if end > start {
        intervals.push(ForegroundInterval::new(entity_id, start, end));
    }
}
