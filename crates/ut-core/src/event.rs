//! Lifecycle events: the raw transitions usage is reconstructed from.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Kind of lifecycle transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleKind {
    EntityActivated,
    EntityDeactivated,
    SystemSuspended,
    SystemResumed,
}

impl LifecycleKind {
    /// Returns the canonical string representation used for storage.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::EntityActivated => "entity_activated",
            Self::EntityDeactivated => "entity_deactivated",
            Self::SystemSuspended => "system_suspended",
            Self::SystemResumed => "system_resumed",
        }
    }

    /// Whether events of this kind must name a component.
    #[must_use]
    pub const fn requires_component(&self) -> bool {
        matches!(self, Self::EntityActivated | Self::EntityDeactivated)
    }

    /// Whether this kind applies to the whole system rather than one entity.
    #[must_use]
    pub const fn is_system_wide(&self) -> bool {
        matches!(self, Self::SystemSuspended | Self::SystemResumed)
    }
}

impl fmt::Display for LifecycleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LifecycleKind {
    type Err = UnknownLifecycleKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "entity_activated" | "activated" | "resumed_activity" => Ok(Self::EntityActivated),
            "entity_deactivated" | "deactivated" | "paused_activity" => {
                Ok(Self::EntityDeactivated)
            }
            "system_suspended" | "suspended" | "device_shutdown" => Ok(Self::SystemSuspended),
            "system_resumed" | "resumed" | "device_startup" => Ok(Self::SystemResumed),
            _ => Err(UnknownLifecycleKind(s.to_string())),
        }
    }
}

impl Serialize for LifecycleKind {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for LifecycleKind {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Error type for unknown lifecycle kind strings.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown lifecycle kind: {0}")]
pub struct UnknownLifecycleKind(pub String);

/// Validation errors for lifecycle events.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// An activate/deactivate event did not name a component.
    #[error("{kind} event for {entity_id} is missing a component id")]
    MissingComponent {
        kind: LifecycleKind,
        entity_id: String,
    },

    /// An activate/deactivate event did not name an entity.
    #[error("{kind} event is missing an entity id")]
    MissingEntity { kind: LifecycleKind },
}

/// A single lifecycle transition.
///
/// `entity_id` and `component_id` are empty/absent for system-wide kinds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    #[serde(default)]
    pub entity_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component_id: Option<String>,
    pub timestamp_ms: i64,
    pub kind: LifecycleKind,
}

impl LifecycleEvent {
    pub fn activated(entity_id: &str, component_id: &str, timestamp_ms: i64) -> Self {
        Self {
            entity_id: entity_id.to_string(),
            component_id: Some(component_id.to_string()),
            timestamp_ms,
            kind: LifecycleKind::EntityActivated,
        }
    }

    pub fn deactivated(entity_id: &str, component_id: &str, timestamp_ms: i64) -> Self {
        Self {
            entity_id: entity_id.to_string(),
            component_id: Some(component_id.to_string()),
            timestamp_ms,
            kind: LifecycleKind::EntityDeactivated,
        }
    }

    pub const fn suspended(timestamp_ms: i64) -> Self {
        Self::system(LifecycleKind::SystemSuspended, timestamp_ms)
    }

    pub const fn resumed(timestamp_ms: i64) -> Self {
        Self::system(LifecycleKind::SystemResumed, timestamp_ms)
    }

    const fn system(kind: LifecycleKind, timestamp_ms: i64) -> Self {
        Self {
            entity_id: String::new(),
            component_id: None,
            timestamp_ms,
            kind,
        }
    }

    /// Checks the shape constraints the reconstructor relies on.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !self.kind.requires_component() {
            return Ok(());
        }
        checked_component(self.kind, &self.entity_id, self.component_id.as_deref()).map(|_| ())
    }
}

/// The component of an activate/deactivate transition, provided both the
/// entity and the component are non-blank.
pub(crate) fn checked_component<'a>(
    kind: LifecycleKind,
    entity_id: &str,
    component_id: Option<&'a str>,
) -> Result<&'a str, ValidationError> {
    if entity_id.trim().is_empty() {
        return Err(ValidationError::MissingEntity { kind });
    }
    match component_id {
        Some(c) if !c.trim().is_empty() => Ok(c),
        _ => Err(ValidationError::MissingComponent {
            kind,
            entity_id: entity_id.to_string(),
        }),
    }
}
