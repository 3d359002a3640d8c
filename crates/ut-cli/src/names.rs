//! Display-name lookup backed by the `display_names` config table.

use std::collections::BTreeMap;

use thiserror::Error;
use ut_core::NameResolver;

#[derive(Debug, Error)]
#[error("no display name configured for {0}")]
pub struct NameNotConfigured(pub String);

pub struct ConfigNameResolver<'a> {
    names: &'a BTreeMap<String, String>,
}

impl<'a> ConfigNameResolver<'a> {
    pub const fn new(names: &'a BTreeMap<String, String>) -> Self {
        Self { names }
    }
}

impl NameResolver for ConfigNameResolver<'_> {
    type Error = NameNotConfigured;

    fn resolve_display_name(&self, entity_id: &str) -> Result<String, NameNotConfigured> {
        self.names
            .get(entity_id)
            .filter(|name| !name.trim().is_empty())
            .cloned()
            .ok_or_else(|| NameNotConfigured(entity_id.to_string()))
    }
}
