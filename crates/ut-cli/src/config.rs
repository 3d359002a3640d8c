//! Configuration loading and management.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};
use ut_core::SyncConfig;

/// Application configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct Config {
    /// Path to the database file.
    pub database_path: PathBuf,

    /// Each sync rescans from the checkpoint floored to this alignment.
    pub rescan_alignment_ms: i64,

    /// How close `--now` must be to the wall clock for currently
    /// foregrounded apps to count.
    pub live_tolerance_ms: i64,

    /// Display names by entity id, used when an entity is first seen.
    #[serde(default)]
    pub display_names: BTreeMap<String, String>,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("database_path", &self.database_path)
            .field("rescan_alignment_ms", &self.rescan_alignment_ms)
            .field("live_tolerance_ms", &self.live_tolerance_ms)
            .field("display_names", &self.display_names.len())
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs_data_path().unwrap_or_else(|| PathBuf::from("."));
        let sync = SyncConfig::default();
        Self {
            database_path: data_dir.join("ut.db"),
            rescan_alignment_ms: sync.rescan_alignment_ms,
            live_tolerance_ms: sync.live_tolerance_ms,
            display_names: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Loads configuration, optionally from a specific file.
    #[expect(
        clippy::result_large_err,
        reason = "figment::Error is large but only returned at startup"
    )]
    pub fn load_from(config_path: Option<&Path>) -> Result<Self, figment::Error> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        // Load from default config location
        if let Some(config_dir) = dirs_config_path() {
            figment = figment.merge(Toml::file(config_dir.join("config.toml")));
        }

        // Load from specified config file
        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }

        // Load from environment variables (UT_*)
        figment = figment.merge(Env::prefixed("UT_"));

        figment.extract()
    }

    /// Sync tuning derived from this configuration.
    pub const fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            rescan_alignment_ms: self.rescan_alignment_ms,
            live_tolerance_ms: self.live_tolerance_ms,
        }
    }

    /// Lock file serializing sync passes against this database.
    pub fn lock_path(&self) -> PathBuf {
        self.database_path.with_extension("lock")
    }
}

/// Returns the platform-specific config directory for ut.
fn dirs_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("ut"))
}

/// Returns the platform-specific data directory for ut.
///
/// On Linux: `~/.local/share/ut`
pub fn dirs_data_path() -> Option<PathBuf> {
    dirs::data_dir().map(|p| p.join("ut"))
}
