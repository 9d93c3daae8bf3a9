//! Configuration loading and management.

use std::fmt;
use std::path::{Path, PathBuf};

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};
use us_core::{AggregationConfig, EventSchema, OverlayPolicy};

/// Application configuration.
///
/// Durations are kept in minutes here, the way administrators enter them.
#[derive(Clone, Serialize, Deserialize)]
pub struct Config {
    /// Path to the database file.
    pub database_path: PathBuf,
    /// Largest gap still counted as continuous work, in minutes.
    pub threshold: i64,
    /// Time credited to the last event of a session, in minutes.
    pub last_ping_credit: i64,
    #[serde(default)]
    pub capture_modules: Vec<String>,
    #[serde(default)]
    pub ignore_modules: Vec<String>,
    /// Credited times replace measured times instead of raising them.
    #[serde(default)]
    pub strict_credits: bool,
    /// Declared times replace measured times instead of raising them.
    #[serde(default)]
    pub strict_declared: bool,
    /// Log model to read; absent disables event reads.
    pub schema: Option<EventSchema>,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("database_path", &self.database_path)
            .field("threshold", &self.threshold)
            .field("last_ping_credit", &self.last_ping_credit)
            .field("schema", &self.schema)
            .finish_non_exhaustive()
    }
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs_data_path().unwrap_or_else(|| PathBuf::from("."));
        Self {
            database_path: data_dir.join("use-stats.db"),
            threshold: 15,
            last_ping_credit: 15,
            capture_modules: Vec::new(),
            ignore_modules: Vec::new(),
            strict_credits: false,
            strict_declared: false,
            schema: Some(EventSchema::Standard),
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

        if let Some(config_dir) = dirs_config_path() {
            figment = figment.merge(Toml::file(config_dir.join("config.toml")));
        }

        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }

        // USE_STATS_THRESHOLD, USE_STATS_SCHEMA, ...
        figment = figment.merge(Env::prefixed("USE_STATS_"));

        figment.extract()
    }

    /// Aggregation settings with durations converted to seconds.
    pub fn aggregation(&self) -> AggregationConfig {
        AggregationConfig {
            capture_modules: self.capture_modules.clone(),
            ignore_modules: self.ignore_modules.clone(),
            ..AggregationConfig::from_minutes(self.threshold, self.last_ping_credit)
        }
    }

    pub const fn overlay_policy(&self) -> OverlayPolicy {
        OverlayPolicy::from_flags(self.strict_credits, self.strict_declared)
    }
}

/// Returns the platform-specific config directory for use-stats.
fn dirs_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("use-stats"))
}

/// Returns the platform-specific data directory for use-stats.
///
/// On Linux: `~/.local/share/use-stats`
pub fn dirs_data_path() -> Option<PathBuf> {
    dirs::data_dir().map(|p| p.join("use-stats"))
}
