//! CLI settings loaded from the environment.
//!
//! Settings use the `OPSRUN__` prefix with `__` as the separator, e.g.
//! `OPSRUN__STORE_PATH=/var/lib/opsrun/opsrun.db`. Command-line flags
//! override them per invocation.

use serde::Deserialize;
use std::path::PathBuf;

/// Environment-driven defaults for the CLI.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Path of the SQLite run store.
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,

    /// Prefix for scraping variables from the environment.
    #[serde(default = "default_var_prefix")]
    pub var_prefix: String,

    /// Bound on operator waits, in seconds.
    #[serde(default = "default_interactive_timeout_secs")]
    pub interactive_timeout_secs: u64,
}

fn default_store_path() -> PathBuf {
    PathBuf::from("opsrun.db")
}

fn default_var_prefix() -> String {
    "OPSRUN_VAR_".to_string()
}

fn default_interactive_timeout_secs() -> u64 {
    300
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            store_path: default_store_path(),
            var_prefix: default_var_prefix(),
            interactive_timeout_secs: default_interactive_timeout_secs(),
        }
    }
}

impl Settings {
    /// Loads settings from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error when a present variable cannot be parsed.
    pub fn from_env() -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(
                config::Environment::with_prefix("OPSRUN")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}
