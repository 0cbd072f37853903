//! Configuration loading for Cadence.
//!
//! Configuration is an explicit, immutable value threaded into the
//! application at construction. Sources, in increasing precedence:
//! built-in defaults, an optional TOML file (`CADENCE_CONFIG_PATH` or
//! `./cadence.toml`), `CADENCE__*` environment variables, and programmatic
//! overrides on the builder.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub max_lifetime_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
            min_connections: 1,
            acquire_timeout_secs: 30,
            idle_timeout_secs: 600,
            max_lifetime_secs: 1800,
        }
    }
}

/// Engine-wide limits and tuning knobs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Maximum number of steps a single definition may declare.
    pub max_steps_per_definition: usize,
    /// Upper bound on definition/step/transition name length.
    pub max_name_length: usize,
    /// Upper bound on definition description length.
    pub max_description_length: usize,
    /// Bound on a single action side effect (webhook, email, ...).
    pub action_timeout_secs: u64,
    /// Poll interval of the wait-step timeout watcher.
    pub timer_poll_interval_secs: u64,
    /// Priority assigned to instances started without one.
    pub default_priority: i32,
    /// Default page size for event-log reads.
    pub event_page_size: i32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_steps_per_definition: 50,
            max_name_length: 120,
            max_description_length: 2000,
            action_timeout_secs: 10,
            timer_poll_interval_secs: 5,
            default_priority: 5,
            event_page_size: 50,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub engine: EngineSettings,
}

impl Config {
    /// Load configuration from the default sources.
    pub fn load() -> Result<Self> {
        Self::builder().build()
    }

    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// The database URL, or an error naming how to set one.
    pub fn require_database_url(&self) -> Result<&str> {
        self.database
            .url
            .as_deref()
            .context("database URL not configured (set CADENCE_DATABASE_URL or database.url)")
    }
}

#[derive(Debug, Default)]
pub struct ConfigBuilder {
    database_url: Option<String>,
    config_path: Option<PathBuf>,
}

impl ConfigBuilder {
    /// Override the database URL (highest precedence).
    pub fn database_url(mut self, url: Option<String>) -> Self {
        self.database_url = url;
        self
    }

    /// Read the config file from an explicit path instead of the default search.
    pub fn config_path(mut self, path: Option<PathBuf>) -> Self {
        self.config_path = path;
        self
    }

    pub fn build(self) -> Result<Config> {
        dotenvy::dotenv().ok();

        let mut builder = config::Config::builder();

        let file = self
            .config_path
            .or_else(|| std::env::var("CADENCE_CONFIG_PATH").ok().map(PathBuf::from));
        match file {
            Some(path) => {
                builder = builder.add_source(config::File::from(path));
            }
            None => {
                builder = builder.add_source(config::File::with_name("cadence").required(false));
            }
        }

        builder = builder.add_source(config::Environment::with_prefix("CADENCE").separator("__"));

        let mut config: Config = builder
            .build()
            .context("Failed to read configuration sources")?
            .try_deserialize()
            .context("Failed to parse configuration")?;

        // Flat convenience variable, matching the documented quick-start.
        if config.database.url.is_none() {
            config.database.url = std::env::var("CADENCE_DATABASE_URL").ok();
        }
        if self.database_url.is_some() {
            config.database.url = self.database_url;
        }

        Ok(config)
    }
}
