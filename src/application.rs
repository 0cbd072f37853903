//! Application assembly for Cadence.
//!
//! Builds the configured application value - pool, engine, services - from
//! explicit options. No ambient globals: callers own the Application and
//! pass it (or pieces of it) down.

use anyhow::{Context, Result};
use sqlx::PgPool;
use std::sync::Arc;

use crate::actions::ActionTarget;
use crate::config::Config;
use crate::db;
use crate::engine::{Engine, TimeoutWatcher};
use crate::services::{DefinitionService, EventService};

/// The Cadence application instance with all services.
pub struct Application {
    pub config: Config,
    pub pool: PgPool,
    pub engine: Engine,
    pub definition_service: DefinitionService,
    pub event_service: EventService,
}

impl Application {
    /// Create a new Application instance (pure instantiation, no I/O).
    pub fn new(config: Config, pool: PgPool) -> Self {
        let engine = Engine::new(pool.clone(), config.engine.clone());
        Self {
            definition_service: DefinitionService::new(pool.clone(), config.engine.clone()),
            event_service: EventService::new(pool.clone(), config.engine.event_page_size),
            engine,
            pool,
            config,
        }
    }

    /// Same, but delivering action side effects to a custom target.
    pub fn with_action_target(config: Config, pool: PgPool, target: Arc<dyn ActionTarget>) -> Self {
        let engine = Engine::with_action_target(pool.clone(), config.engine.clone(), target);
        Self {
            definition_service: DefinitionService::new(pool.clone(), config.engine.clone()),
            event_service: EventService::new(pool.clone(), config.engine.event_page_size),
            engine,
            pool,
            config,
        }
    }

    /// A watcher bound to this application's engine.
    pub fn timeout_watcher(&self) -> TimeoutWatcher {
        TimeoutWatcher::new(self.engine.clone())
    }
}

/// Options for initializing Cadence.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// Database URL (overrides config file and env vars)
    pub database_url: Option<String>,

    /// Config file path (overrides default search)
    pub config_path: Option<String>,

    /// Whether to run migrations during initialization
    pub auto_migrate: bool,
}

impl Default for InitOptions {
    fn default() -> Self {
        Self {
            database_url: None,
            config_path: None,
            auto_migrate: true,
        }
    }
}

/// Builder for constructing InitOptions.
pub struct InitBuilder {
    options: InitOptions,
}

impl InitBuilder {
    pub fn new() -> Self {
        Self {
            options: InitOptions::default(),
        }
    }

    pub fn database_url(mut self, url: impl Into<String>) -> Self {
        self.options.database_url = Some(url.into());
        self
    }

    pub fn config_path(mut self, path: impl Into<String>) -> Self {
        self.options.config_path = Some(path.into());
        self
    }

    pub fn auto_migrate(mut self, auto: bool) -> Self {
        self.options.auto_migrate = auto;
        self
    }

    pub async fn init(self) -> Result<Application> {
        initialize(self.options).await
    }
}

impl Default for InitBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Initialize Cadence and return an Application instance.
pub async fn initialize(options: InitOptions) -> Result<Application> {
    let config = Config::builder()
        .database_url(options.database_url)
        .config_path(options.config_path.map(std::path::PathBuf::from))
        .build()?;

    let pool = db::create_pool(&config.database).await?;

    if options.auto_migrate {
        db::migrate(&pool)
            .await
            .context("Failed to run automatic migrations")?;
    }

    Ok(Application::new(config, pool))
}
