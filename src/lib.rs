pub mod actions;
pub mod application;
pub mod cli;
pub mod conditions;
pub mod config;
pub mod db;
pub mod definitions;
pub mod engine;
pub mod error;
pub mod events;
pub mod instances;
pub mod services;
pub mod types;
pub mod validator;

// Re-export main types
pub use types::*;

// Re-export the application API for convenience
pub use application::{initialize, Application, InitBuilder, InitOptions};
pub use engine::{Engine, TimeoutWatcher};
pub use error::{EngineError, PreconditionError, StepExecutionError, ValidationError, ValidationIssue};
