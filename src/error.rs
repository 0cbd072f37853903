use serde::Serialize;
use thiserror::Error;

/// One accumulated validation violation.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ValidationIssue {
    pub field: String,
    pub code: String,
    pub message: String,
}

impl ValidationIssue {
    pub fn new(field: impl Into<String>, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Structural or business-rule violation in a candidate definition.
///
/// Carries every violation found in one pass; nothing is applied when
/// validation fails.
#[derive(Debug, Clone, Error)]
#[error("workflow definition validation failed with {} issue(s)", .issues.len())]
pub struct ValidationError {
    pub issues: Vec<ValidationIssue>,
}

/// An operation attempted against an instance or step not in the required
/// status. Aborts only the offending call; no state is mutated.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct PreconditionError {
    pub message: String,
}

impl PreconditionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// An automatic step's logic failed. Fails that step instance only.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct StepExecutionError {
    pub message: String,
}

impl StepExecutionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Public error surface of the engine and services.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Precondition(#[from] PreconditionError),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        EngineError::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn precondition(message: impl Into<String>) -> Self {
        EngineError::Precondition(PreconditionError::new(message))
    }
}
