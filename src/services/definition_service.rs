use sqlx::PgPool;

use crate::config::EngineSettings;
use crate::definitions;
use crate::error::EngineError;
use crate::types::{CreateDefinitionParams, DefinitionStatus, WorkflowDefinition};

/// Service for definition authoring and lifecycle operations.
#[derive(Clone)]
pub struct DefinitionService {
    pool: PgPool,
    limits: EngineSettings,
}

impl DefinitionService {
    pub fn new(pool: PgPool, limits: EngineSettings) -> Self {
        Self { pool, limits }
    }

    /// Validate and store a new draft version.
    pub async fn create(
        &self,
        params: CreateDefinitionParams,
    ) -> Result<WorkflowDefinition, EngineError> {
        definitions::create_definition(&self.pool, params, &self.limits).await
    }

    /// Activate a draft, archiving the previously active version.
    pub async fn activate(&self, definition_id: &str) -> Result<WorkflowDefinition, EngineError> {
        definitions::activate_definition(&self.pool, definition_id, &self.limits).await
    }

    pub async fn archive(&self, definition_id: &str) -> Result<(), EngineError> {
        definitions::archive_definition(&self.pool, definition_id).await
    }

    pub async fn get(&self, definition_id: &str) -> Result<Option<WorkflowDefinition>, EngineError> {
        definitions::get_definition(&self.pool, definition_id).await
    }

    pub async fn get_active_by_name(
        &self,
        name: &str,
    ) -> Result<Option<WorkflowDefinition>, EngineError> {
        definitions::get_active_by_name(&self.pool, name).await
    }

    /// Pick the active definition applicable to a case.
    pub async fn find_active_for(
        &self,
        device_type: &str,
        service_type: &str,
        customer_tier: &str,
    ) -> Result<Option<WorkflowDefinition>, EngineError> {
        definitions::find_active_for(&self.pool, device_type, service_type, customer_tier).await
    }

    pub async fn list(
        &self,
        status: Option<DefinitionStatus>,
        limit: i32,
    ) -> Result<Vec<WorkflowDefinition>, EngineError> {
        definitions::list_definitions(&self.pool, status, limit).await
    }
}
