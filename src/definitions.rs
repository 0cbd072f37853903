// Definition management module
//
// Stores versioned workflow definitions and drives their lifecycle:
// draft creation (validated, version = max for the name + 1), activation
// (activation-time validation, prior active version archived atomically)
// and archival. Definitions are immutable once created; the step graph is
// persisted as one JSONB document on the definition row.

use chrono::Utc;
use serde_json::{json, Value as JsonValue};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::config::EngineSettings;
use crate::error::EngineError;
use crate::types::{CreateDefinitionParams, DefinitionStatus, WorkflowDefinition};
use crate::validator;

/// Validate and store a new draft definition. The version is one past the
/// highest existing version for the same name.
pub async fn create_definition(
    pool: &PgPool,
    params: CreateDefinitionParams,
    limits: &EngineSettings,
) -> Result<WorkflowDefinition, EngineError> {
    validator::into_result(validator::validate(&params, limits))?;

    let mut tx = pool.begin().await?;

    let version: i32 = sqlx::query_scalar(
        r#"
        SELECT COALESCE(MAX(version), 0) + 1
        FROM workflow_definitions
        WHERE name = $1
        "#,
    )
    .bind(&params.name)
    .fetch_one(&mut *tx)
    .await?;

    let definition = WorkflowDefinition {
        id: Uuid::new_v4().to_string(),
        name: params.name,
        description: params.description,
        version,
        status: DefinitionStatus::Draft,
        device_types: params.device_types,
        service_types: params.service_types,
        customer_tiers: params.customer_tiers,
        steps: params.steps,
        metadata: if params.metadata.is_null() {
            json!({})
        } else {
            params.metadata
        },
        created_by: params.created_by,
        created_at: Utc::now(),
    };

    sqlx::query(
        r#"
        INSERT INTO workflow_definitions (
            id, name, description, version, status,
            device_types, service_types, customer_tiers,
            steps, metadata, created_by, created_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        "#,
    )
    .bind(&definition.id)
    .bind(&definition.name)
    .bind(&definition.description)
    .bind(definition.version)
    .bind(definition.status)
    .bind(&definition.device_types)
    .bind(&definition.service_types)
    .bind(&definition.customer_tiers)
    .bind(serde_json::to_value(&definition.steps)?)
    .bind(&definition.metadata)
    .bind(&definition.created_by)
    .bind(definition.created_at)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    Ok(definition)
}

/// Get a definition by ID.
pub async fn get_definition(
    pool: &PgPool,
    definition_id: &str,
) -> Result<Option<WorkflowDefinition>, EngineError> {
    let row = sqlx::query(
        r#"
        SELECT * FROM workflow_definitions WHERE id = $1
        "#,
    )
    .bind(definition_id)
    .fetch_optional(pool)
    .await?;

    row.map(decode_definition).transpose()
}

/// Get the active version for a definition name.
pub async fn get_active_by_name(
    pool: &PgPool,
    name: &str,
) -> Result<Option<WorkflowDefinition>, EngineError> {
    let row = sqlx::query(
        r#"
        SELECT * FROM workflow_definitions
        WHERE name = $1
          AND status = 'active'
        "#,
    )
    .bind(name)
    .fetch_optional(pool)
    .await?;

    row.map(decode_definition).transpose()
}

/// Pick the active definition applicable to a case, by its device type,
/// service type and customer tier. Highest version wins when several match.
pub async fn find_active_for(
    pool: &PgPool,
    device_type: &str,
    service_type: &str,
    customer_tier: &str,
) -> Result<Option<WorkflowDefinition>, EngineError> {
    let row = sqlx::query(
        r#"
        SELECT * FROM workflow_definitions
        WHERE status = 'active'
          AND $1 = ANY(device_types)
          AND $2 = ANY(service_types)
          AND $3 = ANY(customer_tiers)
        ORDER BY version DESC
        LIMIT 1
        "#,
    )
    .bind(device_type)
    .bind(service_type)
    .bind(customer_tier)
    .fetch_optional(pool)
    .await?;

    row.map(decode_definition).transpose()
}

/// List definitions, optionally filtered by status.
pub async fn list_definitions(
    pool: &PgPool,
    status: Option<DefinitionStatus>,
    limit: i32,
) -> Result<Vec<WorkflowDefinition>, EngineError> {
    let rows = match status {
        Some(status) => {
            sqlx::query(
                r#"
                SELECT * FROM workflow_definitions
                WHERE status = $1
                ORDER BY name ASC, version DESC
                LIMIT $2
                "#,
            )
            .bind(status)
            .bind(limit)
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query(
                r#"
                SELECT * FROM workflow_definitions
                ORDER BY name ASC, version DESC
                LIMIT $1
                "#,
            )
            .bind(limit)
            .fetch_all(pool)
            .await?
        }
    };

    rows.into_iter().map(decode_definition).collect()
}

/// Activate a draft definition. Runs activation-time validation, then
/// archives whichever version of the same name is currently active and
/// promotes this one, in a single transaction. Activating the already
/// active version is a no-op.
pub async fn activate_definition(
    pool: &PgPool,
    definition_id: &str,
    limits: &EngineSettings,
) -> Result<WorkflowDefinition, EngineError> {
    let mut tx = pool.begin().await?;

    let row = sqlx::query(
        r#"
        SELECT * FROM workflow_definitions WHERE id = $1 FOR UPDATE
        "#,
    )
    .bind(definition_id)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or_else(|| EngineError::not_found("workflow definition", definition_id))?;

    let mut definition = decode_definition(row)?;
    match definition.status {
        DefinitionStatus::Active => return Ok(definition),
        DefinitionStatus::Archived => {
            return Err(EngineError::precondition(format!(
                "definition '{}' v{} is archived and cannot be activated",
                definition.name, definition.version
            )))
        }
        DefinitionStatus::Draft => {}
    }

    validator::into_result(validator::validate_for_activation(&definition, limits))?;

    sqlx::query(
        r#"
        UPDATE workflow_definitions
        SET status = 'archived'
        WHERE name = $1
          AND status = 'active'
          AND id != $2
        "#,
    )
    .bind(&definition.name)
    .bind(definition_id)
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        UPDATE workflow_definitions
        SET status = 'active'
        WHERE id = $1
        "#,
    )
    .bind(definition_id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    definition.status = DefinitionStatus::Active;
    Ok(definition)
}

/// Archive a definition. New instances can no longer be started from it;
/// running instances are unaffected.
pub async fn archive_definition(pool: &PgPool, definition_id: &str) -> Result<(), EngineError> {
    let result = sqlx::query(
        r#"
        UPDATE workflow_definitions
        SET status = 'archived'
        WHERE id = $1
          AND status IN ('draft', 'active')
        "#,
    )
    .bind(definition_id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(EngineError::not_found("workflow definition", definition_id));
    }
    Ok(())
}

fn decode_definition(row: PgRow) -> Result<WorkflowDefinition, EngineError> {
    let steps: JsonValue = row.get("steps");
    Ok(WorkflowDefinition {
        id: row.get("id"),
        name: row.get("name"),
        description: row.get("description"),
        version: row.get("version"),
        status: row.get("status"),
        device_types: row.get("device_types"),
        service_types: row.get("service_types"),
        customer_tiers: row.get("customer_tiers"),
        steps: serde_json::from_value(steps)?,
        metadata: row.get("metadata"),
        created_by: row.get("created_by"),
        created_at: row.get("created_at"),
    })
}
