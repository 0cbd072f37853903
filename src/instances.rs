// Instance and step-instance row access.
//
// Row-level operations used by the engine inside its per-instance
// transaction: locked instance reads, guarded step status moves, context
// updates and hydration queries. Status guards live in the SQL WHERE
// clauses so an update that lost the race simply affects zero rows.

use serde_json::Value as JsonValue;
use sqlx::postgres::PgRow;
use sqlx::{PgExecutor, Row};

use crate::error::EngineError;
use crate::types::{
    InstanceListFilter, InstanceStatus, StepInstanceStatus, WorkflowInstance, WorkflowStepInstance,
};

pub async fn insert_instance(
    executor: impl PgExecutor<'_>,
    instance: &WorkflowInstance,
) -> Result<(), EngineError> {
    sqlx::query(
        r#"
        INSERT INTO workflow_instances (
            id, definition_id, definition_version, case_ref, status,
            priority, context, started_by, started_at, completed_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        "#,
    )
    .bind(&instance.id)
    .bind(&instance.definition_id)
    .bind(instance.definition_version)
    .bind(&instance.case_ref)
    .bind(instance.status)
    .bind(instance.priority)
    .bind(&instance.context)
    .bind(&instance.started_by)
    .bind(instance.started_at)
    .bind(instance.completed_at)
    .execute(executor)
    .await?;

    Ok(())
}

pub async fn get_instance(
    executor: impl PgExecutor<'_>,
    instance_id: &str,
) -> Result<Option<WorkflowInstance>, EngineError> {
    let row = sqlx::query(
        r#"
        SELECT * FROM workflow_instances WHERE id = $1
        "#,
    )
    .bind(instance_id)
    .fetch_optional(executor)
    .await?;

    Ok(row.map(decode_instance))
}

/// Locked instance read: the per-instance serialization point. Every
/// state-mutating engine call acquires this row lock first, so step
/// completions, transition scans and the terminal completion check are
/// single-writer per instance.
pub async fn get_instance_for_update(
    executor: impl PgExecutor<'_>,
    instance_id: &str,
) -> Result<Option<WorkflowInstance>, EngineError> {
    let row = sqlx::query(
        r#"
        SELECT * FROM workflow_instances WHERE id = $1 FOR UPDATE
        "#,
    )
    .bind(instance_id)
    .fetch_optional(executor)
    .await?;

    Ok(row.map(decode_instance))
}

pub async fn update_instance_status(
    executor: impl PgExecutor<'_>,
    instance_id: &str,
    status: InstanceStatus,
    set_completed_at: bool,
) -> Result<(), EngineError> {
    if set_completed_at {
        sqlx::query(
            r#"
            UPDATE workflow_instances
            SET status = $1,
                completed_at = NOW()
            WHERE id = $2
            "#,
        )
        .bind(status)
        .bind(instance_id)
        .execute(executor)
        .await?;
    } else {
        sqlx::query(
            r#"
            UPDATE workflow_instances
            SET status = $1
            WHERE id = $2
            "#,
        )
        .bind(status)
        .bind(instance_id)
        .execute(executor)
        .await?;
    }

    Ok(())
}

pub async fn update_context(
    executor: impl PgExecutor<'_>,
    instance_id: &str,
    context: &JsonValue,
) -> Result<(), EngineError> {
    sqlx::query(
        r#"
        UPDATE workflow_instances
        SET context = $1
        WHERE id = $2
        "#,
    )
    .bind(context)
    .bind(instance_id)
    .execute(executor)
    .await?;

    Ok(())
}

/// List instances with filters.
pub async fn list_instances(
    executor: impl PgExecutor<'_>,
    filter: &InstanceListFilter,
    default_limit: i32,
) -> Result<Vec<WorkflowInstance>, EngineError> {
    let mut query = String::from("SELECT * FROM workflow_instances WHERE 1=1");

    if filter.definition_id.is_some() {
        query.push_str(" AND definition_id = $1");
    }
    if filter.status.is_some() {
        let param_num = if filter.definition_id.is_some() { 2 } else { 1 };
        query.push_str(&format!(" AND status = ${}", param_num));
    }

    query.push_str(" ORDER BY started_at DESC");

    let param_num = 1
        + usize::from(filter.definition_id.is_some())
        + usize::from(filter.status.is_some());
    query.push_str(&format!(" LIMIT ${}", param_num));

    let mut q = sqlx::query(&query);
    if let Some(ref definition_id) = filter.definition_id {
        q = q.bind(definition_id);
    }
    if let Some(status) = filter.status {
        q = q.bind(status);
    }
    q = q.bind(filter.limit.unwrap_or(default_limit));

    let rows = q.fetch_all(executor).await?;
    Ok(rows.into_iter().map(decode_instance).collect())
}

pub async fn insert_step_instance(
    executor: impl PgExecutor<'_>,
    step: &WorkflowStepInstance,
) -> Result<(), EngineError> {
    sqlx::query(
        r#"
        INSERT INTO workflow_step_instances (
            id, instance_id, step_index, step_name, step_type, config,
            status, activated_by, activated_at, completed_by, completed_at,
            execution_data, comment, error_message
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
        "#,
    )
    .bind(&step.id)
    .bind(&step.instance_id)
    .bind(step.step_index)
    .bind(&step.step_name)
    .bind(step.step_type)
    .bind(serde_json::to_value(&step.config)?)
    .bind(step.status)
    .bind(&step.activated_by)
    .bind(step.activated_at)
    .bind(&step.completed_by)
    .bind(step.completed_at)
    .bind(&step.execution_data)
    .bind(&step.comment)
    .bind(&step.error_message)
    .execute(executor)
    .await?;

    Ok(())
}

pub async fn get_step_instance(
    executor: impl PgExecutor<'_>,
    step_instance_id: &str,
) -> Result<Option<WorkflowStepInstance>, EngineError> {
    let row = sqlx::query(
        r#"
        SELECT * FROM workflow_step_instances WHERE id = $1
        "#,
    )
    .bind(step_instance_id)
    .fetch_optional(executor)
    .await?;

    row.map(decode_step_instance).transpose()
}

/// All step instances of an instance, in definition order.
pub async fn list_step_instances(
    executor: impl PgExecutor<'_>,
    instance_id: &str,
) -> Result<Vec<WorkflowStepInstance>, EngineError> {
    let rows = sqlx::query(
        r#"
        SELECT * FROM workflow_step_instances
        WHERE instance_id = $1
        ORDER BY step_index ASC
        "#,
    )
    .bind(instance_id)
    .fetch_all(executor)
    .await?;

    rows.into_iter().map(decode_step_instance).collect()
}

/// Move a pending step to active. Returns None when the step was not
/// pending (already activated through another path, or finished) - the
/// caller treats that as a no-op.
pub async fn activate_step(
    executor: impl PgExecutor<'_>,
    instance_id: &str,
    step_name: &str,
    actor: &str,
) -> Result<Option<WorkflowStepInstance>, EngineError> {
    let row = sqlx::query(
        r#"
        UPDATE workflow_step_instances
        SET status = 'active',
            activated_by = $1,
            activated_at = NOW()
        WHERE instance_id = $2
          AND step_name = $3
          AND status = 'pending'
        RETURNING *
        "#,
    )
    .bind(actor)
    .bind(instance_id)
    .bind(step_name)
    .fetch_optional(executor)
    .await?;

    row.map(decode_step_instance).transpose()
}

/// Complete an active step, recording actor, execution data and comment.
/// Returns None when the step is no longer active.
pub async fn complete_step(
    executor: impl PgExecutor<'_>,
    instance_id: &str,
    step_name: &str,
    actor: &str,
    execution_data: &JsonValue,
    comment: Option<&str>,
) -> Result<Option<WorkflowStepInstance>, EngineError> {
    let row = sqlx::query(
        r#"
        UPDATE workflow_step_instances
        SET status = 'completed',
            completed_by = $1,
            completed_at = NOW(),
            execution_data = $2,
            comment = $3
        WHERE instance_id = $4
          AND step_name = $5
          AND status = 'active'
        RETURNING *
        "#,
    )
    .bind(actor)
    .bind(execution_data)
    .bind(comment)
    .bind(instance_id)
    .bind(step_name)
    .fetch_optional(executor)
    .await?;

    row.map(decode_step_instance).transpose()
}

/// Fail an active step, capturing the error. The instance and sibling
/// branches are unaffected.
pub async fn fail_step(
    executor: impl PgExecutor<'_>,
    step_instance_id: &str,
    error_message: &str,
) -> Result<(), EngineError> {
    sqlx::query(
        r#"
        UPDATE workflow_step_instances
        SET status = 'failed',
            completed_at = NOW(),
            error_message = $1
        WHERE id = $2
          AND status = 'active'
        "#,
    )
    .bind(error_message)
    .bind(step_instance_id)
    .execute(executor)
    .await?;

    Ok(())
}

/// Bulk status move for suspend/resume/cancel.
pub async fn move_steps(
    executor: impl PgExecutor<'_>,
    instance_id: &str,
    from: StepInstanceStatus,
    to: StepInstanceStatus,
) -> Result<u64, EngineError> {
    let result = sqlx::query(
        r#"
        UPDATE workflow_step_instances
        SET status = $1
        WHERE instance_id = $2
          AND status = $3
        "#,
    )
    .bind(to)
    .bind(instance_id)
    .bind(from)
    .execute(executor)
    .await?;

    Ok(result.rows_affected())
}

/// Steps currently counting toward "is this instance still running".
pub async fn count_active_steps(
    executor: impl PgExecutor<'_>,
    instance_id: &str,
) -> Result<i64, EngineError> {
    let count: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM workflow_step_instances
        WHERE instance_id = $1
          AND status = 'active'
        "#,
    )
    .bind(instance_id)
    .fetch_one(executor)
    .await?;

    Ok(count)
}

fn decode_instance(row: PgRow) -> WorkflowInstance {
    WorkflowInstance {
        id: row.get("id"),
        definition_id: row.get("definition_id"),
        definition_version: row.get("definition_version"),
        case_ref: row.get("case_ref"),
        status: row.get("status"),
        priority: row.get("priority"),
        context: row.get("context"),
        started_by: row.get("started_by"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
    }
}

fn decode_step_instance(row: PgRow) -> Result<WorkflowStepInstance, EngineError> {
    let config: JsonValue = row.get("config");
    Ok(WorkflowStepInstance {
        id: row.get("id"),
        instance_id: row.get("instance_id"),
        step_index: row.get("step_index"),
        step_name: row.get("step_name"),
        step_type: row.get("step_type"),
        config: serde_json::from_value(config)?,
        status: row.get("status"),
        activated_by: row.get("activated_by"),
        activated_at: row.get("activated_at"),
        completed_by: row.get("completed_by"),
        completed_at: row.get("completed_at"),
        execution_data: row.get("execution_data"),
        comment: row.get("comment"),
        error_message: row.get("error_message"),
    })
}
