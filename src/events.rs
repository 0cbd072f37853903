// Workflow event log.
//
// Append-only audit trail. Appends are fire-and-forget: the engine buffers
// events during a state-mutating call and flushes them after commit; a
// failed write is logged and swallowed, never surfaced into engine control
// flow. Reads (filtered listing, per-day timeline, summary statistics)
// serve external monitoring collaborators.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::{PgExecutor, PgPool, Row};
use uuid::Uuid;

use crate::error::EngineError;
use crate::types::{EventFilter, EventType, WorkflowEvent};

/// An event waiting to be appended.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub instance_id: String,
    pub step_instance_id: Option<String>,
    pub event_type: EventType,
    pub payload: JsonValue,
    pub actor: Option<String>,
}

impl NewEvent {
    pub fn instance(
        instance_id: impl Into<String>,
        event_type: EventType,
        payload: JsonValue,
        actor: Option<String>,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            step_instance_id: None,
            event_type,
            payload,
            actor,
        }
    }

    pub fn step(
        instance_id: impl Into<String>,
        step_instance_id: impl Into<String>,
        event_type: EventType,
        payload: JsonValue,
        actor: Option<String>,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            step_instance_id: Some(step_instance_id.into()),
            event_type,
            payload,
            actor,
        }
    }
}

/// Append a single event.
pub async fn append(executor: impl PgExecutor<'_>, event: &NewEvent) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO workflow_events (
            id, instance_id, step_instance_id, event_type, payload, actor
        ) VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(Uuid::new_v4().to_string())
    .bind(&event.instance_id)
    .bind(&event.step_instance_id)
    .bind(event.event_type)
    .bind(&event.payload)
    .bind(&event.actor)
    .execute(executor)
    .await?;

    Ok(())
}

/// Flush a batch of events, at most once each. Failures never propagate.
pub async fn append_all(pool: &PgPool, events: Vec<NewEvent>) {
    for event in events {
        if let Err(e) = append(pool, &event).await {
            tracing::warn!(
                instance_id = %event.instance_id,
                event_type = ?event.event_type,
                error = %e,
                "failed to append workflow event"
            );
        }
    }
}

/// Filtered, paginated event listing, newest first.
pub async fn list_events(
    pool: &PgPool,
    filter: &EventFilter,
    default_page_size: i32,
) -> Result<Vec<WorkflowEvent>, EngineError> {
    let mut query = String::from("SELECT * FROM workflow_events WHERE 1=1");

    if filter.instance_id.is_some() {
        query.push_str(" AND instance_id = $1");
    }
    if filter.event_type.is_some() {
        let param_num = if filter.instance_id.is_some() { 2 } else { 1 };
        query.push_str(&format!(" AND event_type = ${}", param_num));
    }

    query.push_str(" ORDER BY created_at DESC");

    let mut param_num = 1
        + usize::from(filter.instance_id.is_some())
        + usize::from(filter.event_type.is_some());
    query.push_str(&format!(" LIMIT ${}", param_num));
    param_num += 1;
    query.push_str(&format!(" OFFSET ${}", param_num));

    let mut q = sqlx::query(&query);
    if let Some(ref instance_id) = filter.instance_id {
        q = q.bind(instance_id);
    }
    if let Some(event_type) = filter.event_type {
        q = q.bind(event_type);
    }
    q = q.bind(filter.limit.unwrap_or(default_page_size));
    q = q.bind(filter.offset.unwrap_or(0));

    let rows = q.fetch_all(pool).await?;

    Ok(rows
        .into_iter()
        .map(|row| WorkflowEvent {
            id: row.get("id"),
            instance_id: row.get("instance_id"),
            step_instance_id: row.get("step_instance_id"),
            event_type: row.get("event_type"),
            payload: row.get("payload"),
            actor: row.get("actor"),
            created_at: row.get("created_at"),
        })
        .collect())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineBucket {
    pub day: DateTime<Utc>,
    pub count: i64,
}

/// Per-day event counts, optionally scoped to one instance.
pub async fn timeline(
    pool: &PgPool,
    instance_id: Option<&str>,
) -> Result<Vec<TimelineBucket>, EngineError> {
    let rows = match instance_id {
        Some(instance_id) => {
            sqlx::query(
                r#"
                SELECT date_trunc('day', created_at) AS day, COUNT(*) AS count
                FROM workflow_events
                WHERE instance_id = $1
                GROUP BY day
                ORDER BY day ASC
                "#,
            )
            .bind(instance_id)
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query(
                r#"
                SELECT date_trunc('day', created_at) AS day, COUNT(*) AS count
                FROM workflow_events
                GROUP BY day
                ORDER BY day ASC
                "#,
            )
            .fetch_all(pool)
            .await?
        }
    };

    Ok(rows
        .into_iter()
        .map(|row| TimelineBucket {
            day: row.get("day"),
            count: row.get("count"),
        })
        .collect())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventTypeCount {
    pub event_type: EventType,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventStats {
    pub total_events: i64,
    pub distinct_instances: i64,
    pub by_type: Vec<EventTypeCount>,
}

/// Summary statistics over the whole log.
pub async fn stats(pool: &PgPool) -> Result<EventStats, EngineError> {
    let (total_events, distinct_instances): (i64, i64) = sqlx::query_as(
        r#"
        SELECT COUNT(*), COUNT(DISTINCT instance_id) FROM workflow_events
        "#,
    )
    .fetch_one(pool)
    .await?;

    let rows = sqlx::query(
        r#"
        SELECT event_type, COUNT(*) AS count
        FROM workflow_events
        GROUP BY event_type
        ORDER BY count DESC
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(EventStats {
        total_events,
        distinct_instances,
        by_type: rows
            .into_iter()
            .map(|row| EventTypeCount {
                event_type: row.get("event_type"),
                count: row.get("count"),
            })
            .collect(),
    })
}
