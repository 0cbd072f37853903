use sqlx::PgPool;

use crate::error::EngineError;
use crate::events::{self, EventStats, TimelineBucket};
use crate::types::{EventFilter, WorkflowEvent};

/// Read-side service over the workflow event log, for audit and monitoring
/// collaborators.
#[derive(Clone)]
pub struct EventService {
    pool: PgPool,
    page_size: i32,
}

impl EventService {
    pub fn new(pool: PgPool, page_size: i32) -> Self {
        Self { pool, page_size }
    }

    pub async fn list(&self, filter: &EventFilter) -> Result<Vec<WorkflowEvent>, EngineError> {
        events::list_events(&self.pool, filter, self.page_size).await
    }

    pub async fn timeline(
        &self,
        instance_id: Option<&str>,
    ) -> Result<Vec<TimelineBucket>, EngineError> {
        events::timeline(&self.pool, instance_id).await
    }

    pub async fn stats(&self) -> Result<EventStats, EngineError> {
        events::stats(&self.pool).await
    }
}
