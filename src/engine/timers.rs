//! Wait-step timeout scheduling and firing.
//!
//! Activating a wait step with `timeout_minutes` inserts a durable timer
//! row. The watcher polls for due timers, claims them with SKIP LOCKED so
//! concurrent watchers never double-fire, and forces completion through the
//! normal `execute_step` path - which re-validates that the step is still
//! active, making a late timer on an already-completed step a no-op.

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;
use sqlx::PgExecutor;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::EngineError;
use crate::instances;
use crate::types::{ExecuteStepParams, InstanceStatus};

use super::{Engine, ACTION_TIMEOUT, SYSTEM_ACTOR};

/// Schedule a forced completion for a wait step.
pub async fn schedule(
    executor: impl PgExecutor<'_>,
    instance_id: &str,
    step_instance_id: &str,
    timeout_minutes: i64,
) -> Result<(), EngineError> {
    sqlx::query(
        r#"
        INSERT INTO step_timers (id, instance_id, step_instance_id, fire_at)
        VALUES ($1, $2, $3, $4)
        "#,
    )
    .bind(Uuid::new_v4().to_string())
    .bind(instance_id)
    .bind(step_instance_id)
    .bind(Utc::now() + ChronoDuration::minutes(timeout_minutes))
    .execute(executor)
    .await?;

    Ok(())
}

/// Poll loop that fires due wait-step timeouts.
pub struct TimeoutWatcher {
    engine: Engine,
    poll_interval: Duration,
}

impl TimeoutWatcher {
    pub fn new(engine: Engine) -> Self {
        let poll_interval = Duration::from_secs(engine.settings.timer_poll_interval_secs);
        Self {
            engine,
            poll_interval,
        }
    }

    /// Run until cancelled. Poll failures are logged and retried on the
    /// next interval.
    pub async fn run(&self, shutdown: CancellationToken) {
        tracing::info!(interval_secs = self.poll_interval.as_secs(), "timeout watcher started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }

            match self.tick().await {
                Ok(fired) if fired > 0 => {
                    tracing::debug!(fired, "wait-step timeouts fired");
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "timeout poll failed"),
            }
        }
        tracing::info!("timeout watcher stopped");
    }

    /// Claim and fire every due timer. Returns how many forced completions
    /// actually happened.
    pub async fn tick(&self) -> Result<usize, EngineError> {
        let due: Vec<(String, String, String)> = sqlx::query_as(
            r#"
            UPDATE step_timers
            SET fired = TRUE
            WHERE id IN (
                SELECT id FROM step_timers
                WHERE fired = FALSE
                  AND fire_at <= NOW()
                ORDER BY fire_at ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 50
            )
            RETURNING id, instance_id, step_instance_id
            "#,
        )
        .fetch_all(&self.engine.pool)
        .await?;

        let mut fired = 0;
        for (timer_id, instance_id, step_instance_id) in due {
            if self.fire(&timer_id, &instance_id, &step_instance_id).await? {
                fired += 1;
            }
        }
        Ok(fired)
    }

    async fn fire(
        &self,
        timer_id: &str,
        instance_id: &str,
        step_instance_id: &str,
    ) -> Result<bool, EngineError> {
        // A suspended instance keeps its timer: put it back so it fires
        // after resume. Terminal or missing instances retire the timer.
        let status = instances::get_instance(&self.engine.pool, instance_id)
            .await?
            .map(|i| i.status);
        match status {
            Some(InstanceStatus::Running) => {}
            Some(InstanceStatus::Suspended) => {
                self.unfire(timer_id).await?;
                return Ok(false);
            }
            _ => return Ok(false),
        }

        let result = self
            .engine
            .execute_step(ExecuteStepParams {
                instance_id: instance_id.to_string(),
                step_instance_id: step_instance_id.to_string(),
                action: ACTION_TIMEOUT.to_string(),
                data: json!({ "timed_out": true }),
                executed_by: SYSTEM_ACTOR.to_string(),
                comment: None,
            })
            .await;

        match result {
            Ok(_) => {
                tracing::info!(instance_id, step_instance_id, "wait step timed out");
                Ok(true)
            }
            // The step finished (or the instance moved) between scheduling
            // and firing: the timeout is a no-op.
            Err(EngineError::Precondition(_)) | Err(EngineError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn unfire(&self, timer_id: &str) -> Result<(), EngineError> {
        sqlx::query(
            r#"
            UPDATE step_timers SET fired = FALSE WHERE id = $1
            "#,
        )
        .bind(timer_id)
        .execute(&self.engine.pool)
        .await?;

        Ok(())
    }
}
