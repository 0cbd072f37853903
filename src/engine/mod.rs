// Workflow execution engine.
//
// Owns the instance/step lifecycle: starting instances from active
// definitions, step completion with guarded transition traversal,
// suspend/resume/cancel, and the terminal completion check. Every
// state-mutating call runs in one transaction that first locks the
// instance row, so execution within an instance is single-writer even
// when parallel branches complete concurrently.

mod plan;
pub mod timers;

#[cfg(test)]
mod tests;

pub use plan::{fired_transitions, merge_context, should_auto_advance, WorkItem, WorkQueue};
pub use timers::TimeoutWatcher;

use chrono::Utc;
use serde_json::{json, Value as JsonValue};
use sqlx::{PgPool, Postgres, Transaction};
use std::sync::Arc;
use uuid::Uuid;

use crate::actions::{ActionExecutor, ActionTarget};
use crate::config::EngineSettings;
use crate::definitions;
use crate::error::EngineError;
use crate::events::{self, NewEvent};
use crate::instances;
use crate::types::{
    DefinitionStatus, EventType, ExecuteStepParams, InstanceDetail, InstanceListFilter,
    InstanceStatus, StartInstanceParams, StepInstanceStatus, StepType, WorkflowDefinition,
    WorkflowInstance, WorkflowStepInstance,
};

/// Actor recorded on engine-initiated activity.
pub const SYSTEM_ACTOR: &str = "system";

/// Built-in actions the engine itself submits.
pub const ACTION_AUTOMATIC: &str = "automatic_execution";
pub const ACTION_AUTO_ADVANCE: &str = "auto_advance";
pub const ACTION_TIMEOUT: &str = "timeout";

#[derive(Clone)]
pub struct Engine {
    pool: PgPool,
    settings: EngineSettings,
    actions: Arc<ActionExecutor>,
}

impl Engine {
    pub fn new(pool: PgPool, settings: EngineSettings) -> Self {
        let actions = Arc::new(ActionExecutor::new(&settings));
        Self {
            pool,
            settings,
            actions,
        }
    }

    /// Build an engine delivering side effects to a custom target.
    pub fn with_action_target(
        pool: PgPool,
        settings: EngineSettings,
        target: Arc<dyn ActionTarget>,
    ) -> Self {
        let actions = Arc::new(ActionExecutor::with_target(&settings, target));
        Self {
            pool,
            settings,
            actions,
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Start a new instance of an active definition: create the instance
    /// row and one pending step instance per definition step, then activate
    /// every start step.
    pub async fn start(&self, params: StartInstanceParams) -> Result<InstanceDetail, EngineError> {
        let definition = definitions::get_definition(&self.pool, &params.definition_id)
            .await?
            .ok_or_else(|| EngineError::not_found("workflow definition", params.definition_id.as_str()))?;
        if definition.status != DefinitionStatus::Active {
            return Err(EngineError::precondition(format!(
                "definition '{}' v{} is not active (status: {:?})",
                definition.name, definition.version, definition.status
            )));
        }

        let mut instance = WorkflowInstance {
            id: Uuid::new_v4().to_string(),
            definition_id: definition.id.clone(),
            definition_version: definition.version,
            case_ref: params.case_ref,
            status: InstanceStatus::Running,
            priority: params.priority.unwrap_or(self.settings.default_priority),
            context: if params.context.is_null() {
                json!({})
            } else {
                params.context
            },
            started_by: params.started_by.clone(),
            started_at: Utc::now(),
            completed_at: None,
        };

        let mut events = Vec::new();
        let mut tx = self.pool.begin().await?;

        instances::insert_instance(&mut *tx, &instance).await?;
        for (index, step) in definition.steps.iter().enumerate() {
            let step_instance = WorkflowStepInstance {
                id: Uuid::new_v4().to_string(),
                instance_id: instance.id.clone(),
                step_index: index as i32,
                step_name: step.name.clone(),
                step_type: step.step_type,
                config: step.config.clone(),
                status: StepInstanceStatus::Pending,
                activated_by: None,
                activated_at: None,
                completed_by: None,
                completed_at: None,
                execution_data: None,
                comment: None,
                error_message: None,
            };
            instances::insert_step_instance(&mut *tx, &step_instance).await?;
        }

        events.push(NewEvent::instance(
            &instance.id,
            EventType::WorkflowStarted,
            json!({
                "definition_id": definition.id,
                "definition_version": definition.version,
                "case_ref": instance.case_ref,
            }),
            Some(params.started_by.clone()),
        ));

        let mut queue: WorkQueue = definition
            .start_steps()
            .into_iter()
            .map(|step| WorkItem::Activate {
                step_name: step.name.clone(),
                actor: params.started_by.clone(),
            })
            .collect();

        self.drain(&mut tx, &definition, &mut instance, &mut queue, &mut events)
            .await?;
        self.check_completion(&mut tx, &mut instance, &mut events).await?;

        tx.commit().await?;
        events::append_all(&self.pool, events).await;

        tracing::info!(
            instance_id = %instance.id,
            definition = %definition.name,
            version = definition.version,
            "workflow started"
        );
        self.get_instance(&instance.id).await
    }

    /// Complete an active step: record its outcome, merge the execution
    /// data into the context, evaluate outgoing transitions and activate
    /// their targets, then recompute instance completion.
    pub async fn execute_step(
        &self,
        params: ExecuteStepParams,
    ) -> Result<InstanceDetail, EngineError> {
        let mut tx = self.pool.begin().await?;

        let mut instance = instances::get_instance_for_update(&mut *tx, &params.instance_id)
            .await?
            .ok_or_else(|| EngineError::not_found("workflow instance", params.instance_id.as_str()))?;
        if instance.status != InstanceStatus::Running {
            return Err(EngineError::precondition(format!(
                "instance {} is not running (status: {:?})",
                instance.id, instance.status
            )));
        }

        let step_instance = instances::get_step_instance(&mut *tx, &params.step_instance_id)
            .await?
            .filter(|s| s.instance_id == instance.id)
            .ok_or_else(|| EngineError::not_found("step instance", params.step_instance_id.as_str()))?;
        if step_instance.status != StepInstanceStatus::Active {
            return Err(EngineError::precondition(format!(
                "step instance {} ('{}') is not active (status: {:?})",
                step_instance.id, step_instance.step_name, step_instance.status
            )));
        }

        if let Some(allowed) = &step_instance.config.allowed_actions {
            let builtin = matches!(
                params.action.as_str(),
                ACTION_AUTOMATIC | ACTION_AUTO_ADVANCE | ACTION_TIMEOUT
            );
            if !allowed.is_empty() && !builtin && !allowed.iter().any(|a| a == &params.action) {
                return Err(EngineError::precondition(format!(
                    "action '{}' is not allowed for step '{}'",
                    params.action, step_instance.step_name
                )));
            }
        }

        let definition = definitions::get_definition(&self.pool, &instance.definition_id)
            .await?
            .ok_or_else(|| EngineError::not_found("workflow definition", instance.definition_id.as_str()))?;

        let mut events = Vec::new();
        let mut queue = WorkQueue::new();
        queue.push_back(WorkItem::Complete {
            step_name: step_instance.step_name.clone(),
            action: params.action,
            data: params.data,
            executed_by: params.executed_by,
            comment: params.comment,
        });

        self.drain(&mut tx, &definition, &mut instance, &mut queue, &mut events)
            .await?;
        self.check_completion(&mut tx, &mut instance, &mut events).await?;

        tx.commit().await?;
        events::append_all(&self.pool, events).await;

        self.get_instance(&instance.id).await
    }

    /// Suspend a running instance and its active steps. No transition
    /// evaluation happens here.
    pub async fn suspend(
        &self,
        instance_id: &str,
        actor: &str,
        reason: Option<&str>,
    ) -> Result<InstanceDetail, EngineError> {
        let mut tx = self.pool.begin().await?;

        let instance = instances::get_instance_for_update(&mut *tx, instance_id)
            .await?
            .ok_or_else(|| EngineError::not_found("workflow instance", instance_id))?;
        if instance.status != InstanceStatus::Running {
            return Err(EngineError::precondition(format!(
                "instance {} is not running (status: {:?})",
                instance.id, instance.status
            )));
        }

        instances::update_instance_status(&mut *tx, instance_id, InstanceStatus::Suspended, false)
            .await?;
        instances::move_steps(
            &mut *tx,
            instance_id,
            StepInstanceStatus::Active,
            StepInstanceStatus::Suspended,
        )
        .await?;

        tx.commit().await?;
        events::append_all(
            &self.pool,
            vec![NewEvent::instance(
                instance_id,
                EventType::WorkflowSuspended,
                json!({ "reason": reason }),
                Some(actor.to_string()),
            )],
        )
        .await;

        tracing::info!(instance_id, actor, "workflow suspended");
        self.get_instance(instance_id).await
    }

    /// Resume a suspended instance, reactivating its suspended steps.
    pub async fn resume(&self, instance_id: &str, actor: &str) -> Result<InstanceDetail, EngineError> {
        let mut tx = self.pool.begin().await?;

        let instance = instances::get_instance_for_update(&mut *tx, instance_id)
            .await?
            .ok_or_else(|| EngineError::not_found("workflow instance", instance_id))?;
        if instance.status != InstanceStatus::Suspended {
            return Err(EngineError::precondition(format!(
                "instance {} is not suspended (status: {:?})",
                instance.id, instance.status
            )));
        }

        instances::update_instance_status(&mut *tx, instance_id, InstanceStatus::Running, false)
            .await?;
        instances::move_steps(
            &mut *tx,
            instance_id,
            StepInstanceStatus::Suspended,
            StepInstanceStatus::Active,
        )
        .await?;

        tx.commit().await?;
        events::append_all(
            &self.pool,
            vec![NewEvent::instance(
                instance_id,
                EventType::WorkflowResumed,
                json!({}),
                Some(actor.to_string()),
            )],
        )
        .await;

        tracing::info!(instance_id, actor, "workflow resumed");
        self.get_instance(instance_id).await
    }

    /// Cancel a running or suspended instance. Terminal: active and
    /// suspended steps are cancelled and no further transitions process.
    pub async fn cancel(
        &self,
        instance_id: &str,
        actor: &str,
        reason: Option<&str>,
    ) -> Result<InstanceDetail, EngineError> {
        let mut tx = self.pool.begin().await?;

        let instance = instances::get_instance_for_update(&mut *tx, instance_id)
            .await?
            .ok_or_else(|| EngineError::not_found("workflow instance", instance_id))?;
        if !matches!(
            instance.status,
            InstanceStatus::Running | InstanceStatus::Suspended
        ) {
            return Err(EngineError::precondition(format!(
                "instance {} cannot be cancelled (status: {:?})",
                instance.id, instance.status
            )));
        }

        instances::update_instance_status(&mut *tx, instance_id, InstanceStatus::Cancelled, true)
            .await?;
        instances::move_steps(
            &mut *tx,
            instance_id,
            StepInstanceStatus::Active,
            StepInstanceStatus::Cancelled,
        )
        .await?;
        instances::move_steps(
            &mut *tx,
            instance_id,
            StepInstanceStatus::Suspended,
            StepInstanceStatus::Cancelled,
        )
        .await?;

        tx.commit().await?;
        events::append_all(
            &self.pool,
            vec![NewEvent::instance(
                instance_id,
                EventType::WorkflowCancelled,
                json!({ "reason": reason }),
                Some(actor.to_string()),
            )],
        )
        .await;

        tracing::info!(instance_id, actor, "workflow cancelled");
        self.get_instance(instance_id).await
    }

    /// Hydrate an instance: the row, the names of currently active steps,
    /// and every step instance in definition order.
    pub async fn get_instance(&self, instance_id: &str) -> Result<InstanceDetail, EngineError> {
        let instance = instances::get_instance(&self.pool, instance_id)
            .await?
            .ok_or_else(|| EngineError::not_found("workflow instance", instance_id))?;
        let steps = instances::list_step_instances(&self.pool, instance_id).await?;
        let active_steps = steps
            .iter()
            .filter(|s| s.status == StepInstanceStatus::Active)
            .map(|s| s.step_name.clone())
            .collect();

        Ok(InstanceDetail {
            instance,
            active_steps,
            steps,
        })
    }

    pub async fn list_instances(
        &self,
        filter: &InstanceListFilter,
    ) -> Result<Vec<WorkflowInstance>, EngineError> {
        instances::list_instances(&self.pool, filter, self.settings.event_page_size).await
    }

    /// Drain the work queue: the activate/complete trampoline.
    async fn drain(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        definition: &WorkflowDefinition,
        instance: &mut WorkflowInstance,
        queue: &mut WorkQueue,
        events: &mut Vec<NewEvent>,
    ) -> Result<(), EngineError> {
        while let Some(item) = queue.pop_front() {
            match item {
                WorkItem::Activate { step_name, actor } => {
                    self.activate(tx, definition, instance, &step_name, &actor, queue, events)
                        .await?;
                }
                WorkItem::Complete {
                    step_name,
                    action,
                    data,
                    executed_by,
                    comment,
                } => {
                    self.complete(
                        tx,
                        definition,
                        instance,
                        &step_name,
                        &action,
                        data,
                        &executed_by,
                        comment.as_deref(),
                        queue,
                        events,
                    )
                    .await?;
                }
            }
        }
        Ok(())
    }

    async fn activate(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        definition: &WorkflowDefinition,
        instance: &mut WorkflowInstance,
        step_name: &str,
        actor: &str,
        queue: &mut WorkQueue,
        events: &mut Vec<NewEvent>,
    ) -> Result<(), EngineError> {
        let Some(step) = definition.step(step_name) else {
            return Ok(());
        };
        // pending -> active only; a step already activated through another
        // transition (or already finished) is left alone.
        let Some(step_instance) =
            instances::activate_step(&mut **tx, &instance.id, step_name, actor).await?
        else {
            return Ok(());
        };

        events.push(NewEvent::step(
            &instance.id,
            &step_instance.id,
            EventType::StepActivated,
            json!({ "step": step_name, "type": step.step_type }),
            Some(actor.to_string()),
        ));

        if step.step_type == StepType::Automatic {
            match self
                .actions
                .execute_automatic_step(&step_instance.config, &instance.context)
                .await
            {
                Ok(output) => queue.push_back(WorkItem::Complete {
                    step_name: step_name.to_string(),
                    action: ACTION_AUTOMATIC.to_string(),
                    data: output,
                    executed_by: SYSTEM_ACTOR.to_string(),
                    comment: None,
                }),
                Err(e) => {
                    // The failure stays local to this step instance.
                    instances::fail_step(&mut **tx, &step_instance.id, &e.to_string()).await?;
                    events.push(NewEvent::step(
                        &instance.id,
                        &step_instance.id,
                        EventType::StepFailed,
                        json!({ "step": step_name, "error": e.to_string() }),
                        Some(SYSTEM_ACTOR.to_string()),
                    ));
                    tracing::warn!(
                        instance_id = %instance.id,
                        step = step_name,
                        error = %e,
                        "automatic step failed"
                    );
                }
            }
            return Ok(());
        }

        if step.step_type == StepType::Wait {
            if let Some(minutes) = step_instance.config.timeout_minutes {
                timers::schedule(&mut **tx, &instance.id, &step_instance.id, minutes).await?;
            }
        }

        if plan::should_auto_advance(&step_instance.config, &instance.context) {
            queue.push_back(WorkItem::Complete {
                step_name: step_name.to_string(),
                action: ACTION_AUTO_ADVANCE.to_string(),
                data: JsonValue::Null,
                executed_by: SYSTEM_ACTOR.to_string(),
                comment: None,
            });
        }

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn complete(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        definition: &WorkflowDefinition,
        instance: &mut WorkflowInstance,
        step_name: &str,
        action: &str,
        data: JsonValue,
        executed_by: &str,
        comment: Option<&str>,
        queue: &mut WorkQueue,
        events: &mut Vec<NewEvent>,
    ) -> Result<(), EngineError> {
        // Guarded on status in SQL: a queued completion that raced another
        // path to this step simply affects nothing.
        let Some(step_instance) =
            instances::complete_step(&mut **tx, &instance.id, step_name, executed_by, &data, comment)
                .await?
        else {
            return Ok(());
        };

        events.push(NewEvent::step(
            &instance.id,
            &step_instance.id,
            EventType::StepCompleted,
            json!({ "step": step_name, "action": action }),
            Some(executed_by.to_string()),
        ));

        plan::merge_context(&mut instance.context, &data);
        instances::update_context(&mut **tx, &instance.id, &instance.context).await?;

        let Some(step) = definition.step(step_name) else {
            return Ok(());
        };

        for transition in plan::fired_transitions(step, &instance.context) {
            // Transition actions are best-effort and independent; failures
            // surface in the event log, never in control flow.
            let results = self
                .actions
                .execute_actions(&transition.actions, &instance.context)
                .await;
            for result in results.iter().filter(|r| !r.success) {
                events.push(NewEvent::step(
                    &instance.id,
                    &step_instance.id,
                    EventType::ActionFailed,
                    json!({
                        "transition": transition.name,
                        "action": result.name,
                        "type": result.action_type,
                        "error": result.error,
                    }),
                    Some(SYSTEM_ACTOR.to_string()),
                ));
            }

            events.push(NewEvent::step(
                &instance.id,
                &step_instance.id,
                EventType::TransitionExecuted,
                json!({
                    "transition": transition.name,
                    "from": step_name,
                    "to": transition.target,
                    "actions": results,
                }),
                Some(executed_by.to_string()),
            ));

            queue.push_back(WorkItem::Activate {
                step_name: transition.target.clone(),
                actor: executed_by.to_string(),
            });
        }

        Ok(())
    }

    /// Terminal check: an instance with zero active step instances is done.
    async fn check_completion(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        instance: &mut WorkflowInstance,
        events: &mut Vec<NewEvent>,
    ) -> Result<(), EngineError> {
        if instance.status != InstanceStatus::Running {
            return Ok(());
        }
        let active = instances::count_active_steps(&mut **tx, &instance.id).await?;
        if active == 0 {
            instances::update_instance_status(
                &mut **tx,
                &instance.id,
                InstanceStatus::Completed,
                true,
            )
            .await?;
            instance.status = InstanceStatus::Completed;
            events.push(NewEvent::instance(
                &instance.id,
                EventType::WorkflowCompleted,
                json!({}),
                None,
            ));
            tracing::info!(instance_id = %instance.id, "workflow completed");
        }
        Ok(())
    }
}
