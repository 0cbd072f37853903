use std::sync::Arc;

use serde_json::json;
use sqlx::PgPool;

use super::*;
use crate::actions::RecordingTarget;
use crate::db::test_helpers::with_test_db;
use crate::types::{
    AssigneeType, Condition, ConditionOperator, CreateDefinitionParams, Position, StepConfig,
    WorkflowStep, WorkflowTransition,
};

fn engine(pool: &PgPool) -> Engine {
    Engine::with_action_target(
        pool.clone(),
        EngineSettings::default(),
        Arc::new(RecordingTarget::new()),
    )
}

fn step(name: &str, step_type: StepType) -> WorkflowStep {
    WorkflowStep {
        name: name.to_string(),
        step_type,
        position: Some(Position { x: 0.0, y: 0.0 }),
        config: StepConfig {
            assignee_type: Some(AssigneeType::Role),
            assignee_value: Some("technician".to_string()),
            ..Default::default()
        },
        transitions: vec![],
    }
}

fn transition(name: &str, target: &str, conditions: Vec<Condition>) -> WorkflowTransition {
    WorkflowTransition {
        name: name.to_string(),
        target: target.to_string(),
        conditions,
        actions: vec![],
    }
}

fn greater_than(field: &str, value: i64) -> Condition {
    Condition {
        field: field.to_string(),
        operator: ConditionOperator::GreaterThan,
        value: json!(value),
    }
}

fn at_most(field: &str, value: i64) -> Condition {
    Condition {
        field: field.to_string(),
        operator: ConditionOperator::LessThanOrEqual,
        value: json!(value),
    }
}

async fn active_definition(
    pool: &PgPool,
    name: &str,
    steps: Vec<WorkflowStep>,
) -> crate::types::WorkflowDefinition {
    let limits = EngineSettings::default();
    let draft = crate::definitions::create_definition(
        pool,
        CreateDefinitionParams {
            name: name.to_string(),
            description: None,
            device_types: vec!["router".to_string()],
            service_types: vec!["repair".to_string()],
            customer_tiers: vec!["standard".to_string()],
            steps,
            metadata: json!({}),
            created_by: Some("tests".to_string()),
        },
        &limits,
    )
    .await
    .unwrap();
    crate::definitions::activate_definition(pool, &draft.id, &limits)
        .await
        .unwrap()
}

async fn start(engine: &Engine, definition_id: &str, context: serde_json::Value) -> InstanceDetail {
    engine
        .start(StartInstanceParams {
            definition_id: definition_id.to_string(),
            case_ref: "CASE-1".to_string(),
            context,
            started_by: "operator".to_string(),
            priority: None,
        })
        .await
        .unwrap()
}

fn find_step<'a>(detail: &'a InstanceDetail, name: &str) -> &'a WorkflowStepInstance {
    detail
        .steps
        .iter()
        .find(|s| s.step_name == name)
        .unwrap_or_else(|| panic!("no step instance named '{name}'"))
}

async fn make_timers_due(pool: &PgPool) {
    sqlx::query("UPDATE step_timers SET fire_at = NOW() - INTERVAL '1 minute'")
        .execute(pool)
        .await
        .unwrap();
}

/* ===================== Start and completion ===================== */

#[tokio::test(flavor = "multi_thread")]
#[ignore] // Requires database
async fn test_single_manual_step_completes_instance() {
    let db = with_test_db().await;
    let engine = engine(&db.pool);
    let def = active_definition(&db.pool, "one_step", vec![step("intake", StepType::Manual)]).await;

    let detail = start(&engine, &def.id, json!({})).await;
    assert_eq!(detail.instance.status, InstanceStatus::Running);
    assert_eq!(detail.active_steps, vec!["intake".to_string()]);

    let done = engine
        .execute_step(ExecuteStepParams {
            instance_id: detail.instance.id.clone(),
            step_instance_id: find_step(&detail, "intake").id.clone(),
            action: "complete".to_string(),
            data: json!({ "notes": "done" }),
            executed_by: "operator".to_string(),
            comment: None,
        })
        .await
        .unwrap();

    assert_eq!(done.instance.status, InstanceStatus::Completed);
    assert!(done.instance.completed_at.is_some());
    assert!(done.active_steps.is_empty());
    assert_eq!(
        find_step(&done, "intake").status,
        StepInstanceStatus::Completed
    );
}

#[tokio::test(flavor = "multi_thread")]
#[ignore] // Requires database
async fn test_guarded_transitions_pick_one_branch() {
    let db = with_test_db().await;
    let engine = engine(&db.pool);

    let mut triage = step("triage", StepType::Manual);
    triage.transitions = vec![
        transition("high", "expedite", vec![greater_than("x", 5)]),
        transition("low", "standard", vec![at_most("x", 5)]),
    ];
    let def = active_definition(
        &db.pool,
        "branching",
        vec![triage, step("expedite", StepType::Manual), step("standard", StepType::Manual)],
    )
    .await;

    let detail = start(&engine, &def.id, json!({ "x": 10 })).await;
    let after = engine
        .execute_step(ExecuteStepParams {
            instance_id: detail.instance.id.clone(),
            step_instance_id: find_step(&detail, "triage").id.clone(),
            action: "complete".to_string(),
            data: json!({}),
            executed_by: "operator".to_string(),
            comment: None,
        })
        .await
        .unwrap();

    assert_eq!(find_step(&after, "expedite").status, StepInstanceStatus::Active);
    // The losing branch's guard was false: its step is never activated.
    assert_eq!(find_step(&after, "standard").status, StepInstanceStatus::Pending);
    assert_eq!(after.instance.status, InstanceStatus::Running);
}

#[tokio::test(flavor = "multi_thread")]
#[ignore] // Requires database
async fn test_execute_step_twice_is_precondition_error() {
    let db = with_test_db().await;
    let engine = engine(&db.pool);

    let mut first = step("first", StepType::Manual);
    first.transitions = vec![transition("next", "second", vec![])];
    let def = active_definition(
        &db.pool,
        "replay",
        vec![
            first,
            step("second", StepType::Manual),
            // Parallel start branch keeps the instance running.
            step("sidecar", StepType::Manual),
        ],
    )
    .await;

    let detail = start(&engine, &def.id, json!({})).await;
    let params = ExecuteStepParams {
        instance_id: detail.instance.id.clone(),
        step_instance_id: find_step(&detail, "first").id.clone(),
        action: "complete".to_string(),
        data: json!({}),
        executed_by: "operator".to_string(),
        comment: None,
    };

    engine.execute_step(params.clone()).await.unwrap();
    let err = engine.execute_step(params).await.unwrap_err();
    assert!(matches!(err, EngineError::Precondition(_)));

    // Transitions were not re-fired: exactly one activation of 'second'.
    let after = engine.get_instance(&detail.instance.id).await.unwrap();
    assert_eq!(find_step(&after, "second").status, StepInstanceStatus::Active);
    let activations: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM workflow_events WHERE instance_id = $1 \
         AND event_type = 'step_activated' AND payload->>'step' = 'second'",
    )
    .bind(&detail.instance.id)
    .fetch_one(&db.pool)
    .await
    .unwrap();
    assert_eq!(activations, 1);
}

#[tokio::test(flavor = "multi_thread")]
#[ignore] // Requires database
async fn test_parallel_branches_complete_only_when_all_done() {
    let db = with_test_db().await;
    let engine = engine(&db.pool);

    let mut split = step("split", StepType::Parallel);
    split.transitions = vec![
        transition("left", "repair", vec![]),
        transition("right", "billing", vec![]),
    ];
    let def = active_definition(
        &db.pool,
        "parallel",
        vec![split, step("repair", StepType::Manual), step("billing", StepType::Manual)],
    )
    .await;

    let detail = start(&engine, &def.id, json!({})).await;
    let after_split = engine
        .execute_step(ExecuteStepParams {
            instance_id: detail.instance.id.clone(),
            step_instance_id: find_step(&detail, "split").id.clone(),
            action: "complete".to_string(),
            data: json!({}),
            executed_by: "operator".to_string(),
            comment: None,
        })
        .await
        .unwrap();
    assert_eq!(after_split.active_steps.len(), 2);

    let one_done = engine
        .execute_step(ExecuteStepParams {
            instance_id: detail.instance.id.clone(),
            step_instance_id: find_step(&after_split, "repair").id.clone(),
            action: "complete".to_string(),
            data: json!({}),
            executed_by: "operator".to_string(),
            comment: None,
        })
        .await
        .unwrap();
    // One sibling still active: the instance must not complete yet.
    assert_eq!(one_done.instance.status, InstanceStatus::Running);

    let all_done = engine
        .execute_step(ExecuteStepParams {
            instance_id: detail.instance.id.clone(),
            step_instance_id: find_step(&after_split, "billing").id.clone(),
            action: "complete".to_string(),
            data: json!({}),
            executed_by: "operator".to_string(),
            comment: None,
        })
        .await
        .unwrap();
    assert_eq!(all_done.instance.status, InstanceStatus::Completed);
}

/* ===================== Automatic steps ===================== */

#[tokio::test(flavor = "multi_thread")]
#[ignore] // Requires database
async fn test_automatic_failure_fails_only_that_step() {
    let db = with_test_db().await;
    let engine = engine(&db.pool);

    let mut check = step("precheck", StepType::Automatic);
    check.config = serde_json::from_value(json!({
        "automatic_type": "status_check",
        "field": "case.ready",
        "expected": true
    }))
    .unwrap();

    let def = active_definition(
        &db.pool,
        "auto_failure",
        vec![check, step("review", StepType::Manual)],
    )
    .await;

    // Context lacks case.ready: the status check throws.
    let detail = start(&engine, &def.id, json!({})).await;

    let failed = find_step(&detail, "precheck");
    assert_eq!(failed.status, StepInstanceStatus::Failed);
    assert!(failed.error_message.as_deref().unwrap().contains("status check failed"));

    // The sibling branch and the instance itself are unaffected.
    assert_eq!(find_step(&detail, "review").status, StepInstanceStatus::Active);
    assert_eq!(detail.instance.status, InstanceStatus::Running);
}

#[tokio::test(flavor = "multi_thread")]
#[ignore] // Requires database
async fn test_automatic_chain_merges_output_into_context() {
    let db = with_test_db().await;
    let engine = engine(&db.pool);

    let mut quote = step("quote", StepType::Automatic);
    quote.config = serde_json::from_value(json!({
        "automatic_type": "calculation",
        "operation": "sum",
        "operands": ["parts_cost", "labor_cost"],
        "output_field": "total_cost"
    }))
    .unwrap();
    quote.transitions = vec![transition("approval", "approve", vec![greater_than("total_cost", 100)])];

    let def = active_definition(
        &db.pool,
        "auto_chain",
        vec![quote, step("approve", StepType::Manual)],
    )
    .await;

    let detail = start(&engine, &def.id, json!({ "parts_cost": 90, "labor_cost": 60 })).await;

    let auto = find_step(&detail, "quote");
    assert_eq!(auto.status, StepInstanceStatus::Completed);
    assert_eq!(auto.completed_by.as_deref(), Some(SYSTEM_ACTOR));
    // The calculated output guarded the transition.
    assert_eq!(find_step(&detail, "approve").status, StepInstanceStatus::Active);
    assert_eq!(detail.instance.context["total_cost"], json!(150.0));
}

#[tokio::test(flavor = "multi_thread")]
#[ignore] // Requires database
async fn test_auto_advance_completes_step_on_activation() {
    let db = with_test_db().await;
    let engine = engine(&db.pool);

    let mut gate = step("gate", StepType::Manual);
    gate.config.auto_advance_conditions = vec![Condition {
        field: "preapproved".to_string(),
        operator: ConditionOperator::Equals,
        value: json!(true),
    }];

    let def = active_definition(&db.pool, "auto_advance", vec![gate]).await;

    let detail = start(&engine, &def.id, json!({ "preapproved": true })).await;
    assert_eq!(find_step(&detail, "gate").status, StepInstanceStatus::Completed);
    assert_eq!(detail.instance.status, InstanceStatus::Completed);

    let detail = engine
        .start(StartInstanceParams {
            definition_id: def.id.clone(),
            case_ref: "CASE-2".to_string(),
            context: json!({ "preapproved": false }),
            started_by: "operator".to_string(),
            priority: None,
        })
        .await
        .unwrap();
    assert_eq!(find_step(&detail, "gate").status, StepInstanceStatus::Active);
}

/* ===================== Wait steps and timeouts ===================== */

#[tokio::test(flavor = "multi_thread")]
#[ignore] // Requires database
async fn test_wait_timeout_forces_completion() {
    let db = with_test_db().await;
    let engine = engine(&db.pool);

    let mut hold = step("hold", StepType::Wait);
    hold.config.timeout_minutes = Some(1);
    hold.transitions = vec![transition("done_waiting", "followup", vec![])];

    let def = active_definition(
        &db.pool,
        "wait_flow",
        vec![hold, step("followup", StepType::Manual)],
    )
    .await;

    let detail = start(&engine, &def.id, json!({})).await;
    assert_eq!(find_step(&detail, "hold").status, StepInstanceStatus::Active);

    make_timers_due(&db.pool).await;
    let watcher = TimeoutWatcher::new(engine.clone());
    assert_eq!(watcher.tick().await.unwrap(), 1);

    let after = engine.get_instance(&detail.instance.id).await.unwrap();
    let hold = find_step(&after, "hold");
    assert_eq!(hold.status, StepInstanceStatus::Completed);
    assert_eq!(hold.completed_by.as_deref(), Some(SYSTEM_ACTOR));
    assert_eq!(find_step(&after, "followup").status, StepInstanceStatus::Active);
}

#[tokio::test(flavor = "multi_thread")]
#[ignore] // Requires database
async fn test_timeout_after_manual_completion_is_noop() {
    let db = with_test_db().await;
    let engine = engine(&db.pool);

    let mut hold = step("hold", StepType::Wait);
    hold.config.timeout_minutes = Some(1);
    hold.transitions = vec![transition("done_waiting", "followup", vec![])];

    let def = active_definition(
        &db.pool,
        "wait_race",
        vec![hold, step("followup", StepType::Manual)],
    )
    .await;

    let detail = start(&engine, &def.id, json!({})).await;
    engine
        .execute_step(ExecuteStepParams {
            instance_id: detail.instance.id.clone(),
            step_instance_id: find_step(&detail, "hold").id.clone(),
            action: "complete".to_string(),
            data: json!({}),
            executed_by: "operator".to_string(),
            comment: None,
        })
        .await
        .unwrap();

    make_timers_due(&db.pool).await;
    let watcher = TimeoutWatcher::new(engine.clone());
    // The step already completed manually: firing must change nothing.
    assert_eq!(watcher.tick().await.unwrap(), 0);

    let after = engine.get_instance(&detail.instance.id).await.unwrap();
    let hold = find_step(&after, "hold");
    assert_eq!(hold.status, StepInstanceStatus::Completed);
    assert_eq!(hold.completed_by.as_deref(), Some("operator"));
    assert_eq!(find_step(&after, "followup").status, StepInstanceStatus::Active);

    // The claimed timer is spent; nothing refires.
    assert_eq!(watcher.tick().await.unwrap(), 0);
}

/* ===================== Operator controls ===================== */

#[tokio::test(flavor = "multi_thread")]
#[ignore] // Requires database
async fn test_suspend_resume_cancel() {
    let db = with_test_db().await;
    let engine = engine(&db.pool);
    let def = active_definition(&db.pool, "controls", vec![step("work", StepType::Manual)]).await;

    let detail = start(&engine, &def.id, json!({})).await;

    let suspended = engine
        .suspend(&detail.instance.id, "supervisor", Some("parts on order"))
        .await
        .unwrap();
    assert_eq!(suspended.instance.status, InstanceStatus::Suspended);
    assert_eq!(find_step(&suspended, "work").status, StepInstanceStatus::Suspended);

    // Executing against a suspended instance is rejected without mutation.
    let err = engine
        .execute_step(ExecuteStepParams {
            instance_id: detail.instance.id.clone(),
            step_instance_id: find_step(&detail, "work").id.clone(),
            action: "complete".to_string(),
            data: json!({}),
            executed_by: "operator".to_string(),
            comment: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Precondition(_)));

    let resumed = engine.resume(&detail.instance.id, "supervisor").await.unwrap();
    assert_eq!(resumed.instance.status, InstanceStatus::Running);
    assert_eq!(find_step(&resumed, "work").status, StepInstanceStatus::Active);

    let cancelled = engine
        .cancel(&detail.instance.id, "supervisor", Some("customer withdrew"))
        .await
        .unwrap();
    assert_eq!(cancelled.instance.status, InstanceStatus::Cancelled);
    assert!(cancelled.instance.completed_at.is_some());
    assert_eq!(find_step(&cancelled, "work").status, StepInstanceStatus::Cancelled);

    // Terminal: no further operator moves.
    let err = engine.resume(&detail.instance.id, "supervisor").await.unwrap_err();
    assert!(matches!(err, EngineError::Precondition(_)));
}

#[tokio::test(flavor = "multi_thread")]
#[ignore] // Requires database
async fn test_start_requires_active_definition() {
    let db = with_test_db().await;
    let engine = engine(&db.pool);

    let draft = crate::definitions::create_definition(
        &db.pool,
        CreateDefinitionParams {
            name: "still_draft".to_string(),
            description: None,
            device_types: vec!["router".to_string()],
            service_types: vec!["repair".to_string()],
            customer_tiers: vec!["standard".to_string()],
            steps: vec![step("intake", StepType::Manual)],
            metadata: json!({}),
            created_by: None,
        },
        &EngineSettings::default(),
    )
    .await
    .unwrap();

    let err = engine
        .start(StartInstanceParams {
            definition_id: draft.id,
            case_ref: "CASE-1".to_string(),
            context: json!({}),
            started_by: "operator".to_string(),
            priority: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Precondition(_)));
}

/* ===================== Audit trail ===================== */

#[tokio::test(flavor = "multi_thread")]
#[ignore] // Requires database
async fn test_lifecycle_events_are_recorded() {
    let db = with_test_db().await;
    let engine = engine(&db.pool);
    let def = active_definition(&db.pool, "audited", vec![step("intake", StepType::Manual)]).await;

    let detail = start(&engine, &def.id, json!({})).await;
    engine
        .execute_step(ExecuteStepParams {
            instance_id: detail.instance.id.clone(),
            step_instance_id: find_step(&detail, "intake").id.clone(),
            action: "complete".to_string(),
            data: json!({}),
            executed_by: "operator".to_string(),
            comment: None,
        })
        .await
        .unwrap();

    let events = crate::events::list_events(
        &db.pool,
        &crate::types::EventFilter {
            instance_id: Some(detail.instance.id.clone()),
            ..Default::default()
        },
        50,
    )
    .await
    .unwrap();

    let kinds: Vec<EventType> = events.iter().map(|e| e.event_type).collect();
    for expected in [
        EventType::WorkflowStarted,
        EventType::StepActivated,
        EventType::StepCompleted,
        EventType::WorkflowCompleted,
    ] {
        assert!(kinds.contains(&expected), "missing {expected:?} in {kinds:?}");
    }
}

#[tokio::test(flavor = "multi_thread")]
#[ignore] // Requires database
async fn test_failed_transition_action_does_not_block_activation() {
    let db = with_test_db().await;
    let engine = Engine::with_action_target(
        db.pool.clone(),
        EngineSettings::default(),
        Arc::new(RecordingTarget::failing_on(crate::types::ActionType::Notification)),
    );

    let mut first = step("first", StepType::Manual);
    first.transitions = vec![WorkflowTransition {
        name: "next".to_string(),
        target: "second".to_string(),
        conditions: vec![],
        actions: vec![crate::types::ActionSpec {
            name: Some("announce".to_string()),
            action_type: crate::types::ActionType::Notification,
            config: json!({ "message": "moving on" }),
        }],
    }];

    let def = active_definition(
        &db.pool,
        "action_failure",
        vec![first, step("second", StepType::Manual)],
    )
    .await;

    let detail = start(&engine, &def.id, json!({})).await;
    let after = engine
        .execute_step(ExecuteStepParams {
            instance_id: detail.instance.id.clone(),
            step_instance_id: find_step(&detail, "first").id.clone(),
            action: "complete".to_string(),
            data: json!({}),
            executed_by: "operator".to_string(),
            comment: None,
        })
        .await
        .unwrap();

    // The action failed, the transition still fired.
    assert_eq!(find_step(&after, "second").status, StepInstanceStatus::Active);

    let failures: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM workflow_events WHERE instance_id = $1 AND event_type = 'action_failed'",
    )
    .bind(&detail.instance.id)
    .fetch_one(&db.pool)
    .await
    .unwrap();
    assert_eq!(failures, 1);
}
