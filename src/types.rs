use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DefinitionStatus {
    Draft,
    Active,
    Archived,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Manual,
    Automatic,
    Decision,
    Parallel,
    Wait,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Running,
    Suspended,
    Completed,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum StepInstanceStatus {
    Pending,
    Active,
    Completed,
    Failed,
    Skipped,
    Suspended,
    Cancelled,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AssigneeType {
    Role,
    User,
    Auto,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AutomaticType {
    StatusCheck,
    DataValidation,
    Calculation,
    Integration,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Equals,
    NotEquals,
    GreaterThan,
    LessThan,
    GreaterThanOrEqual,
    LessThanOrEqual,
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    Exists,
    NotExists,
    In,
    NotIn,
    Regex,
    IsEmpty,
    IsNotEmpty,
}

impl ConditionOperator {
    /// Operators that test presence/emptiness and take no comparison value.
    pub fn is_unary(&self) -> bool {
        matches!(
            self,
            ConditionOperator::Exists
                | ConditionOperator::NotExists
                | ConditionOperator::IsEmpty
                | ConditionOperator::IsNotEmpty
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Notification,
    Assignment,
    StatusUpdate,
    FieldUpdate,
    Webhook,
    Email,
    Sms,
    CreateDocument,
    UpdateInventory,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    WorkflowStarted,
    WorkflowCompleted,
    WorkflowSuspended,
    WorkflowResumed,
    WorkflowCancelled,
    StepActivated,
    StepCompleted,
    StepFailed,
    TransitionExecuted,
    ActionFailed,
}

/// A guard predicate evaluated against the instance context.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Condition {
    pub field: String,
    pub operator: ConditionOperator,
    #[serde(default)]
    pub value: JsonValue,
}

/// A side-effecting operation attached to a transition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionSpec {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub action_type: ActionType,
    #[serde(default)]
    pub config: JsonValue,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// Type-specific step configuration. The typed fields cover the engine's
/// own dispatch; automatic-step handlers read their parameters from `extra`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StepConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee_type: Option<AssigneeType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee_value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_minutes: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_fields: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_actions: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub auto_advance_conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub automatic_type: Option<AutomaticType>,
    #[serde(default, flatten)]
    pub extra: serde_json::Map<String, JsonValue>,
}

/// A guarded edge from one step to a target step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowTransition {
    pub name: String,
    pub target: String,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub actions: Vec<ActionSpec>,
}

/// A named node in the definition graph.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowStep {
    pub name: String,
    #[serde(rename = "type")]
    pub step_type: StepType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    #[serde(default)]
    pub config: StepConfig,
    #[serde(default)]
    pub transitions: Vec<WorkflowTransition>,
}

/// A versioned, named template describing a directed graph of steps.
///
/// Definitions are immutable once created; behavior changes mean a new
/// version. At most one version per name is active at any time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub version: i32,
    pub status: DefinitionStatus,
    pub device_types: Vec<String>,
    pub service_types: Vec<String>,
    pub customer_tiers: Vec<String>,
    pub steps: Vec<WorkflowStep>,
    pub metadata: JsonValue,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl WorkflowDefinition {
    pub fn step(&self, name: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Steps with no incoming transition anywhere in the definition.
    pub fn start_steps(&self) -> Vec<&WorkflowStep> {
        let targeted: std::collections::HashSet<&str> = self
            .steps
            .iter()
            .flat_map(|s| s.transitions.iter().map(|t| t.target.as_str()))
            .collect();
        self.steps
            .iter()
            .filter(|s| !targeted.contains(s.name.as_str()))
            .collect()
    }

    /// Steps with no outgoing transitions.
    pub fn end_steps(&self) -> Vec<&WorkflowStep> {
        self.steps.iter().filter(|s| s.transitions.is_empty()).collect()
    }
}

/// One running execution of a definition, bound to an external case.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: String,
    pub definition_id: String,
    pub definition_version: i32,
    pub case_ref: String,
    pub status: InstanceStatus,
    pub priority: i32,
    pub context: JsonValue,
    pub started_by: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Per-instance copy of a definition step, carrying its runtime status and
/// a config snapshot taken at instance-start time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStepInstance {
    pub id: String,
    pub instance_id: String,
    pub step_index: i32,
    pub step_name: String,
    pub step_type: StepType,
    pub config: StepConfig,
    pub status: StepInstanceStatus,
    pub activated_by: Option<String>,
    pub activated_at: Option<DateTime<Utc>>,
    pub completed_by: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
    pub execution_data: Option<JsonValue>,
    pub comment: Option<String>,
    pub error_message: Option<String>,
}

/// Append-only audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowEvent {
    pub id: String,
    pub instance_id: String,
    pub step_instance_id: Option<String>,
    pub event_type: EventType,
    pub payload: JsonValue,
    pub actor: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Durable schedule row for a wait step's forced completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepTimer {
    pub id: String,
    pub instance_id: String,
    pub step_instance_id: String,
    pub fire_at: DateTime<Utc>,
    pub fired: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateDefinitionParams {
    pub name: String,
    pub description: Option<String>,
    pub device_types: Vec<String>,
    pub service_types: Vec<String>,
    pub customer_tiers: Vec<String>,
    pub steps: Vec<WorkflowStep>,
    #[serde(default)]
    pub metadata: JsonValue,
    pub created_by: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartInstanceParams {
    pub definition_id: String,
    pub case_ref: String,
    #[serde(default)]
    pub context: JsonValue,
    pub started_by: String,
    pub priority: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteStepParams {
    pub instance_id: String,
    pub step_instance_id: String,
    pub action: String,
    #[serde(default)]
    pub data: JsonValue,
    pub executed_by: String,
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceListFilter {
    pub definition_id: Option<String>,
    pub status: Option<InstanceStatus>,
    pub limit: Option<i32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventFilter {
    pub instance_id: Option<String>,
    pub event_type: Option<EventType>,
    pub limit: Option<i32>,
    pub offset: Option<i32>,
}

/// Hydrated instance view returned to callers: the instance row, the names
/// of currently active steps, and the full step-instance list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceDetail {
    pub instance: WorkflowInstance,
    pub active_steps: Vec<String>,
    pub steps: Vec<WorkflowStepInstance>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(name: &str, targets: &[&str]) -> WorkflowStep {
        WorkflowStep {
            name: name.to_string(),
            step_type: StepType::Manual,
            position: None,
            config: StepConfig::default(),
            transitions: targets
                .iter()
                .map(|t| WorkflowTransition {
                    name: format!("to_{}", t),
                    target: t.to_string(),
                    conditions: vec![],
                    actions: vec![],
                })
                .collect(),
        }
    }

    fn definition(steps: Vec<WorkflowStep>) -> WorkflowDefinition {
        WorkflowDefinition {
            id: "def-1".to_string(),
            name: "test".to_string(),
            description: None,
            version: 1,
            status: DefinitionStatus::Draft,
            device_types: vec!["router".to_string()],
            service_types: vec!["repair".to_string()],
            customer_tiers: vec!["standard".to_string()],
            steps,
            metadata: serde_json::json!({}),
            created_by: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_start_and_end_steps() {
        let def = definition(vec![step("a", &["b"]), step("b", &["c"]), step("c", &[])]);

        let starts: Vec<&str> = def.start_steps().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(starts, vec!["a"]);

        let ends: Vec<&str> = def.end_steps().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(ends, vec!["c"]);
    }

    #[test]
    fn test_step_config_roundtrip_preserves_extra() {
        let raw = serde_json::json!({
            "assignee_type": "role",
            "assignee_value": "dispatcher",
            "timeout_minutes": 30,
            "field": "case.status",
            "expected": "ready"
        });
        let config: StepConfig = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(config.assignee_type, Some(AssigneeType::Role));
        assert_eq!(config.timeout_minutes, Some(30));
        assert_eq!(config.extra.get("field").unwrap(), "case.status");

        let back = serde_json::to_value(&config).unwrap();
        assert_eq!(back.get("expected").unwrap(), "ready");
    }

    #[test]
    fn test_condition_operator_tags() {
        let cond: Condition = serde_json::from_value(serde_json::json!({
            "field": "x",
            "operator": "greater_than_or_equal",
            "value": 5
        }))
        .unwrap();
        assert_eq!(cond.operator, ConditionOperator::GreaterThanOrEqual);
        assert!(!cond.operator.is_unary());
        assert!(ConditionOperator::NotExists.is_unary());
    }
}
