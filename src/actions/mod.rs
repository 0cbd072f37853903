// Action execution module
//
// Dispatches named side-effecting operations independently of control flow:
// - Template interpolation of action config against the instance context
// - Best-effort, failure-isolated execution of transition action lists
// - Bounded-timeout webhook delivery
// - Automatic-step handlers (status_check, data_validation, calculation,
//   integration)

mod target;
pub mod template;

pub use target::{ActionTarget, LoggingTarget, RecordingTarget};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use std::sync::Arc;
use std::time::Duration;

use crate::conditions::{as_number, json_equals, lookup_path};
use crate::config::EngineSettings;
use crate::error::StepExecutionError;
use crate::types::{ActionSpec, ActionType, AutomaticType, StepConfig};

/// Outcome of one action, in its slot of the transition's action list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResult {
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub action_type: ActionType,
    pub success: bool,
    pub output: JsonValue,
    pub error: Option<String>,
}

pub struct ActionExecutor {
    http: reqwest::Client,
    target: Arc<dyn ActionTarget>,
    timeout: Duration,
}

impl ActionExecutor {
    pub fn new(settings: &EngineSettings) -> Self {
        Self::with_target(settings, Arc::new(LoggingTarget))
    }

    pub fn with_target(settings: &EngineSettings, target: Arc<dyn ActionTarget>) -> Self {
        Self {
            http: reqwest::Client::new(),
            target,
            timeout: Duration::from_secs(settings.action_timeout_secs),
        }
    }

    /// Execute a transition's actions in order. Actions are independent:
    /// a failure is captured in its result slot and never stops the rest.
    pub async fn execute_actions(
        &self,
        actions: &[ActionSpec],
        context: &JsonValue,
    ) -> Vec<ActionResult> {
        let mut results = Vec::with_capacity(actions.len());
        for action in actions {
            results.push(self.execute_action(action, context).await);
        }
        results
    }

    pub async fn execute_action(&self, action: &ActionSpec, context: &JsonValue) -> ActionResult {
        let rendered = template::render_value(&action.config, context);

        let outcome = tokio::time::timeout(
            self.timeout,
            self.dispatch(action.action_type, &rendered),
        )
        .await;

        match outcome {
            Ok(Ok(output)) => ActionResult {
                name: action.name.clone(),
                action_type: action.action_type,
                success: true,
                output,
                error: None,
            },
            Ok(Err(e)) => ActionResult {
                name: action.name.clone(),
                action_type: action.action_type,
                success: false,
                output: JsonValue::Null,
                error: Some(format!("{e:#}")),
            },
            Err(_) => ActionResult {
                name: action.name.clone(),
                action_type: action.action_type,
                success: false,
                output: JsonValue::Null,
                error: Some(format!("timed out after {}s", self.timeout.as_secs())),
            },
        }
    }

    async fn dispatch(
        &self,
        action_type: ActionType,
        config: &JsonValue,
    ) -> anyhow::Result<JsonValue> {
        match action_type {
            ActionType::Webhook => self.post_webhook(config).await,
            other => self.target.deliver(other, config).await,
        }
    }

    /// Outbound webhook call. Transport failures and non-success statuses
    /// surface as errors for the caller to capture; they never propagate
    /// past the action result.
    async fn post_webhook(&self, config: &JsonValue) -> anyhow::Result<JsonValue> {
        let url = config
            .get("url")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("webhook action requires a url"))?;
        let method = config
            .get("method")
            .and_then(|v| v.as_str())
            .unwrap_or("post")
            .to_lowercase();
        let body = config.get("body").cloned().unwrap_or_else(|| json!({}));

        let request = match method.as_str() {
            "post" => self.http.post(url).json(&body),
            "put" => self.http.put(url).json(&body),
            "get" => self.http.get(url),
            other => anyhow::bail!("unsupported webhook method '{}'", other),
        };

        let response = request
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("webhook call to {} failed: {}", url, e))?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("webhook {} returned status {}", url, status.as_u16());
        }
        Ok(json!({ "status": status.as_u16(), "ok": true }))
    }

    /// Run an automatic step's logic against the current context. A missing
    /// or unrecognized `automatic_type` is a no-op success; handler failures
    /// fail only the owning step instance.
    pub async fn execute_automatic_step(
        &self,
        config: &StepConfig,
        context: &JsonValue,
    ) -> Result<JsonValue, StepExecutionError> {
        match config.automatic_type {
            None => Ok(json!({ "automatic": "noop" })),
            Some(AutomaticType::StatusCheck) => self.run_status_check(config, context),
            Some(AutomaticType::DataValidation) => self.run_data_validation(config, context),
            Some(AutomaticType::Calculation) => self.run_calculation(config, context),
            Some(AutomaticType::Integration) => self.run_integration(config, context).await,
        }
    }

    fn run_status_check(
        &self,
        config: &StepConfig,
        context: &JsonValue,
    ) -> Result<JsonValue, StepExecutionError> {
        let field = config
            .extra
            .get("field")
            .and_then(|v| v.as_str())
            .ok_or_else(|| StepExecutionError::new("status_check requires a field"))?;
        let expected = config.extra.get("expected").cloned().unwrap_or(JsonValue::Null);

        let actual = lookup_path(context, field).cloned().unwrap_or(JsonValue::Null);
        if json_equals(&actual, &expected) {
            Ok(json!({ "check": field, "passed": true, "actual": actual }))
        } else {
            Err(StepExecutionError::new(format!(
                "status check failed: {} is {}, expected {}",
                field, actual, expected
            )))
        }
    }

    fn run_data_validation(
        &self,
        config: &StepConfig,
        context: &JsonValue,
    ) -> Result<JsonValue, StepExecutionError> {
        let required = config.required_fields.as_deref().unwrap_or(&[]);
        let missing: Vec<&str> = required
            .iter()
            .map(String::as_str)
            .filter(|f| {
                lookup_path(context, f)
                    .map(|v| v.is_null() || v.as_str().is_some_and(str::is_empty))
                    .unwrap_or(true)
            })
            .collect();

        if missing.is_empty() {
            Ok(json!({ "validated": required.len() }))
        } else {
            Err(StepExecutionError::new(format!(
                "data validation failed: missing required fields: {}",
                missing.join(", ")
            )))
        }
    }

    fn run_calculation(
        &self,
        config: &StepConfig,
        context: &JsonValue,
    ) -> Result<JsonValue, StepExecutionError> {
        let operation = config
            .extra
            .get("operation")
            .and_then(|v| v.as_str())
            .unwrap_or("sum");
        let operands = config
            .extra
            .get("operands")
            .and_then(|v| v.as_array())
            .ok_or_else(|| StepExecutionError::new("calculation requires an operands array"))?;
        let output_field = config
            .extra
            .get("output_field")
            .and_then(|v| v.as_str())
            .unwrap_or("result");

        let mut values = Vec::with_capacity(operands.len());
        for operand in operands {
            // Field paths resolve through the context; literals coerce directly.
            let resolved = match operand {
                JsonValue::String(path) => lookup_path(context, path)
                    .and_then(as_number)
                    .or_else(|| as_number(operand)),
                other => as_number(other),
            };
            values.push(resolved.ok_or_else(|| {
                StepExecutionError::new(format!("calculation operand {} is not numeric", operand))
            })?);
        }

        let Some((&first, rest)) = values.split_first() else {
            return Err(StepExecutionError::new("calculation requires at least one operand"));
        };

        let result = match operation {
            "sum" => values.iter().sum::<f64>(),
            "subtract" => rest.iter().fold(first, |acc, v| acc - v),
            "multiply" => values.iter().product::<f64>(),
            "divide" => {
                if rest.iter().any(|&v| v == 0.0) {
                    return Err(StepExecutionError::new("calculation divides by zero"));
                }
                rest.iter().fold(first, |acc, v| acc / v)
            }
            other => {
                return Err(StepExecutionError::new(format!(
                    "unknown calculation operation '{}'",
                    other
                )))
            }
        };

        Ok(json!({ output_field: result }))
    }

    async fn run_integration(
        &self,
        config: &StepConfig,
        context: &JsonValue,
    ) -> Result<JsonValue, StepExecutionError> {
        let service = config
            .extra
            .get("service")
            .and_then(|v| v.as_str())
            .ok_or_else(|| StepExecutionError::new("integration requires a service"))?;
        let payload = template::render_value(
            config.extra.get("payload").unwrap_or(&JsonValue::Null),
            context,
        );

        // Integrations ride the target's notification channel with the
        // service name in the envelope.
        let delivery = tokio::time::timeout(
            self.timeout,
            self.target
                .deliver(ActionType::Notification, &json!({ "service": service, "payload": payload })),
        )
        .await;

        match delivery {
            Ok(Ok(response)) => Ok(json!({ "service": service, "response": response })),
            Ok(Err(e)) => Err(StepExecutionError::new(format!(
                "integration {} failed: {:#}",
                service, e
            ))),
            Err(_) => Err(StepExecutionError::new(format!(
                "integration {} timed out after {}s",
                service,
                self.timeout.as_secs()
            ))),
        }
    }
}
