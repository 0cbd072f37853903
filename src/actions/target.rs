//! Outbound collaborator seam for non-webhook action channels.

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::types::ActionType;

/// The uniform black box every side-effect channel is delivered through:
/// notification, assignment, status/field updates, email, sms, document
/// creation, inventory updates. Webhooks carry their own URL and are
/// dispatched directly by the executor.
#[async_trait]
pub trait ActionTarget: Send + Sync {
    async fn deliver(&self, action_type: ActionType, payload: &JsonValue)
        -> anyhow::Result<JsonValue>;
}

/// Default target: emits the side effect as a structured log record,
/// at-most-once. Deployments wire a real integration in its place.
pub struct LoggingTarget;

#[async_trait]
impl ActionTarget for LoggingTarget {
    async fn deliver(
        &self,
        action_type: ActionType,
        payload: &JsonValue,
    ) -> anyhow::Result<JsonValue> {
        tracing::info!(action = ?action_type, %payload, "action emitted");
        Ok(JsonValue::Bool(true))
    }
}

/// Test target that records deliveries and can be told to fail a channel.
pub struct RecordingTarget {
    pub deliveries: std::sync::Mutex<Vec<(ActionType, JsonValue)>>,
    pub fail_on: Option<ActionType>,
}

impl RecordingTarget {
    pub fn new() -> Self {
        Self {
            deliveries: std::sync::Mutex::new(Vec::new()),
            fail_on: None,
        }
    }

    pub fn failing_on(action_type: ActionType) -> Self {
        Self {
            fail_on: Some(action_type),
            ..Self::new()
        }
    }
}

impl Default for RecordingTarget {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ActionTarget for RecordingTarget {
    async fn deliver(
        &self,
        action_type: ActionType,
        payload: &JsonValue,
    ) -> anyhow::Result<JsonValue> {
        if self.fail_on == Some(action_type) {
            anyhow::bail!("delivery refused for {:?}", action_type);
        }
        self.deliveries
            .lock()
            .expect("recording target lock")
            .push((action_type, payload.clone()));
        Ok(JsonValue::Bool(true))
    }
}
