//! Pure traversal core of the engine.
//!
//! Activation and completion chains run on an explicit FIFO work queue
//! drained inside the engine's per-instance transaction, so pathological
//! graphs cannot grow the call stack and the serialization point stays in
//! one place. Everything here is side-effect free.

use serde_json::Value as JsonValue;
use std::collections::VecDeque;

use crate::conditions::evaluate_conditions;
use crate::types::{StepConfig, WorkflowStep, WorkflowTransition};

/// One unit of work on the engine's queue.
#[derive(Debug, Clone)]
pub enum WorkItem {
    /// Move a pending step to active and apply its activation behavior.
    Activate { step_name: String, actor: String },
    /// Complete an active step and traverse its outgoing transitions.
    Complete {
        step_name: String,
        action: String,
        data: JsonValue,
        executed_by: String,
        comment: Option<String>,
    },
}

pub type WorkQueue = VecDeque<WorkItem>;

/// The outgoing transitions whose guard conditions pass against the
/// context. AND semantics; an unguarded transition always fires.
pub fn fired_transitions<'a>(
    step: &'a WorkflowStep,
    context: &JsonValue,
) -> Vec<&'a WorkflowTransition> {
    step.transitions
        .iter()
        .filter(|t| evaluate_conditions(&t.conditions, context))
        .collect()
}

/// Whether a newly-activated step should immediately self-complete.
pub fn should_auto_advance(config: &StepConfig, context: &JsonValue) -> bool {
    !config.auto_advance_conditions.is_empty()
        && evaluate_conditions(&config.auto_advance_conditions, context)
}

/// Shallow-merge step output into the instance context. Non-object output
/// is kept on the step instance's execution data only.
pub fn merge_context(context: &mut JsonValue, data: &JsonValue) {
    let JsonValue::Object(incoming) = data else {
        return;
    };
    if incoming.is_empty() {
        return;
    }
    match context {
        JsonValue::Object(existing) => {
            for (key, value) in incoming {
                existing.insert(key.clone(), value.clone());
            }
        }
        other => *other = data.clone(),
    }
}
