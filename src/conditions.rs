//! Guard-condition evaluation.
//!
//! Pure predicate evaluation over a JSON context document. Evaluation is
//! total: missing fields resolve to "undefined", bad coercions and invalid
//! patterns evaluate to false, and no operator ever panics or errors.

use serde_json::Value as JsonValue;

use crate::types::{Condition, ConditionOperator};

/// AND-evaluate a condition list. An empty list is vacuously true.
pub fn evaluate_conditions(conditions: &[Condition], context: &JsonValue) -> bool {
    conditions.iter().all(|c| evaluate_condition(c, context))
}

/// OR across groups, AND within each group. An empty group list is true,
/// consistent with [`evaluate_conditions`] on an empty list.
pub fn evaluate_condition_groups(groups: &[Vec<Condition>], context: &JsonValue) -> bool {
    if groups.is_empty() {
        return true;
    }
    groups.iter().any(|g| evaluate_conditions(g, context))
}

/// Evaluate a single condition against the context. Fail-closed: anything
/// that cannot be resolved or compared is false.
pub fn evaluate_condition(condition: &Condition, context: &JsonValue) -> bool {
    let field = lookup_path(context, &condition.field);
    let value = &condition.value;

    match condition.operator {
        ConditionOperator::Equals => field.map(|f| json_equals(f, value)).unwrap_or(false),
        ConditionOperator::NotEquals => field.map(|f| !json_equals(f, value)).unwrap_or(true),

        ConditionOperator::GreaterThan => compare_numeric(field, value, |a, b| a > b),
        ConditionOperator::LessThan => compare_numeric(field, value, |a, b| a < b),
        ConditionOperator::GreaterThanOrEqual => compare_numeric(field, value, |a, b| a >= b),
        ConditionOperator::LessThanOrEqual => compare_numeric(field, value, |a, b| a <= b),

        ConditionOperator::Contains => field.map(|f| contains_value(f, value)).unwrap_or(false),
        ConditionOperator::NotContains => field.map(|f| !contains_value(f, value)).unwrap_or(true),

        ConditionOperator::StartsWith => {
            match (field.and_then(as_text), as_text(value)) {
                (Some(f), Some(v)) => f.starts_with(&v),
                _ => false,
            }
        }
        ConditionOperator::EndsWith => {
            match (field.and_then(as_text), as_text(value)) {
                (Some(f), Some(v)) => f.ends_with(&v),
                _ => false,
            }
        }

        ConditionOperator::Exists => matches!(field, Some(v) if !v.is_null()),
        ConditionOperator::NotExists => !matches!(field, Some(v) if !v.is_null()),

        ConditionOperator::In => match value.as_array() {
            Some(items) => field
                .map(|f| items.iter().any(|v| json_equals(f, v)))
                .unwrap_or(false),
            None => false,
        },
        ConditionOperator::NotIn => match value.as_array() {
            Some(items) => !field
                .map(|f| items.iter().any(|v| json_equals(f, v)))
                .unwrap_or(false),
            None => false,
        },

        ConditionOperator::Regex => {
            let (Some(text), Some(pattern)) = (field.and_then(as_text), value.as_str()) else {
                return false;
            };
            match regex::Regex::new(pattern) {
                Ok(re) => re.is_match(&text),
                Err(_) => false,
            }
        }

        ConditionOperator::IsEmpty => field.map(is_empty_value).unwrap_or(true),
        ConditionOperator::IsNotEmpty => !field.map(is_empty_value).unwrap_or(true),
    }
}

/// Resolve a dot path (`order.lines.0.sku`) into the context. Objects are
/// traversed by key, arrays by numeric index. A missing segment yields None.
pub fn lookup_path<'a>(context: &'a JsonValue, path: &str) -> Option<&'a JsonValue> {
    let mut current = context;
    for segment in path.split('.') {
        current = match current {
            JsonValue::Object(map) => map.get(segment)?,
            JsonValue::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Best-effort numeric coercion: numbers as themselves, numeric strings
/// parsed. Everything else refuses to coerce.
pub(crate) fn as_number(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Scalar text coercion for the string operators.
fn as_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn compare_numeric(
    field: Option<&JsonValue>,
    value: &JsonValue,
    cmp: impl Fn(f64, f64) -> bool,
) -> bool {
    match (field.and_then(as_number), as_number(value)) {
        (Some(a), Some(b)) => cmp(a, b),
        _ => false,
    }
}

/// Loose equality: numeric cross-coercion first (so `"5"` equals `5`),
/// otherwise strict JSON value equality.
pub(crate) fn json_equals(a: &JsonValue, b: &JsonValue) -> bool {
    if let (Some(x), Some(y)) = (as_number(a), as_number(b)) {
        return x == y;
    }
    a == b
}

/// Membership dependent on the left operand's shape: case-insensitive
/// substring for strings, element membership for arrays, value membership
/// for objects.
fn contains_value(field: &JsonValue, needle: &JsonValue) -> bool {
    match field {
        JsonValue::String(s) => match as_text(needle) {
            Some(n) => s.to_lowercase().contains(&n.to_lowercase()),
            None => false,
        },
        JsonValue::Array(items) => items.iter().any(|v| json_equals(v, needle)),
        JsonValue::Object(map) => map.values().any(|v| json_equals(v, needle)),
        _ => false,
    }
}

fn is_empty_value(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => true,
        JsonValue::String(s) => s.is_empty(),
        JsonValue::Array(items) => items.is_empty(),
        JsonValue::Object(map) => map.is_empty(),
        _ => false,
    }
}
