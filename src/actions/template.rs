//! `{{dot.path}}` template interpolation against the instance context.

use regex::Regex;
use serde_json::Value as JsonValue;
use std::sync::OnceLock;

use crate::conditions::lookup_path;

fn token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\s*([A-Za-z0-9_.\-]+)\s*\}\}").expect("static pattern"))
}

/// Interpolate every string found in `value` (recursing through arrays and
/// objects) against `context`. Unresolved tokens are left verbatim.
pub fn render_value(value: &JsonValue, context: &JsonValue) -> JsonValue {
    match value {
        JsonValue::String(s) => render_str(s, context),
        JsonValue::Array(items) => {
            JsonValue::Array(items.iter().map(|v| render_value(v, context)).collect())
        }
        JsonValue::Object(map) => JsonValue::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), render_value(v, context)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Interpolate one string. A string that is exactly one token substitutes
/// the raw JSON value, preserving its type; tokens embedded in a larger
/// string are stringified in place.
pub fn render_str(s: &str, context: &JsonValue) -> JsonValue {
    let trimmed = s.trim();
    if let Some(caps) = token_re().captures(trimmed) {
        if caps.get(0).map(|m| m.as_str()) == Some(trimmed) {
            let path = &caps[1];
            return match lookup_path(context, path) {
                Some(v) => v.clone(),
                None => JsonValue::String(s.to_string()),
            };
        }
    }

    let replaced = token_re().replace_all(s, |caps: &regex::Captures| {
        match lookup_path(context, &caps[1]) {
            Some(v) => stringify(v),
            // Leave the token verbatim so missing data is visible downstream.
            None => caps[0].to_string(),
        }
    });
    JsonValue::String(replaced.into_owned())
}

fn stringify(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        JsonValue::Null => String::new(),
        other => other.to_string(),
    }
}
