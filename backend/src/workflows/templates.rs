// Personalization - {{placeholder}} rendering against a lead snapshot

use regex::{Captures, Regex};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::LazyLock;

use super::conditions::lookup;

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([^}|]+?)\s*(?:\|([^}]*))?\}\}").expect("placeholder pattern is valid"));

/// Replace `{{path}}` and `{{path|fallback}}` with values from `snapshot`.
/// Missing values render as the fallback, or as nothing.
pub fn render(template: &str, snapshot: &Value) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &Captures| {
            let path = &caps[1];
            match lookup(snapshot, path) {
                Some(value) => display(value),
                None => caps.get(2).map(|m| m.as_str().trim().to_string()).unwrap_or_default(),
            }
        })
        .into_owned()
}

/// Render every string inside a JSON document
pub fn render_value(value: &Value, snapshot: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(render(s, snapshot)),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), render_value(v, snapshot)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(|v| render_value(v, snapshot)).collect()),
        other => other.clone(),
    }
}

pub fn render_map(map: &BTreeMap<String, String>, snapshot: &Value) -> BTreeMap<String, String> {
    map.iter()
        .map(|(k, v)| (k.clone(), render(v, snapshot)))
        .collect()
}

fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Array(items) => items.iter().map(display).collect::<Vec<_>>().join(", "),
        other => other.to_string(),
    }
}
