// Workflow Conditions - Predicates over a lead's attributes for triggers, branches and waits

use chrono::{DateTime, Duration, NaiveDate, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{LazyLock, Mutex};
use thiserror::Error;
use tracing::warn;

/// Compiled rule patterns, shared by every evaluation
static PATTERNS: LazyLock<Mutex<HashMap<String, Regex>>> = LazyLock::new(Default::default);
const PATTERN_CACHE_LIMIT: usize = 512;

/// Malformed rule data. Never fatal: callers treat it as "does not match".
#[derive(Debug, Error)]
pub enum ConditionError {
    #[error("invalid regex pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("field '{field}' holds an unparsable date: {value}")]
    InvalidDate { field: String, value: String },
    #[error("operator '{operator}' requires {expected}")]
    InvalidOperand { operator: &'static str, expected: &'static str },
}

/// How the children of a group (or a list of groups) are combined
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogicMode {
    #[default]
    #[serde(rename = "AND", alias = "and")]
    And,
    #[serde(rename = "OR", alias = "or")]
    Or,
}

/// Condition operators
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    // Equality
    Equals,
    NotEquals,

    // String operations
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    Regex,

    // Numeric / date thresholds
    GreaterThan,
    GreaterThanOrEquals,
    LessThan,
    LessThanOrEquals,

    // Membership
    In,
    NotIn,

    // Presence
    IsEmpty,
    IsNotEmpty,

    // Tags
    HasTag,
    LacksTag,

    // Dates
    DateBefore,
    DateAfter,
    DateReached,
}

impl ConditionOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Equals => "equals",
            Self::NotEquals => "not_equals",
            Self::Contains => "contains",
            Self::NotContains => "not_contains",
            Self::StartsWith => "starts_with",
            Self::EndsWith => "ends_with",
            Self::Regex => "regex",
            Self::GreaterThan => "greater_than",
            Self::GreaterThanOrEquals => "greater_than_or_equals",
            Self::LessThan => "less_than",
            Self::LessThanOrEquals => "less_than_or_equals",
            Self::In => "in",
            Self::NotIn => "not_in",
            Self::IsEmpty => "is_empty",
            Self::IsNotEmpty => "is_not_empty",
            Self::HasTag => "has_tag",
            Self::LacksTag => "lacks_tag",
            Self::DateBefore => "date_before",
            Self::DateAfter => "date_after",
            Self::DateReached => "date_reached",
        }
    }
}

/// A single comparison against one lead field
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Condition {
    /// Field name to evaluate (supports dot notation for nested fields)
    pub field: String,
    pub operator: ConditionOperator,
    /// Value to compare against. Unused by presence operators; for `date_reached`
    /// an optional offset in days.
    #[serde(default)]
    pub value: Value,
}

/// Group of conditions with AND/OR logic
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConditionGroup {
    #[serde(default)]
    pub logic: LogicMode,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// Nested condition groups for complex logic
    #[serde(default)]
    pub groups: Vec<ConditionGroup>,
}

impl Condition {
    pub fn new(field: &str, operator: ConditionOperator, value: Value) -> Self {
        Self {
            field: field.to_string(),
            operator,
            value,
        }
    }

    pub fn equals(field: &str, value: Value) -> Self {
        Self::new(field, ConditionOperator::Equals, value)
    }

    pub fn not_equals(field: &str, value: Value) -> Self {
        Self::new(field, ConditionOperator::NotEquals, value)
    }

    pub fn contains(field: &str, value: &str) -> Self {
        Self::new(field, ConditionOperator::Contains, Value::String(value.to_string()))
    }

    pub fn greater_than(field: &str, value: f64) -> Self {
        Self::new(field, ConditionOperator::GreaterThan, serde_json::json!(value))
    }

    pub fn less_than(field: &str, value: f64) -> Self {
        Self::new(field, ConditionOperator::LessThan, serde_json::json!(value))
    }

    pub fn in_list(field: &str, values: Vec<Value>) -> Self {
        Self::new(field, ConditionOperator::In, Value::Array(values))
    }

    pub fn has_tag(tag: &str) -> Self {
        Self::new("tags", ConditionOperator::HasTag, Value::String(tag.to_string()))
    }

    pub fn lacks_tag(tag: &str) -> Self {
        Self::new("tags", ConditionOperator::LacksTag, Value::String(tag.to_string()))
    }

    pub fn date_reached(field: &str) -> Self {
        Self::new(field, ConditionOperator::DateReached, Value::Null)
    }

    pub fn regex(field: &str, pattern: &str) -> Self {
        Self::new(field, ConditionOperator::Regex, Value::String(pattern.to_string()))
    }

    /// Evaluate against a lead snapshot. A missing field never matches.
    pub fn try_evaluate(&self, snapshot: &Value, now: DateTime<Utc>) -> Result<bool, ConditionError> {
        let Some(actual) = lookup(snapshot, &self.field) else {
            return Ok(false);
        };

        let expected = &self.value;

        let matched = match self.operator {
            ConditionOperator::Equals => values_equal(actual, expected),
            ConditionOperator::NotEquals => !values_equal(actual, expected),
            ConditionOperator::Contains => contains(actual, expected),
            ConditionOperator::NotContains => !contains(actual, expected),
            ConditionOperator::StartsWith => match (actual.as_str(), expected.as_str()) {
                (Some(s), Some(p)) => s.to_lowercase().starts_with(&p.to_lowercase()),
                _ => false,
            },
            ConditionOperator::EndsWith => match (actual.as_str(), expected.as_str()) {
                (Some(s), Some(p)) => s.to_lowercase().ends_with(&p.to_lowercase()),
                _ => false,
            },
            ConditionOperator::Regex => {
                let pattern = expected.as_str().ok_or(ConditionError::InvalidOperand {
                    operator: "regex",
                    expected: "a string pattern",
                })?;
                let re = compiled(pattern).map_err(|source| ConditionError::InvalidPattern {
                    pattern: pattern.to_string(),
                    source,
                })?;
                actual.as_str().map(|s| re.is_match(s)).unwrap_or(false)
            }
            ConditionOperator::GreaterThan => compare(actual, expected).is_some_and(|o| o.is_gt()),
            ConditionOperator::GreaterThanOrEquals => compare(actual, expected).is_some_and(|o| o.is_ge()),
            ConditionOperator::LessThan => compare(actual, expected).is_some_and(|o| o.is_lt()),
            ConditionOperator::LessThanOrEquals => compare(actual, expected).is_some_and(|o| o.is_le()),
            ConditionOperator::In => {
                let list = expected.as_array().ok_or(ConditionError::InvalidOperand {
                    operator: "in",
                    expected: "an array",
                })?;
                list.iter().any(|v| values_equal(actual, v))
            }
            ConditionOperator::NotIn => {
                let list = expected.as_array().ok_or(ConditionError::InvalidOperand {
                    operator: "not_in",
                    expected: "an array",
                })?;
                !list.iter().any(|v| values_equal(actual, v))
            }
            ConditionOperator::IsEmpty => is_empty(actual),
            ConditionOperator::IsNotEmpty => !is_empty(actual),
            ConditionOperator::HasTag => has_tag(actual, expected),
            ConditionOperator::LacksTag => !has_tag(actual, expected),
            ConditionOperator::DateBefore | ConditionOperator::DateAfter => {
                let field_date = parse_date(actual).ok_or_else(|| ConditionError::InvalidDate {
                    field: self.field.clone(),
                    value: actual.to_string(),
                })?;
                let threshold = parse_date(expected).ok_or_else(|| ConditionError::InvalidDate {
                    field: format!("{} (threshold)", self.field),
                    value: expected.to_string(),
                })?;
                if self.operator == ConditionOperator::DateBefore {
                    field_date < threshold
                } else {
                    field_date > threshold
                }
            }
            ConditionOperator::DateReached => {
                let field_date = parse_date(actual).ok_or_else(|| ConditionError::InvalidDate {
                    field: self.field.clone(),
                    value: actual.to_string(),
                })?;
                let offset_days = match expected {
                    Value::Null => 0,
                    other => other.as_i64().ok_or(ConditionError::InvalidOperand {
                        operator: "date_reached",
                        expected: "a whole number of days",
                    })?,
                };
                let reached_at = Duration::try_days(offset_days)
                    .and_then(|offset| field_date.checked_add_signed(offset))
                    .ok_or_else(|| ConditionError::InvalidDate {
                        field: self.field.clone(),
                        value: format!("{} + {} days", actual, offset_days),
                    })?;
                reached_at <= now
            }
        };

        Ok(matched)
    }
}

impl ConditionGroup {
    pub fn and(conditions: Vec<Condition>) -> Self {
        Self {
            logic: LogicMode::And,
            conditions,
            groups: Vec::new(),
        }
    }

    pub fn or(conditions: Vec<Condition>) -> Self {
        Self {
            logic: LogicMode::Or,
            conditions,
            groups: Vec::new(),
        }
    }

    pub fn with_nested_group(mut self, group: ConditionGroup) -> Self {
        self.groups.push(group);
        self
    }

    pub fn add_condition(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    /// Recursive evaluation. AND of nothing holds, OR of nothing does not.
    pub fn try_evaluate(&self, snapshot: &Value, now: DateTime<Utc>) -> Result<bool, ConditionError> {
        match self.logic {
            LogicMode::And => {
                for condition in &self.conditions {
                    if !condition.try_evaluate(snapshot, now)? {
                        return Ok(false);
                    }
                }
                for group in &self.groups {
                    if !group.try_evaluate(snapshot, now)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            LogicMode::Or => {
                for condition in &self.conditions {
                    if condition.try_evaluate(snapshot, now)? {
                        return Ok(true);
                    }
                }
                for group in &self.groups {
                    if group.try_evaluate(snapshot, now)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
        }
    }
}

/// Combine top-level groups under `mode`. An empty list always matches.
pub fn try_evaluate_groups(
    groups: &[ConditionGroup],
    mode: LogicMode,
    snapshot: &Value,
    now: DateTime<Utc>,
) -> Result<bool, ConditionError> {
    if groups.is_empty() {
        return Ok(true);
    }

    match mode {
        LogicMode::And => {
            for group in groups {
                if !group.try_evaluate(snapshot, now)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        LogicMode::Or => {
            for group in groups {
                if group.try_evaluate(snapshot, now)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
    }
}

/// Infallible form of [`try_evaluate_groups`]: malformed data is logged and does not match.
pub fn evaluate_groups(groups: &[ConditionGroup], mode: LogicMode, snapshot: &Value, now: DateTime<Utc>) -> bool {
    match try_evaluate_groups(groups, mode, snapshot, now) {
        Ok(matched) => matched,
        Err(e) => {
            warn!(error = %e, "Condition evaluation failed, treating as non-match");
            false
        }
    }
}

/// Resolve a dot-separated path inside a JSON document. Null counts as missing.
pub fn lookup<'a>(json: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = json;

    for part in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }

    if current.is_null() { None } else { Some(current) }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn values_equal(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::String(a), Value::String(b)) => a.eq_ignore_ascii_case(b),
        (Value::Number(_), _) | (_, Value::Number(_)) => match (as_number(actual), as_number(expected)) {
            (Some(a), Some(b)) => a == b,
            _ => actual == expected,
        },
        _ => actual == expected,
    }
}

fn contains(actual: &Value, expected: &Value) -> bool {
    match actual {
        Value::String(s) => expected
            .as_str()
            .map(|p| s.to_lowercase().contains(&p.to_lowercase()))
            .unwrap_or(false),
        Value::Array(items) => items.iter().any(|v| values_equal(v, expected)),
        _ => false,
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

fn has_tag(actual: &Value, tag: &Value) -> bool {
    let Some(tag) = tag.as_str() else {
        return false;
    };

    match actual {
        Value::Array(items) => items
            .iter()
            .filter_map(Value::as_str)
            .any(|t| t.trim().eq_ignore_ascii_case(tag)),
        Value::String(s) => s.split(',').any(|t| t.trim().eq_ignore_ascii_case(tag)),
        _ => false,
    }
}

fn compare(actual: &Value, expected: &Value) -> Option<std::cmp::Ordering> {
    if let (Some(a), Some(b)) = (as_number(actual), as_number(expected)) {
        return a.partial_cmp(&b);
    }

    match (parse_date(actual), parse_date(expected)) {
        (Some(a), Some(b)) => Some(a.cmp(&b)),
        _ => None,
    }
}

/// Accepts RFC 3339 timestamps, plain `YYYY-MM-DD` dates (midnight UTC) and unix seconds.
/// Compile once per distinct pattern. Failures are not cached.
fn compiled(pattern: &str) -> Result<Regex, regex::Error> {
    if let Some(re) = PATTERNS.lock().ok().and_then(|cache| cache.get(pattern).cloned()) {
        return Ok(re);
    }

    let re = Regex::new(pattern)?;
    if let Ok(mut cache) = PATTERNS.lock() {
        if cache.len() >= PATTERN_CACHE_LIMIT {
            cache.clear();
        }
        cache.insert(pattern.to_string(), re.clone());
    }
    Ok(re)
}

pub fn parse_date(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => {
            let s = s.trim();
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.with_timezone(&Utc));
            }
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|naive| naive.and_utc())
        }
        Value::Number(n) => n.as_i64().and_then(|secs| DateTime::from_timestamp(secs, 0)),
        _ => None,
    }
}

/// Common condition presets for admissions workflows
pub mod presets {
    use super::*;

    pub fn status(status: &str) -> Condition {
        Condition::equals("status", serde_json::json!(status))
    }

    pub fn converted() -> Condition {
        status("converted")
    }

    pub fn stage(stage: &str) -> Condition {
        Condition::equals("stage", serde_json::json!(stage))
    }

    pub fn program(program_name: &str) -> Condition {
        Condition::equals("programName", serde_json::json!(program_name))
    }

    pub fn score_at_least(score: f64) -> Condition {
        Condition::new("score", ConditionOperator::GreaterThanOrEquals, serde_json::json!(score))
    }

    pub fn unassigned() -> Condition {
        Condition::new("advisor", ConditionOperator::IsEmpty, Value::Null)
    }

    /// Deadline is `days_before` days away or has passed.
    pub fn application_deadline_within(days_before: i64) -> Condition {
        Condition::new(
            "applicationDeadline",
            ConditionOperator::DateReached,
            serde_json::json!(-days_before),
        )
    }
}
