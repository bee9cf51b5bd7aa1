use std::cmp::Ordering;
use std::collections::HashMap;

use bizflow_core::{Condition, ConditionOperator};
use serde_json::Value;

/// Decides whether a step's conditions (or a `Condition` trigger) hold.
pub trait ConditionEvaluator: Send + Sync {
    fn evaluate(&self, condition: &Condition, variables: &HashMap<String, Value>) -> bool;

    fn evaluate_all(&self, conditions: &[Condition], variables: &HashMap<String, Value>) -> bool {
        conditions.iter().all(|c| self.evaluate(c, variables))
    }
}

/// Compares a named workflow variable against the condition value.
///
/// A missing variable and an explicit `null` are treated alike: neither
/// exists, and neither equals anything but `null`.
#[derive(Debug, Default, Clone, Copy)]
pub struct VariableConditionEvaluator;

impl ConditionEvaluator for VariableConditionEvaluator {
    fn evaluate(&self, condition: &Condition, variables: &HashMap<String, Value>) -> bool {
        let actual = variables.get(&condition.variable).unwrap_or(&Value::Null);
        let expected = condition.value.as_ref().unwrap_or(&Value::Null);

        match condition.operator {
            ConditionOperator::Exists => !actual.is_null(),
            ConditionOperator::NotExists => actual.is_null(),
            ConditionOperator::Equals => values_equal(actual, expected),
            ConditionOperator::NotEquals => !values_equal(actual, expected),
            ConditionOperator::GreaterThan => compare(actual, expected) == Some(Ordering::Greater),
            ConditionOperator::LessThan => compare(actual, expected) == Some(Ordering::Less),
            ConditionOperator::Contains => contains(actual, expected),
        }
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match haystack {
        Value::String(s) => needle.as_str().is_some_and(|n| s.contains(n)),
        Value::Array(items) => items.iter().any(|item| values_equal(item, needle)),
        Value::Object(map) => needle.as_str().is_some_and(|key| map.contains_key(key)),
        _ => false,
    }
}
