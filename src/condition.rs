//! Conditional edge evaluation.
//!
//! A condition decides whether an edge fires, based on the state the source
//! node returned. Conditions read state; they never mutate it.

use crate::state::WorkflowState;
use serde::{Deserialize, Serialize};

/// A predicate over workflow state attached to an edge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Condition {
    /// Always satisfied
    Always,
    /// Never satisfied
    Never,
    /// Satisfied if the key equals the value
    Equals { key: String, value: serde_json::Value },
    /// Satisfied if the key holds `true`
    IsTrue { key: String },
    /// Satisfied if the key holds `false` or is absent
    IsFalse { key: String },
    /// Satisfied if the key is present
    Exists { key: String },
    /// Satisfied if the key's string value matches the regex
    Matches { key: String, pattern: String },
    /// Satisfied if the key's numeric value is >= the threshold
    AtLeast { key: String, value: f64 },
    /// Satisfied if the key's numeric value is < the threshold
    LessThan { key: String, value: f64 },
    /// Satisfied if every nested condition is satisfied
    All(Vec<Condition>),
    /// Satisfied if any nested condition is satisfied
    Any(Vec<Condition>),
    /// Negation
    Not(Box<Condition>),
}

impl Condition {
    pub fn always() -> Self {
        Condition::Always
    }

    pub fn never() -> Self {
        Condition::Never
    }

    pub fn equals(key: impl Into<String>, value: serde_json::Value) -> Self {
        Condition::Equals { key: key.into(), value }
    }

    pub fn is_true(key: impl Into<String>) -> Self {
        Condition::IsTrue { key: key.into() }
    }

    pub fn is_false(key: impl Into<String>) -> Self {
        Condition::IsFalse { key: key.into() }
    }

    pub fn exists(key: impl Into<String>) -> Self {
        Condition::Exists { key: key.into() }
    }

    pub fn matches(key: impl Into<String>, pattern: impl Into<String>) -> Self {
        Condition::Matches { key: key.into(), pattern: pattern.into() }
    }

    pub fn at_least(key: impl Into<String>, value: f64) -> Self {
        Condition::AtLeast { key: key.into(), value }
    }

    pub fn lt(key: impl Into<String>, value: f64) -> Self {
        Condition::LessThan { key: key.into(), value }
    }

    /// Combine with AND.
    pub fn and(self, other: Condition) -> Self {
        match self {
            Condition::All(mut inner) => {
                inner.push(other);
                Condition::All(inner)
            }
            left => Condition::All(vec![left, other]),
        }
    }

    /// Combine with OR.
    pub fn or(self, other: Condition) -> Self {
        match self {
            Condition::Any(mut inner) => {
                inner.push(other);
                Condition::Any(inner)
            }
            left => Condition::Any(vec![left, other]),
        }
    }

    /// Negate this condition.
    pub fn not(self) -> Self {
        Condition::Not(Box::new(self))
    }

    /// Evaluate against workflow state.
    pub fn evaluate(&self, state: &WorkflowState) -> bool {
        match self {
            Condition::Always => true,
            Condition::Never => false,

            Condition::Equals { key, value } => {
                state.get(key).map(|v| v == value).unwrap_or(false)
            }

            Condition::IsTrue { key } => {
                state.get(key).and_then(|v| v.as_bool()).unwrap_or(false)
            }

            Condition::IsFalse { key } => {
                !state.get(key).and_then(|v| v.as_bool()).unwrap_or(false)
            }

            Condition::Exists { key } => state.contains(key),

            Condition::Matches { key, pattern } => {
                let Some(text) = state.get(key).and_then(|v| v.as_str()) else {
                    return false;
                };
                regex::Regex::new(pattern)
                    .map(|re| re.is_match(text))
                    .unwrap_or(false)
            }

            Condition::AtLeast { key, value } => state
                .get(key)
                .and_then(|v| v.as_f64())
                .map(|v| v >= *value)
                .unwrap_or(false),

            Condition::LessThan { key, value } => state
                .get(key)
                .and_then(|v| v.as_f64())
                .map(|v| v < *value)
                .unwrap_or(false),

            Condition::All(conditions) => conditions.iter().all(|c| c.evaluate(state)),

            Condition::Any(conditions) => conditions.iter().any(|c| c.evaluate(state)),

            Condition::Not(inner) => !inner.evaluate(state),
        }
    }

    /// Human-readable form, used in logs.
    pub fn description(&self) -> String {
        match self {
            Condition::Always => "always".to_string(),
            Condition::Never => "never".to_string(),
            Condition::Equals { key, value } => format!("{} == {}", key, value),
            Condition::IsTrue { key } => format!("{} is true", key),
            Condition::IsFalse { key } => format!("{} is false", key),
            Condition::Exists { key } => format!("{} exists", key),
            Condition::Matches { key, pattern } => format!("{} =~ /{}/", key, pattern),
            Condition::AtLeast { key, value } => format!("{} >= {}", key, value),
            Condition::LessThan { key, value } => format!("{} < {}", key, value),
            Condition::All(conditions) => {
                let parts: Vec<_> = conditions.iter().map(|c| c.description()).collect();
                format!("({})", parts.join(" AND "))
            }
            Condition::Any(conditions) => {
                let parts: Vec<_> = conditions.iter().map(|c| c.description()).collect();
                format!("({})", parts.join(" OR "))
            }
            Condition::Not(inner) => format!("NOT ({})", inner.description()),
        }
    }
}

impl Default for Condition {
    fn default() -> Self {
        Condition::Always
    }
}
