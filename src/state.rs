//! Workflow state management.
//!
//! The state is the working data of a run. It is handed to every node and
//! returned from every node; concurrent branches each receive their own
//! clone, and a completing branch's top-level keys are folded back into the
//! run's trunk state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use uuid::Uuid;

/// Record of a single node invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionStep {
    /// Node that was invoked
    pub node_id: String,
    /// When the invocation started
    pub started_at: DateTime<Utc>,
    /// When the invocation finished
    pub finished_at: Option<DateTime<Utc>>,
    /// Whether the invocation succeeded
    pub success: bool,
    /// Brief summary of what happened
    pub summary: String,
}

/// Workflow state - passed into and returned from every node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowState {
    /// Unique run identifier
    pub run_id: String,
    /// Arbitrary state data
    pub data: HashMap<String, JsonValue>,
    /// Invocation history
    pub history: Vec<ExecutionStep>,
    /// When the run started
    pub started_at: DateTime<Utc>,
    /// When the run finished, if it has
    pub finished_at: Option<DateTime<Utc>>,
}

impl WorkflowState {
    /// Create an empty state for a fresh run.
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            data: HashMap::new(),
            history: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Create a state pre-populated from key/value pairs.
    pub fn with_data(data: HashMap<String, JsonValue>) -> Self {
        let mut state = Self::new();
        state.data = data;
        state
    }

    /// Get a value from state.
    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.data.get(key)
    }

    /// Get a value as a specific type.
    pub fn get_as<T: for<'de> Deserialize<'de>>(&self, key: &str) -> Option<T> {
        self.data.get(key).and_then(|v| T::deserialize(v.clone()).ok())
    }

    /// Set a value in state.
    pub fn set(&mut self, key: impl Into<String>, value: JsonValue) {
        self.data.insert(key.into(), value);
    }

    /// Set a typed value.
    pub fn set_typed<T: Serialize>(&mut self, key: impl Into<String>, value: &T) {
        if let Ok(json) = serde_json::to_value(value) {
            self.data.insert(key.into(), json);
        }
    }

    /// Check if a key exists.
    pub fn contains(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    /// Remove a key.
    pub fn remove(&mut self, key: &str) -> Option<JsonValue> {
        self.data.remove(key)
    }

    /// Fold another state's data into this one. Top-level keys overwrite;
    /// there is no merge into nested structures.
    pub fn absorb(&mut self, other: &WorkflowState) {
        for (key, value) in &other.data {
            self.data.insert(key.clone(), value.clone());
        }
    }

    /// Record the start of a node invocation.
    pub(crate) fn record_start(&mut self, node_id: impl Into<String>) {
        self.history.push(ExecutionStep {
            node_id: node_id.into(),
            started_at: Utc::now(),
            finished_at: None,
            success: false,
            summary: String::new(),
        });
    }

    /// Record the end of a node invocation. Matches the most recent open
    /// step for the node, so interleaved parallel branches stay attributed
    /// correctly.
    pub(crate) fn record_finish(&mut self, node_id: &str, success: bool, summary: impl Into<String>) {
        if let Some(step) = self
            .history
            .iter_mut()
            .rev()
            .find(|s| s.node_id == node_id && s.finished_at.is_none())
        {
            step.finished_at = Some(Utc::now());
            step.success = success;
            step.summary = summary.into();
        }
    }

    /// Mark the run as finished.
    pub(crate) fn mark_finished(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    /// Whether the run has finished.
    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }

    /// Node ids of completed invocations, in completion order.
    pub fn visited(&self) -> Vec<&str> {
        self.history
            .iter()
            .filter(|s| s.finished_at.is_some())
            .map(|s| s.node_id.as_str())
            .collect()
    }
}

impl Default for WorkflowState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_basic_operations() {
        let mut state = WorkflowState::new();

        state.set("answer", json!(42));
        state.set("greeting", json!("hello"));

        assert_eq!(state.get("answer"), Some(&json!(42)));
        assert_eq!(state.get("greeting"), Some(&json!("hello")));
        assert!(state.contains("answer"));
        assert!(!state.contains("missing"));

        state.remove("answer");
        assert!(!state.contains("answer"));
    }

    #[test]
    fn test_typed_operations() {
        let mut state = WorkflowState::new();

        #[derive(Serialize, Deserialize, PartialEq, Debug)]
        struct Payload {
            count: i32,
            name: String,
        }

        let payload = Payload { count: 7, name: "seven".into() };
        state.set_typed("payload", &payload);

        let back: Payload = state.get_as("payload").unwrap();
        assert_eq!(payload, back);
    }

    #[test]
    fn test_absorb_overwrites_top_level_keys() {
        let mut trunk = WorkflowState::new();
        trunk.set("kept", json!(1));
        trunk.set("replaced", json!({"inner": true}));

        let mut branch = WorkflowState::new();
        branch.set("replaced", json!({"other": false}));
        branch.set("added", json!("new"));

        trunk.absorb(&branch);

        assert_eq!(trunk.get("kept"), Some(&json!(1)));
        // whole value replaced, not deep-merged
        assert_eq!(trunk.get("replaced"), Some(&json!({"other": false})));
        assert_eq!(trunk.get("added"), Some(&json!("new")));
    }

    #[test]
    fn test_invocation_history() {
        let mut state = WorkflowState::new();

        state.record_start("analyze");
        state.record_start("implement");
        state.record_finish("analyze", true, "done");
        state.record_finish("implement", false, "boom");

        assert_eq!(state.history.len(), 2);
        assert!(state.history[0].success);
        assert!(!state.history[1].success);
        assert_eq!(state.visited(), vec!["analyze", "implement"]);
    }

    #[test]
    fn test_serde_round_trip() {
        let mut state = WorkflowState::new();
        state.set("key", json!("value"));
        state.record_start("n");
        state.record_finish("n", true, "ok");

        let json = serde_json::to_string(&state).unwrap();
        let back: WorkflowState = serde_json::from_str(&json).unwrap();

        assert_eq!(back.run_id, state.run_id);
        assert_eq!(back.get("key"), Some(&json!("value")));
        assert_eq!(back.history.len(), 1);
    }
}
