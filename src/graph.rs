//! Compiled workflow graphs.
//!
//! A `Graph` is produced by `GraphBuilder::compile` and is immutable from
//! then on: node table, edge table, and a precomputed join plan per target.
//! It is shared by `Arc` across concurrent executions; all mutable state
//! lives in the per-execution record inside the executor.

use crate::checkpoint::Checkpointer;
use crate::condition::Condition;
use crate::middleware::NodeMiddleware;
use crate::node::Node;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Join mode for an activation group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JoinMode {
    /// Every edge in the group must fire before the target runs.
    All,
    /// The first firing in the group triggers the target; the group is then
    /// latched for the rest of the execution.
    Any,
}

/// Activation group tag carried by an edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupTag {
    pub name: String,
    pub mode: JoinMode,
}

/// A directed edge with an optional condition and activation group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    /// Source node id
    pub from: String,
    /// Target node id
    pub to: String,
    /// Optional predicate over the source's returned state
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
    /// Optional activation group
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<GroupTag>,
}

impl Edge {
    /// Create an unconditional edge.
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            condition: None,
            group: None,
        }
    }

    /// Attach a condition.
    pub fn when(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }

    /// Place this edge in an activation group.
    pub fn in_group(mut self, name: impl Into<String>, mode: JoinMode) -> Self {
        self.group = Some(GroupTag { name: name.into(), mode });
        self
    }
}

/// Index of an edge in the graph's edge table.
pub(crate) type EdgeId = usize;

/// One join barrier feeding a target node. Edges without an explicit group
/// form the target's implicit group (`name: None`).
#[derive(Debug, Clone)]
pub(crate) struct JoinGroup {
    pub name: Option<String>,
    pub mode: JoinMode,
    pub members: Vec<EdgeId>,
}

/// A compiled, immutable workflow graph.
pub struct Graph {
    pub(crate) nodes: HashMap<String, Node>,
    pub(crate) edges: Vec<Edge>,
    pub(crate) outgoing: HashMap<String, Vec<EdgeId>>,
    pub(crate) joins: HashMap<String, Vec<JoinGroup>>,
    pub(crate) entry: String,
    pub(crate) finish: String,
    pub(crate) parallel: bool,
    pub(crate) middleware: Vec<Arc<dyn NodeMiddleware>>,
    pub(crate) checkpointer: Option<Arc<dyn Checkpointer>>,
}

impl Graph {
    pub fn entry(&self) -> &str {
        &self.entry
    }

    pub fn finish(&self) -> &str {
        &self.finish
    }

    pub fn is_parallel(&self) -> bool {
        self.parallel
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub(crate) fn outgoing_edges(&self, node_id: &str) -> &[EdgeId] {
        self.outgoing.get(node_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub(crate) fn join_groups(&self, node_id: &str) -> &[JoinGroup] {
        self.joins.get(node_id).map(Vec::as_slice).unwrap_or(&[])
    }
}
