//! Graph builder and compiler.
//!
//! The builder accumulates nodes, edges, entry/finish points and graph-level
//! options. `compile` validates the structure and produces an immutable
//! `Executor`. Structural violations are reported in a stable order: unknown
//! edge endpoints, then entry/finish checks, then reachability, then
//! activation-group consistency. Cycles are permitted; they model revision
//! loops bounded by state-dependent conditions.

use crate::checkpoint::Checkpointer;
use crate::error::{BuildError, CompileError};
use crate::executor::Executor;
use crate::graph::{Edge, EdgeId, Graph, JoinGroup, JoinMode};
use crate::middleware::NodeMiddleware;
use crate::node::{Node, NodeHandler};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Builder for workflow graphs.
#[derive(Default)]
pub struct GraphBuilder {
    nodes: HashMap<String, Node>,
    edges: Vec<Edge>,
    entry: Option<String>,
    finish: Option<String>,
    parallel: bool,
    middleware: Vec<Arc<dyn NodeMiddleware>>,
    checkpointer: Option<Arc<dyn Checkpointer>>,
}

impl std::fmt::Debug for GraphBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphBuilder")
            .field("nodes", &self.nodes.keys().collect::<Vec<_>>())
            .field("entry", &self.entry)
            .field("finish", &self.finish)
            .field("parallel", &self.parallel)
            .finish_non_exhaustive()
    }
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node. Ids must be unique within the graph.
    pub fn add_node(
        &mut self,
        id: impl Into<String>,
        handler: Arc<dyn NodeHandler>,
    ) -> Result<&mut Self, BuildError> {
        let id = id.into();
        if self.nodes.contains_key(&id) {
            return Err(BuildError::DuplicateNode(id));
        }
        self.nodes.insert(id.clone(), Node::new(id, handler));
        Ok(self)
    }

    /// Add an edge. Endpoint existence is checked at compile time, so edges
    /// may reference nodes registered later.
    pub fn add_edge(&mut self, edge: Edge) -> &mut Self {
        self.edges.push(edge);
        self
    }

    pub fn set_entry_point(&mut self, id: impl Into<String>) -> &mut Self {
        self.entry = Some(id.into());
        self
    }

    pub fn set_finish_point(&mut self, id: impl Into<String>) -> &mut Self {
        self.finish = Some(id.into());
        self
    }

    /// Dispatch all ready nodes concurrently instead of one at a time.
    pub fn parallel(&mut self, enabled: bool) -> &mut Self {
        self.parallel = enabled;
        self
    }

    /// Append a middleware layer. Layers wrap node invocations outermost
    /// first, in the order they were added.
    pub fn with_middleware(&mut self, layer: Arc<dyn NodeMiddleware>) -> &mut Self {
        self.middleware.push(layer);
        self
    }

    /// Attach a checkpoint store, enabling suspend/resume.
    pub fn with_checkpointer(&mut self, checkpointer: Arc<dyn Checkpointer>) -> &mut Self {
        self.checkpointer = Some(checkpointer);
        self
    }

    /// Validate the graph and produce an executor.
    pub fn compile(self) -> Result<Executor, CompileError> {
        // 1. every edge endpoint must be a registered node
        for edge in &self.edges {
            for endpoint in [&edge.from, &edge.to] {
                if !self.nodes.contains_key(endpoint) {
                    return Err(CompileError::UnknownNode {
                        from: edge.from.clone(),
                        to: edge.to.clone(),
                        node: endpoint.clone(),
                    });
                }
            }
        }

        // 2. entry and finish must be set and registered
        let entry = self.entry.ok_or(CompileError::MissingEntryPoint)?;
        let finish = self.finish.ok_or(CompileError::MissingFinishPoint)?;
        if !self.nodes.contains_key(&entry) {
            return Err(CompileError::UnknownEntryPoint(entry));
        }
        if !self.nodes.contains_key(&finish) {
            return Err(CompileError::UnknownFinishPoint(finish));
        }

        // 3. finish must be reachable from entry along some path
        if !reachable(&self.edges, &entry).contains(&finish) {
            return Err(CompileError::UnreachableFinish { entry, finish });
        }

        // 4. a group name used on edges into the same target must carry one
        //    consistent mode
        let mut modes: HashMap<(&str, &str), JoinMode> = HashMap::new();
        for edge in &self.edges {
            if let Some(tag) = &edge.group {
                match modes.insert((edge.to.as_str(), tag.name.as_str()), tag.mode) {
                    Some(previous) if previous != tag.mode => {
                        return Err(CompileError::InconsistentGroup {
                            group: tag.name.clone(),
                            node: edge.to.clone(),
                        });
                    }
                    _ => {}
                }
            }
        }

        let outgoing = index_outgoing(&self.edges);
        let joins = build_join_plan(&self.edges);

        let graph = Graph {
            nodes: self.nodes,
            edges: self.edges,
            outgoing,
            joins,
            entry,
            finish,
            parallel: self.parallel,
            middleware: self.middleware,
            checkpointer: self.checkpointer,
        };

        Ok(Executor::new(Arc::new(graph)))
    }
}

/// Nodes reachable from `start` following edges regardless of conditions.
fn reachable(edges: &[Edge], start: &str) -> HashSet<String> {
    let mut seen = HashSet::new();
    let mut queue = vec![start.to_string()];
    while let Some(node) = queue.pop() {
        if seen.insert(node.clone()) {
            for edge in edges.iter().filter(|e| e.from == node) {
                if !seen.contains(&edge.to) {
                    queue.push(edge.to.clone());
                }
            }
        }
    }
    seen
}

fn index_outgoing(edges: &[Edge]) -> HashMap<String, Vec<EdgeId>> {
    let mut outgoing: HashMap<String, Vec<EdgeId>> = HashMap::new();
    for (eid, edge) in edges.iter().enumerate() {
        outgoing.entry(edge.from.clone()).or_default().push(eid);
    }
    outgoing
}

/// Group each target's incoming edges into join barriers. Edges without an
/// explicit group form the target's implicit group; named groups keep their
/// first-appearance order.
fn build_join_plan(edges: &[Edge]) -> HashMap<String, Vec<JoinGroup>> {
    let mut joins: HashMap<String, Vec<JoinGroup>> = HashMap::new();
    for (eid, edge) in edges.iter().enumerate() {
        let groups = joins.entry(edge.to.clone()).or_default();
        match &edge.group {
            None => {
                if let Some(implicit) = groups.iter_mut().find(|g| g.name.is_none()) {
                    implicit.members.push(eid);
                } else {
                    groups.push(JoinGroup {
                        name: None,
                        mode: JoinMode::All,
                        members: vec![eid],
                    });
                }
            }
            Some(tag) => {
                if let Some(group) = groups
                    .iter_mut()
                    .find(|g| g.name.as_deref() == Some(tag.name.as_str()))
                {
                    group.members.push(eid);
                } else {
                    groups.push(JoinGroup {
                        name: Some(tag.name.clone()),
                        mode: tag.mode,
                        members: vec![eid],
                    });
                }
            }
        }
    }
    joins
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::Condition;
    use crate::node::{handler_fn, NodeOutcome};

    fn noop() -> Arc<dyn NodeHandler> {
        handler_fn(|_ctx, state| async move { Ok(NodeOutcome::Advance(state)) })
    }

    #[test]
    fn test_duplicate_node_rejected_eagerly() {
        let mut builder = GraphBuilder::new();
        builder.add_node("a", noop()).unwrap();
        let err = builder.add_node("a", noop()).unwrap_err();
        assert!(matches!(err, BuildError::DuplicateNode(id) if id == "a"));
    }

    #[test]
    fn test_unknown_edge_endpoint() {
        let mut builder = GraphBuilder::new();
        builder.add_node("a", noop()).unwrap();
        builder.add_edge(Edge::new("a", "ghost"));
        builder.set_entry_point("a");
        builder.set_finish_point("a");

        let err = builder.compile().unwrap_err();
        assert!(matches!(err, CompileError::UnknownNode { node, .. } if node == "ghost"));
    }

    #[test]
    fn test_missing_entry_point() {
        let mut builder = GraphBuilder::new();
        builder.add_node("a", noop()).unwrap();
        builder.set_finish_point("a");

        let err = builder.compile().unwrap_err();
        assert!(matches!(err, CompileError::MissingEntryPoint));
    }

    #[test]
    fn test_unknown_finish_point() {
        let mut builder = GraphBuilder::new();
        builder.add_node("a", noop()).unwrap();
        builder.set_entry_point("a");
        builder.set_finish_point("ghost");

        let err = builder.compile().unwrap_err();
        assert!(matches!(err, CompileError::UnknownFinishPoint(id) if id == "ghost"));
    }

    #[test]
    fn test_unreachable_finish() {
        let mut builder = GraphBuilder::new();
        builder.add_node("a", noop()).unwrap();
        builder.add_node("b", noop()).unwrap();
        builder.add_node("island", noop()).unwrap();
        builder.add_edge(Edge::new("a", "b"));
        builder.set_entry_point("a");
        builder.set_finish_point("island");

        let err = builder.compile().unwrap_err();
        assert!(matches!(err, CompileError::UnreachableFinish { .. }));
    }

    #[test]
    fn test_unknown_node_reported_before_reachability() {
        // both violations present; endpoint check wins
        let mut builder = GraphBuilder::new();
        builder.add_node("a", noop()).unwrap();
        builder.add_node("island", noop()).unwrap();
        builder.add_edge(Edge::new("a", "ghost"));
        builder.set_entry_point("a");
        builder.set_finish_point("island");

        let err = builder.compile().unwrap_err();
        assert!(matches!(err, CompileError::UnknownNode { .. }));
    }

    #[test]
    fn test_inconsistent_group_modes() {
        let mut builder = GraphBuilder::new();
        for id in ["a", "b", "t"] {
            builder.add_node(id, noop()).unwrap();
        }
        builder.add_edge(Edge::new("a", "t").in_group("join", JoinMode::All));
        builder.add_edge(Edge::new("b", "t").in_group("join", JoinMode::Any));
        builder.add_edge(Edge::new("a", "b"));
        builder.set_entry_point("a");
        builder.set_finish_point("t");

        let err = builder.compile().unwrap_err();
        assert!(matches!(err, CompileError::InconsistentGroup { group, .. } if group == "join"));
    }

    #[test]
    fn test_same_group_name_on_different_targets_is_fine() {
        let mut builder = GraphBuilder::new();
        for id in ["a", "b", "c"] {
            builder.add_node(id, noop()).unwrap();
        }
        builder.add_edge(Edge::new("a", "b").in_group("g", JoinMode::All));
        builder.add_edge(Edge::new("b", "c").in_group("g", JoinMode::Any));
        builder.set_entry_point("a");
        builder.set_finish_point("c");

        assert!(builder.compile().is_ok());
    }

    #[test]
    fn test_cycles_are_permitted() {
        let mut builder = GraphBuilder::new();
        for id in ["draft", "review", "publish"] {
            builder.add_node(id, noop()).unwrap();
        }
        builder.add_edge(Edge::new("draft", "review"));
        builder.add_edge(Edge::new("review", "draft").when(Condition::lt("revision", 2.0)));
        builder.add_edge(Edge::new("review", "publish").when(Condition::at_least("revision", 2.0)));
        builder.set_entry_point("draft");
        builder.set_finish_point("publish");

        assert!(builder.compile().is_ok());
    }

    #[test]
    fn test_join_plan_groups_edges() {
        let edges = vec![
            Edge::new("a", "t"),
            Edge::new("b", "t"),
            Edge::new("c", "t").in_group("signal", JoinMode::Any),
        ];
        let joins = build_join_plan(&edges);
        let groups = &joins["t"];

        assert_eq!(groups.len(), 2);
        assert!(groups[0].name.is_none());
        assert_eq!(groups[0].members, vec![0, 1]);
        assert_eq!(groups[1].name.as_deref(), Some("signal"));
        assert_eq!(groups[1].mode, JoinMode::Any);
    }

    #[test]
    fn test_compiled_graph_shape() {
        let mut builder = GraphBuilder::new();
        for id in ["a", "b"] {
            builder.add_node(id, noop()).unwrap();
        }
        builder.add_edge(Edge::new("a", "b"));
        builder.set_entry_point("a");
        builder.set_finish_point("b");

        let executor = builder.compile().unwrap();
        let graph = executor.graph();
        assert_eq!(graph.entry(), "a");
        assert_eq!(graph.finish(), "b");
        assert_eq!(graph.node_count(), 2);
        assert_eq!(graph.edge_count(), 1);
        assert!(!graph.is_parallel());
    }
}
