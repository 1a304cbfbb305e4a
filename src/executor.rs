//! Workflow executor.
//!
//! Schedules a compiled graph by readiness rather than by a precomputed
//! topological order, so cycles (revision loops bounded by conditions) are
//! first-class. A work frontier starts at the entry node; completing a node
//! evaluates its outgoing edges against the state it returned, records
//! firings against each target's activation groups, and enqueues targets
//! whose groups are all satisfied. Sequential mode processes the frontier
//! FIFO; parallel mode dispatches every ready node concurrently, each on a
//! clone of the trunk state, and folds results back as branches complete.

use crate::checkpoint::{Checkpoint, JoinSnapshot};
use crate::error::{Cancelled, ExecuteError};
use crate::graph::{EdgeId, Graph, JoinGroup, JoinMode};
use crate::middleware;
use crate::node::NodeOutcome;
use crate::state::WorkflowState;
use serde_json::Value as JsonValue;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Per-execution context handed to node handlers and middleware.
///
/// Carries the run's cancellation token: one signal aborts every in-flight
/// invocation and any pending backoff wait. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    token: CancellationToken,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(token: CancellationToken) -> Self {
        Self { token }
    }

    /// Cancel the execution.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the execution is cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    /// Express a timeout as cancellation: the token fires after `after`.
    /// The timer task exits early if the token is cancelled first.
    pub fn with_deadline(self, after: Duration) -> Self {
        let token = self.token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(after) => token.cancel(),
            }
        });
        self
    }
}

/// Emitted after each node completes, when the caller asked for streaming.
#[derive(Debug, Clone)]
pub struct StepEvent {
    pub node_id: String,
    pub state: WorkflowState,
}

/// Per-call options for `execute` / `resume`.
#[derive(Clone, Default)]
pub struct ExecuteOptions {
    /// Id to checkpoint under if a node suspends. A later suspension in the
    /// same run supersedes the record under this id.
    pub checkpoint_id: Option<String>,
    /// Receives a `StepEvent` after every completed node.
    pub events: Option<mpsc::UnboundedSender<StepEvent>>,
}

/// Terminal result of a run.
#[derive(Debug)]
pub enum RunOutcome {
    /// The finish node ran; this is the state it produced.
    Completed(WorkflowState),
    /// A node suspended; the run was checkpointed under this id and can be
    /// continued with `Executor::resume`.
    Suspended {
        checkpoint_id: String,
        state: WorkflowState,
    },
}

impl RunOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, RunOutcome::Completed(_))
    }

    pub fn state(&self) -> &WorkflowState {
        match self {
            RunOutcome::Completed(s) => s,
            RunOutcome::Suspended { state, .. } => state,
        }
    }

    pub fn into_state(self) -> WorkflowState {
        match self {
            RunOutcome::Completed(s) => s,
            RunOutcome::Suspended { state, .. } => state,
        }
    }
}

/// Runs a compiled graph.
///
/// The graph is immutable and shared by reference; an executor may be cloned
/// and used from many tasks, each `execute` call owning its own state.
#[derive(Clone)]
pub struct Executor {
    graph: Arc<Graph>,
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("entry", &self.graph.entry)
            .field("finish", &self.graph.finish)
            .field("parallel", &self.graph.parallel)
            .finish_non_exhaustive()
    }
}

impl Executor {
    pub(crate) fn new(graph: Arc<Graph>) -> Self {
        Self { graph }
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Run the graph from its entry node against an initial state.
    pub async fn execute(
        &self,
        ctx: &ExecutionContext,
        state: WorkflowState,
        opts: ExecuteOptions,
    ) -> Result<RunOutcome, ExecuteError> {
        info!(entry = %self.graph.entry, parallel = self.graph.parallel, "starting run");
        let frontier = VecDeque::from([self.graph.entry.clone()]);
        let mut run = Run::new(self.graph.clone(), state, frontier);
        self.drive(ctx, &mut run, &opts).await
    }

    /// Continue a suspended run from its checkpoint.
    ///
    /// Caller-supplied keys overwrite the snapshot's top-level keys; nothing
    /// is merged into nested structures. Retry budgets are not carried over
    /// a resume. A further suspension checkpoints under the same id unless
    /// `opts.checkpoint_id` says otherwise.
    pub async fn resume(
        &self,
        ctx: &ExecutionContext,
        overrides: HashMap<String, JsonValue>,
        checkpoint_id: &str,
        mut opts: ExecuteOptions,
    ) -> Result<RunOutcome, ExecuteError> {
        let store = self
            .graph
            .checkpointer
            .clone()
            .ok_or(ExecuteError::CheckpointerMissing)?;
        let checkpoint = store
            .load(checkpoint_id)
            .await
            .map_err(|source| ExecuteError::Checkpoint {
                id: checkpoint_id.to_string(),
                source,
            })?;

        let mut state = checkpoint.state;
        for (key, value) in overrides {
            state.set(key, value);
        }

        info!(
            checkpoint = %checkpoint_id,
            frontier = ?checkpoint.frontier,
            "resuming run"
        );
        opts.checkpoint_id
            .get_or_insert_with(|| checkpoint_id.to_string());
        let frontier: VecDeque<String> = checkpoint.frontier.into_iter().collect();
        let mut run = Run::new(self.graph.clone(), state, frontier);
        run.restore_joins(checkpoint.joins);
        self.drive(ctx, &mut run, &opts).await
    }

    async fn drive(
        &self,
        ctx: &ExecutionContext,
        run: &mut Run,
        opts: &ExecuteOptions,
    ) -> Result<RunOutcome, ExecuteError> {
        if self.graph.parallel {
            self.drive_parallel(ctx, run, opts).await
        } else {
            self.drive_sequential(ctx, run, opts).await
        }
    }

    async fn drive_sequential(
        &self,
        ctx: &ExecutionContext,
        run: &mut Run,
        opts: &ExecuteOptions,
    ) -> Result<RunOutcome, ExecuteError> {
        loop {
            if ctx.is_cancelled() {
                return Err(ExecuteError::Cancelled);
            }
            let Some(node_id) = run.pop_ready() else { break };
            run.begin(&node_id);
            let input = run.trunk.clone();
            let outcome = self.invoke(ctx, &node_id, input).await;
            if let Some(done) = self.settle(run, opts, &node_id, outcome, ctx).await? {
                return Ok(done);
            }
        }
        warn!(finish = %self.graph.finish, "frontier drained before finish");
        Err(ExecuteError::DeadEnd {
            finish: self.graph.finish.clone(),
        })
    }

    async fn drive_parallel(
        &self,
        ctx: &ExecutionContext,
        run: &mut Run,
        opts: &ExecuteOptions,
    ) -> Result<RunOutcome, ExecuteError> {
        let mut tasks: JoinSet<(String, anyhow::Result<NodeOutcome>)> = JoinSet::new();
        loop {
            while let Some(node_id) = run.pop_ready() {
                run.begin(&node_id);
                let input = run.trunk.clone();
                let executor = self.clone();
                let task_ctx = ctx.clone();
                tasks.spawn(async move {
                    let result = executor.invoke(&task_ctx, &node_id, input).await;
                    (node_id, result)
                });
            }

            if tasks.is_empty() {
                warn!(finish = %self.graph.finish, "frontier drained before finish");
                return Err(ExecuteError::DeadEnd {
                    finish: self.graph.finish.clone(),
                });
            }

            let joined = tokio::select! {
                _ = ctx.cancelled() => {
                    tasks.abort_all();
                    return Err(ExecuteError::Cancelled);
                }
                joined = tasks.join_next() => joined,
            };
            let Some(joined) = joined else { continue };
            let (node_id, outcome) = match joined {
                Ok(pair) => pair,
                Err(err) if err.is_cancelled() => continue,
                Err(err) => {
                    return Err(ExecuteError::Node {
                        node: "<join>".to_string(),
                        error: err.into(),
                    })
                }
            };

            if let Some(done) = self.settle(run, opts, &node_id, outcome, ctx).await? {
                // abandoned siblings are not rolled back
                tasks.abort_all();
                return Ok(done);
            }
        }
    }

    /// Invoke one node through the middleware chain, racing cancellation.
    async fn invoke(
        &self,
        ctx: &ExecutionContext,
        node_id: &str,
        state: WorkflowState,
    ) -> anyhow::Result<NodeOutcome> {
        let node = self
            .graph
            .nodes
            .get(node_id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("node '{node_id}' is not in the graph"))?;
        debug!(node = %node.id, "dispatching node");
        let chain = middleware::compose(&self.graph.middleware, ctx, &node);
        tokio::select! {
            _ = ctx.cancelled() => Err(Cancelled.into()),
            result = chain.run(state) => result,
        }
    }

    /// Fold one finished invocation back into the run. Returns the terminal
    /// outcome if this invocation ended the run.
    async fn settle(
        &self,
        run: &mut Run,
        opts: &ExecuteOptions,
        node_id: &str,
        outcome: anyhow::Result<NodeOutcome>,
        ctx: &ExecutionContext,
    ) -> Result<Option<RunOutcome>, ExecuteError> {
        match outcome {
            Err(error) => {
                run.fail(node_id, &error);
                if ctx.is_cancelled() || error.is::<Cancelled>() {
                    return Err(ExecuteError::Cancelled);
                }
                Err(ExecuteError::Node {
                    node: node_id.to_string(),
                    error,
                })
            }
            Ok(NodeOutcome::Suspend(state)) => {
                run.suspend(node_id, &state);
                let store = self
                    .graph
                    .checkpointer
                    .clone()
                    .ok_or(ExecuteError::CheckpointerMissing)?;
                let id = opts
                    .checkpoint_id
                    .clone()
                    .ok_or_else(|| ExecuteError::CheckpointIdMissing {
                        node: node_id.to_string(),
                    })?;
                let checkpoint =
                    Checkpoint::new(id.clone(), run.trunk.clone(), run.suspension_frontier(node_id))
                        .with_joins(run.join_snapshot());
                store
                    .save(&checkpoint)
                    .await
                    .map_err(|source| ExecuteError::Checkpoint {
                        id: id.clone(),
                        source,
                    })?;
                info!(node = %node_id, checkpoint = %id, "run suspended");
                Ok(Some(RunOutcome::Suspended {
                    checkpoint_id: id,
                    state: run.trunk.clone(),
                }))
            }
            Ok(NodeOutcome::Advance(state)) => {
                run.complete(node_id, &state);
                if let Some(events) = &opts.events {
                    let _ = events.send(StepEvent {
                        node_id: node_id.to_string(),
                        state: run.trunk.clone(),
                    });
                }
                if node_id == self.graph.finish {
                    run.trunk.mark_finished();
                    info!(finish = %node_id, "run completed");
                    return Ok(Some(RunOutcome::Completed(run.trunk.clone())));
                }
                Ok(None)
            }
        }
    }
}

/// Mutable record of one execution. Owned by the scheduling loop; node
/// handlers only ever see clones of the trunk state.
struct Run {
    graph: Arc<Graph>,
    trunk: WorkflowState,
    frontier: VecDeque<String>,
    queued: HashSet<String>,
    in_flight: HashSet<String>,
    /// Unconsumed edge firings
    fired: HashSet<EdgeId>,
    /// Edges whose condition evaluated false since their target last armed
    declined: HashSet<EdgeId>,
    /// (target, group) pairs for ANY groups already satisfied this execution
    latched: HashSet<(String, String)>,
}

impl Run {
    fn new(graph: Arc<Graph>, trunk: WorkflowState, frontier: VecDeque<String>) -> Self {
        let queued = frontier.iter().cloned().collect();
        Self {
            graph,
            trunk,
            frontier,
            queued,
            in_flight: HashSet::new(),
            fired: HashSet::new(),
            declined: HashSet::new(),
            latched: HashSet::new(),
        }
    }

    fn pop_ready(&mut self) -> Option<String> {
        let node_id = self.frontier.pop_front()?;
        self.queued.remove(&node_id);
        Some(node_id)
    }

    /// Mark a node dispatched: consume the firings of its groups (re-arming
    /// them for cycles), latch ANY groups, and open a history step.
    fn begin(&mut self, node_id: &str) {
        self.in_flight.insert(node_id.to_string());
        let groups: Vec<JoinGroup> = self.graph.join_groups(node_id).to_vec();
        for group in groups {
            if let (Some(name), JoinMode::Any) = (&group.name, group.mode) {
                self.latched.insert((node_id.to_string(), name.clone()));
            }
            for eid in group.members {
                self.fired.remove(&eid);
                self.declined.remove(&eid);
            }
        }
        self.trunk.record_start(node_id);
    }

    /// Fold a successful invocation into the trunk, evaluate outgoing edges
    /// against the returned state, and enqueue any targets that became
    /// ready.
    fn complete(&mut self, node_id: &str, returned: &WorkflowState) {
        self.in_flight.remove(node_id);
        self.trunk.record_finish(node_id, true, "completed");
        self.trunk.absorb(returned);

        let graph = self.graph.clone();
        let mut touched: Vec<String> = Vec::new();
        for &eid in graph.outgoing_edges(node_id) {
            let edge = &graph.edges[eid];
            match &edge.condition {
                Some(condition) if !condition.evaluate(returned) => {
                    debug!(
                        from = %edge.from,
                        to = %edge.to,
                        condition = %condition.description(),
                        "edge declined"
                    );
                    self.declined.insert(eid);
                    self.fired.remove(&eid);
                }
                _ => {
                    debug!(from = %edge.from, to = %edge.to, "edge fired");
                    self.fired.insert(eid);
                    self.declined.remove(&eid);
                }
            }
            touched.push(edge.to.clone());
        }
        // a self-loop can re-ready the node that just ran
        touched.push(node_id.to_string());

        for target in touched {
            self.enqueue_if_ready(&target);
        }
    }

    fn fail(&mut self, node_id: &str, error: &anyhow::Error) {
        self.in_flight.remove(node_id);
        self.trunk.record_finish(node_id, false, error.to_string());
    }

    fn suspend(&mut self, node_id: &str, returned: &WorkflowState) {
        self.in_flight.remove(node_id);
        self.trunk.record_finish(node_id, true, "suspended");
        self.trunk.absorb(returned);
    }

    /// Join bookkeeping to persist alongside the frontier, so a firing into
    /// a partially satisfied ALL group and the ANY latches survive a
    /// suspend/resume round trip. Sorted for a stable serialized record.
    fn join_snapshot(&self) -> JoinSnapshot {
        let mut fired: Vec<usize> = self.fired.iter().copied().collect();
        fired.sort_unstable();
        let mut declined: Vec<usize> = self.declined.iter().copied().collect();
        declined.sort_unstable();
        let mut latched: Vec<(String, String)> = self.latched.iter().cloned().collect();
        latched.sort();
        JoinSnapshot { fired, declined, latched }
    }

    fn restore_joins(&mut self, joins: JoinSnapshot) {
        self.fired = joins.fired.into_iter().collect();
        self.declined = joins.declined.into_iter().collect();
        self.latched = joins.latched.into_iter().collect();
    }

    /// Frontier to persist when `node_id` suspends: the suspending node
    /// first (it re-runs on resume with the caller's keys visible), then
    /// queued nodes, then abandoned in-flight branches.
    fn suspension_frontier(&self, node_id: &str) -> Vec<String> {
        let mut frontier = vec![node_id.to_string()];
        frontier.extend(self.frontier.iter().cloned());
        frontier.extend(
            self.in_flight
                .iter()
                .filter(|id| id.as_str() != node_id)
                .cloned(),
        );
        frontier
    }

    fn enqueue_if_ready(&mut self, target: &str) {
        if self.queued.contains(target) || self.in_flight.contains(target) {
            return;
        }
        if !self.node_ready(target) {
            return;
        }
        debug!(node = %target, "node ready");
        self.frontier.push_back(target.to_string());
        self.queued.insert(target.to_string());
    }

    /// A node is ready when every group feeding it is satisfied.
    fn node_ready(&self, target: &str) -> bool {
        let groups = self.graph.join_groups(target);
        if groups.is_empty() {
            return false;
        }
        groups.iter().all(|g| self.group_satisfied(target, g))
    }

    fn group_satisfied(&self, target: &str, group: &JoinGroup) -> bool {
        match (&group.name, group.mode) {
            // ANY: one firing suffices, once per execution
            (Some(name), JoinMode::Any) => {
                !self.latched.contains(&(target.to_string(), name.clone()))
                    && group.members.iter().any(|e| self.fired.contains(e))
            }
            // explicit ALL: every member edge must have fired
            (Some(_), JoinMode::All) => {
                group.members.iter().all(|e| self.fired.contains(e))
            }
            // implicit group: at least one firing, and no member edge still
            // undecided with its source scheduled. Branches that were never
            // taken do not block the join.
            (None, _) => {
                group.members.iter().any(|e| self.fired.contains(e))
                    && !group.members.iter().any(|e| self.edge_pending(*e))
            }
        }
    }

    /// An edge is pending while its source is queued or in flight and the
    /// edge has neither fired nor been declined.
    fn edge_pending(&self, eid: EdgeId) -> bool {
        if self.fired.contains(&eid) || self.declined.contains(&eid) {
            return false;
        }
        let source = &self.graph.edges[eid].from;
        self.queued.contains(source) || self.in_flight.contains(source)
    }
}
