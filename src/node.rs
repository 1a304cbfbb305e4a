//! Workflow nodes and the handler contract.

use crate::executor::ExecutionContext;
use crate::state::WorkflowState;
use anyhow::Result;
use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// What a node tells the engine to do once its work is done.
#[derive(Debug)]
pub enum NodeOutcome {
    /// Keep scheduling with the returned state.
    Advance(WorkflowState),
    /// Checkpoint the run and hand control back to the caller, e.g. to wait
    /// for out-of-process approval.
    Suspend(WorkflowState),
}

impl NodeOutcome {
    pub fn state(&self) -> &WorkflowState {
        match self {
            NodeOutcome::Advance(s) | NodeOutcome::Suspend(s) => s,
        }
    }

    pub fn into_state(self) -> WorkflowState {
        match self {
            NodeOutcome::Advance(s) | NodeOutcome::Suspend(s) => s,
        }
    }
}

/// A unit of work in the graph.
///
/// Handlers receive a state value and return the next one; they must respect
/// cancellation promptly and should be idempotent (or documented as not),
/// since retry middleware may invoke them more than once.
#[async_trait]
pub trait NodeHandler: Send + Sync {
    async fn run(&self, ctx: &ExecutionContext, state: WorkflowState) -> Result<NodeOutcome>;
}

/// A named node wrapping a handler. Immutable after compile.
#[derive(Clone)]
pub struct Node {
    /// Unique node identifier within a graph
    pub id: String,
    pub(crate) handler: Arc<dyn NodeHandler>,
}

impl Node {
    pub fn new(id: impl Into<String>, handler: Arc<dyn NodeHandler>) -> Self {
        Self { id: id.into(), handler }
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node").field("id", &self.id).finish_non_exhaustive()
    }
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> NodeHandler for FnHandler<F>
where
    F: Fn(ExecutionContext, WorkflowState) -> Fut + Send + Sync,
    Fut: Future<Output = Result<NodeOutcome>> + Send,
{
    async fn run(&self, ctx: &ExecutionContext, state: WorkflowState) -> Result<NodeOutcome> {
        (self.0)(ctx.clone(), state).await
    }
}

/// Wrap an async closure as a node handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn NodeHandler>
where
    F: Fn(ExecutionContext, WorkflowState) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<NodeOutcome>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}
