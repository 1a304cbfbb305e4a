//! Around-style middleware for node invocation.
//!
//! Middleware wraps a single node invocation: it receives the invocation
//! context, the node, the input state and a `Next` continuation for the rest
//! of the chain, and returns the invocation's future. The chain is composed
//! at dispatch time, outermost layer first, with the node's own handler at
//! the bottom.

use crate::executor::ExecutionContext;
use crate::node::{Node, NodeOutcome};
use crate::state::WorkflowState;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::sync::Arc;

/// Boxed future produced by handlers and middleware layers.
pub type NodeFuture = BoxFuture<'static, anyhow::Result<NodeOutcome>>;

/// The remainder of the invocation chain for one node.
///
/// `run` may be called more than once (retry layers do), each call with its
/// own state value.
#[derive(Clone)]
pub struct Next {
    pub(crate) inner: Arc<dyn Fn(WorkflowState) -> NodeFuture + Send + Sync>,
}

impl Next {
    pub fn run(&self, state: WorkflowState) -> NodeFuture {
        (self.inner)(state)
    }
}

/// A layer wrapping a single node invocation.
pub trait NodeMiddleware: Send + Sync {
    fn wrap(
        self: Arc<Self>,
        ctx: ExecutionContext,
        node: Node,
        state: WorkflowState,
        next: Next,
    ) -> NodeFuture;
}

/// Compose the configured layers over a node's handler.
pub(crate) fn compose(
    middleware: &[Arc<dyn NodeMiddleware>],
    ctx: &ExecutionContext,
    node: &Node,
) -> Next {
    let handler = node.handler.clone();
    let base_ctx = ctx.clone();
    let mut next = Next {
        inner: Arc::new(move |state| {
            let handler = handler.clone();
            let ctx = base_ctx.clone();
            async move { handler.run(&ctx, state).await }.boxed()
        }),
    };

    for layer in middleware.iter().rev() {
        let layer = layer.clone();
        let ctx = ctx.clone();
        let node = node.clone();
        let inner_next = next;
        next = Next {
            inner: Arc::new(move |state| {
                layer
                    .clone()
                    .wrap(ctx.clone(), node.clone(), state, inner_next.clone())
            }),
        };
    }

    next
}
