//! Graph-based workflow engine for agent pipelines.
//!
//! A workflow is a directed graph of named nodes connected by edges that may
//! carry conditions over the shared state and activation-group tags for
//! fan-in joins. `GraphBuilder` assembles and validates the graph; the
//! compiled `Executor` schedules it by readiness from the entry node, either
//! sequentially or with all ready nodes dispatched concurrently. Nodes can
//! suspend mid-run; with a `Checkpointer` attached the run is persisted and
//! can be continued later with fresh input.
//!
//! ```no_run
//! use skein::{
//!     Condition, Edge, ExecuteOptions, ExecutionContext, GraphBuilder,
//!     NodeOutcome, WorkflowState, handler_fn,
//! };
//! use serde_json::json;
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let mut builder = GraphBuilder::new();
//! builder.add_node(
//!     "score",
//!     handler_fn(|_ctx, mut state| async move {
//!         state.set("score", json!(0.9));
//!         Ok(NodeOutcome::Advance(state))
//!     }),
//! )?;
//! builder.add_node(
//!     "publish",
//!     handler_fn(|_ctx, state| async move { Ok(NodeOutcome::Advance(state)) }),
//! )?;
//! builder.add_edge(Edge::new("score", "publish").when(Condition::at_least("score", 0.5)));
//! builder.set_entry_point("score");
//! builder.set_finish_point("publish");
//! let executor = builder.compile()?;
//!
//! let ctx = ExecutionContext::new();
//! let outcome = executor
//!     .execute(&ctx, WorkflowState::new(), ExecuteOptions::default())
//!     .await?;
//! assert!(outcome.is_completed());
//! # Ok(())
//! # }
//! ```

pub mod builder;
pub mod checkpoint;
pub mod condition;
pub mod error;
pub mod executor;
pub mod graph;
pub mod middleware;
pub mod node;
pub mod retry;
pub mod state;

pub use builder::GraphBuilder;
pub use checkpoint::{
    Checkpoint, CheckpointError, Checkpointer, FileCheckpointer, JoinSnapshot, MemoryCheckpointer,
};
pub use condition::Condition;
pub use error::{BuildError, CompileError, ExecuteError};
pub use executor::{
    ExecuteOptions, ExecutionContext, Executor, RunOutcome, StepEvent,
};
pub use graph::{Edge, Graph, GroupTag, JoinMode};
pub use middleware::{Next, NodeFuture, NodeMiddleware};
pub use node::{handler_fn, Node, NodeHandler, NodeOutcome};
pub use retry::{Backoff, RetryMiddleware, RetryPolicy};
pub use state::{ExecutionStep, WorkflowState};
