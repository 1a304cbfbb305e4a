//! Error taxonomy for building, compiling and executing graphs.
//!
//! Structural problems are caught at `compile()`, never at runtime; a run
//! ends with either a final state or exactly one of the `ExecuteError`
//! variants.

use crate::checkpoint::CheckpointError;
use thiserror::Error;

/// Errors raised while assembling a graph.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("duplicate node id '{0}'")]
    DuplicateNode(String),
}

/// Structural errors detected by `GraphBuilder::compile`.
///
/// Violations are reported in a stable order: unknown edge endpoints first,
/// then entry/finish checks, then reachability, then group consistency.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("edge '{from} -> {to}' references unknown node '{node}'")]
    UnknownNode { from: String, to: String, node: String },

    #[error("entry point is not set")]
    MissingEntryPoint,

    #[error("finish point is not set")]
    MissingFinishPoint,

    #[error("entry point '{0}' is not a registered node")]
    UnknownEntryPoint(String),

    #[error("finish point '{0}' is not a registered node")]
    UnknownFinishPoint(String),

    #[error("finish node '{finish}' is not reachable from entry '{entry}'")]
    UnreachableFinish { entry: String, finish: String },

    #[error("activation group '{group}' into node '{node}' mixes ALL and ANY modes")]
    InconsistentGroup { group: String, node: String },
}

/// Terminal errors from `Executor::execute` / `Executor::resume`.
#[derive(Debug, Error)]
pub enum ExecuteError {
    /// A node's handler failed (after exhausting any retry budget).
    #[error("node '{node}' failed: {error}")]
    Node { node: String, error: anyhow::Error },

    /// The frontier drained before the finish node fired: the graph's
    /// conditions never routed to finish. Distinct from a node failure.
    #[error("no remaining path to finish node '{finish}'")]
    DeadEnd { finish: String },

    /// The execution context was cancelled. Takes precedence over any
    /// in-flight handler or retry error.
    #[error("execution cancelled")]
    Cancelled,

    /// The checkpointer failed; the underlying storage error is preserved.
    #[error("checkpoint '{id}': {source}")]
    Checkpoint {
        id: String,
        #[source]
        source: CheckpointError,
    },

    /// A node suspended (or `resume` was called) but the graph was compiled
    /// without a checkpointer.
    #[error("graph was compiled without a checkpointer")]
    CheckpointerMissing,

    /// A node suspended but the caller supplied no checkpoint id to save
    /// under.
    #[error("node '{node}' suspended but no checkpoint id was supplied")]
    CheckpointIdMissing { node: String },
}

/// Marker error surfaced through handler results when the run's
/// cancellation token fired during an invocation or a backoff wait.
#[derive(Debug, Error)]
#[error("execution cancelled")]
pub struct Cancelled;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        let err = CompileError::UnknownNode {
            from: "a".into(),
            to: "b".into(),
            node: "b".into(),
        };
        assert!(err.to_string().contains("unknown node 'b'"));

        let err = ExecuteError::DeadEnd { finish: "finish".into() };
        assert!(err.to_string().contains("finish"));

        let err = ExecuteError::Node {
            node: "process".into(),
            error: anyhow::anyhow!("boom"),
        };
        assert!(err.to_string().contains("process"));
        assert!(err.to_string().contains("boom"));
    }
}
