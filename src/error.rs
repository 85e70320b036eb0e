//! Error taxonomy for the workflow engine.
//!
//! Origin and retry policy are documented per variant rather than encoded
//! in the type, since the policy decision (retry vs. fatal) is made by the
//! worker pool and merge coordinator, not by the error type itself.

use crate::graph::NodeId;
use thiserror::Error;

/// Result type used throughout the engine.
pub type EngineResult<T> = Result<T, EngineError>;

/// Comprehensive error taxonomy for the workflow engine.
#[derive(Error, Debug, Clone)]
pub enum EngineError {
    /// A node-returned error explicitly marked transient. Retried up to
    /// `RunOptions::retries` times, then escalated to `NodeFatal`.
    #[error("node {node} transient failure on attempt {attempt}: {message}")]
    NodeTransient {
        node: NodeId,
        attempt: u32,
        message: String,
    },

    /// A node-returned non-transient error, or a transient error whose
    /// retries were exhausted.
    #[error("node {node} failed fatally after {attempt} attempt(s): {message}")]
    NodeFatal {
        node: NodeId,
        attempt: u32,
        message: String,
    },

    /// A node's per-attempt deadline elapsed. Counts as transient.
    #[error("node {node} timed out on attempt {attempt}")]
    NodeTimeout { node: NodeId, attempt: u32 },

    /// `Routing::Goto`/`FanOut` referenced a node ID not present in the graph.
    #[error("routing referenced unknown node {0}")]
    UnknownNode(NodeId),

    /// `UseEdges` resolution found outgoing edges but none matched.
    #[error("no outgoing edge of {0} matched the current state")]
    NoRoute(NodeId),

    /// The frontier stayed full past `BackpressureTimeout`.
    #[error("enqueue blocked past the backpressure timeout")]
    Backpressure,

    /// Total merged steps exceeded `RunOptions::max_steps`.
    #[error("run exceeded the configured step cap of {0}")]
    MaxStepsExceeded(u64),

    /// `ConflictPolicy::Fail` and the reducer signalled a conflict.
    #[error("merge conflict at step {step} merging node {node}")]
    MergeConflict { step: u64, node: NodeId },

    /// The store rejected an overwrite of an existing `(run_id, step)` with
    /// a different payload. Indicates a determinism bug in a node or in
    /// the engine itself, not a transient condition.
    #[error("idempotency violation at run {run_id} step {step}")]
    IdempotencyViolation { run_id: String, step: u64 },

    /// Strict replay found a step whose re-executed result didn't
    /// bit-match the recorded one.
    #[error("replay mismatch at step {step}: {detail}")]
    ReplayMismatch { step: u64, detail: String },

    /// The frontier is non-empty but nothing in it is runnable for
    /// `MaxStalls` consecutive merge attempts.
    #[error("scheduler made no progress for {0} consecutive merges")]
    NoProgress(u32),

    /// The run's context (explicit cancel or wall-clock budget) fired.
    #[error("run was cancelled")]
    Cancelled,

    /// The persistence layer failed. In-flight commits are rolled back
    /// when the backing store supports transactions.
    #[error("store error: {0}")]
    Store(String),

    /// A `(run_id, cp_id)` lookup, or any other addressed lookup, found
    /// nothing.
    #[error("not found: {0}")]
    NotFound(String),

    /// Graph registration failed (duplicate ID, unknown entry node, edge
    /// referencing an unregistered node).
    #[error("invalid graph definition: {0}")]
    InvalidGraph(String),

    /// Serialization/deserialization of state, deltas, or step records
    /// failed.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl EngineError {
    /// Whether this error's *origin* policy is "retry, then fatal".
    /// Retries are driven by the worker pool, which only ever
    /// constructs `NodeTransient`/`NodeTimeout`, so this is really asking
    /// "is this one of those two", but it's exposed for callers that only
    /// have an `EngineError` in hand (e.g. a custom reducer delegating to
    /// `ConflictPolicy::Custom`).
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::NodeTransient { .. } | EngineError::NodeTimeout { .. })
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_variants_are_retryable() {
        let e = EngineError::NodeTransient {
            node: NodeId::from("n"),
            attempt: 1,
            message: "boom".into(),
        };
        assert!(e.is_transient());

        let e = EngineError::NodeFatal {
            node: NodeId::from("n"),
            attempt: 4,
            message: "boom".into(),
        };
        assert!(!e.is_transient());
    }
}
