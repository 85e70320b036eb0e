//! Run options: the engine's "configuration layer". Embedded as a typed
//! builder struct rather than a config-file loader, since the engine is a
//! library; the CLI binary (`src/bin/workgraph.rs`) layers `clap` env-var
//! overrides on top of these same fields.

use std::time::Duration;

/// How two concurrent writers to the same logical field are reconciled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictPolicy {
    /// Reducer sees deltas in orderKey order; the later one wins.
    #[default]
    LastWriteWins,
    /// The reducer signals conflict (via `NodeErrorKind`/a sentinel in its
    /// own error path); the coordinator aborts the run.
    Fail,
    /// The reducer is fully responsible; its output is authoritative.
    Custom,
}

/// Replay behavior for `Engine::run` when steps already exist for a run ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplayMode {
    #[default]
    Off,
    /// Mismatches are logged; replay continues using the stored state.
    Lenient,
    /// First mismatch fails the run with `ReplayMismatch`.
    Strict,
}

/// Governs whether `UseEdges` with outgoing edges but no matching predicate
/// is terminal or an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnmatchedEdgePolicy {
    /// Edges exist but none matched: fail with `NoRoute`. The default,
    /// since a silently-terminal node usually means a missing predicate
    /// rather than an intended dead end.
    #[default]
    Error,
    /// Edges exist but none matched: treat as terminal anyway.
    Terminal,
}

/// Options governing one `Engine::run` invocation.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Abort with `MaxStepsExceeded` once merged steps exceed this.
    pub max_steps: u64,
    /// Max retry attempts per node on transient failure.
    pub retries: u32,
    /// Worker pool size.
    pub max_concurrent: usize,
    /// Frontier depth bound.
    pub queue_depth: usize,
    /// How long `enqueue` waits under backpressure before failing.
    pub backpressure_timeout: Duration,
    /// Per-node execution cap, used when a node has no override.
    pub default_node_timeout: Duration,
    /// Overall run deadline, if any.
    pub run_wall_clock_budget: Option<Duration>,
    pub replay_mode: ReplayMode,
    pub conflict_policy: ConflictPolicy,
    pub unmatched_edge_policy: UnmatchedEdgePolicy,
    /// Base delay for exponential backoff (`base * 2^(attempt-1)`).
    pub retry_base_backoff: Duration,
    pub retry_max_backoff: Duration,
    /// Consecutive no-op merge cycles before `NoProgress` is raised.
    pub max_stalls: u32,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            max_steps: 10_000,
            retries: 3,
            max_concurrent: 8,
            queue_depth: 256,
            backpressure_timeout: Duration::from_secs(5),
            default_node_timeout: Duration::from_secs(30),
            run_wall_clock_budget: None,
            replay_mode: ReplayMode::Off,
            conflict_policy: ConflictPolicy::LastWriteWins,
            unmatched_edge_policy: UnmatchedEdgePolicy::Error,
            retry_base_backoff: Duration::from_millis(50),
            retry_max_backoff: Duration::from_secs(10),
            max_stalls: 3,
        }
    }
}

impl RunOptions {
    pub fn builder() -> RunOptionsBuilder {
        RunOptionsBuilder(Self::default())
    }
}

/// Fluent builder over a config-struct-with-setters, rather than exposing
/// public mutable fields as the only API.
#[derive(Debug, Clone)]
pub struct RunOptionsBuilder(RunOptions);

macro_rules! setter {
    ($name:ident, $field:ident, $ty:ty) => {
        pub fn $name(mut self, value: $ty) -> Self {
            self.0.$field = value;
            self
        }
    };
}

impl RunOptionsBuilder {
    setter!(max_steps, max_steps, u64);
    setter!(retries, retries, u32);
    setter!(max_concurrent, max_concurrent, usize);
    setter!(queue_depth, queue_depth, usize);
    setter!(backpressure_timeout, backpressure_timeout, Duration);
    setter!(default_node_timeout, default_node_timeout, Duration);
    setter!(replay_mode, replay_mode, ReplayMode);
    setter!(conflict_policy, conflict_policy, ConflictPolicy);
    setter!(unmatched_edge_policy, unmatched_edge_policy, UnmatchedEdgePolicy);
    setter!(retry_base_backoff, retry_base_backoff, Duration);
    setter!(retry_max_backoff, retry_max_backoff, Duration);
    setter!(max_stalls, max_stalls, u32);

    pub fn run_wall_clock_budget(mut self, value: Duration) -> Self {
        self.0.run_wall_clock_budget = Some(value);
        self
    }

    pub fn build(self) -> RunOptions {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_overrides_defaults() {
        let opts = RunOptions::builder()
            .retries(5)
            .max_concurrent(2)
            .conflict_policy(ConflictPolicy::Fail)
            .build();
        assert_eq!(opts.retries, 5);
        assert_eq!(opts.max_concurrent, 2);
        assert_eq!(opts.conflict_policy, ConflictPolicy::Fail);
        assert_eq!(opts.max_steps, RunOptions::default().max_steps);
    }
}
