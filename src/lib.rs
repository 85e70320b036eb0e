//! A deterministic, replayable workflow orchestration engine: a directed
//! graph of pure node transitions over a shared typed state, dispatched
//! with bounded concurrency and committed back in a single deterministic
//! order regardless of completion order.
//!
//! The top-level entry point is [`Engine`]: register nodes and edges on a
//! [`Graph`], pair it with a [`Reducer`] and a [`Store`], and call
//! [`Engine::run`]. See `DESIGN.md` for how each module maps onto the
//! engine's components and the crates backing them.

pub mod concurrency;
mod engine;
mod error;
mod events;
mod frontier;
mod graph;
mod merge;
mod metrics;
mod options;
mod replay;
#[cfg(feature = "storage-sled")]
mod store_sled;
#[cfg(feature = "storage-sql")]
mod store_sql;
mod store;
mod work_item;
mod worker;

pub use engine::{Engine, RunOutcome};
pub use error::{EngineError, EngineResult};
pub use events::{BufferedSink, Event, EventKind, EventSink, LogSink, NullSink, RateLimitedSink};
pub use graph::{
    Edge, EdgeResolution, Graph, Node, NodeContext, NodeErrorKind, NodeId, NodeResult, Predicate,
    Routing,
};
pub use merge::{Completed, FollowUp, ReduceOutcome, Reducer};
pub use options::{ConflictPolicy, ReplayMode, RunOptions, RunOptionsBuilder, UnmatchedEdgePolicy};
pub use replay::{ReplayMismatch, ReplaySummary};
pub use store::{Checkpoint, InMemoryStore, StepRecord, Store};
pub use work_item::{OrderKey, WorkItem};

#[cfg(feature = "storage-sled")]
pub use store_sled::SledStore;
#[cfg(feature = "storage-sql")]
pub use store_sql::SqlStore;

/// Installs the default `tracing` subscriber the CLI binary and tests use:
/// env-filter driven, defaulting to `info` when `RUST_LOG` is unset.
/// Library embedders that already configure their own subscriber should
/// not call this.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
