//! Merge Coordinator (C7): the single-threaded committer.
//!
//! Completed node results arrive here from however many workers finished
//! them in parallel; this module reorders them by `OrderKey` and applies
//! each one's delta to the canonical state in strict ascending order. A
//! result is only committed once every `OrderKey` smaller than it has
//! already been committed — tracked via an `outstanding` set of every
//! dispatched-but-not-yet-committed key, not a precomputed predecessor
//! count, since fan-out width is only known once the enqueueing node
//! itself runs.

use std::cmp::Ordering;
use std::collections::{BTreeSet, BinaryHeap};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{EngineError, EngineResult};
use crate::events::{Event, EventKind, EventSink};
use crate::graph::{EdgeResolution, Graph, NodeId, NodeResult, Routing};
use crate::options::UnmatchedEdgePolicy;
use crate::store::Store;
use crate::work_item::OrderKey;

/// Outcome of applying a delta to the prior state.
pub enum ReduceOutcome<S> {
    Merged(S),
    /// The reducer detected two concurrent writers of the same logical
    /// field. Always fatal (`MergeConflict`) regardless of
    /// `ConflictPolicy` — under `LastWriteWins`/`Custom` a correct reducer
    /// never returns this variant.
    Conflict,
}

/// Pure function supplied by the embedder: `(prev, delta) -> next`.
pub type Reducer<S> = Arc<dyn Fn(&S, &S) -> ReduceOutcome<S> + Send + Sync>;

/// One worker's finished attempt, ready to be ordered and committed.
pub struct Completed<S> {
    pub order_key: OrderKey,
    pub node: NodeId,
    pub attempt: u32,
    pub wall_clock_ms: u64,
    pub node_result: NodeResult<S>,
}

/// A follow-up the caller must enqueue onto the frontier (and register as
/// outstanding before dispatch, via [`MergeCoordinator::mark_outstanding`]).
pub struct FollowUp<S> {
    pub order_key: OrderKey,
    pub node: NodeId,
    pub state_snapshot: S,
}

struct ReadyEntry<S> {
    completed: Completed<S>,
}

impl<S> PartialEq for ReadyEntry<S> {
    fn eq(&self, other: &Self) -> bool {
        self.completed.order_key == other.completed.order_key
    }
}
impl<S> Eq for ReadyEntry<S> {}

impl<S> PartialOrd for ReadyEntry<S> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<S> Ord for ReadyEntry<S> {
    fn cmp(&self, other: &Self) -> Ordering {
        other.completed.order_key.cmp(&self.completed.order_key)
    }
}

pub struct MergeCoordinator<S> {
    run_id: String,
    reducer: Reducer<S>,
    unmatched_edge_policy: UnmatchedEdgePolicy,
    store: Arc<dyn Store<S>>,
    sink: Arc<dyn EventSink>,
    current_state: Mutex<S>,
    step_counter: AtomicU64,
    outstanding: Mutex<BTreeSet<OrderKey>>,
    ready: Mutex<BinaryHeap<ReadyEntry<S>>>,
}

impl<S> MergeCoordinator<S>
where
    S: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
{
    pub fn new(
        run_id: impl Into<String>,
        initial_state: S,
        reducer: Reducer<S>,
        unmatched_edge_policy: UnmatchedEdgePolicy,
        store: Arc<dyn Store<S>>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            reducer,
            unmatched_edge_policy,
            store,
            sink,
            current_state: Mutex::new(initial_state),
            step_counter: AtomicU64::new(0),
            outstanding: Mutex::new(BTreeSet::new()),
            ready: Mutex::new(BinaryHeap::new()),
        }
    }

    pub fn current_step(&self) -> u64 {
        self.step_counter.load(AtomicOrdering::Acquire)
    }

    pub fn current_state(&self) -> S {
        self.current_state.lock().clone()
    }

    /// Registers a dispatched item as pending commit. Call before handing
    /// the item to a worker, so the coordinator knows not to commit a
    /// later-keyed sibling ahead of it.
    pub fn mark_outstanding(&self, key: OrderKey) {
        self.outstanding.lock().insert(key);
    }

    /// Submits one finished attempt and commits every ready-in-order
    /// result this unblocks, returning the follow-up work items their
    /// routing produced.
    pub async fn submit(
        &self,
        graph: &Graph<S>,
        completed: Completed<S>,
    ) -> EngineResult<Vec<FollowUp<S>>> {
        self.ready.lock().push(ReadyEntry { completed });

        let mut follow_ups = Vec::new();
        loop {
            let next_key = {
                let outstanding = self.outstanding.lock();
                match outstanding.iter().next() {
                    Some(k) => *k,
                    None => break,
                }
            };
            let ready_top_is_next = self
                .ready
                .lock()
                .peek()
                .map(|e| e.completed.order_key == next_key)
                .unwrap_or(false);
            if !ready_top_is_next {
                break;
            }
            let entry = self.ready.lock().pop().expect("peeked above");
            self.outstanding.lock().remove(&next_key);
            follow_ups.extend(self.commit_one(graph, entry.completed).await?);
        }
        Ok(follow_ups)
    }

    async fn commit_one(
        &self,
        graph: &Graph<S>,
        completed: Completed<S>,
    ) -> EngineResult<Vec<FollowUp<S>>> {
        let Completed {
            order_key: _,
            node,
            attempt,
            wall_clock_ms,
            node_result,
        } = completed;

        let conflict = {
            let current = self.current_state.lock();
            match (self.reducer)(&current, &node_result.delta) {
                ReduceOutcome::Merged(s) => Ok(s),
                ReduceOutcome::Conflict => Err(()),
            }
        };
        let new_state = match conflict {
            Ok(s) => s,
            Err(()) => {
                crate::metrics::inc_merge_conflicts();
                let step = self.current_step();
                self.sink
                    .emit(
                        Event::new(&self.run_id, EventKind::MergeConflict)
                            .with_step(step)
                            .with_node(node.clone()),
                    )
                    .await;
                return Err(EngineError::MergeConflict { step, node });
            }
        };

        let step = self.step_counter.fetch_add(1, AtomicOrdering::AcqRel);
        self.store
            .save_step(&self.run_id, step, &node, &new_state, attempt, wall_clock_ms)
            .await?;
        *self.current_state.lock() = new_state.clone();
        crate::metrics::record_step_latency_ms(wall_clock_ms as f64);

        self.sink
            .emit(
                Event::new(&self.run_id, EventKind::NodeEnd)
                    .with_step(step)
                    .with_node(node.clone())
                    .with_meta(serde_json::json!({
                        "attempt": attempt,
                        "wall_clock_ms": wall_clock_ms,
                    })),
            )
            .await;

        self.resolve_routing(graph, &node, step, &new_state, node_result.route, node_result.events)
            .await
    }

    /// Resolves `route` against the graph and emits the `RoutingDecision`
    /// event describing the engine's own resolved outcome — the actual
    /// target(s) or no-route verdict, not whatever arbitrary payloads the
    /// node attached via `custom_events`.
    async fn resolve_routing(
        &self,
        graph: &Graph<S>,
        from: &NodeId,
        step: u64,
        state: &S,
        route: Routing,
        custom_events: Vec<serde_json::Value>,
    ) -> EngineResult<Vec<FollowUp<S>>> {
        let (decision_meta, result) = match route {
            Routing::Terminal => (serde_json::json!({ "route": "terminal" }), Ok(Vec::new())),
            Routing::Goto(to) => {
                if !graph.contains(&to) {
                    (serde_json::json!({ "route": "goto", "to": to.as_str() }), Err(EngineError::UnknownNode(to)))
                } else {
                    let meta = serde_json::json!({ "route": "goto", "to": to.as_str() });
                    let out = vec![FollowUp {
                        order_key: OrderKey::child(step + 1, 0),
                        node: to,
                        state_snapshot: state.clone(),
                    }];
                    (meta, Ok(out))
                }
            }
            Routing::FanOut(targets) => {
                let names: Vec<&str> = targets.iter().map(NodeId::as_str).collect();
                let meta = serde_json::json!({ "route": "fan_out", "to": names });
                let mut out = Vec::with_capacity(targets.len());
                let mut err = None;
                for (sibling_index, to) in targets.into_iter().enumerate() {
                    if !graph.contains(&to) {
                        err = Some(EngineError::UnknownNode(to));
                        break;
                    }
                    out.push(FollowUp {
                        order_key: OrderKey::child(step + 1, sibling_index as u64),
                        node: to,
                        state_snapshot: state.clone(),
                    });
                }
                (meta, match err {
                    Some(e) => Err(e),
                    None => Ok(out),
                })
            }
            Routing::UseEdges => match graph.first_matching_edge(from, state) {
                EdgeResolution::NoEdges => (
                    serde_json::json!({ "route": "use_edges", "matched": null }),
                    Ok(Vec::new()),
                ),
                EdgeResolution::Matched(to) => {
                    let meta = serde_json::json!({ "route": "use_edges", "matched": to.as_str() });
                    let out = vec![FollowUp {
                        order_key: OrderKey::child(step + 1, 0),
                        node: to,
                        state_snapshot: state.clone(),
                    }];
                    (meta, Ok(out))
                }
                EdgeResolution::NoMatch => (
                    serde_json::json!({ "route": "use_edges", "matched": null, "no_match": true }),
                    match self.unmatched_edge_policy {
                        UnmatchedEdgePolicy::Error => Err(EngineError::NoRoute(from.clone())),
                        UnmatchedEdgePolicy::Terminal => Ok(Vec::new()),
                    },
                ),
            },
        };

        let mut meta = decision_meta;
        if !custom_events.is_empty() {
            meta["custom_events"] = serde_json::Value::Array(custom_events);
        }
        self.sink
            .emit(
                Event::new(&self.run_id, EventKind::RoutingDecision)
                    .with_step(step)
                    .with_node(from.clone())
                    .with_meta(meta),
            )
            .await;

        result
    }
}
