//! Replay Engine (C8): reconstructs a run's terminal state by re-executing
//! every persisted step in recorded order, checking (strict mode) or
//! logging (lenient mode) divergence from what was recorded.
//!
//! This is the explicit, audit-oriented replay path — distinct from what
//! happens when `Engine::run` is called again with a
//! `run_id` that already has steps (see `engine.rs`'s module docs and
//! DESIGN.md for how that implicit case is handled via store idempotency
//! instead of this module).

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::concurrency::CancelToken;
use crate::error::{EngineError, EngineResult};
use crate::events::{Event, EventKind, EventSink};
use crate::graph::{Graph, NodeContext};
use crate::merge::{ReduceOutcome, Reducer};
use crate::options::ReplayMode;
use crate::store::Store;

/// One step whose re-executed result didn't bit-match the recorded one.
/// Only ever non-empty under `ReplayMode::Lenient` — `Strict` fails fast
/// on the first mismatch instead of collecting them.
#[derive(Debug, Clone)]
pub struct ReplayMismatch {
    pub step: u64,
    pub node: crate::graph::NodeId,
    pub detail: String,
}

/// Outcome of a completed replay.
#[derive(Debug, Clone)]
pub struct ReplaySummary<S> {
    pub final_state: S,
    pub steps_replayed: u64,
    pub mismatches: Vec<ReplayMismatch>,
}

/// Re-executes every step persisted for `run_id`, starting from
/// `initial_state`, and compares each result against the stored record.
///
/// Retries and jitter are disabled: each step's node runs exactly once
/// with `attempt` set to whatever was recorded.
pub(crate) async fn replay_run<S>(
    graph: &Graph<S>,
    reducer: &Reducer<S>,
    store: &Arc<dyn Store<S>>,
    sink: &Arc<dyn EventSink>,
    run_id: String,
    initial_state: S,
    mode: ReplayMode,
) -> EngineResult<ReplaySummary<S>>
where
    S: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
{
    let last = store
        .last_step(&run_id)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("run {run_id} has no persisted steps")))?;

    sink.emit(Event::new(&run_id, EventKind::RunStart).with_meta(serde_json::json!({
        "replay": true,
        "mode": format!("{mode:?}"),
    })))
    .await;

    let cancel = CancelToken::new();
    let mut state = initial_state;
    let mut mismatches = Vec::new();

    for step in 0..=last {
        let record = store.load_step(&run_id, step).await?;
        let node = graph.node(&record.node_id)?.clone();
        let ctx = NodeContext {
            run_id: Arc::from(run_id.as_str()),
            node: record.node_id.clone(),
            attempt: record.attempt,
            cancel: cancel.child_token(),
        };

        let result = node.run(ctx, state.clone()).await;
        if let Some(error) = &result.error {
            return Err(EngineError::NodeFatal {
                node: record.node_id.clone(),
                attempt: record.attempt,
                message: format!("node reported an error during replay: {error:?}"),
            });
        }

        let recomputed = match (reducer)(&state, &result.delta) {
            ReduceOutcome::Merged(s) => s,
            ReduceOutcome::Conflict => {
                return Err(EngineError::MergeConflict {
                    step,
                    node: record.node_id.clone(),
                })
            }
        };

        let matches = serde_json::to_vec(&recomputed)? == serde_json::to_vec(&record.post_state)?;
        if !matches {
            let detail = format!(
                "recomputed state for node {} at step {step} diverged from the recorded postState",
                record.node_id
            );
            match mode {
                ReplayMode::Strict => {
                    return Err(EngineError::ReplayMismatch { step, detail });
                }
                ReplayMode::Lenient | ReplayMode::Off => {
                    sink.emit(
                        Event::new(&run_id, EventKind::Error)
                            .with_step(step)
                            .with_node(record.node_id.clone())
                            .with_meta(serde_json::json!({ "replay_mismatch": detail })),
                    )
                    .await;
                    mismatches.push(ReplayMismatch {
                        step,
                        node: record.node_id.clone(),
                        detail,
                    });
                }
            }
        }

        // Lenient/Off continue from the stored truth even on divergence;
        // Strict never reaches here with a mismatch outstanding.
        state = record.post_state.clone();
    }

    sink.emit(
        Event::new(&run_id, EventKind::RunEnd).with_step(last).with_meta(serde_json::json!({
            "replay": true,
            "mismatches": mismatches.len(),
        })),
    )
    .await;

    Ok(ReplaySummary {
        final_state: state,
        steps_replayed: last + 1,
        mismatches,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NullSink;
    use crate::graph::{NodeId, NodeResult};
    use crate::store::InMemoryStore;

    fn reducer() -> Reducer<i64> {
        Arc::new(|prev: &i64, delta: &i64| ReduceOutcome::Merged(prev + delta))
    }

    async fn seed_run(store: &InMemoryStore<i64>) {
        let node = NodeId::from("incr");
        store.save_step("r1", 0, &node, &1, 1, 0).await.unwrap();
        store.save_step("r1", 1, &node, &2, 1, 0).await.unwrap();
        store.save_step("r1", 2, &node, &3, 1, 0).await.unwrap();
    }

    #[tokio::test]
    async fn strict_replay_of_a_deterministic_run_succeeds_with_no_mismatches() {
        let inmem = InMemoryStore::new();
        seed_run(&inmem).await;
        let store: Arc<dyn Store<i64>> = Arc::new(inmem);

        let mut g: Graph<i64> = Graph::new();
        g.register_node("incr", |_ctx, _s: i64| async move { NodeResult::terminal(1) })
            .unwrap();

        let sink: Arc<dyn EventSink> = Arc::new(NullSink);
        let summary = replay_run(&g, &reducer(), &store, &sink, "r1".to_string(), 0, ReplayMode::Strict)
            .await
            .unwrap();

        assert_eq!(summary.final_state, 3);
        assert_eq!(summary.steps_replayed, 3);
        assert!(summary.mismatches.is_empty());
    }

    #[tokio::test]
    async fn strict_replay_fails_on_first_mismatch() {
        let inmem = InMemoryStore::new();
        seed_run(&inmem).await;
        let store: Arc<dyn Store<i64>> = Arc::new(inmem);

        // "incr" now emits a delta of 2 instead of 1: diverges from the
        // recorded postState of 1 at step 0.
        let mut g: Graph<i64> = Graph::new();
        g.register_node("incr", |_ctx, _s: i64| async move { NodeResult::terminal(2) })
            .unwrap();

        let sink: Arc<dyn EventSink> = Arc::new(NullSink);
        let err = replay_run(&g, &reducer(), &store, &sink, "r1".to_string(), 0, ReplayMode::Strict).await;
        assert!(matches!(err, Err(EngineError::ReplayMismatch { step: 0, .. })));
    }

    #[tokio::test]
    async fn lenient_replay_collects_mismatches_and_continues_from_stored_truth() {
        let inmem = InMemoryStore::new();
        seed_run(&inmem).await;
        let store: Arc<dyn Store<i64>> = Arc::new(inmem);

        let mut g: Graph<i64> = Graph::new();
        g.register_node("incr", |_ctx, _s: i64| async move { NodeResult::terminal(2) })
            .unwrap();

        let sink: Arc<dyn EventSink> = Arc::new(NullSink);
        let summary = replay_run(&g, &reducer(), &store, &sink, "r1".to_string(), 0, ReplayMode::Lenient)
            .await
            .unwrap();

        assert_eq!(summary.mismatches.len(), 3);
        // Final state comes from the stored record, not the recomputation.
        assert_eq!(summary.final_state, 3);
    }

    #[tokio::test]
    async fn replay_of_unknown_run_is_not_found() {
        let store: Arc<dyn Store<i64>> = Arc::new(InMemoryStore::new());
        let g: Graph<i64> = Graph::new();
        let sink: Arc<dyn EventSink> = Arc::new(NullSink);
        let err = replay_run(&g, &reducer(), &store, &sink, "missing".to_string(), 0, ReplayMode::Strict).await;
        assert!(matches!(err, Err(EngineError::NotFound(_))));
    }
}
