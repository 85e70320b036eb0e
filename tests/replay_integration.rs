//! End-to-end replay coverage (scenario S5) plus checkpoint
//! persistence across independently opened `SledStore` handles sharing
//! one on-disk directory — the latter pair runs `#[serial]` since sled
//! holds an exclusive file lock on its directory for as long as a `Db`
//! handle is open.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serial_test::serial;

use workgraph::{
    Engine, EngineError, Graph, InMemoryStore, NodeResult, NullSink, ReduceOutcome, Reducer,
    ReplayMode, RunOptions, SledStore, Store,
};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
struct Counter {
    n: i64,
}

fn sum_reducer() -> Reducer<Counter> {
    Arc::new(|prev: &Counter, delta: &Counter| ReduceOutcome::Merged(Counter { n: prev.n + delta.n }))
}

/// Scenario S1, parameterized on the amount `incr` adds so a test
/// can build a "mutated" graph that diverges from a previously recorded run.
fn s1_graph(incr_delta: i64) -> Graph<Counter> {
    let mut g: Graph<Counter> = Graph::new();
    g.register_node("start", |_ctx, _s: Counter| async move {
        NodeResult::goto(Counter { n: 0 }, "incr")
    })
    .unwrap();
    g.register_node("incr", move |_ctx, _s: Counter| async move {
        NodeResult::goto(Counter { n: incr_delta }, "check")
    })
    .unwrap();
    g.register_node("check", |_ctx, s: Counter| async move {
        if s.n >= 3 {
            NodeResult::terminal(Counter { n: 0 })
        } else {
            NodeResult::goto(Counter { n: 0 }, "incr")
        }
    })
    .unwrap();
    g.set_entry("start").unwrap();
    g
}

#[tokio::test]
async fn s5_strict_replay_of_an_unmutated_run_has_no_mismatches() {
    let store = Arc::new(InMemoryStore::new());
    let engine = Engine::new(s1_graph(1), sum_reducer(), store.clone(), Arc::new(NullSink));
    let outcome = engine
        .run("s5", Counter::default(), RunOptions::default())
        .await
        .unwrap();
    assert_eq!(outcome.final_state.n, 3);
    assert_eq!(outcome.steps, 7);

    let mut opts = RunOptions::default();
    opts.replay_mode = ReplayMode::Strict;
    let summary = engine.replay("s5", Counter::default(), opts).await.unwrap();
    assert_eq!(summary.steps_replayed, 7);
    assert!(summary.mismatches.is_empty());
    assert_eq!(summary.final_state.n, 3);
}

#[tokio::test]
async fn s5_strict_replay_fails_at_step_one_after_mutating_incr() {
    let store = Arc::new(InMemoryStore::new());
    let recording_engine = Engine::new(s1_graph(1), sum_reducer(), store.clone(), Arc::new(NullSink));
    recording_engine
        .run("s5-mutated", Counter::default(), RunOptions::default())
        .await
        .unwrap();

    let mutated_engine = Engine::new(s1_graph(2), sum_reducer(), store, Arc::new(NullSink));
    let mut opts = RunOptions::default();
    opts.replay_mode = ReplayMode::Strict;
    let err = mutated_engine
        .replay("s5-mutated", Counter::default(), opts)
        .await;
    match err {
        Err(EngineError::ReplayMismatch { step, .. }) => assert_eq!(step, 1),
        other => panic!("expected ReplayMismatch at step 1, got {other:?}"),
    }
}

#[tokio::test]
async fn lenient_replay_of_a_mutated_run_continues_from_stored_truth() {
    let store = Arc::new(InMemoryStore::new());
    let recording_engine = Engine::new(s1_graph(1), sum_reducer(), store.clone(), Arc::new(NullSink));
    recording_engine
        .run("s5-lenient", Counter::default(), RunOptions::default())
        .await
        .unwrap();

    let mutated_engine = Engine::new(s1_graph(2), sum_reducer(), store, Arc::new(NullSink));
    let mut opts = RunOptions::default();
    opts.replay_mode = ReplayMode::Lenient;
    let summary = mutated_engine
        .replay("s5-lenient", Counter::default(), opts)
        .await
        .unwrap();
    assert_eq!(summary.steps_replayed, 7);
    assert_eq!(summary.mismatches.len(), 1);
    assert_eq!(summary.mismatches[0].step, 1);
    // Lenient mode trusts the stored record, so the terminal state still
    // matches what the original, unmutated run produced.
    assert_eq!(summary.final_state.n, 3);
}

fn fixed_sled_checkpoint_dir() -> std::path::PathBuf {
    std::env::temp_dir().join("workgraph_checkpoint_shared_db")
}

#[tokio::test]
#[serial]
async fn checkpoint_persists_across_independently_opened_sled_handles() {
    let dir = fixed_sled_checkpoint_dir();
    let cp_id = format!("cp-{}", uuid::Uuid::new_v4());

    {
        let store: SledStore<Counter> = SledStore::open(&dir).unwrap();
        store.save_checkpoint(&cp_id, &Counter { n: 42 }, 9).await.unwrap();
    } // handle dropped, sled's file lock released

    let reopened: SledStore<Counter> = SledStore::open(&dir).unwrap();
    let cp = reopened.load_checkpoint(&cp_id).await.unwrap();
    assert_eq!(cp.state.n, 42);
    assert_eq!(cp.step, 9);
}

#[tokio::test]
#[serial]
async fn checkpoint_save_upserts_by_id_on_the_shared_directory() {
    let dir = fixed_sled_checkpoint_dir();
    let cp_id = format!("cp-{}", uuid::Uuid::new_v4());

    let store: SledStore<Counter> = SledStore::open(&dir).unwrap();
    store.save_checkpoint(&cp_id, &Counter { n: 1 }, 0).await.unwrap();
    store.save_checkpoint(&cp_id, &Counter { n: 2 }, 1).await.unwrap();

    let cp = store.load_checkpoint(&cp_id).await.unwrap();
    assert_eq!(cp.state.n, 2);
    assert_eq!(cp.step, 1);
}
