//! Property-based coverage for two of the engine's core guarantees:
//! determinism across independent runs of the same graph, and
//! sibling-order-preserving merge of a fan-out regardless of which
//! branch finishes first.

use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use serde::{Deserialize, Serialize};
use tokio::runtime::Runtime;

use workgraph::{Engine, Graph, InMemoryStore, NodeId, NodeResult, NullSink, ReduceOutcome, Reducer, RunOptions};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
struct State {
    n: i64,
    items: Vec<String>,
}

fn sum_reducer() -> Reducer<State> {
    Arc::new(|prev: &State, delta: &State| {
        ReduceOutcome::Merged(State {
            n: prev.n + delta.n,
            items: {
                let mut items = prev.items.clone();
                items.extend(delta.items.clone());
                items
            },
        })
    })
}

fn delta_n(n: i64) -> State {
    State {
        n,
        items: Vec::new(),
    }
}

fn loop_graph(depth: i64) -> Graph<State> {
    let mut g: Graph<State> = Graph::new();
    g.register_node("incr", move |_ctx, s: State| async move {
        if s.n >= depth {
            NodeResult::terminal(delta_n(0))
        } else {
            NodeResult::goto(delta_n(1), "incr")
        }
    })
    .unwrap();
    g.set_entry("incr").unwrap();
    g
}

/// `start` fans out to branches with caller-supplied per-branch delays, so
/// completion order can be driven independently of sibling order.
fn fan_out_graph(delays_us: Vec<u64>) -> Graph<State> {
    let mut g: Graph<State> = Graph::new();
    let width = delays_us.len() as u64;
    g.register_node("start", move |_ctx, _s: State| async move {
        let targets: Vec<NodeId> = (0..width).map(|i| NodeId::from(format!("b{i}").as_str())).collect();
        NodeResult::fan_out(delta_n(0), targets)
    })
    .unwrap();
    for (i, delay) in delays_us.into_iter().enumerate() {
        let label = format!("B{i}");
        g.register_node(format!("b{i}").as_str(), move |_ctx, _s: State| {
            let label = label.clone();
            async move {
                if delay > 0 {
                    tokio::time::sleep(Duration::from_micros(delay)).await;
                }
                NodeResult::terminal(State {
                    n: 0,
                    items: vec![label],
                })
            }
        })
        .unwrap();
    }
    g.set_entry("start").unwrap();
    g
}

async fn run_loop(rt_label: &str, depth: i64) -> (i64, u64) {
    let store = Arc::new(InMemoryStore::new());
    let engine = Engine::new(loop_graph(depth), sum_reducer(), store, Arc::new(NullSink));
    let outcome = engine
        .run(rt_label, State::default(), RunOptions::default())
        .await
        .unwrap();
    (outcome.final_state.n, outcome.steps)
}

async fn run_fan_out(run_id: &str, delays_us: Vec<u64>) -> Vec<String> {
    let store = Arc::new(InMemoryStore::new());
    let engine = Engine::new(fan_out_graph(delays_us), sum_reducer(), store, Arc::new(NullSink));
    let outcome = engine
        .run(run_id, State::default(), RunOptions::default())
        .await
        .unwrap();
    outcome.final_state.items
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property 1 (spec §8): two runs of the same graph and initial state,
    /// under distinct runIDs, reach the same final state and step count.
    #[test]
    fn prop_determinism_across_independent_run_ids(depth in 0i64..40) {
        let rt = Runtime::new().unwrap();
        let (n1, steps1) = rt.block_on(run_loop("run-a", depth));
        let (n2, steps2) = rt.block_on(run_loop("run-b", depth));
        prop_assert_eq!(n1, n2);
        prop_assert_eq!(steps1, steps2);
        prop_assert_eq!(n1, depth);
    }

    /// Property 3 (spec §8): fan-out siblings merge in sibling-index order
    /// regardless of which branch's future resolves first. Sibling 0 is
    /// always given the longest delay so it is never accidentally first.
    #[test]
    fn prop_fan_out_merges_in_sibling_order_under_reversed_completion(width in 2usize..6) {
        let delays: Vec<u64> = (0..width).map(|i| ((width - i) * 200) as u64).collect();
        let expected: Vec<String> = (0..width).map(|i| format!("B{i}")).collect();
        let rt = Runtime::new().unwrap();
        let items = rt.block_on(run_fan_out("fan-out-prop", delays));
        prop_assert_eq!(items, expected);
    }
}

#[cfg(test)]
mod sanity {
    use super::*;

    #[tokio::test]
    async fn loop_graph_reaches_requested_depth() {
        let (n, steps) = run_loop("sanity-loop", 5).await;
        assert_eq!(n, 5);
        assert_eq!(steps, 6);
    }
}
