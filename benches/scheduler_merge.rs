// benches/scheduler_merge.rs
//! Throughput of the frontier/worker-pool/merge-coordinator pipeline
//! end to end: a small deterministic loop (varying step count) and a
//! fan-out/fan-in graph (varying branch width, completing out of
//! submission order) run against `InMemoryStore`.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde::{Deserialize, Serialize};
use tokio::runtime::Runtime;

use workgraph::{Engine, Graph, NodeId, NodeResult, OrderKey, ReduceOutcome, Reducer, RunOptions};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
struct Counter {
    n: i64,
    items: Vec<String>,
}

fn sum_reducer() -> Reducer<Counter> {
    Arc::new(|prev: &Counter, delta: &Counter| {
        ReduceOutcome::Merged(Counter {
            n: prev.n + delta.n,
            items: {
                let mut items = prev.items.clone();
                items.extend(delta.items.clone());
                items
            },
        })
    })
}

fn delta_n(n: i64) -> Counter {
    Counter {
        n,
        items: Vec::new(),
    }
}

/// A straight-line loop of `depth` sequential increments before halting.
fn loop_graph(depth: i64) -> Graph<Counter> {
    let mut g: Graph<Counter> = Graph::new();
    g.register_node("incr", move |_ctx, s: Counter| async move {
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

/// `start` fans out to `width` branches, each sleeping an amount inversely
/// proportional to its sibling index so the last-dispatched branch is the
/// first to finish — the coordinator must hold it until every earlier
/// sibling has committed.
fn fan_out_graph(width: u64) -> Graph<Counter> {
    let mut g: Graph<Counter> = Graph::new();
    g.register_node("start", move |_ctx, _s: Counter| async move {
        let targets: Vec<NodeId> = (0..width).map(|i| NodeId::from(format!("b{i}").as_str())).collect();
        NodeResult::fan_out(delta_n(0), targets)
    })
    .unwrap();
    for i in 0..width {
        let delay_us = (width - i) * 10;
        g.register_node(format!("b{i}").as_str(), move |_ctx, _s: Counter| async move {
            tokio::time::sleep(Duration::from_micros(delay_us)).await;
            NodeResult::terminal(delta_n(1))
        })
        .unwrap();
    }
    g.set_entry("start").unwrap();
    g
}

fn bench_sequential_loop(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("sequential_loop");

    for depth in [10_i64, 100, 1_000].iter() {
        group.throughput(Throughput::Elements(*depth as u64));
        group.bench_with_input(BenchmarkId::from_parameter(depth), depth, |b, &depth| {
            b.to_async(&rt).iter(|| async move {
                let store = Arc::new(workgraph::InMemoryStore::new());
                let engine = Engine::new(
                    loop_graph(depth),
                    sum_reducer(),
                    store,
                    Arc::new(workgraph::NullSink),
                );
                let outcome = engine
                    .run(format!("bench-{depth}"), Counter::default(), RunOptions::default())
                    .await
                    .unwrap();
                black_box(outcome.steps);
            });
        });
    }

    group.finish();
}

fn bench_fan_out_merge(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("fan_out_merge");
    group.sample_size(20);

    for width in [4_u64, 16, 64].iter() {
        group.throughput(Throughput::Elements(*width));
        group.bench_with_input(BenchmarkId::from_parameter(width), width, |b, &width| {
            b.to_async(&rt).iter(|| async move {
                let store = Arc::new(workgraph::InMemoryStore::new());
                let engine = Engine::new(
                    fan_out_graph(width),
                    sum_reducer(),
                    store,
                    Arc::new(workgraph::NullSink),
                );
                let opts = RunOptions::builder().max_concurrent(width as usize).build();
                let outcome = engine
                    .run(format!("bench-fanout-{width}"), Counter::default(), opts)
                    .await
                    .unwrap();
                black_box(outcome.final_state.n);
            });
        });
    }

    group.finish();
}

fn bench_order_key_heap_ordering(c: &mut Criterion) {
    let mut group = c.benchmark_group("order_key_heap");
    let counter = AtomicI64::new(0);

    for size in [100_usize, 1_000, 10_000].iter() {
        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            b.iter(|| {
                use std::collections::BinaryHeap;
                let mut heap: BinaryHeap<std::cmp::Reverse<OrderKey>> = BinaryHeap::new();
                for i in 0..size {
                    let key = OrderKey::child((size - i) as u64, counter.fetch_add(1, Ordering::Relaxed) as u64 % 8);
                    heap.push(std::cmp::Reverse(key));
                }
                let mut last = None;
                while let Some(std::cmp::Reverse(key)) = heap.pop() {
                    if let Some(prev) = last {
                        debug_assert!(prev <= key);
                    }
                    last = Some(key);
                }
                black_box(last);
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_sequential_loop,
    bench_fan_out_merge,
    bench_order_key_heap_ordering,
);
criterion_main!(benches);
