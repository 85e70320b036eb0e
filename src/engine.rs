//! `Engine::run` ties the Frontier/Scheduler (C5), Worker Pool (C6), and
//! Merge Coordinator (C7) together into the `Run(ctx, runID, initialState)`
//! operation. One `Engine` owns a graph, a reducer, a store, and an event
//! sink; it is reusable across many runs (each `run`/`replay` call is
//! independent — `Engine` is a long-lived handle over a shared store rather
//! than a per-invocation object).

use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::task::JoinSet;

use crate::concurrency::CancelToken;
use crate::error::{EngineError, EngineResult};
use crate::events::{Event, EventKind, EventSink};
use crate::frontier::Frontier;
use crate::graph::Graph;
use crate::merge::{Completed, MergeCoordinator, Reducer};
use crate::options::RunOptions;
use crate::replay::{self, ReplaySummary};
use crate::store::Store;
use crate::work_item::{OrderKey, WorkItem};
use crate::worker::WorkerPool;

/// How often the main loop re-checks for no-progress / cancellation /
/// wall-clock expiry while no worker has completed. Not user-configurable:
/// it only governs how promptly those conditions are noticed, not engine
/// semantics.
const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// The outcome of a completed `Engine::run` call.
#[derive(Debug, Clone)]
pub struct RunOutcome<S> {
    pub final_state: S,
    /// Number of steps merged during this invocation (dense, `0..steps`).
    pub steps: u64,
}

/// A reusable handle over one graph, reducer, store, and event sink.
/// `S` is the user's workflow state type.
pub struct Engine<S> {
    graph: Arc<Graph<S>>,
    reducer: Reducer<S>,
    store: Arc<dyn Store<S>>,
    sink: Arc<dyn EventSink>,
}

impl<S> Engine<S>
where
    S: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
{
    pub fn new(
        graph: Graph<S>,
        reducer: Reducer<S>,
        store: Arc<dyn Store<S>>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            graph: Arc::new(graph),
            reducer,
            store,
            sink,
        }
    }

    pub fn graph(&self) -> &Graph<S> {
        &self.graph
    }

    pub fn store(&self) -> &Arc<dyn Store<S>> {
        &self.store
    }

    /// Runs the graph to completion (or failure) for `run_id`, starting
    /// from `initial_state`.
    ///
    /// `initial_state` is consulted even if `run_id` already has persisted
    /// steps: re-dispatching the entry node against an already-completed
    /// run relies on the store's idempotency check to short-circuit every
    /// already-recorded step as a no-op, only
    /// resuming real work once the replay catches up to the first
    /// unrecorded step. See DESIGN.md for why this, rather than a
    /// separate resume path, is how `run_id` collision is handled.
    pub async fn run(
        &self,
        run_id: impl Into<String>,
        initial_state: S,
        opts: RunOptions,
    ) -> EngineResult<RunOutcome<S>> {
        let run_id = run_id.into();
        self.sink
            .emit(
                Event::new(&run_id, EventKind::RunStart).with_meta(serde_json::json!({
                    "conflict_policy": format!("{:?}", opts.conflict_policy),
                    "max_concurrent": opts.max_concurrent,
                })),
            )
            .await;

        let result = self.run_inner(&run_id, initial_state, &opts).await;

        match &result {
            Ok(outcome) => {
                self.sink
                    .emit(
                        Event::new(&run_id, EventKind::RunEnd)
                            .with_step(outcome.steps)
                            .with_meta(serde_json::json!({ "ok": true })),
                    )
                    .await;
            }
            Err(err) => {
                let _ = self.store.save_last_error(&run_id, &err.to_string()).await;
                self.sink
                    .emit(
                        Event::new(&run_id, EventKind::Error)
                            .with_meta(serde_json::json!({ "error": err.to_string() })),
                    )
                    .await;
            }
        }
        result
    }

    /// Reconstructs the terminal state of a previously run `run_id` by
    /// re-executing every persisted step in order (C8). Unlike `run`,
    /// this never dispatches beyond the recorded step count and never
    /// retries: retries and jitter are disabled during replay.
    pub async fn replay(
        &self,
        run_id: impl Into<String>,
        initial_state: S,
        opts: RunOptions,
    ) -> EngineResult<ReplaySummary<S>> {
        replay::replay_run(
            &self.graph,
            &self.reducer,
            &self.store,
            &self.sink,
            run_id.into(),
            initial_state,
            opts.replay_mode,
        )
        .await
    }

    async fn run_inner(
        &self,
        run_id: &str,
        initial_state: S,
        opts: &RunOptions,
    ) -> EngineResult<RunOutcome<S>> {
        let frontier: Arc<Frontier<S>> = Arc::new(Frontier::new(opts.queue_depth));
        let coordinator = Arc::new(MergeCoordinator::new(
            run_id.to_string(),
            initial_state.clone(),
            self.reducer.clone(),
            opts.unmatched_edge_policy,
            self.store.clone(),
            self.sink.clone(),
        ));
        let pool = Arc::new(WorkerPool::new(opts.max_concurrent));
        let cancel = CancelToken::new();

        let entry = self.graph.entry()?.clone();
        let entry_key = OrderKey::root();
        coordinator.mark_outstanding(entry_key);
        frontier
            .enqueue(
                WorkItem::new(
                    entry_key,
                    entry,
                    initial_state,
                    Instant::now() + opts.default_node_timeout,
                ),
                opts.backpressure_timeout,
            )
            .await?;

        let run_deadline = opts.run_wall_clock_budget.map(|d| Instant::now() + d);
        let mut tasks: JoinSet<EngineResult<Completed<S>>> = JoinSet::new();
        let mut stalls: u32 = 0;

        let outcome = loop {
            if cancel.is_cancelled() {
                break Err(EngineError::Cancelled);
            }
            if let Some(deadline) = run_deadline {
                if Instant::now() >= deadline {
                    cancel.cancel();
                    break Err(EngineError::Cancelled);
                }
            }

            // Dispatch everything currently ready. Dequeue order is
            // ascending OrderKey (invariant 2); since the underlying
            // `tokio::sync::Semaphore` grants permits FIFO, spawning in
            // this order keeps execution start order aligned with
            // dispatch order too.
            let mut dispatched_any = false;
            while let Some(item) = frontier.try_dequeue() {
                dispatched_any = true;
                let graph = self.graph.clone();
                let run_id_owned = run_id.to_string();
                let opts_owned = opts.clone();
                let pool = pool.clone();
                let cancel_child = cancel.child_token();
                let sink = self.sink.clone();
                let order_key = item.order_key;
                tasks.spawn(async move {
                    let start = Instant::now();
                    let node_result = pool
                        .execute(&graph, &run_id_owned, &item, &opts_owned, cancel_child, sink.as_ref())
                        .await?;
                    Ok(Completed {
                        order_key,
                        node: item.node,
                        attempt: item.attempt,
                        wall_clock_ms: start.elapsed().as_millis() as u64,
                        node_result,
                    })
                });
            }

            if frontier.is_empty() && tasks.is_empty() {
                break Ok(());
            }

            if dispatched_any {
                stalls = 0;
            }

            match tokio::time::timeout(POLL_INTERVAL, tasks.join_next()).await {
                Ok(Some(joined)) => {
                    stalls = 0;
                    let completed = match joined {
                        Ok(inner) => inner,
                        Err(join_err) => Err(EngineError::Store(format!(
                            "worker task panicked: {join_err}"
                        ))),
                    };
                    match completed {
                        Ok(completed) => {
                            let follow_ups = match coordinator.submit(&self.graph, completed).await {
                                Ok(f) => f,
                                Err(err) => {
                                    cancel.cancel();
                                    break Err(err);
                                }
                            };
                            if coordinator.current_step() > opts.max_steps {
                                cancel.cancel();
                                break Err(EngineError::MaxStepsExceeded(opts.max_steps));
                            }
                            let mut enqueue_err = None;
                            for follow_up in follow_ups {
                                coordinator.mark_outstanding(follow_up.order_key);
                                crate::metrics::set_queue_depth(frontier.len() as f64);
                                if let Err(err) = frontier
                                    .enqueue(
                                        WorkItem::new(
                                            follow_up.order_key,
                                            follow_up.node,
                                            follow_up.state_snapshot,
                                            Instant::now() + opts.default_node_timeout,
                                        ),
                                        opts.backpressure_timeout,
                                    )
                                    .await
                                {
                                    enqueue_err = Some(err);
                                    break;
                                }
                            }
                            if let Some(err) = enqueue_err {
                                crate::metrics::inc_backpressure_events();
                                self.sink
                                    .emit(
                                        Event::new(run_id, EventKind::Backpressure)
                                            .with_meta(serde_json::json!({
                                                "queue_depth": opts.queue_depth,
                                            })),
                                    )
                                    .await;
                                cancel.cancel();
                                break Err(err);
                            }
                        }
                        Err(err) => {
                            cancel.cancel();
                            break Err(err);
                        }
                    }
                }
                Ok(None) => {
                    // JoinSet was empty; loop back to the completion check.
                }
                Err(_elapsed) => {
                    // A task still running is ordinary I/O latency, not a
                    // stall — it will surface on a later `Ok(Some(joined))`
                    // once it completes or its own per-attempt timeout
                    // fires. Genuine starvation is a frontier holding work
                    // with nothing in flight to ever dispatch it.
                    if tasks.is_empty() && !frontier.is_empty() {
                        stalls += 1;
                        if stalls >= opts.max_stalls {
                            cancel.cancel();
                            break Err(EngineError::NoProgress(opts.max_stalls));
                        }
                    } else {
                        stalls = 0;
                    }
                }
            }
        };

        // Drain any stragglers so their task slots are released even
        // though their results are discarded post-cancellation.
        tasks.shutdown().await;

        outcome.map(|()| RunOutcome {
            final_state: coordinator.current_state(),
            steps: coordinator.current_step(),
        })
    }
}
