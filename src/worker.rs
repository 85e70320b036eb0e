//! Worker Pool (C6): bounded concurrent node execution.
//!
//! One node attempt at a time per slot, gated by a `tokio::sync::Semaphore`
//! sized to `RunOptions::max_concurrent`. Retries with exponential backoff
//! and jitter happen inside one `execute` call rather than re-entering the
//! frontier, so a retried node keeps its original dispatch slot.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::Semaphore;

use crate::concurrency::CancelToken;
use crate::error::{EngineError, EngineResult};
use crate::events::{Event, EventKind, EventSink};
use crate::graph::{Graph, NodeContext, NodeErrorKind, NodeResult};
use crate::options::RunOptions;
use crate::work_item::{OrderKey, WorkItem};

/// Seeds a generator from `(run_id, order_key)` so backoff jitter is
/// reproducible: replaying the same run with the same key always produces
/// the same delay sequence.
fn seed_rng(run_id: &str, key: OrderKey) -> StdRng {
    let mut hasher = DefaultHasher::new();
    run_id.hash(&mut hasher);
    key.parent_step.hash(&mut hasher);
    key.sibling_index.hash(&mut hasher);
    key.retry_count.hash(&mut hasher);
    StdRng::seed_from_u64(hasher.finish())
}

/// `base * 2^(attempt-1)`, capped at `max`, with equal jitter (half fixed,
/// half random) so concurrent retries don't all land on the same tick.
fn jittered_backoff(opts: &RunOptions, run_id: &str, key: OrderKey, attempt: u32) -> Duration {
    let base_ms = opts.retry_base_backoff.as_millis() as u64;
    let max_ms = opts.retry_max_backoff.as_millis() as u64;
    let exp_ms = base_ms
        .saturating_mul(1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX))
        .min(max_ms);
    let half = exp_ms / 2;
    let mut rng = seed_rng(run_id, key);
    let jitter = if half > 0 { rng.gen_range(0..=half) } else { 0 };
    Duration::from_millis(half + jitter)
}

/// Bounded pool of concurrent node dispatch slots.
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    inflight: AtomicUsize,
}

impl WorkerPool {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            inflight: AtomicUsize::new(0),
        }
    }

    /// Runs one node to either a successful `NodeResult`, a fatal error, or
    /// cancellation — retrying transient failures and timeouts internally.
    pub async fn execute<S>(
        &self,
        graph: &Graph<S>,
        run_id: &str,
        item: &WorkItem<S>,
        opts: &RunOptions,
        cancel: CancelToken,
        sink: &dyn EventSink,
    ) -> EngineResult<NodeResult<S>>
    where
        S: Clone + Send + Sync + 'static,
    {
        let node = graph.node(&item.node)?.clone();

        let _permit = tokio::select! {
            permit = self.semaphore.acquire() => permit.map_err(|_| EngineError::Cancelled)?,
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
        };
        self.inflight.fetch_add(1, Ordering::Relaxed);
        crate::metrics::set_inflight_nodes(self.inflight.load(Ordering::Relaxed) as f64);

        let result = self
            .run_with_retries(&node, graph, run_id, item, opts, cancel, sink)
            .await;

        let remaining = self.inflight.fetch_sub(1, Ordering::Relaxed) - 1;
        crate::metrics::set_inflight_nodes(remaining as f64);
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_with_retries<S>(
        &self,
        node: &Arc<dyn crate::graph::Node<S>>,
        _graph: &Graph<S>,
        run_id: &str,
        item: &WorkItem<S>,
        opts: &RunOptions,
        cancel: CancelToken,
        sink: &dyn EventSink,
    ) -> EngineResult<NodeResult<S>>
    where
        S: Clone + Send + Sync + 'static,
    {
        let mut attempt = item.attempt;
        let mut key = item.order_key;
        // Each attempt (including retries) gets a fresh window of this
        // length rather than counting down from `item.deadline`: retries
        // are handled in this loop instead of re-entering the frontier
        // (see module docs), so there is no per-retry work item whose
        // `deadline` field would otherwise need recomputing.
        let per_attempt_timeout = node.timeout_override().unwrap_or(opts.default_node_timeout);

        loop {
            let ctx = NodeContext {
                run_id: Arc::from(run_id),
                node: item.node.clone(),
                attempt,
                cancel: cancel.child_token(),
            };

            sink.emit(
                Event::new(run_id, EventKind::NodeStart)
                    .with_node(item.node.clone())
                    .with_meta(serde_json::json!({ "attempt": attempt })),
            )
            .await;

            let attempt_result = tokio::select! {
                res = tokio::time::timeout(per_attempt_timeout, node.run(ctx, item.state_snapshot.clone())) => res,
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            };

            // The per-attempt transient condition, carrying enough to
            // build either a `Retry` event or the final `NodeFatal` once
            // retries are exhausted. `NodeTimeout` is its own taxonomy
            // entry even though it escalates the same way `NodeTransient`
            // does.
            let transient: Option<EngineError> = match attempt_result {
                Err(_elapsed) => Some(EngineError::NodeTimeout {
                    node: item.node.clone(),
                    attempt,
                }),
                Ok(node_result) => match &node_result.error {
                    None => return Ok(node_result),
                    Some(NodeErrorKind::Fatal(message)) => {
                        return Err(EngineError::NodeFatal {
                            node: item.node.clone(),
                            attempt,
                            message: message.clone(),
                        })
                    }
                    Some(NodeErrorKind::Transient(message)) => Some(EngineError::NodeTransient {
                        node: item.node.clone(),
                        attempt,
                        message: message.clone(),
                    }),
                },
            };

            let transient = transient.expect("set on every non-return path above");
            let message = match &transient {
                EngineError::NodeTimeout { .. } => "node attempt timed out".to_string(),
                EngineError::NodeTransient { message, .. } => message.clone(),
                _ => unreachable!("transient is always NodeTimeout or NodeTransient"),
            };

            if attempt > opts.retries {
                return Err(EngineError::NodeFatal {
                    node: item.node.clone(),
                    attempt,
                    message,
                });
            }

            crate::metrics::inc_retries();
            sink.emit(
                Event::new(run_id, EventKind::Retry)
                    .with_node(item.node.clone())
                    .with_meta(serde_json::json!({
                        "attempt": attempt,
                        "message": message,
                        "timed_out": matches!(transient, EngineError::NodeTimeout { .. }),
                    })),
            )
            .await;

            let backoff = jittered_backoff(opts, run_id, key, attempt);
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            }

            attempt += 1;
            key = key.retried();
        }
    }
}
