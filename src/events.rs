//! Event Sink (C2): best-effort delivery of structured execution events.
//!
//! A trait so the engine can be embedded with a log sink, a buffered sink
//! for tests/replay inspection, a rate-limited sink for noisy consumers, or
//! a user's own adapter — all living outside the core rather than baked
//! into the scheduling loop.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::graph::NodeId;

/// The standard event kinds emitted by the engine itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    RunStart,
    RunEnd,
    NodeStart,
    NodeEnd,
    RoutingDecision,
    Retry,
    MergeConflict,
    Backpressure,
    Error,
}

/// One structured execution event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub run_id: String,
    pub step: Option<u64>,
    pub node_id: Option<NodeId>,
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    pub meta: Value,
}

impl Event {
    pub fn new(run_id: impl Into<String>, kind: EventKind) -> Self {
        Self {
            run_id: run_id.into(),
            step: None,
            node_id: None,
            kind,
            timestamp: Utc::now(),
            meta: Value::Null,
        }
    }

    pub fn with_step(mut self, step: u64) -> Self {
        self.step = Some(step);
        self
    }

    pub fn with_node(mut self, node: NodeId) -> Self {
        self.node_id = Some(node);
        self
    }

    pub fn with_meta(mut self, meta: Value) -> Self {
        self.meta = meta;
        self
    }
}

/// Sinks are best-effort: a sink failure is logged internally and never
/// promoted into a run failure.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: Event);
}

/// Discards everything. The default when no sink is configured.
pub struct NullSink;

#[async_trait]
impl EventSink for NullSink {
    async fn emit(&self, _event: Event) {}
}

/// Emits each event as a `tracing` event at `info` level.
pub struct LogSink;

#[async_trait]
impl EventSink for LogSink {
    async fn emit(&self, event: Event) {
        tracing::info!(
            run_id = %event.run_id,
            step = ?event.step,
            node = ?event.node_id,
            kind = ?event.kind,
            meta = %event.meta,
            "workflow event"
        );
    }
}

/// Accumulates events in memory; used by tests and by replay to inspect
/// what a run emitted without standing up external infrastructure.
#[derive(Clone, Default)]
pub struct BufferedSink {
    events: Arc<Mutex<Vec<Event>>>,
}

impl BufferedSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drain(&self) -> Vec<Event> {
        std::mem::take(&mut self.events.lock())
    }

    pub fn snapshot(&self) -> Vec<Event> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl EventSink for BufferedSink {
    async fn emit(&self, event: Event) {
        self.events.lock().push(event);
    }
}

/// Wraps another sink and drops events past `max_per_window` within
/// `window`, so a noisy run can't overwhelm a downstream collector. A
/// dropped event never affects run outcome — delivery is best-effort by
/// design.
pub struct RateLimitedSink<S> {
    inner: S,
    max_per_window: u32,
    window: Duration,
    state: Mutex<(Instant, u32)>,
}

impl<S: EventSink> RateLimitedSink<S> {
    pub fn new(inner: S, max_per_window: u32, window: Duration) -> Self {
        Self {
            inner,
            max_per_window,
            window,
            state: Mutex::new((Instant::now(), 0)),
        }
    }

    fn allow(&self) -> bool {
        let mut state = self.state.lock();
        let (window_start, count) = *state;
        if window_start.elapsed() >= self.window {
            *state = (Instant::now(), 1);
            true
        } else if count < self.max_per_window {
            state.1 += 1;
            true
        } else {
            false
        }
    }
}

#[async_trait]
impl<S: EventSink> EventSink for RateLimitedSink<S> {
    async fn emit(&self, event: Event) {
        if self.allow() {
            self.inner.emit(event).await;
        }
    }
}
