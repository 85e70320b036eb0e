//! Graph Definition (C4): a registry of node IDs to node implementations,
//! an entry point, and conditional edges.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// Opaque identifier for a registered node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(Arc<str>);

impl NodeId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        NodeId(Arc::from(s))
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        NodeId(Arc::from(s.as_str()))
    }
}

/// Marker distinguishing a node-returned transient failure (eligible for
/// retry) from a fatal one. An explicit marker rather than substring-
/// matching error text, to avoid false positives.
#[derive(Debug, Clone)]
pub enum NodeErrorKind {
    Transient(String),
    Fatal(String),
}

/// What a node wants to happen after it completes.
#[derive(Debug, Clone)]
pub enum Routing {
    /// Enqueue exactly one follow-up node.
    Goto(NodeId),
    /// Enqueue each of these nodes in parallel, each carrying a distinct
    /// sibling index for deterministic ordering. The same node ID may
    /// appear more than once.
    FanOut(Vec<NodeId>),
    /// No follow-up work; this branch of execution ends here.
    Terminal,
    /// Defer to the graph's conditional edges outgoing from this node.
    UseEdges,
}

/// The result a node produces for one attempt.
#[derive(Debug, Clone)]
pub struct NodeResult<S> {
    /// Partial state update; only the fields the reducer consults matter.
    pub delta: S,
    pub route: Routing,
    /// Free-form event payloads folded into the engine's own
    /// `RoutingDecision` event for this step, under its `custom_events` key.
    pub events: Vec<serde_json::Value>,
    pub error: Option<NodeErrorKind>,
}

impl<S> NodeResult<S> {
    pub fn terminal(delta: S) -> Self {
        Self {
            delta,
            route: Routing::Terminal,
            events: Vec::new(),
            error: None,
        }
    }

    pub fn goto(delta: S, next: impl Into<NodeId>) -> Self {
        Self {
            delta,
            route: Routing::Goto(next.into()),
            events: Vec::new(),
            error: None,
        }
    }

    pub fn fan_out(delta: S, next: impl IntoIterator<Item = NodeId>) -> Self {
        Self {
            delta,
            route: Routing::FanOut(next.into_iter().collect()),
            events: Vec::new(),
            error: None,
        }
    }

    pub fn use_edges(delta: S) -> Self {
        Self {
            delta,
            route: Routing::UseEdges,
            events: Vec::new(),
            error: None,
        }
    }
}

/// A pure transition: `Run(ctx, state) -> NodeResult`.
///
/// Contract (documented, not enforced): do not retain references to the
/// input state past this call; do not mutate process-global state in ways
/// not captured by the returned delta; honor cancellation promptly.
#[async_trait]
pub trait Node<S>: Send + Sync {
    async fn run(&self, ctx: NodeContext, state: S) -> NodeResult<S>;

    /// Per-node override of `RunOptions::default_node_timeout`. `None`
    /// (the default) means every attempt uses the run's default cap.
    fn timeout_override(&self) -> Option<std::time::Duration> {
        None
    }
}

#[async_trait]
impl<S, F, Fut> Node<S> for F
where
    S: Send + 'static,
    F: Fn(NodeContext, S) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = NodeResult<S>> + Send,
{
    async fn run(&self, ctx: NodeContext, state: S) -> NodeResult<S> {
        (self)(ctx, state).await
    }
}

/// Handed to a node on each attempt.
#[derive(Clone)]
pub struct NodeContext {
    pub run_id: Arc<str>,
    pub node: NodeId,
    pub attempt: u32,
    pub cancel: crate::concurrency::CancelToken,
}

/// Predicate function of state, consulted in ascending `order_key` by
/// `UseEdges` routing. Must be pure; the engine does not enforce this.
pub type Predicate<S> = Arc<dyn Fn(&S) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct Edge<S> {
    pub from: NodeId,
    pub to: NodeId,
    pub predicate: Predicate<S>,
    pub order_key: i64,
}

/// Registry of nodes, the entry point, and conditional edges.
pub struct Graph<S> {
    nodes: HashMap<NodeId, Arc<dyn Node<S>>>,
    entry: Option<NodeId>,
    edges: HashMap<NodeId, Vec<Edge<S>>>,
}

impl<S> Default for Graph<S> {
    fn default() -> Self {
        Self {
            nodes: HashMap::new(),
            entry: None,
            edges: HashMap::new(),
        }
    }
}

impl<S> Graph<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node by ID. Fails on duplicate registration.
    pub fn register_node(
        &mut self,
        id: impl Into<NodeId>,
        node: impl Node<S> + 'static,
    ) -> EngineResult<&mut Self> {
        let id = id.into();
        if self.nodes.contains_key(&id) {
            return Err(EngineError::InvalidGraph(format!(
                "duplicate node id {id}"
            )));
        }
        self.nodes.insert(id, Arc::new(node));
        Ok(self)
    }

    /// Set the entry node. Fails if the node is unknown.
    pub fn set_entry(&mut self, id: impl Into<NodeId>) -> EngineResult<&mut Self> {
        let id = id.into();
        if !self.nodes.contains_key(&id) {
            return Err(EngineError::InvalidGraph(format!(
                "entry node {id} is not registered"
            )));
        }
        self.entry = Some(id);
        Ok(self)
    }

    /// Add a conditional edge. Fails if either endpoint is unknown.
    pub fn add_edge(
        &mut self,
        from: impl Into<NodeId>,
        to: impl Into<NodeId>,
        order_key: i64,
        predicate: impl Fn(&S) -> bool + Send + Sync + 'static,
    ) -> EngineResult<&mut Self> {
        let from = from.into();
        let to = to.into();
        if !self.nodes.contains_key(&from) {
            return Err(EngineError::InvalidGraph(format!(
                "edge references unknown source node {from}"
            )));
        }
        if !self.nodes.contains_key(&to) {
            return Err(EngineError::InvalidGraph(format!(
                "edge references unknown target node {to}"
            )));
        }
        let edge = Edge {
            from: from.clone(),
            to,
            predicate: Arc::new(predicate),
            order_key,
        };
        let edges = self.edges.entry(from).or_default();
        edges.push(edge);
        edges.sort_by_key(|e| e.order_key);
        Ok(self)
    }

    pub fn entry(&self) -> EngineResult<&NodeId> {
        self.entry
            .as_ref()
            .ok_or_else(|| EngineError::InvalidGraph("no entry node set".into()))
    }

    pub fn node(&self, id: &NodeId) -> EngineResult<&Arc<dyn Node<S>>> {
        self.nodes
            .get(id)
            .ok_or_else(|| EngineError::UnknownNode(id.clone()))
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn edges_from(&self, id: &NodeId) -> &[Edge<S>] {
        self.edges.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Resolve `UseEdges` routing: the first edge (in ascending
    /// `order_key`) whose predicate is true against `state`. `None` with
    /// no outgoing edges at all means "treat as terminal"; `None` with
    /// edges present but none matching is the caller's cue to raise
    /// `NoRoute`.
    pub fn first_matching_edge(&self, id: &NodeId, state: &S) -> EdgeResolution<'_> {
        let edges = self.edges_from(id);
        if edges.is_empty() {
            return EdgeResolution::NoEdges;
        }
        for edge in edges {
            if (edge.predicate)(state) {
                return EdgeResolution::Matched(edge.to.clone());
            }
        }
        EdgeResolution::NoMatch
    }
}

pub enum EdgeResolution<'a> {
    NoEdges,
    Matched(NodeId),
    NoMatch,
}

// Silence the unused-lifetime-ish warning from EdgeResolution's phantom
// borrow; kept for API symmetry with `edges_from`.
impl<'a> EdgeResolution<'a> {
    pub fn is_no_edges(&self) -> bool {
        matches!(self, EdgeResolution::NoEdges)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    #[async_trait]
    impl Node<i64> for Noop {
        async fn run(&self, _ctx: NodeContext, state: i64) -> NodeResult<i64> {
            NodeResult::terminal(state)
        }
    }

    #[test]
    fn duplicate_node_registration_fails() {
        let mut g: Graph<i64> = Graph::new();
        g.register_node("a", Noop).unwrap();
        assert!(g.register_node("a", Noop).is_err());
    }

    #[test]
    fn entry_must_reference_known_node() {
        let mut g: Graph<i64> = Graph::new();
        assert!(g.set_entry("missing").is_err());
        g.register_node("a", Noop).unwrap();
        assert!(g.set_entry("a").is_ok());
    }

    #[test]
    fn edge_endpoints_must_be_known() {
        let mut g: Graph<i64> = Graph::new();
        g.register_node("a", Noop).unwrap();
        assert!(g.add_edge("a", "b", 0, |_| true).is_err());
        g.register_node("b", Noop).unwrap();
        assert!(g.add_edge("a", "b", 0, |_| true).is_ok());
    }

    #[test]
    fn edges_are_ordered_ascending_and_first_match_wins() {
        let mut g: Graph<i64> = Graph::new();
        g.register_node("a", Noop).unwrap();
        g.register_node("b", Noop).unwrap();
        g.register_node("c", Noop).unwrap();
        g.add_edge("a", "c", 5, |_| true).unwrap();
        g.add_edge("a", "b", 1, |_| true).unwrap();

        match g.first_matching_edge(&NodeId::from("a"), &0) {
            EdgeResolution::Matched(to) => assert_eq!(to, NodeId::from("b")),
            _ => panic!("expected a match"),
        }
    }
}
