use std::fmt::{Debug, Display};
use std::hash::Hash;

use futures::future::BoxFuture;
use petgraph::graph::NodeIndex;
use tokio::sync::OwnedSemaphorePermit;

use crate::graph::Graph;

/// Stable index of an entry in the graph arena. Entries are never removed,
/// so an `EntryId` stays valid for the lifetime of the graph.
pub type EntryId = NodeIndex<u32>;

/// Identity of the Session a node ran in, used to scope uncacheable results.
pub type RunId = u64;

/// A memoizable unit of work.
///
/// A node is identified by its value: two equal nodes share one graph entry,
/// so they are computed at most once at a time and their results are shared.
pub trait Node: Clone + Debug + Display + Eq + Hash + Send + Sync + 'static {
    type Context: NodeContext<Node = Self>;
    type Item: Clone + Debug + Eq + Send + Sync + 'static;
    type Error: NodeError;

    /// Computes this node. Dependencies are requested through
    /// `context.graph().get(&context, ..)`, which records the edges.
    fn run(self, context: Self::Context) -> BoxFuture<'static, Result<Self::Item, Self::Error>>;

    /// Whether the result may be reused by a later Session.
    fn cacheable(&self) -> bool {
        true
    }
}

pub trait NodeError: Clone + Debug + Eq + Send + Sync + 'static {
    /// The node (or one of its dependencies) was invalidated while running.
    fn invalidated() -> Self;

    /// Requesting a node would close a cycle. `path` is rendered from the
    /// requesting node back around to itself.
    fn cyclic(path: Vec<String>) -> Self;

    /// The node panicked.
    fn broke(message: String) -> Self;

    fn is_invalidated(&self) -> bool;

    fn is_cancelled(&self) -> bool;

    /// Whether this failure may be memoized like a successful result.
    fn is_cacheable(&self) -> bool;
}

/// Observable graph activity, reported to the context for metrics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GraphEvent {
    Started,
    CacheHit,
    Cleaned,
    CycleDetected,
}

pub trait NodeContext: Clone + Send + Sync + 'static {
    type Node: Node<Context = Self>;

    fn graph(&self) -> &Graph<Self::Node>;

    /// The entry on whose behalf requests are made, or `None` for roots.
    fn entry_id(&self) -> Option<EntryId>;

    /// A copy of this context that issues requests on behalf of `entry_id`.
    fn clone_for(&self, entry_id: EntryId) -> Self;

    fn run_id(&self) -> RunId;

    fn is_cancelled(&self) -> bool;

    fn record(&self, _event: GraphEvent) {}

    /// A display slot held for the whole run of `node`, if it gets one.
    fn ui_slot(&self, _node: &Self::Node) -> Option<OwnedSemaphorePermit> {
        None
    }

    /// Span the node's run is instrumented with. `visible` is whether the
    /// run holds a display slot.
    fn span(&self, node: &Self::Node, _visible: bool) -> tracing::Span {
        tracing::debug_span!("node", node = %node)
    }
}
