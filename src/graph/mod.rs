//! Memoizing dependency graph.
//!
//! Entries live in a petgraph arena keyed by node value. An edge `a -> b`
//! records that `a` requested `b` during its most recent run. Invalidation
//! clears the matching roots and dirties everything that transitively
//! depends on them; dirty entries are lazily re-checked against the
//! generations of their dependencies before their old value is reused.

mod entry;
mod node;

use std::collections::{HashMap, VecDeque};
use std::fmt::Write as _;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use petgraph::Direction;
use petgraph::graph::DiGraph;
use petgraph::visit::{VisitMap, Visitable};
use tracing::Instrument;
use tracing::instrument::WithSubscriber;

pub use self::entry::{Generation, NodeState};
pub use self::node::{EntryId, GraphEvent, Node, NodeContext, NodeError, RunId};

use self::entry::{Entry, NodeResult, RunMode, Start, wait};

/// Counts returned by an invalidation pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InvalidationResult {
    pub cleared: usize,
    pub dirtied: usize,
}

struct InnerGraph<N: Node> {
    nodes: HashMap<N, EntryId>,
    pg: DiGraph<Entry<N>, (), u32>,
}

impl<N: Node> InnerGraph<N> {
    fn ensure_entry(&mut self, node: N) -> EntryId {
        if let Some(&id) = self.nodes.get(&node) {
            return id;
        }
        let id = self.pg.add_node(Entry::new(node.clone()));
        self.nodes.insert(node, id);
        id
    }

    /// Finds a path from `dst` back to `src` through running entries, which
    /// is what adding the edge `src -> dst` would turn into a deadlock.
    fn detect_cycle(&self, src: EntryId, dst: EntryId) -> Option<Vec<EntryId>> {
        if src == dst {
            return Some(vec![src, src]);
        }
        if !self.pg[dst].is_running() {
            return None;
        }

        let mut parents: HashMap<EntryId, EntryId> = HashMap::new();
        let mut visited = self.pg.visit_map();
        let mut queue = VecDeque::from([dst]);
        visited.visit(dst);

        while let Some(id) = queue.pop_front() {
            for next in self.pg.neighbors_directed(id, Direction::Outgoing) {
                if next == src {
                    let mut path = vec![id];
                    let mut cursor = id;
                    while let Some(&parent) = parents.get(&cursor) {
                        path.push(parent);
                        cursor = parent;
                    }
                    path.push(src);
                    path.reverse();
                    path.push(src);
                    return Some(path);
                }
                if visited.visit(next) && self.pg[next].is_running() {
                    parents.insert(next, id);
                    queue.push_back(next);
                }
            }
        }

        None
    }

    fn clear_dependencies(&mut self, id: EntryId) {
        let edges: Vec<_> = self
            .pg
            .edges_directed(id, Direction::Outgoing)
            .map(|edge| petgraph::visit::EdgeRef::id(&edge))
            .collect();
        // Removal swaps the last edge into the freed slot, so go from the
        // highest index down.
        let mut edges = edges;
        edges.sort_by_key(|edge| std::cmp::Reverse(edge.index()));
        for edge in edges {
            self.pg.remove_edge(edge);
        }
    }

    fn dependencies(&self, id: EntryId) -> (Vec<(EntryId, Generation)>, bool) {
        let mut uncacheable = false;
        let deps = self
            .pg
            .neighbors_directed(id, Direction::Outgoing)
            .map(|dep| {
                let entry = &self.pg[dep];
                uncacheable |= entry.has_uncacheable_deps();
                (dep, entry.generation())
            })
            .collect();
        (deps, uncacheable)
    }

    /// All entries that transitively depend on `roots`, excluding the roots.
    fn dependents_of(&self, roots: &[EntryId]) -> Vec<EntryId> {
        let mut visited = self.pg.visit_map();
        let mut queue: VecDeque<EntryId> = roots.iter().copied().collect();
        for root in roots {
            visited.visit(*root);
        }

        let mut out = Vec::new();
        while let Some(id) = queue.pop_front() {
            for dependent in self.pg.neighbors_directed(id, Direction::Incoming) {
                if visited.visit(dependent) {
                    out.push(dependent);
                    queue.push_back(dependent);
                }
            }
        }
        out
    }

    fn render_path(&self, path: &[EntryId]) -> Vec<String> {
        path.iter().map(|id| self.pg[*id].node().to_string()).collect()
    }
}

/// Memoizing dependency graph over nodes of type `N`.
pub struct Graph<N: Node> {
    inner: Mutex<InnerGraph<N>>,
    invalidation_delay: Duration,
}

impl<N: Node> Graph<N> {
    pub fn new(invalidation_delay: Duration) -> Self {
        Self {
            inner: Mutex::new(InnerGraph {
                nodes: HashMap::new(),
                pg: DiGraph::default(),
            }),
            invalidation_delay,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().pg.node_count()
    }

    /// Requests the value of `node` on behalf of `context.entry_id()`.
    pub async fn get(&self, context: &N::Context, node: N) -> Result<N::Item, N::Error> {
        self.get_with_generation(context, node)
            .await
            .map(|(item, _)| item)
    }

    pub fn get_with_generation<'a>(
        &'a self,
        context: &'a N::Context,
        node: N,
    ) -> BoxFuture<'a, Result<(N::Item, Generation), N::Error>> {
        async move {
            loop {
                let (entry_id, entry) = {
                    let mut inner = self.inner.lock();
                    let dst = inner.ensure_entry(node.clone());

                    if let Some(src) = context.entry_id() {
                        if let Some(path) = inner.detect_cycle(src, dst) {
                            let rendered = inner.render_path(&path);
                            drop(inner);
                            tracing::warn!(cycle = %rendered.join(" -> "), "Cycle detected");
                            context.record(GraphEvent::CycleDetected);
                            return Err(N::Error::cyclic(rendered));
                        }
                        inner.pg.update_edge(src, dst, ());
                    }

                    (dst, inner.pg[dst].clone())
                };

                let result = match entry.acquire(context) {
                    Ok((result, generation)) => result.map(|item| (item, generation)),
                    Err((receiver, start)) => {
                        if let Some(start) = start {
                            self.spawn(context, entry_id, &entry, start);
                        }
                        wait::<N>(receiver).await
                    }
                };

                match result {
                    Err(err) if err.is_invalidated() => {
                        tracing::debug!(node = %entry.node(), "Retrying invalidated node");
                        tokio::time::sleep(self.invalidation_delay).await;
                    }
                    // Another Session cancelled the run we joined.
                    Err(err) if err.is_cancelled() && !context.is_cancelled() => {}
                    result => return result,
                }
            }
        }
        .boxed()
    }

    fn spawn(&self, context: &N::Context, entry_id: EntryId, entry: &Entry<N>, start: Start<N>) {
        let context = context.clone_for(entry_id);
        let node = entry.node().clone();
        let slot = context.ui_slot(&node);
        let span = context.span(&node, slot.is_some());
        // Spawned tasks don't inherit the caller's subscriber.
        let dispatch = tracing::dispatcher::get_default(|dispatch| dispatch.clone());

        context.record(GraphEvent::Started);

        let task = async move {
            let _slot = slot;
            let Start {
                run_token,
                sender,
                mode,
            } = start;
            let graph = context.graph();

            if let RunMode::Clean {
                dep_generations,
                result,
            } = mode
            {
                if graph.dependencies_unchanged(&context, &dep_generations).await {
                    let (deps, uncacheable) = graph.inner.lock().dependencies(entry_id);
                    let entry = graph.entry(entry_id);
                    context.record(GraphEvent::Cleaned);
                    entry.complete_cleaned(&context, run_token, deps, uncacheable, sender, result);
                    return;
                }
            }

            graph.inner.lock().clear_dependencies(entry_id);

            let result: NodeResult<N> = match AssertUnwindSafe(node.run(context.clone()))
                .catch_unwind()
                .await
            {
                Ok(result) => result,
                Err(payload) => Err(N::Error::broke(panic_message(payload))),
            };

            let (deps, uncacheable) = graph.inner.lock().dependencies(entry_id);
            graph
                .entry(entry_id)
                .complete(&context, run_token, deps, uncacheable, sender, result);
        };

        tokio::spawn(task.instrument(span).with_subscriber(dispatch));
    }

    fn entry(&self, id: EntryId) -> Entry<N> {
        self.inner.lock().pg[id].clone()
    }

    /// Re-requests each recorded dependency and compares its generation with
    /// the one observed when the dependent last ran. Stops at the first
    /// difference or failure.
    async fn dependencies_unchanged(
        &self,
        context: &N::Context,
        dep_generations: &[(EntryId, Generation)],
    ) -> bool {
        let requests = dep_generations.iter().map(|(dep, generation)| {
            let node = self.entry(*dep).node().clone();
            let expected = *generation;
            async move {
                match self.get_with_generation(context, node).await {
                    Ok((_, generation)) if generation == expected => Ok(()),
                    _ => Err(()),
                }
            }
        });
        futures::future::try_join_all(requests).await.is_ok()
    }

    /// Clears every started node matching `predicate` and dirties everything
    /// that transitively depends on one of them.
    pub fn invalidate_from_roots(&self, predicate: impl Fn(&N) -> bool) -> InvalidationResult {
        let mut inner = self.inner.lock();

        let roots: Vec<EntryId> = inner
            .nodes
            .iter()
            .filter(|(node, id)| predicate(node) && inner.pg[**id].is_started())
            .map(|(_, id)| *id)
            .collect();

        let dependents = inner.dependents_of(&roots);

        for root in &roots {
            inner.pg[*root].clear();
            inner.clear_dependencies(*root);
        }
        for id in &dependents {
            inner.pg[*id].dirty();
        }

        InvalidationResult {
            cleared: roots.len(),
            dirtied: dependents.len(),
        }
    }

    pub fn state_of(&self, node: &N) -> Option<NodeState> {
        let inner = self.inner.lock();
        inner.nodes.get(node).map(|id| inner.pg[*id].state())
    }

    pub fn generation_of(&self, node: &N) -> Option<Generation> {
        let inner = self.inner.lock();
        inner.nodes.get(node).map(|id| inner.pg[*id].generation())
    }

    /// Calls `f` for every clean, successfully completed entry.
    pub fn visit_live(&self, mut f: impl FnMut(&N, N::Item)) {
        let entries: Vec<Entry<N>> = self.inner.lock().pg.node_weights().cloned().collect();
        for entry in entries {
            if let Some(item) = entry.peek() {
                f(entry.node(), item);
            }
        }
    }

    /// Renders the graph in Graphviz dot format, limited to the entries
    /// reachable from `roots`. No roots means the whole graph.
    pub fn visualize(&self, roots: &[N]) -> String {
        let inner = self.inner.lock();
        let mut out = String::from("digraph tasuki {\n  node [shape=box];\n");

        let mut visible = inner.pg.visit_map();
        if roots.is_empty() {
            for id in inner.pg.node_indices() {
                visible.visit(id);
            }
        } else {
            let mut queue: VecDeque<EntryId> =
                roots.iter().filter_map(|node| inner.nodes.get(node).copied()).collect();
            for id in &queue {
                visible.visit(*id);
            }
            while let Some(id) = queue.pop_front() {
                for dep in inner.pg.neighbors_directed(id, Direction::Outgoing) {
                    if visible.visit(dep) {
                        queue.push_back(dep);
                    }
                }
            }
        }

        for id in inner.pg.node_indices().filter(|id| visible.is_visited(id)) {
            let entry = &inner.pg[id];
            let label = entry.node().to_string().replace('"', "\\\"");
            let color = match entry.state() {
                NodeState::Completed => "black",
                NodeState::Failed => "red",
                NodeState::Running => "blue",
                NodeState::Pending | NodeState::Cleared => "gray",
            };
            let _ = writeln!(out, "  n{} [label=\"{}\", color={}];", id.index(), label, color);
        }
        for edge in inner.pg.raw_edges() {
            if !(visible.is_visited(&edge.source()) && visible.is_visited(&edge.target())) {
                continue;
            }
            let _ = writeln!(
                out,
                "  n{} -> n{};",
                edge.source().index(),
                edge.target().index()
            );
        }

        out.push_str("}\n");
        out
    }
}

/// Extracts a readable message from a panic payload.
pub(crate) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "Unknown panic".to_string()
    }
}
