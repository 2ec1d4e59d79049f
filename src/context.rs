use std::collections::BTreeSet;
use std::sync::{Arc, LazyLock};

use camino::{Utf8Path, Utf8PathBuf};
use indicatif::ProgressStyle;
use tokio::sync::OwnedSemaphorePermit;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::config;
use crate::core::{Function, TypeId};
use crate::error::Failure;
use crate::externs::Externs;
use crate::graph::{EntryId, Graph, GraphEvent, InvalidationResult, NodeContext, RunId};
use crate::host::Value;
use crate::interning::{Interns, Retained};
use crate::metrics::Metric;
use crate::nodes::{NodeKey, NodeOutput};
use crate::process::CommandRunner;
use crate::session::Session;
use crate::store::Store;
use crate::tasks::{Families, RuleGraph, Task};

static NODE_STYLE: LazyLock<ProgressStyle> = LazyLock::new(|| {
    ProgressStyle::default_spinner()
        .template("{spinner:.green} [{elapsed}] {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
});

/// State shared by every Session of one Scheduler.
pub(crate) struct Core {
    pub externs: Arc<Externs>,
    pub interns: Arc<Interns>,
    pub tasks: Arc<[Task]>,
    pub rule_graph: RuleGraph,
    pub families: Families,
    pub graph: Graph<NodeKey>,
    pub store: Store,
    pub runner: Arc<dyn CommandRunner>,
    pub build_root: Utf8PathBuf,
    pub ignore: Vec<glob::Pattern>,
}

impl Core {
    pub fn type_name(&self, type_id: TypeId) -> String {
        self.externs.type_to_str(type_id)
    }

    /// Whether `path`, relative to the build root, is excluded from
    /// filesystem nodes.
    pub fn is_ignored(&self, path: &Utf8Path) -> bool {
        config::is_ignored(&self.ignore, path)
    }

    /// Clears the filesystem nodes that observed any of `paths` and dirties
    /// their dependents.
    pub fn invalidate_paths(&self, paths: &BTreeSet<Utf8PathBuf>) -> InvalidationResult {
        self.graph
            .invalidate_from_roots(|node| paths.iter().any(|path| node.observes(path)))
    }
}

/// Handed to every running node: the shared core, the Session on whose
/// behalf it runs, and the entry that issues its dependency requests.
#[derive(Clone)]
pub(crate) struct Context {
    entry_id: Option<EntryId>,
    pub core: Arc<Core>,
    pub session: Session,
}

impl Context {
    pub fn new(core: Arc<Core>, session: Session) -> Self {
        Context {
            entry_id: None,
            core,
            session,
        }
    }

    pub async fn get(&self, node: NodeKey) -> Result<NodeOutput, Failure> {
        self.core.graph.get(self, node).await
    }

    /// A host exception carrying `message`.
    pub fn throw(&self, message: impl Into<String>) -> Failure {
        let message = message.into();
        let exc = self.core.externs.create_exception(&message);
        Failure::Throw { exc, message }
    }

    pub fn retain(&self, value: &Value) -> Retained {
        Retained::intern(&self.core.interns, value)
    }

    pub fn resolve(&self, retained: &Retained) -> Result<Value, Failure> {
        retained
            .value()
            .map_err(|err| Failure::Broke(err.to_string()))
    }

    /// Calls a host constructor, mapping a raised exception to a `Throw`.
    pub fn construct(&self, func: &Function, args: &[Value]) -> Result<Value, Failure> {
        let func = self
            .core
            .interns
            .resolve(&func.key)
            .map_err(|err| Failure::Broke(err.to_string()))?;
        self.core.externs.call(&func, args).map_err(|exc| Failure::Throw {
            message: self.core.externs.val_to_str(&exc),
            exc,
        })
    }
}

impl NodeContext for Context {
    type Node = NodeKey;

    fn graph(&self) -> &Graph<NodeKey> {
        &self.core.graph
    }

    fn entry_id(&self) -> Option<EntryId> {
        self.entry_id
    }

    fn clone_for(&self, entry_id: EntryId) -> Self {
        Context {
            entry_id: Some(entry_id),
            core: self.core.clone(),
            session: self.session.clone(),
        }
    }

    fn run_id(&self) -> RunId {
        self.session.run_id()
    }

    fn is_cancelled(&self) -> bool {
        self.session.is_cancelled()
    }

    fn record(&self, event: GraphEvent) {
        let metric = match event {
            GraphEvent::Started => Metric::NodesStarted,
            GraphEvent::CacheHit => Metric::NodesCacheHits,
            GraphEvent::Cleaned => Metric::NodesCleaned,
            GraphEvent::CycleDetected => Metric::CyclesDetected,
        };
        self.session.counters().record(metric);
    }

    fn ui_slot(&self, node: &NodeKey) -> Option<OwnedSemaphorePermit> {
        if !node.is_user_facing() {
            return None;
        }
        self.session.ui_worker()
    }

    fn span(&self, node: &NodeKey, visible: bool) -> tracing::Span {
        if !visible {
            return tracing::debug_span!("node", node = %node);
        }
        let span = tracing::info_span!("node", node = %node);
        span.pb_set_style(&NODE_STYLE);
        span.pb_set_message(&node.to_string());
        span
    }
}
