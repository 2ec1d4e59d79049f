//! The node types the Scheduler memoizes.

mod fs;
mod process;
mod task;

use std::fmt;
use std::sync::Arc;

use camino::Utf8PathBuf;
use futures::FutureExt;
use futures::future::BoxFuture;

use crate::context::Context;
use crate::core::{Digest, TypeId};
use crate::error::Failure;
use crate::graph::Node;
use crate::host::Value;
use crate::interning::Retained;
use crate::metrics::Metric;
use crate::process::{Process, ProcessResult};
use crate::store::Snapshot;
use crate::tasks::{Intrinsic, Rule, TaskId};

pub use self::fs::{DirEntry, PathGlobs};

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) enum NodeKey {
    /// Computes `product` for `subject` with whichever rule the rule graph
    /// picked for the pair.
    Select { subject: Retained, product: TypeId },
    /// Runs one registered rule body.
    Task {
        subject: Retained,
        task: TaskId,
        name: Arc<str>,
        cacheable: bool,
    },
    /// Lists a directory, relative to the build root.
    Scandir(Utf8PathBuf),
    /// Stores a file, relative to the build root.
    DigestFile(Utf8PathBuf),
    Snapshot(Arc<PathGlobs>),
    ExecuteProcess(Arc<Process>),
}

impl NodeKey {
    pub fn select(subject: Retained, product: TypeId) -> Self {
        NodeKey::Select { subject, product }
    }

    /// Filesystem nodes are the roots of invalidation: `path` clears the
    /// nodes that read it, plus the listing of its parent directory.
    pub fn observes(&self, path: &camino::Utf8Path) -> bool {
        match self {
            NodeKey::DigestFile(file) => file == path,
            NodeKey::Scandir(dir) => {
                dir == path || path.parent().is_some_and(|parent| parent == dir)
            }
            _ => false,
        }
    }

    pub fn is_filesystem(&self) -> bool {
        matches!(self, NodeKey::Scandir(_) | NodeKey::DigestFile(_))
    }

    /// Nodes worth a spinner when a Session renders UI.
    pub fn is_user_facing(&self) -> bool {
        matches!(self, NodeKey::Task { .. } | NodeKey::ExecuteProcess(_))
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeKey::Select { subject, product } => {
                write!(f, "Select({}, {})", subject, subject.type_name(*product))
            }
            NodeKey::Task { subject, name, .. } => write!(f, "{name}({subject})"),
            NodeKey::Scandir(dir) => write!(f, "Scandir({dir})"),
            NodeKey::DigestFile(path) => write!(f, "DigestFile({path})"),
            NodeKey::Snapshot(globs) => write!(f, "Snapshot({globs})"),
            NodeKey::ExecuteProcess(process) => write!(f, "Process({process})"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum NodeOutput {
    Value(Retained),
    Listing(Arc<Vec<DirEntry>>),
    File { digest: Digest, is_executable: bool },
    Snapshot(Arc<Snapshot>),
    ProcessResult(Arc<ProcessResult>),
}

impl NodeOutput {
    fn kind(&self) -> &'static str {
        match self {
            NodeOutput::Value(_) => "value",
            NodeOutput::Listing(_) => "listing",
            NodeOutput::File { .. } => "file",
            NodeOutput::Snapshot(_) => "snapshot",
            NodeOutput::ProcessResult(_) => "process result",
        }
    }

    fn mismatch(&self, expected: &str) -> Failure {
        Failure::Broke(format!("Expected a {expected}, got a {}", self.kind()))
    }

    pub fn into_value(self) -> Result<Retained, Failure> {
        match self {
            NodeOutput::Value(value) => Ok(value),
            other => Err(other.mismatch("value")),
        }
    }

    /// Digests of store content this output keeps alive.
    pub fn digests(&self) -> Vec<Digest> {
        match self {
            NodeOutput::File { digest, .. } => vec![*digest],
            NodeOutput::Snapshot(snapshot) => vec![snapshot.digest],
            NodeOutput::ProcessResult(result) => {
                vec![result.stdout, result.stderr, result.output_digest]
            }
            NodeOutput::Value(_) | NodeOutput::Listing(_) => vec![],
        }
    }
}

impl Node for NodeKey {
    type Context = Context;
    type Item = NodeOutput;
    type Error = Failure;

    fn run(self, context: Context) -> BoxFuture<'static, Result<NodeOutput, Failure>> {
        async move {
            context.session.counters().record(Metric::NodesExecuted);
            match self {
                NodeKey::Select { subject, product } => select(context, subject, product).await,
                NodeKey::Task { subject, task, .. } => task::run(context, subject, task).await,
                NodeKey::Scandir(dir) => fs::scandir(&context, dir).await,
                NodeKey::DigestFile(path) => fs::digest_file(&context, path).await,
                NodeKey::Snapshot(globs) => fs::snapshot(&context, &globs).await,
                NodeKey::ExecuteProcess(request) => process::execute(&context, &request).await,
            }
        }
        .boxed()
    }

    fn cacheable(&self) -> bool {
        match self {
            NodeKey::Task { cacheable, .. } => *cacheable,
            _ => true,
        }
    }
}

async fn select(context: Context, subject: Retained, product: TypeId) -> Result<NodeOutput, Failure> {
    let Some(rule) = context.core.rule_graph.rule_for(subject.type_id(), product) else {
        return Err(context.throw(format!(
            "No installed rules return {} for {}",
            context.core.type_name(product),
            context.core.type_name(subject.type_id()),
        )));
    };

    match rule {
        Rule::Param => Ok(NodeOutput::Value(subject)),
        Rule::Task(id) => {
            let task = &context.core.tasks[id];
            let node = NodeKey::Task {
                subject,
                task: id,
                name: task.to_string().into(),
                cacheable: task.cacheable,
            };
            context.get(node).await
        }
        Rule::Intrinsic(intrinsic) => {
            let value = run_intrinsic(&context, intrinsic, &subject).await?;
            Ok(NodeOutput::Value(context.retain(&value)))
        }
    }
}

async fn run_intrinsic(context: &Context, intrinsic: Intrinsic, subject: &Retained) -> Result<Value, Failure> {
    let value = context.resolve(subject)?;
    match intrinsic {
        Intrinsic::PathGlobsToSnapshot => {
            let snapshot = fs::expand(context, &value).await?;
            fs::snapshot_value(context, &snapshot)
        }
        Intrinsic::PathGlobsToDigest => {
            let snapshot = fs::expand(context, &value).await?;
            fs::digest_value(context, snapshot.digest)
        }
        Intrinsic::DigestToSnapshot => {
            let digest = fs::parse_digest(context, &value)?;
            let store = context.core.store.clone();
            let snapshot = blocking(context, move || Snapshot::from_digest(&store, digest)).await?;
            fs::snapshot_value(context, &snapshot)
        }
        Intrinsic::DigestToFilesContent => {
            let digest = fs::parse_digest(context, &value)?;
            let store = context.core.store.clone();
            let contents = blocking(context, move || Snapshot::contents(&store, digest)).await?;
            fs::files_content_value(context, &contents)
        }
        Intrinsic::MergeDigests => {
            let digests = context
                .core
                .externs
                .project_multi(&value, "digests")
                .iter()
                .map(|digest| fs::parse_digest(context, digest))
                .collect::<Result<Vec<_>, _>>()?;
            let store = context.core.store.clone();
            let merged = blocking(context, move || Snapshot::merge(&store, &digests)).await?;
            fs::digest_value(context, merged.digest)
        }
        Intrinsic::CreateDigest => {
            let (files, dirs) = fs::parse_create_digest(context, &value);
            let store = context.core.store.clone();
            let created = blocking(context, move || Snapshot::create(&store, &files, dirs)).await?;
            fs::digest_value(context, created.digest)
        }
        Intrinsic::ProcessToResult => {
            let request = process::parse_process(context, &value)?;
            let output = context.get(NodeKey::ExecuteProcess(Arc::new(request))).await?;
            let NodeOutput::ProcessResult(result) = output else {
                return Err(output.mismatch("process result"));
            };
            process::result_value(context, &result)
        }
    }
}

/// Runs blocking store work off the async workers. Errors become host
/// exceptions, panics become `Broke`.
async fn blocking<T, E>(context: &Context, f: impl FnOnce() -> Result<T, E> + Send + 'static) -> Result<T, Failure>
where
    T: Send + 'static,
    E: fmt::Display + Send + 'static,
{
    let _worker = context.session.worker().await;
    match tokio::task::spawn_blocking(f).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(context.throw(err.to_string())),
        Err(err) if err.is_panic() => Err(Failure::Broke(crate::graph::panic_message(err.into_panic()))),
        Err(err) => Err(Failure::Broke(err.to_string())),
    }
}
