use camino::Utf8PathBuf;
use thiserror::Error;

use crate::core::{Digest, Key};
use crate::graph::NodeError;
use crate::host::Value;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("The task registry is frozen, a Scheduler was already built from it")]
    RegistryFrozen,

    #[error("Task registry misuse: {0}")]
    Registry(&'static str),

    #[error("Unknown key {0}, it was released or never interned")]
    UnknownKey(Key),

    #[error("No rule produces {product} for a subject of type {subject}")]
    NoRule { subject: String, product: String },

    #[error("The scheduler is shut down")]
    Shutdown,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Failed to build runtime")]
    Runtime(#[from] std::io::Error),

    #[cfg(feature = "watch")]
    #[error("Error while watching for file changes:\n{0}")]
    Watch(#[from] WatchError),
}

/// Bad Scheduler construction input. Always surfaced before any execution.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Remote configuration is incomplete: {0}")]
    RemotePartial(String),

    #[error("Missing type for intrinsic: {0}")]
    MissingType(&'static str),

    #[error("{candidates} rules produce {product} for a subject of type {subject}")]
    AmbiguousRule {
        subject: String,
        product: String,
        candidates: usize,
    },

    #[error("No rule produces {product} for a subject of type {subject} (needed by {needed_by})")]
    MissingRule {
        subject: String,
        product: String,
        needed_by: String,
    },

    #[error("Couldn't read credentials from '{path}'")]
    Credentials {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid ignore pattern.\n{0}")]
    IgnorePattern(#[from] glob::PatternError),

    #[error("Execution parallelism must be at least 1")]
    InvalidParallelism,

    #[error("Invalid log filter.\n{0}")]
    LogFilter(String),

    #[error("Couldn't open log file '{path}'")]
    LogDestination {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("A remote client was supplied without remote configuration, or the other way round")]
    RemoteClient,
}

/// Why a Node did not produce a value.
#[derive(Debug, Error, Clone)]
pub enum Failure {
    /// A host exception. Dependents may catch it.
    #[error("{message}")]
    Throw { exc: Value, message: String },

    /// An unrecoverable fault in native code or in the rule body protocol.
    #[error("Broke: {0}")]
    Broke(String),

    #[error("Dependency cycle: {}", .0.join(" -> "))]
    Cycle(Vec<String>),

    #[error("Invalidated while running")]
    Invalidated,

    #[error("The session was cancelled")]
    Cancelled,
}

impl PartialEq for Failure {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (
                Failure::Throw { exc: a, message: m },
                Failure::Throw { exc: b, message: n },
            ) => a.handle() == b.handle() && m == n,
            (Failure::Broke(a), Failure::Broke(b)) => a == b,
            (Failure::Cycle(a), Failure::Cycle(b)) => a == b,
            (Failure::Invalidated, Failure::Invalidated) => true,
            (Failure::Cancelled, Failure::Cancelled) => true,
            _ => false,
        }
    }
}

impl Eq for Failure {}

impl NodeError for Failure {
    fn invalidated() -> Self {
        Failure::Invalidated
    }

    fn cyclic(path: Vec<String>) -> Self {
        Failure::Cycle(path)
    }

    fn broke(message: String) -> Self {
        Failure::Broke(message)
    }

    fn is_invalidated(&self) -> bool {
        matches!(self, Failure::Invalidated)
    }

    fn is_cancelled(&self) -> bool {
        matches!(self, Failure::Cancelled)
    }

    fn is_cacheable(&self) -> bool {
        matches!(self, Failure::Throw { .. } | Failure::Broke(_))
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Couldn't access the store.\n{0}")]
    Io(#[from] std::io::Error),

    #[error("Missing {kind} {digest} in the store")]
    Missing { kind: &'static str, digest: Digest },

    #[error("Couldn't encode store record.\n{0}")]
    Encode(#[from] ciborium::ser::Error<std::io::Error>),

    #[error("Couldn't decode store record.\n{0}")]
    Decode(#[from] ciborium::de::Error<std::io::Error>),

    #[error("Couldn't compile glob pattern.\n{0}")]
    GlobPattern(#[from] glob::PatternError),

    #[error("Couldn't convert path to UTF-8.\n{0}")]
    PathFormat(#[from] camino::FromPathBufError),

    #[error("Path '{0}' escapes the build root")]
    OutsideRoot(String),

    #[error("Can't merge directories: '{0}' has conflicting content")]
    MergeConflict(String),
}

/// Failure talking to a remote execution backend.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// Infrastructure trouble. Retried, then possibly run locally.
    #[error("Remote execution unavailable: {0}")]
    Unavailable(String),

    /// The backend refused the request outright.
    #[error("Remote execution rejected the request: {0}")]
    Rejected(String),
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Couldn't run process in a local sandbox.\n{0:#}")]
    Sandbox(#[from] anyhow::Error),

    #[error("Process {field} '{path}' must be relative and stay inside the sandbox")]
    InvalidPath { field: &'static str, path: Utf8PathBuf },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Remote(#[from] RemoteError),
}

#[cfg(feature = "watch")]
#[derive(Debug, Error)]
pub enum WatchError {
    #[error("Couldn't start file watcher.\n{0}")]
    Notify(#[from] notify::Error),

    #[error("Couldn't convert path to UTF-8.\n{0}")]
    PathFormat(#[from] camino::FromPathBufError),
}
