//! Sandboxed process execution.
//!
//! A [`Process`] runs through a stack of [`CommandRunner`]s: the
//! [`CachingRunner`] answers from the store when it can, otherwise the request
//! goes to the [`RemoteRunner`] (when configured) or straight to the
//! [`LocalRunner`].

mod cache;
mod local;
mod remote;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::core::{Digest, EMPTY_DIGEST, Hash32};
use crate::error::{ProcessError, StoreError};
use crate::metrics::Metrics;
use crate::store::is_contained;

pub use self::cache::CachingRunner;
pub use self::local::LocalRunner;
pub use self::remote::{RemoteClient, RemoteOptions, RemoteRunner};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Process {
    pub argv: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub input_digest: Digest,
    /// Relative to the sandbox root.
    pub working_directory: Option<Utf8PathBuf>,
    pub output_files: BTreeSet<Utf8PathBuf>,
    pub output_directories: BTreeSet<Utf8PathBuf>,
    pub timeout: Option<Duration>,
    pub description: String,
}

impl Process {
    pub fn new<S: Into<String>>(argv: impl IntoIterator<Item = S>) -> Self {
        Process {
            argv: argv.into_iter().map(Into::into).collect(),
            env: BTreeMap::new(),
            input_digest: *EMPTY_DIGEST,
            working_directory: None,
            output_files: BTreeSet::new(),
            output_directories: BTreeSet::new(),
            timeout: None,
            description: String::new(),
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn input_digest(mut self, digest: Digest) -> Self {
        self.input_digest = digest;
        self
    }

    pub fn output_file(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.output_files.insert(path.into());
        self
    }

    pub fn output_directory(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.output_directories.insert(path.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Checks that every path the process names stays inside its sandbox.
    pub fn validate(&self) -> Result<(), ProcessError> {
        let paths = self
            .working_directory
            .iter()
            .map(|path| ("working_directory", path))
            .chain(self.output_files.iter().map(|path| ("output file", path)))
            .chain(self.output_directories.iter().map(|path| ("output directory", path)));
        for (field, path) in paths {
            if !is_contained(path) {
                return Err(ProcessError::InvalidPath {
                    field,
                    path: path.clone(),
                });
            }
        }
        Ok(())
    }

    /// Cache key: everything that can change the outcome. The description is
    /// left out.
    pub fn fingerprint(&self) -> Result<Hash32, StoreError> {
        let key = (
            &self.argv,
            &self.env,
            &self.input_digest,
            &self.working_directory,
            &self.output_files,
            &self.output_directories,
            &self.timeout,
        );
        let mut bytes = Vec::new();
        ciborium::into_writer(&key, &mut bytes)?;
        Ok(Hash32::hash(&bytes))
    }
}

impl fmt::Display for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.description.is_empty() {
            write!(f, "{}", self.argv.join(" "))
        } else {
            f.write_str(&self.description)
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessResult {
    pub stdout: Digest,
    pub stderr: Digest,
    pub exit_code: i32,
    /// Tree of the captured output files and directories.
    pub output_digest: Digest,
    pub timed_out: bool,
}

impl ProcessResult {
    pub fn state(&self) -> StepState {
        if self.timed_out {
            StepState::TimedOut
        } else if self.exit_code == 0 {
            StepState::Succeeded
        } else {
            StepState::Failed
        }
    }
}

/// Lifecycle of one execution step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepState {
    Queued,
    Cached,
    Running,
    Succeeded,
    Failed,
    TimedOut,
}

impl fmt::Display for StepState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StepState::Queued => "queued",
            StepState::Cached => "cached",
            StepState::Running => "running",
            StepState::Succeeded => "succeeded",
            StepState::Failed => "failed",
            StepState::TimedOut => "timed out",
        };
        f.write_str(name)
    }
}

/// Per-execution context handed down the runner stack.
#[derive(Clone, Default)]
pub struct RunContext {
    pub metrics: Arc<Metrics>,
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, context: &RunContext, process: Process) -> Result<ProcessResult, ProcessError>;
}
