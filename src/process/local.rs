use std::process::Stdio;
use std::sync::Arc;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use tokio::process::Command;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::core::EMPTY_DIGEST;
use crate::error::{ProcessError, StoreError};
use crate::metrics::Metric;
use crate::process::{CommandRunner, Process, ProcessResult, RunContext, StepState};
use crate::store::{Snapshot, Store};

/// Exit code reported for a process killed by its timeout.
const TIMEOUT_EXIT_CODE: i32 = -15;

/// Runs processes in throwaway sandboxes under `root`.
pub struct LocalRunner {
    store: Store,
    root: Utf8PathBuf,
    permits: Arc<Semaphore>,
    cleanup: bool,
}

impl LocalRunner {
    pub fn new(store: Store, root: Utf8PathBuf, parallelism: usize, cleanup: bool) -> Self {
        LocalRunner {
            store,
            root,
            permits: Arc::new(Semaphore::new(parallelism.max(1))),
            cleanup,
        }
    }

    async fn prepare(&self, process: &Process) -> anyhow::Result<tempfile::TempDir> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating execution root '{}'", self.root))?;

        let sandbox = tempfile::Builder::new()
            .prefix("process-")
            .tempdir_in(&self.root)
            .context("creating sandbox")?;
        let path = Utf8PathBuf::try_from(sandbox.path().to_path_buf())?;

        let store = self.store.clone();
        let digest = process.input_digest;
        let outputs: Vec<Utf8PathBuf> = process.output_files.iter().cloned().collect();
        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            store
                .materialize(digest, &path)
                .with_context(|| format!("materializing input {digest}"))?;
            for file in outputs {
                if let Some(parent) = file.parent() {
                    std::fs::create_dir_all(path.join(parent))?;
                }
            }
            Ok(())
        })
        .await
        .map_err(|e| anyhow!(e))??;

        Ok(sandbox)
    }
}

/// Collects the declared outputs that exist after the run.
fn capture_outputs(store: &Store, root: &Utf8Path, process: &Process) -> Result<Snapshot, StoreError> {
    let mut files: Vec<Utf8PathBuf> = process
        .output_files
        .iter()
        .filter(|path| root.join(path).is_file())
        .cloned()
        .collect();
    let mut dirs = Vec::new();

    for dir in &process.output_directories {
        let absolute = root.join(dir);
        if !absolute.is_dir() {
            continue;
        }
        dirs.push(dir.clone());
        let pattern = format!("{}/**/*", glob::Pattern::escape(absolute.as_str()));
        for entry in glob::glob(&pattern)?.flatten() {
            let entry = Utf8PathBuf::try_from(entry)?;
            let Ok(relative) = entry.strip_prefix(root) else {
                continue;
            };
            if entry.is_dir() {
                dirs.push(relative.to_owned());
            } else {
                files.push(relative.to_owned());
            }
        }
    }

    Snapshot::capture(store, root, &files, dirs)
}

#[async_trait]
impl CommandRunner for LocalRunner {
    async fn run(&self, context: &RunContext, process: Process) -> Result<ProcessResult, ProcessError> {
        let Some(program) = process.argv.first() else {
            return Err(ProcessError::Sandbox(anyhow!("empty argv for '{process}'")));
        };
        process.validate()?;

        let _permit = self.permits.acquire().await.map_err(|e| anyhow!(e))?;
        context.metrics.record(Metric::ProcessLocalExecutions);

        let sandbox = self.prepare(&process).await?;
        let root = Utf8PathBuf::try_from(sandbox.path().to_path_buf()).map_err(|e| anyhow!(e))?;
        let cwd = match &process.working_directory {
            Some(dir) => root.join(dir),
            None => root.clone(),
        };

        info!(process = %process, state = %StepState::Running, "Running process");

        let mut command = Command::new(program);
        command
            .args(&process.argv[1..])
            .current_dir(&cwd)
            .env_clear()
            .envs(&process.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = command
            .spawn()
            .with_context(|| format!("spawning '{program}'"))?;

        let output = match process.timeout {
            Some(limit) => tokio::time::timeout(limit, child.wait_with_output()).await.ok(),
            None => Some(child.wait_with_output().await),
        };

        let result = match output {
            None => {
                context.metrics.record(Metric::ProcessTimeouts);
                let limit = process.timeout.unwrap_or_default();
                warn!(process = %process, timeout = ?limit, "Process timed out");
                let message = format!("Exceeded timeout of {limit:?} for: {process}");
                ProcessResult {
                    stdout: *EMPTY_DIGEST,
                    stderr: self.store.store_bytes(message.as_bytes())?,
                    exit_code: TIMEOUT_EXIT_CODE,
                    output_digest: *EMPTY_DIGEST,
                    timed_out: true,
                }
            }
            Some(output) => {
                let output = output.with_context(|| format!("waiting for '{program}'"))?;
                let store = self.store.clone();
                let captured_root = root.clone();
                let request = process.clone();
                let outputs = tokio::task::spawn_blocking(move || {
                    capture_outputs(&store, &captured_root, &request)
                })
                .await
                .map_err(|e| anyhow!(e))??;

                ProcessResult {
                    stdout: self.store.store_bytes(&output.stdout)?,
                    stderr: self.store.store_bytes(&output.stderr)?,
                    exit_code: output.status.code().unwrap_or(-1),
                    output_digest: outputs.digest,
                    timed_out: false,
                }
            }
        };

        debug!(
            process = %process,
            exit_code = result.exit_code,
            state = %result.state(),
            "Process finished"
        );

        if !self.cleanup {
            let kept = sandbox.keep();
            debug!(path = %kept.display(), "Preserving local process execution dir");
        }

        Ok(result)
    }
}
