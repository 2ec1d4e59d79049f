use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::{ProcessError, RemoteError};
use crate::metrics::Metric;
use crate::process::{CommandRunner, Process, ProcessResult, RunContext};
use crate::store::Store;

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Settings forwarded to the remote backend with every request.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RemoteOptions {
    pub store_servers: Vec<String>,
    pub execution_server: Option<String>,
    pub instance_name: Option<String>,
    pub namespace: Option<String>,
    pub oauth_bearer_token: Option<String>,
    pub root_ca_certs: Option<Vec<u8>>,
    pub chunk_size_bytes: usize,
    pub upload_timeout: Duration,
    pub platform_properties: BTreeMap<String, String>,
}

/// Connection to a remote execution backend, supplied by the embedder.
///
/// The client uploads whatever part of `process.input_digest` the backend is
/// missing from `store`, runs the process and writes the outputs back into
/// `store`. Infrastructure trouble is reported as
/// [`RemoteError::Unavailable`]; a non-zero exit is a normal result.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    async fn execute(
        &self,
        store: &Store,
        process: &Process,
        options: &RemoteOptions,
    ) -> Result<ProcessResult, RemoteError>;
}

pub struct RemoteRunner {
    client: Arc<dyn RemoteClient>,
    fallback: Option<Arc<dyn CommandRunner>>,
    store: Store,
    options: RemoteOptions,
    retries: usize,
}

impl RemoteRunner {
    pub fn new(
        client: Arc<dyn RemoteClient>,
        store: Store,
        options: RemoteOptions,
        retries: usize,
        fallback: Option<Arc<dyn CommandRunner>>,
    ) -> Self {
        RemoteRunner {
            client,
            fallback,
            store,
            options,
            retries,
        }
    }
}

fn backoff(attempt: usize) -> Duration {
    let factor = 1u32 << attempt.min(16);
    INITIAL_BACKOFF.saturating_mul(factor).min(MAX_BACKOFF)
}

#[async_trait]
impl CommandRunner for RemoteRunner {
    async fn run(&self, context: &RunContext, process: Process) -> Result<ProcessResult, ProcessError> {
        let mut attempt = 0;
        let error = loop {
            context.metrics.record(Metric::ProcessRemoteExecutions);
            match self.client.execute(&self.store, &process, &self.options).await {
                Ok(result) => {
                    info!(process = %process, attempt, exit_code = result.exit_code, "Remote execution finished");
                    return Ok(result);
                }
                Err(RemoteError::Unavailable(message)) if attempt < self.retries => {
                    context.metrics.record(Metric::RemoteRetries);
                    let delay = backoff(attempt);
                    warn!(process = %process, attempt, delay = ?delay, %message, "Remote execution unavailable, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(error @ RemoteError::Unavailable(_)) => break error,
                Err(error) => return Err(error.into()),
            }
        };

        match &self.fallback {
            Some(local) => {
                context.metrics.record(Metric::RemoteFallbacks);
                warn!(process = %process, %error, "Falling back to local execution");
                local.run(context, process).await
            }
            None => Err(error.into()),
        }
    }
}
