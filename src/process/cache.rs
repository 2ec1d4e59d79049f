use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::error::ProcessError;
use crate::metrics::Metric;
use crate::process::{CommandRunner, Process, ProcessResult, RunContext, StepState};
use crate::store::Store;

/// Answers repeated requests from the store's process cache.
///
/// Succeeded and failed runs are both recorded, a timed out run is not.
pub struct CachingRunner {
    inner: Arc<dyn CommandRunner>,
    store: Store,
}

impl CachingRunner {
    pub fn new(inner: Arc<dyn CommandRunner>, store: Store) -> Self {
        CachingRunner { inner, store }
    }

    fn lookup(&self, process: &Process) -> Result<Option<ProcessResult>, ProcessError> {
        let key = process.fingerprint()?;
        let Some(result) = self.store.load_cache::<ProcessResult>(key)? else {
            return Ok(None);
        };
        // Stale if the store was collected underneath the record.
        let present = [result.stdout, result.stderr, result.output_digest]
            .into_iter()
            .all(|digest| self.store.contains(digest));
        Ok(present.then_some(result))
    }
}

#[async_trait]
impl CommandRunner for CachingRunner {
    async fn run(&self, context: &RunContext, process: Process) -> Result<ProcessResult, ProcessError> {
        if let Some(result) = self.lookup(&process)? {
            context.metrics.record(Metric::ProcessCacheHits);
            debug!(process = %process, state = %StepState::Cached, "Process cache hit");
            return Ok(result);
        }

        debug!(process = %process, state = %StepState::Queued, "Process cache miss");
        let key = process.fingerprint()?;
        let result = self.inner.run(context, process).await?;
        if result.state() != StepState::TimedOut {
            let refs = [result.stdout, result.stderr, result.output_digest];
            self.store.store_cache(key, &result, &refs)?;
        }
        Ok(result)
    }
}
