use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::graph::RunId;
use crate::metrics::Metrics;
use crate::scheduler::Scheduler;

/// Limits for one Session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionOptions {
    /// Render running nodes as progress spinners.
    pub render_ui: bool,
    /// Nodes of this Session that may compute at the same time. A node
    /// waiting on its dependencies does not count.
    pub parallelism: usize,
    /// Spinners shown at once. Nodes beyond the bound still run, without a
    /// spinner.
    pub max_ui_workers: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        SessionOptions {
            render_ui: false,
            parallelism: Semaphore::MAX_PERMITS,
            max_ui_workers: 8,
        }
    }
}

/// One run's view of a Scheduler.
///
/// Sessions share the Scheduler's graph, but each has its own cancellation
/// flag, concurrency limits and metrics. Results of uncacheable rules are
/// reused only within the Session that computed them.
#[derive(Clone)]
pub struct Session(Arc<Inner>);

struct Inner {
    run_id: RunId,
    cancelled: AtomicBool,
    metrics: Arc<Metrics>,
    render_ui: bool,
    workers: Arc<Semaphore>,
    ui_workers: Arc<Semaphore>,
}

impl Session {
    pub fn new(scheduler: &Scheduler, render_ui: bool) -> Self {
        Self::with_options(
            scheduler,
            SessionOptions {
                render_ui,
                ..SessionOptions::default()
            },
        )
    }

    pub fn with_options(scheduler: &Scheduler, options: SessionOptions) -> Self {
        let run_id = scheduler.next_run_id();
        tracing::debug!(
            run_id,
            render_ui = options.render_ui,
            parallelism = options.parallelism,
            "Opened session"
        );
        Session(Arc::new(Inner {
            run_id,
            cancelled: AtomicBool::new(false),
            metrics: Arc::new(Metrics::default()),
            render_ui: options.render_ui,
            workers: Arc::new(Semaphore::new(options.parallelism.clamp(1, Semaphore::MAX_PERMITS))),
            ui_workers: Arc::new(Semaphore::new(options.max_ui_workers.min(Semaphore::MAX_PERMITS))),
        }))
    }

    pub fn run_id(&self) -> RunId {
        self.0.run_id
    }

    /// Stops the Session from scheduling new work. Processes that are
    /// already running are left to finish.
    pub fn cancel(&self) {
        self.0.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.cancelled.load(Ordering::SeqCst)
    }

    pub fn render_ui(&self) -> bool {
        self.0.render_ui
    }

    pub fn metrics(&self) -> BTreeMap<String, u64> {
        self.0.metrics.snapshot()
    }

    pub(crate) fn counters(&self) -> &Arc<Metrics> {
        &self.0.metrics
    }

    /// Waits for a compute slot. Held only while a node does work of its
    /// own, never across a dependency request.
    pub(crate) async fn worker(&self) -> Option<OwnedSemaphorePermit> {
        self.0.workers.clone().acquire_owned().await.ok()
    }

    /// A spinner slot, if one is free.
    pub(crate) fn ui_worker(&self) -> Option<OwnedSemaphorePermit> {
        if !self.0.render_ui {
            return None;
        }
        self.0.ui_workers.clone().try_acquire_owned().ok()
    }
}
