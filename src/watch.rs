//! Filesystem watching for the Scheduler.
//!
//! The [`Invalidator`] keeps a debounced `notify` watcher on the build root
//! and feeds every batch of changed paths to the graph, clearing the
//! filesystem nodes that observed them. It runs on its own thread and stops
//! when dropped.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use glob::Pattern;
use notify::{EventKind, RecommendedWatcher, RecursiveMode};
use notify_debouncer_full::{DebouncedEvent, Debouncer, RecommendedCache, new_debouncer};

use crate::config::is_ignored;
use crate::context::Core;
use crate::error::WatchError;

const DEBOUNCE: Duration = Duration::from_millis(250);

pub(crate) struct Invalidator {
    debouncer: Option<Debouncer<RecommendedWatcher, RecommendedCache>>,
    thread: Option<JoinHandle<()>>,
}

impl Invalidator {
    pub fn start(core: Arc<Core>, dispatch: tracing::Dispatch) -> Result<Self, WatchError> {
        let root = Utf8PathBuf::try_from(core.build_root.as_std_path().canonicalize().map_err(notify::Error::io)?)?;

        let (tx, rx) = std::sync::mpsc::channel();
        let mut debouncer = new_debouncer(DEBOUNCE, None, tx)?;
        debouncer.watch(root.as_std_path(), RecursiveMode::Recursive)?;

        let thread = std::thread::Builder::new()
            .name("tasuki-invalidator".to_string())
            .spawn(move || {
                tracing::dispatcher::with_default(&dispatch, || {
                    tracing::info!(root = %root, "Watching for changes");
                    for result in rx {
                        match result {
                            Ok(events) => {
                                let paths = changed_paths(&root, &core.ignore, &events);
                                if paths.is_empty() {
                                    continue;
                                }
                                let result = core.invalidate_paths(&paths);
                                tracing::info!(
                                    paths = paths.len(),
                                    cleared = result.cleared,
                                    dirtied = result.dirtied,
                                    "Invalidated changed paths"
                                );
                            }
                            Err(errors) => {
                                for error in errors {
                                    tracing::error!("watch error: {error}");
                                }
                            }
                        }
                    }
                });
            })
            .map_err(notify::Error::io)?;

        Ok(Invalidator {
            debouncer: Some(debouncer),
            thread: Some(thread),
        })
    }
}

impl Drop for Invalidator {
    fn drop(&mut self) {
        // Dropping the watcher closes the channel, which ends the thread.
        self.debouncer.take();
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            tracing::error!("Invalidator thread panicked");
        }
    }
}

/// Paths touched by `events`, relative to `root`, minus ignored ones.
fn changed_paths(root: &Utf8Path, ignore: &[Pattern], events: &[DebouncedEvent]) -> BTreeSet<Utf8PathBuf> {
    events
        .iter()
        .filter(|de| {
            matches!(
                de.event.kind,
                EventKind::Create(..) | EventKind::Modify(..) | EventKind::Remove(..)
            )
        })
        .flat_map(|de| &de.event.paths)
        .filter_map(|path| Utf8Path::from_path(path))
        .filter_map(|path| path.strip_prefix(root).ok())
        .filter(|path| !path.as_str().is_empty() && !is_ignored(ignore, path))
        .map(Utf8Path::to_owned)
        .collect()
}
