use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::graph::node::{EntryId, GraphEvent, Node, NodeContext, NodeError, RunId};

/// Version of a node's value. Bumped when the value observably changes, and
/// when the node is cleared by invalidation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Generation(u32);

impl Generation {
    fn next(self) -> Self {
        Generation(self.0 + 1)
    }
}

/// Identifies one run of an entry, so that completions of runs which were
/// cleared in the meantime can be discarded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct RunToken(u32);

impl RunToken {
    fn next(self) -> Self {
        RunToken(self.0 + 1)
    }
}

/// Externally visible state of a node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeState {
    Pending,
    Running,
    Completed,
    Failed,
    Cleared,
}

pub(crate) type NodeResult<N> = Result<<N as Node>::Item, <N as Node>::Error>;
pub(crate) type Outcome<N> = Option<(NodeResult<N>, Generation)>;
pub(crate) type Sender<N> = watch::Sender<Outcome<N>>;

pub(crate) enum EntryState<N: Node> {
    NotStarted {
        run_token: RunToken,
        generation: Generation,
        previous: Option<NodeResult<N>>,
        cleared: bool,
    },
    Running {
        run_token: RunToken,
        generation: Generation,
        receiver: watch::Receiver<Outcome<N>>,
        previous: Option<NodeResult<N>>,
        dirty: bool,
    },
    Completed {
        run_token: RunToken,
        generation: Generation,
        result: NodeResult<N>,
        dep_generations: Vec<(EntryId, Generation)>,
        run_id: RunId,
        uncacheable_deps: bool,
        dirty: bool,
    },
}

/// How a freshly started run should proceed.
pub(crate) enum RunMode<N: Node> {
    /// Run the node from scratch.
    Execute,
    /// Check whether the recorded dependencies still have the same
    /// generations, and reuse `result` if they do.
    Clean {
        dep_generations: Vec<(EntryId, Generation)>,
        result: NodeResult<N>,
    },
}

pub(crate) struct Start<N: Node> {
    pub run_token: RunToken,
    pub sender: Sender<N>,
    pub mode: RunMode<N>,
}

/// One slot in the graph arena. Cloning shares the underlying state.
pub(crate) struct Entry<N: Node> {
    node: Arc<N>,
    state: Arc<Mutex<EntryState<N>>>,
}

impl<N: Node> Clone for Entry<N> {
    fn clone(&self) -> Self {
        Self {
            node: self.node.clone(),
            state: self.state.clone(),
        }
    }
}

impl<N: Node> Entry<N> {
    pub(crate) fn new(node: N) -> Self {
        Self {
            node: Arc::new(node),
            state: Arc::new(Mutex::new(EntryState::NotStarted {
                run_token: RunToken::default(),
                generation: Generation::default(),
                previous: None,
                cleared: false,
            })),
        }
    }

    pub(crate) fn node(&self) -> &N {
        &self.node
    }

    pub(crate) fn generation(&self) -> Generation {
        match &*self.state.lock() {
            EntryState::NotStarted { generation, .. }
            | EntryState::Running { generation, .. }
            | EntryState::Completed { generation, .. } => *generation,
        }
    }

    pub(crate) fn state(&self) -> NodeState {
        match &*self.state.lock() {
            EntryState::NotStarted { cleared: true, .. } => NodeState::Cleared,
            EntryState::NotStarted { .. } => NodeState::Pending,
            EntryState::Running { .. } => NodeState::Running,
            EntryState::Completed { result: Ok(_), .. } => NodeState::Completed,
            EntryState::Completed { result: Err(_), .. } => NodeState::Failed,
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        matches!(&*self.state.lock(), EntryState::Running { .. })
    }

    pub(crate) fn is_started(&self) -> bool {
        !matches!(&*self.state.lock(), EntryState::NotStarted { .. })
    }

    /// True if this node's value must not outlive the Session that computed
    /// it, either because it is uncacheable or because a dependency is.
    pub(crate) fn has_uncacheable_deps(&self) -> bool {
        if !self.node.cacheable() {
            return true;
        }
        matches!(
            &*self.state.lock(),
            EntryState::Completed {
                uncacheable_deps: true,
                ..
            }
        )
    }

    /// The memoized value, if the entry completed successfully and is clean.
    pub(crate) fn peek(&self) -> Option<N::Item> {
        match &*self.state.lock() {
            EntryState::Completed {
                result: Ok(item),
                dirty: false,
                ..
            } => Some(item.clone()),
            _ => None,
        }
    }

    /// Returns a receiver for the entry's value, starting a run if the
    /// memoized value (if any) cannot be reused by `context`.
    ///
    /// `Ok` is a reusable value; `Err` carries the receiver to wait on, plus
    /// the run to spawn if this call started one.
    #[allow(clippy::type_complexity)]
    pub(crate) fn acquire(
        &self,
        context: &N::Context,
    ) -> Result<(NodeResult<N>, Generation), (watch::Receiver<Outcome<N>>, Option<Start<N>>)> {
        let mut state = self.state.lock();

        let reusable = match &*state {
            EntryState::Running { receiver, .. } if receiver.has_changed().is_ok() => {
                return Err((receiver.clone(), None));
            }
            // The run was abandoned, e.g. by a runtime shutdown.
            EntryState::Running { .. } => false,
            EntryState::Completed {
                run_id,
                uncacheable_deps,
                dirty,
                ..
            } => {
                !*dirty
                    && ((self.node.cacheable() && !*uncacheable_deps)
                        || *run_id == context.run_id())
            }
            EntryState::NotStarted { .. } => false,
        };

        if reusable
            && let EntryState::Completed {
                result, generation, ..
            } = &*state
        {
            context.record(GraphEvent::CacheHit);
            return Ok((result.clone(), *generation));
        }

        let (sender, receiver) = watch::channel(None);

        let placeholder = EntryState::NotStarted {
            run_token: RunToken::default(),
            generation: Generation::default(),
            previous: None,
            cleared: false,
        };

        let (run_token, generation, previous, mode) =
            match std::mem::replace(&mut *state, placeholder) {
                EntryState::NotStarted {
                    run_token,
                    generation,
                    previous,
                    ..
                } => (run_token.next(), generation, previous, RunMode::Execute),
                EntryState::Completed {
                    run_token,
                    generation,
                    result,
                    dep_generations,
                    ..
                } => {
                    // A node that only needs re-checking against its
                    // dependencies can be cleaned rather than re-run, unless
                    // the node itself is uncacheable.
                    let mode = if self.node.cacheable() {
                        RunMode::Clean {
                            dep_generations,
                            result: result.clone(),
                        }
                    } else {
                        RunMode::Execute
                    };
                    (run_token.next(), generation, Some(result), mode)
                }
                EntryState::Running {
                    run_token,
                    generation,
                    previous,
                    ..
                } => (run_token.next(), generation, previous, RunMode::Execute),
            };

        *state = EntryState::Running {
            run_token,
            generation,
            receiver: receiver.clone(),
            previous,
            dirty: false,
        };

        Err((
            receiver,
            Some(Start {
                run_token,
                sender,
                mode,
            }),
        ))
    }

    /// Stores the result of a run, and notifies everyone waiting on it.
    ///
    /// Completions from a stale run, or from a run that was dirtied while it
    /// was in flight, are discarded: dropping the sender makes waiters retry.
    pub(crate) fn complete(
        &self,
        context: &N::Context,
        run_token: RunToken,
        dep_generations: Vec<(EntryId, Generation)>,
        uncacheable_deps: bool,
        sender: Sender<N>,
        result: NodeResult<N>,
    ) {
        let mut state = self.state.lock();

        let (generation, previous) = match &mut *state {
            EntryState::Running {
                run_token: current,
                generation,
                previous,
                dirty: false,
                ..
            } if *current == run_token => (*generation, previous.take()),
            EntryState::Running {
                run_token: current,
                generation,
                previous,
                dirty: true,
                ..
            } if *current == run_token => {
                *state = EntryState::NotStarted {
                    run_token,
                    generation: *generation,
                    previous: previous.take(),
                    cleared: false,
                };
                return;
            }
            _ => return,
        };

        let generation = match &previous {
            Some(previous) if *previous == result => generation,
            Some(_) => generation.next(),
            None => generation,
        };

        let cacheable = match &result {
            Ok(_) => true,
            Err(err) => err.is_cacheable(),
        };

        if cacheable {
            *state = EntryState::Completed {
                run_token,
                generation,
                result: result.clone(),
                dep_generations,
                run_id: context.run_id(),
                uncacheable_deps,
                dirty: false,
            };
        } else {
            *state = EntryState::NotStarted {
                run_token,
                generation,
                previous,
                cleared: false,
            };
        }

        drop(state);
        sender.send_replace(Some((result, generation)));
    }

    /// Marks a successfully cleaned entry as completed with its old result.
    pub(crate) fn complete_cleaned(
        &self,
        context: &N::Context,
        run_token: RunToken,
        dep_generations: Vec<(EntryId, Generation)>,
        uncacheable_deps: bool,
        sender: Sender<N>,
        result: NodeResult<N>,
    ) {
        let mut state = self.state.lock();

        let generation = match &*state {
            EntryState::Running {
                run_token: current,
                generation,
                dirty: false,
                ..
            } if *current == run_token => *generation,
            _ => return,
        };

        *state = EntryState::Completed {
            run_token,
            generation,
            result: result.clone(),
            dep_generations,
            run_id: context.run_id(),
            uncacheable_deps,
            dirty: false,
        };

        drop(state);
        sender.send_replace(Some((result, generation)));
    }

    /// Clears the value of an invalidation root. The generation is bumped
    /// right away, so every dependent observes a change.
    pub(crate) fn clear(&self) {
        let mut state = self.state.lock();

        let (run_token, generation) = match &*state {
            EntryState::NotStarted {
                run_token,
                generation,
                ..
            }
            | EntryState::Running {
                run_token,
                generation,
                ..
            }
            | EntryState::Completed {
                run_token,
                generation,
                ..
            } => (*run_token, *generation),
        };

        *state = EntryState::NotStarted {
            run_token: run_token.next(),
            generation: generation.next(),
            previous: None,
            cleared: true,
        };
    }

    /// Marks the entry as needing a check against its dependencies before its
    /// value can be reused.
    pub(crate) fn dirty(&self) {
        match &mut *self.state.lock() {
            EntryState::Running { dirty, .. } | EntryState::Completed { dirty, .. } => {
                *dirty = true
            }
            EntryState::NotStarted { .. } => {}
        }
    }
}

/// Waits for the outcome published on `receiver`.
pub(crate) async fn wait<N: Node>(
    mut receiver: watch::Receiver<Outcome<N>>,
) -> Result<(N::Item, Generation), N::Error> {
    match receiver.wait_for(Option::is_some).await {
        Ok(outcome) => match &*outcome {
            Some((result, generation)) => result.clone().map(|item| (item, *generation)),
            None => Err(N::Error::invalidated()),
        },
        // The run was discarded without publishing a value.
        Err(_) => Err(N::Error::invalidated()),
    }
}
