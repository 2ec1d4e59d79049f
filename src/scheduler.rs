use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use futures::future::join_all;
use parking_lot::RwLock;
use tokio::runtime::Runtime;
use tracing::Dispatch;
use tracing::instrument::WithSubscriber;

use crate::config::SchedulerConfig;
use crate::context::{Context, Core};
use crate::core::TypeId;
use crate::error::{ConfigError, Failure, SchedulerError};
use crate::externs::Externs;
use crate::graph::{Graph, InvalidationResult, NodeState, RunId};
use crate::host::{Host, RootResult, Value};
use crate::interning::{Interns, Retained};
use crate::nodes::NodeKey;
use crate::process::{CachingRunner, CommandRunner, LocalRunner, RemoteClient, RemoteOptions, RemoteRunner};
use crate::request::ExecutionRequest;
use crate::session::Session;
use crate::store::{DEFAULT_LEASE, GcStats, Store};
use crate::tasks::{RuleGraph, Tasks, Types};

#[cfg(feature = "watch")]
use crate::watch::Invalidator;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Owns the graph and the worker pool. Any number of [`Session`]s may
/// execute against one Scheduler at the same time.
pub struct Scheduler {
    core: Arc<Core>,
    config: SchedulerConfig,
    dispatch: Dispatch,
    /// `None` only while a `fork_context` callback runs, or after the pool
    /// failed to come back.
    runtime: RwLock<Option<Runtime>>,
    #[cfg(feature = "watch")]
    invalidator: parking_lot::Mutex<Option<Invalidator>>,
    next_run_id: AtomicU64,
}

fn build_runtime(config: &SchedulerConfig) -> std::io::Result<Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    if config.worker_threads > 0 {
        builder.worker_threads(config.worker_threads);
    }
    builder.thread_name("tasuki-worker").enable_all().build()
}

fn build_runner(
    config: &SchedulerConfig,
    store: &Store,
    options: RemoteOptions,
    client: Option<Arc<dyn RemoteClient>>,
) -> Arc<dyn CommandRunner> {
    let local: Arc<dyn CommandRunner> = Arc::new(LocalRunner::new(
        store.clone(),
        config.resolve(&config.local_execution_root_dir),
        config.execution_parallelism,
        config.cleanup_local_dirs,
    ));

    let inner: Arc<dyn CommandRunner> = match client {
        Some(client) => Arc::new(RemoteRunner::new(
            client,
            store.clone(),
            options,
            config.remote.retries,
            config.remote.fallback_to_local.then(|| local.clone()),
        )),
        None => local,
    };

    Arc::new(CachingRunner::new(inner, store.clone()))
}

impl Scheduler {
    /// The interning table for values coming from `host`. Rule functions
    /// are interned in it before the Scheduler is built.
    pub fn intern_table(host: Arc<dyn Host>, config: &SchedulerConfig) -> Arc<Interns> {
        let externs = Arc::new(Externs::new(host, config.release_batch_size));
        Arc::new(Interns::new(externs))
    }

    /// Validates the configuration, freezes `tasks`, resolves the rule graph
    /// and starts the worker pool.
    ///
    /// `remote` must be given exactly when `config.remote` names a server.
    pub fn new(
        interns: Arc<Interns>,
        tasks: &mut Tasks,
        types: Types,
        config: SchedulerConfig,
        remote: Option<Arc<dyn RemoteClient>>,
    ) -> Result<Self, SchedulerError> {
        config.validate()?;
        let dispatch = config.logging.dispatch()?;
        let options = config.remote.options()?;
        if config.remote.is_configured() != remote.is_some() {
            return Err(ConfigError::RemoteClient.into());
        }
        let families = types.families()?;
        let ignore = config.ignore()?;

        let task_list = tasks.freeze()?;
        let externs = interns.externs().clone();
        let rule_graph = RuleGraph::build(
            &task_list,
            &families,
            &config.root_subject_types,
            &|type_id| externs.type_to_str(type_id),
        )?;

        let store = Store::open_with_write_lease(
            config.resolve(&config.local_store_dir),
            config.store_write_lease(),
        )?;
        let runner = build_runner(&config, &store, options, remote);
        let runtime = build_runtime(&config)?;

        let core = Arc::new(Core {
            externs,
            interns,
            tasks: task_list,
            rule_graph,
            families,
            graph: Graph::new(config.invalidation_delay()),
            store,
            runner,
            build_root: config.build_root.clone(),
            ignore,
        });

        tracing::dispatcher::with_default(&dispatch, || {
            tracing::info!(
                tasks = core.tasks.len(),
                rules = core.rule_graph.len(),
                build_root = %core.build_root,
                "Scheduler ready"
            );
        });

        Ok(Scheduler {
            core,
            config,
            dispatch,
            runtime: RwLock::new(Some(runtime)),
            #[cfg(feature = "watch")]
            invalidator: parking_lot::Mutex::new(None),
            next_run_id: AtomicU64::new(0),
        })
    }

    fn in_scope<T>(&self, f: impl FnOnce() -> T) -> T {
        tracing::dispatcher::with_default(&self.dispatch, f)
    }

    pub(crate) fn next_run_id(&self) -> RunId {
        self.next_run_id.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn intern(&self, value: &Value) -> Retained {
        Retained::intern(&self.core.interns, value)
    }

    pub fn externs(&self) -> &Arc<Externs> {
        &self.core.externs
    }

    pub fn interns(&self) -> &Arc<Interns> {
        &self.core.interns
    }

    pub fn rule_graph(&self) -> &RuleGraph {
        &self.core.rule_graph
    }

    pub fn store(&self) -> &Store {
        &self.core.store
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Runs every root of `request` to completion and returns one result per
    /// root, in order. A failing root leaves its siblings running.
    pub fn execute(
        &self,
        session: &Session,
        request: &ExecutionRequest,
    ) -> Result<Vec<RootResult>, SchedulerError> {
        let runtime = self.runtime.read();
        let runtime = runtime.as_ref().ok_or(SchedulerError::Shutdown)?;
        let context = Context::new(self.core.clone(), session.clone());
        let start = Instant::now();

        let roots = request.roots().iter().map(|root| {
            let context = context.clone();
            let node = NodeKey::select(root.subject.clone(), root.product);
            async move {
                let output = context.get(node).await?;
                context.resolve(&output.into_value()?)
            }
        });
        let results = runtime.block_on(join_all(roots).with_subscriber(self.dispatch.clone()));

        let results: Vec<RootResult> = results
            .into_iter()
            .map(|result| self.root_result(result))
            .collect();

        self.in_scope(|| {
            tracing::info!(
                run_id = session.run_id(),
                roots = results.len(),
                failed = results.iter().filter(|r| r.is_throw).count(),
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Executed request"
            );
        });
        self.core.externs.flush_releases();
        Ok(results)
    }

    fn root_result(&self, result: Result<Value, Failure>) -> RootResult {
        match result {
            Ok(value) => RootResult {
                is_throw: false,
                value,
            },
            Err(Failure::Throw { exc, .. }) => RootResult {
                is_throw: true,
                value: exc,
            },
            Err(failure) => {
                self.in_scope(|| tracing::debug!("Root failed: {failure}"));
                RootResult {
                    is_throw: true,
                    value: self.core.externs.create_exception(&failure.to_string()),
                }
            }
        }
    }

    /// Clears the filesystem nodes that read any of `paths` and marks
    /// everything depending on them as stale. Paths may be absolute or
    /// relative to the build root; paths outside it are skipped.
    pub fn invalidate<P: AsRef<Utf8Path>>(&self, paths: impl IntoIterator<Item = P>) -> InvalidationResult {
        let root = &self.core.build_root;
        let paths: BTreeSet<Utf8PathBuf> = paths
            .into_iter()
            .filter_map(|path| {
                let path = path.as_ref();
                if path.is_absolute() {
                    path.strip_prefix(root).ok().map(Utf8Path::to_owned)
                } else {
                    Some(path.to_owned())
                }
            })
            .collect();

        let result = self.core.invalidate_paths(&paths);
        self.in_scope(|| {
            tracing::debug!(
                paths = paths.len(),
                cleared = result.cleared,
                dirtied = result.dirtied,
                "Invalidated paths"
            );
        });
        result
    }

    /// Invalidates every node that read the filesystem.
    pub fn invalidate_all(&self) -> InvalidationResult {
        let result = self.core.graph.invalidate_from_roots(NodeKey::is_filesystem);
        self.in_scope(|| {
            tracing::debug!(
                cleared = result.cleared,
                dirtied = result.dirtied,
                "Invalidated all filesystem nodes"
            );
        });
        result
    }

    /// Leases all store content reachable from completed nodes, so that the
    /// next [`Scheduler::garbage_collect_store`] keeps it.
    pub fn lease_files(&self) -> Result<usize, SchedulerError> {
        let mut digests = Vec::new();
        self.core
            .graph
            .visit_live(|_, output| digests.extend(output.digests()));
        let leased = self
            .in_scope(|| self.core.store.lease_all(digests, DEFAULT_LEASE))?;
        Ok(leased)
    }

    pub fn garbage_collect_store(&self) -> Result<GcStats, SchedulerError> {
        let stats = self.in_scope(|| self.core.store.garbage_collect())?;
        self.in_scope(|| {
            tracing::info!(
                removed = stats.removed,
                freed_bytes = stats.freed_bytes,
                stale_records = stats.stale_records,
                "Collected store garbage"
            );
        });
        Ok(stats)
    }

    /// Starts invalidating nodes as files under the build root change.
    #[cfg(feature = "watch")]
    pub fn watch(&self) -> Result<(), SchedulerError> {
        let mut invalidator = self.invalidator.lock();
        if invalidator.is_none() {
            *invalidator = Some(Invalidator::start(self.core.clone(), self.dispatch.clone())?);
        }
        Ok(())
    }

    /// Stops every background thread, runs `f` with exclusive access to the
    /// Scheduler, then starts them again. Graph contents survive.
    pub fn fork_context<T>(&self, f: impl FnOnce() -> T) -> Result<T, SchedulerError> {
        let mut runtime = self.runtime.write();

        #[cfg(feature = "watch")]
        let watching = self.invalidator.lock().take().is_some();

        if let Some(runtime) = runtime.take() {
            runtime.shutdown_timeout(SHUTDOWN_TIMEOUT);
        }
        self.in_scope(|| tracing::debug!("Background threads stopped"));

        let result = f();

        *runtime = Some(build_runtime(&self.config)?);
        drop(runtime);

        #[cfg(feature = "watch")]
        if watching {
            self.watch()?;
        }

        self.in_scope(|| tracing::debug!("Background threads restarted"));
        Ok(result)
    }

    pub fn graph_len(&self) -> usize {
        self.core.graph.len()
    }

    /// Graphviz dot of the nodes reachable from the roots of `request`.
    pub fn visualize(&self, request: &ExecutionRequest) -> String {
        let roots: Vec<NodeKey> = request
            .roots()
            .iter()
            .map(|root| NodeKey::select(root.subject.clone(), root.product))
            .collect();
        self.core.graph.visualize(&roots)
    }

    pub fn root_state(&self, subject: &Value, product: TypeId) -> Option<NodeState> {
        let node = NodeKey::select(self.intern(subject), product);
        self.core.graph.state_of(&node)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::core::{EMPTY_DIGEST, Function};
    use crate::host::{Continuation, Handle, Resume};
    use crate::session::SessionOptions;
    use crate::testutil::{Counter, INT, MockHost, MockValue, STR};

    const SQUARE: TypeId = TypeId(100);
    const FAIL: TypeId = TypeId(101);
    const CAUGHT: TypeId = TypeId(102);
    const CYCLE_A: TypeId = TypeId(103);
    const CYCLE_B: TypeId = TypeId(104);
    const COUNT: TypeId = TypeId(105);
    const SQUARES: TypeId = TypeId(106);

    const PATH_GLOBS: TypeId = TypeId(200);
    const SNAPSHOT: TypeId = TypeId(201);
    const DIGEST: TypeId = TypeId(202);
    const FILES_CONTENT: TypeId = TypeId(203);
    const FILE_CONTENT: TypeId = TypeId(204);
    const MERGE_DIGESTS: TypeId = TypeId(205);
    const CREATE_DIGEST: TypeId = TypeId(206);
    const PROCESS: TypeId = TypeId(207);
    const PROCESS_RESULT: TypeId = TypeId(208);

    struct Fixture {
        host: Arc<MockHost>,
        interns: Arc<Interns>,
        root: TempDir,
        tasks: Tasks,
        types: Types,
    }

    impl Fixture {
        fn new() -> Self {
            let host = Arc::new(MockHost::default());
            for (type_id, name) in [
                (INT, "int"),
                (STR, "str"),
                (SQUARE, "Square"),
                (FAIL, "Fail"),
                (CAUGHT, "Caught"),
                (CYCLE_A, "CycleA"),
                (CYCLE_B, "CycleB"),
                (COUNT, "Count"),
                (SQUARES, "Squares"),
                (PATH_GLOBS, "PathGlobs"),
                (SNAPSHOT, "Snapshot"),
                (DIGEST, "Digest"),
                (MERGE_DIGESTS, "MergeDigests"),
                (CREATE_DIGEST, "CreateDigest"),
                (PROCESS, "Process"),
                (PROCESS_RESULT, "ProcessResult"),
            ] {
                host.register_type(type_id, name);
            }
            let interns = Scheduler::intern_table(host.clone(), &SchedulerConfig::default());
            Fixture {
                host,
                interns,
                root: tempfile::tempdir().unwrap(),
                tasks: Tasks::new(),
                types: Types::default(),
            }
        }

        fn build_root(&self) -> Utf8PathBuf {
            Utf8PathBuf::try_from(self.root.path().to_path_buf()).unwrap()
        }

        fn config(&self) -> SchedulerConfig {
            let mut config = SchedulerConfig::new(self.build_root());
            config.root_subject_types = vec![INT, PATH_GLOBS];
            config.worker_threads = 2;
            config.store_write_lease_secs = 0;
            config
        }

        fn value(&self, handle: Handle) -> Value {
            self.interns.externs().adopt(handle)
        }

        fn function(&self, handle: Handle) -> Function {
            Function {
                key: self.interns.intern(&self.value(handle)),
            }
        }

        fn task(&mut self, product: TypeId, clause: &[TypeId], gets: &[TypeId], name: &str, body: Handle) {
            let func = self.function(body);
            self.tasks.begin_task(func, product, true).unwrap();
            for select in clause {
                self.tasks.add_select(*select).unwrap();
            }
            for get in gets {
                self.tasks.add_get(*get, INT).unwrap();
            }
            self.tasks.add_display_info(name).unwrap();
            self.tasks.end_task().unwrap();
        }

        fn square(&mut self, counter: Counter, delay: Duration) {
            let body = self.host.rule(move |host, args| {
                counter.bump();
                std::thread::sleep(delay);
                let n = host.int(args[0]).ok_or("not an int")?;
                Ok(host.record_of(SQUARE, &[("value", host.alloc_int(n * n))]))
            });
            self.task(SQUARE, &[INT], &[], "square", body);
        }

        fn failing(&mut self) {
            let body = self.host.rule(|_, _| Err("boom".to_string()));
            self.task(FAIL, &[INT], &[], "fail", body);
        }

        /// Requests `product` for its own subject and returns it unchanged.
        fn forward(&mut self, product: TypeId, request: TypeId, name: &str) {
            let body = self.host.rule_with_get(
                request,
                |host, args| {
                    host.incref(args[0]);
                    args[0]
                },
                |host, resume| match resume {
                    Resume::Value(value) => {
                        host.incref(value);
                        Continuation::Done(value)
                    }
                    _ => Continuation::Broke("unexpected resume".to_string()),
                },
            );
            self.task(product, &[INT], &[request], name, body);
        }

        fn catching(&mut self) {
            let body = self.host.rule_with_get(
                FAIL,
                |host, args| {
                    host.incref(args[0]);
                    args[0]
                },
                |host, resume| match resume {
                    Resume::Throw(exc) => {
                        let message = match host.get(exc) {
                            Some(MockValue::Exception(message)) => message,
                            _ => "not an exception".to_string(),
                        };
                        Continuation::Done(host.record_of(CAUGHT, &[("value", host.alloc_str(&message))]))
                    }
                    _ => Continuation::Broke("expected a throw".to_string()),
                },
            );
            self.task(CAUGHT, &[INT], &[FAIL], "catch", body);
        }

        fn with_fs(&mut self) {
            let host = self.host.clone();
            self.types = Types {
                path_globs: Some(PATH_GLOBS),
                snapshot: Some(SNAPSHOT),
                directory_digest: Some(DIGEST),
                files_content: Some(FILES_CONTENT),
                construct_snapshot: Some(self.function(host.constructor(SNAPSHOT, &["digest", "files", "dirs"]))),
                construct_directory_digest: Some(self.function(
                    host.constructor(DIGEST, &["fingerprint", "serialized_bytes_length"]),
                )),
                construct_file_content: Some(self.function(
                    host.constructor(FILE_CONTENT, &["path", "content", "is_executable"]),
                )),
                construct_files_content: Some(self.function(host.constructor(FILES_CONTENT, &["files"]))),
                ..Types::default()
            };
        }

        fn with_digest_edits(&mut self) {
            self.types.merge_digests = Some(MERGE_DIGESTS);
            self.types.create_digest = Some(CREATE_DIGEST);
        }

        fn with_processes(&mut self) {
            let host = self.host.clone();
            self.types.process = Some(PROCESS);
            self.types.process_result = Some(PROCESS_RESULT);
            self.types.construct_process_result = Some(self.function(host.constructor(
                PROCESS_RESULT,
                &["stdout", "stderr", "exit_code", "output_digest"],
            )));
        }

        fn process(&self, argv: &[&str], output_files: &[&str]) -> Value {
            let host = &self.host;
            let strs = |items: &[&str]| host.alloc(MockValue::Tuple(items.iter().map(|i| host.alloc_str(i)).collect()));
            let input_digest = host.record_of(
                DIGEST,
                &[
                    ("fingerprint", host.alloc_str(&EMPTY_DIGEST.hash.to_hex())),
                    ("serialized_bytes_length", host.alloc_int(0)),
                ],
            );
            self.value(host.record_of(
                PROCESS,
                &[
                    ("argv", strs(argv)),
                    ("env", strs(&["PATH", "/usr/bin:/bin"])),
                    ("input_digest", input_digest),
                    ("working_directory", host.alloc_str("")),
                    ("output_files", strs(output_files)),
                    ("output_directories", strs(&[])),
                    ("timeout_seconds", host.alloc_int(0)),
                    ("description", host.alloc_str("")),
                ],
            ))
        }

        /// Squares whose bodies take longer for smaller inputs.
        fn slow_square(&mut self) {
            let body = self.host.rule(|host, args| {
                let n = host.int(args[0]).ok_or("not an int")?;
                std::thread::sleep(Duration::from_millis((5 - n.min(5)) as u64 * 20));
                Ok(host.record_of(SQUARE, &[("value", host.alloc_int(n * n))]))
            });
            self.task(SQUARE, &[INT], &[], "square", body);
        }

        /// Requests the squares of `n + 2`, `n` and `n + 1` in one batch and
        /// returns them in the order received.
        fn squares(&mut self) {
            let body = self.host.rule_with_gets(
                SQUARE,
                |host, args| {
                    let n = host.int(args[0]).unwrap_or_default();
                    [n + 2, n, n + 1].into_iter().map(|m| host.alloc_int(m)).collect()
                },
                |host, resume| match resume {
                    Resume::Values(squares) => {
                        let values: Vec<Handle> = squares
                            .into_iter()
                            .map(|square| {
                                let value = host.field(square, "value").and_then(|v| host.int(v));
                                host.alloc_int(value.unwrap_or(-1))
                            })
                            .collect();
                        let values = host.alloc(MockValue::Tuple(values));
                        Continuation::Done(host.record_of(SQUARES, &[("values", values)]))
                    }
                    _ => Continuation::Broke("expected a batch".to_string()),
                },
            );
            self.task(SQUARES, &[INT], &[SQUARE], "squares", body);
        }

        fn create_digest(&self, files: &[(&str, &str)], directories: &[&str]) -> Value {
            let host = &self.host;
            let files = files
                .iter()
                .map(|(path, content)| {
                    host.record(&[
                        ("path", host.alloc_str(path)),
                        ("content", host.alloc(MockValue::Bytes(content.as_bytes().to_vec()))),
                        ("is_executable", host.alloc(MockValue::Bool(false))),
                    ])
                })
                .collect();
            let directories = directories.iter().map(|dir| host.alloc_str(dir)).collect();
            self.value(host.record_of(
                CREATE_DIGEST,
                &[
                    ("files", host.alloc(MockValue::Tuple(files))),
                    ("directories", host.alloc(MockValue::Tuple(directories))),
                ],
            ))
        }

        fn merge_digests(&self, digests: &[&Value]) -> Value {
            let host = &self.host;
            let digests = host.alloc(MockValue::Tuple(digests.iter().map(|d| d.handle()).collect()));
            self.value(host.record_of(MERGE_DIGESTS, &[("digests", digests)]))
        }

        fn strs(&self, result: &RootResult, field: &str) -> Vec<String> {
            assert!(!result.is_throw, "unexpected throw");
            let items = self
                .host
                .field(result.value.handle(), field)
                .and_then(|items| self.host.get(items));
            let Some(MockValue::Tuple(items)) = items else {
                panic!("no {field} tuple");
            };
            items.into_iter().filter_map(|item| self.host.str(item)).collect()
        }

        fn count_files(&mut self, counter: Counter) {
            let body = self.host.rule(move |host, args| {
                counter.bump();
                let files = host.field(args[0], "files").and_then(|files| host.get(files));
                let Some(MockValue::Tuple(files)) = files else {
                    return Err("snapshot without files".to_string());
                };
                Ok(host.record_of(COUNT, &[("value", host.alloc_int(files.len() as i64))]))
            });
            self.task(COUNT, &[SNAPSHOT], &[], "count", body);
        }

        fn globs(&self, include: &str) -> Value {
            let host = &self.host;
            let include = host.alloc(MockValue::Tuple(vec![host.alloc_str(include)]));
            let exclude = host.alloc(MockValue::Tuple(vec![]));
            self.value(host.record_of(PATH_GLOBS, &[("include", include), ("exclude", exclude)]))
        }

        fn int(&self, n: i64) -> Value {
            self.value(self.host.alloc_int(n))
        }

        fn build(&mut self) -> Scheduler {
            let config = self.config();
            Scheduler::new(self.interns.clone(), &mut self.tasks, self.types.clone(), config, None).unwrap()
        }

        fn run(&self, scheduler: &Scheduler, session: &Session, roots: &[(&Value, TypeId)]) -> Vec<RootResult> {
            let mut request = ExecutionRequest::new();
            for (subject, product) in roots {
                request.add_root(scheduler, subject, *product).unwrap();
            }
            scheduler.execute(session, &request).unwrap()
        }

        fn int_field(&self, result: &RootResult) -> Option<i64> {
            assert!(!result.is_throw, "unexpected throw");
            self.host
                .field(result.value.handle(), "value")
                .and_then(|value| self.host.int(value))
        }

        fn message(&self, result: &RootResult) -> String {
            assert!(result.is_throw, "expected a throw");
            match self.host.get(result.value.handle()) {
                Some(MockValue::Exception(message)) => message,
                _ => panic!("not an exception"),
            }
        }
    }

    #[test]
    fn test_square_is_memoized() {
        let mut fx = Fixture::new();
        let runs = Counter::default();
        fx.square(runs.clone(), Duration::ZERO);
        let scheduler = fx.build();
        let five = fx.int(5);

        let results = fx.run(&scheduler, &Session::new(&scheduler, false), &[(&five, SQUARE)]);
        assert_eq!(fx.int_field(&results[0]), Some(25));
        assert_eq!(runs.get(), 1);

        let session = Session::new(&scheduler, false);
        let results = fx.run(&scheduler, &session, &[(&five, SQUARE)]);
        assert_eq!(fx.int_field(&results[0]), Some(25));
        assert_eq!(runs.get(), 1);
        assert!(session.metrics()["nodes_cache_hits"] >= 1);
        assert_eq!(session.metrics()["nodes_executed"], 0);
        assert_eq!(scheduler.root_state(&five, SQUARE), Some(NodeState::Completed));
    }

    #[test]
    fn test_batched_gets_resume_in_request_order() {
        let mut fx = Fixture::new();
        fx.slow_square();
        fx.squares();
        let scheduler = fx.build();
        let session = Session::new(&scheduler, false);

        // Already memoized, so it completes before the other two.
        let two = fx.int(2);
        fx.run(&scheduler, &session, &[(&two, SQUARE)]);

        let one = fx.int(1);
        let results = fx.run(&scheduler, &session, &[(&one, SQUARES)]);
        assert!(!results[0].is_throw);
        let values = fx.host.field(results[0].value.handle(), "values").unwrap();
        let Some(MockValue::Tuple(values)) = fx.host.get(values) else {
            panic!("expected a tuple");
        };
        let values: Vec<Option<i64>> = values.into_iter().map(|v| fx.host.int(v)).collect();
        assert_eq!(values, vec![Some(9), Some(1), Some(4)]);
    }

    #[test]
    fn test_unsatisfiable_select_fails_the_build() {
        let mut fx = Fixture::new();
        let body = fx.host.rule(|host, _| Ok(host.alloc_int(0)));
        // Nothing produces a Caught.
        fx.task(SQUARE, &[INT, CAUGHT], &[], "needs_caught", body);

        let config = fx.config();
        let result = Scheduler::new(fx.interns.clone(), &mut fx.tasks, Types::default(), config, None);
        match result {
            Err(SchedulerError::Config(ConfigError::MissingRule { product, needed_by, .. })) => {
                assert_eq!(product, "Caught");
                assert!(needed_by.contains("needs_caught"));
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("expected a missing rule"),
        }
    }

    #[test]
    fn test_session_parallelism_bounds_compute() {
        let mut fx = Fixture::new();
        fx.square(Counter::default(), Duration::ZERO);
        let scheduler = fx.build();
        let session = Session::with_options(
            &scheduler,
            SessionOptions {
                parallelism: 2,
                ..SessionOptions::default()
            },
        );

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        runtime.block_on(async {
            let first = session.worker().await.unwrap();
            let _second = session.worker().await.unwrap();
            let third = tokio::time::timeout(Duration::from_millis(50), session.worker()).await;
            assert!(third.is_err());

            drop(first);
            let third = tokio::time::timeout(Duration::from_millis(50), session.worker()).await;
            assert!(matches!(third, Ok(Some(_))));
        });
    }

    #[test]
    fn test_single_worker_session_runs_nested_gets() {
        let mut fx = Fixture::new();
        fx.failing();
        fx.catching();
        let scheduler = fx.build();
        let session = Session::with_options(
            &scheduler,
            SessionOptions {
                parallelism: 1,
                ..SessionOptions::default()
            },
        );

        let two = fx.int(2);
        let results = fx.run(&scheduler, &session, &[(&two, CAUGHT)]);
        let caught = fx.host.field(results[0].value.handle(), "value").unwrap();
        assert_eq!(fx.host.str(caught).as_deref(), Some("boom"));
    }

    #[test]
    fn test_ui_workers_are_bounded() {
        let mut fx = Fixture::new();
        fx.square(Counter::default(), Duration::ZERO);
        let scheduler = fx.build();

        let quiet = Session::new(&scheduler, false);
        assert!(quiet.ui_worker().is_none());

        let session = Session::with_options(
            &scheduler,
            SessionOptions {
                render_ui: true,
                max_ui_workers: 1,
                ..SessionOptions::default()
            },
        );
        let slot = session.ui_worker();
        assert!(slot.is_some());
        assert!(session.ui_worker().is_none());
        drop(slot);
        assert!(session.ui_worker().is_some());

        // Nodes beyond the bound still run.
        let four = fx.int(4);
        let results = fx.run(&scheduler, &session, &[(&four, SQUARE)]);
        assert_eq!(fx.int_field(&results[0]), Some(16));
    }

    #[test]
    fn test_create_and_merge_digests() {
        let mut fx = Fixture::new();
        fx.with_fs();
        fx.with_digest_edits();
        let scheduler = fx.build();
        let session = Session::new(&scheduler, false);

        let left = fx.create_digest(&[("a.txt", "a")], &[]);
        let right = fx.create_digest(&[("sub/b.txt", "b")], &["empty"]);
        let digests = fx.run(&scheduler, &session, &[(&left, DIGEST), (&right, DIGEST)]);
        assert!(!digests[0].is_throw && !digests[1].is_throw);

        let merge = fx.merge_digests(&[&digests[0].value, &digests[1].value]);
        let merged = fx.run(&scheduler, &session, &[(&merge, DIGEST)]);
        let snapshot = fx.run(&scheduler, &session, &[(&merged[0].value, SNAPSHOT)]);
        assert_eq!(fx.strs(&snapshot[0], "files"), vec!["a.txt", "sub/b.txt"]);
        assert_eq!(fx.strs(&snapshot[0], "dirs"), vec!["empty", "sub"]);

        let clash = fx.create_digest(&[("a.txt", "other")], &[]);
        let clash = fx.run(&scheduler, &session, &[(&clash, DIGEST)]);
        let merge = fx.merge_digests(&[&digests[0].value, &clash[0].value]);
        let results = fx.run(&scheduler, &session, &[(&merge, DIGEST)]);
        assert!(fx.message(&results[0]).contains("conflicting"));

        let escaping = fx.create_digest(&[("../x.txt", "x")], &[]);
        let results = fx.run(&scheduler, &session, &[(&escaping, DIGEST)]);
        assert!(fx.message(&results[0]).contains("escapes"));
    }

    #[cfg(unix)]
    #[test]
    fn test_process_outputs_stay_in_the_sandbox() {
        let mut fx = Fixture::new();
        fx.with_fs();
        fx.with_processes();
        let scheduler = fx.build();
        let session = Session::new(&scheduler, false);

        let ok = fx.process(&["/bin/sh", "-c", "echo hi > out.txt"], &["out.txt"]);
        let results = fx.run(&scheduler, &session, &[(&ok, PROCESS_RESULT)]);
        assert!(!results[0].is_throw);
        let exit_code = fx.host.field(results[0].value.handle(), "exit_code").unwrap();
        assert_eq!(fx.host.int(exit_code), Some(0));

        let escaping = fx.process(&["/bin/sh", "-c", "echo pwned > ../escaped.txt"], &["../../secret.txt"]);
        let results = fx.run(&scheduler, &session, &[(&escaping, PROCESS_RESULT)]);
        assert!(fx.message(&results[0]).contains("must be relative"));
        assert_eq!(session.metrics()["process_local_executions"], 1);
    }

    #[test]
    fn test_cancelled_session_is_not_cached() {
        let mut fx = Fixture::new();
        fx.square(Counter::default(), Duration::ZERO);
        let scheduler = fx.build();
        let three = fx.int(3);

        let session = Session::new(&scheduler, false);
        session.cancel();
        let results = fx.run(&scheduler, &session, &[(&three, SQUARE)]);
        assert!(fx.message(&results[0]).contains("cancelled"));

        let results = fx.run(&scheduler, &Session::new(&scheduler, false), &[(&three, SQUARE)]);
        assert_eq!(fx.int_field(&results[0]), Some(9));
    }

    #[test]
    fn test_concurrent_sessions_share_one_run() {
        let mut fx = Fixture::new();
        let runs = Counter::default();
        fx.square(runs.clone(), Duration::from_millis(50));
        let scheduler = fx.build();
        let seven = fx.int(7);

        let (a, b) = std::thread::scope(|s| {
            let a = s.spawn(|| fx.run(&scheduler, &Session::new(&scheduler, false), &[(&seven, SQUARE)]));
            let b = s.spawn(|| fx.run(&scheduler, &Session::new(&scheduler, false), &[(&seven, SQUARE)]));
            (a.join().unwrap(), b.join().unwrap())
        });

        assert_eq!(fx.int_field(&a[0]), Some(49));
        assert_eq!(a[0].value.handle(), b[0].value.handle());
        assert_eq!(runs.get(), 1);
    }

    #[test]
    fn test_cyclic_rules_fail_fast() {
        let mut fx = Fixture::new();
        fx.forward(CYCLE_A, CYCLE_B, "a");
        fx.forward(CYCLE_B, CYCLE_A, "b");
        let scheduler = fx.build();
        let one = fx.int(1);

        let session = Session::new(&scheduler, false);
        let results = fx.run(&scheduler, &session, &[(&one, CYCLE_A)]);
        assert!(fx.message(&results[0]).contains("Dependency cycle"));
        assert_eq!(session.metrics()["cycles_detected"], 1);
    }

    #[test]
    fn test_sibling_roots_are_isolated() {
        let mut fx = Fixture::new();
        fx.square(Counter::default(), Duration::ZERO);
        fx.failing();
        let scheduler = fx.build();
        let three = fx.int(3);

        let session = Session::new(&scheduler, false);
        let results = fx.run(&scheduler, &session, &[(&three, FAIL), (&three, SQUARE)]);
        assert_eq!(fx.message(&results[0]), "boom");
        assert_eq!(fx.int_field(&results[1]), Some(9));
    }

    #[test]
    fn test_body_catches_dependency_throw() {
        let mut fx = Fixture::new();
        fx.failing();
        fx.catching();
        let scheduler = fx.build();
        let two = fx.int(2);

        let results = fx.run(&scheduler, &Session::new(&scheduler, false), &[(&two, CAUGHT)]);
        assert!(!results[0].is_throw);
        let caught = fx.host.field(results[0].value.handle(), "value").unwrap();
        assert_eq!(fx.host.str(caught).as_deref(), Some("boom"));
    }

    #[test]
    fn test_host_calls_never_overlap() {
        let mut fx = Fixture::new();
        fx.square(Counter::default(), Duration::ZERO);
        let scheduler = fx.build();

        let subjects: Vec<Value> = (0..32).map(|n| fx.int(n)).collect();
        let roots: Vec<(&Value, TypeId)> = subjects.iter().map(|v| (v, SQUARE)).collect();
        let results = fx.run(&scheduler, &Session::new(&scheduler, false), &roots);

        for (n, result) in results.iter().enumerate() {
            assert_eq!(fx.int_field(result), Some((n * n) as i64));
        }
        assert_eq!(fx.host.overlapping_calls(), 0);
    }

    #[test]
    fn test_invalidation_reruns_only_dependents() {
        let mut fx = Fixture::new();
        let counts = Counter::default();
        let squares = Counter::default();
        fx.with_fs();
        fx.count_files(counts.clone());
        fx.square(squares.clone(), Duration::ZERO);
        let scheduler = fx.build();

        let src = fx.build_root().join("src");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::write(src.join("a.txt"), "a").unwrap();

        let globs = fx.globs("src/*.txt");
        let four = fx.int(4);
        let roots = [(&globs, COUNT), (&four, SQUARE)];

        let results = fx.run(&scheduler, &Session::new(&scheduler, false), &roots);
        assert_eq!(fx.int_field(&results[0]), Some(1));

        // Not observed until invalidated.
        std::fs::write(src.join("b.txt"), "b").unwrap();
        let results = fx.run(&scheduler, &Session::new(&scheduler, false), &roots);
        assert_eq!(fx.int_field(&results[0]), Some(1));

        let invalidated = scheduler.invalidate([src.join("b.txt")]);
        assert_eq!(invalidated.cleared, 1);
        assert!(invalidated.dirtied > 0);

        let results = fx.run(&scheduler, &Session::new(&scheduler, false), &roots);
        assert_eq!(fx.int_field(&results[0]), Some(2));
        assert_eq!(fx.int_field(&results[1]), Some(16));
        assert_eq!(counts.get(), 2);
        assert_eq!(squares.get(), 1);

        // The first snapshot's directories are no longer referenced.
        scheduler.lease_files().unwrap();
        assert!(scheduler.garbage_collect_store().unwrap().removed > 0);
        scheduler.lease_files().unwrap();
        assert_eq!(scheduler.garbage_collect_store().unwrap().removed, 0);

        let dot = scheduler.visualize(&{
            let mut request = ExecutionRequest::new();
            request.add_root(&scheduler, &globs, COUNT).unwrap();
            request
        });
        assert!(dot.contains("count"));
        assert!(!dot.contains("square"));
    }

    #[test]
    fn test_invalidate_all_clears_filesystem_nodes() {
        let mut fx = Fixture::new();
        fx.with_fs();
        fx.count_files(Counter::default());
        let scheduler = fx.build();
        std::fs::write(fx.build_root().join("top.txt"), "top").unwrap();

        let globs = fx.globs("*.txt");
        let results = fx.run(&scheduler, &Session::new(&scheduler, false), &[(&globs, COUNT)]);
        assert_eq!(fx.int_field(&results[0]), Some(1));

        let invalidated = scheduler.invalidate_all();
        assert!(invalidated.cleared >= 2);
        assert_eq!(scheduler.invalidate(["../elsewhere.txt"]).cleared, 0);
    }

    #[test]
    fn test_bare_directory_globs_match_nothing() {
        let mut fx = Fixture::new();
        fx.with_fs();
        fx.count_files(Counter::default());
        let scheduler = fx.build();
        std::fs::write(fx.build_root().join("top.txt"), "top").unwrap();

        for glob in [".", ""] {
            let globs = fx.globs(glob);
            let results = fx.run(&scheduler, &Session::new(&scheduler, false), &[(&globs, COUNT)]);
            assert_eq!(fx.int_field(&results[0]), Some(0), "glob {glob:?}");
        }
    }

    #[test]
    fn test_registry_frozen_after_build() {
        let mut fx = Fixture::new();
        fx.square(Counter::default(), Duration::ZERO);
        let _scheduler = fx.build();

        let func = fx.function(fx.host.alloc_int(0));
        assert!(matches!(
            fx.tasks.begin_task(func, SQUARE, true),
            Err(SchedulerError::RegistryFrozen)
        ));
    }

    #[test]
    fn test_unknown_root_pair() {
        let mut fx = Fixture::new();
        fx.square(Counter::default(), Duration::ZERO);
        let scheduler = fx.build();

        let text = fx.value(fx.host.alloc_str("five"));
        let mut request = ExecutionRequest::new();
        assert!(matches!(
            request.add_root(&scheduler, &text, SQUARE),
            Err(SchedulerError::NoRule { .. })
        ));
        assert!(request.is_empty());
    }

    #[test]
    fn test_config_errors_surface_before_execution() {
        let mut fx = Fixture::new();
        let mut config = fx.config();
        config.execution_parallelism = 0;
        let result = Scheduler::new(fx.interns.clone(), &mut fx.tasks, Types::default(), config, None);
        assert!(matches!(
            result,
            Err(SchedulerError::Config(ConfigError::InvalidParallelism))
        ));

        let mut config = fx.config();
        config.remote.store_servers = vec!["cas.example:443".into()];
        let result = Scheduler::new(fx.interns.clone(), &mut fx.tasks, Types::default(), config, None);
        assert!(matches!(
            result,
            Err(SchedulerError::Config(ConfigError::RemoteClient))
        ));

        let types = Types {
            path_globs: Some(PATH_GLOBS),
            ..Types::default()
        };
        let config = fx.config();
        let result = Scheduler::new(fx.interns.clone(), &mut fx.tasks, types, config, None);
        assert!(matches!(
            result,
            Err(SchedulerError::Config(ConfigError::MissingType(_)))
        ));
        assert!(!fx.tasks.is_frozen());
    }

    #[test]
    fn test_fork_context_keeps_the_graph() {
        let mut fx = Fixture::new();
        let runs = Counter::default();
        fx.square(runs.clone(), Duration::ZERO);
        let scheduler = fx.build();
        let six = fx.int(6);

        fx.run(&scheduler, &Session::new(&scheduler, false), &[(&six, SQUARE)]);
        assert_eq!(scheduler.fork_context(|| 7).unwrap(), 7);

        let results = fx.run(&scheduler, &Session::new(&scheduler, false), &[(&six, SQUARE)]);
        assert_eq!(fx.int_field(&results[0]), Some(36));
        assert_eq!(runs.get(), 1);
        assert!(scheduler.graph_len() >= 2);
    }
}
