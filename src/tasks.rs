//! Registry of rules, and the rule graph resolved from it.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use crate::core::{Function, TypeId};
use crate::error::{ConfigError, SchedulerError};

/// A dependency declared up front: the body may request `product` for a
/// subject of type `subject` while it runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DeclaredGet {
    pub product: TypeId,
    pub subject: TypeId,
}

/// One registered rule.
#[derive(Clone, Debug)]
pub struct Task {
    pub product: TypeId,
    /// Products selected for the task's own subject and passed to the body
    /// as positional arguments.
    pub clause: Vec<TypeId>,
    pub gets: Vec<DeclaredGet>,
    pub func: Function,
    pub cacheable: bool,
    pub display_info: Option<String>,
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.display_info {
            Some(name) => f.write_str(name),
            None => write!(f, "Task({}, {})", self.func.key, self.product),
        }
    }
}

pub type TaskId = usize;

/// Catalog of rules, built before any Scheduler exists.
///
/// Each rule is declared between [`Tasks::begin_task`] and [`Tasks::end_task`].
/// Building a Scheduler freezes the registry; the Scheduler keeps its own
/// copy, so the registry is never observed half-mutated.
#[derive(Default)]
pub struct Tasks {
    tasks: Vec<Task>,
    preparing: Option<Task>,
    frozen: bool,
}

impl Tasks {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_open(&self) -> Result<(), SchedulerError> {
        if self.frozen {
            return Err(SchedulerError::RegistryFrozen);
        }
        Ok(())
    }

    fn preparing(&mut self) -> Result<&mut Task, SchedulerError> {
        self.check_open()?;
        self.preparing
            .as_mut()
            .ok_or(SchedulerError::Registry("no task is being declared"))
    }

    pub fn begin_task(
        &mut self,
        func: Function,
        product: TypeId,
        cacheable: bool,
    ) -> Result<(), SchedulerError> {
        self.check_open()?;
        if self.preparing.is_some() {
            return Err(SchedulerError::Registry("a task is already being declared"));
        }
        self.preparing = Some(Task {
            product,
            clause: Vec::new(),
            gets: Vec::new(),
            func,
            cacheable,
            display_info: None,
        });
        Ok(())
    }

    pub fn add_select(&mut self, product: TypeId) -> Result<(), SchedulerError> {
        self.preparing()?.clause.push(product);
        Ok(())
    }

    pub fn add_get(&mut self, product: TypeId, subject: TypeId) -> Result<(), SchedulerError> {
        self.preparing()?
            .gets
            .push(DeclaredGet { product, subject });
        Ok(())
    }

    pub fn add_display_info(&mut self, name: impl Into<String>) -> Result<(), SchedulerError> {
        self.preparing()?.display_info = Some(name.into());
        Ok(())
    }

    pub fn end_task(&mut self) -> Result<(), SchedulerError> {
        self.check_open()?;
        let task = self
            .preparing
            .take()
            .ok_or(SchedulerError::Registry("no task is being declared"))?;
        self.tasks.push(task);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Freezes the registry and returns the Scheduler's copy of it.
    pub(crate) fn freeze(&mut self) -> Result<Arc<[Task]>, SchedulerError> {
        if self.preparing.is_some() {
            return Err(SchedulerError::Registry("a task declaration was never ended"));
        }
        self.frozen = true;
        Ok(self.tasks.clone().into())
    }
}

/// Host types and constructors the built-in rules work with. A family is
/// either fully specified or left out entirely.
#[derive(Clone, Debug, Default)]
pub struct Types {
    pub path_globs: Option<TypeId>,
    pub snapshot: Option<TypeId>,
    pub directory_digest: Option<TypeId>,
    pub files_content: Option<TypeId>,
    pub construct_snapshot: Option<Function>,
    pub construct_directory_digest: Option<Function>,
    pub construct_file_content: Option<Function>,
    pub construct_files_content: Option<Function>,

    /// Requests to union several directory digests. The host type has a
    /// `digests` field.
    pub merge_digests: Option<TypeId>,
    /// Requests to build a directory digest from `files` (each with `path`,
    /// `content` and `is_executable`) and empty `directories`.
    pub create_digest: Option<TypeId>,

    pub process: Option<TypeId>,
    pub process_result: Option<TypeId>,
    pub construct_process_result: Option<Function>,
}

#[derive(Clone, Debug)]
pub(crate) struct FsTypes {
    pub path_globs: TypeId,
    pub snapshot: TypeId,
    pub directory_digest: TypeId,
    pub files_content: TypeId,
    pub construct_snapshot: Function,
    pub construct_directory_digest: Function,
    pub construct_file_content: Function,
    pub construct_files_content: Function,
}

#[derive(Clone, Debug)]
pub(crate) struct DigestEditTypes {
    pub merge_digests: TypeId,
    pub create_digest: TypeId,
}

#[derive(Clone, Debug)]
pub(crate) struct ProcessTypes {
    pub process: TypeId,
    pub process_result: TypeId,
    pub construct_process_result: Function,
}

/// Validated intrinsic type families.
#[derive(Clone, Debug, Default)]
pub(crate) struct Families {
    pub fs: Option<FsTypes>,
    pub digest_edits: Option<DigestEditTypes>,
    pub process: Option<ProcessTypes>,
}

macro_rules! family {
    ($types:expr, $($field:ident),+ $(,)?) => {{
        let present = [$($types.$field.is_some()),+];
        if present.iter().all(|p| !p) {
            None
        } else {
            Some(($(
                $types.$field.ok_or(ConfigError::MissingType(stringify!($field)))?,
            )+))
        }
    }};
}

impl Types {
    pub(crate) fn families(&self) -> Result<Families, ConfigError> {
        let fs = family!(
            self,
            path_globs,
            snapshot,
            directory_digest,
            files_content,
            construct_snapshot,
            construct_directory_digest,
            construct_file_content,
            construct_files_content,
        )
        .map(|(a, b, c, d, e, f, g, h)| FsTypes {
            path_globs: a,
            snapshot: b,
            directory_digest: c,
            files_content: d,
            construct_snapshot: e,
            construct_directory_digest: f,
            construct_file_content: g,
            construct_files_content: h,
        });

        let digest_edits = family!(self, merge_digests, create_digest).map(|(a, b)| DigestEditTypes {
            merge_digests: a,
            create_digest: b,
        });

        let process = family!(self, process, process_result, construct_process_result).map(
            |(a, b, c)| ProcessTypes {
                process: a,
                process_result: b,
                construct_process_result: c,
            },
        );

        // Process inputs and outputs are directory digests.
        if (process.is_some() || digest_edits.is_some()) && fs.is_none() {
            return Err(ConfigError::MissingType("directory_digest"));
        }

        Ok(Families {
            fs,
            digest_edits,
            process,
        })
    }
}

/// A rule implemented natively.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Intrinsic {
    PathGlobsToSnapshot,
    PathGlobsToDigest,
    DigestToSnapshot,
    DigestToFilesContent,
    MergeDigests,
    CreateDigest,
    ProcessToResult,
}

impl Intrinsic {
    fn signatures(families: &Families) -> Vec<(Intrinsic, TypeId, TypeId)> {
        let mut out = Vec::new();
        if let Some(fs) = &families.fs {
            out.push((Intrinsic::PathGlobsToSnapshot, fs.path_globs, fs.snapshot));
            out.push((Intrinsic::PathGlobsToDigest, fs.path_globs, fs.directory_digest));
            out.push((Intrinsic::DigestToSnapshot, fs.directory_digest, fs.snapshot));
            out.push((Intrinsic::DigestToFilesContent, fs.directory_digest, fs.files_content));
            if let Some(edits) = &families.digest_edits {
                out.push((Intrinsic::MergeDigests, edits.merge_digests, fs.directory_digest));
                out.push((Intrinsic::CreateDigest, edits.create_digest, fs.directory_digest));
            }
        }
        if let Some(process) = &families.process {
            out.push((Intrinsic::ProcessToResult, process.process, process.process_result));
        }
        out
    }
}

/// How a `(subject type, product)` pair is satisfied.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Rule {
    /// The subject itself.
    Param,
    Task(TaskId),
    Intrinsic(Intrinsic),
}

/// Rule selection for every pair reachable from the root subject types.
#[derive(Debug, Default)]
pub struct RuleGraph {
    rules: HashMap<(TypeId, TypeId), Rule>,
}

struct Builder<'a> {
    tasks: &'a [Task],
    intrinsics: Vec<(Intrinsic, TypeId, TypeId)>,
    memo: HashMap<(TypeId, TypeId), Option<Rule>>,
    stack: HashSet<(TypeId, TypeId)>,
    names: &'a dyn Fn(TypeId) -> String,
}

impl Builder<'_> {
    fn resolve(&mut self, subject: TypeId, product: TypeId) -> Result<Option<Rule>, ConfigError> {
        if subject == product {
            return Ok(Some(Rule::Param));
        }
        if let Some(rule) = self.memo.get(&(subject, product)) {
            return Ok(*rule);
        }
        // A rule that needs itself for the same subject is not applicable.
        if !self.stack.insert((subject, product)) {
            return Ok(None);
        }

        let mut candidates = Vec::new();
        for (id, task) in self.tasks.iter().enumerate() {
            if task.product != product {
                continue;
            }
            let mut satisfied = true;
            for select in &task.clause {
                if self.resolve(subject, *select)?.is_none() {
                    satisfied = false;
                    break;
                }
            }
            if satisfied {
                candidates.push(Rule::Task(id));
            }
        }
        // Intrinsics only consume their input type directly.
        for (intrinsic, input, output) in &self.intrinsics {
            if *output == product && *input == subject {
                candidates.push(Rule::Intrinsic(*intrinsic));
            }
        }

        self.stack.remove(&(subject, product));

        let rule = match candidates.len() {
            0 => None,
            1 => Some(candidates[0]),
            n => {
                return Err(ConfigError::AmbiguousRule {
                    subject: (self.names)(subject),
                    product: (self.names)(product),
                    candidates: n,
                });
            }
        };
        self.memo.insert((subject, product), rule);
        Ok(rule)
    }

    /// Every registered task must be applicable to at least one reachable
    /// subject. For a task that is not, reports the first select that no
    /// rule satisfies.
    fn check_unused(&mut self, roots: &[TypeId], seen: &HashSet<TypeId>) -> Result<(), ConfigError> {
        if seen.is_empty() {
            return Ok(());
        }
        let used: HashSet<TaskId> = self
            .memo
            .values()
            .filter_map(|rule| match rule {
                Some(Rule::Task(id)) => Some(*id),
                _ => None,
            })
            .collect();

        let mut subjects: Vec<TypeId> = roots.to_vec();
        let mut rest: Vec<TypeId> = seen.iter().copied().filter(|s| !roots.contains(s)).collect();
        rest.sort();
        subjects.extend(rest);

        let tasks = self.tasks;
        for (id, task) in tasks.iter().enumerate() {
            if used.contains(&id) {
                continue;
            }
            for subject in &subjects {
                for select in &task.clause {
                    if self.resolve(*subject, *select)?.is_none() {
                        return Err(ConfigError::MissingRule {
                            subject: (self.names)(*subject),
                            product: (self.names)(*select),
                            needed_by: task.to_string(),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    fn products(&self) -> Vec<TypeId> {
        let mut products: Vec<TypeId> = self.tasks.iter().map(|t| t.product).collect();
        products.extend(self.intrinsics.iter().map(|(_, _, output)| *output));
        products.sort();
        products.dedup();
        products
    }
}

impl RuleGraph {
    /// Resolves rules for every root subject type and, transitively, for
    /// the subjects of every declared `Get` of an applicable task.
    pub(crate) fn build(
        tasks: &[Task],
        families: &Families,
        root_subject_types: &[TypeId],
        names: &dyn Fn(TypeId) -> String,
    ) -> Result<Self, ConfigError> {
        let mut builder = Builder {
            tasks,
            intrinsics: Intrinsic::signatures(families),
            memo: HashMap::new(),
            stack: HashSet::new(),
            names,
        };
        let products = builder.products();

        let mut seen: HashSet<TypeId> = HashSet::new();
        let mut pending: Vec<TypeId> = root_subject_types.to_vec();
        // Intrinsics consume their input as a subject.
        pending.extend(builder.intrinsics.iter().map(|(_, input, _)| *input));

        let mut rules = HashMap::new();
        while let Some(subject) = pending.pop() {
            if !seen.insert(subject) {
                continue;
            }
            for product in &products {
                let Some(rule) = builder.resolve(subject, *product)? else {
                    continue;
                };
                rules.insert((subject, *product), rule);

                let Rule::Task(id) = rule else {
                    continue;
                };
                for get in &tasks[id].gets {
                    if builder.resolve(get.subject, get.product)?.is_none() {
                        return Err(ConfigError::MissingRule {
                            subject: names(get.subject),
                            product: names(get.product),
                            needed_by: tasks[id].to_string(),
                        });
                    }
                    pending.push(get.subject);
                }
            }
        }

        builder.check_unused(root_subject_types, &seen)?;

        Ok(Self { rules })
    }

    pub fn rule_for(&self, subject: TypeId, product: TypeId) -> Option<Rule> {
        if subject == product {
            return Some(Rule::Param);
        }
        self.rules.get(&(subject, product)).copied()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
