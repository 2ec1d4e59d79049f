#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod config;
mod context;
mod core;
mod error;
mod externs;
mod graph;
mod host;
mod interning;
mod logging;
mod metrics;
mod nodes;
pub mod process;
mod request;
mod scheduler;
mod session;
pub mod store;
mod tasks;
#[cfg(test)]
mod testutil;
#[cfg(feature = "watch")]
mod watch;

pub use crate::config::{RemoteConfig, SchedulerConfig};
pub use crate::core::{Digest, Function, Hash32, Id, Ident, Key, ParseHashError, TypeId};
pub use crate::error::*;
pub use crate::externs::Externs;
pub use crate::graph::{InvalidationResult, NodeState};
pub use crate::host::{Buffer, Continuation, Get, Handle, Host, Resume, RootResult, Value};
pub use crate::interning::{Interns, Retained};
pub use crate::logging::{LogDestination, LoggingConfig};
pub use crate::metrics::Metric;
pub use crate::nodes::PathGlobs;
pub use crate::request::ExecutionRequest;
pub use crate::scheduler::Scheduler;
pub use crate::session::{Session, SessionOptions};
pub use crate::tasks::{DeclaredGet, Intrinsic, Rule, RuleGraph, Task, TaskId, Tasks, Types};
