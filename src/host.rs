//! Contract with the host value system.
//!
//! Host values never cross into the scheduler by structure. They are opaque
//! [`Handle`]s that the host owns, and every operation on them goes through
//! the [`Host`] callbacks. Each handle received from the host carries one
//! reference that the scheduler must eventually give back with
//! [`Host::drop_handles`].

use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, ReentrantMutex};

use crate::core::{Ident, TypeId};

/// Opaque reference to a host-owned value.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Handle(pub u64);

/// A variable-length array handed over by the host, plus the handle that
/// owns its backing allocation. The scheduler copies `items` out and then
/// releases `owner`, which lets the host free what it allocated.
#[derive(Debug)]
pub struct Buffer<T> {
    pub items: Vec<T>,
    pub owner: Option<Handle>,
}

impl<T> Buffer<T> {
    pub fn new(items: Vec<T>, owner: Option<Handle>) -> Self {
        Self { items, owner }
    }
}

/// A dependency request yielded by a rule body.
#[derive(Clone, Debug)]
pub struct Get<V> {
    pub product: TypeId,
    pub subject: V,
}

/// What a suspended rule body is resumed with.
#[derive(Clone, Debug)]
pub enum Resume<V> {
    /// First entry into the body.
    Start,
    /// The result of a single `Get`.
    Value(V),
    /// The results of a `GetMulti`, in request order.
    Values(Vec<V>),
    /// A dependency failed; the body may handle the exception or re-raise it.
    Throw(V),
}

/// The tagged response of a rule body: either a suspension with dependency
/// requests, or a final outcome.
#[derive(Clone, Debug)]
pub enum Continuation<V> {
    Get(Get<V>),
    GetMulti(Vec<Get<V>>),
    Done(V),
    /// A host exception, recoverable by callers.
    Throw(V),
    /// An unrecoverable fault. Not retried and not catchable by dependents.
    Broke(String),
}

impl<V> Get<V> {
    pub(crate) fn map<W>(self, f: impl FnOnce(V) -> W) -> Get<W> {
        Get {
            product: self.product,
            subject: f(self.subject),
        }
    }
}

impl<V> Resume<V> {
    pub(crate) fn map<W>(self, mut f: impl FnMut(V) -> W) -> Resume<W> {
        match self {
            Resume::Start => Resume::Start,
            Resume::Value(v) => Resume::Value(f(v)),
            Resume::Values(vs) => Resume::Values(vs.into_iter().map(f).collect()),
            Resume::Throw(v) => Resume::Throw(f(v)),
        }
    }
}

impl<V> Continuation<V> {
    pub(crate) fn map<W>(self, mut f: impl FnMut(V) -> W) -> Continuation<W> {
        match self {
            Continuation::Get(get) => Continuation::Get(get.map(&mut f)),
            Continuation::GetMulti(gets) => {
                Continuation::GetMulti(gets.into_iter().map(|get| get.map(&mut f)).collect())
            }
            Continuation::Done(v) => Continuation::Done(f(v)),
            Continuation::Throw(v) => Continuation::Throw(f(v)),
            Continuation::Broke(msg) => Continuation::Broke(msg),
        }
    }
}

/// Callbacks supplied by the embedding host.
///
/// Implementations need not be thread-safe internally: the scheduler never
/// calls into the host from two threads at once.
pub trait Host: Send + Sync + 'static {
    fn identify(&self, value: Handle) -> Ident;
    fn equals(&self, a: Handle, b: Handle) -> bool;
    /// Returns a new reference to the same value.
    fn clone_handle(&self, value: Handle) -> Handle;
    fn drop_handles(&self, handles: &[Handle]);

    fn type_to_str(&self, type_id: TypeId) -> String;
    fn val_to_str(&self, value: Handle) -> String;

    fn store_tuple(&self, values: &[Handle]) -> Handle;
    fn store_set(&self, values: &[Handle]) -> Handle;
    fn store_dict(&self, pairs: &[(Handle, Handle)]) -> Handle;
    fn store_bytes(&self, bytes: &[u8]) -> Handle;
    fn store_utf8(&self, utf8: &str) -> Handle;
    fn store_i64(&self, value: i64) -> Handle;
    fn store_f64(&self, value: f64) -> Handle;
    fn store_bool(&self, value: bool) -> Handle;

    /// Reads a named field of a host value.
    fn project(&self, value: Handle, field: &str) -> Handle;
    /// Reads a named field holding a sequence of values.
    fn project_multi(&self, value: Handle, field: &str) -> Buffer<Handle>;
    /// Reads a host string.
    fn project_str(&self, value: Handle) -> String;
    /// Reads a host integer.
    fn project_i64(&self, value: Handle) -> i64;
    /// Reads host bytes.
    fn project_bytes(&self, value: Handle) -> Vec<u8>;
    fn project_bool(&self, value: Handle) -> bool;

    fn create_exception(&self, message: &str) -> Handle;

    /// Invokes a host callable. `Err` carries a raised exception.
    fn call(&self, func: Handle, args: &[Handle]) -> Result<Handle, Handle>;

    /// Resumes a rule body generator.
    fn generator_send(&self, generator: Handle, input: Resume<Handle>) -> Continuation<Handle>;
}

/// Handles whose last scheduler-side reference is gone, waiting to be
/// returned to the host in one batch.
pub(crate) struct ReleaseQueue {
    host: Arc<dyn Host>,
    gate: Arc<ReentrantMutex<()>>,
    pending: Mutex<Vec<Handle>>,
    batch_size: usize,
}

impl ReleaseQueue {
    pub(crate) fn new(host: Arc<dyn Host>, gate: Arc<ReentrantMutex<()>>, batch_size: usize) -> Self {
        Self {
            host,
            gate,
            pending: Mutex::new(Vec::new()),
            batch_size: batch_size.max(1),
        }
    }

    fn release(&self, handle: Handle) {
        let batch = {
            let mut pending = self.pending.lock();
            pending.push(handle);
            if pending.len() >= self.batch_size {
                std::mem::take(&mut *pending)
            } else {
                return;
            }
        };
        self.drop_batch(batch);
    }

    pub(crate) fn flush(&self) {
        let batch = std::mem::take(&mut *self.pending.lock());
        if !batch.is_empty() {
            self.drop_batch(batch);
        }
    }

    pub(crate) fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    fn drop_batch(&self, batch: Vec<Handle>) {
        tracing::trace!(count = batch.len(), "Releasing host handles");
        let _gate = self.gate.lock();
        self.host.drop_handles(&batch);
    }
}

struct ValueCell {
    handle: Handle,
    releases: Arc<ReleaseQueue>,
}

impl Drop for ValueCell {
    fn drop(&mut self) {
        self.releases.release(self.handle);
    }
}

/// A host value held by the scheduler.
///
/// Clones share one host reference. When the last clone is dropped the
/// handle is queued for release.
#[derive(Clone)]
pub struct Value(Arc<ValueCell>);

impl Value {
    pub(crate) fn new(handle: Handle, releases: Arc<ReleaseQueue>) -> Self {
        Value(Arc::new(ValueCell { handle, releases }))
    }

    pub fn handle(&self) -> Handle {
        self.0.handle
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Value({})", self.0.handle.0)
    }
}

/// Outcome of one root, as handed back to the host.
#[derive(Clone, Debug)]
pub struct RootResult {
    pub is_throw: bool,
    pub value: Value,
}
