//! Serialized access to the [`Host`] callbacks.
//!
//! Every call into the host goes through one gate, so host values never need
//! to be thread-safe on their own. Handles returned by the host are wrapped
//! into [`Value`]s straight away, which ties their release to Rust ownership.

use std::sync::Arc;

use parking_lot::ReentrantMutex;

use crate::core::{Ident, TypeId};
use crate::host::{Continuation, Handle, Host, ReleaseQueue, Resume, Value};

pub struct Externs {
    host: Arc<dyn Host>,
    gate: Arc<ReentrantMutex<()>>,
    releases: Arc<ReleaseQueue>,
}

impl Externs {
    pub fn new(host: Arc<dyn Host>, release_batch_size: usize) -> Self {
        let gate = Arc::new(ReentrantMutex::new(()));
        let releases = Arc::new(ReleaseQueue::new(
            host.clone(),
            gate.clone(),
            release_batch_size,
        ));
        Self {
            host,
            gate,
            releases,
        }
    }

    /// Takes ownership of one host reference.
    pub fn adopt(&self, handle: Handle) -> Value {
        Value::new(handle, self.releases.clone())
    }

    fn with_host<T>(&self, f: impl FnOnce(&dyn Host) -> T) -> T {
        let _gate = self.gate.lock();
        f(self.host.as_ref())
    }

    /// Returns a handle the caller owns, for giving a value back to the host.
    pub fn share(&self, value: &Value) -> Handle {
        self.with_host(|host| host.clone_handle(value.handle()))
    }

    pub fn identify(&self, value: &Value) -> Ident {
        self.with_host(|host| host.identify(value.handle()))
    }

    pub fn equals(&self, a: &Value, b: &Value) -> bool {
        a.handle() == b.handle() || self.with_host(|host| host.equals(a.handle(), b.handle()))
    }

    pub fn type_to_str(&self, type_id: TypeId) -> String {
        self.with_host(|host| host.type_to_str(type_id))
    }

    pub fn val_to_str(&self, value: &Value) -> String {
        self.with_host(|host| host.val_to_str(value.handle()))
    }

    pub fn store_tuple(&self, values: &[Value]) -> Value {
        let handles: Vec<Handle> = values.iter().map(Value::handle).collect();
        let handle = self.with_host(|host| host.store_tuple(&handles));
        self.adopt(handle)
    }

    pub fn store_set(&self, values: &[Value]) -> Value {
        let handles: Vec<Handle> = values.iter().map(Value::handle).collect();
        let handle = self.with_host(|host| host.store_set(&handles));
        self.adopt(handle)
    }

    pub fn store_dict(&self, pairs: &[(Value, Value)]) -> Value {
        let handles: Vec<(Handle, Handle)> =
            pairs.iter().map(|(k, v)| (k.handle(), v.handle())).collect();
        let handle = self.with_host(|host| host.store_dict(&handles));
        self.adopt(handle)
    }

    pub fn store_bytes(&self, bytes: &[u8]) -> Value {
        let handle = self.with_host(|host| host.store_bytes(bytes));
        self.adopt(handle)
    }

    pub fn store_utf8(&self, utf8: &str) -> Value {
        let handle = self.with_host(|host| host.store_utf8(utf8));
        self.adopt(handle)
    }

    pub fn store_i64(&self, value: i64) -> Value {
        let handle = self.with_host(|host| host.store_i64(value));
        self.adopt(handle)
    }

    pub fn store_f64(&self, value: f64) -> Value {
        let handle = self.with_host(|host| host.store_f64(value));
        self.adopt(handle)
    }

    pub fn store_bool(&self, value: bool) -> Value {
        let handle = self.with_host(|host| host.store_bool(value));
        self.adopt(handle)
    }

    pub fn project(&self, value: &Value, field: &str) -> Value {
        let handle = self.with_host(|host| host.project(value.handle(), field));
        self.adopt(handle)
    }

    /// Reads a sequence field. The items are adopted and the backing buffer
    /// is given back to the host.
    pub fn project_multi(&self, value: &Value, field: &str) -> Vec<Value> {
        let buffer = self.with_host(|host| host.project_multi(value.handle(), field));
        if let Some(owner) = buffer.owner {
            drop(self.adopt(owner));
        }
        buffer.items.into_iter().map(|h| self.adopt(h)).collect()
    }

    pub fn project_str(&self, value: &Value, field: &str) -> String {
        let field = self.project(value, field);
        self.with_host(|host| host.project_str(field.handle()))
    }

    pub fn project_multi_strs(&self, value: &Value, field: &str) -> Vec<String> {
        self.project_multi(value, field)
            .iter()
            .map(|item| self.with_host(|host| host.project_str(item.handle())))
            .collect()
    }

    pub fn project_i64(&self, value: &Value, field: &str) -> i64 {
        let field = self.project(value, field);
        self.with_host(|host| host.project_i64(field.handle()))
    }

    pub fn project_bytes(&self, value: &Value, field: &str) -> Vec<u8> {
        let field = self.project(value, field);
        self.with_host(|host| host.project_bytes(field.handle()))
    }

    pub fn project_bool(&self, value: &Value, field: &str) -> bool {
        let field = self.project(value, field);
        self.with_host(|host| host.project_bool(field.handle()))
    }

    pub fn create_exception(&self, message: &str) -> Value {
        let handle = self.with_host(|host| host.create_exception(message));
        self.adopt(handle)
    }

    pub fn call(&self, func: &Value, args: &[Value]) -> Result<Value, Value> {
        let handles: Vec<Handle> = args.iter().map(Value::handle).collect();
        match self.with_host(|host| host.call(func.handle(), &handles)) {
            Ok(handle) => Ok(self.adopt(handle)),
            Err(handle) => Err(self.adopt(handle)),
        }
    }

    pub fn generator_send(&self, generator: &Value, input: Resume<Value>) -> Continuation<Value> {
        let input = input.map(|v| v.handle());
        let response = self.with_host(|host| host.generator_send(generator.handle(), input));
        response.map(|h| self.adopt(h))
    }

    /// Returns every queued handle to the host now.
    pub fn flush_releases(&self) {
        self.releases.flush();
    }

    pub(crate) fn pending_releases(&self) -> usize {
        self.releases.pending()
    }
}
