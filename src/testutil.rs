//! In-memory host for the test suites.
//!
//! Values live in a refcounted slot table. Rule bodies are Rust closures,
//! and generators are closures re-entered with each [`Resume`].

use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::core::{Ident, TypeId};
use crate::host::{Buffer, Continuation, Get, Handle, Host, Resume};

pub(crate) type HostFn = Arc<dyn Fn(&MockHost, &[Handle]) -> Result<Handle, String> + Send + Sync>;
pub(crate) type GenFn =
    Arc<Mutex<Box<dyn FnMut(&MockHost, Resume<Handle>) -> Continuation<Handle> + Send>>>;

pub(crate) const INT: TypeId = TypeId(1);
pub(crate) const STR: TypeId = TypeId(2);
pub(crate) const BYTES: TypeId = TypeId(3);
pub(crate) const TUPLE: TypeId = TypeId(4);
pub(crate) const SET: TypeId = TypeId(5);
pub(crate) const DICT: TypeId = TypeId(6);
pub(crate) const EXCEPTION: TypeId = TypeId(7);
pub(crate) const FUNCTION: TypeId = TypeId(8);
pub(crate) const GENERATOR: TypeId = TypeId(9);
pub(crate) const FLOAT: TypeId = TypeId(10);
pub(crate) const BOOL: TypeId = TypeId(11);
pub(crate) const RECORD: TypeId = TypeId(12);

#[derive(Clone)]
pub(crate) enum MockValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    Bytes(Vec<u8>),
    Tuple(Vec<Handle>),
    Set(Vec<Handle>),
    Dict(Vec<(Handle, Handle)>),
    Record {
        type_id: TypeId,
        fields: Vec<(String, Handle)>,
    },
    Exception(String),
    Function(HostFn),
    Generator(GenFn),
}

impl MockValue {
    fn children(&self) -> Vec<Handle> {
        match self {
            MockValue::Tuple(items) | MockValue::Set(items) => items.clone(),
            MockValue::Dict(pairs) => pairs.iter().flat_map(|(k, v)| [*k, *v]).collect(),
            MockValue::Record { fields, .. } => fields.iter().map(|(_, h)| *h).collect(),
            _ => vec![],
        }
    }

    fn type_id(&self) -> TypeId {
        match self {
            MockValue::Int(_) => INT,
            MockValue::Float(_) => FLOAT,
            MockValue::Bool(_) => BOOL,
            MockValue::Str(_) => STR,
            MockValue::Bytes(_) => BYTES,
            MockValue::Tuple(_) => TUPLE,
            MockValue::Set(_) => SET,
            MockValue::Dict(_) => DICT,
            MockValue::Record { type_id, .. } => *type_id,
            MockValue::Exception(_) => EXCEPTION,
            MockValue::Function(_) => FUNCTION,
            MockValue::Generator(_) => GENERATOR,
        }
    }
}

struct Slot {
    value: MockValue,
    refs: usize,
}

#[derive(Default)]
pub(crate) struct MockHost {
    slots: Mutex<HashMap<u64, Slot>>,
    type_names: Mutex<HashMap<TypeId, String>>,
    next: AtomicU64,
    drop_calls: AtomicUsize,
    identify_calls: AtomicUsize,
    active: AtomicUsize,
    overlapping: AtomicUsize,
}

struct CallGuard<'a>(&'a MockHost);

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockHost {
    fn enter(&self) -> CallGuard<'_> {
        if self.active.fetch_add(1, Ordering::SeqCst) > 0 {
            self.overlapping.fetch_add(1, Ordering::SeqCst);
        }
        CallGuard(self)
    }

    pub(crate) fn alloc(&self, value: MockValue) -> Handle {
        for child in value.children() {
            self.incref(child);
        }
        let handle = Handle(self.next.fetch_add(1, Ordering::SeqCst));
        self.slots
            .lock()
            .insert(handle.0, Slot { value, refs: 1 });
        handle
    }

    pub(crate) fn incref(&self, handle: Handle) {
        if let Some(slot) = self.slots.lock().get_mut(&handle.0) {
            slot.refs += 1;
        }
    }

    fn decref(&self, handle: Handle) {
        let mut stack = vec![handle];
        while let Some(handle) = stack.pop() {
            let mut slots = self.slots.lock();
            let Some(slot) = slots.get_mut(&handle.0) else {
                continue;
            };
            slot.refs -= 1;
            if slot.refs == 0
                && let Some(slot) = slots.remove(&handle.0)
            {
                stack.extend(slot.value.children());
            }
        }
    }

    pub(crate) fn get(&self, handle: Handle) -> Option<MockValue> {
        self.slots.lock().get(&handle.0).map(|s| s.value.clone())
    }

    pub(crate) fn alloc_int(&self, n: i64) -> Handle {
        self.alloc(MockValue::Int(n))
    }

    pub(crate) fn alloc_str(&self, s: &str) -> Handle {
        self.alloc(MockValue::Str(s.to_string()))
    }

    pub(crate) fn alloc_exception(&self, message: &str) -> Handle {
        self.alloc(MockValue::Exception(message.to_string()))
    }

    pub(crate) fn int(&self, handle: Handle) -> Option<i64> {
        match self.get(handle)? {
            MockValue::Int(n) => Some(n),
            _ => None,
        }
    }

    pub(crate) fn str(&self, handle: Handle) -> Option<String> {
        match self.get(handle)? {
            MockValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub(crate) fn field(&self, handle: Handle, name: &str) -> Option<Handle> {
        match self.get(handle)? {
            MockValue::Record { fields, .. } => fields
                .into_iter()
                .find(|(field, _)| field == name)
                .map(|(_, h)| h),
            _ => None,
        }
    }

    pub(crate) fn register_type(&self, type_id: TypeId, name: &str) {
        self.type_names.lock().insert(type_id, name.to_string());
    }

    /// An untyped record, for projecting fields in tests.
    pub(crate) fn record(&self, fields: &[(&str, Handle)]) -> Handle {
        self.record_of(RECORD, fields)
    }

    pub(crate) fn record_of(&self, type_id: TypeId, fields: &[(&str, Handle)]) -> Handle {
        self.alloc(MockValue::Record {
            type_id,
            fields: fields.iter().map(|(n, h)| (n.to_string(), *h)).collect(),
        })
    }

    pub(crate) fn function(
        &self,
        f: impl Fn(&MockHost, &[Handle]) -> Result<Handle, String> + Send + Sync + 'static,
    ) -> Handle {
        self.alloc(MockValue::Function(Arc::new(f)))
    }

    /// A callable building a record of `type_id` from its positional
    /// arguments, assigned to `fields` in order.
    pub(crate) fn constructor(&self, type_id: TypeId, fields: &'static [&'static str]) -> Handle {
        self.function(move |host, args| {
            let pairs: Vec<(&str, Handle)> = fields.iter().copied().zip(args.iter().copied()).collect();
            Ok(host.record_of(type_id, &pairs))
        })
    }

    pub(crate) fn generator(
        &self,
        f: impl FnMut(&MockHost, Resume<Handle>) -> Continuation<Handle> + Send + 'static,
    ) -> Handle {
        self.alloc(MockValue::Generator(Arc::new(Mutex::new(Box::new(f)))))
    }

    /// A rule body without dependencies: `f` runs when the body is called and
    /// its outcome is returned on the first resume.
    pub(crate) fn rule(
        &self,
        f: impl Fn(&MockHost, &[Handle]) -> Result<Handle, String> + Send + Sync + 'static,
    ) -> Handle {
        self.function(move |host, args| {
            let mut outcome = Some(f(host, args));
            Ok(host.generator(move |host, _| match outcome.take() {
                Some(Ok(value)) => Continuation::Done(value),
                Some(Err(message)) => Continuation::Throw(host.alloc_exception(&message)),
                None => Continuation::Broke("generator exhausted".to_string()),
            }))
        })
    }

    /// A rule body that requests `product` for a subject computed from its
    /// arguments, then finishes with `finish` applied to the result.
    pub(crate) fn rule_with_get(
        &self,
        product: TypeId,
        subject: impl Fn(&MockHost, &[Handle]) -> Handle + Send + Sync + 'static,
        finish: impl Fn(&MockHost, Resume<Handle>) -> Continuation<Handle> + Send + Sync + 'static,
    ) -> Handle {
        let finish = Arc::new(finish);
        self.function(move |host, args| {
            let mut request = Some(subject(host, args));
            let finish = finish.clone();
            Ok(host.generator(move |host, resume| match (request.take(), resume) {
                (Some(subject), Resume::Start) => Continuation::Get(Get { product, subject }),
                (None, resume) => finish(host, resume),
                (Some(_), _) => Continuation::Broke("unexpected resume".to_string()),
            }))
        })
    }

    /// Like [`MockHost::rule_with_get`], but requests `product` for every
    /// subject at once.
    pub(crate) fn rule_with_gets(
        &self,
        product: TypeId,
        subjects: impl Fn(&MockHost, &[Handle]) -> Vec<Handle> + Send + Sync + 'static,
        finish: impl Fn(&MockHost, Resume<Handle>) -> Continuation<Handle> + Send + Sync + 'static,
    ) -> Handle {
        let finish = Arc::new(finish);
        self.function(move |host, args| {
            let mut requests = Some(subjects(host, args));
            let finish = finish.clone();
            Ok(host.generator(move |host, resume| match (requests.take(), resume) {
                (Some(subjects), Resume::Start) => Continuation::GetMulti(
                    subjects
                        .into_iter()
                        .map(|subject| Get { product, subject })
                        .collect(),
                ),
                (None, resume) => finish(host, resume),
                (Some(_), _) => Continuation::Broke("unexpected resume".to_string()),
            }))
        })
    }

    fn structural_hash(&self, handle: Handle, state: &mut DefaultHasher) {
        let Some(value) = self.get(handle) else {
            handle.0.hash(state);
            return;
        };
        value.type_id().hash(state);
        match value {
            MockValue::Int(n) => n.hash(state),
            MockValue::Float(f) => f.to_bits().hash(state),
            MockValue::Bool(b) => b.hash(state),
            MockValue::Str(s) | MockValue::Exception(s) => s.hash(state),
            MockValue::Bytes(b) => b.hash(state),
            MockValue::Tuple(items) | MockValue::Set(items) => {
                for item in items {
                    self.structural_hash(item, state);
                }
            }
            MockValue::Dict(pairs) => {
                for (k, v) in pairs {
                    self.structural_hash(k, state);
                    self.structural_hash(v, state);
                }
            }
            MockValue::Record { fields, .. } => {
                for (name, h) in fields {
                    name.hash(state);
                    self.structural_hash(h, state);
                }
            }
            MockValue::Function(_) | MockValue::Generator(_) => handle.0.hash(state),
        }
    }

    fn render(&self, handle: Handle) -> String {
        match self.get(handle) {
            None => format!("<dropped {}>", handle.0),
            Some(MockValue::Int(n)) => n.to_string(),
            Some(MockValue::Float(f)) => f.to_string(),
            Some(MockValue::Bool(b)) => b.to_string(),
            Some(MockValue::Str(s)) => s,
            Some(MockValue::Bytes(b)) => format!("b{:?}", String::from_utf8_lossy(&b)),
            Some(MockValue::Tuple(items)) | Some(MockValue::Set(items)) => {
                let items: Vec<String> = items.into_iter().map(|h| self.render(h)).collect();
                format!("({})", items.join(", "))
            }
            Some(MockValue::Dict(pairs)) => {
                let pairs: Vec<String> = pairs
                    .into_iter()
                    .map(|(k, v)| format!("{}: {}", self.render(k), self.render(v)))
                    .collect();
                format!("{{{}}}", pairs.join(", "))
            }
            Some(MockValue::Record { type_id, fields }) => {
                let fields: Vec<String> = fields
                    .into_iter()
                    .map(|(n, h)| format!("{n}={}", self.render(h)))
                    .collect();
                format!("{}({})", self.type_name(type_id), fields.join(", "))
            }
            Some(MockValue::Exception(message)) => format!("Exception({message})"),
            Some(MockValue::Function(_)) => format!("<function {}>", handle.0),
            Some(MockValue::Generator(_)) => format!("<generator {}>", handle.0),
        }
    }

    fn type_name(&self, type_id: TypeId) -> String {
        self.type_names
            .lock()
            .get(&type_id)
            .cloned()
            .unwrap_or_else(|| type_id.to_string())
    }

    pub(crate) fn live(&self) -> usize {
        self.slots.lock().len()
    }

    pub(crate) fn drop_calls(&self) -> usize {
        self.drop_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn identify_calls(&self) -> usize {
        self.identify_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn overlapping_calls(&self) -> usize {
        self.overlapping.load(Ordering::SeqCst)
    }
}

impl Host for MockHost {
    fn identify(&self, value: Handle) -> Ident {
        let _call = self.enter();
        self.identify_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = DefaultHasher::new();
        self.structural_hash(value, &mut state);
        let type_id = self.get(value).map(|v| v.type_id()).unwrap_or(TypeId(0));
        Ident {
            hash: state.finish() as i64,
            type_id,
        }
    }

    fn equals(&self, a: Handle, b: Handle) -> bool {
        let _call = self.enter();
        let mut ha = DefaultHasher::new();
        let mut hb = DefaultHasher::new();
        self.structural_hash(a, &mut ha);
        self.structural_hash(b, &mut hb);
        ha.finish() == hb.finish()
    }

    fn clone_handle(&self, value: Handle) -> Handle {
        let _call = self.enter();
        self.incref(value);
        value
    }

    fn drop_handles(&self, handles: &[Handle]) {
        let _call = self.enter();
        self.drop_calls.fetch_add(1, Ordering::SeqCst);
        for handle in handles {
            self.decref(*handle);
        }
    }

    fn type_to_str(&self, type_id: TypeId) -> String {
        let _call = self.enter();
        self.type_name(type_id)
    }

    fn val_to_str(&self, value: Handle) -> String {
        let _call = self.enter();
        self.render(value)
    }

    fn store_tuple(&self, values: &[Handle]) -> Handle {
        let _call = self.enter();
        self.alloc(MockValue::Tuple(values.to_vec()))
    }

    fn store_set(&self, values: &[Handle]) -> Handle {
        let _call = self.enter();
        self.alloc(MockValue::Set(values.to_vec()))
    }

    fn store_dict(&self, pairs: &[(Handle, Handle)]) -> Handle {
        let _call = self.enter();
        self.alloc(MockValue::Dict(pairs.to_vec()))
    }

    fn store_bytes(&self, bytes: &[u8]) -> Handle {
        let _call = self.enter();
        self.alloc(MockValue::Bytes(bytes.to_vec()))
    }

    fn store_utf8(&self, utf8: &str) -> Handle {
        let _call = self.enter();
        self.alloc_str(utf8)
    }

    fn store_i64(&self, value: i64) -> Handle {
        let _call = self.enter();
        self.alloc_int(value)
    }

    fn store_f64(&self, value: f64) -> Handle {
        let _call = self.enter();
        self.alloc(MockValue::Float(value))
    }

    fn store_bool(&self, value: bool) -> Handle {
        let _call = self.enter();
        self.alloc(MockValue::Bool(value))
    }

    fn project(&self, value: Handle, field: &str) -> Handle {
        let _call = self.enter();
        match self.field(value, field) {
            Some(handle) => {
                self.incref(handle);
                handle
            }
            None => self.alloc_exception(&format!("no field {field}")),
        }
    }

    fn project_multi(&self, value: Handle, field: &str) -> Buffer<Handle> {
        let _call = self.enter();
        let Some(owner) = self.field(value, field) else {
            return Buffer::new(vec![], None);
        };
        let items = match self.get(owner) {
            Some(MockValue::Tuple(items)) | Some(MockValue::Set(items)) => items,
            _ => vec![],
        };
        for item in &items {
            self.incref(*item);
        }
        self.incref(owner);
        Buffer::new(items, Some(owner))
    }

    fn project_str(&self, value: Handle) -> String {
        let _call = self.enter();
        self.str(value).unwrap_or_else(|| self.render(value))
    }

    fn project_i64(&self, value: Handle) -> i64 {
        let _call = self.enter();
        self.int(value).unwrap_or_default()
    }

    fn project_bytes(&self, value: Handle) -> Vec<u8> {
        let _call = self.enter();
        match self.get(value) {
            Some(MockValue::Bytes(bytes)) => bytes,
            Some(MockValue::Str(s)) => s.into_bytes(),
            _ => vec![],
        }
    }

    fn project_bool(&self, value: Handle) -> bool {
        let _call = self.enter();
        matches!(self.get(value), Some(MockValue::Bool(true)))
    }

    fn create_exception(&self, message: &str) -> Handle {
        let _call = self.enter();
        self.alloc_exception(message)
    }

    fn call(&self, func: Handle, args: &[Handle]) -> Result<Handle, Handle> {
        let _call = self.enter();
        match self.get(func) {
            Some(MockValue::Function(f)) => f(self, args).map_err(|m| self.alloc_exception(&m)),
            _ => Err(self.alloc_exception("not callable")),
        }
    }

    fn generator_send(&self, generator: Handle, input: Resume<Handle>) -> Continuation<Handle> {
        let _call = self.enter();
        match self.get(generator) {
            Some(MockValue::Generator(g)) => {
                let mut body = g.lock();
                body(self, input)
            }
            _ => Continuation::Broke("not a generator".to_string()),
        }
    }
}

/// Shared invocation counter for rule bodies.
#[derive(Clone, Default)]
pub(crate) struct Counter(Arc<AtomicUsize>);

impl Counter {
    pub(crate) fn bump(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}
