//! Interning of host values into [`Key`]s.
//!
//! The table is split into buckets by identity hash, each behind its own
//! lock. A bucket entry owns one host reference for as long as its count of
//! live references is positive.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::core::{Id, Ident, Key, TypeId};
use crate::error::SchedulerError;
use crate::externs::Externs;
use crate::host::{Handle, Value};

const BUCKETS: usize = 16;
const BUCKET_BITS: u32 = BUCKETS.trailing_zeros();

struct Interned {
    value: Value,
    ident: Ident,
    refs: usize,
}

#[derive(Default)]
struct Bucket {
    by_ident: HashMap<Ident, Id>,
    entries: HashMap<Id, Interned>,
}

pub struct Interns {
    externs: Arc<Externs>,
    buckets: Vec<Mutex<Bucket>>,
    /// Handles of live entries, so re-interning the very same host reference
    /// skips the identify callback.
    handles: Vec<Mutex<HashMap<Handle, Key>>>,
    next_id: AtomicU64,
}

impl Interns {
    pub fn new(externs: Arc<Externs>) -> Self {
        Self {
            externs,
            buckets: (0..BUCKETS).map(|_| Mutex::default()).collect(),
            handles: (0..BUCKETS).map(|_| Mutex::default()).collect(),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn externs(&self) -> &Arc<Externs> {
        &self.externs
    }

    fn bucket_of_ident(ident: &Ident) -> usize {
        (ident.hash as u64 as usize) % BUCKETS
    }

    fn bucket_of_id(id: Id) -> usize {
        (id as usize) & (BUCKETS - 1)
    }

    fn handle_slot(handle: Handle) -> usize {
        (handle.0 as usize) % BUCKETS
    }

    /// Returns the key for `value`, adding one reference to it.
    ///
    /// Values with an equal [`Ident`] share one key; the first value interned
    /// for an identity is the one [`Interns::resolve`] hands back.
    pub fn intern(&self, value: &Value) -> Key {
        let cached = self.handles[Self::handle_slot(value.handle())]
            .lock()
            .get(&value.handle())
            .copied();
        if let Some(key) = cached
            && self.retain(key).is_ok()
        {
            return key;
        }

        let ident = self.externs.identify(value);
        let index = Self::bucket_of_ident(&ident);

        let key = {
            let mut bucket = self.buckets[index].lock();
            if let Some(id) = bucket.by_ident.get(&ident).copied()
                && let Some(entry) = bucket.entries.get_mut(&id)
            {
                entry.refs += 1;
                return Key::new(id, ident.type_id);
            }

            let serial = self.next_id.fetch_add(1, Ordering::Relaxed);
            let id = (serial << BUCKET_BITS) | index as u64;
            bucket.by_ident.insert(ident, id);
            bucket.entries.insert(
                id,
                Interned {
                    value: value.clone(),
                    ident,
                    refs: 1,
                },
            );
            Key::new(id, ident.type_id)
        };

        self.handles[Self::handle_slot(value.handle())]
            .lock()
            .insert(value.handle(), key);

        key
    }

    /// Returns the value interned under `key`.
    pub fn resolve(&self, key: &Key) -> Result<Value, SchedulerError> {
        let bucket = self.buckets[Self::bucket_of_id(key.id())].lock();
        bucket
            .entries
            .get(&key.id())
            .map(|entry| entry.value.clone())
            .ok_or(SchedulerError::UnknownKey(*key))
    }

    /// Adds one reference to a live key.
    pub fn retain(&self, key: Key) -> Result<(), SchedulerError> {
        let mut bucket = self.buckets[Self::bucket_of_id(key.id())].lock();
        match bucket.entries.get_mut(&key.id()) {
            Some(entry) => {
                entry.refs += 1;
                Ok(())
            }
            None => Err(SchedulerError::UnknownKey(key)),
        }
    }

    /// Drops one reference. The last one removes the entry and queues its
    /// host value for release.
    pub fn release(&self, key: Key) -> Result<(), SchedulerError> {
        let removed = {
            let mut bucket = self.buckets[Self::bucket_of_id(key.id())].lock();
            let entry = bucket
                .entries
                .get_mut(&key.id())
                .ok_or(SchedulerError::UnknownKey(key))?;
            entry.refs -= 1;
            if entry.refs > 0 {
                return Ok(());
            }
            let removed = bucket.entries.remove(&key.id());
            if let Some(entry) = &removed {
                bucket.by_ident.remove(&entry.ident);
            }
            removed
        };

        if let Some(entry) = removed {
            let handle = entry.value.handle();
            let mut handles = self.handles[Self::handle_slot(handle)].lock();
            if handles.get(&handle) == Some(&key) {
                handles.remove(&handle);
            }
            drop(handles);
            // Dropped outside every lock: this may flush a release batch.
            drop(entry);
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.lock().entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One counted reference to an interned value, released on drop.
///
/// Clones share the reference. Equality and hashing follow the [`Key`].
#[derive(Clone)]
pub struct Retained(Arc<RetainedInner>);

struct RetainedInner {
    key: Key,
    interns: Arc<Interns>,
}

impl Drop for RetainedInner {
    fn drop(&mut self) {
        if let Err(err) = self.interns.release(self.key) {
            tracing::error!(key = %self.key, "{err}");
        }
    }
}

impl Retained {
    pub(crate) fn intern(interns: &Arc<Interns>, value: &Value) -> Self {
        let key = interns.intern(value);
        Retained(Arc::new(RetainedInner {
            key,
            interns: interns.clone(),
        }))
    }

    pub fn key(&self) -> Key {
        self.0.key
    }

    pub fn type_id(&self) -> TypeId {
        self.0.key.type_id()
    }

    pub fn value(&self) -> Result<Value, SchedulerError> {
        self.0.interns.resolve(&self.0.key)
    }

    pub(crate) fn type_name(&self, type_id: TypeId) -> String {
        self.0.interns.externs().type_to_str(type_id)
    }
}

impl PartialEq for Retained {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Retained {}

impl std::hash::Hash for Retained {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

/// Renders the value through the host.
impl fmt::Display for Retained {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.value() {
            Ok(value) => f.write_str(&self.0.interns.externs().val_to_str(&value)),
            Err(_) => write!(f, "{}", self.key()),
        }
    }
}

impl fmt::Debug for Retained {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Retained({})", self.key())
    }
}
