use std::sync::{
    atomic::{AtomicU64, AtomicUsize, Ordering},
    Mutex, PoisonError,
};

use async_trait::async_trait;
use ctrlkit_core::{cancellable, Error, ObjectStore, ReconcileRequest, Result};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{Resource, ResourceExt};
use rustc_hash::FxHashMap;
use tokio_util::sync::CancellationToken;

/// In-memory [`ObjectStore`] with API-server-like bookkeeping: every write
/// bumps the resourceVersion, stale writes conflict, and an object marked
/// for deletion disappears once its last finalizer is removed.
pub struct MemoryStore<K> {
    objects: Mutex<FxHashMap<ReconcileRequest, K>>,
    next_rv: AtomicU64,
    updates: AtomicUsize,
    pending_conflicts: AtomicUsize,
}

impl<K> Default for MemoryStore<K> {
    fn default() -> Self {
        Self {
            objects: Mutex::new(FxHashMap::default()),
            next_rv: AtomicU64::new(1),
            updates: AtomicUsize::new(0),
            pending_conflicts: AtomicUsize::new(0),
        }
    }
}

fn key_of<K: Resource>(obj: &K) -> ReconcileRequest {
    ReconcileRequest::new(obj.namespace().unwrap_or_default(), obj.name_any())
}

impl<K: Resource + Clone> MemoryStore<K> {
    pub fn new() -> Self { Self::default() }

    /// Store `obj` as-is apart from a fresh resourceVersion.
    pub fn insert(&self, mut obj: K) -> K {
        obj.meta_mut().resource_version = Some(self.bump());
        self.lock().insert(key_of(&obj), obj.clone());
        obj
    }

    pub fn peek(&self, key: &ReconcileRequest) -> Option<K> { self.lock().get(key).cloned() }

    /// Emulate a delete request: objects holding finalizers get a deletion
    /// timestamp, others are removed. Returns whether the object existed.
    pub fn delete(&self, key: &ReconcileRequest) -> bool {
        let mut objects = self.lock();
        let Some(obj) = objects.get_mut(key) else { return false };
        if obj.finalizers().is_empty() {
            objects.remove(key);
        } else if obj.meta().deletion_timestamp.is_none() {
            obj.meta_mut().deletion_timestamp = Some(Time(chrono::Utc::now()));
            obj.meta_mut().resource_version = Some(self.bump());
        }
        true
    }

    /// Number of update calls received, including rejected ones.
    pub fn update_count(&self) -> usize { self.updates.load(Ordering::SeqCst) }

    /// Make the next `n` updates fail with a conflict.
    pub fn inject_conflicts(&self, n: usize) { self.pending_conflicts.store(n, Ordering::SeqCst); }

    fn bump(&self) -> String { self.next_rv.fetch_add(1, Ordering::SeqCst).to_string() }

    fn lock(&self) -> std::sync::MutexGuard<'_, FxHashMap<ReconcileRequest, K>> {
        self.objects.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_injected_conflict(&self) -> bool {
        self.pending_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn write(&self, obj: &K) -> Result<K> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        let key = key_of(obj);
        if self.take_injected_conflict() {
            return Err(Error::Conflict(format!("injected conflict on {}", key)));
        }
        let mut objects = self.lock();
        let current = objects.get(&key).ok_or_else(|| Error::NotFound(key.to_string()))?;
        if current.meta().resource_version != obj.meta().resource_version {
            return Err(Error::Conflict(format!(
                "{}: resourceVersion {:?} is stale (current {:?})",
                key,
                obj.meta().resource_version,
                current.meta().resource_version
            )));
        }
        let mut next = obj.clone();
        next.meta_mut().deletion_timestamp = current.meta().deletion_timestamp.clone();
        next.meta_mut().resource_version = Some(self.bump());
        if next.meta().deletion_timestamp.is_some() && next.finalizers().is_empty() {
            objects.remove(&key);
        } else {
            objects.insert(key, next.clone());
        }
        Ok(next)
    }
}

#[async_trait]
impl<K> ObjectStore<K> for MemoryStore<K>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &ReconcileRequest, cancel: &CancellationToken) -> Result<K> {
        cancellable(cancel, async { self.peek(key).ok_or_else(|| Error::NotFound(key.to_string())) }).await
    }

    async fn update(&self, obj: &K, cancel: &CancellationToken) -> Result<K> {
        cancellable(cancel, async { self.write(obj) }).await
    }
}
