//! ctrlkit predicates: stateless filters over object events.
//!
//! A predicate sees either one object (create, delete, generic) or an old/new
//! pair (update) and answers whether the change should be reconciled.

#![forbid(unsafe_code)]

use std::sync::{Mutex, PoisonError};

use kube::{Resource, ResourceExt};
use rustc_hash::FxHashMap;
use serde::Serialize;
use serde_json::Value as Json;
use tracing::trace;

pub trait Predicate<K>: Send + Sync {
    fn create(&self, _obj: &K) -> bool { true }
    fn update(&self, _old: &K, _new: &K) -> bool { true }
    fn delete(&self, _obj: &K) -> bool { true }
    fn generic(&self, _obj: &K) -> bool { true }
}

/// Single-object test: applied to the object on create, delete and generic
/// events and to the new object on update.
pub struct Test<F>(pub F);

impl<K, F> Predicate<K> for Test<F>
where
    F: Fn(&K) -> bool + Send + Sync,
{
    fn create(&self, obj: &K) -> bool { (self.0)(obj) }
    fn update(&self, _old: &K, new: &K) -> bool { (self.0)(new) }
    fn delete(&self, obj: &K) -> bool { (self.0)(obj) }
    fn generic(&self, obj: &K) -> bool { (self.0)(obj) }
}

/// Old/new comparison; only update events can pass.
pub struct Compare<F>(pub F);

impl<K, F> Predicate<K> for Compare<F>
where
    F: Fn(&K, &K) -> bool + Send + Sync,
{
    fn create(&self, _obj: &K) -> bool { false }
    fn update(&self, old: &K, new: &K) -> bool { (self.0)(old, new) }
    fn delete(&self, _obj: &K) -> bool { false }
    fn generic(&self, _obj: &K) -> bool { false }
}

pub fn has_label<K: Resource>(name: impl Into<String>) -> Test<impl Fn(&K) -> bool + Send + Sync> {
    let name = name.into();
    Test(move |obj: &K| obj.labels().contains_key(&name))
}

pub fn has_annotation<K: Resource>(name: impl Into<String>) -> Test<impl Fn(&K) -> bool + Send + Sync> {
    let name = name.into();
    Test(move |obj: &K| obj.annotations().contains_key(&name))
}

pub fn label_changed<K: Resource>(name: impl Into<String>) -> Compare<impl Fn(&K, &K) -> bool + Send + Sync> {
    let name = name.into();
    Compare(move |old: &K, new: &K| old.labels().get(&name) != new.labels().get(&name))
}

pub fn annotation_changed<K: Resource>(name: impl Into<String>) -> Compare<impl Fn(&K, &K) -> bool + Send + Sync> {
    let name = name.into();
    Compare(move |old: &K, new: &K| old.annotations().get(&name) != new.annotations().get(&name))
}

/// Passes updates whose `status` changed. Objects without a status never pass.
pub struct StatusChanged;

impl<K: Serialize> Predicate<K> for StatusChanged {
    fn create(&self, _obj: &K) -> bool { false }
    fn delete(&self, _obj: &K) -> bool { false }
    fn generic(&self, _obj: &K) -> bool { false }

    fn update(&self, old: &K, new: &K) -> bool {
        match (section(old, "status"), section(new, "status")) {
            (Some(a), Some(b)) => a != b,
            _ => false,
        }
    }
}

fn section<K: Serialize>(obj: &K, key: &str) -> Option<Json> {
    match serde_json::to_value(obj) {
        Ok(Json::Object(mut map)) => map.remove(key),
        _ => None,
    }
}

/// Filter for objects owned by a primary resource.
///
/// Updates pass only when the resourceVersion moved and the objects differ
/// once resourceVersion, managedFields and (unless `watch_status`) status are
/// ignored. Creates never pass; deletes pass when `watch_delete` is set.
#[derive(Debug, Clone, Copy, Default)]
pub struct DependentPredicate {
    pub watch_delete: bool,
    pub watch_update: bool,
    pub watch_status: bool,
}

impl DependentPredicate {
    pub fn with_watch_delete(mut self, on: bool) -> Self { self.watch_delete = on; self }
    pub fn with_watch_update(mut self, on: bool) -> Self { self.watch_update = on; self }
    pub fn with_watch_status(mut self, on: bool) -> Self { self.watch_status = on; self }

    fn comparable<K: Serialize>(&self, obj: &K) -> Option<Json> {
        let mut tree = serde_json::to_value(obj).ok()?;
        let map = tree.as_object_mut()?;
        if !self.watch_status {
            map.remove("status");
        }
        if let Some(meta) = map.get_mut("metadata").and_then(Json::as_object_mut) {
            meta.remove("resourceVersion");
            meta.remove("managedFields");
        }
        Some(tree)
    }
}

impl<K: Resource + Serialize> Predicate<K> for DependentPredicate {
    fn create(&self, _obj: &K) -> bool { false }
    fn generic(&self, _obj: &K) -> bool { false }
    fn delete(&self, _obj: &K) -> bool { self.watch_delete }

    fn update(&self, old: &K, new: &K) -> bool {
        if !self.watch_update {
            return false;
        }
        if old.meta().resource_version == new.meta().resource_version {
            return false;
        }
        match (self.comparable(old), self.comparable(new)) {
            (Some(a), Some(b)) => a != b,
            _ => false,
        }
    }
}

/// Remembers the last version seen per key so a stream of observed objects
/// can be classified into create/update events for a predicate.
///
/// The verdict is kept per resourceVersion: seeing the same version again
/// (a retry or a requeue) repeats the earlier answer instead of comparing the
/// object with itself.
pub struct EventGate<K> {
    predicate: Box<dyn Predicate<K>>,
    seen: Mutex<FxHashMap<String, Seen<K>>>,
}

struct Seen<K> {
    obj: K,
    pass: bool,
}

impl<K: Resource + Clone> EventGate<K> {
    pub fn new(predicate: impl Predicate<K> + 'static) -> Self {
        Self { predicate: Box::new(predicate), seen: Mutex::new(FxHashMap::default()) }
    }

    /// Record `obj` under `key` and ask the predicate about the change.
    pub fn admit(&self, key: &str, obj: &K) -> bool {
        let mut seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);
        let pass = match seen.get(key) {
            Some(prev) if same_version(&prev.obj, obj) => {
                trace!(key, pass = prev.pass, "event gate: version already judged");
                return prev.pass;
            }
            Some(prev) => self.predicate.update(&prev.obj, obj),
            None => self.predicate.create(obj),
        };
        seen.insert(key.to_string(), Seen { obj: obj.clone(), pass });
        trace!(key, pass, "event gate");
        pass
    }

    /// Forget `key` and ask the predicate about the deletion.
    pub fn forget(&self, key: &str, obj: &K) -> bool {
        self.seen.lock().unwrap_or_else(PoisonError::into_inner).remove(key);
        self.predicate.delete(obj)
    }

    /// Number of keys currently remembered.
    pub fn len(&self) -> usize { self.seen.lock().unwrap_or_else(PoisonError::into_inner).len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

fn same_version<K: Resource>(a: &K, b: &K) -> bool {
    match (&a.meta().resource_version, &b.meta().resource_version) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}
