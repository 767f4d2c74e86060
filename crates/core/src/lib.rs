//! ctrlkit core: request/result types, resource mappings, errors and the
//! capability traits the engine and router are written against.

#![forbid(unsafe_code)]

use std::{fmt, future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use kube::core::{GroupVersionKind, TypeMeta};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

mod config;
mod error;

pub use config::{Settings, DISCOVERY_LIMITER_BURST};
pub use error::{BoxError, Error, FinalizerAction, Result};

/// Namespaced identity of an object handed to a reconciler.
/// Cluster-scoped objects carry an empty namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReconcileRequest {
    pub namespace: String,
    pub name: String,
}

impl ReconcileRequest {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }

    pub fn cluster(name: impl Into<String>) -> Self {
        Self { namespace: String::new(), name: name.into() }
    }

    pub fn namespace(&self) -> Option<&str> {
        if self.namespace.is_empty() { None } else { Some(&self.namespace) }
    }
}

impl fmt::Display for ReconcileRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            f.write_str(&self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

/// Outcome of a single reconcile pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileResult {
    pub requeue: bool,
    pub requeue_after: Option<Duration>,
}

impl ReconcileResult {
    /// Nothing left to do until the object changes again.
    pub fn done() -> Self { Self::default() }

    /// Ask the scheduler to requeue using its own delay.
    pub fn requeue() -> Self { Self { requeue: true, requeue_after: None } }

    pub fn requeue_after(after: Duration) -> Self { Self { requeue: true, requeue_after: Some(after) } }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scope {
    Namespaced,
    Cluster,
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Namespaced => f.write_str("namespaced"),
            Scope::Cluster => f.write_str("cluster"),
        }
    }
}

/// Resource mapping for one served group/version/kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingEntry {
    pub group: String,
    pub version: String,
    pub kind: String,
    /// Plural resource name used in request paths, e.g. `deployments`.
    pub plural: String,
    pub scope: Scope,
}

impl MappingEntry {
    pub fn gvk(&self) -> GroupVersionKind {
        GroupVersionKind { group: self.group.clone(), version: self.version.clone(), kind: self.kind.clone() }
    }

    pub fn gvk_key(&self) -> String { gvk_key(&self.group, &self.version, &self.kind) }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }
}

/// Mapping table produced by one discovery pass. Never mutated once built;
/// a refresh replaces the whole table.
#[derive(Debug, Clone, Default)]
pub struct MappingTable {
    entries: FxHashMap<String, MappingEntry>,
}

impl MappingTable {
    pub fn get(&self, gvk: &GroupVersionKind) -> Option<&MappingEntry> {
        self.entries.get(&gvk_key(&gvk.group, &gvk.version, &gvk.kind))
    }

    pub fn len(&self) -> usize { self.entries.len() }
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }

    /// Entries sorted by group, version and kind.
    pub fn sorted(&self) -> Vec<&MappingEntry> {
        let mut out: Vec<_> = self.entries.values().collect();
        out.sort_by(|a, b| a.group.cmp(&b.group).then(a.version.cmp(&b.version)).then(a.kind.cmp(&b.kind)));
        out
    }
}

impl FromIterator<MappingEntry> for MappingTable {
    fn from_iter<I: IntoIterator<Item = MappingEntry>>(iter: I) -> Self {
        let entries = iter.into_iter().map(|e| (e.gvk_key(), e)).collect();
        Self { entries }
    }
}

/// `v1/Kind` for the core group, `group/v1/Kind` otherwise.
pub fn gvk_key(group: &str, version: &str, kind: &str) -> String {
    if group.is_empty() {
        format!("{}/{}", version, kind)
    } else {
        format!("{}/{}/{}", group, version, kind)
    }
}

/// Split an `apiVersion` into `(group, version)`; the core group is empty.
pub fn split_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((g, v)) => (g.to_string(), v.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// GVK of a schemaless object from its type metadata.
pub fn gvk_of(types: Option<&TypeMeta>) -> Result<GroupVersionKind> {
    let tm = types.ok_or_else(|| Error::Validation("object has no apiVersion/kind".into()))?;
    if tm.api_version.is_empty() || tm.kind.is_empty() {
        return Err(Error::Validation("object has no apiVersion/kind".into()));
    }
    let (group, version) = split_api_version(&tm.api_version);
    Ok(GroupVersionKind { group, version, kind: tm.kind.clone() })
}

/// Race `fut` against `cancel`. A fired token aborts the future and yields
/// [`Error::Cancelled`]; nothing is retried.
pub async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        res = fut => res,
    }
}

/// Read/write access to objects of type `K` with optimistic concurrency.
#[async_trait]
pub trait ObjectStore<K>: Send + Sync
where
    K: Send + Sync + 'static,
{
    /// Fetch a fresh copy. Missing objects yield [`Error::NotFound`].
    async fn get(&self, key: &ReconcileRequest, cancel: &CancellationToken) -> Result<K>;

    /// Persist `obj`. A stale resourceVersion yields [`Error::Conflict`].
    async fn update(&self, obj: &K, cancel: &CancellationToken) -> Result<K>;
}

#[async_trait]
impl<K, S> ObjectStore<K> for Arc<S>
where
    K: Send + Sync + 'static,
    S: ObjectStore<K> + ?Sized,
{
    async fn get(&self, key: &ReconcileRequest, cancel: &CancellationToken) -> Result<K> {
        (**self).get(key, cancel).await
    }

    async fn update(&self, obj: &K, cancel: &CancellationToken) -> Result<K> {
        (**self).update(obj, cancel).await
    }
}

/// Source of resource mappings. One call returns everything currently served.
#[async_trait]
pub trait DiscoveryService: Send + Sync {
    async fn mappings(&self, cancel: &CancellationToken) -> Result<MappingTable>;
}

#[async_trait]
impl<D> DiscoveryService for Arc<D>
where
    D: DiscoveryService + ?Sized,
{
    async fn mappings(&self, cancel: &CancellationToken) -> Result<MappingTable> {
        (**self).mappings(cancel).await
    }
}

pub mod prelude {
    pub use super::{
        cancellable, DiscoveryService, Error, MappingEntry, MappingTable, ObjectStore, ReconcileRequest,
        ReconcileResult, Result, Scope, Settings,
    };
}
