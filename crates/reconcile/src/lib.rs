//! ctrlkit reconcile: a generic, finalizer-aware reconcile loop.
//!
//! [`ReconcileEngine`] fetches the object named by a [`ReconcileRequest`],
//! keeps the configured finalizer on live objects, runs the delegate's
//! [`Finalize`] step on objects being deleted, and hands everything else to
//! the delegate's [`Reconciler::reconcile`]. It keeps no state between calls
//! and does not retry; retry policy belongs to whoever schedules requests.

#![forbid(unsafe_code)]

use std::{fmt::Debug, marker::PhantomData, sync::Arc};

use async_trait::async_trait;
use ctrlkit_core::{BoxError, Error, FinalizerAction, ObjectStore, ReconcileRequest, ReconcileResult, Result};
use kube::Resource;
use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

mod memory;
mod runtime;

pub use memory::MemoryStore;
pub use runtime::{run_controller, to_action, Driver};

/// Business logic supplied by the controller author.
#[async_trait]
pub trait Reconciler<K>: Send + Sync
where
    K: Send + Sync + 'static,
{
    async fn reconcile(&self, obj: Arc<K>, cancel: &CancellationToken) -> Result<ReconcileResult, BoxError>;

    /// Cleanup capability. Delegates that need to run logic before their
    /// objects go away return `Some(self)`.
    fn finalizer(&self) -> Option<&dyn Finalize<K>> { None }
}

/// Cleanup run while an object is being deleted. May run more than once for
/// the same object, so it has to be safe to repeat.
#[async_trait]
pub trait Finalize<K>: Send + Sync
where
    K: Send + Sync + 'static,
{
    async fn finalize(&self, obj: Arc<K>, cancel: &CancellationToken) -> Result<(), BoxError>;
}

pub fn has_finalizer<K: Resource>(obj: &K, name: &str) -> bool {
    obj.meta().finalizers.as_ref().is_some_and(|f| f.iter().any(|x| x == name))
}

/// Add `name` unless present. Returns whether the set changed.
pub fn add_finalizer<K: Resource>(obj: &mut K, name: &str) -> bool {
    if name.is_empty() || has_finalizer(obj, name) {
        return false;
    }
    obj.meta_mut().finalizers.get_or_insert_with(Vec::new).push(name.to_string());
    true
}

/// Remove `name` if present. Returns whether the set changed.
pub fn remove_finalizer<K: Resource>(obj: &mut K, name: &str) -> bool {
    if name.is_empty() {
        return false;
    }
    match obj.meta_mut().finalizers.as_mut() {
        Some(finalizers) => {
            let before = finalizers.len();
            finalizers.retain(|f| f != name);
            finalizers.len() != before
        }
        None => false,
    }
}

pub struct ReconcileEngine<K, S, R> {
    finalizer: String,
    store: S,
    delegate: R,
    _kind: PhantomData<fn() -> K>,
}

impl<K, S, R> ReconcileEngine<K, S, R>
where
    K: Resource + Clone + Debug + Send + Sync + 'static,
    S: ObjectStore<K>,
    R: Reconciler<K>,
{
    /// An empty `finalizer` disables finalizer bookkeeping.
    pub fn new(finalizer: impl Into<String>, store: S, delegate: R) -> Self {
        Self { finalizer: finalizer.into(), store, delegate, _kind: PhantomData }
    }

    pub fn finalizer(&self) -> &str { &self.finalizer }
    pub fn store(&self) -> &S { &self.store }
    pub fn delegate(&self) -> &R { &self.delegate }

    #[instrument(skip(self, cancel), fields(object = %req))]
    pub async fn reconcile(&self, req: &ReconcileRequest, cancel: &CancellationToken) -> Result<ReconcileResult> {
        counter!("reconcile_total", 1u64);
        let res = self.run(req, cancel).await;
        if res.is_err() {
            counter!("reconcile_errors_total", 1u64);
        }
        res
    }

    async fn run(&self, req: &ReconcileRequest, cancel: &CancellationToken) -> Result<ReconcileResult> {
        let obj = match self.store.get(req, cancel).await {
            Ok(obj) => obj,
            Err(e) if e.is_not_found() => {
                debug!("object gone; nothing to do");
                return Ok(ReconcileResult::done());
            }
            Err(e) => return Err(e),
        };

        if obj.meta().deletion_timestamp.is_none() {
            let obj = self.ensure_finalizer(obj, req, cancel).await?;
            return self.delegate.reconcile(Arc::new(obj), cancel).await.map_err(Error::Delegate);
        }

        let obj = Arc::new(obj);
        if let Some(finalizer) = self.delegate.finalizer() {
            if let Err(e) = finalizer.finalize(Arc::clone(&obj), cancel).await {
                warn!(error = %e, "finalize failed; keeping finalizer");
                return Err(Error::Delegate(e));
            }
        }
        let mut obj = Arc::try_unwrap(obj).unwrap_or_else(|shared| (*shared).clone());
        if remove_finalizer(&mut obj, &self.finalizer) {
            self.persist(&obj, FinalizerAction::Remove, req, cancel).await?;
            info!(finalizer = %self.finalizer, "finalizer removed");
        }
        Ok(ReconcileResult::done())
    }

    async fn ensure_finalizer(&self, mut obj: K, req: &ReconcileRequest, cancel: &CancellationToken) -> Result<K> {
        if !add_finalizer(&mut obj, &self.finalizer) {
            return Ok(obj);
        }
        let updated = self.persist(&obj, FinalizerAction::Add, req, cancel).await?;
        info!(finalizer = %self.finalizer, "finalizer added");
        Ok(updated)
    }

    async fn persist(&self, obj: &K, action: FinalizerAction, req: &ReconcileRequest, cancel: &CancellationToken) -> Result<K> {
        counter!("finalizer_updates_total", 1u64);
        self.store.update(obj, cancel).await.map_err(|source| match source {
            Error::Cancelled => Error::Cancelled,
            source => Error::FinalizerUpdate { action, key: req.to_string(), source: Box::new(source) },
        })
    }
}
