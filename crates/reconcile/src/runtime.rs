use std::{fmt::Debug, hash::Hash, sync::Arc, time::Duration};

use ctrlkit_core::{Error, ObjectStore, ReconcileRequest, ReconcileResult, Result, Settings};
use ctrlkit_predicates::EventGate;
use futures::StreamExt;
use kube::{
    runtime::{controller::Action, watcher, Controller},
    Api, Resource, ResourceExt,
};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{ReconcileEngine, Reconciler};

/// Translate an engine result into a kube-runtime action. A bare requeue
/// waits `fallback`.
pub fn to_action(res: ReconcileResult, fallback: Duration) -> Action {
    match (res.requeue, res.requeue_after) {
        (_, Some(after)) => Action::requeue(after),
        (true, None) => Action::requeue(fallback),
        (false, None) => Action::await_change(),
    }
}

/// Shared state handed to every kube-runtime reconcile call.
pub struct Driver<K, S, R> {
    engine: Arc<ReconcileEngine<K, S, R>>,
    gate: Option<EventGate<K>>,
    requeue_after: Duration,
    cancel: CancellationToken,
}

impl<K, S, R> Driver<K, S, R>
where
    K: Resource + Clone + Debug + Send + Sync + 'static,
    S: ObjectStore<K>,
    R: Reconciler<K>,
{
    pub fn new(engine: Arc<ReconcileEngine<K, S, R>>, settings: &Settings, cancel: CancellationToken) -> Self {
        Self { engine, gate: None, requeue_after: settings.requeue_after, cancel }
    }

    /// Only reconcile live objects the gate admits. Objects being deleted
    /// always pass so finalizers are never stranded.
    pub fn with_gate(mut self, gate: EventGate<K>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn gate(&self) -> Option<&EventGate<K>> { self.gate.as_ref() }

    /// One scheduler tick for `obj`. Retries and requeues deliver the same
    /// resourceVersion again, which the gate admits exactly as before.
    pub async fn tick(&self, obj: &K) -> Result<Action> {
        let req = ReconcileRequest::new(obj.namespace().unwrap_or_default(), obj.name_any());
        if let Some(gate) = &self.gate {
            let key = req.to_string();
            if obj.meta().deletion_timestamp.is_some() {
                gate.forget(&key, obj);
            } else if !gate.admit(&key, obj) {
                debug!(object = %req, "filtered out");
                return Ok(Action::await_change());
            }
        }
        let res = self.engine.reconcile(&req, &self.cancel).await?;
        Ok(to_action(res, self.requeue_after))
    }

    /// Error policy: retryable failures come back after `requeue_after`,
    /// the rest wait for the object to change.
    pub fn on_error(&self, err: &Error) -> Action {
        if err.is_retryable() {
            Action::requeue(self.requeue_after)
        } else {
            Action::await_change()
        }
    }
}

/// Drive `driver` from a kube-runtime [`Controller`] watching `api` until the
/// driver's cancellation token fires.
pub async fn run_controller<K, S, R>(api: Api<K>, driver: Driver<K, S, R>)
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Eq + Hash + Clone + Default + Debug + Unpin,
    S: ObjectStore<K> + 'static,
    R: Reconciler<K> + 'static,
{
    let shutdown = driver.cancel.clone();
    let driver = Arc::new(driver);
    info!(kind = %K::kind(&K::DynamicType::default()), "controller starting");
    Controller::new(api, watcher::Config::default())
        .run(
            |obj: Arc<K>, driver: Arc<Driver<K, S, R>>| async move { driver.tick(&obj).await },
            |_obj: Arc<K>, err: &Error, driver: Arc<Driver<K, S, R>>| driver.on_error(err),
            driver,
        )
        .take_until(shutdown.cancelled())
        .for_each(|res| async move {
            match res {
                Ok((obj, action)) => debug!(object = %obj, ?action, "reconciled"),
                Err(e) => warn!(error = %e, "reconcile failed"),
            }
        })
        .await;
    info!("controller stopped");
}
