//! ctrlkit api: the client handed to controller code.
//!
//! [`ControllerClient`] bundles a kube [`Client`] with one shared
//! [`ResourceRouter`], so every dynamic call and every apply made through it
//! draws on the same discovery cache and re-discovery budget.

#![forbid(unsafe_code)]

use std::{fmt::Debug, hash::Hash, sync::Arc, time::Instant};

use ctrlkit_apply::{decode_manifests, Applier};
use ctrlkit_core::{Result, Settings};
use ctrlkit_kubehub::{get_kube_client, KubeDiscovery, KubeStore, ResourceHandle, ResourceRouter};
use ctrlkit_predicates::EventGate;
use ctrlkit_reconcile::{run_controller, Driver, ReconcileEngine, Reconciler};
use kube::{
    core::{ClusterResourceScope, DynamicObject, NamespaceResourceScope},
    Api, Client, Resource,
};
use metrics::histogram;
use serde::{de::DeserializeOwned, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::info;

pub use ctrlkit_core::prelude;

pub struct ControllerClient {
    client: Client,
    router: Arc<ResourceRouter<KubeDiscovery>>,
    applier: Applier<KubeDiscovery>,
    settings: Settings,
}

impl ControllerClient {
    /// Connect using the ambient kubeconfig or in-cluster environment.
    pub async fn try_default(settings: Settings) -> Result<Self> {
        let client = get_kube_client().await?;
        Ok(Self::new(client, settings))
    }

    pub fn new(client: Client, settings: Settings) -> Self {
        let router = Arc::new(ResourceRouter::new(KubeDiscovery::new(client.clone()), &settings));
        let applier = Applier::new(client.clone(), Arc::clone(&router), &settings);
        Self { client, router, applier, settings }
    }

    /// Override the apply field manager and force flag taken from settings.
    pub fn with_apply_options(mut self, field_manager: impl Into<String>, force: bool) -> Self {
        self.applier = self.applier.field_manager(field_manager).force(force);
        self
    }

    pub fn kube(&self) -> &Client { &self.client }
    pub fn settings(&self) -> &Settings { &self.settings }
    pub fn router(&self) -> &ResourceRouter<KubeDiscovery> { &self.router }
    pub fn applier(&self) -> &Applier<KubeDiscovery> { &self.applier }

    /// Dynamic handle for the resource `obj` belongs to.
    pub async fn dynamic(&self, obj: &DynamicObject, cancel: &CancellationToken) -> Result<ResourceHandle> {
        self.router.resolve(&self.client, obj, cancel).await
    }

    pub async fn apply<K: Serialize + 'static>(&self, obj: &K, cancel: &CancellationToken) -> Result<DynamicObject> {
        self.applier.apply(obj, cancel).await
    }

    pub async fn apply_status<K: Serialize + 'static>(&self, obj: &K, cancel: &CancellationToken) -> Result<DynamicObject> {
        self.applier.apply_status(obj, cancel).await
    }

    /// Apply every document of a multi-document YAML payload, in order.
    /// Stops at the first failure.
    pub async fn apply_manifests(&self, yaml: &str, cancel: &CancellationToken) -> Result<Vec<DynamicObject>> {
        let t0 = Instant::now();
        let docs = decode_manifests(yaml, self.settings.max_yaml_bytes)?;
        let mut applied = Vec::with_capacity(docs.len());
        for doc in &docs {
            applied.push(self.applier.apply(doc, cancel).await?);
        }
        histogram!("apply_manifests_ms", t0.elapsed().as_secs_f64() * 1000.0);
        info!(docs = applied.len(), took_ms = %t0.elapsed().as_millis(), "manifests applied");
        Ok(applied)
    }

    pub fn namespaced_store<K>(&self) -> KubeStore<K>
    where
        K: Resource<Scope = NamespaceResourceScope>,
        K::DynamicType: Default,
    {
        KubeStore::namespaced(self.client.clone())
    }

    pub fn cluster_store<K>(&self) -> KubeStore<K>
    where
        K: Resource<Scope = ClusterResourceScope>,
        K::DynamicType: Default,
    {
        KubeStore::cluster(self.client.clone())
    }

    /// Engine over a namespaced kind, reading and writing through this client.
    pub fn engine<K, R>(&self, finalizer: impl Into<String>, delegate: R) -> ReconcileEngine<K, KubeStore<K>, R>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Serialize + Debug + Send + Sync + 'static,
        K::DynamicType: Default,
        R: Reconciler<K>,
    {
        ReconcileEngine::new(finalizer, self.namespaced_store(), delegate)
    }

    /// Watch `api` and feed every change through `engine` until `cancel`
    /// fires.
    pub async fn run<K, R>(
        &self,
        api: Api<K>,
        engine: ReconcileEngine<K, KubeStore<K>, R>,
        gate: Option<EventGate<K>>,
        cancel: CancellationToken,
    ) where
        K: Resource + Clone + DeserializeOwned + Serialize + Debug + Send + Sync + 'static,
        K::DynamicType: Eq + Hash + Clone + Default + Debug + Unpin,
        R: Reconciler<K> + 'static,
    {
        let mut driver = Driver::new(Arc::new(engine), &self.settings, cancel);
        if let Some(gate) = gate {
            driver = driver.with_gate(gate);
        }
        run_controller(api, driver).await;
    }
}
