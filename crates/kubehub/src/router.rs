use ctrlkit_core::{cancellable, gvk_key, gvk_of, DiscoveryService, Error, Result, Scope, Settings};
use futures::{stream::BoxStream, StreamExt, TryStreamExt};
use kube::{
    api::{Api, DeleteParams, ListParams, ObjectList, Patch, PatchParams, PostParams, WatchEvent, WatchParams},
    core::{ApiResource, DynamicObject},
    Client,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::{DiscoveryCache, TokenBucket};

/// Coordinates a handle is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Binding {
    Namespaced(String),
    Cluster,
}

/// Resolved endpoint for an object: the concrete resource plus its binding.
#[derive(Debug, Clone)]
pub struct ResourceTarget {
    pub resource: ApiResource,
    pub binding: Binding,
}

impl ResourceTarget {
    pub fn namespace(&self) -> Option<&str> {
        match &self.binding {
            Binding::Namespaced(ns) => Some(ns),
            Binding::Cluster => None,
        }
    }
}

/// Resolves schemaless objects to scope-aware resource endpoints.
pub struct ResourceRouter<D> {
    cache: DiscoveryCache<D>,
    limiter: TokenBucket,
}

impl<D: DiscoveryService> ResourceRouter<D> {
    pub fn new(source: D, settings: &Settings) -> Self {
        Self::with_limiter(source, TokenBucket::new(settings.discovery_burst, settings.discovery_refill))
    }

    pub fn with_limiter(source: D, limiter: TokenBucket) -> Self {
        Self { cache: DiscoveryCache::new(source), limiter }
    }

    pub fn cache(&self) -> &DiscoveryCache<D> { &self.cache }

    /// Work out where `obj` lives.
    ///
    /// Each call that wins a limiter token drops the discovery cache first, so
    /// newly registered kinds show up within a bounded window while re-discovery
    /// stays rate limited.
    pub async fn route(&self, obj: &DynamicObject, cancel: &CancellationToken) -> Result<ResourceTarget> {
        if self.limiter.allow() {
            self.cache.invalidate();
        }
        let gvk = gvk_of(obj.types.as_ref())?;
        let mapping = self.cache.lookup(&gvk, cancel).await?;
        let resource = ApiResource::from_gvk_with_plural(&gvk, &mapping.plural);
        let binding = match mapping.scope {
            Scope::Namespaced => match obj.metadata.namespace.as_deref() {
                Some(ns) if !ns.is_empty() => Binding::Namespaced(ns.to_string()),
                _ => {
                    return Err(Error::Validation(format!(
                        "namespace must be set on namespaced resource: {}",
                        gvk_key(&gvk.group, &gvk.version, &gvk.kind)
                    )))
                }
            },
            Scope::Cluster => Binding::Cluster,
        };
        trace!(plural = %resource.plural, ?binding, "routed");
        Ok(ResourceTarget { resource, binding })
    }

    pub async fn resolve(&self, client: &Client, obj: &DynamicObject, cancel: &CancellationToken) -> Result<ResourceHandle> {
        let target = self.route(obj, cancel).await?;
        Ok(ResourceHandle::new(client.clone(), target))
    }
}

/// Dynamic resource access bound either to a namespace or to the cluster.
/// Both bindings expose the same operations.
#[derive(Clone)]
pub struct ResourceHandle {
    api: Api<DynamicObject>,
    target: ResourceTarget,
}

impl ResourceHandle {
    pub fn new(client: Client, target: ResourceTarget) -> Self {
        let api = match &target.binding {
            Binding::Namespaced(ns) => Api::namespaced_with(client, ns, &target.resource),
            Binding::Cluster => Api::all_with(client, &target.resource),
        };
        Self { api, target }
    }

    pub fn target(&self) -> &ResourceTarget { &self.target }

    pub async fn get(&self, name: &str, cancel: &CancellationToken) -> Result<DynamicObject> {
        cancellable(cancel, async { self.api.get(name).await.map_err(Error::from) }).await
    }

    pub async fn list(&self, lp: &ListParams, cancel: &CancellationToken) -> Result<ObjectList<DynamicObject>> {
        cancellable(cancel, async { self.api.list(lp).await.map_err(Error::from) }).await
    }

    /// Start a watch from `version`. The returned stream ends when `cancel` fires.
    pub async fn watch<'a>(
        &'a self,
        wp: &'a WatchParams,
        version: &'a str,
        cancel: &'a CancellationToken,
    ) -> Result<BoxStream<'a, Result<WatchEvent<DynamicObject>>>> {
        let stream = cancellable(cancel, async { self.api.watch(wp, version).await.map_err(Error::from) }).await?;
        let stop = cancel.clone();
        Ok(stream.map_err(Error::from).take_until(async move { stop.cancelled().await }).boxed())
    }

    pub async fn create(&self, pp: &PostParams, obj: &DynamicObject, cancel: &CancellationToken) -> Result<DynamicObject> {
        cancellable(cancel, async { self.api.create(pp, obj).await.map_err(Error::from) }).await
    }

    pub async fn update(&self, pp: &PostParams, obj: &DynamicObject, cancel: &CancellationToken) -> Result<DynamicObject> {
        let name = obj.metadata.name.as_deref().ok_or_else(|| Error::Validation("object has no metadata.name".into()))?;
        cancellable(cancel, async { self.api.replace(name, pp, obj).await.map_err(Error::from) }).await
    }

    pub async fn patch<P: Serialize + std::fmt::Debug>(
        &self,
        name: &str,
        pp: &PatchParams,
        patch: &Patch<P>,
        cancel: &CancellationToken,
    ) -> Result<DynamicObject> {
        cancellable(cancel, async { self.api.patch(name, pp, patch).await.map_err(Error::from) }).await
    }

    pub async fn patch_status<P: Serialize + std::fmt::Debug>(
        &self,
        name: &str,
        pp: &PatchParams,
        patch: &Patch<P>,
        cancel: &CancellationToken,
    ) -> Result<DynamicObject> {
        cancellable(cancel, async { self.api.patch_status(name, pp, patch).await.map_err(Error::from) }).await
    }

    /// Delete by name. Returns the object while finalizers still hold it,
    /// `None` once it is gone.
    pub async fn delete(&self, name: &str, dp: &DeleteParams, cancel: &CancellationToken) -> Result<Option<DynamicObject>> {
        cancellable(cancel, async { self.api.delete(name, dp).await.map(|res| res.left()).map_err(Error::from) }).await
    }
}
