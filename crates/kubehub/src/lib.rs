//! ctrlkit kubehub: discovery, rate-limited mapping cache and dynamic
//! resource routing on top of kube-rs.

#![forbid(unsafe_code)]

use std::fmt::Debug;

use async_trait::async_trait;
use ctrlkit_core::{cancellable, DiscoveryService, Error, MappingEntry, MappingTable, ObjectStore, ReconcileRequest, Result};
use kube::{
    api::{Api, PostParams},
    core::{ClusterResourceScope, NamespaceResourceScope},
    discovery::{Discovery, Scope as KubeScope},
    Client, Resource,
};
use serde::{de::DeserializeOwned, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::info;

mod discovery;
mod limiter;
mod router;

pub use discovery::DiscoveryCache;
pub use limiter::TokenBucket;
pub use router::{Binding, ResourceHandle, ResourceRouter, ResourceTarget};

pub async fn get_kube_client() -> Result<Client> {
    Client::try_default().await.map_err(Error::from)
}

/// Discovery over the API server's served groups (incl. CRDs), every version.
#[derive(Clone)]
pub struct KubeDiscovery {
    client: Client,
}

impl KubeDiscovery {
    pub fn new(client: Client) -> Self { Self { client } }
}

#[async_trait]
impl DiscoveryService for KubeDiscovery {
    async fn mappings(&self, cancel: &CancellationToken) -> Result<MappingTable> {
        let discovery = cancellable(cancel, async {
            Discovery::new(self.client.clone()).run().await.map_err(Error::from)
        })
        .await?;
        let mut entries = Vec::new();
        for group in discovery.groups() {
            for version in group.versions() {
                for (ar, caps) in group.versioned_resources(version) {
                    let scope = match caps.scope {
                        KubeScope::Namespaced => ctrlkit_core::Scope::Namespaced,
                        KubeScope::Cluster => ctrlkit_core::Scope::Cluster,
                    };
                    entries.push(MappingEntry { group: ar.group, version: ar.version, kind: ar.kind, plural: ar.plural, scope });
                }
            }
        }
        info!(count = entries.len(), "discovered resource mappings");
        Ok(entries.into_iter().collect())
    }
}

/// [`ObjectStore`] backed by typed kube `Api<K>` calls. Updates go through
/// `replace`, so a stale resourceVersion surfaces as a conflict.
pub struct KubeStore<K> {
    client: Client,
    scoped: fn(Client, Option<&str>) -> Api<K>,
}

impl<K> KubeStore<K>
where
    K: Resource<Scope = NamespaceResourceScope>,
    K::DynamicType: Default,
{
    pub fn namespaced(client: Client) -> Self {
        Self {
            client,
            scoped: |client, ns| match ns {
                Some(ns) => Api::namespaced(client, ns),
                None => Api::all(client),
            },
        }
    }
}

impl<K> KubeStore<K>
where
    K: Resource<Scope = ClusterResourceScope>,
    K::DynamicType: Default,
{
    pub fn cluster(client: Client) -> Self {
        Self { client, scoped: |client, _| Api::all(client) }
    }
}

#[async_trait]
impl<K> ObjectStore<K> for KubeStore<K>
where
    K: Resource + Clone + DeserializeOwned + Serialize + Debug + Send + Sync + 'static,
    K::DynamicType: Default,
{
    async fn get(&self, key: &ReconcileRequest, cancel: &CancellationToken) -> Result<K> {
        let api = (self.scoped)(self.client.clone(), key.namespace());
        cancellable(cancel, async { api.get(&key.name).await.map_err(Error::from) }).await
    }

    async fn update(&self, obj: &K, cancel: &CancellationToken) -> Result<K> {
        let meta = obj.meta();
        let name = meta.name.as_deref().ok_or_else(|| Error::Validation("object has no metadata.name".into()))?;
        let api = (self.scoped)(self.client.clone(), meta.namespace.as_deref());
        cancellable(cancel, async { api.replace(name, &PostParams::default(), obj).await.map_err(Error::from) }).await
    }
}
