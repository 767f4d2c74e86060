//! ctrlkit apply: builds server-side-apply patches and submits them.
//!
//! An apply patch claims ownership of every field it contains. Typed objects
//! serialize unset optional fields as `null` (or as empty maps once their
//! children are gone), which would claim fields the caller never set. Those are
//! pruned before the patch is sent. Schemaless objects are taken as-is.

#![forbid(unsafe_code)]

use std::{any::Any, sync::Arc};

use ctrlkit_core::{DiscoveryService, Error, Result, Settings};
use ctrlkit_kubehub::ResourceRouter;
use kube::{
    api::{Patch, PatchParams},
    core::DynamicObject,
    Client,
};
use metrics::{counter, histogram};
use serde::Serialize;
use serde_json::{Map, Value as Json};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod manifest;

pub use manifest::{decode_manifests, new_object};

/// Which half of an object an apply claims.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyPart {
    /// Desired state; `status` is dropped.
    Spec,
    /// Observed state via the status subresource; `spec` is dropped.
    Status,
}

/// Remove null values and emptied maps from every non-root map in `tree`.
///
/// Children are pruned before their parent decides whether to keep them, so a
/// map emptied by pruning disappears from its parent in turn. Sequence
/// elements are pruned internally but never removed.
pub fn prune(tree: &mut Json) {
    match tree {
        Json::Object(map) => prune_map(map),
        Json::Array(items) => items.iter_mut().for_each(prune),
        _ => {}
    }
}

fn prune_map(map: &mut Map<String, Json>) {
    map.retain(|_, value| {
        prune(value);
        !is_vacant(value)
    });
}

fn is_vacant(value: &Json) -> bool {
    match value {
        Json::Null => true,
        Json::Object(map) => map.is_empty(),
        _ => false,
    }
}

/// Convert `source` into a generic tree. Returns whether the source was
/// already schemaless (`serde_json::Value` or `DynamicObject`).
fn canonical_tree<K: Serialize + 'static>(source: &K) -> Result<(Json, bool)> {
    let any: &dyn Any = source;
    if let Some(tree) = any.downcast_ref::<Json>() {
        return Ok((tree.clone(), true));
    }
    if let Some(obj) = any.downcast_ref::<DynamicObject>() {
        return Ok((serde_json::to_value(obj)?, true));
    }
    Ok((serde_json::to_value(source)?, false))
}

/// Apply patch for `source`: schemaless sources are returned unchanged,
/// typed sources are serialized and pruned.
pub fn build_apply_patch<K: Serialize + 'static>(source: &K) -> Result<Json> {
    let (mut tree, schemaless) = canonical_tree(source)?;
    if !schemaless {
        prune(&mut tree);
    }
    Ok(tree)
}

/// Patch body for an Apply/ApplyStatus call: the other half of the object and
/// server bookkeeping are removed before pruning.
pub fn prepare_apply<K: Serialize + 'static>(source: &K, part: ApplyPart) -> Result<Json> {
    let (mut tree, schemaless) = canonical_tree(source)?;
    strip_bookkeeping(&mut tree, part);
    if !schemaless {
        prune(&mut tree);
    }
    Ok(tree)
}

fn strip_bookkeeping(tree: &mut Json, part: ApplyPart) {
    let Some(obj) = tree.as_object_mut() else { return };
    match part {
        ApplyPart::Spec => obj.remove("status"),
        ApplyPart::Status => obj.remove("spec"),
    };
    if let Some(meta) = obj.get_mut("metadata").and_then(Json::as_object_mut) {
        meta.remove("resourceVersion");
        meta.remove("managedFields");
    }
}

/// Submits apply patches through a [`ResourceRouter`].
pub struct Applier<D> {
    client: Client,
    router: Arc<ResourceRouter<D>>,
    field_manager: String,
    force: bool,
}

impl<D: DiscoveryService> Applier<D> {
    pub fn new(client: Client, router: Arc<ResourceRouter<D>>, settings: &Settings) -> Self {
        Self { client, router, field_manager: settings.field_manager.clone(), force: settings.force_apply }
    }

    pub fn field_manager(mut self, name: impl Into<String>) -> Self {
        self.field_manager = name.into();
        self
    }

    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Server-side apply of the desired state of `obj`.
    pub async fn apply<K: Serialize + 'static>(&self, obj: &K, cancel: &CancellationToken) -> Result<DynamicObject> {
        self.submit(obj, ApplyPart::Spec, cancel).await
    }

    /// Server-side apply of `obj`'s status through the status subresource.
    pub async fn apply_status<K: Serialize + 'static>(&self, obj: &K, cancel: &CancellationToken) -> Result<DynamicObject> {
        self.submit(obj, ApplyPart::Status, cancel).await
    }

    async fn submit<K: Serialize + 'static>(&self, obj: &K, part: ApplyPart, cancel: &CancellationToken) -> Result<DynamicObject> {
        let t0 = std::time::Instant::now();
        counter!("apply_attempts", 1u64);
        let patch = prepare_apply(obj, part)?;
        let target: DynamicObject = serde_json::from_value(patch.clone())?;
        let name = target
            .metadata
            .name
            .clone()
            .ok_or_else(|| Error::Validation("object has no metadata.name".into()))?;
        let handle = self.router.resolve(&self.client, &target, cancel).await?;

        let mut pp = PatchParams::apply(&self.field_manager);
        if self.force {
            pp = pp.force();
        }
        let res = match part {
            ApplyPart::Spec => handle.patch(&name, &pp, &Patch::Apply(&patch), cancel).await,
            ApplyPart::Status => handle.patch_status(&name, &pp, &Patch::Apply(&patch), cancel).await,
        };
        match res {
            Ok(applied) => {
                histogram!("apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
                counter!("apply_ok", 1u64);
                info!(
                    name = %name,
                    ns = ?handle.target().namespace(),
                    resource = %handle.target().resource.plural,
                    ?part,
                    rv = ?applied.metadata.resource_version,
                    "applied"
                );
                Ok(applied)
            }
            Err(e) => {
                counter!("apply_err", 1u64);
                warn!(name = %name, ?part, error = %e, "server-side apply failed");
                Err(e)
            }
        }
    }
}
