use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use async_trait::async_trait;
use ctrlkit_core::{BoxError, ReconcileResult};
use ctrlkit_reconcile::{Finalize, Reconciler};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::ResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Logs every ConfigMap it sees and lets the engine hold a finalizer on it
/// until the deletion has been observed.
#[derive(Default)]
pub struct Guard {
    guarded: AtomicU64,
    released: AtomicU64,
}

impl Guard {
    pub fn guarded(&self) -> u64 { self.guarded.load(Ordering::Relaxed) }
    pub fn released(&self) -> u64 { self.released.load(Ordering::Relaxed) }
}

#[async_trait]
impl Reconciler<ConfigMap> for Guard {
    async fn reconcile(&self, obj: Arc<ConfigMap>, _cancel: &CancellationToken) -> Result<ReconcileResult, BoxError> {
        let n = self.guarded.fetch_add(1, Ordering::Relaxed) + 1;
        let keys = obj.data.as_ref().map_or(0, |d| d.len());
        info!(name = %obj.name_any(), ns = ?obj.namespace(), keys, total = n, "guarding");
        Ok(ReconcileResult::done())
    }

    fn finalizer(&self) -> Option<&dyn Finalize<ConfigMap>> { Some(self) }
}

#[async_trait]
impl Finalize<ConfigMap> for Guard {
    async fn finalize(&self, obj: Arc<ConfigMap>, _cancel: &CancellationToken) -> Result<(), BoxError> {
        self.released.fetch_add(1, Ordering::Relaxed);
        info!(name = %obj.name_any(), ns = ?obj.namespace(), "releasing");
        Ok(())
    }
}
