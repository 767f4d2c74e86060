use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use arc_swap::ArcSwapOption;
use ctrlkit_core::{cancellable, DiscoveryService, Error, MappingEntry, MappingTable, Result};
use kube::core::GroupVersionKind;
use metrics::{counter, histogram};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Process-local cache of resource mappings.
///
/// The table is swapped in whole on refresh and dropped whole on
/// [`invalidate`](Self::invalidate). Concurrent misses share one refresh.
pub struct DiscoveryCache<D> {
    source: D,
    table: ArcSwapOption<MappingTable>,
    generation: AtomicU64,
    refresh: Mutex<()>,
}

impl<D: DiscoveryService> DiscoveryCache<D> {
    pub fn new(source: D) -> Self {
        Self { source, table: ArcSwapOption::empty(), generation: AtomicU64::new(0), refresh: Mutex::new(()) }
    }

    /// Drop the current table; the next lookup refreshes.
    pub fn invalidate(&self) {
        if self.table.swap(None).is_some() {
            counter!("discovery_invalidations_total", 1u64);
            debug!("discovery cache invalidated");
        }
    }

    /// Whether a table is loaded.
    pub fn fresh(&self) -> bool { self.table.load().is_some() }

    pub fn snapshot(&self) -> Option<Arc<MappingTable>> { self.table.load_full() }

    /// Number of completed refreshes.
    pub fn generation(&self) -> u64 { self.generation.load(Ordering::Acquire) }

    /// Unconditionally fetch a new table.
    pub async fn refresh(&self, cancel: &CancellationToken) -> Result<Arc<MappingTable>> {
        let _guard = cancellable(cancel, async { Ok(self.refresh.lock().await) }).await?;
        self.fetch_locked(cancel).await
    }

    /// Mapping for `gvk`, refreshing once if the cache is empty or lacks it.
    pub async fn lookup(&self, gvk: &GroupVersionKind, cancel: &CancellationToken) -> Result<MappingEntry> {
        let seen = self.generation();
        if let Some(table) = self.table.load_full() {
            if let Some(entry) = table.get(gvk) {
                return Ok(entry.clone());
            }
        }

        let _guard = cancellable(cancel, async { Ok(self.refresh.lock().await) }).await?;
        // someone refreshed while we waited
        if self.generation() != seen {
            if let Some(table) = self.table.load_full() {
                return table.get(gvk).cloned().ok_or_else(|| not_mapped(gvk));
            }
        }
        let table = self.fetch_locked(cancel).await?;
        table.get(gvk).cloned().ok_or_else(|| not_mapped(gvk))
    }

    async fn fetch_locked(&self, cancel: &CancellationToken) -> Result<Arc<MappingTable>> {
        let t0 = std::time::Instant::now();
        let table = Arc::new(cancellable(cancel, self.source.mappings(cancel)).await?);
        self.table.store(Some(Arc::clone(&table)));
        self.generation.fetch_add(1, Ordering::AcqRel);
        counter!("discovery_refresh_total", 1u64);
        histogram!("discovery_refresh_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        debug!(entries = table.len(), "discovery cache refreshed");
        Ok(table)
    }
}

fn not_mapped(gvk: &GroupVersionKind) -> Error {
    Error::Mapping { group: gvk.group.clone(), version: gvk.version.clone(), kind: gvk.kind.clone() }
}
