#![forbid(unsafe_code)]

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use ctrlkit_core::{BoxError, Error, FinalizerAction, ReconcileRequest, ReconcileResult};
use ctrlkit_reconcile::{has_finalizer, Finalize, MemoryStore, ReconcileEngine, Reconciler};
use k8s_openapi::api::core::v1::ConfigMap;
use tokio_util::sync::CancellationToken;

const FINALIZER: &str = "example.io/cleanup";

#[derive(Default)]
struct Recorder {
    reconciles: AtomicUsize,
    finalizes: AtomicUsize,
    /// finalize calls that fail before one succeeds
    finalize_failures: AtomicUsize,
    seen_finalizers: Mutex<Vec<Vec<String>>>,
    reconcile_error: Option<&'static str>,
    result: ReconcileResult,
}

#[async_trait]
impl Reconciler<ConfigMap> for Recorder {
    async fn reconcile(&self, obj: Arc<ConfigMap>, _cancel: &CancellationToken) -> Result<ReconcileResult, BoxError> {
        self.reconciles.fetch_add(1, Ordering::SeqCst);
        self.seen_finalizers.lock().unwrap().push(obj.metadata.finalizers.clone().unwrap_or_default());
        match self.reconcile_error {
            Some(msg) => Err(msg.into()),
            None => Ok(self.result),
        }
    }
}

/// Same bookkeeping, plus the cleanup capability.
#[derive(Default)]
struct Finalizing(Recorder);

#[async_trait]
impl Reconciler<ConfigMap> for Finalizing {
    async fn reconcile(&self, obj: Arc<ConfigMap>, cancel: &CancellationToken) -> Result<ReconcileResult, BoxError> {
        self.0.reconcile(obj, cancel).await
    }

    fn finalizer(&self) -> Option<&dyn Finalize<ConfigMap>> { Some(self) }
}

#[async_trait]
impl Finalize<ConfigMap> for Finalizing {
    async fn finalize(&self, _obj: Arc<ConfigMap>, _cancel: &CancellationToken) -> Result<(), BoxError> {
        self.0.finalizes.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .0
            .finalize_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err("backend unavailable".into());
        }
        Ok(())
    }
}

fn cm(name: &str, finalizers: &[&str]) -> ConfigMap {
    let mut cm = ConfigMap::default();
    cm.metadata.name = Some(name.into());
    cm.metadata.namespace = Some("demo".into());
    if !finalizers.is_empty() {
        cm.metadata.finalizers = Some(finalizers.iter().map(|f| f.to_string()).collect());
    }
    cm
}

fn key(name: &str) -> ReconcileRequest { ReconcileRequest::new("demo", name) }

#[tokio::test]
async fn missing_object_is_terminal_success() {
    let store = Arc::new(MemoryStore::<ConfigMap>::new());
    let engine = ReconcileEngine::new(FINALIZER, Arc::clone(&store), Recorder::default());
    let res = engine.reconcile(&key("ghost"), &CancellationToken::new()).await.unwrap();
    assert_eq!(res, ReconcileResult::done());
    assert_eq!(store.update_count(), 0);
    assert_eq!(engine.delegate().reconciles.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn live_object_gets_finalizer_before_delegate() {
    let store = Arc::new(MemoryStore::new());
    store.insert(cm("a", &[]));
    let delegate = Recorder { result: ReconcileResult::requeue_after(Duration::from_secs(30)), ..Default::default() };
    let engine = ReconcileEngine::new(FINALIZER, Arc::clone(&store), delegate);

    let res = engine.reconcile(&key("a"), &CancellationToken::new()).await.unwrap();
    assert_eq!(res, ReconcileResult::requeue_after(Duration::from_secs(30)));
    assert_eq!(store.update_count(), 1);
    assert!(has_finalizer(&store.peek(&key("a")).unwrap(), FINALIZER));
    // the delegate sees the persisted object
    assert_eq!(*engine.delegate().seen_finalizers.lock().unwrap(), vec![vec![FINALIZER.to_string()]]);
}

#[tokio::test]
async fn present_finalizer_means_no_write() {
    let store = Arc::new(MemoryStore::new());
    store.insert(cm("a", &["other", FINALIZER]));
    let engine = ReconcileEngine::new(FINALIZER, Arc::clone(&store), Recorder::default());
    let cancel = CancellationToken::new();
    for _ in 0..3 {
        engine.reconcile(&key("a"), &cancel).await.unwrap();
    }
    assert_eq!(store.update_count(), 0);
    assert_eq!(engine.delegate().reconciles.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn conflict_on_add_skips_delegate() {
    let store = Arc::new(MemoryStore::new());
    store.insert(cm("a", &[]));
    store.inject_conflicts(1);
    let engine = ReconcileEngine::new(FINALIZER, Arc::clone(&store), Recorder::default());

    let err = engine.reconcile(&key("a"), &CancellationToken::new()).await.unwrap_err();
    assert!(err.is_conflict());
    assert!(err.is_retryable());
    assert!(matches!(err, Error::FinalizerUpdate { action: FinalizerAction::Add, .. }));
    assert_eq!(engine.delegate().reconciles.load(Ordering::SeqCst), 0);

    // the scheduler's retry goes through
    engine.reconcile(&key("a"), &CancellationToken::new()).await.unwrap();
    assert_eq!(engine.delegate().reconciles.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn delegate_errors_pass_through_verbatim() {
    let store = Arc::new(MemoryStore::new());
    store.insert(cm("a", &[FINALIZER]));
    let delegate = Recorder { reconcile_error: Some("quota exceeded"), ..Default::default() };
    let engine = ReconcileEngine::new(FINALIZER, Arc::clone(&store), delegate);
    let err = engine.reconcile(&key("a"), &CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, Error::Delegate(_)));
    assert_eq!(err.to_string(), "quota exceeded");
}

#[tokio::test]
async fn failed_finalize_keeps_finalizer_and_is_retried() {
    let store = Arc::new(MemoryStore::new());
    store.insert(cm("a", &[FINALIZER]));
    assert!(store.delete(&key("a")));
    let delegate = Finalizing::default();
    delegate.0.finalize_failures.store(1, Ordering::SeqCst);
    let engine = ReconcileEngine::new(FINALIZER, Arc::clone(&store), delegate);
    let cancel = CancellationToken::new();

    let err = engine.reconcile(&key("a"), &cancel).await.unwrap_err();
    assert_eq!(err.to_string(), "backend unavailable");
    assert_eq!(store.update_count(), 0);
    assert!(has_finalizer(&store.peek(&key("a")).unwrap(), FINALIZER));

    let res = engine.reconcile(&key("a"), &cancel).await.unwrap();
    assert_eq!(res, ReconcileResult::done());
    assert_eq!(engine.delegate().0.finalizes.load(Ordering::SeqCst), 2);
    assert_eq!(store.update_count(), 1);
    // last finalizer gone -> the store let the object go
    assert!(store.peek(&key("a")).is_none());
    assert_eq!(engine.delegate().0.reconciles.load(Ordering::SeqCst), 0);

    let res = engine.reconcile(&key("a"), &cancel).await.unwrap();
    assert_eq!(res, ReconcileResult::done());
    assert_eq!(engine.delegate().0.finalizes.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn without_finalize_capability_the_finalizer_is_just_removed() {
    let store = Arc::new(MemoryStore::new());
    store.insert(cm("a", &["other", FINALIZER]));
    store.delete(&key("a"));
    let engine = ReconcileEngine::new(FINALIZER, Arc::clone(&store), Recorder::default());

    engine.reconcile(&key("a"), &CancellationToken::new()).await.unwrap();
    let left = store.peek(&key("a")).expect("still held by the other finalizer");
    assert_eq!(left.metadata.finalizers, Some(vec!["other".to_string()]));
    assert_eq!(store.update_count(), 1);
    assert_eq!(engine.delegate().reconciles.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn deleting_object_without_our_finalizer_needs_no_write() {
    let store = Arc::new(MemoryStore::new());
    store.insert(cm("a", &["other"]));
    store.delete(&key("a"));
    let engine = ReconcileEngine::new(FINALIZER, Arc::clone(&store), Finalizing::default());

    engine.reconcile(&key("a"), &CancellationToken::new()).await.unwrap();
    assert_eq!(engine.delegate().0.finalizes.load(Ordering::SeqCst), 1);
    assert_eq!(store.update_count(), 0);
}

#[tokio::test]
async fn conflict_on_remove_is_surfaced() {
    let store = Arc::new(MemoryStore::new());
    store.insert(cm("a", &[FINALIZER]));
    store.delete(&key("a"));
    store.inject_conflicts(1);
    let engine = ReconcileEngine::new(FINALIZER, Arc::clone(&store), Finalizing::default());

    let err = engine.reconcile(&key("a"), &CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, Error::FinalizerUpdate { action: FinalizerAction::Remove, .. }));
    assert!(err.is_conflict());
    assert!(has_finalizer(&store.peek(&key("a")).unwrap(), FINALIZER));
}

#[tokio::test]
async fn empty_finalizer_name_disables_bookkeeping() {
    let store = Arc::new(MemoryStore::new());
    store.insert(cm("a", &[]));
    let engine = ReconcileEngine::new("", Arc::clone(&store), Recorder::default());
    engine.reconcile(&key("a"), &CancellationToken::new()).await.unwrap();
    assert_eq!(store.update_count(), 0);
    assert_eq!(engine.delegate().reconciles.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn cancellation_aborts_before_any_work() {
    let store = Arc::new(MemoryStore::new());
    store.insert(cm("a", &[]));
    let engine = ReconcileEngine::new(FINALIZER, Arc::clone(&store), Recorder::default());
    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = engine.reconcile(&key("a"), &cancel).await.unwrap_err();
    assert!(matches!(err, Error::Cancelled));
    assert_eq!(store.update_count(), 0);
    assert_eq!(engine.delegate().reconciles.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn distinct_objects_reconcile_concurrently() {
    let store = Arc::new(MemoryStore::new());
    for i in 0..16 {
        store.insert(cm(&format!("obj-{}", i), &[]));
    }
    let engine = Arc::new(ReconcileEngine::new(FINALIZER, Arc::clone(&store), Recorder::default()));
    let cancel = CancellationToken::new();
    let tasks = (0..16).map(|i| {
        let engine = Arc::clone(&engine);
        let cancel = cancel.clone();
        tokio::spawn(async move { engine.reconcile(&key(&format!("obj-{}", i)), &cancel).await })
    });
    for res in futures::future::join_all(tasks).await {
        res.unwrap().unwrap();
    }
    assert_eq!(store.update_count(), 16);
    assert_eq!(engine.delegate().reconciles.load(Ordering::SeqCst), 16);
    for i in 0..16 {
        assert!(has_finalizer(&store.peek(&key(&format!("obj-{}", i))).unwrap(), FINALIZER));
    }
}
