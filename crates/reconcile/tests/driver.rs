#![forbid(unsafe_code)]

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use ctrlkit_core::{BoxError, Error, ReconcileRequest, ReconcileResult, Settings};
use ctrlkit_predicates::{label_changed, EventGate};
use ctrlkit_reconcile::{has_finalizer, Driver, MemoryStore, ReconcileEngine, Reconciler};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::runtime::controller::Action;
use tokio_util::sync::CancellationToken;

const FINALIZER: &str = "example.io/cleanup";

struct Counting {
    calls: AtomicUsize,
    result: ReconcileResult,
}

impl Counting {
    fn returning(result: ReconcileResult) -> Self { Self { calls: AtomicUsize::new(0), result } }
    fn calls(&self) -> usize { self.calls.load(Ordering::SeqCst) }
}

#[async_trait]
impl Reconciler<ConfigMap> for Counting {
    async fn reconcile(&self, _obj: Arc<ConfigMap>, _cancel: &CancellationToken) -> Result<ReconcileResult, BoxError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.result)
    }
}

type Engine = ReconcileEngine<ConfigMap, Arc<MemoryStore<ConfigMap>>, Counting>;

fn cm(team: &str, finalizers: &[&str]) -> ConfigMap {
    let mut cm = ConfigMap::default();
    cm.metadata.name = Some("a".into());
    cm.metadata.namespace = Some("ns".into());
    cm.metadata.labels = Some([("team".to_string(), team.to_string())].into_iter().collect());
    if !finalizers.is_empty() {
        cm.metadata.finalizers = Some(finalizers.iter().map(|f| f.to_string()).collect());
    }
    cm
}

fn key() -> ReconcileRequest { ReconcileRequest::new("ns", "a") }

fn settings(requeue_secs: u64) -> Settings {
    Settings { requeue_after: Duration::from_secs(requeue_secs), ..Settings::default() }
}

fn gated(store: &Arc<MemoryStore<ConfigMap>>, delegate: Counting, requeue_secs: u64) -> (Arc<Engine>, Driver<ConfigMap, Arc<MemoryStore<ConfigMap>>, Counting>) {
    let engine = Arc::new(ReconcileEngine::new(FINALIZER, Arc::clone(store), delegate));
    let driver = Driver::new(Arc::clone(&engine), &settings(requeue_secs), CancellationToken::new())
        .with_gate(EventGate::new(label_changed::<ConfigMap>("team")));
    (engine, driver)
}

#[tokio::test]
async fn conflict_retry_of_admitted_version_reaches_the_engine() {
    let store = Arc::new(MemoryStore::new());
    let first = store.insert(cm("a", &[]));
    let (engine, driver) = gated(&store, Counting::returning(ReconcileResult::done()), 5);

    // first sighting is a create, which label_changed filters
    assert_eq!(driver.tick(&first).await.unwrap(), Action::await_change());
    assert_eq!(store.update_count(), 0);

    let relabelled = store.insert(cm("b", &[]));
    store.inject_conflicts(1);
    let err = driver.tick(&relabelled).await.unwrap_err();
    assert!(err.is_conflict());
    assert_eq!(driver.on_error(&err), Action::requeue(Duration::from_secs(5)));
    assert_eq!(engine.delegate().calls(), 0);

    // the scheduler retries with the very same object
    assert_eq!(driver.tick(&relabelled).await.unwrap(), Action::await_change());
    assert_eq!(engine.delegate().calls(), 1);
    assert!(has_finalizer(&store.peek(&key()).unwrap(), FINALIZER));
}

#[tokio::test]
async fn delegate_requeues_are_not_filtered() {
    let store = Arc::new(MemoryStore::new());
    store.insert(cm("a", &[FINALIZER]));
    let wait = Duration::from_secs(30);
    let (engine, driver) = gated(&store, Counting::returning(ReconcileResult::requeue_after(wait)), 5);

    driver.tick(&store.peek(&key()).unwrap()).await.unwrap();
    let relabelled = store.insert(cm("b", &[FINALIZER]));
    for round in 1..=3 {
        assert_eq!(driver.tick(&relabelled).await.unwrap(), Action::requeue(wait));
        assert_eq!(engine.delegate().calls(), round);
    }
    assert_eq!(store.update_count(), 0);
}

#[tokio::test]
async fn bare_requeue_uses_the_configured_delay() {
    let store = Arc::new(MemoryStore::new());
    let obj = store.insert(cm("a", &[FINALIZER]));
    let engine = Arc::new(ReconcileEngine::new(FINALIZER, Arc::clone(&store), Counting::returning(ReconcileResult::requeue())));
    let driver = Driver::new(engine, &settings(7), CancellationToken::new());
    assert_eq!(driver.tick(&obj).await.unwrap(), Action::requeue(Duration::from_secs(7)));
    assert!(driver.gate().is_none());
}

#[tokio::test]
async fn unchanged_newer_version_is_filtered() {
    let store = Arc::new(MemoryStore::new());
    store.insert(cm("a", &[FINALIZER]));
    let (engine, driver) = gated(&store, Counting::returning(ReconcileResult::done()), 5);

    driver.tick(&store.peek(&key()).unwrap()).await.unwrap();
    let mut touched = cm("a", &[FINALIZER]);
    touched.data = Some([("k".to_string(), "v".to_string())].into_iter().collect());
    let touched = store.insert(touched);
    assert_eq!(driver.tick(&touched).await.unwrap(), Action::await_change());
    assert_eq!(engine.delegate().calls(), 0);
}

#[tokio::test]
async fn deleting_objects_bypass_the_gate_and_are_forgotten() {
    let store = Arc::new(MemoryStore::new());
    store.insert(cm("a", &[FINALIZER]));
    let (engine, driver) = gated(&store, Counting::returning(ReconcileResult::done()), 5);

    driver.tick(&store.peek(&key()).unwrap()).await.unwrap();
    assert_eq!(driver.gate().map(|g| g.len()), Some(1));

    store.delete(&key());
    let deleting = store.peek(&key()).unwrap();
    assert_eq!(driver.tick(&deleting).await.unwrap(), Action::await_change());
    assert!(store.peek(&key()).is_none());
    assert_eq!(store.update_count(), 1);
    assert_eq!(engine.delegate().calls(), 0);
    assert_eq!(driver.gate().map(|g| g.is_empty()), Some(true));
}

#[tokio::test]
async fn error_policy_follows_retryability() {
    let store = Arc::new(MemoryStore::<ConfigMap>::new());
    let (_engine, driver) = gated(&store, Counting::returning(ReconcileResult::done()), 5);
    let later = Action::requeue(Duration::from_secs(5));

    assert_eq!(driver.on_error(&Error::Conflict("stale".into())), later);
    assert_eq!(driver.on_error(&Error::Cancelled), later);
    assert_eq!(driver.on_error(&Error::delegate("backend unavailable")), later);
    assert_eq!(driver.on_error(&Error::Validation("bad".into())), Action::await_change());
    let mapping = Error::Mapping { group: "example.io".into(), version: "v1".into(), kind: "Widget".into() };
    assert_eq!(driver.on_error(&mapping), Action::await_change());
}
