use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use tokio::sync::Notify;

use wsgate_core::{ApiGraph, Deployment, DeploymentId, EndpointContext, GatewayConfig};
use wsgate_deploy::{
    ConflictPolicy, ControlError, ControlResult, ControlSurface, Dependency, GraphSource,
    LifecycleEvent, ReconcileError, ReconcileErrorKind, ReconcileOutcome, ReconcilePhase,
    Reconciler, settle,
};
use wsgate_state::StateStore;

const API: &str = "Chat";
const STAGE: &str = "test";

/// StateStore wrapper that can fail binds, hold binds open, or serve a
/// different graph than the one stored.
struct Scripted {
    store: StateStore,
    failing_binds: AtomicU32,
    creates: AtomicU32,
    graph_override: StdMutex<Option<ApiGraph>>,
    entered: Notify,
    gate: Option<Notify>,
}

impl Scripted {
    fn new(store: StateStore) -> Self {
        Self {
            store,
            failing_binds: AtomicU32::new(0),
            creates: AtomicU32::new(0),
            graph_override: StdMutex::new(None),
            entered: Notify::new(),
            gate: None,
        }
    }

    fn gated(store: StateStore) -> Self {
        Self {
            gate: Some(Notify::new()),
            ..Self::new(store)
        }
    }

    fn fail_next_binds(&self, n: u32) {
        self.failing_binds.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl ControlSurface for Scripted {
    async fn create_deployment(
        &self,
        api_id: &str,
        stage_name: &str,
        description: &str,
    ) -> ControlResult<DeploymentId> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        ControlSurface::create_deployment(&self.store, api_id, stage_name, description).await
    }

    async fn bind_stage(
        &self,
        api_id: &str,
        stage_name: &str,
        deployment_id: &str,
    ) -> ControlResult<Option<DeploymentId>> {
        if let Some(gate) = &self.gate {
            self.entered.notify_one();
            gate.notified().await;
        }
        let failing = self.failing_binds.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_binds.store(failing - 1, Ordering::SeqCst);
            return Err(ControlError::Unavailable("bind timed out".to_string()));
        }
        ControlSurface::bind_stage(&self.store, api_id, stage_name, deployment_id).await
    }

    async fn describe_stage(
        &self,
        api_id: &str,
        stage_name: &str,
    ) -> ControlResult<Option<DeploymentId>> {
        self.store.describe_stage(api_id, stage_name).await
    }

    async fn describe_deployment(
        &self,
        api_id: &str,
        deployment_id: &str,
    ) -> ControlResult<Deployment> {
        self.store.describe_deployment(api_id, deployment_id).await
    }
}

#[async_trait]
impl GraphSource for Scripted {
    async fn load_graph(&self, api_id: &str) -> ControlResult<ApiGraph> {
        let override_graph = self.graph_override.lock().unwrap().clone();
        match override_graph {
            Some(graph) => Ok(graph),
            None => self.store.load_graph(api_id).await,
        }
    }
}

fn settled_store() -> StateStore {
    let store = StateStore::open_in_memory().unwrap();
    settle(&store, &GatewayConfig::scaffold(API, STAGE)).unwrap();
    store
}

fn context() -> EndpointContext {
    EndpointContext::new("eu-west-1", "123456789012")
}

fn reconciler(control: Scripted) -> Reconciler<Scripted> {
    Reconciler::new(Arc::new(control), context())
}

fn bound(store: &StateStore) -> Option<DeploymentId> {
    store.get_stage(API, STAGE).unwrap().unwrap().deployment_id
}

#[tokio::test]
async fn create_snapshots_and_binds() {
    let store = settled_store();
    let rec = reconciler(Scripted::new(store.clone()));

    let outcome = rec
        .reconcile(LifecycleEvent::Create, API, STAGE, "initial")
        .await
        .unwrap();
    let ReconcileOutcome::Deployed(info) = &outcome else {
        panic!("expected a deployment, got {outcome:?}");
    };
    assert_eq!(
        info.endpoints.stream_url,
        "wss://Chat.execute-api.eu-west-1.amazonaws.com/test"
    );
    assert_eq!(bound(&store), Some(info.deployment_id.clone()));
    assert_eq!(rec.phase(API, STAGE).await, ReconcilePhase::Bound);

    let deployment = store.get_deployment(API, &info.deployment_id).unwrap().unwrap();
    assert_eq!(deployment.description, "initial");
    assert_eq!(deployment.fingerprint, info.fingerprint);
}

#[tokio::test]
async fn unchanged_graph_is_not_redeployed() {
    let store = settled_store();
    let rec = reconciler(Scripted::new(store.clone()));

    let first = rec
        .reconcile(LifecycleEvent::Create, API, STAGE, "one")
        .await
        .unwrap();
    let second = rec
        .reconcile(LifecycleEvent::Update, API, STAGE, "two")
        .await
        .unwrap();

    let (ReconcileOutcome::Deployed(a), ReconcileOutcome::Unchanged(b)) = (&first, &second) else {
        panic!("unexpected outcomes {first:?} / {second:?}");
    };
    assert_eq!(a, b);
    assert_eq!(store.list_deployments(API).unwrap().len(), 1);
    assert_eq!(rec.control().creates.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn graph_change_creates_new_deployment() {
    let store = settled_store();
    let rec = reconciler(Scripted::new(store.clone()));
    rec.reconcile(LifecycleEvent::Create, API, STAGE, "one")
        .await
        .unwrap();
    let first = bound(&store).unwrap();

    let mut cfg = GatewayConfig::scaffold(API, STAGE);
    cfg.functions[0].name = "ChatFunctionV2".to_string();
    settle(&store, &cfg).unwrap();

    let outcome = rec
        .reconcile(LifecycleEvent::Update, API, STAGE, "two")
        .await
        .unwrap();
    let ReconcileOutcome::Deployed(info) = outcome else {
        panic!("expected a new deployment");
    };
    assert_ne!(info.deployment_id, first);
    assert_eq!(bound(&store), Some(info.deployment_id));
    assert_eq!(store.list_deployments(API).unwrap().len(), 2);
}

#[tokio::test]
async fn applied_fingerprint_tracks_the_snapshot_not_the_loaded_graph() {
    let store = settled_store();
    let stored = store.get_graph(API).unwrap().unwrap().fingerprint();

    let mut cfg = GatewayConfig::scaffold(API, STAGE);
    cfg.functions[0].name = "ChatFunctionV2".to_string();
    let newer = cfg.graph().unwrap();
    assert_ne!(newer.fingerprint(), stored);

    // The reconciler sees the newer graph before the store has it.
    let control = Scripted::new(store.clone());
    *control.graph_override.lock().unwrap() = Some(newer.clone());
    let rec = reconciler(control);

    let outcome = rec
        .reconcile(LifecycleEvent::Create, API, STAGE, "one")
        .await
        .unwrap();
    let ReconcileOutcome::Deployed(info) = &outcome else {
        panic!("expected a deployment, got {outcome:?}");
    };
    assert_eq!(info.fingerprint, stored);

    settle(&store, &cfg).unwrap();
    let outcome = rec
        .reconcile(LifecycleEvent::Update, API, STAGE, "two")
        .await
        .unwrap();
    assert!(matches!(outcome, ReconcileOutcome::Deployed(_)), "{outcome:?}");

    let serving = store
        .get_deployment(API, &bound(&store).unwrap())
        .unwrap()
        .unwrap();
    assert_eq!(serving.fingerprint, newer.fingerprint());
}

#[tokio::test]
async fn fresh_reconciler_adopts_existing_binding() {
    let store = settled_store();
    reconciler(Scripted::new(store.clone()))
        .reconcile(LifecycleEvent::Create, API, STAGE, "one")
        .await
        .unwrap();

    let restarted = reconciler(Scripted::new(store.clone()));
    let outcome = restarted
        .reconcile(LifecycleEvent::Update, API, STAGE, "two")
        .await
        .unwrap();
    assert!(matches!(outcome, ReconcileOutcome::Unchanged(_)));
    assert_eq!(store.list_deployments(API).unwrap().len(), 1);
}

#[tokio::test]
async fn incomplete_graph_fails_before_side_effects() {
    let store = settled_store();
    let control = Scripted::new(store.clone());
    let mut broken = store.get_graph(API).unwrap().unwrap();
    broken.integrations.clear();
    *control.graph_override.lock().unwrap() = Some(broken);
    let rec = reconciler(control);

    let err = rec
        .reconcile(LifecycleEvent::Create, API, STAGE, "x")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ReconcileErrorKind::GraphIncomplete);
    assert!(!err.is_retryable());
    assert!(store.list_deployments(API).unwrap().is_empty());
    assert_eq!(bound(&store), None);
    assert_eq!(rec.phase(API, STAGE).await, ReconcilePhase::Absent);
}

#[tokio::test]
async fn missing_context_fails_before_side_effects() {
    let store = settled_store();
    let rec = Reconciler::new(
        Arc::new(Scripted::new(store.clone())),
        EndpointContext::new("", "123456789012"),
    );

    let err = rec
        .reconcile(LifecycleEvent::Create, API, STAGE, "x")
        .await
        .unwrap_err();
    assert!(matches!(err, ReconcileError::MissingContext("region")));
    assert!(store.list_deployments(API).unwrap().is_empty());
}

#[tokio::test]
async fn unknown_stage_is_rejected() {
    let store = settled_store();
    let rec = reconciler(Scripted::new(store.clone()));
    let err = rec
        .reconcile(LifecycleEvent::Create, API, "prod", "x")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ReconcileErrorKind::ControlPlaneRejected);
}

#[tokio::test]
async fn failed_bind_restores_prior_binding() {
    let store = settled_store();
    let rec = reconciler(Scripted::new(store.clone()));
    rec.reconcile(LifecycleEvent::Create, API, STAGE, "one")
        .await
        .unwrap();
    let prior = bound(&store).unwrap();

    let mut cfg = GatewayConfig::scaffold(API, STAGE);
    cfg.integrations[0].name = "ChatIntegrationV2".to_string();
    settle(&store, &cfg).unwrap();

    rec.control().fail_next_binds(1);
    let err = rec
        .reconcile(LifecycleEvent::Update, API, STAGE, "two")
        .await
        .unwrap_err();
    assert!(matches!(err, ReconcileError::ControlPlaneUnavailable(_)));
    assert!(err.is_retryable());
    assert_eq!(bound(&store), Some(prior));
    assert_eq!(rec.phase(API, STAGE).await, ReconcilePhase::Bound);

    // The retry goes through once the control surface recovers.
    let outcome = rec
        .reconcile(LifecycleEvent::Update, API, STAGE, "two")
        .await
        .unwrap();
    assert!(matches!(outcome, ReconcileOutcome::Deployed(_)));
}

#[tokio::test]
async fn failed_restore_reports_both_errors() {
    let store = settled_store();
    let rec = reconciler(Scripted::new(store.clone()));
    rec.reconcile(LifecycleEvent::Create, API, STAGE, "one")
        .await
        .unwrap();

    let mut cfg = GatewayConfig::scaffold(API, STAGE);
    cfg.integrations[0].name = "ChatIntegrationV2".to_string();
    settle(&store, &cfg).unwrap();

    rec.control().fail_next_binds(2);
    let err = rec
        .reconcile(LifecycleEvent::Update, API, STAGE, "two")
        .await
        .unwrap_err();
    let ReconcileError::BindRestoreFailed { original, restore } = &err else {
        panic!("expected a restore failure, got {err:?}");
    };
    assert_eq!(original.kind(), ReconcileErrorKind::ControlPlaneUnavailable);
    assert_eq!(restore.kind(), ReconcileErrorKind::ControlPlaneUnavailable);
}

#[tokio::test]
async fn queued_reconciles_do_not_interleave() {
    let store = settled_store();
    let rec = Arc::new(reconciler(Scripted::gated(store.clone())));

    let first = tokio::spawn({
        let rec = rec.clone();
        async move { rec.reconcile(LifecycleEvent::Create, API, STAGE, "one").await }
    });
    rec.control().entered.notified().await;

    let second = tokio::spawn({
        let rec = rec.clone();
        async move { rec.reconcile(LifecycleEvent::Update, API, STAGE, "two").await }
    });
    tokio::task::yield_now().await;
    if let Some(gate) = &rec.control().gate {
        gate.notify_one();
    }

    let first = first.await.unwrap().unwrap();
    let second = second.await.unwrap().unwrap();
    assert!(matches!(first, ReconcileOutcome::Deployed(_)));
    assert!(matches!(second, ReconcileOutcome::Unchanged(_)));
    assert_eq!(store.list_deployments(API).unwrap().len(), 1);
}

#[tokio::test]
async fn fail_fast_rejects_concurrent_reconcile() {
    let store = settled_store();
    let rec = Arc::new(
        reconciler(Scripted::gated(store.clone())).with_policy(ConflictPolicy::FailFast),
    );

    let first = tokio::spawn({
        let rec = rec.clone();
        async move { rec.reconcile(LifecycleEvent::Create, API, STAGE, "one").await }
    });
    rec.control().entered.notified().await;

    let err = rec
        .reconcile(LifecycleEvent::Update, API, STAGE, "two")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ReconcileErrorKind::ConflictingReconciliation);
    assert!(err.is_retryable());

    if let Some(gate) = &rec.control().gate {
        gate.notify_one();
    }
    let first = first.await.unwrap().unwrap();
    assert!(matches!(first, ReconcileOutcome::Deployed(_)));
}

#[tokio::test]
async fn delete_releases_pairing_only() {
    let store = settled_store();
    let rec = reconciler(Scripted::new(store.clone()));
    rec.reconcile(LifecycleEvent::Create, API, STAGE, "one")
        .await
        .unwrap();

    let outcome = rec
        .reconcile(LifecycleEvent::Delete, API, STAGE, "")
        .await
        .unwrap();
    assert_eq!(outcome, ReconcileOutcome::Released);
    assert_eq!(rec.phase(API, STAGE).await, ReconcilePhase::Absent);
    assert_eq!(store.list_deployments(API).unwrap().len(), 1);
    assert!(bound(&store).is_some());
}

#[tokio::test]
async fn dependencies_list_routes_then_stage() {
    let store = settled_store();
    let rec = reconciler(Scripted::new(store));
    let deps = rec.dependencies(API, STAGE).await.unwrap();
    assert_eq!(
        deps,
        vec![
            Dependency::Route("test".to_string()),
            Dependency::Stage(STAGE.to_string()),
        ]
    );
}

#[tokio::test]
async fn plan_reports_pending_change() {
    let store = settled_store();
    let rec = reconciler(Scripted::new(store.clone()));
    assert!(rec.plan(API, STAGE).await.unwrap().needs_deployment());

    rec.reconcile(LifecycleEvent::Create, API, STAGE, "one")
        .await
        .unwrap();
    let plan = rec.plan(API, STAGE).await.unwrap();
    assert!(!plan.needs_deployment());
    assert_eq!(plan.bound, bound(&store));
}
