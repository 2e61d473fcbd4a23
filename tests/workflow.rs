use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::stream::BoxStream;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentStatus};
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service};
use k8s_openapi::chrono::{DateTime, TimeZone, Utc};
use kube::core::{ApiResource, DynamicObject};
use serde_json::{json, Value};
use tokio::sync::Notify;

use k8s_workflow_controller::platform::{
    self, AsyncSpec, FeaturesSpec, KeycloakSpec, MockSuite, MockSuiteSpec, Templates,
    ADMIN_PASSWORD_KEY, DATABASE_PASSWORD_KEY,
};
use k8s_workflow_controller::{
    lookup, reason, ChangeEvent, Clock, ConditionStatus, Driver, MemoryStore, Operation,
    OverallStatus, Store, StoreError, WorkflowStatus,
};

const NAMESPACE: &str = "mocks";
const NAME: &str = "suite";

struct FrozenClock;

impl Clock for FrozenClock {
    fn now(&self) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }
}

fn suite(keycloak: bool, async_api: bool) -> MockSuite {
    let mut suite = MockSuite::new(
        NAME,
        MockSuiteSpec {
            version: "1.0.0".into(),
            keycloak: KeycloakSpec {
                install: keycloak,
                image: None,
            },
            features: FeaturesSpec {
                async_api: AsyncSpec {
                    install: async_api,
                    image: None,
                },
            },
        },
    );
    suite.metadata.namespace = Some(NAMESPACE.into());
    suite.metadata.generation = Some(1);
    suite
}

fn setup(primary: MockSuite) -> (Arc<MemoryStore>, Driver<MockSuite>) {
    let store = Arc::new(MemoryStore::new());
    store.insert(&primary).unwrap();
    let workflow = platform::workflow(Arc::new(Templates::default())).unwrap();
    let driver = Driver::new(workflow, Arc::clone(&store) as Arc<dyn Store>)
        .with_clock(Arc::new(FrozenClock));
    (store, driver)
}

async fn pass(driver: &Driver<MockSuite>) -> WorkflowStatus {
    driver.trigger(NAMESPACE, NAME).await.unwrap().unwrap()
}

/// Applies a spec change the way the API server would: same object, next
/// generation.
fn edit(store: &MemoryStore, change: impl FnOnce(&mut MockSuite)) {
    let mut suite: MockSuite = store.get_typed(NAMESPACE, NAME).unwrap();
    change(&mut suite);
    suite.metadata.generation = suite.metadata.generation.map(|generation| generation + 1);
    store.insert(&suite).unwrap();
}

fn secondaries(store: &MemoryStore) -> BTreeMap<String, Value> {
    store
        .snapshot()
        .into_iter()
        .filter(|(key, _)| !key.starts_with("mocksuite.io/"))
        .collect()
}

fn secret_value(store: &MemoryStore, key: &str) -> Vec<u8> {
    let secret: Secret = store
        .get_typed(NAMESPACE, "suite-keycloak-admin")
        .unwrap();
    secret.data.unwrap()[key].0.clone()
}

fn mark_available(store: &MemoryStore, name: &str) {
    let mut deployment: Deployment = store.get_typed(NAMESPACE, name).unwrap();
    let replicas = deployment.spec.as_ref().and_then(|spec| spec.replicas);
    deployment.status = Some(DeploymentStatus {
        replicas,
        available_replicas: replicas,
        ..Default::default()
    });
    store.insert(&deployment).unwrap();
}

#[tokio::test]
async fn first_pass_materializes_enabled_modules() {
    let (store, driver) = setup(suite(true, false));
    let status = pass(&driver).await;

    for name in ["suite-keycloak-postgresql", "suite-keycloak", "suite-app"] {
        assert!(store.get_typed::<Deployment>(NAMESPACE, name).is_some(), "{name}");
    }
    for name in ["suite-keycloak-postgresql", "suite-keycloak", "suite-app"] {
        assert!(store.get_typed::<Service>(NAMESPACE, name).is_some(), "{name}");
    }
    assert!(store
        .get_typed::<Deployment>(NAMESPACE, "suite-async-minion")
        .is_none());

    let config: ConfigMap = store.get_typed(NAMESPACE, "suite-config").unwrap();
    let properties = &config.data.unwrap()["application.properties"];
    assert!(properties.contains("mocksuite.security.enabled=true"));
    assert!(properties.contains("http://suite-keycloak.mocks.svc.cluster.local:8080"));

    // Deployments have not reported yet.
    assert_eq!(status.status, OverallStatus::Reconciling);
    assert_eq!(status.conditions.len(), 8);
    assert_eq!(status.observed_generation, 1);
    let secret = status.condition("KeycloakSecretReady").unwrap();
    assert_eq!(secret.status, ConditionStatus::True);
    assert_eq!(secret.reason, reason::RECONCILED);
}

#[tokio::test]
async fn passes_without_changes_are_idempotent() {
    let (store, driver) = setup(suite(true, true));
    let first = pass(&driver).await;
    let before = secondaries(&store);

    let second = pass(&driver).await;
    assert_eq!(secondaries(&store), before);
    assert_eq!(second, first);
    assert_eq!(store.status_writes(), 2);
}

#[tokio::test]
async fn deactivation_deletes_and_reactivation_generates_fresh_credentials() {
    let (store, driver) = setup(suite(true, false));
    pass(&driver).await;
    let password = secret_value(&store, ADMIN_PASSWORD_KEY);
    assert_eq!(password.len(), 32);

    // Unrelated spec changes keep the credentials.
    edit(&store, |suite| suite.spec.version = "1.1.0".into());
    pass(&driver).await;
    assert_eq!(secret_value(&store, ADMIN_PASSWORD_KEY), password);

    edit(&store, |suite| suite.spec.keycloak.install = false);
    let status = pass(&driver).await;
    assert!(store
        .get_typed::<Secret>(NAMESPACE, "suite-keycloak-admin")
        .is_none());
    assert!(store
        .get_typed::<Deployment>(NAMESPACE, "suite-keycloak")
        .is_none());
    assert!(status.condition("KeycloakSecretReady").is_none());
    assert_eq!(status.conditions.len(), 3);

    edit(&store, |suite| suite.spec.keycloak.install = true);
    pass(&driver).await;
    assert_ne!(secret_value(&store, ADMIN_PASSWORD_KEY), password);
    assert_eq!(secret_value(&store, DATABASE_PASSWORD_KEY).len(), 32);
}

#[tokio::test]
async fn drift_is_repaired_through_a_single_conflict() {
    let (store, driver) = setup(suite(false, false));
    pass(&driver).await;

    let mut config: ConfigMap = store.get_typed(NAMESPACE, "suite-config").unwrap();
    config.data = Some(BTreeMap::from([(
        "application.properties".to_string(),
        "tampered".to_string(),
    )]));
    store.insert(&config).unwrap();

    store.inject(Operation::Update, StoreError::Conflict("modified".into()));
    let status = pass(&driver).await;

    let condition = status.condition("AppConfigReady").unwrap();
    assert_eq!(condition.status, ConditionStatus::True);
    assert_eq!(condition.reason, reason::RECONCILED);
    let config: ConfigMap = store.get_typed(NAMESPACE, "suite-config").unwrap();
    assert!(config.data.unwrap()["application.properties"].contains("mocksuite.version=1.0.0"));
}

#[tokio::test]
async fn exhausted_retries_hold_back_the_observed_generation() {
    let (store, driver) = setup(suite(false, false));
    pass(&driver).await;

    edit(&store, |suite| suite.spec.version = "2.0.0".into());
    for _ in 0..=k8s_workflow_controller::MAX_RETRIES {
        store.inject(Operation::Update, StoreError::Conflict("modified".into()));
    }
    let status = pass(&driver).await;
    let condition = status.condition("AppConfigReady").unwrap();
    assert_eq!(condition.reason, reason::CONFLICT_EXCEEDED);
    assert_eq!(status.status, OverallStatus::Reconciling);
    assert_eq!(status.observed_generation, 1);

    let status = pass(&driver).await;
    assert_eq!(status.observed_generation, 2);
}

#[tokio::test]
async fn invalid_spec_is_an_error_until_fixed() {
    let (store, driver) = setup(suite(false, false));
    pass(&driver).await;

    edit(&store, |suite| suite.spec.version = String::new());
    let status = pass(&driver).await;
    assert_eq!(status.status, OverallStatus::Error);
    assert!(status.message.as_deref().unwrap().contains("spec.version"));
    assert_eq!(status.observed_generation, 1);
    assert_eq!(
        status.condition("AppConfigReady").unwrap().reason,
        reason::INVALID_SPEC
    );
    assert_eq!(
        status.condition("AppDeploymentReady").unwrap().reason,
        reason::PRECONDITION_UNMET
    );
    // The previously applied deployment is left alone.
    let app: Deployment = store.get_typed(NAMESPACE, "suite-app").unwrap();
    let image = app.spec.unwrap().template.spec.unwrap().containers[0]
        .image
        .clone()
        .unwrap();
    assert!(image.ends_with(":1.0.0"));

    edit(&store, |suite| suite.spec.version = "1.0.1".into());
    let status = pass(&driver).await;
    assert_eq!(status.status, OverallStatus::Reconciling);
    assert_eq!(status.observed_generation, 3);
}

#[tokio::test]
async fn skipped_nodes_keep_their_live_object() {
    let (store, driver) = setup(suite(true, false));
    pass(&driver).await;

    let mut service: Service = store.get_typed(NAMESPACE, "suite-keycloak").unwrap();
    service.spec.as_mut().unwrap().selector = Some(BTreeMap::new());
    store.insert(&service).unwrap();
    store.inject(Operation::Update, StoreError::Invalid("immutable field".into()));

    let status = pass(&driver).await;
    assert_eq!(
        status.condition("KeycloakServiceReady").unwrap().reason,
        reason::INVALID_SPEC
    );
    let skipped = status.condition("KeycloakDeploymentReady").unwrap();
    assert_eq!(skipped.status, ConditionStatus::Unknown);
    assert_eq!(skipped.reason, reason::PRECONDITION_UNMET);
    assert!(store
        .get_typed::<Deployment>(NAMESPACE, "suite-keycloak")
        .is_some());
    assert_eq!(status.status, OverallStatus::Error);
}

#[tokio::test]
async fn available_deployments_make_the_suite_ready() {
    let (store, driver) = setup(suite(true, true));
    let status = pass(&driver).await;
    assert_eq!(status.status, OverallStatus::Reconciling);

    for name in [
        "suite-keycloak-postgresql",
        "suite-keycloak",
        "suite-app",
        "suite-async-minion",
    ] {
        mark_available(&store, name);
    }
    let status = pass(&driver).await;
    assert_eq!(status.status, OverallStatus::Ready);
    assert_eq!(status.conditions.len(), 10);
    assert!(status
        .conditions
        .iter()
        .all(|condition| condition.status == ConditionStatus::True));
}

#[tokio::test]
async fn transient_reads_are_retried() {
    let (store, driver) = setup(suite(false, false));
    let primary: MockSuite = store.get_typed(NAMESPACE, NAME).unwrap();
    store.inject(Operation::Get, StoreError::Transient("connection reset".into()));
    let status = driver.reconcile(&primary).await.unwrap();
    assert!(status
        .conditions
        .iter()
        .all(|condition| condition.reason != reason::TRANSIENT));
    assert!(store.get_typed::<ConfigMap>(NAMESPACE, "suite-config").is_some());
}

#[tokio::test]
async fn status_commit_keeps_unknown_fields() {
    let mut primary = suite(false, false);
    primary.status = Some(WorkflowStatus {
        extra: BTreeMap::from([("legacyField".to_string(), json!("kept"))]),
        ..Default::default()
    });
    let (store, driver) = setup(primary);
    pass(&driver).await;

    let suite: MockSuite = store.get_typed(NAMESPACE, NAME).unwrap();
    let status = suite.status.unwrap();
    assert_eq!(status.extra["legacyField"], json!("kept"));
    assert_eq!(status.conditions.len(), 3);
    assert_eq!(store.status_writes(), 1);
}

#[tokio::test]
async fn failed_status_commit_is_reported() {
    let (store, driver) = setup(suite(false, false));
    store.inject(
        Operation::PatchStatus,
        StoreError::Transient("apiserver unavailable".into()),
    );
    assert!(driver.trigger(NAMESPACE, NAME).await.is_err());
    assert_eq!(store.status_writes(), 0);

    // The queue was released, so the next trigger runs.
    assert!(driver.trigger(NAMESPACE, NAME).await.unwrap().is_some());
}

#[tokio::test]
async fn missing_primary_is_not_an_error() {
    let (_store, driver) = setup(suite(false, false));
    assert_eq!(driver.trigger(NAMESPACE, "gone").await.unwrap(), None);
}

#[tokio::test]
async fn cleanup_removes_every_secondary() {
    let (store, driver) = setup(suite(true, true));
    pass(&driver).await;
    assert_eq!(secondaries(&store).len(), 10);

    let primary: MockSuite = store.get_typed(NAMESPACE, NAME).unwrap();
    driver.cleanup(&primary).await.unwrap();
    assert!(secondaries(&store).is_empty());
    assert_eq!(store.snapshot().len(), 1);
}

#[tokio::test]
async fn lookup_resolves_secondaries_by_derived_name() {
    let (store, driver) = setup(suite(true, false));
    pass(&driver).await;

    let primary: MockSuite = store.get_typed(NAMESPACE, NAME).unwrap();
    let found: Secret = lookup::<MockSuite, Secret>(store.as_ref(), &primary, "-keycloak-admin")
        .await
        .unwrap()
        .unwrap();
    let stored: Secret = store.get_typed(NAMESPACE, "suite-keycloak-admin").unwrap();
    assert_eq!(found, stored);

    let missing = lookup::<MockSuite, Secret>(store.as_ref(), &primary, "-nothing")
        .await
        .unwrap();
    assert!(missing.is_none());
}

#[tokio::test]
async fn keys_added_by_other_actors_are_left_alone() {
    let (store, driver) = setup(suite(false, false));
    pass(&driver).await;

    let mut config: ConfigMap = store.get_typed(NAMESPACE, "suite-config").unwrap();
    config
        .data
        .get_or_insert_with(BTreeMap::new)
        .insert("extra.properties".to_string(), "debug=true".to_string());
    let config = store.insert(&config).unwrap();

    pass(&driver).await;
    let live: ConfigMap = store.get_typed(NAMESPACE, "suite-config").unwrap();
    assert_eq!(
        live.metadata.resource_version,
        config.metadata.resource_version
    );
    assert_eq!(live.data.unwrap()["extra.properties"], "debug=true");
}

/// Holds the first `get` until released, after it has read the store.
struct ParkedStore {
    inner: MemoryStore,
    park: AtomicBool,
    parked: Notify,
    release: Notify,
}

#[async_trait::async_trait]
impl Store for ParkedStore {
    async fn get(
        &self,
        kind: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>, StoreError> {
        let result = self.inner.get(kind, namespace, name).await;
        if self.park.swap(false, Ordering::SeqCst) {
            self.parked.notify_one();
            self.release.notified().await;
        }
        result
    }

    async fn create(
        &self,
        kind: &ApiResource,
        object: &DynamicObject,
    ) -> Result<DynamicObject, StoreError> {
        self.inner.create(kind, object).await
    }

    async fn update(
        &self,
        kind: &ApiResource,
        object: &DynamicObject,
    ) -> Result<DynamicObject, StoreError> {
        self.inner.update(kind, object).await
    }

    async fn delete(
        &self,
        kind: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<(), StoreError> {
        self.inner.delete(kind, namespace, name).await
    }

    async fn patch_status(
        &self,
        kind: &ApiResource,
        namespace: &str,
        name: &str,
        status: &Value,
    ) -> Result<(), StoreError> {
        self.inner.patch_status(kind, namespace, name, status).await
    }

    fn watch(&self, kind: &ApiResource) -> BoxStream<'static, Result<ChangeEvent, StoreError>> {
        self.inner.watch(kind)
    }
}

#[tokio::test]
async fn triggers_during_a_pass_coalesce_into_one_rerun() {
    let store = Arc::new(ParkedStore {
        inner: MemoryStore::new(),
        park: AtomicBool::new(true),
        parked: Notify::new(),
        release: Notify::new(),
    });
    store.inner.insert(&suite(false, false)).unwrap();
    let workflow = platform::workflow(Arc::new(Templates::default())).unwrap();
    let driver = Driver::new(workflow, Arc::clone(&store) as Arc<dyn Store>)
        .with_clock(Arc::new(FrozenClock));

    let (first, (second, third)) = tokio::join!(driver.trigger(NAMESPACE, NAME), async {
        // The first pass has read the primary and is parked.
        store.parked.notified().await;
        edit(&store.inner, |suite| suite.spec.keycloak.install = true);
        let second = driver.trigger(NAMESPACE, NAME).await;
        let third = driver.trigger(NAMESPACE, NAME).await;
        store.release.notify_one();
        (second, third)
    });

    assert_eq!(second.unwrap(), None);
    assert_eq!(third.unwrap(), None);
    let status = first.unwrap().unwrap();
    assert_eq!(status.observed_generation, 2);
    assert_eq!(status.conditions.len(), 8);
    assert_eq!(store.inner.status_writes(), 2);
    assert!(store
        .inner
        .get_typed::<Secret>(NAMESPACE, "suite-keycloak-admin")
        .is_some());

    // Nothing is left queued.
    assert!(driver.trigger(NAMESPACE, NAME).await.unwrap().is_some());
    assert_eq!(store.inner.status_writes(), 3);
}
