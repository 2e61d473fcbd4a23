use std::collections::BTreeMap;
use std::sync::Mutex;

use futures::stream::{self, BoxStream, StreamExt};
use kube::core::{ApiResource, DynamicObject};
use serde_json::Value;
use tokio::sync::broadcast;

use super::{api_resource, from_dynamic, to_dynamic, ChangeEvent, Object, Store};
use crate::diff::merge_patch;
use crate::error::StoreError;

/// Store operations that can have failures injected into them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    Get,
    Create,
    Update,
    Delete,
    PatchStatus,
}

type Key = (String, String, String);

#[derive(Default)]
struct State {
    objects: BTreeMap<Key, DynamicObject>,
    version: u64,
    faults: Vec<(Operation, StoreError)>,
    status_writes: usize,
}

impl State {
    fn next_version(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }

    fn take_fault(&mut self, operation: Operation) -> Result<(), StoreError> {
        match self.faults.iter().position(|(op, _)| *op == operation) {
            Some(index) => Err(self.faults.remove(index).1),
            None => Ok(()),
        }
    }
}

/// An in-process [`Store`] with the same versioning and conflict semantics
/// as the API server, plus failure injection for tests.
pub struct MemoryStore {
    state: Mutex<State>,
    events: broadcast::Sender<(String, ChangeEvent)>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn kind_key(kind: &ApiResource) -> String {
    format!("{}/{}", kind.api_version, kind.kind)
}

fn key(kind: &ApiResource, namespace: &str, name: &str) -> Key {
    (kind_key(kind), namespace.to_owned(), name.to_owned())
}

fn object_key(kind: &ApiResource, object: &DynamicObject) -> Result<Key, StoreError> {
    let namespace = object
        .metadata
        .namespace
        .as_deref()
        .ok_or_else(|| StoreError::Invalid("object has no namespace".into()))?;
    let name = object
        .metadata
        .name
        .as_deref()
        .ok_or_else(|| StoreError::Invalid("object has no name".into()))?;
    Ok(key(kind, namespace, name))
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            state: Mutex::new(State::default()),
            events,
        }
    }

    /// Makes the next call of `operation` fail with `err`. Faults queue up
    /// and are consumed in injection order.
    pub fn inject(&self, operation: Operation, err: StoreError) {
        self.state.lock().unwrap().faults.push((operation, err));
    }

    /// Writes `object` as-is, bypassing faults and version checks. Used to
    /// seed primaries and to simulate edits made by other actors.
    pub fn insert<K: Object>(&self, object: &K) -> Result<K, StoreError> {
        let kind = api_resource::<K>();
        let mut dynamic = to_dynamic(object)?;
        let key = object_key(&kind, &dynamic)?;
        let mut state = self.state.lock().unwrap();
        let version = state.next_version();
        if dynamic.metadata.uid.is_none() {
            dynamic.metadata.uid = Some(format!("uid-{version}"));
        }
        dynamic.metadata.resource_version = Some(version);
        state.objects.insert(key, dynamic.clone());
        drop(state);
        self.publish(&kind, ChangeEvent::Applied(dynamic.clone()));
        from_dynamic(&dynamic)
    }

    pub fn get_typed<K: Object>(&self, namespace: &str, name: &str) -> Option<K> {
        let state = self.state.lock().unwrap();
        state
            .objects
            .get(&key(&api_resource::<K>(), namespace, name))
            .and_then(|object| from_dynamic(object).ok())
    }

    /// Every stored object keyed by `apiVersion/kind/namespace/name`.
    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        let state = self.state.lock().unwrap();
        state
            .objects
            .iter()
            .map(|((kind, namespace, name), object)| {
                (
                    format!("{kind}/{namespace}/{name}"),
                    serde_json::to_value(object).unwrap_or(Value::Null),
                )
            })
            .collect()
    }

    pub fn status_writes(&self) -> usize {
        self.state.lock().unwrap().status_writes
    }

    fn publish(&self, kind: &ApiResource, event: ChangeEvent) {
        // nobody watching is fine
        let _ = self.events.send((kind_key(kind), event));
    }
}

#[async_trait::async_trait]
impl Store for MemoryStore {
    async fn get(
        &self,
        kind: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>, StoreError> {
        let mut state = self.state.lock().unwrap();
        state.take_fault(Operation::Get)?;
        Ok(state.objects.get(&key(kind, namespace, name)).cloned())
    }

    async fn create(
        &self,
        kind: &ApiResource,
        object: &DynamicObject,
    ) -> Result<DynamicObject, StoreError> {
        let key = object_key(kind, object)?;
        let mut state = self.state.lock().unwrap();
        state.take_fault(Operation::Create)?;
        if state.objects.contains_key(&key) {
            return Err(StoreError::Conflict(format!("{} already exists", key.2)));
        }
        let mut created = object.clone();
        let version = state.next_version();
        created.metadata.uid = Some(format!("uid-{version}"));
        created.metadata.resource_version = Some(version);
        state.objects.insert(key, created.clone());
        drop(state);
        self.publish(kind, ChangeEvent::Applied(created.clone()));
        Ok(created)
    }

    async fn update(
        &self,
        kind: &ApiResource,
        object: &DynamicObject,
    ) -> Result<DynamicObject, StoreError> {
        let key = object_key(kind, object)?;
        let mut state = self.state.lock().unwrap();
        state.take_fault(Operation::Update)?;
        let current = state
            .objects
            .get(&key)
            .ok_or_else(|| StoreError::Conflict(format!("{} not found", key.2)))?;
        if current.metadata.resource_version != object.metadata.resource_version {
            return Err(StoreError::Conflict(format!(
                "{} was modified (expected version {:?}, found {:?})",
                key.2, object.metadata.resource_version, current.metadata.resource_version
            )));
        }
        let mut updated = object.clone();
        updated.metadata.uid = current.metadata.uid.clone();
        updated.metadata.resource_version = Some(state.next_version());
        state.objects.insert(key, updated.clone());
        drop(state);
        self.publish(kind, ChangeEvent::Applied(updated.clone()));
        Ok(updated)
    }

    async fn delete(
        &self,
        kind: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        state.take_fault(Operation::Delete)?;
        let removed = state.objects.remove(&key(kind, namespace, name));
        drop(state);
        if let Some(object) = removed {
            self.publish(kind, ChangeEvent::Deleted(object));
        }
        Ok(())
    }

    async fn patch_status(
        &self,
        kind: &ApiResource,
        namespace: &str,
        name: &str,
        status: &Value,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        state.take_fault(Operation::PatchStatus)?;
        let version = state.next_version();
        let object = state
            .objects
            .get_mut(&key(kind, namespace, name))
            .ok_or_else(|| StoreError::Conflict(format!("{name} not found")))?;
        if !object.data.is_object() {
            object.data = Value::Object(Default::default());
        }
        merge_patch(&mut object.data, &serde_json::json!({ "status": status }));
        object.metadata.resource_version = Some(version);
        let patched = object.clone();
        state.status_writes += 1;
        drop(state);
        self.publish(kind, ChangeEvent::Applied(patched));
        Ok(())
    }

    fn watch(&self, kind: &ApiResource) -> BoxStream<'static, Result<ChangeEvent, StoreError>> {
        let wanted = kind_key(kind);
        stream::unfold(self.events.subscribe(), move |mut events| {
            let wanted = wanted.clone();
            async move {
                loop {
                    match events.recv().await {
                        Ok((kind, event)) if kind == wanted => return Some((Ok(event), events)),
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            let err = StoreError::Transient(format!("watch lagged by {missed}"));
                            return Some((Err(err), events));
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        })
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::ConfigMap;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    use super::*;

    fn config_map(name: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some("ns".into()),
                ..Default::default()
            },
            data: Some([("key".to_string(), "value".to_string())].into()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn stale_updates_conflict() {
        let store = MemoryStore::new();
        let kind = api_resource::<ConfigMap>();
        let created = store
            .create(&kind, &to_dynamic(&config_map("a")).unwrap())
            .await
            .unwrap();
        let mut stale = created.clone();
        store.update(&kind, &created).await.unwrap();
        stale.data["data"]["key"] = "other".into();
        assert!(matches!(
            store.update(&kind, &stale).await,
            Err(StoreError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn create_twice_conflicts_and_delete_is_idempotent() {
        let store = MemoryStore::new();
        let kind = api_resource::<ConfigMap>();
        let object = to_dynamic(&config_map("a")).unwrap();
        store.create(&kind, &object).await.unwrap();
        assert!(matches!(
            store.create(&kind, &object).await,
            Err(StoreError::Conflict(_))
        ));
        store.delete(&kind, "ns", "a").await.unwrap();
        store.delete(&kind, "ns", "a").await.unwrap();
        assert!(store.get(&kind, "ns", "a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn injected_faults_fire_once() {
        let store = MemoryStore::new();
        let kind = api_resource::<ConfigMap>();
        store.inject(Operation::Get, StoreError::Transient("boom".into()));
        assert!(store.get(&kind, "ns", "a").await.is_err());
        assert!(store.get(&kind, "ns", "a").await.is_ok());
    }

    #[tokio::test]
    async fn watch_only_sees_its_kind() {
        let store = MemoryStore::new();
        let mut events = store.watch(&api_resource::<ConfigMap>());
        store
            .create(
                &api_resource::<k8s_openapi::api::core::v1::Secret>(),
                &to_dynamic(&k8s_openapi::api::core::v1::Secret {
                    metadata: config_map("s").metadata,
                    ..Default::default()
                })
                .unwrap(),
            )
            .await
            .unwrap();
        store.insert(&config_map("a")).unwrap();
        store
            .delete(&api_resource::<ConfigMap>(), "ns", "a")
            .await
            .unwrap();

        let first = events.next().await.unwrap().unwrap();
        assert!(matches!(first, ChangeEvent::Applied(_)));
        assert_eq!(first.object().metadata.name.as_deref(), Some("a"));
        let second = events.next().await.unwrap().unwrap();
        assert!(matches!(second, ChangeEvent::Deleted(_)));
    }
}
