use futures::stream::{self, BoxStream, StreamExt};
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::core::{ApiResource, DynamicObject};
use kube::Client;
use kube_runtime::watcher;
use serde_json::json;

use super::{ChangeEvent, Store};
use crate::error::StoreError;

/// A [`Store`] backed by the Kubernetes API server.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, kind: &ApiResource, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, kind)
    }
}

fn classify(err: kube::Error) -> StoreError {
    match err {
        kube::Error::Api(response) if response.code == 409 => {
            StoreError::Conflict(response.message)
        }
        kube::Error::Api(response) if response.code == 400 || response.code == 422 => {
            StoreError::Invalid(response.message)
        }
        kube::Error::SerdeError(err) => StoreError::Serialization(err.to_string()),
        other => StoreError::Transient(other.to_string()),
    }
}

fn namespace_of(object: &DynamicObject) -> Result<&str, StoreError> {
    object
        .metadata
        .namespace
        .as_deref()
        .ok_or_else(|| StoreError::Invalid("object has no namespace".into()))
}

fn name_of(object: &DynamicObject) -> Result<&str, StoreError> {
    object
        .metadata
        .name
        .as_deref()
        .ok_or_else(|| StoreError::Invalid("object has no name".into()))
}

#[async_trait::async_trait]
impl Store for KubeStore {
    async fn get(
        &self,
        kind: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>, StoreError> {
        self.api(kind, namespace).get_opt(name).await.map_err(classify)
    }

    async fn create(
        &self,
        kind: &ApiResource,
        object: &DynamicObject,
    ) -> Result<DynamicObject, StoreError> {
        self.api(kind, namespace_of(object)?)
            .create(&PostParams::default(), object)
            .await
            .map_err(classify)
    }

    async fn update(
        &self,
        kind: &ApiResource,
        object: &DynamicObject,
    ) -> Result<DynamicObject, StoreError> {
        if object.metadata.resource_version.is_none() {
            return Err(StoreError::Invalid(
                "update without an expected resourceVersion".into(),
            ));
        }
        match self
            .api(kind, namespace_of(object)?)
            .replace(name_of(object)?, &PostParams::default(), object)
            .await
        {
            Ok(object) => Ok(object),
            Err(kube::Error::Api(response)) if response.code == 404 => {
                Err(StoreError::Conflict(response.message))
            }
            Err(err) => Err(classify(err)),
        }
    }

    async fn delete(
        &self,
        kind: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<(), StoreError> {
        match self
            .api(kind, namespace)
            .delete(name, &DeleteParams::background())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(response)) if response.code == 404 => Ok(()),
            Err(err) => Err(classify(err)),
        }
    }

    async fn patch_status(
        &self,
        kind: &ApiResource,
        namespace: &str,
        name: &str,
        status: &serde_json::Value,
    ) -> Result<(), StoreError> {
        let patch = json!({ "status": status });
        self.api(kind, namespace)
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map(|_| ())
            .map_err(classify)
    }

    fn watch(&self, kind: &ApiResource) -> BoxStream<'static, Result<ChangeEvent, StoreError>> {
        let api = Api::<DynamicObject>::all_with(self.client.clone(), kind);
        watcher(api, watcher::Config::default())
            .flat_map(|event| {
                let events = match event {
                    Ok(watcher::Event::Applied(object)) => vec![Ok(ChangeEvent::Applied(object))],
                    Ok(watcher::Event::Deleted(object)) => vec![Ok(ChangeEvent::Deleted(object))],
                    Ok(watcher::Event::Restarted(objects)) => objects
                        .into_iter()
                        .map(|object| Ok(ChangeEvent::Applied(object)))
                        .collect(),
                    Err(err) => vec![Err(StoreError::Transient(err.to_string()))],
                };
                stream::iter(events)
            })
            .boxed()
    }
}
