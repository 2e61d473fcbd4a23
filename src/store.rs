//! The resource store the workflow engine reads from and writes to.
//!
//! The engine only ever talks to a [`Store`], which is deliberately small:
//! point reads, create, optimistic-concurrency update, delete, status patch
//! and a change stream. [`KubeStore`] backs it with a live cluster and
//! [`MemoryStore`] with an in-process map.

use std::fmt::Debug;

use futures::stream::BoxStream;
use kube::core::{ApiResource, DynamicObject};
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::StoreError;

mod cluster;
mod memory;

pub use cluster::KubeStore;
pub use memory::{MemoryStore, Operation};

/// Any typed object the engine can move through a [`Store`].
pub trait Object:
    Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<T> Object for T where
    T: Resource<DynamicType = ()>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// A change observed on a watched kind.
#[derive(Clone, Debug)]
pub enum ChangeEvent {
    Applied(DynamicObject),
    Deleted(DynamicObject),
}

impl ChangeEvent {
    pub fn object(&self) -> &DynamicObject {
        match self {
            ChangeEvent::Applied(object) | ChangeEvent::Deleted(object) => object,
        }
    }
}

#[async_trait::async_trait]
pub trait Store: Send + Sync {
    /// Returns `None` when no object of that kind and name exists.
    async fn get(
        &self,
        kind: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>, StoreError>;

    /// Creates the object in the namespace recorded in its metadata. An
    /// already existing object is reported as [`StoreError::Conflict`].
    async fn create(
        &self,
        kind: &ApiResource,
        object: &DynamicObject,
    ) -> Result<DynamicObject, StoreError>;

    /// Replaces the object, expecting the store's current version to equal
    /// `object.metadata.resource_version`. A mismatch (or a vanished
    /// object) is reported as [`StoreError::Conflict`].
    async fn update(
        &self,
        kind: &ApiResource,
        object: &DynamicObject,
    ) -> Result<DynamicObject, StoreError>;

    /// Deleting an object that does not exist succeeds.
    async fn delete(&self, kind: &ApiResource, namespace: &str, name: &str)
        -> Result<(), StoreError>;

    /// Merge-patches `status` into the object's status subresource.
    async fn patch_status(
        &self,
        kind: &ApiResource,
        namespace: &str,
        name: &str,
        status: &serde_json::Value,
    ) -> Result<(), StoreError>;

    fn watch(&self, kind: &ApiResource) -> BoxStream<'static, Result<ChangeEvent, StoreError>>;
}

pub fn api_resource<K: Object>() -> ApiResource {
    ApiResource::erase::<K>(&())
}

pub fn to_dynamic<K: Serialize>(object: &K) -> Result<DynamicObject, StoreError> {
    Ok(serde_json::from_value(serde_json::to_value(object)?)?)
}

pub fn from_dynamic<K: DeserializeOwned>(object: &DynamicObject) -> Result<K, StoreError> {
    Ok(serde_json::from_value(serde_json::to_value(object)?)?)
}

/// Typed convenience over [`Store::get`].
pub async fn fetch<K: Object>(
    store: &dyn Store,
    namespace: &str,
    name: &str,
) -> Result<Option<K>, StoreError> {
    store
        .get(&api_resource::<K>(), namespace, name)
        .await?
        .map(|object| from_dynamic(&object))
        .transpose()
}
