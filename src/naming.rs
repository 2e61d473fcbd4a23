//! Deterministic secondary names and the metadata every secondary carries.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::{Resource, ResourceExt};

use crate::error::StoreError;
use crate::store::{fetch, Object, Store};

pub const NAME_LABEL: &str = "app.kubernetes.io/name";
pub const INSTANCE_LABEL: &str = "app.kubernetes.io/instance";
pub const PART_OF_LABEL: &str = "app.kubernetes.io/part-of";
pub const VERSION_LABEL: &str = "app.kubernetes.io/version";
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// `primary_name + suffix`. Depends on nothing else, so the result is the
/// same on every call and in every process.
pub fn secondary_name(primary_name: &str, suffix: &str) -> String {
    format!("{primary_name}{suffix}")
}

pub fn name_for<P: Resource>(primary: &P, suffix: &str) -> String {
    secondary_name(&primary.name_any(), suffix)
}

/// Resolves a node's secondary by its derived name.
pub async fn lookup<P, K>(
    store: &dyn Store,
    primary: &P,
    suffix: &str,
) -> Result<Option<K>, StoreError>
where
    P: Resource,
    K: Object,
{
    let namespace = primary.namespace().unwrap_or_default();
    fetch::<K>(store, &namespace, &name_for(primary, suffix)).await
}

/// What a static template is parameterized with to produce one secondary.
#[derive(Clone, Debug, PartialEq)]
pub struct TemplateParams {
    pub name: String,
    pub namespace: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub owner: Option<OwnerReference>,
    pub version: String,
}

impl TemplateParams {
    pub fn new<P>(primary: &P, suffix: &str, manager: &str, version: &str) -> Self
    where
        P: Resource<DynamicType = ()>,
    {
        let name = name_for(primary, suffix);
        let labels = BTreeMap::from([
            (NAME_LABEL.to_owned(), name.clone()),
            (INSTANCE_LABEL.to_owned(), primary.name_any()),
            (PART_OF_LABEL.to_owned(), primary.name_any()),
            (VERSION_LABEL.to_owned(), version.to_owned()),
            (MANAGED_BY_LABEL.to_owned(), manager.to_owned()),
        ]);
        Self {
            name,
            namespace: primary.namespace(),
            labels,
            owner: primary.controller_owner_ref(&()),
            version: version.to_owned(),
        }
    }

    /// Labels that stay stable across versions, for selectors.
    pub fn selector(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (NAME_LABEL.to_owned(), self.name.clone()),
            (INSTANCE_LABEL.to_owned(), self.labels[INSTANCE_LABEL].clone()),
        ])
    }

    pub fn metadata(&self) -> ObjectMeta {
        ObjectMeta {
            name: Some(self.name.clone()),
            namespace: self.namespace.clone(),
            labels: Some(self.labels.clone()),
            owner_references: self.owner.clone().map(|owner| vec![owner]),
            ..Default::default()
        }
    }
}
