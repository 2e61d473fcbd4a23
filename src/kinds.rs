//! Per-kind behaviour the generic node needs: how to put a desired object in
//! the shape the store will hand back, and when a live object is healthy.

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service};
use k8s_openapi::ByteString;

use crate::store::Object;

/// Health of a materialized secondary.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    NotReady(String),
    Unknown(String),
}

pub trait ResourceKind: Object {
    /// Rewrites write-only fields into the form the store returns them in,
    /// so a desired object can be compared against a live one.
    fn normalize(self) -> Self {
        self
    }

    fn readiness(&self) -> Readiness {
        Readiness::Ready
    }
}

impl ResourceKind for ConfigMap {}

impl ResourceKind for Service {}

impl ResourceKind for Secret {
    fn normalize(mut self) -> Self {
        if let Some(string_data) = self.string_data.take() {
            let data = self.data.get_or_insert_with(Default::default);
            for (key, value) in string_data {
                data.insert(key, ByteString(value.into_bytes()));
            }
        }
        self
    }
}

impl ResourceKind for Deployment {
    fn readiness(&self) -> Readiness {
        let wanted = self
            .spec
            .as_ref()
            .and_then(|spec| spec.replicas)
            .unwrap_or(1);
        let Some(status) = self.status.as_ref() else {
            return Readiness::Unknown("deployment has not reported status yet".into());
        };
        if let (Some(observed), Some(generation)) = (status.observed_generation, self.metadata.generation) {
            if observed < generation {
                return Readiness::NotReady("rollout has not been observed yet".into());
            }
        }
        let available = status.available_replicas.unwrap_or(0);
        if available >= wanted {
            Readiness::Ready
        } else {
            Readiness::NotReady(format!("{available}/{wanted} replicas available"))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use k8s_openapi::api::apps::v1::{DeploymentSpec, DeploymentStatus};

    use super::*;

    #[test]
    fn secret_string_data_folds_into_data() {
        let secret = Secret {
            string_data: Some(BTreeMap::from([("password".to_string(), "s3cret".to_string())])),
            ..Default::default()
        }
        .normalize();
        assert!(secret.string_data.is_none());
        assert_eq!(secret.data.unwrap()["password"], ByteString(b"s3cret".to_vec()));
    }

    #[test]
    fn deployment_ready_once_replicas_available() {
        let mut deployment = Deployment {
            spec: Some(DeploymentSpec {
                replicas: Some(2),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(matches!(deployment.readiness(), Readiness::Unknown(_)));

        deployment.status = Some(DeploymentStatus {
            available_replicas: Some(1),
            ..Default::default()
        });
        assert_eq!(
            deployment.readiness(),
            Readiness::NotReady("1/2 replicas available".into())
        );

        deployment.status = Some(DeploymentStatus {
            available_replicas: Some(2),
            ..Default::default()
        });
        assert_eq!(deployment.readiness(), Readiness::Ready);
    }
}
