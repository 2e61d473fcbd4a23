//! The mock suite: a primary [`MockSuite`] resource and the workflow that
//! installs the suite itself, an optional Keycloak identity provider with its
//! database, and an optional async minion.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, EnvVarSource, PodSpec, PodTemplateSpec, SecretKeySelector,
    Service, ServicePort, ServiceSpec, Volume,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use serde::{Deserialize, Serialize};

use crate::error::{Error, GraphError};
use crate::naming::TemplateParams;
use crate::predicate::{discovered, when, Evaluator, Predicate, PredicateExt};
use crate::workflow::Workflow;

mod app;
mod async_minion;
mod crd;
mod keycloak;

pub use app::APP_URL;
pub use crd::{AsyncSpec, FeaturesSpec, KeycloakSpec, MockSuite, MockSuiteSpec};
pub use keycloak::{
    ADMIN_KEY, ADMIN_PASSWORD_KEY, DATABASE_PASSWORD_KEY, DATABASE_USER_KEY, KEYCLOAK_URL,
};

pub const KEYCLOAK_ENABLED: &str = "keycloak-enabled";
pub const KEYCLOAK_INSTALLABLE: &str = "keycloak-installable";
pub const ASYNC_ENABLED: &str = "async-enabled";

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct AppTemplate {
    pub image: String,
    pub port: i32,
    pub replicas: i32,
}

impl Default for AppTemplate {
    fn default() -> Self {
        Self {
            image: "ghcr.io/mocksuite/mocksuite".into(),
            port: 8080,
            replicas: 1,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct KeycloakTemplate {
    pub image: String,
    pub port: i32,
    pub postgres_image: String,
    pub postgres_port: i32,
}

impl Default for KeycloakTemplate {
    fn default() -> Self {
        Self {
            image: "quay.io/keycloak/keycloak:20.0.2".into(),
            port: 8080,
            postgres_image: "docker.io/library/postgres:15".into(),
            postgres_port: 5432,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct AsyncMinionTemplate {
    pub image: String,
    pub port: i32,
}

impl Default for AsyncMinionTemplate {
    fn default() -> Self {
        Self {
            image: "ghcr.io/mocksuite/mocksuite-async-minion".into(),
            port: 8081,
        }
    }
}

/// Static parts of every secondary: images, ports, replica counts. Loaded
/// once at startup and never mutated afterwards.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Templates {
    /// Value of the `app.kubernetes.io/managed-by` label
    pub manager: String,
    pub app: AppTemplate,
    pub keycloak: KeycloakTemplate,
    pub async_minion: AsyncMinionTemplate,
}

impl Default for Templates {
    fn default() -> Self {
        Self {
            manager: "mocksuite-operator".into(),
            app: AppTemplate::default(),
            keycloak: KeycloakTemplate::default(),
            async_minion: AsyncMinionTemplate::default(),
        }
    }
}

impl Templates {
    /// Missing keys keep their defaults.
    pub fn from_yaml(yaml: &str) -> Result<Self, Error> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub(crate) fn params(&self, suite: &MockSuite, suffix: &str) -> TemplateParams {
        TemplateParams::new(suite, suffix, &self.manager, &suite.spec.version)
    }
}

/// Module switches and staged-rollout gates shared by the suite's nodes.
pub fn predicates() -> Evaluator<MockSuite> {
    let mut predicates = Evaluator::new();
    predicates.register(
        KEYCLOAK_ENABLED,
        when(|suite: &MockSuite| suite.spec.keycloak.install),
    );
    predicates.register(
        KEYCLOAK_INSTALLABLE,
        when(|suite: &MockSuite| suite.spec.keycloak.install).and(discovered(KEYCLOAK_URL)),
    );
    predicates.register(
        ASYNC_ENABLED,
        when(|suite: &MockSuite| suite.spec.features.async_api.install),
    );
    predicates
}

pub(crate) fn predicate(
    predicates: &Evaluator<MockSuite>,
    id: &str,
) -> Result<Arc<dyn Predicate<MockSuite>>, GraphError> {
    predicates
        .get(id)
        .ok_or_else(|| GraphError::UnknownPredicate(id.to_owned()))
}

/// The suite's workflow, in evaluation order.
pub fn workflow(templates: Arc<Templates>) -> Result<Workflow<MockSuite>, GraphError> {
    let predicates = predicates();
    let keycloak_enabled = predicate(&predicates, KEYCLOAK_ENABLED)?;
    let keycloak_installable = predicate(&predicates, KEYCLOAK_INSTALLABLE)?;
    let async_enabled = predicate(&predicates, ASYNC_ENABLED)?;

    Workflow::builder()
        .node(keycloak::secret(&templates).activation(keycloak_enabled.clone()))
        .node(keycloak::postgres(&templates).activation(keycloak_enabled.clone()))
        .node(keycloak::postgres_service(&templates).activation(keycloak_enabled.clone()))
        .node(keycloak::service(&templates).activation(keycloak_enabled.clone()))
        .node(
            keycloak::deployment(&templates)
                .activation(keycloak_enabled)
                .precondition(
                    "waiting for the Keycloak URL to be known",
                    keycloak_installable,
                ),
        )
        .node(app::config(&templates))
        .node(app::service(&templates))
        .node(app::deployment(&templates))
        .node(async_minion::config(&templates).activation(async_enabled.clone()))
        .node(async_minion::deployment(&templates).activation(async_enabled))
        .build()
}

pub(crate) fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.into(),
        value: Some(value.into()),
        ..Default::default()
    }
}

pub(crate) fn secret_env(name: &str, secret: &str, key: &str) -> EnvVar {
    EnvVar {
        name: name.into(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: Some(secret.into()),
                key: key.into(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub(crate) fn container_port(name: &str, port: i32) -> Vec<ContainerPort> {
    vec![ContainerPort {
        name: Some(name.into()),
        container_port: port,
        ..Default::default()
    }]
}

pub(crate) fn deployment_for(
    params: &TemplateParams,
    replicas: i32,
    container: Container,
    volumes: Vec<Volume>,
) -> Deployment {
    let selector = params.selector();
    let mut pod_labels: BTreeMap<String, String> = params.labels.clone();
    pod_labels.extend(selector.clone());
    Deployment {
        metadata: params.metadata(),
        spec: Some(DeploymentSpec {
            replicas: Some(replicas),
            selector: LabelSelector {
                match_labels: Some(selector),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(pod_labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    volumes: (!volumes.is_empty()).then_some(volumes),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// A ClusterIP service in front of the pods of the deployment with
/// `target`'s params.
pub(crate) fn service_for(params: &TemplateParams, target: &TemplateParams, port: i32) -> Service {
    Service {
        metadata: params.metadata(),
        spec: Some(ServiceSpec {
            selector: Some(target.selector()),
            ports: Some(vec![ServicePort {
                name: Some("http".into()),
                port,
                target_port: Some(IntOrString::Int(port)),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// In-cluster URL of a service.
pub(crate) fn service_url(service: &Service, port: i32) -> Option<String> {
    let name = service.metadata.name.as_deref()?;
    let namespace = service.metadata.namespace.as_deref()?;
    Some(format!("http://{name}.{namespace}.svc.cluster.local:{port}"))
}
