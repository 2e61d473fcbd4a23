use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, Service, Volume, VolumeMount,
};

use super::{container_port, deployment_for, service_for, service_url, MockSuite, Templates, KEYCLOAK_URL};
use crate::context::PassContext;
use crate::error::InvalidDesiredState;
use crate::node::Node;

/// In-cluster URL of the suite's own service.
pub const APP_URL: &str = "app.url";

const CONFIG_SUFFIX: &str = "-config";
const APP_SUFFIX: &str = "-app";
const CONFIG_FILE: &str = "application.properties";
const CONFIG_MOUNT: &str = "/deployments/config";

fn version(suite: &MockSuite) -> Result<&str, InvalidDesiredState> {
    match suite.spec.version.trim() {
        "" => Err(InvalidDesiredState("spec.version must not be empty".into())),
        version => Ok(version),
    }
}

fn properties(suite: &MockSuite, ctx: &PassContext) -> Result<String, InvalidDesiredState> {
    let mut lines = vec![
        format!("mocksuite.version={}", version(suite)?),
        format!("mocksuite.instance={}", suite.metadata.name.as_deref().unwrap_or_default()),
        format!("mocksuite.async-enabled={}", suite.spec.features.async_api.install),
    ];
    match ctx.discovered(KEYCLOAK_URL) {
        Some(url) => {
            lines.push("mocksuite.security.enabled=true".into());
            lines.push(format!("quarkus.oidc.auth-server-url={url}/realms/mocksuite"));
        }
        None => lines.push("mocksuite.security.enabled=false".into()),
    }
    Ok(lines.join("\n") + "\n")
}

/// The suite's configuration file. Picks up the identity provider's
/// address when one was materialized earlier in the pass.
pub(super) fn config(templates: &Arc<Templates>) -> Node<MockSuite, ConfigMap> {
    let templates = Arc::clone(templates);
    Node::new(
        "AppConfig",
        CONFIG_SUFFIX,
        move |suite: &MockSuite, ctx: &PassContext| {
            Ok(ConfigMap {
                metadata: templates.params(suite, CONFIG_SUFFIX).metadata(),
                data: Some(BTreeMap::from([(
                    CONFIG_FILE.to_owned(),
                    properties(suite, ctx)?,
                )])),
                ..Default::default()
            })
        },
    )
}

pub(super) fn service(templates: &Arc<Templates>) -> Node<MockSuite, Service> {
    let port = templates.app.port;
    let templates = Arc::clone(templates);
    Node::new(
        "AppService",
        APP_SUFFIX,
        move |suite: &MockSuite, _: &PassContext| {
            let params = templates.params(suite, APP_SUFFIX);
            Ok(service_for(&params, &params, port))
        },
    )
    .discover(move |_, service: &Service| {
        service_url(service, port)
            .map(|url| (APP_URL.to_owned(), url))
            .into_iter()
            .collect()
    })
}

pub(super) fn deployment(templates: &Arc<Templates>) -> Node<MockSuite, Deployment> {
    let templates = Arc::clone(templates);
    Node::new(
        "AppDeployment",
        APP_SUFFIX,
        move |suite: &MockSuite, _: &PassContext| {
            let params = templates.params(suite, APP_SUFFIX);
            let config = templates.params(suite, CONFIG_SUFFIX).name;
            let container = Container {
                name: "mocksuite".into(),
                image: Some(format!("{}:{}", templates.app.image, version(suite)?)),
                ports: Some(container_port("http", templates.app.port)),
                volume_mounts: Some(vec![VolumeMount {
                    name: "config".into(),
                    mount_path: CONFIG_MOUNT.into(),
                    read_only: Some(true),
                    ..Default::default()
                }]),
                ..Default::default()
            };
            let volumes = vec![Volume {
                name: "config".into(),
                config_map: Some(ConfigMapVolumeSource {
                    name: Some(config),
                    ..Default::default()
                }),
                ..Default::default()
            }];
            Ok(deployment_for(&params, templates.app.replicas, container, volumes))
        },
    )
    .depends_on("AppConfig")
}
