use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, ConfigMapEnvSource, Container, EnvFromSource};

use super::{container_port, deployment_for, env, MockSuite, Templates, APP_URL};
use crate::context::PassContext;
use crate::node::Node;
use crate::predicate::discovered;

const CONFIG_SUFFIX: &str = "-async-minion-config";
const MINION_SUFFIX: &str = "-async-minion";

pub(super) fn config(templates: &Arc<Templates>) -> Node<MockSuite, ConfigMap> {
    let templates = Arc::clone(templates);
    Node::new(
        "AsyncMinionConfig",
        CONFIG_SUFFIX,
        move |suite: &MockSuite, _: &PassContext| {
            Ok(ConfigMap {
                metadata: templates.params(suite, CONFIG_SUFFIX).metadata(),
                data: Some(BTreeMap::from([
                    ("ASYNC_MINION_PORT".to_owned(), templates.async_minion.port.to_string()),
                    ("ASYNC_MINION_MODE".to_owned(), "operator".to_owned()),
                ])),
                ..Default::default()
            })
        },
    )
}

/// Talks to the suite's own service, so it waits until that service has an
/// address.
pub(super) fn deployment(templates: &Arc<Templates>) -> Node<MockSuite, Deployment> {
    let templates = Arc::clone(templates);
    Node::new(
        "AsyncMinion",
        MINION_SUFFIX,
        move |suite: &MockSuite, ctx: &PassContext| {
            let params = templates.params(suite, MINION_SUFFIX);
            let config = templates.params(suite, CONFIG_SUFFIX).name;
            let image = suite
                .spec
                .features
                .async_api
                .image
                .clone()
                .unwrap_or_else(|| format!("{}:{}", templates.async_minion.image, suite.spec.version));
            let container = Container {
                name: "async-minion".into(),
                image: Some(image),
                env: Some(vec![env(
                    "MOCKSUITE_URL",
                    ctx.discovered(APP_URL).unwrap_or_default(),
                )]),
                env_from: Some(vec![EnvFromSource {
                    config_map_ref: Some(ConfigMapEnvSource {
                        name: Some(config),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                ports: Some(container_port("http", templates.async_minion.port)),
                ..Default::default()
            };
            Ok(deployment_for(&params, 1, container, Vec::new()))
        },
    )
    .depends_on("AsyncMinionConfig")
    .depends_on("AppService")
    .precondition("waiting for the suite's service address", discovered(APP_URL))
}
