use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Container, Secret, Service};
use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};

use super::{
    container_port, deployment_for, env, secret_env, service_for, service_url, MockSuite, Templates,
};
use crate::context::PassContext;
use crate::error::InvalidDesiredState;
use crate::node::Node;

pub const ADMIN_KEY: &str = "username";
pub const ADMIN_PASSWORD_KEY: &str = "password";
pub const DATABASE_USER_KEY: &str = "postgresUsername";
pub const DATABASE_PASSWORD_KEY: &str = "postgresPassword";

/// In-cluster URL of the Keycloak service, once it exists.
pub const KEYCLOAK_URL: &str = "keycloak.url";

const SECRET_SUFFIX: &str = "-keycloak-admin";
const POSTGRES_SUFFIX: &str = "-keycloak-postgresql";
const KEYCLOAK_SUFFIX: &str = "-keycloak";
const DATABASE_NAME: &str = "keycloak";

const USER_SUFFIX_LENGTH: usize = 6;
const PASSWORD_LENGTH: usize = 32;

fn random_string(length: usize) -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

/// Admin and database credentials. Generated once; later passes keep
/// whatever the live secret holds.
pub(super) fn secret(templates: &Arc<Templates>) -> Node<MockSuite, Secret> {
    let templates = Arc::clone(templates);
    Node::new(
        "KeycloakSecret",
        SECRET_SUFFIX,
        move |suite: &MockSuite, _: &PassContext| {
            let params = templates.params(suite, SECRET_SUFFIX);
            Ok(Secret {
                metadata: params.metadata(),
                type_: Some("Opaque".into()),
                string_data: Some(BTreeMap::from([
                    (
                        ADMIN_KEY.to_owned(),
                        format!("admin{}", random_string(USER_SUFFIX_LENGTH)),
                    ),
                    (ADMIN_PASSWORD_KEY.to_owned(), random_string(PASSWORD_LENGTH)),
                    (
                        DATABASE_USER_KEY.to_owned(),
                        format!("user{}", random_string(USER_SUFFIX_LENGTH)),
                    ),
                    (DATABASE_PASSWORD_KEY.to_owned(), random_string(PASSWORD_LENGTH)),
                ])),
                ..Default::default()
            })
        },
    )
    .preserve(|existing: &Secret, desired: &mut Secret| {
        let Some(existing) = &existing.data else {
            return;
        };
        let data = desired.data.get_or_insert_with(BTreeMap::new);
        for (key, value) in existing {
            if data.contains_key(key) {
                data.insert(key.clone(), value.clone());
            }
        }
    })
}

fn keycloak_image(suite: &MockSuite, default: &str) -> String {
    suite
        .spec
        .keycloak
        .image
        .clone()
        .unwrap_or_else(|| default.to_owned())
}

pub(super) fn postgres(templates: &Arc<Templates>) -> Node<MockSuite, Deployment> {
    let templates = Arc::clone(templates);
    Node::new(
        "KeycloakPostgres",
        POSTGRES_SUFFIX,
        move |suite: &MockSuite, _: &PassContext| {
            let params = templates.params(suite, POSTGRES_SUFFIX);
            let secret = templates.params(suite, SECRET_SUFFIX).name;
            let container = Container {
                name: "postgresql".into(),
                image: Some(templates.keycloak.postgres_image.clone()),
                env: Some(vec![
                    env("POSTGRES_DB", DATABASE_NAME),
                    secret_env("POSTGRES_USER", &secret, DATABASE_USER_KEY),
                    secret_env("POSTGRES_PASSWORD", &secret, DATABASE_PASSWORD_KEY),
                ]),
                ports: Some(container_port("postgresql", templates.keycloak.postgres_port)),
                ..Default::default()
            };
            Ok(deployment_for(&params, 1, container, Vec::new()))
        },
    )
    .depends_on("KeycloakSecret")
}

pub(super) fn postgres_service(templates: &Arc<Templates>) -> Node<MockSuite, Service> {
    let templates = Arc::clone(templates);
    Node::new(
        "KeycloakPostgresService",
        POSTGRES_SUFFIX,
        move |suite: &MockSuite, _: &PassContext| {
            let params = templates.params(suite, POSTGRES_SUFFIX);
            Ok(service_for(&params, &params, templates.keycloak.postgres_port))
        },
    )
}

pub(super) fn service(templates: &Arc<Templates>) -> Node<MockSuite, Service> {
    let port = templates.keycloak.port;
    let templates = Arc::clone(templates);
    Node::new(
        "KeycloakService",
        KEYCLOAK_SUFFIX,
        move |suite: &MockSuite, _: &PassContext| {
            let params = templates.params(suite, KEYCLOAK_SUFFIX);
            Ok(service_for(&params, &params, port))
        },
    )
    .discover(move |_, service: &Service| {
        service_url(service, port)
            .map(|url| (KEYCLOAK_URL.to_owned(), url))
            .into_iter()
            .collect()
    })
}

/// The identity provider itself. Runs against the database deployed by
/// [`postgres`] with the credentials from [`secret`].
pub(super) fn deployment(templates: &Arc<Templates>) -> Node<MockSuite, Deployment> {
    let templates = Arc::clone(templates);
    Node::new(
        "KeycloakDeployment",
        KEYCLOAK_SUFFIX,
        move |suite: &MockSuite, ctx: &PassContext| {
            let params = templates.params(suite, KEYCLOAK_SUFFIX);
            let secret = templates.params(suite, SECRET_SUFFIX).name;
            let database = templates.params(suite, POSTGRES_SUFFIX).name;
            let hostname = ctx.discovered(KEYCLOAK_URL).ok_or_else(|| {
                InvalidDesiredState("the Keycloak service has no address".into())
            })?;
            let container = Container {
                name: "keycloak".into(),
                image: Some(keycloak_image(suite, &templates.keycloak.image)),
                args: Some(vec!["start-dev".into()]),
                env: Some(vec![
                    secret_env("KEYCLOAK_ADMIN", &secret, ADMIN_KEY),
                    secret_env("KEYCLOAK_ADMIN_PASSWORD", &secret, ADMIN_PASSWORD_KEY),
                    env("KC_DB", "postgres"),
                    env(
                        "KC_DB_URL",
                        format!(
                            "jdbc:postgresql://{database}:{}/{DATABASE_NAME}",
                            templates.keycloak.postgres_port
                        ),
                    ),
                    secret_env("KC_DB_USERNAME", &secret, DATABASE_USER_KEY),
                    secret_env("KC_DB_PASSWORD", &secret, DATABASE_PASSWORD_KEY),
                    env("KC_HOSTNAME_URL", hostname),
                    env("KC_HTTP_PORT", templates.keycloak.port.to_string()),
                ]),
                ports: Some(container_port("http", templates.keycloak.port)),
                ..Default::default()
            };
            Ok(deployment_for(&params, 1, container, Vec::new()))
        },
    )
    .depends_on("KeycloakSecret")
    .depends_on("KeycloakPostgresService")
    .depends_on("KeycloakService")
}
