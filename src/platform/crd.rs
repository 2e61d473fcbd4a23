use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::driver::Primary;
use crate::status::WorkflowStatus;

/// Describe an installation of the mock suite and its optional modules
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(
    group = "mocksuite.io",
    version = "v1alpha1",
    kind = "MockSuite",
    plural = "mocksuites",
    shortname = "msuite",
    status = "WorkflowStatus",
    namespaced,
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".spec.version"}"#,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.status"}"#,
    printcolumn = r#"{"name":"Message","type":"string","jsonPath":".status.message"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MockSuiteSpec {
    /// Version of the suite, used as image tag for the suite's own components
    pub version: String,
    /// Identity provider module
    #[serde(default)]
    pub keycloak: KeycloakSpec,
    /// Optional features
    #[serde(default)]
    pub features: FeaturesSpec,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KeycloakSpec {
    /// Install a Keycloak instance (and its database) alongside the suite
    #[serde(default)]
    pub install: bool,
    /// Override the Keycloak image
    pub image: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FeaturesSpec {
    /// Asynchronous API mocking
    #[serde(default, rename = "async")]
    pub async_api: AsyncSpec,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AsyncSpec {
    /// Install the async minion
    #[serde(default)]
    pub install: bool,
    /// Override the async minion image
    pub image: Option<String>,
}

impl Primary for MockSuite {
    const FINALIZER_NAME: &'static str = "mocksuite.io/workflow";

    fn status(&self) -> Option<&WorkflowStatus> {
        self.status.as_ref()
    }
}
