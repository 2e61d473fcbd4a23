#![allow(clippy::style)]
#![allow(clippy::complexity)]
#![allow(clippy::large_enum_variant)]
#![allow(clippy::mutable_key_type)]
#![allow(clippy::stable_sort_primitive)]
#![allow(clippy::map_entry)]
#![allow(clippy::box_default)]
#![warn(clippy::bool_comparison)]
#![warn(clippy::clone_on_ref_ptr)]
#![warn(clippy::no_effect)]
#![warn(clippy::unnecessary_unwrap)]
#![warn(clippy::dbg_macro)]
#![warn(clippy::todo)]
#![warn(clippy::wildcard_dependencies)]
#![warn(clippy::zero_prefixed_literal)]
#![warn(clippy::borrowed_box)]
#![warn(clippy::deref_addrof)]
#![warn(clippy::double_must_use)]
#![warn(clippy::double_parens)]
#![warn(clippy::extra_unused_lifetimes)]
#![warn(clippy::needless_borrow)]
#![warn(clippy::needless_question_mark)]
#![warn(clippy::needless_return)]
#![warn(clippy::redundant_pattern)]
#![warn(clippy::redundant_slicing)]
#![warn(clippy::redundant_static_lifetimes)]
#![warn(clippy::single_component_path_imports)]
#![warn(clippy::unnecessary_cast)]
#![warn(clippy::useless_asref)]
#![warn(clippy::useless_conversion)]
#![warn(clippy::builtin_type_shadow)]
#![warn(clippy::duplicate_underscore_argument)]
#![warn(double_negations)]
#![warn(clippy::unnecessary_mut_passed)]
#![warn(clippy::wildcard_in_or_patterns)]
#![warn(clippy::crosspointer_transmute)]
#![warn(clippy::excessive_precision)]
#![warn(clippy::panicking_overflow_checks)]
#![warn(clippy::as_conversions)]
#![warn(clippy::match_overlapping_arm)]
#![warn(clippy::zero_divided_by_zero)]
#![warn(clippy::must_use_unit)]
#![warn(clippy::suspicious_assignment_formatting)]
#![warn(clippy::suspicious_else_formatting)]
#![warn(clippy::suspicious_unary_op_formatting)]
#![warn(clippy::mut_mutex_lock)]
#![warn(clippy::print_literal)]
#![warn(clippy::same_item_push)]
#![warn(clippy::useless_format)]
#![warn(clippy::write_literal)]
#![warn(clippy::redundant_closure)]
#![warn(clippy::redundant_closure_call)]
#![warn(clippy::unnecessary_lazy_evaluations)]
#![warn(clippy::partialeq_ne_impl)]
#![warn(clippy::redundant_field_names)]
#![warn(clippy::transmutes_expressible_as_ptr_casts)]
#![warn(clippy::unused_async)]
#![warn(clippy::disallowed_methods)]
#![warn(clippy::disallowed_macros)]
#![warn(clippy::disallowed_types)]
#![warn(clippy::from_over_into)]

//! This crate implements a dependent-resource workflow engine on top of
//! [`kube_runtime::Controller`]. A primary custom resource describes which
//! optional modules of a platform should be installed; a [`Workflow`] of
//! [`Node`]s turns that description into secondary resources (deployments,
//! services, secrets, config maps), keeps them converged, and folds their
//! health back into a single [`WorkflowStatus`] on the primary.
//!
//! Each node owns one secondary kind and carries an activation condition
//! (should the secondary exist at all), an optional precondition (may its
//! desired state be computed yet) and a readiness check:
//!
//! ```no_run
//! # use std::collections::BTreeMap;
//! # use k8s_openapi::api::core::v1::ConfigMap;
//! # use k8s_workflow_controller::{Node, TemplateParams, Workflow};
//! # use k8s_workflow_controller::predicate::{when, PredicateExt, discovered};
//! # use k8s_workflow_controller::platform::MockSuite;
//! let workflow = Workflow::builder()
//!     .node(
//!         Node::new("IdentityConfig", "-identity", |suite: &MockSuite, ctx| {
//!             let params = TemplateParams::new(suite, "-identity", "example", &suite.spec.version);
//!             Ok(ConfigMap {
//!                 metadata: params.metadata(),
//!                 data: Some(BTreeMap::from([(
//!                     "url".to_string(),
//!                     ctx.discovered("keycloak.url").unwrap_or_default().to_string(),
//!                 )])),
//!                 ..Default::default()
//!             })
//!         })
//!         .activation(when(|suite: &MockSuite| suite.spec.keycloak.install))
//!         .precondition("waiting for the identity provider URL", discovered("keycloak.url")),
//!     )
//!     .build()
//!     .unwrap();
//! ```
//!
//! Then you can run it against your Kubernetes cluster by creating a
//! [`Controller`]:
//!
//! ```no_run
//! # use kube::{Config, Client};
//! # use kube_runtime::watcher;
//! # use tokio::task;
//! # use k8s_workflow_controller::platform::{self, Templates};
//! # async fn foo() {
//! let kube_config = Config::infer().await.unwrap();
//! let kube_client = Client::try_from(kube_config).unwrap();
//! let workflow = platform::workflow(Templates::default().into()).unwrap();
//! let controller = k8s_workflow_controller::Controller::namespaced_all(
//!     kube_client,
//!     workflow,
//!     watcher::Config::default(),
//! );
//! task::spawn(controller.run());
//! # }
//! ```
//!
//! The engine itself only depends on the [`Store`] trait, so the same
//! workflow can be driven against a [`MemoryStore`] through a [`Driver`].

mod context;
mod controller;
mod diff;
mod driver;
mod error;
mod kinds;
pub mod naming;
mod node;
pub mod platform;
pub mod predicate;
mod status;
mod store;
mod workflow;

pub use context::{Clock, PassContext, SystemClock};
pub use controller::{error_action, next_action, Controller};
pub use diff::{is_subset, overlay};
pub use driver::{Driver, PassQueue, Primary};
pub use error::{Error, GraphError, InvalidDesiredState, StoreError};
pub use kinds::{Readiness, ResourceKind};
pub use naming::{lookup, name_for, secondary_name, TemplateParams};
pub use node::{Dependent, Node, Outcome, MAX_RETRIES};
pub use status::{aggregate, reason, Condition, ConditionStatus, OverallStatus, WorkflowStatus};
pub use store::{
    api_resource, fetch, from_dynamic, to_dynamic, ChangeEvent, KubeStore, MemoryStore, Object,
    Operation, Store,
};
pub use workflow::{PassReport, Workflow, WorkflowBuilder};
