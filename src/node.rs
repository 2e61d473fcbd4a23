//! A node of the workflow graph: one secondary resource, the rules for
//! whether it should exist, and the create/update/delete discipline that
//! converges it.

use std::marker::PhantomData;
use std::sync::Arc;

use kube::core::{ApiResource, DynamicObject};
use kube::{Resource, ResourceExt};
use tracing::{event, Level};

use crate::context::PassContext;
use crate::diff::{is_subset, overlay};
use crate::error::{InvalidDesiredState, StoreError};
use crate::kinds::{Readiness, ResourceKind};
use crate::naming::name_for;
use crate::predicate::{always, Predicate};
use crate::status::{reason, Condition, ConditionStatus};
use crate::store::{api_resource, from_dynamic};

/// How many times a conflicting or transient store operation is retried
/// against a freshly fetched object before the node gives up for this pass.
pub const MAX_RETRIES: usize = 3;

type DesiredFn<P, K> = Box<dyn Fn(&P, &PassContext) -> Result<K, InvalidDesiredState> + Send + Sync>;
type PreserveFn<K> = Box<dyn Fn(&K, &mut K) + Send + Sync>;
type ReadinessFn<K> = Box<dyn Fn(&K) -> Readiness + Send + Sync>;
type DiscoverFn<P, K> = Box<dyn Fn(&P, &K) -> Vec<(String, String)> + Send + Sync>;

/// What one node did during a pass.
#[derive(Clone, Debug)]
pub enum Outcome {
    /// The activation condition is false and nothing is left behind.
    Inactive,
    /// Active, but a dependency or precondition is not met yet. The live
    /// object, if any, was left untouched.
    Skipped(Condition),
    /// The secondary exists and matches the desired state.
    Applied {
        condition: Condition,
        object: DynamicObject,
        discovered: Vec<(String, String)>,
    },
    Failed(Condition),
}

impl Outcome {
    pub fn condition(&self) -> Option<&Condition> {
        match self {
            Outcome::Inactive => None,
            Outcome::Skipped(condition)
            | Outcome::Applied { condition, .. }
            | Outcome::Failed(condition) => Some(condition),
        }
    }

    pub fn is_active(&self) -> bool {
        !matches!(self, Outcome::Inactive)
    }
}

/// The object-safe face of a [`Node`], which lets nodes of different kinds
/// live in one workflow.
#[async_trait::async_trait]
pub trait Dependent<P>: Send + Sync {
    fn id(&self) -> &str;

    fn suffix(&self) -> &str;

    fn kind(&self) -> ApiResource;

    fn depends_on(&self) -> &[String];

    fn condition_type(&self) -> String {
        format!("{}Ready", self.id())
    }

    /// Converges the node's secondary towards the desired state.
    async fn reconcile_one(&self, primary: &P, ctx: &PassContext) -> Outcome;

    /// Removes the node's secondary, if present.
    async fn delete(&self, primary: &P, ctx: &PassContext) -> Result<(), StoreError>;
}

/// A dependent resource of kind `K` managed on behalf of primaries of kind
/// `P`.
///
/// Only fields the desired object sets are compared and written. A key that
/// exists solely on the live object (a label, a `data` entry) is never
/// treated as drift, so a key the template stops producing stays on the
/// live object until the secondary is deleted and recreated.
///
/// ```
/// # use std::collections::BTreeMap;
/// # use k8s_openapi::api::core::v1::ConfigMap;
/// # use k8s_workflow_controller::{Node, TemplateParams};
/// # use k8s_workflow_controller::predicate::when;
/// let node = Node::new("Settings", "-settings", |primary: &ConfigMap, _ctx| {
///     let params = TemplateParams::new(primary, "-settings", "example", "1.0");
///     Ok(ConfigMap {
///         metadata: params.metadata(),
///         data: Some(BTreeMap::from([("mode".into(), "mock".into())])),
///         ..Default::default()
///     })
/// })
/// .activation(when(|primary: &ConfigMap| primary.data.is_some()));
/// ```
pub struct Node<P, K> {
    id: String,
    suffix: String,
    depends_on: Vec<String>,
    activation: Arc<dyn Predicate<P>>,
    precondition: Option<(String, Arc<dyn Predicate<P>>)>,
    desired: DesiredFn<P, K>,
    preserve: Option<PreserveFn<K>>,
    readiness: Option<ReadinessFn<K>>,
    discover: Option<DiscoverFn<P, K>>,
    _kind: PhantomData<fn() -> K>,
}

impl<P, K> Node<P, K>
where
    P: Resource + Send + Sync + 'static,
    K: ResourceKind,
{
    /// A node that is always active and computes its desired object with
    /// `desired`, which must be deterministic for identical inputs.
    pub fn new<F>(id: impl Into<String>, suffix: impl Into<String>, desired: F) -> Self
    where
        F: Fn(&P, &PassContext) -> Result<K, InvalidDesiredState> + Send + Sync + 'static,
    {
        Self {
            id: id.into(),
            suffix: suffix.into(),
            depends_on: Vec::new(),
            activation: Arc::new(always()),
            precondition: None,
            desired: Box::new(desired),
            preserve: None,
            readiness: None,
            discover: None,
            _kind: PhantomData,
        }
    }

    /// Whether the secondary should exist at all. When this turns false an
    /// existing secondary is deleted.
    pub fn activation(mut self, predicate: impl Predicate<P> + 'static) -> Self {
        self.activation = Arc::new(predicate);
        self
    }

    /// Gates desired-state computation for an active node. When unmet the
    /// node is skipped and `waiting_for` becomes its condition message; an
    /// existing secondary is *not* deleted.
    pub fn precondition(
        mut self,
        waiting_for: impl Into<String>,
        predicate: impl Predicate<P> + 'static,
    ) -> Self {
        self.precondition = Some((waiting_for.into(), Arc::new(predicate)));
        self
    }

    /// Requires node `id` to have materialized its secondary earlier in the
    /// same pass.
    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        self.depends_on.push(id.into());
        self
    }

    /// Copies values out of the existing secondary into the freshly computed
    /// desired object before diffing. This is how generated credentials stay
    /// stable across passes.
    pub fn preserve<F>(mut self, preserve: F) -> Self
    where
        F: Fn(&K, &mut K) + Send + Sync + 'static,
    {
        self.preserve = Some(Box::new(preserve));
        self
    }

    /// Overrides the kind's default readiness check.
    pub fn readiness<F>(mut self, readiness: F) -> Self
    where
        F: Fn(&K) -> Readiness + Send + Sync + 'static,
    {
        self.readiness = Some(Box::new(readiness));
        self
    }

    /// Publishes values derived from the materialized secondary for later
    /// nodes to read through [`PassContext::discovered`].
    pub fn discover<F>(mut self, discover: F) -> Self
    where
        F: Fn(&P, &K) -> Vec<(String, String)> + Send + Sync + 'static,
    {
        self.discover = Some(Box::new(discover));
        self
    }

    fn condition(&self, status: ConditionStatus, reason: &str, message: String, ctx: &PassContext) -> Condition {
        Condition::new(self.condition_type(), status, reason, message, ctx.generation())
            .at(ctx.clock().timestamp())
    }

    fn failed(&self, err: &StoreError, ctx: &PassContext) -> Outcome {
        let reason = match err {
            StoreError::Conflict(_) => reason::CONFLICT_EXCEEDED,
            StoreError::Transient(_) => reason::TRANSIENT,
            StoreError::Invalid(_) | StoreError::Serialization(_) => reason::INVALID_SPEC,
        };
        event!(
            Level::ERROR,
            node = %self.id,
            reason,
            err = %err,
            "Failed to converge {}.",
            self.id
        );
        Outcome::Failed(self.condition(
            ConditionStatus::False,
            reason,
            format!("{}: {err}", self.id),
            ctx,
        ))
    }

    fn invalid(&self, err: impl std::fmt::Display, ctx: &PassContext) -> Outcome {
        event!(
            Level::ERROR,
            node = %self.id,
            err = %err,
            "Desired state for {} is invalid.",
            self.id
        );
        Outcome::Failed(self.condition(
            ConditionStatus::False,
            reason::INVALID_SPEC,
            format!("{}: {err}", self.id),
            ctx,
        ))
    }

    fn skipped(&self, waiting_for: String, ctx: &PassContext) -> Outcome {
        event!(
            Level::DEBUG,
            node = %self.id,
            "Skipping {}: {}.",
            self.id,
            waiting_for
        );
        Outcome::Skipped(self.condition(
            ConditionStatus::Unknown,
            reason::PRECONDITION_UNMET,
            waiting_for,
            ctx,
        ))
    }

    /// Desired object for this pass, with preserved fields copied over from
    /// `live` and in the shape the store returns it.
    fn desired_against(
        &self,
        primary: &P,
        live: Option<&DynamicObject>,
        ctx: &PassContext,
    ) -> Result<serde_json::Value, String> {
        let mut desired = (self.desired)(primary, ctx)
            .map_err(|err| err.to_string())?
            .normalize();
        if let (Some(preserve), Some(live)) = (&self.preserve, live) {
            let existing: K = from_dynamic(live).map_err(|err| err.to_string())?;
            preserve(&existing.normalize(), &mut desired);
        }
        serde_json::to_value(&desired).map_err(|err| err.to_string())
    }

    fn applied(&self, primary: &P, name: &str, object: DynamicObject, ctx: &PassContext) -> Outcome {
        let typed: K = match from_dynamic(&object) {
            Ok(typed) => typed,
            Err(err) => return self.failed(&err, ctx),
        };
        let readiness = match &self.readiness {
            Some(readiness) => readiness(&typed),
            None => typed.readiness(),
        };
        let condition = match readiness {
            Readiness::Ready => self.condition(
                ConditionStatus::True,
                reason::RECONCILED,
                format!("{} {name} is ready", K::kind(&())),
                ctx,
            ),
            Readiness::NotReady(message) => self.condition(
                ConditionStatus::False,
                reason::NOT_READY,
                format!("{} {name}: {message}", K::kind(&())),
                ctx,
            ),
            Readiness::Unknown(message) => self.condition(
                ConditionStatus::Unknown,
                reason::NOT_READY,
                format!("{} {name}: {message}", K::kind(&())),
                ctx,
            ),
        };
        let discovered = self
            .discover
            .as_ref()
            .map(|discover| discover(primary, &typed))
            .unwrap_or_default();
        Outcome::Applied {
            condition,
            object,
            discovered,
        }
    }
}

#[async_trait::async_trait]
impl<P, K> Dependent<P> for Node<P, K>
where
    P: Resource + Send + Sync + 'static,
    K: ResourceKind,
{
    fn id(&self) -> &str {
        &self.id
    }

    fn suffix(&self) -> &str {
        &self.suffix
    }

    fn kind(&self) -> ApiResource {
        api_resource::<K>()
    }

    fn depends_on(&self) -> &[String] {
        &self.depends_on
    }

    async fn reconcile_one(&self, primary: &P, ctx: &PassContext) -> Outcome {
        let kind = self.kind();
        let name = name_for(primary, &self.suffix);
        let Some(namespace) = primary.namespace() else {
            return self.invalid("primary has no namespace", ctx);
        };
        let store = ctx.store();
        let mut attempt = 0;

        loop {
            let retry = |err: &StoreError, attempt: &mut usize| {
                if err.is_retryable() && *attempt < MAX_RETRIES {
                    *attempt += 1;
                    event!(
                        Level::WARN,
                        node = %self.id,
                        resource_name = %name,
                        attempt = *attempt,
                        err = %err,
                        "Retrying {} {}.",
                        kind.kind,
                        name
                    );
                    true
                } else {
                    false
                }
            };

            let live = match store.get(&kind, &namespace, &name).await {
                Ok(live) => live,
                Err(err) if retry(&err, &mut attempt) => continue,
                Err(err) => return self.failed(&err, ctx),
            };

            if !self.activation.is_met(primary, live.as_ref(), ctx) {
                if live.is_none() {
                    return Outcome::Inactive;
                }
                match store.delete(&kind, &namespace, &name).await {
                    Ok(()) => {
                        event!(
                            Level::INFO,
                            node = %self.id,
                            resource_name = %name,
                            "Deleted {} {}.",
                            kind.kind,
                            name
                        );
                        return Outcome::Inactive;
                    }
                    Err(err) if retry(&err, &mut attempt) => continue,
                    Err(err) => return self.failed(&err, ctx),
                }
            }

            if let Some(missing) = self
                .depends_on
                .iter()
                .find(|dependency| ctx.materialized(dependency).is_none())
            {
                return self.skipped(format!("waiting for {missing}"), ctx);
            }
            if let Some((waiting_for, precondition)) = &self.precondition {
                if !precondition.is_met(primary, live.as_ref(), ctx) {
                    return self.skipped(waiting_for.clone(), ctx);
                }
            }

            let desired = match self.desired_against(primary, live.as_ref(), ctx) {
                Ok(desired) => desired,
                Err(err) => return self.invalid(err, ctx),
            };

            let result = match live {
                None => match serde_json::from_value::<DynamicObject>(desired) {
                    Ok(object) => store.create(&kind, &object).await.map(|created| {
                        event!(
                            Level::INFO,
                            node = %self.id,
                            resource_name = %name,
                            "Created {} {}.",
                            kind.kind,
                            name
                        );
                        created
                    }),
                    Err(err) => return self.invalid(err, ctx),
                },
                Some(live) => {
                    let current = match serde_json::to_value(&live) {
                        Ok(current) => current,
                        Err(err) => return self.invalid(err, ctx),
                    };
                    if is_subset(&desired, &current) {
                        event!(
                            Level::DEBUG,
                            node = %self.id,
                            resource_name = %name,
                            "{} {} is up to date.",
                            kind.kind,
                            name
                        );
                        Ok(live)
                    } else {
                        match serde_json::from_value::<DynamicObject>(overlay(&current, &desired)) {
                            Ok(merged) => store.update(&kind, &merged).await.map(|updated| {
                                event!(
                                    Level::INFO,
                                    node = %self.id,
                                    resource_name = %name,
                                    "Updated {} {}.",
                                    kind.kind,
                                    name
                                );
                                updated
                            }),
                            Err(err) => return self.invalid(err, ctx),
                        }
                    }
                }
            };

            match result {
                Ok(object) => return self.applied(primary, &name, object, ctx),
                Err(err) if retry(&err, &mut attempt) => continue,
                Err(err) => return self.failed(&err, ctx),
            }
        }
    }

    async fn delete(&self, primary: &P, ctx: &PassContext) -> Result<(), StoreError> {
        let namespace = primary.namespace().unwrap_or_default();
        ctx.store()
            .delete(&self.kind(), &namespace, &name_for(primary, &self.suffix))
            .await
    }
}
