use std::collections::BTreeMap;
use std::error::Error as _;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::FutureExt;
use futures::stream::StreamExt;
use kube::api::Api;
use kube::core::{ApiResource, DynamicObject, NamespaceResourceScope};
use kube::{Client, Resource, ResourceExt};
use kube_runtime::controller::Action;
use kube_runtime::finalizer::{finalizer, Event};
use kube_runtime::watcher;
use rand::{thread_rng, Rng};
use tracing::{event, Level};

use crate::driver::{Driver, Primary};
use crate::error::Error;
use crate::status::OverallStatus;
use crate::store::KubeStore;
use crate::workflow::Workflow;

/// The [`Controller`] watches primaries of kind `P` and every secondary kind
/// their [`Workflow`] manages, running a reconciliation pass whenever any of
/// them change.
///
/// kube-runtime never runs two reconciliations of the same object at once
/// and collapses triggers that arrive while one is running, so each primary
/// sees at most one pass at a time.
pub struct Controller<P: Primary> {
    make_api: Box<dyn Fn(&P) -> Api<P> + Sync + Send + 'static>,
    controller: kube_runtime::controller::Controller<P>,
    driver: Driver<P>,
}

impl<P> Controller<P>
where
    P: Primary + Resource<Scope = NamespaceResourceScope>,
{
    /// Creates a new controller for primaries in the given `namespace`.
    /// Secondaries are watched in the same namespace. A
    /// [`watcher::Config`] can be given to limit the primaries watched (for
    /// instance, `watcher::Config::default().labels("app=myapp")`).
    pub fn namespaced(
        client: Client,
        workflow: Workflow<P>,
        namespace: &str,
        wc: watcher::Config,
    ) -> Self {
        let controller = kube_runtime::controller::Controller::new(
            Api::<P>::namespaced(client.clone(), namespace),
            wc,
        );
        let owned_api = {
            let client = client.clone();
            let namespace = namespace.to_owned();
            move |kind: &ApiResource| Api::<DynamicObject>::namespaced_with(client.clone(), &namespace, kind)
        };
        Self::with_controller(client, workflow, controller, owned_api)
    }

    /// Creates a new controller for primaries in every namespace.
    pub fn namespaced_all(client: Client, workflow: Workflow<P>, wc: watcher::Config) -> Self {
        let controller =
            kube_runtime::controller::Controller::new(Api::<P>::all(client.clone()), wc);
        let owned_api = {
            let client = client.clone();
            move |kind: &ApiResource| Api::<DynamicObject>::all_with(client.clone(), kind)
        };
        Self::with_controller(client, workflow, controller, owned_api)
    }

    fn with_controller(
        client: Client,
        workflow: Workflow<P>,
        mut controller: kube_runtime::controller::Controller<P>,
        owned_api: impl Fn(&ApiResource) -> Api<DynamicObject>,
    ) -> Self {
        let driver = Driver::new(workflow, Arc::new(KubeStore::new(client.clone())));
        for kind in driver.workflow().kinds() {
            controller = controller.owns_with(owned_api(&kind), kind, watcher::Config::default());
        }
        let make_api = Box::new(move |resource: &P| {
            Api::<P>::namespaced(client.clone(), &resource.namespace().unwrap_or_default())
        });
        Self {
            make_api,
            controller,
            driver,
        }
    }

    /// Run the controller. This method will not return. A pass runs when a
    /// primary is created or updated, or when one of its secondaries
    /// changes, and its secondaries are deleted when it is about to be
    /// deleted.
    pub async fn run(self) {
        let Self {
            make_api,
            controller,
            driver,
        } = self;
        let backoffs = Arc::new(Mutex::new(BTreeMap::new()));
        let backoffs = &backoffs;
        controller
            .run(
                |resource, driver| {
                    let uid = resource.uid().unwrap_or_default();
                    let backoffs = Arc::clone(backoffs);
                    reconcile(driver, make_api(&resource), resource).inspect(move |result| {
                        if result.is_ok() {
                            backoffs.lock().unwrap().remove(&uid);
                        }
                    })
                },
                |resource, _err, _driver| {
                    let consecutive_errors = {
                        let uid = resource.uid().unwrap_or_default();
                        let mut backoffs = backoffs.lock().unwrap();
                        let consecutive_errors: u32 =
                            backoffs.get(&uid).copied().unwrap_or_default();
                        backoffs.insert(uid, consecutive_errors.saturating_add(1));
                        consecutive_errors
                    };
                    error_action(consecutive_errors)
                },
                Arc::new(driver),
            )
            .for_each(|reconciliation_result| async move {
                let kind = P::kind(&()).into_owned();
                match reconciliation_result {
                    Ok(resource) => {
                        event!(
                            Level::INFO,
                            resource_name = %resource.0.name,
                            controller = P::FINALIZER_NAME,
                            "{} reconciliation successful.",
                            kind
                        );
                    }
                    Err(err) => event!(
                        Level::ERROR,
                        err = %err,
                        source = err.source(),
                        controller = P::FINALIZER_NAME,
                        "{} reconciliation error.",
                        kind
                    ),
                }
            })
            .await
    }
}

/// Where to go after a pass, given the overall status it produced. Ready
/// primaries are resynced at a random time between 40 and 60 minutes in the
/// future, primaries still converging are looked at again in about ten
/// seconds, and errored primaries wait for a spec change.
pub fn next_action(status: OverallStatus) -> Action {
    match status {
        OverallStatus::Ready | OverallStatus::Unknown => {
            Action::requeue(Duration::from_secs(thread_rng().gen_range(2400..3600)))
        }
        OverallStatus::Reconciling => {
            Action::requeue(Duration::from_millis(thread_rng().gen_range(8000..12000)))
        }
        OverallStatus::Error => Action::await_change(),
    }
}

/// Exponential backoff with a max of 256 seconds and some added
/// randomization to avoid thundering herds.
pub fn error_action(consecutive_errors: u32) -> Action {
    let seconds = 2u64.pow(consecutive_errors.min(7) + 1);
    Action::requeue(Duration::from_millis(
        thread_rng().gen_range((seconds * 500)..(seconds * 1000)),
    ))
}

async fn reconcile<P: Primary>(
    driver: Arc<Driver<P>>,
    api: Api<P>,
    resource: Arc<P>,
) -> Result<Action, kube_runtime::finalizer::Error<Error>> {
    let kind = P::kind(&()).into_owned();
    let mut ran = false;
    let res = finalizer(&api, P::FINALIZER_NAME, Arc::clone(&resource), |event| async {
        ran = true;
        event!(
            Level::INFO,
            resource_name = %resource.name_any(),
            controller = P::FINALIZER_NAME,
            "Reconciling {} ({}).",
            kind,
            match event {
                Event::Apply(_) => "apply",
                Event::Cleanup(_) => "cleanup",
            }
        );
        let action = match event {
            Event::Apply(resource) => next_action(driver.reconcile(&resource).await?.status),
            Event::Cleanup(resource) => {
                driver.cleanup(&resource).await?;
                Action::await_change()
            }
        };
        Ok(action)
    })
    .await;
    if !ran {
        event!(
            Level::INFO,
            resource_name = %resource.name_any(),
            controller = P::FINALIZER_NAME,
            "Reconciling {} ({}).",
            kind,
            if resource.meta().deletion_timestamp.is_some() {
                "delete"
            } else {
                "init"
            }
        );
    }
    res
}
