use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use kube::ResourceExt;
use tracing::{event, info_span, Instrument, Level};

use crate::context::{Clock, PassContext, SystemClock};
use crate::error::Error;
use crate::status::{aggregate, WorkflowStatus};
use crate::store::{api_resource, fetch, Object, Store};
use crate::workflow::Workflow;

/// A resource whose spec drives a [`Workflow`] and whose status receives
/// the aggregated result.
pub trait Primary: Object {
    /// The name to use for the finalizer. This must be unique across
    /// controllers - if multiple controllers with the same finalizer name
    /// run against the same resource, unexpected behavior can occur.
    const FINALIZER_NAME: &'static str;

    fn status(&self) -> Option<&WorkflowStatus>;
}

/// Tracks which primaries have a pass in flight, and whether another
/// trigger arrived while it ran.
#[derive(Default)]
pub struct PassQueue {
    running: Mutex<BTreeMap<String, bool>>,
}

impl PassQueue {
    /// Returns `true` if the caller should run a pass now. Otherwise a pass
    /// is already running and a follow-up pass has been requested from it.
    pub fn begin(&self, key: &str) -> bool {
        let mut running = self.running.lock().unwrap();
        match running.get_mut(key) {
            Some(rerun) => {
                *rerun = true;
                false
            }
            None => {
                running.insert(key.to_owned(), false);
                true
            }
        }
    }

    /// Returns `true` if triggers were coalesced during the pass that just
    /// finished and the caller should run one more.
    pub fn finish(&self, key: &str) -> bool {
        let mut running = self.running.lock().unwrap();
        match running.get_mut(key) {
            Some(rerun) if *rerun => {
                *rerun = false;
                true
            }
            _ => {
                running.remove(key);
                false
            }
        }
    }

    pub fn abandon(&self, key: &str) {
        self.running.lock().unwrap().remove(key);
    }
}

/// Runs reconciliation passes: one walk of the workflow followed by exactly
/// one status commit.
pub struct Driver<P> {
    workflow: Arc<Workflow<P>>,
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    queue: PassQueue,
}

impl<P: Primary> Driver<P> {
    pub fn new(workflow: Workflow<P>, store: Arc<dyn Store>) -> Self {
        Self {
            workflow: Arc::new(workflow),
            store,
            clock: Arc::new(SystemClock),
            queue: PassQueue::default(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn workflow(&self) -> &Workflow<P> {
        &self.workflow
    }

    fn context(&self, primary: &P) -> Result<PassContext, Error> {
        let name = primary.name_any();
        let namespace = primary
            .namespace()
            .ok_or_else(|| Error::MissingMetadata(name.clone(), "namespace"))?;
        let generation = primary.meta().generation.unwrap_or_default();
        let span = info_span!(
            "pass",
            resource_name = %name,
            namespace = %namespace,
            generation
        );
        Ok(PassContext::new(
            Arc::clone(&self.store),
            Arc::clone(&self.clock),
            span,
            namespace,
            generation,
        ))
    }

    /// Runs one full pass for `primary` and commits the resulting status.
    pub async fn reconcile(&self, primary: &P) -> Result<WorkflowStatus, Error> {
        let mut ctx = self.context(primary)?;
        let span = ctx.span().clone();
        let report = self.workflow.run(primary, &mut ctx).await;
        let status = aggregate(
            report.conditions(),
            report.active(),
            primary.status(),
            ctx.generation(),
        );
        self.commit(primary, &status).instrument(span.clone()).await?;
        span.in_scope(|| {
            event!(
                Level::INFO,
                status = ?status.status,
                observed_generation = status.observed_generation,
                "Pass finished: {}",
                status.message.as_deref().unwrap_or_default()
            )
        });
        Ok(status)
    }

    async fn commit(&self, primary: &P, status: &WorkflowStatus) -> Result<(), Error> {
        let value = serde_json::to_value(status)?;
        let namespace = primary.namespace().unwrap_or_default();
        self.store
            .patch_status(&api_resource::<P>(), &namespace, &primary.name_any(), &value)
            .await
            .map_err(|err| {
                event!(Level::ERROR, err = %err, "Failed to commit status.");
                Error::from(err)
            })
    }

    /// Deletes every secondary of `primary`, last node first.
    pub async fn cleanup(&self, primary: &P) -> Result<(), Error> {
        let ctx = self.context(primary)?;
        let span = ctx.span().clone();
        self.workflow
            .cleanup(primary, &ctx)
            .instrument(span)
            .await
            .map_err(Error::from)
    }

    /// Reads the latest version of the named primary and reconciles it.
    ///
    /// At most one pass runs per primary: triggers arriving while a pass is
    /// in flight are coalesced into a single follow-up pass, which re-reads
    /// the primary. Coalesced callers get `Ok(None)`, as does a primary that
    /// no longer exists.
    pub async fn trigger(&self, namespace: &str, name: &str) -> Result<Option<WorkflowStatus>, Error> {
        let key = format!("{namespace}/{name}");
        if !self.queue.begin(&key) {
            event!(
                Level::DEBUG,
                resource_name = %name,
                namespace = %namespace,
                "Pass already running, coalescing trigger."
            );
            return Ok(None);
        }
        loop {
            let status = match fetch::<P>(self.store.as_ref(), namespace, name).await {
                Ok(Some(primary)) => self.reconcile(&primary).await.map(Some),
                Ok(None) => Ok(None),
                Err(err) => Err(Error::from(err)),
            };
            match status {
                Ok(status) if !self.queue.finish(&key) => return Ok(status),
                Ok(_) => continue,
                Err(err) => {
                    self.queue.abandon(&key);
                    return Err(err);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn triggers_during_a_pass_coalesce_into_one_rerun() {
        let queue = PassQueue::default();
        assert!(queue.begin("ns/suite"));
        assert!(!queue.begin("ns/suite"));
        assert!(!queue.begin("ns/suite"));
        assert!(queue.begin("ns/other"));

        assert!(queue.finish("ns/suite"));
        assert!(!queue.finish("ns/suite"));
        assert!(queue.begin("ns/suite"));
        queue.abandon("ns/suite");
        assert!(queue.begin("ns/suite"));
    }
}
