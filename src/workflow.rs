use std::collections::BTreeMap;

use kube::core::ApiResource;
use tracing::{event, Instrument, Level};

use crate::context::PassContext;
use crate::error::{GraphError, StoreError};
use crate::node::{Dependent, Outcome};
use crate::status::Condition;

/// An ordered set of nodes. Declaration order is evaluation order, and a
/// node may only depend on nodes declared before it, so that order is always
/// a topological order of the dependency graph.
pub struct Workflow<P> {
    nodes: Vec<Box<dyn Dependent<P>>>,
}

pub struct WorkflowBuilder<P> {
    nodes: Vec<Box<dyn Dependent<P>>>,
}

impl<P> Default for WorkflowBuilder<P> {
    fn default() -> Self {
        Self { nodes: Vec::new() }
    }
}

impl<P: Send + Sync + 'static> WorkflowBuilder<P> {
    pub fn node(mut self, node: impl Dependent<P> + 'static) -> Self {
        self.nodes.push(Box::new(node));
        self
    }

    /// Checks that ids are unique, that no two nodes own the same kind and
    /// name, and that dependencies point backwards.
    pub fn build(self) -> Result<Workflow<P>, GraphError> {
        let mut seen: Vec<&str> = Vec::new();
        let mut names: BTreeMap<(String, String), &str> = BTreeMap::new();
        for node in &self.nodes {
            if seen.contains(&node.id()) {
                return Err(GraphError::DuplicateNode(node.id().to_owned()));
            }
            for dependency in node.depends_on() {
                if !seen.contains(&dependency.as_str()) {
                    return Err(GraphError::UnknownDependency {
                        node: node.id().to_owned(),
                        dependency: dependency.clone(),
                    });
                }
            }
            let kind = node.kind();
            let key = (
                format!("{}/{}", kind.api_version, kind.kind),
                node.suffix().to_owned(),
            );
            if let Some(first) = names.get(&key) {
                return Err(GraphError::DuplicateName {
                    first: (*first).to_owned(),
                    second: node.id().to_owned(),
                    kind: kind.kind,
                    suffix: key.1,
                });
            }
            names.insert(key, node.id());
            seen.push(node.id());
        }
        Ok(Workflow { nodes: self.nodes })
    }
}

/// What every node did during one pass, in evaluation order.
#[derive(Clone, Debug, Default)]
pub struct PassReport {
    pub outcomes: Vec<(String, Outcome)>,
}

impl PassReport {
    pub fn conditions(&self) -> Vec<Condition> {
        self.outcomes
            .iter()
            .filter_map(|(_, outcome)| outcome.condition().cloned())
            .collect()
    }

    /// Number of nodes whose activation condition held.
    pub fn active(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| outcome.is_active())
            .count()
    }

    pub fn outcome(&self, id: &str) -> Option<&Outcome> {
        self.outcomes
            .iter()
            .find(|(node, _)| node == id)
            .map(|(_, outcome)| outcome)
    }
}

impl<P: Send + Sync + 'static> Workflow<P> {
    pub fn builder() -> WorkflowBuilder<P> {
        WorkflowBuilder::default()
    }

    pub fn ids(&self) -> Vec<&str> {
        self.nodes.iter().map(|node| node.id()).collect()
    }

    /// Every secondary kind the workflow manages, without duplicates.
    pub fn kinds(&self) -> Vec<ApiResource> {
        let mut kinds: Vec<ApiResource> = Vec::new();
        for kind in self.nodes.iter().map(|node| node.kind()) {
            if !kinds.contains(&kind) {
                kinds.push(kind);
            }
        }
        kinds
    }

    /// Walks every node once, in order. A failing node does not stop the
    /// walk and nothing already applied is rolled back.
    pub async fn run(&self, primary: &P, ctx: &mut PassContext) -> PassReport {
        let mut report = PassReport::default();
        for node in &self.nodes {
            let span = ctx.span().clone();
            let outcome = node.reconcile_one(primary, ctx).instrument(span).await;
            if let Outcome::Applied {
                object, discovered, ..
            } = &outcome
            {
                ctx.record(node.id(), object.clone(), discovered.clone());
            }
            report.outcomes.push((node.id().to_owned(), outcome));
        }
        report
    }

    /// Deletes every node's secondary in reverse order. Keeps going past
    /// failures and reports the first one.
    pub async fn cleanup(&self, primary: &P, ctx: &PassContext) -> Result<(), StoreError> {
        let mut first_err = None;
        for node in self.nodes.iter().rev() {
            let span = ctx.span().clone();
            if let Err(err) = node.delete(primary, ctx).instrument(span).await {
                event!(
                    Level::ERROR,
                    node = %node.id(),
                    err = %err,
                    "Failed to delete secondary of {}.",
                    node.id()
                );
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}
