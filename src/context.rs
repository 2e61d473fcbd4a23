use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::chrono::{DateTime, SecondsFormat, Utc};
use kube::core::DynamicObject;
use tracing::Span;

use crate::store::{from_dynamic, Object, Store};

/// Source of wall-clock time for condition transition timestamps.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    fn timestamp(&self) -> String {
        self.now().to_rfc3339_opts(SecondsFormat::Secs, true)
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Everything a node may consult during one reconciliation pass.
///
/// Nodes only ever get a shared reference; the workflow records what each
/// node materialized between node evaluations, so later nodes can read the
/// secondaries (and discovered values) of earlier ones.
pub struct PassContext {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    span: Span,
    namespace: String,
    generation: i64,
    materialized: BTreeMap<String, DynamicObject>,
    discovered: BTreeMap<String, String>,
}

impl PassContext {
    pub fn new(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        span: Span,
        namespace: impl Into<String>,
        generation: i64,
    ) -> Self {
        Self {
            store,
            clock,
            span,
            namespace: namespace.into(),
            generation,
            materialized: BTreeMap::new(),
            discovered: BTreeMap::new(),
        }
    }

    pub fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    /// The span every event emitted during this pass belongs to.
    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Generation of the primary this pass is reconciling.
    pub fn generation(&self) -> i64 {
        self.generation
    }

    /// The secondary materialized by node `id` earlier in this pass.
    pub fn materialized(&self, id: &str) -> Option<&DynamicObject> {
        self.materialized.get(id)
    }

    /// Typed view of [`materialized`](Self::materialized). A missing or
    /// undecodable object reads as absent.
    pub fn secondary<K: Object>(&self, id: &str) -> Option<K> {
        self.materialized(id)
            .and_then(|object| from_dynamic(object).ok())
    }

    pub fn discovered(&self, key: &str) -> Option<&str> {
        self.discovered.get(key).map(String::as_str)
    }

    pub(crate) fn record(&mut self, id: &str, object: DynamicObject, discovered: Vec<(String, String)>) {
        self.materialized.insert(id.to_owned(), object);
        self.discovered.extend(discovered);
    }
}
