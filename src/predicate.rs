//! Activation conditions, preconditions and the registry they are looked up
//! in.
//!
//! Predicates are pure and total: they read the primary, optionally the
//! node's live secondary, and the pass context, and answer yes or no. A
//! secondary that does not exist yet reads as `false`, never as an error.

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;

use kube::core::DynamicObject;

use crate::context::PassContext;

pub trait Predicate<P>: Send + Sync {
    fn is_met(&self, primary: &P, secondary: Option<&DynamicObject>, ctx: &PassContext) -> bool;
}

impl<P> Predicate<P> for Arc<dyn Predicate<P>> {
    fn is_met(&self, primary: &P, secondary: Option<&DynamicObject>, ctx: &PassContext) -> bool {
        self.as_ref().is_met(primary, secondary, ctx)
    }
}

pub trait PredicateExt<P>: Predicate<P> + Sized {
    fn and<B: Predicate<P>>(self, other: B) -> And<Self, B> {
        And(self, other)
    }

    fn or<B: Predicate<P>>(self, other: B) -> Or<Self, B> {
        Or(self, other)
    }

    fn not(self) -> Not<Self> {
        Not(self)
    }
}

impl<P, T: Predicate<P>> PredicateExt<P> for T {}

pub struct And<A, B>(A, B);

impl<P, A: Predicate<P>, B: Predicate<P>> Predicate<P> for And<A, B> {
    fn is_met(&self, primary: &P, secondary: Option<&DynamicObject>, ctx: &PassContext) -> bool {
        self.0.is_met(primary, secondary, ctx) && self.1.is_met(primary, secondary, ctx)
    }
}

pub struct Or<A, B>(A, B);

impl<P, A: Predicate<P>, B: Predicate<P>> Predicate<P> for Or<A, B> {
    fn is_met(&self, primary: &P, secondary: Option<&DynamicObject>, ctx: &PassContext) -> bool {
        self.0.is_met(primary, secondary, ctx) || self.1.is_met(primary, secondary, ctx)
    }
}

pub struct Not<A>(A);

impl<P, A: Predicate<P>> Predicate<P> for Not<A> {
    fn is_met(&self, primary: &P, secondary: Option<&DynamicObject>, ctx: &PassContext) -> bool {
        !self.0.is_met(primary, secondary, ctx)
    }
}

pub struct Always;

impl<P> Predicate<P> for Always {
    fn is_met(&self, _: &P, _: Option<&DynamicObject>, _: &PassContext) -> bool {
        true
    }
}

pub fn always() -> Always {
    Always
}

pub struct When<P, F>(F, PhantomData<fn(&P)>);

impl<P, F> Predicate<P> for When<P, F>
where
    F: Fn(&P) -> bool + Send + Sync,
{
    fn is_met(&self, primary: &P, _: Option<&DynamicObject>, _: &PassContext) -> bool {
        (self.0)(primary)
    }
}

/// A predicate over the primary alone, e.g. "module X is enabled".
pub fn when<P, F>(f: F) -> When<P, F>
where
    F: Fn(&P) -> bool + Send + Sync,
{
    When(f, PhantomData)
}

pub struct FromFn<P, F>(F, PhantomData<fn(&P)>);

impl<P, F> Predicate<P> for FromFn<P, F>
where
    F: Fn(&P, Option<&DynamicObject>, &PassContext) -> bool + Send + Sync,
{
    fn is_met(&self, primary: &P, secondary: Option<&DynamicObject>, ctx: &PassContext) -> bool {
        (self.0)(primary, secondary, ctx)
    }
}

pub fn from_fn<P, F>(f: F) -> FromFn<P, F>
where
    F: Fn(&P, Option<&DynamicObject>, &PassContext) -> bool + Send + Sync,
{
    FromFn(f, PhantomData)
}

/// Met once node `id` has materialized its secondary earlier in the pass.
pub struct Materialized(String);

impl<P> Predicate<P> for Materialized {
    fn is_met(&self, _: &P, _: Option<&DynamicObject>, ctx: &PassContext) -> bool {
        ctx.materialized(&self.0).is_some()
    }
}

pub fn materialized(id: impl Into<String>) -> Materialized {
    Materialized(id.into())
}

/// Met once some earlier node has published a value under `key`.
pub struct Discovered(String);

impl<P> Predicate<P> for Discovered {
    fn is_met(&self, _: &P, _: Option<&DynamicObject>, ctx: &PassContext) -> bool {
        ctx.discovered(&self.0).is_some_and(|value| !value.is_empty())
    }
}

pub fn discovered(key: impl Into<String>) -> Discovered {
    Discovered(key.into())
}

/// Met when the node's own secondary currently exists.
pub struct SecondaryExists;

impl<P> Predicate<P> for SecondaryExists {
    fn is_met(&self, _: &P, secondary: Option<&DynamicObject>, _: &PassContext) -> bool {
        secondary.is_some()
    }
}

/// Named predicates, so activation conditions and preconditions can be
/// shared between nodes and referred to by a stable identifier.
pub struct Evaluator<P> {
    predicates: BTreeMap<String, Arc<dyn Predicate<P>>>,
}

impl<P> Default for Evaluator<P> {
    fn default() -> Self {
        Self {
            predicates: BTreeMap::new(),
        }
    }
}

impl<P: 'static> Evaluator<P> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, id: impl Into<String>, predicate: impl Predicate<P> + 'static) {
        self.predicates.insert(id.into(), Arc::new(predicate));
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Predicate<P>>> {
        self.predicates.get(id).cloned()
    }

    /// Unknown identifiers evaluate to `false`.
    pub fn evaluate(
        &self,
        id: &str,
        primary: &P,
        secondary: Option<&DynamicObject>,
        ctx: &PassContext,
    ) -> bool {
        self.predicates
            .get(id)
            .is_some_and(|predicate| predicate.is_met(primary, secondary, ctx))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use kube::core::DynamicObject;

    use super::*;
    use crate::context::testing::context;
    use crate::store::MemoryStore;

    struct Primary {
        identity: bool,
    }

    fn object(name: &str) -> DynamicObject {
        serde_json::from_value(serde_json::json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": {"name": name, "namespace": "ns"}
        }))
        .unwrap()
    }

    #[test]
    fn missing_secondaries_read_as_false() {
        let ctx = context(Arc::new(MemoryStore::new()));
        let primary = Primary { identity: true };
        assert!(!materialized("identity-service").is_met(&primary, None, &ctx));
        assert!(!discovered("identity.url").is_met(&primary, None, &ctx));
        assert!(!SecondaryExists.is_met(&primary, None, &ctx));
        assert!(SecondaryExists.is_met(&primary, Some(&object("x")), &ctx));
    }

    #[test]
    fn composites_chain_module_flags_and_discoveries() {
        let mut ctx = context(Arc::new(MemoryStore::new()));
        let installable = when(|p: &Primary| p.identity).and(discovered("identity.url"));
        let enabled = Primary { identity: true };
        let disabled = Primary { identity: false };

        assert!(!installable.is_met(&enabled, None, &ctx));
        ctx.record(
            "identity-service",
            object("suite-identity"),
            vec![("identity.url".into(), "http://suite-identity.ns.svc:8080".into())],
        );
        assert!(installable.is_met(&enabled, None, &ctx));
        assert!(!installable.is_met(&disabled, None, &ctx));
        assert!(installable.not().is_met(&disabled, None, &ctx));
        assert!(when(|p: &Primary| p.identity)
            .or(materialized("identity-service"))
            .is_met(&disabled, None, &ctx));
    }

    #[test]
    fn evaluator_resolves_by_id_and_is_total() {
        let ctx = context(Arc::new(MemoryStore::new()));
        let mut evaluator = Evaluator::new();
        evaluator.register("identity-enabled", when(|p: &Primary| p.identity));
        evaluator.register(
            "identity-secret-absent",
            from_fn(|_: &Primary, secondary: Option<&DynamicObject>, _: &PassContext| {
                secondary.is_none()
            }),
        );
        let primary = Primary { identity: true };
        assert!(evaluator.evaluate("identity-enabled", &primary, None, &ctx));
        assert!(evaluator.evaluate("identity-secret-absent", &primary, None, &ctx));
        assert!(!evaluator.evaluate("no-such-predicate", &primary, None, &ctx));

        let shared = evaluator.get("identity-enabled").unwrap();
        assert!(shared.and(always()).is_met(&primary, None, &ctx));
    }
}
