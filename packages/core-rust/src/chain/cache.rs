//! Reuse of sorted chains across dispatches.
//!
//! Sorting is the expensive part of assembling a chain. A scope that builds
//! chains from the same provider lists for every message keeps one
//! [`PhaseChainCache`] per direction; as long as every contributing list is
//! unchanged (same snapshot pointer), dispatches get a fresh copy of the
//! cached chain instead of a re-sort.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use super::{PhaseInterceptorChain, UnknownPhasePolicy};
use crate::error::ChainError;
use crate::interceptor::SharedInterceptor;
use crate::phase::PhaseSet;
use crate::provider::InterceptorList;

struct CachedChain {
    phases: PhaseSet,
    policy: UnknownPhasePolicy,
    lists: Vec<Arc<Vec<SharedInterceptor>>>,
    template: Arc<PhaseInterceptorChain>,
}

impl CachedChain {
    fn matches(
        &self,
        phases: &PhaseSet,
        policy: UnknownPhasePolicy,
        lists: &[Arc<Vec<SharedInterceptor>>],
    ) -> bool {
        self.phases.ptr_eq(phases)
            && self.policy == policy
            && self.lists.len() == lists.len()
            && self
                .lists
                .iter()
                .zip(lists)
                .all(|(cached, current)| Arc::ptr_eq(cached, current))
    }
}

/// Single-entry cache of a sorted chain keyed by list identity and
/// unknown-phase policy.
#[derive(Default)]
pub struct PhaseChainCache {
    cached: Mutex<Option<CachedChain>>,
}

impl PhaseChainCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a ready-to-run chain built from `lists` in order.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError::UnknownPhase`] when a rebuild is needed and
    /// `policy` rejects an interceptor's phase.
    pub fn get(
        &self,
        phases: &PhaseSet,
        lists: &[&InterceptorList],
        policy: UnknownPhasePolicy,
    ) -> Result<Arc<PhaseInterceptorChain>, ChainError> {
        let snapshots: Vec<Arc<Vec<SharedInterceptor>>> =
            lists.iter().map(|list| list.snapshot()).collect();

        if let Some(cached) = self.cached.lock().as_ref() {
            if cached.matches(phases, policy, &snapshots) {
                trace!("interceptor chain cache hit");
                return Ok(cached.template.fresh_copy());
            }
        }

        let template = PhaseInterceptorChain::build(
            phases,
            snapshots.iter().flat_map(|list| list.iter().cloned()),
            policy,
        )?;
        let chain = template.fresh_copy();
        *self.cached.lock() = Some(CachedChain {
            phases: phases.clone(),
            policy,
            lists: snapshots,
            template,
        });
        Ok(chain)
    }

    /// Drops the cached chain; the next `get` rebuilds.
    pub fn invalidate(&self) {
        *self.cached.lock() = None;
    }

    #[must_use]
    pub fn is_populated(&self) -> bool {
        self.cached.lock().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interceptor::{FnInterceptor, InterceptorMeta};

    fn noop(id: &str, phase: &str) -> SharedInterceptor {
        FnInterceptor::new(InterceptorMeta::new(id, phase), |_| Ok(())).shared()
    }

    fn phases() -> PhaseSet {
        PhaseSet::from_names(["receive", "invoke", "send"]).unwrap()
    }

    #[test]
    fn unchanged_lists_reuse_sorted_sequence() {
        let phases = phases();
        let bus = InterceptorList::from_vec(vec![noop("b", "invoke")]);
        let endpoint = InterceptorList::from_vec(vec![noop("a", "receive")]);
        let cache = PhaseChainCache::new();

        let first = cache.get(&phases, &[&bus, &endpoint], UnknownPhasePolicy::Reject).unwrap();
        let second = cache.get(&phases, &[&bus, &endpoint], UnknownPhasePolicy::Reject).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(first.ids(), vec!["a", "b"]);
        assert_eq!(second.ids(), first.ids());
        assert!(Arc::ptr_eq(&first.snapshot()[0], &second.snapshot()[0]));
    }

    #[test]
    fn list_change_triggers_rebuild() {
        let phases = phases();
        let bus = InterceptorList::from_vec(vec![noop("b", "invoke")]);
        let cache = PhaseChainCache::new();
        cache.get(&phases, &[&bus], UnknownPhasePolicy::Reject).unwrap();

        bus.push(noop("c", "send"));
        let rebuilt = cache.get(&phases, &[&bus], UnknownPhasePolicy::Reject).unwrap();
        assert_eq!(rebuilt.ids(), vec!["b", "c"]);
    }

    #[test]
    fn cached_copies_start_fresh() {
        let phases = phases();
        let list = InterceptorList::from_vec(vec![noop("a", "receive")]);
        let cache = PhaseChainCache::new();
        let first = cache.get(&phases, &[&list], UnknownPhasePolicy::Reject).unwrap();
        first.do_intercept(&crate::message::Message::new()).unwrap();

        let second = cache.get(&phases, &[&list], UnknownPhasePolicy::Reject).unwrap();
        assert_eq!(second.position(), 0);
        assert_eq!(second.state(), crate::chain::ChainState::Executing);
    }

    #[test]
    fn build_errors_are_not_cached() {
        let phases = phases();
        let list = InterceptorList::from_vec(vec![noop("x", "nowhere")]);
        let cache = PhaseChainCache::new();
        assert!(cache.get(&phases, &[&list], UnknownPhasePolicy::Reject).is_err());
        assert!(!cache.is_populated());

        let lenient = cache.get(&phases, &[&list], UnknownPhasePolicy::Skip).unwrap();
        assert!(lenient.is_empty());
        cache.invalidate();
        assert!(!cache.is_populated());
    }

    #[test]
    fn lenient_chain_is_not_served_to_strict_callers() {
        let phases = phases();
        let list = InterceptorList::from_vec(vec![noop("a", "receive"), noop("x", "nowhere")]);
        let cache = PhaseChainCache::new();

        let lenient = cache.get(&phases, &[&list], UnknownPhasePolicy::Skip).unwrap();
        assert_eq!(lenient.ids(), vec!["a"]);

        let strict = cache.get(&phases, &[&list], UnknownPhasePolicy::Reject);
        assert!(matches!(strict, Err(ChainError::UnknownPhase { .. })));
    }
}
