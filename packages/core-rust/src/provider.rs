//! Interceptor providers: scoped holders of the four directional interceptor
//! lists.
//!
//! Lists are read far more often than they are reconfigured, so each one is an
//! [`ArcSwap`] over an immutable vector. Readers take a snapshot and iterate
//! it freely; writers build a new vector and swap it in (last writer wins).
//! Snapshot pointers double as change detection for the chain cache.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::RwLock;

use crate::interceptor::SharedInterceptor;
use crate::phase::Direction;
use crate::properties::{Properties, PropertyScope, PropertyValue};

// ---------------------------------------------------------------------------
// InterceptorList
// ---------------------------------------------------------------------------

/// Copy-on-write interceptor list with snapshot reads.
pub struct InterceptorList {
    items: ArcSwap<Vec<SharedInterceptor>>,
}

impl InterceptorList {
    #[must_use]
    pub fn new() -> Self {
        Self::from_vec(Vec::new())
    }

    #[must_use]
    pub fn from_vec(items: Vec<SharedInterceptor>) -> Self {
        Self {
            items: ArcSwap::from_pointee(items),
        }
    }

    /// Current contents. Later mutations never affect a returned snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Arc<Vec<SharedInterceptor>> {
        self.items.load_full()
    }

    pub fn push(&self, interceptor: SharedInterceptor) {
        self.items.rcu(|current| {
            let mut next = Vec::clone(current);
            next.push(Arc::clone(&interceptor));
            next
        });
    }

    pub fn extend<I>(&self, interceptors: I)
    where
        I: IntoIterator<Item = SharedInterceptor>,
    {
        let added: Vec<SharedInterceptor> = interceptors.into_iter().collect();
        if added.is_empty() {
            return;
        }
        self.items.rcu(|current| {
            let mut next = Vec::with_capacity(current.len() + added.len());
            next.extend(current.iter().cloned());
            next.extend(added.iter().cloned());
            next
        });
    }

    /// Removes the first occurrence of this exact interceptor instance.
    pub fn remove(&self, interceptor: &SharedInterceptor) -> bool {
        let mut removed = false;
        self.items.rcu(|current| {
            let mut next = Vec::clone(current);
            removed = match next.iter().position(|held| Arc::ptr_eq(held, interceptor)) {
                Some(position) => {
                    next.remove(position);
                    true
                }
                None => false,
            };
            next
        });
        removed
    }

    /// Removes every interceptor with the given id. Returns how many were
    /// removed.
    pub fn remove_by_id(&self, id: &str) -> usize {
        let mut removed = 0;
        self.items.rcu(|current| {
            let next: Vec<SharedInterceptor> = current
                .iter()
                .filter(|held| held.id() != id)
                .cloned()
                .collect();
            removed = current.len() - next.len();
            next
        });
        removed
    }

    /// Replaces the contents in place; holders of `&InterceptorList` see the
    /// new contents on their next snapshot.
    pub fn replace_all(&self, interceptors: Vec<SharedInterceptor>) {
        self.items.store(Arc::new(interceptors));
    }

    pub fn clear(&self) {
        self.replace_all(Vec::new());
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.load().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.load().is_empty()
    }

    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        self.items.load().iter().map(|i| i.id().to_string()).collect()
    }
}

impl Default for InterceptorList {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for InterceptorList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.ids()).finish()
    }
}

// ---------------------------------------------------------------------------
// InterceptorProvider
// ---------------------------------------------------------------------------

/// A scope (bus, service, endpoint, binding, client) that contributes
/// interceptors to chains built within it.
///
/// The getters return live lists owned by the provider; setters replace the
/// contents of those same lists.
pub trait InterceptorProvider: Send + Sync {
    fn in_interceptors(&self) -> &InterceptorList;

    fn out_interceptors(&self) -> &InterceptorList;

    fn in_fault_interceptors(&self) -> &InterceptorList;

    fn out_fault_interceptors(&self) -> &InterceptorList;

    fn interceptors(&self, direction: Direction) -> &InterceptorList {
        match direction {
            Direction::In => self.in_interceptors(),
            Direction::Out => self.out_interceptors(),
            Direction::InFault => self.in_fault_interceptors(),
            Direction::OutFault => self.out_fault_interceptors(),
        }
    }

    fn set_in_interceptors(&self, interceptors: Vec<SharedInterceptor>) {
        self.in_interceptors().replace_all(interceptors);
    }

    fn set_out_interceptors(&self, interceptors: Vec<SharedInterceptor>) {
        self.out_interceptors().replace_all(interceptors);
    }

    fn set_in_fault_interceptors(&self, interceptors: Vec<SharedInterceptor>) {
        self.in_fault_interceptors().replace_all(interceptors);
    }

    fn set_out_fault_interceptors(&self, interceptors: Vec<SharedInterceptor>) {
        self.out_fault_interceptors().replace_all(interceptors);
    }
}

/// The four lists every provider owns.
#[derive(Debug, Default)]
struct DirectionalLists {
    in_list: InterceptorList,
    out_list: InterceptorList,
    in_fault_list: InterceptorList,
    out_fault_list: InterceptorList,
}

// ---------------------------------------------------------------------------
// BasicInterceptorProvider
// ---------------------------------------------------------------------------

/// Plain four-list holder.
#[derive(Debug, Default)]
pub struct BasicInterceptorProvider {
    lists: DirectionalLists,
}

impl BasicInterceptorProvider {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl InterceptorProvider for BasicInterceptorProvider {
    fn in_interceptors(&self) -> &InterceptorList {
        &self.lists.in_list
    }

    fn out_interceptors(&self) -> &InterceptorList {
        &self.lists.out_list
    }

    fn in_fault_interceptors(&self) -> &InterceptorList {
        &self.lists.in_fault_list
    }

    fn out_fault_interceptors(&self) -> &InterceptorList {
        &self.lists.out_fault_list
    }
}

// ---------------------------------------------------------------------------
// AttributedInterceptorProvider
// ---------------------------------------------------------------------------

/// Provider that is also a property bag.
///
/// Storing `None` under a key removes it. Equality and hashing are by
/// identity: a provider equals only itself, whatever its contents, so it can
/// key identity-based caches.
#[derive(Default)]
pub struct AttributedInterceptorProvider {
    lists: DirectionalLists,
    properties: RwLock<Properties>,
}

impl AttributedInterceptorProvider {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `value` under `key`, or removes `key` when `value` is `None`.
    pub fn put(&self, key: impl Into<String>, value: Option<PropertyValue>) -> Option<PropertyValue> {
        self.properties.write().put(key, value)
    }

    pub fn insert<T: std::any::Any + Send + Sync>(&self, key: impl Into<String>, value: T) -> Option<PropertyValue> {
        self.properties.write().insert(key, value)
    }

    #[must_use]
    pub fn get<T: std::any::Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.properties.read().get(key)
    }

    #[must_use]
    pub fn get_raw(&self, key: &str) -> Option<PropertyValue> {
        self.properties.read().get_raw(key)
    }

    pub fn remove(&self, key: &str) -> Option<PropertyValue> {
        self.properties.write().remove(key)
    }

    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.properties.read().contains_key(key)
    }

    #[must_use]
    pub fn property_count(&self) -> usize {
        self.properties.read().len()
    }
}

impl InterceptorProvider for AttributedInterceptorProvider {
    fn in_interceptors(&self) -> &InterceptorList {
        &self.lists.in_list
    }

    fn out_interceptors(&self) -> &InterceptorList {
        &self.lists.out_list
    }

    fn in_fault_interceptors(&self) -> &InterceptorList {
        &self.lists.in_fault_list
    }

    fn out_fault_interceptors(&self) -> &InterceptorList {
        &self.lists.out_fault_list
    }
}

impl PropertyScope for AttributedInterceptorProvider {
    fn property(&self, key: &str) -> Option<PropertyValue> {
        self.get_raw(key)
    }
}

impl PartialEq for AttributedInterceptorProvider {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self, other)
    }
}

impl Eq for AttributedInterceptorProvider {}

impl Hash for AttributedInterceptorProvider {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::ptr::hash(self, state);
    }
}

impl fmt::Debug for AttributedInterceptorProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttributedInterceptorProvider")
            .field("lists", &self.lists)
            .field("properties", &*self.properties.read())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::interceptor::{FnInterceptor, InterceptorMeta};

    fn noop(id: &str) -> SharedInterceptor {
        FnInterceptor::new(InterceptorMeta::new(id, "invoke"), |_| Ok(())).shared()
    }

    #[test]
    fn snapshot_is_isolated_from_later_writes() {
        let list = InterceptorList::new();
        list.push(noop("a"));
        let before = list.snapshot();
        list.push(noop("b"));
        assert_eq!(before.len(), 1);
        assert_eq!(list.len(), 2);
        assert!(!Arc::ptr_eq(&before, &list.snapshot()));
    }

    #[test]
    fn unchanged_list_keeps_snapshot_pointer() {
        let list = InterceptorList::from_vec(vec![noop("a")]);
        assert!(Arc::ptr_eq(&list.snapshot(), &list.snapshot()));
    }

    #[test]
    fn remove_matches_instance_not_id() {
        let first = noop("same");
        let second = noop("same");
        let list = InterceptorList::from_vec(vec![Arc::clone(&first), Arc::clone(&second)]);
        assert!(list.remove(&second));
        assert!(!list.remove(&second));
        assert_eq!(list.len(), 1);
        assert!(Arc::ptr_eq(&list.snapshot()[0], &first));
    }

    #[test]
    fn remove_by_id_counts() {
        let list = InterceptorList::from_vec(vec![noop("x"), noop("y"), noop("x")]);
        assert_eq!(list.remove_by_id("x"), 2);
        assert_eq!(list.ids(), vec!["y".to_string()]);
    }

    #[test]
    fn setter_replaces_contents_of_same_list() {
        let provider = BasicInterceptorProvider::new();
        provider.in_interceptors().push(noop("old"));
        let live: &InterceptorList = provider.in_interceptors();
        provider.set_in_interceptors(vec![noop("new1"), noop("new2")]);
        assert_eq!(live.ids(), vec!["new1".to_string(), "new2".to_string()]);
        assert!(std::ptr::eq(live, provider.interceptors(Direction::In)));
    }

    #[test]
    fn directions_are_independent() {
        let provider = BasicInterceptorProvider::new();
        provider.out_fault_interceptors().push(noop("fault"));
        assert!(provider.in_interceptors().is_empty());
        assert!(provider.out_interceptors().is_empty());
        assert!(provider.in_fault_interceptors().is_empty());
        assert_eq!(provider.interceptors(Direction::OutFault).len(), 1);
    }

    #[test]
    fn attributed_put_none_removes_key() {
        let provider = AttributedInterceptorProvider::new();
        provider.insert("schema-validation", true);
        assert!(provider.contains_key("schema-validation"));
        provider.put("schema-validation", None);
        assert!(!provider.contains_key("schema-validation"));
        assert_eq!(provider.property_count(), 0);
    }

    #[test]
    fn attributed_equality_is_identity() {
        let shared = noop("a");
        let first = AttributedInterceptorProvider::new();
        let second = AttributedInterceptorProvider::new();
        first.in_interceptors().push(Arc::clone(&shared));
        second.in_interceptors().push(shared);

        let alias = &first;
        assert_ne!(first, second);
        assert_eq!(&first, alias);

        let mut set = HashSet::new();
        set.insert(&first);
        set.insert(&second);
        set.insert(&first);
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn attributed_provider_is_a_property_scope() {
        let provider = AttributedInterceptorProvider::new();
        provider.insert("realm", "orders".to_string());
        let scope: &dyn PropertyScope = &provider;
        assert!(scope.property("realm").is_some());
        assert!(scope.property("missing").is_none());
    }
}
