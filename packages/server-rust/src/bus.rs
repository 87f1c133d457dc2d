//! The bus: the broadest interceptor scope and the owner of shared services.
//!
//! A [`Bus`] carries the bus-wide interceptor lists and properties, the
//! [`PhaseManager`], a typed extension registry, the id generator used for
//! log correlation, and an explicit [`FactoryCache`]. The thread-default bus
//! is the ambient context interceptors run under; [`BusScope`] switches it
//! for the duration of a dispatch and restores the previous one on drop.

use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use phasewire_core::{
    AttributedInterceptorProvider, DefaultPhaseManager, InterceptorList, InterceptorProvider,
    PhaseManager, PropertyScope, PropertyValue,
};
use tracing::debug;

use crate::config::{BusConfig, ConfigError};

type Extension = Arc<dyn Any + Send + Sync>;

// ---------------------------------------------------------------------------
// IdGenerator
// ---------------------------------------------------------------------------

/// Monotonic id source shared by every exchange of a bus.
#[derive(Debug)]
pub struct IdGenerator {
    next: AtomicU64,
}

impl IdGenerator {
    #[must_use]
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Returns the next id. Never returns the same value twice.
    pub fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// FactoryCache
// ---------------------------------------------------------------------------

/// Shared factory instances keyed by value type and configuration key.
///
/// Safe for concurrent use: the first caller for a key constructs the value,
/// later callers share it.
#[derive(Default)]
pub struct FactoryCache {
    entries: DashMap<(TypeId, String), Extension>,
}

impl FactoryCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached `T` for `key`, constructing it with `make` on the
    /// first request.
    pub fn get_or_insert_with<T, F>(&self, key: &str, make: F) -> Arc<T>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> T,
    {
        match self.entries.entry((TypeId::of::<T>(), key.to_string())) {
            Entry::Occupied(mut slot) => match Arc::clone(slot.get()).downcast::<T>() {
                Ok(existing) => existing,
                Err(_) => {
                    let value = Arc::new(make());
                    slot.insert(Arc::clone(&value) as Extension);
                    value
                }
            },
            Entry::Vacant(slot) => {
                let value = Arc::new(make());
                slot.insert(Arc::clone(&value) as Extension);
                value
            }
        }
    }

    #[must_use]
    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.entries
            .get(&(TypeId::of::<T>(), key.to_string()))
            .and_then(|entry| Arc::clone(entry.value()).downcast::<T>().ok())
    }

    pub fn remove<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.entries
            .remove(&(TypeId::of::<T>(), key.to_string()))
            .and_then(|(_, value)| value.downcast::<T>().ok())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}

impl fmt::Debug for FactoryCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FactoryCache")
            .field("entries", &self.entries.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Bus
// ---------------------------------------------------------------------------

/// Bus-wide scope: interceptors, properties, and shared services.
pub struct Bus {
    config: BusConfig,
    provider: AttributedInterceptorProvider,
    phase_manager: Arc<dyn PhaseManager>,
    extensions: DashMap<TypeId, Extension>,
    ids: IdGenerator,
    factories: FactoryCache,
}

impl Bus {
    /// Creates a bus with the standard phase lists.
    ///
    /// # Errors
    ///
    /// Returns the [`BusConfig::validate`] error for an invalid config.
    pub fn new(config: BusConfig) -> Result<Arc<Self>, ConfigError> {
        Self::with_phase_manager(config, Arc::new(DefaultPhaseManager::new()))
    }

    /// Creates a bus with a custom phase registry.
    ///
    /// # Errors
    ///
    /// Returns the [`BusConfig::validate`] error for an invalid config.
    pub fn with_phase_manager(
        config: BusConfig,
        phase_manager: Arc<dyn PhaseManager>,
    ) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;
        debug!(bus = %config.bus_id, "bus created");
        Ok(Arc::new(Self {
            config,
            provider: AttributedInterceptorProvider::new(),
            phase_manager,
            extensions: DashMap::new(),
            ids: IdGenerator::new(),
            factories: FactoryCache::new(),
        }))
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.config.bus_id
    }

    #[must_use]
    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Bus-scope interceptor lists and properties.
    #[must_use]
    pub fn provider(&self) -> &AttributedInterceptorProvider {
        &self.provider
    }

    #[must_use]
    pub fn phase_manager(&self) -> &Arc<dyn PhaseManager> {
        &self.phase_manager
    }

    #[must_use]
    pub fn ids(&self) -> &IdGenerator {
        &self.ids
    }

    #[must_use]
    pub fn factories(&self) -> &FactoryCache {
        &self.factories
    }

    /// Sets a bus property. `None` removes the key.
    pub fn put(&self, key: impl Into<String>, value: Option<PropertyValue>) -> Option<PropertyValue> {
        self.provider.put(key, value)
    }

    pub fn insert<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) -> Option<PropertyValue> {
        self.provider.insert(key, value)
    }

    #[must_use]
    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.provider.get(key)
    }

    // -- extensions ---------------------------------------------------------

    /// Registers a bus extension, replacing any extension of the same type.
    pub fn set_extension<T: Any + Send + Sync>(&self, extension: Arc<T>) {
        self.extensions.insert(TypeId::of::<T>(), extension);
    }

    #[must_use]
    pub fn extension<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.extensions
            .get(&TypeId::of::<T>())
            .and_then(|entry| Arc::clone(entry.value()).downcast::<T>().ok())
    }

    #[must_use]
    pub fn has_extension<T: Any + Send + Sync>(&self) -> bool {
        self.extensions.contains_key(&TypeId::of::<T>())
    }

    pub fn remove_extension<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.extensions
            .remove(&TypeId::of::<T>())
            .and_then(|(_, value)| value.downcast::<T>().ok())
    }

    // -- thread default -----------------------------------------------------

    /// The ambient bus of the calling thread.
    #[must_use]
    pub fn thread_default() -> Option<Arc<Self>> {
        THREAD_DEFAULT_BUS.with(|slot| slot.borrow().clone())
    }

    /// Replaces the ambient bus of the calling thread, returning the old one.
    pub fn set_thread_default(bus: Option<Arc<Self>>) -> Option<Arc<Self>> {
        THREAD_DEFAULT_BUS.with(|slot| std::mem::replace(&mut *slot.borrow_mut(), bus))
    }
}

impl InterceptorProvider for Bus {
    fn in_interceptors(&self) -> &InterceptorList {
        self.provider.in_interceptors()
    }

    fn out_interceptors(&self) -> &InterceptorList {
        self.provider.out_interceptors()
    }

    fn in_fault_interceptors(&self) -> &InterceptorList {
        self.provider.in_fault_interceptors()
    }

    fn out_fault_interceptors(&self) -> &InterceptorList {
        self.provider.out_fault_interceptors()
    }
}

impl PropertyScope for Bus {
    fn property(&self, key: &str) -> Option<PropertyValue> {
        self.provider.property(key)
    }
}

impl fmt::Debug for Bus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bus")
            .field("id", &self.config.bus_id)
            .field("extensions", &self.extensions.len())
            .field("factories", &self.factories.len())
            .finish_non_exhaustive()
    }
}

thread_local! {
    static THREAD_DEFAULT_BUS: RefCell<Option<Arc<Bus>>> = const { RefCell::new(None) };
}

// ---------------------------------------------------------------------------
// BusScope
// ---------------------------------------------------------------------------

/// Makes a bus the thread default until dropped, then restores the previous
/// default, also when the scope is left by an early return or a panic.
#[must_use = "the previous bus is restored when the scope is dropped"]
pub struct BusScope {
    previous: Option<Arc<Bus>>,
}

impl BusScope {
    pub fn enter(bus: &Arc<Bus>) -> Self {
        Self {
            previous: Bus::set_thread_default(Some(Arc::clone(bus))),
        }
    }
}

impl Drop for BusScope {
    fn drop(&mut self) {
        Bus::set_thread_default(self.previous.take());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bus(id: &str) -> Arc<Bus> {
        Bus::new(BusConfig {
            bus_id: id.to_string(),
            ..BusConfig::default()
        })
        .unwrap()
    }

    // -- ids ----------------------------------------------------------------

    #[test]
    fn ids_are_monotonic() {
        let ids = IdGenerator::new();
        let first = ids.next_id();
        let second = ids.next_id();
        assert!(second > first);
    }

    #[test]
    fn ids_are_unique_across_threads() {
        let ids = Arc::new(IdGenerator::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let ids = Arc::clone(&ids);
                std::thread::spawn(move || (0..250).map(|_| ids.next_id()).collect::<Vec<_>>())
            })
            .collect();
        let mut all: Vec<u64> = handles
            .into_iter()
            .flat_map(|handle| handle.join().unwrap())
            .collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 1000);
    }

    // -- factory cache ------------------------------------------------------

    #[test]
    fn factory_cache_constructs_once_per_key() {
        let cache = FactoryCache::new();
        let mut calls = 0;
        let first = cache.get_or_insert_with("utf-8", || {
            calls += 1;
            String::from("codec")
        });
        let second = cache.get_or_insert_with("utf-8", || {
            calls += 1;
            String::from("other")
        });
        assert_eq!(calls, 1);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn factory_cache_keys_include_type() {
        let cache = FactoryCache::new();
        cache.get_or_insert_with("k", || 1_u32);
        cache.get_or_insert_with("k", || String::from("s"));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get::<u32>("k").as_deref(), Some(&1));
        assert!(cache.remove::<String>("k").is_some());
        assert!(cache.get::<String>("k").is_none());
        cache.clear();
        assert!(cache.is_empty());
    }

    // -- bus ----------------------------------------------------------------

    #[test]
    fn invalid_config_is_rejected() {
        let err = Bus::new(BusConfig {
            bus_id: String::new(),
            ..BusConfig::default()
        })
        .unwrap_err();
        assert!(matches!(err, ConfigError::EmptyBusId));
    }

    #[test]
    fn extensions_are_typed() {
        struct Registry(u8);
        let bus = bus("ext");
        assert!(!bus.has_extension::<Registry>());
        bus.set_extension(Arc::new(Registry(7)));
        assert_eq!(bus.extension::<Registry>().map(|r| r.0), Some(7));
        assert!(bus.remove_extension::<Registry>().is_some());
        assert!(bus.extension::<Registry>().is_none());
    }

    #[test]
    fn bus_properties_are_a_scope() {
        let bus = bus("props");
        bus.insert("timeout", 5_u32);
        assert!(bus.property("timeout").is_some());
        bus.put("timeout", None);
        assert!(bus.get::<u32>("timeout").is_none());
    }

    #[test]
    fn bus_scope_restores_previous_default() {
        let outer = bus("outer");
        let inner = bus("inner");
        assert!(Bus::thread_default().is_none());
        {
            let _outer = BusScope::enter(&outer);
            {
                let _inner = BusScope::enter(&inner);
                assert_eq!(Bus::thread_default().unwrap().id(), "inner");
            }
            assert_eq!(Bus::thread_default().unwrap().id(), "outer");
        }
        assert!(Bus::thread_default().is_none());
    }

    #[test]
    fn bus_scope_restores_on_panic() {
        let bus = bus("panicky");
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _scope = BusScope::enter(&bus);
            panic!("boom");
        }));
        assert!(result.is_err());
        assert!(Bus::thread_default().is_none());
    }
}
