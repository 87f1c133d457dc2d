//! Typed property bag shared by messages, exchanges, and attributed providers.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// A shared, type-erased property value.
pub type PropertyValue = Arc<dyn Any + Send + Sync>;

/// Sparse string-keyed property map.
///
/// Assigning `None` through [`Properties::put`] removes the key instead of
/// storing an empty value, so `contains_key` only ever reports keys that carry
/// a value.
#[derive(Clone, Default)]
pub struct Properties {
    entries: HashMap<String, PropertyValue>,
}

impl Properties {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `value` under `key`, or removes `key` when `value` is `None`.
    /// Returns the previous value.
    pub fn put(&mut self, key: impl Into<String>, value: Option<PropertyValue>) -> Option<PropertyValue> {
        let key = key.into();
        match value {
            Some(value) => self.entries.insert(key, value),
            None => self.entries.remove(&key),
        }
    }

    /// Stores a typed value under `key`.
    pub fn insert<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: T) -> Option<PropertyValue> {
        self.entries.insert(key.into(), Arc::new(value))
    }

    /// Returns the value under `key` if it has type `T`.
    #[must_use]
    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.entries
            .get(key)
            .and_then(|value| Arc::clone(value).downcast::<T>().ok())
    }

    /// Returns the untyped value under `key`.
    #[must_use]
    pub fn get_raw(&self, key: &str) -> Option<PropertyValue> {
        self.entries.get(key).cloned()
    }

    pub fn remove(&mut self, key: &str) -> Option<PropertyValue> {
        self.entries.remove(key)
    }

    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Copies every entry of `other` into this bag, overwriting existing keys.
    pub fn extend_from(&mut self, other: &Properties) {
        for (key, value) in &other.entries {
            self.entries.insert(key.clone(), Arc::clone(value));
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl fmt::Debug for Properties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<&str> = self.keys().collect();
        keys.sort_unstable();
        f.debug_struct("Properties").field("keys", &keys).finish()
    }
}

/// A scope that can answer contextual property lookups.
///
/// Messages resolve contextual properties by consulting their own
/// properties, then the exchange, then each scope bound to the exchange
/// (endpoint, service, bus) in binding order.
pub trait PropertyScope: Send + Sync {
    fn property(&self, key: &str) -> Option<PropertyValue>;
}

impl PropertyScope for parking_lot::RwLock<Properties> {
    fn property(&self, key: &str) -> Option<PropertyValue> {
        self.read().get_raw(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_none_removes_key() {
        let mut props = Properties::new();
        props.insert("mode", "strict".to_string());
        assert!(props.contains_key("mode"));

        let previous = props.put("mode", None);
        assert!(previous.is_some());
        assert!(!props.contains_key("mode"));
        assert!(props.is_empty());
    }

    #[test]
    fn put_none_on_missing_key_is_noop() {
        let mut props = Properties::new();
        assert!(props.put("absent", None).is_none());
        assert!(!props.contains_key("absent"));
    }

    #[test]
    fn typed_get_checks_type() {
        let mut props = Properties::new();
        props.insert("count", 3_u32);
        assert_eq!(props.get::<u32>("count").as_deref(), Some(&3));
        assert!(props.get::<String>("count").is_none());
        assert!(props.get_raw("count").is_some());
    }

    #[test]
    fn extend_from_overwrites() {
        let mut base = Properties::new();
        base.insert("a", 1_i32);
        base.insert("b", 2_i32);
        let mut overlay = Properties::new();
        overlay.insert("b", 20_i32);
        base.extend_from(&overlay);
        assert_eq!(base.get::<i32>("a").as_deref(), Some(&1));
        assert_eq!(base.get::<i32>("b").as_deref(), Some(&20));
    }

    #[test]
    fn debug_lists_sorted_keys() {
        let mut props = Properties::new();
        props.insert("z", 1_u8);
        props.insert("a", 1_u8);
        assert_eq!(format!("{props:?}"), r#"Properties { keys: ["a", "z"] }"#);
    }
}
