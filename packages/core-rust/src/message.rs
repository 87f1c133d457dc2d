//! Message and exchange handles.
//!
//! A [`Message`] is a cheap, clonable handle to a mutable property bag plus
//! typed content slots. An [`Exchange`] pairs the inbound, outbound, and fault
//! messages of one logical request. The exchange owns its messages; a message
//! refers back to its exchange weakly, so dropping the last exchange handle
//! releases the whole request.
//!
//! All interior locks are short-lived and never held while an interceptor
//! runs.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

use crate::chain::PhaseInterceptorChain;
use crate::fault::{Fault, FaultMode};
use crate::properties::{Properties, PropertyScope, PropertyValue};

/// Well-known property keys.
pub mod keys {
    /// `Vec<Arc<dyn InterceptorProvider>>` contributing extra interceptors to
    /// every chain built for this message.
    pub const INTERCEPTOR_PROVIDERS: &str = "phasewire.interceptor-providers";
    /// `Vec<SharedInterceptor>` added to the inbound chain of this message.
    pub const IN_INTERCEPTORS: &str = "phasewire.in-interceptors";
    /// `Vec<SharedInterceptor>` added to the outbound chain of this message.
    pub const OUT_INTERCEPTORS: &str = "phasewire.out-interceptors";
    /// `Vec<SharedInterceptor>` added to the inbound fault chain.
    pub const IN_FAULT_INTERCEPTORS: &str = "phasewire.in-fault-interceptors";
    /// `Vec<SharedInterceptor>` added to the outbound fault chain.
    pub const OUT_FAULT_INTERCEPTORS: &str = "phasewire.out-fault-interceptors";
    /// `String` id; dispatch starts immediately after this interceptor.
    pub const STARTING_AFTER_INTERCEPTOR_ID: &str = "phasewire.starting-after-interceptor-id";
    /// `String` id; dispatch starts at this interceptor.
    pub const STARTING_AT_INTERCEPTOR_ID: &str = "phasewire.starting-at-interceptor-id";
    /// `Arc<dyn FaultListener>` consulted before default fault logging.
    pub const FAULT_LISTENER: &str = "phasewire.fault-listener";
    /// `bool`; set on messages processed by the requesting (client) side.
    pub const REQUESTOR_ROLE: &str = "phasewire.requestor-role";
    /// `bool`; set on messages travelling in the inbound direction.
    pub const INBOUND_MESSAGE: &str = "phasewire.inbound-message";
    /// `bool`; when set, one-way exchanges still run the fault observer.
    pub const ROBUST_ONE_WAY: &str = "phasewire.robust-one-way";
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

type Content = Box<dyn Any + Send + Sync>;

struct MessageInner {
    properties: RwLock<Properties>,
    contents: Mutex<HashMap<TypeId, Content>>,
    exception: Mutex<Option<Arc<anyhow::Error>>>,
    fault_mode: Mutex<Option<FaultMode>>,
    exchange: RwLock<Weak<ExchangeInner>>,
    chain: RwLock<Weak<PhaseInterceptorChain>>,
}

/// Handle to one message travelling through a chain.
///
/// Clones share state; use [`Message::ptr_eq`] for identity.
#[derive(Clone)]
pub struct Message {
    inner: Arc<MessageInner>,
}

impl Message {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MessageInner {
                properties: RwLock::new(Properties::new()),
                contents: Mutex::new(HashMap::new()),
                exception: Mutex::new(None),
                fault_mode: Mutex::new(None),
                exchange: RwLock::new(Weak::new()),
                chain: RwLock::new(Weak::new()),
            }),
        }
    }

    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    // -- properties ---------------------------------------------------------

    /// Stores or, for `None`, removes a property.
    pub fn put(&self, key: impl Into<String>, value: Option<PropertyValue>) -> Option<PropertyValue> {
        self.inner.properties.write().put(key, value)
    }

    pub fn insert<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) -> Option<PropertyValue> {
        self.inner.properties.write().insert(key, value)
    }

    #[must_use]
    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.inner.properties.read().get(key)
    }

    #[must_use]
    pub fn get_raw(&self, key: &str) -> Option<PropertyValue> {
        self.inner.properties.read().get_raw(key)
    }

    pub fn remove(&self, key: &str) -> Option<PropertyValue> {
        self.inner.properties.write().remove(key)
    }

    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.inner.properties.read().contains_key(key)
    }

    /// Runs `f` against the property bag under a read lock.
    pub fn with_properties<R>(&self, f: impl FnOnce(&Properties) -> R) -> R {
        f(&self.inner.properties.read())
    }

    /// Runs `f` against the property bag under a write lock.
    pub fn with_properties_mut<R>(&self, f: impl FnOnce(&mut Properties) -> R) -> R {
        f(&mut self.inner.properties.write())
    }

    /// Resolves `key` against this message, then its exchange, then every
    /// scope bound to the exchange in binding order.
    #[must_use]
    pub fn contextual_property(&self, key: &str) -> Option<PropertyValue> {
        if let Some(value) = self.get_raw(key) {
            return Some(value);
        }
        let exchange = self.exchange()?;
        if let Some(value) = exchange.get_raw(key) {
            return Some(value);
        }
        exchange.scopes().iter().find_map(|scope| scope.property(key))
    }

    /// Typed form of [`Message::contextual_property`].
    #[must_use]
    pub fn contextual<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.contextual_property(key)
            .and_then(|value| value.downcast::<T>().ok())
    }

    /// Reads a contextual boolean flag, treating absence as false.
    #[must_use]
    pub fn contextual_flag(&self, key: &str) -> bool {
        self.contextual::<bool>(key).is_some_and(|flag| *flag)
    }

    #[must_use]
    pub fn is_requestor(&self) -> bool {
        self.contextual_flag(keys::REQUESTOR_ROLE)
    }

    #[must_use]
    pub fn is_inbound(&self) -> bool {
        self.get::<bool>(keys::INBOUND_MESSAGE).is_some_and(|flag| *flag)
    }

    // -- content slots ------------------------------------------------------

    /// Stores a typed attachment, returning the previous one of the same type.
    pub fn set_content<T: Any + Send + Sync>(&self, value: T) -> Option<T> {
        self.inner
            .contents
            .lock()
            .insert(TypeId::of::<T>(), Box::new(value))
            .and_then(|previous| previous.downcast::<T>().ok())
            .map(|previous| *previous)
    }

    /// Returns a clone of the attachment of type `T`.
    #[must_use]
    pub fn content<T: Any + Send + Sync + Clone>(&self) -> Option<T> {
        self.inner
            .contents
            .lock()
            .get(&TypeId::of::<T>())
            .and_then(|value| value.downcast_ref::<T>())
            .cloned()
    }

    /// Removes and returns the attachment of type `T`.
    pub fn take_content<T: Any + Send + Sync>(&self) -> Option<T> {
        self.inner
            .contents
            .lock()
            .remove(&TypeId::of::<T>())
            .and_then(|value| value.downcast::<T>().ok())
            .map(|value| *value)
    }

    #[must_use]
    pub fn has_content<T: Any + Send + Sync>(&self) -> bool {
        self.inner.contents.lock().contains_key(&TypeId::of::<T>())
    }

    /// Mutates the attachment of type `T` in place.
    ///
    /// The content lock is held while `f` runs; `f` must not touch this
    /// message's content slots.
    pub fn with_content_mut<T: Any + Send + Sync, R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        self.inner
            .contents
            .lock()
            .get_mut(&TypeId::of::<T>())
            .and_then(|value| value.downcast_mut::<T>())
            .map(f)
    }

    #[must_use]
    pub fn content_count(&self) -> usize {
        self.inner.contents.lock().len()
    }

    // -- fault state --------------------------------------------------------

    /// The processing error carried by this message, if any.
    #[must_use]
    pub fn exception(&self) -> Option<Arc<anyhow::Error>> {
        self.inner.exception.lock().clone()
    }

    pub fn set_exception(&self, error: Option<Arc<anyhow::Error>>) {
        *self.inner.exception.lock() = error;
    }

    /// The carried error viewed as a [`Fault`], if it is one.
    #[must_use]
    pub fn fault(&self) -> Option<Fault> {
        self.exception()
            .and_then(|error| error.downcast_ref::<Fault>().cloned())
    }

    #[must_use]
    pub fn fault_mode(&self) -> Option<FaultMode> {
        *self.inner.fault_mode.lock()
    }

    pub fn set_fault_mode(&self, mode: Option<FaultMode>) {
        *self.inner.fault_mode.lock() = mode;
    }

    // -- wiring -------------------------------------------------------------

    /// The exchange this message belongs to, if it is still alive.
    #[must_use]
    pub fn exchange(&self) -> Option<Exchange> {
        self.inner
            .exchange
            .read()
            .upgrade()
            .map(|inner| Exchange { inner })
    }

    /// The chain currently (or most recently) processing this message.
    #[must_use]
    pub fn interceptor_chain(&self) -> Option<Arc<PhaseInterceptorChain>> {
        self.inner.chain.read().upgrade()
    }

    pub fn set_interceptor_chain(&self, chain: Option<&Arc<PhaseInterceptorChain>>) {
        *self.inner.chain.write() = chain.map_or_else(Weak::new, Arc::downgrade);
    }

    fn attach(&self, exchange: &Arc<ExchangeInner>) {
        *self.inner.exchange.write() = Arc::downgrade(exchange);
    }
}

impl Default for Message {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("properties", &*self.inner.properties.read())
            .field("contents", &self.content_count())
            .field("has_exception", &self.inner.exception.lock().is_some())
            .field("has_exchange", &(self.inner.exchange.read().strong_count() > 0))
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Exchange
// ---------------------------------------------------------------------------

/// The four message positions of an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageSlot {
    In,
    Out,
    InFault,
    OutFault,
}

type BoundValue = Arc<dyn Any + Send + Sync>;

struct ExchangeInner {
    in_message: RwLock<Option<Message>>,
    out_message: RwLock<Option<Message>>,
    in_fault_message: RwLock<Option<Message>>,
    out_fault_message: RwLock<Option<Message>>,
    properties: RwLock<Properties>,
    bindings: RwLock<HashMap<TypeId, BoundValue>>,
    scopes: RwLock<Vec<Arc<dyn PropertyScope>>>,
    one_way: AtomicBool,
    synchronous: AtomicBool,
    operation: RwLock<Option<String>>,
    correlation_id: Mutex<Option<u64>>,
    exception: Mutex<Option<Arc<anyhow::Error>>>,
}

/// Handle to one logical request/response cycle.
#[derive(Clone)]
pub struct Exchange {
    inner: Arc<ExchangeInner>,
}

impl Exchange {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ExchangeInner {
                in_message: RwLock::new(None),
                out_message: RwLock::new(None),
                in_fault_message: RwLock::new(None),
                out_fault_message: RwLock::new(None),
                properties: RwLock::new(Properties::new()),
                bindings: RwLock::new(HashMap::new()),
                scopes: RwLock::new(Vec::new()),
                one_way: AtomicBool::new(false),
                synchronous: AtomicBool::new(true),
                operation: RwLock::new(None),
                correlation_id: Mutex::new(None),
                exception: Mutex::new(None),
            }),
        }
    }

    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn slot(&self, slot: MessageSlot) -> &RwLock<Option<Message>> {
        match slot {
            MessageSlot::In => &self.inner.in_message,
            MessageSlot::Out => &self.inner.out_message,
            MessageSlot::InFault => &self.inner.in_fault_message,
            MessageSlot::OutFault => &self.inner.out_fault_message,
        }
    }

    // -- message slots ------------------------------------------------------

    #[must_use]
    pub fn message(&self, slot: MessageSlot) -> Option<Message> {
        self.slot(slot).read().clone()
    }

    /// Places `message` in `slot`, attaching it to this exchange. Returns the
    /// message previously held there.
    pub fn set_message(&self, slot: MessageSlot, message: Option<Message>) -> Option<Message> {
        if let Some(message) = &message {
            message.attach(&self.inner);
        }
        std::mem::replace(&mut *self.slot(slot).write(), message)
    }

    /// Empties `slot`. The removed message keeps its exchange reference.
    pub fn take_message(&self, slot: MessageSlot) -> Option<Message> {
        self.slot(slot).write().take()
    }

    /// Finds which slot holds `message`.
    #[must_use]
    pub fn slot_of(&self, message: &Message) -> Option<MessageSlot> {
        [
            MessageSlot::In,
            MessageSlot::Out,
            MessageSlot::InFault,
            MessageSlot::OutFault,
        ]
        .into_iter()
        .find(|slot| {
            self.slot(*slot)
                .read()
                .as_ref()
                .is_some_and(|held| held.ptr_eq(message))
        })
    }

    #[must_use]
    pub fn in_message(&self) -> Option<Message> {
        self.message(MessageSlot::In)
    }

    #[must_use]
    pub fn out_message(&self) -> Option<Message> {
        self.message(MessageSlot::Out)
    }

    #[must_use]
    pub fn in_fault_message(&self) -> Option<Message> {
        self.message(MessageSlot::InFault)
    }

    #[must_use]
    pub fn out_fault_message(&self) -> Option<Message> {
        self.message(MessageSlot::OutFault)
    }

    pub fn set_in_message(&self, message: Option<Message>) -> Option<Message> {
        self.set_message(MessageSlot::In, message)
    }

    pub fn set_out_message(&self, message: Option<Message>) -> Option<Message> {
        self.set_message(MessageSlot::Out, message)
    }

    pub fn set_in_fault_message(&self, message: Option<Message>) -> Option<Message> {
        self.set_message(MessageSlot::InFault, message)
    }

    pub fn set_out_fault_message(&self, message: Option<Message>) -> Option<Message> {
        self.set_message(MessageSlot::OutFault, message)
    }

    // -- properties ---------------------------------------------------------

    pub fn put(&self, key: impl Into<String>, value: Option<PropertyValue>) -> Option<PropertyValue> {
        self.inner.properties.write().put(key, value)
    }

    pub fn insert<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) -> Option<PropertyValue> {
        self.inner.properties.write().insert(key, value)
    }

    #[must_use]
    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.inner.properties.read().get(key)
    }

    #[must_use]
    pub fn get_raw(&self, key: &str) -> Option<PropertyValue> {
        self.inner.properties.read().get_raw(key)
    }

    pub fn remove(&self, key: &str) -> Option<PropertyValue> {
        self.inner.properties.write().remove(key)
    }

    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.inner.properties.read().contains_key(key)
    }

    // -- typed bindings -----------------------------------------------------

    /// Binds a shared object of type `T` (bus, endpoint, service, ...) to the
    /// exchange, replacing any earlier binding of the same type.
    pub fn bind<T: Any + Send + Sync>(&self, value: Arc<T>) {
        self.inner.bindings.write().insert(TypeId::of::<T>(), value);
    }

    #[must_use]
    pub fn bound<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.inner
            .bindings
            .read()
            .get(&TypeId::of::<T>())
            .cloned()
            .and_then(|value| value.downcast::<T>().ok())
    }

    pub fn unbind<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.inner
            .bindings
            .write()
            .remove(&TypeId::of::<T>())
            .and_then(|value| value.downcast::<T>().ok())
    }

    /// Appends a scope consulted by [`Message::contextual_property`]. Scopes
    /// are searched in the order they were added, so add the narrowest first.
    pub fn add_scope(&self, scope: Arc<dyn PropertyScope>) {
        self.inner.scopes.write().push(scope);
    }

    #[must_use]
    pub fn scopes(&self) -> Vec<Arc<dyn PropertyScope>> {
        self.inner.scopes.read().clone()
    }

    // -- flags and metadata -------------------------------------------------

    #[must_use]
    pub fn is_one_way(&self) -> bool {
        self.inner.one_way.load(Ordering::Acquire)
    }

    pub fn set_one_way(&self, one_way: bool) {
        self.inner.one_way.store(one_way, Ordering::Release);
    }

    #[must_use]
    pub fn is_synchronous(&self) -> bool {
        self.inner.synchronous.load(Ordering::Acquire)
    }

    pub fn set_synchronous(&self, synchronous: bool) {
        self.inner.synchronous.store(synchronous, Ordering::Release);
    }

    #[must_use]
    pub fn operation(&self) -> Option<String> {
        self.inner.operation.read().clone()
    }

    pub fn set_operation(&self, operation: Option<String>) {
        *self.inner.operation.write() = operation;
    }

    /// Id shared by every log event of this exchange, including fault chains.
    #[must_use]
    pub fn correlation_id(&self) -> Option<u64> {
        *self.inner.correlation_id.lock()
    }

    /// Returns the existing correlation id or stores the one produced by
    /// `next`.
    pub fn correlation_id_or_insert_with(&self, next: impl FnOnce() -> u64) -> u64 {
        *self.inner.correlation_id.lock().get_or_insert_with(next)
    }

    /// The last processing error recorded against this exchange.
    #[must_use]
    pub fn exception(&self) -> Option<Arc<anyhow::Error>> {
        self.inner.exception.lock().clone()
    }

    pub fn set_exception(&self, error: Option<Arc<anyhow::Error>>) {
        *self.inner.exception.lock() = error;
    }
}

impl Default for Exchange {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exchange")
            .field("operation", &self.operation())
            .field("one_way", &self.is_one_way())
            .field("correlation_id", &self.correlation_id())
            .field("in", &self.inner.in_message.read().is_some())
            .field("out", &self.inner.out_message.read().is_some())
            .field("in_fault", &self.inner.in_fault_message.read().is_some())
            .field("out_fault", &self.inner.out_fault_message.read().is_some())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
