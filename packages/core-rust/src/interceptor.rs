//! The interceptor contract: one unit of message processing bound to a phase.
//!
//! Ordering metadata lives in a small [`InterceptorMeta`] value that each
//! implementation owns; behavior is supplied through the [`Interceptor`]
//! trait. There is no base-class hierarchy beyond this composition.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use crate::message::Message;

/// Shared handle to an interceptor, as stored by providers and chains.
pub type SharedInterceptor = Arc<dyn Interceptor>;

// ---------------------------------------------------------------------------
// InterceptorMeta
// ---------------------------------------------------------------------------

/// Identity, phase, and ordering constraints of an interceptor.
///
/// `before` and `after` name other interceptor ids. Ids that are absent from
/// a given chain, or that live in a different phase, impose no constraint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterceptorMeta {
    id: String,
    phase: String,
    before: BTreeSet<String>,
    after: BTreeSet<String>,
}

impl InterceptorMeta {
    #[must_use]
    pub fn new(id: impl Into<String>, phase: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            phase: phase.into(),
            before: BTreeSet::new(),
            after: BTreeSet::new(),
        }
    }

    /// Metadata whose id is the fully qualified type name of `T`.
    #[must_use]
    pub fn for_type<T: ?Sized>(phase: impl Into<String>) -> Self {
        Self::new(std::any::type_name::<T>(), phase)
    }

    /// Requires this interceptor to run before `id`.
    #[must_use]
    pub fn with_before(mut self, id: impl Into<String>) -> Self {
        self.add_before(id);
        self
    }

    /// Requires this interceptor to run after `id`.
    #[must_use]
    pub fn with_after(mut self, id: impl Into<String>) -> Self {
        self.add_after(id);
        self
    }

    pub fn add_before(&mut self, id: impl Into<String>) {
        self.before.insert(id.into());
    }

    pub fn add_after(&mut self, id: impl Into<String>) {
        self.after.insert(id.into());
    }

    pub fn add_before_all<I, S>(&mut self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.before.extend(ids.into_iter().map(Into::into));
    }

    pub fn add_after_all<I, S>(&mut self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.after.extend(ids.into_iter().map(Into::into));
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn phase(&self) -> &str {
        &self.phase
    }

    #[must_use]
    pub fn before(&self) -> &BTreeSet<String> {
        &self.before
    }

    #[must_use]
    pub fn after(&self) -> &BTreeSet<String> {
        &self.after
    }
}

// ---------------------------------------------------------------------------
// Interceptor
// ---------------------------------------------------------------------------

/// A processing stage plugged into a phase interceptor chain.
///
/// Implementations are shared across concurrent exchanges, so they take
/// `&self` and keep per-message state on the [`Message`] itself.
pub trait Interceptor: Send + Sync {
    fn meta(&self) -> &InterceptorMeta;

    /// Processes the message. Returning an error aborts the chain and starts
    /// fault handling; returning [`SuspendedInvocation`](crate::fault::SuspendedInvocation)
    /// suspends it instead.
    ///
    /// # Errors
    ///
    /// Any error is treated as a processing fault.
    fn handle_message(&self, message: &Message) -> anyhow::Result<()>;

    /// Called in reverse order on every interceptor that ran before a failing
    /// one. Must not fail.
    fn handle_fault(&self, _message: &Message) {}

    /// Interceptors that must be registered alongside this one.
    fn additional_interceptors(&self) -> Vec<SharedInterceptor> {
        Vec::new()
    }

    fn id(&self) -> &str {
        self.meta().id()
    }

    fn phase(&self) -> &str {
        self.meta().phase()
    }

    fn before(&self) -> &BTreeSet<String> {
        self.meta().before()
    }

    fn after(&self) -> &BTreeSet<String> {
        self.meta().after()
    }
}

impl fmt::Debug for dyn Interceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interceptor")
            .field("id", &self.id())
            .field("phase", &self.phase())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// FnInterceptor
// ---------------------------------------------------------------------------

type MessageFn = dyn Fn(&Message) -> anyhow::Result<()> + Send + Sync;
type FaultFn = dyn Fn(&Message) + Send + Sync;

/// Interceptor backed by closures.
pub struct FnInterceptor {
    meta: InterceptorMeta,
    on_message: Box<MessageFn>,
    on_fault: Option<Box<FaultFn>>,
}

impl FnInterceptor {
    pub fn new<F>(meta: InterceptorMeta, on_message: F) -> Self
    where
        F: Fn(&Message) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self {
            meta,
            on_message: Box::new(on_message),
            on_fault: None,
        }
    }

    #[must_use]
    pub fn with_fault<F>(mut self, on_fault: F) -> Self
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.on_fault = Some(Box::new(on_fault));
        self
    }

    #[must_use]
    pub fn shared(self) -> SharedInterceptor {
        Arc::new(self)
    }
}

impl Interceptor for FnInterceptor {
    fn meta(&self) -> &InterceptorMeta {
        &self.meta
    }

    fn handle_message(&self, message: &Message) -> anyhow::Result<()> {
        (self.on_message)(message)
    }

    fn handle_fault(&self, message: &Message) {
        if let Some(on_fault) = &self.on_fault {
            on_fault(message);
        }
    }
}
