//! Interceptor scopes below the bus and their assembly order.

use std::fmt;
use std::sync::Arc;

use phasewire_core::{
    AttributedInterceptorProvider, BasicInterceptorProvider, Direction, Exchange,
    InterceptorList, InterceptorProvider, Message, PropertyScope, PropertyValue,
};
use tracing::debug;

use crate::bus::Bus;
use crate::client::Client;

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

/// A service: interceptors and properties shared by all of its endpoints,
/// plus an optional databinding that contributes its own interceptors.
pub struct Service {
    name: String,
    provider: AttributedInterceptorProvider,
    databinding: Option<Arc<dyn InterceptorProvider>>,
}

impl Service {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            provider: AttributedInterceptorProvider::new(),
            databinding: None,
        }
    }

    #[must_use]
    pub fn with_databinding(mut self, databinding: Arc<dyn InterceptorProvider>) -> Self {
        self.databinding = Some(databinding);
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn provider(&self) -> &AttributedInterceptorProvider {
        &self.provider
    }

    #[must_use]
    pub fn databinding(&self) -> Option<&Arc<dyn InterceptorProvider>> {
        self.databinding.as_ref()
    }
}

impl InterceptorProvider for Service {
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

impl PropertyScope for Service {
    fn property(&self, key: &str) -> Option<PropertyValue> {
        self.provider.property(key)
    }
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.name)
            .field("databinding", &self.databinding.is_some())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Binding
// ---------------------------------------------------------------------------

type MessageInitializer = Arc<dyn Fn(&Message) + Send + Sync>;

/// A protocol binding: its interceptors and the messages it creates.
pub struct Binding {
    name: String,
    provider: BasicInterceptorProvider,
    initializer: Option<MessageInitializer>,
}

impl Binding {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            provider: BasicInterceptorProvider::new(),
            initializer: None,
        }
    }

    /// Runs `init` on every message this binding creates.
    #[must_use]
    pub fn with_message_initializer<F>(mut self, init: F) -> Self
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.initializer = Some(Arc::new(init));
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// An empty message shaped for this binding.
    #[must_use]
    pub fn create_message(&self) -> Message {
        let message = Message::new();
        if let Some(init) = &self.initializer {
            init(&message);
        }
        message
    }
}

impl InterceptorProvider for Binding {
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

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Binding")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Endpoint
// ---------------------------------------------------------------------------

/// An addressable endpoint of a service, reached through one binding.
pub struct Endpoint {
    name: String,
    provider: AttributedInterceptorProvider,
    service: Arc<Service>,
    binding: Arc<Binding>,
}

impl Endpoint {
    #[must_use]
    pub fn new(name: impl Into<String>, service: Arc<Service>, binding: Arc<Binding>) -> Self {
        Self {
            name: name.into(),
            provider: AttributedInterceptorProvider::new(),
            service,
            binding,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn provider(&self) -> &AttributedInterceptorProvider {
        &self.provider
    }

    #[must_use]
    pub fn service(&self) -> &Arc<Service> {
        &self.service
    }

    #[must_use]
    pub fn binding(&self) -> &Arc<Binding> {
        &self.binding
    }
}

impl InterceptorProvider for Endpoint {
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

impl PropertyScope for Endpoint {
    fn property(&self, key: &str) -> Option<PropertyValue> {
        self.provider.property(key)
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("name", &self.name)
            .field("service", &self.service.name())
            .field("binding", &self.binding.name())
            .finish_non_exhaustive()
    }
}

/// Binds the bus and endpoint scopes to an exchange and registers their
/// properties for contextual lookup, narrowest first.
pub fn bind_exchange(exchange: &Exchange, bus: &Arc<Bus>, endpoint: &Arc<Endpoint>) {
    exchange.bind(Arc::clone(bus));
    exchange.bind(Arc::clone(endpoint));
    exchange.bind(Arc::clone(endpoint.service()));
    exchange.bind(Arc::clone(endpoint.binding()));

    exchange.add_scope(Arc::clone(endpoint) as Arc<dyn PropertyScope>);
    exchange.add_scope(Arc::clone(endpoint.service()) as Arc<dyn PropertyScope>);
    exchange.add_scope(Arc::clone(bus) as Arc<dyn PropertyScope>);
}

// ---------------------------------------------------------------------------
// ScopeStack
// ---------------------------------------------------------------------------

/// The scope a provider in a [`ScopeStack`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeLevel {
    Bus,
    Client,
    Service,
    Endpoint,
    Binding,
    DataBinding,
}

/// Providers contributing to one chain, broadest scope first.
///
/// Chains concatenate the lists in this order, which is also the insertion
/// order the sort falls back to between unconstrained interceptors.
#[derive(Default)]
pub struct ScopeStack {
    layers: Vec<(ScopeLevel, Arc<dyn InterceptorProvider>)>,
}

impl ScopeStack {
    /// bus, service, endpoint, binding, databinding.
    #[must_use]
    pub fn server(bus: &Arc<Bus>, endpoint: &Arc<Endpoint>) -> Self {
        let mut stack = Self::default();
        stack.push(ScopeLevel::Bus, Arc::clone(bus) as Arc<dyn InterceptorProvider>);
        stack.push(ScopeLevel::Service, Arc::clone(endpoint.service()) as Arc<dyn InterceptorProvider>);
        stack.push_endpoint(endpoint);
        stack
    }

    /// bus, client, endpoint, binding, databinding.
    #[must_use]
    pub fn client(client: &Arc<Client>) -> Self {
        let mut stack = Self::default();
        stack.push(ScopeLevel::Bus, Arc::clone(client.bus()) as Arc<dyn InterceptorProvider>);
        stack.push(ScopeLevel::Client, Arc::clone(client) as Arc<dyn InterceptorProvider>);
        stack.push_endpoint(client.endpoint());
        stack
    }

    /// Rebuilds the stack from the scopes bound to an exchange. A bound
    /// client takes the place of the service, as in [`ScopeStack::client`].
    #[must_use]
    pub fn from_exchange(exchange: &Exchange) -> Self {
        let mut stack = Self::default();
        if let Some(bus) = exchange.bound::<Bus>() {
            stack.push(ScopeLevel::Bus, bus);
        }
        let endpoint = exchange.bound::<Endpoint>();
        if let Some(client) = exchange.bound::<Client>() {
            stack.push(ScopeLevel::Client, client);
        } else if let Some(endpoint) = &endpoint {
            stack.push(ScopeLevel::Service, Arc::clone(endpoint.service()) as Arc<dyn InterceptorProvider>);
        }
        if let Some(endpoint) = &endpoint {
            stack.push_endpoint(endpoint);
        }
        stack
    }

    fn push_endpoint(&mut self, endpoint: &Arc<Endpoint>) {
        self.push(ScopeLevel::Endpoint, Arc::clone(endpoint) as Arc<dyn InterceptorProvider>);
        self.push(ScopeLevel::Binding, Arc::clone(endpoint.binding()) as Arc<dyn InterceptorProvider>);
        if let Some(databinding) = endpoint.service().databinding() {
            self.push(ScopeLevel::DataBinding, Arc::clone(databinding));
        }
    }

    /// Appends a provider as the narrowest scope.
    pub fn push(&mut self, level: ScopeLevel, provider: Arc<dyn InterceptorProvider>) {
        self.layers.push((level, provider));
    }

    #[must_use]
    pub fn levels(&self) -> Vec<ScopeLevel> {
        self.layers.iter().map(|(level, _)| *level).collect()
    }

    /// The lists for `direction`, broadest first.
    #[must_use]
    pub fn lists(&self, direction: Direction) -> Vec<&InterceptorList> {
        self.layers
            .iter()
            .map(|(level, provider)| {
                let list = provider.interceptors(direction);
                debug!(
                    scope = ?level,
                    direction = direction.name(),
                    interceptors = ?list.ids(),
                    "interceptors contributed"
                );
                list
            })
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

impl fmt::Debug for ScopeStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.levels()).finish()
    }
}

#[cfg(test)]
mod tests {
    use phasewire_core::{FnInterceptor, InterceptorMeta, SharedInterceptor};

    use super::*;
    use crate::config::BusConfig;

    fn noop(id: &str) -> SharedInterceptor {
        FnInterceptor::new(InterceptorMeta::new(id, "invoke"), |_| Ok(())).shared()
    }

    fn endpoint(databinding: bool) -> Arc<Endpoint> {
        let mut service = Service::new("greeter");
        if databinding {
            let provider = BasicInterceptorProvider::new();
            provider.in_interceptors().push(noop("db"));
            service = service.with_databinding(Arc::new(provider));
        }
        Arc::new(Endpoint::new(
            "greeter-http",
            Arc::new(service),
            Arc::new(Binding::new("http")),
        ))
    }

    #[test]
    fn server_stack_is_broadest_first() {
        let bus = Bus::new(BusConfig::default()).unwrap();
        let endpoint = endpoint(true);
        bus.in_interceptors().push(noop("bus"));
        endpoint.service().in_interceptors().push(noop("service"));
        endpoint.in_interceptors().push(noop("endpoint"));
        endpoint.binding().in_interceptors().push(noop("binding"));

        let stack = ScopeStack::server(&bus, &endpoint);
        assert_eq!(
            stack.levels(),
            vec![
                ScopeLevel::Bus,
                ScopeLevel::Service,
                ScopeLevel::Endpoint,
                ScopeLevel::Binding,
                ScopeLevel::DataBinding,
            ]
        );
        let ids: Vec<String> = stack
            .lists(Direction::In)
            .into_iter()
            .flat_map(InterceptorList::ids)
            .collect();
        assert_eq!(ids, vec!["bus", "service", "endpoint", "binding", "db"]);
    }

    #[test]
    fn databinding_is_optional() {
        let bus = Bus::new(BusConfig::default()).unwrap();
        let stack = ScopeStack::server(&bus, &endpoint(false));
        assert_eq!(stack.len(), 4);
        assert!(!stack.levels().contains(&ScopeLevel::DataBinding));
    }

    #[test]
    fn stack_from_bound_exchange_matches_server_stack() {
        let bus = Bus::new(BusConfig::default()).unwrap();
        let endpoint = endpoint(true);
        let exchange = Exchange::new();
        bind_exchange(&exchange, &bus, &endpoint);

        let rebuilt = ScopeStack::from_exchange(&exchange);
        assert_eq!(rebuilt.levels(), ScopeStack::server(&bus, &endpoint).levels());
        assert!(ScopeStack::from_exchange(&Exchange::new()).is_empty());
    }

    #[test]
    fn contextual_lookup_prefers_narrow_scopes() {
        let bus = Bus::new(BusConfig::default()).unwrap();
        let endpoint = endpoint(false);
        bus.insert("mtom", false);
        bus.insert("bus-only", 1_u8);
        endpoint.provider().insert("mtom", true);

        let exchange = Exchange::new();
        bind_exchange(&exchange, &bus, &endpoint);
        let message = Message::new();
        exchange.set_in_message(Some(message.clone()));

        assert!(message.contextual_flag("mtom"));
        assert_eq!(message.contextual::<u8>("bus-only").as_deref(), Some(&1));
    }

    #[test]
    fn binding_initializes_created_messages() {
        let binding = Binding::new("soap").with_message_initializer(|message| {
            message.insert("content-type", String::from("text/xml"));
        });
        let message = binding.create_message();
        assert_eq!(
            message.get::<String>("content-type").as_deref().map(String::as_str),
            Some("text/xml")
        );
    }
}
