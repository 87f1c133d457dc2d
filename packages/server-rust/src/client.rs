//! Client-side dispatch: outbound requests and the responses they receive.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use phasewire_core::{
    keys, BasicInterceptorProvider, ChainError, ChainOutcome, Direction, Exchange,
    InterceptorList, InterceptorProvider, Message, MessageObserver, PhaseChainCache,
};
use thiserror::Error;
use tracing::debug;

use crate::bus::{Bus, BusScope};
use crate::dispatch::{apply_message_interceptors, assemble_chain, start_chain, Dispatched};
use crate::fault::FaultChainInitiator;
use crate::scope::{bind_exchange, Endpoint, ScopeStack};

/// Errors returned to the caller of a client invocation.
#[derive(Debug, Error)]
pub enum InvokeError {
    #[error(transparent)]
    Chain(#[from] ChainError),

    /// The request or response chain faulted; carries the recorded error.
    #[error("invocation failed: {0}")]
    Fault(Arc<anyhow::Error>),

    #[error("response message is not attached to an exchange")]
    NoExchange,
}

/// Sends requests to one endpoint and processes its responses.
pub struct Client {
    bus: Arc<Bus>,
    endpoint: Arc<Endpoint>,
    provider: BasicInterceptorProvider,
    out_cache: PhaseChainCache,
    in_cache: PhaseChainCache,
    out_fault_observer: Arc<dyn MessageObserver>,
    in_fault_observer: Arc<dyn MessageObserver>,
}

impl Client {
    #[must_use]
    pub fn new(bus: Arc<Bus>, endpoint: Arc<Endpoint>) -> Arc<Self> {
        Arc::new(Self {
            out_fault_observer: Arc::new(FaultChainInitiator::outbound(Arc::clone(&bus))),
            in_fault_observer: Arc::new(FaultChainInitiator::inbound(Arc::clone(&bus))),
            bus,
            endpoint,
            provider: BasicInterceptorProvider::new(),
            out_cache: PhaseChainCache::new(),
            in_cache: PhaseChainCache::new(),
        })
    }

    #[must_use]
    pub fn bus(&self) -> &Arc<Bus> {
        &self.bus
    }

    #[must_use]
    pub fn endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }

    /// Runs the outbound chain for one request.
    ///
    /// `request` is stored as the typed content of a new binding message,
    /// which becomes the exchange's out message. A response delivered later
    /// through [`Client::receive`] lands in the same exchange.
    ///
    /// # Errors
    ///
    /// - [`InvokeError::Chain`] for chain assembly errors and double faults.
    /// - [`InvokeError::Fault`] if the outbound chain faulted.
    pub fn invoke<T: Any + Send + Sync>(
        self: &Arc<Self>,
        operation: &str,
        request: T,
    ) -> Result<Dispatched, InvokeError> {
        self.invoke_on(Exchange::new(), operation, request)
    }

    /// [`invoke`](Self::invoke) on a caller-supplied exchange.
    ///
    /// # Errors
    ///
    /// Same as [`invoke`](Self::invoke).
    pub fn invoke_on<T: Any + Send + Sync>(
        self: &Arc<Self>,
        exchange: Exchange,
        operation: &str,
        request: T,
    ) -> Result<Dispatched, InvokeError> {
        let _bus = BusScope::enter(&self.bus);

        let message = self.endpoint.binding().create_message();
        message.set_content(request);
        message.insert(keys::REQUESTOR_ROLE, true);
        exchange.set_operation(Some(operation.to_string()));
        exchange.set_out_message(Some(message.clone()));
        self.bind(&exchange);
        let correlation = exchange.correlation_id_or_insert_with(|| self.bus.ids().next_id());

        let stack = ScopeStack::client(self);
        let chain = assemble_chain(&self.bus, &stack, Direction::Out, Some(&self.out_cache))?;
        message.set_interceptor_chain(Some(&chain));
        chain.set_fault_observer(Some(Arc::clone(&self.out_fault_observer)));
        apply_message_interceptors(
            &chain,
            &message,
            Direction::Out,
            self.bus.config().unknown_phase_policy(),
        )?;

        debug!(
            endpoint = self.endpoint.name(),
            operation,
            correlation,
            interceptors = chain.len(),
            "invoking operation"
        );
        let outcome = chain.do_intercept(&message)?;
        if let Some(error) = message.exception().or_else(|| exchange.exception()) {
            return Err(InvokeError::Fault(error));
        }
        Ok(Dispatched { exchange, outcome })
    }

    /// Runs the inbound chain for a response that belongs to an exchange
    /// created by [`invoke`](Self::invoke).
    ///
    /// A response that already carries an exception goes straight to the
    /// in-fault chain.
    ///
    /// # Errors
    ///
    /// - [`InvokeError::NoExchange`] if the message has no exchange.
    /// - [`InvokeError::Chain`] for chain assembly errors and double faults.
    /// - [`InvokeError::Fault`] if the response chain faulted.
    pub fn receive(self: &Arc<Self>, message: &Message) -> Result<Dispatched, InvokeError> {
        let _bus = BusScope::enter(&self.bus);

        let exchange = message.exchange().ok_or(InvokeError::NoExchange)?;
        message.insert(keys::REQUESTOR_ROLE, true);
        message.insert(keys::INBOUND_MESSAGE, true);
        if !exchange.in_message().is_some_and(|held| held.ptr_eq(message)) {
            exchange.set_in_message(Some(message.clone()));
        }
        if exchange.bound::<Client>().is_none() {
            self.bind(&exchange);
        }

        let stack = ScopeStack::client(self);
        let chain = assemble_chain(&self.bus, &stack, Direction::In, Some(&self.in_cache))?;
        message.set_interceptor_chain(Some(&chain));
        chain.set_fault_observer(Some(Arc::clone(&self.in_fault_observer)));
        let policy = self.bus.config().unknown_phase_policy();
        apply_message_interceptors(&chain, message, Direction::In, policy)?;
        if let Some(request) = exchange.out_message() {
            apply_message_interceptors(&chain, &request, Direction::In, policy)?;
        }

        let has_start = message.contains_key(keys::STARTING_AFTER_INTERCEPTOR_ID)
            || message.contains_key(keys::STARTING_AT_INTERCEPTOR_ID);
        let outcome = if !has_start && message.exception().is_some() {
            self.in_fault_observer
                .on_message(message)
                .map_err(|err| match err.downcast::<ChainError>() {
                    Ok(chain_error) => InvokeError::Chain(chain_error),
                    Err(other) => InvokeError::Fault(Arc::new(other)),
                })?;
            ChainOutcome::Faulted
        } else {
            start_chain(&chain, message)?
        };

        let fault = exchange
            .in_fault_message()
            .and_then(|faulted| faulted.exception());
        if let Some(error) = fault {
            return Err(InvokeError::Fault(error));
        }
        Ok(Dispatched { exchange, outcome })
    }

    fn bind(self: &Arc<Self>, exchange: &Exchange) {
        bind_exchange(exchange, &self.bus, &self.endpoint);
        exchange.bind(Arc::clone(self));
    }
}

impl InterceptorProvider for Client {
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

/// Response entry point for transports holding only the client handle.
pub struct ResponseObserver(pub Arc<Client>);

impl MessageObserver for ResponseObserver {
    fn on_message(&self, message: &Message) -> anyhow::Result<()> {
        self.0.receive(message)?;
        Ok(())
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("bus", &self.bus.id())
            .field("endpoint", &self.endpoint.name())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;
    use phasewire_core::{FnInterceptor, InterceptorMeta, SharedInterceptor};

    use super::*;
    use crate::config::BusConfig;
    use crate::scope::{Binding, Service};

    type Log = Arc<Mutex<Vec<String>>>;

    fn recording(log: &Log, id: &str, phase: &str) -> SharedInterceptor {
        let log = Arc::clone(log);
        let name = id.to_string();
        FnInterceptor::new(InterceptorMeta::new(id, phase), move |_| {
            log.lock().push(name.clone());
            Ok(())
        })
        .shared()
    }

    fn client() -> Arc<Client> {
        let bus = Bus::new(BusConfig::default()).unwrap();
        let endpoint = Arc::new(Endpoint::new(
            "quotes",
            Arc::new(Service::new("quote-service")),
            Arc::new(Binding::new("json")),
        ));
        Client::new(bus, endpoint)
    }

    #[test]
    fn invoke_runs_outbound_scopes_in_phase_order() {
        let log = Log::default();
        let client = client();
        client.bus().out_interceptors().push(recording(&log, "bus-send", "send"));
        client.out_interceptors().push(recording(&log, "client-setup", "setup"));
        client.endpoint().out_interceptors().push(recording(&log, "endpoint-marshal", "marshal"));
        client.endpoint().service().out_interceptors().push(recording(&log, "service-only", "setup"));

        let dispatched = client.invoke("price", String::from("ACME")).unwrap();

        assert!(dispatched.outcome.is_complete());
        assert_eq!(*log.lock(), vec!["client-setup", "endpoint-marshal", "bus-send"]);
        let request = dispatched.exchange.out_message().unwrap();
        assert_eq!(request.content::<String>().as_deref(), Some("ACME"));
        assert!(request.is_requestor());
        assert_eq!(dispatched.exchange.operation().as_deref(), Some("price"));
    }

    #[test]
    fn outbound_fault_is_returned_to_caller() {
        let log = Log::default();
        let client = client();
        client.out_interceptors().push(
            FnInterceptor::new(InterceptorMeta::new("conduit", "send"), |_| {
                anyhow::bail!("connection refused")
            })
            .shared(),
        );
        client.out_fault_interceptors().push(recording(&log, "client-fault", "setup"));

        let err = client.invoke("price", 1_u32).unwrap_err();
        assert!(matches!(err, InvokeError::Fault(ref cause) if cause.to_string() == "connection refused"));
        assert_eq!(*log.lock(), vec!["client-fault"]);
    }

    #[test]
    fn paused_invoke_can_be_resumed_later() {
        let log = Log::default();
        let client = client();
        let hold_log = Arc::clone(&log);
        client.out_interceptors().push(
            FnInterceptor::new(InterceptorMeta::new("await-credentials", "setup"), move |message| {
                hold_log.lock().push(String::from("await-credentials"));
                if let Some(chain) = message.interceptor_chain() {
                    chain.pause();
                }
                Ok(())
            })
            .shared(),
        );
        client.out_interceptors().push(recording(&log, "conduit", "send"));

        let dispatched = client.invoke("price", 7_u32).unwrap();
        let continuation = dispatched.outcome.continuation().unwrap();
        assert_eq!(*log.lock(), vec!["await-credentials"]);

        assert!(continuation.resume().unwrap().is_complete());
        assert_eq!(*log.lock(), vec!["await-credentials", "conduit"]);
    }

    #[test]
    fn response_runs_inbound_chain_on_same_exchange() {
        let log = Log::default();
        let client = client();
        client.in_interceptors().push(recording(&log, "client-read", "read"));
        client.bus().in_interceptors().push(recording(&log, "bus-receive", "receive"));

        let dispatched = client.invoke_on(Exchange::new(), "price", 3_u8).unwrap();
        let request = dispatched.exchange.out_message().unwrap();
        request.insert(keys::IN_INTERCEPTORS, vec![recording(&log, "request-scoped", "invoke")]);

        let response = Message::new();
        dispatched.exchange.set_in_message(Some(response.clone()));
        let received = client.receive(&response).unwrap();

        assert!(received.outcome.is_complete());
        assert!(received.exchange.ptr_eq(&dispatched.exchange));
        assert!(response.is_inbound());
        assert!(response.is_requestor());
        assert_eq!(*log.lock(), vec!["bus-receive", "client-read", "request-scoped"]);
    }

    #[test]
    fn response_with_exception_goes_to_in_fault_chain() {
        let log = Log::default();
        let client = client();
        client.in_interceptors().push(recording(&log, "client-read", "read"));
        client.in_fault_interceptors().push(recording(&log, "client-fault", "receive"));

        let dispatched = client.invoke("price", 3_u8).unwrap();
        let response = Message::new();
        dispatched.exchange.set_in_message(Some(response.clone()));
        response.set_exception(Some(Arc::new(anyhow::anyhow!("remote fault"))));

        let err = client.receive(&response).unwrap_err();
        assert!(matches!(err, InvokeError::Fault(_)));
        assert_eq!(*log.lock(), vec!["client-fault"]);
        assert!(dispatched.exchange.in_message().is_none());
        assert!(dispatched.exchange.in_fault_message().unwrap().ptr_eq(&response));
    }

    #[test]
    fn response_without_exchange_is_rejected() {
        let client = client();
        let err = client.receive(&Message::new()).unwrap_err();
        assert!(matches!(err, InvokeError::NoExchange));
    }

    #[test]
    fn response_observer_delegates_to_client() {
        let log = Log::default();
        let client = client();
        client.in_interceptors().push(recording(&log, "client-read", "read"));
        let dispatched = client.invoke("price", 3_u8).unwrap();
        let response = Message::new();
        dispatched.exchange.set_in_message(Some(response.clone()));

        ResponseObserver(Arc::clone(&client)).on_message(&response).unwrap();
        assert!(response.is_inbound());
        assert_eq!(*log.lock(), vec!["client-read"]);
    }
}
