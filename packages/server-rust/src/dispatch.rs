//! Chain assembly and the server-side transport entry point.

use std::sync::Arc;

use phasewire_core::{
    keys, ChainError, ChainOutcome, Direction, Exchange, InterceptorProvider, Message,
    MessageObserver, PhaseChainCache, PhaseInterceptorChain, SharedInterceptor,
    UnknownPhasePolicy,
};
use tracing::debug;

use crate::bus::{Bus, BusScope};
use crate::fault::FaultChainInitiator;
use crate::scope::{bind_exchange, Endpoint, ScopeStack};

/// The exchange a dispatch ran on and how its chain ended.
#[derive(Debug)]
pub struct Dispatched {
    pub exchange: Exchange,
    pub outcome: ChainOutcome,
}

// ---------------------------------------------------------------------------
// Chain assembly helpers
// ---------------------------------------------------------------------------

/// Message property holding the per-message interceptors of `direction`.
#[must_use]
pub fn interceptors_key(direction: Direction) -> &'static str {
    match direction {
        Direction::In => keys::IN_INTERCEPTORS,
        Direction::Out => keys::OUT_INTERCEPTORS,
        Direction::InFault => keys::IN_FAULT_INTERCEPTORS,
        Direction::OutFault => keys::OUT_FAULT_INTERCEPTORS,
    }
}

/// Builds the chain for `direction` from a scope stack, through `cache` when
/// one is given and the bus enables chain caching.
///
/// # Errors
///
/// Returns [`ChainError::UnknownPhase`] when the bus runs with strict phases
/// and an interceptor names a phase the bus does not know.
pub(crate) fn assemble_chain(
    bus: &Bus,
    stack: &ScopeStack,
    direction: Direction,
    cache: Option<&PhaseChainCache>,
) -> Result<Arc<PhaseInterceptorChain>, ChainError> {
    let phases = bus.phase_manager().phases(direction);
    let lists = stack.lists(direction);
    let policy = bus.config().unknown_phase_policy();
    match cache {
        Some(cache) if bus.config().chain_cache => cache.get(phases, &lists, policy),
        _ => PhaseInterceptorChain::build(
            phases,
            lists.iter().flat_map(|list| list.snapshot().to_vec()),
            policy,
        ),
    }
}

/// Adds the interceptors a message carries for `direction`: first those of
/// its per-message providers, then its explicit interceptor list.
///
/// # Errors
///
/// Returns [`ChainError::UnknownPhase`] under a rejecting `policy`.
pub(crate) fn apply_message_interceptors(
    chain: &PhaseInterceptorChain,
    message: &Message,
    direction: Direction,
    policy: UnknownPhasePolicy,
) -> Result<(), ChainError> {
    if let Some(providers) =
        message.get::<Vec<Arc<dyn InterceptorProvider>>>(keys::INTERCEPTOR_PROVIDERS)
    {
        for provider in providers.iter() {
            chain.add_all_with(provider.interceptors(direction).snapshot().to_vec(), policy)?;
        }
    }
    if let Some(extra) = message.get::<Vec<SharedInterceptor>>(interceptors_key(direction)) {
        chain.add_all_with(extra.iter().cloned(), policy)?;
    }
    Ok(())
}

/// Runs `chain`, honouring the starting-after and starting-at properties of
/// the message (in that order of precedence).
///
/// # Errors
///
/// The errors of the `do_intercept*` call made.
pub(crate) fn start_chain(
    chain: &Arc<PhaseInterceptorChain>,
    message: &Message,
) -> Result<ChainOutcome, ChainError> {
    if let Some(id) = message.get::<String>(keys::STARTING_AFTER_INTERCEPTOR_ID) {
        debug!(interceptor = %id, "starting chain after interceptor");
        chain.do_intercept_starting_after(message, &id)
    } else if let Some(id) = message.get::<String>(keys::STARTING_AT_INTERCEPTOR_ID) {
        debug!(interceptor = %id, "starting chain at interceptor");
        chain.do_intercept_starting_at(message, &id)
    } else {
        chain.do_intercept(message)
    }
}

// ---------------------------------------------------------------------------
// ChainInitiationObserver
// ---------------------------------------------------------------------------

/// Server-side entry point: turns an incoming message into an inbound chain
/// run on one endpoint.
pub struct ChainInitiationObserver {
    bus: Arc<Bus>,
    endpoint: Arc<Endpoint>,
    cache: PhaseChainCache,
    fault_observer: Arc<dyn MessageObserver>,
}

impl ChainInitiationObserver {
    /// Faults are diverted into the bus's out-fault chain.
    #[must_use]
    pub fn new(bus: Arc<Bus>, endpoint: Arc<Endpoint>) -> Self {
        let fault_observer = Arc::new(FaultChainInitiator::outbound(Arc::clone(&bus)));
        Self {
            bus,
            endpoint,
            cache: PhaseChainCache::new(),
            fault_observer,
        }
    }

    #[must_use]
    pub fn with_fault_observer(mut self, observer: Arc<dyn MessageObserver>) -> Self {
        self.fault_observer = observer;
        self
    }

    #[must_use]
    pub fn endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }

    /// Runs the inbound chain for `message`.
    ///
    /// The message joins its existing exchange, or a new one, as the inbound
    /// message. Paused and suspended chains come back with a
    /// [`Continuation`](phasewire_core::Continuation) in the outcome for the
    /// transport to park; it is the only handle keeping the chain alive.
    ///
    /// # Errors
    ///
    /// - [`ChainError::UnknownPhase`] if chain assembly fails under strict
    ///   phases.
    /// - [`ChainError::DoubleFault`] if the fault chain itself fails.
    pub fn dispatch(&self, message: &Message) -> Result<Dispatched, ChainError> {
        let _bus = BusScope::enter(&self.bus);

        let exchange = message.exchange().unwrap_or_default();
        if exchange.slot_of(message).is_none() {
            exchange.set_in_message(Some(message.clone()));
        }
        message.insert(keys::INBOUND_MESSAGE, true);
        bind_exchange(&exchange, &self.bus, &self.endpoint);
        let correlation = exchange.correlation_id_or_insert_with(|| self.bus.ids().next_id());

        let stack = ScopeStack::server(&self.bus, &self.endpoint);
        let chain = assemble_chain(&self.bus, &stack, Direction::In, Some(&self.cache))?;
        message.set_interceptor_chain(Some(&chain));
        chain.set_fault_observer(Some(Arc::clone(&self.fault_observer)));
        apply_message_interceptors(
            &chain,
            message,
            Direction::In,
            self.bus.config().unknown_phase_policy(),
        )?;

        debug!(
            bus = self.bus.id(),
            endpoint = self.endpoint.name(),
            correlation,
            interceptors = chain.len(),
            "dispatching inbound message"
        );
        let outcome = start_chain(&chain, message)?;
        Ok(Dispatched { exchange, outcome })
    }
}

impl MessageObserver for ChainInitiationObserver {
    fn on_message(&self, message: &Message) -> anyhow::Result<()> {
        self.dispatch(message)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;
    use phasewire_core::{ChainState, FnInterceptor, InterceptorMeta, SuspendedInvocation};

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

    fn failing(log: &Log, id: &str, phase: &str) -> SharedInterceptor {
        let log = Arc::clone(log);
        let name = id.to_string();
        FnInterceptor::new(InterceptorMeta::new(id, phase), move |_| {
            log.lock().push(name.clone());
            anyhow::bail!("{name} failed")
        })
        .shared()
    }

    fn setup(config: BusConfig) -> (Arc<Bus>, Arc<Endpoint>) {
        let bus = Bus::new(config).unwrap();
        let endpoint = Arc::new(Endpoint::new(
            "orders",
            Arc::new(Service::new("order-service")),
            Arc::new(Binding::new("json")),
        ));
        (bus, endpoint)
    }

    // -- inbound dispatch ---------------------------------------------------

    #[test]
    fn scopes_contribute_in_phase_order() {
        let log = Log::default();
        let (bus, endpoint) = setup(BusConfig::default());
        bus.in_interceptors().push(recording(&log, "bus-invoke", "invoke"));
        endpoint.binding().in_interceptors().push(recording(&log, "binding-read", "read"));
        endpoint.service().in_interceptors().push(recording(&log, "service-invoke", "invoke"));
        endpoint.in_interceptors().push(recording(&log, "endpoint-receive", "receive"));

        let observer = ChainInitiationObserver::new(bus, endpoint);
        let message = Message::new();
        let dispatched = observer.dispatch(&message).unwrap();

        assert!(dispatched.outcome.is_complete());
        assert_eq!(
            *log.lock(),
            vec!["endpoint-receive", "binding-read", "bus-invoke", "service-invoke"]
        );
        assert!(dispatched.exchange.in_message().unwrap().ptr_eq(&message));
        assert!(message.is_inbound());
        assert!(dispatched.exchange.correlation_id().is_some());
        assert!(dispatched.exchange.bound::<Bus>().is_some());
    }

    #[test]
    fn per_message_interceptors_and_providers_are_merged() {
        let log = Log::default();
        let (bus, endpoint) = setup(BusConfig::default());
        endpoint.in_interceptors().push(recording(&log, "endpoint", "invoke"));

        let extra = phasewire_core::BasicInterceptorProvider::new();
        extra.in_interceptors().push(recording(&log, "provided", "receive"));
        let message = Message::new();
        message.insert(
            keys::INTERCEPTOR_PROVIDERS,
            vec![Arc::new(extra) as Arc<dyn InterceptorProvider>],
        );
        message.insert(
            keys::IN_INTERCEPTORS,
            vec![recording(&log, "explicit", "post-invoke")],
        );

        ChainInitiationObserver::new(bus, endpoint)
            .dispatch(&message)
            .unwrap();
        assert_eq!(*log.lock(), vec!["provided", "endpoint", "explicit"]);
    }

    #[test]
    fn starting_after_property_skips_earlier_interceptors() {
        let log = Log::default();
        let (bus, endpoint) = setup(BusConfig::default());
        for (id, phase) in [("a", "receive"), ("b", "read"), ("c", "invoke")] {
            endpoint.in_interceptors().push(recording(&log, id, phase));
        }
        let observer = ChainInitiationObserver::new(bus, endpoint);

        let message = Message::new();
        message.insert(keys::STARTING_AFTER_INTERCEPTOR_ID, String::from("a"));
        observer.dispatch(&message).unwrap();
        assert_eq!(*log.lock(), vec!["b", "c"]);

        log.lock().clear();
        let message = Message::new();
        message.insert(keys::STARTING_AT_INTERCEPTOR_ID, String::from("c"));
        observer.dispatch(&message).unwrap();
        assert_eq!(*log.lock(), vec!["c"]);
    }

    #[test]
    fn unknown_starting_id_is_an_error() {
        let (bus, endpoint) = setup(BusConfig::default());
        let message = Message::new();
        message.insert(keys::STARTING_AT_INTERCEPTOR_ID, String::from("ghost"));
        let err = ChainInitiationObserver::new(bus, endpoint)
            .dispatch(&message)
            .unwrap_err();
        assert!(matches!(err, ChainError::InterceptorNotFound { .. }));
    }

    #[test]
    fn strict_phases_reject_unknown_phase() {
        let log = Log::default();
        let (bus, endpoint) = setup(BusConfig::default());
        endpoint.in_interceptors().push(recording(&log, "lost", "nowhere"));
        let err = ChainInitiationObserver::new(bus, endpoint)
            .dispatch(&Message::new())
            .unwrap_err();
        assert!(matches!(err, ChainError::UnknownPhase { .. }));
    }

    #[test]
    fn lenient_phases_skip_unknown_phase() {
        let log = Log::default();
        let (bus, endpoint) = setup(BusConfig {
            strict_phases: false,
            ..BusConfig::default()
        });
        endpoint.in_interceptors().push(recording(&log, "lost", "nowhere"));
        endpoint.in_interceptors().push(recording(&log, "kept", "invoke"));
        let dispatched = ChainInitiationObserver::new(bus, endpoint)
            .dispatch(&Message::new())
            .unwrap();
        assert!(dispatched.outcome.is_complete());
        assert_eq!(*log.lock(), vec!["kept"]);
    }

    #[test]
    fn cached_chain_picks_up_list_changes() {
        let log = Log::default();
        let (bus, endpoint) = setup(BusConfig::default());
        endpoint.in_interceptors().push(recording(&log, "first", "invoke"));
        let observer = ChainInitiationObserver::new(bus, Arc::clone(&endpoint));

        observer.dispatch(&Message::new()).unwrap();
        endpoint.in_interceptors().push(recording(&log, "second", "post-invoke"));
        observer.dispatch(&Message::new()).unwrap();
        assert_eq!(*log.lock(), vec!["first", "first", "second"]);
    }

    #[test]
    fn dispatch_runs_under_the_bus() {
        let (bus, endpoint) = setup(BusConfig {
            bus_id: String::from("ambient"),
            ..BusConfig::default()
        });
        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        endpoint.in_interceptors().push(
            FnInterceptor::new(InterceptorMeta::new("inspector", "invoke"), move |_| {
                *sink.lock() = Bus::thread_default().map(|bus| bus.id().to_string());
                Ok(())
            })
            .shared(),
        );

        ChainInitiationObserver::new(bus, endpoint)
            .dispatch(&Message::new())
            .unwrap();
        assert_eq!(seen.lock().as_deref(), Some("ambient"));
        assert!(Bus::thread_default().is_none());
    }

    // -- faults -------------------------------------------------------------

    #[test]
    fn processing_fault_is_diverted_to_out_fault_chain() {
        let log = Log::default();
        let (bus, endpoint) = setup(BusConfig::default());
        endpoint.in_interceptors().push(recording(&log, "A", "unmarshal"));
        endpoint.in_interceptors().push(failing(&log, "B", "invoke"));
        bus.out_fault_interceptors().push(recording(&log, "fault-writer", "marshal"));

        let dispatched = ChainInitiationObserver::new(bus, endpoint)
            .dispatch(&Message::new())
            .unwrap();

        assert!(matches!(dispatched.outcome, ChainOutcome::Faulted));
        assert_eq!(*log.lock(), vec!["A", "B", "fault-writer"]);
        let fault_message = dispatched.exchange.out_fault_message().unwrap();
        assert_eq!(fault_message.fault().unwrap().message(), "B failed");
        assert!(dispatched.exchange.out_message().is_none());
    }

    #[test]
    fn suspended_dispatch_returns_continuation() {
        let log = Log::default();
        let (bus, endpoint) = setup(BusConfig::default());
        let suspended_once = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&suspended_once);
        let inner_log = Arc::clone(&log);
        endpoint.in_interceptors().push(
            FnInterceptor::new(InterceptorMeta::new("async", "invoke"), move |_| {
                inner_log.lock().push(String::from("async"));
                let mut done = flag.lock();
                if *done {
                    return Ok(());
                }
                *done = true;
                Err(SuspendedInvocation.into())
            })
            .shared(),
        );
        endpoint.in_interceptors().push(recording(&log, "after", "post-invoke"));

        let dispatched = ChainInitiationObserver::new(bus, endpoint)
            .dispatch(&Message::new())
            .unwrap();
        let continuation = dispatched.outcome.continuation().unwrap();
        assert_eq!(continuation.chain().state(), ChainState::Suspended);

        assert!(continuation.resume().unwrap().is_complete());
        assert_eq!(*log.lock(), vec!["async", "async", "after"]);
    }

    #[test]
    fn paused_dispatch_resumes_after_pauser() {
        let log = Log::default();
        let (bus, endpoint) = setup(BusConfig::default());
        let inner_log = Arc::clone(&log);
        endpoint.in_interceptors().push(
            FnInterceptor::new(InterceptorMeta::new("hold", "invoke"), move |message| {
                inner_log.lock().push(String::from("hold"));
                if let Some(chain) = message.interceptor_chain() {
                    chain.pause();
                }
                Ok(())
            })
            .shared(),
        );
        endpoint.in_interceptors().push(recording(&log, "after", "post-invoke"));

        let message = Message::new();
        let dispatched = ChainInitiationObserver::new(bus, endpoint)
            .dispatch(&message)
            .unwrap();
        assert!(dispatched.outcome.is_paused());
        assert!(message.interceptor_chain().is_some());

        let continuation = dispatched.outcome.continuation().unwrap();
        assert_eq!(continuation.chain().state(), ChainState::Paused);
        assert!(continuation.resume().unwrap().is_complete());
        assert_eq!(*log.lock(), vec!["hold", "after"]);
    }
}
