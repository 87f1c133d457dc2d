//! Diversion of faulted messages into the fault chains.
//!
//! A [`FaultChainInitiator`] is installed as the fault observer of a main
//! chain. It moves the faulted message (or a fresh one, outbound) into the
//! exchange's fault slot, assembles a new chain over the fault phases from
//! every scope's fault interceptors, and runs it. A failure inside that chain
//! is a double fault: it is logged and returned, never diverted again.

use std::sync::Arc;

use phasewire_core::{
    ChainError, Direction, Exchange, Fault, Message, MessageObserver, MessageSlot,
    PhaseInterceptorChain,
};
use tracing::{debug, error};

use crate::bus::{Bus, BusScope};
use crate::dispatch::{apply_message_interceptors, start_chain};
use crate::scope::{Binding, ScopeStack};

/// Starts the in-fault or out-fault chain for a faulted message.
pub struct FaultChainInitiator {
    bus: Arc<Bus>,
    direction: Direction,
}

impl FaultChainInitiator {
    /// Diverts into the in-fault chain; the faulted message becomes the
    /// exchange's in-fault message.
    #[must_use]
    pub fn inbound(bus: Arc<Bus>) -> Self {
        Self {
            bus,
            direction: Direction::InFault,
        }
    }

    /// Diverts into the out-fault chain; the exchange's out message (or a new
    /// binding message) becomes its out-fault message.
    #[must_use]
    pub fn outbound(bus: Arc<Bus>) -> Self {
        Self {
            bus,
            direction: Direction::OutFault,
        }
    }

    #[must_use]
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Moves the fault into its slot and returns the message the fault chain
    /// will run on.
    fn prepare_fault_message(&self, message: &Message, exchange: &Exchange) -> Message {
        let error = message
            .exception()
            .unwrap_or_else(|| Arc::new(anyhow::Error::new(Fault::server("unspecified fault"))));
        let exception = if error.downcast_ref::<Fault>().is_some() {
            error
        } else {
            Arc::new(anyhow::Error::new(Fault::normalize(&error)))
        };

        match self.direction {
            Direction::OutFault => {
                let fault_message = exchange.out_message().unwrap_or_else(|| {
                    exchange
                        .bound::<Binding>()
                        .map_or_else(Message::new, |binding| binding.create_message())
                });
                fault_message.set_exception(Some(exception));
                if let Some(mode) = message.fault_mode() {
                    fault_message.set_fault_mode(Some(mode));
                }
                exchange.set_message(MessageSlot::Out, None);
                exchange.set_message(MessageSlot::OutFault, Some(fault_message.clone()));
                fault_message
            }
            _ => {
                message.set_exception(Some(exception));
                exchange.set_message(MessageSlot::In, None);
                exchange.set_message(MessageSlot::InFault, Some(message.clone()));
                message.clone()
            }
        }
    }

    fn run(&self, message: &Message) -> Result<(), ChainError> {
        let exchange = message.exchange().unwrap_or_default();
        let fault_message = self.prepare_fault_message(message, &exchange);

        let policy = self.bus.config().unknown_phase_policy();
        let stack = ScopeStack::from_exchange(&exchange);
        let chain = PhaseInterceptorChain::build(
            self.bus.phase_manager().phases(self.direction),
            stack
                .lists(self.direction)
                .iter()
                .flat_map(|list| list.snapshot().to_vec()),
            policy,
        )?;
        fault_message.set_interceptor_chain(Some(&chain));

        let mut contributors: Vec<Message> = Vec::new();
        for candidate in [
            Some(message.clone()),
            exchange.in_message(),
            exchange.out_message(),
            Some(fault_message.clone()),
        ]
        .into_iter()
        .flatten()
        {
            if !contributors.iter().any(|seen| seen.ptr_eq(&candidate)) {
                contributors.push(candidate);
            }
        }
        for contributor in &contributors {
            apply_message_interceptors(&chain, contributor, self.direction, policy)?;
        }

        debug!(
            direction = self.direction.name(),
            interceptors = chain.len(),
            correlation = exchange.correlation_id(),
            "starting fault chain"
        );
        start_chain(&chain, &fault_message).map(|_| ())
    }
}

impl MessageObserver for FaultChainInitiator {
    fn on_message(&self, message: &Message) -> anyhow::Result<()> {
        let _bus = BusScope::enter(&self.bus);
        self.run(message).map_err(|err| {
            error!(
                direction = self.direction.name(),
                error = %err,
                "error during fault processing; giving up on the exchange"
            );
            anyhow::Error::new(into_double_fault(err))
        })
    }
}

fn into_double_fault(err: ChainError) -> ChainError {
    match err {
        ChainError::DoubleFault(_) => err,
        ChainError::Unhandled(cause) => ChainError::DoubleFault(cause),
        other => ChainError::DoubleFault(Arc::new(anyhow::Error::new(other))),
    }
}
