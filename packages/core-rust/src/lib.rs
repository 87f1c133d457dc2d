//! `Phasewire` Core: phase registry, interceptors, messages, and the phase interceptor chain.

pub mod chain;
pub mod error;
pub mod fault;
pub mod interceptor;
pub mod message;
pub mod observer;
pub mod phase;
pub mod properties;
pub mod provider;

pub use chain::cache::PhaseChainCache;
pub use chain::{
    current_message, ChainCursor, ChainOutcome, ChainState, Continuation, PhaseInterceptorChain,
    UnknownPhasePolicy, UnresolvedConstraint,
};
pub use error::{ChainError, PhaseError};
pub use fault::{Fault, FaultCode, FaultListener, FaultMode, SuspendedInvocation};
pub use interceptor::{FnInterceptor, Interceptor, InterceptorMeta, SharedInterceptor};
pub use message::{keys, Exchange, Message, MessageSlot};
pub use observer::MessageObserver;
pub use phase::{names, DefaultPhaseManager, Direction, Phase, PhaseManager, PhaseSet};
pub use properties::{Properties, PropertyScope, PropertyValue};
pub use provider::{
    AttributedInterceptorProvider, BasicInterceptorProvider, InterceptorList, InterceptorProvider,
};

#[cfg(test)]
mod tests {
    #[test]
    fn crate_loads() {
        // Empty body: if this test runs, the crate compiles and loads.
    }
}
