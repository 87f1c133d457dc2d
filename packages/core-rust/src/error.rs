//! Error types for phase registry construction and chain execution.

use std::sync::Arc;

use crate::chain::ChainState;

/// Errors raised while building a [`PhaseSet`](crate::phase::PhaseSet).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PhaseError {
    #[error("phase `{name}` is declared more than once")]
    DuplicateName { name: String },
    #[error("phases `{first}` and `{second}` share priority {priority}")]
    DuplicatePriority {
        first: String,
        second: String,
        priority: i32,
    },
    #[error("phase `{name}` at position {position} has no representable priority")]
    PriorityOverflow { name: String, position: usize },
}

/// Errors surfaced by a [`PhaseInterceptorChain`](crate::chain::PhaseInterceptorChain).
#[derive(Debug, Clone, thiserror::Error)]
pub enum ChainError {
    /// An interceptor declared a phase the chain's registry does not know.
    #[error("interceptor `{id}` declares unknown phase `{phase}`")]
    UnknownPhase { id: String, phase: String },
    /// A named starting position does not exist in the chain.
    #[error("no interceptor with id `{id}` in chain")]
    InterceptorNotFound { id: String },
    /// `resume` was called on a chain that is not paused or suspended, or has
    /// no stored message to resume with.
    #[error("chain cannot be resumed from state {state:?}")]
    NotResumable { state: ChainState },
    /// A processing fault escaped the chain because no fault observer is set.
    #[error("unhandled fault: {0}")]
    Unhandled(Arc<anyhow::Error>),
    /// The fault observer itself failed while handling a processing fault.
    #[error("fault during fault processing: {0}")]
    DoubleFault(Arc<anyhow::Error>),
}

impl ChainError {
    /// Returns the underlying cause for the two fault variants.
    #[must_use]
    pub fn cause(&self) -> Option<&anyhow::Error> {
        match self {
            Self::Unhandled(err) | Self::DoubleFault(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_phase_message_names_interceptor_and_phase() {
        let err = ChainError::UnknownPhase {
            id: "logging".to_string(),
            phase: "nowhere".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "interceptor `logging` declares unknown phase `nowhere`"
        );
        assert!(err.cause().is_none());
    }

    #[test]
    fn fault_variants_expose_cause() {
        let cause = Arc::new(anyhow::anyhow!("boom"));
        let err = ChainError::DoubleFault(Arc::clone(&cause));
        assert_eq!(err.cause().map(ToString::to_string).as_deref(), Some("boom"));
    }
}
