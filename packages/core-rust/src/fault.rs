//! Fault representation and the suspension signal.

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use crate::message::Message;

// ---------------------------------------------------------------------------
// Fault
// ---------------------------------------------------------------------------

/// Which side of the exchange a fault is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultCode {
    /// The request was unacceptable (bad input, failed authentication).
    Client,
    /// Processing failed on the receiving side.
    Server,
}

/// How a processing fault arose. Stored on the message and used to pick the
/// level of default fault logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultMode {
    RuntimeFault,
    LogicalRuntimeFault,
    CheckedApplicationFault,
    UncheckedApplicationFault,
}

impl FaultMode {
    /// Application faults are expected outcomes of business logic.
    #[must_use]
    pub const fn is_application(self) -> bool {
        matches!(
            self,
            Self::CheckedApplicationFault | Self::UncheckedApplicationFault
        )
    }
}

/// The distinguished fault wrapper carried on a message once fault handling
/// has started.
///
/// Wraps the original error as a shared cause so the fault can be cloned onto
/// several messages (the failed message and the out-fault message) without
/// losing the source chain.
#[derive(Debug, Clone)]
pub struct Fault {
    message: String,
    code: FaultCode,
    status_code: Option<u16>,
    cause: Option<Arc<anyhow::Error>>,
}

impl Fault {
    #[must_use]
    pub fn new(message: impl Into<String>, code: FaultCode) -> Self {
        Self {
            message: message.into(),
            code,
            status_code: None,
            cause: None,
        }
    }

    #[must_use]
    pub fn server(message: impl Into<String>) -> Self {
        Self::new(message, FaultCode::Server)
    }

    #[must_use]
    pub fn client(message: impl Into<String>) -> Self {
        Self::new(message, FaultCode::Client)
    }

    /// Wraps an arbitrary error as a server fault, keeping it as the cause.
    #[must_use]
    pub fn from_cause(cause: Arc<anyhow::Error>) -> Self {
        Self {
            message: cause.to_string(),
            code: FaultCode::Server,
            status_code: None,
            cause: Some(cause),
        }
    }

    /// Returns the error unchanged if it already is a `Fault`, otherwise
    /// wraps it.
    #[must_use]
    pub fn normalize(error: &Arc<anyhow::Error>) -> Self {
        match error.downcast_ref::<Fault>() {
            Some(fault) => fault.clone(),
            None => Self::from_cause(Arc::clone(error)),
        }
    }

    #[must_use]
    pub fn with_status_code(mut self, status_code: u16) -> Self {
        self.status_code = Some(status_code);
        self
    }

    #[must_use]
    pub fn with_cause(mut self, cause: anyhow::Error) -> Self {
        self.cause = Some(Arc::new(cause));
        self
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[must_use]
    pub fn code(&self) -> FaultCode {
        self.code
    }

    /// Status hint for transports; defaults to 500 for server faults and 400
    /// for client faults.
    #[must_use]
    pub fn status_code(&self) -> u16 {
        self.status_code.unwrap_or(match self.code {
            FaultCode::Client => 400,
            FaultCode::Server => 500,
        })
    }

    #[must_use]
    pub fn cause(&self) -> Option<&anyhow::Error> {
        self.cause.as_deref()
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl StdError for Fault {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.cause.as_ref().map(|cause| {
            let inner: &(dyn StdError + Send + Sync + 'static) = &***cause;
            inner as &(dyn StdError + 'static)
        })
    }
}

// ---------------------------------------------------------------------------
// FaultListener
// ---------------------------------------------------------------------------

/// Hook consulted before the chain logs a processing fault.
///
/// Installed as a contextual property under
/// [`keys::FAULT_LISTENER`](crate::message::keys::FAULT_LISTENER) holding an
/// `Arc<dyn FaultListener>`.
pub trait FaultListener: Send + Sync {
    /// Returns true if the chain should still emit its default log event.
    fn fault_occurred(&self, error: &anyhow::Error, description: &str, message: &Message) -> bool;
}

// ---------------------------------------------------------------------------
// SuspendedInvocation
// ---------------------------------------------------------------------------

/// Non-local exit signal requesting that the chain suspend.
///
/// An interceptor may either call
/// [`PhaseInterceptorChain::suspend`](crate::chain::PhaseInterceptorChain::suspend)
/// and return normally, or return this value as its error. The chain treats
/// both identically and never routes this signal to fault handling.
/// Interceptors must propagate it rather than swallow it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, thiserror::Error)]
#[error("invocation suspended")]
pub struct SuspendedInvocation;

impl SuspendedInvocation {
    /// Returns true if `error` is (or wraps) the suspension signal.
    #[must_use]
    pub fn is_signal(error: &anyhow::Error) -> bool {
        error.downcast_ref::<SuspendedInvocation>().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_wraps_plain_error() {
        let err = Arc::new(anyhow::anyhow!("database offline"));
        let fault = Fault::normalize(&err);
        assert_eq!(fault.message(), "database offline");
        assert_eq!(fault.code(), FaultCode::Server);
        assert_eq!(fault.status_code(), 500);
        assert!(fault.source().is_some());
    }

    #[test]
    fn normalize_passes_fault_through() {
        let original = Fault::client("missing header").with_status_code(422);
        let err = Arc::new(anyhow::Error::new(original));
        let fault = Fault::normalize(&err);
        assert_eq!(fault.code(), FaultCode::Client);
        assert_eq!(fault.status_code(), 422);
        assert!(fault.cause().is_none());
    }

    #[test]
    fn client_fault_defaults_to_400() {
        assert_eq!(Fault::client("bad").status_code(), 400);
    }

    #[test]
    fn source_exposes_original_error() {
        let fault = Fault::server("wrapped").with_cause(anyhow::anyhow!("root cause"));
        let source = fault.source().map(ToString::to_string);
        assert_eq!(source.as_deref(), Some("root cause"));
    }

    #[test]
    fn suspension_signal_is_detected() {
        let signal = anyhow::Error::new(SuspendedInvocation);
        assert!(SuspendedInvocation::is_signal(&signal));
        assert!(!SuspendedInvocation::is_signal(&anyhow::anyhow!("other")));
    }

    #[test]
    fn application_fault_modes() {
        assert!(FaultMode::CheckedApplicationFault.is_application());
        assert!(!FaultMode::RuntimeFault.is_application());
    }
}
