//! Message logging interceptors.
//!
//! Each emits one structured event per message under the
//! `phasewire::messages` target. Events carry the exchange correlation id,
//! drawn from the ambient bus's id generator the first time it is needed, so
//! the request, response, and fault-chain events of one exchange share it.

use phasewire_core::{names, Interceptor, InterceptorMeta, Message};
use tracing::info;

use crate::bus::Bus;

const TARGET: &str = "phasewire::messages";

/// Summary fields shared by both interceptors.
struct MessageSummary {
    correlation: Option<u64>,
    operation: Option<String>,
    properties: usize,
    contents: usize,
    fault: Option<String>,
}

impl MessageSummary {
    fn of(message: &Message) -> Self {
        let exchange = message.exchange();
        let correlation = exchange.as_ref().map(|exchange| {
            exchange.correlation_id_or_insert_with(|| {
                Bus::thread_default().map_or(0, |bus| bus.ids().next_id())
            })
        });
        Self {
            correlation,
            operation: exchange.as_ref().and_then(phasewire_core::Exchange::operation),
            properties: message.with_properties(phasewire_core::Properties::len),
            contents: message.content_count(),
            fault: message.exception().map(|error| error.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// LoggingInInterceptor
// ---------------------------------------------------------------------------

/// Logs inbound messages as they are received.
pub struct LoggingInInterceptor {
    meta: InterceptorMeta,
}

impl LoggingInInterceptor {
    #[must_use]
    pub fn new() -> Self {
        Self {
            meta: InterceptorMeta::for_type::<Self>(names::RECEIVE),
        }
    }
}

impl Default for LoggingInInterceptor {
    fn default() -> Self {
        Self::new()
    }
}

impl Interceptor for LoggingInInterceptor {
    fn meta(&self) -> &InterceptorMeta {
        &self.meta
    }

    fn handle_message(&self, message: &Message) -> anyhow::Result<()> {
        let summary = MessageSummary::of(message);
        info!(
            target: TARGET,
            direction = "inbound",
            correlation = summary.correlation,
            operation = summary.operation.as_deref(),
            requestor = message.is_requestor(),
            properties = summary.properties,
            contents = summary.contents,
            fault = summary.fault.as_deref(),
            "message received"
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// LoggingOutInterceptor
// ---------------------------------------------------------------------------

/// Logs outbound messages before they are streamed.
pub struct LoggingOutInterceptor {
    meta: InterceptorMeta,
}

impl LoggingOutInterceptor {
    #[must_use]
    pub fn new() -> Self {
        Self {
            meta: InterceptorMeta::for_type::<Self>(names::PRE_STREAM),
        }
    }
}

impl Default for LoggingOutInterceptor {
    fn default() -> Self {
        Self::new()
    }
}

impl Interceptor for LoggingOutInterceptor {
    fn meta(&self) -> &InterceptorMeta {
        &self.meta
    }

    fn handle_message(&self, message: &Message) -> anyhow::Result<()> {
        let summary = MessageSummary::of(message);
        info!(
            target: TARGET,
            direction = "outbound",
            correlation = summary.correlation,
            operation = summary.operation.as_deref(),
            requestor = message.is_requestor(),
            properties = summary.properties,
            contents = summary.contents,
            fault = summary.fault.as_deref(),
            "message sending"
        );
        Ok(())
    }
}
