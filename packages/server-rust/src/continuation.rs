//! Parking of paused and suspended chains for asynchronous transports.
//!
//! A transport that gets [`ChainOutcome::Suspended`] (or
//! [`ChainOutcome::Paused`]) back from a dispatch
//! parks the continuation here under a fresh id, hands the id to whatever
//! will complete the work, and resumes by id later. Resumption runs the rest
//! of the chain on the tokio blocking pool, under the bus the registry
//! belongs to.

use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use phasewire_core::{ChainError, ChainOutcome, Continuation};
use thiserror::Error;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::bus::{Bus, BusScope};

#[derive(Debug, Error)]
pub enum ResumeError {
    #[error("no parked continuation with id {0}")]
    Unknown(Uuid),

    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error("resume task failed: {0}")]
    Join(#[from] JoinError),
}

struct ParkedContinuation {
    continuation: Continuation,
    /// Abort timer started by `park_with_timeout`, cancelled on removal.
    timer: Option<JoinHandle<()>>,
}

/// Parked continuations keyed by id.
pub struct ContinuationRegistry {
    bus: Weak<Bus>,
    parked: DashMap<Uuid, ParkedContinuation>,
    timeout: Duration,
}

impl ContinuationRegistry {
    /// A registry not tied to a bus; resumed chains run without an ambient
    /// bus.
    #[must_use]
    pub fn new(timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            bus: Weak::new(),
            parked: DashMap::new(),
            timeout,
        })
    }

    /// A registry using the bus's `suspend_timeout`.
    #[must_use]
    pub fn for_bus(bus: &Arc<Bus>) -> Arc<Self> {
        Arc::new(Self {
            bus: Arc::downgrade(bus),
            parked: DashMap::new(),
            timeout: bus.config().suspend_timeout(),
        })
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Parks a continuation until it is resumed or aborted.
    pub fn park(&self, continuation: Continuation) -> Uuid {
        let id = Uuid::new_v4();
        self.parked.insert(
            id,
            ParkedContinuation {
                continuation,
                timer: None,
            },
        );
        debug!(%id, "continuation parked");
        id
    }

    /// Parks a continuation and aborts it if it is still parked after the
    /// registry timeout.
    ///
    /// Must be called from within a tokio runtime.
    pub fn park_with_timeout(self: &Arc<Self>, continuation: Continuation) -> Uuid {
        let id = self.park(continuation);
        let registry = Arc::downgrade(self);
        let timeout = self.timeout;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(registry) = registry.upgrade() else {
                return;
            };
            if let Some((_, parked)) = registry.parked.remove(&id) {
                warn!(%id, timeout_ms = timeout.as_millis(), "parked exchange timed out; aborting");
                parked.continuation.abort();
            }
        });
        match self.parked.get_mut(&id) {
            Some(mut parked) => parked.timer = Some(timer),
            None => timer.abort(),
        }
        id
    }

    /// Removes a continuation without resuming it, cancelling its timer.
    pub fn take(&self, id: &Uuid) -> Option<Continuation> {
        let (_, parked) = self.parked.remove(id)?;
        if let Some(timer) = parked.timer {
            timer.abort();
        }
        Some(parked.continuation)
    }

    /// Aborts a parked continuation. Returns false if `id` is not parked.
    pub fn abort(&self, id: &Uuid) -> bool {
        match self.take(id) {
            Some(continuation) => {
                continuation.abort();
                true
            }
            None => false,
        }
    }

    /// Resumes a parked continuation on the blocking pool.
    ///
    /// A chain that pauses or suspends again returns a new continuation in
    /// its outcome; park it again to keep waiting.
    ///
    /// # Errors
    ///
    /// - [`ResumeError::Unknown`] if `id` is not parked (never parked,
    ///   already resumed, or timed out).
    /// - [`ResumeError::Chain`] for the errors of
    ///   [`Continuation::resume`].
    /// - [`ResumeError::Join`] if the resumed chain panicked.
    pub async fn resume(&self, id: Uuid) -> Result<ChainOutcome, ResumeError> {
        let continuation = self.take(&id).ok_or(ResumeError::Unknown(id))?;
        let bus = self.bus.upgrade();
        debug!(%id, "resuming continuation");
        let outcome = tokio::task::spawn_blocking(move || {
            let _bus = bus.as_ref().map(BusScope::enter);
            continuation.resume()
        })
        .await??;
        Ok(outcome)
    }

    #[must_use]
    pub fn contains(&self, id: &Uuid) -> bool {
        self.parked.contains_key(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.parked.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.parked.is_empty()
    }
}

impl std::fmt::Debug for ContinuationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContinuationRegistry")
            .field("parked", &self.parked.len())
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}
