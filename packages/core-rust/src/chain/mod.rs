//! The phase interceptor chain.
//!
//! A chain holds interceptors sorted by phase (registry order) and, within a
//! phase, by their `before`/`after` constraints. It executes them one at a
//! time against a [`Message`], tracking a cursor that points at the next
//! interceptor to run.
//!
//! ```text
//!            pause()            resume()
//! EXECUTING ─────────▶ PAUSED ───────────▶ EXECUTING
//!     │   suspend()              resume()
//!     ├──────────────▶ SUSPENDED ────────▶ EXECUTING (re-enters the suspender)
//!     │   abort() / processing fault
//!     ├──────────────▶ ABORTED
//!     │   cursor exhausted
//!     └──────────────▶ COMPLETE
//! ```
//!
//! The chain's lock is never held while an interceptor runs, so interceptors
//! may freely call back into the chain (add, remove, pause, suspend, or even
//! re-enter [`PhaseInterceptorChain::do_intercept`]).

pub mod cache;
mod sort;

use std::cell::RefCell;
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, info, trace, warn};

use crate::error::ChainError;
use crate::fault::{FaultListener, FaultMode, SuspendedInvocation};
use crate::interceptor::SharedInterceptor;
use crate::message::{keys, Exchange, Message};
use crate::observer::MessageObserver;
use crate::phase::PhaseSet;

use self::sort::{order_phase, SortKey};

// ---------------------------------------------------------------------------
// State and outcome
// ---------------------------------------------------------------------------

/// Execution state of a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChainState {
    Paused,
    Suspended,
    Executing,
    Complete,
    Aborted,
}

impl fmt::Display for ChainState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Paused => "PAUSED",
            Self::Suspended => "SUSPENDED",
            Self::Executing => "EXECUTING",
            Self::Complete => "COMPLETE",
            Self::Aborted => "ABORTED",
        };
        f.write_str(name)
    }
}

/// How a call to one of the `do_intercept*` methods ended.
#[derive(Debug, Clone)]
pub enum ChainOutcome {
    /// Every interceptor ran.
    Completed,
    /// An interceptor paused the chain; the continuation carries on with the
    /// interceptor after it.
    Paused(Continuation),
    /// An interceptor suspended the chain; the continuation re-enters it.
    Suspended(Continuation),
    /// The chain was aborted without a fault.
    Aborted,
    /// A processing fault occurred and was handed to the fault observer (or,
    /// for one-way exchanges, logged and left on the message).
    Faulted,
}

impl ChainOutcome {
    #[must_use]
    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Completed)
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        matches!(self, Self::Paused(_))
    }

    #[must_use]
    pub fn is_suspended(&self) -> bool {
        matches!(self, Self::Suspended(_))
    }

    /// The resume handle of a paused or suspended chain.
    #[must_use]
    pub fn continuation(self) -> Option<Continuation> {
        match self {
            Self::Paused(continuation) | Self::Suspended(continuation) => Some(continuation),
            _ => None,
        }
    }
}

/// Resume handle for a paused or suspended chain. Owns the chain, so the
/// chain and its exchange stay alive after the dispatching caller returns.
/// Clonable and `Send`, so a transport can resume on another thread.
#[derive(Clone)]
pub struct Continuation {
    chain: Arc<PhaseInterceptorChain>,
}

impl Continuation {
    /// Continues the chain: after the interceptor that paused it, or at the
    /// interceptor that suspended it.
    ///
    /// # Errors
    ///
    /// See [`PhaseInterceptorChain::resume`].
    pub fn resume(&self) -> Result<ChainOutcome, ChainError> {
        self.chain.resume()
    }

    /// Abandons the parked exchange.
    pub fn abort(&self) {
        self.chain.abort();
    }

    #[must_use]
    pub fn chain(&self) -> &Arc<PhaseInterceptorChain> {
        &self.chain
    }

    /// The message that will be resumed.
    #[must_use]
    pub fn message(&self) -> Option<Message> {
        self.chain.parked_message()
    }

    /// True while the chain is still waiting to be resumed.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        matches!(
            self.chain.state(),
            ChainState::Paused | ChainState::Suspended
        )
    }
}

impl fmt::Debug for Continuation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Continuation")
            .field("state", &self.chain.state())
            .field("position", &self.chain.position())
            .finish()
    }
}

/// What to do with an interceptor whose phase the registry does not know.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnknownPhasePolicy {
    /// Fail the whole add with [`ChainError::UnknownPhase`].
    #[default]
    Reject,
    /// Log a warning and leave the interceptor out.
    Skip,
}

/// A `before`/`after` reference that does not resolve to a peer in the same
/// phase of the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnresolvedConstraint {
    pub interceptor: String,
    pub phase: String,
    pub target: String,
    pub before: bool,
}

impl fmt::Display for UnresolvedConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let relation = if self.before { "before" } else { "after" };
        write!(
            f,
            "{} ({}) {} {}",
            self.interceptor, self.phase, relation, self.target
        )
    }
}

// ---------------------------------------------------------------------------
// Current message
// ---------------------------------------------------------------------------

thread_local! {
    static CURRENT_MESSAGE: RefCell<Option<Message>> = const { RefCell::new(None) };
}

/// The message being processed by the innermost chain executing on this
/// thread.
#[must_use]
pub fn current_message() -> Option<Message> {
    CURRENT_MESSAGE.with(|current| current.borrow().clone())
}

/// Installs a message as current and restores the previous one on drop.
struct CurrentMessageGuard {
    previous: Option<Message>,
}

impl CurrentMessageGuard {
    fn enter(message: &Message) -> Self {
        let previous = CURRENT_MESSAGE.with(|current| current.replace(Some(message.clone())));
        Self { previous }
    }
}

impl Drop for CurrentMessageGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT_MESSAGE.with(|current| {
            *current.borrow_mut() = previous;
        });
    }
}

// ---------------------------------------------------------------------------
// PhaseInterceptorChain
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct Entry {
    interceptor: SharedInterceptor,
    phase: usize,
    seq: u64,
    ran: bool,
}

/// Message (and the exchange keeping it alive) stored by pause/suspend.
struct Parked {
    message: Message,
    _exchange: Option<Exchange>,
}

struct ChainInner {
    entries: Vec<Entry>,
    /// Index of the next interceptor to run.
    cursor: usize,
    state: ChainState,
    next_seq: u64,
    fault_observer: Option<Arc<dyn MessageObserver>>,
    faulted: bool,
    suspend_pending: bool,
    parked: Option<Parked>,
}

impl ChainInner {
    fn new(entries: Vec<Entry>, next_seq: u64) -> Self {
        Self {
            entries,
            cursor: 0,
            state: ChainState::Executing,
            next_seq,
            fault_observer: None,
            faulted: false,
            suspend_pending: false,
            parked: None,
        }
    }

    /// Bounds of the contiguous run of entries in `phase`.
    fn phase_bounds(&self, phase: usize) -> (usize, usize) {
        let start = self.entries.partition_point(|entry| entry.phase < phase);
        let end = self.entries.partition_point(|entry| entry.phase <= phase);
        (start, end)
    }

    /// Re-sorts the not-yet-executed part of one phase. Returns the number of
    /// constraint cycles that had to be broken.
    fn sort_remaining(&mut self, phase: usize) -> usize {
        let (start, end) = self.phase_bounds(phase);
        let low = start.max(self.cursor);
        if end <= low + 1 {
            return 0;
        }

        let segment: Vec<Entry> = self.entries.drain(low..end).collect();
        let result = {
            let keys: Vec<SortKey<'_>> = segment
                .iter()
                .map(|entry| SortKey {
                    id: entry.interceptor.id(),
                    before: entry.interceptor.before(),
                    after: entry.interceptor.after(),
                    seq: entry.seq,
                })
                .collect();
            order_phase(&keys)
        };

        let mut slots: Vec<Option<Entry>> = segment.into_iter().map(Some).collect();
        let sorted: Vec<Entry> = result
            .order
            .iter()
            .filter_map(|&position| slots[position].take())
            .collect();
        self.entries.splice(low..low, sorted);
        result.cycle_breaks
    }

    fn park(&mut self, message: &Message) {
        self.parked = Some(Parked {
            message: message.clone(),
            _exchange: message.exchange(),
        });
    }
}

/// Single-direction, single-pass executor over a sorted interceptor sequence.
///
/// Always handled through `Arc<PhaseInterceptorChain>`: the message being
/// processed refers back to its chain, and suspended chains are resumed
/// through a [`Continuation`] that owns a reference.
pub struct PhaseInterceptorChain {
    phases: PhaseSet,
    inner: Mutex<ChainInner>,
}

impl PhaseInterceptorChain {
    /// An empty chain over the given phase registry.
    #[must_use]
    pub fn new(phases: PhaseSet) -> Arc<Self> {
        Arc::new(Self {
            phases,
            inner: Mutex::new(ChainInner::new(Vec::new(), 0)),
        })
    }

    /// Builds a chain from interceptors in precedence order, sorting each
    /// phase once.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError::UnknownPhase`] under
    /// [`UnknownPhasePolicy::Reject`] if any interceptor declares a phase
    /// missing from `phases`.
    pub fn build<I>(
        phases: &PhaseSet,
        interceptors: I,
        policy: UnknownPhasePolicy,
    ) -> Result<Arc<Self>, ChainError>
    where
        I: IntoIterator<Item = SharedInterceptor>,
    {
        let chain = Self::new(phases.clone());
        chain.add_batch(interceptors, false, policy)?;

        for unresolved in chain.unresolved_constraints() {
            debug!(constraint = %unresolved, "ordering constraint does not resolve in this chain");
        }
        debug!(interceptors = chain.len(), "assembled interceptor chain");
        Ok(chain)
    }

    /// A new chain with the same sorted sequence, reset to its initial state
    /// and without a fault observer.
    #[must_use]
    pub fn fresh_copy(&self) -> Arc<Self> {
        let inner = self.inner.lock();
        let entries = inner
            .entries
            .iter()
            .map(|entry| Entry {
                ran: false,
                ..entry.clone()
            })
            .collect();
        Arc::new(Self {
            phases: self.phases.clone(),
            inner: Mutex::new(ChainInner::new(entries, inner.next_seq)),
        })
    }

    #[must_use]
    pub fn phases(&self) -> &PhaseSet {
        &self.phases
    }

    // -- modification -------------------------------------------------------

    /// Adds an interceptor (and its additional interceptors) unless one with
    /// the same id already sits in its phase.
    ///
    /// During execution the interceptor is merged into the not-yet-executed
    /// part of its phase. If its phase has already been passed it is recorded
    /// but never runs.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError::UnknownPhase`] and leaves the chain unchanged if
    /// any of the interceptors declares a phase the registry does not know.
    pub fn add(&self, interceptor: SharedInterceptor) -> Result<(), ChainError> {
        self.add_batch([interceptor], false, UnknownPhasePolicy::Reject)
    }

    /// Like [`add`](Self::add) but inserts even if the id is already present.
    ///
    /// # Errors
    ///
    /// Same as [`add`](Self::add).
    pub fn add_forced(&self, interceptor: SharedInterceptor) -> Result<(), ChainError> {
        self.add_batch([interceptor], true, UnknownPhasePolicy::Reject)
    }

    /// Adds several interceptors at once.
    ///
    /// # Errors
    ///
    /// Same as [`add`](Self::add); nothing is added on error.
    pub fn add_all<I>(&self, interceptors: I) -> Result<(), ChainError>
    where
        I: IntoIterator<Item = SharedInterceptor>,
    {
        self.add_batch(interceptors, false, UnknownPhasePolicy::Reject)
    }

    /// [`add_all`](Self::add_all) with an explicit unknown-phase policy.
    ///
    /// # Errors
    ///
    /// [`ChainError::UnknownPhase`] under [`UnknownPhasePolicy::Reject`].
    pub fn add_all_with<I>(&self, interceptors: I, policy: UnknownPhasePolicy) -> Result<(), ChainError>
    where
        I: IntoIterator<Item = SharedInterceptor>,
    {
        self.add_batch(interceptors, false, policy)
    }

    fn add_batch<I>(&self, interceptors: I, force: bool, policy: UnknownPhasePolicy) -> Result<(), ChainError>
    where
        I: IntoIterator<Item = SharedInterceptor>,
    {
        // Expand additional interceptors and resolve phases before locking:
        // both call into interceptor code.
        let mut resolved: Vec<(SharedInterceptor, usize)> = Vec::new();
        for interceptor in interceptors {
            let mut expanded = Vec::new();
            expand_additional(&interceptor, &mut expanded, &mut HashSet::new());
            for candidate in expanded {
                match self.phases.index_of(candidate.phase()) {
                    Some(phase) => resolved.push((candidate, phase)),
                    None => match policy {
                        UnknownPhasePolicy::Reject => {
                            return Err(ChainError::UnknownPhase {
                                id: candidate.id().to_string(),
                                phase: candidate.phase().to_string(),
                            });
                        }
                        UnknownPhasePolicy::Skip => {
                            warn!(
                                interceptor = candidate.id(),
                                phase = candidate.phase(),
                                "skipping interceptor with unknown phase"
                            );
                        }
                    },
                }
            }
        }

        let mut inner = self.inner.lock();
        let mut touched = BTreeSet::new();
        for (interceptor, phase) in resolved {
            let (start, end) = inner.phase_bounds(phase);
            if !force
                && inner.entries[start..end]
                    .iter()
                    .any(|entry| entry.interceptor.id() == interceptor.id())
            {
                trace!(interceptor = interceptor.id(), "interceptor already in chain");
                continue;
            }

            let seq = inner.next_seq;
            inner.next_seq += 1;
            let passed = end < inner.cursor;
            if passed {
                debug!(
                    interceptor = interceptor.id(),
                    phase = interceptor.phase(),
                    "phase already passed; interceptor will not run"
                );
            }
            inner.entries.insert(
                end,
                Entry {
                    interceptor,
                    phase,
                    seq,
                    ran: false,
                },
            );
            if passed {
                inner.cursor += 1;
            } else {
                touched.insert(phase);
            }
        }

        for phase in touched {
            let cycle_breaks = inner.sort_remaining(phase);
            if cycle_breaks > 0 {
                warn!(
                    phase = %self.phases.as_slice()[phase].name,
                    cycle_breaks,
                    "before/after constraints form a cycle; falling back to insertion order"
                );
            }
        }
        Ok(())
    }

    /// Removes this exact interceptor from the not-yet-executed part of the
    /// chain.
    pub fn remove(&self, interceptor: &SharedInterceptor) -> bool {
        self.remove_where(|entry| Arc::ptr_eq(&entry.interceptor, interceptor))
    }

    /// Removes the first not-yet-executed interceptor with this id.
    pub fn remove_by_id(&self, id: &str) -> bool {
        self.remove_where(|entry| entry.interceptor.id() == id)
    }

    fn remove_where(&self, predicate: impl Fn(&Entry) -> bool) -> bool {
        let mut inner = self.inner.lock();
        let cursor = inner.cursor;
        match inner.entries[cursor..].iter().position(predicate) {
            Some(offset) => {
                inner.entries.remove(cursor + offset);
                true
            }
            None => false,
        }
    }

    // -- execution ----------------------------------------------------------

    /// Runs the chain from its cursor until it completes, pauses, suspends,
    /// aborts, or faults.
    ///
    /// # Errors
    ///
    /// - [`ChainError::Unhandled`] if an interceptor fails and no fault
    ///   observer is set.
    /// - [`ChainError::DoubleFault`] if the fault observer itself fails.
    pub fn do_intercept(self: &Arc<Self>, message: &Message) -> Result<ChainOutcome, ChainError> {
        let _current = CurrentMessageGuard::enter(message);
        message.set_interceptor_chain(Some(self));

        loop {
            let interceptor = {
                let mut inner = self.inner.lock();
                if inner.state != ChainState::Executing {
                    break;
                }
                let cursor = inner.cursor;
                let Some(entry) = inner.entries.get_mut(cursor) else {
                    break;
                };
                entry.ran = true;
                let interceptor = Arc::clone(&entry.interceptor);
                inner.cursor += 1;
                interceptor
            };

            trace!(
                interceptor = interceptor.id(),
                phase = interceptor.phase(),
                "invoking interceptor"
            );
            match interceptor.handle_message(message) {
                Ok(()) => self.settle_suspension(false),
                Err(err) if SuspendedInvocation::is_signal(&err) => self.settle_suspension(true),
                Err(err) => return self.handle_processing_fault(message, &interceptor, err),
            }
        }

        Ok(self.finish(message))
    }

    /// Positions the cursor at the interceptor with `id` and runs from there.
    ///
    /// # Errors
    ///
    /// [`ChainError::InterceptorNotFound`] if no interceptor has this id, and
    /// the errors of [`do_intercept`](Self::do_intercept).
    pub fn do_intercept_starting_at(
        self: &Arc<Self>,
        message: &Message,
        id: &str,
    ) -> Result<ChainOutcome, ChainError> {
        self.seek_to(id, 0)?;
        self.do_intercept(message)
    }

    /// Positions the cursor just after the interceptor with `id` and runs from
    /// there.
    ///
    /// # Errors
    ///
    /// Same as [`do_intercept_starting_at`](Self::do_intercept_starting_at).
    pub fn do_intercept_starting_after(
        self: &Arc<Self>,
        message: &Message,
        id: &str,
    ) -> Result<ChainOutcome, ChainError> {
        self.seek_to(id, 1)?;
        self.do_intercept(message)
    }

    fn seek_to(&self, id: &str, offset: usize) -> Result<(), ChainError> {
        let mut inner = self.inner.lock();
        let position = inner
            .entries
            .iter()
            .position(|entry| entry.interceptor.id() == id)
            .ok_or_else(|| ChainError::InterceptorNotFound { id: id.to_string() })?;
        inner.cursor = position + offset;
        if matches!(inner.state, ChainState::Paused | ChainState::Suspended) {
            inner.state = ChainState::Executing;
            inner.suspend_pending = false;
            inner.parked = None;
        }
        Ok(())
    }

    /// Applies a suspension requested during the interceptor that just
    /// returned: rewinds so that interceptor runs again on resume.
    fn settle_suspension(&self, signalled: bool) {
        let mut inner = self.inner.lock();
        if !(inner.suspend_pending || signalled) || inner.state == ChainState::Aborted {
            inner.suspend_pending = false;
            return;
        }
        inner.suspend_pending = false;
        inner.cursor = inner.cursor.saturating_sub(1);
        inner.state = ChainState::Suspended;
    }

    fn finish(self: &Arc<Self>, message: &Message) -> ChainOutcome {
        let mut inner = self.inner.lock();
        match inner.state {
            ChainState::Executing => {
                inner.state = ChainState::Complete;
                inner.parked = None;
                ChainOutcome::Completed
            }
            ChainState::Complete => ChainOutcome::Completed,
            ChainState::Paused => {
                inner.park(message);
                debug!(position = inner.cursor, "chain paused");
                ChainOutcome::Paused(Continuation {
                    chain: Arc::clone(self),
                })
            }
            ChainState::Suspended => {
                inner.park(message);
                debug!(position = inner.cursor, "chain suspended");
                ChainOutcome::Suspended(Continuation {
                    chain: Arc::clone(self),
                })
            }
            ChainState::Aborted => {
                inner.parked = None;
                if inner.faulted {
                    ChainOutcome::Faulted
                } else {
                    ChainOutcome::Aborted
                }
            }
        }
    }

    fn handle_processing_fault(
        &self,
        message: &Message,
        failed: &SharedInterceptor,
        err: anyhow::Error,
    ) -> Result<ChainOutcome, ChainError> {
        let unwind: Vec<SharedInterceptor> = {
            let mut inner = self.inner.lock();
            if inner.faulted {
                // A re-entrant run already handled this fault; pass its
                // result through without unwinding twice.
                drop(inner);
                return Err(match err.downcast::<ChainError>() {
                    Ok(chain_error) => chain_error,
                    Err(other) => ChainError::Unhandled(Arc::new(other)),
                });
            }
            inner.faulted = true;
            inner.state = ChainState::Aborted;
            inner.suspend_pending = false;
            inner.parked = None;
            let failing = inner.cursor.saturating_sub(1);
            inner.entries[..failing]
                .iter()
                .rev()
                .filter(|entry| entry.ran)
                .map(|entry| Arc::clone(&entry.interceptor))
                .collect()
        };

        let err = Arc::new(err);
        message.set_exception(Some(Arc::clone(&err)));
        let exchange = message.exchange();
        if let Some(exchange) = &exchange {
            exchange.set_exception(Some(Arc::clone(&err)));
        }

        log_fault(message, failed, &err);

        for interceptor in &unwind {
            trace!(interceptor = interceptor.id(), "unwinding interceptor");
            interceptor.handle_fault(message);
        }

        let one_way = exchange.as_ref().is_some_and(Exchange::is_one_way)
            && !message.contextual_flag(keys::ROBUST_ONE_WAY);
        if one_way {
            debug!("one-way exchange; fault observer not invoked");
            return Ok(ChainOutcome::Faulted);
        }

        let observer = self.inner.lock().fault_observer.clone();
        let Some(observer) = observer else {
            return Err(ChainError::Unhandled(err));
        };

        match observer.on_message(message) {
            Ok(()) => Ok(ChainOutcome::Faulted),
            Err(secondary) => Err(match secondary.downcast::<ChainError>() {
                Ok(double @ ChainError::DoubleFault(_)) => double,
                Ok(other) => {
                    error!(error = %other, "fault observer failed");
                    ChainError::DoubleFault(Arc::new(anyhow::Error::new(other)))
                }
                Err(secondary) => {
                    error!(error = %secondary, "fault observer failed");
                    ChainError::DoubleFault(Arc::new(secondary))
                }
            }),
        }
    }

    // -- state control ------------------------------------------------------

    /// Stops the chain after the current interceptor returns. The chain keeps
    /// its position; [`resume`](Self::resume) continues with the next
    /// interceptor.
    pub fn pause(&self) {
        let mut inner = self.inner.lock();
        if inner.state == ChainState::Executing {
            inner.state = ChainState::Paused;
        }
    }

    /// Cancels a pause or suspension requested earlier in the same
    /// interceptor call.
    pub fn unpause(&self) {
        let mut inner = self.inner.lock();
        if matches!(inner.state, ChainState::Paused | ChainState::Suspended) {
            inner.state = ChainState::Executing;
            inner.suspend_pending = false;
            inner.parked = None;
        }
    }

    /// Stops the chain after the current interceptor returns and arranges for
    /// that interceptor to run again on resume. The interceptor must be
    /// idempotent or track its own progress.
    pub fn suspend(&self) {
        let mut inner = self.inner.lock();
        if inner.state == ChainState::Executing {
            inner.state = ChainState::Suspended;
            inner.suspend_pending = true;
        }
    }

    /// Continues a paused or suspended chain with its stored message. May be
    /// called from any thread.
    ///
    /// # Errors
    ///
    /// [`ChainError::NotResumable`] if the chain is neither paused nor
    /// suspended, and the errors of [`do_intercept`](Self::do_intercept).
    pub fn resume(self: &Arc<Self>) -> Result<ChainOutcome, ChainError> {
        let parked = {
            let mut inner = self.inner.lock();
            if !matches!(inner.state, ChainState::Paused | ChainState::Suspended) {
                return Err(ChainError::NotResumable { state: inner.state });
            }
            let Some(parked) = inner.parked.take() else {
                return Err(ChainError::NotResumable { state: inner.state });
            };
            inner.state = ChainState::Executing;
            inner.suspend_pending = false;
            parked
        };
        debug!(position = self.position(), "resuming chain");
        self.do_intercept(&parked.message)
    }

    /// Stops the chain without running fault handling.
    pub fn abort(&self) {
        let mut inner = self.inner.lock();
        inner.state = ChainState::Aborted;
        inner.suspend_pending = false;
        inner.parked = None;
    }

    /// Returns the chain to its initial position and state so the same sorted
    /// sequence can run another message.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.cursor = 0;
        inner.state = ChainState::Executing;
        inner.faulted = false;
        inner.suspend_pending = false;
        inner.parked = None;
        for entry in &mut inner.entries {
            entry.ran = false;
        }
    }

    #[must_use]
    pub fn state(&self) -> ChainState {
        self.inner.lock().state
    }

    pub fn set_fault_observer(&self, observer: Option<Arc<dyn MessageObserver>>) {
        self.inner.lock().fault_observer = observer;
    }

    #[must_use]
    pub fn fault_observer(&self) -> Option<Arc<dyn MessageObserver>> {
        self.inner.lock().fault_observer.clone()
    }

    /// The message stored by the last pause or suspension.
    #[must_use]
    pub fn parked_message(&self) -> Option<Message> {
        self.inner
            .lock()
            .parked
            .as_ref()
            .map(|parked| parked.message.clone())
    }

    // -- introspection ------------------------------------------------------

    /// Index of the next interceptor to run.
    #[must_use]
    pub fn position(&self) -> usize {
        self.inner.lock().cursor
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// The sorted sequence. Does not touch the cursor.
    #[must_use]
    pub fn snapshot(&self) -> Vec<SharedInterceptor> {
        self.inner
            .lock()
            .entries
            .iter()
            .map(|entry| Arc::clone(&entry.interceptor))
            .collect()
    }

    pub fn iter(&self) -> std::vec::IntoIter<SharedInterceptor> {
        self.snapshot().into_iter()
    }

    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        self.inner
            .lock()
            .entries
            .iter()
            .map(|entry| entry.interceptor.id().to_string())
            .collect()
    }

    /// Direct cursor control for extension code.
    #[must_use]
    pub fn cursor(&self) -> ChainCursor<'_> {
        ChainCursor { chain: self }
    }

    /// Every `before`/`after` reference that names no interceptor in the same
    /// phase of this chain.
    #[must_use]
    pub fn unresolved_constraints(&self) -> Vec<UnresolvedConstraint> {
        let inner = self.inner.lock();
        let mut unresolved = Vec::new();
        for entry in &inner.entries {
            let (start, end) = inner.phase_bounds(entry.phase);
            let peers = &inner.entries[start..end];
            let resolves = |target: &str| peers.iter().any(|peer| peer.interceptor.id() == target);
            let interceptor = &entry.interceptor;
            for (targets, before) in [(interceptor.before(), true), (interceptor.after(), false)] {
                for target in targets.iter().filter(|target| !resolves(target.as_str())) {
                    unresolved.push(UnresolvedConstraint {
                        interceptor: interceptor.id().to_string(),
                        phase: interceptor.phase().to_string(),
                        target: target.clone(),
                        before,
                    });
                }
            }
        }
        unresolved
    }
}

impl fmt::Display for PhaseInterceptorChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        writeln!(
            f,
            "Chain ({} interceptors, {}). Current flow:",
            inner.entries.len(),
            inner.state
        )?;
        for group in inner.entries.chunk_by(|a, b| a.phase == b.phase) {
            let ids: Vec<&str> = group.iter().map(|entry| entry.interceptor.id()).collect();
            writeln!(
                f,
                "  {} [{}]",
                self.phases.as_slice()[group[0].phase].name,
                ids.join(", ")
            )?;
        }
        Ok(())
    }
}

impl fmt::Debug for PhaseInterceptorChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("PhaseInterceptorChain")
            .field("state", &inner.state)
            .field("cursor", &inner.cursor)
            .field("len", &inner.entries.len())
            .finish_non_exhaustive()
    }
}

fn expand_additional(
    interceptor: &SharedInterceptor,
    out: &mut Vec<SharedInterceptor>,
    seen: &mut HashSet<*const ()>,
) {
    if !seen.insert(Arc::as_ptr(interceptor).cast::<()>()) {
        return;
    }
    out.push(Arc::clone(interceptor));
    for extra in interceptor.additional_interceptors() {
        expand_additional(&extra, out, seen);
    }
}

fn log_fault(message: &Message, failed: &SharedInterceptor, err: &anyhow::Error) {
    let description = format!(
        "interceptor {} in phase {} failed, unwinding",
        failed.id(),
        failed.phase()
    );
    let listener = message.contextual::<Arc<dyn FaultListener>>(keys::FAULT_LISTENER);
    let log_default = match listener {
        Some(listener) => listener.fault_occurred(err, &description, message),
        None => true,
    };
    if !log_default {
        return;
    }
    match message.fault_mode() {
        Some(FaultMode::CheckedApplicationFault) => {
            debug!(interceptor = failed.id(), error = %err, "{description}");
        }
        Some(FaultMode::UncheckedApplicationFault) => {
            info!(interceptor = failed.id(), error = %err, "{description}");
        }
        _ => warn!(interceptor = failed.id(), error = %err, "{description}"),
    }
}

// ---------------------------------------------------------------------------
// ChainCursor
// ---------------------------------------------------------------------------

/// Explicit access to a chain's cursor.
///
/// Each call takes the chain lock briefly; do not hold a cursor across an
/// interceptor invocation and expect it to stay in sync with execution.
pub struct ChainCursor<'a> {
    chain: &'a PhaseInterceptorChain,
}

impl ChainCursor<'_> {
    #[must_use]
    pub fn position(&self) -> usize {
        self.chain.position()
    }

    /// Moves the cursor, clamped to the end of the chain.
    pub fn seek(&self, position: usize) {
        let mut inner = self.chain.inner.lock();
        inner.cursor = position.min(inner.entries.len());
    }

    /// The interceptor the cursor points at.
    #[must_use]
    pub fn peek(&self) -> Option<SharedInterceptor> {
        let inner = self.chain.inner.lock();
        inner
            .entries
            .get(inner.cursor)
            .map(|entry| Arc::clone(&entry.interceptor))
    }

    /// Returns the interceptor at the cursor and moves past it.
    pub fn advance(&self) -> Option<SharedInterceptor> {
        let mut inner = self.chain.inner.lock();
        let interceptor = inner
            .entries
            .get(inner.cursor)
            .map(|entry| Arc::clone(&entry.interceptor))?;
        inner.cursor += 1;
        Some(interceptor)
    }

    /// Moves back one position and returns the interceptor there.
    pub fn rewind(&self) -> Option<SharedInterceptor> {
        let mut inner = self.chain.inner.lock();
        let position = inner.cursor.checked_sub(1)?;
        inner.cursor = position;
        inner
            .entries
            .get(position)
            .map(|entry| Arc::clone(&entry.interceptor))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
