//! Error escalation channel.
//!
//! When a thread hits an error only the application can decide about, it
//! starts an episode: the status moves to `Wait`, the error handler is
//! dispatched to the privileged context, and the thread blocks. Threads that
//! hit a qualifying error while the episode is open join it instead of
//! starting another. The handler's single decision is replayed to all of them;
//! once the last one has woken the channel is idle again.
//!
//! A handler that never answers leaves every waiter blocked unless an
//! escalation timeout is configured. Guessing an answer is not an option.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use super::error::{DbError, DbResult, DriverError, ErrorClass};
use super::privileged::PrivilegedHandle;
use super::slots::ValidityEpoch;

/// How long the privileged thread sleeps between queue drains while waiting.
const PRIVILEGED_POLL: Duration = Duration::from_millis(10);

/// Process-wide query status guarded by the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
    ExecuteNormal,
    Wait,
    AbortQueries,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Continue,
    Abort,
}

/// Which handler entry point an escalation goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalationKind {
    Connection,
    Consultation,
}

impl EscalationKind {
    /// Which handler callback a failure goes to once retrying is over.
    /// A lock that outlasted every retry needs a decision like any other
    /// consultation; plain statement errors never escalate.
    pub fn for_class(class: ErrorClass) -> Option<Self> {
        match class {
            ErrorClass::Connection => Some(EscalationKind::Connection),
            ErrorClass::Consultation | ErrorClass::Lock => Some(EscalationKind::Consultation),
            ErrorClass::Statement => None,
        }
    }
}

/// Implemented by the embedding application.
///
/// Both callbacks run on the privileged context and must eventually call
/// exactly one of `answer.continue_queries()` or `answer.abort_queries()`.
/// They may hand the answer on (to a dialog, say) and return early, as long as
/// whatever finishes the job runs through the privileged handle: when the
/// privileged thread itself is the one waiting, it keeps draining that queue.
pub trait ErrorHandler: Send + Sync {
    /// The connection is believed broken. Repair it (and call
    /// `answer.invalidate_connections()`) before continuing, or abort.
    fn on_connection_error(&self, answer: ErrorAnswer, error: &DriverError, statement: &str);

    /// The statement needs an explicit go-ahead.
    fn on_consultation_required(&self, answer: ErrorAnswer, error: &DriverError, statement: &str);
}

#[derive(Debug)]
struct ChannelState {
    status: QueryStatus,
    episode: u64,
    /// Threads blocked on the current episode.
    waiters: usize,
    /// Decision for the current episode, kept until every waiter has seen it.
    outcome: Option<Resolution>,
}

struct Shared {
    state: Mutex<ChannelState>,
    cond: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn resolve(&self, episode: u64, resolution: Resolution) -> bool {
        let mut state = self.lock();
        if state.episode != episode || state.status != QueryStatus::Wait {
            return false;
        }
        state.outcome = Some(resolution);
        state.status = match resolution {
            Resolution::Continue => QueryStatus::ExecuteNormal,
            Resolution::Abort => QueryStatus::AbortQueries,
        };
        if state.waiters == 0 {
            // Everyone timed out already.
            state.status = QueryStatus::ExecuteNormal;
            state.outcome = None;
        }
        self.cond.notify_all();
        true
    }
}

/// One-shot decision capability handed to the error handler.
pub struct ErrorAnswer {
    shared: Arc<Shared>,
    epoch: Arc<ValidityEpoch>,
    episode: u64,
    answered: bool,
}

impl ErrorAnswer {
    /// Mark every thread's connection stale so each reopens before its next
    /// statement. Call this after repairing a connection error.
    pub fn invalidate_connections(&self) -> u64 {
        let generation = self.epoch.advance();
        tracing::info!("Error handler invalidated connections (generation {})", generation);
        generation
    }

    pub fn episode(&self) -> u64 {
        self.episode
    }

    /// Wake every waiting thread and let it retry its statement once.
    pub fn continue_queries(mut self) {
        self.answer(Resolution::Continue);
    }

    /// Wake every waiting thread and fail its statement.
    pub fn abort_queries(mut self) {
        self.answer(Resolution::Abort);
    }

    fn answer(&mut self, resolution: Resolution) {
        self.answered = true;
        if self.shared.resolve(self.episode, resolution) {
            tracing::info!("Escalation episode {} resolved: {:?}", self.episode, resolution);
        }
    }
}

impl Drop for ErrorAnswer {
    fn drop(&mut self) {
        if self.answered {
            return;
        }
        let state = self.shared.lock();
        if state.episode == self.episode && state.status == QueryStatus::Wait {
            tracing::error!(
                "Error answer for episode {} dropped without a decision; {} querying thread(s) stay suspended",
                self.episode,
                state.waiters
            );
        }
    }
}

struct HandlerBinding {
    handler: Arc<dyn ErrorHandler>,
    privileged: PrivilegedHandle,
}

pub(crate) struct EscalationChannel {
    shared: Arc<Shared>,
    epoch: Arc<ValidityEpoch>,
    handler: Option<HandlerBinding>,
    timeout: Option<Duration>,
}

impl EscalationChannel {
    pub(crate) fn new(
        epoch: Arc<ValidityEpoch>,
        handler: Option<(Arc<dyn ErrorHandler>, PrivilegedHandle)>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(ChannelState {
                    status: QueryStatus::ExecuteNormal,
                    episode: 0,
                    waiters: 0,
                    outcome: None,
                }),
                cond: Condvar::new(),
            }),
            epoch,
            handler: handler.map(|(handler, privileged)| HandlerBinding {
                handler,
                privileged,
            }),
            timeout,
        }
    }

    pub(crate) fn has_handler(&self) -> bool {
        self.handler.is_some()
    }

    pub(crate) fn status(&self) -> QueryStatus {
        self.shared.lock().status
    }

    pub(crate) fn waiting_threads(&self) -> usize {
        self.shared.lock().waiters
    }

    pub(crate) fn episodes(&self) -> u64 {
        self.shared.lock().episode
    }

    /// Block until the handler decides about `error`, starting a new episode
    /// or joining the one in progress.
    pub(crate) fn escalate(
        &self,
        kind: EscalationKind,
        error: &DriverError,
        statement: &str,
    ) -> DbResult<Resolution> {
        let Some(binding) = &self.handler else {
            return Err(DbError::internal("escalation without an error handler"));
        };
        let deadline = self.timeout.map(|t| Instant::now() + t);
        let mut state = self.shared.lock();

        // Let a decided episode drain before starting the next one.
        loop {
            match (state.status, state.outcome) {
                (QueryStatus::AbortQueries, _) => {
                    tracing::debug!("Episode {} is aborting, failing at once", state.episode);
                    return Ok(Resolution::Abort);
                }
                (QueryStatus::ExecuteNormal, Some(_)) => {
                    state = self.wait(state, deadline)?;
                }
                _ => break,
            }
        }

        let start = state.status == QueryStatus::ExecuteNormal;
        if start {
            state.episode += 1;
            state.status = QueryStatus::Wait;
            state.outcome = None;
        }
        let episode = state.episode;
        state.waiters += 1;

        if start {
            tracing::warn!(
                "Escalating {:?} error (episode {}): {} [{}]",
                kind,
                episode,
                error,
                statement
            );
            drop(state);
            let answer = ErrorAnswer {
                shared: self.shared.clone(),
                epoch: self.epoch.clone(),
                episode,
                answered: false,
            };
            self.dispatch(binding, kind, answer, error, statement);
            state = self.shared.lock();
        } else {
            tracing::debug!("Joining escalation episode {} ({:?})", episode, kind);
        }

        while state.outcome.is_none() {
            state = match self.wait(state, deadline) {
                Ok(state) => state,
                Err(timeout) => {
                    let mut state = self.shared.lock();
                    if state.outcome.is_some() {
                        // Decided while we were re-locking; take the answer.
                        return Ok(self.leave(state));
                    }
                    state.waiters -= 1;
                    tracing::warn!("Gave up waiting for escalation episode {}", episode);
                    return Err(timeout);
                }
            };
        }

        Ok(self.leave(state))
    }

    /// Observe the decision; the last waiter out returns the channel to idle.
    fn leave(&self, mut state: MutexGuard<'_, ChannelState>) -> Resolution {
        let resolution = state.outcome.unwrap_or(Resolution::Abort);
        state.waiters -= 1;
        if state.waiters == 0 {
            state.status = QueryStatus::ExecuteNormal;
            state.outcome = None;
            self.shared.cond.notify_all();
        }
        resolution
    }

    fn wait<'a>(
        &'a self,
        state: MutexGuard<'a, ChannelState>,
        deadline: Option<Instant>,
    ) -> DbResult<MutexGuard<'a, ChannelState>> {
        if let Some(binding) = self.handler.as_ref().filter(|b| b.privileged.is_current()) {
            return self.wait_privileged(binding, state, deadline);
        }
        match deadline {
            None => Ok(self
                .shared
                .cond
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner)),
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Err(DbError::EscalationTimeout(self.timeout.unwrap_or_default()));
                }
                let (state, _) = self
                    .shared
                    .cond
                    .wait_timeout(state, remaining)
                    .unwrap_or_else(PoisonError::into_inner);
                Ok(state)
            }
        }
    }

    /// The privileged thread must not sleep on the condvar: the handler task
    /// (or the dialog it handed the answer to) is queued for this very
    /// thread. Drain that queue between short waits instead.
    fn wait_privileged<'a>(
        &'a self,
        binding: &HandlerBinding,
        state: MutexGuard<'a, ChannelState>,
        deadline: Option<Instant>,
    ) -> DbResult<MutexGuard<'a, ChannelState>> {
        drop(state);
        let ran = binding.privileged.run_pending_if_current();
        let state = self.shared.lock();
        if ran > 0 {
            return Ok(state);
        }
        let step = match deadline {
            None => PRIVILEGED_POLL,
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Err(DbError::EscalationTimeout(self.timeout.unwrap_or_default()));
                }
                remaining.min(PRIVILEGED_POLL)
            }
        };
        let (state, _) = self
            .shared
            .cond
            .wait_timeout(state, step)
            .unwrap_or_else(PoisonError::into_inner);
        Ok(state)
    }

    fn dispatch(
        &self,
        binding: &HandlerBinding,
        kind: EscalationKind,
        answer: ErrorAnswer,
        error: &DriverError,
        statement: &str,
    ) {
        if binding.privileged.is_current() {
            invoke(binding.handler.as_ref(), kind, answer, error, statement);
            return;
        }

        let handler = binding.handler.clone();
        let error = error.clone();
        let statement = statement.to_string();
        let episode = answer.episode;
        let task = Box::new(move || {
            invoke(handler.as_ref(), kind, answer, &error, &statement);
        });
        if let Err(task) = binding.privileged.try_dispatch(task) {
            tracing::error!("Privileged context is gone; aborting escalation episode {}", episode);
            self.shared.resolve(episode, Resolution::Abort);
            // Dropped only now so the unused answer sees a decided episode.
            drop(task);
        }
    }
}

fn invoke(
    handler: &dyn ErrorHandler,
    kind: EscalationKind,
    answer: ErrorAnswer,
    error: &DriverError,
    statement: &str,
) {
    match kind {
        EscalationKind::Connection => handler.on_connection_error(answer, error, statement),
        EscalationKind::Consultation => handler.on_consultation_required(answer, error, statement),
    }
}
