use std::{
    fmt::{self, Debug, Formatter},
    future::Future,
    mem,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::{Duration, Instant},
};

use futures::FutureExt;
use futures_timer::Delay;
use parking_lot::Mutex;

use crate::{
    error::Error,
    wakerset::{Token as WakerToken, WakerSet},
};

/// The terminal state of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion<T> {
    /// The request was answered with a (possibly post-processed) result.
    Fulfilled(T),
    /// The request failed; see [`Error`] for the possible causes.
    Errored(Error),
    /// The request's timeout elapsed first. Carries the request's timeout
    /// value, if it had one.
    Expired(Option<T>),
}

impl<T> Completion<T> {
    pub fn is_fulfilled(&self) -> bool {
        matches!(self, Completion::Fulfilled(..))
    }

    pub fn is_expired(&self) -> bool {
        matches!(self, Completion::Expired(..))
    }

    /// The value a transport would answer with: the result when fulfilled,
    /// the timeout value when expired, nothing on error.
    pub fn into_value(self) -> Option<T> {
        match self {
            Completion::Fulfilled(value) => Some(value),
            Completion::Expired(value) => value,
            Completion::Errored(..) => None,
        }
    }
}

enum CellState<T> {
    Pending(WakerSet),
    Resolved(Completion<T>),
}

struct CellInner<T> {
    state: Mutex<CellState<T>>,
    deadline: Option<Instant>,
    timeout_value: Option<T>,
}

/// A single-assignment cell holding the outcome of one request.
///
/// The first call to [`fulfill`], [`fail`] or [`expire`] wins; every later
/// call returns `false` and changes nothing. Once the cell's deadline has
/// passed, the cell counts as expired on its next observation even if no
/// timer fired, so a late result can never overwrite a timeout.
///
/// [`fulfill`]: CompletionCell::fulfill
/// [`fail`]: CompletionCell::fail
/// [`expire`]: CompletionCell::expire
pub struct CompletionCell<T> {
    inner: Arc<CellInner<T>>,
}

impl<T> Clone for CompletionCell<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Debug> Debug for CompletionCell<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        let mut debug = f.debug_struct("CompletionCell");
        match *state {
            CellState::Pending(ref wakers) => debug.field("waiters", &wakers.len()),
            CellState::Resolved(ref outcome) => debug.field("outcome", outcome),
        };
        debug.field("deadline", &self.inner.deadline).finish()
    }
}

impl<T: Clone> CompletionCell<T> {
    pub(crate) fn new(timeout: Duration, timeout_value: Option<T>) -> Self {
        Self {
            inner: Arc::new(CellInner {
                state: Mutex::new(CellState::Pending(WakerSet::default())),
                deadline: Instant::now().checked_add(timeout),
                timeout_value,
            }),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    fn deadline_passed(&self, now: Instant) -> bool {
        self.inner.deadline.map_or(false, |deadline| now >= deadline)
    }

    /// Resolve the cell. Returns true if `outcome` is the value the cell now
    /// holds.
    fn resolve(&self, outcome: Completion<T>) -> bool {
        let mut guard = self.inner.state.lock();

        let wakers = match *guard {
            CellState::Resolved(..) => return false,
            CellState::Pending(ref mut wakers) => mem::take(wakers),
        };

        let accepted = outcome.is_expired() || !self.deadline_passed(Instant::now());
        *guard = if accepted {
            CellState::Resolved(outcome)
        } else {
            CellState::Resolved(Completion::Expired(self.inner.timeout_value.clone()))
        };

        drop(guard);
        wakers.wake_all();
        accepted
    }

    pub fn fulfill(&self, value: T) -> bool {
        self.resolve(Completion::Fulfilled(value))
    }

    pub fn fail(&self, error: Error) -> bool {
        self.resolve(Completion::Errored(error))
    }

    pub fn expire(&self) -> bool {
        self.resolve(Completion::Expired(self.inner.timeout_value.clone()))
    }

    /// Check whether the cell holds an outcome, expiring it first if its
    /// deadline has passed.
    pub fn is_resolved(&self) -> bool {
        if let CellState::Resolved(..) = *self.inner.state.lock() {
            return true;
        }

        if self.deadline_passed(Instant::now()) {
            self.expire();
            return true;
        }

        false
    }

    /// A copy of the outcome, if the cell has one.
    pub fn outcome(&self) -> Option<Completion<T>> {
        match *self.inner.state.lock() {
            CellState::Resolved(ref outcome) => Some(outcome.clone()),
            CellState::Pending(..) => None,
        }
    }

    pub(crate) fn handle(&self) -> CompletionHandle<T> {
        CompletionHandle {
            cell: self.clone(),
            waker_token: None,
            timer: None,
        }
    }
}

/// The caller's side of a registered request: a future that resolves with
/// the request's [`Completion`].
///
/// The handle owns a timer for the request's deadline, so awaiting it is
/// enough to observe a timeout; nothing else needs to be polled. Handles can
/// be cloned; every clone observes the same outcome.
pub struct CompletionHandle<T> {
    cell: CompletionCell<T>,
    waker_token: Option<WakerToken>,
    timer: Option<Delay>,
}

impl<T: Clone> CompletionHandle<T> {
    /// Check the outcome without waiting.
    pub fn try_outcome(&self) -> Option<Completion<T>> {
        self.cell.is_resolved();
        self.cell.outcome()
    }

    /// Block the current thread until the request completes or expires.
    pub fn wait(self) -> Completion<T> {
        futures::executor::block_on(self)
    }
}

impl<T: Clone> Clone for CompletionHandle<T> {
    fn clone(&self) -> Self {
        self.cell.handle()
    }
}

impl<T: Debug> Debug for CompletionHandle<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionHandle")
            .field("cell", &self.cell)
            .finish()
    }
}

impl<T: Clone> Future for CompletionHandle<T> {
    type Output = Completion<T>;

    fn poll(self: Pin<&mut Self>, ctx: &mut Context<'_>) -> Poll<Self::Output> {
        let unpinned = Pin::into_inner(self);

        {
            let mut guard = unpinned.cell.inner.state.lock();
            match *guard {
                CellState::Resolved(ref outcome) => return Poll::Ready(outcome.clone()),
                CellState::Pending(ref mut wakers) => match unpinned.waker_token.as_ref() {
                    Some(token) => wakers.replace_waker(token, ctx.waker()),
                    None => unpinned.waker_token = Some(wakers.add_waker(ctx.waker().clone())),
                },
            }
        }

        // The lock is released before touching the timer; if the cell is
        // resolved in between, the waker registered above gets the wakeup.
        let deadline = match unpinned.cell.deadline() {
            Some(deadline) => deadline,
            None => return Poll::Pending,
        };

        let timer = unpinned.timer.get_or_insert_with(|| {
            Delay::new(deadline.saturating_duration_since(Instant::now()))
        });

        match timer.poll_unpin(ctx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(()) => {
                unpinned.cell.expire();
                match unpinned.cell.outcome() {
                    Some(outcome) => Poll::Ready(outcome),
                    None => Poll::Pending,
                }
            }
        }
    }
}

impl<T> Drop for CompletionHandle<T> {
    fn drop(&mut self) {
        if let Some(token) = self.waker_token.take() {
            if let CellState::Pending(ref mut wakers) = *self.cell.inner.state.lock() {
                wakers.discard_waker(token);
            }
        }
    }
}
