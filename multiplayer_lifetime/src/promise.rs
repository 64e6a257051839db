// Single-settlement promises.
//
// A `Deferred` is held by whoever produces a result; the matching `Promise`
// handles are handed to whoever waits for it. A deferred settles exactly once,
// either resolved with a value or rejected with an error. Settling again is a
// `ProtocolViolation` and leaves the original outcome untouched.
//
// Consumers can:
// - register continuations with `on_complete` (run immediately when already
//   settled, otherwise on the settling thread, in registration order),
// - block a thread with `wait` / `wait_timeout`,
// - or `.await` the promise, which parks the task instead of a thread.
//
// Outcomes are cloned out to every consumer, so `T` and `E` are `Clone`.
// Payloads in this workspace are small (unit, `Arc` handles, error enums).

use std::convert::Infallible;
use std::fmt;
use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use crate::error::ProtocolViolation;
use crate::sync::lock;

type Continuation<T, E> = Box<dyn FnOnce(&Result<T, E>) + Send + 'static>;

struct State<T, E> {
    outcome: Option<Result<T, E>>,
    continuations: Vec<Continuation<T, E>>,
    wakers: Vec<Waker>,
}

struct Shared<T, E> {
    state: Mutex<State<T, E>>,
    settled: Condvar,
}

impl<T, E> Shared<T, E> {
    fn new(outcome: Option<Result<T, E>>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State {
                outcome,
                continuations: Vec::new(),
                wakers: Vec::new(),
            }),
            settled: Condvar::new(),
        })
    }
}

/// Producer half: settles the value exactly once.
pub struct Deferred<T, E = Infallible> {
    shared: Arc<Shared<T, E>>,
}

/// Consumer half: observes the value once the producer settles it.
pub struct Promise<T, E = Infallible> {
    shared: Arc<Shared<T, E>>,
}

impl<T, E> Clone for Deferred<T, E> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T, E> Clone for Promise<T, E> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T, E> Deferred<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            shared: Shared::new(None),
        }
    }

    /// A consumer handle for this deferred. May be called any number of times.
    pub fn promise(&self) -> Promise<T, E> {
        Promise {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn resolve(&self, value: T) -> Result<(), ProtocolViolation> {
        self.settle(Ok(value))
    }

    pub fn reject(&self, error: E) -> Result<(), ProtocolViolation> {
        self.settle(Err(error))
    }

    pub fn is_settled(&self) -> bool {
        lock(&self.shared.state).outcome.is_some()
    }

    /// Settle with a ready-made outcome. Waiters are released before the
    /// continuations run, and continuations run outside the lock so they may
    /// freely touch this promise again.
    pub fn settle(&self, outcome: Result<T, E>) -> Result<(), ProtocolViolation> {
        let (continuations, wakers) = {
            let mut state = lock(&self.shared.state);
            match &state.outcome {
                Some(Ok(_)) => return Err(ProtocolViolation::AlreadyResolved),
                Some(Err(_)) => return Err(ProtocolViolation::AlreadyRejected),
                None => {}
            }
            state.outcome = Some(outcome.clone());
            (
                mem::take(&mut state.continuations),
                mem::take(&mut state.wakers),
            )
        };
        self.shared.settled.notify_all();
        for waker in wakers {
            waker.wake();
        }
        for continuation in continuations {
            continuation(&outcome);
        }
        Ok(())
    }
}

impl<T, E> Default for Deferred<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> Promise<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// A promise that is already resolved with `value`.
    pub fn resolved(value: T) -> Self {
        Self {
            shared: Shared::new(Some(Ok(value))),
        }
    }

    /// A promise that is already rejected with `error`.
    pub fn rejected(error: E) -> Self {
        Self {
            shared: Shared::new(Some(Err(error))),
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(lock(&self.shared.state).outcome, Some(Ok(_)))
    }

    pub fn is_rejected(&self) -> bool {
        matches!(lock(&self.shared.state).outcome, Some(Err(_)))
    }

    pub fn is_settled(&self) -> bool {
        lock(&self.shared.state).outcome.is_some()
    }

    /// The outcome, if settled. Never blocks.
    pub fn outcome(&self) -> Option<Result<T, E>> {
        lock(&self.shared.state).outcome.clone()
    }

    /// Run `continuation` once the promise settles. Runs immediately, on the
    /// calling thread, when the promise is already settled.
    pub fn on_complete<F>(&self, continuation: F)
    where
        F: FnOnce(&Result<T, E>) + Send + 'static,
    {
        let mut state = lock(&self.shared.state);
        let Some(outcome) = state.outcome.clone() else {
            state.continuations.push(Box::new(continuation));
            return;
        };
        drop(state);
        continuation(&outcome);
    }

    /// Run `inspect` on settlement and return a promise that settles with the
    /// same outcome only after `inspect` has returned. Used to update owner
    /// state before any downstream waiter can observe the result.
    pub fn inspect<F>(&self, inspect: F) -> Promise<T, E>
    where
        F: FnOnce(&Result<T, E>) + Send + 'static,
    {
        let chained = Deferred::new();
        let promise = chained.promise();
        self.on_complete(move |outcome| {
            inspect(outcome);
            chained.settle(outcome.clone()).ok();
        });
        promise
    }

    /// Block the calling thread until the promise settles.
    pub fn wait(&self) -> Result<T, E> {
        let mut state = lock(&self.shared.state);
        loop {
            if let Some(outcome) = &state.outcome {
                return outcome.clone();
            }
            state = self
                .shared
                .settled
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Block for at most `timeout`. Returns `None` if still pending.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<T, E>> {
        let deadline = Instant::now() + timeout;
        let mut state = lock(&self.shared.state);
        loop {
            if let Some(outcome) = &state.outcome {
                return Some(outcome.clone());
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self
                .shared
                .settled
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }
    }
}

impl<T, E> Future for Promise<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    type Output = Result<T, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = lock(&self.shared.state);
        if let Some(outcome) = &state.outcome {
            return Poll::Ready(outcome.clone());
        }
        if !state.wakers.iter().any(|w| w.will_wake(cx.waker())) {
            state.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

impl<T, E> fmt::Debug for Promise<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match &lock(&self.shared.state).outcome {
            None => "pending",
            Some(Ok(_)) => "resolved",
            Some(Err(_)) => "rejected",
        };
        f.debug_struct("Promise").field("status", &status).finish()
    }
}
