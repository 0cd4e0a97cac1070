//! Deferred: a single-settlement, chainable result bound to one event loop.
//!
//! State machine:
//! ```text
//! PENDING ─┬─ resolve ─→ RESOLVED(value)
//!          ├─ reject  ─→ REJECTED(failure)
//!          └─ cancel  ─→ CANCELLED
//! ```
//! Settled states are final. Continuations are queued in registration order
//! and always run from the loop's run queue, never inside the caller's stack.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

use super::EventLoop;
use crate::types::Failure;

/// Final state of a deferred.
#[derive(Debug, Clone, PartialEq)]
pub enum Settlement<T> {
    Resolved(T),
    Rejected(Failure),
    Cancelled,
}

impl<T> Settlement<T> {
    pub fn into_result(self) -> Result<T, Failure> {
        match self {
            Settlement::Resolved(value) => Ok(value),
            Settlement::Rejected(failure) => Err(failure),
            Settlement::Cancelled => Err(Failure::cancelled("deferred was cancelled")),
        }
    }

    fn state(&self) -> DeferredState {
        match self {
            Settlement::Resolved(_) => DeferredState::Resolved,
            Settlement::Rejected(_) => DeferredState::Rejected,
            Settlement::Cancelled => DeferredState::Cancelled,
        }
    }
}

/// Observable state of a deferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferredState {
    Pending,
    Resolved,
    Rejected,
    Cancelled,
}

/// What a continuation (or an actor handler) hands back.
pub enum Outcome<T> {
    Value(T),
    Error(Failure),
    /// Settle later, when this deferred settles.
    Defer(Deferred<T>),
}

impl<T> From<Result<T, Failure>> for Outcome<T> {
    fn from(result: Result<T, Failure>) -> Self {
        match result {
            Ok(value) => Outcome::Value(value),
            Err(failure) => Outcome::Error(failure),
        }
    }
}

impl<T> From<Deferred<T>> for Outcome<T> {
    fn from(deferred: Deferred<T>) -> Self {
        Outcome::Defer(deferred)
    }
}

impl<T> fmt::Debug for Outcome<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Value(_) => f.write_str("Outcome::Value(..)"),
            Outcome::Error(failure) => write!(f, "Outcome::Error({failure})"),
            Outcome::Defer(_) => f.write_str("Outcome::Defer(..)"),
        }
    }
}

type Continuation<T> = Box<dyn FnOnce(Settlement<T>)>;

struct Inner<T> {
    settlement: Option<Settlement<T>>,
    continuations: VecDeque<Continuation<T>>,
    event_loop: EventLoop,
}

/// A composable single-resolution result owned by one [`EventLoop`].
pub struct Deferred<T> {
    inner: Rc<RefCell<Inner<T>>>,
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + 'static> Deferred<T> {
    pub fn new(event_loop: &EventLoop) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                settlement: None,
                continuations: VecDeque::new(),
                event_loop: event_loop.clone(),
            })),
        }
    }

    pub fn resolved(event_loop: &EventLoop, value: T) -> Self {
        let d = Self::new(event_loop);
        d.resolve(value);
        d
    }

    pub fn rejected(event_loop: &EventLoop, failure: Failure) -> Self {
        let d = Self::new(event_loop);
        d.reject(failure);
        d
    }

    /// Run `task` as a local I/O task and settle with its result.
    pub fn from_future<F>(event_loop: &EventLoop, task: F) -> Self
    where
        F: Future<Output = Result<T, Failure>> + 'static,
    {
        let d = Self::new(event_loop);
        let target = d.clone();
        event_loop.spawn_local(async move {
            match task.await {
                Ok(value) => target.resolve(value),
                Err(failure) => target.reject(failure),
            };
        });
        d
    }

    pub fn event_loop(&self) -> EventLoop {
        self.inner.borrow().event_loop.clone()
    }

    pub fn state(&self) -> DeferredState {
        self.inner
            .borrow()
            .settlement
            .as_ref()
            .map_or(DeferredState::Pending, Settlement::state)
    }

    pub fn is_settled(&self) -> bool {
        self.inner.borrow().settlement.is_some()
    }

    pub fn settlement(&self) -> Option<Settlement<T>> {
        self.inner.borrow().settlement.clone()
    }

    /// Settle with `value`. Returns `false` (no-op) if already settled.
    pub fn resolve(&self, value: T) -> bool {
        self.settle(Settlement::Resolved(value))
    }

    /// Settle with `failure`. Returns `false` (no-op) if already settled.
    pub fn reject(&self, failure: Failure) -> bool {
        self.settle(Settlement::Rejected(failure))
    }

    /// Cancel a pending deferred. Chained deferreds are cancelled too;
    /// parents are never touched. No-op once settled.
    pub fn cancel(&self) -> bool {
        self.settle(Settlement::Cancelled)
    }

    fn settle(&self, settlement: Settlement<T>) -> bool {
        let (continuations, event_loop) = {
            let mut inner = self.inner.borrow_mut();
            if inner.settlement.is_some() {
                return false;
            }
            inner.settlement = Some(settlement.clone());
            (
                std::mem::take(&mut inner.continuations),
                inner.event_loop.clone(),
            )
        };
        for continuation in continuations {
            let settlement = settlement.clone();
            event_loop.call_soon(move || continuation(settlement));
        }
        true
    }

    /// Register a raw continuation that sees the final settlement.
    pub fn on_settled(&self, continuation: impl FnOnce(Settlement<T>) + 'static) {
        let mut inner = self.inner.borrow_mut();
        match inner.settlement.clone() {
            Some(settlement) => {
                let event_loop = inner.event_loop.clone();
                drop(inner);
                event_loop.call_soon(move || continuation(settlement));
            }
            None => inner.continuations.push_back(Box::new(continuation)),
        }
    }

    /// Register value/error continuations; returns the chained deferred.
    ///
    /// If a continuation returns [`Outcome::Defer`], the chained deferred
    /// settles when that inner deferred does.
    pub fn add_callback<U, V, E>(&self, on_value: V, on_error: E) -> Deferred<U>
    where
        U: Clone + 'static,
        V: FnOnce(T) -> Outcome<U> + 'static,
        E: FnOnce(Failure) -> Outcome<U> + 'static,
    {
        let chained = Deferred::new(&self.event_loop());
        let next = chained.clone();
        self.on_settled(move |settlement| match settlement {
            Settlement::Resolved(value) => next.follow(on_value(value)),
            Settlement::Rejected(failure) => next.follow(on_error(failure)),
            Settlement::Cancelled => {
                next.cancel();
            }
        });
        chained
    }

    /// Chain on success only; failures pass through.
    pub fn then<U, V>(&self, on_value: V) -> Deferred<U>
    where
        U: Clone + 'static,
        V: FnOnce(T) -> Outcome<U> + 'static,
    {
        self.add_callback(on_value, Outcome::Error)
    }

    /// Transform the resolved value.
    pub fn map<U, V>(&self, f: V) -> Deferred<U>
    where
        U: Clone + 'static,
        V: FnOnce(T) -> U + 'static,
    {
        self.add_callback(move |value| Outcome::Value(f(value)), Outcome::Error)
    }

    /// Recover from a failure; values pass through.
    pub fn catch<E>(&self, on_error: E) -> Deferred<T>
    where
        E: FnOnce(Failure) -> Outcome<T> + 'static,
    {
        self.add_callback(Outcome::Value, on_error)
    }

    fn follow(&self, outcome: Outcome<T>) {
        match outcome {
            Outcome::Value(value) => {
                self.resolve(value);
            }
            Outcome::Error(failure) => {
                self.reject(failure);
            }
            Outcome::Defer(inner) => {
                let target = self.clone();
                inner.on_settled(move |settlement| {
                    target.settle(settlement);
                });
            }
        }
    }
}

impl<T: Clone + 'static> IntoFuture for Deferred<T> {
    type Output = Result<T, Failure>;
    type IntoFuture = DeferredFuture<T>;

    fn into_future(self) -> Self::IntoFuture {
        let (tx, rx) = oneshot::channel();
        self.on_settled(move |settlement| {
            let _ = tx.send(settlement);
        });
        DeferredFuture { rx }
    }
}

/// Future returned by awaiting a [`Deferred`] inside a local task.
#[derive(Debug)]
pub struct DeferredFuture<T> {
    rx: oneshot::Receiver<Settlement<T>>,
}

impl<T> Future for DeferredFuture<T> {
    type Output = Result<T, Failure>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.get_mut().rx).poll(cx) {
            Poll::Ready(Ok(settlement)) => Poll::Ready(settlement.into_result()),
            Poll::Ready(Err(_)) => Poll::Ready(Err(Failure::cancelled(
                "event loop closed before settlement",
            ))),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        let state = inner
            .settlement
            .as_ref()
            .map_or(DeferredState::Pending, Settlement::state);
        f.debug_struct("Deferred")
            .field("state", &state)
            .field("continuations", &inner.continuations.len())
            .finish()
    }
}

/// Settle once every input has settled, keeping input order.
pub fn gather<T: Clone + 'static>(
    event_loop: &EventLoop,
    deferreds: Vec<Deferred<T>>,
) -> Deferred<Vec<Result<T, Failure>>> {
    let total = deferreds.len();
    let combined = Deferred::new(event_loop);
    if total == 0 {
        combined.resolve(Vec::new());
        return combined;
    }

    let slots: Rc<RefCell<Vec<Option<Result<T, Failure>>>>> =
        Rc::new(RefCell::new(vec![None; total]));
    let remaining = Rc::new(Cell::new(total));

    for (index, deferred) in deferreds.into_iter().enumerate() {
        let slots = slots.clone();
        let remaining = remaining.clone();
        let combined = combined.clone();
        deferred.on_settled(move |settlement| {
            if let Some(slot) = slots.borrow_mut().get_mut(index) {
                *slot = Some(settlement.into_result());
            }
            remaining.set(remaining.get() - 1);
            if remaining.get() == 0 {
                let results = slots
                    .borrow_mut()
                    .drain(..)
                    .map(|slot| slot.unwrap_or_else(|| Err(Failure::internal("missing result"))))
                    .collect();
                combined.resolve(results);
            }
        });
    }
    combined
}
