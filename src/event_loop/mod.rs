//! Per-actor cooperative event loop.
//!
//! Every actor (and the arbiter) owns exactly one [`EventLoop`]. The loop is
//! single-threaded: it sits on a tokio current-thread runtime plus a
//! `LocalSet`, whose reactor is the readiness poller. I/O sources are local
//! tasks; when they become ready they post callbacks into the loop instead of
//! touching actor state themselves.
//!
//! One iteration:
//! ```text
//!   wait budget = 0 if run queue non-empty
//!               | earliest live timer
//!               | unbounded
//!   block on readiness/remote channels up to the budget
//!   → move all ready events into the run queue
//!   → pop all due timers into the run queue
//!   → drain the run queue until empty
//! ```
//! Code between yield points runs atomically with respect to everything else
//! on the same loop.

mod deferred;
mod timers;

pub use deferred::{gather, Deferred, DeferredFuture, DeferredState, Outcome, Settlement};

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::rc::Rc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::LocalSet;
use tokio::time::Instant;

use crate::types::{Error, Failure, Result};
use timers::{Callback, TimerHeap};

/// Callback posted from another thread; runs on the loop thread.
pub type RemoteCallback = Box<dyn FnOnce(&EventLoop) + Send>;

struct Inner {
    runtime: tokio::runtime::Runtime,
    local: RefCell<Option<LocalSet>>,
    run_queue: RefCell<VecDeque<(Rc<Cell<bool>>, Callback)>>,
    timers: RefCell<TimerHeap>,
    events_tx: mpsc::UnboundedSender<Callback>,
    events_rx: RefCell<Option<mpsc::UnboundedReceiver<Callback>>>,
    remote_tx: mpsc::UnboundedSender<RemoteCallback>,
    remote_rx: RefCell<Option<mpsc::UnboundedReceiver<RemoteCallback>>>,
    stopping: Cell<bool>,
    running: Cell<bool>,
    draining: Cell<bool>,
    iterations: Cell<u64>,
}

/// Handle to the loop owned by the current thread. Cheap to clone.
#[derive(Clone)]
pub struct EventLoop {
    inner: Rc<Inner>,
}

impl EventLoop {
    /// Create a loop with its own current-thread runtime.
    pub fn new() -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (remote_tx, remote_rx) = mpsc::unbounded_channel();

        Ok(Self {
            inner: Rc::new(Inner {
                runtime,
                local: RefCell::new(Some(LocalSet::new())),
                run_queue: RefCell::new(VecDeque::new()),
                timers: RefCell::new(TimerHeap::default()),
                events_tx,
                events_rx: RefCell::new(Some(events_rx)),
                remote_tx,
                remote_rx: RefCell::new(Some(remote_rx)),
                stopping: Cell::new(false),
                running: Cell::new(false),
                draining: Cell::new(false),
                iterations: Cell::new(0),
            }),
        })
    }

    /// Current loop time.
    pub fn now(&self) -> Instant {
        Instant::now()
    }

    /// Number of completed iterations.
    pub fn iterations(&self) -> u64 {
        self.inner.iterations.get()
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.get()
    }

    /// Thread-safe handle for posting callbacks from other threads.
    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            remote_tx: self.inner.remote_tx.clone(),
        }
    }

    /// Enter the loop's runtime context, for registering OS handles outside a task.
    pub fn enter(&self) -> tokio::runtime::EnterGuard<'_> {
        self.inner.runtime.enter()
    }

    /// Sender usable from local I/O tasks without keeping the loop alive.
    pub fn event_sender(&self) -> EventSender {
        EventSender {
            tx: self.inner.events_tx.clone(),
        }
    }

    // =========================================================================
    // Scheduling
    // =========================================================================

    /// Queue `callback` on the run queue.
    pub fn call_soon(&self, callback: impl FnOnce() + 'static) -> CallbackHandle {
        let cancelled = Rc::new(Cell::new(false));
        self.inner
            .run_queue
            .borrow_mut()
            .push_back((cancelled.clone(), Box::new(callback)));
        self.wake();
        CallbackHandle { cancelled }
    }

    /// Run `callback` once `delay` has elapsed.
    pub fn call_later(&self, delay: Duration, callback: impl FnOnce() + 'static) -> TimerHandle {
        self.call_at(Instant::now() + delay, callback)
    }

    /// Run `callback` at `deadline`.
    pub fn call_at(&self, deadline: Instant, callback: impl FnOnce() + 'static) -> TimerHandle {
        let cancelled = self
            .inner
            .timers
            .borrow_mut()
            .push(deadline, Box::new(callback));
        self.wake();
        TimerHandle {
            cancelled,
            deadline,
        }
    }

    /// Register an I/O task with the loop's poller.
    ///
    /// The task should hand results back through an [`EventSender`] (or a
    /// [`Deferred`]) rather than mutating actor state directly.
    pub fn spawn_local<F>(&self, task: F) -> IoHandle
    where
        F: Future<Output = ()> + 'static,
    {
        let local = self.inner.local.borrow();
        let handle = local.as_ref().map(|set| set.spawn_local(task).abort_handle());
        IoHandle { handle }
    }

    /// Turn a channel into a readiness source: every item becomes a callback
    /// invocation on the loop, in receive order; `on_close` runs once the
    /// channel is closed.
    pub fn watch<T, F, C>(
        &self,
        mut rx: mpsc::UnboundedReceiver<T>,
        on_item: F,
        on_close: C,
    ) -> IoHandle
    where
        T: 'static,
        F: FnMut(T) + 'static,
        C: FnOnce() + 'static,
    {
        let sender = self.event_sender();
        let on_item = Rc::new(RefCell::new(on_item));
        self.spawn_local(async move {
            while let Some(item) = rx.recv().await {
                let on_item = on_item.clone();
                let posted = sender.post(move || {
                    let mut f = on_item.borrow_mut();
                    (*f)(item);
                });
                if !posted {
                    return;
                }
            }
            sender.post(on_close);
        })
    }

    /// Wake the poller so a newly queued callback or timer is noticed.
    fn wake(&self) {
        if !self.inner.draining.get() && self.inner.running.get() {
            let _ = self.inner.events_tx.send(Box::new(|| {}));
        }
    }

    // =========================================================================
    // Running
    // =========================================================================

    /// Run iterations until [`stop`](Self::stop) is requested.
    pub fn run(&self) -> Result<()> {
        self.block_on(self.clone().drive())
    }

    /// Drive the loop until `deferred` settles, then return its result.
    pub fn run_until_complete<T: Clone + 'static>(
        &self,
        deferred: &Deferred<T>,
    ) -> Result<std::result::Result<T, Failure>> {
        // only this run may be stopped by the settlement
        let active = Rc::new(Cell::new(true));
        let lp = self.clone();
        let armed = active.clone();
        deferred.on_settled(move |_| {
            if armed.get() {
                lp.stop();
            }
        });
        let ran = self.run();
        active.set(false);
        ran?;
        Ok(match deferred.settlement() {
            Some(settlement) => settlement.into_result(),
            None => Err(Failure::cancelled("event loop stopped before settlement")),
        })
    }

    /// Run iterations without blocking until nothing is ready any more.
    pub fn run_until_idle(&self) -> Result<()> {
        let lp = self.clone();
        self.block_on(async move {
            let (mut events, mut remote) = lp.take_receivers();
            loop {
                // let local I/O tasks make progress
                tokio::task::yield_now().await;
                let mut moved = lp.collect_ready(&mut events, &mut remote);
                moved += lp.collect_due_timers();
                let ran = lp.drain_run_queue();
                lp.inner.iterations.set(lp.inner.iterations.get() + 1);
                if moved == 0 && ran == 0 {
                    break;
                }
            }
            lp.restore_receivers(events, remote);
        })
    }

    /// Request a cooperative stop: the current iteration completes, no new one starts.
    pub fn stop(&self) {
        self.inner.stopping.set(true);
        self.wake();
    }

    /// Tear down I/O tasks, timers and queued callbacks. The loop cannot run afterwards.
    pub fn close(&self) {
        let local = self.inner.local.borrow_mut().take();
        {
            let _guard = self.inner.runtime.enter();
            drop(local);
        }
        self.inner.run_queue.borrow_mut().clear();
        self.inner.timers.borrow_mut().clear();
        self.inner.events_rx.borrow_mut().take();
        self.inner.remote_rx.borrow_mut().take();
    }

    fn block_on<F: Future<Output = ()>>(&self, fut: F) -> Result<()> {
        if self.inner.running.replace(true) {
            return Err(Error::state_transition("event loop is already running"));
        }
        let result = {
            let local = self.inner.local.borrow();
            match local.as_ref() {
                Some(set) => {
                    set.block_on(&self.inner.runtime, fut);
                    Ok(())
                }
                None => Err(Error::state_transition("event loop is closed")),
            }
        };
        self.inner.running.set(false);
        self.inner.stopping.set(false);
        result
    }

    async fn drive(self) {
        let (mut events, mut remote) = self.take_receivers();
        tracing::debug!("event_loop_started");
        while !self.inner.stopping.get() {
            self.run_once(&mut events, &mut remote).await;
        }
        tracing::debug!("event_loop_stopped: iterations={}", self.iterations());
        self.restore_receivers(events, remote);
    }

    async fn run_once(
        &self,
        events: &mut Option<mpsc::UnboundedReceiver<Callback>>,
        remote: &mut Option<mpsc::UnboundedReceiver<RemoteCallback>>,
    ) {
        let has_ready = !self.inner.run_queue.borrow().is_empty();
        let deadline = self.inner.timers.borrow_mut().next_deadline();

        if has_ready {
            tokio::task::yield_now().await;
        } else if let (Some(events_rx), Some(remote_rx)) = (events.as_mut(), remote.as_mut()) {
            match deadline {
                Some(deadline) => {
                    tokio::select! {
                        Some(cb) = events_rx.recv() => self.push_ready(cb),
                        Some(cb) = remote_rx.recv() => self.push_remote(cb),
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                }
                None => {
                    tokio::select! {
                        Some(cb) = events_rx.recv() => self.push_ready(cb),
                        Some(cb) = remote_rx.recv() => self.push_remote(cb),
                        else => {
                            self.inner.stopping.set(true);
                        }
                    }
                }
            }
        }

        self.collect_ready(events, remote);
        self.collect_due_timers();
        self.drain_run_queue();
        self.inner.iterations.set(self.inner.iterations.get() + 1);
    }

    fn take_receivers(
        &self,
    ) -> (
        Option<mpsc::UnboundedReceiver<Callback>>,
        Option<mpsc::UnboundedReceiver<RemoteCallback>>,
    ) {
        (
            self.inner.events_rx.borrow_mut().take(),
            self.inner.remote_rx.borrow_mut().take(),
        )
    }

    fn restore_receivers(
        &self,
        events: Option<mpsc::UnboundedReceiver<Callback>>,
        remote: Option<mpsc::UnboundedReceiver<RemoteCallback>>,
    ) {
        *self.inner.events_rx.borrow_mut() = events;
        *self.inner.remote_rx.borrow_mut() = remote;
    }

    fn push_ready(&self, cb: Callback) {
        self.inner
            .run_queue
            .borrow_mut()
            .push_back((Rc::new(Cell::new(false)), cb));
    }

    fn push_remote(&self, cb: RemoteCallback) {
        let lp = self.clone();
        self.push_ready(Box::new(move || cb(&lp)));
    }

    fn collect_ready(
        &self,
        events: &mut Option<mpsc::UnboundedReceiver<Callback>>,
        remote: &mut Option<mpsc::UnboundedReceiver<RemoteCallback>>,
    ) -> usize {
        let mut moved = 0;
        if let Some(rx) = events.as_mut() {
            while let Ok(cb) = rx.try_recv() {
                self.push_ready(cb);
                moved += 1;
            }
        }
        if let Some(rx) = remote.as_mut() {
            while let Ok(cb) = rx.try_recv() {
                self.push_remote(cb);
                moved += 1;
            }
        }
        moved
    }

    fn collect_due_timers(&self) -> usize {
        let due = self.inner.timers.borrow_mut().pop_due(Instant::now());
        let count = due.len();
        let mut queue = self.inner.run_queue.borrow_mut();
        for entry in due {
            queue.push_back(entry);
        }
        count
    }

    fn drain_run_queue(&self) -> usize {
        self.inner.draining.set(true);
        let mut ran = 0;
        loop {
            let next = self.inner.run_queue.borrow_mut().pop_front();
            let Some((cancelled, callback)) = next else {
                break;
            };
            if cancelled.get() {
                continue;
            }
            // mark as fired so a late cancel is a no-op
            cancelled.set(true);
            callback();
            ran += 1;
        }
        self.inner.draining.set(false);
        ran
    }

    fn pending_counts(&self) -> (usize, usize) {
        (
            self.inner.run_queue.borrow().len(),
            self.inner.timers.borrow().len(),
        )
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (ready, timers) = self.pending_counts();
        f.debug_struct("EventLoop")
            .field("running", &self.inner.running.get())
            .field("iterations", &self.inner.iterations.get())
            .field("ready", &ready)
            .field("timers", &timers)
            .finish()
    }
}

/// Cancels a callback queued with [`EventLoop::call_soon`].
#[derive(Debug, Clone)]
pub struct CallbackHandle {
    cancelled: Rc<Cell<bool>>,
}

impl CallbackHandle {
    /// Remove the callback if it has not run yet. No side effects otherwise.
    pub fn cancel(&self) {
        self.cancelled.set(true);
    }
}

/// Cancels a timer scheduled with [`EventLoop::call_later`] / [`EventLoop::call_at`].
#[derive(Debug, Clone)]
pub struct TimerHandle {
    cancelled: Rc<Cell<bool>>,
    deadline: Instant,
}

impl TimerHandle {
    pub fn cancel(&self) {
        self.cancelled.set(true);
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

/// Handle to an I/O task registered with [`EventLoop::spawn_local`].
#[derive(Debug)]
pub struct IoHandle {
    handle: Option<tokio::task::AbortHandle>,
}

impl IoHandle {
    /// Deregister the task. Pending readiness callbacks already posted still run.
    pub fn abort(&self) {
        if let Some(handle) = &self.handle {
            handle.abort();
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }
}

/// Posts readiness callbacks into a loop from local I/O tasks.
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<Callback>,
}

impl EventSender {
    /// Returns `false` once the loop has been closed.
    pub fn post(&self, callback: impl FnOnce() + 'static) -> bool {
        self.tx.send(Box::new(callback)).is_ok()
    }
}

impl fmt::Debug for EventSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSender")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

/// Thread-safe handle to a loop.
#[derive(Clone)]
pub struct LoopHandle {
    remote_tx: mpsc::UnboundedSender<RemoteCallback>,
}

impl LoopHandle {
    /// Queue `callback` on the loop from any thread.
    pub fn call_soon_threadsafe(&self, callback: impl FnOnce(&EventLoop) + Send + 'static) -> Result<()> {
        self.remote_tx
            .send(Box::new(callback))
            .map_err(|_| Error::peer_unavailable("event loop is closed"))
    }

    /// Request a cooperative stop from any thread.
    pub fn stop(&self) -> Result<()> {
        self.call_soon_threadsafe(|lp| lp.stop())
    }
}

impl fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopHandle")
            .field("closed", &self.remote_tx.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_soon_runs_in_fifo_order() {
        let lp = EventLoop::new().unwrap();
        let order = Rc::new(RefCell::new(Vec::new()));
        for i in 0..5 {
            let order = order.clone();
            lp.call_soon(move || order.borrow_mut().push(i));
        }
        lp.run_until_idle().unwrap();
        assert_eq!(*order.borrow(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_cancelled_callback_never_runs() {
        let lp = EventLoop::new().unwrap();
        let fired = Rc::new(Cell::new(false));
        let flag = fired.clone();
        let handle = lp.call_soon(move || flag.set(true));
        handle.cancel();
        lp.run_until_idle().unwrap();
        assert!(!fired.get());
    }

    #[test]
    fn test_callbacks_queued_during_drain_run_in_same_iteration() {
        let lp = EventLoop::new().unwrap();
        let order = Rc::new(RefCell::new(Vec::new()));
        let inner_lp = lp.clone();
        let o = order.clone();
        lp.call_soon(move || {
            o.borrow_mut().push("outer");
            let o2 = o.clone();
            inner_lp.call_soon(move || o2.borrow_mut().push("inner"));
        });
        let stopper = lp.clone();
        lp.call_soon(move || stopper.stop());
        lp.run().unwrap();
        assert_eq!(*order.borrow(), vec!["outer", "inner"]);
    }

    #[test]
    fn test_timers_fire_in_deadline_order_and_stop_loop() {
        let lp = EventLoop::new().unwrap();
        let order = Rc::new(RefCell::new(Vec::new()));

        let o = order.clone();
        lp.call_later(Duration::from_millis(30), move || o.borrow_mut().push(30));
        let o = order.clone();
        lp.call_later(Duration::from_millis(10), move || o.borrow_mut().push(10));
        let o = order.clone();
        let cancelled = lp.call_later(Duration::from_millis(20), move || o.borrow_mut().push(20));
        cancelled.cancel();

        let stopper = lp.clone();
        lp.call_later(Duration::from_millis(40), move || stopper.stop());
        lp.run().unwrap();

        assert_eq!(*order.borrow(), vec![10, 30]);
    }

    #[test]
    fn test_stop_lets_current_iteration_finish() {
        let lp = EventLoop::new().unwrap();
        let ran = Rc::new(Cell::new(0));
        let stopper = lp.clone();
        lp.call_soon(move || stopper.stop());
        let r = ran.clone();
        lp.call_soon(move || r.set(r.get() + 1));
        lp.run().unwrap();
        assert_eq!(ran.get(), 1);
        assert_eq!(lp.iterations(), 1);
    }

    #[test]
    fn test_threadsafe_post_from_other_thread() {
        let lp = EventLoop::new().unwrap();
        let handle = lp.handle();
        let worker = std::thread::spawn(move || {
            handle
                .call_soon_threadsafe(|lp| {
                    lp.call_soon({
                        let lp = lp.clone();
                        move || lp.stop()
                    });
                })
                .unwrap();
        });
        lp.run().unwrap();
        worker.join().unwrap();
    }

    #[test]
    fn test_watch_delivers_items_in_order_then_close() {
        let lp = EventLoop::new().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let s = seen.clone();
        let stopper = lp.clone();
        lp.watch(
            rx,
            move |item: u32| s.borrow_mut().push(item),
            move || stopper.stop(),
        );
        for i in 0..10 {
            tx.send(i).unwrap();
        }
        drop(tx);
        lp.run().unwrap();
        assert_eq!(*seen.borrow(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_unsettled_run_until_complete_does_not_stop_later_runs() {
        let lp = EventLoop::new().unwrap();
        let deferred: Deferred<u32> = Deferred::new(&lp);
        let stopper = lp.clone();
        lp.call_later(Duration::from_millis(10), move || stopper.stop());
        assert!(lp.run_until_complete(&deferred).unwrap().is_err());

        // settles between runs; its continuation runs in the next one
        deferred.resolve(7);
        let fired = Rc::new(Cell::new(false));
        let flag = fired.clone();
        lp.call_later(Duration::from_millis(20), move || flag.set(true));
        let stopper = lp.clone();
        lp.call_later(Duration::from_millis(40), move || stopper.stop());
        lp.run().unwrap();
        assert!(fired.get());
    }

    #[test]
    fn test_run_until_complete_returns_settlement() {
        let lp = EventLoop::new().unwrap();
        let deferred: Deferred<u32> = Deferred::new(&lp);
        let settle = deferred.clone();
        lp.call_later(Duration::from_millis(5), move || {
            settle.resolve(3);
        });
        assert_eq!(lp.run_until_complete(&deferred).unwrap(), Ok(3));
    }

    #[test]
    fn test_run_after_close_fails() {
        let lp = EventLoop::new().unwrap();
        lp.close();
        assert!(lp.run().is_err());
    }
}
