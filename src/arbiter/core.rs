//! The arbiter loop: spawns members, relays envelopes between them, applies
//! monitor decisions and drives startup and shutdown.
//!
//! ```text
//!   STARTING ─(components running in declaration order)→ RUNNING
//!       │                                                   │
//!       └─(startup failure / timeout)──→ STOPPING ←─(stop)──┘
//!                                          │
//!                          (registry empty | grace expired twice)
//!                                          ↓
//!                                      TERMINATED
//! ```
//! All state below is owned by the arbiter's own event loop. RefCell borrows
//! are never held across calls that may re-enter the core.

use serde_json::json;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use super::handle::{ArbiterPhase, ArbiterSnapshot, ControlRequest, Reply, Target};
use super::signals;
use crate::actor::spawn::{spawn_process, spawn_thread};
use crate::actor::{ActorFactory, ActorSettings, BuiltinCommand, ExitStatus};
use crate::event_loop::{gather, Deferred, EventLoop, TimerHandle};
use crate::mailbox::{ActorProxy, Connection, MessageEnvelope, PendingReplies};
use crate::monitor::{Monitor, MonitorAction, MonitorStatus};
use crate::types::{
    ActorId, ActorIdentity, ActorKind, Concurrency, Config, CorrelationId, Error, Failure,
    Payload, Result,
};

/// Delay before a failed spawn is reported back to its monitor as a crash.
const SPAWN_RETRY_DELAY: Duration = Duration::from_millis(100);

/// The peer a connection belongs to, filled in by `hello` for process members.
type PeerSlot = Rc<RefCell<Option<ActorId>>>;

struct MemberHandle {
    identity: ActorIdentity,
    component: usize,
    concurrency: Concurrency,
    connection: Option<Connection>,
    kill: Option<oneshot::Sender<()>>,
    pid: Option<u32>,
}

/// A call forwarded from one member to another.
struct Relay {
    header: MessageEnvelope,
    callee: ActorId,
    expiry: TimerHandle,
}

enum Route {
    Arbiter,
    Monitor(usize),
    Member(ActorIdentity),
    Unavailable(Failure),
}

pub(crate) struct ArbiterCore {
    identity: ActorIdentity,
    config: Config,
    event_loop: EventLoop,
    started_at: Instant,
    socket: Option<PathBuf>,
    components: RefCell<Vec<Monitor>>,
    members: RefCell<HashMap<ActorId, MemberHandle>>,
    unattached: RefCell<HashMap<u64, Connection>>,
    next_serial: Cell<u64>,
    pending: PendingReplies,
    relays: RefCell<HashMap<CorrelationId, Relay>>,
    phase: Cell<ArbiterPhase>,
    exit_status: Cell<ExitStatus>,
    starting: Cell<usize>,
    ready_waiters: RefCell<Vec<Reply<()>>>,
    startup_deadline: RefCell<Option<TimerHandle>>,
    sweep_timer: RefCell<Option<TimerHandle>>,
    grace_timer: RefCell<Option<TimerHandle>>,
    killed_all: Cell<bool>,
}

/// Serve the declared components until shutdown completes.
pub(crate) fn run_arbiter(
    identity: ActorIdentity,
    config: Config,
    components: Vec<Monitor>,
    control_rx: mpsc::UnboundedReceiver<ControlRequest>,
) -> Result<ExitStatus> {
    let event_loop = EventLoop::new()?;

    let needs_socket = components
        .iter()
        .any(|m| m.spec().config.concurrency == Concurrency::Process);
    let listener = if needs_socket {
        let dir = config
            .arbiter
            .socket_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir);
        let path = dir.join(format!(
            "pulsar-{}-{}.sock",
            std::process::id(),
            identity.aid.short()
        ));
        // a stale socket from a crashed run would make bind fail
        let _ = std::fs::remove_file(&path);
        let listener = std::os::unix::net::UnixListener::bind(&path)?;
        listener.set_nonblocking(true)?;
        Some((path, listener))
    } else {
        None
    };

    let core = Rc::new(ArbiterCore {
        pending: PendingReplies::new(&event_loop),
        identity,
        config,
        event_loop: event_loop.clone(),
        started_at: Instant::now(),
        socket: listener.as_ref().map(|(path, _)| path.clone()),
        components: RefCell::new(components),
        members: RefCell::new(HashMap::new()),
        unattached: RefCell::new(HashMap::new()),
        next_serial: Cell::new(0),
        relays: RefCell::new(HashMap::new()),
        phase: Cell::new(ArbiterPhase::Starting),
        exit_status: Cell::new(ExitStatus::Graceful),
        starting: Cell::new(0),
        ready_waiters: RefCell::new(Vec::new()),
        startup_deadline: RefCell::new(None),
        sweep_timer: RefCell::new(None),
        grace_timer: RefCell::new(None),
        killed_all: Cell::new(false),
    });

    let served = core.serve(listener.map(|(_, listener)| listener), control_rx);
    let status = core.finish();
    event_loop.close();
    if let Some(path) = &core.socket {
        let _ = std::fs::remove_file(path);
    }
    served?;
    tracing::info!("arbiter_exited: status={:?}", status);
    Ok(status)
}

impl ArbiterCore {
    fn serve(
        self: &Rc<Self>,
        listener: Option<std::os::unix::net::UnixListener>,
        control_rx: mpsc::UnboundedReceiver<ControlRequest>,
    ) -> Result<()> {
        if let Some(listener) = listener {
            self.listen(listener)?;
        }
        if self.config.arbiter.install_signal_handlers {
            signals::install(&self.event_loop, Rc::downgrade(self))?;
        }
        let weak = Rc::downgrade(self);
        self.event_loop.watch(
            control_rx,
            move |request| {
                if let Some(core) = weak.upgrade() {
                    core.on_control(request);
                }
            },
            || {},
        );

        self.begin();
        self.event_loop.run()
    }

    fn finish(&self) -> ExitStatus {
        self.phase.set(ArbiterPhase::Terminated);
        for timer in [
            self.startup_deadline.borrow_mut().take(),
            self.sweep_timer.borrow_mut().take(),
            self.grace_timer.borrow_mut().take(),
        ]
        .into_iter()
        .flatten()
        {
            timer.cancel();
        }
        self.fail_waiters(Failure::peer_unavailable("arbiter terminated"));
        let abandoned = self.members.borrow().len();
        if abandoned > 0 {
            tracing::warn!("members_abandoned: count={}", abandoned);
            self.exit_status
                .set(self.exit_status.get().worst(ExitStatus::Forced));
        }
        for (_, member) in self.members.borrow_mut().drain() {
            if let Some(connection) = &member.connection {
                connection.abort();
            }
        }
        self.unattached.borrow_mut().clear();
        self.relays.borrow_mut().clear();
        self.exit_status.get()
    }

    // =========================================================================
    // Startup
    // =========================================================================

    fn begin(self: &Rc<Self>) {
        let names: Vec<String> = self
            .components
            .borrow()
            .iter()
            .map(|m| m.name().to_string())
            .collect();
        tracing::info!(
            "arbiter_starting: identity={}, components={:?}, socket={:?}",
            self.identity,
            names,
            self.socket
        );

        let weak = Rc::downgrade(self);
        let timeout = self.config.arbiter.startup_timeout;
        let deadline = self.event_loop.call_later(timeout, move || {
            if let Some(core) = weak.upgrade() {
                if core.phase.get() == ArbiterPhase::Starting {
                    core.startup_failed(format!("startup did not complete within {:?}", timeout));
                }
            }
        });
        *self.startup_deadline.borrow_mut() = Some(deadline);

        self.schedule_sweep();
        let core = self.clone();
        self.event_loop.call_soon(move || core.start_next_component());
    }

    fn start_next_component(self: &Rc<Self>) {
        if self.phase.get() != ArbiterPhase::Starting {
            return;
        }
        let index = self.starting.get();
        let actions = self.components.borrow_mut().get_mut(index).map(Monitor::start);
        match actions {
            Some(actions) => self.execute(index, actions),
            None => self.enter_running(),
        }
    }

    /// Advance startup if the component being started just became running.
    fn check_startup_progress(self: &Rc<Self>, component: usize) {
        if self.phase.get() != ArbiterPhase::Starting || component != self.starting.get() {
            return;
        }
        let ready = self
            .components
            .borrow()
            .get(component)
            .is_some_and(|m| m.status() == MonitorStatus::Running);
        if ready {
            self.starting.set(component + 1);
            let core = self.clone();
            self.event_loop.call_soon(move || core.start_next_component());
        }
    }

    fn enter_running(self: &Rc<Self>) {
        self.phase.set(ArbiterPhase::Running);
        if let Some(deadline) = self.startup_deadline.borrow_mut().take() {
            deadline.cancel();
        }
        tracing::info!(
            "arbiter_running: members={}, startup={:?}",
            self.members.borrow().len(),
            self.started_at.elapsed()
        );
        for waiter in self.ready_waiters.borrow_mut().drain(..) {
            let _ = waiter.send(Ok(()));
        }
    }

    fn startup_failed(self: &Rc<Self>, reason: String) {
        if self.phase.get() != ArbiterPhase::Starting {
            return;
        }
        tracing::error!("arbiter_startup_failed: reason={}", reason);
        self.exit_status.set(ExitStatus::Failed);
        self.fail_waiters(Failure::internal(format!("startup failed: {}", reason)));
        self.shutdown(false);
    }

    fn fail_waiters(&self, failure: Failure) {
        for waiter in self.ready_waiters.borrow_mut().drain(..) {
            let _ = waiter.send(Err(failure.clone()));
        }
    }

    // =========================================================================
    // Monitor actions
    // =========================================================================

    fn execute(self: &Rc<Self>, component: usize, actions: Vec<MonitorAction>) {
        for action in actions {
            match action {
                MonitorAction::Spawn { delay, restart } if delay.is_zero() => {
                    self.spawn_member(component, restart);
                }
                MonitorAction::Spawn { delay, restart } => {
                    let weak = Rc::downgrade(self);
                    self.event_loop.call_later(delay, move || {
                        if let Some(core) = weak.upgrade() {
                            core.spawn_member(component, restart);
                        }
                    });
                }
                MonitorAction::Kill(aid) => self.evict_member(&aid),
                MonitorAction::Failed(failure) => {
                    tracing::error!("component_failed: error={}", failure);
                    self.exit_status.set(ExitStatus::Failed);
                }
            }
        }
        self.check_component_down(component);
    }

    fn check_component_down(self: &Rc<Self>, component: usize) {
        if self.phase.get() != ArbiterPhase::Starting {
            return;
        }
        let down = self
            .components
            .borrow()
            .get(component)
            .filter(|m| m.is_down())
            .map(|m| m.name().to_string());
        if let Some(name) = down {
            self.startup_failed(format!("component '{}' went down during startup", name));
        }
    }

    fn spawn_member(self: &Rc<Self>, component: usize, restart: bool) {
        if !matches!(self.phase.get(), ArbiterPhase::Starting | ArbiterPhase::Running) {
            return;
        }
        let (name, concurrency, factory) = {
            let components = self.components.borrow();
            let Some(monitor) = components.get(component) else {
                return;
            };
            if !monitor.accepts_spawns() {
                return;
            }
            (
                monitor.name().to_string(),
                monitor.spec().config.concurrency,
                monitor.spec().factory.clone(),
            )
        };

        let identity = ActorIdentity::new(ActorKind::Actor, name);
        let spawned = match concurrency {
            Concurrency::Thread => self.spawn_thread_member(&identity, component, factory),
            Concurrency::Process => self.spawn_process_member(&identity, component),
        };
        let now = Instant::now();
        let proxy = self.proxy_for(identity.clone());
        if let Some(monitor) = self.components.borrow_mut().get_mut(component) {
            monitor.admit(proxy, now);
        }

        match spawned {
            Ok(()) => tracing::info!(
                "member_spawned: member={}, concurrency={:?}, restart={}",
                identity,
                concurrency,
                restart
            ),
            Err(e) => {
                tracing::error!("member_spawn_failed: member={}, error={}", identity, e);
                let weak = Rc::downgrade(self);
                let aid = identity.aid;
                self.event_loop.call_later(SPAWN_RETRY_DELAY, move || {
                    if let Some(core) = weak.upgrade() {
                        core.reap(&aid, component, ExitStatus::Failed);
                    }
                });
            }
        }
    }

    fn spawn_thread_member(
        self: &Rc<Self>,
        identity: &ActorIdentity,
        component: usize,
        factory: ActorFactory,
    ) -> Result<()> {
        let (ours, theirs) = StdUnixStream::pair()?;
        let settings = ActorSettings::new(&self.config, self.identity.clone(), None);
        let exit = spawn_thread(identity.clone(), factory, theirs, settings)?;
        let slot: PeerSlot = Rc::new(RefCell::new(Some(identity.aid.clone())));
        let connection = self.open_std_connection(ours, identity.to_string(), slot)?;
        self.members.borrow_mut().insert(
            identity.aid.clone(),
            MemberHandle {
                identity: identity.clone(),
                component,
                concurrency: Concurrency::Thread,
                connection: Some(connection),
                kill: None,
                pid: None,
            },
        );

        let sender = self.event_loop.event_sender();
        let weak = Rc::downgrade(self);
        let aid = identity.aid.clone();
        self.event_loop.spawn_local(async move {
            // a dropped sender means the thread died outside panic containment
            let status = exit.await.unwrap_or(ExitStatus::Failed);
            sender.post(move || {
                if let Some(core) = weak.upgrade() {
                    core.on_member_exit(&aid, status);
                }
            });
        });
        Ok(())
    }

    fn spawn_process_member(self: &Rc<Self>, identity: &ActorIdentity, component: usize) -> Result<()> {
        let socket = self
            .socket
            .as_ref()
            .ok_or_else(|| Error::internal("process member without an arbiter socket"))?;
        let mut child = spawn_process(&self.event_loop, identity, &self.identity, socket, &self.config)?;
        let pid = child.id();
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        self.members.borrow_mut().insert(
            identity.aid.clone(),
            MemberHandle {
                identity: identity.clone(),
                component,
                concurrency: Concurrency::Process,
                connection: None,
                kill: Some(kill_tx),
                pid,
            },
        );

        let sender = self.event_loop.event_sender();
        let weak = Rc::downgrade(self);
        let aid = identity.aid.clone();
        self.event_loop.spawn_local(async move {
            let waited = tokio::select! {
                waited = child.wait() => Some(waited),
                _ = kill_rx => None,
            };
            let waited = match waited {
                Some(waited) => waited,
                None => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            let status = match waited {
                Ok(status) => ExitStatus::from_code(status.code()),
                Err(e) => {
                    tracing::warn!("member_wait_failed: error={}", e);
                    ExitStatus::Failed
                }
            };
            sender.post(move || {
                if let Some(core) = weak.upgrade() {
                    core.on_member_exit(&aid, status);
                }
            });
        });
        Ok(())
    }

    /// Returns how the killed member was hosted, if it was known.
    fn kill_member(&self, aid: &ActorId) -> Option<Concurrency> {
        let mut members = self.members.borrow_mut();
        let member = members.get_mut(aid)?;
        tracing::warn!("member_killed: member={}, pid={:?}", member.identity, member.pid);
        if let Some(kill) = member.kill.take() {
            let _ = kill.send(());
        }
        // thread members exit once their mailbox drops
        if let Some(connection) = &member.connection {
            connection.abort();
        }
        Some(member.concurrency)
    }

    /// Kill a member while the pool is live.
    ///
    /// A thread stuck in a handler never sees its mailbox drop, so it is
    /// detached and reported to its monitor at once. Its eventual exit finds
    /// no handle and is ignored.
    fn evict_member(self: &Rc<Self>, aid: &ActorId) {
        if self.kill_member(aid) != Some(Concurrency::Thread)
            || !matches!(self.phase.get(), ArbiterPhase::Starting | ArbiterPhase::Running)
        {
            return;
        }
        let Some(member) = self.members.borrow_mut().remove(aid) else {
            return;
        };
        tracing::warn!("member_detached: member={}", member.identity);
        self.reap(aid, member.component, ExitStatus::Forced);
    }

    fn on_member_exit(self: &Rc<Self>, aid: &ActorId, exit: ExitStatus) {
        let Some(member) = self.members.borrow_mut().remove(aid) else {
            return;
        };
        if let Some(connection) = &member.connection {
            connection.abort();
        }
        if self.phase.get() == ArbiterPhase::Stopping {
            self.exit_status.set(self.exit_status.get().worst(exit));
        }
        self.reap(aid, member.component, exit);
    }

    /// Report a finished member to its monitor and act on the decision.
    fn reap(self: &Rc<Self>, aid: &ActorId, component: usize, exit: ExitStatus) {
        self.fail_peer(aid);
        let actions = self
            .components
            .borrow_mut()
            .get_mut(component)
            .map(|monitor| monitor.on_exit(aid, exit, Instant::now()))
            .unwrap_or_default();
        self.execute(component, actions);
        self.check_finished();
    }

    fn schedule_sweep(self: &Rc<Self>) {
        let weak = Rc::downgrade(self);
        let timer = self
            .event_loop
            .call_later(self.config.arbiter.heartbeat_interval, move || {
                if let Some(core) = weak.upgrade() {
                    core.sweep();
                }
            });
        *self.sweep_timer.borrow_mut() = Some(timer);
    }

    fn sweep(self: &Rc<Self>) {
        if !matches!(self.phase.get(), ArbiterPhase::Starting | ArbiterPhase::Running) {
            return;
        }
        let now = Instant::now();
        let timeout = self.config.arbiter.heartbeat_timeout;
        let swept: Vec<(usize, Vec<MonitorAction>)> = self
            .components
            .borrow_mut()
            .iter_mut()
            .enumerate()
            .map(|(index, monitor)| (index, monitor.sweep(now, timeout)))
            .filter(|(_, actions)| !actions.is_empty())
            .collect();
        for (index, actions) in swept {
            self.execute(index, actions);
        }
        self.schedule_sweep();
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    pub(crate) fn on_signal(self: &Rc<Self>, name: &str, abrupt: bool) {
        let escalate = abrupt || self.phase.get() == ArbiterPhase::Stopping;
        tracing::warn!("signal_received: signal={}, abrupt={}", name, escalate);
        self.shutdown(escalate);
    }

    fn shutdown(self: &Rc<Self>, abrupt: bool) {
        match self.phase.get() {
            ArbiterPhase::Terminated => return,
            ArbiterPhase::Stopping => {
                if abrupt && !self.killed_all.get() {
                    self.kill_all();
                }
                return;
            }
            ArbiterPhase::Starting | ArbiterPhase::Running => {}
        }
        self.phase.set(ArbiterPhase::Stopping);
        for timer in [
            self.startup_deadline.borrow_mut().take(),
            self.sweep_timer.borrow_mut().take(),
        ]
        .into_iter()
        .flatten()
        {
            timer.cancel();
        }
        self.fail_waiters(Failure::cancelled("arbiter is shutting down"));

        let stopping: Vec<ActorId> = self
            .components
            .borrow_mut()
            .iter_mut()
            .flat_map(|monitor| monitor.begin_shutdown())
            .collect();
        tracing::info!(
            "arbiter_stopping: abrupt={}, members={}",
            abrupt,
            stopping.len()
        );

        if abrupt {
            self.kill_all();
        } else {
            for aid in &stopping {
                self.send_stop(aid);
            }
        }

        let weak = Rc::downgrade(self);
        let timer = self
            .event_loop
            .call_later(self.config.arbiter.shutdown_grace_period, move || {
                if let Some(core) = weak.upgrade() {
                    core.on_grace_expired();
                }
            });
        *self.grace_timer.borrow_mut() = Some(timer);
        self.check_finished();
    }

    fn send_stop(&self, aid: &ActorId) {
        let target = match self.members.borrow().get(aid) {
            Some(member) => member.identity.clone(),
            None => return,
        };
        let stop = MessageEnvelope::cast(
            self.identity.clone(),
            target,
            BuiltinCommand::Stop.as_str(),
            Payload::Null,
        );
        if !self.send_to(aid, stop) {
            // not connected yet: nothing to drain
            self.kill_member(aid);
        }
    }

    fn kill_all(&self) {
        self.killed_all.set(true);
        self.exit_status
            .set(self.exit_status.get().worst(ExitStatus::Forced));
        let aids: Vec<ActorId> = self.members.borrow().keys().cloned().collect();
        for aid in &aids {
            self.kill_member(aid);
        }
    }

    fn on_grace_expired(self: &Rc<Self>) {
        let stragglers = self.members.borrow().len();
        if stragglers == 0 {
            return;
        }
        if !self.killed_all.get() {
            tracing::warn!("shutdown_grace_exceeded: stragglers={}", stragglers);
            self.kill_all();
            let weak = Rc::downgrade(self);
            let timer = self
                .event_loop
                .call_later(self.config.arbiter.shutdown_grace_period, move || {
                    if let Some(core) = weak.upgrade() {
                        core.on_grace_expired();
                    }
                });
            *self.grace_timer.borrow_mut() = Some(timer);
            return;
        }
        // killed members that still have not exited are left behind
        self.event_loop.stop();
    }

    fn check_finished(&self) {
        if self.phase.get() == ArbiterPhase::Stopping && self.members.borrow().is_empty() {
            tracing::info!("arbiter_drained: status={:?}", self.exit_status.get());
            self.event_loop.stop();
        }
    }

    // =========================================================================
    // Mailboxes
    // =========================================================================

    fn listen(self: &Rc<Self>, listener: std::os::unix::net::UnixListener) -> Result<()> {
        let listener = {
            let _guard = self.event_loop.enter();
            tokio::net::UnixListener::from_std(listener)?
        };
        let sender = self.event_loop.event_sender();
        let weak = Rc::downgrade(self);
        self.event_loop.spawn_local(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        let weak = weak.clone();
                        let posted = sender.post(move || {
                            if let Some(core) = weak.upgrade() {
                                core.on_accept(stream);
                            }
                        });
                        if !posted {
                            break;
                        }
                    }
                    Err(e) => tracing::warn!("accept_failed: error={}", e),
                }
            }
        });
        Ok(())
    }

    fn on_accept(self: &Rc<Self>, stream: tokio::net::UnixStream) {
        let serial = self.next_serial.get();
        self.next_serial.set(serial + 1);
        let slot: PeerSlot = Rc::new(RefCell::new(None));
        let (on_envelope, on_close) = self.connection_callbacks(serial, slot);
        let connection = Connection::open(
            &self.event_loop,
            stream,
            format!("worker#{}", serial),
            self.config.mailbox.max_frame_bytes,
            on_envelope,
            on_close,
        );
        self.unattached.borrow_mut().insert(serial, connection);
    }

    fn open_std_connection(
        self: &Rc<Self>,
        stream: StdUnixStream,
        label: String,
        slot: PeerSlot,
    ) -> Result<Connection> {
        let serial = self.next_serial.get();
        self.next_serial.set(serial + 1);
        let (on_envelope, on_close) = self.connection_callbacks(serial, slot);
        Connection::from_std(
            &self.event_loop,
            stream,
            label,
            self.config.mailbox.max_frame_bytes,
            on_envelope,
            on_close,
        )
    }

    fn connection_callbacks(
        self: &Rc<Self>,
        serial: u64,
        slot: PeerSlot,
    ) -> (impl FnMut(MessageEnvelope) + 'static, impl FnOnce() + 'static) {
        let on_envelope = {
            let weak = Rc::downgrade(self);
            let slot = slot.clone();
            move |envelope: MessageEnvelope| {
                let Some(core) = weak.upgrade() else {
                    return;
                };
                let peer = slot.borrow().clone();
                match peer {
                    Some(aid) => core.on_envelope(&aid, envelope),
                    None => core.on_hello(serial, &slot, envelope),
                }
            }
        };
        let on_close = {
            let weak = Rc::downgrade(self);
            move || {
                let Some(core) = weak.upgrade() else {
                    return;
                };
                let peer = slot.borrow().clone();
                match peer {
                    Some(aid) => core.on_member_closed(&aid),
                    None => {
                        core.unattached.borrow_mut().remove(&serial);
                    }
                }
            }
        };
        (on_envelope, on_close)
    }

    /// First frame on an accepted connection must be the worker's `hello`.
    fn on_hello(self: &Rc<Self>, serial: u64, slot: &PeerSlot, envelope: MessageEnvelope) {
        let Some(connection) = self.unattached.borrow_mut().remove(&serial) else {
            return;
        };
        let aid = envelope.sender.aid.clone();
        let mut members = self.members.borrow_mut();
        match members.get_mut(&aid) {
            Some(member) if envelope.command == "hello" && member.connection.is_none() => {
                tracing::info!("worker_attached: member={}, pid={:?}", member.identity, member.pid);
                *slot.borrow_mut() = Some(aid);
                member.connection = Some(connection);
            }
            _ => {
                tracing::warn!(
                    "unexpected_connection: command={}, sender={}",
                    envelope.command,
                    envelope.sender
                );
                connection.abort();
            }
        }
    }

    fn on_member_closed(self: &Rc<Self>, aid: &ActorId) {
        tracing::debug!("mailbox_closed: member={}", aid.short());
        self.fail_peer(aid);
    }

    /// Synthesize `peer-unavailable` replies for everything waiting on `aid`.
    fn fail_peer(&self, aid: &ActorId) {
        let failure = Failure::peer_unavailable(format!("actor {} is gone", aid.short()));
        self.pending.fail_peer(aid, &failure);

        let orphaned: Vec<Relay> = {
            let mut relays = self.relays.borrow_mut();
            let ids: Vec<CorrelationId> = relays
                .iter()
                .filter(|(_, relay)| relay.callee == *aid || relay.header.sender.aid == *aid)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| relays.remove(id)).collect()
        };
        for relay in orphaned {
            relay.expiry.cancel();
            if relay.callee == *aid {
                let reply = relay.header.error(relay.header.target.clone(), &failure);
                self.send_to(&relay.header.sender.aid, reply);
            }
        }
    }

    fn send_to(&self, aid: &ActorId, envelope: MessageEnvelope) -> bool {
        self.members
            .borrow()
            .get(aid)
            .and_then(|member| member.connection.as_ref())
            .is_some_and(|connection| connection.send(envelope))
    }

    fn proxy_for(&self, identity: ActorIdentity) -> ActorProxy {
        match &self.socket {
            Some(path) => ActorProxy::new(identity, path.display().to_string()),
            None => ActorProxy::inproc(identity),
        }
    }

    // =========================================================================
    // Routing
    // =========================================================================

    fn route(&self, target: &ActorId, command: &str) -> Route {
        if *target == self.identity.aid {
            return Route::Arbiter;
        }
        if let Some(member) = self.members.borrow().get(target) {
            return Route::Member(member.identity.clone());
        }
        let mut components = self.components.borrow_mut();
        let Some(index) = components.iter().position(|m| m.identity().aid == *target) else {
            return Route::Unavailable(Failure::peer_unavailable(format!(
                "unknown actor {}",
                target.short()
            )));
        };
        if command == BuiltinCommand::Info.as_str() {
            return Route::Monitor(index);
        }
        let monitor = &mut components[index];
        match monitor.pick() {
            Some(member) => Route::Member(member),
            None => Route::Unavailable(Failure::no_available_worker(format!(
                "'{}' has no running member",
                monitor.name()
            ))),
        }
    }

    /// Name targets resolve a top-level actor to its member, a monitor to itself.
    fn resolve(&self, target: &Target) -> std::result::Result<ActorId, Failure> {
        match target {
            Target::Arbiter => Ok(self.identity.aid.clone()),
            Target::Aid(aid) => Ok(aid.clone()),
            Target::Name(name) => {
                let components = self.components.borrow();
                let monitor = components
                    .iter()
                    .find(|m| m.name() == name)
                    .ok_or_else(|| Error::not_found(format!("no component named '{}'", name)).to_failure())?;
                if monitor.is_standalone() {
                    if let Some(member) = monitor.registry().iter().next() {
                        return Ok(member.aid().clone());
                    }
                }
                Ok(monitor.identity().aid.clone())
            }
        }
    }

    fn on_envelope(self: &Rc<Self>, from: &ActorId, envelope: MessageEnvelope) {
        if envelope.kind.is_reply() {
            self.on_reply(from, envelope);
            return;
        }
        let header = envelope.reply_header();
        match self.route(&envelope.target.aid, &envelope.command) {
            Route::Member(callee) => self.forward(callee, envelope),
            Route::Arbiter => {
                let result = self.arbiter_command(&envelope.sender, &envelope.command, envelope.args);
                self.reply_when_settled(header, result);
            }
            Route::Monitor(index) => {
                let result = self.monitor_info(index);
                self.reply_when_settled(header, result);
            }
            Route::Unavailable(failure) => match header {
                Some(call) => {
                    let reply = call.error(call.target.clone(), &failure);
                    self.send_to(from, reply);
                }
                None => tracing::warn!(
                    "cast_dropped: command={}, target={}, reason={}",
                    envelope.command,
                    envelope.target,
                    failure
                ),
            },
        }
    }

    fn on_reply(&self, from: &ActorId, envelope: MessageEnvelope) {
        let Some(correlation_id) = envelope.correlation_id.clone() else {
            tracing::warn!("reply_without_correlation: sender={}", envelope.sender);
            return;
        };
        if envelope.target.aid == self.identity.aid {
            if !self.pending.settle(&correlation_id, envelope.into_reply()) {
                tracing::debug!("late_reply_dropped: correlation_id={}", correlation_id.short());
            }
            return;
        }
        let relay = {
            let mut relays = self.relays.borrow_mut();
            match relays.get(&correlation_id) {
                Some(relay) if relay.callee == *from => relays.remove(&correlation_id),
                _ => None,
            }
        };
        match relay {
            Some(relay) => {
                relay.expiry.cancel();
                self.send_to(&relay.header.sender.aid, envelope);
            }
            None => tracing::debug!(
                "late_reply_dropped: correlation_id={}, sender={}",
                correlation_id.short(),
                envelope.sender
            ),
        }
    }

    fn forward(self: &Rc<Self>, callee: ActorIdentity, envelope: MessageEnvelope) {
        let header = envelope.reply_header();
        if let (Some(header), Some(correlation_id)) = (&header, &envelope.correlation_id) {
            let weak = Rc::downgrade(self);
            let id = correlation_id.clone();
            let expiry = self
                .event_loop
                .call_later(self.config.mailbox.call_timeout, move || {
                    if let Some(core) = weak.upgrade() {
                        core.relays.borrow_mut().remove(&id);
                    }
                });
            self.relays.borrow_mut().insert(
                correlation_id.clone(),
                Relay {
                    header: header.clone(),
                    callee: callee.aid.clone(),
                    expiry,
                },
            );
        }
        let caller = envelope.sender.aid.clone();
        let correlation_id = envelope.correlation_id.clone();
        if self.send_to(&callee.aid, envelope) {
            return;
        }
        if let (Some(header), Some(id)) = (header, correlation_id) {
            if let Some(relay) = self.relays.borrow_mut().remove(&id) {
                relay.expiry.cancel();
            }
            let failure = Failure::peer_unavailable(format!("{} is not connected", callee));
            self.send_to(&caller, header.error(callee, &failure));
        }
    }

    fn reply_when_settled(self: &Rc<Self>, header: Option<MessageEnvelope>, result: Deferred<Payload>) {
        let Some(call) = header else {
            return;
        };
        let responder = self.identity.clone();
        let weak = Rc::downgrade(self);
        result.on_settled(move |settlement| {
            let Some(core) = weak.upgrade() else {
                return;
            };
            let reply = match settlement.into_result() {
                Ok(value) => call.ack(responder, value),
                Err(failure) => call.error(responder, &failure),
            };
            core.send_to(&call.sender.aid, reply);
        });
    }

    /// Call a member on the arbiter's own behalf.
    fn call_member(&self, member: &ActorIdentity, command: &str, args: Payload) -> Deferred<Payload> {
        let (correlation_id, reply) =
            self.pending
                .register(&member.aid, command, self.config.mailbox.call_timeout);
        let envelope = MessageEnvelope::call(
            self.identity.clone(),
            member.clone(),
            command,
            args,
            correlation_id.clone(),
        );
        if !self.send_to(&member.aid, envelope) {
            self.pending.settle(
                &correlation_id,
                Err(Failure::peer_unavailable(format!("{} is not connected", member))),
            );
        }
        reply
    }

    /// Call any target on behalf of a control-handle caller.
    fn request(self: &Rc<Self>, target: &ActorId, command: &str, args: Payload) -> Deferred<Payload> {
        match self.route(target, command) {
            Route::Arbiter => self.arbiter_command(&self.identity, command, args),
            Route::Monitor(index) => self.monitor_info(index),
            Route::Member(member) => self.call_member(&member, command, args),
            Route::Unavailable(failure) => Deferred::rejected(&self.event_loop, failure),
        }
    }

    // =========================================================================
    // Control handle
    // =========================================================================

    fn on_control(self: &Rc<Self>, request: ControlRequest) {
        match request {
            ControlRequest::Call {
                target,
                command,
                args,
                reply,
            } => {
                let result = match self.resolve(&target) {
                    Ok(aid) => self.request(&aid, &command, args),
                    Err(failure) => Deferred::rejected(&self.event_loop, failure),
                };
                result.on_settled(move |settlement| {
                    let _ = reply.send(settlement.into_result());
                });
            }
            ControlRequest::Cast {
                target,
                command,
                args,
            } => {
                let aid = match self.resolve(&target) {
                    Ok(aid) => aid,
                    Err(failure) => {
                        tracing::warn!("cast_dropped: command={}, reason={}", command, failure);
                        return;
                    }
                };
                match self.route(&aid, &command) {
                    Route::Member(member) => {
                        let aid = member.aid.clone();
                        let cast = MessageEnvelope::cast(self.identity.clone(), member, command, args);
                        self.send_to(&aid, cast);
                    }
                    Route::Arbiter => {
                        let identity = self.identity.clone();
                        self.arbiter_command(&identity, &command, args);
                    }
                    Route::Monitor(_) => {}
                    Route::Unavailable(failure) => {
                        tracing::warn!("cast_dropped: command={}, reason={}", command, failure);
                    }
                }
            }
            ControlRequest::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            ControlRequest::WaitRunning { reply } => match self.phase.get() {
                ArbiterPhase::Running => {
                    let _ = reply.send(Ok(()));
                }
                ArbiterPhase::Starting => self.ready_waiters.borrow_mut().push(reply),
                ArbiterPhase::Stopping | ArbiterPhase::Terminated => {
                    let _ = reply.send(Err(Failure::peer_unavailable("arbiter is shutting down")));
                }
            },
            ControlRequest::Stop { abrupt } => self.shutdown(abrupt),
        }
    }

    fn snapshot(&self) -> ArbiterSnapshot {
        ArbiterSnapshot {
            identity: self.identity.clone(),
            phase: self.phase.get(),
            exit_status: self.exit_status.get(),
            components: self
                .components
                .borrow()
                .iter()
                .map(Monitor::snapshot)
                .collect(),
        }
    }

    // =========================================================================
    // Arbiter commands
    // =========================================================================

    fn arbiter_command(
        self: &Rc<Self>,
        sender: &ActorIdentity,
        command: &str,
        args: Payload,
    ) -> Deferred<Payload> {
        let lp = &self.event_loop;
        if let Some(builtin) = BuiltinCommand::parse(command) {
            return match builtin {
                BuiltinCommand::Info => self.info(),
                BuiltinCommand::Ping => Deferred::resolved(lp, Payload::from("pong")),
                BuiltinCommand::Echo => Deferred::resolved(lp, args),
                BuiltinCommand::Stop => {
                    tracing::info!("stop_requested: sender={}", sender);
                    let core = self.clone();
                    lp.call_soon(move || core.shutdown(false));
                    Deferred::resolved(lp, Payload::Bool(true))
                }
            };
        }
        match command {
            "notify" => {
                self.on_notify(sender, &args);
                Deferred::resolved(lp, Payload::Null)
            }
            "hello" => {
                tracing::debug!("hello: sender={}", sender);
                Deferred::resolved(lp, Payload::Null)
            }
            "get_actor" => {
                let name = args.get("name").and_then(Payload::as_str).unwrap_or_default();
                Deferred::resolved(lp, self.get_actor(name))
            }
            "kill_actor" => {
                let killed = args
                    .get("aid")
                    .and_then(Payload::as_str)
                    .and_then(|raw| ActorId::from_string(raw.to_string()).ok())
                    .is_some_and(|aid| self.kill_actor(&aid));
                Deferred::resolved(lp, Payload::Bool(killed))
            }
            other => Deferred::rejected(
                lp,
                Failure::unknown_command(format!("arbiter has no command '{}'", other)),
            ),
        }
    }

    fn on_notify(self: &Rc<Self>, sender: &ActorIdentity, args: &Payload) {
        let component = match self.members.borrow().get(&sender.aid) {
            Some(member) => member.component,
            None => return,
        };
        let running = args.get("status").and_then(Payload::as_str) == Some("running");
        let became_running = self
            .components
            .borrow_mut()
            .get_mut(component)
            .is_some_and(|monitor| monitor.on_heartbeat(&sender.aid, running, Instant::now()));
        if became_running {
            self.check_startup_progress(component);
        }
    }

    fn get_actor(&self, name: &str) -> Payload {
        let components = self.components.borrow();
        let proxy = components.iter().find(|m| m.name() == name).and_then(|monitor| {
            if monitor.is_standalone() {
                monitor.registry().iter().next().map(|member| member.proxy.clone())
            } else {
                Some(self.proxy_for(monitor.identity().clone()))
            }
        });
        proxy
            .and_then(|proxy| serde_json::to_value(proxy).ok())
            .unwrap_or(Payload::Null)
    }

    /// Kill a member; its monitor replaces it without touching the restart budget.
    fn kill_actor(self: &Rc<Self>, aid: &ActorId) -> bool {
        let component = match self.members.borrow().get(aid) {
            Some(member) => member.component,
            None => return false,
        };
        let marked = self
            .components
            .borrow_mut()
            .get_mut(component)
            .is_some_and(|monitor| monitor.request_replace(aid));
        if marked {
            self.evict_member(aid);
        }
        marked
    }

    fn info(self: &Rc<Self>) -> Deferred<Payload> {
        let count = self.components.borrow().len();
        let infos: Vec<Deferred<Payload>> = (0..count).map(|index| self.monitor_info(index)).collect();
        let identity = self.identity.clone();
        let phase = self.phase.get();
        let uptime = self.started_at.elapsed().as_secs_f64();
        let depth: usize = self
            .members
            .borrow()
            .values()
            .filter_map(|member| member.connection.as_ref())
            .map(Connection::mailbox_depth)
            .sum();
        gather(&self.event_loop, infos).map(move |results| {
            let components: Vec<Payload> = results
                .into_iter()
                .map(|result| result.unwrap_or_else(|failure| json!({ "error": failure })))
                .collect();
            json!({
                "identity": identity,
                "status": phase,
                "uptime": uptime,
                "mailbox_depth": depth,
                "pid": std::process::id(),
                "components": components,
            })
        })
    }

    /// Aggregate the `info` replies of a monitor's members.
    fn monitor_info(&self, index: usize) -> Deferred<Payload> {
        let components = self.components.borrow();
        let Some(monitor) = components.get(index) else {
            return Deferred::rejected(&self.event_loop, Failure::internal("unknown component"));
        };
        let snapshot = monitor.snapshot();
        let members: Vec<ActorIdentity> = monitor
            .registry()
            .iter()
            .map(|member| member.proxy.identity.clone())
            .collect();
        drop(components);

        let calls: Vec<Deferred<Payload>> = members
            .iter()
            .map(|member| self.call_member(member, BuiltinCommand::Info.as_str(), Payload::Null))
            .collect();
        gather(&self.event_loop, calls).map(move |results| {
            let member_infos: Vec<Payload> = results
                .into_iter()
                .zip(members)
                .map(|(result, identity)| {
                    result.unwrap_or_else(|failure| json!({ "identity": identity, "error": failure }))
                })
                .collect();
            json!({
                "identity": snapshot.identity,
                "standalone": snapshot.standalone,
                "status": snapshot.status,
                "concurrency": snapshot.concurrency,
                "pool_size": snapshot.pool_size,
                "restarts": snapshot.restarts,
                "mailbox_depth": member_infos
                    .iter()
                    .filter_map(|info| info.get("mailbox_depth").and_then(Payload::as_u64))
                    .sum::<u64>(),
                "members": member_infos,
            })
        })
    }
}
