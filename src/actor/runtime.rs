//! Actor lifecycle and dispatch.
//!
//! ```text
//!   STARTING ─(setup settles)→ RUNNING ─(stop)→ STOPPING ─(drained | grace)→ TERMINATED
//!       └──────────── failed setup / fatal handler error ──────────→ FAILED
//! ```
//! Envelopes arriving while STARTING are backlogged and replayed in arrival
//! order. Losing the supervisor connection ends the actor at once.

use serde::{Deserialize, Serialize};
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;
use tokio::time::Instant;

use super::context::ActorContext;
use super::handlers::{BuiltinCommand, FailurePolicy, HandlerTable, Request};
use super::recovery::with_recovery;
use super::ExitStatus;
use crate::event_loop::{Deferred, EventLoop, Outcome, TimerHandle};
use crate::mailbox::{ActorProxy, Connection, MessageEnvelope, PendingReplies};
use crate::types::{ActorIdentity, Config, Error, Failure, Payload, Result};

/// Upper bound on flushing the mailbox after the actor is done.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActorStatus {
    Starting,
    Running,
    Stopping,
    Terminated,
    Failed,
}

/// Runtime parameters an arbiter hands to each actor it hosts.
#[derive(Debug, Clone)]
pub(crate) struct ActorSettings {
    pub supervisor: ActorIdentity,
    /// Arbiter socket in process mode; `None` for in-process members.
    pub socket: Option<PathBuf>,
    pub call_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub shutdown_grace_period: Duration,
    pub max_frame_bytes: u32,
}

impl ActorSettings {
    pub fn new(config: &Config, supervisor: ActorIdentity, socket: Option<PathBuf>) -> Self {
        Self {
            supervisor,
            socket,
            call_timeout: config.mailbox.call_timeout,
            heartbeat_interval: config.arbiter.heartbeat_interval,
            shutdown_grace_period: config.arbiter.shutdown_grace_period,
            max_frame_bytes: config.mailbox.max_frame_bytes,
        }
    }

    pub fn proxy_for(&self, identity: ActorIdentity) -> ActorProxy {
        match &self.socket {
            Some(path) => ActorProxy::new(identity, path.display().to_string()),
            None => ActorProxy::inproc(identity),
        }
    }
}

/// Serve one actor on the current thread until it terminates.
pub(crate) fn run_actor(
    identity: ActorIdentity,
    table: HandlerTable,
    stream: UnixStream,
    settings: ActorSettings,
) -> ExitStatus {
    let span = tracing::info_span!("actor", aid = %identity.aid.short(), name = %identity.name);
    let _entered = span.enter();
    match ActorCore::serve(identity, table, stream, settings) {
        Ok(status) => {
            tracing::info!("actor_exited: status={:?}", status);
            status
        }
        Err(e) => {
            tracing::error!("actor_aborted: error={}", e);
            ExitStatus::Failed
        }
    }
}

pub(crate) struct ActorCore {
    identity: ActorIdentity,
    settings: ActorSettings,
    event_loop: EventLoop,
    table: HandlerTable,
    connection: RefCell<Option<Connection>>,
    pending: PendingReplies,
    status: Cell<ActorStatus>,
    started_at: Instant,
    backlog: RefCell<VecDeque<MessageEnvelope>>,
    in_flight: Cell<usize>,
    exit_status: Cell<ExitStatus>,
    closing: Cell<bool>,
    heartbeat: RefCell<Option<TimerHandle>>,
    grace: RefCell<Option<TimerHandle>>,
}

impl ActorCore {
    fn serve(
        identity: ActorIdentity,
        table: HandlerTable,
        stream: UnixStream,
        settings: ActorSettings,
    ) -> Result<ExitStatus> {
        table.validate()?;
        let event_loop = EventLoop::new()?;
        let core = Rc::new(ActorCore {
            pending: PendingReplies::new(&event_loop),
            identity,
            settings,
            event_loop: event_loop.clone(),
            table,
            connection: RefCell::new(None),
            status: Cell::new(ActorStatus::Starting),
            started_at: Instant::now(),
            backlog: RefCell::new(VecDeque::new()),
            in_flight: Cell::new(0),
            exit_status: Cell::new(ExitStatus::Forced),
            closing: Cell::new(false),
            heartbeat: RefCell::new(None),
            grace: RefCell::new(None),
        });

        let on_envelope = {
            let weak = Rc::downgrade(&core);
            move |envelope: MessageEnvelope| {
                if let Some(core) = weak.upgrade() {
                    core.on_envelope(envelope);
                }
            }
        };
        let on_close = {
            let weak = Rc::downgrade(&core);
            move || {
                if let Some(core) = weak.upgrade() {
                    core.on_supervisor_closed();
                }
            }
        };
        let connection = Connection::from_std(
            &event_loop,
            stream,
            core.settings.supervisor.to_string(),
            core.settings.max_frame_bytes,
            on_envelope,
            on_close,
        )?;
        *core.connection.borrow_mut() = Some(connection);

        // first frame identifies this end of the mailbox
        core.send(MessageEnvelope::cast(
            core.identity.clone(),
            core.settings.supervisor.clone(),
            "hello",
            serde_json::to_value(&core.identity)?,
        ));
        let starter = core.clone();
        event_loop.call_soon(move || starter.start());

        let outcome = event_loop.run();
        let status = core.exit_status.get();
        core.connection.borrow_mut().take();
        event_loop.close();
        outcome?;
        Ok(status)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    fn start(self: &Rc<Self>) {
        tracing::info!(
            "actor_starting: identity={}, commands={:?}",
            self.identity,
            self.table.commands()
        );
        let outcome = match self.table.start_hook() {
            None => Outcome::Value(()),
            Some(hook) => {
                let ctx = self.context();
                match with_recovery(|| Ok(hook(&ctx)), "on_start") {
                    Ok(outcome) => outcome,
                    Err(e) => Outcome::Error(Failure::handler(e.to_string())),
                }
            }
        };
        match outcome {
            Outcome::Value(()) => self.enter_running(),
            Outcome::Error(failure) => self.fail(&failure),
            Outcome::Defer(setup) => {
                let core = self.clone();
                setup.on_settled(move |settlement| match settlement.into_result() {
                    Ok(()) => core.enter_running(),
                    Err(failure) => core.fail(&failure),
                });
            }
        }
    }

    fn enter_running(self: &Rc<Self>) {
        if self.status.get() != ActorStatus::Starting {
            return;
        }
        self.status.set(ActorStatus::Running);
        tracing::info!(
            "actor_running: identity={}, backlog={}",
            self.identity,
            self.backlog.borrow().len()
        );
        self.heartbeat();
        let backlog: Vec<MessageEnvelope> = self.backlog.borrow_mut().drain(..).collect();
        for envelope in backlog {
            self.accept(envelope);
        }
    }

    /// Report liveness (and, the first time, `running`) to the supervisor.
    fn heartbeat(self: &Rc<Self>) {
        if self.closing.get()
            || !matches!(self.status.get(), ActorStatus::Running | ActorStatus::Stopping)
        {
            return;
        }
        self.send(MessageEnvelope::cast(
            self.identity.clone(),
            self.settings.supervisor.clone(),
            "notify",
            self.info(),
        ));
        let weak = Rc::downgrade(self);
        let timer = self
            .event_loop
            .call_later(self.settings.heartbeat_interval, move || {
                if let Some(core) = weak.upgrade() {
                    core.heartbeat();
                }
            });
        if let Some(previous) = self.heartbeat.replace(Some(timer)) {
            previous.cancel();
        }
    }

    pub(crate) fn begin_stop(self: &Rc<Self>) {
        if !matches!(self.status.get(), ActorStatus::Starting | ActorStatus::Running) {
            return;
        }
        self.status.set(ActorStatus::Stopping);
        tracing::info!("actor_stopping: in_flight={}", self.in_flight.get());

        let backlog: Vec<MessageEnvelope> = self.backlog.borrow_mut().drain(..).collect();
        for envelope in backlog {
            self.accept(envelope);
        }

        if self.in_flight.get() == 0 {
            self.finish_stop(ExitStatus::Graceful);
            return;
        }
        let weak = Rc::downgrade(self);
        let timer = self
            .event_loop
            .call_later(self.settings.shutdown_grace_period, move || {
                if let Some(core) = weak.upgrade() {
                    tracing::warn!("grace_period_exceeded: in_flight={}", core.in_flight.get());
                    core.finish_stop(ExitStatus::Forced);
                }
            });
        *self.grace.borrow_mut() = Some(timer);
    }

    fn drain_check(self: &Rc<Self>) {
        if self.status.get() == ActorStatus::Stopping && self.in_flight.get() == 0 {
            self.finish_stop(ExitStatus::Graceful);
        }
    }

    fn finish_stop(self: &Rc<Self>, exit: ExitStatus) {
        if self.status.get() != ActorStatus::Stopping {
            return;
        }
        if let Some(timer) = self.grace.borrow_mut().take() {
            timer.cancel();
        }
        if let Some(hook) = self.table.stop_hook() {
            let ctx = self.context();
            let result = with_recovery(
                || {
                    hook(&ctx);
                    Ok(())
                },
                "on_stop",
            );
            if let Err(e) = result {
                tracing::error!("on_stop_failed: error={}", e);
            }
        }
        self.status.set(ActorStatus::Terminated);
        self.shutdown(exit);
    }

    fn fail(self: &Rc<Self>, failure: &Failure) {
        if self.closing.get() {
            return;
        }
        tracing::error!("actor_failed: identity={}, error={}", self.identity, failure);
        self.status.set(ActorStatus::Failed);
        if let Some(timer) = self.grace.borrow_mut().take() {
            timer.cancel();
        }
        self.shutdown(ExitStatus::Failed);
    }

    /// Flush and close the mailbox, then stop the loop.
    fn shutdown(self: &Rc<Self>, exit: ExitStatus) {
        if self.closing.replace(true) {
            return;
        }
        self.exit_status.set(exit);
        if let Some(timer) = self.heartbeat.borrow_mut().take() {
            timer.cancel();
        }
        self.pending.fail_all(&Failure::peer_unavailable(format!(
            "actor {} is shutting down",
            self.identity
        )));
        match self.connection.borrow().as_ref() {
            // the close callback stops the loop once the writer has flushed
            Some(connection) => connection.close(),
            None => self.event_loop.stop(),
        }
        let event_loop = self.event_loop.clone();
        self.event_loop
            .call_later(FLUSH_TIMEOUT, move || event_loop.stop());
    }

    fn on_supervisor_closed(self: &Rc<Self>) {
        if self.closing.replace(true) {
            self.event_loop.stop();
            return;
        }
        tracing::warn!("supervisor_lost: identity={}", self.identity);
        self.status.set(ActorStatus::Terminated);
        self.exit_status.set(ExitStatus::Forced);
        for timer in [self.heartbeat.borrow_mut().take(), self.grace.borrow_mut().take()]
            .into_iter()
            .flatten()
        {
            timer.cancel();
        }
        self.pending
            .fail_all(&Failure::peer_unavailable("supervisor connection lost"));
        self.event_loop.stop();
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    fn on_envelope(self: &Rc<Self>, envelope: MessageEnvelope) {
        if envelope.kind.is_reply() {
            let Some(correlation_id) = envelope.correlation_id.clone() else {
                tracing::warn!("reply_without_correlation: command={}", envelope.command);
                return;
            };
            let command = envelope.command.clone();
            if !self.pending.settle(&correlation_id, envelope.into_reply()) {
                tracing::debug!(
                    "late_reply_dropped: command={}, correlation_id={}",
                    command,
                    correlation_id.short()
                );
            }
            return;
        }
        self.accept(envelope);
    }

    fn accept(self: &Rc<Self>, envelope: MessageEnvelope) {
        match self.status.get() {
            ActorStatus::Starting => self.backlog.borrow_mut().push_back(envelope),
            ActorStatus::Running => self.dispatch(envelope),
            ActorStatus::Stopping => {
                let header = envelope.reply_header();
                if BuiltinCommand::parse(&envelope.command) == Some(BuiltinCommand::Stop) {
                    self.reply(header.as_ref(), Ok(Payload::Bool(true)));
                } else if header.is_some() {
                    self.reply(
                        header.as_ref(),
                        Err(Failure::peer_unavailable("actor is stopping")),
                    );
                } else {
                    tracing::debug!("cast_dropped_while_stopping: command={}", envelope.command);
                }
            }
            ActorStatus::Terminated | ActorStatus::Failed => {}
        }
    }

    fn dispatch(self: &Rc<Self>, envelope: MessageEnvelope) {
        let header = envelope.reply_header();

        if let Some(builtin) = BuiltinCommand::parse(&envelope.command) {
            let value = match builtin {
                BuiltinCommand::Info => self.info(),
                BuiltinCommand::Ping => Payload::from("pong"),
                BuiltinCommand::Echo => envelope.args,
                BuiltinCommand::Stop => Payload::Bool(true),
            };
            self.reply(header.as_ref(), Ok(value));
            if builtin == BuiltinCommand::Stop {
                self.begin_stop();
            }
            return;
        }

        let request = Request::from_envelope(envelope);
        let command = request.command.clone();
        let Some(handler) = self.table.get(&command) else {
            match header {
                Some(call) => {
                    tracing::warn!("unknown_command: command={}, sender={}", command, call.sender);
                    self.reply(
                        Some(&call),
                        Err(Failure::unknown_command(format!("unknown command '{}'", command))),
                    );
                }
                None => tracing::warn!(
                    "unknown_cast_dropped: command={}, sender={}",
                    command,
                    request.sender
                ),
            }
            return;
        };

        let ctx = self.context();
        let operation = format!("handler:{}", command);
        let (outcome, panicked) = match with_recovery(|| Ok(handler(&ctx, request)), &operation) {
            Ok(outcome) => (outcome, false),
            Err(e) => (
                Outcome::Error(Failure::handler(e.to_string())),
                matches!(e, Error::Panicked { .. }),
            ),
        };

        match outcome {
            Outcome::Value(value) => self.complete(header, &command, Ok(value), false),
            Outcome::Error(failure) => self.complete(header, &command, Err(failure), panicked),
            Outcome::Defer(deferred) => {
                self.in_flight.set(self.in_flight.get() + 1);
                let core = self.clone();
                deferred.on_settled(move |settlement| {
                    core.in_flight.set(core.in_flight.get().saturating_sub(1));
                    core.complete(header, &command, settlement.into_result(), false);
                    core.drain_check();
                });
            }
        }
    }

    fn complete(
        self: &Rc<Self>,
        header: Option<MessageEnvelope>,
        command: &str,
        result: std::result::Result<Payload, Failure>,
        panicked: bool,
    ) {
        let fatal = match &result {
            Ok(_) => None,
            Err(failure) => {
                tracing::warn!("handler_failed: command={}, error={}", command, failure);
                let fatal = match self.table.policy() {
                    FailurePolicy::Recover => false,
                    FailurePolicy::FailOnPanic => panicked,
                    FailurePolicy::FailOnError => true,
                };
                fatal.then(|| failure.clone())
            }
        };
        self.reply(header.as_ref(), result);
        if let Some(failure) = fatal {
            self.fail(&failure);
        }
    }

    fn reply(&self, header: Option<&MessageEnvelope>, result: std::result::Result<Payload, Failure>) {
        let Some(call) = header else {
            return;
        };
        let reply = match result {
            Ok(value) => call.ack(self.identity.clone(), value),
            Err(failure) => call.error(self.identity.clone(), &failure),
        };
        if !self.send(reply) {
            tracing::debug!("reply_dropped: command={}, reason=mailbox_closed", call.command);
        }
    }

    // =========================================================================
    // Context surface
    // =========================================================================

    fn context(self: &Rc<Self>) -> ActorContext {
        ActorContext::new(self.clone())
    }

    pub(crate) fn identity(&self) -> &ActorIdentity {
        &self.identity
    }

    pub(crate) fn supervisor(&self) -> &ActorIdentity {
        &self.settings.supervisor
    }

    pub(crate) fn proxy(&self) -> ActorProxy {
        self.settings.proxy_for(self.identity.clone())
    }

    pub(crate) fn event_loop(&self) -> &EventLoop {
        &self.event_loop
    }

    pub(crate) fn status(&self) -> ActorStatus {
        self.status.get()
    }

    pub(crate) fn info(&self) -> Payload {
        let depth = self
            .connection
            .borrow()
            .as_ref()
            .map_or(0, Connection::mailbox_depth)
            + self.backlog.borrow().len();
        serde_json::json!({
            "identity": self.identity,
            "status": self.status.get(),
            "uptime": self.started_at.elapsed().as_secs_f64(),
            "mailbox_depth": depth,
            "in_flight": self.in_flight.get(),
            "pending_calls": self.pending.len(),
            "pid": std::process::id(),
        })
    }

    pub(crate) fn send(&self, envelope: MessageEnvelope) -> bool {
        self.connection
            .borrow()
            .as_ref()
            .is_some_and(|connection| connection.send(envelope))
    }

    pub(crate) fn call(&self, target: &ActorIdentity, command: &str, args: Payload) -> Deferred<Payload> {
        if self.closing.get() {
            return Deferred::rejected(
                &self.event_loop,
                Failure::peer_unavailable("mailbox is closed"),
            );
        }
        let (correlation_id, reply) =
            self.pending
                .register(&target.aid, command, self.settings.call_timeout);
        let envelope = MessageEnvelope::call(
            self.identity.clone(),
            target.clone(),
            command,
            args,
            correlation_id.clone(),
        );
        if !self.send(envelope) {
            self.pending.settle(
                &correlation_id,
                Err(Failure::peer_unavailable("mailbox is closed")),
            );
        }
        reply
    }

    pub(crate) fn cast(&self, target: &ActorIdentity, command: &str, args: Payload) -> bool {
        !self.closing.get()
            && self.send(MessageEnvelope::cast(
                self.identity.clone(),
                target.clone(),
                command,
                args,
            ))
    }
}
