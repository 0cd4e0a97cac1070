//! What a running actor can do from inside a handler.

use std::fmt;
use std::rc::Rc;

use super::runtime::{ActorCore, ActorStatus};
use crate::event_loop::{Deferred, EventLoop, Outcome};
use crate::mailbox::ActorProxy;
use crate::types::{ActorIdentity, Failure, Payload};

/// Handle passed to every handler and lifecycle hook.
///
/// Cheap to clone; valid only on the actor's own thread.
#[derive(Clone)]
pub struct ActorContext {
    core: Rc<ActorCore>,
}

impl ActorContext {
    pub(crate) fn new(core: Rc<ActorCore>) -> Self {
        Self { core }
    }

    pub fn identity(&self) -> &ActorIdentity {
        self.core.identity()
    }

    /// Serializable handle other actors can use to reach this one.
    pub fn proxy(&self) -> ActorProxy {
        self.core.proxy()
    }

    /// The arbiter that owns this actor's mailbox.
    pub fn supervisor(&self) -> &ActorIdentity {
        self.core.supervisor()
    }

    pub fn event_loop(&self) -> &EventLoop {
        self.core.event_loop()
    }

    pub fn status(&self) -> ActorStatus {
        self.core.status()
    }

    /// Same payload the built-in `info` command returns.
    pub fn info(&self) -> Payload {
        self.core.info()
    }

    /// Send a call and get a deferred for its reply.
    ///
    /// Targets may be a member or a monitor; a monitor routes the call to
    /// one of its running members. The deferred rejects with `timeout`
    /// after the configured call timeout.
    pub fn call(&self, target: &ActorProxy, command: &str, args: Payload) -> Deferred<Payload> {
        self.core.call(&target.identity, command, args)
    }

    /// Fire-and-forget. Returns `false` if the mailbox is already closed.
    pub fn cast(&self, target: &ActorProxy, command: &str, args: Payload) -> bool {
        self.core.cast(&target.identity, command, args)
    }

    pub fn call_arbiter(&self, command: &str, args: Payload) -> Deferred<Payload> {
        let arbiter = self.core.supervisor().clone();
        self.core.call(&arbiter, command, args)
    }

    pub fn cast_arbiter(&self, command: &str, args: Payload) -> bool {
        let arbiter = self.core.supervisor().clone();
        self.core.cast(&arbiter, command, args)
    }

    /// Resolve a top-level actor or monitor by name through the arbiter.
    pub fn get_actor(&self, name: &str) -> Deferred<Option<ActorProxy>> {
        self.call_arbiter("get_actor", serde_json::json!({ "name": name }))
            .then(|value| {
                if value.is_null() {
                    return Outcome::Value(None);
                }
                Outcome::from(
                    serde_json::from_value::<ActorProxy>(value)
                        .map(Some)
                        .map_err(|e| Failure::internal(format!("malformed proxy: {}", e))),
                )
            })
    }

    /// Begin a graceful stop once the current callback returns.
    pub fn stop(&self) {
        let core = self.core.clone();
        self.core.event_loop().call_soon(move || core.begin_stop());
    }
}

impl fmt::Debug for ActorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActorContext")
            .field("identity", self.identity())
            .field("status", &self.status())
            .finish()
    }
}
