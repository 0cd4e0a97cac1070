//! Thread-safe control surface of a running arbiter.

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::actor::ExitStatus;
use crate::mailbox::ActorProxy;
use crate::monitor::{ComponentSnapshot, MemberStatus};
use crate::types::{ActorId, ActorIdentity, Error, Failure, Payload, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArbiterPhase {
    Starting,
    Running,
    Stopping,
    Terminated,
}

/// Who a [`ArbiterHandle::call`] or [`ArbiterHandle::cast`] is addressed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// The arbiter's own commands.
    Arbiter,
    /// A top-level actor or monitor by declared name.
    Name(String),
    /// Any member, monitor or the arbiter by id.
    Aid(ActorId),
}

impl From<&str> for Target {
    fn from(name: &str) -> Self {
        Target::Name(name.to_string())
    }
}

impl From<String> for Target {
    fn from(name: String) -> Self {
        Target::Name(name)
    }
}

impl From<ActorId> for Target {
    fn from(aid: ActorId) -> Self {
        Target::Aid(aid)
    }
}

impl From<&ActorIdentity> for Target {
    fn from(identity: &ActorIdentity) -> Self {
        Target::Aid(identity.aid.clone())
    }
}

impl From<&ActorProxy> for Target {
    fn from(proxy: &ActorProxy) -> Self {
        Target::Aid(proxy.identity.aid.clone())
    }
}

/// Point-in-time view of the supervision tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArbiterSnapshot {
    pub identity: ActorIdentity,
    pub phase: ArbiterPhase,
    pub exit_status: ExitStatus,
    pub components: Vec<ComponentSnapshot>,
}

impl ArbiterSnapshot {
    pub fn component(&self, name: &str) -> Option<&ComponentSnapshot> {
        self.components.iter().find(|c| c.identity.name == name)
    }

    /// Running members of the named component; 0 if unknown.
    pub fn running(&self, name: &str) -> usize {
        self.component(name).map_or(0, |c| {
            c.members
                .iter()
                .filter(|m| m.status == MemberStatus::Running)
                .count()
        })
    }
}

pub(crate) type Reply<T> = oneshot::Sender<std::result::Result<T, Failure>>;

#[derive(Debug)]
pub(crate) enum ControlRequest {
    Call {
        target: Target,
        command: String,
        args: Payload,
        reply: Reply<Payload>,
    },
    Cast {
        target: Target,
        command: String,
        args: Payload,
    },
    Snapshot {
        reply: oneshot::Sender<ArbiterSnapshot>,
    },
    WaitRunning {
        reply: Reply<()>,
    },
    Stop {
        abrupt: bool,
    },
}

/// Cloneable, `Send` handle for driving an arbiter from other threads.
///
/// Methods block the calling thread until the arbiter answers, so they must
/// not be used from inside an async runtime.
#[derive(Debug, Clone)]
pub struct ArbiterHandle {
    tx: mpsc::UnboundedSender<ControlRequest>,
}

impl ArbiterHandle {
    pub(crate) fn new(tx: mpsc::UnboundedSender<ControlRequest>) -> Self {
        Self { tx }
    }

    /// Send a call and wait for its reply.
    pub fn call(&self, target: impl Into<Target>, command: &str, args: Payload) -> Result<Payload> {
        let (reply, rx) = oneshot::channel();
        self.submit(ControlRequest::Call {
            target: target.into(),
            command: command.to_string(),
            args,
            reply,
        })?;
        match rx.blocking_recv() {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(failure)) => Err(Error::Remote(failure)),
            Err(_) => Err(gone()),
        }
    }

    pub fn cast(&self, target: impl Into<Target>, command: &str, args: Payload) -> Result<()> {
        self.submit(ControlRequest::Cast {
            target: target.into(),
            command: command.to_string(),
            args,
        })
    }

    pub fn snapshot(&self) -> Result<ArbiterSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.submit(ControlRequest::Snapshot { reply })?;
        rx.blocking_recv().map_err(|_| gone())
    }

    /// Block until every declared component is running.
    ///
    /// Fails if startup fails or the arbiter goes away first.
    pub fn wait_running(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.submit(ControlRequest::WaitRunning { reply })?;
        match rx.blocking_recv() {
            Ok(result) => result.map_err(Error::Remote),
            Err(_) => Err(gone()),
        }
    }

    /// Graceful shutdown: members drain, stragglers are killed after the grace period.
    pub fn stop(&self) -> Result<()> {
        self.submit(ControlRequest::Stop { abrupt: false })
    }

    /// Kill every member immediately.
    pub fn kill(&self) -> Result<()> {
        self.submit(ControlRequest::Stop { abrupt: true })
    }

    fn submit(&self, request: ControlRequest) -> Result<()> {
        self.tx.send(request).map_err(|_| gone())
    }
}

fn gone() -> Error {
    Error::peer_unavailable("arbiter is not running")
}
