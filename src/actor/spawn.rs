//! Hosting an actor on an OS thread or in a child process.
//!
//! Thread mode hands the actor one end of a socket pair. Process mode
//! re-executes the current binary with the worker environment below; the
//! child connects back to the arbiter's Unix socket and introduces itself
//! with a `hello` cast.

use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::sync::oneshot;

use super::recovery::with_recovery;
use super::runtime::{run_actor, ActorSettings};
use super::{ActorFactory, ExitStatus};
use crate::event_loop::EventLoop;
use crate::types::{ActorId, ActorIdentity, ActorKind, Config, Error, Result};

pub(crate) const ENV_WORKER_AID: &str = "PULSAR_WORKER_AID";
pub(crate) const ENV_WORKER_NAME: &str = "PULSAR_WORKER_NAME";
pub(crate) const ENV_WORKER_SOCKET: &str = "PULSAR_WORKER_SOCKET";
pub(crate) const ENV_ARBITER_AID: &str = "PULSAR_ARBITER_AID";
pub(crate) const ENV_WORKER_CONFIG: &str = "PULSAR_WORKER_CONFIG";

/// Whether this process was started by an arbiter to host one actor.
pub fn is_worker_process() -> bool {
    std::env::var_os(ENV_WORKER_AID).is_some()
}

/// Run `factory` and the actor it builds on a dedicated thread.
///
/// The receiver yields the exit status; it errors only if the thread died
/// outside the actor's own panic containment.
pub(crate) fn spawn_thread(
    identity: ActorIdentity,
    factory: ActorFactory,
    stream: UnixStream,
    settings: ActorSettings,
) -> Result<oneshot::Receiver<ExitStatus>> {
    let (tx, rx) = oneshot::channel();
    let thread_name = format!("pulsar-{}-{}", identity.name, identity.aid.short());
    std::thread::Builder::new()
        .name(thread_name)
        .spawn(move || {
            let status = match with_recovery(|| Ok(factory()), "factory") {
                Ok(table) => run_actor(identity, table, stream, settings),
                Err(_) => ExitStatus::Failed,
            };
            let _ = tx.send(status);
        })?;
    Ok(rx)
}

/// Start a child process hosting `identity`.
///
/// The child is the current executable with the same arguments, so its
/// `main` must declare the same components before calling
/// [`Arbiter::run`](crate::arbiter::Arbiter::run).
pub(crate) fn spawn_process(
    event_loop: &EventLoop,
    identity: &ActorIdentity,
    supervisor: &ActorIdentity,
    socket: &Path,
    config: &Config,
) -> Result<tokio::process::Child> {
    let exe = std::env::current_exe()?;
    let mut command = tokio::process::Command::new(exe);
    command
        .args(std::env::args_os().skip(1))
        .env(ENV_WORKER_AID, identity.aid.as_str())
        .env(ENV_WORKER_NAME, &identity.name)
        .env(ENV_WORKER_SOCKET, socket)
        .env(ENV_ARBITER_AID, supervisor.aid.as_str())
        .env(ENV_WORKER_CONFIG, serde_json::to_string(config)?)
        .stdin(Stdio::null())
        // terminal signals reach the arbiter only; it stops members itself
        .process_group(0)
        .kill_on_drop(true);

    let _guard = event_loop.enter();
    Ok(command.spawn()?)
}

/// Worker-side view of the environment set by [`spawn_process`].
#[derive(Debug, Clone)]
pub(crate) struct WorkerEnv {
    pub identity: ActorIdentity,
    pub supervisor: ActorIdentity,
    pub socket: PathBuf,
    pub config: Config,
}

impl WorkerEnv {
    /// `Ok(None)` outside a worker process.
    pub fn from_env() -> Result<Option<Self>> {
        let Some(aid) = std::env::var_os(ENV_WORKER_AID) else {
            return Ok(None);
        };
        let aid = parse_aid(aid.to_string_lossy().into_owned())?;
        let name = required(ENV_WORKER_NAME)?;
        let supervisor_aid = parse_aid(required(ENV_ARBITER_AID)?)?;
        let socket = PathBuf::from(required(ENV_WORKER_SOCKET)?);
        let config: Config = serde_json::from_str(&required(ENV_WORKER_CONFIG)?)?;

        Ok(Some(Self {
            identity: ActorIdentity {
                aid,
                kind: ActorKind::Actor,
                name,
            },
            supervisor: ActorIdentity {
                aid: supervisor_aid,
                kind: ActorKind::Arbiter,
                name: "arbiter".to_string(),
            },
            socket,
            config,
        }))
    }
}

/// Serve the actor described by `worker` until it terminates.
pub(crate) fn run_worker(worker: WorkerEnv, factory: &ActorFactory) -> ExitStatus {
    let stream = match UnixStream::connect(&worker.socket) {
        Ok(stream) => stream,
        Err(e) => {
            tracing::error!(
                "worker_connect_failed: socket={}, error={}",
                worker.socket.display(),
                e
            );
            return ExitStatus::Failed;
        }
    };
    let settings = ActorSettings::new(&worker.config, worker.supervisor, Some(worker.socket));
    match with_recovery(|| Ok(factory()), "factory") {
        Ok(table) => run_actor(worker.identity, table, stream, settings),
        Err(_) => ExitStatus::Failed,
    }
}

fn required(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| Error::validation(format!("worker environment lacks {}", key)))
}

fn parse_aid(raw: String) -> Result<ActorId> {
    ActorId::from_string(raw).map_err(|e| Error::validation(format!("invalid worker aid: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::HandlerTable;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_outside_worker_env_is_none() {
        if is_worker_process() {
            return;
        }
        assert!(WorkerEnv::from_env().unwrap().is_none());
    }

    #[test]
    fn test_spawn_thread_reports_exit_when_supervisor_drops() {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let identity = ActorIdentity::new(ActorKind::Actor, "short-lived");
        let settings = ActorSettings::new(&Config::default(), ActorIdentity::arbiter(), None);
        let factory: ActorFactory = Arc::new(HandlerTable::new);
        let rx = spawn_thread(identity, factory, theirs, settings).unwrap();

        std::thread::sleep(Duration::from_millis(50));
        drop(ours);
        assert_eq!(rx.blocking_recv().unwrap(), ExitStatus::Forced);
    }

    #[test]
    fn test_panicking_factory_fails_member() {
        let (_ours, theirs) = UnixStream::pair().unwrap();
        let identity = ActorIdentity::new(ActorKind::Actor, "broken");
        let settings = ActorSettings::new(&Config::default(), ActorIdentity::arbiter(), None);
        let factory: ActorFactory = Arc::new(|| -> HandlerTable { panic!("no table for you") });
        let rx = spawn_thread(identity, factory, theirs, settings).unwrap();
        assert_eq!(rx.blocking_recv().unwrap(), ExitStatus::Failed);
    }
}
