//! The arbiter: root of the supervision tree.
//!
//! One per process. It owns the monitors and top-level actors declared before
//! [`Arbiter::run`], relays envelopes between members, and turns monitor
//! decisions into spawns and kills. Other threads talk to it through an
//! [`ArbiterHandle`].
//!
//! In process mode the same binary is re-executed for every member. Calling
//! `run` inside such a child serves the one actor it was started for instead
//! of a second arbiter, so `main` must declare the same components either way.

mod core;
mod handle;
mod signals;

pub use handle::{ArbiterHandle, ArbiterPhase, ArbiterSnapshot, Target};

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;

use crate::actor::spawn::{run_worker, WorkerEnv};
use crate::actor::ExitStatus;
use crate::monitor::{ActorSpec, Monitor, MonitorSpec};
use crate::types::{ActorIdentity, Config, Error, Result};
use handle::ControlRequest;

static ARBITER_ACTIVE: AtomicBool = AtomicBool::new(false);

/// Held by the live arbiter; releases the process-wide slot on drop.
struct SingletonGuard;

impl SingletonGuard {
    fn acquire() -> Result<Self> {
        ARBITER_ACTIVE
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| SingletonGuard)
            .map_err(|_| {
                Error::SingletonViolation("an arbiter already exists in this process".to_string())
            })
    }
}

impl Drop for SingletonGuard {
    fn drop(&mut self) {
        ARBITER_ACTIVE.store(false, Ordering::Release);
    }
}

pub struct Arbiter {
    config: Config,
    identity: ActorIdentity,
    components: Vec<Monitor>,
    control_tx: mpsc::UnboundedSender<ControlRequest>,
    control_rx: mpsc::UnboundedReceiver<ControlRequest>,
    _guard: SingletonGuard,
}

impl Arbiter {
    /// Claim the process-wide arbiter slot.
    ///
    /// Fails with [`Error::SingletonViolation`] while another arbiter exists.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let guard = SingletonGuard::acquire()?;
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        Ok(Self {
            config,
            identity: ActorIdentity::arbiter(),
            components: Vec::new(),
            control_tx,
            control_rx,
            _guard: guard,
        })
    }

    pub fn identity(&self) -> &ActorIdentity {
        &self.identity
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Declare a pool. Components start in declaration order.
    pub fn add_monitor(&mut self, spec: MonitorSpec) -> Result<()> {
        spec.validate()?;
        self.declare(Monitor::new(spec))
    }

    /// Declare a single supervised actor.
    pub fn add_actor(&mut self, spec: ActorSpec) -> Result<()> {
        let monitor = Monitor::standalone(spec);
        monitor.spec().validate()?;
        self.declare(monitor)
    }

    fn declare(&mut self, monitor: Monitor) -> Result<()> {
        if monitor.name() == self.identity.name {
            return Err(Error::validation(format!(
                "component name '{}' is reserved",
                monitor.name()
            )));
        }
        if self.components.iter().any(|m| m.name() == monitor.name()) {
            return Err(Error::validation(format!(
                "duplicate component name '{}'",
                monitor.name()
            )));
        }
        self.components.push(monitor);
        Ok(())
    }

    /// Control handle usable from any thread, before or during `run`.
    pub fn handle(&self) -> ArbiterHandle {
        ArbiterHandle::new(self.control_tx.clone())
    }

    /// Serve until shutdown and report how it ended.
    ///
    /// Blocks the calling thread. Inside a worker process this serves the
    /// member the parent arbiter asked for and returns its exit status.
    pub fn run(self) -> Result<ExitStatus> {
        if let Some(worker) = WorkerEnv::from_env()? {
            let monitor = self
                .components
                .iter()
                .find(|m| m.name() == worker.identity.name)
                .ok_or_else(|| {
                    Error::not_found(format!(
                        "worker asked for undeclared component '{}'",
                        worker.identity.name
                    ))
                })?;
            let factory = monitor.spec().factory.clone();
            let span = tracing::info_span!("worker", member = %worker.identity);
            let _entered = span.enter();
            return Ok(run_worker(worker, &factory));
        }

        let Arbiter {
            config,
            identity,
            components,
            control_tx,
            control_rx,
            _guard,
        } = self;
        // the loop must not keep itself alive through its own sender
        drop(control_tx);
        let span = tracing::info_span!("arbiter", identity = %identity);
        let _entered = span.enter();
        self::core::run_arbiter(identity, config, components, control_rx)
    }
}

impl fmt::Debug for Arbiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arbiter")
            .field("identity", &self.identity)
            .field(
                "components",
                &self.components.iter().map(Monitor::name).collect::<Vec<_>>(),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::HandlerTable;
    use std::sync::Mutex;

    // the slot is process-wide; unit tests touching it must not overlap
    static SLOT: Mutex<()> = Mutex::new(());

    #[test]
    fn test_second_arbiter_is_rejected() {
        let _serial = SLOT.lock().unwrap_or_else(|e| e.into_inner());
        let first = Arbiter::new(Config::default()).unwrap();
        assert!(matches!(
            Arbiter::new(Config::default()),
            Err(Error::SingletonViolation(_))
        ));
        drop(first);
        assert!(Arbiter::new(Config::default()).is_ok());
    }

    #[test]
    fn test_component_names_are_unique() {
        let _serial = SLOT.lock().unwrap_or_else(|e| e.into_inner());
        let mut arbiter = Arbiter::new(Config::default()).unwrap();
        arbiter
            .add_monitor(MonitorSpec::new("echo", HandlerTable::new))
            .unwrap();
        let err = arbiter
            .add_actor(ActorSpec::new("echo", HandlerTable::new))
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(arbiter
            .add_monitor(MonitorSpec::new("arbiter", HandlerTable::new))
            .is_err());
    }

    #[test]
    fn test_invalid_spec_is_rejected() {
        let _serial = SLOT.lock().unwrap_or_else(|e| e.into_inner());
        let mut arbiter = Arbiter::new(Config::default()).unwrap();
        assert!(arbiter
            .add_monitor(MonitorSpec::new("empty", HandlerTable::new).pool_size(0))
            .is_err());
    }

    #[test]
    fn test_run_without_components_stops_on_request() {
        let _serial = SLOT.lock().unwrap_or_else(|e| e.into_inner());
        let mut config = Config::default();
        config.arbiter.install_signal_handlers = false;
        let arbiter = Arbiter::new(config).unwrap();
        let handle = arbiter.handle();
        let runner = std::thread::spawn(move || arbiter.run());

        handle.wait_running().unwrap();
        assert_eq!(
            handle.call(Target::Arbiter, "ping", serde_json::Value::Null).unwrap(),
            serde_json::json!("pong")
        );
        handle.stop().unwrap();
        let status = runner.join().unwrap().unwrap();
        assert_eq!(status, ExitStatus::Graceful);
    }
}
