//! Monitor: supervisor of a homogeneous actor pool.
//!
//! A monitor is a state machine owned by the arbiter loop. It never touches
//! threads or processes itself; every event returns the [`MonitorAction`]s the
//! arbiter must carry out.
//!
//! ```text
//!   IDLE → STARTING ─(pool_size members running)→ RUNNING ─→ STOPPING → TERMINATED
//!              └──────────── restart budget spent ──────────→ FAILED
//! ```

mod policy;
mod registry;

pub use policy::{BackoffCurve, BackoffFn, RestartDecision, RestartHistory, RestartPolicy};
pub(crate) use registry::ExitIntent;
pub use registry::{MemberRecord, MemberSnapshot, MemberStatus, Registry};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::actor::{ActorFactory, ExitStatus, HandlerTable};
use crate::mailbox::ActorProxy;
use crate::types::{
    ActorId, ActorIdentity, ActorKind, Concurrency, Error, Failure, FailureKind, MonitorConfig,
    Result,
};

/// Declaration of a pool.
#[derive(Clone)]
pub struct MonitorSpec {
    pub name: String,
    pub factory: ActorFactory,
    pub config: MonitorConfig,
    /// Overrides the policy's backoff curve when set.
    pub backoff_fn: Option<BackoffFn>,
}

impl MonitorSpec {
    pub fn new<F>(name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> HandlerTable + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            factory: Arc::new(factory),
            config: MonitorConfig::default(),
            backoff_fn: None,
        }
    }

    pub fn with_config(mut self, config: MonitorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn pool_size(mut self, pool_size: usize) -> Self {
        self.config.pool_size = pool_size;
        self
    }

    pub fn concurrency(mut self, concurrency: Concurrency) -> Self {
        self.config.concurrency = concurrency;
        self
    }

    pub fn restart_policy(mut self, policy: RestartPolicy) -> Self {
        self.config.restart_policy = policy;
        self
    }

    pub fn backoff_fn<F>(mut self, backoff: F) -> Self
    where
        F: Fn(u32, Duration) -> Duration + Send + Sync + 'static,
    {
        self.backoff_fn = Some(Arc::new(backoff));
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::validation("monitor name must not be empty"));
        }
        self.config.validate()
    }
}

impl fmt::Debug for MonitorSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MonitorSpec")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("backoff_fn", &self.backoff_fn.is_some())
            .finish()
    }
}

/// Declaration of a single top-level actor.
///
/// Hosted as a one-member monitor that never restarts; `get_actor` resolves
/// its name to the actor itself rather than to the monitor.
#[derive(Clone)]
pub struct ActorSpec {
    pub name: String,
    pub factory: ActorFactory,
    pub concurrency: Concurrency,
}

impl ActorSpec {
    pub fn new<F>(name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> HandlerTable + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            factory: Arc::new(factory),
            concurrency: Concurrency::default(),
        }
    }

    pub fn concurrency(mut self, concurrency: Concurrency) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub(crate) fn into_monitor_spec(self) -> MonitorSpec {
        MonitorSpec {
            name: self.name,
            factory: self.factory,
            config: MonitorConfig {
                concurrency: self.concurrency,
                pool_size: 1,
                restart_policy: RestartPolicy::Never,
            },
            backoff_fn: None,
        }
    }
}

impl fmt::Debug for ActorSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActorSpec")
            .field("name", &self.name)
            .field("concurrency", &self.concurrency)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorStatus {
    Idle,
    Starting,
    Running,
    Stopping,
    Terminated,
    Failed,
}

/// Work the arbiter performs on behalf of a monitor.
#[derive(Debug, Clone, PartialEq)]
pub enum MonitorAction {
    /// Spawn one member after `delay`. `restart` marks a crash replacement.
    Spawn { delay: Duration, restart: bool },
    /// Forcibly terminate a member.
    Kill(ActorId),
    /// The monitor gave up; its members are being killed.
    Failed(Failure),
}

/// Serializable view of a monitor (or top-level actor) and its members.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentSnapshot {
    pub identity: ActorIdentity,
    pub standalone: bool,
    pub status: MonitorStatus,
    pub concurrency: Concurrency,
    pub pool_size: usize,
    pub restarts: u32,
    pub members: Vec<MemberSnapshot>,
}

pub struct Monitor {
    identity: ActorIdentity,
    spec: MonitorSpec,
    standalone: bool,
    status: MonitorStatus,
    registry: Registry,
    history: RestartHistory,
    restarts: u32,
    next_pick: usize,
}

impl Monitor {
    pub fn new(spec: MonitorSpec) -> Self {
        Self::build(spec, false)
    }

    pub(crate) fn standalone(spec: ActorSpec) -> Self {
        Self::build(spec.into_monitor_spec(), true)
    }

    fn build(spec: MonitorSpec, standalone: bool) -> Self {
        Self {
            identity: ActorIdentity::new(ActorKind::Monitor, spec.name.clone()),
            spec,
            standalone,
            status: MonitorStatus::Idle,
            registry: Registry::default(),
            history: RestartHistory::default(),
            restarts: 0,
            next_pick: 0,
        }
    }

    pub fn identity(&self) -> &ActorIdentity {
        &self.identity
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &MonitorSpec {
        &self.spec
    }

    pub fn status(&self) -> MonitorStatus {
        self.status
    }

    pub fn is_standalone(&self) -> bool {
        self.standalone
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    pub fn contains(&self, aid: &ActorId) -> bool {
        self.registry.get(aid).is_some()
    }

    /// Whether new members may still be admitted.
    pub fn accepts_spawns(&self) -> bool {
        matches!(self.status, MonitorStatus::Starting | MonitorStatus::Running)
    }

    /// Gone for good: terminated or failed.
    pub fn is_down(&self) -> bool {
        matches!(self.status, MonitorStatus::Terminated | MonitorStatus::Failed)
    }

    /// Down with every member reaped.
    pub fn is_finished(&self) -> bool {
        self.is_down() && self.registry.is_empty()
    }

    /// Request the initial pool.
    pub fn start(&mut self) -> Vec<MonitorAction> {
        self.status = MonitorStatus::Starting;
        let config = &self.spec.config;
        tracing::info!(
            "monitor_starting: name={}, pool_size={}, concurrency={:?}, restart_policy={}",
            self.spec.name,
            config.pool_size,
            config.concurrency,
            config.restart_policy
        );
        (0..config.pool_size)
            .map(|_| MonitorAction::Spawn {
                delay: Duration::ZERO,
                restart: false,
            })
            .collect()
    }

    /// Record a member the arbiter has just spawned.
    pub fn admit(&mut self, proxy: ActorProxy, now: Instant) {
        tracing::debug!(
            "member_admitted: monitor={}, member={}",
            self.spec.name,
            proxy.identity
        );
        self.registry
            .insert(MemberRecord::new(proxy, self.restarts, now));
    }

    /// A `notify` arrived from `aid`. Returns `true` if the member just became running.
    pub fn on_heartbeat(&mut self, aid: &ActorId, running: bool, now: Instant) -> bool {
        let Some(member) = self.registry.get_mut(aid) else {
            return false;
        };
        member.last_heartbeat = now;
        if !running || member.status != MemberStatus::Starting {
            return false;
        }
        member.status = MemberStatus::Running;
        tracing::info!(
            "member_running: monitor={}, member={}",
            self.spec.name,
            member.proxy.identity
        );
        if self.status == MonitorStatus::Starting
            && self.registry.count(MemberStatus::Running) >= self.spec.config.pool_size
        {
            self.status = MonitorStatus::Running;
            tracing::info!("monitor_running: name={}", self.spec.name);
        }
        true
    }

    /// A member's thread or process ended.
    pub fn on_exit(&mut self, aid: &ActorId, exit: ExitStatus, now: Instant) -> Vec<MonitorAction> {
        let Some(record) = self.registry.remove(aid) else {
            return Vec::new();
        };
        tracing::info!(
            "member_exited: monitor={}, member={}, exit={:?}, intent={:?}",
            self.spec.name,
            record.proxy.identity,
            exit,
            record.intent
        );

        if !self.accepts_spawns() || record.intent == ExitIntent::Shutdown {
            self.settle_if_drained();
            return Vec::new();
        }

        let crashed = match record.intent {
            ExitIntent::Crash => true,
            ExitIntent::Unrequested => !exit.is_graceful(),
            ExitIntent::Replace | ExitIntent::Shutdown => false,
        };

        if !crashed {
            if record.intent == ExitIntent::Unrequested
                && self.spec.config.restart_policy == RestartPolicy::Never
            {
                tracing::info!(
                    "member_slot_released: monitor={}, restart_policy=never",
                    self.spec.name
                );
                if self.standalone {
                    // a top-level actor that stopped itself is done
                    self.status = MonitorStatus::Terminated;
                }
                return Vec::new();
            }
            return vec![MonitorAction::Spawn {
                delay: Duration::ZERO,
                restart: false,
            }];
        }

        let decision = self.spec.config.restart_policy.decide(
            &mut self.history,
            now,
            self.spec.backoff_fn.as_ref(),
        );
        match decision {
            RestartDecision::Restart { delay, attempt } => {
                self.restarts += 1;
                tracing::warn!(
                    "member_crashed: monitor={}, exit={:?}, restart_in={:?}, attempt={}",
                    self.spec.name,
                    exit,
                    delay,
                    attempt
                );
                vec![MonitorAction::Spawn {
                    delay,
                    restart: true,
                }]
            }
            RestartDecision::GiveUp => {
                tracing::warn!(
                    "member_crashed: monitor={}, exit={:?}, restart_policy=never",
                    self.spec.name,
                    exit
                );
                if self.standalone && self.registry.is_empty() {
                    self.status = MonitorStatus::Terminated;
                }
                Vec::new()
            }
            RestartDecision::Exhausted { restarts } => {
                self.status = MonitorStatus::Failed;
                let failure = Failure::new(
                    FailureKind::RestartExhausted,
                    format!(
                        "monitor '{}' exceeded its restart budget ({} restarts in window)",
                        self.spec.name, restarts
                    ),
                );
                tracing::error!("monitor_failed: name={}, error={}", self.spec.name, failure);
                let mut actions: Vec<MonitorAction> = self
                    .registry
                    .iter_mut()
                    .map(|member| {
                        member.intent = ExitIntent::Shutdown;
                        member.status = MemberStatus::Stopping;
                        MonitorAction::Kill(member.aid().clone())
                    })
                    .collect();
                actions.push(MonitorAction::Failed(failure));
                actions
            }
        }
    }

    /// Kill members silent for longer than `timeout`.
    pub fn sweep(&mut self, now: Instant, timeout: Duration) -> Vec<MonitorAction> {
        if !self.accepts_spawns() {
            return Vec::new();
        }
        let name = &self.spec.name;
        self.registry
            .iter_mut()
            .filter(|member| {
                matches!(member.status, MemberStatus::Starting | MemberStatus::Running)
                    && now.saturating_duration_since(member.last_heartbeat) > timeout
            })
            .map(|member| {
                tracing::warn!(
                    "heartbeat_timeout: monitor={}, member={}",
                    name,
                    member.proxy.identity
                );
                member.intent = ExitIntent::Crash;
                member.status = MemberStatus::Stopping;
                MonitorAction::Kill(member.aid().clone())
            })
            .collect()
    }

    /// Mark a member for replacement ahead of a requested stop or kill.
    pub fn request_replace(&mut self, aid: &ActorId) -> bool {
        match self.registry.get_mut(aid) {
            Some(member)
                if matches!(member.status, MemberStatus::Starting | MemberStatus::Running) =>
            {
                member.intent = ExitIntent::Replace;
                member.status = MemberStatus::Stopping;
                true
            }
            _ => false,
        }
    }

    /// Stop admitting and replacing; returns the members to stop.
    pub fn begin_shutdown(&mut self) -> Vec<ActorId> {
        if self.status != MonitorStatus::Failed && self.status != MonitorStatus::Terminated {
            self.status = MonitorStatus::Stopping;
        }
        let aids = self
            .registry
            .iter_mut()
            .map(|member| {
                member.intent = ExitIntent::Shutdown;
                member.status = MemberStatus::Stopping;
                member.aid().clone()
            })
            .collect();
        self.settle_if_drained();
        aids
    }

    fn settle_if_drained(&mut self) {
        if self.status == MonitorStatus::Stopping && self.registry.is_empty() {
            self.status = MonitorStatus::Terminated;
            tracing::info!("monitor_terminated: name={}", self.spec.name);
        }
    }

    /// Next running member, round-robin.
    pub fn pick(&mut self) -> Option<ActorIdentity> {
        let running = self.registry.running().count();
        if running == 0 {
            return None;
        }
        let index = self.next_pick % running;
        self.next_pick = self.next_pick.wrapping_add(1);
        self.registry
            .running()
            .nth(index)
            .map(|member| member.proxy.identity.clone())
    }

    pub fn snapshot(&self) -> ComponentSnapshot {
        ComponentSnapshot {
            identity: self.identity.clone(),
            standalone: self.standalone,
            status: self.status,
            concurrency: self.spec.config.concurrency,
            pool_size: self.spec.config.pool_size,
            restarts: self.restarts,
            members: self.registry.iter().map(MemberRecord::snapshot).collect(),
        }
    }
}

impl fmt::Debug for Monitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Monitor")
            .field("identity", &self.identity)
            .field("status", &self.status)
            .field("members", &self.registry.len())
            .field("restarts", &self.restarts)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn spec(pool_size: usize, policy: RestartPolicy) -> MonitorSpec {
        MonitorSpec::new("pool", HandlerTable::new)
            .pool_size(pool_size)
            .restart_policy(policy)
    }

    /// Execute spawn actions the way the arbiter would; returns the new aids.
    fn apply(monitor: &mut Monitor, actions: &[MonitorAction], now: Instant) -> Vec<ActorId> {
        actions
            .iter()
            .filter(|a| matches!(a, MonitorAction::Spawn { .. }))
            .map(|_| {
                let proxy = ActorProxy::inproc(ActorIdentity::new(ActorKind::Actor, "pool"));
                let aid = proxy.identity.aid.clone();
                monitor.admit(proxy, now);
                monitor.on_heartbeat(&aid, true, now);
                aid
            })
            .collect()
    }

    #[test]
    fn test_pool_reaches_running_only_when_full() {
        let mut monitor = Monitor::new(spec(2, RestartPolicy::Always));
        let now = Instant::now();
        let actions = monitor.start();
        assert_eq!(actions.len(), 2);
        assert_eq!(monitor.status(), MonitorStatus::Starting);

        let proxy = ActorProxy::inproc(ActorIdentity::new(ActorKind::Actor, "pool"));
        let first = proxy.identity.aid.clone();
        monitor.admit(proxy, now);
        assert!(monitor.on_heartbeat(&first, true, now));
        assert_eq!(monitor.status(), MonitorStatus::Starting);
        // a second running report is not a transition
        assert!(!monitor.on_heartbeat(&first, true, now));

        apply(&mut monitor, &actions[1..], now);
        assert_eq!(monitor.status(), MonitorStatus::Running);
    }

    #[test]
    fn test_always_replaces_crashed_member_with_fresh_identity() {
        let mut monitor = Monitor::new(spec(2, RestartPolicy::Always));
        let now = Instant::now();
        let start = monitor.start();
        let aids = apply(&mut monitor, &start, now);

        let actions = monitor.on_exit(&aids[0], ExitStatus::Failed, now);
        assert_eq!(
            actions,
            vec![MonitorAction::Spawn { delay: Duration::ZERO, restart: true }]
        );
        let replacement = apply(&mut monitor, &actions, now);

        let running: Vec<ActorId> = monitor.registry().running().map(|m| m.aid().clone()).collect();
        assert_eq!(running.len(), 2);
        assert!(!running.contains(&aids[0]));
        assert!(running.contains(&replacement[0]));
        assert_eq!(monitor.restarts(), 1);
        assert_eq!(monitor.registry().get(&replacement[0]).unwrap().restart_count, 1);
    }

    #[test]
    fn test_backoff_three_crashes_four_times_then_fails() {
        let mut monitor = Monitor::new(spec(1, RestartPolicy::backoff(3, Duration::from_millis(5))));
        let now = Instant::now();
        let start = monitor.start();
        let mut current = apply(&mut monitor, &start, now)[0].clone();

        let mut spawned = 0;
        for crash in 0..4 {
            let actions = monitor.on_exit(&current, ExitStatus::Failed, now);
            if crash < 3 {
                assert!(matches!(actions[..], [MonitorAction::Spawn { restart: true, .. }]));
                spawned += 1;
                current = apply(&mut monitor, &actions, now)[0].clone();
            } else {
                assert!(matches!(
                    actions.last(),
                    Some(MonitorAction::Failed(f)) if f.kind == FailureKind::RestartExhausted
                ));
            }
        }
        assert_eq!(spawned, 3);
        assert_eq!(monitor.status(), MonitorStatus::Failed);
        assert!(monitor.is_finished());
    }

    #[test]
    fn test_requested_replacement_does_not_spend_budget() {
        let mut monitor = Monitor::new(spec(1, RestartPolicy::backoff(0, Duration::ZERO)));
        let now = Instant::now();
        let start = monitor.start();
        let aid = apply(&mut monitor, &start, now)[0].clone();

        assert!(monitor.request_replace(&aid));
        let actions = monitor.on_exit(&aid, ExitStatus::Forced, now);
        assert_eq!(
            actions,
            vec![MonitorAction::Spawn { delay: Duration::ZERO, restart: false }]
        );
        assert_eq!(monitor.restarts(), 0);
        assert_eq!(monitor.status(), MonitorStatus::Running);
    }

    #[test]
    fn test_graceful_unrequested_exit_is_replaced_without_spending_budget() {
        let mut monitor = Monitor::new(spec(1, RestartPolicy::backoff(0, Duration::ZERO)));
        let now = Instant::now();
        let start = monitor.start();
        let aid = apply(&mut monitor, &start, now)[0].clone();
        let actions = monitor.on_exit(&aid, ExitStatus::Graceful, now);
        assert_eq!(
            actions,
            vec![MonitorAction::Spawn { delay: Duration::ZERO, restart: false }]
        );
        assert_eq!(monitor.restarts(), 0);
        assert_eq!(monitor.status(), MonitorStatus::Running);
    }

    #[test]
    fn test_never_leaves_slot_of_self_stopped_member_empty() {
        let mut monitor = Monitor::new(spec(2, RestartPolicy::Never));
        let now = Instant::now();
        let start = monitor.start();
        let aids = apply(&mut monitor, &start, now);

        assert!(monitor.on_exit(&aids[0], ExitStatus::Graceful, now).is_empty());
        assert_eq!(monitor.registry().len(), 1);
        assert_eq!(monitor.status(), MonitorStatus::Running);

        // a requested replacement is still honoured under Never
        assert!(monitor.request_replace(&aids[1]));
        assert_eq!(monitor.on_exit(&aids[1], ExitStatus::Graceful, now).len(), 1);
    }

    #[test]
    fn test_round_robin_over_running_members() {
        let mut monitor = Monitor::new(spec(3, RestartPolicy::Always));
        let now = Instant::now();
        let start = monitor.start();
        let aids = apply(&mut monitor, &start, now);

        let picks: Vec<ActorId> = (0..6).map(|_| monitor.pick().unwrap().aid).collect();
        assert_eq!(&picks[..3], &aids[..]);
        assert_eq!(&picks[3..], &aids[..]);

        for aid in &aids {
            monitor.request_replace(aid);
        }
        assert!(monitor.pick().is_none());
    }

    #[test]
    fn test_sweep_kills_silent_members_as_crashes() {
        let mut monitor = Monitor::new(spec(2, RestartPolicy::Always));
        let start_time = Instant::now();
        let start = monitor.start();
        let aids = apply(&mut monitor, &start, start_time);

        let later = start_time + Duration::from_secs(10);
        monitor.on_heartbeat(&aids[1], true, later);
        let actions = monitor.sweep(later, Duration::from_secs(5));
        assert_eq!(actions, vec![MonitorAction::Kill(aids[0].clone())]);

        let replaced = monitor.on_exit(&aids[0], ExitStatus::Forced, later);
        assert!(matches!(replaced[..], [MonitorAction::Spawn { restart: true, .. }]));
    }

    #[test]
    fn test_shutdown_drains_without_replacing() {
        let mut monitor = Monitor::new(spec(2, RestartPolicy::Always));
        let now = Instant::now();
        let start = monitor.start();
        let aids = apply(&mut monitor, &start, now);

        assert_eq!(monitor.begin_shutdown(), aids);
        assert_eq!(monitor.status(), MonitorStatus::Stopping);
        assert!(monitor.on_exit(&aids[0], ExitStatus::Graceful, now).is_empty());
        assert!(monitor.on_exit(&aids[1], ExitStatus::Forced, now).is_empty());
        assert_eq!(monitor.status(), MonitorStatus::Terminated);
        assert!(monitor.is_finished());
    }

    #[test]
    fn test_standalone_actor_is_not_restarted() {
        let mut monitor = Monitor::standalone(ActorSpec::new("solo", HandlerTable::new));
        let now = Instant::now();
        let start = monitor.start();
        assert_eq!(start.len(), 1);
        let aid = apply(&mut monitor, &start, now)[0].clone();
        assert!(monitor.on_exit(&aid, ExitStatus::Failed, now).is_empty());
        assert_eq!(monitor.status(), MonitorStatus::Terminated);
        assert!(monitor.is_standalone());
    }

    #[test]
    fn test_spec_validation() {
        assert!(spec(0, RestartPolicy::Always).validate().is_err());
        assert!(MonitorSpec::new(" ", HandlerTable::new).validate().is_err());
        assert!(spec(1, RestartPolicy::Never).validate().is_ok());
    }
}
