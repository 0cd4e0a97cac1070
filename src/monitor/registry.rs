//! Member registry owned by a single monitor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::mailbox::ActorProxy;
use crate::types::{ActorId, ActorIdentity};

/// Lifecycle of a pool member as seen by its monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberStatus {
    Starting,
    Running,
    Stopping,
    Terminated,
}

/// Why the runtime is taking a member down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExitIntent {
    /// Not requested: the exit status decides.
    Unrequested,
    /// Stopped or killed on request; replaced without touching the restart budget.
    Replace,
    /// Killed for missing heartbeats; counts as a crash.
    Crash,
    /// Part of a monitor or arbiter shutdown; never replaced.
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct MemberRecord {
    pub proxy: ActorProxy,
    pub spawn_time: DateTime<Utc>,
    /// Restarts the monitor had performed when this member was spawned.
    pub restart_count: u32,
    pub status: MemberStatus,
    pub last_heartbeat: Instant,
    pub(crate) intent: ExitIntent,
}

impl MemberRecord {
    pub(crate) fn new(proxy: ActorProxy, restart_count: u32, now: Instant) -> Self {
        Self {
            proxy,
            spawn_time: Utc::now(),
            restart_count,
            status: MemberStatus::Starting,
            last_heartbeat: now,
            intent: ExitIntent::Unrequested,
        }
    }

    pub fn aid(&self) -> &ActorId {
        &self.proxy.identity.aid
    }

    pub fn snapshot(&self) -> MemberSnapshot {
        MemberSnapshot {
            identity: self.proxy.identity.clone(),
            status: self.status,
            restart_count: self.restart_count,
            spawn_time: self.spawn_time,
        }
    }
}

/// Serializable view of a member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberSnapshot {
    pub identity: ActorIdentity,
    pub status: MemberStatus,
    pub restart_count: u32,
    pub spawn_time: DateTime<Utc>,
}

/// Members in spawn order.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    members: Vec<MemberRecord>,
}

impl Registry {
    pub(crate) fn insert(&mut self, record: MemberRecord) {
        self.members.push(record);
    }

    pub fn get(&self, aid: &ActorId) -> Option<&MemberRecord> {
        self.members.iter().find(|m| m.aid() == aid)
    }

    pub(crate) fn get_mut(&mut self, aid: &ActorId) -> Option<&mut MemberRecord> {
        self.members.iter_mut().find(|m| m.aid() == aid)
    }

    pub(crate) fn remove(&mut self, aid: &ActorId) -> Option<MemberRecord> {
        let index = self.members.iter().position(|m| m.aid() == aid)?;
        Some(self.members.remove(index))
    }

    pub fn iter(&self) -> impl Iterator<Item = &MemberRecord> {
        self.members.iter()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut MemberRecord> {
        self.members.iter_mut()
    }

    pub fn running(&self) -> impl Iterator<Item = &MemberRecord> {
        self.members
            .iter()
            .filter(|m| m.status == MemberStatus::Running)
    }

    pub fn count(&self, status: MemberStatus) -> usize {
        self.members.iter().filter(|m| m.status == status).count()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ActorKind;

    fn record() -> MemberRecord {
        let proxy = ActorProxy::inproc(ActorIdentity::new(ActorKind::Actor, "pool"));
        MemberRecord::new(proxy, 0, Instant::now())
    }

    #[test]
    fn test_registry_keeps_spawn_order_and_removes_by_aid() {
        let mut registry = Registry::default();
        let (a, b, c) = (record(), record(), record());
        let (aid_a, aid_b, aid_c) = (a.aid().clone(), b.aid().clone(), c.aid().clone());
        registry.insert(a);
        registry.insert(b);
        registry.insert(c);

        assert!(registry.remove(&aid_b).is_some());
        assert!(registry.remove(&aid_b).is_none());
        let order: Vec<_> = registry.iter().map(|m| m.aid().clone()).collect();
        assert_eq!(order, vec![aid_a.clone(), aid_c]);

        registry.get_mut(&aid_a).unwrap().status = MemberStatus::Running;
        assert_eq!(registry.running().count(), 1);
        assert_eq!(registry.count(MemberStatus::Starting), 1);
    }

    #[test]
    fn test_snapshot_serializes_status_lowercase() {
        let snapshot = record().snapshot();
        let value = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(value["status"], "starting");
        assert_eq!(value["restart_count"], 0);
    }
}
