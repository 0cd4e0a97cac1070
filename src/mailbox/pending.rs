//! Pending-reply table for outstanding `call`s.
//!
//! Every entry is removed exactly once: by its reply, by its timeout timer, or
//! by a peer-loss sweep. Whichever comes first settles the deferred; the others
//! find nothing to do.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use crate::event_loop::{Deferred, EventLoop, TimerHandle};
use crate::types::{ActorId, CorrelationId, Failure, Payload};

struct PendingCall {
    peer: ActorId,
    deferred: Deferred<Payload>,
    timer: TimerHandle,
}

/// Correlation-id keyed table of calls awaiting a reply.
#[derive(Clone)]
pub struct PendingReplies {
    entries: Rc<RefCell<HashMap<CorrelationId, PendingCall>>>,
    event_loop: EventLoop,
}

impl PendingReplies {
    pub fn new(event_loop: &EventLoop) -> Self {
        Self {
            entries: Rc::new(RefCell::new(HashMap::new())),
            event_loop: event_loop.clone(),
        }
    }

    /// Open a new call to `peer`; the returned deferred settles with the reply,
    /// or with a `timeout` failure after `timeout`.
    pub fn register(
        &self,
        peer: &ActorId,
        command: &str,
        timeout: Duration,
    ) -> (CorrelationId, Deferred<Payload>) {
        let correlation_id = CorrelationId::new();
        let deferred = Deferred::new(&self.event_loop);

        let entries = self.entries.clone();
        let expired_id = correlation_id.clone();
        let command = command.to_string();
        let timer = self.event_loop.call_later(timeout, move || {
            let expired = entries.borrow_mut().remove(&expired_id);
            if let Some(call) = expired {
                tracing::debug!(
                    "call_timed_out: command={}, peer={}, correlation_id={}",
                    command,
                    call.peer.short(),
                    expired_id.short()
                );
                call.deferred.reject(Failure::timeout(format!(
                    "no reply to '{}' within {:?}",
                    command, timeout
                )));
            }
        });

        self.entries.borrow_mut().insert(
            correlation_id.clone(),
            PendingCall {
                peer: peer.clone(),
                deferred: deferred.clone(),
                timer,
            },
        );
        (correlation_id, deferred)
    }

    /// Settle the call with a reply. Returns `false` for unknown (late) ids.
    pub fn settle(&self, correlation_id: &CorrelationId, reply: Result<Payload, Failure>) -> bool {
        let call = self.entries.borrow_mut().remove(correlation_id);
        match call {
            Some(call) => {
                call.timer.cancel();
                match reply {
                    Ok(value) => call.deferred.resolve(value),
                    Err(failure) => call.deferred.reject(failure),
                };
                true
            }
            None => false,
        }
    }

    /// Reject every call outstanding against `peer`.
    pub fn fail_peer(&self, peer: &ActorId, failure: &Failure) -> usize {
        let lost: Vec<PendingCall> = {
            let mut entries = self.entries.borrow_mut();
            let ids: Vec<CorrelationId> = entries
                .iter()
                .filter(|(_, call)| &call.peer == peer)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| entries.remove(id)).collect()
        };
        Self::reject_all(lost, failure)
    }

    /// Reject every outstanding call.
    pub fn fail_all(&self, failure: &Failure) -> usize {
        let lost: Vec<PendingCall> = self
            .entries
            .borrow_mut()
            .drain()
            .map(|(_, call)| call)
            .collect();
        Self::reject_all(lost, failure)
    }

    fn reject_all(lost: Vec<PendingCall>, failure: &Failure) -> usize {
        let count = lost.len();
        for call in lost {
            call.timer.cancel();
            call.deferred.reject(failure.clone());
        }
        count
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    pub fn contains(&self, correlation_id: &CorrelationId) -> bool {
        self.entries.borrow().contains_key(correlation_id)
    }
}

impl std::fmt::Debug for PendingReplies {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingReplies")
            .field("outstanding", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::DeferredState;
    use crate::types::FailureKind;
    use serde_json::json;

    #[test]
    fn test_reply_settles_and_removes_entry() {
        let lp = EventLoop::new().unwrap();
        let table = PendingReplies::new(&lp);
        let peer = ActorId::new();
        let (id, deferred) = table.register(&peer, "ping", Duration::from_secs(5));
        assert!(table.contains(&id));

        assert!(table.settle(&id, Ok(json!("pong"))));
        assert!(table.is_empty());
        assert_eq!(lp.run_until_complete(&deferred).unwrap(), Ok(json!("pong")));

        // late duplicate reply is ignored
        assert!(!table.settle(&id, Ok(json!("again"))));
    }

    #[test]
    fn test_timeout_rejects_and_leaves_no_entry() {
        let lp = EventLoop::new().unwrap();
        let table = PendingReplies::new(&lp);
        let (id, deferred) = table.register(&ActorId::new(), "slow", Duration::from_millis(10));

        let failure = lp.run_until_complete(&deferred).unwrap().unwrap_err();
        assert_eq!(failure.kind, FailureKind::Timeout);
        assert!(!table.contains(&id));
        assert_eq!(table.len(), 0);

        // a reply arriving after the timeout is dropped
        assert!(!table.settle(&id, Ok(json!(1))));
    }

    #[test]
    fn test_fail_peer_only_touches_that_peer() {
        let lp = EventLoop::new().unwrap();
        let table = PendingReplies::new(&lp);
        let lost = ActorId::new();
        let alive = ActorId::new();
        let (_, d1) = table.register(&lost, "a", Duration::from_secs(5));
        let (_, d2) = table.register(&lost, "b", Duration::from_secs(5));
        let (_, d3) = table.register(&alive, "c", Duration::from_secs(5));

        let n = table.fail_peer(&lost, &Failure::peer_unavailable("gone"));
        assert_eq!(n, 2);
        assert_eq!(table.len(), 1);
        assert_eq!(d1.state(), DeferredState::Rejected);
        assert_eq!(d2.state(), DeferredState::Rejected);
        assert_eq!(d3.state(), DeferredState::Pending);

        assert_eq!(table.fail_all(&Failure::peer_unavailable("shutdown")), 1);
        assert!(table.is_empty());
    }
}
