//! Actors: isolated units of computation with one event loop and one mailbox.
//!
//! - [`handlers`]: `HandlerTable`, `Request`, built-in commands
//! - [`context`]: what a handler can do (`call`, `cast`, `get_actor`, `stop`)
//! - [`runtime`]: the lifecycle state machine and dispatch
//! - [`spawn`]: hosting an actor on an OS thread or a child process
//! - [`recovery`]: panic containment at the dispatch boundary

mod context;
mod handlers;
mod recovery;
mod runtime;
pub(crate) mod spawn;

pub use context::ActorContext;
pub use handlers::{
    BuiltinCommand, FailurePolicy, Handler, HandlerTable, Request, StartHook, StopHook,
};
pub use recovery::with_recovery;
pub use runtime::ActorStatus;
pub(crate) use runtime::ActorSettings;
pub use spawn::is_worker_process;

use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Builds a fresh handler table on the actor's own thread.
pub type ActorFactory = Arc<dyn Fn() -> HandlerTable + Send + Sync>;

/// How an actor (or the whole arbiter) ended. Ordered from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExitStatus {
    /// Drained and stopped on request.
    Graceful,
    /// Grace period exceeded, or killed.
    Forced,
    /// Startup failure, fatal handler error, or exhausted restart budget.
    Failed,
}

impl ExitStatus {
    /// Process exit code.
    pub fn code(self) -> i32 {
        match self {
            ExitStatus::Graceful => 0,
            ExitStatus::Forced => 1,
            ExitStatus::Failed => 2,
        }
    }

    /// Map a child's exit code; `None` (killed by a signal) counts as failed.
    pub fn from_code(code: Option<i32>) -> Self {
        match code {
            Some(0) => ExitStatus::Graceful,
            Some(1) => ExitStatus::Forced,
            _ => ExitStatus::Failed,
        }
    }

    pub fn is_graceful(self) -> bool {
        self == ExitStatus::Graceful
    }

    /// The worse of two statuses.
    pub fn worst(self, other: ExitStatus) -> ExitStatus {
        self.max(other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_round_trip() {
        for status in [ExitStatus::Graceful, ExitStatus::Forced, ExitStatus::Failed] {
            assert_eq!(ExitStatus::from_code(Some(status.code())), status);
        }
        assert_eq!(ExitStatus::from_code(None), ExitStatus::Failed);
        assert_eq!(ExitStatus::from_code(Some(137)), ExitStatus::Failed);
    }

    #[test]
    fn test_worst_prefers_failure() {
        assert_eq!(ExitStatus::Graceful.worst(ExitStatus::Forced), ExitStatus::Forced);
        assert_eq!(ExitStatus::Failed.worst(ExitStatus::Forced), ExitStatus::Failed);
        assert!(ExitStatus::Graceful.is_graceful());
    }
}
