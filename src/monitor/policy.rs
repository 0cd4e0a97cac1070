//! Restart policies and backoff curves.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::types::{Error, Result};

/// User-supplied backoff: `(attempt, base_delay) -> delay`, attempt starting at 1.
pub type BackoffFn = Arc<dyn Fn(u32, Duration) -> Duration + Send + Sync>;

fn default_window() -> Duration {
    Duration::from_secs(60)
}

/// What a monitor does when a member terminates without being asked to.
///
/// Members the runtime stops or kills itself are always replaced and never
/// count against the budget. A graceful exit the member chose on its own is
/// replaced unless the policy is `Never`; it never counts either.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RestartPolicy {
    /// Leave the slot empty.
    Never,
    /// Replace immediately, without limit.
    #[default]
    Always,
    /// Replace after a delay from `curve`; give up once `max_restarts`
    /// restarts already fall inside the sliding `window`.
    Backoff {
        max_restarts: u32,
        #[serde(with = "humantime_serde")]
        base_delay: Duration,
        #[serde(with = "humantime_serde", default = "default_window")]
        window: Duration,
        #[serde(default)]
        curve: BackoffCurve,
    },
}

/// Delay growth between successive restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffCurve {
    /// `base_delay` every time.
    #[default]
    Fixed,
    /// `base_delay * attempt`.
    Linear,
    /// `base_delay * 2^(attempt - 1)`, capped at `max_delay`.
    Exponential {
        #[serde(with = "humantime_serde")]
        max_delay: Duration,
    },
}

impl BackoffCurve {
    pub fn delay(self, attempt: u32, base_delay: Duration) -> Duration {
        let attempt = attempt.max(1);
        match self {
            BackoffCurve::Fixed => base_delay,
            BackoffCurve::Linear => base_delay.saturating_mul(attempt),
            BackoffCurve::Exponential { max_delay } => {
                let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
                base_delay.saturating_mul(factor).min(max_delay)
            }
        }
    }
}

/// Outcome of applying a policy to one crash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// Spawn a replacement after `delay`. `attempt` counts restarts in the window.
    Restart { delay: Duration, attempt: u32 },
    /// Policy is `never`.
    GiveUp,
    /// Budget spent: `restarts` already happened inside the window.
    Exhausted { restarts: u32 },
}

/// Restart timestamps inside the current window.
#[derive(Debug, Clone, Default)]
pub struct RestartHistory {
    restarts: VecDeque<Instant>,
}

impl RestartHistory {
    pub fn len(&self) -> usize {
        self.restarts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.restarts.is_empty()
    }

    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(oldest) = self.restarts.front() {
            if now.saturating_duration_since(*oldest) > window {
                self.restarts.pop_front();
            } else {
                break;
            }
        }
    }
}

impl RestartPolicy {
    pub fn backoff(max_restarts: u32, base_delay: Duration) -> Self {
        RestartPolicy::Backoff {
            max_restarts,
            base_delay,
            window: default_window(),
            curve: BackoffCurve::Fixed,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if let RestartPolicy::Backoff {
            base_delay,
            window,
            curve,
            ..
        } = self
        {
            if window.is_zero() {
                return Err(Error::validation("restart_policy.backoff.window must be > 0"));
            }
            if let BackoffCurve::Exponential { max_delay } = curve {
                if max_delay < base_delay {
                    return Err(Error::validation(
                        "restart_policy.backoff.curve.max_delay must be >= base_delay",
                    ));
                }
            }
        }
        Ok(())
    }

    /// Apply the policy to a crash observed at `now`, recording the restart.
    pub fn decide(
        &self,
        history: &mut RestartHistory,
        now: Instant,
        custom: Option<&BackoffFn>,
    ) -> RestartDecision {
        match self {
            RestartPolicy::Never => RestartDecision::GiveUp,
            RestartPolicy::Always => RestartDecision::Restart {
                delay: Duration::ZERO,
                attempt: 1,
            },
            RestartPolicy::Backoff {
                max_restarts,
                base_delay,
                window,
                curve,
            } => {
                history.prune(now, *window);
                let used = u32::try_from(history.len()).unwrap_or(u32::MAX);
                if used >= *max_restarts {
                    return RestartDecision::Exhausted { restarts: used };
                }
                history.restarts.push_back(now);
                let attempt = used + 1;
                let delay = match custom {
                    Some(backoff) => backoff(attempt, *base_delay),
                    None => curve.delay(attempt, *base_delay),
                };
                RestartDecision::Restart { delay, attempt }
            }
        }
    }
}

impl fmt::Display for RestartPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestartPolicy::Never => f.write_str("never"),
            RestartPolicy::Always => f.write_str("always"),
            RestartPolicy::Backoff {
                max_restarts,
                base_delay,
                ..
            } => write!(f, "backoff({}, {:?})", max_restarts, base_delay),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const MS: Duration = Duration::from_millis(1);

    #[test]
    fn test_backoff_three_allows_exactly_three_restarts() {
        let policy = RestartPolicy::backoff(3, 10 * MS);
        let mut history = RestartHistory::default();
        let now = Instant::now();

        let decisions: Vec<_> = (0..4)
            .map(|i| policy.decide(&mut history, now + MS * i, None))
            .collect();
        assert_eq!(
            decisions,
            vec![
                RestartDecision::Restart { delay: 10 * MS, attempt: 1 },
                RestartDecision::Restart { delay: 10 * MS, attempt: 2 },
                RestartDecision::Restart { delay: 10 * MS, attempt: 3 },
                RestartDecision::Exhausted { restarts: 3 },
            ]
        );
    }

    #[test]
    fn test_window_forgets_old_restarts() {
        let policy = RestartPolicy::Backoff {
            max_restarts: 1,
            base_delay: MS,
            window: Duration::from_secs(1),
            curve: BackoffCurve::Fixed,
        };
        let mut history = RestartHistory::default();
        let start = Instant::now();
        assert!(matches!(policy.decide(&mut history, start, None), RestartDecision::Restart { .. }));
        assert!(matches!(
            policy.decide(&mut history, start + Duration::from_millis(500), None),
            RestartDecision::Exhausted { restarts: 1 }
        ));
        assert!(matches!(
            policy.decide(&mut history, start + Duration::from_secs(2), None),
            RestartDecision::Restart { attempt: 1, .. }
        ));
    }

    #[test]
    fn test_never_and_always() {
        let mut history = RestartHistory::default();
        let now = Instant::now();
        assert_eq!(RestartPolicy::Never.decide(&mut history, now, None), RestartDecision::GiveUp);
        for _ in 0..100 {
            assert!(matches!(
                RestartPolicy::Always.decide(&mut history, now, None),
                RestartDecision::Restart { delay: Duration::ZERO, .. }
            ));
        }
        assert!(history.is_empty());
    }

    #[test]
    fn test_curves() {
        let base = 100 * MS;
        assert_eq!(BackoffCurve::Fixed.delay(5, base), base);
        assert_eq!(BackoffCurve::Linear.delay(3, base), 300 * MS);
        let exp = BackoffCurve::Exponential { max_delay: Duration::from_secs(1) };
        assert_eq!(exp.delay(1, base), base);
        assert_eq!(exp.delay(3, base), 400 * MS);
        assert_eq!(exp.delay(10, base), Duration::from_secs(1));
        assert_eq!(exp.delay(64, base), Duration::from_secs(1));
    }

    #[test]
    fn test_custom_backoff_fn_overrides_curve() {
        let policy = RestartPolicy::backoff(5, 10 * MS);
        let custom: BackoffFn = Arc::new(|attempt, base| base * (attempt * attempt));
        let mut history = RestartHistory::default();
        let now = Instant::now();
        policy.decide(&mut history, now, Some(&custom));
        assert_eq!(
            policy.decide(&mut history, now, Some(&custom)),
            RestartDecision::Restart { delay: 40 * MS, attempt: 2 }
        );
    }

    #[test]
    fn test_serde_shapes() {
        assert_eq!(serde_json::to_value(RestartPolicy::Never).unwrap(), "never");
        let parsed: RestartPolicy = serde_json::from_str(
            r#"{"backoff": {"max_restarts": 4, "base_delay": "50ms", "window": "10s",
                "curve": {"exponential": {"max_delay": "2s"}}}}"#,
        )
        .unwrap();
        assert_eq!(
            parsed,
            RestartPolicy::Backoff {
                max_restarts: 4,
                base_delay: 50 * MS,
                window: Duration::from_secs(10),
                curve: BackoffCurve::Exponential { max_delay: Duration::from_secs(2) },
            }
        );
    }

    #[test]
    fn test_validate_rejects_inverted_exponential_cap() {
        let policy = RestartPolicy::Backoff {
            max_restarts: 1,
            base_delay: Duration::from_secs(2),
            window: Duration::from_secs(60),
            curve: BackoffCurve::Exponential { max_delay: Duration::from_secs(1) },
        };
        assert!(policy.validate().is_err());
        assert!(RestartPolicy::backoff(3, MS).validate().is_ok());
    }
}
